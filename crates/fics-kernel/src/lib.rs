use anyhow::{anyhow, Result};
use fics_protocol::Roster;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Durable store: a deduplicated player identity table plus an append-only
/// time series of per-cycle observations.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

/// Counts for one reconciled cycle, in log-line order.
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    /// Players known to the store before this cycle.
    pub known: usize,
    /// Players in the freshly observed roster.
    pub observed: usize,
    /// Players inserted this cycle.
    pub fresh: usize,
}

impl Kernel {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS players(
              id        INTEGER PRIMARY KEY AUTOINCREMENT,
              name      TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS observations(
              id        INTEGER PRIMARY KEY AUTOINCREMENT,
              time      TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
              playerid  INT NOT NULL,
              rating    INT,
              status    TEXT DEFAULT 'OFFLINE',

              FOREIGN KEY(playerid) REFERENCES players(id)
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Names of every player ever observed.
    pub fn known_names(&self) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM players")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = HashSet::new();
        for name in rows {
            out.insert(name?);
        }
        Ok(out)
    }

    /// Reconcile one roster: insert identities for names never seen before,
    /// then append one observation per observed player. Runs as a single
    /// transaction so a failed cycle leaves no partial rows. A name that
    /// already exists when inserted (concurrent writer) degrades to
    /// already-known and still gets its observation.
    pub fn record_cycle(&self, roster: &Roster) -> Result<CycleStats> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let known: HashSet<String> = {
            let mut stmt = tx.prepare("SELECT name FROM players")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        let fresh: Vec<&str> = roster.names().filter(|n| !known.contains(*n)).collect();
        {
            let mut insert = tx.prepare("INSERT OR IGNORE INTO players(name) VALUES (?)")?;
            for name in &fresh {
                insert.execute([name])?;
            }
            let mut observe = tx.prepare(
                "INSERT INTO observations (playerid, rating, status)
                 SELECT id, ?2, ?3 FROM players WHERE name = ?1",
            )?;
            for p in roster.players() {
                observe.execute(params![p.name, p.rating, p.status.as_str()])?;
            }
        }
        let stats = CycleStats {
            known: known.len(),
            observed: roster.len(),
            fresh: fresh.len(),
        };
        tx.commit()?;
        Ok(stats)
    }

    pub fn player_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM players", [], |row| row.get(0))?)
    }

    pub fn observation_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?)
    }

    /// Status recorded by the most recent observation of `name`, if any.
    pub fn latest_status(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT o.status FROM observations o
             JOIN players p ON p.id = o.playerid
             WHERE p.name = ? ORDER BY o.id DESC LIMIT 1",
        )?;
        Ok(stmt.query_row([name], |row| row.get(0)).optional()?)
    }

    /// Store-side wall-clock stamp of the most recent observation of `name`.
    pub fn latest_observation_time(&self, name: &str) -> Result<Option<chrono::NaiveDateTime>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT o.time FROM observations o
             JOIN players p ON p.id = o.playerid
             WHERE p.name = ? ORDER BY o.id DESC LIMIT 1",
        )?;
        Ok(stmt.query_row([name], |row| row.get(0)).optional()?)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn known_names_async(&self) -> Result<HashSet<String>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.known_names())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn record_cycle_async(&self, roster: &Roster) -> Result<CycleStats> {
        let k = self.clone();
        let roster = roster.clone();
        tokio::task::spawn_blocking(move || k.record_cycle(&roster))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}
