use std::time::Duration;

use anyhow::Result;
use fics_kernel::Kernel;
use fics_session::{Session, SessionConfig};
use tokio::sync::watch;
use tracing::{info, warn};

/// Drives the poll/diff/write cycle until shutdown is signalled.
///
/// Cycles are strictly sequential: one poll, one store transaction, one
/// sleep. The session and the store handle are owned here and never shared.
pub struct Agent {
    session_cfg: SessionConfig,
    kernel: Kernel,
    interval: Duration,
    session: Option<Session>,
}

impl Agent {
    pub fn new(session_cfg: SessionConfig, kernel: Kernel, interval: Duration) -> Agent {
        Agent {
            session_cfg,
            kernel,
            interval,
            session: None,
        }
    }

    /// Run cycles until `shutdown` flips to true. A failed cycle is logged
    /// and retried on the next interval; nothing short of cancellation ends
    /// the loop. On the way out the server is always told to exit.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.run_cycle().await {
                warn!(%err, "cycle failed; retrying next interval");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        if let Some(session) = self.session.as_mut() {
            session.disconnect().await;
        }
        self.session = None;
        info!("session closed");
    }

    /// One cycle: ensure a session, poll, reconcile. A connect or protocol
    /// failure leaves no session behind so the next cycle starts from
    /// `connect`; a store failure keeps the session and skips only the
    /// writes. No rows are written unless the whole cycle's transaction
    /// commits.
    async fn run_cycle(&mut self) -> Result<()> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                info!(
                    host = %self.session_cfg.host,
                    port = self.session_cfg.port,
                    "opening session"
                );
                Session::connect(&self.session_cfg).await?
            }
        };
        // on error the session drops here; its stream position is unknown
        let roster = session.poll().await?;
        self.session = Some(session);
        let stats = self.kernel.record_cycle_async(&roster).await?;
        info!(
            known = stats.known,
            observed = stats.observed,
            fresh = stats.fresh,
            "cycle reconciled"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    fn agent_for(port: u16, kernel: Kernel, interval: Duration) -> Agent {
        Agent::new(
            SessionConfig {
                host: "127.0.0.1".into(),
                port,
                user: "guest".into(),
                password: None,
                read_timeout: Some(Duration::from_secs(5)),
            },
            kernel,
            interval,
        )
    }

    async fn expect_line(reader: &mut BufReader<TcpStream>, want: &str) {
        let mut line = String::new();
        reader.read_line(&mut line).await.expect("client line");
        assert_eq!(line.trim_end(), want);
    }

    async fn login(reader: &mut BufReader<TcpStream>) {
        reader.get_mut().write_all(b"login: ").await.unwrap();
        expect_line(reader, "guest").await;
        reader.get_mut().write_all(b"\nfics% ").await.unwrap();
    }

    async fn answer_who(reader: &mut BufReader<TcpStream>, rows: &str) {
        expect_line(reader, "who").await;
        send_who_reply(reader, rows).await;
    }

    async fn send_who_reply(reader: &mut BufReader<TcpStream>, rows: &str) {
        let reply = format!("who\n{rows}\n\n 2 players displayed\nfics% ");
        reader.get_mut().write_all(reply.as_bytes()).await.unwrap();
    }

    /// Answer `who` with `first` once, then with `rest` until `exit` arrives.
    /// Returns how many polls were served.
    async fn serve_until_exit(reader: &mut BufReader<TcpStream>, first: &str, rest: &str) -> u32 {
        let mut polls = 0u32;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.expect("client line");
            match line.trim_end() {
                "exit" => break,
                "who" => {
                    let rows = if polls == 0 { first } else { rest };
                    polls += 1;
                    send_who_reply(reader, rows).await;
                }
                other => panic!("unexpected command {other:?}"),
            }
        }
        polls
    }

    async fn wait_for_observations(kernel: &Kernel, want: i64) {
        for _ in 0..100 {
            if kernel.observation_count().unwrap() >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("store never reached {want} observations");
    }

    #[tokio::test]
    async fn two_cycles_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(&dir.path().join("fics.db")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            login(&mut reader).await;
            let polls =
                serve_until_exit(&mut reader, "1500:Alice 2100^Bob", "1500.Alice 2100^Bob").await;
            assert!(polls >= 2, "expected at least two polls, saw {polls}");
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut agent = agent_for(port, kernel.clone(), Duration::from_millis(30));
        let run = tokio::spawn(async move { agent.run(shutdown_rx).await });

        wait_for_observations(&kernel, 4).await;
        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
        server.await.unwrap();

        // no new identities after the first cycle, two observations per cycle
        assert_eq!(kernel.player_count().unwrap(), 2);
        let observations = kernel.observation_count().unwrap();
        assert!(observations >= 4 && observations % 2 == 0);
        assert_eq!(
            kernel.latest_status("Alice").unwrap().as_deref(),
            Some("INACTIVE")
        );
        assert_eq!(
            kernel.latest_status("Bob").unwrap().as_deref(),
            Some("INGAME")
        );
    }

    #[tokio::test]
    async fn cancellation_during_sleep_disconnects_without_another_poll() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(&dir.path().join("fics.db")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            login(&mut reader).await;
            answer_who(&mut reader, "1500:Alice 2100^Bob").await;
            // the next command must be the logout, not another poll
            expect_line(&mut reader, "exit").await;
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // interval far longer than the test: shutdown lands mid-sleep
        let mut agent = agent_for(port, kernel.clone(), Duration::from_secs(600));
        let run = tokio::spawn(async move { agent.run(shutdown_rx).await });

        wait_for_observations(&kernel, 2).await;
        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
        server.await.unwrap();
        assert_eq!(kernel.observation_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_poll_writes_nothing_and_the_loop_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(&dir.path().join("fics.db")).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            // first connection dies before the completion marker
            {
                let (stream, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(stream);
                login(&mut reader).await;
                expect_line(&mut reader, "who").await;
                reader
                    .get_mut()
                    .write_all(b"who\n1500:Alice\n")
                    .await
                    .unwrap();
                // dropped: EOF before "players displayed"
            }
            // the loop reconnects and the next cycle succeeds
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            login(&mut reader).await;
            let polls =
                serve_until_exit(&mut reader, "1500:Alice 2100^Bob", "1500:Alice 2100^Bob").await;
            assert!(polls >= 1, "expected at least one successful poll");
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut agent = agent_for(port, kernel.clone(), Duration::from_millis(30));
        let run = tokio::spawn(async move { agent.run(shutdown_rx).await });

        wait_for_observations(&kernel, 2).await;
        // the aborted first cycle contributed no rows at all
        assert_eq!(kernel.player_count().unwrap(), 2);
        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
        server.await.unwrap();
    }
}
