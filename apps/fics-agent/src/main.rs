use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fics_kernel::Kernel;
use fics_session::SessionConfig;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

mod agent;

use agent::Agent;

#[derive(Debug, Parser)]
#[command(
    name = "fics-agent",
    version,
    about = "Polls a FICS-style server and records per-player observations"
)]
struct Args {
    /// Account name sent at the login prompt
    user: String,
    /// Account password; omit for guest-style logins
    #[arg(env = "FICS_PASSWORD")]
    password: Option<String>,
    #[arg(long, env = "FICS_HOST", default_value = "freechess.org")]
    host: String,
    #[arg(long, default_value_t = fics_session::DEFAULT_PORT)]
    port: u16,
    /// SQLite database file
    #[arg(long, default_value = "fics.db")]
    db: PathBuf,
    /// Seconds to sleep between poll cycles
    #[arg(long, default_value_t = 10)]
    interval_secs: u64,
    /// Bound each protocol read to this many seconds; unset blocks until the
    /// server answers
    #[arg(long)]
    read_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();

    let args = Args::parse();
    let kernel = Kernel::open(&args.db)?;
    let known = kernel.known_names_async().await?;
    tracing::info!(db = %args.db.display(), known = known.len(), "store opened");

    let session_cfg = SessionConfig {
        host: args.host,
        port: args.port,
        user: args.user,
        password: args.password,
        read_timeout: args.read_timeout_secs.map(Duration::from_secs),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing up");
        }
        let _ = shutdown_tx.send(true);
    });

    let mut agent = Agent::new(
        session_cfg,
        kernel,
        Duration::from_secs(args.interval_secs),
    );
    agent.run(shutdown_rx).await;
    Ok(())
}
