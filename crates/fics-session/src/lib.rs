use std::time::Duration;

use fics_protocol::Roster;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default FICS-style server port.
pub const DEFAULT_PORT: u16 = 5000;

// The protocol is prompt-delimited: a logical message ends when one of these
// literal markers shows up in the byte stream.
const LOGIN_PROMPT: &str = "login: ";
const PASSWORD_PROMPT: &str = "password: ";
const COMMAND_PROMPT: &str = "fics%";
const WHO_COMPLETE: &str = "players displayed";

const WHO_COMMAND: &str = "who";
const EXIT_COMMAND: &str = "exit";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Bound on each marker-wait. `None` blocks until the peer answers.
    pub read_timeout: Option<Duration>,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error("session i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended before {marker:?}")]
    UnexpectedEof { marker: &'static str },
    #[error("timed out waiting for {marker:?}")]
    Timeout { marker: &'static str },
}

/// One authenticated connection to the server.
///
/// The session owns the socket exclusively; `poll` must not be interleaved
/// with another command because replies are only delimited by prompt markers.
#[derive(Debug)]
pub struct Session {
    stream: TcpStream,
    // Bytes read past the last consumed marker, kept for the next wait.
    carry: Vec<u8>,
    read_timeout: Option<Duration>,
}

impl Session {
    /// Open a connection and run the login handshake: wait for the login
    /// prompt, send the user name, optionally answer the password prompt,
    /// then wait for the interactive prompt.
    pub async fn connect(cfg: &SessionConfig) -> Result<Session, SessionError> {
        let addr = format!("{}:{}", cfg.host, cfg.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| SessionError::Connect { addr, source })?;
        let mut session = Session {
            stream,
            carry: Vec::new(),
            read_timeout: cfg.read_timeout,
        };
        let greeting = session.read_until(LOGIN_PROMPT).await?;
        tracing::debug!(bytes = greeting.len(), "server greeting");
        session.send_line(&cfg.user).await?;
        if let Some(password) = cfg.password.as_deref() {
            session.read_until(PASSWORD_PROMPT).await?;
            session.send_line(password).await?;
        }
        session.read_until(COMMAND_PROMPT).await?;
        Ok(session)
    }

    /// Issue the status query and parse the reply into a frozen roster.
    ///
    /// The reply runs from the command echo to the completion marker; the
    /// trailing interactive prompt is consumed so the stream is positioned
    /// for the next command. The roster may be empty.
    pub async fn poll(&mut self) -> Result<Roster, SessionError> {
        self.send_line(WHO_COMMAND).await?;
        let reply = self.read_until(WHO_COMPLETE).await?;
        self.read_until(COMMAND_PROMPT).await?;
        let roster = Roster::parse(&reply);
        tracing::debug!(players = roster.len(), "who reply parsed");
        Ok(roster)
    }

    /// Best-effort logout. No reply is awaited and a closed peer is fine, so
    /// this is safe from a shutdown path at any point.
    pub async fn disconnect(&mut self) {
        if let Err(err) = self.send_line(EXIT_COMMAND).await {
            tracing::debug!(%err, "exit write failed (peer already gone?)");
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\n").await?;
        Ok(())
    }

    /// Read until `marker` appears in the accumulated stream and return the
    /// decoded text up to and including it. Bytes past the marker stay
    /// buffered for the next wait. Decoding is lossy on purpose: stray
    /// non-UTF-8 bytes can never form a marker or a data token.
    async fn read_until(&mut self, marker: &'static str) -> Result<String, SessionError> {
        let needle = marker.as_bytes();
        loop {
            if let Some(pos) = find_subslice(&self.carry, needle) {
                let end = pos + needle.len();
                let consumed: Vec<u8> = self.carry.drain(..end).collect();
                return Ok(String::from_utf8_lossy(&consumed).into_owned());
            }
            let mut buf = [0u8; 4096];
            let n = match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, self.stream.read(&mut buf))
                    .await
                    .map_err(|_| SessionError::Timeout { marker })??,
                None => self.stream.read(&mut buf).await?,
            };
            if n == 0 {
                return Err(SessionError::UnexpectedEof { marker });
            }
            self.carry.extend_from_slice(&buf[..n]);
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
