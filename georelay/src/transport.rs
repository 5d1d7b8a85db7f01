//! Supervision of the overlay sidecar process.
//!
//! The sidecar owns the overlay network client. It talks to the relay over
//! newline-delimited JSON on its standard streams:
//!
//! - stdout carries events: `ready`, `message`, `sent` and `error`
//! - stdin carries commands: `send` and `close`
//! - stderr is free-form diagnostics, forwarded to the log
//!
//! A background reader turns stdout lines into [`SidecarEvent`]s on an
//! unbounded channel. Lines that are not valid events are dropped. Writes to
//! stdin are serialized so one command line never interleaves with another.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, Mutex};

use crate::envelope::encode_b64;
use crate::error::TransportError;

/// How to launch the sidecar.
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarConfig {
    /// Program to execute, e.g. `node`.
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
    /// How long [`Sidecar::close`] waits before killing the child.
    pub close_grace: Duration,
}

impl SidecarConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            close_grace: Duration::from_secs(3),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

/// A line emitted by the sidecar on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ev", rename_all = "lowercase")]
pub enum SidecarEvent {
    /// The overlay client is connected under `addr`.
    Ready { addr: String },
    /// A direct message from peer `src`.
    Message { src: String, payload_b64: String },
    /// A previous `send` was accepted by the overlay.
    Sent {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        dest: Option<String>,
    },
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        message: String,
    },
}

impl SidecarEvent {
    /// Parse one stdout line; `None` for anything that is not an event.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// A line written to the sidecar's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SidecarCommand {
    Send {
        id: String,
        dest: String,
        payload_b64: String,
    },
    Close,
}

/// Anything that can deliver a payload to a remote peer.
///
/// Implemented by [`Sidecar`]; tests substitute in-memory transports.
#[async_trait]
pub trait Outbound: Send + Sync {
    /// Send `payload` to `dest` under correlation id `id`.
    async fn send(&self, dest: &str, payload: &[u8], id: &str) -> Result<(), TransportError>;

    /// The local overlay address, once known.
    fn address(&self) -> Option<String>;
}

/// Handle to a running sidecar process.
#[derive(Debug)]
pub struct Sidecar {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    address: watch::Receiver<Option<String>>,
    close_grace: Duration,
}

impl Sidecar {
    /// Launch the sidecar and start reading its output.
    ///
    /// # Errors
    ///
    /// - [`TransportError::RuntimeUnavailable`] if the program does not exist
    /// - [`TransportError::Spawn`] for any other launch failure
    pub fn start(
        config: &SidecarConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SidecarEvent>), TransportError> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => TransportError::RuntimeUnavailable {
                    program: config.program.clone(),
                },
                _ => TransportError::Spawn(e),
            })?;

        let stdin = child.stdin.take().ok_or(TransportError::Unavailable)?;
        let stdout = child.stdout.take().ok_or(TransportError::Unavailable)?;
        let stderr = child.stderr.take();

        tracing::info!(
            program = %config.program,
            pid = child.id().unwrap_or_default(),
            "Sidecar started"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (addr_tx, addr_rx) = watch::channel(None);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = SidecarEvent::parse_line(&line) else {
                            tracing::trace!(line = %line, "Dropping non-event sidecar output");
                            continue;
                        };
                        match &event {
                            SidecarEvent::Ready { addr } => {
                                tracing::info!(addr = %addr, "Sidecar ready");
                                addr_tx.send_replace(Some(addr.clone()));
                            }
                            SidecarEvent::Error { id, message } => {
                                tracing::error!(id = ?id, message = %message, "Sidecar error");
                            }
                            _ => {}
                        }
                        // Receiver gone means nobody is dispatching anymore
                        let _ = events_tx.send(event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed reading sidecar output");
                        break;
                    }
                }
            }
            addr_tx.send_replace(None);
            tracing::info!("Sidecar output closed");
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "georelay::sidecar", "{line}");
                }
            });
        }

        Ok((
            Self {
                stdin: Mutex::new(Some(stdin)),
                child: Mutex::new(Some(child)),
                address: addr_rx,
                close_grace: config.close_grace,
            },
            events_rx,
        ))
    }

    /// Wait until the sidecar reports its address.
    pub async fn wait_ready(&self, timeout: Duration) -> Option<String> {
        let mut rx = self.address.clone();
        let ready = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match ready {
            Ok(Ok(addr)) => (*addr).clone(),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.address.borrow().is_some()
    }

    /// Write one command line and flush it.
    pub async fn command(&self, command: &SidecarCommand) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Unavailable)?;

        let written = match stdin.write_all(&line).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                *guard = None;
                Err(TransportError::Unavailable)
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Ask the sidecar to exit, then kill it if it has not exited within the
    /// close grace period. Further sends fail with
    /// [`TransportError::Unavailable`].
    ///
    /// Never blocks longer than about twice the grace period, even when a
    /// send is stuck on a sidecar that stopped reading its input.
    pub async fn close(&self) {
        let delivered = tokio::time::timeout(self.close_grace, async {
            if let Err(e) = self.command(&SidecarCommand::Close).await {
                tracing::debug!(error = %e, "Close command not delivered");
            }
            self.stdin.lock().await.take();
        })
        .await
        .is_ok();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        if delivered {
            match tokio::time::timeout(self.close_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(status = %status, "Sidecar exited");
                    return;
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed waiting for sidecar"),
                Err(_) => {
                    tracing::warn!(grace = ?self.close_grace, "Sidecar did not exit, killing")
                }
            }
        } else {
            tracing::warn!(grace = ?self.close_grace, "Sidecar input blocked, killing");
        }

        if let Err(e) = child.start_kill() {
            tracing::warn!(error = %e, "Failed to kill sidecar");
        }
        if tokio::time::timeout(self.close_grace, child.wait())
            .await
            .is_err()
        {
            tracing::warn!("Sidecar still running after kill");
        }
    }
}

#[async_trait]
impl Outbound for Sidecar {
    async fn send(&self, dest: &str, payload: &[u8], id: &str) -> Result<(), TransportError> {
        tracing::debug!(id = %id, dest = %dest, bytes = payload.len(), "Sending to peer");
        self.command(&SidecarCommand::Send {
            id: id.to_string(),
            dest: dest.to_string(),
            payload_b64: encode_b64(payload),
        })
        .await
    }

    fn address(&self) -> Option<String> {
        self.address.borrow().clone()
    }
}
