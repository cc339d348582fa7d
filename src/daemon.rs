// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The daemon: one owned [`DaemonContext`] holding the active configuration
//! and the running control loop, plus the status socket and signal handling
//! around it.
//!
//! Signals:
//! - SIGINT, SIGTERM, SIGQUIT: stop the loop (restoring channels) and exit
//! - SIGHUP: reload the configuration file

use crate::config::{self, ActiveConfig};
use crate::control::{ControlLoop, ProfileStatus};
use crate::error::{ConfigError, Error};
use crate::hwmon::HardwareIo;
use crate::protocol::{self, Request, Response};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Process-wide daemon state.
pub struct DaemonContext {
    config_path: PathBuf,
    hw: Arc<dyn HardwareIo>,
    active: ActiveConfig,
    control: Option<ControlLoop>,
}

impl DaemonContext {
    /// Load and validate the configuration. Nothing runs yet.
    pub fn load(config_path: &Path, hw: Arc<dyn HardwareIo>) -> Result<Self, ConfigError> {
        let active = load_runnable(config_path, hw.as_ref())?;
        Ok(Self {
            config_path: config_path.to_path_buf(),
            hw,
            active,
            control: None,
        })
    }

    pub fn active(&self) -> &ActiveConfig {
        &self.active
    }

    pub fn is_running(&self) -> bool {
        self.control.is_some()
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.control.is_none() {
            self.control = Some(ControlLoop::start(&self.active, self.hw.clone())?);
        }
        Ok(())
    }

    /// Stop every profile task and release the channels.
    pub async fn stop(&mut self) {
        if let Some(control) = self.control.take() {
            control.stop().await;
        }
    }

    /// Stop, reload and restart. A configuration that fails validation or
    /// cannot claim its channels is reported and the previous one is
    /// restarted unchanged.
    pub async fn reload(&mut self) -> Result<(), Error> {
        log::info!("Reloading {}", self.config_path.display());
        self.stop().await;

        let candidate = match load_runnable(&self.config_path, self.hw.as_ref()) {
            Ok(active) => active,
            Err(e) => {
                log::error!("Reload rejected, keeping current configuration: {e}");
                self.start()?;
                return Err(e.into());
            }
        };

        match ControlLoop::start(&candidate, self.hw.clone()) {
            Ok(control) => {
                if candidate.daemon.socket_path != self.active.daemon.socket_path {
                    log::warn!("socket_path changes take effect on restart");
                }
                self.active = candidate;
                self.control = Some(control);
                log::info!("Configuration reloaded");
                Ok(())
            }
            Err(e) => {
                log::error!("New configuration failed to start, keeping current one: {e}");
                self.start()?;
                Err(e)
            }
        }
    }

    pub async fn status(&self) -> Vec<ProfileStatus> {
        match &self.control {
            Some(control) => control.snapshot().await,
            None => Vec::new(),
        }
    }

    async fn process_request(&mut self, req: Request) -> Response {
        match req {
            Request::GetStatus => Response::Status {
                profiles: self.status().await,
            },
            Request::Reload => match self.reload().await {
                Ok(()) => Response::Ok {
                    message: format!("Reloaded {}", self.config_path.display()),
                },
                Err(e) => Response::Error {
                    message: format!("Reload failed: {e}"),
                },
            },
        }
    }
}

fn load_runnable(path: &Path, hw: &dyn HardwareIo) -> Result<ActiveConfig, ConfigError> {
    let active = config::load_active(path, hw)?;
    if active.profiles.is_empty() {
        return Err(ConfigError::NoProfiles);
    }
    Ok(active)
}

type Command = (Request, oneshot::Sender<Response>);

/// Run the daemon until SIGINT, SIGTERM or SIGQUIT.
pub async fn run(ctx: DaemonContext, socket_path: Option<PathBuf>) -> Result<(), Error> {
    let shutdown = cancel_on_signals(&[
        SignalKind::interrupt(),
        SignalKind::terminate(),
        SignalKind::quit(),
    ])?;

    let socket_path =
        socket_path.unwrap_or_else(|| PathBuf::from(&ctx.active().daemon.socket_path));
    serve(ctx, &socket_path, shutdown).await
}

/// A token cancelled by the first of `kinds` to arrive. Once this returns,
/// those signals no longer terminate the process.
pub fn cancel_on_signals(kinds: &[SignalKind]) -> io::Result<CancellationToken> {
    let streams = kinds
        .iter()
        .map(|&kind| signal(kind).map(|stream| (kind, stream)))
        .collect::<io::Result<Vec<_>>>()?;

    let token = CancellationToken::new();
    for (kind, mut stream) in streams {
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                received = stream.recv() => {
                    if received.is_some() {
                        log::info!("Received {kind:?}");
                        cancel.cancel();
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }
    Ok(token)
}

/// Start the control loop and answer socket requests until `shutdown` is
/// cancelled. SIGHUP triggers a reload.
pub async fn serve(
    mut ctx: DaemonContext,
    socket_path: &Path,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let mut sighup = signal(SignalKind::hangup())?;

    // Clean up old socket file
    let _ = std::fs::remove_file(socket_path);
    if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;

    // Make socket accessible to non-root users
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o666);
        std::fs::set_permissions(socket_path, perms)?;
    }
    log::info!("Listening on {}", socket_path.display());

    if let Err(e) = ctx.start() {
        let _ = std::fs::remove_file(socket_path);
        return Err(e);
    }

    let (tx, mut rx) = mpsc::channel::<Command>(16);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tokio::spawn(handle_client(stream, tx.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                    }
                }
            }
            Some((req, reply)) = rx.recv() => {
                let response = ctx.process_request(req).await;
                let _ = reply.send(response);
            }
            _ = sighup.recv() => {
                log::info!("Received SIGHUP");
                if let Err(e) = ctx.reload().await {
                    if !ctx.is_running() {
                        log::error!("No profiles running after failed reload: {e}");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                log::info!("Daemon shutting down");
                break;
            }
        }
    }

    ctx.stop().await;
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

// ---------------------------------------------------------------------------
// Client connection handler
// ---------------------------------------------------------------------------

async fn handle_client(stream: UnixStream, commands: mpsc::Sender<Command>) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let response = match protocol::decode::<Request>(&line) {
            Ok(req) => {
                let (reply, answer) = oneshot::channel();
                if commands.send((req, reply)).await.is_err() {
                    break; // Daemon shutting down
                }
                match answer.await {
                    Ok(response) => response,
                    Err(_) => break,
                }
            }
            Err(e) => Response::Error {
                message: format!("Invalid request: {e}"),
            },
        };

        let encoded = match protocol::encode(&response) {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to encode response: {e}");
                continue;
            }
        };

        if writer.write_all(encoded.as_bytes()).await.is_err() {
            break; // Client disconnected
        }
    }
}
