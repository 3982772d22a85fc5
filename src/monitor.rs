// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Live fan state over the control socket.
//!
//! The daemon answers `GET /monitor` with an event stream: one JSON array of
//! evaluations per event, pushed whenever the control state is refreshed.

use crate::controller::{ControlHandle, Payload};
use crate::curve::Evaluation;
use crate::protocol::{self, MONITOR_PATH, Status};
use crate::sse;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Error bodies longer than this are cut.
const MAX_ERROR_BODY: u64 = 64 << 10;

/// A client must finish its request head within this time.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The bound control socket. The socket file is removed when serving ends.
pub struct MonitorSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl MonitorSocket {
    /// Bind `path`, replacing whatever socket a previous run left behind.
    pub fn bind(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => log::warn!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;

        // Make socket accessible to non-root users
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))?;
        }

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Accept monitor clients until `token` is cancelled.
pub async fn serve(
    socket: MonitorSocket,
    handle: ControlHandle,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    log::info!("Listening on {}", socket.path.display());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = socket.listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        tracker.spawn(handle_client(stream, handle.clone(), token.clone()));
                    }
                    Err(e) => {
                        log::error!("Failed to accept connection: {e}");
                    }
                }
            }
        }
    }

    drop(socket.listener);
    if let Err(e) = std::fs::remove_file(&socket.path) {
        log::warn!("Could not remove socket {}: {e}", socket.path.display());
    }
    log::debug!("Control socket closed");
}

async fn handle_client(stream: UnixStream, handle: ControlHandle, token: CancellationToken) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(reader);

    let head = tokio::select! {
        _ = token.cancelled() => return,
        head = time::timeout(
            REQUEST_HEAD_TIMEOUT,
            protocol::read_request_head(&mut reader),
        ) => head,
    };
    let request = match head {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            log::debug!("Client left before completing its request: {e}");
            return;
        }
        Err(_) => {
            log::debug!("Client sent no request within {REQUEST_HEAD_TIMEOUT:?}");
            return;
        }
    };

    let rejection = match &request {
        None => Some((Status::BadRequest, "malformed request")),
        Some(r) if r.path != MONITOR_PATH => Some((Status::NotFound, "not found")),
        Some(r) if r.method != "GET" => Some((Status::MethodNotAllowed, "method not allowed")),
        Some(_) => None,
    };
    if let Some((status, message)) = rejection {
        let response = protocol::encode_error(status, message);
        if let Err(e) = writer.write_all(response.as_bytes()).await {
            log::debug!("Could not send {} response: {e}", status.code());
        } else if let Err(e) = writer.shutdown().await {
            log::debug!("Could not close rejected client: {e}");
        }
        return;
    }

    if let Err(e) = writer
        .write_all(protocol::encode_stream_head().as_bytes())
        .await
    {
        log::debug!("Monitor client went away: {e}");
        return;
    }

    let Ok((id, events)) = handle.watch().await else {
        return;
    };
    log::debug!("Monitor {id} connected");

    stream_events(reader.into_inner(), writer, events, token).await;

    let _ = handle.unwatch(id).await;
    log::debug!("Monitor {id} disconnected");
}

/// Forward payloads to the client until it hangs up, a write fails, the
/// subscription is dropped, or the daemon shuts down.
async fn stream_events(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut events: mpsc::Receiver<Payload>,
    token: CancellationToken,
) {
    let mut discard = [0u8; 256];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read(&mut discard) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            payload = events.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                let event = sse::encode(&payload);
                if writer.write_all(&event).await.is_err() || writer.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Could not connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{status} {reason}: {body}")]
    Status {
        status: u16,
        reason: String,
        body: String,
    },

    #[error(transparent)]
    Stream(#[from] sse::ReadError),

    #[error("Invalid event: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A `/monitor` stream with its response head already consumed.
pub struct MonitorStream {
    reader: BufReader<std::os::unix::net::UnixStream>,
}

/// Connect to the daemon at `path` and open the state stream.
pub fn connect(path: &Path) -> Result<MonitorStream, ClientError> {
    let mut stream =
        std::os::unix::net::UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
    stream.write_all(protocol::encode_request(MONITOR_PATH).as_bytes())?;

    let mut reader = BufReader::new(stream);
    let (status, reason) = protocol::read_response_head(&mut reader)?;
    if !(200..300).contains(&status) {
        let mut body = Vec::new();
        reader.by_ref().take(MAX_ERROR_BODY).read_to_end(&mut body)?;
        return Err(ClientError::Status {
            status,
            reason,
            body: String::from_utf8_lossy(&body).trim().to_string(),
        });
    }

    Ok(MonitorStream { reader })
}

impl MonitorStream {
    /// Block until the next state snapshot arrives.
    pub fn next_event(&mut self) -> Result<Vec<Evaluation>, ClientError> {
        loop {
            let payload = sse::read_event(&mut self.reader)?;
            if payload.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(serde_json::from_slice(&payload)?);
        }
    }
}
