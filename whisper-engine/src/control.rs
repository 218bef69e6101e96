//! Control socket for IPC with a running tunnel daemon
//!
//! A Unix domain socket carrying one newline-delimited JSON request and one
//! response per connection. It is the command surface of the daemon:
//! connect, disconnect, status and shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::{SessionManager, SessionStatus};

/// Default socket path for the control socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/whisper.sock";

/// How long a client waits for a reply
///
/// Long enough to cover a bridge readiness wait plus a full teardown.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// Request messages sent to the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Start a session; missing URLs fall back to the configured ones
    #[serde(rename = "connect")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolver_url: Option<String>,
    },

    /// Stop the session
    #[serde(rename = "disconnect")]
    Disconnect,

    /// Get current status
    #[serde(rename = "status")]
    Status,

    /// Request daemon shutdown
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response messages from the control socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlResponse {
    /// Status response
    #[serde(rename = "status")]
    Status(StatusInfo),

    /// Error response
    #[serde(rename = "error")]
    Error { message: String },

    /// Success acknowledgment
    #[serde(rename = "ok")]
    Ok,
}

/// Session status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Current session state
    pub state: String,
    /// Normalized remote endpoint
    pub remote_url: Option<String>,
    /// Normalized resolver
    pub resolver_url: Option<String>,
    /// Local SOCKS port of the bridge
    pub proxy_port: Option<u16>,
    /// TUN device name
    pub tun_name: Option<String>,
    /// Seconds since the session reached Running
    pub uptime_secs: u64,
    /// Most recent failure
    pub last_error: Option<String>,
}

impl From<SessionStatus> for StatusInfo {
    fn from(status: SessionStatus) -> Self {
        Self {
            state: format!("{:?}", status.state),
            remote_url: status.remote_url,
            resolver_url: status.resolver_url,
            proxy_port: status.proxy_port,
            tun_name: status.tun_name,
            uptime_secs: status.uptime.map_or(0, |d| d.as_secs()),
            last_error: status.last_error,
        }
    }
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    session: Arc<SessionManager>,
    defaults: SessionConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl ControlServer {
    /// Create a new control server
    pub fn new(
        socket_path: impl AsRef<Path>,
        session: Arc<SessionManager>,
        defaults: SessionConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            session,
            defaults,
            shutdown_tx,
        }
    }

    /// Bind the socket and serve requests until the task is dropped
    pub async fn start(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| Error::Control(format!("failed to bind control socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            let _ = std::fs::set_permissions(&self.socket_path, perms);
        }

        log::info!("Control socket listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let session = self.session.clone();
                    let defaults = self.defaults.clone();
                    let shutdown_tx = self.shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, &session, &defaults, &shutdown_tx).await
                        {
                            log::debug!("Control connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::warn!("Control socket accept error: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        stream: UnixStream,
        session: &SessionManager,
        defaults: &SessionConfig,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        reader
            .read_line(&mut line)
            .await
            .map_err(|e| Error::Control(format!("failed to read request: {}", e)))?;

        if line.is_empty() {
            return Ok(());
        }

        let response = match serde_json::from_str::<ControlRequest>(line.trim()) {
            Ok(request) => Self::handle_request(request, session, defaults, shutdown_tx).await,
            Err(e) => ControlResponse::Error {
                message: format!("invalid request: {}", e),
            },
        };

        let mut response_json = serde_json::to_string(&response)
            .map_err(|e| Error::Control(format!("failed to serialize response: {}", e)))?;
        response_json.push('\n');

        writer
            .write_all(response_json.as_bytes())
            .await
            .map_err(|e| Error::Control(format!("failed to write response: {}", e)))?;

        Ok(())
    }

    async fn handle_request(
        request: ControlRequest,
        session: &SessionManager,
        defaults: &SessionConfig,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> ControlResponse {
        let result = match request {
            ControlRequest::Status => return ControlResponse::Status(session.status().into()),
            ControlRequest::Connect {
                remote_url,
                resolver_url,
            } => {
                let remote_url = remote_url.unwrap_or_else(|| defaults.remote_url.clone());
                let resolver_url = resolver_url.unwrap_or_else(|| defaults.resolver_url.clone());
                session.connect(&remote_url, &resolver_url).await
            }
            ControlRequest::Disconnect => session.disconnect().await,
            ControlRequest::Shutdown => {
                if shutdown_tx.send(()).is_err() {
                    log::warn!("Shutdown requested but nobody is listening");
                }
                Ok(())
            }
        };

        match result {
            Ok(()) => ControlResponse::Ok,
            Err(e) => ControlResponse::Error {
                message: e.to_string(),
            },
        }
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Control socket client for a running daemon
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Create a new control client
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Send a request and get a response
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "failed to connect to control socket at {:?}: {}. Is the daemon running?",
                self.socket_path, e
            ))
        })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut request_json = serde_json::to_string(&request)
            .map_err(|e| Error::Control(format!("failed to serialize request: {}", e)))?;
        request_json.push('\n');
        writer
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| Error::Control(format!("failed to send request: {}", e)))?;

        let mut line = String::new();
        tokio::time::timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Control("timeout waiting for response".into()))?
            .map_err(|e| Error::Control(format!("failed to read response: {}", e)))?;

        serde_json::from_str(line.trim())
            .map_err(|e| Error::Control(format!("invalid response: {}", e)))
    }

    /// Start a session
    pub async fn connect(
        &self,
        remote_url: Option<String>,
        resolver_url: Option<String>,
    ) -> Result<()> {
        let request = ControlRequest::Connect {
            remote_url,
            resolver_url,
        };
        Self::expect_ok(self.request(request).await?)
    }

    /// Stop the session
    pub async fn disconnect(&self) -> Result<()> {
        Self::expect_ok(self.request(ControlRequest::Disconnect).await?)
    }

    /// Get status from the daemon
    pub async fn status(&self) -> Result<StatusInfo> {
        match self.request(ControlRequest::Status).await? {
            ControlResponse::Status(info) => Ok(info),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("unexpected response".into())),
        }
    }

    /// Request daemon shutdown
    pub async fn shutdown(&self) -> Result<()> {
        Self::expect_ok(self.request(ControlRequest::Shutdown).await?)
    }

    fn expect_ok(response: ControlResponse) -> Result<()> {
        match response {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Error { message } => Err(Error::Control(message)),
            _ => Err(Error::Control("unexpected response".into())),
        }
    }
}
