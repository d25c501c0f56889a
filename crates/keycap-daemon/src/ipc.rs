//! IPC server for daemon communication
//!
//! Provides a Unix domain socket through which the CLI starts and stops
//! capture and queries status. Each connection carries one JSON request line
//! and receives one JSON response line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::engine::{CaptureEngine, CaptureMessage, CaptureStatus};
use crate::hook::HookBackend;

// ============================================================================
// IPC Message Types
// ============================================================================

/// Request messages sent from the CLI to the daemon
///
/// Serialized as JSON with a `type` field for discrimination:
/// - `{"type": "capture", "path": "/home/me/remap.kfg"}`
/// - `{"type": "shutdown"}`
/// - `{"type": "status"}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Load a mapping file and start capturing
    Capture {
        /// Path of the `.kfg` file, as seen by the daemon
        path: PathBuf,
    },
    /// Stop capturing
    Shutdown,
    /// Query capture status
    Status,
}

/// Response messages sent from the daemon back to the CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    /// Outcome of a capture request
    Capture {
        result: CaptureMessage,
        code: u8,
    },
    /// Operation completed successfully
    Success {
        /// Optional message with additional details
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Capture status
    Status { status: CaptureStatus },
    /// Error occurred while processing request
    Error {
        /// Error description
        message: String,
    },
}

// ============================================================================
// IPC Server
// ============================================================================

/// Default socket location: `$XDG_RUNTIME_DIR/keycap.sock`, or
/// `/tmp/keycap-$UID.sock` when XDG_RUNTIME_DIR is not set.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("keycap.sock")
    } else {
        let uid = nix::unistd::getuid();
        PathBuf::from(format!("/tmp/keycap-{}.sock", uid))
    }
}

/// IPC server listening on a Unix domain socket
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the socket at `socket_path`, or at [`default_socket_path`].
    ///
    /// A stale socket file left by a previous run is removed first.
    pub fn bind(socket_path: Option<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.unwrap_or_else(|| {
            if std::env::var_os("XDG_RUNTIME_DIR").is_none() {
                tracing::warn!("XDG_RUNTIME_DIR not set, using fallback socket path in /tmp");
            }
            default_socket_path()
        });

        if socket_path.exists() {
            tracing::debug!("Removing stale socket file: {}", socket_path.display());
            std::fs::remove_file(&socket_path).with_context(|| {
                format!(
                    "Failed to remove stale socket file: {}",
                    socket_path.display()
                )
            })?;
        }

        let listener = UnixListener::bind(&socket_path).with_context(|| {
            format!("Failed to create IPC socket at {}", socket_path.display())
        })?;

        tracing::info!("IPC server listening on {}", socket_path.display());

        Ok(Self {
            listener,
            socket_path,
        })
    }

    /// Wait for the next client.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .context("Failed to accept IPC connection")?;

        tracing::debug!("Accepted IPC connection");

        Ok(stream)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!("Failed to remove IPC socket file on shutdown: {}", e);
            } else {
                tracing::debug!("Removed IPC socket file: {}", self.socket_path.display());
            }
        }
    }
}

// ============================================================================
// Request handling
// ============================================================================

/// How long a client may take to send its request line.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply one request to the engine.
pub async fn handle_request<B: HookBackend>(
    engine: &mut CaptureEngine<B>,
    request: IpcRequest,
) -> IpcResponse {
    match request {
        IpcRequest::Capture { path } => {
            let path = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned());
            let result = engine.load_file_and_capture(&path).await;
            IpcResponse::Capture {
                result,
                code: result.code(),
            }
        }
        IpcRequest::Shutdown => {
            let was_capturing = engine.is_capturing();
            engine.shutdown().await;
            IpcResponse::Success {
                message: Some(if was_capturing {
                    "Capture stopped".to_string()
                } else {
                    "Not capturing".to_string()
                }),
            }
        }
        IpcRequest::Status => IpcResponse::Status {
            status: engine.status(),
        },
    }
}

/// Handle an incoming IPC connection.
///
/// Reads one line of JSON, applies it to the engine and writes the response
/// back as one line of JSON. A client that sends nothing within
/// `read_timeout` is dropped.
pub async fn handle_ipc_connection<B: HookBackend>(
    mut stream: UnixStream,
    engine: &mut CaptureEngine<B>,
    read_timeout: Duration,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    let bytes_read = tokio::time::timeout(read_timeout, reader.read_line(&mut line))
        .await
        .with_context(|| format!("No IPC request within {:?}", read_timeout))?
        .context("Failed to read IPC request")?;

    if bytes_read == 0 {
        tracing::debug!("IPC connection closed without data");
        return Ok(());
    }

    let line = line.trim();
    tracing::debug!("Received IPC request: {}", line);

    let response = match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => handle_request(engine, request).await,
        Err(e) => {
            tracing::warn!("Failed to parse IPC request: {}", e);
            IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            }
        }
    };

    let response_json =
        serde_json::to_string(&response).context("Failed to serialize IPC response")?;

    tracing::debug!("Sending IPC response: {}", response_json);

    writer
        .write_all(response_json.as_bytes())
        .await
        .context("Failed to write IPC response")?;
    writer
        .write_all(b"\n")
        .await
        .context("Failed to write newline")?;
    writer.flush().await.context("Failed to flush IPC response")?;

    Ok(())
}

/// Send one request to a running daemon and wait for its response.
pub fn send_request(socket_path: &Path, request: &IpcRequest) -> Result<IpcResponse> {
    use std::io::{BufRead, Write};

    let mut stream = std::os::unix::net::UnixStream::connect(socket_path).with_context(|| {
        format!(
            "Failed to connect to keycapd at {} (is it running?)",
            socket_path.display()
        )
    })?;

    let request_json = serde_json::to_string(request).context("Failed to serialize request")?;
    stream
        .write_all(request_json.as_bytes())
        .context("Failed to send request")?;
    stream.write_all(b"\n").context("Failed to send request")?;
    stream.flush().context("Failed to send request")?;

    let mut line = String::new();
    std::io::BufReader::new(&stream)
        .read_line(&mut line)
        .context("Failed to read response")?;

    serde_json::from_str(line.trim()).context("Invalid response from daemon")
}
