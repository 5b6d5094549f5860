//! Local control socket: newline-delimited JSON requests plus status pushes

use crate::protocol::{Request, Response};
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const BROADCAST_CAPACITY: usize = 64;
const SOCKET_NAME: &str = "netusage.sock";

/// Requests longer than this are answered with an error and the client is dropped.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Owns the listening socket and its file; the file is removed on close or drop.
pub struct ControlSocket {
    path: PathBuf,
    listener: UnixListener,
    status_tx: broadcast::Sender<String>,
}

impl ControlSocket {
    /// Bind at `path`, replacing a stale socket file left by a previous run.
    /// Fails with `AddrInUse` while another daemon still answers on it.
    pub async fn bind(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        clear_stale(path).await?;

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        let (status_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        info!("Control socket listening on {:?}", path);
        Ok(Self { path: path.to_path_buf(), listener, status_tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sender for messages pushed to every connected client.
    pub fn status_sender(&self) -> broadcast::Sender<String> {
        self.status_tx.clone()
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Stop listening and remove the socket file.
    pub fn close(self) {
        info!("Closing control socket {:?}", self.path);
    }

    /// `$XDG_RUNTIME_DIR/netusage.sock`, or `/run/user/<uid>` when unset.
    pub fn default_path() -> PathBuf {
        match directories::BaseDirs::new().and_then(|dirs| dirs.runtime_dir().map(Path::to_path_buf)) {
            Some(dir) => dir.join(SOCKET_NAME),
            None => {
                let uid = unsafe { libc::getuid() };
                PathBuf::from(format!("/run/user/{}", uid)).join(SOCKET_NAME)
            }
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove socket file {:?}: {}", self.path, e);
            }
        }
    }
}

async fn clear_stale(path: &Path) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.file_type().is_socket() {
        return Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{:?} exists and is not a socket", path),
        ));
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(std::io::Error::new(
            ErrorKind::AddrInUse,
            format!("another daemon is listening on {:?}", path),
        ));
    }
    debug!("Removing stale socket {:?}", path);
    std::fs::remove_file(path)
}

/// Serialize a message as one JSON line.
pub fn encode(response: &Response) -> String {
    match serde_json::to_string(response) {
        Ok(json) => json + "\n",
        Err(e) => {
            error!("Failed to encode response: {}", e);
            format!("{{\"type\":\"error\",\"message\":{:?}}}\n", e.to_string())
        }
    }
}

/// Answer one request line. Blank lines get no reply.
pub async fn dispatch<H>(handler: &H, line: &str) -> Option<Response>
where
    H: RequestHandler + ?Sized,
{
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let response = match serde_json::from_str::<Request>(line) {
        Ok(request) => handler.handle(request).await,
        Err(e) => {
            warn!("Invalid request: {}", e);
            Response::error(format!("invalid request: {}", e))
        }
    };
    Some(response)
}

/// Serve one client until it hangs up: replies to its requests in order and
/// interleaves status pushes between them.
pub async fn serve_client<H>(
    stream: UnixStream,
    mut status_rx: broadcast::Receiver<String>,
    handler: Arc<H>,
) where
    H: RequestHandler + Send + Sync + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                let reply = match result {
                    Ok(0) => break,
                    Ok(n) if n > MAX_REQUEST_BYTES => {
                        warn!("Dropping client after {} byte request", n);
                        let reply = encode(&Response::error("request too large"));
                        let _ = writer.write_all(reply.as_bytes()).await;
                        break;
                    }
                    Ok(_) => dispatch(handler.as_ref(), &line).await,
                    Err(e) => {
                        debug!("Client read failed: {}", e);
                        break;
                    }
                };
                line.clear();
                if let Some(reply) = reply {
                    if let Err(e) = writer.write_all(encode(&reply).as_bytes()).await {
                        debug!("Client went away before reply: {}", e);
                        break;
                    }
                }
            }
            result = status_rx.recv() => match result {
                Ok(msg) => {
                    if let Err(e) = writer.write_all(msg.as_bytes()).await {
                        debug!("Client went away during status push: {}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Client lagging, skipped {} status pushes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[async_trait::async_trait]
pub trait RequestHandler {
    async fn handle(&self, request: Request) -> Response;
}
