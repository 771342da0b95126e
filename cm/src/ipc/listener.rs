//! Daemon side of the control socket
//!
//! One request line per connection, answered by one or more response lines.

use std::path::{Path, PathBuf};

use eyre::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use super::MAX_MESSAGE_SIZE;
use super::messages::{DaemonMessage, DaemonResponse};

/// Bound control socket; the socket file is removed when this is dropped
#[derive(Debug)]
pub struct IpcListener {
    inner: UnixListener,
    path: PathBuf,
}

impl IpcListener {
    /// Bind at `path`, replacing a socket file left behind by a dead daemon
    ///
    /// Fails if another daemon still accepts connections there.
    pub fn bind(path: &Path) -> Result<Self> {
        debug!(?path, "IpcListener::bind: called");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
        }

        if path.exists() {
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                bail!("Another daemon is already listening on {}", path.display());
            }
            debug!(?path, "IpcListener::bind: replacing stale socket");
            std::fs::remove_file(path).with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
        }

        let inner = UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.inner.accept().await?;
        Ok(stream)
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "IpcListener::drop: socket removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?self.path, error = %e, "Failed to remove socket file"),
        }
    }
}

/// Read the request line of a connection
pub async fn read_message<R>(stream: &mut R) -> Result<DaemonMessage>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let read = BufReader::new(stream)
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .context("Failed to read request")?;

    match line.last() {
        _ if read > MAX_MESSAGE_SIZE => bail!("Request exceeds {} bytes", MAX_MESSAGE_SIZE),
        None => bail!("Connection closed before a request was sent"),
        Some(b'\n') => {}
        Some(_) => bail!("Request is not newline terminated"),
    }

    let msg = serde_json::from_slice(&line).context("Malformed request")?;
    debug!(?msg, "read_message: parsed");
    Ok(msg)
}

/// Write one response line
pub async fn send_response<W>(stream: &mut W, response: &DaemonResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(response).context("Failed to serialize response")?;
    line.push(b'\n');
    stream.write_all(&line).await.context("Failed to write response")?;
    stream.flush().await.context("Failed to flush response")?;
    debug!(?response, "send_response: sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_bind_creates_parent_and_removes_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run").join("daemon.sock");

        let listener = IpcListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path);
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.sock");
        std::fs::write(&path, "stale").unwrap();

        assert!(IpcListener::bind(&path).is_ok());
    }

    #[tokio::test]
    async fn test_bind_refuses_live_socket() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.sock");
        let _first = IpcListener::bind(&path).unwrap();

        let err = IpcListener::bind(&path).unwrap_err();
        assert!(err.to_string().contains("already listening"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_request_and_response_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("daemon.sock");
        let listener = IpcListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            assert_eq!(read_message(&mut stream).await.unwrap(), DaemonMessage::List);
            send_response(&mut stream, &DaemonResponse::Records { records: Vec::new() })
                .await
                .unwrap();
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"{\"type\":\"List\"}\n").await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut stream).read_line(&mut line).await.unwrap();
        assert_eq!(line, "{\"type\":\"Records\",\"records\":[]}\n");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_message_rejects_bad_input() {
        let oversized = [vec![b'x'; MAX_MESSAGE_SIZE + 10], b"\n".to_vec()].concat();
        let cases: [(&[u8], &str); 4] = [
            (&oversized, "exceeds"),
            (b"", "closed before"),
            (b"{\"type\":\"Ping\"}", "newline"),
            (b"{\"type\":\"Nope\"}\n", "Malformed"),
        ];
        for (input, expected) in cases {
            let mut reader = input;
            let err = read_message(&mut reader).await.unwrap_err();
            assert!(err.to_string().contains(expected), "{}: {}", expected, err);
        }
    }
}
