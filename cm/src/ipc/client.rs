//! IPC client for communicating with the daemon

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::bus::{BusMetrics, Filter};
use crate::domain::{EntityRef, LocalExpect, MonitorPatch, MonitorRecord, ObjectPath, OrchestrationId};
use crate::orchestrate::OrchestrationReport;
use crate::sse::Decoder;

use super::messages::{DaemonMessage, DaemonResponse, RecordEntry};
use super::{MAX_MESSAGE_SIZE, get_socket_path};

/// Default timeout for IPC operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error reported by the daemon, with its HTTP-style status code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Daemon error ({status}): {message}")]
pub struct DaemonError {
    pub status: u16,
    pub message: String,
}

fn unexpected(response: DaemonResponse) -> eyre::Report {
    match response {
        DaemonResponse::Error { status, message } => DaemonError { status, message }.into(),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}

/// Client for communicating with the daemon via IPC
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient {
    /// Create a new client with the default socket path
    pub fn new() -> Self {
        Self::with_socket_path(get_socket_path())
    }

    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the connect and I/O timeout
    ///
    /// Requests that wait on the daemon (`set_monitor`, `orchestrate`) get
    /// their own wait added on top.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Check if the daemon socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if daemon is alive; returns its version and node name
    pub async fn ping(&self) -> Result<(String, String)> {
        debug!("DaemonClient: pinging daemon");
        match self.send_message(&DaemonMessage::Ping, Duration::ZERO).await? {
            DaemonResponse::Pong { version, node } => Ok((version, node)),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon to shutdown gracefully
    pub async fn shutdown(&self) -> Result<()> {
        debug!("DaemonClient: requesting daemon shutdown");
        match self.send_message(&DaemonMessage::Shutdown, Duration::ZERO).await? {
            DaemonResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn declare(&self, entity: &EntityRef) -> Result<MonitorRecord> {
        debug!(%entity, "DaemonClient: declare");
        let msg = DaemonMessage::Declare { entity: entity.clone() };
        match self.send_message(&msg, Duration::ZERO).await? {
            DaemonResponse::Declared { record, .. } => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub async fn forget(&self, entity: &EntityRef) -> Result<()> {
        debug!(%entity, "DaemonClient: forget");
        let msg = DaemonMessage::Forget { entity: entity.clone() };
        match self.send_message(&msg, Duration::ZERO).await? {
            DaemonResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list(&self) -> Result<Vec<RecordEntry>> {
        debug!("DaemonClient: list");
        match self.send_message(&DaemonMessage::List, Duration::ZERO).await? {
            DaemonResponse::Records { records } => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    pub async fn metrics(&self) -> Result<BusMetrics> {
        debug!("DaemonClient: metrics");
        match self.send_message(&DaemonMessage::Metrics, Duration::ZERO).await? {
            DaemonResponse::Metrics { metrics } => Ok(metrics),
            other => Err(unexpected(other)),
        }
    }

    /// Propose a monitor update; refusals come back as [`DaemonError`]
    pub async fn set_monitor(
        &self,
        entity: &EntityRef,
        patch: MonitorPatch,
        orchestration_id: Option<OrchestrationId>,
        timeout_ms: Option<u64>,
    ) -> Result<OrchestrationId> {
        debug!(%entity, ?patch, ?orchestration_id, ?timeout_ms, "DaemonClient: set_monitor");
        let wait = Duration::from_millis(timeout_ms.unwrap_or(0));
        let msg = DaemonMessage::SetMonitor {
            entity: entity.clone(),
            patch,
            orchestration_id,
            timeout_ms,
        };
        match self.send_message(&msg, wait).await? {
            DaemonResponse::Updated { orchestration_id } => Ok(orchestration_id),
            other => Err(unexpected(other)),
        }
    }

    /// Run an orchestration on the daemon's node and wait for the report
    pub async fn orchestrate(
        &self,
        intent: LocalExpect,
        paths: Vec<ObjectPath>,
        deadline_ms: Option<u64>,
    ) -> Result<OrchestrationReport> {
        debug!(?intent, ?paths, ?deadline_ms, "DaemonClient: orchestrate");
        let wait = Duration::from_millis(deadline_ms.unwrap_or(0));
        let msg = DaemonMessage::Orchestrate {
            intent,
            paths,
            deadline_ms,
        };
        match self.send_message(&msg, wait).await? {
            DaemonResponse::Orchestrated { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    /// Open an event stream; the returned decoder yields records until the
    /// daemon closes the connection
    pub async fn events(
        &self,
        filters: Vec<Filter>,
        limit: Option<u64>,
        duration_ms: Option<u64>,
        max_record_size: usize,
    ) -> Result<Decoder> {
        debug!(?filters, ?limit, ?duration_ms, "DaemonClient: events");
        let msg = DaemonMessage::Events {
            filters,
            limit,
            duration_ms,
        };
        let mut stream = self.connect().await?;
        self.write_message(&mut stream, &msg).await?;

        // The reader keeps whatever follows the response line for the decoder
        let mut reader = BufReader::new(stream);
        match self.read_response(&mut reader, Duration::ZERO).await? {
            DaemonResponse::Streaming => Ok(Decoder::new(reader, max_record_size)),
            other => Err(unexpected(other)),
        }
    }

    async fn connect(&self) -> Result<UnixStream> {
        tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to daemon socket")
    }

    /// Send a message to the daemon and wait for response
    async fn send_message(&self, msg: &DaemonMessage, wait: Duration) -> Result<DaemonResponse> {
        debug!(?self.socket_path, ?msg, "DaemonClient: sending message");
        let mut stream = self.connect().await?;
        self.write_message(&mut stream, msg).await?;
        let mut reader = BufReader::new(stream);
        self.read_response(&mut reader, wait).await
    }

    async fn write_message(&self, stream: &mut UnixStream, msg: &DaemonMessage) -> Result<()> {
        let msg_json = serde_json::to_string(msg).context("Failed to serialize message")?;

        if msg_json.len() > MAX_MESSAGE_SIZE {
            return Err(eyre::eyre!("Message too large: {} bytes", msg_json.len()));
        }

        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(msg_json.as_bytes())
                .await
                .context("Failed to write message")?;
            stream.write_all(b"\n").await.context("Failed to write newline")?;
            stream.flush().await.context("Failed to flush stream")?;
            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Write timeout")??;
        Ok(())
    }

    async fn read_response(&self, reader: &mut BufReader<UnixStream>, wait: Duration) -> Result<DaemonResponse> {
        let mut response_line = String::new();

        tokio::time::timeout(self.timeout + wait, async {
            let bytes_read = (&mut *reader)
                .take(MAX_MESSAGE_SIZE as u64 + 1)
                .read_line(&mut response_line)
                .await
                .context("Failed to read response")?;

            if bytes_read > MAX_MESSAGE_SIZE {
                return Err(eyre::eyre!("Response too large: {} bytes", bytes_read));
            }
            if bytes_read == 0 {
                return Err(eyre::eyre!("Daemon closed the connection"));
            }

            Ok::<_, eyre::Error>(())
        })
        .await
        .context("Read timeout")??;

        let response: DaemonResponse =
            serde_json::from_str(response_line.trim()).context("Failed to parse daemon response")?;

        debug!(?response, "DaemonClient: received response");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::listener::{IpcListener, read_message, send_response};
    use tempfile::TempDir;

    #[test]
    fn test_client_default() {
        let client = DaemonClient::default();
        assert!(client.socket_path.ends_with("daemon.sock"));
    }

    #[test]
    fn test_client_with_timeout() {
        let client = DaemonClient::new().with_timeout(Duration::from_secs(10));
        assert_eq!(client.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_socket_exists_false() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(!client.socket_exists());
    }

    #[tokio::test]
    async fn test_connect_fails_without_daemon() {
        let temp = TempDir::new().unwrap();
        let client = DaemonClient::with_socket_path(temp.path().join("nonexistent.sock"));
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_ping_pong() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("test.sock");
        let listener = IpcListener::bind(&socket_path).unwrap();

        let mock_daemon = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let msg = read_message(&mut stream).await.unwrap();
            assert!(matches!(msg, DaemonMessage::Ping));
            let response = DaemonResponse::Pong {
                version: "test-version".to_string(),
                node: "node1".to_string(),
            };
            send_response(&mut stream, &response).await.unwrap();
        });

        let client = DaemonClient::with_socket_path(socket_path);
        let (version, node) = client.ping().await.unwrap();
        assert_eq!(version, "test-version");
        assert_eq!(node, "node1");

        mock_daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_downcasts() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("test.sock");
        let listener = IpcListener::bind(&socket_path).unwrap();

        let mock_daemon = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            read_message(&mut stream).await.unwrap();
            send_response(&mut stream, &DaemonResponse::error(404, "Unknown entity node9"))
                .await
                .unwrap();
        });

        let client = DaemonClient::with_socket_path(socket_path);
        let err = client.forget(&EntityRef::node("node9").unwrap()).await.unwrap_err();
        let daemon_err = err.downcast_ref::<DaemonError>().unwrap();
        assert_eq!(daemon_err.status, 404);

        mock_daemon.await.unwrap();
    }
}
