//! Inter-Process Communication between the CLI and the daemon
//!
//! Unix Domain Socket carrying one newline-terminated JSON request and one
//! JSON response line per connection. An `Events` request is answered with
//! `Streaming` and the connection then carries event records until either
//! side closes it.

use std::path::PathBuf;

pub mod client;
pub mod listener;
pub mod messages;

pub use client::{DaemonClient, DaemonError};
pub use listener::{IpcListener, read_message, send_response};
pub use messages::{DaemonMessage, DaemonResponse, RecordEntry};

/// Upper bound on one request or response line
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Default socket path for daemon IPC
pub fn get_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("clusterman")
        .join("daemon.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_ends_with_daemon_sock() {
        let path = get_socket_path();
        assert!(path.ends_with("clusterman/daemon.sock"));
    }
}
