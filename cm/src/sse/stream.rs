//! Server side of the event stream

use std::io::ErrorKind;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::Subscription;

use super::encode::encode;
use super::error::CodecError;
use super::event::Event;

/// Bounds of one streaming session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Close after this many events
    pub limit: Option<u64>,
    /// Close after this long
    pub duration: Option<Duration>,
    /// Send a comment line when idle this long
    pub heartbeat: Option<Duration>,
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::NotConnected
    )
}

enum Step {
    Continue,
    Disconnected,
}

async fn write_record<W>(writer: &mut W, bytes: &[u8]) -> Result<Step, CodecError>
where
    W: AsyncWrite + Unpin,
{
    let result = async {
        writer.write_all(bytes).await?;
        writer.flush().await
    }
    .await;
    match result {
        Ok(()) => Ok(Step::Continue),
        Err(e) if is_disconnect(&e) => Ok(Step::Disconnected),
        Err(e) => Err(e.into()),
    }
}

/// Write every delivery of a started subscription as an event record
///
/// Ids start at 1. Returns the number of events written; a client that
/// goes away ends the stream without an error.
pub async fn serve_stream<W>(mut sub: Subscription, writer: &mut W, options: StreamOptions) -> Result<u64, CodecError>
where
    W: AsyncWrite + Unpin,
{
    debug!(subscription = %sub.name(), ?options, "serve_stream: called");
    let deadline = options.duration.map(|d| Instant::now() + d);
    let beat_every = options.heartbeat.unwrap_or(Duration::from_secs(3600));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + beat_every, beat_every);

    let mut sent = 0u64;
    let reason = loop {
        if options.limit.is_some_and(|limit| sent >= limit) {
            break "limit";
        }

        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                break "duration";
            }
            delivery = sub.recv() => {
                let Some(delivery) = delivery else {
                    break "subscription ended";
                };
                let event = Event::from_delivery(sent + 1, &delivery)?;
                match write_record(writer, &encode(&event)).await? {
                    Step::Continue => sent += 1,
                    Step::Disconnected => break "client disconnected",
                }
                heartbeat.reset();
            }
            _ = heartbeat.tick(), if options.heartbeat.is_some() => {
                if let Step::Disconnected = write_record(writer, b": heartbeat\n").await? {
                    break "client disconnected";
                }
            }
        }
    };

    sub.stop();
    info!(subscription = %sub.name(), sent, reason, "Event stream closed");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusConfig, Kind, Labels, Msg, NodeMonitorUpdated};
    use crate::domain::MonitorRecord;
    use crate::sse::decode::{DEFAULT_MAX_RECORD_SIZE, Decoder};
    use tokio::io::BufReader;

    fn updated(node: &str) -> Msg {
        Msg::NodeMonitorUpdated(NodeMonitorUpdated {
            node: node.to_string(),
            value: MonitorRecord::new(),
        })
    }

    async fn started(bus: &Bus) -> Subscription {
        let mut sub = bus.subscribe("stream").await.unwrap();
        sub.add_filter(Some(Kind::NodeMonitorUpdated), Labels::new()).unwrap();
        sub.start().await.unwrap();
        sub
    }

    #[tokio::test]
    async fn test_limit_and_ids() {
        let bus = Bus::spawn(BusConfig::default());
        let sub = started(&bus).await;
        for node in ["n1", "n2", "n3"] {
            bus.publish(updated(node)).await.unwrap();
        }

        let (server, client) = tokio::io::duplex(64 * 1024);
        let decoder = Decoder::new(BufReader::new(client), DEFAULT_MAX_RECORD_SIZE);
        let mut server = server;
        let options = StreamOptions {
            limit: Some(2),
            ..Default::default()
        };
        let sent = serve_stream(sub, &mut server, options).await.unwrap();
        assert_eq!(sent, 2);
        drop(server);

        let first = decoder.read().await.unwrap();
        let second = decoder.read().await.unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.kind, "NodeMonitorUpdated");
        match first.to_msg().unwrap() {
            Msg::NodeMonitorUpdated(m) => assert_eq!(m.node, "n1"),
            other => panic!("Expected NodeMonitorUpdated, got {:?}", other),
        }
        assert_eq!(decoder.read().await, Err(CodecError::EndOfStream));
    }

    #[tokio::test]
    async fn test_duration_ends_quiet_stream() {
        let bus = Bus::spawn(BusConfig::default());
        let sub = started(&bus).await;
        let mut sink = tokio::io::sink();
        let options = StreamOptions {
            duration: Some(Duration::from_millis(50)),
            heartbeat: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let begin = Instant::now();
        let sent = serve_stream(sub, &mut sink, options).await.unwrap();
        assert_eq!(sent, 0);
        assert!(begin.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_client_disconnect_ends_cleanly() {
        let bus = Bus::spawn(BusConfig::default());
        let sub = started(&bus).await;
        let (mut server, client) = tokio::io::duplex(1024);
        drop(client);

        bus.publish(updated("n1")).await.unwrap();
        let sent = serve_stream(sub, &mut server, StreamOptions::default()).await.unwrap();
        assert_eq!(sent, 0);
    }
}
