//! Daemon process: bus, monitor workers, actuator and the IPC listener

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio::net::UnixStream;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, Filter, QueueFullPolicy, Subscription, SubscriptionOptions};
use crate::config::Config;
use crate::domain::{EntityRef, LocalExpect, MonitorPatch, ObjectPath, OrchestrationId};
use crate::ipc::{DaemonMessage, DaemonResponse, IpcListener, RecordEntry, read_message, send_response};
use crate::monitor::{Actuator, MonitorManager, MonitorStore};
use crate::orchestrate::{ConvergenceWaiter, Orchestration, plan_targets};
use crate::sse::{StreamOptions, serve_stream};

/// Version reported to `ping`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state handed to every connection task
#[derive(Clone)]
struct DaemonContext {
    node: String,
    manager: MonitorManager,
    waiter: ConvergenceWaiter,
    config: Arc<Config>,
    shutdown_tx: mpsc::Sender<()>,
}

/// Run the daemon until `Shutdown` arrives over IPC or the process is signalled
pub async fn run_daemon(config: &Config) -> Result<()> {
    debug!(node = %config.node_name, socket = ?config.ipc.socket_path, "run_daemon: called");
    info!("Daemon starting...");

    let node_entity = EntityRef::node(&config.node_name).context("Invalid node name")?;

    let bus = Bus::spawn(config.bus.clone());
    info!("Event bus started");

    let manager = MonitorManager::new(bus.clone(), MonitorStore::new(), config.monitor.clone());
    manager
        .declare(node_entity)
        .await
        .context("Failed to declare local node")?;
    info!(node = %config.node_name, "MonitorManager initialized");

    let actuator = if config.actuator.enabled {
        let actuator = Actuator::spawn(&config.node_name, manager.client(), config.actuator.clone())
            .await
            .context("Failed to start actuator")?;
        info!("Actuator started");
        Some(actuator)
    } else {
        debug!("run_daemon: actuator disabled");
        None
    };

    let waiter = ConvergenceWaiter::new(manager.client(), config.orchestration.clone());

    let listener = IpcListener::bind(&config.ipc.socket_path)?;
    info!(socket_path = ?listener.path(), "IPC socket listening");

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let ctx = DaemonContext {
        node: config.node_name.clone(),
        manager: manager.clone(),
        waiter,
        config: Arc::new(config.clone()),
        shutdown_tx,
    };

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut connections = JoinSet::new();

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok(stream) => {
                        debug!("run_daemon: IPC connection accepted");
                        let ctx = ctx.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(ctx, stream).await {
                                warn!(error = %e, "IPC connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "IPC accept error");
                    }
                }
            }
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "IPC connection task failed");
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("run_daemon: shutdown requested via IPC");
                info!("Shutdown requested");
                break;
            }
            _ = sigint.recv() => {
                debug!("run_daemon: SIGINT received, initiating shutdown");
                warn!("SIGINT received");
                break;
            }
            _ = sigterm.recv() => {
                debug!("run_daemon: SIGTERM received, initiating shutdown");
                warn!("SIGTERM received");
                break;
            }
        }
    }

    info!("Daemon shutting down...");
    // Removes the socket file
    drop(listener);

    debug!(open = connections.len(), "run_daemon: aborting open connections");
    connections.shutdown().await;

    if let Some(actuator) = actuator {
        actuator.shutdown().await;
    }
    manager.shutdown().await;
    bus.shutdown().await;

    debug!("run_daemon: shutdown complete");
    Ok(())
}

/// Serve one IPC request
async fn handle_connection(ctx: DaemonContext, mut stream: UnixStream) -> Result<()> {
    let msg = read_message(&mut stream).await?;
    debug!(?msg, "handle_connection: received message");

    let response = match msg {
        DaemonMessage::Ping => {
            debug!("handle_connection: Ping");
            DaemonResponse::Pong {
                version: VERSION.to_string(),
                node: ctx.node.clone(),
            }
        }
        DaemonMessage::Shutdown => {
            debug!("handle_connection: Shutdown");
            send_response(&mut stream, &DaemonResponse::Ok).await?;
            let _ = ctx.shutdown_tx.send(()).await;
            return Ok(());
        }
        DaemonMessage::Declare { entity } => match ctx.manager.declare(entity.clone()).await {
            Ok(record) => DaemonResponse::Declared { entity, record },
            Err(e) => DaemonResponse::error(e.status(), e.to_string()),
        },
        DaemonMessage::Forget { entity } => match ctx.manager.forget(&entity).await {
            Ok(()) => DaemonResponse::Ok,
            Err(e) => DaemonResponse::error(e.status(), e.to_string()),
        },
        DaemonMessage::List => DaemonResponse::Records {
            records: ctx
                .manager
                .store()
                .snapshot()
                .into_iter()
                .map(|(entity, record)| RecordEntry { entity, record })
                .collect(),
        },
        DaemonMessage::Metrics => match ctx.manager.bus().metrics().await {
            Ok(metrics) => DaemonResponse::Metrics { metrics },
            Err(e) => DaemonResponse::error(503, e.to_string()),
        },
        DaemonMessage::SetMonitor {
            entity,
            patch,
            orchestration_id,
            timeout_ms,
        } => set_monitor(&ctx, &stream, entity, patch, orchestration_id, timeout_ms).await,
        DaemonMessage::Orchestrate {
            intent,
            paths,
            deadline_ms,
        } => orchestrate(&ctx, intent, paths, deadline_ms).await,
        DaemonMessage::Events {
            filters,
            limit,
            duration_ms,
        } => return stream_events(&ctx, stream, filters, limit, duration_ms).await,
    };

    send_response(&mut stream, &response).await
}

/// Resolves once the peer has closed its end of the connection
async fn peer_closed(stream: &UnixStream) {
    let mut buf = [0u8; 1];
    loop {
        if stream.readable().await.is_err() {
            return;
        }
        match stream.try_read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
}

async fn set_monitor(
    ctx: &DaemonContext,
    stream: &UnixStream,
    entity: EntityRef,
    patch: MonitorPatch,
    orchestration_id: Option<OrchestrationId>,
    timeout_ms: Option<u64>,
) -> DaemonResponse {
    let client = ctx.manager.client();
    let candidate = orchestration_id.unwrap_or_default();
    let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(client.default_timeout());
    debug!(%entity, %candidate, ?timeout, "set_monitor: called");

    match client
        .request_update_cancellable(&entity, patch, candidate, timeout, peer_closed(stream))
        .await
    {
        Ok(orchestration_id) => DaemonResponse::Updated { orchestration_id },
        Err(e) => DaemonResponse::error(e.status(), e.to_string()),
    }
}

async fn orchestrate(
    ctx: &DaemonContext,
    intent: LocalExpect,
    paths: Vec<ObjectPath>,
    deadline_ms: Option<u64>,
) -> DaemonResponse {
    let targets = plan_targets(ctx.manager.store(), &ctx.node, intent, &paths);
    let deadline = deadline_ms
        .map(Duration::from_millis)
        .unwrap_or(ctx.waiter.config().deadline());
    debug!(%intent, targets = targets.len(), ?deadline, "orchestrate: called");

    match ctx
        .waiter
        .run(Orchestration::new(intent, targets, deadline, ctx.node.clone()))
        .await
    {
        Ok(report) => DaemonResponse::Orchestrated { report },
        Err(e) => DaemonResponse::error(e.status(), e.to_string()),
    }
}

/// Started subscription for a remote observer
///
/// A slow reader loses deliveries instead of holding up the dispatcher.
async fn stream_subscription(bus: &Bus, filters: Vec<Filter>) -> Result<Subscription, BusError> {
    let options = SubscriptionOptions::from_config(bus.config()).policy(QueueFullPolicy::Drop);
    let mut sub = bus.subscribe_with("ipc-events", options).await?;
    for filter in filters {
        sub.add_filter(filter.kind, filter.labels)?;
    }
    sub.start().await?;
    Ok(sub)
}

/// Answer `Streaming` and turn the connection into an event stream
async fn stream_events(
    ctx: &DaemonContext,
    mut stream: UnixStream,
    filters: Vec<Filter>,
    limit: Option<u64>,
    duration_ms: Option<u64>,
) -> Result<()> {
    debug!(?filters, ?limit, ?duration_ms, "stream_events: called");
    let sub = match stream_subscription(ctx.manager.bus(), filters).await {
        Ok(sub) => sub,
        Err(e) => {
            return send_response(&mut stream, &DaemonResponse::error(503, e.to_string())).await;
        }
    };

    send_response(&mut stream, &DaemonResponse::Streaming).await?;
    let options = StreamOptions {
        limit,
        duration: duration_ms.map(Duration::from_millis),
        heartbeat: ctx.config.stream.heartbeat(),
    };
    let sent = serve_stream(sub, &mut stream, options)
        .await
        .context("Event stream failed")?;
    debug!(sent, "stream_events: finished");
    Ok(())
}
