//! Clusterman - cluster monitor orchestration
//!
//! CLI entry point for the daemon and its client commands.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use clusterman::cli::{Cli, Command, EventsArgs, OutputFormat, SetArgs};
use clusterman::config::Config;
use clusterman::daemon::run_daemon;
use clusterman::domain::{EntityRef, LocalExpect, ObjectPath};
use clusterman::ipc::DaemonClient;
use clusterman::sse::{CodecError, encode};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clusterman")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("clusterman.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(node = %config.node_name, "Clusterman loaded config");

    let client = DaemonClient::with_socket_path(config.ipc.socket_path.clone());

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve => {
            debug!("main: matched Serve command");
            println!("Starting clusterman daemon on node {}...", config.node_name);
            run_daemon(&config).await
        }
        Command::Ping => cmd_ping(&client).await,
        Command::Stop => cmd_stop(&client).await,
        Command::Declare { entity } => cmd_declare(&client, &entity).await,
        Command::Forget { entity } => cmd_forget(&client, &entity).await,
        Command::List { format } => cmd_list(&client, format).await,
        Command::Metrics { format } => cmd_metrics(&client, format).await,
        Command::Set(args) => cmd_set(&client, args).await,
        Command::Orchestrate {
            intent,
            paths,
            deadline_ms,
            format,
        } => cmd_orchestrate(&client, intent, paths, deadline_ms, format).await,
        Command::Events(args) => cmd_events(&client, &config, args).await,
    }
}

fn ensure_socket(client: &DaemonClient) -> Result<()> {
    if !client.socket_exists() {
        return Err(eyre::eyre!(
            "Daemon socket not found at {}. Is `cm serve` running?",
            client.socket_path().display()
        ));
    }
    Ok(())
}

async fn cmd_ping(client: &DaemonClient) -> Result<()> {
    debug!("cmd_ping: called");
    ensure_socket(client)?;
    let (version, node) = client.ping().await?;
    println!("{} node {} (version {})", "Daemon is alive:".green(), node, version);
    Ok(())
}

async fn cmd_stop(client: &DaemonClient) -> Result<()> {
    debug!("cmd_stop: called");
    if !client.socket_exists() {
        println!("Clusterman daemon is not running");
        return Ok(());
    }
    client.shutdown().await?;
    println!("Clusterman daemon stopping");
    Ok(())
}

async fn cmd_declare(client: &DaemonClient, entity: &EntityRef) -> Result<()> {
    debug!(%entity, "cmd_declare: called");
    ensure_socket(client)?;
    let record = client.declare(entity).await?;
    println!("Declared {} ({})", entity, record.state);
    Ok(())
}

async fn cmd_forget(client: &DaemonClient, entity: &EntityRef) -> Result<()> {
    debug!(%entity, "cmd_forget: called");
    ensure_socket(client)?;
    client.forget(entity).await?;
    println!("Forgot {}", entity);
    Ok(())
}

async fn cmd_list(client: &DaemonClient, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_list: called");
    ensure_socket(client)?;
    let records = client.list().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("{}", "No entities declared.".dimmed());
                return Ok(());
            }
            println!("{:<40} {:<14} {:<12} {:<12} ORCHESTRATION", "ENTITY", "STATE", "LOCAL", "GLOBAL");
            for entry in &records {
                let record = &entry.record;
                println!(
                    "{:<40} {:<14} {:<12} {:<12} {}",
                    entry.entity.to_string(),
                    record.state.to_string(),
                    record.local_expect.map(|e| e.to_string()).unwrap_or_else(|| "-".to_string()),
                    record.global_expect.map(|e| e.to_string()).unwrap_or_else(|| "-".to_string()),
                    record.orchestration_id.map(|id| id.short()).unwrap_or_else(|| "-".to_string()),
                );
            }
        }
    }
    Ok(())
}

async fn cmd_metrics(client: &DaemonClient, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_metrics: called");
    ensure_socket(client)?;
    let metrics = client.metrics().await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metrics)?),
        OutputFormat::Text => {
            println!("Subscribers: {}", metrics.subscribers);
            println!("Published:   {}", metrics.published);
            println!("Delivered:   {}", metrics.delivered);
            println!("Dropped:     {}", metrics.dropped);
        }
    }
    Ok(())
}

async fn cmd_set(client: &DaemonClient, args: SetArgs) -> Result<()> {
    debug!(?args, "cmd_set: called");
    ensure_socket(client)?;
    let id = client
        .set_monitor(&args.entity, args.patch(), args.orchestration_id, args.timeout_ms)
        .await?;
    println!("{} {} under orchestration {}", "Updated".green(), args.entity, id);
    Ok(())
}

async fn cmd_orchestrate(
    client: &DaemonClient,
    intent: LocalExpect,
    paths: Vec<ObjectPath>,
    deadline_ms: Option<u64>,
    format: OutputFormat,
) -> Result<()> {
    debug!(%intent, ?paths, ?deadline_ms, ?format, "cmd_orchestrate: called");
    ensure_socket(client)?;
    let report = client.orchestrate(intent, paths, deadline_ms).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!(
                "{} {} ({}) in {}ms",
                "Converged".green(),
                report.intent,
                report.id,
                report.elapsed_ms
            );
            let sections = [
                ("converged", &report.converged),
                ("already", &report.already),
                ("busy", &report.busy),
                ("missing", &report.missing),
            ];
            for (label, entities) in sections {
                if !entities.is_empty() {
                    let names: Vec<String> = entities.iter().map(|e| e.to_string()).collect();
                    println!("  {:<10} {}", label, names.join(", "));
                }
            }
        }
    }
    Ok(())
}

async fn cmd_events(client: &DaemonClient, config: &Config, args: EventsArgs) -> Result<()> {
    debug!(?args, "cmd_events: called");
    ensure_socket(client)?;
    let decoder = client
        .events(args.filters(), args.limit, args.duration_ms, config.stream.max_record_size)
        .await?;

    let mut stdout = std::io::stdout();
    loop {
        let next = tokio::select! {
            event = decoder.read() => event,
            _ = tokio::signal::ctrl_c() => {
                debug!("cmd_events: interrupted");
                break;
            }
        };
        match next {
            Ok(event) => {
                stdout.write_all(&encode(&event)).context("Failed to write event")?;
                stdout.flush()?;
            }
            Err(CodecError::EndOfStream) => break,
            Err(e) => return Err(e).context("Event stream failed"),
        }
    }

    let _ = decoder.close();
    Ok(())
}
