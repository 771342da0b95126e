//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::debug;

use crate::bus::{Filter, Kind, Labels};
use crate::domain::{EntityRef, GlobalExpect, LocalExpect, MonitorPatch, MonitorState, ObjectPath, OrchestrationId};

/// Clusterman - cluster monitor orchestration
#[derive(Parser)]
#[command(
    name = "cm",
    about = "Coordinate monitor updates and orchestrations across cluster entities",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/clusterman/logs/clusterman.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Check that the daemon is alive
    Ping,

    /// Stop the running daemon
    Stop,

    /// Start monitoring an entity (`ns/kind/name@node` or a node name)
    Declare { entity: EntityRef },

    /// Stop monitoring an entity
    Forget { entity: EntityRef },

    /// Show every monitor record
    List {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show bus counters
    Metrics {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Propose a monitor update
    Set(SetArgs),

    /// Run an orchestration on the daemon's node and wait for convergence
    Orchestrate {
        /// Local action: start, stop, shutdown, freeze or thaw
        intent: LocalExpect,

        /// Object paths to target; all local instances when empty
        paths: Vec<ObjectPath>,

        /// Overall deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,

        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Stream bus events as event records
    Events(EventsArgs),
}

/// Arguments of `cm set`
#[derive(Debug, Clone, Args)]
pub struct SetArgs {
    pub entity: EntityRef,

    #[arg(long)]
    pub state: Option<MonitorState>,

    #[arg(long, conflicts_with = "clear_local_expect")]
    pub local_expect: Option<LocalExpect>,

    #[arg(long, conflicts_with = "clear_global_expect")]
    pub global_expect: Option<GlobalExpect>,

    #[arg(long)]
    pub clear_local_expect: bool,

    #[arg(long)]
    pub clear_global_expect: bool,

    /// Destination nodes of a placed-at expectation
    #[arg(long, value_delimiter = ',')]
    pub dest: Vec<String>,

    /// Only apply while the record is in this state
    #[arg(long)]
    pub if_state: Option<MonitorState>,

    /// Act under an existing orchestration id
    #[arg(long)]
    pub orchestration_id: Option<OrchestrationId>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl SetArgs {
    /// Patch described by the flags
    pub fn patch(&self) -> MonitorPatch {
        debug!(?self, "SetArgs::patch: called");
        let mut patch = MonitorPatch::new();
        if let Some(state) = self.state {
            patch = patch.state(state);
        }
        if let Some(expect) = self.local_expect {
            patch = patch.local_expect(expect);
        }
        if self.clear_local_expect {
            patch = patch.clear_local_expect();
        }
        match self.global_expect {
            Some(GlobalExpect::PlacedAt) => patch = patch.placed_at(self.dest.clone()),
            Some(expect) => patch = patch.global_expect(expect),
            None => {}
        }
        if self.clear_global_expect {
            patch = patch.clear_global_expect();
        }
        if let Some(state) = self.if_state {
            patch = patch.if_state(state);
        }
        patch
    }
}

/// Arguments of `cm events`
#[derive(Debug, Clone, Args)]
pub struct EventsArgs {
    /// Only this message kind
    #[arg(long)]
    pub kind: Option<Kind>,

    /// Required labels, `k=v` (repeatable)
    #[arg(long = "label")]
    pub labels: Vec<Labels>,

    /// Stop after this many events
    #[arg(long)]
    pub limit: Option<u64>,

    /// Stop after this many milliseconds
    #[arg(long)]
    pub duration_ms: Option<u64>,
}

impl EventsArgs {
    /// Single filter combining kind and labels; none means everything
    pub fn filters(&self) -> Vec<Filter> {
        let mut labels = Labels::new();
        for set in &self.labels {
            for (key, value) in set.iter() {
                labels.insert(key, value);
            }
        }
        if self.kind.is_none() && labels.is_empty() {
            return Vec::new();
        }
        vec![Filter::new(self.kind, labels)]
    }
}

/// Log file location
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clusterman")
        .join("logs")
        .join("clusterman.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Output format for listing commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GlobalExpectOptions, Update};

    #[test]
    fn test_cli_parse_serve() {
        let cli = Cli::parse_from(["cm", "serve"]);
        assert!(matches!(cli.command, Command::Serve));
    }

    #[test]
    fn test_cli_with_config_and_log_level() {
        let cli = Cli::parse_from(["cm", "-c", "/path/to/config.yml", "-l", "debug", "ping"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_cli_parse_declare_instance() {
        let cli = Cli::parse_from(["cm", "declare", "ns1/svc/app1@node1"]);
        match cli.command {
            Command::Declare { entity } => assert_eq!(entity.to_string(), "ns1/svc/app1@node1"),
            other => panic!("Expected Declare, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_bad_entity() {
        assert!(Cli::try_parse_from(["cm", "declare", "a/b/c/d@node1"]).is_err());
    }

    #[test]
    fn test_set_builds_patch() {
        let cli = Cli::parse_from([
            "cm",
            "set",
            "ns1/svc/app1@node1",
            "--local-expect",
            "shutdown",
            "--global-expect",
            "placed_at",
            "--dest",
            "node2,node3",
            "--timeout-ms",
            "250",
        ]);
        let Command::Set(args) = cli.command else {
            panic!("Expected Set");
        };
        let patch = args.patch();
        assert_eq!(patch.local_expect, Update::Set(LocalExpect::Shutdown));
        assert_eq!(patch.global_expect, Update::Set(GlobalExpect::PlacedAt));
        assert_eq!(
            patch.global_expect_options,
            Some(GlobalExpectOptions::PlacedAt {
                destination: vec!["node2".to_string(), "node3".to_string()]
            })
        );
        assert_eq!(args.timeout_ms, Some(250));
    }

    #[test]
    fn test_set_conflicting_flags() {
        let result = Cli::try_parse_from([
            "cm",
            "set",
            "node1",
            "--local-expect",
            "freeze",
            "--clear-local-expect",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_orchestrate_paths() {
        let cli = Cli::parse_from(["cm", "orchestrate", "stop", "ns1/svc/app1", "app2", "--deadline-ms", "900"]);
        match cli.command {
            Command::Orchestrate {
                intent,
                paths,
                deadline_ms,
                ..
            } => {
                assert_eq!(intent, LocalExpect::Stop);
                assert_eq!(paths.len(), 2);
                assert_eq!(deadline_ms, Some(900));
            }
            other => panic!("Expected Orchestrate, got {:?}", other),
        }
    }

    #[test]
    fn test_events_filters() {
        let cli = Cli::parse_from([
            "cm",
            "events",
            "--kind",
            "InstanceMonitorUpdated",
            "--label",
            "node=node1",
            "--label",
            "path=ns1/svc/app1",
            "--limit",
            "5",
        ]);
        let Command::Events(args) = cli.command else {
            panic!("Expected Events");
        };
        let filters = args.filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].kind, Some(Kind::InstanceMonitorUpdated));
        assert_eq!(filters[0].labels.get("node"), Some("node1"));
        assert_eq!(filters[0].labels.get("path"), Some("ns1/svc/app1"));
    }

    #[test]
    fn test_events_without_filters_matches_all() {
        let cli = Cli::parse_from(["cm", "events"]);
        let Command::Events(args) = cli.command else {
            panic!("Expected Events");
        };
        assert!(args.filters().is_empty());
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("table".parse::<OutputFormat>().is_err());
    }
}
