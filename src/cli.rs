//! CLI argument parsing for hetrace

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for replayed spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON lines, one span per line
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "hetrace")]
#[command(version)]
#[command(about = "Heterogeneous CPU/GPU trace correlation engine", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    /// TOML configuration file
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a recorded JSON-lines callback stream
    Replay(ReplayArgs),
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Recorded event stream (JSON lines)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Show aggregated durations instead of individual spans
    #[arg(short = 'c', long = "summary")]
    pub summary: bool,

    /// Print the critical path after the spans
    #[arg(long = "critical-path")]
    pub critical_path: bool,

    /// Device-to-host clock offset in nanoseconds
    #[arg(long = "skew-offset", value_name = "NS", allow_hyphen_values = true)]
    pub skew_offset: Option<i64>,

    /// Deferred work pool size (0 = run at flush points)
    #[arg(long = "workers", value_name = "N")]
    pub workers: Option<usize>,

    /// Filter CPU API operations (e.g., -e trace=hipMemcpy,launch or -e exclude=/^hsa_/)
    #[arg(short = 'e', long = "expr", value_name = "EXPR")]
    pub api_filter: Option<String>,

    /// Filter device operation kinds (e.g., trace=DISPATCH)
    #[arg(long = "activity-filter", value_name = "EXPR")]
    pub activity_filter: Option<String>,

    /// Keep every aggregated sample as its own entry
    #[arg(long = "timeline")]
    pub timeline: bool,

    /// Export spans to an OTLP endpoint (e.g., http://localhost:4317)
    #[arg(long = "otlp-endpoint", value_name = "URL")]
    pub otlp_endpoint: Option<String>,

    /// Service name reported to the OTLP endpoint
    #[arg(long = "otlp-service-name", value_name = "NAME", default_value = "hetrace")]
    pub otlp_service_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay_args(cli: Cli) -> ReplayArgs {
        match cli.command {
            Command::Replay(args) => args,
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_replay() {
        let args = replay_args(Cli::parse_from(["hetrace", "replay", "trace.jsonl"]));
        assert_eq!(args.input, PathBuf::from("trace.jsonl"));
        assert_eq!(args.format, OutputFormat::Text);
        assert!(!args.summary);
        assert_eq!(args.otlp_service_name, "hetrace");
    }

    #[test]
    fn test_cli_negative_skew_offset() {
        let args = replay_args(Cli::parse_from([
            "hetrace",
            "replay",
            "t.jsonl",
            "--skew-offset",
            "-10",
        ]));
        assert_eq!(args.skew_offset, Some(-10));
    }

    #[test]
    fn test_cli_filters_and_summary() {
        let args = replay_args(Cli::parse_from([
            "hetrace",
            "replay",
            "t.jsonl",
            "-c",
            "-e",
            "trace=launch",
            "--activity-filter",
            "exclude=COPY",
            "--format",
            "json",
        ]));
        assert!(args.summary);
        assert_eq!(args.api_filter.as_deref(), Some("trace=launch"));
        assert_eq!(args.activity_filter.as_deref(), Some("exclude=COPY"));
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from(["hetrace", "show-config", "--debug", "--config", "h.toml"]);
        assert!(cli.debug);
        assert_eq!(cli.config, Some(PathBuf::from("h.toml")));
        assert!(matches!(cli.command, Command::ShowConfig));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["hetrace"]).is_err());
    }
}
