use anyhow::{Context, Result};
use clap::Parser;
use hetrace::cli::{Cli, Command, OutputFormat, ReplayArgs};
use hetrace::config::TraceConfig;
use hetrace::otlp_sink::{OtlpConfig, OtlpSink};
use hetrace::replay::{self, Replayer};
use hetrace::sink::SpanSink;
use std::fs::File;
use std::io::{BufReader, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for diagnostics on stderr
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// File (or defaults), then `HETRACE_*` environment overrides
fn load_config(path: Option<&std::path::Path>) -> Result<TraceConfig> {
    let config = match path {
        Some(path) => TraceConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => TraceConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn run_replay(mut config: TraceConfig, args: ReplayArgs) -> Result<()> {
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if args.api_filter.is_some() {
        config.api_filter = args.api_filter.clone();
    }
    if args.activity_filter.is_some() {
        config.activity_filter = args.activity_filter.clone();
    }
    if args.timeline {
        config.timeline_profile = true;
    }

    let file = File::open(&args.input)
        .with_context(|| format!("failed to open {}", args.input.display()))?;
    let events = replay::parse_events(BufReader::new(file))?;

    let otlp = match &args.otlp_endpoint {
        Some(endpoint) => Some(Arc::new(OtlpSink::new(OtlpConfig {
            endpoint: endpoint.clone(),
            service_name: args.otlp_service_name.clone(),
        })?)),
        None => None,
    };
    let extra = otlp.clone().map(|sink| sink as Arc<dyn SpanSink>);

    let mut replayer = Replayer::new(config, args.skew_offset, extra)?;
    for event in &events {
        replayer.apply(event);
    }
    let outcome = replayer.finish()?;
    if let Some(otlp) = otlp {
        otlp.shutdown();
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    if args.summary {
        write!(out, "{}", outcome.aggregator.summary())?;
    } else {
        match args.format {
            OutputFormat::Text => {
                for span in &outcome.spans {
                    writeln!(out, "{}", replay::format_span(span))?;
                }
            }
            OutputFormat::Json => {
                for span in &outcome.spans {
                    serde_json::to_writer(&mut out, span)?;
                    writeln!(out)?;
                }
            }
        }
    }

    if args.critical_path {
        match &outcome.critical_path {
            Some(path) if !path.path.is_empty() => {
                writeln!(out, "\n=== Critical Path ===")?;
                writeln!(out, "{}", path.span_names.join(" -> "))?;
                writeln!(out, "Total duration: {} ns", path.total_duration)?;
            }
            _ => writeln!(out, "\nNo critical path (critical trace disabled or empty)")?,
        }
    }

    tracing::info!(
        events = events.len(),
        spans = outcome.spans.len(),
        orphans = outcome.drains.orphans,
        discarded = outcome.shutdown.discarded_records,
        "replay finished"
    );
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = load_config(args.config.as_deref())?;
    match args.command {
        Command::Replay(replay_args) => run_replay(config, replay_args)?,
        Command::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
