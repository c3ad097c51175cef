mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use weft_analyze::{Analyzer, NoopNotifier};
use weft_config::AppConfig;
use weft_store::PageRequest;

#[derive(Debug, Parser)]
#[command(name = "weft", about = "Assemble agent traces, sessions and block logs from JSON logs")]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Tail the configured log directories until interrupted.
    Analyze {
        #[arg(long)]
        no_server: bool,
    },
    /// Print the persisted read position.
    Watermark,
    /// Print the log for one notebook block.
    Block { id: String },
    /// Print one session by context id.
    Session { context_id: String },
    /// Print one reconstructed trace.
    Trace {
        id: String,
        /// Print the buffered raw lines instead of the trace.
        #[arg(long)]
        raw: bool,
    },
    /// List sessions, newest first.
    Sessions {
        #[arg(long, default_value_t = 50)]
        limit: u16,
        #[arg(long)]
        cursor: Option<String>,
    },
}

fn load_app_config(path: Option<PathBuf>) -> Result<AppConfig> {
    let path = weft_config::resolve_config_path(path);
    if path.exists() {
        weft_config::load_config(&path)
            .with_context(|| format!("failed to load config {}", path.display()))
    } else {
        warn!("config {} not found; using defaults", path.display());
        Ok(weft_config::default_config())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_found<T: Serialize>(kind: &str, id: &str, value: Option<T>) -> Result<()> {
    match value {
        Some(value) => print_json(&value),
        None => anyhow::bail!("{kind} {id} not found"),
    }
}

async fn run_analyze(config: AppConfig, no_server: bool) -> Result<()> {
    let server_cfg = config.server.clone();
    let analyzer = Arc::new(Analyzer::new(config, Arc::new(NoopNotifier))?);
    analyzer.run()?;

    let server = if server_cfg.enabled && !no_server {
        let analyzer = Arc::clone(&analyzer);
        Some(tokio::spawn(async move {
            if let Err(exc) = server::run_server(analyzer, server_cfg.host, server_cfg.port).await
            {
                error!("query api stopped: {exc:#}");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupt received");

    if let Some(server) = server {
        server.abort();
    }
    analyzer.shutdown().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_app_config(cli.config)?;

    if let CliCommand::Analyze { no_server } = cli.command {
        return run_analyze(config, no_server).await;
    }

    let analyzer = Analyzer::new(config, Arc::new(NoopNotifier))?;
    match cli.command {
        CliCommand::Analyze { .. } => Ok(()),
        CliCommand::Watermark => print_json(&analyzer.watermark()),
        CliCommand::Block { id } => print_found("block", &id, analyzer.get_block_log(&id)?),
        CliCommand::Session { context_id } => {
            print_found("session", &context_id, analyzer.get_session(&context_id)?)
        }
        CliCommand::Trace { id, raw: false } => print_found("trace", &id, analyzer.get_trace(&id)?),
        CliCommand::Trace { id, raw: true } => {
            print_found("raw log", &id, analyzer.get_log_entries(&id)?)
        }
        CliCommand::Sessions { limit, cursor } => {
            print_json(&analyzer.list_sessions(&PageRequest { limit, cursor })?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_analyze_with_global_config() {
        let cli = Cli::parse_from(["weft", "analyze", "--no-server", "--config", "/tmp/w.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/w.toml")));
        match cli.command {
            CliCommand::Analyze { no_server } => assert!(no_server),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_sessions_paging() {
        let cli = Cli::parse_from(["weft", "sessions", "--limit", "10", "--cursor", "abc"]);
        match cli.command {
            CliCommand::Sessions { limit, cursor } => {
                assert_eq!(limit, 10);
                assert_eq!(cursor.as_deref(), Some("abc"));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::parse_from(["weft", "sessions"]);
        match cli.command {
            CliCommand::Sessions { limit, cursor } => {
                assert_eq!(limit, 50);
                assert!(cursor.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_raw_trace_lookup() {
        let cli = Cli::parse_from(["weft", "trace", "t1", "--raw"]);
        match cli.command {
            CliCommand::Trace { id, raw } => {
                assert_eq!(id, "t1");
                assert!(raw);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
