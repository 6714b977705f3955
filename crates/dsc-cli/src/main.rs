//! # dsc CLI entry point
//!
//! Parses arguments, sets up tracing and dispatches to the subcommands.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dsc_cli::{demo, ConnectorConfig};

/// Data-space connector core.
///
/// Runs contract negotiations and transfer processes as lease-based state
/// machines.
#[derive(Parser, Debug)]
#[command(name = "dsc", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output. Repeat for more verbosity (-v, -vv, -vvv).
    /// `RUST_LOG` takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve the configuration (file, then `DSC_*` variables) and print it.
    CheckConfig(CheckConfigArgs),

    /// Negotiate and transfer assets between an in-process consumer and
    /// provider, then print a summary.
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct CheckConfigArgs {
    /// YAML configuration file. A missing file means defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// YAML configuration file. A missing file means defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of assets to negotiate and transfer.
    #[arg(long, default_value_t = 3)]
    transfers: usize,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let result = match cli.command {
        Commands::CheckConfig(args) => run_check_config(&args),
        Commands::Demo(args) => run_demo(&args),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

fn run_check_config(args: &CheckConfigArgs) -> anyhow::Result<u8> {
    let config = ConnectorConfig::load(args.config.as_deref()).context("configuration rejected")?;
    print!("{}", config.to_yaml().context("failed to render configuration")?);
    Ok(0)
}

fn run_demo(args: &DemoArgs) -> anyhow::Result<u8> {
    let config = ConnectorConfig::load(args.config.as_deref()).context("configuration rejected")?;
    tracing::debug!(worker_id = %config.worker_id, transfers = args.transfers, "starting demo");
    let runtime = tokio::runtime::Runtime::new().context("failed to start the async runtime")?;
    let summary = runtime
        .block_on(demo::run(&config, args.transfers, Duration::from_secs(args.timeout_secs)))
        .context("demo failed")?;
    println!("{summary}");
    Ok(if summary.delivered() == summary.transfers.len() { 0 } else { 2 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parse_check_config_without_file() {
        let cli = Cli::try_parse_from(["dsc", "check-config"]).unwrap();
        assert_eq!(cli.verbose, 0);
        if let Commands::CheckConfig(args) = cli.command {
            assert!(args.config.is_none());
        } else {
            panic!("expected check-config");
        }
    }

    #[test]
    fn cli_parse_check_config_with_file() {
        let cli = Cli::try_parse_from(["dsc", "check-config", "--config", "dsc.yaml"]).unwrap();
        if let Commands::CheckConfig(args) = cli.command {
            assert_eq!(args.config, Some(PathBuf::from("dsc.yaml")));
        } else {
            panic!("expected check-config");
        }
    }

    #[test]
    fn cli_parse_demo_defaults() {
        let cli = Cli::try_parse_from(["dsc", "demo"]).unwrap();
        if let Commands::Demo(args) = cli.command {
            assert_eq!(args.transfers, 3);
            assert_eq!(args.timeout_secs, 60);
            assert!(args.config.is_none());
        } else {
            panic!("expected demo");
        }
    }

    #[test]
    fn cli_parse_demo_with_options() {
        let cli = Cli::try_parse_from(["dsc", "-vv", "--json-logs", "demo", "--transfers", "5", "--config", "c.yaml"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.json_logs);
        if let Commands::Demo(args) = cli.command {
            assert_eq!(args.transfers, 5);
            assert_eq!(args.config, Some(PathBuf::from("c.yaml")));
        } else {
            panic!("expected demo");
        }
    }

    #[test]
    fn cli_rejects_non_numeric_transfers() {
        assert!(Cli::try_parse_from(["dsc", "demo", "--transfers", "many"]).is_err());
    }

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["dsc"]).is_err());
    }
}
