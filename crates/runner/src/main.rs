//! FlowSeal CLI - Main Entry Point

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use flowseal_common::IntegrityMode;
use flowseal_runner::{
    verify_deliverable, FlowRunner, PlaywrightConfig, PlaywrightLauncher, RunnerConfig,
};

/// Exit code for failures outside the run itself
const EXIT_INFRASTRUCTURE: i32 = 2;

/// FlowSeal - scripted web flows with sealed evidence packets
#[derive(Parser)]
#[command(name = "flowseal")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow plan and seal its evidence packet
    Run {
        /// Plan file (YAML or JSON)
        #[arg(long)]
        plan: PathBuf,

        /// Configuration file
        #[arg(long, env = "FLOWSEAL_CONFIG", default_value = "flowseal.toml")]
        config: PathBuf,

        /// Override the output root
        #[arg(long)]
        output_root: Option<PathBuf>,

        /// Override the integrity strategy (flat or chained)
        #[arg(long)]
        integrity: Option<IntegrityMode>,

        /// Use a fixed run id instead of a random one
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Re-verify a sealed deliverable directory
    Verify {
        /// Path to the deliverable directory
        deliverable: PathBuf,

        /// Print the full verification report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let code = match execute(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            EXIT_INFRASTRUCTURE
        }
    };
    std::process::exit(code);
}

async fn execute(command: Commands) -> anyhow::Result<i32> {
    match command {
        Commands::Run {
            plan,
            config,
            output_root,
            integrity,
            run_id,
        } => {
            let mut config = RunnerConfig::load(&config)?;
            if let Some(root) = output_root {
                config.output_root = root;
            }
            if let Some(mode) = integrity {
                config.sealing.integrity = mode;
            }

            let launcher = PlaywrightLauncher::new(PlaywrightConfig::from(&config.browser));
            let runner = FlowRunner::new(config, Arc::new(launcher));
            let outcome = runner.run_file(&plan, run_id).await?;

            println!("run:         {}", outcome.run_id);
            println!("status:      {}", outcome.status.as_str());
            if let Some(failure) = &outcome.error {
                println!("error:       {} - {}", failure.kind, failure.message);
            }
            println!("deliverable: {}", outcome.deliverable.display());
            println!("packet hash: {}", outcome.seal.packet_hash);
            Ok(outcome.exit_code())
        }
        Commands::Verify { deliverable, json } => {
            let report = verify_deliverable(&deliverable)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "files verified: {}/{}",
                    report.packet.verified_entries, report.packet.total_entries
                );
                if let Some(chain) = &report.chain {
                    println!("chain entries:  {}", chain.entries);
                }
                for err in &report.errors {
                    println!("  ✗ {}", err);
                }
                println!("{}", if report.passed { "✅ PASSED" } else { "❌ FAILED" });
            }
            Ok(if report.passed { 0 } else { 1 })
        }
    }
}
