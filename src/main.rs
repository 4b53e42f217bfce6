//! devirt CLI
//!
//! Replays JSON scenarios against the devirtualization core and prints cast plans.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use devirt::casts::CastOp;
use devirt::config::JitOptions;
use devirt::scenario::Scenario;
use devirt::VERSION;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "devirt")]
#[command(author, version, about = "Speculative devirtualization core: guards, runtime assumptions and patching", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JIT options file (JSON); overrides options embedded in a scenario
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario and print the report
    Run {
        /// The scenario file
        file: PathBuf,
    },

    /// Print the instanceof/checkcast plan for a class of a scenario
    Plan {
        /// The scenario file providing the classes
        file: PathBuf,
        /// Cast class name
        #[arg(short = 'k', long)]
        class: String,
        #[arg(long, value_enum, default_value_t = OpArg::Checkcast)]
        op: OpArg,
        /// The object may be null
        #[arg(long)]
        may_be_null: bool,
    },

    /// Print the effective JIT options as JSON
    Options,
}

#[derive(Clone, Copy, ValueEnum)]
enum OpArg {
    Instanceof,
    Checkcast,
    CheckcastAndNullcheck,
}

impl From<OpArg> for CastOp {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Instanceof => CastOp::InstanceOf,
            OpArg::Checkcast => CastOp::CheckCast,
            OpArg::CheckcastAndNullcheck => CastOp::CheckCastAndNullCheck,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise the level follows the `-v` count
fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("devirt={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_options(config: Option<&Path>, scenario: Option<&Scenario>) -> anyhow::Result<JitOptions> {
    match config {
        Some(path) => JitOptions::from_file(path).with_context(|| format!("loading options from {}", path.display())),
        None => Ok(scenario.and_then(|s| s.options.clone()).unwrap_or_default()),
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run { file } => {
            let scenario = Scenario::from_file(&file).with_context(|| format!("reading {}", file.display()))?;
            let options = load_options(cli.config.as_deref(), Some(&scenario))?;
            let report = scenario.run_with(options)?;
            println!("devirt {}", VERSION);
            println!("{}", report);
        }
        Commands::Plan {
            file,
            class,
            op,
            may_be_null,
        } => {
            let scenario = Scenario::from_file(&file).with_context(|| format!("reading {}", file.display()))?;
            let options = load_options(cli.config.as_deref(), Some(&scenario))?;
            let plan = scenario.plan_cast(options, &class, op.into(), may_be_null)?;
            println!("{}", plan);
        }
        Commands::Options => {
            let options = load_options(cli.config.as_deref(), None)?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
    }
    Ok(())
}
