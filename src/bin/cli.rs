//! Binary entry point for the docql fixture runner.
#![forbid(unsafe_code)]

use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docql::{
    cli::{self, Fixture},
    query::QueryStatus,
    telemetry, EngineConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "docql",
    version,
    about = "Plan and run document queries against JSON fixtures",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Engine configuration (TOML); overrides the fixture's config"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "DIRECTIVE",
        env = "DOCQL_LOG",
        default_value = "docql=warn",
        help = "Default tracing filter when RUST_LOG is unset"
    )]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the plan chosen for a fixture's query")]
    Explain {
        #[arg(value_name = "FIXTURE", help = "Fixture file (JSON)")]
        fixture: PathBuf,

        #[arg(long, help = "Print the explain tree as JSON")]
        json: bool,
    },

    #[command(about = "Plan and execute a fixture's query")]
    Run {
        #[arg(value_name = "FIXTURE", help = "Fixture file (JSON)")]
        fixture: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(QueryStatus::Success) => {}
        Ok(_) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<QueryStatus, Box<dyn Error>> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log);
    let explicit = cli.config.as_ref().map(EngineConfig::load).transpose()?;

    match cli.command {
        Command::Explain { fixture, json } => {
            let fixture = Fixture::load(&fixture)?;
            let config = fixture.engine_config(explicit.as_ref())?;
            let out = cli::explain(&fixture, &config)?;
            let mut stdout = io::stdout().lock();
            if json {
                serde_json::to_writer_pretty(&mut stdout, &out.explain)?;
                writeln!(stdout)?;
            } else {
                write!(stdout, "{}", out.explain.root)?;
                writeln!(stdout, "plan_hash: {:016x}", out.plan_hash)?;
            }
            Ok(QueryStatus::Success)
        }
        Command::Run { fixture } => {
            let fixture = Fixture::load(&fixture)?;
            let config = fixture.engine_config(explicit.as_ref())?;
            let out = cli::run(&fixture, &config).await?;
            {
                let mut stdout = io::stdout().lock();
                for row in out.rows_json() {
                    serde_json::to_writer(&mut stdout, &row)?;
                    writeln!(stdout)?;
                }
            }
            let summary = out.summary();
            eprint!("{summary}");
            Ok(summary.status)
        }
    }
}
