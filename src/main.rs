use std::process::ExitCode;

use clap::{Parser, Subcommand};

use foreman::commands;
use foreman::commands::init::InitArgs;
use foreman::commands::run::RunArgs;
use foreman::commands::signal::{AbortArgs, ResumeArgs, StopArgs};
use foreman::commands::status::StatusArgs;
use foreman::error::ExitError;
use foreman::telemetry;

#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    version,
    about = "Supervise LLM worker sessions across a label-driven issue pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the daemon control loop
    Run(RunArgs),
    /// Show the persisted daemon state
    Status(StatusArgs),
    /// Ask a running daemon to finish its iteration and exit
    Stop(StopArgs),
    /// Kill an item's session and keep it from being dispatched
    Abort(AbortArgs),
    /// Clear pause and abort markers for an item
    Resume(ResumeArgs),
    /// Write a default .foreman.toml
    Init(InitArgs),
    /// Print the JSON Schema for .foreman.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Run(_) => "run",
            Self::Status(_) => "status",
            Self::Stop(_) => "stop",
            Self::Abort(_) => "abort",
            Self::Resume(_) => "resume",
            Self::Init(_) => "init",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Run(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Stop(args) => args.execute(),
        Commands::Abort(args) => args.execute(),
        Commands::Resume(args) => args.execute(),
        Commands::Init(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
