mod commands;
mod config;
mod coord;
mod error;
mod subprocess;
mod telemetry;
mod template;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::assign::AssignArgs;
use commands::cancel::CancelArgs;
use commands::init::InitArgs;
use commands::memory::MemoryCommand;
use commands::plan::PlanArgs;
use commands::report::ReportArgs;
use commands::start::StartArgs;
use commands::status::StatusArgs;
use commands::submit::SubmitArgs;
use commands::validate::ValidateArgs;
use commands::watch::WatchArgs;
use commands::worker::WorkerCommand;

#[derive(Debug, Parser)]
#[command(
    name = "relay",
    version,
    about = "Memory-aware task coordination for capacity-limited workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize a new relay project
    Init(InitArgs),
    /// Submit a task: score its complexity and record it in the ledger
    Submit(SubmitArgs),
    /// Compute (or recompute) the assignment plan for a task
    Plan(PlanArgs),
    /// Hand a task to a worker, handing off memory when the plan needs it
    Assign(AssignArgs),
    /// Mark an assigned attempt as started
    Start(StartArgs),
    /// Record the outcome of the open attempt
    Report(ReportArgs),
    /// Record an independent verdict on reported work
    Validate(ValidateArgs),
    /// Cancel a task and its open attempt
    Cancel(CancelArgs),
    /// Show tasks, or one task in detail
    Status(StatusArgs),
    /// Close attempts that outlive the attempt timeout
    Watch(WatchArgs),
    /// Compress and inspect external memory snapshots
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Inspect worker types and adjust their capacity modifiers
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Print the JSON Schema for .relay.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Submit(_) => "submit",
            Self::Plan(_) => "plan",
            Self::Assign(_) => "assign",
            Self::Start(_) => "start",
            Self::Report(_) => "report",
            Self::Validate(_) => "validate",
            Self::Cancel(_) => "cancel",
            Self::Status(_) => "status",
            Self::Watch(_) => "watch",
            Self::Memory { .. } => "memory",
            Self::Worker { .. } => "worker",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Init(args) => args.execute(),
        Commands::Submit(args) => args.execute(),
        Commands::Plan(args) => args.execute(),
        Commands::Assign(args) => args.execute(),
        Commands::Start(args) => args.execute(),
        Commands::Report(args) => args.execute(),
        Commands::Validate(args) => args.execute(),
        Commands::Cancel(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Watch(args) => args.execute(),
        Commands::Memory { command } => command.execute(),
        Commands::Worker { command } => command.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
