pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "closer",
    about = "Closer operator CLI",
    long_about = "Operate the Closer sales assistant: migrations, readiness checks, config \
                  inspection, and read-only views of sessions and the idempotency ledger.",
    after_help = "Examples:\n  closer doctor --json\n  closer session web-42\n  closer ledger sha256:..."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, LLM credentials, DB connectivity, and migration status")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Show the stored conversation state and ledger entries of one session")]
    Session {
        #[arg(help = "Session id as used by the turn endpoints")]
        session_id: String,
    },
    #[command(about = "List stored sessions, most recently active first")]
    Sessions {
        #[arg(long, help = "Only sessions suspended on an operator approval")]
        awaiting_approval: bool,
        #[arg(long, default_value_t = 20, help = "Maximum number of sessions to list")]
        limit: u32,
    },
    #[command(about = "Show one idempotency ledger record by content hash")]
    Ledger {
        #[arg(help = "Content hash, e.g. sha256:<hex>")]
        hash: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Session { session_id } => commands::session::run(&session_id),
        Command::Sessions { awaiting_approval, limit } => {
            commands::session::list(awaiting_approval, limit)
        }
        Command::Ledger { hash } => commands::ledger::run(&hash),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
