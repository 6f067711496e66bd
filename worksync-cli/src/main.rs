//! worksync — two-way work item sync between a tracker and a property database.
//!
//! # Usage
//!
//! ```text
//! worksync init <team>
//! worksync sync <team> [--direction a-to-b|b-to-a|both] [--dry-run] [--json]
//! worksync webhook <team> --from a|b <payload-file> [--json]
//! worksync history <team> [--limit N] [--json]
//! worksync links <team> [--json]
//! worksync daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use commands::{
    daemon::DaemonCommand, history::HistoryArgs, init::InitArgs, links::LinksArgs,
    sync::SyncArgs, webhook::WebhookArgs,
};
use worksync_core::SystemTag;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "worksync",
    version,
    about = "Keep work items in sync between a work-item tracker and a property database",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scaffold a team config under ~/.worksync/teams/.
    Init(InitArgs),

    /// Run one sync pass for a team.
    Sync(SyncArgs),

    /// Apply a single webhook delivery read from a file.
    Webhook(WebhookArgs),

    /// Show recorded runs for a team, newest first.
    History(HistoryArgs),

    /// Show the record links for a team.
    Links(LinksArgs),

    /// Manage the background scheduler daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared SystemTag argument
// ---------------------------------------------------------------------------

/// `a` (work-item tracker) or `b` (property database).
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SystemArg {
    A,
    B,
}

impl From<SystemArg> for SystemTag {
    fn from(arg: SystemArg) -> Self {
        match arg {
            SystemArg::A => SystemTag::A,
            SystemArg::B => SystemTag::B,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Sync(args) => args.run(),
        Commands::Webhook(args) => args.run(),
        Commands::History(args) => args.run(),
        Commands::Links(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

/// Logs go to stderr so `--json` output on stdout stays parseable.
fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
