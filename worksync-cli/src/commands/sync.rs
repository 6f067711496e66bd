//! `worksync sync` — run one cursor-based pass for a team.

use anyhow::{bail, Context, Result};
use clap::Args;

use worksync_core::{AbortReason, Direction, RunOutcome, TeamId};
use worksync_engine::RunRequest;

use super::{home, orchestrator, print_json, print_report, runtime, RunJson};

/// Arguments for `worksync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Team to sync.
    pub team: String,

    /// a-to-b | b-to-a | both. Defaults to the team's scheduled direction.
    #[arg(long, value_name = "DIRECTION")]
    pub direction: Option<Direction>,

    /// Plan and report without writing to either system.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let team = TeamId::from(self.team);

        let mut request = RunRequest::manual(team.clone()).with_dry_run(self.dry_run);
        if let Some(direction) = self.direction {
            request = request.with_direction(direction);
        }

        let report = runtime()?
            .block_on(orchestrator(&home).run(request))
            .with_context(|| format!("sync failed for team '{team}'"))?;

        if self.json {
            print_json(&RunJson::from(&report))?;
        } else {
            print_report(&report);
        }

        match &report.run.outcome {
            // Another run owns the lease; this is contention, not failure.
            RunOutcome::Aborted {
                reason: AbortReason::AlreadyRunning,
            } => Ok(()),
            RunOutcome::Aborted { reason } => {
                bail!("run {} for team '{team}' aborted: {reason}", report.run.id)
            }
            _ => Ok(()),
        }
    }
}
