//! `worksync history` — recorded runs for a team.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use worksync_core::{RunOutcome, SyncRun, TeamId};
use worksync_engine::Repository;

use super::{home, outcome_label, print_json, repository, runtime};

#[derive(Args, Debug)]
pub struct HistoryArgs {
    pub team: String,

    /// Show at most this many runs.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "run")]
    id: String,
    #[tabled(rename = "started")]
    started: String,
    #[tabled(rename = "trigger")]
    trigger: String,
    #[tabled(rename = "direction")]
    direction: String,
    #[tabled(rename = "created")]
    created: u32,
    #[tabled(rename = "updated")]
    updated: u32,
    #[tabled(rename = "deleted")]
    deleted: u32,
    #[tabled(rename = "skipped")]
    skipped: u32,
    #[tabled(rename = "errors")]
    errors: u32,
    #[tabled(rename = "outcome")]
    outcome: String,
}

impl From<&SyncRun> for RunRow {
    fn from(run: &SyncRun) -> Self {
        let trigger = run.trigger.to_string();
        Self {
            id: run.id.0.chars().take(8).collect(),
            started: run
                .started_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            trigger: if run.dry_run {
                format!("{trigger} (dry-run)")
            } else {
                trigger
            },
            direction: run.direction.to_string(),
            created: run.created,
            updated: run.updated,
            deleted: run.deleted,
            skipped: run.skipped,
            errors: run.error_count,
            outcome: outcome_label(&run.outcome),
        }
    }
}

impl HistoryArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let team = TeamId::from(self.team);

        let mut runs = runtime()?
            .block_on(repository(&home).list_runs(&team))
            .with_context(|| format!("failed to load history for team '{team}'"))?;
        runs.truncate(self.limit);

        if self.json {
            return print_json(&runs);
        }

        if runs.is_empty() {
            println!("No runs recorded for team '{team}'.");
            return Ok(());
        }

        let aborted = runs
            .iter()
            .filter(|r| matches!(r.outcome, RunOutcome::Aborted { .. }))
            .count();
        println!(
            "{} | {} runs | {} aborted",
            team.to_string().bold(),
            runs.len(),
            aborted
        );
        let mut table = Table::new(runs.iter().map(RunRow::from));
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
