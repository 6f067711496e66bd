pub mod daemon;
pub mod history;
pub mod init;
pub mod links;
pub mod sync;
pub mod webhook;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;

use worksync_core::{IssueLevel, RunOutcome, RunResult, RunIssue, SupersededChange};
use worksync_engine::{
    FileRepository, HttpConnectorFactory, OAuthRefresher, Orchestrator, Repository, RunReport,
};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

pub(crate) fn repository(home: &Path) -> Arc<FileRepository> {
    Arc::new(FileRepository::new(home))
}

/// Orchestrator over the file repository and the REST connectors.
pub(crate) fn orchestrator(home: &Path) -> Orchestrator {
    Orchestrator::new(
        repository(home) as Arc<dyn Repository>,
        Arc::new(HttpConnectorFactory::default()),
        Arc::new(OAuthRefresher::new()),
    )
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

pub(crate) fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Running => "running".to_string(),
        RunOutcome::Completed => "completed".to_string(),
        RunOutcome::Aborted { reason } => format!("aborted: {reason}"),
    }
}

/// `{history_id, result}` plus the audit detail a caller may want.
#[derive(Serialize)]
pub(crate) struct RunJson<'a> {
    #[serde(flatten)]
    result: RunResult,
    #[serde(flatten)]
    outcome: &'a RunOutcome,
    deleted: u32,
    dry_run: bool,
    errors: &'a [RunIssue],
    superseded: &'a [SupersededChange],
}

impl<'a> From<&'a RunReport> for RunJson<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            result: report.result(),
            outcome: &report.run.outcome,
            deleted: report.run.deleted,
            dry_run: report.run.dry_run,
            errors: &report.run.errors,
            superseded: &report.run.superseded,
        }
    }
}

/// Human-readable rendering of a finished run.
pub(crate) fn print_report(report: &RunReport) {
    let run = &report.run;
    let prefix = if run.dry_run { "[dry-run] " } else { "" };

    if let RunOutcome::Aborted { reason } = &run.outcome {
        println!("{prefix}{} team '{}' run aborted: {reason}", "✗".red(), run.team);
    } else {
        println!(
            "{prefix}{} team '{}' synced ({} created, {} updated, {} deleted, {} skipped, {} errors)",
            "✓".green(),
            run.team,
            run.created,
            run.updated,
            run.deleted,
            run.skipped,
            run.error_count,
        );
    }

    for entry in report
        .plan
        .entries
        .iter()
        .filter(|e| e.classification.is_mutation())
    {
        println!("{prefix}  ~  {entry}");
    }
    for change in &run.superseded {
        println!(
            "  {}  {} superseded by {}",
            "⇄".yellow(),
            change.loser,
            change.winner
        );
    }
    for issue in &run.errors {
        let marker = match issue.level {
            IssueLevel::Warning => "!".yellow(),
            IssueLevel::Error => "✗".red(),
        };
        match &issue.record {
            Some(record) => println!("  {marker}  {record}: {}", issue.message),
            None => println!("  {marker}  {}", issue.message),
        }
    }
    println!("  history: {}", run.id);
}
