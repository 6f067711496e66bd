//! `worksync webhook` — feed one stored webhook delivery through a single-record pass.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};

use worksync_core::{SystemTag, TeamId};
use worksync_engine::WebhookOutcome;

use super::{home, orchestrator, print_json, print_report, runtime, RunJson};
use crate::SystemArg;

#[derive(Args, Debug)]
pub struct WebhookArgs {
    /// Team the delivery belongs to.
    pub team: String,

    /// System that sent the delivery.
    #[arg(long, value_enum)]
    pub from: SystemArg,

    /// File holding the raw JSON payload.
    pub payload: PathBuf,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl WebhookArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let team = TeamId::from(self.team);
        let system = SystemTag::from(self.from);

        let raw = std::fs::read_to_string(&self.payload)
            .with_context(|| format!("could not read payload '{}'", self.payload.display()))?;
        let payload: Value = serde_json::from_str(&raw)
            .with_context(|| format!("payload '{}' is not JSON", self.payload.display()))?;

        let outcome = runtime()?
            .block_on(orchestrator(&home).run_webhook(&team, system, &payload))
            .with_context(|| format!("webhook from {system} failed for team '{team}'"))?;

        match outcome {
            WebhookOutcome::Ignored { reason } => {
                if self.json {
                    print_json(&json!({ "ignored": reason }))?;
                } else {
                    println!("{} webhook ignored: {reason}", "·".bright_black());
                }
            }
            WebhookOutcome::Ran(report) => {
                if self.json {
                    print_json(&RunJson::from(report.as_ref()))?;
                } else {
                    print_report(&report);
                }
            }
        }
        Ok(())
    }
}
