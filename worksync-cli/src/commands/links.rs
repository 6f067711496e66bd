//! `worksync links` — record pairings for a team.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use worksync_core::{Link, LinkStatus, TeamId};
use worksync_engine::Repository;

use super::{home, print_json, repository, runtime};

#[derive(Args, Debug)]
pub struct LinksArgs {
    pub team: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct LinkRow {
    #[tabled(rename = "source a")]
    source_a: String,
    #[tabled(rename = "source b")]
    source_b: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "last synced")]
    updated: String,
}

impl From<&Link> for LinkRow {
    fn from(link: &Link) -> Self {
        Self {
            source_a: link.source_a_id.to_string(),
            source_b: link.source_b_id.to_string(),
            status: match &link.status {
                LinkStatus::Active => "active".to_string(),
                LinkStatus::Broken { reason, .. } => format!("broken: {reason}"),
            },
            updated: link
                .updated_at
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        }
    }
}

impl LinksArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let team = TeamId::from(self.team);

        let links = runtime()?
            .block_on(repository(&home).list_links(&team))
            .with_context(|| format!("failed to load links for team '{team}'"))?;

        if self.json {
            return print_json(&links);
        }

        if links.is_empty() {
            println!("No links for team '{team}' yet.");
            return Ok(());
        }

        let broken = links.iter().filter(|l| l.is_broken()).count();
        println!(
            "{} | {} links | {} broken",
            team.to_string().bold(),
            links.len(),
            broken
        );
        let mut table = Table::new(links.iter().map(LinkRow::from));
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
