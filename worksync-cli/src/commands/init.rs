//! `worksync init <team>`

use anyhow::{Context, Result};
use clap::Args;

use worksync_core::{config_store, TeamId};

use super::home;

/// Scaffold a team config with placeholder endpoints and a starter mapping.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Team identifier; becomes ~/.worksync/teams/<team>.yaml
    pub team: String,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let team = TeamId::from(self.team);
        let path = config_store::team_path_at(&home, &team);
        let existed = path.exists();

        let config = config_store::init_at(&home, team.clone())
            .with_context(|| format!("failed to init team '{team}'"))?;

        if existed {
            println!("✓ Team '{}' already initialized", config.team);
        } else {
            println!("✓ Initialized team '{}'", config.team);
        }
        println!("  Config: {}", path.display());
        println!(
            "  {} mapping entries; edit endpoints and credentials, then run `worksync sync {team} --dry-run`",
            config.mapping.entries.len()
        );
        Ok(())
    }
}
