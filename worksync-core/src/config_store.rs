//! Per-team YAML config store.
//!
//! # Storage layout
//!
//! ```text
//! ~/.worksync/
//!   teams/
//!     <team>.yaml   (one file per team — mode 0600, holds credentials)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use crate::config::{
    Credential, FieldKind, FieldMapping, MappingEntry, ScheduleConfig, SourceAConfig,
    SourceBConfig, SyncConfig, DEFAULT_LOCK_TTL_SECS, DEFAULT_RUN_TIMEOUT_SECS, DESCRIPTION_KEY,
    STATE_KEY, TITLE_KEY,
};
use crate::error::ConfigError;
use crate::types::{SystemTag, TeamId};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.worksync`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".worksync")
}

/// `<home>/.worksync/teams/`
///
/// Creates the directory (mode `0700`) if it does not yet exist.
pub fn teams_dir_at(home: &Path) -> Result<PathBuf, ConfigError> {
    let dir = root_at(home).join("teams");
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

/// `<home>/.worksync/teams/<team>.yaml` — pure, no I/O.
pub fn team_path_at(home: &Path, team: &TeamId) -> PathBuf {
    root_at(home).join("teams").join(format!("{}.yaml", team.0))
}

/// Lists every configured team, sorted by name.
pub fn list_teams_at(home: &Path) -> Result<Vec<TeamId>, ConfigError> {
    let dir = root_at(home).join("teams");
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut teams: Vec<TeamId> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_suffix(".yaml").map(TeamId::from)
        })
        .collect();
    teams.sort();
    Ok(teams)
}

/// `list_teams_at` convenience wrapper.
pub fn list_teams() -> Result<Vec<TeamId>, ConfigError> {
    list_teams_at(&home()?)
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate a team's config.
///
/// Returns `ConfigError::TeamNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML.
pub fn load_at(home: &Path, team: &TeamId) -> Result<SyncConfig, ConfigError> {
    let path = team_path_at(home, team);
    if !path.exists() {
        return Err(ConfigError::TeamNotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })?;
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load(team: &TeamId) -> Result<SyncConfig, ConfigError> {
    load_at(&home()?, team)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save a team config.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    teams_dir_at(home)?;
    let path = team_path_at(home, &config.team);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", config.team.0));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &SyncConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

/// Replace one system's credential and persist, leaving every other field
/// untouched. This is the only write path used during a run.
pub fn store_credential_at(
    home: &Path,
    team: &TeamId,
    system: SystemTag,
    credential: Credential,
) -> Result<(), ConfigError> {
    let mut config = load_at(home, team)?;
    config.set_credential(system, credential);
    save_at(home, &config)
}

// ---------------------------------------------------------------------------
// 4. Init
// ---------------------------------------------------------------------------

/// Scaffold a config with placeholder endpoints and a starter mapping.
pub fn scaffold(team: TeamId) -> SyncConfig {
    SyncConfig {
        team,
        primary: SystemTag::A,
        propagate_deletes: false,
        schedule: ScheduleConfig::default(),
        run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
        lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
        source_a: SourceAConfig {
            base_url: "https://tracker.example.com/org".to_string(),
            project: "Project".to_string(),
            work_item_type: "Task".to_string(),
            credential: Credential::bearer("replace-me"),
        },
        source_b: SourceBConfig {
            base_url: "https://api.pages.example.com".to_string(),
            database_id: "replace-me".to_string(),
            credential: Credential::bearer("replace-me"),
        },
        mapping: FieldMapping::new(vec![
            MappingEntry::new(TITLE_KEY, "System.Title", "Name", FieldKind::Text),
            MappingEntry::new(STATE_KEY, "System.State", "Status", FieldKind::Select)
                .with_value("New", "Not started")
                .with_value("Active", "In progress")
                .with_value("Resolved", "Done"),
            MappingEntry::new(
                DESCRIPTION_KEY,
                "System.Description",
                "Description",
                FieldKind::Text,
            ),
            MappingEntry::new("area", "System.AreaPath", "Area", FieldKind::Path),
        ]),
    }
}

/// Create `<home>/.worksync/teams/<team>.yaml` from [`scaffold`].
///
/// Idempotent: if the file already exists, loads and returns it unchanged.
pub fn init_at(home: &Path, team: TeamId) -> Result<SyncConfig, ConfigError> {
    let path = team_path_at(home, &team);
    if path.exists() {
        return load_at(home, &team);
    }
    let config = scaffold(team);
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init(team: TeamId) -> Result<SyncConfig, ConfigError> {
    init_at(&home()?, team)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn team() -> TeamId {
        TeamId::from("platform")
    }

    #[test]
    fn team_path_is_correct() {
        let home = TempDir::new().unwrap();
        let path = team_path_at(home.path(), &team());
        assert!(path.ends_with(".worksync/teams/platform.yaml"));
    }

    #[test]
    fn init_then_load_roundtrip() {
        let home = TempDir::new().unwrap();
        let created = init_at(home.path(), team()).expect("init");
        let loaded = load_at(home.path(), &team()).expect("load");
        assert_eq!(created, loaded);
    }

    #[test]
    fn init_is_idempotent() {
        let home = TempDir::new().unwrap();
        let mut first = init_at(home.path(), team()).expect("init");
        first.propagate_deletes = true;
        save_at(home.path(), &first).expect("save");

        let second = init_at(home.path(), team()).expect("re-init");
        assert!(second.propagate_deletes, "re-init must not overwrite");
    }

    #[test]
    fn tmp_file_removed_after_save() {
        let home = TempDir::new().unwrap();
        init_at(home.path(), team()).expect("init");
        let tmp = team_path_at(home.path(), &team()).with_file_name("platform.yaml.tmp");
        assert!(!tmp.exists());
    }

    #[test]
    #[cfg(unix)]
    fn config_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let home = TempDir::new().unwrap();
        init_at(home.path(), team()).expect("init");
        let mode = std::fs::metadata(team_path_at(home.path(), &team()))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn load_missing_team_returns_not_found() {
        let home = TempDir::new().unwrap();
        let err = load_at(home.path(), &team()).unwrap_err();
        assert!(matches!(err, ConfigError::TeamNotFound { .. }));
    }

    #[test]
    fn store_credential_replaces_only_that_system() {
        let home = TempDir::new().unwrap();
        let before = init_at(home.path(), team()).expect("init");
        store_credential_at(
            home.path(),
            &team(),
            SystemTag::B,
            Credential::bearer("fresh"),
        )
        .expect("store");
        let after = load_at(home.path(), &team()).expect("load");
        assert_eq!(after.source_b.credential.access_token, "fresh");
        assert_eq!(after.source_a, before.source_a);
        assert_eq!(after.mapping, before.mapping);
    }

    #[test]
    fn list_teams_sorted() {
        let home = TempDir::new().unwrap();
        for name in ["zeta", "alpha", "mid"] {
            init_at(home.path(), TeamId::from(name)).expect("init");
        }
        let teams = list_teams_at(home.path()).expect("list");
        let names: Vec<_> = teams.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
