//! Filesystem repository rooted at `<home>/.worksync/`.
//!
//! ```text
//! teams/<team>.yaml          config (owned by worksync-core)
//! links/<team>.json          Vec<Link>
//! cursors/<team>.json        {"a": "...", "b": "..."}
//! history/<team>/<id>.json   one SyncRun per file
//! locks/<team>.lock          Lease
//! events/<team>.json         recently seen webhook event keys
//! ```
//!
//! Every document is written to a `.tmp` sibling and renamed into place.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use worksync_core::{
    config_store, Credential, Link, RecordId, SyncConfig, SyncRun, SystemTag, TeamId,
};

use super::{upsert_into, Lease, Repository, SEEN_EVENT_WINDOW};
use crate::error::{io_err, SyncError, SyncResult};

#[derive(Debug)]
pub struct FileRepository {
    home: PathBuf,
    // Serialises read-modify-write cycles within this process.
    write_guard: Mutex<()>,
}

impl FileRepository {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// Repository rooted at the user's home directory.
    pub fn open_default() -> SyncResult<Self> {
        Ok(Self::new(config_store::home()?))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn root(&self) -> PathBuf {
        config_store::root_at(&self.home)
    }

    pub fn links_path(&self, team: &TeamId) -> PathBuf {
        self.root().join("links").join(format!("{team}.json"))
    }

    pub fn cursors_path(&self, team: &TeamId) -> PathBuf {
        self.root().join("cursors").join(format!("{team}.json"))
    }

    pub fn history_dir(&self, team: &TeamId) -> PathBuf {
        self.root().join("history").join(&team.0)
    }

    pub fn lock_path(&self, team: &TeamId) -> PathBuf {
        self.root().join("locks").join(format!("{team}.lock"))
    }

    pub fn events_path(&self, team: &TeamId) -> PathBuf {
        self.root().join("events").join(format!("{team}.json"))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_path(&self, run: &SyncRun) -> PathBuf {
        self.history_dir(&run.team).join(format!("{}.json", run.id))
    }

    fn read_lease(&self, path: &Path) -> SyncResult<Option<Lease>> {
        match read_json::<Lease>(path) {
            Ok(lease) => Ok(lease),
            // A half-written or garbled lock is treated as abandoned.
            Err(SyncError::Json(e)) => {
                warn!(path = %path.display(), error = %e, "unreadable lock file, treating as expired");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn load_config(&self, team: &TeamId) -> SyncResult<SyncConfig> {
        Ok(config_store::load_at(&self.home, team)?)
    }

    async fn store_credential(
        &self,
        team: &TeamId,
        system: SystemTag,
        credential: &Credential,
    ) -> SyncResult<()> {
        let _guard = self.guard();
        config_store::store_credential_at(&self.home, team, system, credential.clone())?;
        Ok(())
    }

    async fn find_link(
        &self,
        team: &TeamId,
        system: SystemTag,
        id: &RecordId,
    ) -> SyncResult<Option<Link>> {
        let links: Vec<Link> = read_json(&self.links_path(team))?.unwrap_or_default();
        Ok(links.into_iter().find(|l| l.id_for(system) == id))
    }

    async fn upsert_link(&self, link: &Link) -> SyncResult<()> {
        let _guard = self.guard();
        let path = self.links_path(&link.team);
        let mut links: Vec<Link> = read_json(&path)?.unwrap_or_default();
        upsert_into(&mut links, link)?;
        write_json(&path, &links)
    }

    async fn list_links(&self, team: &TeamId) -> SyncResult<Vec<Link>> {
        Ok(read_json(&self.links_path(team))?.unwrap_or_default())
    }

    async fn load_cursor(&self, team: &TeamId, system: SystemTag) -> SyncResult<Option<String>> {
        let mut cursors: BTreeMap<SystemTag, String> =
            read_json(&self.cursors_path(team))?.unwrap_or_default();
        Ok(cursors.remove(&system))
    }

    async fn save_cursor(&self, team: &TeamId, system: SystemTag, cursor: &str) -> SyncResult<()> {
        let _guard = self.guard();
        let path = self.cursors_path(team);
        let mut cursors: BTreeMap<SystemTag, String> = read_json(&path)?.unwrap_or_default();
        cursors.insert(system, cursor.to_string());
        write_json(&path, &cursors)
    }

    async fn acquire_lock(&self, team: &TeamId, holder: &str, ttl: Duration) -> SyncResult<bool> {
        let _guard = self.guard();
        let path = self.lock_path(team);
        ensure_parent(&path)?;
        let lease = Lease::new(holder, ttl);

        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let json = serde_json::to_vec_pretty(&lease)?;
                file.write_all(&json).map_err(|e| io_err(&path, e))?;
                debug!(team = %team, holder, "lock acquired");
                return Ok(true);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(io_err(&path, e)),
        }

        if let Some(current) = self.read_lease(&path)? {
            if current.holder != holder && !current.is_expired(Utc::now()) {
                debug!(team = %team, holder = %current.holder, "lock held");
                return Ok(false);
            }
            if current.holder != holder {
                warn!(team = %team, stale = %current.holder, "taking over expired lock");
            }
        }

        // Rewrite, then read back: another process may have raced us here.
        write_json(&path, &lease)?;
        Ok(self
            .read_lease(&path)?
            .is_some_and(|written| written.holder == holder))
    }

    async fn release_lock(&self, team: &TeamId, holder: &str) -> SyncResult<()> {
        let _guard = self.guard();
        let path = self.lock_path(team);
        match self.read_lease(&path)? {
            Some(lease) if lease.holder != holder => {
                warn!(team = %team, holder, owner = %lease.holder, "not releasing a lock we do not own");
                Ok(())
            }
            None if !path.exists() => Ok(()),
            _ => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(&path, e)),
            },
        }
    }

    async fn append_run_record(&self, run: &SyncRun) -> SyncResult<()> {
        write_json(&self.run_path(run), run)
    }

    async fn finalize_run_record(&self, run: &SyncRun) -> SyncResult<()> {
        let _guard = self.guard();
        let path = self.run_path(run);
        let stored: SyncRun =
            read_json(&path)?.ok_or_else(|| SyncError::RunNotFound(run.id.clone()))?;
        if stored.is_finalized() {
            return Err(SyncError::RunFinalized(run.id.clone()));
        }
        write_json(&path, run)
    }

    async fn list_runs(&self, team: &TeamId) -> SyncResult<Vec<SyncRun>> {
        let dir = self.history_dir(team);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_err(&dir, e))? {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match read_json::<SyncRun>(&path) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn is_event_seen(
        &self,
        team: &TeamId,
        system: SystemTag,
        event_id: &str,
    ) -> SyncResult<bool> {
        let _guard = self.guard();
        let key = format!("{}:{event_id}", system.as_str());
        let seen: VecDeque<String> = read_json(&self.events_path(team))?.unwrap_or_default();
        Ok(seen.contains(&key))
    }

    async fn mark_event_seen(
        &self,
        team: &TeamId,
        system: SystemTag,
        event_id: &str,
    ) -> SyncResult<bool> {
        let _guard = self.guard();
        let path = self.events_path(team);
        let key = format!("{}:{event_id}", system.as_str());
        let mut seen: VecDeque<String> = read_json(&path)?.unwrap_or_default();
        if seen.contains(&key) {
            return Ok(false);
        }
        seen.push_back(key);
        while seen.len() > SEEN_EVENT_WINDOW {
            seen.pop_front();
        }
        write_json(&path, &seen)?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_parent(path: &Path) -> SyncResult<()> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("path has no parent")));
    };
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(|e| io_err(dir, e))?;
    }
    Ok(())
}

/// `Ok(None)` when the file does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> SyncResult<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path, e)),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// Serialize → `<file>.tmp` → `chmod 0600` → rename.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> SyncResult<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .map_err(|e| io_err(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}
