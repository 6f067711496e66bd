//! In-process repository with the same semantics as the file store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use worksync_core::{
    ConfigError, Credential, Link, RecordId, SyncConfig, SyncRun, SystemTag, TeamId,
};

use super::{upsert_into, Lease, Repository, SEEN_EVENT_WINDOW};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Default)]
struct State {
    configs: HashMap<TeamId, SyncConfig>,
    links: Vec<Link>,
    cursors: HashMap<(TeamId, SystemTag), String>,
    leases: HashMap<TeamId, Lease>,
    runs: Vec<SyncRun>,
    events: HashMap<TeamId, VecDeque<String>>,
    link_writes: u32,
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let repo = Self::new();
        repo.put_config(config);
        repo
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put_config(&self, config: SyncConfig) {
        self.state().configs.insert(config.team.clone(), config);
    }

    /// Store a link without the uniqueness check, to model corrupted data.
    pub fn insert_link_unchecked(&self, link: Link) {
        self.state().links.push(link);
    }

    /// Number of successful `upsert_link` calls so far.
    pub fn link_writes(&self) -> u32 {
        self.state().link_writes
    }

    pub fn lease(&self, team: &TeamId) -> Option<Lease> {
        self.state().leases.get(team).cloned()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn load_config(&self, team: &TeamId) -> SyncResult<SyncConfig> {
        self.state()
            .configs
            .get(team)
            .cloned()
            .ok_or_else(|| {
                SyncError::Config(ConfigError::TeamNotFound {
                    path: format!("memory://{team}").into(),
                })
            })
    }

    async fn store_credential(
        &self,
        team: &TeamId,
        system: SystemTag,
        credential: &Credential,
    ) -> SyncResult<()> {
        let mut state = self.state();
        let config = state.configs.get_mut(team).ok_or_else(|| {
            SyncError::Config(ConfigError::TeamNotFound {
                path: format!("memory://{team}").into(),
            })
        })?;
        config.set_credential(system, credential.clone());
        Ok(())
    }

    async fn find_link(
        &self,
        team: &TeamId,
        system: SystemTag,
        id: &RecordId,
    ) -> SyncResult<Option<Link>> {
        Ok(self
            .state()
            .links
            .iter()
            .find(|l| &l.team == team && l.id_for(system) == id)
            .cloned())
    }

    async fn upsert_link(&self, link: &Link) -> SyncResult<()> {
        let mut state = self.state();
        upsert_into(&mut state.links, link)?;
        state.link_writes += 1;
        Ok(())
    }

    async fn list_links(&self, team: &TeamId) -> SyncResult<Vec<Link>> {
        Ok(self
            .state()
            .links
            .iter()
            .filter(|l| &l.team == team)
            .cloned()
            .collect())
    }

    async fn load_cursor(&self, team: &TeamId, system: SystemTag) -> SyncResult<Option<String>> {
        Ok(self.state().cursors.get(&(team.clone(), system)).cloned())
    }

    async fn save_cursor(&self, team: &TeamId, system: SystemTag, cursor: &str) -> SyncResult<()> {
        self.state()
            .cursors
            .insert((team.clone(), system), cursor.to_string());
        Ok(())
    }

    async fn acquire_lock(&self, team: &TeamId, holder: &str, ttl: Duration) -> SyncResult<bool> {
        let mut state = self.state();
        if let Some(lease) = state.leases.get(team) {
            if !lease.is_expired(Utc::now()) && lease.holder != holder {
                return Ok(false);
            }
        }
        state.leases.insert(team.clone(), Lease::new(holder, ttl));
        Ok(true)
    }

    async fn release_lock(&self, team: &TeamId, holder: &str) -> SyncResult<()> {
        let mut state = self.state();
        if state.leases.get(team).map(|l| l.holder.as_str()) == Some(holder) {
            state.leases.remove(team);
        }
        Ok(())
    }

    async fn append_run_record(&self, run: &SyncRun) -> SyncResult<()> {
        self.state().runs.push(run.clone());
        Ok(())
    }

    async fn finalize_run_record(&self, run: &SyncRun) -> SyncResult<()> {
        let mut state = self.state();
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| SyncError::RunNotFound(run.id.clone()))?;
        if stored.is_finalized() {
            return Err(SyncError::RunFinalized(run.id.clone()));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn list_runs(&self, team: &TeamId) -> SyncResult<Vec<SyncRun>> {
        let mut runs: Vec<SyncRun> = self
            .state()
            .runs
            .iter()
            .filter(|r| &r.team == team)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    async fn is_event_seen(
        &self,
        team: &TeamId,
        system: SystemTag,
        event_id: &str,
    ) -> SyncResult<bool> {
        let key = format!("{}:{event_id}", system.as_str());
        Ok(self
            .state()
            .events
            .get(team)
            .is_some_and(|seen| seen.contains(&key)))
    }

    async fn mark_event_seen(
        &self,
        team: &TeamId,
        system: SystemTag,
        event_id: &str,
    ) -> SyncResult<bool> {
        let key = format!("{}:{event_id}", system.as_str());
        let mut state = self.state();
        let seen = state.events.entry(team.clone()).or_default();
        if seen.contains(&key) {
            return Ok(false);
        }
        seen.push_back(key);
        while seen.len() > SEEN_EVENT_WINDOW {
            seen.pop_front();
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worksync_core::{Direction, RunOutcome, Trigger};

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let repo = MemoryRepository::new();
        let team = TeamId::from("t");
        let ttl = Duration::from_secs(60);
        assert!(repo.acquire_lock(&team, "run-1", ttl).await.unwrap());
        assert!(!repo.acquire_lock(&team, "run-2", ttl).await.unwrap());
        repo.release_lock(&team, "run-1").await.unwrap();
        assert!(repo.acquire_lock(&team, "run-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let repo = MemoryRepository::new();
        let team = TeamId::from("t");
        assert!(repo.acquire_lock(&team, "crashed", Duration::ZERO).await.unwrap());
        assert!(repo
            .acquire_lock(&team, "fresh", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(repo.lease(&team).unwrap().holder, "fresh");
    }

    #[tokio::test]
    async fn finalized_runs_are_immutable() {
        let repo = MemoryRepository::new();
        let mut run = SyncRun::start(TeamId::from("t"), Trigger::Manual, Direction::Both, false);
        repo.append_run_record(&run).await.unwrap();
        run.finalize(RunOutcome::Completed);
        repo.finalize_run_record(&run).await.unwrap();
        assert!(matches!(
            repo.finalize_run_record(&run).await,
            Err(SyncError::RunFinalized(_))
        ));
    }

    #[tokio::test]
    async fn replayed_event_is_reported() {
        let repo = MemoryRepository::new();
        let team = TeamId::from("t");
        assert!(!repo.is_event_seen(&team, SystemTag::A, "e1").await.unwrap());
        assert!(repo.mark_event_seen(&team, SystemTag::A, "e1").await.unwrap());
        assert!(repo.is_event_seen(&team, SystemTag::A, "e1").await.unwrap());
        assert!(!repo.mark_event_seen(&team, SystemTag::A, "e1").await.unwrap());
        // Same id from the other system is a different event.
        assert!(repo.mark_event_seen(&team, SystemTag::B, "e1").await.unwrap());
    }
}
