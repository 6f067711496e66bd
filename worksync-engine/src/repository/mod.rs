//! Persistence boundary: config, links, cursors, run lock, run history and
//! webhook replay protection.
//!
//! Everything is partitioned by team. Implementations must be durable and
//! strongly consistent for a single team; the engine relies on
//! `upsert_link` rejecting a second counterpart for either side.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use worksync_core::{Credential, Link, RecordId, SyncConfig, SyncRun, SystemTag, TeamId};

use crate::error::{SyncError, SyncResult};

pub mod file;
pub mod memory;

pub use file::FileRepository;
pub use memory::MemoryRepository;

/// Most recent webhook event ids remembered per team.
pub const SEEN_EVENT_WINDOW: usize = 2048;

#[async_trait]
pub trait Repository: Send + Sync {
    async fn load_config(&self, team: &TeamId) -> SyncResult<SyncConfig>;

    /// Replace one system's credential, leaving the rest of the config alone.
    async fn store_credential(
        &self,
        team: &TeamId,
        system: SystemTag,
        credential: &Credential,
    ) -> SyncResult<()>;

    async fn find_link(
        &self,
        team: &TeamId,
        system: SystemTag,
        id: &RecordId,
    ) -> SyncResult<Option<Link>>;

    /// Insert or replace the link keyed by its (A id, B id) pair.
    ///
    /// Fails with [`SyncError::LinkInvariant`] if either id is already linked
    /// to a different counterpart.
    async fn upsert_link(&self, link: &Link) -> SyncResult<()>;

    async fn list_links(&self, team: &TeamId) -> SyncResult<Vec<Link>>;

    async fn load_cursor(&self, team: &TeamId, system: SystemTag) -> SyncResult<Option<String>>;

    async fn save_cursor(&self, team: &TeamId, system: SystemTag, cursor: &str) -> SyncResult<()>;

    /// Try to take the team's run lease. `false` if someone else holds an
    /// unexpired lease.
    async fn acquire_lock(&self, team: &TeamId, holder: &str, ttl: Duration) -> SyncResult<bool>;

    /// Release the lease if `holder` still owns it.
    async fn release_lock(&self, team: &TeamId, holder: &str) -> SyncResult<()>;

    async fn append_run_record(&self, run: &SyncRun) -> SyncResult<()>;

    /// Persist the final state of a run. A run can be finalized once.
    async fn finalize_run_record(&self, run: &SyncRun) -> SyncResult<()>;

    /// Runs for `team`, newest first.
    async fn list_runs(&self, team: &TeamId) -> SyncResult<Vec<SyncRun>>;

    /// Whether a webhook event has already been applied.
    async fn is_event_seen(
        &self,
        team: &TeamId,
        system: SystemTag,
        event_id: &str,
    ) -> SyncResult<bool>;

    /// Record an applied webhook event. `false` if it was already seen.
    async fn mark_event_seen(
        &self,
        team: &TeamId,
        system: SystemTag,
        event_id: &str,
    ) -> SyncResult<bool>;
}

/// A time-bounded claim on a team's run lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Check `candidate` against the links already stored for its team.
pub(crate) fn check_link_invariant(existing: &[Link], candidate: &Link) -> SyncResult<()> {
    for link in existing.iter().filter(|l| l.team == candidate.team) {
        let same_a = link.source_a_id == candidate.source_a_id;
        let same_b = link.source_b_id == candidate.source_b_id;
        if same_a != same_b {
            let message = if same_a {
                format!(
                    "{} is already linked to {}, refusing {}",
                    link.source_a_id, link.source_b_id, candidate.source_b_id
                )
            } else {
                format!(
                    "{} is already linked to {}, refusing {}",
                    link.source_b_id, link.source_a_id, candidate.source_a_id
                )
            };
            return Err(SyncError::LinkInvariant {
                team: candidate.team.clone(),
                message,
            });
        }
    }
    Ok(())
}

/// Insert or replace `link` in `links` after checking the invariant.
pub(crate) fn upsert_into(links: &mut Vec<Link>, link: &Link) -> SyncResult<()> {
    check_link_invariant(links, link)?;
    match links.iter_mut().find(|l| {
        l.team == link.team
            && l.source_a_id == link.source_a_id
            && l.source_b_id == link.source_b_id
    }) {
        Some(existing) => *existing = link.clone(),
        None => links.push(link.clone()),
    }
    Ok(())
}
