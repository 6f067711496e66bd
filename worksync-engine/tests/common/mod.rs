#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use worksync_connector::{Connector, ConnectorResult, MemoryConnector};
use worksync_core::{
    Credential, FieldKind, FieldMapping, FieldValue, MappingEntry, NativeRecord, RecordId,
    ScheduleConfig, SourceAConfig, SourceBConfig, SyncConfig, SystemTag, TeamId,
};
use worksync_engine::{
    ConnectorFactory, MemoryRepository, Orchestrator, Repository, RunReport, RunRequest,
    SyncError, SyncResult, TokenRefresher,
};

pub const TITLE_A: &str = "System.Title";
pub const STATE_A: &str = "System.State";
pub const AREA_A: &str = "System.AreaPath";
pub const TITLE_B: &str = "Name";
pub const STATE_B: &str = "Status";
pub const AREA_B: &str = "Area";

pub fn team() -> TeamId {
    TeamId::from("acme")
}

pub fn mapping() -> FieldMapping {
    FieldMapping::new(vec![
        MappingEntry::new("title", TITLE_A, TITLE_B, FieldKind::Text),
        MappingEntry::new("state", STATE_A, STATE_B, FieldKind::Select)
            .with_value("New", "Not started")
            .with_value("Active", "In progress")
            .with_value("Resolved", "Done"),
        MappingEntry::new("area", AREA_A, AREA_B, FieldKind::Path),
    ])
}

pub fn config() -> SyncConfig {
    SyncConfig {
        team: team(),
        primary: SystemTag::A,
        propagate_deletes: false,
        schedule: ScheduleConfig::default(),
        run_timeout_secs: 300,
        lock_ttl_secs: 900,
        source_a: SourceAConfig {
            base_url: "https://tracker.test/acme".into(),
            project: "web".into(),
            work_item_type: "Task".into(),
            credential: Credential::bearer("a-token"),
        },
        source_b: SourceBConfig {
            base_url: "https://pages.test".into(),
            database_id: "db-1".into(),
            credential: Credential::bearer("b-token"),
        },
        mapping: mapping(),
    }
}

/// A Source A work item as the remote would report it.
pub fn work_item(id: &str, title: &str, state: &str, at: DateTime<Utc>) -> NativeRecord {
    NativeRecord {
        id: RecordId::from(id),
        fields: [
            (TITLE_A.to_string(), FieldValue::text(title)),
            (STATE_A.to_string(), FieldValue::select(state)),
            (
                AREA_A.to_string(),
                FieldValue::Path(vec!["Platform".into(), "Web".into()]),
            ),
        ]
        .into(),
        modified_at: at,
        deleted: false,
    }
}

/// A Source B page as the remote would report it.
pub fn page(id: &str, title: &str, status: &str, at: DateTime<Utc>) -> NativeRecord {
    NativeRecord {
        id: RecordId::from(id),
        fields: [
            (TITLE_B.to_string(), FieldValue::text(title)),
            (STATE_B.to_string(), FieldValue::select(status)),
        ]
        .into(),
        modified_at: at,
        deleted: false,
    }
}

/// Hands out the same two in-memory connectors for every run.
pub struct StaticFactory {
    pub a: Arc<MemoryConnector>,
    pub b: Arc<MemoryConnector>,
}

impl ConnectorFactory for StaticFactory {
    fn build(
        &self,
        _config: &SyncConfig,
        system: SystemTag,
        _credential: &Credential,
    ) -> ConnectorResult<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match system {
            SystemTag::A => self.a.clone(),
            SystemTag::B => self.b.clone(),
        };
        Ok(connector)
    }
}

/// Refresher that always fails.
pub struct FailingRefresher;

#[async_trait]
impl TokenRefresher for FailingRefresher {
    async fn refresh(&self, system: SystemTag, _credential: &Credential) -> SyncResult<Credential> {
        Err(SyncError::Credential {
            system,
            message: "invalid_grant".into(),
        })
    }
}

pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub a: Arc<MemoryConnector>,
    pub b: Arc<MemoryConnector>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let repo = Arc::new(MemoryRepository::with_config(config));
        let a = Arc::new(MemoryConnector::new(SystemTag::A));
        let b = Arc::new(MemoryConnector::new(SystemTag::B));
        let factory = StaticFactory {
            a: a.clone(),
            b: b.clone(),
        };
        let orchestrator = Orchestrator::new(
            repo.clone() as Arc<dyn Repository>,
            Arc::new(factory),
            Arc::new(FailingRefresher),
        );
        Self {
            repo,
            a,
            b,
            orchestrator,
        }
    }

    pub async fn run(&self) -> RunReport {
        self.orchestrator
            .run(RunRequest::manual(team()))
            .await
            .expect("run")
    }

    pub async fn dry_run(&self) -> RunReport {
        self.orchestrator
            .run(RunRequest::manual(team()).with_dry_run(true))
            .await
            .expect("dry run")
    }

    /// The B id linked to `a_id`.
    pub async fn counterpart(&self, a_id: &str) -> Option<RecordId> {
        self.repo
            .find_link(&team(), SystemTag::A, &RecordId::from(a_id))
            .await
            .expect("find link")
            .map(|l| l.source_b_id)
    }
}
