//! worksync engine: field mapping, reconciliation and the run state machine.
//!
//! Entry points:
//! - [`Orchestrator::run`] for scheduled and manual runs
//! - [`Orchestrator::run_webhook`] for push-delivered deltas
//!
//! Persistence goes through the [`Repository`] trait; [`FileRepository`]
//! keeps everything under `~/.worksync/`.

pub mod collector;
pub mod credentials;
pub mod error;
pub mod fingerprint;
pub mod mapper;
pub mod orchestrator;
pub mod reconciler;
pub mod repository;

pub use credentials::{ensure_fresh, needs_refresh, OAuthRefresher, TokenRefresher, REFRESH_MARGIN};
pub use error::{SyncError, SyncResult};
pub use fingerprint::fingerprint;
pub use mapper::{FieldMapper, Mapped};
pub use orchestrator::{
    ConnectorFactory, HttpConnectorFactory, Orchestrator, RunReport, RunRequest, WebhookOutcome,
};
pub use reconciler::{Classification, Plan, PlanEntry, PlanSummary, Reconciler};
pub use repository::{FileRepository, Lease, MemoryRepository, Repository};
