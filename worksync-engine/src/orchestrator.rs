//! Sync orchestrator: owns one run from trigger to audit record.
//!
//! ```text
//! Pending → Locking → Collecting → Reconciling → Applying → Finalizing
//!                                                          ↘ Completed | Aborted
//! ```
//!
//! Scheduled, manual and webhook runs share this state machine; they differ
//! only in how the initial change set is produced.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use worksync_connector::{
    Connector, ConnectorError, ConnectorResult, PagesConnector, RetryPolicy, WorkItemsConnector,
};
use worksync_core::{
    AbortReason, CanonicalRecord, Credential, Direction, IssueLevel, Link, RecordId, RunIssue,
    RunOutcome, RunResult, SyncConfig, SyncRun, SystemTag, TeamId, Trigger,
};

use crate::collector::{collect_delta, collect_since, Delta};
use crate::credentials::{ensure_fresh, TokenRefresher};
use crate::error::{SyncError, SyncResult};
use crate::mapper::FieldMapper;
use crate::reconciler::{Classification, Plan, PlanEntry, Reconciler};
use crate::repository::Repository;

// ---------------------------------------------------------------------------
// Connector construction
// ---------------------------------------------------------------------------

/// Builds the connector for one side of a team, given a fresh credential.
pub trait ConnectorFactory: Send + Sync {
    fn build(
        &self,
        config: &SyncConfig,
        system: SystemTag,
        credential: &Credential,
    ) -> ConnectorResult<Arc<dyn Connector>>;
}

/// REST connectors for both systems.
#[derive(Debug, Clone, Default)]
pub struct HttpConnectorFactory {
    pub retry: RetryPolicy,
}

impl ConnectorFactory for HttpConnectorFactory {
    fn build(
        &self,
        config: &SyncConfig,
        system: SystemTag,
        credential: &Credential,
    ) -> ConnectorResult<Arc<dyn Connector>> {
        let connector: Arc<dyn Connector> = match system {
            SystemTag::A => Arc::new(
                WorkItemsConnector::new(&config.source_a, credential)?
                    .with_retry(self.retry.clone()),
            ),
            SystemTag::B => Arc::new(
                PagesConnector::new(&config.source_b, credential)?.with_retry(self.retry.clone()),
            ),
        };
        Ok(connector)
    }
}

struct Connectors {
    a: Arc<dyn Connector>,
    b: Arc<dyn Connector>,
}

impl Connectors {
    fn get(&self, system: SystemTag) -> &dyn Connector {
        match system {
            SystemTag::A => self.a.as_ref(),
            SystemTag::B => self.b.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Scheduled or manual trigger input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub team: TeamId,
    /// `None` uses the team's configured schedule direction.
    pub direction: Option<Direction>,
    pub dry_run: bool,
    pub trigger: Trigger,
}

impl RunRequest {
    pub fn scheduled(team: TeamId) -> Self {
        Self {
            team,
            direction: None,
            dry_run: false,
            trigger: Trigger::Scheduled,
        }
    }

    pub fn manual(team: TeamId) -> Self {
        Self {
            trigger: Trigger::Manual,
            ..Self::scheduled(team)
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// A finished run and the plan it executed (or previewed).
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: SyncRun,
    pub plan: Plan,
}

impl RunReport {
    /// Completed with no error-level issue.
    pub fn applied_cleanly(&self) -> bool {
        self.run.outcome == RunOutcome::Completed
            && self.run.errors.iter().all(|i| i.level != IssueLevel::Error)
    }

    pub fn result(&self) -> RunResult {
        self.run.result()
    }
}

#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Ignored { reason: String },
    Ran(Box<RunReport>),
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Where a run's changes come from.
enum Changes {
    Pull,
    Delta {
        record: CanonicalRecord,
        issues: Vec<RunIssue>,
    },
}

/// Per-pass scratch state carried into `Finalizing`.
#[derive(Default)]
struct Pass {
    plan: Plan,
    cursors: Vec<(SystemTag, String)>,
    failed_sides: HashSet<SystemTag>,
}

enum EntryResult {
    Created,
    Updated,
    Deleted,
    Failed(RunIssue),
}

#[derive(Clone)]
pub struct Orchestrator {
    repo: Arc<dyn Repository>,
    connectors: Arc<dyn ConnectorFactory>,
    refresher: Arc<dyn TokenRefresher>,
}

impl Orchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        connectors: Arc<dyn ConnectorFactory>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            repo,
            connectors,
            refresher,
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Run one cursor-based pass for a team.
    ///
    /// Errors only when the team's config cannot be loaded or the run record
    /// cannot be written; every later failure is captured in the returned
    /// run's outcome and issue list.
    pub async fn run(&self, request: RunRequest) -> SyncResult<RunReport> {
        let config = self.repo.load_config(&request.team).await?;
        let direction = request.direction.unwrap_or(config.schedule.direction);
        self.execute(&config, request.trigger, direction, request.dry_run, Changes::Pull)
            .await
    }

    /// Resolve a webhook delivery and, if it carries a change, run a
    /// single-record pass for it.
    pub async fn run_webhook(
        &self,
        team: &TeamId,
        system: SystemTag,
        payload: &Value,
    ) -> SyncResult<WebhookOutcome> {
        let config = self.repo.load_config(team).await?;
        let direction = config.schedule.direction;
        if !direction.reads_from(system) {
            return Ok(WebhookOutcome::Ignored {
                reason: format!("direction {direction} does not read from {system}"),
            });
        }

        let credential = ensure_fresh(
            self.repo.as_ref(),
            self.refresher.as_ref(),
            team,
            system,
            config.credential(system),
        )
        .await?;
        let connector = self.connectors.build(&config, system, &credential)?;
        let mapper = FieldMapper::new(config.mapping.clone());

        let (event_id, record, issues) =
            match collect_delta(connector.as_ref(), &mapper, payload).await? {
                Delta::Ignored { reason } => return Ok(WebhookOutcome::Ignored { reason }),
                Delta::Record {
                    event_id,
                    record,
                    issues,
                } => (event_id, record, issues),
            };

        if self.repo.is_event_seen(team, system, &event_id).await? {
            info!(team = %team, system = %system, event_id = %event_id, "replayed webhook event ignored");
            return Ok(WebhookOutcome::Ignored {
                reason: format!("event {event_id} already processed"),
            });
        }

        let report = self
            .execute(
                &config,
                Trigger::Webhook,
                direction,
                false,
                Changes::Delta { record, issues },
            )
            .await?;

        // Only a clean pass consumes the event; a redelivery retries anything else.
        if report.applied_cleanly() {
            self.repo.mark_event_seen(team, system, &event_id).await?;
        } else {
            warn!(
                team = %team,
                system = %system,
                event_id = %event_id,
                run_id = %report.run.id,
                "webhook run did not apply cleanly; event left open for redelivery"
            );
        }
        Ok(WebhookOutcome::Ran(Box::new(report)))
    }

    async fn execute(
        &self,
        config: &SyncConfig,
        trigger: Trigger,
        direction: Direction,
        dry_run: bool,
        changes: Changes,
    ) -> SyncResult<RunReport> {
        let team = &config.team;
        let is_pull = matches!(changes, Changes::Pull);

        // Pending
        let mut run = SyncRun::start(team.clone(), trigger, direction, dry_run);
        self.repo.append_run_record(&run).await?;
        let holder = run.id.to_string();
        info!(team = %team, run_id = %run.id, direction = %direction, dry_run, "run started");

        // Locking
        let ttl = Duration::from_secs(config.lock_ttl_secs);
        let locked = match self.repo.acquire_lock(team, &holder, ttl).await {
            Ok(locked) => locked,
            Err(e) => {
                error!(team = %team, run_id = %run.id, error = %e, "could not take run lock");
                return self
                    .finish(run, Plan::default(), internal(e))
                    .await;
            }
        };
        if !locked {
            info!(team = %team, run_id = %run.id, "another run holds the lock");
            return self
                .finish(
                    run,
                    Plan::default(),
                    RunOutcome::Aborted {
                        reason: AbortReason::AlreadyRunning,
                    },
                )
                .await;
        }

        let mut pass = Pass::default();
        let outcome = self
            .drive(config, &mut run, &mut pass, direction, dry_run, changes)
            .await;

        // Finalizing
        if let Err(e) = self.repo.release_lock(team, &holder).await {
            error!(team = %team, run_id = %run.id, error = %e, "failed to release run lock");
        }
        if is_pull && !dry_run && outcome == RunOutcome::Completed {
            for (system, cursor) in &pass.cursors {
                if pass.failed_sides.contains(system) {
                    debug!(team = %team, system = %system, "keeping cursor after failed entries");
                    continue;
                }
                if let Err(e) = self.repo.save_cursor(team, *system, cursor).await {
                    warn!(team = %team, system = %system, error = %e, "failed to save cursor");
                }
            }
        }
        self.finish(run, pass.plan, outcome).await
    }

    async fn finish(&self, mut run: SyncRun, plan: Plan, outcome: RunOutcome) -> SyncResult<RunReport> {
        run.finalize(outcome);
        self.repo.finalize_run_record(&run).await?;
        match &run.outcome {
            RunOutcome::Aborted { reason } => info!(
                team = %run.team,
                run_id = %run.id,
                reason = %reason,
                "run aborted"
            ),
            _ => info!(
                team = %run.team,
                run_id = %run.id,
                created = run.created,
                updated = run.updated,
                deleted = run.deleted,
                skipped = run.skipped,
                errors = run.error_count,
                "run completed"
            ),
        }
        Ok(RunReport { run, plan })
    }

    /// Collecting through Applying. Returns the outcome to finalize with.
    async fn drive(
        &self,
        config: &SyncConfig,
        run: &mut SyncRun,
        pass: &mut Pass,
        direction: Direction,
        dry_run: bool,
        changes: Changes,
    ) -> RunOutcome {
        let team = &config.team;
        let deadline = Instant::now() + Duration::from_secs(config.run_timeout_secs);

        let connectors = match self.connect(config).await {
            Ok(connectors) => connectors,
            Err(reason) => return RunOutcome::Aborted { reason },
        };
        let mapper = FieldMapper::new(config.mapping.clone());

        // Collecting
        let mut a_side = Vec::new();
        let mut b_side = Vec::new();
        match changes {
            Changes::Pull => {
                for system in SystemTag::both() {
                    if !direction.reads_from(system) {
                        continue;
                    }
                    let cursor = match self.repo.load_cursor(team, system).await {
                        Ok(cursor) => cursor,
                        Err(e) => return internal(e),
                    };
                    let collected = match tokio::time::timeout_at(
                        deadline,
                        collect_since(connectors.get(system), &mapper, cursor.as_deref()),
                    )
                    .await
                    {
                        Err(_) => {
                            return RunOutcome::Aborted {
                                reason: AbortReason::Timeout,
                            }
                        }
                        Ok(Err(e)) => {
                            error!(team = %team, system = %system, error = %e, "collector failed");
                            return RunOutcome::Aborted {
                                reason: collector_abort(system, e),
                            };
                        }
                        Ok(Ok(collected)) => collected,
                    };
                    for issue in collected.issues {
                        run.push_issue(issue);
                    }
                    if let Some(cursor) = collected.cursor {
                        pass.cursors.push((system, cursor));
                    }
                    match system {
                        SystemTag::A => a_side = collected.records,
                        SystemTag::B => b_side = collected.records,
                    }
                }
            }
            Changes::Delta { record, issues } => {
                for issue in issues {
                    run.push_issue(issue);
                }
                match record.source {
                    SystemTag::A => a_side.push(record),
                    SystemTag::B => b_side.push(record),
                }
            }
        }

        // Reconciling
        let links = match self.repo.list_links(team).await {
            Ok(links) => links,
            Err(e) => return internal(e),
        };
        pass.plan = Reconciler::new(config, &mapper).plan(&links, &a_side, &b_side);
        for issue in pass.plan.issues.clone() {
            run.push_issue(issue);
        }
        run.superseded.extend(pass.plan.superseded.iter().cloned());

        if dry_run {
            for entry in &pass.plan.entries {
                info!(team = %team, run_id = %run.id, "[dry-run] {entry}");
            }
            for system in SystemTag::both() {
                match connectors.get(system).describe_schema().await {
                    Ok(schema) => {
                        for issue in mapper.check_schema(system, &schema) {
                            run.push_issue(issue);
                        }
                    }
                    Err(e) => run.push_issue(RunIssue::warning(
                        None,
                        format!("could not read {system} schema: {e}"),
                    )),
                }
            }
            let summary = pass.plan.summary();
            run.created = summary.created;
            run.updated = summary.updated;
            run.deleted = summary.deleted;
            run.skipped = summary.skipped;
            return RunOutcome::Completed;
        }

        // Applying
        self.apply(config, run, pass, &connectors, deadline).await
    }

    /// Token guard plus connector construction for both sides.
    async fn connect(&self, config: &SyncConfig) -> Result<Connectors, AbortReason> {
        let mut built = Vec::with_capacity(2);
        for system in SystemTag::both() {
            let credential = ensure_fresh(
                self.repo.as_ref(),
                self.refresher.as_ref(),
                &config.team,
                system,
                config.credential(system),
            )
            .await
            .map_err(|e| match e {
                SyncError::Credential { system, message } => {
                    AbortReason::CredentialExpired { system, message }
                }
                other => AbortReason::Internal {
                    message: other.to_string(),
                },
            })?;
            let connector = self
                .connectors
                .build(config, system, &credential)
                .map_err(|e| AbortReason::Internal {
                    message: format!("cannot build {system} connector: {e}"),
                })?;
            built.push(connector);
        }
        let b = built.pop();
        let a = built.pop();
        match (a, b) {
            (Some(a), Some(b)) => Ok(Connectors { a, b }),
            _ => Err(AbortReason::Internal {
                message: "connector construction incomplete".to_string(),
            }),
        }
    }

    async fn apply(
        &self,
        config: &SyncConfig,
        run: &mut SyncRun,
        pass: &mut Pass,
        connectors: &Connectors,
        deadline: Instant,
    ) -> RunOutcome {
        let entries = &pass.plan.entries;
        let lane = |target: SystemTag| {
            let indices: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.target_system == target && e.classification.is_mutation())
                .map(|(i, _)| i)
                .collect();
            self.apply_lane(&config.team, connectors.get(target), entries, indices, deadline)
        };
        let (to_a, to_b) = tokio::join!(lane(SystemTag::A), lane(SystemTag::B));

        let mut results: Vec<Option<EntryResult>> = entries.iter().map(|_| None).collect();
        let mut timed_out = to_a.1 || to_b.1;
        for (idx, result) in to_a.0.into_iter().chain(to_b.0) {
            results[idx] = Some(result);
        }

        // Record in plan order regardless of which lane finished first.
        for (entry, result) in entries.iter().zip(results) {
            match (&entry.classification, result) {
                (Classification::NoOp { .. } | Classification::Superseded, _) => run.skipped += 1,
                (_, Some(EntryResult::Created)) => run.created += 1,
                (_, Some(EntryResult::Updated)) => run.updated += 1,
                (_, Some(EntryResult::Deleted)) => run.deleted += 1,
                (_, Some(EntryResult::Failed(issue))) => {
                    pass.failed_sides.insert(entry.source.system);
                    run.push_issue(issue);
                }
                (_, None) => timed_out = true,
            }
        }

        if timed_out {
            warn!(team = %config.team, run_id = %run.id, "run deadline reached, remaining entries not started");
            RunOutcome::Aborted {
                reason: AbortReason::Timeout,
            }
        } else {
            RunOutcome::Completed
        }
    }

    /// Apply entries aimed at one system, in plan order. Returns the results
    /// and whether the deadline cut the lane short.
    async fn apply_lane(
        &self,
        team: &TeamId,
        connector: &dyn Connector,
        entries: &[PlanEntry],
        indices: Vec<usize>,
        deadline: Instant,
    ) -> (Vec<(usize, EntryResult)>, bool) {
        let mut results = Vec::with_capacity(indices.len());
        for idx in indices {
            if Instant::now() >= deadline {
                return (results, true);
            }
            let entry = &entries[idx];
            let result = self.apply_entry(team, connector, entry).await;
            if let EntryResult::Failed(issue) = &result {
                error!(team = %team, record = %entry.source, error = %issue.message, "plan entry failed");
            } else {
                debug!(team = %team, "{entry}");
            }
            results.push((idx, result));
        }
        (results, false)
    }

    async fn apply_entry(
        &self,
        team: &TeamId,
        connector: &dyn Connector,
        entry: &PlanEntry,
    ) -> EntryResult {
        let fail = |message: String| EntryResult::Failed(RunIssue::error(Some(entry.source.clone()), message));

        match &entry.classification {
            Classification::CreateOpposite => {
                let new_id = match connector.create(&entry.payload).await {
                    Ok(id) => id,
                    Err(e) => return fail(format!("create on {} failed: {e}", entry.target_system)),
                };
                let (a, b) = pair(entry.source.system, entry.source.id.clone(), new_id.clone());
                let link = Link::new(team.clone(), a, b, entry.fingerprint.clone());
                match self.repo.upsert_link(&link).await {
                    Ok(()) => EntryResult::Created,
                    Err(e) => {
                        // Unlinked, the next run would create it a second time.
                        let orphan = format!("{}:{new_id}", entry.target_system.as_str());
                        error!(
                            team = %team,
                            record = %entry.source,
                            orphan = %orphan,
                            error = %e,
                            "created counterpart could not be linked"
                        );
                        fail(format!(
                            "created orphan {orphan} for {} but could not link it: {e}",
                            entry.source
                        ))
                    }
                }
            }
            Classification::UpdateOpposite => {
                let (Some(target_id), Some(link)) = (&entry.target_id, &entry.link) else {
                    return fail("update without a link".to_string());
                };
                let mut link = link.clone();
                match connector.update(target_id, &entry.payload).await {
                    Ok(()) => {
                        link.record_sync(entry.fingerprint.clone());
                        match self.repo.upsert_link(&link).await {
                            Ok(()) => EntryResult::Updated,
                            Err(e) => fail(format!("updated counterpart but could not record it: {e}")),
                        }
                    }
                    Err(e) if e.is_not_found() => {
                        link.mark_broken(format!(
                            "{}:{target_id} not found",
                            entry.target_system.as_str()
                        ));
                        if let Err(store) = self.repo.upsert_link(&link).await {
                            warn!(team = %team, error = %store, "could not mark link broken");
                        }
                        fail(format!(
                            "counterpart {}:{target_id} no longer exists, link marked broken",
                            entry.target_system.as_str()
                        ))
                    }
                    Err(e) => fail(format!("update on {} failed: {e}", entry.target_system)),
                }
            }
            Classification::DeleteOpposite => {
                let (Some(target_id), Some(link)) = (&entry.target_id, &entry.link) else {
                    return fail("delete without a link".to_string());
                };
                match connector.delete(target_id).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!(team = %team, record = %target_id, "counterpart already gone");
                    }
                    Err(e) => return fail(format!("delete on {} failed: {e}", entry.target_system)),
                }
                let mut link = link.clone();
                link.mark_broken(format!("deleted after {}", entry.source));
                match self.repo.upsert_link(&link).await {
                    Ok(()) => EntryResult::Deleted,
                    Err(e) => fail(format!("deleted counterpart but could not record it: {e}")),
                }
            }
            Classification::NoOp { .. } | Classification::Superseded => {
                fail("non-mutating entry reached the apply lane".to_string())
            }
        }
    }
}

/// Order a (source id, new id) pair as (A id, B id).
fn pair(source: SystemTag, source_id: RecordId, other: RecordId) -> (RecordId, RecordId) {
    match source {
        SystemTag::A => (source_id, other),
        SystemTag::B => (other, source_id),
    }
}

fn collector_abort(system: SystemTag, err: ConnectorError) -> AbortReason {
    match err {
        ConnectorError::Unauthorized { message } => AbortReason::CredentialExpired { system, message },
        other => AbortReason::CollectorFailed {
            system,
            message: other.to_string(),
        },
    }
}

fn internal(err: SyncError) -> RunOutcome {
    RunOutcome::Aborted {
        reason: AbortReason::Internal {
            message: err.to_string(),
        },
    }
}
