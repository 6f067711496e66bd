use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

use worksync_core::{config_store, RunOutcome, ScheduleConfig, SystemTag, TeamId};
use worksync_engine::{
    FileRepository, HttpConnectorFactory, OAuthRefresher, Orchestrator, Repository, RunRequest,
    WebhookOutcome,
};

use crate::error::{io_err, DaemonError};
use crate::paths::{socket_path, LOG_FORMAT_ENV, MIN_INTERVAL, SCHEDULER_TICK};
use crate::protocol::{DaemonRequest, DaemonResponse, RunSummary, WebhookReply};

/// Most recent run per team, as shown by `status`.
pub type LastRuns = HashMap<TeamId, RunSummary>;

type Shared<T> = Arc<RwLock<T>>;

enum JobKind {
    Run(RunRequest),
    Webhook {
        team: TeamId,
        system: SystemTag,
        payload: Value,
    },
}

enum JobOutput {
    Run(RunSummary),
    Webhook(WebhookReply),
}

struct Job {
    kind: JobKind,
    respond_to: Option<oneshot::Sender<Result<JobOutput, String>>>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon against the file repository and the REST connectors.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    let repo: Arc<dyn Repository> = Arc::new(FileRepository::new(&home));
    let orchestrator = Orchestrator::new(
        repo,
        Arc::new(HttpConnectorFactory::default()),
        Arc::new(OAuthRefresher::new()),
    );
    serve(home, orchestrator).await
}

/// Run the scheduler, job dispatcher and socket server until `stop` or ctrl-c.
///
/// Teams are discovered from the config store under `home`; every run goes
/// through `orchestrator`.
pub async fn serve(home: PathBuf, orchestrator: Orchestrator) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let last_runs: Shared<LastRuns> = Arc::new(RwLock::new(HashMap::new()));
    let started_at = Utc::now();

    let (job_tx, job_rx) = mpsc::channel::<Job>(64);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let repo = orchestrator.repository().clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = scheduler_task(home, repo, job_tx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let dispatcher_handle = {
        let shutdown = shutdown_tx.clone();
        let orchestrator = orchestrator.clone();
        let last_runs = last_runs.clone();
        tokio::spawn(async move {
            let result =
                dispatcher_task(orchestrator, last_runs, job_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let last_runs = last_runs.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                last_runs,
                job_tx,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };
    drop(job_tx);

    let (scheduler_result, dispatcher_result, socket_result, signal_result) = tokio::join!(
        scheduler_handle,
        dispatcher_handle,
        socket_handle,
        signal_handle
    );

    handle_join("scheduler", scheduler_result)?;
    handle_join("dispatcher", dispatcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    info!("daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

async fn scheduler_task(
    home: PathBuf,
    repo: Arc<dyn Repository>,
    job_tx: mpsc::Sender<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(SCHEDULER_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut next_due = HashMap::<TeamId, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let schedules = match load_schedules(&home, repo.as_ref()).await {
                    Ok(schedules) => schedules,
                    Err(err) => {
                        warn!(error = %err, "could not list teams; skipping scheduler tick");
                        continue;
                    }
                };

                for team in due_teams(&mut next_due, schedules, Instant::now()) {
                    let job = Job {
                        kind: JobKind::Run(RunRequest::scheduled(team)),
                        respond_to: None,
                    };
                    // The dispatcher only drops its receiver on shutdown.
                    if job_tx.send(job).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    Ok(())
}

async fn load_schedules(
    home: &Path,
    repo: &dyn Repository,
) -> Result<Vec<(TeamId, ScheduleConfig)>, DaemonError> {
    let home = home.to_path_buf();
    let teams = tokio::task::spawn_blocking(move || config_store::list_teams_at(&home))
        .await
        .map_err(|err| DaemonError::Protocol(format!("team listing join error: {err}")))??;

    let mut schedules = Vec::with_capacity(teams.len());
    for team in teams {
        match repo.load_config(&team).await {
            Ok(config) => schedules.push((team, config.schedule)),
            Err(err) => warn!(team = %team, error = %err, "skipping team with unreadable config"),
        }
    }
    Ok(schedules)
}

/// Teams whose interval has elapsed at `now`.
///
/// A newly seen team is due immediately. Disabled or vanished teams are
/// forgotten, so re-enabling one schedules it straight away.
fn due_teams(
    next_due: &mut HashMap<TeamId, Instant>,
    schedules: Vec<(TeamId, ScheduleConfig)>,
    now: Instant,
) -> Vec<TeamId> {
    let enabled: BTreeSet<&TeamId> = schedules
        .iter()
        .filter(|(_, schedule)| schedule.enabled)
        .map(|(team, _)| team)
        .collect();
    next_due.retain(|team, _| enabled.contains(team));

    let mut due = Vec::new();
    for (team, schedule) in &schedules {
        if !schedule.enabled {
            continue;
        }
        let is_due = next_due.get(team).map_or(true, |at| now >= *at);
        if is_due {
            let interval = Duration::from_secs(schedule.interval_secs).max(MIN_INTERVAL);
            next_due.insert(team.clone(), now + interval);
            due.push(team.clone());
        }
    }
    due
}

// ---------------------------------------------------------------------------
// Job dispatcher
// ---------------------------------------------------------------------------

async fn dispatcher_task(
    orchestrator: Orchestrator,
    last_runs: Shared<LastRuns>,
    mut job_rx: mpsc::Receiver<Job>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "run task panicked");
                }
            }
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                let orchestrator = orchestrator.clone();
                let last_runs = last_runs.clone();
                in_flight.spawn(async move {
                    let outcome = execute_job(&orchestrator, &last_runs, job.kind).await;
                    if let Some(respond_to) = job.respond_to {
                        let _ = respond_to.send(outcome);
                    }
                });
            }
        }
    }

    // Let in-flight runs finalize their records and release their leases.
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "run task panicked during shutdown");
        }
    }
    Ok(())
}

async fn execute_job(
    orchestrator: &Orchestrator,
    last_runs: &Shared<LastRuns>,
    kind: JobKind,
) -> Result<JobOutput, String> {
    match kind {
        JobKind::Run(request) => {
            let team = request.team.clone();
            let report = orchestrator.run(request).await.map_err(|err| {
                error!(team = %team, error = %err, "run failed to start");
                err.to_string()
            })?;
            let summary = record_run(last_runs, RunSummary::from(&report.run)).await;
            Ok(JobOutput::Run(summary))
        }
        JobKind::Webhook {
            team,
            system,
            payload,
        } => {
            let outcome = orchestrator
                .run_webhook(&team, system, &payload)
                .await
                .map_err(|err| {
                    error!(team = %team, system = %system, error = %err, "webhook delivery failed");
                    err.to_string()
                })?;
            match outcome {
                WebhookOutcome::Ignored { reason } => {
                    info!(team = %team, system = %system, reason = %reason, "webhook ignored");
                    Ok(JobOutput::Webhook(WebhookReply::Ignored { reason }))
                }
                WebhookOutcome::Ran(report) => {
                    let run = record_run(last_runs, RunSummary::from(&report.run)).await;
                    Ok(JobOutput::Webhook(WebhookReply::Ran { run }))
                }
            }
        }
    }
}

async fn record_run(last_runs: &Shared<LastRuns>, summary: RunSummary) -> RunSummary {
    match &summary.outcome {
        RunOutcome::Aborted { reason } => warn!(
            team = %summary.team,
            run_id = %summary.history_id,
            reason = %reason,
            "run aborted",
        ),
        _ => info!(
            team = %summary.team,
            run_id = %summary.history_id,
            trigger = %summary.trigger,
            created = summary.result.created,
            updated = summary.result.updated,
            skipped = summary.result.skipped,
            errors = summary.result.error_count,
            "run finished",
        ),
    }
    last_runs
        .write()
        .await
        .insert(summary.team.clone(), summary.clone());
    summary
}

async fn enqueue(job_tx: &mpsc::Sender<Job>, kind: JobKind) -> Result<JobOutput, DaemonError> {
    let (tx, rx) = oneshot::channel();
    job_tx
        .send(Job {
            kind,
            respond_to: Some(tx),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("job queue"))?;

    let outcome = rx
        .await
        .map_err(|_| DaemonError::ChannelClosed("job response"))?;
    outcome.map_err(DaemonError::Protocol)
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    last_runs: Shared<LastRuns>,
    job_tx: mpsc::Sender<Job>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    info!(socket = %socket.display(), "daemon listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let last_runs = last_runs.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        last_runs,
                        job_tx,
                        shutdown_tx,
                        started_at,
                    ).await {
                        error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    last_runs: Shared<LastRuns>,
    job_tx: mpsc::Sender<Job>,
    shutdown_tx: broadcast::Sender<()>,
    started_at: DateTime<Utc>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stopping = matches!(request, DaemonRequest::Stop);
        let response = match request {
            DaemonRequest::Status => {
                DaemonResponse::ok(build_status_payload(&home, &last_runs, started_at).await)
            }
            DaemonRequest::Sync {
                team,
                direction,
                dry_run,
            } => {
                let mut run = RunRequest::manual(team).with_dry_run(dry_run);
                if let Some(direction) = direction {
                    run = run.with_direction(direction);
                }
                reply(enqueue(&job_tx, JobKind::Run(run)).await)
            }
            DaemonRequest::Webhook {
                team,
                system,
                payload,
            } => reply(
                enqueue(
                    &job_tx,
                    JobKind::Webhook {
                        team,
                        system,
                        payload,
                    },
                )
                .await,
            ),
            DaemonRequest::Stop => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
        };

        write_response(&mut writer, &response).await?;
        if stopping {
            break;
        }
    }

    Ok(())
}

fn reply(outcome: Result<JobOutput, DaemonError>) -> DaemonResponse {
    let encoded = match outcome {
        Ok(JobOutput::Run(summary)) => serde_json::to_value(summary),
        Ok(JobOutput::Webhook(reply)) => serde_json::to_value(reply),
        Err(err) => return DaemonResponse::error(err.to_string()),
    };
    match encoded {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(format!("could not encode reply: {err}")),
    }
}

async fn build_status_payload(
    home: &Path,
    last_runs: &Shared<LastRuns>,
    started_at: DateTime<Utc>,
) -> Value {
    let snapshot: LastRuns = last_runs.read().await.clone();

    let mut teams: BTreeSet<TeamId> = match config_store::list_teams_at(home) {
        Ok(teams) => teams.into_iter().collect(),
        Err(err) => {
            warn!(error = %err, "could not list teams for status");
            BTreeSet::new()
        }
    };
    teams.extend(snapshot.keys().cloned());

    let teams: Vec<Value> = teams
        .into_iter()
        .map(|team| {
            let last_run = snapshot.get(&team);
            json!({
                "team": team,
                "last_run": last_run,
            })
        })
        .collect();

    json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": started_at.to_rfc3339(),
        "socket": socket_path(home).display().to_string(),
        "teams": teams,
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = config_store::root_at(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&root, fs::Permissions::from_mode(0o700))
                .map_err(|e| io_err(&root, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the `RUST_LOG`-driven subscriber (default `info`). Safe to call twice.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Log shippers want one JSON object per line.
    if std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        let _ = fmt().json().with_env_filter(filter).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
