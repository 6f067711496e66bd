use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use worksync_connector::{Connector, ConnectorResult, MemoryConnector};
use worksync_core::{
    config_store, Credential, FieldKind, FieldMapping, FieldValue, MappingEntry, NativeRecord,
    RecordId, RunOutcome, ScheduleConfig, SourceAConfig, SourceBConfig, SyncConfig, SystemTag,
    TeamId, Trigger,
};
use worksync_daemon::paths::socket_path;
use worksync_daemon::{
    request_status, request_stop, request_sync, request_webhook, serve, DaemonError, WebhookReply,
};
use worksync_engine::{
    ConnectorFactory, FileRepository, OAuthRefresher, Orchestrator, Repository,
};

struct StaticFactory {
    a: Arc<MemoryConnector>,
    b: Arc<MemoryConnector>,
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

fn config(team: &str, schedule: ScheduleConfig) -> SyncConfig {
    SyncConfig {
        team: TeamId::from(team),
        primary: SystemTag::A,
        propagate_deletes: false,
        schedule,
        run_timeout_secs: 30,
        lock_ttl_secs: 60,
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
        mapping: FieldMapping::new(vec![MappingEntry::new(
            "title",
            "System.Title",
            "Name",
            FieldKind::Text,
        )]),
    }
}

fn manual_only() -> ScheduleConfig {
    ScheduleConfig {
        enabled: false,
        ..ScheduleConfig::default()
    }
}

fn work_item(id: &str, title: &str) -> NativeRecord {
    NativeRecord {
        id: RecordId::from(id),
        fields: [("System.Title".to_string(), FieldValue::text(title))].into(),
        modified_at: Utc::now(),
        deleted: false,
    }
}

struct Daemon {
    home: TempDir,
    a: Arc<MemoryConnector>,
    b: Arc<MemoryConnector>,
    handle: JoinHandle<Result<(), DaemonError>>,
}

impl Daemon {
    async fn start(configs: Vec<SyncConfig>) -> Self {
        let home = TempDir::new().expect("home");
        for config in &configs {
            config_store::save_at(home.path(), config).expect("save config");
        }

        let a = Arc::new(MemoryConnector::new(SystemTag::A));
        let b = Arc::new(MemoryConnector::new(SystemTag::B));
        let repo: Arc<dyn Repository> = Arc::new(FileRepository::new(home.path()));
        let orchestrator = Orchestrator::new(
            repo,
            Arc::new(StaticFactory {
                a: a.clone(),
                b: b.clone(),
            }),
            Arc::new(OAuthRefresher::new()),
        );

        let handle = tokio::spawn(serve(home.path().to_path_buf(), orchestrator));
        let socket = socket_path(home.path());
        assert!(
            wait_until(Duration::from_secs(5), || socket.exists()).await,
            "daemon socket did not appear"
        );
        Self { home, a, b, handle }
    }

    fn home(&self) -> PathBuf {
        self.home.path().to_path_buf()
    }

    async fn stop(self) {
        let home = self.home();
        blocking(move || request_stop(&home))
            .await
            .expect("stop request");
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("daemon exits after stop")
            .expect("daemon task joins");
        result.expect("daemon exits cleanly");
        assert!(!socket_path(self.home.path()).exists(), "socket removed on shutdown");
    }
}

async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.expect("blocking call")
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn raw_exchange(home: &Path, line: &str) -> serde_json::Value {
    let mut stream = UnixStream::connect(socket_path(home)).expect("connect");
    stream.write_all(line.as_bytes()).expect("write");
    stream.write_all(b"\n").expect("newline");
    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).expect("read");
    serde_json::from_str(response.trim_end()).expect("response JSON")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_then_stop_shuts_down_cleanly() {
    let daemon = Daemon::start(vec![config("acme", manual_only())]).await;

    let home = daemon.home();
    let status = blocking(move || request_status(&home)).await.expect("status");
    assert_eq!(status["running"], json!(true));
    assert_eq!(status["teams"][0]["team"], json!("acme"));
    assert!(status["teams"][0]["last_run"].is_null());

    daemon.stop().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn socket_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = Daemon::start(vec![]).await;
    let mode = std::fs::metadata(socket_path(daemon.home.path()))
        .expect("socket metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_sync_over_the_socket_creates_the_counterpart() {
    let daemon = Daemon::start(vec![config("acme", manual_only())]).await;
    daemon.a.insert(work_item("A1", "Write release notes"));

    let home = daemon.home();
    let summary = blocking(move || request_sync(&home, TeamId::from("acme"), None, false))
        .await
        .expect("sync");
    assert_eq!(summary.trigger, Trigger::Manual);
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.result.created, 1);
    assert_eq!(daemon.b.len(), 1);

    let home = daemon.home();
    let status = blocking(move || request_status(&home)).await.expect("status");
    assert_eq!(
        status["teams"][0]["last_run"]["history_id"],
        json!(summary.history_id)
    );

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dry_run_over_the_socket_writes_nothing() {
    let daemon = Daemon::start(vec![config("acme", manual_only())]).await;
    daemon.a.insert(work_item("A1", "Write release notes"));

    let home = daemon.home();
    let summary = blocking(move || request_sync(&home, TeamId::from("acme"), None, true))
        .await
        .expect("dry run");
    assert!(summary.dry_run);
    assert_eq!(summary.result.created, 1);
    assert!(daemon.b.is_empty());

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn webhook_replays_are_ignored() {
    let daemon = Daemon::start(vec![config("acme", manual_only())]).await;
    daemon.a.insert(work_item("A7", "Fix login redirect"));
    let payload = json!({"event_id": "evt-1", "record_id": "A7"});

    let home = daemon.home();
    let first = {
        let payload = payload.clone();
        blocking(move || request_webhook(&home, TeamId::from("acme"), SystemTag::A, payload))
            .await
            .expect("first delivery")
    };
    match first {
        WebhookReply::Ran { run } => {
            assert_eq!(run.trigger, Trigger::Webhook);
            assert_eq!(run.result.created, 1);
        }
        other => panic!("expected a run, got {other:?}"),
    }

    let home = daemon.home();
    let replay =
        blocking(move || request_webhook(&home, TeamId::from("acme"), SystemTag::A, payload))
            .await
            .expect("replayed delivery");
    assert!(matches!(replay, WebhookReply::Ignored { .. }));
    assert_eq!(daemon.b.len(), 1);

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_team_is_reported_as_an_error() {
    let daemon = Daemon::start(vec![]).await;

    let home = daemon.home();
    let err = blocking(move || request_sync(&home, TeamId::from("nobody"), None, false))
        .await
        .unwrap_err();
    assert!(matches!(err, DaemonError::Protocol(_)), "got {err}");

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_requests_get_an_error_line_and_the_connection_survives() {
    let daemon = Daemon::start(vec![]).await;

    let home = daemon.home();
    let response = blocking(move || raw_exchange(&home, "{not json")).await;
    assert_eq!(response["ok"], json!(false));
    assert!(response["error"]
        .as_str()
        .unwrap()
        .contains("invalid request JSON"));

    let home = daemon.home();
    let response = blocking(move || raw_exchange(&home, r#"{"cmd":"status"}"#)).await;
    assert_eq!(response["ok"], json!(true));

    daemon.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_runs_enabled_teams_only() {
    let enabled = ScheduleConfig {
        enabled: true,
        interval_secs: 1,
        ..ScheduleConfig::default()
    };
    let daemon = Daemon::start(vec![
        config("acme", enabled),
        config("paused", manual_only()),
    ])
    .await;
    daemon.a.insert(work_item("A1", "Scheduled item"));

    let b = daemon.b.clone();
    assert!(
        wait_until(Duration::from_secs(5), || b.len() == 1).await,
        "scheduler did not sync the enabled team"
    );

    // The summary is recorded just after the run's writes land.
    let deadline = Instant::now() + Duration::from_secs(5);
    let status = loop {
        let home = daemon.home();
        let status = blocking(move || request_status(&home)).await.expect("status");
        let recorded = status["teams"]
            .as_array()
            .expect("teams")
            .iter()
            .any(|t| t["team"] == json!("acme") && !t["last_run"].is_null());
        if recorded || Instant::now() > deadline {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let teams = status["teams"].as_array().expect("teams");
    let acme = teams.iter().find(|t| t["team"] == json!("acme")).expect("acme");
    let paused = teams.iter().find(|t| t["team"] == json!("paused")).expect("paused");
    assert_eq!(acme["last_run"]["trigger"], json!("scheduled"));
    assert!(paused["last_run"].is_null());
    assert_eq!(daemon.b.len(), 1, "later ticks must not duplicate the record");

    daemon.stop().await;
}
