use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

use worksync_core::{config_store, SyncConfig, SyncRun, TeamId};

fn worksync_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("worksync").to_path_buf()
}

fn worksync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(worksync_bin());
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("RUST_LOG", "warn");
    cmd
}

/// A team whose both endpoints point at `base_url`.
fn init_team(home: &Path, base_url: &str) -> SyncConfig {
    let mut config = config_store::init_at(home, TeamId::from("acme")).expect("init team");
    config.source_a.base_url = format!("{base_url}/org");
    config.source_b.base_url = base_url.to_string();
    config_store::save_at(home, &config).expect("save team");
    config
}

#[test]
fn rejected_credentials_abort_the_run_and_are_recorded() {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let server = rt.block_on(async {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(401).set_body_string("token revoked"))
            .mount(&server)
            .await;
        server
    });

    let home = TempDir::new().expect("home");
    init_team(home.path(), &server.uri());

    let assert = worksync_cmd(home.path())
        .args(["sync", "acme", "--json"])
        .assert()
        .failure()
        .stderr(contains("aborted"));
    let report: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("run JSON on stdout");
    assert_eq!(report["outcome"], "aborted");
    assert_eq!(report["reason"]["kind"], "credential_expired");
    assert_eq!(report["result"]["created"], 0);

    let assert = worksync_cmd(home.path())
        .args(["history", "acme", "--json"])
        .assert()
        .success();
    let runs: Vec<SyncRun> = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id.0, report["history_id"].as_str().unwrap());
    assert!(runs[0].is_finalized());

    // The lease was released, so a second attempt runs (and aborts) again.
    worksync_cmd(home.path())
        .args(["sync", "acme"])
        .assert()
        .failure()
        .stdout(contains("run aborted"));
}

// ---------------------------------------------------------------------------
// Daemon lifecycle
// ---------------------------------------------------------------------------

struct DaemonProcess {
    child: Child,
    home: PathBuf,
}

impl DaemonProcess {
    fn start(home: PathBuf) -> Self {
        let child = Command::new(worksync_bin())
            .env("HOME", &home)
            .env("USERPROFILE", &home)
            .args(["daemon", "start"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn daemon");
        Self { child, home }
    }

    fn stop(&mut self) {
        let _ = worksync_cmd(&self.home).args(["daemon", "stop"]).status();

        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            sleep(Duration::from_millis(50));
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn daemon_status(home: &Path) -> Option<serde_json::Value> {
    let output = worksync_cmd(home).args(["daemon", "status"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn daemon_starts_reports_teams_and_stops() {
    let home = TempDir::new().expect("home");
    let mut config = config_store::init_at(home.path(), TeamId::from("acme")).expect("init");
    config.schedule.enabled = false;
    config_store::save_at(home.path(), &config).expect("save");

    let mut daemon = DaemonProcess::start(home.path().to_path_buf());
    assert!(
        wait_until(Duration::from_secs(10), || daemon_status(home.path())
            .is_some_and(|s| s["running"] == true)),
        "daemon did not report running state in time",
    );

    let status = daemon_status(home.path()).expect("status");
    assert_eq!(status["teams"][0]["team"], "acme");
    assert!(status["teams"][0]["last_run"].is_null(), "disabled team must not run");

    daemon.stop();
    assert!(
        wait_until(Duration::from_secs(5), || daemon_status(home.path())
            .is_some_and(|s| s["running"] == false)),
        "daemon still reachable after stop",
    );
}
