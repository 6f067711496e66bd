use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use worksync_core::{
    config_store, Direction, Link, RecordId, RunOutcome, SyncRun, TeamId, Trigger,
};
use worksync_engine::{FileRepository, Repository};

fn worksync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("worksync"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("RUST_LOG", "warn");
    cmd
}

fn team() -> TeamId {
    TeamId::from("acme")
}

#[test]
fn help_lists_every_command() {
    let home = TempDir::new().expect("home");
    let assert = worksync_cmd(home.path()).arg("--help").assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).expect("utf8");
    for command in ["init", "sync", "webhook", "history", "links", "daemon"] {
        assert!(stdout.contains(command), "help is missing '{command}'");
    }
}

#[test]
fn init_scaffolds_a_private_team_config_once() {
    let home = TempDir::new().expect("home");

    worksync_cmd(home.path())
        .args(["init", "acme"])
        .assert()
        .success()
        .stdout(contains("Initialized team 'acme'"));

    let path = config_store::team_path_at(home.path(), &team());
    assert!(path.exists());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // Hand edits survive a second init.
    let mut config = config_store::load_at(home.path(), &team()).unwrap();
    config.propagate_deletes = true;
    config_store::save_at(home.path(), &config).unwrap();

    worksync_cmd(home.path())
        .args(["init", "acme"])
        .assert()
        .success()
        .stdout(contains("already initialized"));
    assert!(config_store::load_at(home.path(), &team()).unwrap().propagate_deletes);
}

#[test]
fn sync_for_an_unknown_team_fails_with_context() {
    let home = TempDir::new().expect("home");
    worksync_cmd(home.path())
        .args(["sync", "nobody"])
        .assert()
        .failure()
        .stderr(contains("sync failed for team 'nobody'"));
}

#[test]
fn sync_rejects_an_unknown_direction() {
    let home = TempDir::new().expect("home");
    worksync_cmd(home.path())
        .args(["sync", "acme", "--direction", "sideways"])
        .assert()
        .failure()
        .stderr(contains("unknown direction"));
}

#[test]
fn history_is_empty_before_any_run() {
    let home = TempDir::new().expect("home");
    worksync_cmd(home.path())
        .args(["history", "acme"])
        .assert()
        .success()
        .stdout(contains("No runs recorded for team 'acme'"));
}

#[test]
fn history_lists_runs_newest_first() {
    let home = TempDir::new().expect("home");
    let repo = FileRepository::new(home.path());

    let mut older = SyncRun::start(team(), Trigger::Scheduled, Direction::Both, false);
    older.created = 4;
    older.finalize(RunOutcome::Completed);
    let mut newer = SyncRun::start(team(), Trigger::Manual, Direction::AToB, true);
    newer.started_at = older.started_at + chrono::Duration::seconds(5);
    newer.updated = 2;
    newer.finalize(RunOutcome::Completed);
    tokio_test::block_on(async {
        repo.append_run_record(&older).await.unwrap();
        repo.append_run_record(&newer).await.unwrap();
    });

    let assert = worksync_cmd(home.path())
        .args(["history", "acme", "--json"])
        .assert()
        .success();
    let runs: Vec<SyncRun> =
        serde_json::from_slice(&assert.get_output().stdout).expect("history JSON");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, newer.id);
    assert_eq!(runs[1].created, 4);

    worksync_cmd(home.path())
        .args(["history", "acme"])
        .assert()
        .success()
        .stdout(contains("2 runs"))
        .stdout(contains("manual (dry-run)"))
        .stdout(contains("a-to-b"));

    let assert = worksync_cmd(home.path())
        .args(["history", "acme", "--limit", "1", "--json"])
        .assert()
        .success();
    let runs: Vec<SyncRun> = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(runs.len(), 1);
}

#[test]
fn links_show_active_and_broken_pairs() {
    let home = TempDir::new().expect("home");
    let repo = FileRepository::new(home.path());

    let active = Link::new(team(), RecordId::from("101"), RecordId::from("page-1"), "fp");
    let mut broken = Link::new(team(), RecordId::from("102"), RecordId::from("page-2"), "fp");
    broken.mark_broken("counterpart deleted");
    tokio_test::block_on(async {
        repo.upsert_link(&active).await.unwrap();
        repo.upsert_link(&broken).await.unwrap();
    });

    worksync_cmd(home.path())
        .args(["links", "acme"])
        .assert()
        .success()
        .stdout(contains("2 links | 1 broken"))
        .stdout(contains("page-1"))
        .stdout(contains("broken: counterpart deleted"));

    let assert = worksync_cmd(home.path())
        .args(["links", "acme", "--json"])
        .assert()
        .success();
    let links: Vec<Link> = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(links, vec![active, broken]);
}

#[test]
fn webhook_reports_an_unreadable_payload_file() {
    let home = TempDir::new().expect("home");
    worksync_cmd(home.path())
        .args(["webhook", "acme", "--from", "a"])
        .arg(home.path().join("missing.json"))
        .assert()
        .failure()
        .stderr(contains("could not read payload"));
}

#[test]
fn webhook_requires_a_known_system() {
    let home = TempDir::new().expect("home");
    worksync_cmd(home.path())
        .args(["webhook", "acme", "--from", "c", "payload.json"])
        .assert()
        .failure();
}

#[test]
fn daemon_status_when_not_running() {
    let home = TempDir::new().expect("home");
    let assert = worksync_cmd(home.path())
        .args(["daemon", "status"])
        .assert()
        .success();
    let status: serde_json::Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(status["running"], serde_json::json!(false));

    worksync_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}
