mod common;

use std::time::Duration;

use tempfile::TempDir;
use worksync_core::{
    config_store, Credential, Direction, Link, RecordId, RunOutcome, SyncRun, SystemTag, Trigger,
};
use worksync_engine::{FileRepository, Repository, SyncError};

use common::{config, team};

fn repo() -> (TempDir, FileRepository) {
    let home = TempDir::new().expect("home");
    let repo = FileRepository::new(home.path());
    (home, repo)
}

#[tokio::test]
async fn config_and_credentials_round_trip_through_yaml() {
    let (home, repo) = repo();
    config_store::save_at(home.path(), &config()).unwrap();

    let loaded = repo.load_config(&team()).await.unwrap();
    assert_eq!(loaded, config());

    let refreshed = Credential {
        refresh_token: Some("r2".into()),
        ..Credential::bearer("fresh")
    };
    repo.store_credential(&team(), SystemTag::B, &refreshed)
        .await
        .unwrap();
    let loaded = repo.load_config(&team()).await.unwrap();
    assert_eq!(loaded.source_b.credential, refreshed);
    assert_eq!(loaded.source_a.credential, config().source_a.credential);
}

#[tokio::test]
async fn missing_team_is_a_config_error() {
    let (_home, repo) = repo();
    assert!(matches!(
        repo.load_config(&team()).await,
        Err(SyncError::Config(_))
    ));
}

#[tokio::test]
async fn links_persist_and_enforce_uniqueness() {
    let (home, repo) = repo();
    let link = Link::new(team(), "A1".into(), "P1".into(), "fp1");
    repo.upsert_link(&link).await.unwrap();

    let conflicting = Link::new(team(), "A1".into(), "P2".into(), "fp1");
    assert!(matches!(
        repo.upsert_link(&conflicting).await,
        Err(SyncError::LinkInvariant { .. })
    ));

    let mut updated = link.clone();
    updated.record_sync("fp2");
    repo.upsert_link(&updated).await.unwrap();

    // A fresh handle on the same home sees the durable state.
    let reopened = FileRepository::new(home.path());
    let found = reopened
        .find_link(&team(), SystemTag::B, &RecordId::from("P1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.last_synced_fingerprint, "fp2");
    assert_eq!(reopened.list_links(&team()).await.unwrap().len(), 1);
    assert!(!reopened.links_path(&team()).with_extension("json.tmp").exists());
}

#[tokio::test]
async fn cursors_are_per_system() {
    let (_home, repo) = repo();
    repo.save_cursor(&team(), SystemTag::A, "2026-01-01T00:00:00Z")
        .await
        .unwrap();
    repo.save_cursor(&team(), SystemTag::B, "cursor-b").await.unwrap();
    repo.save_cursor(&team(), SystemTag::B, "cursor-b2").await.unwrap();

    assert_eq!(
        repo.load_cursor(&team(), SystemTag::A).await.unwrap().as_deref(),
        Some("2026-01-01T00:00:00Z")
    );
    assert_eq!(
        repo.load_cursor(&team(), SystemTag::B).await.unwrap().as_deref(),
        Some("cursor-b2")
    );
}

#[tokio::test]
async fn lease_file_excludes_a_second_holder() {
    let (_home, repo) = repo();
    let ttl = Duration::from_secs(60);
    assert!(repo.acquire_lock(&team(), "run-1", ttl).await.unwrap());
    assert!(!repo.acquire_lock(&team(), "run-2", ttl).await.unwrap());

    // Only the owner can release.
    repo.release_lock(&team(), "run-2").await.unwrap();
    assert!(repo.lock_path(&team()).exists());

    repo.release_lock(&team(), "run-1").await.unwrap();
    assert!(!repo.lock_path(&team()).exists());
    assert!(repo.acquire_lock(&team(), "run-2", ttl).await.unwrap());
}

#[tokio::test]
async fn expired_lease_is_taken_over() {
    let (_home, repo) = repo();
    assert!(repo
        .acquire_lock(&team(), "crashed", Duration::ZERO)
        .await
        .unwrap());
    assert!(repo
        .acquire_lock(&team(), "next", Duration::from_secs(60))
        .await
        .unwrap());
    assert!(!repo
        .acquire_lock(&team(), "third", Duration::from_secs(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn run_records_are_finalized_once() {
    let (_home, repo) = repo();
    let mut first = SyncRun::start(team(), Trigger::Scheduled, Direction::Both, false);
    repo.append_run_record(&first).await.unwrap();
    let mut second = SyncRun::start(team(), Trigger::Manual, Direction::AToB, true);
    second.started_at = first.started_at + chrono::Duration::seconds(1);
    repo.append_run_record(&second).await.unwrap();

    first.created = 2;
    first.finalize(RunOutcome::Completed);
    repo.finalize_run_record(&first).await.unwrap();
    assert!(matches!(
        repo.finalize_run_record(&first).await,
        Err(SyncError::RunFinalized(_))
    ));

    let runs = repo.list_runs(&team()).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, second.id);
    assert_eq!(runs[1].created, 2);
    assert!(runs[1].is_finalized());
    assert!(!runs[0].is_finalized());
}

#[tokio::test]
async fn unknown_run_cannot_be_finalized() {
    let (_home, repo) = repo();
    let mut run = SyncRun::start(team(), Trigger::Manual, Direction::Both, false);
    run.finalize(RunOutcome::Completed);
    assert!(matches!(
        repo.finalize_run_record(&run).await,
        Err(SyncError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn seen_events_survive_reopen() {
    let (home, repo) = repo();
    assert!(!repo
        .is_event_seen(&team(), SystemTag::A, "evt-1")
        .await
        .unwrap());
    assert!(repo
        .mark_event_seen(&team(), SystemTag::A, "evt-1")
        .await
        .unwrap());

    let reopened = FileRepository::new(home.path());
    assert!(reopened
        .is_event_seen(&team(), SystemTag::A, "evt-1")
        .await
        .unwrap());
    assert!(!reopened
        .mark_event_seen(&team(), SystemTag::A, "evt-1")
        .await
        .unwrap());
    assert!(reopened
        .mark_event_seen(&team(), SystemTag::B, "evt-1")
        .await
        .unwrap());
}
