mod common;

use chrono::{Duration, Utc};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use worksync_core::{Credential, SystemTag};
use worksync_engine::{ensure_fresh, MemoryRepository, OAuthRefresher, Repository, SyncError};

use common::{config, team};

fn expiring(token_url: String) -> Credential {
    Credential {
        access_token: "old".into(),
        refresh_token: Some("refresh-1".into()),
        expires_at: Some(Utc::now() + Duration::minutes(2)),
        token_url: Some(token_url),
        client_id: Some("worksync".into()),
        client_secret: None,
    }
}

#[tokio::test]
async fn near_expiry_token_is_refreshed_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=refresh-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let repo = MemoryRepository::with_config(config());
    let credential = expiring(format!("{}/oauth/token", server.uri()));

    let fresh = ensure_fresh(&repo, &OAuthRefresher::new(), &team(), SystemTag::A, &credential)
        .await
        .unwrap();

    assert_eq!(fresh.access_token, "new");
    // The provider did not rotate the refresh token, so the old one is kept.
    assert_eq!(fresh.refresh_token.as_deref(), Some("refresh-1"));
    assert!(fresh.expires_at.unwrap() > Utc::now() + Duration::minutes(50));

    let stored = repo.load_config(&team()).await.unwrap();
    assert_eq!(stored.source_a.credential.access_token, "new");
}

#[tokio::test]
async fn valid_token_is_left_alone() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let repo = MemoryRepository::with_config(config());
    let credential = Credential {
        expires_at: Some(Utc::now() + Duration::hours(1)),
        ..expiring(format!("{}/oauth/token", server.uri()))
    };

    let fresh = ensure_fresh(&repo, &OAuthRefresher::new(), &team(), SystemTag::B, &credential)
        .await
        .unwrap();
    assert_eq!(fresh.access_token, "old");
}

#[tokio::test]
async fn rejected_refresh_is_a_credential_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&server)
        .await;

    let repo = MemoryRepository::with_config(config());
    let credential = expiring(format!("{}/oauth/token", server.uri()));

    let err = ensure_fresh(&repo, &OAuthRefresher::new(), &team(), SystemTag::A, &credential)
        .await
        .unwrap_err();
    match err {
        SyncError::Credential { system, message } => {
            assert_eq!(system, SystemTag::A);
            assert!(message.contains("invalid_grant"));
        }
        other => panic!("unexpected error {other}"),
    }
    let stored = repo.load_config(&team()).await.unwrap();
    assert_eq!(stored.source_a.credential.access_token, "a-token");
}

#[tokio::test]
async fn expired_token_without_refresh_details_fails_fast() {
    let repo = MemoryRepository::with_config(config());
    let credential = Credential {
        expires_at: Some(Utc::now() - Duration::minutes(1)),
        ..Credential::bearer("old")
    };
    assert!(matches!(
        ensure_fresh(&repo, &OAuthRefresher::new(), &team(), SystemTag::B, &credential).await,
        Err(SyncError::Credential { .. })
    ));
}
