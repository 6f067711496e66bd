//! Token guard: make sure each connector's bearer credential will outlive
//! the run before any remote call is made.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use worksync_core::{Credential, SystemTag, TeamId};

use crate::error::{SyncError, SyncResult};
use crate::repository::Repository;

/// Refresh when less than this much lifetime remains.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Whether `credential` expires within [`REFRESH_MARGIN`] of `now`.
pub fn needs_refresh(credential: &Credential, now: DateTime<Utc>) -> bool {
    match credential.expires_at {
        None => false,
        Some(expires_at) => {
            let margin = chrono::Duration::from_std(REFRESH_MARGIN).unwrap_or_default();
            expires_at - now < margin
        }
    }
}

/// Exchanges a refresh token for a new credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, system: SystemTag, credential: &Credential) -> SyncResult<Credential>;
}

/// `grant_type=refresh_token` against the credential's `token_url`.
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl OAuthRefresher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for OAuthRefresher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, system: SystemTag, credential: &Credential) -> SyncResult<Credential> {
        let fail = |message: String| SyncError::Credential { system, message };

        let (Some(token_url), Some(refresh_token)) =
            (credential.token_url.as_deref(), credential.refresh_token.as_deref())
        else {
            return Err(fail("no refresh token or token URL configured".to_string()));
        };

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = credential.client_id.as_deref() {
            form.push(("client_id", client_id));
        }
        if let Some(client_secret) = credential.client_secret.as_deref() {
            form.push(("client_secret", client_secret));
        }

        let resp = self
            .client
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| fail(format!("token request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(fail(format!("token endpoint returned {status}: {body}")));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| fail(format!("invalid token response: {e}")))?;

        Ok(Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| credential.refresh_token.clone()),
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            ..credential.clone()
        })
    }
}

/// Return a credential valid for at least [`REFRESH_MARGIN`], refreshing and
/// persisting it when needed.
pub async fn ensure_fresh(
    repo: &dyn Repository,
    refresher: &dyn TokenRefresher,
    team: &TeamId,
    system: SystemTag,
    credential: &Credential,
) -> SyncResult<Credential> {
    let now = Utc::now();
    if !needs_refresh(credential, now) {
        debug!(team = %team, system = %system, "credential valid");
        return Ok(credential.clone());
    }
    if !credential.can_refresh() {
        return Err(SyncError::Credential {
            system,
            message: "token expired and cannot be refreshed".to_string(),
        });
    }

    let refreshed = refresher.refresh(system, credential).await?;
    if needs_refresh(&refreshed, Utc::now()) {
        return Err(SyncError::Credential {
            system,
            message: "refreshed token is already near expiry".to_string(),
        });
    }
    repo.store_credential(team, system, &refreshed).await?;
    info!(team = %team, system = %system, "credential refreshed");
    Ok(refreshed)
}
