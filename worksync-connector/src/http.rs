//! Shared HTTP plumbing for the REST connectors.

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConnectorError, ConnectorResult};
use crate::retry::{parse_retry_after, RetryPolicy};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn build_client() -> ConnectorResult<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("worksync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ConnectorError::Config {
            message: format!("failed to build HTTP client: {e}"),
        })
}

/// Send the request produced by `build` under `policy`, decoding a JSON body.
///
/// `build` is invoked once per attempt. Empty bodies decode to `Value::Null`.
pub(crate) async fn send_json<F>(
    policy: &RetryPolicy,
    operation: &str,
    build: F,
) -> ConnectorResult<Value>
where
    F: Fn() -> RequestBuilder,
{
    policy
        .run(operation, || {
            let request = build();
            async move {
                let response = request.send().await?;
                let status = response.status();
                let retry_after = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body = response.text().await?;
                debug!(operation, status = %status, "remote response");

                if !status.is_success() {
                    return Err(classify_status(status, &body, retry_after));
                }
                if body.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(&body)
                    .map_err(|e| ConnectorError::invalid_payload(format!("{operation}: {e}")))
            }
        })
        .await
}

/// Map a non-success status onto the connector error taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> ConnectorError {
    let message = format!("HTTP {status}: {}", error_message(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ConnectorError::Unauthorized { message }
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => ConnectorError::NotFound { resource: message },
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::Transient {
            message,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => ConnectorError::Timeout { message },
        s if s.is_server_error() => ConnectorError::Transient {
            message,
            retry_after,
        },
        _ => ConnectorError::Rejected { message },
    }
}

/// Pull a human-readable message out of a JSON error body, if there is one.
fn error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.chars().take(200).collect())
}
