use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use worksync_core::{
    Direction, HistoryId, RunCounts, RunOutcome, SyncRun, SystemTag, TeamId, Trigger,
};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request, tagged by `cmd`.
///
/// ```text
/// {"cmd":"status"}
/// {"cmd":"sync","team":"acme","direction":"a-to-b","dry_run":true}
/// {"cmd":"webhook","team":"acme","system":"b","payload":{...}}
/// {"cmd":"stop"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    Status,
    Sync {
        team: TeamId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
        #[serde(default)]
        dry_run: bool,
    },
    Webhook {
        team: TeamId,
        system: SystemTag,
        payload: Value,
    },
    Stop,
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// What the daemon reports back about one finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub history_id: HistoryId,
    pub team: TeamId,
    pub trigger: Trigger,
    pub direction: Direction,
    pub dry_run: bool,
    #[serde(flatten)]
    pub outcome: RunOutcome,
    pub result: RunCounts,
    pub deleted: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&SyncRun> for RunSummary {
    fn from(run: &SyncRun) -> Self {
        Self {
            history_id: run.id.clone(),
            team: run.team.clone(),
            trigger: run.trigger,
            direction: run.direction,
            dry_run: run.dry_run,
            outcome: run.outcome.clone(),
            result: run.counts(),
            deleted: run.deleted,
            finished_at: run.finished_at,
        }
    }
}

/// Reply to a `webhook` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookReply {
    Ignored { reason: String },
    Ran { run: RunSummary },
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Query the daemon's status, retrying briefly while it is still binding.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &DaemonRequest::Status) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::Stop)?;
    response_into_data(response).map(|_| ())
}

/// Ask the daemon to run a manual pass for `team` and wait for it to finish.
pub fn request_sync(
    home: &Path,
    team: TeamId,
    direction: Option<Direction>,
    dry_run: bool,
) -> Result<RunSummary, DaemonError> {
    let response = send_request(
        home,
        &DaemonRequest::Sync {
            team,
            direction,
            dry_run,
        },
    )?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

/// Hand a webhook delivery to the daemon and wait for its single-record pass.
pub fn request_webhook(
    home: &Path,
    team: TeamId,
    system: SystemTag,
    payload: Value,
) -> Result<WebhookReply, DaemonError> {
    let response = send_request(
        home,
        &DaemonRequest::Webhook {
            team,
            system,
            payload,
        },
    )?;
    Ok(serde_json::from_value(response_into_data(response)?)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
