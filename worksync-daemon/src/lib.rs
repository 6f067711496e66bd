//! worksync daemon: per-team interval scheduler plus a local socket trigger surface.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_status, request_stop, request_sync, request_webhook, send_request, DaemonRequest,
    DaemonResponse, RunSummary, WebhookReply,
};
pub use runtime::{init_tracing, run, serve, start_blocking, LastRuns};
