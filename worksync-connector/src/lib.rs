//! worksync connectors — one capability trait over both remote systems.
//!
//! - [`traits`] — [`Connector`], change pages, webhook deltas, schemas
//! - [`work_items`] — Source A (work-item tracker) over REST
//! - [`pages`] — Source B (property database) over REST
//! - [`memory`] — in-process connector for tests and dry runs
//! - [`retry`] — bounded exponential backoff shared by the REST connectors

pub mod error;
mod http;
pub mod memory;
pub mod pages;
pub mod retry;
pub mod traits;
pub mod work_items;

pub use error::{ConnectorError, ConnectorResult};
pub use memory::{CallCounts, MemoryConnector};
pub use pages::PagesConnector;
pub use retry::RetryPolicy;
pub use traits::{ChangePage, Connector, DeltaEvent, RemoteField, RemoteSchema};
pub use work_items::WorkItemsConnector;
