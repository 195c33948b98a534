//! IMAP ingestion fleet: the ingestion control plane described in this
//! crate's accompanying specification. `app` wires the four core
//! components (Connection Pool, Session Monitor, Scheduler, Worker Fleet)
//! and the two adapters (Sink, Status Store) into a single [`app::AppContext`];
//! every other module is one component or a piece of the ambient stack
//! around it.

pub mod app;
pub mod config;
pub mod error;
pub mod mailbox_source;
pub mod metrics;
pub mod monitor;
pub mod observability;
pub mod pool;
pub mod scheduler;
pub mod sink;
pub mod status_store;
pub mod types;
pub mod worker;

pub use error::{IngestError, IngestResult};
