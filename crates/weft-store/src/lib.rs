//! Durable state for the analyzer: SQLite key-value tables with versioned
//! read-modify-write on top, plus a time-ordered session index.

pub mod cursor;
pub mod error;
pub mod kv;
pub mod record;
pub mod sessions;

pub use error::{StoreError, StoreResult};
pub use kv::KvStore;
pub use record::{Record, RecordStore, RetryPolicy};
pub use sessions::{Page, PageRequest, SessionIndex, SessionSummary};
