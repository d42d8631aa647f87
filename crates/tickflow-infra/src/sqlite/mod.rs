//! SQLite metadata layer.
//!
//! The metadata sink backed by SQLite with WAL mode and split read/write
//! connection pools. Holds summaries only; full audit records stay in the
//! pointer store.

pub mod metadata;
pub mod pool;

pub use metadata::SqliteMetadataSink;
pub use pool::DatabasePool;
