//! rollcall-store: SQLite persistence for enrolled face embeddings.
//!
//! Vectors are stored in the core codec's length-prefixed form, so the
//! database can be read back without knowing which model produced it.

mod sqlite;

pub use sqlite::{OwnerSummary, SqliteStore, SqliteStoreError};
