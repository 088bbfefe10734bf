//! Durable job storage for Riposte.
//!
//! Three interchangeable backends behind one [`JobStore`]: a JSON file
//! with atomic renames, an embedded sqlite database, and a shared
//! coordination store (the same store the cluster layer uses). The
//! conformance suite in `tests/` runs identically against all three.

pub mod coord;
pub mod error;
pub mod file;
pub mod job_store;
pub mod shared;
pub mod sqlite;

pub use coord::{CoordStore, MemoryCoordStore, Score};
pub use error::{Result, StoreError};
pub use file::FileStore;
pub use job_store::{apply_status, JobStore, StoreStats};
pub use shared::{job_key, SharedStore};
pub use sqlite::SqliteStore;
