//! Suspended Runs
//!
//! Snapshots, their stores, and the manager that pauses, resumes and rolls
//! back runs.

pub mod manager;
pub mod snapshot;
pub mod store;

pub use manager::{recipe_mismatch, PauseManager, RollbackScope, INVALID_TOKEN_MESSAGE};
pub use snapshot::{ExecutorSnapshot, PauseSnapshot, RollbackRecord};
pub use store::{FileSessionStore, InMemorySessionStore, SessionStore};
