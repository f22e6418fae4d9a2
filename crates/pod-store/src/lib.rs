//! SQLite-backed persistence for the Pod Manager core.

pub mod sqlite;

pub use sqlite::SqliteRepository;
