//! vcsmirror core library.
//!
//! Reads the history of an upstream repository (Subversion, darcs or CVS),
//! normalizes it into backend-agnostic [`Changeset`]s and replays them into
//! a git repository sharing the same working directory. Progress lives in a
//! SQLite state store so an interrupted run resumes where it stopped.

pub mod changeset;
pub mod commit_format;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod parser;
pub mod retry;
pub mod source;
pub mod target;

// Re-exports for convenience.
pub use changeset::{Changeset, Entry, EntryAction, EntryStatus};
pub use config::Config;
pub use db::Database;
pub use engine::{CancelFlag, ConflictDecision, Hooks, SyncEngine, SyncReport, SyncState};
pub use source::{build_source, SourceAdapter};
pub use target::{build_target, TargetAdapter};
