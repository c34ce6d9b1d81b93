//! Error types for the vcsmirror core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Parser errors
// ---------------------------------------------------------------------------

/// Malformed upstream history. Never recovered locally: the source adapter
/// surfaces it as a fetch failure.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The XML stream is not well formed.
    #[error("malformed XML near byte {offset}: {detail}")]
    Xml { offset: usize, detail: String },

    /// A required attribute is missing from an element.
    #[error("element <{element}> is missing attribute '{attribute}'")]
    MissingAttribute { element: String, attribute: String },

    /// A timestamp could not be understood.
    #[error("unrecognized date '{0}'")]
    InvalidDate(String),

    /// A line-oriented log contains something unexpected.
    #[error("unexpected log line {line}: {detail}")]
    UnexpectedLine { line: usize, detail: String },

    /// The stream ended in the middle of a record.
    #[error("log ended prematurely: {0}")]
    Truncated(String),

    /// I/O error while reading the stream.
    #[error("log read error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Source errors
// ---------------------------------------------------------------------------

/// Errors from upstream (source) backends.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backend binary was not found on `$PATH`.
    #[error("{0} binary not found")]
    BinaryNotFound(String),

    /// A backend command exited with a non-zero status.
    #[error("{command} failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A transient failure persisted after every retry.
    #[error("{command} still failing after {attempts} attempts: {detail}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        detail: String,
    },

    /// The upstream history could not be parsed.
    #[error("upstream log could not be parsed: {0}")]
    Parse(#[from] ParseError),

    /// The requested revision does not exist upstream.
    #[error("upstream revision '{0}' not found")]
    RevisionNotFound(String),

    /// Generic I/O error.
    #[error("source I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Target errors
// ---------------------------------------------------------------------------

/// Errors from target backends.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The target repository does not exist.
    #[error("target repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// The target repository could not be created or prepared.
    #[error("target initialization failed: {0}")]
    InitializationFailed(String),

    /// A path operation referenced something outside the working tree.
    #[error("path '{0}' is not inside the working tree")]
    PathOutsideTree(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Generic I/O error.
    #[error("target I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Failures of the sync engine, one variant per failure class.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Upstream history could not be retrieved or parsed. Nothing was
    /// consumed from or added to the state store.
    #[error("fetch failed: {0}")]
    Fetch(#[source] SourceError),

    /// A changeset could not be replayed or committed. The state store is
    /// left as it was before this changeset; `changeset` holds its full
    /// rendering.
    #[error("failed to apply changeset {revision}: {source}")]
    Apply {
        revision: String,
        changeset: String,
        #[source]
        source: Box<CoreError>,
    },

    /// The target could not be prepared. No state was created.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// The state store already holds a cursor or pending changesets.
    #[error("already bootstrapped at revision {0}")]
    AlreadyBootstrapped(String),

    /// Bootstrap has not been performed yet.
    #[error("not bootstrapped: run bootstrap first")]
    NotBootstrapped,

    /// Another cycle is in progress on this engine.
    #[error("sync cycle already in progress")]
    AlreadyRunning,

    /// Cancellation was requested before the next checkpoint.
    #[error("cancelled before applying changeset {0}")]
    Cancelled(String),

    /// State store failure outside of a changeset application.
    #[error("sync state error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite state store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A stored changeset could not be (de)serialized.
    #[error("corrupt changeset record {seq}: {detail}")]
    CorruptRecord { seq: i64, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
