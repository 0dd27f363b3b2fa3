use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The database file could not be opened, created or locked in time.
    #[error("ledger unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("ledger schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A write transaction failed and was rolled back.
    #[error("ledger write failed: {0}")]
    WriteFailed(#[source] sqlx::Error),

    #[error("ledger query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A look-back window was non-positive or too large to represent.
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("command not allowed: {0}")]
    NotAllowed(String),

    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("operation timed out after {0}s")]
    Timeout(u64),

    #[error("invalid target address: {0}")]
    InvalidTarget(String),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery feed is not configured: {0}")]
    NotConfigured(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("discovery API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to read feed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode feed data: {0}")]
    Decode(#[from] serde_json::Error),
}
