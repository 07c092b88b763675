//! Error types for mail-inflow.

use crate::poller::scheduler::SchedulerState;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by a mail client (the store/folder boundary).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MailError {
    #[error("No store provider for protocol {0}")]
    NoSuchProvider(String),

    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("Folder {0} not found")]
    FolderNotFound(String),

    #[error("Folder {0} is not open")]
    FolderClosed(String),

    #[error("Message {0} not found")]
    MessageNotFound(u32),

    #[error("Command failed: {0}")]
    Command(String),
}

/// The store could not be opened or closed cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to open {protocol} store on {host}: {source}")]
    Open {
        protocol: String,
        host: String,
        #[source]
        source: MailError,
    },

    #[error("Failed to open folder {folder}: {source}")]
    OpenFolder {
        folder: String,
        #[source]
        source: MailError,
    },

    #[error("Failed to close store: {0}")]
    Close(#[source] MailError),
}

/// A protocol-level operation on an open folder failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Failed to list messages in {folder}: {source}")]
    List {
        folder: String,
        #[source]
        source: MailError,
    },

    #[error("Failed to fetch message {seq}: {source}")]
    Fetch {
        seq: u32,
        #[source]
        source: MailError,
    },

    #[error("Failed to mark message {seq} consumed: {source}")]
    MarkConsumed {
        seq: u32,
        #[source]
        source: MailError,
    },

    #[error("Failed to close folder {folder}: {source}")]
    CloseFolder {
        folder: String,
        #[source]
        source: MailError,
    },
}

/// Seen-set persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// The fatal error that ended a poll cycle early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Seen set update failed: {0}")]
    SeenStore(#[from] DatabaseError),
}

impl CycleError {
    /// Short label used in logs and serialized outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Protocol(_) => "protocol",
            Self::SeenStore(_) => "seen_store",
        }
    }
}

/// Failure reported by a message consumer. Always treated as transient.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Consumer unavailable: {0}")]
    Unavailable(String),

    #[error("Delivery timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Consumer panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scheduler lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Cannot transition scheduler from {from} to {to}")]
    InvalidTransition {
        from: SchedulerState,
        to: SchedulerState,
    },

    #[error("Scheduler is not polling (state: {0})")]
    NotPolling(SchedulerState),

    #[error("Poll interval must be greater than zero")]
    InvalidInterval,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
