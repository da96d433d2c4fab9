//! Error types for pg-large-notify

use thiserror::Error;

/// Result type for pg-large-notify operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// SQLSTATE raised by Postgres when a relation does not exist
const UNDEFINED_TABLE: &str = "42P01";

/// Errors that can occur while publishing, staging or resolving notifications
#[derive(Error, Debug)]
pub enum RelayError {
    /// Missing or invalid configuration (for example no resolvable secret)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Publish pool exhausted beyond the acquisition timeout
    #[error("Timed out waiting for a pooled database connection")]
    PoolTimeout,

    /// Opening or keeping a database connection failed
    #[error("Connection error: {0}")]
    Connection(#[source] sqlx::Error),

    /// Reference token failed its integrity check
    #[error("Reference token failed authentication")]
    Authentication,

    /// Staged payload was already reaped or never existed
    #[error("Staged payload {id} not found")]
    NotFound { id: i64 },

    /// Staging table does not exist yet
    #[error("Staging table is missing: {0}")]
    SchemaMissing(#[source] sqlx::Error),

    /// Payload cannot be carried by Postgres text
    #[error("Invalid payload: {reason}")]
    InvalidPayload { reason: String },

    /// Channel name cannot be used as a Postgres identifier
    #[error("Invalid channel name: {channel}")]
    InvalidChannel { channel: String },

    /// Listener task is not running
    #[error("Listener is not running")]
    NotListening,

    /// Any other database or query error
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Configuration source could not be read or deserialized
    #[error("Configuration source error: {0}")]
    Config(#[from] config::ConfigError),
}

impl From<sqlx::Error> for RelayError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(error),
            sqlx::Error::Database(ref db_error)
                if db_error.code().as_deref() == Some(UNDEFINED_TABLE) =>
            {
                Self::SchemaMissing(error)
            }
            other => Self::Database(other),
        }
    }
}

impl RelayError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid payload error
    pub fn invalid_payload<S: Into<String>>(reason: S) -> Self {
        Self::InvalidPayload {
            reason: reason.into(),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel<S: Into<String>>(channel: S) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
        }
    }

    /// Whether this failure only affects the message being resolved.
    ///
    /// The listener drops the message and keeps running for these.
    pub fn is_message_scoped(&self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::NotFound { .. } | Self::SchemaMissing(_)
        )
    }
}
