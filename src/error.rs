//! Error types for bokchoy operations.

use thiserror::Error;

/// Result type used throughout bokchoy.
pub type BokchoyResult<T> = Result<T, BokchoyError>;

/// Main error type for bokchoy operations.
#[derive(Error, Debug)]
pub enum BokchoyError {
    /// The broker could not be reached at all (ping or connect failure)
    #[error("Broker unavailable: {message}")]
    BrokerUnavailable {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A broker operation failed after the connection was established
    #[error("Broker error: {message}")]
    Broker {
        /// Error message, including queue/task context of the failed operation
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// User payload serialization/deserialization error
    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task envelope could not be encoded
    #[error("Task envelope encode error: {0}")]
    EnvelopeEncode(#[from] rmp_serde::encode::Error),

    /// Task envelope could not be decoded
    #[error("Task envelope decode error: {0}")]
    EnvelopeDecode(#[from] rmp_serde::decode::Error),

    /// Redis driver error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// The system is already running
    #[error("Bokchoy is already running")]
    AlreadyRunning,

    /// The system has not been started
    #[error("Bokchoy is not running")]
    NotRunning,

    /// Task lookup failed
    #[error("Task '{task_id}' not found in queue '{queue}'")]
    TaskNotFound {
        /// The queue that was searched
        queue: String,
        /// The task id that was not found
        task_id: String,
    },

    /// Error returned from a task handler (or synthesized from a panic)
    #[error("Handler failed: {message}")]
    Handler {
        /// Error message
        message: String,
    },
}

impl BokchoyError {
    /// Create a new broker error with an underlying cause.
    pub fn broker<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Broker {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new broker error without an underlying cause.
    pub fn broker_message(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new broker-unavailable error.
    pub fn unavailable<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::BrokerUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a handler error.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}
