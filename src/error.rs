//! Error types for the DriftMQ client library

/// Main error type for DriftMQ client operations
#[derive(Debug, thiserror::Error)]
pub enum DriftmqClientError {
    /// Broker lookup failed
    #[error("Lookup failed: {message}")]
    LookupFailed { message: String },

    /// Subscribe RPC failed
    #[error("Subscribe failed: {message}")]
    SubscribeFailed { message: String },

    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Error response from the broker
    #[error("Broker error {error}: {message}")]
    BrokerError { error: String, message: String },

    /// The broker answered with a response type the client did not ask for
    #[error("Unexpected response type: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    /// Message header failed to parse
    #[error("Checksum mismatch in message header")]
    ChecksumMismatch,

    /// Payload decompression failed
    #[error("Decompression error: {message}")]
    DecompressionError { message: String },

    /// Payload decryption failed
    #[error("Decryption error: {message}")]
    DecryptionError { message: String },

    /// A batch entry failed to parse
    #[error("Batch deserialization error: {message}")]
    BatchDeserializeError { message: String },

    /// The consumer is closing or has closed
    #[error("Consumer is closing or closed")]
    ConsumerClosed,

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Wire-protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriftmqClientError {
    /// Create a new lookup error
    pub fn lookup_failed<S: Into<String>>(message: S) -> Self {
        Self::LookupFailed {
            message: message.into(),
        }
    }

    /// Create a new subscribe error
    pub fn subscribe_failed<S: Into<String>>(message: S) -> Self {
        Self::SubscribeFailed {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new broker error
    pub fn broker<E: Into<String>, S: Into<String>>(error: E, message: S) -> Self {
        Self::BrokerError {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Create a new decompression error
    pub fn decompression<S: Into<String>>(message: S) -> Self {
        Self::DecompressionError {
            message: message.into(),
        }
    }

    /// Create a new decryption error
    pub fn decryption<S: Into<String>>(message: S) -> Self {
        Self::DecryptionError {
            message: message.into(),
        }
    }

    /// Create a new batch deserialization error
    pub fn batch_deserialize<S: Into<String>>(message: S) -> Self {
        Self::BatchDeserializeError {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying under back-off
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LookupFailed { .. }
                | Self::SubscribeFailed { .. }
                | Self::Connection { .. }
                | Self::Io(_)
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }
}
