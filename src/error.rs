//! Error types for the transmission engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Regulation error: {0}")]
    Regulation(#[from] RegulationError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// DAC control-protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Not a status message")]
    NotAStatusMessage,

    #[error("Expected {expected} status fields, found {found}")]
    FieldCountMismatch { expected: usize, found: usize },

    #[error("Malformed status field: {field}")]
    MalformedField { field: &'static str },
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// Audio-level regulation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegulationError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Sample overflow while regulating to {target_db} dB")]
    Overflow { target_db: i32 },
}

/// Supervisor IPC errors
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Message encode failed: {0}")]
    Encode(String),

    #[error("Message decode failed: {0}")]
    Decode(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("IO failure: {0}")]
    Io(String),

    #[error("Dispatcher is not running")]
    DispatcherStopped,
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
