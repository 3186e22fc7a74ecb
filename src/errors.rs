//! Error types for the bingo synchronization core
//!
//! Every failure here is recoverable: the worst case is a degraded
//! (offline or disconnected) mode, never a dead process.

use crate::game::types::CallKey;

/// Root error type for all bingo-sync operations
#[derive(Debug, thiserror::Error)]
pub enum BingoError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Host-side game lifecycle errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// Player-side card and call errors
    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    /// Transport errors
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Configuration loading and validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// Host controller errors
#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("Game has not been started")]
    NotStarted,

    #[error("Unknown bingo call: {0}")]
    UnknownCall(CallKey),
}

/// Player controller errors
#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error("Number {0} is not on this card")]
    NotOnCard(u8),

    #[error("The free space cannot be toggled")]
    FreeSpace,

    #[error("No cell at row {row}, column {col}")]
    NoSuchCell { row: usize, col: usize },

    #[error("Need at least {required} marked cells to call bingo (have {marked})")]
    NotEnoughMarks { marked: usize, required: usize },

    #[error("Host is not connected")]
    HostDisconnected,
}

/// Transport errors for both the local and the remote channel
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Remote operation failed: {0}")]
    Remote(String),

    #[error("Remote {op} did not complete within {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    #[error("Connection closed")]
    Closed,
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Unavailable(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigurationError {
    fn from(e: toml::de::Error) -> Self {
        ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e))
    }
}

impl From<url::ParseError> for ConfigurationError {
    fn from(e: url::ParseError) -> Self {
        ConfigurationError::ValidationFailed(format!("Invalid URL: {}", e))
    }
}

impl From<serde_json::Error> for BingoError {
    fn from(e: serde_json::Error) -> Self {
        BingoError::Sync(SyncError::Serialization(e))
    }
}

// Convenience type aliases for Results
pub type BingoResult<T> = Result<T, BingoError>;
pub type SyncResult<T> = Result<T, SyncError>;
