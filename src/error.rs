/// Centralized error types for the trading engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // Input Errors
    #[error("Invalid symbol name: {0}")]
    InvalidSymbolName(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid SL/TP: {0}")]
    InvalidSlTp(String),

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Symbol disabled: {0}")]
    SymbolDisabled(String),

    #[error("Stale quote for {symbol}: last tick {age_ms}ms old")]
    StaleQuote { symbol: String, age_ms: i64 },

    // Resource Errors
    #[error("Account disabled: {0}")]
    AccountDisabled(u64),

    #[error("Account not found: {0}")]
    AccountNotFound(u64),

    #[error("Insufficient margin: required {required:.2}, free {free:.2}")]
    InsufficientMargin { required: f64, free: f64 },

    #[error("Position not found: {0}")]
    PositionNotFound(u64),

    #[error("Order not found: {0}")]
    OrderNotFound(u64),

    // Policy Errors
    #[error("Fill-or-kill rejected: {0}")]
    FokRejected(String),

    #[error("Order expired: {0}")]
    Expired(u64),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    // Transient I/O Errors
    #[error("Write queue full for {0}")]
    WriteQueueFull(String),

    #[error("Disk I/O error: {0}")]
    DiskError(#[from] std::io::Error),

    #[error("Checkpoint busy: {0}")]
    CheckpointBusy(String),

    #[error("Sqlite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    // Fatal Errors
    #[error("Corrupt ledger: {0}")]
    CorruptLedger(String),

    #[error("Unwritable state directory: {0}")]
    UnwritableStateDir(String),

    // Ambient Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Transient errors are retried internally and only surfaced
    /// once the retry budget is exhausted.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::WriteQueueFull(_)
                | EngineError::DiskError(_)
                | EngineError::CheckpointBusy(_)
                | EngineError::SqliteError(_)
                | EngineError::Unavailable(_)
        )
    }

    /// Fatal errors abort the affected subsystem and surface to the
    /// process supervisor.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::CorruptLedger(_) | EngineError::UnwritableStateDir(_)
        )
    }

    /// Get stable error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            EngineError::InvalidSymbolName(_) => "IN_001",
            EngineError::InvalidVolume(_) => "IN_002",
            EngineError::InvalidPrice(_) => "IN_003",
            EngineError::InvalidSlTp(_) => "IN_004",
            EngineError::UnknownSymbol(_) => "IN_005",
            EngineError::SymbolDisabled(_) => "IN_006",
            EngineError::StaleQuote { .. } => "IN_007",
            EngineError::AccountDisabled(_) => "RES_001",
            EngineError::AccountNotFound(_) => "RES_002",
            EngineError::InsufficientMargin { .. } => "RES_003",
            EngineError::PositionNotFound(_) => "RES_004",
            EngineError::OrderNotFound(_) => "RES_005",
            EngineError::FokRejected(_) => "POL_001",
            EngineError::Expired(_) => "POL_002",
            EngineError::RateLimited(_) => "POL_003",
            EngineError::WriteQueueFull(_) => "IO_001",
            EngineError::DiskError(_) => "IO_002",
            EngineError::CheckpointBusy(_) => "IO_003",
            EngineError::SqliteError(_) => "IO_004",
            EngineError::CorruptLedger(_) => "FATAL_001",
            EngineError::UnwritableStateDir(_) => "FATAL_002",
            EngineError::ConfigError(_) => "CFG_001",
            EngineError::Serialization(_) => "SER_001",
            EngineError::WebSocket(_) => "WS_001",
            EngineError::Timeout(_) => "SYS_001",
            EngineError::Unavailable(_) => "SYS_002",
            EngineError::Internal(_) => "SYS_003",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(EngineError::WriteQueueFull("EURUSD".to_string()).is_transient());
        assert!(EngineError::CorruptLedger("seq regression".to_string()).is_fatal());
        assert!(!EngineError::InvalidVolume("0.013".to_string()).is_transient());
        assert!(!EngineError::InvalidVolume("0.013".to_string()).is_fatal());
    }

    #[test]
    fn test_error_codes_stable() {
        assert_eq!(
            EngineError::StaleQuote { symbol: "EURUSD".to_string(), age_ms: 6000 }.error_code(),
            "IN_007"
        );
        assert_eq!(EngineError::FokRejected("margin".to_string()).error_code(), "POL_001");
    }
}
