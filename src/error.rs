/// Centralized error types for the gateway client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    // Connection Errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to gateway")]
    NotConnected,

    #[error("Gateway disconnected: {0}")]
    Disconnected(String),

    // Request Errors
    #[error("Request {req_id} rejected: {code} - {message}")]
    RequestRejected {
        req_id: i32,
        code: i32,
        message: String,
    },

    #[error("Request send failed: {0}")]
    RequestFailed(String),

    // Contract / Parameter Errors
    #[error("Invalid contract: {0}")]
    InvalidContract(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    // Data Errors
    #[error("Parse error: {0}")]
    ParseError(String),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // File I/O Errors
    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    // System Errors
    #[error("Event channel closed: {0}")]
    ChannelClosed(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Check if the same call may succeed when issued again
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::ConnectionFailed(_)
                | GatewayError::Disconnected(_)
                | GatewayError::RequestFailed(_)
        )
    }

    /// Get error code for logging
    pub fn error_code(&self) -> &str {
        match self {
            GatewayError::ConnectionFailed(_) => "CONN_001",
            GatewayError::NotConnected => "CONN_002",
            GatewayError::Disconnected(_) => "CONN_003",
            GatewayError::RequestRejected { .. } => "REQ_001",
            GatewayError::RequestFailed(_) => "REQ_002",
            GatewayError::InvalidContract(_) => "PARAM_001",
            GatewayError::InvalidParameter(_) => "PARAM_002",
            GatewayError::ParseError(_) => "DATA_001",
            GatewayError::ConfigError(_) => "CFG_001",
            GatewayError::FileError(_) => "FILE_001",
            GatewayError::CsvError(_) => "FILE_002",
            GatewayError::ChannelClosed(_) => "SYS_001",
            GatewayError::InternalError(_) => "SYS_002",
        }
    }
}
