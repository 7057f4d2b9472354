use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Malformed frame: {0}")]
    Framing(String),

    #[error("Malformed {kind} payload: {reason}")]
    Payload { kind: &'static str, reason: String },

    #[error("Timed out resolving service '{0}'")]
    ResolutionTimeout(String),

    #[error("Service '{service}' could not be resolved: {reason}")]
    ResolutionFailed { service: String, reason: String },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),

    #[error("Identity rejected by {addr}: {message}")]
    HandshakeRejected { addr: SocketAddr, message: String },

    #[error("Identity {device_id} denied: {reason}")]
    AuthorizationDenied { device_id: String, reason: String },

    #[error("Timed out writing to {0}")]
    WriteTimeout(SocketAddr),

    #[error("Protocol violation from {peer}: {reason}")]
    ProtocolViolation { peer: SocketAddr, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LoggerError {
    /// Whether the error only invalidates a single frame.
    ///
    /// Framing and payload errors drop the offending frame; the connection
    /// stays open.
    pub fn is_frame_local(&self) -> bool {
        matches!(self, LoggerError::Framing(_) | LoggerError::Payload { .. })
    }
}

pub type Result<T> = std::result::Result<T, LoggerError>;
