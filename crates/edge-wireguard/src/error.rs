//! Error types for WireGuard key and configuration handling.

use thiserror::Error;

/// Errors that can occur while handling WireGuard keys and configs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireGuardError {
    /// Invalid key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid endpoint address.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Structurally invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}

/// Result alias for WireGuard operations.
pub type Result<T> = std::result::Result<T, WireGuardError>;
