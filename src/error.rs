//! Error types for lightgate

use std::io;

use thiserror::Error;

/// Result type alias for lightgate
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors.
///
/// Per-request authentication failures are *not* represented here; they
/// live in [`crate::auth::AuthError`] and never leave the admission layer.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate or key file could not be read or written
    #[error("Certificate IO error: {0}")]
    CertificateIo(String),

    /// Key or certificate generation failed
    #[error("Certificate generation error: {0}")]
    CertificateGeneration(String),

    /// Root key file could not be read, parsed or written
    #[error("Credential store error: {0}")]
    CredentialStore(String),

    /// Malformed request framing
    #[error("Framing error: {0}")]
    Framing(String),

    /// Tunnel handshake aborted
    #[error("Tunnel handshake error: {0}")]
    TunnelHandshake(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
