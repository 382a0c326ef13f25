//! Error types for the certificate authority and engine controller.

use thiserror::Error;

use crate::engine::EngineState;

/// Keypair, certificate generation, or signing failure.
///
/// Fatal to the operation that raised it; the store stays usable for
/// subsequent calls.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Keypair generation failed.
    #[error("keypair generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate parameter construction or self-signing failed.
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),

    /// Signing a leaf certificate with the root authority failed.
    #[error("certificate signing failed: {0}")]
    Signing(String),

    /// Assembling the per-host TLS server configuration failed.
    #[error("TLS configuration failed: {0}")]
    Tls(String),

    /// Persisting the root certificate PEM failed.
    #[error("failed to persist CA certificate: {0}")]
    Persist(#[from] std::io::Error),
}

/// OS trust-store install/revoke failure. Reported, non-fatal to the
/// engine: interception keeps working for clients that trust the root
/// manually.
#[derive(Debug, Error)]
pub enum TrustStoreError {
    /// The platform trust tooling could not be invoked.
    #[error("trust store tooling unavailable: {0}")]
    ToolUnavailable(String),

    /// The install command ran but did not succeed.
    #[error("trust store install failed: {0}")]
    InstallFailed(String),

    /// The revoke command ran but did not succeed.
    #[error("trust store revoke failed: {0}")]
    RevokeFailed(String),

    /// No trust-store implementation exists for this platform.
    #[error("no trust store support on this platform")]
    Unsupported,
}

/// Engine controller error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// CA construction or issuance failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// OS trust-store failure surfaced to the caller.
    #[error("trust store error: {0}")]
    Trust(#[from] TrustStoreError),

    /// IO error (list loading from file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation invoked in a state its contract does not allow.
    #[error("operation requires the engine to be {expected:?}, but it is {actual:?}")]
    Lifecycle {
        expected: EngineState,
        actual: EngineState,
    },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
