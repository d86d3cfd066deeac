//! Error types shared across Duet crates.

/// Failures while provisioning or persisting the bearer token.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The identity endpoint answered with a non-2xx status.
    #[error("Identity service returned {status}")]
    Status { status: u16 },

    /// The identity endpoint answered 2xx but without a usable token.
    #[error("Identity service response had no token")]
    MissingToken,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for credential operations.
pub type CredentialResult<T> = Result<T, CredentialError>;
