//! Error types for rsocket-guard

use thiserror::Error;

use crate::authenticator::AuthError;

/// Result type alias for rsocket-guard
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed metadata entry (truncated, bad UTF-8, unknown auth type)
    #[error("Metadata decode error: {0}")]
    Decode(String),

    /// Authentication failure
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Issuer verifier construction failed recently; retry after the window
    #[error("Issuer '{issuer}' unavailable, retry in {retry_after_secs}s")]
    IssuerUnavailable {
        /// Issuer URL the construction failed for
        issuer: String,
        /// Seconds until the next lookup retries construction
        retry_after_secs: u64,
    },

    /// Network or HTTP error while fetching a JWKS
    #[error("JWKS fetch error: {0}")]
    JwksFetch(#[from] reqwest::Error),

    /// No authorization rule permitted the exchange
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// A custom authorization decision function failed
    #[error("Authorization check failed: {0}")]
    AuthorizationCheck(String),
}
