//! Credential authenticators
//!
//! Two authenticators back the pipeline: [`SimpleAuthenticator`] for static
//! username/password pairs and [`JwtAuthenticator`] for per-issuer bearer
//! token verification. Both produce a [`Principal`] or a typed [`AuthError`].
//!
//! # Verification flow (JWT)
//!
//! 1. Decode the JWT header (no verification) to select a key by `kid`.
//! 2. Verify the signature and standard claims (`exp`, `iss`) with a
//!    60-second clock leeway.
//! 3. Apply the audience restriction manually so both single-string and
//!    array `aud` forms are accepted.
//! 4. Map the claims into a [`Principal`]: `sub` becomes the name, the
//!    `authorities` claim plus the space-delimited `scope` claim become the
//!    granted authorities.

use std::collections::HashMap;

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::warn;

use crate::exchange::Principal;

/// Authentication failures.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Credentials did not verify (bad password, bad signature).
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// The token's `exp` claim is in the past.
    #[error("Token expired")]
    ExpiredToken,

    /// The token asserts an issuer outside the trusted set.
    #[error("Untrusted issuer: {0}")]
    UntrustedIssuer(String),

    /// The token could not be parsed at all.
    #[error("Malformed token: {0}")]
    MalformedToken(String),
}

/// Static username/password authenticator.
///
/// Passwords are compared in constant time to avoid leaking prefix length
/// through timing.
#[derive(Debug, Clone, Default)]
pub struct SimpleAuthenticator {
    accounts: HashMap<String, Account>,
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    authorities: Vec<String>,
}

impl SimpleAuthenticator {
    /// Create an empty authenticator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account (builder style).
    #[must_use]
    pub fn with_account(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        authorities: Vec<String>,
    ) -> Self {
        self.accounts.insert(
            username.into(),
            Account {
                password: password.into(),
                authorities,
            },
        );
        self
    }

    /// Authenticate a username/password pair.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for unknown usernames and
    /// password mismatches alike; the two are indistinguishable to callers.
    pub fn authenticate(&self, username: &str, password: &str) -> Result<Principal, AuthError> {
        let Some(account) = self.accounts.get(username) else {
            // Burn a comparison anyway so unknown users cost the same
            let _ = password.as_bytes().ct_eq(b"rsocket-guard-no-account");
            return Err(AuthError::InvalidCredentials);
        };

        if password
            .as_bytes()
            .ct_eq(account.password.as_bytes())
            .into()
        {
            Ok(Principal::new(username, account.authorities.clone()))
        } else {
            warn!(username = %username, "Simple credential mismatch");
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Whether any accounts are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Claims the JWT authenticator extracts from a verified token.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    /// Subject (user identifier)
    sub: Option<String>,
    /// Audience (single string or array)
    #[serde(default)]
    aud: serde_json::Value,
    /// Explicit authorities claim
    #[serde(default)]
    authorities: Vec<String>,
    /// Space-delimited scope string
    #[serde(default)]
    scope: Option<String>,
}

/// One decoding key, optionally pinned to a `kid`.
pub(crate) struct VerifierKey {
    pub(crate) kid: Option<String>,
    pub(crate) key: DecodingKey,
    pub(crate) alg: Algorithm,
}

/// Per-issuer JWT verifier.
///
/// Holds the issuer URL and the decoding keys resolved for it. Instances are
/// built by the issuer registry (lazily, from a fetched JWKS) or directly
/// from a shared secret or PEM key for tests and single-tenant setups.
pub struct JwtAuthenticator {
    issuer: String,
    keys: Vec<VerifierKey>,
    audiences: Vec<String>,
}

impl JwtAuthenticator {
    /// Build from a fetched JWKS.
    ///
    /// Symmetric keys in the set are skipped; a JWKS endpoint publishing
    /// octet keys is not usable for third-party verification.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedToken`] if the set yields no usable key.
    pub fn from_jwks(issuer: impl Into<String>, jwks: &JwkSet) -> Result<Self, AuthError> {
        let issuer = issuer.into();
        let mut keys = Vec::new();

        for jwk in &jwks.keys {
            let kid = jwk.common.key_id.clone();
            let (key, default_alg) = match &jwk.algorithm {
                AlgorithmParameters::RSA(rsa) => {
                    match DecodingKey::from_rsa_components(&rsa.n, &rsa.e) {
                        Ok(key) => (key, Algorithm::RS256),
                        Err(_) => continue,
                    }
                }
                AlgorithmParameters::EllipticCurve(ec) => {
                    match DecodingKey::from_ec_components(&ec.x, &ec.y) {
                        Ok(key) => (key, Algorithm::ES256),
                        Err(_) => continue,
                    }
                }
                AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => {
                    continue;
                }
            };
            let alg = jwk
                .common
                .key_algorithm
                .and_then(signing_algorithm)
                .unwrap_or(default_alg);
            keys.push(VerifierKey { kid, key, alg });
        }

        if keys.is_empty() {
            return Err(AuthError::MalformedToken(format!(
                "JWKS for '{issuer}' contains no usable verification key"
            )));
        }

        Ok(Self {
            issuer,
            keys,
            audiences: Vec::new(),
        })
    }

    /// Build from an HMAC shared secret (single key, `HS256`).
    #[must_use]
    pub fn from_hmac_secret(issuer: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            issuer: issuer.into(),
            keys: vec![VerifierKey {
                kid: None,
                key: DecodingKey::from_secret(secret),
                alg: Algorithm::HS256,
            }],
            audiences: Vec::new(),
        }
    }

    /// Build from an RSA public key in PEM form (`RS256`).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MalformedToken`] if the PEM is invalid.
    pub fn from_rsa_pem(issuer: impl Into<String>, pem: &[u8]) -> Result<Self, AuthError> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        Ok(Self {
            issuer: issuer.into(),
            keys: vec![VerifierKey {
                kid: None,
                key,
                alg: Algorithm::RS256,
            }],
            audiences: Vec::new(),
        })
    }

    /// Restrict accepted audiences (builder style). Empty = no restriction.
    #[must_use]
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    /// The issuer this verifier validates for.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Verify a bearer token and produce the authenticated principal.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MalformedToken`] when the token cannot be parsed or
    ///   lacks a `sub` claim.
    /// - [`AuthError::ExpiredToken`] when `exp` is in the past.
    /// - [`AuthError::InvalidCredentials`] for signature or claim mismatches.
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let header = jsonwebtoken::decode_header(token).map_err(map_jwt_error)?;

        // Prefer keys pinned to the token's kid; fall back to unpinned keys.
        let candidates: Vec<&VerifierKey> = match header.kid.as_deref() {
            Some(kid) => {
                let pinned: Vec<&VerifierKey> = self
                    .keys
                    .iter()
                    .filter(|k| k.kid.as_deref() == Some(kid))
                    .collect();
                if pinned.is_empty() {
                    self.keys.iter().filter(|k| k.kid.is_none()).collect()
                } else {
                    pinned
                }
            }
            None => self.keys.iter().collect(),
        };

        if candidates.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let mut last_err = AuthError::InvalidCredentials;
        for candidate in candidates {
            let validation = self.build_validation(candidate.alg);
            match jsonwebtoken::decode::<TokenClaims>(token, &candidate.key, &validation) {
                Ok(data) => return self.principal_from_claims(data.claims),
                Err(e) => last_err = map_jwt_error(e),
            }
        }
        Err(last_err)
    }

    fn build_validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = 60; // clock skew tolerance
        validation.set_issuer(&[&self.issuer]);
        // Audience is checked manually to accept both string and array forms
        validation.validate_aud = false;
        // Tokens without exp are allowed; exp is still enforced when present
        validation.required_spec_claims.clear();
        validation
    }

    fn principal_from_claims(&self, claims: TokenClaims) -> Result<Principal, AuthError> {
        if !self.audiences.is_empty() && !audience_matches(&claims.aud, &self.audiences) {
            warn!(issuer = %self.issuer, "Token audience not accepted");
            return Err(AuthError::InvalidCredentials);
        }

        let Some(sub) = claims.sub else {
            return Err(AuthError::MalformedToken(
                "token has no 'sub' claim".to_string(),
            ));
        };

        let mut authorities = claims.authorities;
        if let Some(scope) = claims.scope.as_deref() {
            for s in scope.split_whitespace() {
                if !authorities.iter().any(|a| a == s) {
                    authorities.push(s.to_string());
                }
            }
        }

        Ok(Principal::new(sub, authorities))
    }
}

/// Validate that an `aud` claim contains one of the expected audiences.
fn audience_matches(aud_claim: &serde_json::Value, expected: &[String]) -> bool {
    match aud_claim {
        serde_json::Value::String(s) => expected.iter().any(|e| e == s),
        serde_json::Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    }
}

/// Map a JWK `alg` hint onto a verification algorithm. Encryption-only
/// algorithms yield `None`.
fn signing_algorithm(ka: KeyAlgorithm) -> Option<Algorithm> {
    match ka {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// Map jsonwebtoken failures onto the pipeline's auth taxonomy.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => AuthError::MalformedToken(err.to_string()),
        _ => AuthError::InvalidCredentials,
    }
}
