//! Multi-tenant issuer resolution
//!
//! Maps token issuers to [`JwtAuthenticator`]s. Verifiers are constructed
//! lazily on first use — a JWKS discovery fetch — and cached; the mapping
//! supports runtime insertion and removal so tenants can come and go without
//! restarting the pipeline.
//!
//! # Security properties
//!
//! - An issuer outside the trust source never triggers a network call or a
//!   verifier construction; the lookup fails with `UntrustedIssuer`.
//! - JWKS is fetched only over HTTPS (enforced by the client builder).
//! - Entries are inserted only after the verifier is fully built, so a
//!   concurrent reader never observes a partially-initialized verifier.
//! - Construction failure is cached as a transient failure with a retry
//!   window; it never poisons the mapping permanently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jsonwebtoken::jwk::JwkSet;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::authenticator::{AuthError, JwtAuthenticator};
use crate::{Error, Result};

/// Trust settings for one issuer that is allowed to be constructed lazily.
#[derive(Debug, Clone, Default)]
pub struct IssuerTrust {
    /// JWKS endpoint override. Defaults to the OIDC discovery convention
    /// `<issuer>/.well-known/jwks.json`.
    pub jwks_uri: Option<String>,
    /// Accepted audiences. Empty = no restriction.
    pub audiences: Vec<String>,
}

/// Outcome of consulting the trust source for an issuer.
pub enum TrustDecision {
    /// Not trusted. No verifier will be constructed.
    Denied,
    /// Trusted; construct a verifier lazily from the issuer's JWKS.
    Allowed(IssuerTrust),
    /// Trusted with a pre-built verifier supplied by the caller.
    Prebuilt(Arc<JwtAuthenticator>),
}

/// Pluggable trusted-issuer lookup.
///
/// Implemented by [`StaticTrust`] for explicit configuration and by any
/// `Fn(&str) -> TrustDecision` closure for dynamic policies.
pub trait TrustSource: Send + Sync + 'static {
    /// Decide whether `issuer` is trusted and how to obtain its verifier.
    fn check(&self, issuer: &str) -> TrustDecision;
}

impl<F> TrustSource for F
where
    F: Fn(&str) -> TrustDecision + Send + Sync + 'static,
{
    fn check(&self, issuer: &str) -> TrustDecision {
        self(issuer)
    }
}

/// Explicit allow-list trust source.
#[derive(Debug, Clone, Default)]
pub struct StaticTrust {
    issuers: HashMap<String, IssuerTrust>,
}

impl StaticTrust {
    /// Create an empty allow-list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust an issuer with default settings (builder style).
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuers.insert(issuer.into(), IssuerTrust::default());
        self
    }

    /// Trust an issuer with explicit settings (builder style).
    #[must_use]
    pub fn with_issuer_trust(mut self, issuer: impl Into<String>, trust: IssuerTrust) -> Self {
        self.issuers.insert(issuer.into(), trust);
        self
    }
}

impl TrustSource for StaticTrust {
    fn check(&self, issuer: &str) -> TrustDecision {
        match self.issuers.get(issuer) {
            Some(trust) => TrustDecision::Allowed(trust.clone()),
            None => TrustDecision::Denied,
        }
    }
}

/// Cached state for one issuer.
enum IssuerEntry {
    /// Fully-built verifier, ready for use.
    Ready(Arc<JwtAuthenticator>),
    /// Construction failed recently; retry after the window elapses.
    Failed { at: Instant },
}

/// Issuer → verifier registry with concurrency-safe memoized construction.
///
/// Reads are lock-free (sharded map); writes insert only completed values.
/// Two concurrent first lookups of the same issuer may both fetch the JWKS,
/// but only one built verifier wins the insert and both callers receive that
/// same instance.
pub struct IssuerRegistry {
    trust: Arc<dyn TrustSource>,
    entries: DashMap<String, IssuerEntry>,
    http: reqwest::Client,
    retry_after: Duration,
}

impl IssuerRegistry {
    /// Create a registry over a trust source with default settings
    /// (10-second fetch timeout, 30-second failure retry window).
    #[must_use]
    pub fn new(trust: impl TrustSource) -> Self {
        Self::with_settings(trust, Duration::from_secs(10), Duration::from_secs(30))
    }

    /// Create a registry with explicit fetch timeout and retry window.
    #[must_use]
    pub fn with_settings(
        trust: impl TrustSource,
        fetch_timeout: Duration,
        retry_after: Duration,
    ) -> Self {
        Self {
            trust: Arc::new(trust),
            entries: DashMap::new(),
            http: reqwest::Client::builder()
                .https_only(true)
                .timeout(fetch_timeout)
                .build()
                .unwrap_or_default(),
            retry_after,
        }
    }

    /// Resolve the verifier for an issuer, constructing it on first use.
    ///
    /// Repeated lookups of a cached issuer return the same instance without
    /// re-triggering construction. Construction involves a network fetch and
    /// may suspend; callers on latency-sensitive paths should resolve ahead
    /// of dispatch or on a separate task.
    ///
    /// # Errors
    ///
    /// - [`Error::Auth`] with [`AuthError::UntrustedIssuer`] when the trust
    ///   source denies the issuer. No network call is made.
    /// - [`Error::IssuerUnavailable`] while a recent construction failure is
    ///   inside its retry window.
    /// - [`Error::JwksFetch`] / [`Error::Auth`] when construction fails; the
    ///   failure is cached for the retry window.
    pub async fn resolve(&self, issuer: &str) -> Result<Arc<JwtAuthenticator>> {
        if let Some(entry) = self.entries.get(issuer) {
            match &*entry {
                IssuerEntry::Ready(authenticator) => {
                    debug!(issuer = %issuer, "Issuer verifier cache hit");
                    return Ok(Arc::clone(authenticator));
                }
                IssuerEntry::Failed { at } => {
                    let elapsed = at.elapsed();
                    if elapsed < self.retry_after {
                        return Err(Error::IssuerUnavailable {
                            issuer: issuer.to_string(),
                            retry_after_secs: (self.retry_after - elapsed).as_secs().max(1),
                        });
                    }
                    // Window elapsed: fall through and retry construction
                }
            }
        }

        // Trust check happens before any network activity
        let trust = match self.trust.check(issuer) {
            TrustDecision::Denied => {
                warn!(issuer = %issuer, "Untrusted issuer rejected");
                return Err(AuthError::UntrustedIssuer(issuer.to_string()).into());
            }
            TrustDecision::Prebuilt(authenticator) => {
                return Ok(self.store_ready(issuer, authenticator));
            }
            TrustDecision::Allowed(trust) => trust,
        };

        match self.build_verifier(issuer, &trust).await {
            Ok(authenticator) => Ok(self.store_ready(issuer, Arc::new(authenticator))),
            Err(e) => {
                warn!(issuer = %issuer, error = %e, "Issuer verifier construction failed");
                self.entries
                    .insert(issuer.to_string(), IssuerEntry::Failed { at: Instant::now() });
                Err(e)
            }
        }
    }

    /// Insert a pre-built verifier at runtime (dynamic tenancy).
    ///
    /// Replaces any cached entry for the issuer.
    pub fn insert(&self, issuer: impl Into<String>, authenticator: Arc<JwtAuthenticator>) {
        self.entries
            .insert(issuer.into(), IssuerEntry::Ready(authenticator));
    }

    /// Remove an issuer at runtime (dynamic tenancy).
    ///
    /// Subsequent lookups fail until the issuer is re-added or re-trusted.
    /// Returns whether an entry was removed. In-flight exchanges holding the
    /// old verifier finish with it; removal affects new lookups only.
    pub fn remove(&self, issuer: &str) -> bool {
        self.entries.remove(issuer).is_some()
    }

    /// Whether a ready verifier is cached for the issuer.
    #[must_use]
    pub fn contains(&self, issuer: &str) -> bool {
        self.entries
            .get(issuer)
            .is_some_and(|e| matches!(&*e, IssuerEntry::Ready(_)))
    }

    /// Store a built verifier, keeping any verifier that won a concurrent
    /// race so repeated lookups stay idempotent.
    fn store_ready(
        &self,
        issuer: &str,
        authenticator: Arc<JwtAuthenticator>,
    ) -> Arc<JwtAuthenticator> {
        match self.entries.entry(issuer.to_string()) {
            Entry::Occupied(mut occupied) => {
                if let IssuerEntry::Ready(existing) = occupied.get() {
                    return Arc::clone(existing);
                }
                occupied.insert(IssuerEntry::Ready(Arc::clone(&authenticator)));
                authenticator
            }
            Entry::Vacant(vacant) => {
                vacant.insert(IssuerEntry::Ready(Arc::clone(&authenticator)));
                authenticator
            }
        }
    }

    /// Fetch the issuer's JWKS and build a verifier from it.
    async fn build_verifier(&self, issuer: &str, trust: &IssuerTrust) -> Result<JwtAuthenticator> {
        let jwks_uri = trust
            .jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(issuer));

        debug!(issuer = %issuer, "Fetching JWKS from {jwks_uri}");
        let jwks: JwkSet = self.http.get(&jwks_uri).send().await?.json().await?;

        let authenticator =
            JwtAuthenticator::from_jwks(issuer, &jwks)?.with_audiences(trust.audiences.clone());
        Ok(authenticator)
    }
}

/// Derive the default JWKS URI from the issuer URL using the OIDC discovery
/// convention.
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}

/// Claims needed before verification: the issuer for registry lookup.
#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: String,
}

/// Extract the `iss` claim from a JWT without verifying the signature.
///
/// Used only to pick the verifier; every claim is re-validated during
/// verification proper.
///
/// # Errors
///
/// Returns [`AuthError::MalformedToken`] for anything that does not parse as
/// a JWT payload with an `iss` claim.
pub fn unverified_issuer(token: &str) -> std::result::Result<String, AuthError> {
    let mut parts = token.splitn(3, '.');
    let (Some(_header), Some(payload), Some(_signature)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::MalformedToken(
            "token does not have three segments".to_string(),
        ));
    };

    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::MalformedToken("payload is not base64url".to_string()))?;

    let claims: UnverifiedClaims = serde_json::from_slice(&decoded)
        .map_err(|_| AuthError::MalformedToken("payload has no 'iss' claim".to_string()))?;

    Ok(claims.iss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

    fn prebuilt(issuer: &str) -> Arc<JwtAuthenticator> {
        Arc::new(JwtAuthenticator::from_hmac_secret(issuer, b"secret"))
    }

    #[tokio::test]
    async fn untrusted_issuer_never_resolves() {
        let registry = IssuerRegistry::new(StaticTrust::new());
        let result = registry.resolve("https://evil.example.com").await;
        assert!(matches!(
            result,
            Err(Error::Auth(AuthError::UntrustedIssuer(_)))
        ));
        assert!(!registry.contains("https://evil.example.com"));
    }

    #[tokio::test]
    async fn prebuilt_trust_resolves_without_network() {
        let issuer = "https://idp.example.com";
        let authenticator = prebuilt(issuer);
        let handed_out = Arc::clone(&authenticator);
        let registry = IssuerRegistry::new(move |iss: &str| {
            if iss == "https://idp.example.com" {
                TrustDecision::Prebuilt(Arc::clone(&handed_out))
            } else {
                TrustDecision::Denied
            }
        });

        let resolved = registry.resolve(issuer).await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &authenticator));
    }

    #[tokio::test]
    async fn cached_lookup_returns_same_instance() {
        let issuer = "https://idp.example.com";
        let registry = IssuerRegistry::new(StaticTrust::new());
        registry.insert(issuer, prebuilt(issuer));

        let first = registry.resolve(issuer).await.unwrap();
        let second = registry.resolve(issuer).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn removal_affects_subsequent_lookups_only() {
        let a = "https://a.example.com";
        let b = "https://b.example.com";
        let registry = IssuerRegistry::new(StaticTrust::new());
        registry.insert(a, prebuilt(a));
        registry.insert(b, prebuilt(b));

        assert!(registry.remove(b));
        assert!(registry.resolve(b).await.is_err());
        // A remains unaffected
        assert!(registry.resolve(a).await.is_ok());

        // Re-adding restores B
        registry.insert(b, prebuilt(b));
        assert!(registry.resolve(b).await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_lookups_observe_one_instance() {
        let issuer = "https://idp.example.com";
        let authenticator = prebuilt(issuer);
        let handed_out = Arc::clone(&authenticator);
        let registry = Arc::new(IssuerRegistry::new(move |_: &str| {
            TrustDecision::Prebuilt(Arc::clone(&handed_out))
        }));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.resolve("https://idp.example.com").await.unwrap()
            }));
        }

        for handle in handles {
            let resolved = handle.await.unwrap();
            assert!(Arc::ptr_eq(&resolved, &authenticator));
        }
    }

    #[test]
    fn default_jwks_uri_follows_discovery_convention() {
        assert_eq!(
            default_jwks_uri("https://idp.example.com"),
            "https://idp.example.com/.well-known/jwks.json"
        );
        // No double slash with a trailing slash
        assert_eq!(
            default_jwks_uri("https://idp.example.com/"),
            "https://idp.example.com/.well-known/jwks.json"
        );
    }

    #[test]
    fn unverified_issuer_reads_iss_claim() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({ "iss": "https://idp.example.com", "sub": "alice" }),
            &EncodingKey::from_secret(b"any"),
        )
        .unwrap();

        assert_eq!(
            unverified_issuer(&token).unwrap(),
            "https://idp.example.com"
        );
    }

    #[test]
    fn unverified_issuer_rejects_garbage() {
        assert!(matches!(
            unverified_issuer("not-a-jwt"),
            Err(AuthError::MalformedToken(_))
        ));
        assert!(matches!(
            unverified_issuer("a.b!!.c"),
            Err(AuthError::MalformedToken(_))
        ));
    }

    #[test]
    fn unverified_issuer_requires_iss() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({ "sub": "alice" }),
            &EncodingKey::from_secret(b"any"),
        )
        .unwrap();

        assert!(matches!(
            unverified_issuer(&token),
            Err(AuthError::MalformedToken(_))
        ));
    }
}
