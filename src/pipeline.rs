//! Interceptor pipeline
//!
//! Orchestrates extraction → authentication → authorization for every
//! connection-setup and request exchange:
//!
//! ```text
//! Unauthenticated → Authenticating → {Authenticated, Rejected}
//! Authenticated   → Authorizing    → {Permitted, Denied}
//! ```
//!
//! Setup-level rejection is terminal for the connection; request-level
//! denial rejects only that request. Exchanges are independent units of
//! work: every entry point takes `&self`, nothing blocks another exchange,
//! and dropping the returned future abandons the in-flight work without
//! persisting partial state. There are no retries inside the pipeline; all
//! failures surface as typed errors.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::authenticator::SimpleAuthenticator;
use crate::exchange::{Exchange, Principal};
use crate::metadata::{Credential, extract_credential, extract_route};
use crate::resolver::{IssuerRegistry, unverified_issuer};
use crate::rules::RuleChain;
use crate::{Error, Result};

/// The payload interceptor pipeline.
///
/// Holds the simple-credential table, the issuer registry for bearer tokens,
/// and the authorization rule chain. The issuer registry is the only shared
/// mutable state; it is safe to share one pipeline across all connections.
pub struct GuardPipeline {
    simple: SimpleAuthenticator,
    issuers: Arc<IssuerRegistry>,
    rules: RuleChain,
}

impl GuardPipeline {
    /// Assemble a pipeline from its parts.
    #[must_use]
    pub fn new(
        simple: SimpleAuthenticator,
        issuers: Arc<IssuerRegistry>,
        rules: RuleChain,
    ) -> Self {
        Self {
            simple,
            issuers,
            rules,
        }
    }

    /// The issuer registry, for runtime tenancy changes.
    #[must_use]
    pub fn issuers(&self) -> &Arc<IssuerRegistry> {
        &self.issuers
    }

    /// Process a connection-setup exchange.
    ///
    /// Extracts and authenticates the setup credential (absence means the
    /// connection proceeds anonymously), then evaluates the rule chain with
    /// setup scope. Returns the authenticated principal, which the transport
    /// should retain as the connection identity.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the connection: decode errors, authentication
    /// failures, and setup-rule denials all reject the setup.
    pub async fn accept_setup(&self, exchange: &mut Exchange) -> Result<Option<Principal>> {
        let outcome = self.run(exchange, None).await;
        match &outcome {
            Ok(principal) => {
                debug!(
                    principal = principal.as_ref().map_or("-", |p| p.name.as_str()),
                    "Connection setup accepted"
                );
            }
            Err(e) => {
                warn!(error = %e, "Connection setup rejected");
            }
        }
        outcome
    }

    /// Process a request exchange on an established connection.
    ///
    /// A request carrying its own credential is authenticated independently
    /// of the setup identity; a request without one runs as the
    /// `connection` principal (the identity `accept_setup` returned), or
    /// anonymously if there is none.
    ///
    /// # Errors
    ///
    /// Errors reject this request only; the connection stays up. The caller
    /// decides how to surface the denial to the requester.
    pub async fn permit_request(
        &self,
        exchange: &mut Exchange,
        connection: Option<&Principal>,
    ) -> Result<Option<Principal>> {
        let outcome = self.run(exchange, connection).await;
        if let Err(e) = &outcome {
            warn!(
                route = extract_route(exchange)
                    .ok()
                    .flatten()
                    .as_deref()
                    .unwrap_or("-"),
                error = %e,
                "Request denied"
            );
        }
        outcome
    }

    /// Shared extraction → authentication → authorization sequence.
    async fn run(
        &self,
        exchange: &mut Exchange,
        fallback: Option<&Principal>,
    ) -> Result<Option<Principal>> {
        let principal = match extract_credential(exchange)? {
            Some(credential) => Some(self.authenticate(credential).await?),
            None => fallback.cloned(),
        };

        let route = extract_route(exchange)?;
        self.rules
            .evaluate(exchange.kind(), route.as_deref(), principal.as_ref())?;

        if let Some(p) = &principal {
            exchange.set_principal(p.clone());
        }
        Ok(principal)
    }

    /// Authenticate one credential record.
    async fn authenticate(&self, credential: Credential) -> Result<Principal> {
        match credential {
            Credential::Simple { username, password } => {
                Ok(self.simple.authenticate(&username, &password)?)
            }
            Credential::Bearer(token) => {
                let issuer = unverified_issuer(&token)?;
                let verifier = self.issuers.resolve(&issuer).await?;
                Ok(verifier.verify(&token)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authenticator::{AuthError, JwtAuthenticator};
    use crate::metadata::{AUTHENTICATION_MIME, encode_bearer, encode_simple};
    use crate::resolver::StaticTrust;
    use crate::rules::AccessCheck;

    fn pipeline(rules: RuleChain) -> GuardPipeline {
        let simple = SimpleAuthenticator::new()
            .with_account("operator", "hunter2", vec!["SETUP".to_string()])
            .with_account("viewer", "view-only", vec![]);
        let registry = Arc::new(IssuerRegistry::new(StaticTrust::new()));
        GuardPipeline::new(simple, registry, rules)
    }

    fn permissive_rules() -> RuleChain {
        RuleChain::new().any_exchange(AccessCheck::PermitAll)
    }

    #[tokio::test]
    async fn setup_without_credential_is_anonymous() {
        let pipeline = pipeline(permissive_rules());
        let mut exchange = Exchange::setup();
        let principal = pipeline.accept_setup(&mut exchange).await.unwrap();
        assert!(principal.is_none());
        assert!(exchange.principal().is_none());
    }

    #[tokio::test]
    async fn setup_with_simple_credential_authenticates() {
        let pipeline = pipeline(permissive_rules());
        let mut exchange = Exchange::setup()
            .with_metadata(AUTHENTICATION_MIME, encode_simple("operator", "hunter2"));

        let principal = pipeline.accept_setup(&mut exchange).await.unwrap().unwrap();
        assert_eq!(principal.name, "operator");
        assert_eq!(exchange.principal().unwrap().name, "operator");
    }

    #[tokio::test]
    async fn setup_with_bad_password_is_rejected() {
        let pipeline = pipeline(permissive_rules());
        let mut exchange = Exchange::setup()
            .with_metadata(AUTHENTICATION_MIME, encode_simple("operator", "wrong"));

        let result = pipeline.accept_setup(&mut exchange).await;
        assert!(matches!(
            result,
            Err(Error::Auth(AuthError::InvalidCredentials))
        ));
    }

    #[tokio::test]
    async fn setup_with_malformed_metadata_is_rejected() {
        let pipeline = pipeline(permissive_rules());
        let mut exchange = Exchange::setup().with_metadata(AUTHENTICATION_MIME, &b"\x00"[..]);

        let result = pipeline.accept_setup(&mut exchange).await;
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn request_falls_back_to_connection_identity() {
        let rules = RuleChain::new().any_request(AccessCheck::Authenticated);
        let pipeline = pipeline(rules);

        let connection = Principal::new("operator", vec!["SETUP".to_string()]);
        let mut exchange = Exchange::request().with_route("fetch.feed");

        let principal = pipeline
            .permit_request(&mut exchange, Some(&connection))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.name, "operator");
    }

    #[tokio::test]
    async fn request_credential_overrides_connection_identity() {
        let pipeline = pipeline(permissive_rules());
        let connection = Principal::new("operator", vec![]);
        let mut exchange = Exchange::request()
            .with_metadata(AUTHENTICATION_MIME, encode_simple("viewer", "view-only"));

        let principal = pipeline
            .permit_request(&mut exchange, Some(&connection))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.name, "viewer");
    }

    #[tokio::test]
    async fn request_denial_is_not_connection_fatal() {
        // The pipeline returns an error for the denied request; the caller
        // keeps the connection and can process further requests.
        let rules = RuleChain::new().any_request(AccessCheck::Authenticated);
        let pipeline = pipeline(rules);

        let mut denied = Exchange::request();
        assert!(
            pipeline
                .permit_request(&mut denied, None)
                .await
                .is_err()
        );

        let connection = Principal::new("operator", vec![]);
        let mut allowed = Exchange::request();
        assert!(
            pipeline
                .permit_request(&mut allowed, Some(&connection))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn bearer_token_from_untrusted_issuer_is_rejected() {
        let pipeline = pipeline(permissive_rules());
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &serde_json::json!({ "iss": "https://evil.example.com", "sub": "mallory" }),
            &jsonwebtoken::EncodingKey::from_secret(b"whatever"),
        )
        .unwrap();

        let mut exchange =
            Exchange::request().with_metadata(AUTHENTICATION_MIME, encode_bearer(&token));
        let result = pipeline.permit_request(&mut exchange, None).await;
        assert!(matches!(
            result,
            Err(Error::Auth(AuthError::UntrustedIssuer(_)))
        ));
    }

    #[tokio::test]
    async fn bearer_token_against_registered_issuer_authenticates() {
        let issuer = "https://idp.example.com";
        let secret = b"signing-secret";
        let pipeline = pipeline(permissive_rules());
        pipeline.issuers().insert(
            issuer,
            Arc::new(JwtAuthenticator::from_hmac_secret(issuer, secret)),
        );

        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &serde_json::json!({ "iss": issuer, "sub": "alice", "scope": "profile.read" }),
            &jsonwebtoken::EncodingKey::from_secret(secret),
        )
        .unwrap();

        let mut exchange =
            Exchange::request().with_metadata(AUTHENTICATION_MIME, encode_bearer(&token));
        let principal = pipeline
            .permit_request(&mut exchange, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(principal.name, "alice");
        assert!(principal.has_authority("profile.read"));
    }
}
