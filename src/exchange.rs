//! Exchange and principal types
//!
//! An [`Exchange`] is one setup or request event flowing through the
//! pipeline: a route, a set of mime-tagged metadata entries, and a mutable
//! security-context slot that holds the authenticated [`Principal`] once the
//! pipeline has run.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Kind of exchange flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Connection setup. Rejection is terminal for the connection.
    Setup,
    /// An individual request on an established connection.
    Request,
    /// A generic exchange that is neither setup nor a routed request, such
    /// as a metadata push or fire-and-forget event.
    Other,
}

/// One setup or request event.
///
/// Created per incoming message by the transport and dropped after the
/// pipeline completes. Metadata entries map a mime type to an opaque byte
/// payload; the pipeline only interprets the entries it knows about.
#[derive(Debug, Clone)]
pub struct Exchange {
    kind: ExchangeKind,
    route: Option<String>,
    metadata: HashMap<String, Bytes>,
    security_context: Option<Principal>,
}

impl Exchange {
    /// Create a connection-setup exchange.
    #[must_use]
    pub fn setup() -> Self {
        Self {
            kind: ExchangeKind::Setup,
            route: None,
            metadata: HashMap::new(),
            security_context: None,
        }
    }

    /// Create a request exchange.
    #[must_use]
    pub fn request() -> Self {
        Self {
            kind: ExchangeKind::Request,
            route: None,
            metadata: HashMap::new(),
            security_context: None,
        }
    }

    /// Create a generic (non-setup, non-request) exchange.
    #[must_use]
    pub fn other() -> Self {
        Self {
            kind: ExchangeKind::Other,
            route: None,
            metadata: HashMap::new(),
            security_context: None,
        }
    }

    /// Set the route (builder style). Routes are dot or slash delimited,
    /// e.g. `fetch.profile.me`.
    #[must_use]
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// Attach a metadata entry (builder style).
    #[must_use]
    pub fn with_metadata(mut self, mime: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        self.metadata.insert(mime.into(), payload.into());
        self
    }

    /// The exchange kind.
    #[must_use]
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// The route this exchange targets, if any.
    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.route.as_deref()
    }

    /// Look up a metadata entry by mime type.
    #[must_use]
    pub fn metadata(&self, mime: &str) -> Option<&Bytes> {
        self.metadata.get(mime)
    }

    /// The authenticated principal, if the pipeline has set one.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.security_context.as_ref()
    }

    /// Store the authenticated principal in the security-context slot.
    pub fn set_principal(&mut self, principal: Principal) {
        self.security_context = Some(principal);
    }
}

/// Authenticated identity: a name plus the authorities granted to it.
///
/// Immutable once created; owned by the exchange's security context for the
/// exchange's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Identity name (username or token subject).
    pub name: String,
    /// Granted authorities.
    #[serde(default)]
    pub authorities: Vec<String>,
}

impl Principal {
    /// Create a principal with a set of authorities.
    pub fn new(name: impl Into<String>, authorities: Vec<String>) -> Self {
        Self {
            name: name.into(),
            authorities,
        }
    }

    /// Check whether this principal holds a specific authority.
    #[must_use]
    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.iter().any(|a| a == authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_lookup_by_mime() {
        let exchange = Exchange::request()
            .with_metadata("message/x.rsocket.routing.v0", &b"\x05hello"[..]);

        assert!(exchange.metadata("message/x.rsocket.routing.v0").is_some());
        assert!(exchange.metadata("application/json").is_none());
    }

    #[test]
    fn security_context_starts_empty() {
        let mut exchange = Exchange::setup();
        assert!(exchange.principal().is_none());

        exchange.set_principal(Principal::new("alice", vec!["SETUP".to_string()]));
        assert_eq!(exchange.principal().unwrap().name, "alice");
    }

    #[test]
    fn principal_authority_check() {
        let principal = Principal::new("bob", vec!["USER".to_string(), "ADMIN".to_string()]);
        assert!(principal.has_authority("ADMIN"));
        assert!(!principal.has_authority("SETUP"));
    }
}
