//! Authorization rule chain
//!
//! An ordered list of matcher → access-check rules. Rules are evaluated in
//! registration order and exactly the first rule whose matcher accepts the
//! exchange decides the outcome; if no rule matches, the decision is deny.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::exchange::{ExchangeKind, Principal};
use crate::route::{RoutePattern, RouteVars};
use crate::{Error, Result};

/// Predicate selecting which exchanges a rule governs.
#[derive(Clone)]
pub enum Matcher {
    /// Connection-setup exchanges only.
    Setup,
    /// Any request exchange, regardless of route.
    AnyRequest,
    /// Every exchange, setup or request.
    AnyExchange,
    /// Request exchanges whose route matches the pattern. Matched `{name}`
    /// segments are bound into the check's variable context.
    Route(RoutePattern),
    /// Custom predicate over the exchange kind and route.
    Custom(Arc<dyn Fn(ExchangeKind, Option<&str>) -> bool + Send + Sync>),
}

impl Matcher {
    /// Parse a route pattern into a matcher.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid pattern.
    pub fn route(pattern: &str) -> Result<Self> {
        Ok(Self::Route(RoutePattern::parse(pattern)?))
    }

    /// Whether this matcher accepts the exchange; route matchers also return
    /// the bound variables.
    fn matches(&self, kind: ExchangeKind, route: Option<&str>) -> Option<RouteVars> {
        match self {
            Self::Setup => (kind == ExchangeKind::Setup).then(RouteVars::new),
            Self::AnyRequest => (kind == ExchangeKind::Request).then(RouteVars::new),
            Self::AnyExchange => Some(RouteVars::new()),
            Self::Route(pattern) => {
                if kind != ExchangeKind::Request {
                    return None;
                }
                pattern.matches(route?)
            }
            Self::Custom(predicate) => predicate(kind, route).then(RouteVars::new),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup => write!(f, "Setup"),
            Self::AnyRequest => write!(f, "AnyRequest"),
            Self::AnyExchange => write!(f, "AnyExchange"),
            Self::Route(pattern) => write!(f, "Route({})", pattern.source()),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Custom decision function: receives the principal (if authenticated) and
/// the variables bound by the rule's route matcher. Failure is an explicit
/// error, never an implicit permit or deny.
pub type CustomCheck =
    Arc<dyn Fn(Option<&Principal>, &RouteVars) -> std::result::Result<bool, String> + Send + Sync>;

/// Access requirement applied once a rule's matcher accepts an exchange.
#[derive(Clone)]
pub enum AccessCheck {
    /// Always permit, authenticated or not.
    PermitAll,
    /// Require any authenticated principal.
    Authenticated,
    /// Require a specific authority.
    HasAuthority(String),
    /// Require at least one of the listed authorities.
    HasAnyAuthority(Vec<String>),
    /// Custom decision function.
    Custom(CustomCheck),
}

impl AccessCheck {
    fn authorize(&self, principal: Option<&Principal>, vars: &RouteVars) -> Result<()> {
        match self {
            Self::PermitAll => Ok(()),
            Self::Authenticated => {
                if principal.is_some() {
                    Ok(())
                } else {
                    Err(Error::AuthorizationDenied(
                        "authentication required".to_string(),
                    ))
                }
            }
            Self::HasAuthority(authority) => match principal {
                Some(p) if p.has_authority(authority) => Ok(()),
                Some(p) => Err(Error::AuthorizationDenied(format!(
                    "principal '{}' lacks authority '{authority}'",
                    p.name
                ))),
                None => Err(Error::AuthorizationDenied(format!(
                    "authority '{authority}' requires authentication"
                ))),
            },
            Self::HasAnyAuthority(authorities) => match principal {
                Some(p) if authorities.iter().any(|a| p.has_authority(a)) => Ok(()),
                Some(p) => Err(Error::AuthorizationDenied(format!(
                    "principal '{}' holds none of {authorities:?}",
                    p.name
                ))),
                None => Err(Error::AuthorizationDenied(format!(
                    "one of {authorities:?} requires authentication"
                ))),
            },
            Self::Custom(check) => match check(principal, vars) {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::AuthorizationDenied(
                    "custom check denied".to_string(),
                )),
                Err(reason) => Err(Error::AuthorizationCheck(reason)),
            },
        }
    }
}

impl fmt::Debug for AccessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermitAll => write!(f, "PermitAll"),
            Self::Authenticated => write!(f, "Authenticated"),
            Self::HasAuthority(a) => write!(f, "HasAuthority({a})"),
            Self::HasAnyAuthority(a) => write!(f, "HasAnyAuthority({a:?})"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// One registered rule: a matcher and the check it applies.
#[derive(Debug, Clone)]
pub struct AuthorizationRule {
    matcher: Matcher,
    check: AccessCheck,
}

/// Ordered first-match authorization rule chain.
#[derive(Debug, Clone, Default)]
pub struct RuleChain {
    rules: Vec<AuthorizationRule>,
}

impl RuleChain {
    /// Create an empty chain. An empty chain denies everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule (builder style). Registration order is evaluation order.
    #[must_use]
    pub fn rule(mut self, matcher: Matcher, check: AccessCheck) -> Self {
        self.rules.push(AuthorizationRule { matcher, check });
        self
    }

    /// Append a setup-scoped rule.
    #[must_use]
    pub fn setup(self, check: AccessCheck) -> Self {
        self.rule(Matcher::Setup, check)
    }

    /// Append a route-scoped rule.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid route pattern.
    pub fn route(self, pattern: &str, check: AccessCheck) -> Result<Self> {
        Ok(self.rule(Matcher::route(pattern)?, check))
    }

    /// Append a rule matching any request exchange.
    #[must_use]
    pub fn any_request(self, check: AccessCheck) -> Self {
        self.rule(Matcher::AnyRequest, check)
    }

    /// Append a fallback rule matching every exchange.
    #[must_use]
    pub fn any_exchange(self, check: AccessCheck) -> Self {
        self.rule(Matcher::AnyExchange, check)
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the chain has no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the chain for one exchange.
    ///
    /// Rules are tried strictly in registration order; the first rule whose
    /// matcher accepts the exchange decides. No match means deny.
    ///
    /// # Errors
    ///
    /// - [`Error::AuthorizationDenied`] when the governing rule denies or no
    ///   rule matches.
    /// - [`Error::AuthorizationCheck`] when a custom decision function fails.
    pub fn evaluate(
        &self,
        kind: ExchangeKind,
        route: Option<&str>,
        principal: Option<&Principal>,
    ) -> Result<()> {
        for rule in &self.rules {
            if let Some(vars) = rule.matcher.matches(kind, route) {
                let decision = rule.check.authorize(principal, &vars);
                if let Err(e) = &decision {
                    warn!(
                        matcher = ?rule.matcher,
                        route = route.unwrap_or("-"),
                        error = %e,
                        "Authorization denied"
                    );
                }
                return decision;
            }
        }

        warn!(route = route.unwrap_or("-"), "No authorization rule matched");
        Err(Error::AuthorizationDenied(
            "no authorization rule matched the exchange".to_string(),
        ))
    }
}
