//! Configuration management
//!
//! Declarative configuration for the pipeline: trusted issuers, static
//! simple credentials, and the authorization rule list. Loaded from a YAML
//! file merged with `RSOCKET_GUARD_`-prefixed environment variables, then
//! compiled into the runtime types (`from_config` style: parse once,
//! evaluate many).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::authenticator::SimpleAuthenticator;
use crate::pipeline::GuardPipeline;
use crate::resolver::{IssuerRegistry, IssuerTrust, StaticTrust};
use crate::rules::{AccessCheck, Matcher, RuleChain};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    /// Trusted-issuer configuration
    pub trust: TrustConfig,
    /// Static simple-credential accounts
    pub simple_credentials: Vec<SimpleCredentialConfig>,
    /// Authorization rules, evaluated in listed order
    pub rules: Vec<RuleConfig>,
}

/// Trusted-issuer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Issuers allowed to be resolved lazily
    pub issuers: Vec<IssuerConfig>,
    /// How long a failed verifier construction blocks retries (seconds)
    pub retry_after_secs: u64,
    /// JWKS fetch timeout (seconds)
    pub fetch_timeout_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            issuers: Vec::new(),
            retry_after_secs: 30,
            fetch_timeout_secs: 10,
        }
    }
}

/// One trusted issuer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Issuer URL (tenant key, must equal the token `iss` claim)
    pub issuer: String,
    /// JWKS endpoint override; defaults to OIDC discovery convention
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Accepted audiences (empty = no restriction)
    #[serde(default)]
    pub audiences: Vec<String>,
}

/// One static simple-credential account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleCredentialConfig {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
    /// Authorities granted on successful authentication
    #[serde(default)]
    pub authorities: Vec<String>,
}

/// One declarative authorization rule
///
/// `match` is one of `setup`, `any_request`, `any_exchange`, or
/// `route:<pattern>`; `require` is one of `permit_all`, `authenticated`,
/// `authority:<name>`, or `any_authority:<a>,<b>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Matcher expression
    #[serde(rename = "match")]
    pub matcher: String,
    /// Access requirement expression
    pub require: String,
}

impl GuardConfig {
    /// Load configuration from an optional YAML file merged with
    /// `RSOCKET_GUARD_`-prefixed environment variables (nested keys split
    /// on `__`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file or environment cannot be
    /// parsed, or when validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(p) = path {
            figment = figment.merge(Yaml::file(p));
        }
        figment = figment.merge(Env::prefixed("RSOCKET_GUARD_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration without building anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unparseable issuer URLs, duplicate
    /// issuers or usernames, or malformed rule expressions.
    pub fn validate(&self) -> Result<()> {
        for issuer in &self.trust.issuers {
            let url = Url::parse(&issuer.issuer).map_err(|e| {
                Error::Config(format!("issuer '{}' is not a URL: {e}", issuer.issuer))
            })?;
            if url.scheme() != "https" {
                warn!(issuer = %issuer.issuer, "Trusted issuer is not HTTPS");
            }
            let duplicates = self
                .trust
                .issuers
                .iter()
                .filter(|i| i.issuer == issuer.issuer)
                .count();
            if duplicates > 1 {
                return Err(Error::Config(format!(
                    "issuer '{}' is listed more than once",
                    issuer.issuer
                )));
            }
        }

        for account in &self.simple_credentials {
            let duplicates = self
                .simple_credentials
                .iter()
                .filter(|a| a.username == account.username)
                .count();
            if duplicates > 1 {
                return Err(Error::Config(format!(
                    "username '{}' is listed more than once",
                    account.username
                )));
            }
        }

        // Rules must at least parse
        self.build_rules()?;
        Ok(())
    }

    /// Compile the declarative rule list into a [`RuleChain`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unknown matcher or requirement
    /// expressions.
    pub fn build_rules(&self) -> Result<RuleChain> {
        let mut chain = RuleChain::new();
        for rule in &self.rules {
            let matcher = parse_matcher(&rule.matcher)?;
            let check = parse_require(&rule.require)?;
            chain = chain.rule(matcher, check);
        }
        Ok(chain)
    }

    /// Compile the full configuration into a ready pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for any invalid part of the configuration.
    pub fn build_pipeline(&self) -> Result<GuardPipeline> {
        self.validate()?;

        let mut trust = StaticTrust::new();
        for issuer in &self.trust.issuers {
            trust = trust.with_issuer_trust(
                issuer.issuer.clone(),
                IssuerTrust {
                    jwks_uri: issuer.jwks_uri.clone(),
                    audiences: issuer.audiences.clone(),
                },
            );
        }
        let registry = IssuerRegistry::with_settings(
            trust,
            Duration::from_secs(self.trust.fetch_timeout_secs),
            Duration::from_secs(self.trust.retry_after_secs),
        );

        let mut simple = SimpleAuthenticator::new();
        for account in &self.simple_credentials {
            simple = simple.with_account(
                account.username.clone(),
                account.password.clone(),
                account.authorities.clone(),
            );
        }

        Ok(GuardPipeline::new(
            simple,
            Arc::new(registry),
            self.build_rules()?,
        ))
    }
}

fn parse_matcher(expr: &str) -> Result<Matcher> {
    match expr {
        "setup" => Ok(Matcher::Setup),
        "any_request" => Ok(Matcher::AnyRequest),
        "any_exchange" => Ok(Matcher::AnyExchange),
        other => match other.strip_prefix("route:") {
            Some(pattern) => Matcher::route(pattern),
            None => Err(Error::Config(format!("unknown matcher '{other}'"))),
        },
    }
}

fn parse_require(expr: &str) -> Result<AccessCheck> {
    match expr {
        "permit_all" => Ok(AccessCheck::PermitAll),
        "authenticated" => Ok(AccessCheck::Authenticated),
        other => {
            if let Some(name) = other.strip_prefix("authority:") {
                if name.is_empty() {
                    return Err(Error::Config("authority requirement is empty".to_string()));
                }
                Ok(AccessCheck::HasAuthority(name.to_string()))
            } else if let Some(names) = other.strip_prefix("any_authority:") {
                let authorities: Vec<String> = names
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if authorities.is_empty() {
                    return Err(Error::Config(
                        "any_authority requirement lists no authorities".to_string(),
                    ));
                }
                Ok(AccessCheck::HasAnyAuthority(authorities))
            } else {
                Err(Error::Config(format!("unknown requirement '{other}'")))
            }
        }
    }
}
