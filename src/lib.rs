//! rsocket-guard
//!
//! Payload-interceptor authentication and authorization pipeline for
//! RSocket-style exchanges.
//!
//! # Features
//!
//! - **Credential extraction**: simple (username/password) and bearer-token
//!   credentials decoded from mime-tagged per-stream metadata
//! - **Multi-tenant issuer resolution**: lazily constructed, cached JWT
//!   verifiers keyed by token issuer, with an explicit trust allow-list and
//!   runtime insert/remove
//! - **Ordered authorization rules**: first-match rule chain over setup,
//!   route, and generic exchanges, with `{name}` route variables bound into
//!   custom decision functions
//! - **Typed failures**: decode, authentication, and authorization errors
//!   are distinct; setup rejection is connection-fatal, request denial is
//!   per-request
//!
//! The transport layer is out of scope: it hands [`exchange::Exchange`]
//! values to a [`pipeline::GuardPipeline`] and acts on the typed outcome.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authenticator;
pub mod config;
pub mod error;
pub mod exchange;
pub mod metadata;
pub mod pipeline;
pub mod resolver;
pub mod route;
pub mod rules;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
