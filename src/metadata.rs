//! Credential and routing metadata decoding
//!
//! Implements the RSocket well-known per-stream metadata encodings the
//! pipeline consumes:
//!
//! - Authentication metadata (`message/x.rsocket.authentication.v0`): a
//!   leading auth-type byte with the high bit set for well-known types
//!   (`0x80` = simple, `0x81` = bearer), followed by the type-specific
//!   payload. Simple is a big-endian u16 username length, the username
//!   bytes, and the remainder as the password. Bearer is the token bytes.
//! - Routing metadata (`message/x.rsocket.routing.v0`): length-prefixed tags
//!   (u8 length + UTF-8 bytes); the first tag is the route.
//!
//! The extractor is deliberately quiet about absence: an exchange without an
//! authentication entry yields no credential, not an error. Malformed
//! entries yield [`Error::Decode`].

use bytes::{Buf, Bytes};

use crate::exchange::Exchange;
use crate::{Error, Result};

/// Mime type of the RSocket authentication metadata entry.
pub const AUTHENTICATION_MIME: &str = "message/x.rsocket.authentication.v0";

/// Mime type of the RSocket routing metadata entry.
pub const ROUTING_MIME: &str = "message/x.rsocket.routing.v0";

/// Well-known auth type byte for simple credentials (high bit set).
const AUTH_TYPE_SIMPLE: u8 = 0x80;

/// Well-known auth type byte for bearer tokens (high bit set).
const AUTH_TYPE_BEARER: u8 = 0x81;

/// A credential decoded from an exchange's authentication metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username/password pair.
    Simple {
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
    /// Opaque bearer token (typically a JWT).
    Bearer(String),
}

/// Extract zero or one credential from an exchange.
///
/// Returns `Ok(None)` when the exchange carries no authentication metadata.
///
/// # Errors
///
/// Returns [`Error::Decode`] when the entry is present but malformed:
/// truncated payload, invalid UTF-8, or an unsupported auth type byte.
pub fn extract_credential(exchange: &Exchange) -> Result<Option<Credential>> {
    let Some(payload) = exchange.metadata(AUTHENTICATION_MIME) else {
        return Ok(None);
    };
    decode_credential(payload).map(Some)
}

/// Decode an authentication metadata payload into a [`Credential`].
pub fn decode_credential(payload: &Bytes) -> Result<Credential> {
    let mut buf = payload.clone();

    if buf.remaining() < 1 {
        return Err(Error::Decode("empty authentication metadata".to_string()));
    }

    match buf.get_u8() {
        AUTH_TYPE_SIMPLE => decode_simple(&mut buf),
        AUTH_TYPE_BEARER => decode_bearer(&mut buf),
        other => Err(Error::Decode(format!(
            "unsupported auth type byte 0x{other:02x}"
        ))),
    }
}

fn decode_simple(buf: &mut Bytes) -> Result<Credential> {
    if buf.remaining() < 2 {
        return Err(Error::Decode(
            "simple credential truncated before username length".to_string(),
        ));
    }
    let username_len = buf.get_u16() as usize;
    if buf.remaining() < username_len {
        return Err(Error::Decode(format!(
            "simple credential username truncated: need {username_len} bytes, have {}",
            buf.remaining()
        )));
    }
    let username_bytes = buf.split_to(username_len);
    let username = utf8(&username_bytes, "username")?;
    let password = utf8(buf, "password")?;

    Ok(Credential::Simple { username, password })
}

fn decode_bearer(buf: &mut Bytes) -> Result<Credential> {
    if buf.is_empty() {
        return Err(Error::Decode("bearer token is empty".to_string()));
    }
    Ok(Credential::Bearer(utf8(buf, "bearer token")?))
}

/// Extract the route from an exchange.
///
/// Prefers the route set directly on the exchange; falls back to the first
/// tag of the routing metadata entry. Returns `Ok(None)` when neither is
/// present.
///
/// # Errors
///
/// Returns [`Error::Decode`] when the routing metadata is present but
/// malformed.
pub fn extract_route(exchange: &Exchange) -> Result<Option<String>> {
    if let Some(route) = exchange.route() {
        return Ok(Some(route.to_string()));
    }
    let Some(payload) = exchange.metadata(ROUTING_MIME) else {
        return Ok(None);
    };
    decode_route(payload).map(Some)
}

/// Decode the first tag of a routing metadata payload.
pub fn decode_route(payload: &Bytes) -> Result<String> {
    let mut buf = payload.clone();

    if buf.remaining() < 1 {
        return Err(Error::Decode("empty routing metadata".to_string()));
    }
    let tag_len = buf.get_u8() as usize;
    if tag_len == 0 {
        return Err(Error::Decode("routing tag has zero length".to_string()));
    }
    if buf.remaining() < tag_len {
        return Err(Error::Decode(format!(
            "routing tag truncated: need {tag_len} bytes, have {}",
            buf.remaining()
        )));
    }
    let tag = buf.split_to(tag_len);
    utf8(&tag, "route tag")
}

/// Encode a simple credential into authentication metadata bytes.
///
/// Provided for transports and tests that produce the wire form.
#[must_use]
pub fn encode_simple(username: &str, password: &str) -> Bytes {
    let mut out = Vec::with_capacity(3 + username.len() + password.len());
    out.push(AUTH_TYPE_SIMPLE);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(username.len() as u16).to_be_bytes());
    out.extend_from_slice(username.as_bytes());
    out.extend_from_slice(password.as_bytes());
    out.into()
}

/// Encode a bearer token into authentication metadata bytes.
#[must_use]
pub fn encode_bearer(token: &str) -> Bytes {
    let mut out = Vec::with_capacity(1 + token.len());
    out.push(AUTH_TYPE_BEARER);
    out.extend_from_slice(token.as_bytes());
    out.into()
}

/// Encode a route into routing metadata bytes (single tag).
#[must_use]
pub fn encode_route(route: &str) -> Bytes {
    let mut out = Vec::with_capacity(1 + route.len());
    #[allow(clippy::cast_possible_truncation)]
    out.push(route.len().min(255) as u8);
    out.extend_from_slice(&route.as_bytes()[..route.len().min(255)]);
    out.into()
}

fn utf8(bytes: &Bytes, what: &str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(ToString::to_string)
        .map_err(|_| Error::Decode(format!("{what} is not valid UTF-8")))
}
