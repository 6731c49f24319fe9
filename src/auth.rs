//! Tunnel authentication header handling.
//!
//! Clients authenticate with `Authorization: HTTP2TCP <token>`; the scheme
//! is fixed and the token is a shared secret. In keyed mode the header is
//! not used at all (see [`crate::crypto`]).

/// The `Authorization` scheme shared by both tunnel variants.
pub const AUTH_SCHEME: &str = "HTTP2TCP";

/// The `Upgrade` protocol token of the stateless variant.
pub const UPGRADE_PROTOCOL: &str = "http2tcp/1.0";

/// Format the `Authorization` header value for a token.
#[must_use]
pub fn format_authorization(token: &str) -> String {
    format!("{AUTH_SCHEME} {token}")
}

/// Extract the token from an `Authorization` header value.
///
/// Returns `None` unless the value is exactly `HTTP2TCP <token>`.
#[must_use]
pub fn parse_authorization(value: &str) -> Option<&str> {
    let mut fields = value.split_whitespace();
    let scheme = fields.next()?;
    let token = fields.next()?;
    if scheme != AUTH_SCHEME || fields.next().is_some() {
        return None;
    }
    Some(token)
}

/// Check an `Authorization` header value against the expected token.
#[must_use]
pub fn authorize(value: Option<&str>, token: &str) -> bool {
    matches!(value.and_then(parse_authorization), Some(t) if t == token)
}
