//! Single-credential HTTP Basic authentication.
//!
//! When `[auth]` is configured, every route except `/health` requires the
//! configured username and password. Credentials are compared through an
//! HMAC-SHA256 tag so the check runs in constant time.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use crate::config::AuthConfig;

type HmacSha256 = Hmac<Sha256>;

const TAG_KEY: &[u8] = b"chaos-basic-auth";

#[derive(Clone)]
pub struct Credentials {
    expected: Vec<u8>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            expected: tag(username, password),
        }
    }

    pub fn from_config(auth: Option<&AuthConfig>) -> Option<Self> {
        auth.map(|a| Self::new(&a.username, &a.password))
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        keyed_mac(username, password)
            .verify_slice(&self.expected)
            .is_ok()
    }

    /// Checks an `Authorization` header value of the form `Basic <base64>`.
    pub fn check_header(&self, value: &str) -> bool {
        let Some((scheme, encoded)) = value.trim().split_once(' ') else {
            return false;
        };
        if !scheme.eq_ignore_ascii_case("basic") {
            return false;
        }
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(text) = String::from_utf8(decoded) else {
            return false;
        };
        match text.split_once(':') {
            Some((user, pass)) => self.verify(user, pass),
            None => false,
        }
    }
}

fn tag(username: &str, password: &str) -> Vec<u8> {
    keyed_mac(username, password).finalize().into_bytes().to_vec()
}

fn keyed_mac(username: &str, password: &str) -> HmacSha256 {
    // HMAC takes keys of any length, so this cannot fail.
    let mut mac = HmacSha256::new_from_slice(TAG_KEY).expect("HMAC accepts any key length");
    mac.update(username.as_bytes());
    mac.update(b":");
    mac.update(password.as_bytes());
    mac
}

/// Axum middleware enforcing the credential. `None` disables the check.
pub async fn require_basic_auth(
    State(credentials): State<Option<Arc<Credentials>>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(credentials) = credentials else {
        return next.run(req).await;
    };
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| credentials.check_header(v))
        .unwrap_or(false);

    if authorized {
        next.run(req).await
    } else {
        tracing::debug!(path = %req.uri().path(), "rejected unauthenticated request");
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"chaos\"")],
            "authentication required",
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(user: &str, pass: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
    }

    #[test]
    fn verifies_exact_credentials() {
        let creds = Credentials::new("me", "s3cret:with:colons");
        assert!(creds.verify("me", "s3cret:with:colons"));
        assert!(!creds.verify("me", "s3cret"));
        assert!(!creds.verify("you", "s3cret:with:colons"));
    }

    #[test]
    fn parses_basic_header() {
        let creds = Credentials::new("me", "pw:x");
        assert!(creds.check_header(&header_for("me", "pw:x")));
        assert!(creds.check_header(&header_for("me", "pw:x").replace("Basic", "basic")));
        assert!(!creds.check_header(&header_for("me", "nope")));
        assert!(!creds.check_header("Bearer abc"));
        assert!(!creds.check_header("Basic !!!notbase64"));
        assert!(!creds.check_header("Basic"));
    }
}
