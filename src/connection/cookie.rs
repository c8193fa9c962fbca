//! Cookie values, attribute policy and `Set-Cookie` rendering.
//!
//! Names must be RFC 6265 tokens and contents must be cookie-octets.
//! Anything else is rejected before it can reach a response head.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::date::format_http_date;

/// `SameSite` attribute of a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    /// Attribute omitted.
    #[default]
    Off,
    Lax,
    Strict,
}

/// A cookie as set on a response.
///
/// Every attribute is optional. Attributes left unset fall back to the
/// response's cookie policy when the header is rendered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cookie {
    pub content: String,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<u64>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

impl Cookie {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn with_max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }
}

/// Rejected cookie input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CookieError {
    /// Name is empty or contains a non-token character.
    #[error("invalid cookie name: {0:?}")]
    InvalidName(String),

    /// Content contains a character outside the cookie-octet set.
    #[error("invalid content for cookie {0:?}")]
    InvalidContent(String),
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn is_cookie_octet(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'()*+-./:<=>?@[]^_`{|}~".contains(c)
}

/// Check a cookie name and content against RFC 6265.
pub fn validate(name: &str, content: &str) -> Result<(), CookieError> {
    if name.is_empty() || !name.chars().all(is_token_char) {
        return Err(CookieError::InvalidName(name.to_string()));
    }
    if !content.chars().all(is_cookie_octet) {
        return Err(CookieError::InvalidContent(name.to_string()));
    }
    Ok(())
}

/// Render the value of a `Set-Cookie` header. Attributes missing on the
/// cookie are taken from `policy`; boolean flags are OR-ed.
pub fn render_set_cookie(name: &str, cookie: &Cookie, policy: &Cookie) -> String {
    let mut out = format!("{}={}", name, cookie.content);

    if let Some(expires) = cookie.expires.or(policy.expires) {
        out.push_str("; Expires=");
        out.push_str(&format_http_date(expires));
    }
    if let Some(max_age) = cookie.max_age.or(policy.max_age) {
        out.push_str(&format!("; Max-Age={}", max_age));
    }
    if let Some(domain) = cookie.domain.as_ref().or(policy.domain.as_ref()) {
        out.push_str("; Domain=");
        out.push_str(domain);
    }
    if let Some(path) = cookie.path.as_ref().or(policy.path.as_ref()) {
        out.push_str("; Path=");
        out.push_str(path);
    }
    if cookie.secure || policy.secure {
        out.push_str("; Secure");
    }
    if cookie.http_only || policy.http_only {
        out.push_str("; HttpOnly");
    }
    let same_site = if cookie.same_site == SameSite::Off {
        policy.same_site
    } else {
        cookie.same_site
    };
    match same_site {
        SameSite::Off => {}
        SameSite::Lax => out.push_str("; SameSite=lax"),
        SameSite::Strict => out.push_str("; SameSite=strict"),
    }
    out
}

/// Split a request `Cookie` header into name/value pairs. Malformed
/// fragments are skipped.
pub fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}
