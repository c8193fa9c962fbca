//! Response state owned by a connection.
//!
//! Status, headers and cookies are mutable until the first flush. After
//! that every head mutation is ignored and only body bytes still flow.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use super::cookie::{self, render_set_cookie, Cookie, CookieError};
use super::sink::{FlushChunk, ResponseHead};

pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug)]
pub struct ResponseBuilder {
    status: Option<u16>,
    headers: BTreeMap<String, Vec<String>>,
    cookies: BTreeMap<String, Cookie>,
    cookie_policy: Cookie,
    body: BytesMut,
    flushed: bool,
    bytes_sent: u64,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "content-type".to_string(),
            vec![DEFAULT_CONTENT_TYPE.to_string()],
        );
        Self {
            status: None,
            headers,
            cookies: BTreeMap::new(),
            cookie_policy: Cookie::default(),
            body: BytesMut::new(),
            flushed: false,
            bytes_sent: 0,
        }
    }

    /// Effective status; 200 unless something set another one.
    pub fn status(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    pub fn status_is_set(&self) -> bool {
        self.status.is_some()
    }

    pub fn set_status(&mut self, status: u16) {
        if self.ignore_after_flush("status") {
            return;
        }
        self.status = Some(status);
    }

    /// First value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Replace all values of a header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        if self.ignore_after_flush("header") {
            return;
        }
        self.headers
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        if self.ignore_after_flush("header") {
            return;
        }
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn unset_header(&mut self, name: &str) {
        if self.ignore_after_flush("header") {
            return;
        }
        self.headers.remove(&name.to_ascii_lowercase());
    }

    /// Set a cookie. Invalid names or contents are rejected even after the
    /// head went out, so callers learn about bad input either way.
    pub fn set_cookie(&mut self, name: &str, cookie: Cookie) -> Result<(), CookieError> {
        cookie::validate(name, &cookie.content)?;
        if self.ignore_after_flush("cookie") {
            return Ok(());
        }
        self.cookies.insert(name.to_string(), cookie);
        Ok(())
    }

    pub fn unset_cookie(&mut self, name: &str) {
        if self.ignore_after_flush("cookie") {
            return;
        }
        self.cookies.remove(name);
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    /// Default attributes applied to every cookie that leaves them unset.
    pub fn set_cookie_policy(&mut self, policy: Cookie) {
        if self.ignore_after_flush("cookie policy") {
            return;
        }
        self.cookie_policy = policy;
    }

    /// Body bytes buffered since the last flush.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: impl AsRef<[u8]>) {
        self.body.clear();
        self.body.extend_from_slice(body.as_ref());
    }

    pub fn append_body(&mut self, bytes: impl AsRef<[u8]>) {
        self.body.extend_from_slice(bytes.as_ref());
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Body bytes handed to the sink so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Render the head as it would be sent now.
    pub fn head(&self) -> ResponseHead {
        let mut headers = Vec::with_capacity(self.headers.len() + self.cookies.len());
        for (name, values) in &self.headers {
            for value in values {
                headers.push((name.clone(), value.clone()));
            }
        }
        for (name, cookie) in &self.cookies {
            headers.push((
                "set-cookie".to_string(),
                render_set_cookie(name, cookie, &self.cookie_policy),
            ));
        }
        ResponseHead {
            status: self.status(),
            headers,
        }
    }

    /// Take everything pending. The first call includes the head and
    /// freezes it.
    pub(crate) fn take_chunk(&mut self) -> FlushChunk {
        let head = if self.flushed {
            None
        } else {
            self.flushed = true;
            Some(self.head())
        };
        let body: Bytes = self.body.split().freeze();
        self.bytes_sent += body.len() as u64;
        FlushChunk { head, body }
    }

    fn ignore_after_flush(&self, what: &str) -> bool {
        if self.flushed {
            debug!(what, "response already flushed, ignoring change");
        }
        self.flushed
    }
}
