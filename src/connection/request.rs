//! Read-only view of an incoming request.
//!
//! Transports fill a [`RequestViewBuilder`] from their wire format; the
//! builder parses the query string, cookies and url-encoded form body
//! once so handlers and filters can read them without re-parsing.

use std::collections::HashMap;
use std::net::IpAddr;

use bytes::Bytes;
use url::form_urlencoded;

use super::cookie::parse_cookie_header;

/// Split a URI path into its non-empty segments, ignoring any query string.
///
/// `"/a//b/c?x=1"` becomes `["a", "b", "c"]`.
pub fn split_path(uri: &str) -> Vec<String> {
    let path = uri.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join path segments back into `/seg/seg` form. The empty path is `/`.
pub fn join_path(segments: &[String]) -> String {
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// The request a handler sees.
#[derive(Debug, Clone)]
pub struct RequestView {
    method: String,
    uri: String,
    path: Vec<String>,
    original_path: Option<Vec<String>>,
    query_string: String,
    headers: HashMap<String, String>,
    env: HashMap<String, String>,
    query: Vec<(String, String)>,
    cookies: HashMap<String, String>,
    form: Vec<(String, String)>,
    body: Bytes,
    remote_addr: Option<IpAddr>,
    request_id: String,
}

impl RequestView {
    pub fn builder(method: impl Into<String>, uri: impl Into<String>) -> RequestViewBuilder {
        RequestViewBuilder {
            method: method.into(),
            uri: uri.into(),
            headers: HashMap::new(),
            env: HashMap::new(),
            body: Bytes::new(),
            remote_addr: None,
            request_id: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request URI as received, including the query string.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Current path segments. After a forward this is the rewritten path.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn path_string(&self) -> String {
        join_path(&self.path)
    }

    /// Path before a forward filter rewrote it, if one did.
    pub fn original_path(&self) -> Option<&[String]> {
        self.original_path.as_deref()
    }

    pub fn is_forwarded(&self) -> bool {
        self.original_path.is_some()
    }

    /// Extension of the last path segment, without the dot.
    pub fn extension(&self) -> Option<&str> {
        let last = self.path.last()?;
        let (_, ext) = last.rsplit_once('.')?;
        Some(ext)
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// Header value by case-insensitive name. Repeated headers are joined
    /// with `", "`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Transport environment value (CGI parameters, server address, ...).
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn env_map(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// First query parameter with the given name.
    pub fn query(&self, name: &str) -> Option<&str> {
        lookup(&self.query, name)
    }

    pub fn query_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        lookup_all(&self.query, name)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }

    /// First url-encoded form field with the given name.
    pub fn form(&self, name: &str) -> Option<&str> {
        lookup(&self.form, name)
    }

    pub fn form_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        lookup_all(&self.form, name)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Rewrite the path, remembering the original one.
    pub(crate) fn forward_to(&mut self, segments: Vec<String>) {
        let previous = std::mem::replace(&mut self.path, segments);
        self.original_path.get_or_insert(previous);
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn lookup_all<'a>(
    pairs: &'a [(String, String)],
    name: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    pairs
        .iter()
        .filter(move |(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Collects transport data before the view is frozen.
#[derive(Debug)]
pub struct RequestViewBuilder {
    method: String,
    uri: String,
    headers: HashMap<String, String>,
    env: HashMap<String, String>,
    body: Bytes,
    remote_addr: Option<IpAddr>,
    request_id: Option<String>,
}

impl RequestViewBuilder {
    /// Add a header. Names are stored lowercase; repeats are joined.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn build(self) -> RequestView {
        let query_string = self
            .uri
            .split_once('?')
            .map(|(_, query)| query.split('#').next().unwrap_or_default().to_string())
            .unwrap_or_default();
        let query = form_urlencoded::parse(query_string.as_bytes())
            .into_owned()
            .collect();

        let cookies = self
            .headers
            .get("cookie")
            .map(|header| parse_cookie_header(header).into_iter().collect())
            .unwrap_or_default();

        let is_form = self
            .headers
            .get("content-type")
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
        let form = if is_form {
            form_urlencoded::parse(&self.body).into_owned().collect()
        } else {
            Vec::new()
        };

        RequestView {
            path: split_path(&self.uri),
            original_path: None,
            method: self.method,
            uri: self.uri,
            query_string,
            headers: self.headers,
            env: self.env,
            query,
            cookies,
            form,
            body: self.body,
            remote_addr: self.remote_addr,
            request_id: self
                .request_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path_drops_empty_segments_and_query() {
        assert_eq!(split_path("/a//b/c?x=1"), vec!["a", "b", "c"]);
        assert!(split_path("/").is_empty());
        assert!(split_path("").is_empty());
        assert_eq!(join_path(&split_path("/x/y/")), "/x/y");
        assert_eq!(join_path(&[]), "/");
    }

    #[test]
    fn test_builder_parses_query_cookies_and_form() {
        let view = RequestView::builder("POST", "/submit/file.PHP?a=1&a=2&b=x%20y")
            .header("Cookie", "SESSION=abc; theme=dark")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("X-Forwarded-For", "10.0.0.1")
            .header("x-forwarded-for", "10.0.0.2")
            .body("name=Jo+Doe&empty=")
            .request_id("req-1")
            .build();

        assert_eq!(view.method(), "POST");
        assert_eq!(view.path(), ["submit", "file.PHP"]);
        assert_eq!(view.extension(), Some("PHP"));
        assert_eq!(view.query("a"), Some("1"));
        assert_eq!(view.query_all("a").collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(view.query("b"), Some("x y"));
        assert_eq!(view.cookie("SESSION"), Some("abc"));
        assert_eq!(view.form("name"), Some("Jo Doe"));
        assert_eq!(view.form("empty"), Some(""));
        assert_eq!(view.header("X-FORWARDED-FOR"), Some("10.0.0.1, 10.0.0.2"));
        assert_eq!(view.request_id(), "req-1");
    }

    #[test]
    fn test_forward_keeps_first_original_path() {
        let mut view = RequestView::builder("GET", "/old/x").build();
        assert!(!view.is_forwarded());
        view.forward_to(vec!["new".into(), "x".into()]);
        view.forward_to(vec!["newer".into()]);
        assert_eq!(view.path_string(), "/newer");
        assert_eq!(view.original_path(), Some(&["old".to_string(), "x".to_string()][..]));
    }

    #[test]
    fn test_non_form_body_is_not_parsed() {
        let view = RequestView::builder("POST", "/")
            .header("content-type", "application/json")
            .body("a=1")
            .build();
        assert!(view.form("a").is_none());
        assert_eq!(view.body().as_ref(), b"a=1");
        assert!(view.extension().is_none());
    }
}
