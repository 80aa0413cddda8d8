//! Framework-neutral view of an incoming request.
//!
//! Host adapters map their native request type into a [`RequestContext`] at
//! the boundary; key builders and policy resolvers only ever see this shape.

use std::net::IpAddr;

use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// The request attributes rate limiting can key on.
#[derive(Debug, Clone)]
pub struct RequestContext {
    remote_addr: Option<IpAddr>,
    method: Method,
    path: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
}

impl RequestContext {
    /// Create a context for `method` on `path` with no address, headers or query.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            remote_addr: None,
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
        }
    }

    /// Build a context from an `http::Request` and the peer address.
    pub fn from_http<B>(request: &http::Request<B>, remote_addr: Option<IpAddr>) -> Self {
        let uri = request.uri();
        let mut context = Self::new(request.method().clone(), uri.path());
        context.remote_addr = remote_addr;
        context.headers = request.headers().clone();
        if let Some(query) = uri.query() {
            context = context.with_query(query);
        }
        context
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Add a header. Invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Parse a raw `a=1&b=2` query string and append its pairs.
    pub fn with_query(mut self, query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        self.query.extend(
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned())),
        );
        self
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}
