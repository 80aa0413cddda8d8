//! Key builder composed from configurable request fragments.

use std::fmt;
use std::sync::Arc;

use super::KeyBuilder;
use crate::error::BoxError;
use crate::request::RequestContext;

/// Custom key fragment derived from a request.
pub type Extractor = Arc<dyn Fn(&RequestContext) -> Result<String, BoxError> + Send + Sync>;

const DEFAULT_PREFIX: &str = "rl";

/// Builds keys from a fixed sequence of optional fragments.
///
/// Fragments are joined with `:` in this order: prefix, `ip:{ip}`,
/// `path:{path}`, `method:{method}`, `header:{name}={value}`, one
/// `param:{name}={value}` per configured query parameter, then the custom
/// extractor's output. A fragment whose value is absent from the request is
/// left out.
#[derive(Clone)]
pub struct SchemaKeyBuilder {
    prefix: String,
    ip: bool,
    path: bool,
    method: bool,
    header: Option<String>,
    params: Vec<String>,
    extractor: Option<Extractor>,
}

impl SchemaKeyBuilder {
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            ip: false,
            path: false,
            method: false,
            header: None,
            params: Vec::new(),
            extractor: None,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn ip(mut self, enabled: bool) -> Self {
        self.ip = enabled;
        self
    }

    pub fn path(mut self, enabled: bool) -> Self {
        self.path = enabled;
        self
    }

    pub fn method(mut self, enabled: bool) -> Self {
        self.method = enabled;
        self
    }

    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.header = Some(name.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }
}

impl Default for SchemaKeyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SchemaKeyBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaKeyBuilder")
            .field("prefix", &self.prefix)
            .field("ip", &self.ip)
            .field("path", &self.path)
            .field("method", &self.method)
            .field("header", &self.header)
            .field("params", &self.params)
            .field("extractor", &self.extractor.is_some())
            .finish()
    }
}

impl KeyBuilder for SchemaKeyBuilder {
    fn build(&self, request: &RequestContext) -> Result<String, BoxError> {
        let mut parts = vec![self.prefix.clone()];

        if self.ip {
            if let Some(addr) = request.remote_addr() {
                parts.push(format!("ip:{}", addr));
            }
        }

        if self.path {
            parts.push(format!("path:{}", request.path()));
        }

        if self.method {
            parts.push(format!("method:{}", request.method()));
        }

        if let Some(name) = &self.header {
            if let Some(value) = request.header(name).filter(|v| !v.is_empty()) {
                parts.push(format!("header:{}={}", name, value));
            }
        }

        for param in &self.params {
            if let Some(value) = request.query_param(param) {
                parts.push(format!("param:{}={}", param, value));
            }
        }

        if let Some(extractor) = &self.extractor {
            parts.push(extractor(request)?);
        }

        Ok(parts.join(":"))
    }
}
