//! Ready-made key builders for common limiting scopes.

use super::KeyBuilder;
use crate::error::BoxError;
use crate::request::RequestContext;

const UNKNOWN_ADDR: &str = "unknown";

fn addr(request: &RequestContext) -> String {
    request
        .remote_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| UNKNOWN_ADDR.to_string())
}

/// One bucket per caller address and path: `ip:{ip}:path:{path}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpPathKeyBuilder;

impl KeyBuilder for IpPathKeyBuilder {
    fn build(&self, request: &RequestContext) -> Result<String, BoxError> {
        Ok(format!("ip:{}:path:{}", addr(request), request.path()))
    }
}

/// One bucket per caller address: `ip:{ip}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpKeyBuilder;

impl KeyBuilder for IpKeyBuilder {
    fn build(&self, request: &RequestContext) -> Result<String, BoxError> {
        Ok(format!("ip:{}", addr(request)))
    }
}

/// One bucket per HTTP method, shared by all callers: `method:{METHOD}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MethodKeyBuilder;

impl KeyBuilder for MethodKeyBuilder {
    fn build(&self, request: &RequestContext) -> Result<String, BoxError> {
        Ok(format!("method:{}", request.method()))
    }
}

/// A single bucket for all traffic.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalKeyBuilder;

impl KeyBuilder for GlobalKeyBuilder {
    fn build(&self, _request: &RequestContext) -> Result<String, BoxError> {
        Ok("global".to_string())
    }
}
