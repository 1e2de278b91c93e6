use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::pre::relative_path;
use crate::pipeline::transforms::{apply_body_transform, cache_ttl, expand_vars};
use crate::pipeline::ChainBase;
use crate::proxy::CachedResponse;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Buffered upstream response flowing through the response processors.
/// Processors may replace headers or body; framing (content-length) is
/// fixed up when the body changes.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn set_body(&mut self, body: Bytes) {
        if let Ok(v) = http::HeaderValue::from_str(&body.len().to_string()) {
            self.headers.insert(http::header::CONTENT_LENGTH, v);
        }
        self.body = body;
    }
}

/// Response processors run in definition order after the upstream returns
/// (or the virtual endpoint synthesizes a response).
pub enum ResponseStep {
    HeaderInjector,
    BodyTransform,
    JqTransform,
    CacheWrite,
}

impl ResponseStep {
    pub fn name(&self) -> &'static str {
        match self {
            ResponseStep::HeaderInjector => "header_injector",
            ResponseStep::BodyTransform => "response_body_transform",
            ResponseStep::JqTransform => "response_transform_jq",
            ResponseStep::CacheWrite => "cache_write",
        }
    }

    pub fn process(
        &self,
        base: &ChainBase,
        ctx: &RequestCtx,
        resp: &mut UpstreamResponse,
    ) -> Result<(), ChainError> {
        match self {
            ResponseStep::HeaderInjector => header_injector(base, ctx, resp),
            ResponseStep::BodyTransform => body_transform(base, ctx, resp),
            ResponseStep::JqTransform => jq_transform(base, ctx, resp),
            ResponseStep::CacheWrite => cache_write(base, ctx, resp),
        }
    }
}

impl std::fmt::Debug for ResponseStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn header_injector(
    base: &ChainBase,
    ctx: &RequestCtx,
    resp: &mut UpstreamResponse,
) -> Result<(), ChainError> {
    let Some(version) = base.spec.version(ctx.version()) else {
        return Ok(());
    };
    let method = &ctx.request.method;
    let path = relative_path(ctx.request.path(), &base.spec.listen_path);

    for inject in &version.header_injects_response {
        if !inject.endpoint.matches(method, path) {
            continue;
        }
        for name in &inject.delete_headers {
            resp.headers.remove(name.to_ascii_lowercase().as_str());
        }
        for (name, value) in &inject.add_headers {
            let value = expand_vars(value, ctx);
            if let (Ok(name), Ok(value)) = (
                http::HeaderName::from_bytes(name.as_bytes()),
                http::HeaderValue::from_str(&value),
            ) {
                resp.headers.insert(name, value);
            } else {
                tracing::warn!(header = %name, "header_injector: skipping invalid header");
            }
        }
    }
    Ok(())
}

fn body_transform(
    base: &ChainBase,
    ctx: &RequestCtx,
    resp: &mut UpstreamResponse,
) -> Result<(), ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let merge = base.spec.version(ctx.version()).and_then(|version| {
        version
            .transforms_response
            .iter()
            .find(|t| t.endpoint.matches(&method, &path))
            .map(|t| t.merge.clone())
    });
    if let Some(merge) = merge {
        match apply_body_transform(&resp.body, &merge) {
            Ok(body) => resp.set_body(body),
            // A non-JSON upstream body passes through untransformed.
            Err(e) => tracing::debug!("response body transform skipped: {}", e.message),
        }
    }
    Ok(())
}

fn jq_transform(
    base: &ChainBase,
    ctx: &RequestCtx,
    resp: &mut UpstreamResponse,
) -> Result<(), ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let filter = base.spec.version(ctx.version()).and_then(|version| {
        version
            .jq_transforms_response
            .iter()
            .find(|t| t.endpoint.matches(&method, &path))
            .map(|t| t.filter.clone())
    });
    if let Some(filter) = filter {
        let body = base.jq.transform(&filter, &resp.body)?;
        resp.set_body(body);
    }
    Ok(())
}

/// Store a cacheable response under the key computed by the lookup step.
fn cache_write(
    base: &ChainBase,
    ctx: &RequestCtx,
    resp: &mut UpstreamResponse,
) -> Result<(), ChainError> {
    let Some(key) = ctx.cache_key() else {
        return Ok(());
    };
    if resp.status != StatusCode::OK {
        return Ok(());
    }
    let headers: Vec<(String, String)> = resp
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    base.response_cache.set(
        key,
        CachedResponse {
            status: resp.status.as_u16(),
            headers,
            body: resp.body.clone(),
        },
        Some(cache_ttl(base)),
    );
    Ok(())
}
