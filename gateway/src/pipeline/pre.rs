use crate::ctx::RequestCtx;
use crate::error::{ChainError, StoreError};
use crate::pipeline::{unix_now, ChainBase, StepResult};
use crate::proxy::full_body;
use http::{Method, Response, StatusCode};
use ipnetwork::IpNetwork;

pub(crate) fn store_unavailable(e: StoreError) -> ChainError {
    tracing::warn!("storage error on session-required path: {}", e);
    ChainError::upstream(StatusCode::SERVICE_UNAVAILABLE, "Storage unavailable")
}

/// Answer CORS preflight locally instead of burdening the upstream.
pub fn cors_preflight(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let cors = &base.spec.def.cors;
    if ctx.request.method != Method::OPTIONS {
        return Ok(StepResult::Continue);
    }

    let mut builder = Response::builder().status(StatusCode::OK);
    let origin = ctx.request.header("origin").unwrap_or("*");
    let allowed_origin = if cors.allowed_origins.is_empty()
        || cors.allowed_origins.iter().any(|o| o == "*" || o == origin)
    {
        origin
    } else {
        // Origin not allowed: answer the preflight without CORS headers.
        return Ok(StepResult::Respond(
            builder.body(full_body("")).unwrap(),
        ));
    };

    builder = builder.header("access-control-allow-origin", allowed_origin);
    if !cors.allowed_methods.is_empty() {
        builder = builder.header(
            "access-control-allow-methods",
            cors.allowed_methods.join(", "),
        );
    }
    if !cors.allowed_headers.is_empty() {
        builder = builder.header(
            "access-control-allow-headers",
            cors.allowed_headers.join(", "),
        );
    }
    Ok(StepResult::Respond(builder.body(full_body("")).unwrap()))
}

/// Pre-auth throttle guard: a request re-queued past its throttle ceiling
/// is rejected before any further work.
pub fn rate_check(_base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    if let Some(limit) = ctx.throttle_limit() {
        if ctx.throttle_depth() > limit {
            return Err(ChainError::rate_limited("Throttle limit exceeded"));
        }
    }
    Ok(StepResult::Continue)
}

pub fn ip_allow_list(
    _base: &ChainBase,
    ctx: &RequestCtx,
    allowed: &[IpNetwork],
) -> Result<StepResult, ChainError> {
    let ip = ctx.request.client_ip();
    if allowed.iter().any(|net| net.contains(ip)) {
        return Ok(StepResult::Continue);
    }
    Err(ChainError::policy(
        "access from this IP has been disallowed",
    ))
}

pub fn ip_deny_list(
    _base: &ChainBase,
    ctx: &RequestCtx,
    blocked: &[IpNetwork],
) -> Result<StepResult, ChainError> {
    let ip = ctx.request.client_ip();
    if blocked.iter().any(|net| net.contains(ip)) {
        return Err(ChainError::policy(
            "access from this IP has been disallowed",
        ));
    }
    Ok(StepResult::Continue)
}

/// Mutual-TLS client check. The TLS terminator in front of the gateway
/// forwards the peer certificate digest; it must be on the spec's list.
pub fn certificate_check(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let fingerprint = ctx
        .request
        .header("x-client-cert-fingerprint")
        .unwrap_or("");
    if fingerprint.is_empty() {
        return Err(ChainError::policy("Client TLS certificate is required"));
    }
    if !base
        .spec
        .def
        .client_certificates
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(fingerprint))
    {
        return Err(ChainError::policy("Certificate with this SHA256 fingerprint not allowed"));
    }
    Ok(StepResult::Continue)
}

/// Organisation-level gate: an inactive org, or one over its quota window,
/// rejects every request regardless of the caller's own session.
pub async fn org_monitor(base: &ChainBase, _ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let org_id = &base.spec.def.org_id;
    if org_id.is_empty() {
        return Ok(StepResult::Continue);
    }
    let org = match base.org_sessions.session_by_hash(org_id).await {
        Ok(Some(org)) => org,
        // No org record means no org-level restrictions.
        Ok(None) => return Ok(StepResult::Continue),
        Err(e) => {
            // Org data is advisory: a storage blip must not take the API down.
            tracing::warn!(org_id = %org_id, "org_monitor: storage error, skipping check: {}", e);
            return Ok(StepResult::Continue);
        }
    };

    if org.is_inactive {
        return Err(ChainError::policy(
            "This organisation access has been disabled, please contact your API administrator",
        ));
    }
    let now = unix_now();
    if org.quota_max > 0 && org.quota_remaining <= 0 && now < org.quota_renews {
        return Err(ChainError::policy(
            "This organisation quota has been exceeded, please contact your API administrator",
        ));
    }
    Ok(StepResult::Continue)
}

/// Resolve the requested version, enforce its expiry, and apply the
/// version's path statuses (black / white / ignored).
pub fn version_check(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let spec = &base.spec;

    let requested = if spec.def.version_data.not_versioned {
        None
    } else if ctx.version().is_some() {
        // A nested loop dispatch may have cleared or pre-set the version.
        ctx.version().map(str::to_string)
    } else {
        let vd = &spec.def.version_definition;
        let found = match vd.location.as_str() {
            "url-param" => ctx.request.query_param(&vd.key),
            "url" => first_segment_after(&ctx.request.path(), &spec.listen_path),
            _ => ctx.request.header(&vd.key).map(str::to_string),
        };
        match found {
            Some(v) => Some(v),
            None if !spec.def.version_data.default_version.is_empty() => {
                Some(spec.def.version_data.default_version.clone())
            }
            None => {
                return Err(ChainError::policy("Version information not found"));
            }
        }
    };

    let version = spec
        .version(requested.as_deref())
        .ok_or_else(|| ChainError::policy("This API version does not seem to exist"))?;

    if version.expired(chrono::Utc::now()) {
        return Err(ChainError::policy("API version has expired"));
    }

    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &spec.listen_path);

    if version.black_list.iter().any(|e| e.matches(&method, path)) {
        return Err(ChainError::policy("Requested endpoint is forbidden"));
    }
    if !version.white_list.is_empty()
        && !version.white_list.iter().any(|e| e.matches(&method, path))
    {
        return Err(ChainError::policy("Requested endpoint is forbidden"));
    }
    if version.ignored.iter().any(|e| e.matches(&method, path)) {
        ctx.set_ignore_auth();
    }

    let resolved = if version.name.is_empty() {
        "Default".to_string()
    } else {
        version.name.clone()
    };
    ctx.set_version(Some(resolved));
    Ok(StepResult::Continue)
}

/// Path with the listen-path prefix removed, for matching per-endpoint
/// rules that are written relative to the API root.
pub(crate) fn relative_path<'a>(path: &'a str, listen_path: &str) -> &'a str {
    match path.strip_prefix(listen_path) {
        Some(rest) if rest.is_empty() => "/",
        Some(rest) if rest.starts_with('/') => rest,
        // A listen path ending in '/' keeps the separator with the tail.
        Some(_) if listen_path.ends_with('/') => &path[listen_path.len() - 1..],
        Some(rest) => rest,
        None => path,
    }
}

fn first_segment_after(path: &str, listen_path: &str) -> Option<String> {
    let rest = relative_path(path, listen_path);
    let segment = rest.trim_start_matches('/').split('/').next()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

pub fn request_size_limit(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let mut limit = base.spec.def.request_size_limit;
    if let Some(version) = base.spec.version(ctx.version()) {
        if version.global_size_limit > 0 {
            limit = version.global_size_limit;
        }
    }
    if limit == 0 {
        return Ok(StepResult::Continue);
    }

    let declared = ctx
        .request
        .header("content-length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    if declared > limit || ctx.request.body.len() as u64 > limit {
        return Err(ChainError {
            kind: crate::error::ErrorKind::Policy,
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: "Request is too large".to_string(),
        });
    }
    Ok(StepResult::Continue)
}

/// Seed the context-variable map consumed by hooks and transforms.
pub fn context_vars(_base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let remote = ctx.request.client_ip().to_string();
    let method = ctx.request.method.as_str().to_string();
    let path = ctx.request.path().to_string();
    ctx.set_data("remote_addr", remote);
    ctx.set_data("request_method", method);
    ctx.set_data("request_path", path);
    ctx.set_data("request_id", uuid::Uuid::new_v4().to_string());

    let headers: Vec<(String, String)> = ctx
        .request
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (format!("headers_{}", name.as_str()), v.to_string()))
        })
        .collect();
    for (k, v) in headers {
        ctx.set_data(k, v);
    }
    Ok(StepResult::Continue)
}

/// Record whether this endpoint is tracked for analytics, and attach the
/// spec's tag headers to the request tags.
pub fn track_endpoint(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let mut tracked = true;
    if let Some(version) = base.spec.version(ctx.version()) {
        if version
            .do_not_track_endpoints
            .iter()
            .any(|e| e.matches(&method, &path))
        {
            tracked = false;
        } else if !version.track_endpoints.is_empty() {
            tracked = version
                .track_endpoints
                .iter()
                .any(|e| e.matches(&method, &path));
        }
    }
    ctx.set_track_endpoint(tracked);

    let tags: Vec<String> = base
        .spec
        .tag_headers
        .iter()
        .filter_map(|h| ctx.request.header(h).map(|v| format!("{h}-{v}")))
        .collect();
    for tag in tags {
        ctx.push_tag(tag);
    }
    Ok(StepResult::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_strips_listen_prefix() {
        assert_eq!(relative_path("/v1/widgets", "/v1"), "/widgets");
        assert_eq!(relative_path("/v1", "/v1"), "/");
        assert_eq!(relative_path("/v1/", "/v1/"), "/");
        assert_eq!(relative_path("/v1/widgets", "/v1/"), "/widgets");
        assert_eq!(relative_path("/other", "/v1"), "/other");
        assert_eq!(
            relative_path("/v1portico/rate-limits/", "/v1"),
            "portico/rate-limits/"
        );
    }

    #[test]
    fn first_segment_resolution() {
        assert_eq!(
            first_segment_after("/api/v2/users", "/api").as_deref(),
            Some("v2")
        );
        assert_eq!(first_segment_after("/api", "/api"), None);
    }
}
