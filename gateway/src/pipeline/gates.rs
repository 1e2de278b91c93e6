use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::pre::relative_path;
use crate::pipeline::{unix_now, ChainBase, StepResult};
use crate::session::{AccessDefinition, QuotaOutcome};
use dashmap::DashMap;
use http::Method;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Remove the client credential before the request leaves the gateway.
pub fn strip_auth(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let auth = &base.spec.def.auth;
    let header_name = auth.auth_header_name.to_ascii_lowercase();
    ctx.request.headers.remove(&header_name);

    if auth.use_param {
        let param = if auth.param_name.is_empty() {
            auth.auth_header_name.clone()
        } else {
            auth.param_name.clone()
        };
        strip_query_param(ctx, &param);
    }

    if auth.use_cookie {
        let cookie_name = if auth.cookie_name.is_empty() {
            auth.auth_header_name.clone()
        } else {
            auth.cookie_name.clone()
        };
        let filtered = ctx.request.header("cookie").map(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .filter(|pair| pair.splitn(2, '=').next() != Some(cookie_name.as_str()))
                .collect::<Vec<_>>()
                .join("; ")
        });
        match filtered {
            Some(rest) if !rest.is_empty() => {
                if let Ok(v) = http::HeaderValue::from_str(&rest) {
                    ctx.request.headers.insert(http::header::COOKIE, v);
                }
            }
            Some(_) => {
                ctx.request.headers.remove(http::header::COOKIE);
            }
            None => {}
        }
    }
    Ok(StepResult::Continue)
}

fn strip_query_param(ctx: &mut RequestCtx, name: &str) {
    let Some(query) = ctx.request.uri.query() else {
        return;
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| pair.splitn(2, '=').next() != Some(name))
        .collect();
    let new_query = kept.join("&");
    let path = ctx.request.uri.path();
    let rebuilt = if new_query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{new_query}")
    };
    if let Ok(uri) = rebuilt.parse() {
        ctx.request.uri = uri;
    }
}

/// Reject inactive or expired keys.
pub fn key_expired(_base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let Some(session) = ctx.session() else {
        return Ok(StepResult::Continue);
    };
    if session.is_inactive {
        return Err(ChainError::policy("Key is inactive, please renew"));
    }
    if session.expired(unix_now()) {
        return Err(ChainError::policy("Key has expired, please renew"));
    }
    Ok(StepResult::Continue)
}

pub(crate) fn version_allowed(entry: &AccessDefinition, version: &str) -> bool {
    entry.versions.iter().any(|v| v.eq_ignore_ascii_case(version))
}

/// The session must grant this API with the resolved version.
pub fn access_rights(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let Some(session) = ctx.session() else {
        return Ok(StepResult::Continue);
    };
    // Keys with no access map are legacy all-API keys.
    if session.access_rights.is_empty() {
        return Ok(StepResult::Continue);
    }
    let entry = session
        .access_rights
        .get(&base.spec.def.api_id)
        .ok_or_else(|| ChainError::policy("Access to this API has been disallowed"))?;

    // A not-versioned API has a single implicit version; granting the API
    // grants it.
    if !base.spec.def.version_data.not_versioned {
        let version = ctx.version().unwrap_or("Default");
        if !version_allowed(entry, version) {
            return Err(ChainError::policy("Access to this API has been disallowed"));
        }
    }
    Ok(StepResult::Continue)
}

pub(crate) fn spec_matches(spec: &crate::session::AccessSpec, method: &Method, path: &str) -> bool {
    if !spec.methods.is_empty()
        && !spec.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
    {
        return false;
    }
    match regex::Regex::new(&format!("^{}", spec.url)) {
        Ok(re) => re.is_match(path),
        Err(e) => {
            tracing::warn!(pattern = %spec.url, "granular_access: invalid session URL pattern: {}", e);
            false
        }
    }
}

/// Session-level path rules: blocked patterns always reject; when an
/// allowed list exists the request must match one of its entries.
pub fn granular_access(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let Some(session) = ctx.session() else {
        return Ok(StepResult::Continue);
    };
    let Some(entry) = session.access_rights.get(&base.spec.def.api_id) else {
        return Ok(StepResult::Continue);
    };

    let method = &ctx.request.method;
    let path = relative_path(ctx.request.path(), &base.spec.listen_path);

    if entry.blocked_urls.iter().any(|s| spec_matches(s, method, path)) {
        return Err(ChainError::policy("Access to this resource has been disallowed"));
    }
    if !entry.allowed_urls.is_empty()
        && !entry.allowed_urls.iter().any(|s| spec_matches(s, method, path))
    {
        return Err(ChainError::policy("Access to this resource has been disallowed"));
    }
    Ok(StepResult::Continue)
}

/// Per-key token-bucket rate plus fixed-window quota. Mutations land on
/// the context's session copy and are flushed after the chain returns.
pub fn rate_limit_and_quota(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    if !ctx.limits_enforced() {
        return Ok(StepResult::Continue);
    }
    let api_name = base.spec.def.name.clone();
    let now = unix_now();
    let Some(session) = ctx.session_mut() else {
        return Ok(StepResult::Continue);
    };

    if !session.take_rate_token(now) {
        metrics::counter!(
            "gateway_rate_limit_rejected_total",
            "api" => api_name,
            "scope" => "key",
        )
        .increment(1);
        return Err(ChainError::rate_limited("API Rate Limit Exceeded"));
    }

    match session.consume_quota(now) {
        QuotaOutcome::Exceeded => {
            metrics::counter!(
                "gateway_rate_limit_rejected_total",
                "api" => api_name,
                "scope" => "quota",
            )
            .increment(1);
            Err(ChainError::rate_limited("Quota exceeded"))
        }
        QuotaOutcome::Allowed { .. } => {
            ctx.schedule_session_update();
            Ok(StepResult::Continue)
        }
    }
}

/// Per-API rate limit across all callers.
pub async fn rate_limit_for_api(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    if !ctx.limits_enforced() {
        return Ok(StepResult::Continue);
    }
    let rate = base.spec.def.global_rate;
    if rate <= 0.0 {
        return Ok(StepResult::Continue);
    }
    let per = if base.spec.def.global_rate_per > 0.0 {
        base.spec.def.global_rate_per
    } else {
        1.0
    };
    let key = format!("apilimiter-{}", base.spec.def.api_id);
    if !base.api_limiter.check(&key, rate, per).await {
        metrics::counter!(
            "gateway_rate_limit_rejected_total",
            "api" => base.spec.def.name.clone(),
            "scope" => "api",
        )
        .increment(1);
        return Err(ChainError::rate_limited("API Rate Limit Exceeded"));
    }
    Ok(StepResult::Continue)
}

// ---------------------------------------------------------------------------
// Shared per-API token buckets.
// ---------------------------------------------------------------------------

/// Token-bucket limiter shared by every chain in the process. Buckets are
/// mutex-protected so concurrent callers cannot lose refills; the async
/// mutex yields back to the runtime while waiting.
pub struct ApiRateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
}

struct Bucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: f64,
    last_refill: Instant,
}

impl ApiRateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, key: &str, rate: f64, per: f64) -> bool {
        // Fast path: key already exists, no allocation.
        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        inner: Mutex::new(BucketInner {
                            tokens: rate,
                            last_refill: Instant::now(),
                        }),
                    })
                })
                .clone()
        };

        let mut b = bucket.inner.lock().await;
        let elapsed = b.last_refill.elapsed().as_secs_f64();
        b.tokens = (b.tokens + elapsed * rate / per).min(rate);
        b.last_refill = Instant::now();
        if b.tokens < 1.0 {
            return false;
        }
        b.tokens -= 1.0;
        true
    }
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
