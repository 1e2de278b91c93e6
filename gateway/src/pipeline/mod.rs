pub mod assembler;
pub mod auth;
pub mod gates;
pub mod pre;
pub mod transforms;

use crate::cache::TtlCache;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::hooks::{HookDispatcher, HookType};
use crate::proxy::breaker::BreakerRegistry;
use crate::proxy::{full_body, BoxBody, CachedResponse};
use crate::session::store::{OauthClientStore, SessionManager};
use crate::spec::ApiSpec;
use crate::trace::Tracer;
use gates::ApiRateLimiter;
use http::Response;
use ipnetwork::IpNetwork;
use std::sync::Arc;
use transforms::{JqTransformer, VirtualHandler};

/// Result of one step's request phase.
pub enum StepResult {
    /// Advance to the next step.
    Continue,
    /// Short-circuit successfully: return this response, skip the rest of
    /// the chain including the proxy handler.
    Respond(Response<BoxBody>),
}

/// Shared per-API base handed to every step: the compiled spec plus the
/// storage and capability handles. Steps stay stateless where possible;
/// anything mutable (rate buckets, breakers, caches) synchronizes itself.
pub struct ChainBase {
    pub spec: Arc<ApiSpec>,
    pub sessions: Arc<SessionManager>,
    pub org_sessions: Arc<SessionManager>,
    pub oauth_clients: Arc<dyn OauthClientStore>,
    /// Process-wide TTL cache for negatives (revoked OAuth clients etc.).
    pub util_cache: Arc<TtlCache<bool>>,
    pub response_cache: Arc<TtlCache<CachedResponse>>,
    pub hook_dispatcher: Arc<dyn HookDispatcher>,
    pub jq: Arc<dyn JqTransformer>,
    pub virtual_handler: Option<Arc<dyn VirtualHandler>>,
    pub api_limiter: Arc<ApiRateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub tracer: Arc<dyn Tracer>,
}

/// Enum-based step — static dispatch, exhaustive match, built once per API
/// at assembly time, never per request.
///
/// Adding a step:
/// 1. Implement it in the matching module (`pre`, `auth`, `gates`,
///    `transforms`)
/// 2. Add a variant here and the match arm in `process`
/// 3. Push it from the assembler at the right chain position
pub enum Step {
    CorsPreflight,
    CustomHook { hook: HookType, name: String },
    RateCheck,
    IpAllowList { allowed: Vec<IpNetwork> },
    IpDenyList { blocked: Vec<IpNetwork> },
    CertificateCheck,
    OrgMonitor,
    VersionCheck,
    RequestSizeLimit,
    ContextVars,
    TrackEndpoint,
    AuthOauth,
    AuthBasic,
    AuthHmac,
    AuthJwt,
    AuthOpenId,
    AuthToken,
    StripAuth,
    KeyExpired,
    AccessRights,
    GranularAccess,
    RateLimitAndQuota,
    RateLimitForApi,
    ValidateJson,
    TransformBody,
    TransformJq,
    TransformHeaders,
    UrlRewrite,
    TransformMethod,
    CacheLookup,
    VirtualEndpoint,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::CorsPreflight => "cors_preflight",
            Step::CustomHook { .. } => "custom_hook",
            Step::RateCheck => "rate_check",
            Step::IpAllowList { .. } => "ip_allow_list",
            Step::IpDenyList { .. } => "ip_deny_list",
            Step::CertificateCheck => "certificate_check",
            Step::OrgMonitor => "org_monitor",
            Step::VersionCheck => "version_check",
            Step::RequestSizeLimit => "request_size_limit",
            Step::ContextVars => "context_vars",
            Step::TrackEndpoint => "track_endpoint",
            Step::AuthOauth => "auth_oauth",
            Step::AuthBasic => "auth_basic",
            Step::AuthHmac => "auth_hmac",
            Step::AuthJwt => "auth_jwt",
            Step::AuthOpenId => "auth_openid",
            Step::AuthToken => "auth_token",
            Step::StripAuth => "strip_auth",
            Step::KeyExpired => "key_expired",
            Step::AccessRights => "access_rights",
            Step::GranularAccess => "granular_access",
            Step::RateLimitAndQuota => "rate_limit_and_quota",
            Step::RateLimitForApi => "rate_limit_for_api",
            Step::ValidateJson => "validate_json",
            Step::TransformBody => "transform_body",
            Step::TransformJq => "transform_jq",
            Step::TransformHeaders => "transform_headers",
            Step::UrlRewrite => "url_rewrite",
            Step::TransformMethod => "transform_method",
            Step::CacheLookup => "cache_lookup",
            Step::VirtualEndpoint => "virtual_endpoint",
        }
    }

    /// Steps disabled for requests that matched a version-ignored path:
    /// authentication and every policy gate behind it.
    fn skipped_when_auth_ignored(&self) -> bool {
        matches!(
            self,
            Step::AuthOauth
                | Step::AuthBasic
                | Step::AuthHmac
                | Step::AuthJwt
                | Step::AuthOpenId
                | Step::AuthToken
                | Step::CustomHook {
                    hook: HookType::CustomKeyCheck,
                    ..
                }
                | Step::KeyExpired
                | Step::AccessRights
                | Step::GranularAccess
                | Step::RateLimitAndQuota
        )
    }

    pub async fn process(
        &self,
        base: &ChainBase,
        ctx: &mut RequestCtx,
    ) -> Result<StepResult, ChainError> {
        if ctx.auth_ignored() && self.skipped_when_auth_ignored() {
            return Ok(StepResult::Continue);
        }
        match self {
            Step::CorsPreflight => pre::cors_preflight(base, ctx),
            Step::CustomHook { hook, name } => {
                auth::custom_hook(base, ctx, *hook, name).await
            }
            Step::RateCheck => pre::rate_check(base, ctx),
            Step::IpAllowList { allowed } => pre::ip_allow_list(base, ctx, allowed),
            Step::IpDenyList { blocked } => pre::ip_deny_list(base, ctx, blocked),
            Step::CertificateCheck => pre::certificate_check(base, ctx),
            Step::OrgMonitor => pre::org_monitor(base, ctx).await,
            Step::VersionCheck => pre::version_check(base, ctx),
            Step::RequestSizeLimit => pre::request_size_limit(base, ctx),
            Step::ContextVars => pre::context_vars(base, ctx),
            Step::TrackEndpoint => pre::track_endpoint(base, ctx),
            Step::AuthOauth => auth::oauth::process(base, ctx).await,
            Step::AuthBasic => auth::basic::process(base, ctx).await,
            Step::AuthHmac => auth::hmac::process(base, ctx).await,
            Step::AuthJwt => auth::jwt::process(base, ctx).await,
            Step::AuthOpenId => auth::openid::process(base, ctx).await,
            Step::AuthToken => auth::token::process(base, ctx).await,
            Step::StripAuth => gates::strip_auth(base, ctx),
            Step::KeyExpired => gates::key_expired(base, ctx),
            Step::AccessRights => gates::access_rights(base, ctx),
            Step::GranularAccess => gates::granular_access(base, ctx),
            Step::RateLimitAndQuota => gates::rate_limit_and_quota(base, ctx),
            Step::RateLimitForApi => gates::rate_limit_for_api(base, ctx).await,
            Step::ValidateJson => transforms::validate_json(base, ctx),
            Step::TransformBody => transforms::transform_body(base, ctx),
            Step::TransformJq => transforms::transform_jq(base, ctx),
            Step::TransformHeaders => transforms::transform_headers(base, ctx),
            Step::UrlRewrite => transforms::url_rewrite(base, ctx),
            Step::TransformMethod => transforms::transform_method(base, ctx),
            Step::CacheLookup => transforms::cache_lookup(base, ctx),
            Step::VirtualEndpoint => transforms::virtual_endpoint(base, ctx),
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What runs once every step has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Forward to the upstream (or redispatch through the loop scheme).
    Proxy,
    /// Answer the rate-limit query endpoint from the bound session.
    RateLimitInfo,
}

/// One API's compiled chain: ordered steps, a terminal, and the response
/// processors. Step order is fixed for the chain's lifetime.
pub struct ApiChain {
    pub base: ChainBase,
    pub steps: Vec<Step>,
    pub response_steps: Vec<crate::proxy::response::ResponseStep>,
    pub terminal: Terminal,
}

impl ApiChain {
    /// Walk the steps in order. `Ok(Some(resp))` means a step answered the
    /// request itself; `Ok(None)` hands off to the terminal.
    pub async fn run_steps(
        &self,
        ctx: &mut RequestCtx,
    ) -> Result<Option<Response<BoxBody>>, ChainError> {
        for step in &self.steps {
            match step.process(&self.base, ctx).await {
                Ok(StepResult::Continue) => {}
                Ok(StepResult::Respond(resp)) => return Ok(Some(resp)),
                Err(err) => {
                    tracing::debug!(
                        api_id = %self.base.spec.def.api_id,
                        step = step.name(),
                        status = err.status.as_u16(),
                        "pipeline: step terminated chain: {}",
                        err.message
                    );
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Terminal error handler: render the JSON error body and record the
/// error counter. Single exit point for every failed chain.
pub fn error_response(err: &ChainError, api_name: &str) -> Response<BoxBody> {
    metrics::counter!(
        "gateway_request_errors_total",
        "api" => api_name.to_string(),
        "kind" => err.kind.as_str(),
    )
    .increment(1);

    let body = serde_json::json!({ "error": err.message }).to_string();
    let mut builder = Response::builder()
        .status(err.status)
        .header("content-type", "application/json");
    if err.status == http::StatusCode::UNAUTHORIZED {
        builder = builder.header("www-authenticate", "Basic realm=\"portico\"");
    }
    builder
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body(r#"{"error":"internal error"}"#)))
}

/// Current unix seconds; all rate/quota/expiry accounting uses this clock.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
