use crate::cache::TtlCache;
use crate::hooks::{HookDispatcher, HookDriver, HookType};
use crate::pipeline::gates::ApiRateLimiter;
use crate::pipeline::transforms::{JqTransformer, VirtualHandler};
use crate::pipeline::{ApiChain, ChainBase, Step, Terminal};
use crate::proxy::breaker::BreakerRegistry;
use crate::proxy::response::ResponseStep;
use crate::proxy::CachedResponse;
use crate::session::store::{OauthClientStore, SessionManager};
use crate::spec::ApiSpec;
use crate::trace::Tracer;
use ipnetwork::IpNetwork;
use std::sync::Arc;

/// Storage and capability handles shared by every chain in one gateway
/// process. Cheap to clone: everything is an `Arc`.
#[derive(Clone)]
pub struct SharedHandles {
    pub sessions: Arc<SessionManager>,
    pub org_sessions: Arc<SessionManager>,
    pub oauth_clients: Arc<dyn OauthClientStore>,
    pub util_cache: Arc<TtlCache<bool>>,
    pub response_cache: Arc<TtlCache<CachedResponse>>,
    pub hook_dispatcher: Arc<dyn HookDispatcher>,
    pub jq: Arc<dyn JqTransformer>,
    pub virtual_handler: Option<Arc<dyn VirtualHandler>>,
    pub api_limiter: Arc<ApiRateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub tracer: Arc<dyn Tracer>,
}

impl SharedHandles {
    fn chain_base(&self, spec: Arc<ApiSpec>) -> ChainBase {
        ChainBase {
            spec,
            sessions: self.sessions.clone(),
            org_sessions: self.org_sessions.clone(),
            oauth_clients: self.oauth_clients.clone(),
            util_cache: self.util_cache.clone(),
            response_cache: self.response_cache.clone(),
            hook_dispatcher: self.hook_dispatcher.clone(),
            jq: self.jq.clone(),
            virtual_handler: self.virtual_handler.clone(),
            api_limiter: self.api_limiter.clone(),
            breakers: self.breakers.clone(),
            tracer: self.tracer.clone(),
        }
    }
}

fn parse_ip_list(raw: &[String], api_name: &str) -> Vec<IpNetwork> {
    raw.iter()
        .filter_map(|entry| {
            // Bare addresses parse as /32 (or /128) networks.
            let candidate = entry.parse::<IpNetwork>().or_else(|_| {
                entry
                    .parse::<std::net::IpAddr>()
                    .map(IpNetwork::from)
                    .map_err(|_| ipnetwork::IpNetworkError::InvalidAddr(entry.clone()))
            });
            match candidate {
                Ok(net) => Some(net),
                Err(_) => {
                    tracing::warn!(api_name = %api_name, entry = %entry, "assembler: skipping invalid IP entry");
                    None
                }
            }
        })
        .collect()
}

fn version_flag(spec: &ApiSpec, f: impl Fn(&crate::spec::CompiledVersion) -> bool) -> bool {
    spec.versions.values().any(f)
}

/// Compose the per-API authentication sub-chain in fixed scheme order.
/// Every enabled scheme joins the sub-chain; the base-identity selector on
/// the spec decides which scheme's session becomes canonical.
pub fn build_auth_steps(spec: &ApiSpec) -> Vec<Step> {
    let def = &spec.def;
    let mut steps = Vec::new();

    if def.use_oauth2 {
        tracing::info!(api_name = %def.name, "checking security policy: OAuth");
        steps.push(Step::AuthOauth);
    }
    if def.use_basic_auth {
        tracing::info!(api_name = %def.name, "checking security policy: Basic");
        steps.push(Step::AuthBasic);
    }
    if def.enable_signature_checking {
        tracing::info!(api_name = %def.name, "checking security policy: HMAC");
        steps.push(Step::AuthHmac);
    }
    if def.enable_jwt {
        tracing::info!(api_name = %def.name, "checking security policy: JWT");
        steps.push(Step::AuthJwt);
    }
    if def.use_openid {
        tracing::info!(api_name = %def.name, "checking security policy: OpenID");
        steps.push(Step::AuthOpenId);
    }

    let cm = &def.custom_middleware;
    if let (Some(driver), Some(hook)) = (cm.driver, cm.auth_check.as_ref()) {
        // The scripted driver always honors a configured key-check hook;
        // native-plugin auth must be requested explicitly.
        let custom_auth = match driver {
            HookDriver::Scripted | HookDriver::Coprocess => true,
            HookDriver::NativePlugin => cm.use_native_auth,
        };
        if custom_auth {
            tracing::info!(api_name = %def.name, hook = %hook.name, "checking security policy: custom key check");
            steps.push(Step::CustomHook {
                hook: HookType::CustomKeyCheck,
                name: hook.name.clone(),
            });
        }
    }

    // Standard token runs when explicitly requested, or as the fallback
    // when no other scheme claimed the sub-chain.
    if def.use_standard_auth || steps.is_empty() {
        tracing::info!(api_name = %def.name, "checking security policy: Token");
        steps.push(Step::AuthToken);
    }
    steps
}

/// Build one API's full chain. Enablement is decided here, once, per the
/// spec; the chain's step order is fixed for its lifetime.
pub fn build_chain(spec: Arc<ApiSpec>, shared: &SharedHandles) -> ApiChain {
    let def = &spec.def;
    let mut steps: Vec<Step> = Vec::new();

    if def.cors.enabled && !def.cors.options_passthrough {
        steps.push(Step::CorsPreflight);
    }

    if def.custom_middleware.driver.is_some() {
        for hook in &def.custom_middleware.pre {
            steps.push(Step::CustomHook {
                hook: HookType::Pre,
                name: hook.name.clone(),
            });
        }
    }

    steps.push(Step::RateCheck);
    if def.enable_ip_whitelisting {
        let allowed = parse_ip_list(&def.allowed_ips, &def.name);
        if !allowed.is_empty() {
            steps.push(Step::IpAllowList { allowed });
        }
    }
    if def.enable_ip_blacklisting {
        let blocked = parse_ip_list(&def.blocked_ips, &def.name);
        if !blocked.is_empty() {
            steps.push(Step::IpDenyList { blocked });
        }
    }
    if def.use_mutual_tls_auth && !def.client_certificates.is_empty() {
        steps.push(Step::CertificateCheck);
    }
    if !def.org_id.is_empty() {
        steps.push(Step::OrgMonitor);
    }
    steps.push(Step::VersionCheck);
    if def.request_size_limit > 0 || version_flag(&spec, |v| v.global_size_limit > 0) {
        steps.push(Step::RequestSizeLimit);
    }
    if def.enable_context_vars {
        steps.push(Step::ContextVars);
    }
    steps.push(Step::TrackEndpoint);

    if !def.use_keyless {
        steps.extend(build_auth_steps(&spec));

        if def.custom_middleware.driver.is_some() {
            for hook in &def.custom_middleware.post_key_auth {
                steps.push(Step::CustomHook {
                    hook: HookType::PostKeyAuth,
                    name: hook.name.clone(),
                });
            }
        }

        if def.strip_auth_data {
            steps.push(Step::StripAuth);
        }
        steps.push(Step::KeyExpired);
        steps.push(Step::AccessRights);
        steps.push(Step::GranularAccess);
        steps.push(Step::RateLimitAndQuota);
    } else {
        tracing::info!(api_name = %def.name, "checking security policy: Open");
    }

    if def.global_rate > 0.0 {
        steps.push(Step::RateLimitForApi);
    }
    if version_flag(&spec, |v| !v.validate_json.is_empty()) {
        steps.push(Step::ValidateJson);
    }
    if version_flag(&spec, |v| !v.transforms.is_empty()) {
        steps.push(Step::TransformBody);
    }
    if version_flag(&spec, |v| !v.jq_transforms.is_empty()) {
        steps.push(Step::TransformJq);
    }
    if version_flag(&spec, |v| {
        !v.header_injects.is_empty() || !v.global_headers.is_empty() || !v.global_headers_remove.is_empty()
    }) {
        steps.push(Step::TransformHeaders);
    }
    if version_flag(&spec, |v| !v.url_rewrites.is_empty()) {
        steps.push(Step::UrlRewrite);
    }
    if version_flag(&spec, |v| !v.method_transforms.is_empty()) {
        steps.push(Step::TransformMethod);
    }
    if def.cache_options.enable_cache {
        steps.push(Step::CacheLookup);
    }
    if shared.virtual_handler.is_some() && version_flag(&spec, |v| !v.virtual_endpoints.is_empty()) {
        steps.push(Step::VirtualEndpoint);
    }

    if def.custom_middleware.driver.is_some() {
        for hook in &def.custom_middleware.post {
            steps.push(Step::CustomHook {
                hook: HookType::Post,
                name: hook.name.clone(),
            });
        }
    }

    let response_steps = build_response_steps(&spec);

    ApiChain {
        base: shared.chain_base(spec),
        steps,
        response_steps,
        terminal: Terminal::Proxy,
    }
}

fn build_response_steps(spec: &ApiSpec) -> Vec<ResponseStep> {
    let mut steps = Vec::new();
    for processor in &spec.def.response_processors {
        match processor.name.as_str() {
            "header_injector" => steps.push(ResponseStep::HeaderInjector),
            "response_body_transform" => steps.push(ResponseStep::BodyTransform),
            "response_transform_jq" => steps.push(ResponseStep::JqTransform),
            other => {
                tracing::warn!(
                    api_name = %spec.def.name,
                    processor = other,
                    "assembler: unknown response processor, skipping"
                );
            }
        }
    }
    if spec.def.cache_options.enable_cache {
        steps.push(ResponseStep::CacheWrite);
    }
    steps
}

/// The shorter identity-only chain behind the rate-limit query endpoint:
/// enough steps to prove who is asking, nothing that would consume quota.
pub fn build_rate_limit_chain(spec: Arc<ApiSpec>, shared: &SharedHandles) -> Option<ApiChain> {
    let def = &spec.def;
    if def.use_keyless {
        return None;
    }
    let mut steps: Vec<Step> = Vec::new();
    if def.enable_ip_whitelisting {
        let allowed = parse_ip_list(&def.allowed_ips, &def.name);
        if !allowed.is_empty() {
            steps.push(Step::IpAllowList { allowed });
        }
    }
    if def.enable_ip_blacklisting {
        let blocked = parse_ip_list(&def.blocked_ips, &def.name);
        if !blocked.is_empty() {
            steps.push(Step::IpDenyList { blocked });
        }
    }
    if !def.org_id.is_empty() {
        steps.push(Step::OrgMonitor);
    }
    steps.push(Step::VersionCheck);
    steps.extend(build_auth_steps(&spec));
    steps.push(Step::KeyExpired);
    steps.push(Step::AccessRights);

    Some(ApiChain {
        base: shared.chain_base(spec),
        steps,
        response_steps: Vec::new(),
        terminal: Terminal::RateLimitInfo,
    })
}

/// Handles wired to in-memory stores, for unit and integration tests.
#[cfg(test)]
pub(crate) fn test_handles() -> SharedHandles {
    use crate::hooks::NoopHookDispatcher;
    use crate::pipeline::transforms::NoJqTransformer;
    use crate::session::store::{InMemoryOauthStore, InMemorySessionStore, KeyHasher};
    use crate::trace::NoopTracer;

    SharedHandles {
        sessions: Arc::new(SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            KeyHasher::new(true),
        )),
        org_sessions: Arc::new(SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            KeyHasher::new(false),
        )),
        oauth_clients: Arc::new(InMemoryOauthStore::new()),
        util_cache: Arc::new(TtlCache::new()),
        response_cache: Arc::new(TtlCache::new()),
        hook_dispatcher: Arc::new(NoopHookDispatcher),
        jq: Arc::new(NoJqTransformer),
        virtual_handler: None,
        api_limiter: Arc::new(ApiRateLimiter::new()),
        breakers: Arc::new(BreakerRegistry::new()),
        tracer: Arc::new(NoopTracer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(def: serde_json::Value) -> Arc<ApiSpec> {
        Arc::new(ApiSpec::compile(serde_json::from_value(def).unwrap()).unwrap())
    }

    #[test]
    fn keyless_chain_has_no_auth_steps() {
        let spec = compile(serde_json::json!({
            "api_id": "1",
            "name": "open api",
            "use_keyless": true,
            "proxy": {"listen_path": "/open/", "target_url": "http://127.0.0.1:1/"},
            "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
        }));
        let chain = build_chain(spec.clone(), &test_handles());
        let names = chain.step_names();
        assert!(!names.contains(&"auth_token"));
        assert!(!names.contains(&"rate_limit_and_quota"));
        assert!(names.contains(&"version_check"));
        assert!(build_rate_limit_chain(spec, &test_handles()).is_none());
    }

    #[test]
    fn multi_auth_chain_orders_schemes() {
        let spec = compile(serde_json::json!({
            "api_id": "55",
            "org_id": "default",
            "name": "multi",
            "use_basic_auth": true,
            "use_standard_auth": true,
            "base_identity_provided_by": "auth_token",
            "proxy": {"listen_path": "/v1", "target_url": "http://127.0.0.1:1/"},
            "version_data": {"not_versioned": true, "versions": {"v1": {"name": "v1"}}}
        }));
        let chain = build_chain(spec, &test_handles());
        let names = chain.step_names();
        let basic = names.iter().position(|n| *n == "auth_basic").unwrap();
        let token = names.iter().position(|n| *n == "auth_token").unwrap();
        let gates = names.iter().position(|n| *n == "key_expired").unwrap();
        assert!(basic < token, "Basic precedes standard token");
        assert!(token < gates, "auth precedes the policy gates");
        assert!(names.contains(&"rate_limit_and_quota"));
    }

    #[test]
    fn token_fallback_when_no_scheme_enabled() {
        let spec = compile(serde_json::json!({
            "api_id": "2",
            "name": "fallback",
            "proxy": {"listen_path": "/t/", "target_url": "http://127.0.0.1:1/"},
            "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
        }));
        let steps = build_auth_steps(&spec);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name(), "auth_token");
    }

    #[test]
    fn scripted_auth_hook_replaces_token() {
        let spec = compile(serde_json::json!({
            "api_id": "3",
            "name": "scripted",
            "custom_middleware": {
                "driver": "scripted",
                "auth_check": {"name": "checkKey"}
            },
            "proxy": {"listen_path": "/s/", "target_url": "http://127.0.0.1:1/"},
            "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
        }));
        let steps = build_auth_steps(&spec);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name(), "custom_hook");
    }

    #[test]
    fn rate_limit_chain_is_identity_only() {
        let spec = compile(serde_json::json!({
            "api_id": "4",
            "name": "limited",
            "use_standard_auth": true,
            "proxy": {"listen_path": "/l/", "target_url": "http://127.0.0.1:1/"},
            "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
        }));
        let chain = build_rate_limit_chain(spec, &test_handles()).unwrap();
        let names = chain.step_names();
        assert!(names.contains(&"auth_token"));
        assert!(names.contains(&"access_rights"));
        assert!(!names.contains(&"rate_limit_and_quota"));
        assert_eq!(chain.terminal, Terminal::RateLimitInfo);
    }
}
