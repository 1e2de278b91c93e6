use crate::hooks::HookDriver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level gateway configuration. Infrastructure settings live here;
/// API definitions arrive fully materialized in `apis` (file-provided or
/// pushed by the control plane through a reload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Proxy listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Hash caller keys before they reach the store.
    #[serde(default = "default_true")]
    pub hash_keys: bool,

    /// Build per-host subrouters for specs that declare a domain. When
    /// disabled, domain-carrying specs fall into the default bucket with a
    /// warning.
    #[serde(default)]
    pub enable_custom_domains: bool,

    /// Path (without leading slash) answering a static liveness probe.
    #[serde(default = "default_health_endpoint")]
    pub health_check_endpoint_name: String,

    /// Upstream forward timeout in seconds when no per-endpoint hard
    /// timeout matches.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_default_timeout_secs: u64,

    /// Hard cap on buffered request bodies, bytes.
    #[serde(default = "default_max_body")]
    pub max_request_body_bytes: u64,

    /// Session lifetime written on lazy session updates, seconds.
    /// 0 keeps sessions until the store evicts them.
    #[serde(default)]
    pub session_lifetime_secs: u64,

    #[serde(default)]
    pub tracing: TracingConfig,

    /// Materialized API definitions.
    #[serde(default)]
    pub apis: Vec<ApiDefinition>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_endpoint() -> String {
    "hello".to_string()
}

fn default_proxy_timeout() -> u64 {
    30
}

fn default_max_body() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Exporter name resolved at construction time; unknown names fall back
    /// to the no-op tracer.
    #[serde(default)]
    pub exporter: String,
}

/// Which auth scheme's session becomes canonical when several schemes
/// accept the same request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthSource {
    #[default]
    #[serde(alias = "")]
    Unset,
    AuthToken,
    HmacKey,
    BasicAuthUser,
    OauthKey,
    JwtClaim,
    OidcUser,
    CustomAuth,
}

/// One fronted API, immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiDefinition {
    pub api_id: String,
    /// Database identifier, when the definition came from one.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub org_id: String,
    pub name: String,
    /// Custom domain; empty matches any host.
    #[serde(default)]
    pub domain: String,
    /// Internal APIs are reachable only through the loop dispatcher, never
    /// from the public router.
    #[serde(default)]
    pub internal: bool,

    pub proxy: ProxyConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub use_keyless: bool,
    #[serde(default)]
    pub use_standard_auth: bool,
    #[serde(default)]
    pub use_basic_auth: bool,

    /// HMAC signature checking.
    #[serde(default)]
    pub enable_signature_checking: bool,
    /// Allowed clock skew in milliseconds; zero or negative disables the
    /// skew check.
    #[serde(default)]
    pub hmac_allowed_clock_skew: i64,
    #[serde(default)]
    pub hmac_allowed_algorithms: Vec<String>,

    #[serde(default)]
    pub use_oauth2: bool,

    #[serde(default)]
    pub enable_jwt: bool,
    #[serde(default)]
    pub jwt_signing_method: String,
    /// Shared secret, base64 or raw.
    #[serde(default)]
    pub jwt_source: String,
    /// Claim naming the session identity; defaults to `sub`.
    #[serde(default)]
    pub jwt_identity_base_field: String,

    #[serde(default)]
    pub use_openid: bool,
    #[serde(default)]
    pub openid_options: OpenIdOptions,

    #[serde(default)]
    pub base_identity_provided_by: AuthSource,

    /// Which session storage backend serves this API. The default empty
    /// value means the process-wide store; named engines are bound by the
    /// deployment that injects the store implementations.
    #[serde(default)]
    pub session_provider: ProviderBinding,

    #[serde(default)]
    pub custom_middleware: CustomMiddleware,

    pub version_data: VersionData,
    #[serde(default)]
    pub version_definition: VersionDefinition,

    /// Per-API rate limit (all callers combined). Zero disables.
    #[serde(default)]
    pub global_rate: f64,
    #[serde(default)]
    pub global_rate_per: f64,

    /// Mutual-TLS client certificate check. TLS terminates ahead of the
    /// gateway; the terminator forwards the peer certificate digest in
    /// `x-client-cert-fingerprint`.
    #[serde(default)]
    pub use_mutual_tls_auth: bool,
    /// Allowed client certificate SHA-256 fingerprints.
    #[serde(default)]
    pub client_certificates: Vec<String>,

    #[serde(default)]
    pub enable_ip_whitelisting: bool,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub enable_ip_blacklisting: bool,
    #[serde(default)]
    pub blocked_ips: Vec<String>,

    /// Headers whose values are attached to the request tags (lowercased
    /// at spec compile time).
    #[serde(default)]
    pub tag_headers: Vec<String>,

    /// Request body ceiling in bytes; zero disables.
    #[serde(default)]
    pub request_size_limit: u64,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub cache_options: CacheOptions,

    #[serde(default)]
    pub enable_context_vars: bool,

    /// Remove the credential before forwarding upstream.
    #[serde(default)]
    pub strip_auth_data: bool,

    /// Response processors, run in definition order.
    #[serde(default)]
    pub response_processors: Vec<ResponseProcessorDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen_path: String,
    pub target_url: String,
    #[serde(default)]
    pub strip_listen_path: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_header")]
    pub auth_header_name: String,
    #[serde(default)]
    pub use_param: bool,
    #[serde(default)]
    pub param_name: String,
    #[serde(default)]
    pub use_cookie: bool,
    #[serde(default)]
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_header_name: default_auth_header(),
            use_param: false,
            param_name: String::new(),
            use_cookie: false,
            cookie_name: String::new(),
        }
    }
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderBinding {
    #[serde(default)]
    pub storage_engine: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenIdOptions {
    #[serde(default)]
    pub providers: Vec<OidcProvider>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OidcProvider {
    pub issuer: String,
    #[serde(default)]
    pub client_ids: Vec<String>,
    /// Verification secret for this provider's tokens, base64 or raw.
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomMiddleware {
    #[serde(default)]
    pub driver: Option<HookDriver>,
    /// Custom key-check hook; with the scripted driver it replaces the
    /// standard token check.
    #[serde(default)]
    pub auth_check: Option<HookDef>,
    /// Native-plugin auth must be requested explicitly.
    #[serde(default)]
    pub use_native_auth: bool,
    #[serde(default)]
    pub pre: Vec<HookDef>,
    #[serde(default)]
    pub post_key_auth: Vec<HookDef>,
    #[serde(default)]
    pub post: Vec<HookDef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookDef {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionData {
    #[serde(default)]
    pub not_versioned: bool,
    #[serde(default)]
    pub default_version: String,
    #[serde(default)]
    pub versions: HashMap<String, VersionInfo>,
}

/// Where the requested version is read from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDefinition {
    /// `header`, `url-param`, or `url` (first path segment).
    #[serde(default = "default_version_location")]
    pub location: String,
    #[serde(default = "default_version_key")]
    pub key: String,
}

impl Default for VersionDefinition {
    fn default() -> Self {
        Self {
            location: default_version_location(),
            key: default_version_key(),
        }
    }
}

fn default_version_location() -> String {
    "header".to_string()
}

fn default_version_key() -> String {
    "x-api-version".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionInfo {
    pub name: String,
    /// RFC 3339 timestamp after which this version rejects requests;
    /// empty means it never expires.
    #[serde(default)]
    pub expires: String,
    #[serde(default)]
    pub paths: VersionPaths,
    #[serde(default)]
    pub use_extended_paths: bool,
    #[serde(default)]
    pub extended_paths: ExtendedPaths,
    /// Overrides the spec target for requests resolved to this version.
    #[serde(default)]
    pub override_target: String,
    /// Headers injected into every request under this version.
    #[serde(default)]
    pub global_headers: HashMap<String, String>,
    #[serde(default)]
    pub global_headers_remove: Vec<String>,
    /// Per-version request size ceiling; zero falls back to the spec's.
    #[serde(default)]
    pub global_size_limit: u64,
}

/// Simple path lists: prefixes matched against the request path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionPaths {
    #[serde(default)]
    pub ignored: Vec<String>,
    #[serde(default)]
    pub white_list: Vec<String>,
    #[serde(default)]
    pub black_list: Vec<String>,
}

/// Pattern-addressed per-endpoint rules. `path` is a regex fragment
/// anchored at the start of the request path; `method` empty matches all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedPaths {
    #[serde(default)]
    pub ignored: Vec<EndpointMeta>,
    #[serde(default)]
    pub white_list: Vec<EndpointMeta>,
    #[serde(default)]
    pub black_list: Vec<EndpointMeta>,
    #[serde(default)]
    pub url_rewrites: Vec<UrlRewriteMeta>,
    #[serde(default)]
    pub transform: Vec<TransformMeta>,
    #[serde(default)]
    pub transform_response: Vec<TransformMeta>,
    #[serde(default)]
    pub transform_jq: Vec<JqTransformMeta>,
    #[serde(default)]
    pub transform_jq_response: Vec<JqTransformMeta>,
    #[serde(default)]
    pub transform_headers: Vec<HeaderInjectMeta>,
    #[serde(default)]
    pub transform_response_headers: Vec<HeaderInjectMeta>,
    #[serde(default)]
    pub hard_timeouts: Vec<HardTimeoutMeta>,
    #[serde(default)]
    pub circuit_breakers: Vec<CircuitBreakerMeta>,
    /// Path prefixes eligible for response caching.
    #[serde(default)]
    pub cache: Vec<String>,
    #[serde(default)]
    pub method_transforms: Vec<MethodTransformMeta>,
    #[serde(default)]
    pub validate_json: Vec<ValidateJsonMeta>,
    #[serde(default)]
    pub virtual_endpoints: Vec<VirtualMeta>,
    #[serde(default)]
    pub track_endpoints: Vec<EndpointMeta>,
    #[serde(default)]
    pub do_not_track_endpoints: Vec<EndpointMeta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlRewriteMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    /// Regex matched against path-and-query; capture groups feed `$n`
    /// placeholders in `rewrite_to`.
    pub match_pattern: String,
    /// Replacement path, or an absolute URL. A loop-scheme URL turns the
    /// request into an in-process redispatch.
    pub rewrite_to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    /// JSON merge patch applied to the body.
    pub merge: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JqTransformMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    pub filter: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderInjectMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub add_headers: HashMap<String, String>,
    #[serde(default)]
    pub delete_headers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardTimeoutMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Successful probes required to close again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Seconds the breaker stays open before probing.
    pub return_to_service_after_secs: u64,
}

fn default_success_threshold() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodTransformMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    pub to_method: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateJsonMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualMeta {
    pub path: String,
    #[serde(default)]
    pub method: String,
    pub function_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    /// Forward OPTIONS to the upstream instead of answering preflight
    /// locally.
    #[serde(default)]
    pub options_passthrough: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheOptions {
    #[serde(default)]
    pub enable_cache: bool,
    #[serde(default = "default_cache_timeout")]
    pub cache_timeout_secs: u64,
    /// Cache every GET/HEAD/OPTIONS regardless of per-path rules.
    #[serde(default)]
    pub cache_all_safe_requests: bool,
    #[serde(default)]
    pub cached_methods: Vec<String>,
}

fn default_cache_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseProcessorDef {
    pub name: String,
}
