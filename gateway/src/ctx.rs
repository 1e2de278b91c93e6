use crate::session::Session;
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

/// Default internal-loop depth ceiling when the context carries none.
pub const DEFAULT_LOOP_LIMIT: u32 = 5;

/// Buffered, mutable form of the in-flight request. Pipeline steps rewrite
/// URI, method, headers, and body in place; the terminal handler forwards
/// whatever is left.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: http::Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_addr: SocketAddr,
}

impl GatewayRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        for pair in query.split('&') {
            let mut kv = pair.splitn(2, '=');
            if kv.next() == Some(name) {
                let raw = kv.next().unwrap_or("");
                return Some(
                    urlencoding::decode(raw)
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| raw.to_string()),
                );
            }
        }
        None
    }

    pub fn set_body(&mut self, body: Bytes) {
        if let Ok(v) = http::HeaderValue::from_str(&body.len().to_string()) {
            self.headers.insert(http::header::CONTENT_LENGTH, v);
        }
        self.body = body;
    }

    /// Real client IP: left-most trusted `X-Forwarded-For` entry when
    /// present, else the TCP peer.
    pub fn client_ip(&self) -> IpAddr {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .unwrap_or_else(|| self.peer_addr.ip())
    }
}

/// Typed per-request scratchpad bound to the pipeline for the request's
/// lifetime. The slot set is closed: every key the pipeline may carry is a
/// named field with a typed accessor, so an out-of-contract key is a
/// compile error rather than a runtime surprise.
pub struct RequestCtx {
    pub request: GatewayRequest,
    pub start: Instant,

    session: Option<Session>,
    auth_token: Option<String>,
    hashed_token: Option<String>,
    update_session: bool,

    version_name: Option<String>,
    /// Set when a version-ignored path match disables authentication and
    /// the policy gates for this request.
    ignore_auth: bool,

    orig_url: Option<Uri>,
    loop_depth: u32,
    loop_limit: Option<u32>,
    check_loop_limits: bool,

    throttle_depth: u32,
    throttle_limit: Option<u32>,

    trace_enabled: bool,
    /// Context variables exposed to hooks and transforms.
    data: HashMap<String, String>,
    tags: Vec<String>,
    track_endpoint: bool,

    /// Response-cache key computed by the lookup step, consumed by the
    /// cache-write response processor.
    cache_key: Option<String>,
}

impl RequestCtx {
    pub fn new(request: GatewayRequest) -> Self {
        Self {
            request,
            start: Instant::now(),
            session: None,
            auth_token: None,
            hashed_token: None,
            update_session: false,
            version_name: None,
            ignore_auth: false,
            orig_url: None,
            loop_depth: 0,
            loop_limit: None,
            check_loop_limits: false,
            throttle_depth: 0,
            throttle_limit: None,
            trace_enabled: false,
            data: HashMap::new(),
            tags: Vec::new(),
            track_endpoint: false,
            cache_key: None,
        }
    }

    // -- session ----------------------------------------------------------

    /// Bind the canonical session for this request. Schemes whose identity
    /// is not selected by the spec must not call this.
    pub fn bind_session(
        &mut self,
        mut session: Session,
        token: &str,
        key_hash: &str,
        schedule_update: bool,
    ) {
        if session.key_hash.is_empty() {
            session.key_hash = key_hash.to_string();
        }
        self.session = Some(session);
        self.auth_token = Some(token.to_string());
        self.hashed_token = Some(key_hash.to_string());
        if schedule_update {
            self.update_session = true;
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn hashed_token(&self) -> Option<&str> {
        self.hashed_token.as_deref()
    }

    pub fn schedule_session_update(&mut self) {
        self.update_session = true;
    }

    pub fn session_update_scheduled(&self) -> bool {
        self.update_session
    }

    // -- versioning -------------------------------------------------------

    pub fn set_version(&mut self, name: Option<String>) {
        self.version_name = name;
    }

    pub fn version(&self) -> Option<&str> {
        self.version_name.as_deref()
    }

    pub fn set_ignore_auth(&mut self) {
        self.ignore_auth = true;
    }

    pub fn auth_ignored(&self) -> bool {
        self.ignore_auth
    }

    // -- looping ----------------------------------------------------------

    pub fn stash_orig_url(&mut self, uri: Uri) {
        self.orig_url = Some(uri);
    }

    pub fn take_orig_url(&mut self) -> Option<Uri> {
        self.orig_url.take()
    }

    pub fn loop_depth(&self) -> u32 {
        self.loop_depth
    }

    pub fn loop_ceiling(&self) -> u32 {
        self.loop_limit.unwrap_or(DEFAULT_LOOP_LIMIT)
    }

    pub fn set_loop_limit(&mut self, limit: u32) {
        self.loop_limit = Some(limit);
    }

    pub fn enter_loop(&mut self) {
        self.loop_depth += 1;
    }

    pub fn set_check_loop_limits(&mut self, check: bool) {
        self.check_loop_limits = check;
    }

    /// Whether the rate/quota gates run for this pass. Nested loop
    /// dispatches skip them unless `check_limits` was requested.
    pub fn limits_enforced(&self) -> bool {
        self.loop_depth == 0 || self.check_loop_limits
    }

    // -- throttling -------------------------------------------------------

    pub fn throttle_depth(&self) -> u32 {
        self.throttle_depth
    }

    pub fn throttle_limit(&self) -> Option<u32> {
        self.throttle_limit
    }

    pub fn set_throttle(&mut self, depth: u32, limit: Option<u32>) {
        self.throttle_depth = depth;
        self.throttle_limit = limit;
    }

    // -- tracing / tagging ------------------------------------------------

    pub fn set_trace_enabled(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn data(&self) -> &HashMap<String, String> {
        &self.data
    }

    pub fn push_tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn set_track_endpoint(&mut self, track: bool) {
        self.track_endpoint = track;
    }

    pub fn endpoint_tracked(&self) -> bool {
        self.track_endpoint
    }

    // -- response cache ---------------------------------------------------

    pub fn set_cache_key(&mut self, key: String) {
        self.cache_key = Some(key);
    }

    pub fn cache_key(&self) -> Option<&str> {
        self.cache_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> GatewayRequest {
        GatewayRequest {
            method: Method::GET,
            uri: uri.parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: "127.0.0.1:55555".parse().unwrap(),
        }
    }

    #[test]
    fn query_param_parsing() {
        let req = request("/a/x?loop_limit=3&check_limits=true&method=POST");
        assert_eq!(req.query_param("loop_limit").as_deref(), Some("3"));
        assert_eq!(req.query_param("check_limits").as_deref(), Some("true"));
        assert_eq!(req.query_param("method").as_deref(), Some("POST"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn loop_ceiling_defaults_to_five() {
        let mut ctx = RequestCtx::new(request("/"));
        assert_eq!(ctx.loop_ceiling(), DEFAULT_LOOP_LIMIT);
        ctx.set_loop_limit(0);
        assert_eq!(ctx.loop_ceiling(), 0);
    }

    #[test]
    fn limits_skipped_inside_loop_unless_requested() {
        let mut ctx = RequestCtx::new(request("/"));
        assert!(ctx.limits_enforced());
        ctx.enter_loop();
        assert!(!ctx.limits_enforced());
        ctx.set_check_loop_limits(true);
        assert!(ctx.limits_enforced());
    }

    #[test]
    fn bind_session_fills_key_hash() {
        let mut ctx = RequestCtx::new(request("/"));
        ctx.bind_session(Session::default(), "tok", "hash123", false);
        assert_eq!(ctx.session().unwrap().key_hash, "hash123");
        assert_eq!(ctx.auth_token(), Some("tok"));
        assert!(!ctx.session_update_scheduled());
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut req = request("/");
        req.headers
            .insert("x-forwarded-for", "10.1.2.3, 10.0.0.1".parse().unwrap());
        assert_eq!(req.client_ip(), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn set_body_updates_content_length() {
        let mut req = request("/");
        req.set_body(Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(req.header("content-length"), Some("7"));
    }
}
