//! End-to-end pipeline tests: a real gateway listener in front of a tiny
//! upstream echo server, driven over loopback HTTP.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use portico_gateway::cache::TtlCache;
use portico_gateway::config::{ApiDefinition, GatewayConfig};
use portico_gateway::error::StoreError;
use portico_gateway::hooks::NoopHookDispatcher;
use portico_gateway::pipeline::assembler::SharedHandles;
use portico_gateway::pipeline::gates::ApiRateLimiter;
use portico_gateway::pipeline::transforms::NoJqTransformer;
use portico_gateway::proxy::breaker::BreakerRegistry;
use portico_gateway::server::{run_proxy_server, GatewayState};
use portico_gateway::session::store::{
    InMemoryOauthStore, InMemorySessionStore, KeyHasher, OauthClient, OauthClientStore,
    SessionManager,
};
use portico_gateway::session::{AccessDefinition, Session};
use portico_gateway::trace::NoopTracer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;

const MULTI_AUTH_TOKEN: &str = "84573485734587384888723487243";

/// Minimal upstream: echoes method and path as JSON.
async fn spawn_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(|req: Request<Incoming>| async move {
                    let body = serde_json::json!({
                        "method": req.method().as_str(),
                        "path": req.uri().path(),
                        "forwarded_for": req
                            .headers()
                            .get("x-forwarded-for")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or(""),
                    })
                    .to_string();
                    Ok::<_, hyper::Error>(
                        Response::builder()
                            .status(StatusCode::OK)
                            .header("content-type", "application/json")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap(),
                    )
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });
    addr
}

fn handles_with(
    sessions: Arc<SessionManager>,
    oauth_clients: Arc<dyn OauthClientStore>,
) -> SharedHandles {
    SharedHandles {
        sessions,
        org_sessions: Arc::new(SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            KeyHasher::new(false),
        )),
        oauth_clients,
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

fn default_sessions() -> Arc<SessionManager> {
    Arc::new(SessionManager::new(
        Arc::new(InMemorySessionStore::new()),
        KeyHasher::new(true),
    ))
}

async fn spawn_gateway(apis: Vec<ApiDefinition>, shared: SharedHandles) -> SocketAddr {
    let mut config = GatewayConfig::default();
    config.apis = apis;
    let config = Arc::new(config);

    let state = GatewayState::new(config.clone(), shared);
    state.load_apis(&config.apis);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_proxy_server(listener, state, Arc::new(Notify::new())));
    addr
}

async fn send(
    addr: SocketAddr,
    method: Method,
    path: &str,
    headers: &[(&str, String)],
) -> (StatusCode, HeaderMap, Bytes) {
    let client: hyper_util::client::legacy::Client<_, Full<Bytes>> =
        hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build_http();
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"));
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    let resp = client
        .request(builder.body(Full::new(Bytes::new())).unwrap())
        .await
        .unwrap();
    let (parts, body) = resp.into_parts();
    let bytes = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, bytes)
}

fn multi_auth_definition(upstream: SocketAddr) -> ApiDefinition {
    serde_json::from_value(serde_json::json!({
        "api_id": "55",
        "org_id": "default",
        "name": "Multi Key Test",
        "use_basic_auth": true,
        "use_standard_auth": true,
        "base_identity_provided_by": "auth_token",
        "auth": {"auth_header_name": "x-standard-auth"},
        "version_data": {
            "not_versioned": true,
            "versions": {"v1": {"name": "v1"}}
        },
        "proxy": {"listen_path": "/v1", "target_url": format!("http://{upstream}/")}
    }))
    .unwrap()
}

fn token_session(now: i64) -> Session {
    Session {
        rate: 100.0,
        allowance: 100.0,
        per: 1.0,
        last_check: now,
        quota_max: 1000,
        quota_remaining: 900,
        quota_renewal_rate: 300,
        quota_renews: now + 300,
        access_rights: HashMap::from([(
            "55".to_string(),
            AccessDefinition {
                api_name: "Multi Key Test".to_string(),
                api_id: "55".to_string(),
                versions: vec!["default".to_string()],
                ..AccessDefinition::default()
            },
        )]),
        ..Session::default()
    }
}

fn basic_session(now: i64) -> Session {
    let mut session = token_session(now);
    session.rate = 8.0;
    session.allowance = 8.0;
    session.quota_max = -1;
    session.quota_remaining = 1;
    session.basic_auth_data.password = "TEST".to_string();
    session
}

async fn multi_auth_gateway() -> SocketAddr {
    let upstream = spawn_upstream().await;
    let sessions = default_sessions();
    let now = chrono::Utc::now().timestamp();

    sessions
        .update_session("default0987876", &basic_session(now), None)
        .await
        .unwrap();
    sessions
        .update_session(MULTI_AUTH_TOKEN, &token_session(now), None)
        .await
        .unwrap();

    let shared = handles_with(sessions, Arc::new(InMemoryOauthStore::new()));
    spawn_gateway(vec![multi_auth_definition(upstream)], shared).await
}

fn basic_header(username: &str, password: &str) -> String {
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
    format!("Basic {encoded}")
}

#[tokio::test]
async fn multi_auth_base_identity_is_token_session() {
    let gw = multi_auth_gateway().await;
    let (status, headers, _) = send(
        gw,
        Method::GET,
        "/v1/",
        &[
            ("authorization", basic_header("0987876", "TEST")),
            ("x-standard-auth", format!("Bearer {MULTI_AUTH_TOKEN}")),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Quota comes from the token session (900 → 899), not the Basic
    // session's unlimited sentinel.
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert_eq!(remaining, "899");
}

#[tokio::test]
async fn multi_auth_basic_failure_is_401() {
    let gw = multi_auth_gateway().await;
    let (status, headers, _) = send(
        gw,
        Method::GET,
        "/v1/",
        &[
            ("authorization", basic_header("0987876", "WRONG")),
            ("x-standard-auth", format!("Bearer {MULTI_AUTH_TOKEN}")),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(headers.contains_key("www-authenticate"));
}

#[tokio::test]
async fn multi_auth_token_failure_is_403() {
    let gw = multi_auth_gateway().await;
    let (status, _, _) = send(
        gw,
        Method::GET,
        "/v1/",
        &[
            ("authorization", basic_header("0987876", "TEST")),
            ("x-standard-auth", "Bearer WRONGTOKEN".to_string()),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn quota_decrements_across_requests() {
    let gw = multi_auth_gateway().await;
    let headers = [
        ("authorization", basic_header("0987876", "TEST")),
        ("x-standard-auth", format!("Bearer {MULTI_AUTH_TOKEN}")),
    ];
    let (_, first, _) = send(gw, Method::GET, "/v1/", &headers).await;
    let (_, second, _) = send(gw, Method::GET, "/v1/", &headers).await;
    assert_eq!(first.get("x-ratelimit-remaining").unwrap(), "899");
    assert_eq!(second.get("x-ratelimit-remaining").unwrap(), "898");
}

#[tokio::test]
async fn rate_limit_query_endpoint_reports_session() {
    let gw = multi_auth_gateway().await;
    let (status, _, body) = send(
        gw,
        Method::GET,
        "/v1portico/rate-limits/",
        &[
            ("authorization", basic_header("0987876", "TEST")),
            ("x-standard-auth", format!("Bearer {MULTI_AUTH_TOKEN}")),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["quota"]["quota_max"], 1000);
    // The identity chain proves who is asking without consuming quota.
    assert_eq!(parsed["quota"]["quota_remaining"], 900);
}

#[tokio::test]
async fn keyless_api_forwards_with_proxy_headers() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "open",
        "name": "open api",
        "use_keyless": true,
        "proxy": {"listen_path": "/open", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let (status, _, body) = send(gw, Method::GET, "/open/widgets", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["path"], "/open/widgets");
    assert_eq!(parsed["forwarded_for"], "127.0.0.1");
}

#[tokio::test]
async fn unknown_path_is_404() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "open",
        "name": "open api",
        "use_keyless": true,
        "proxy": {"listen_path": "/open", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;
    let (status, _, _) = send(gw, Method::GET, "/elsewhere", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Loop dispatch
// ---------------------------------------------------------------------------

fn loop_definition(upstream: SocketAddr) -> ApiDefinition {
    serde_json::from_value(serde_json::json!({
        "api_id": "loop-a",
        "name": "loop api",
        "use_keyless": true,
        "proxy": {"listen_path": "/a", "target_url": format!("http://{upstream}/")},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "extended_paths": {
                    "url_rewrites": [
                        {
                            "path": "/x",
                            "match_pattern": "^/x",
                            "rewrite_to": "portico://self/b"
                        },
                        {
                            "path": "/y",
                            "match_pattern": "^/y",
                            "rewrite_to": "portico://self/b?loop_limit=0"
                        }
                    ]
                }
            }}
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn loop_to_self_reaches_inner_path() {
    let upstream = spawn_upstream().await;
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![loop_definition(upstream)], shared).await;

    let (status, _, body) = send(gw, Method::GET, "/a/x", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    // The nested dispatch re-enters the chain at /b and forwards that.
    assert_eq!(parsed["path"], "/b");
}

#[tokio::test]
async fn loop_limit_zero_overflows() {
    let upstream = spawn_upstream().await;
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![loop_definition(upstream)], shared).await;

    let (status, _, body) = send(gw, Method::GET, "/a/y", &[]).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(parsed["error"]
        .as_str()
        .unwrap()
        .starts_with("Loop level too deep"));
}

#[tokio::test]
async fn loop_can_target_internal_api_by_name() {
    let upstream = spawn_upstream().await;
    let outer: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "outer",
        "name": "outer",
        "use_keyless": true,
        "proxy": {"listen_path": "/out", "target_url": format!("http://{upstream}/")},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "extended_paths": {
                    "url_rewrites": [{
                        "path": "/jump",
                        "match_pattern": "^/jump",
                        "rewrite_to": "portico://inner/landed?method=POST"
                    }]
                }
            }}
        }
    }))
    .unwrap();
    let inner: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "inner",
        "name": "inner",
        "internal": true,
        "use_keyless": true,
        "proxy": {"listen_path": "/hidden", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();

    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![outer, inner], shared).await;

    // The internal API is invisible to the router...
    let (status, _, _) = send(gw, Method::GET, "/hidden/landed", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // ...but reachable through the loop, with the method override applied.
    let (status, _, body) = send(gw, Method::GET, "/out/jump", &[]).await;
    assert_eq!(status, StatusCode::OK);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["path"], "/landed");
    assert_eq!(parsed["method"], "POST");
}

// ---------------------------------------------------------------------------
// OAuth client revocation caching
// ---------------------------------------------------------------------------

struct CountingOauthStore {
    inner: InMemoryOauthStore,
    lookups: AtomicUsize,
}

#[async_trait]
impl OauthClientStore for CountingOauthStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<OauthClient>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_client(client_id).await
    }
}

#[tokio::test]
async fn revoked_oauth_client_is_cached_negatively() {
    let upstream = spawn_upstream().await;
    let sessions = default_sessions();
    let now = chrono::Utc::now().timestamp();

    let mut session = token_session(now);
    session.access_rights = HashMap::from([(
        "oauth-api".to_string(),
        AccessDefinition {
            api_id: "oauth-api".to_string(),
            versions: vec!["default".to_string()],
            ..AccessDefinition::default()
        },
    )]);
    session.oauth_client_id = "deleted-client".to_string();
    sessions
        .update_session("oauth-token-1", &session, None)
        .await
        .unwrap();

    let store = Arc::new(CountingOauthStore {
        inner: InMemoryOauthStore::new(),
        lookups: AtomicUsize::new(0),
    });

    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "oauth-api",
        "name": "oauth api",
        "use_oauth2": true,
        "proxy": {"listen_path": "/oauth", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();

    let shared = handles_with(sessions, store.clone());
    let gw = spawn_gateway(vec![def], shared).await;

    let auth = [("authorization", "Bearer oauth-token-1".to_string())];
    let (status, _, _) = send(gw, Method::GET, "/oauth/", &auth).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

    // The deletion is cached: an immediate retry never hits storage.
    let (status, _, _) = send(gw, Method::GET, "/oauth/", &auth).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Reload swap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reload_swaps_generations_atomically() {
    let upstream = spawn_upstream().await;
    let make_def = |api_id: &str, listen: &str| -> ApiDefinition {
        serde_json::from_value(serde_json::json!({
            "api_id": api_id,
            "name": api_id,
            "use_keyless": true,
            "proxy": {"listen_path": listen, "target_url": format!("http://{upstream}/")},
            "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
        }))
        .unwrap()
    };

    let mut config = GatewayConfig::default();
    config.apis = vec![make_def("one", "/one")];
    let config = Arc::new(config);
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let state = GatewayState::new(config.clone(), shared);
    state.load_apis(&config.apis);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_proxy_server(listener, state.clone(), Arc::new(Notify::new())));

    let (status, _, _) = send(addr, Method::GET, "/one/x", &[]).await;
    assert_eq!(status, StatusCode::OK);

    // Swap in a generation where /one is gone and /two exists.
    state.load_apis(&[make_def("two", "/two")]);

    let (status, _, _) = send(addr, Method::GET, "/one/x", &[]).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = send(addr, Method::GET, "/two/x", &[]).await;
    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Response pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn response_header_injection_and_cache() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "cached",
        "name": "cached api",
        "use_keyless": true,
        "cache_options": {"enable_cache": true, "cache_timeout_secs": 60, "cache_all_safe_requests": true},
        "response_processors": [{"name": "header_injector"}],
        "proxy": {"listen_path": "/c", "target_url": format!("http://{upstream}/")},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "extended_paths": {
                    "transform_response_headers": [{
                        "path": "/",
                        "add_headers": {"x-api-flavor": "vanilla"},
                        "delete_headers": ["content-type"]
                    }]
                }
            }}
        }
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let (status, headers, _) = send(gw, Method::GET, "/c/data", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-api-flavor").unwrap(), "vanilla");
    assert!(!headers.contains_key("content-type"));
    assert!(!headers.contains_key("x-portico-cached-response"));

    // Second request is served from the response cache.
    let (status, headers, _) = send(gw, Method::GET, "/c/data", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-portico-cached-response").unwrap(), "1");
    assert_eq!(headers.get("x-api-flavor").unwrap(), "vanilla");
}

// ---------------------------------------------------------------------------
// Scheme-specific end-to-end checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hmac_signed_request_round_trips() {
    let upstream = spawn_upstream().await;
    let sessions = default_sessions();
    let now = chrono::Utc::now().timestamp();

    let mut session = token_session(now);
    session.access_rights = HashMap::from([(
        "hmac-api".to_string(),
        AccessDefinition {
            api_id: "hmac-api".to_string(),
            versions: vec!["default".to_string()],
            ..AccessDefinition::default()
        },
    )]);
    session.hmac_enabled = true;
    session.hmac_secret = "9879879878787878".to_string();
    sessions.update_session("hmac-key-1", &session, None).await.unwrap();

    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "hmac-api",
        "name": "hmac api",
        "enable_signature_checking": true,
        "hmac_allowed_clock_skew": 60000,
        "proxy": {"listen_path": "/h", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let shared = handles_with(sessions, Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let canonical = format!("date: {date}");

    // Signature per the documented scheme: URL-escaped base64 HMAC-SHA1.
    use hmac::Mac;
    let mut mac = hmac::Hmac::<sha1::Sha1>::new_from_slice(b"9879879878787878").unwrap();
    mac.update(canonical.as_bytes());
    let sig = urlencoding::encode(
        &base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()),
    )
    .into_owned();
    let auth = format!(r#"Signature keyId="hmac-key-1",algorithm="hmac-sha1",signature="{sig}""#);

    let (status, _, _) = send(
        gw,
        Method::GET,
        "/h/data",
        &[("authorization", auth.clone()), ("date", date.clone())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Tampered signature is a 400, not a 403.
    let broken = auth.replace("signature=\"", "signature=\"AAAA");
    let (status, _, _) = send(
        gw,
        Method::GET,
        "/h/data",
        &[("authorization", broken), ("date", date)],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn jwt_identity_claim_resolves_session() {
    let upstream = spawn_upstream().await;
    let sessions = default_sessions();
    let now = chrono::Utc::now().timestamp();

    let mut session = token_session(now);
    session.access_rights = HashMap::from([(
        "jwt-api".to_string(),
        AccessDefinition {
            api_id: "jwt-api".to_string(),
            versions: vec!["default".to_string()],
            ..AccessDefinition::default()
        },
    )]);
    sessions.update_session("caller-77", &session, None).await.unwrap();

    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "jwt-api",
        "name": "jwt api",
        "enable_jwt": true,
        "jwt_signing_method": "hmac",
        "jwt_source": "c2hhcmVkLXNlY3JldA==",
        "proxy": {"listen_path": "/j", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let shared = handles_with(sessions, Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let claims = serde_json::json!({
        "sub": "caller-77",
        "exp": now + 600,
    });
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"shared-secret"),
    )
    .unwrap();

    let (status, _, _) = send(
        gw,
        Method::GET,
        "/j/data",
        &[("authorization", format!("Bearer {token}"))],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // A token signed with the wrong secret is malformed, not unknown.
    let bad = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"other-secret"),
    )
    .unwrap();
    let (status, _, _) = send(
        gw,
        Method::GET,
        "/j/data",
        &[("authorization", format!("Bearer {bad}"))],
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Hooks and virtual endpoints
// ---------------------------------------------------------------------------

struct SessionMintingHook {
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl portico_gateway::hooks::HookDispatcher for SessionMintingHook {
    async fn dispatch(
        &self,
        hook: portico_gateway::hooks::HookType,
        _name: &str,
        ctx: &mut portico_gateway::ctx::RequestCtx,
    ) -> Result<(), portico_gateway::error::ChainError> {
        if hook != portico_gateway::hooks::HookType::CustomKeyCheck {
            return Ok(());
        }
        let Some(key) = ctx.request.header("x-custom-key").map(str::to_string) else {
            return Ok(());
        };
        if key != "hook-approved" {
            return Ok(());
        }
        let hash = self.sessions.hash(&key);
        ctx.bind_session(Session::default(), &key, &hash, false);
        Ok(())
    }
}

#[tokio::test]
async fn scripted_auth_hook_binds_session() {
    let upstream = spawn_upstream().await;
    let sessions = default_sessions();
    let mut shared = handles_with(sessions.clone(), Arc::new(InMemoryOauthStore::new()));
    shared.hook_dispatcher = Arc::new(SessionMintingHook { sessions });

    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "hooked",
        "name": "hooked api",
        "custom_middleware": {
            "driver": "scripted",
            "auth_check": {"name": "checkKey"}
        },
        "proxy": {"listen_path": "/hk", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let gw = spawn_gateway(vec![def], shared).await;

    let (status, _, _) = send(
        gw,
        Method::GET,
        "/hk/x",
        &[("x-custom-key", "hook-approved".to_string())],
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The hook not binding a session is an authorization failure.
    let (status, _, _) = send(gw, Method::GET, "/hk/x", &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

struct StaticVirtualHandler;

impl portico_gateway::pipeline::transforms::VirtualHandler for StaticVirtualHandler {
    fn handle(
        &self,
        function_name: &str,
        _ctx: &portico_gateway::ctx::RequestCtx,
    ) -> Option<hyper::Response<portico_gateway::proxy::BoxBody>> {
        Some(
            Response::builder()
                .status(StatusCode::OK)
                .header("x-virtual-function", function_name)
                .body(portico_gateway::proxy::full_body("synthesized"))
                .unwrap(),
        )
    }
}

#[tokio::test]
async fn virtual_endpoint_synthesizes_response() {
    let upstream = spawn_upstream().await;
    let mut shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    shared.virtual_handler = Some(Arc::new(StaticVirtualHandler));

    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "virt",
        "name": "virtual api",
        "use_keyless": true,
        "proxy": {"listen_path": "/vt", "target_url": format!("http://{upstream}/")},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "extended_paths": {
                    "virtual_endpoints": [{"path": "/synth", "function_name": "makeItUp"}]
                }
            }}
        }
    }))
    .unwrap();
    let gw = spawn_gateway(vec![def], shared).await;

    let (status, headers, body) = send(gw, Method::GET, "/vt/synth", &[]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-virtual-function").unwrap(), "makeItUp");
    assert_eq!(&body[..], b"synthesized");

    // Other paths still reach the upstream.
    let (_, _, body) = send(gw, Method::GET, "/vt/real", &[]).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["path"], "/vt/real");
}

// ---------------------------------------------------------------------------
// Version and policy behaviors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ignored_path_bypasses_auth() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "ig",
        "name": "ignored paths",
        "use_standard_auth": true,
        "proxy": {"listen_path": "/ig", "target_url": format!("http://{upstream}/")},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "extended_paths": {"ignored": [{"path": "/ping"}]}
            }}
        }
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let (status, _, _) = send(gw, Method::GET, "/ig/ping", &[]).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(gw, Method::GET, "/ig/other", &[]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn expired_version_is_forbidden() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "old",
        "name": "expired api",
        "use_keyless": true,
        "proxy": {"listen_path": "/old", "target_url": format!("http://{upstream}/")},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "expires": "2001-01-01T00:00:00Z"
            }}
        }
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let (status, _, body) = send(gw, Method::GET, "/old/x", &[]).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["error"], "API version has expired");
}

#[tokio::test]
async fn granular_access_rules_apply() {
    let upstream = spawn_upstream().await;
    let sessions = default_sessions();
    let now = chrono::Utc::now().timestamp();

    let mut session = token_session(now);
    session.access_rights = HashMap::from([(
        "gr".to_string(),
        AccessDefinition {
            api_id: "gr".to_string(),
            versions: vec!["default".to_string()],
            allowed_urls: vec![portico_gateway::session::AccessSpec {
                url: "/allowed".to_string(),
                methods: vec!["GET".to_string()],
            }],
            ..AccessDefinition::default()
        },
    )]);
    sessions.update_session("granular-key", &session, None).await.unwrap();

    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "gr",
        "name": "granular api",
        "use_standard_auth": true,
        "proxy": {"listen_path": "/gr", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let shared = handles_with(sessions, Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let auth = [("authorization", "Bearer granular-key".to_string())];
    let (status, _, _) = send(gw, Method::GET, "/gr/allowed", &auth).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = send(gw, Method::GET, "/gr/forbidden", &auth).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn per_api_rate_limit_rejects_overflow() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "capped",
        "name": "capped api",
        "use_keyless": true,
        "global_rate": 2.0,
        "global_rate_per": 60.0,
        "proxy": {"listen_path": "/cap", "target_url": format!("http://{upstream}/")},
        "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    let (first, _, _) = send(gw, Method::GET, "/cap/a", &[]).await;
    let (second, _, _) = send(gw, Method::GET, "/cap/b", &[]).await;
    let (third, _, _) = send(gw, Method::GET, "/cap/c", &[]).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(third, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn request_transforms_reach_upstream() {
    let upstream = spawn_upstream().await;
    let def: ApiDefinition = serde_json::from_value(serde_json::json!({
        "api_id": "tr",
        "name": "transforming api",
        "use_keyless": true,
        "proxy": {"listen_path": "/tr", "target_url": format!("http://{upstream}/"), "strip_listen_path": true},
        "version_data": {
            "not_versioned": true,
            "versions": {"Default": {
                "name": "Default",
                "extended_paths": {
                    "method_transforms": [{"path": "/submit", "method": "GET", "to_method": "POST"}],
                    "url_rewrites": [{
                        "path": "/legacy/(\\w+)",
                        "match_pattern": "^/legacy/(\\w+)",
                        "rewrite_to": "/modern/$1"
                    }]
                }
            }}
        }
    }))
    .unwrap();
    let shared = handles_with(default_sessions(), Arc::new(InMemoryOauthStore::new()));
    let gw = spawn_gateway(vec![def], shared).await;

    // Method transform.
    let (_, _, body) = send(gw, Method::GET, "/tr/submit", &[]).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["method"], "POST");

    // URL rewrite plus listen-path stripping.
    let (_, _, body) = send(gw, Method::GET, "/tr/legacy/widget", &[]).await;
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["path"], "/modern/widget");
}
