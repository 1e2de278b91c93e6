use crate::ctx::{GatewayRequest, RequestCtx};
use crate::error::ChainError;
use crate::pipeline::pre::relative_path;
use crate::pipeline::transforms::LOOP_SCHEME;
use crate::pipeline::{error_response, ApiChain, Terminal};
use crate::proxy::breaker::BreakerCheck;
use crate::proxy::response::UpstreamResponse;
use crate::proxy::{full_body, BoxBody};
use crate::router::{RouteMatch, RoutingTable};
use crate::server::GatewayState;
use crate::session::QUOTA_UNLIMITED;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle one incoming request: locate the API by host and longest listen
/// path, run its chain, forward (or loop), run the response processors,
/// flush any scheduled session update, and log the access line.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let health_path = format!("/{}", state.config.health_check_endpoint_name);
    if req.uri().path() == health_path {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .body(full_body("Hello portico"))
            .unwrap());
    }

    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read request body: {}", e);
            return Ok(plain_error(StatusCode::BAD_REQUEST, "bad request"));
        }
    };
    if body_bytes.len() as u64 > state.config.max_request_body_bytes {
        return Ok(plain_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload too large",
        ));
    }

    // One generation per request: everything below resolves against the
    // table that was live when the request started.
    let table = state.table.load_full();

    let matched = match table.match_request(&host, parts.uri.path()) {
        Some(m) => m,
        None => {
            debug!("proxy: no API matched, host={}, path={}", host, parts.uri.path());
            metrics::counter!(
                "gateway_http_requests_total",
                "api" => "_no_match",
                "method" => parts.method.as_str().to_string(),
                "status_code" => "404",
            )
            .increment(1);
            return Ok(plain_error(StatusCode::NOT_FOUND, "not found"));
        }
    };

    let (entry, chain) = match &matched {
        RouteMatch::Api(entry) => (entry.clone(), entry.chain.clone()),
        RouteMatch::RateLimits(entry) => {
            let chain = entry
                .rate_limit_chain
                .clone()
                .unwrap_or_else(|| entry.chain.clone());
            (entry.clone(), chain)
        }
    };

    let mut ctx = RequestCtx::new(GatewayRequest {
        method: parts.method.clone(),
        uri: parts.uri.clone(),
        version: parts.version,
        headers: parts.headers.clone(),
        body: body_bytes,
        peer_addr,
    });

    let span = if state.config.tracing.enabled {
        ctx.set_trace_enabled(true);
        Some(state.shared.tracer.start_span(&entry.spec.def.name))
    } else {
        None
    };

    // No panic may escape a request; anything that slips through a step
    // becomes a plain 500.
    let dispatched = std::panic::AssertUnwindSafe(dispatch(&chain, &state, &table, &mut ctx))
        .catch_unwind()
        .await;
    let response = match dispatched {
        Ok(resp) => resp,
        Err(_) => {
            warn!(api_id = %entry.spec.def.api_id, "proxy: recovered from panic in request pipeline");
            error_response(&ChainError::internal("internal server error"), &entry.spec.def.name)
        }
    };

    flush_session_update(&state, &ctx).await;

    if let Some(span) = span {
        debug!(
            operation = %span.operation,
            elapsed_ms = span.started.elapsed().as_millis() as u64,
            "trace: span finished"
        );
    }

    finalize(&entry.spec.def.name, &host, &ctx, &response);
    Ok(response)
}

/// Run a chain to completion. Boxed so the loop dispatcher can recurse
/// into another API's chain; the depth ceiling bounds the recursion.
pub fn dispatch<'a>(
    chain: &'a Arc<ApiChain>,
    state: &'a GatewayState,
    table: &'a Arc<RoutingTable>,
    ctx: &'a mut RequestCtx,
) -> BoxFuture<'a, Response<BoxBody>> {
    Box::pin(async move {
        let api_name = chain.base.spec.def.name.clone();
        match chain.run_steps(ctx).await {
            Err(err) => error_response(&err, &api_name),
            Ok(Some(resp)) => resp,
            Ok(None) => match chain.terminal {
                Terminal::RateLimitInfo => rate_limit_info(ctx),
                Terminal::Proxy => {
                    if ctx.request.uri.scheme_str() == Some(LOOP_SCHEME) {
                        loop_dispatch(chain, state, table, ctx).await
                    } else {
                        forward_upstream(chain, state, ctx).await
                    }
                }
            },
        }
    })
}

/// In-process redispatch: the rewritten URL's host names the target API,
/// query parameters tune depth ceiling and nested limit enforcement.
async fn loop_dispatch(
    chain: &Arc<ApiChain>,
    state: &GatewayState,
    table: &Arc<RoutingTable>,
    ctx: &mut RequestCtx,
) -> Response<BoxBody> {
    let api_name = chain.base.spec.def.name.clone();

    if let Some(limit) = ctx
        .request
        .query_param("loop_limit")
        .and_then(|v| v.parse::<u32>().ok())
    {
        ctx.set_loop_limit(limit);
    }
    ctx.set_check_loop_limits(ctx.request.query_param("check_limits").as_deref() == Some("true"));

    let ceiling = ctx.loop_ceiling();
    if ctx.loop_depth() + 1 > ceiling {
        let err = ChainError::loop_overflow(format!(
            "Loop level too deep. Found more than {ceiling} loops in single request"
        ));
        return error_response(&err, &api_name);
    }

    let target_host = ctx.request.uri.host().unwrap_or("").to_string();
    let target_chain = if target_host == "self" {
        chain.clone()
    } else {
        // The nested API re-selects its own version.
        ctx.set_version(None);
        match table.fuzzy_find(&target_host) {
            Some(entry) => entry.chain.clone(),
            None => {
                return error_response(
                    &ChainError::internal("Can't detect loop target"),
                    &api_name,
                );
            }
        }
    };

    if let Some(override_method) = ctx.request.query_param("method") {
        if let Ok(method) = override_method.to_ascii_uppercase().parse::<Method>() {
            ctx.request.method = method;
        }
    }

    // Back to a plain HTTP request: the loop path, with host and query
    // restored from the pre-rewrite URL when one was stashed.
    let loop_path = ctx.request.uri.path().to_string();
    let loop_query = ctx.request.uri.query().map(str::to_string);
    let new_uri = match ctx.take_orig_url() {
        Some(orig) => rebuild_uri(&loop_path, orig.query(), orig.authority().cloned()),
        None => rebuild_uri(&loop_path, loop_query.as_deref(), None),
    };
    ctx.request.uri = new_uri;

    ctx.enter_loop();
    debug!(
        depth = ctx.loop_depth(),
        target = %target_host,
        "proxy: loop dispatch"
    );
    dispatch(&target_chain, state, table, ctx).await
}

fn rebuild_uri(path: &str, query: Option<&str>, authority: Option<http::uri::Authority>) -> Uri {
    let path_and_query = match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    };
    match authority {
        Some(auth) => Uri::builder()
            .scheme("http")
            .authority(auth)
            .path_and_query(path_and_query)
            .build()
            .unwrap_or_else(|_| Uri::from_static("/")),
        None => path_and_query
            .parse()
            .unwrap_or_else(|_| Uri::from_static("/")),
    }
}

/// Answer `GET <listenPath>portico/rate-limits/` from the bound session.
fn rate_limit_info(ctx: &RequestCtx) -> Response<BoxBody> {
    let Some(session) = ctx.session() else {
        return error_response(
            &ChainError::policy("Access to this API has been disallowed"),
            "rate-limits",
        );
    };
    let body = serde_json::json!({
        "quota": {
            "quota_max": session.quota_max,
            "quota_remaining": session.quota_remaining,
            "quota_renews": session.quota_renews,
        },
        "rate_limit": {
            "rate": session.rate,
            "per": session.per,
        }
    })
    .to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body("{}")))
}

/// Forward to the upstream and run the response pipeline over the result.
async fn forward_upstream(
    chain: &Arc<ApiChain>,
    state: &GatewayState,
    ctx: &mut RequestCtx,
) -> Response<BoxBody> {
    let base = &chain.base;
    let spec = &base.spec;
    let api_name = spec.def.name.clone();
    let method = ctx.request.method.clone();
    let rel_path = relative_path(ctx.request.path(), &spec.listen_path).to_string();

    let upstream_uri = match build_upstream_uri(chain, ctx) {
        Ok(uri) => uri,
        Err(err) => return error_response(&err, &api_name),
    };

    // Per-endpoint hard timeout, enforcement flag cached on the spec.
    let mut timeout = Duration::from_secs(state.config.proxy_default_timeout_secs.max(1));
    if spec.enforced_timeout_enabled {
        if let Some(version) = spec.version(ctx.version()) {
            if let Some((_, secs)) = version
                .hard_timeouts
                .iter()
                .find(|(endpoint, _)| endpoint.matches(&method, &rel_path))
            {
                timeout = Duration::from_secs((*secs).max(1));
            }
        }
    }

    // Per-endpoint circuit breaker.
    let mut active_breaker = None;
    if spec.circuit_breaker_enabled {
        if let Some(version) = spec.version(ctx.version()) {
            if let Some(rule) = version
                .circuit_breakers
                .iter()
                .find(|b| b.endpoint.matches(&method, &rel_path))
            {
                match base.breakers.check(&rule.key, &rule.config) {
                    BreakerCheck::Allowed | BreakerCheck::Probe => {
                        active_breaker = Some(rule);
                    }
                    BreakerCheck::Rejected => {
                        debug!(api_id = %spec.def.api_id, "proxy: circuit breaker open");
                        return error_response(
                            &ChainError::upstream(
                                StatusCode::SERVICE_UNAVAILABLE,
                                "Service temporarily disconnected",
                            ),
                            &api_name,
                        );
                    }
                }
            }
        }
    }

    let mut headers = ctx.request.headers.clone();
    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, ctx.request.peer_addr, &ctx.request.uri);
    if let Some(authority) = upstream_uri.authority() {
        if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, v);
        }
    }

    let mut builder = Request::builder().method(method.clone()).uri(&upstream_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(full_body(ctx.request.body.clone())) {
        Ok(r) => r,
        Err(e) => {
            warn!("proxy: failed to build upstream request: {}", e);
            return error_response(&ChainError::internal("internal server error"), &api_name);
        }
    };

    let upstream_start = Instant::now();
    let result = tokio::time::timeout(timeout, state.client.request(upstream_req)).await;

    let upstream_resp = match result {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(api_id = %spec.def.api_id, uri = %upstream_uri, "proxy: upstream error: {}", e);
            if let Some(rule) = active_breaker {
                base.breakers.record_failure(&rule.key, &rule.config);
            }
            return error_response(
                &ChainError::upstream(
                    StatusCode::BAD_GATEWAY,
                    "There was a problem proxying the request",
                ),
                &api_name,
            );
        }
        Err(_) => {
            warn!(api_id = %spec.def.api_id, uri = %upstream_uri, "proxy: upstream hard timeout");
            if let Some(rule) = active_breaker {
                base.breakers.record_failure(&rule.key, &rule.config);
            }
            return error_response(
                &ChainError::upstream(
                    StatusCode::GATEWAY_TIMEOUT,
                    "Upstream service reached hard timeout",
                ),
                &api_name,
            );
        }
    };

    let status = upstream_resp.status();
    if let Some(rule) = active_breaker {
        if status.is_server_error() {
            base.breakers.record_failure(&rule.key, &rule.config);
        } else {
            base.breakers.record_success(&rule.key, &rule.config);
        }
    }
    metrics::histogram!(
        "gateway_upstream_request_duration_seconds",
        "api" => api_name.clone(),
    )
    .record(upstream_start.elapsed().as_secs_f64());

    let (resp_parts, resp_body) = upstream_resp.into_parts();
    let resp_bytes = match resp_body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("proxy: failed to read upstream body: {}", e);
            return error_response(
                &ChainError::upstream(StatusCode::BAD_GATEWAY, "There was a problem proxying the request"),
                &api_name,
            );
        }
    };

    let mut response = UpstreamResponse {
        status: resp_parts.status,
        headers: resp_parts.headers,
        body: resp_bytes,
    };

    // Response processors, in definition order.
    for step in &chain.response_steps {
        if let Err(e) = step.process(base, ctx, &mut response) {
            warn!(step = step.name(), "response processor failed: {}", e.message);
        }
    }

    let mut builder = Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }
    builder = attach_rate_limit_headers(builder, chain, ctx);
    builder
        .body(full_body(response.body))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

/// Compose the outbound URI. An absolute http(s) URI left on the request
/// by a rewrite wins; otherwise the spec (or version override) target is
/// joined with the request path, minus the listen path when stripping is
/// configured.
fn build_upstream_uri(chain: &Arc<ApiChain>, ctx: &RequestCtx) -> Result<Uri, ChainError> {
    let spec = &chain.base.spec;
    let req_uri = &ctx.request.uri;

    if req_uri.scheme_str() == Some("http") || req_uri.scheme_str() == Some("https") {
        if req_uri.authority().is_some() {
            return Ok(req_uri.clone());
        }
    }

    let target = spec
        .version(ctx.version())
        .and_then(|v| v.override_target.clone())
        .unwrap_or_else(|| spec.target.clone());

    let scheme = target.scheme_str().unwrap_or("http");
    let authority = target
        .authority()
        .map(|a| a.as_str())
        .ok_or_else(|| ChainError::internal("upstream target has no authority"))?;

    let inbound_path = if spec.def.proxy.strip_listen_path {
        relative_path(req_uri.path(), &spec.listen_path)
    } else {
        req_uri.path()
    };
    let base_path = target.path().trim_end_matches('/');
    let mut path_and_query = format!("{base_path}{inbound_path}");
    if let Some(q) = req_uri.query() {
        path_and_query.push('?');
        path_and_query.push_str(q);
    }

    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| ChainError::internal(format!("failed to build upstream URI: {e}")))
}

/// `X-RateLimit-*` reflect the canonical session's quota after this
/// request's decrement; -1 marks an unlimited key.
fn attach_rate_limit_headers(
    mut builder: http::response::Builder,
    chain: &Arc<ApiChain>,
    ctx: &RequestCtx,
) -> http::response::Builder {
    if chain.base.spec.def.use_keyless {
        return builder;
    }
    if let Some(session) = ctx.session() {
        let remaining = if session.quota_unlimited() {
            QUOTA_UNLIMITED
        } else {
            session.quota_remaining
        };
        builder = builder
            .header("x-ratelimit-limit", session.quota_max.to_string())
            .header("x-ratelimit-remaining", remaining.to_string())
            .header("x-ratelimit-reset", session.quota_renews.to_string());
    }
    builder
}

async fn flush_session_update(state: &GatewayState, ctx: &RequestCtx) {
    if !ctx.session_update_scheduled() {
        return;
    }
    let (Some(hash), Some(session)) = (ctx.hashed_token(), ctx.session()) else {
        return;
    };
    let ttl = match state.config.session_lifetime_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    if let Err(e) = state
        .shared
        .sessions
        .update_session_hashed(hash, session, ttl)
        .await
    {
        warn!("proxy: scheduled session update failed: {}", e);
    }
}

fn finalize(api_name: &str, host: &str, ctx: &RequestCtx, response: &Response<BoxBody>) {
    let status = response.status().as_u16();
    let mut buf = itoa::Buffer::new();
    let status_str = buf.format(status);

    metrics::counter!(
        "gateway_http_requests_total",
        "api" => api_name.to_string(),
        "method" => ctx.request.method.as_str().to_string(),
        "status_code" => status_str.to_string(),
    )
    .increment(1);
    metrics::histogram!(
        "gateway_http_request_duration_seconds",
        "api" => api_name.to_string(),
    )
    .record(ctx.start.elapsed().as_secs_f64());

    tracing::info!(
        client_ip = %ctx.request.client_ip(),
        method = %ctx.request.method,
        host = %host,
        path = %ctx.request.path(),
        status = status,
        api = %api_name,
        loop_depth = ctx.loop_depth(),
        tracked = ctx.endpoint_tracked(),
        latency_ms = ctx.start.elapsed().as_millis() as u64,
        "access"
    );
}

fn plain_error(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(format!(r#"{{"error":"{msg}"}}"#)))
        .unwrap_or_else(|_| Response::new(full_body("")))
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in hop_headers {
        headers.remove(h);
    }
}

/// Standard `X-Forwarded-*` / `X-Real-IP` so upstream services can see the
/// original caller.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, peer_addr: SocketAddr, inbound: &Uri) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{existing}, {peer_ip}");
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    // Trust an incoming value set by a TLS-terminating front; default to
    // plain http otherwise.
    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(XFH.clone(), host);
    } else if let Some(authority) = inbound.authority() {
        if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}
