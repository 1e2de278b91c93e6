use crate::ctx::RequestCtx;
use crate::error::{ChainError, ErrorKind};
use crate::pipeline::pre::relative_path;
use crate::pipeline::{ChainBase, StepResult};
use crate::proxy::{full_body, BoxBody};
use bytes::Bytes;
use http::{Method, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Scheme marking a rewritten request as an in-process redispatch.
pub const LOOP_SCHEME: &str = "portico";

/// JQ transform capability. The real runtime is optional; the default
/// implementation passes bodies through untouched.
pub trait JqTransformer: Send + Sync {
    fn transform(&self, filter: &str, body: &Bytes) -> Result<Bytes, ChainError>;
}

pub struct NoJqTransformer;

impl JqTransformer for NoJqTransformer {
    fn transform(&self, _filter: &str, body: &Bytes) -> Result<Bytes, ChainError> {
        tracing::warn!("JQ transforms not supported");
        Ok(body.clone())
    }
}

/// Virtual endpoint capability: synthesize a response without an upstream.
/// Absent by default; a scripting runtime provides the implementation.
pub trait VirtualHandler: Send + Sync {
    fn handle(&self, function_name: &str, ctx: &RequestCtx) -> Option<Response<BoxBody>>;
}

// ---------------------------------------------------------------------------
// JSON schema validation (structural subset: type / required / properties /
// items).
// ---------------------------------------------------------------------------

pub fn validate_json(base: &ChainBase, ctx: &RequestCtx) -> Result<StepResult, ChainError> {
    let Some(version) = base.spec.version(ctx.version()) else {
        return Ok(StepResult::Continue);
    };
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    for rule in &version.validate_json {
        if !rule.endpoint.matches(&method, &path) {
            continue;
        }
        let body: serde_json::Value = serde_json::from_slice(&ctx.request.body)
            .map_err(|_| validation_error("body is not valid JSON".to_string()))?;
        if let Err(detail) = validate_value(&rule.schema, &body, "$") {
            return Err(validation_error(detail));
        }
    }
    Ok(StepResult::Continue)
}

fn validation_error(detail: String) -> ChainError {
    ChainError {
        kind: ErrorKind::Policy,
        status: StatusCode::UNPROCESSABLE_ENTITY,
        message: format!("Payload failed validation: {detail}"),
    }
}

fn type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

pub(crate) fn validate_value(
    schema: &serde_json::Value,
    value: &serde_json::Value,
    path: &str,
) -> Result<(), String> {
    if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
        if !type_matches(expected, value) {
            return Err(format!("{path}: expected {expected}"));
        }
    }
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        let object = value.as_object();
        for field in required.iter().filter_map(|f| f.as_str()) {
            if object.map_or(true, |o| !o.contains_key(field)) {
                return Err(format!("{path}: missing required field '{field}'"));
            }
        }
    }
    if let (Some(props), Some(object)) = (
        schema.get("properties").and_then(|p| p.as_object()),
        value.as_object(),
    ) {
        for (key, sub_schema) in props {
            if let Some(sub_value) = object.get(key) {
                validate_value(sub_schema, sub_value, &format!("{path}.{key}"))?;
            }
        }
    }
    if let (Some(items), Some(array)) = (schema.get("items"), value.as_array()) {
        for (i, item) in array.iter().enumerate() {
            validate_value(items, item, &format!("{path}[{i}]"))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Body transforms.
// ---------------------------------------------------------------------------

/// RFC 7386 merge patch: objects merge recursively, nulls delete, anything
/// else replaces.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch_map) => {
            if !target.is_object() {
                *target = serde_json::Value::Object(serde_json::Map::new());
            }
            if let Some(target_map) = target.as_object_mut() {
                for (key, patch_value) in patch_map {
                    if patch_value.is_null() {
                        target_map.remove(key);
                    } else {
                        let slot = target_map
                            .entry(key.clone())
                            .or_insert(serde_json::Value::Null);
                        merge_patch(slot, patch_value);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

pub(crate) fn apply_body_transform(
    body: &Bytes,
    merge: &serde_json::Value,
) -> Result<Bytes, ChainError> {
    let mut value: serde_json::Value = if body.is_empty() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(body).map_err(|e| {
            ChainError::auth(StatusCode::BAD_REQUEST, format!("Body is not valid JSON: {e}"))
        })?
    };
    merge_patch(&mut value, merge);
    Ok(Bytes::from(value.to_string()))
}

pub fn transform_body(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let merge = base.spec.version(ctx.version()).and_then(|version| {
        version
            .transforms
            .iter()
            .find(|t| t.endpoint.matches(&method, &path))
            .map(|t| t.merge.clone())
    });
    if let Some(merge) = merge {
        let body = apply_body_transform(&ctx.request.body, &merge)?;
        ctx.request.set_body(body);
    }
    Ok(StepResult::Continue)
}

pub fn transform_jq(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let filter = base.spec.version(ctx.version()).and_then(|version| {
        version
            .jq_transforms
            .iter()
            .find(|t| t.endpoint.matches(&method, &path))
            .map(|t| t.filter.clone())
    });
    if let Some(filter) = filter {
        let body = base.jq.transform(&filter, &ctx.request.body)?;
        ctx.request.set_body(body);
    }
    Ok(StepResult::Continue)
}

// ---------------------------------------------------------------------------
// Header / URL / method transforms.
// ---------------------------------------------------------------------------

/// Expand `$ctx.<name>` tokens against the request's context-variable map.
pub(crate) fn expand_vars(value: &str, ctx: &RequestCtx) -> String {
    if !value.contains("$ctx.") {
        return value.to_string();
    }
    let mut out = value.to_string();
    for (key, replacement) in ctx.data() {
        let token = format!("$ctx.{key}");
        if out.contains(&token) {
            out = out.replace(&token, replacement);
        }
    }
    out
}

pub fn transform_headers(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let Some(version) = base.spec.version(ctx.version()) else {
        return Ok(StepResult::Continue);
    };
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let mut removals: Vec<String> = version.global_headers_remove.clone();
    let mut additions: Vec<(String, String)> = version
        .global_headers
        .iter()
        .map(|(k, v)| (k.clone(), expand_vars(v, ctx)))
        .collect();

    for inject in &version.header_injects {
        if !inject.endpoint.matches(&method, &path) {
            continue;
        }
        removals.extend(inject.delete_headers.iter().cloned());
        additions.extend(
            inject
                .add_headers
                .iter()
                .map(|(k, v)| (k.clone(), expand_vars(v, ctx))),
        );
    }

    for name in &removals {
        ctx.request.headers.remove(name.to_ascii_lowercase().as_str());
    }
    for (name, value) in additions {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(&value),
        ) {
            ctx.request.headers.insert(name, value);
        } else {
            tracing::warn!(header = %name, "transform_headers: skipping invalid header");
        }
    }
    Ok(StepResult::Continue)
}

pub fn url_rewrite(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let rewritten = base.spec.version(ctx.version()).and_then(|version| {
        version.url_rewrites.iter().find_map(|rule| {
            if !rule.endpoint.matches(&method, &path) {
                return None;
            }
            if !rule.match_pattern.is_match(&path) {
                return None;
            }
            Some(
                rule.match_pattern
                    .replace(&path, rule.rewrite_to.as_str())
                    .into_owned(),
            )
        })
    });

    let Some(target) = rewritten else {
        return Ok(StepResult::Continue);
    };

    if target.starts_with(&format!("{LOOP_SCHEME}://"))
        || target.starts_with("http://")
        || target.starts_with("https://")
    {
        match target.parse::<http::Uri>() {
            Ok(uri) => {
                // Keep the pre-rewrite URL around: the loop dispatcher
                // restores its host and query on redispatch.
                ctx.stash_orig_url(ctx.request.uri.clone());
                ctx.request.uri = uri;
            }
            Err(e) => {
                tracing::warn!(target = %target, "url_rewrite: invalid rewrite target: {}", e);
                return Err(ChainError::internal("URL rewrite failed"));
            }
        }
        return Ok(StepResult::Continue);
    }

    // Relative rewrite: swap the path, keep the original query unless the
    // rewrite carries its own.
    let rebuilt = if target.contains('?') {
        target
    } else {
        match ctx.request.uri.query() {
            Some(q) => format!("{target}?{q}"),
            None => target,
        }
    };
    match rebuilt.parse::<http::Uri>() {
        Ok(uri) => {
            ctx.request.uri = uri;
            Ok(StepResult::Continue)
        }
        Err(e) => {
            tracing::warn!(target = %rebuilt, "url_rewrite: invalid rewrite target: {}", e);
            Err(ChainError::internal("URL rewrite failed"))
        }
    }
}

pub fn transform_method(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let to = base.spec.version(ctx.version()).and_then(|version| {
        version
            .method_transforms
            .iter()
            .find(|(endpoint, _)| endpoint.matches(&method, &path))
            .map(|(_, to)| to.clone())
    });
    if let Some(to) = to {
        ctx.request.method = to;
    }
    Ok(StepResult::Continue)
}

// ---------------------------------------------------------------------------
// Response cache lookup.
// ---------------------------------------------------------------------------

fn safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub(crate) fn cache_key_for(api_id: &str, method: &Method, uri: &http::Uri) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_id.as_bytes());
    hasher.update(method.as_str().as_bytes());
    hasher.update(uri.path().as_bytes());
    if let Some(q) = uri.query() {
        hasher.update(q.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn cache_eligible(base: &ChainBase, ctx: &RequestCtx) -> bool {
    let options = &base.spec.def.cache_options;
    let method = &ctx.request.method;
    if options.cache_all_safe_requests && safe_method(method) {
        return true;
    }
    if options
        .cached_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    {
        return true;
    }
    if safe_method(method) {
        let path = relative_path(ctx.request.path(), &base.spec.listen_path);
        if let Some(version) = base.spec.version(ctx.version()) {
            return version.cache_paths.iter().any(|p| path.starts_with(p.as_str()));
        }
    }
    false
}

/// Serve an eligible request from the response cache, or mark it for the
/// cache-write response processor on a miss.
pub fn cache_lookup(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    if !cache_eligible(base, ctx) {
        return Ok(StepResult::Continue);
    }
    let key = cache_key_for(&base.spec.def.api_id, &ctx.request.method, &ctx.request.uri);
    if let Some(cached) = base.response_cache.get(&key) {
        let mut builder = Response::builder().status(cached.status);
        for (name, value) in &cached.headers {
            builder = builder.header(name, value);
        }
        builder = builder.header("x-portico-cached-response", "1");
        let resp = builder
            .body(full_body(cached.body.clone()))
            .map_err(|e| ChainError::internal(format!("cached response rebuild failed: {e}")))?;
        return Ok(StepResult::Respond(resp));
    }
    ctx.set_cache_key(key);
    Ok(StepResult::Continue)
}

pub(crate) fn cache_ttl(base: &ChainBase) -> Duration {
    Duration::from_secs(base.spec.def.cache_options.cache_timeout_secs.max(1))
}

// ---------------------------------------------------------------------------
// Virtual endpoints.
// ---------------------------------------------------------------------------

pub fn virtual_endpoint(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let Some(handler) = &base.virtual_handler else {
        return Ok(StepResult::Continue);
    };
    let method = ctx.request.method.clone();
    let path = relative_path(ctx.request.path(), &base.spec.listen_path).to_string();

    let function = base.spec.version(ctx.version()).and_then(|version| {
        version
            .virtual_endpoints
            .iter()
            .find(|v| v.endpoint.matches(&method, &path))
            .map(|v| v.function_name.clone())
    });
    if let Some(function) = function {
        if let Some(resp) = handler.handle(&function, ctx) {
            return Ok(StepResult::Respond(resp));
        }
    }
    Ok(StepResult::Continue)
}
