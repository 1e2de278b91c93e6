pub mod basic;
pub mod hmac;
pub mod jwt;
pub mod oauth;
pub mod openid;
pub mod token;

use crate::config::AuthSource;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::hooks::HookType;
use crate::pipeline::{ChainBase, StepResult};
use crate::spec::ApiSpec;
use http::StatusCode;

/// Whether a scheme's accepted session becomes the canonical one for the
/// downstream policy gates. With no selector configured every scheme may
/// bind; otherwise only the selected scheme writes the context session.
pub(crate) fn binds_identity(spec: &ApiSpec, scheme: AuthSource) -> bool {
    matches!(spec.def.base_identity_provided_by, AuthSource::Unset)
        || spec.def.base_identity_provided_by == scheme
}

/// Pull the raw credential from the spec's configured sources: the auth
/// header first, then (when enabled) a query parameter or cookie.
pub(crate) fn extract_auth_value(spec: &ApiSpec, ctx: &RequestCtx) -> Option<String> {
    let auth = &spec.def.auth;
    if let Some(v) = ctx.request.header(&auth.auth_header_name) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if auth.use_param {
        let name = if auth.param_name.is_empty() {
            &auth.auth_header_name
        } else {
            &auth.param_name
        };
        if let Some(v) = ctx.request.query_param(name) {
            return Some(v);
        }
    }
    if auth.use_cookie {
        let name = if auth.cookie_name.is_empty() {
            &auth.auth_header_name
        } else {
            &auth.cookie_name
        };
        if let Some(cookies) = ctx.request.header("cookie") {
            for pair in cookies.split(';') {
                let mut kv = pair.trim().splitn(2, '=');
                if kv.next() == Some(name.as_str()) {
                    return kv.next().map(str::to_string);
                }
            }
        }
    }
    None
}

/// Strip an optional `Bearer ` prefix, case-insensitively.
pub(crate) fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("bearer ") {
        trimmed[7..].trim()
    } else {
        trimmed
    }
}

pub(crate) fn auth_failure_metric(base: &ChainBase, scheme: &'static str) {
    metrics::counter!(
        "gateway_auth_failures_total",
        "api" => base.spec.def.name.clone(),
        "scheme" => scheme,
    )
    .increment(1);
}

/// Custom hook step. A `CustomKeyCheck` hook is an auth scheme: after
/// dispatch the context must carry a session, otherwise the caller is not
/// authorized.
pub(crate) async fn custom_hook(
    base: &ChainBase,
    ctx: &mut RequestCtx,
    hook: HookType,
    name: &str,
) -> Result<StepResult, ChainError> {
    base.hook_dispatcher.dispatch(hook, name, ctx).await?;
    if hook == HookType::CustomKeyCheck && ctx.session().is_none() {
        auth_failure_metric(base, "custom");
        return Err(ChainError::auth(
            StatusCode::FORBIDDEN,
            "Access to this API has been disallowed",
        ));
    }
    Ok(StepResult::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_stripping() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bearer abc"), "abc");
        assert_eq!(strip_bearer("  Bearer   abc "), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
        assert_eq!(strip_bearer("Bearerabc"), "Bearerabc");
    }
}
