use crate::config::AuthSource;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::auth::{auth_failure_metric, binds_identity};
use crate::pipeline::pre::store_unavailable;
use crate::pipeline::{ChainBase, StepResult};
use http::StatusCode;
use std::time::Duration;

/// How long a confirmed-present client suppresses repeat storage lookups.
const CLIENT_PRESENT_TTL: Duration = Duration::from_secs(1);

fn deleted_client_cache_key(api_id: &str, client_id: &str) -> String {
    format!("oauth-del-{api_id}{client_id}")
}

/// OAuth2 bearer check: resolve the access token's session, then make sure
/// the issuing OAuth client still exists. Client deletion is cached
/// permanently in the process-wide cache; presence is cached for one
/// second so revocation propagates quickly without hammering storage.
pub async fn process(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let header = ctx.request.header("authorization").unwrap_or("").to_string();
    let mut parts = header.split_whitespace();
    let scheme = parts.next().unwrap_or("");
    let access_token = parts.next().unwrap_or("");

    if scheme.is_empty() || access_token.is_empty() {
        auth_failure_metric(base, "oauth");
        return Err(ChainError::auth(
            StatusCode::BAD_REQUEST,
            "Authorization field missing",
        ));
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        auth_failure_metric(base, "oauth");
        return Err(ChainError::auth(
            StatusCode::BAD_REQUEST,
            "Bearer token malformed",
        ));
    }

    let (key_hash, session) = base
        .sessions
        .session_by_token(access_token)
        .await
        .map_err(store_unavailable)?;
    let session = match session {
        Some(s) => s,
        None => {
            auth_failure_metric(base, "oauth");
            return Err(ChainError::auth(
                StatusCode::FORBIDDEN,
                "Key not authorised",
            ));
        }
    };

    if !session.oauth_client_id.is_empty() {
        let cache_key = deleted_client_cache_key(&base.spec.def.api_id, &session.oauth_client_id);
        let deleted = match base.util_cache.get(&cache_key) {
            Some(flag) => flag,
            None => match base.oauth_clients.get_client(&session.oauth_client_id).await {
                Ok(Some(_)) => {
                    base.util_cache
                        .set(&cache_key, false, Some(CLIENT_PRESENT_TTL));
                    false
                }
                Ok(None) => {
                    // The client is gone for good; remember that forever.
                    base.util_cache.set(&cache_key, true, None);
                    true
                }
                Err(e) => {
                    // Transient storage trouble is a cache miss, not a
                    // revocation.
                    tracing::warn!("oauth: client lookup failed, treating as present: {}", e);
                    false
                }
            },
        };
        if deleted {
            tracing::warn!(
                client_id = %session.oauth_client_id,
                "oauth: attempted access for deleted OAuth client"
            );
            auth_failure_metric(base, "oauth");
            return Err(ChainError::auth(
                StatusCode::FORBIDDEN,
                "Key not authorised. OAuth client access was revoked",
            ));
        }
    }

    if binds_identity(&base.spec, AuthSource::OauthKey) {
        ctx.bind_session(session, access_token, &key_hash, false);
    }
    Ok(StepResult::Continue)
}
