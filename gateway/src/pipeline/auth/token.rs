use crate::config::AuthSource;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::auth::{auth_failure_metric, binds_identity, extract_auth_value, strip_bearer};
use crate::pipeline::{ChainBase, StepResult};
use crate::pipeline::pre::store_unavailable;
use http::StatusCode;

/// Standard token check: read the key from the configured source, hash it
/// store-side, and bind the session it resolves to.
pub async fn process(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let raw = match extract_auth_value(&base.spec, ctx) {
        Some(v) => v,
        None => {
            auth_failure_metric(base, "token");
            return Err(ChainError::auth(
                StatusCode::UNAUTHORIZED,
                "Authorization field missing",
            ));
        }
    };
    let key = strip_bearer(&raw).to_string();
    if key.is_empty() {
        auth_failure_metric(base, "token");
        return Err(ChainError::auth(
            StatusCode::UNAUTHORIZED,
            "Authorization field missing",
        ));
    }

    let (key_hash, session) = base
        .sessions
        .session_by_token(&key)
        .await
        .map_err(store_unavailable)?;

    let session = match session {
        Some(s) => s,
        None => {
            auth_failure_metric(base, "token");
            return Err(ChainError::auth(
                StatusCode::FORBIDDEN,
                "Access to this API has been disallowed",
            ));
        }
    };

    if binds_identity(&base.spec, AuthSource::AuthToken) {
        ctx.bind_session(session, &key, &key_hash, false);
    }
    Ok(StepResult::Continue)
}
