use crate::config::AuthSource;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::auth::{auth_failure_metric, binds_identity};
use crate::pipeline::pre::store_unavailable;
use crate::pipeline::{ChainBase, StepResult};
use base64::Engine;
use http::StatusCode;
use subtle::ConstantTimeEq;

/// Basic credentials are stored under `<org_id><username>`, so two orgs can
/// carry the same username without colliding.
fn session_key(org_id: &str, username: &str) -> String {
    format!("{org_id}{username}")
}

fn unauthorized(message: &str) -> ChainError {
    // RFC 7617: a challenge accompanies every 401.
    ChainError::auth(StatusCode::UNAUTHORIZED, message)
}

/// Basic auth check: decode the credential pair, resolve the stored
/// session for the user, and compare passwords in constant time.
pub async fn process(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let header = match ctx.request.header("authorization") {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => {
            auth_failure_metric(base, "basic");
            return Err(unauthorized("Authorization field missing"));
        }
    };

    let encoded = match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("basic") => rest.trim(),
        _ => {
            auth_failure_metric(base, "basic");
            return Err(ChainError::auth(
                StatusCode::BAD_REQUEST,
                "Attempted access with malformed header, auth data not encoded correctly",
            ));
        }
    };

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(|| {
            auth_failure_metric(base, "basic");
            ChainError::auth(
                StatusCode::BAD_REQUEST,
                "Attempted access with malformed header, auth data not encoded correctly",
            )
        })?;

    let (username, password) = decoded.split_once(':').ok_or_else(|| {
        auth_failure_metric(base, "basic");
        ChainError::auth(
            StatusCode::BAD_REQUEST,
            "Attempted access with malformed header, values not in basic auth format",
        )
    })?;

    let key = session_key(&base.spec.def.org_id, username);
    let (key_hash, session) = base
        .sessions
        .session_by_token(&key)
        .await
        .map_err(store_unavailable)?;

    let session = match session {
        Some(s) => s,
        None => {
            auth_failure_metric(base, "basic");
            return Err(unauthorized("User not authorised"));
        }
    };

    let stored = session.basic_auth_data.password.as_bytes();
    if stored.is_empty() || stored.ct_eq(password.as_bytes()).unwrap_u8() != 1 {
        auth_failure_metric(base, "basic");
        return Err(unauthorized("User not authorised"));
    }

    if binds_identity(&base.spec, AuthSource::BasicAuthUser) {
        ctx.bind_session(session, &key, &key_hash, false);
    }
    Ok(StepResult::Continue)
}
