use crate::config::AuthSource;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::auth::{auth_failure_metric, extract_auth_value, strip_bearer, binds_identity};
use crate::pipeline::pre::store_unavailable;
use crate::pipeline::{ChainBase, StepResult};
use base64::Engine;
use http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};

/// The signing secret may arrive base64-encoded; fall back to the raw
/// bytes when it does not decode.
fn secret_bytes(source: &str) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(source)
        .unwrap_or_else(|_| source.as_bytes().to_vec())
}

fn algorithm_for(method: &str) -> Result<Algorithm, ChainError> {
    match method {
        // The bare family name selects the default member.
        "" | "hmac" | "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(ChainError::auth(
            StatusCode::BAD_REQUEST,
            format!("Unsupported JWT signing method '{other}'"),
        )),
    }
}

/// JWT check: verify the token against the spec's shared secret, read the
/// identity claim, and bind the session registered for that identity.
pub async fn process(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let raw = match extract_auth_value(&base.spec, ctx) {
        Some(v) => v,
        None => {
            auth_failure_metric(base, "jwt");
            return Err(ChainError::auth(
                StatusCode::BAD_REQUEST,
                "Authorization field missing",
            ));
        }
    };
    let token = strip_bearer(&raw).to_string();

    let algorithm = algorithm_for(base.spec.def.jwt_signing_method.as_str())?;
    let key = DecodingKey::from_secret(&secret_bytes(&base.spec.def.jwt_source));
    let validation = Validation::new(algorithm);

    let claims = match jsonwebtoken::decode::<serde_json::Value>(&token, &key, &validation) {
        Ok(data) => data.claims,
        Err(e) => {
            auth_failure_metric(base, "jwt");
            use jsonwebtoken::errors::ErrorKind as JwtError;
            return Err(match e.kind() {
                JwtError::ExpiredSignature => {
                    ChainError::auth(StatusCode::FORBIDDEN, "Key has expired, please renew")
                }
                _ => ChainError::auth(StatusCode::BAD_REQUEST, "Key not authorized"),
            });
        }
    };

    let identity_field = if base.spec.def.jwt_identity_base_field.is_empty() {
        "sub"
    } else {
        base.spec.def.jwt_identity_base_field.as_str()
    };
    let identity = claims
        .get(identity_field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            auth_failure_metric(base, "jwt");
            ChainError::auth(StatusCode::BAD_REQUEST, "Key ID not found")
        })?;

    let (key_hash, session) = base
        .sessions
        .session_by_token(&identity)
        .await
        .map_err(store_unavailable)?;
    let session = match session {
        Some(s) => s,
        None => {
            auth_failure_metric(base, "jwt");
            return Err(ChainError::auth(StatusCode::FORBIDDEN, "Key not authorized"));
        }
    };

    if binds_identity(&base.spec, AuthSource::JwtClaim) {
        ctx.bind_session(session, &identity, &key_hash, false);
    }
    Ok(StepResult::Continue)
}
