use crate::config::AuthSource;
use crate::ctx::RequestCtx;
use crate::error::ChainError;
use crate::pipeline::auth::{auth_failure_metric, binds_identity, strip_bearer};
use crate::pipeline::pre::store_unavailable;
use crate::pipeline::{ChainBase, StepResult};
use base64::Engine;
use http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct OidcClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    aud: serde_json::Value,
}

fn aud_contains(aud: &serde_json::Value, client_ids: &[String]) -> bool {
    if client_ids.is_empty() {
        return true;
    }
    match aud {
        serde_json::Value::String(s) => client_ids.iter().any(|c| c == s),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .any(|s| client_ids.iter().any(|c| c == s)),
        _ => false,
    }
}

/// OpenID Connect check: validate the ID token against the configured
/// provider for its issuer, require an allowed client in `aud`, and bind
/// the session registered for `<issuer><sub>`.
pub async fn process(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let raw = ctx.request.header("authorization").unwrap_or("").to_string();
    let token = strip_bearer(&raw).to_string();
    if token.is_empty() {
        auth_failure_metric(base, "openid");
        return Err(ChainError::auth(
            StatusCode::BAD_REQUEST,
            "Authorization field missing",
        ));
    }

    let providers = &base.spec.def.openid_options.providers;
    let mut verified: Option<OidcClaims> = None;
    for provider in providers {
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&provider.secret)
            .unwrap_or_else(|_| provider.secret.as_bytes().to_vec());
        let key = DecodingKey::from_secret(&secret);
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[provider.issuer.as_str()]);
        validation.validate_aud = false;

        if let Ok(data) = jsonwebtoken::decode::<OidcClaims>(&token, &key, &validation) {
            if aud_contains(&data.claims.aud, &provider.client_ids) {
                verified = Some(data.claims);
                break;
            }
        }
    }

    let claims = match verified {
        Some(c) => c,
        None => {
            auth_failure_metric(base, "openid");
            return Err(ChainError::auth(
                StatusCode::FORBIDDEN,
                "Key not authorised",
            ));
        }
    };

    let identity = format!("{}{}", claims.iss, claims.sub);
    let (key_hash, session) = base
        .sessions
        .session_by_token(&identity)
        .await
        .map_err(store_unavailable)?;
    let session = match session {
        Some(s) => s,
        None => {
            auth_failure_metric(base, "openid");
            return Err(ChainError::auth(
                StatusCode::FORBIDDEN,
                "Key not authorised",
            ));
        }
    };

    if binds_identity(&base.spec, AuthSource::OidcUser) {
        ctx.bind_session(session, &identity, &key_hash, false);
    }
    Ok(StepResult::Continue)
}
