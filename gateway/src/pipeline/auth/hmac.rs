use crate::config::AuthSource;
use crate::ctx::{GatewayRequest, RequestCtx};
use crate::error::ChainError;
use crate::pipeline::auth::{auth_failure_metric, binds_identity};
use crate::pipeline::pre::store_unavailable;
use crate::pipeline::{ChainBase, StepResult};
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::StatusCode;
use regex::Regex;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use std::sync::OnceLock;
use subtle::ConstantTimeEq;

const DATE_HEADER: &str = "date";
/// Some client stacks cannot set `Date`; they send this instead and it is
/// preferred whenever present.
const ALT_DATE_HEADER: &str = "x-aux-date";

const KNOWN_ALGORITHMS: [&str; 4] = ["hmac-sha1", "hmac-sha256", "hmac-sha384", "hmac-sha512"];

fn lowercase_escape_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("%[a-f0-9][a-f0-9]").expect("static pattern"))
}

fn malformed() -> ChainError {
    ChainError::auth(
        StatusCode::BAD_REQUEST,
        "Authorization field missing, malformed or invalid",
    )
}

#[derive(Debug, Default, PartialEq)]
struct FieldValues {
    key_id: String,
    algorithm: String,
    headers: Vec<String>,
    signature: String,
}

/// HMAC signature check over the `Authorization: Signature ...` header.
pub async fn process(base: &ChainBase, ctx: &mut RequestCtx) -> Result<StepResult, ChainError> {
    let header = match ctx.request.header("authorization") {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => {
            auth_failure_metric(base, "hmac");
            return Err(malformed());
        }
    };

    let fields = parse_field_values(strip_signature_prefix(&header)).map_err(|e| {
        tracing::debug!("hmac: field extraction failed: {}", e);
        auth_failure_metric(base, "hmac");
        malformed()
    })?;

    let allowed = &base.spec.def.hmac_allowed_algorithms;
    if !allowed.is_empty() && !allowed.iter().any(|a| a == &fields.algorithm) {
        tracing::debug!(algorithm = %fields.algorithm, "hmac: algorithm not allowed");
        auth_failure_metric(base, "hmac");
        return Err(malformed());
    }
    if !fields.algorithm.is_empty() && !KNOWN_ALGORITHMS.contains(&fields.algorithm.as_str()) {
        // No allow-list to stop it: keep the legacy SHA-1 fallback but
        // leave a trail for the operator.
        tracing::warn!(
            algorithm = %fields.algorithm,
            "hmac: unknown algorithm declared, falling back to hmac-sha1"
        );
    }

    let canonical = signature_string(&ctx.request, &fields.headers);

    let (key_hash, session) = base
        .sessions
        .session_by_token(&fields.key_id)
        .await
        .map_err(store_unavailable)?;
    let session = match session {
        Some(s) => s,
        None => {
            auth_failure_metric(base, "hmac");
            return Err(ChainError::auth(
                StatusCode::FORBIDDEN,
                "Access to this API has been disallowed",
            ));
        }
    };
    if !session.hmac_enabled || session.hmac_secret.is_empty() {
        tracing::info!(key_id = %fields.key_id, "hmac: session has no usable HMAC secret");
        auth_failure_metric(base, "hmac");
        return Err(malformed());
    }

    let expected = encode_signature(&canonical, &session.hmac_secret, &fields.algorithm);

    let mut matches = constant_time_eq(&expected, &fields.signature);
    if !matches {
        // Some stacks emit lower-case percent escapes; retry with the
        // escapes upper-cased before rejecting.
        let uppered = uppercase_escapes(&fields.signature);
        if uppered != fields.signature {
            matches = constant_time_eq(&expected, &uppered);
        }
    }
    if !matches {
        tracing::debug!(key_id = %fields.key_id, "hmac: signature mismatch");
        auth_failure_metric(base, "hmac");
        return Err(malformed());
    }

    let (_, date_value) = date_header(&ctx.request);
    if !check_clock_skew(&date_value, base.spec.def.hmac_allowed_clock_skew) {
        tracing::debug!("hmac: clock skew outside of acceptable bounds");
        auth_failure_metric(base, "hmac");
        return Err(malformed());
    }

    if binds_identity(&base.spec, AuthSource::HmacKey) {
        let key_id = fields.key_id.clone();
        ctx.bind_session(session, &key_id, &key_hash, false);
    }
    Ok(StepResult::Continue)
}

fn strip_signature_prefix(token: &str) -> &str {
    token
        .strip_prefix("Signature")
        .or_else(|| token.strip_prefix("signature"))
        .unwrap_or(token)
        .trim()
}

fn parse_field_values(auth_header: &str) -> Result<FieldValues, String> {
    let mut fields = FieldValues::default();
    for element in auth_header.split(',') {
        let parts: Vec<&str> = element.split('=').collect();
        if parts.len() != 2 {
            return Err("field value malformed (need two elements in field)".to_string());
        }
        let key = parts[0].trim().to_ascii_lowercase();
        let value = parts[1].trim_matches('"');
        match key.as_str() {
            "keyid" => fields.key_id = value.to_string(),
            "algorithm" => fields.algorithm = value.to_string(),
            "headers" => {
                fields.headers = value.split(' ').map(str::to_string).collect();
            }
            "signature" => fields.signature = value.to_string(),
            other => {
                return Err(format!("header key '{other}' is not in the allowed parameter list"));
            }
        }
    }
    // Date is the absolute minimum header set.
    if fields.headers.is_empty() {
        fields.headers.push(DATE_HEADER.to_string());
    }
    Ok(fields)
}

/// Resolve the effective date header: the auxiliary header wins whenever
/// present, otherwise `Date`.
fn date_header(req: &GatewayRequest) -> (String, String) {
    if let Some(aux) = req.header(ALT_DATE_HEADER) {
        if !aux.is_empty() {
            tracing::warn!("hmac: using auxiliary date header for this request");
            return (ALT_DATE_HEADER.to_string(), aux.to_string());
        }
    }
    if let Some(date) = req.header(DATE_HEADER) {
        if !date.is_empty() {
            return (DATE_HEADER.to_string(), date.to_string());
        }
    }
    (String::new(), String::new())
}

/// Canonical signing string: newline-separated `name: value` lines in the
/// declared header order. `(request-target)` expands to the lower-cased
/// method and path; `date` resolves through [`date_header`].
fn signature_string(req: &GatewayRequest, field_headers: &[String]) -> String {
    let mut out = String::new();
    for (i, header) in field_headers.iter().enumerate() {
        let lowered = header.trim().to_ascii_lowercase();
        if lowered == "(request-target)" {
            out.push_str("(request-target): ");
            out.push_str(&req.method.as_str().to_ascii_lowercase());
            out.push(' ');
            out.push_str(req.uri.path());
        } else {
            let (name, value) = if lowered == DATE_HEADER {
                date_header(req)
            } else {
                (
                    lowered.clone(),
                    req.header(&lowered).unwrap_or("").to_string(),
                )
            };
            out.push_str(name.trim());
            out.push_str(": ");
            out.push_str(value.trim());
        }
        if i != field_headers.len() - 1 {
            out.push('\n');
        }
    }
    out
}

fn mac_bytes<M: Mac + hmac::digest::KeyInit>(secret: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = <M as Mac>::new_from_slice(secret).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// URL-escaped base64 of the canonical string's MAC. Unknown algorithms
/// fall through to SHA-1.
pub(crate) fn encode_signature(canonical: &str, secret: &str, algorithm: &str) -> String {
    let key = secret.as_bytes();
    let data = canonical.as_bytes();
    let raw = match algorithm {
        "hmac-sha256" => mac_bytes::<Hmac<Sha256>>(key, data),
        "hmac-sha384" => mac_bytes::<Hmac<Sha384>>(key, data),
        "hmac-sha512" => mac_bytes::<Hmac<Sha512>>(key, data),
        _ => mac_bytes::<Hmac<Sha1>>(key, data),
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
    urlencoding::encode(&encoded).into_owned()
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).unwrap_u8() == 1
}

fn uppercase_escapes(signature: &str) -> String {
    lowercase_escape_pattern()
        .replace_all(signature, |caps: &regex::Captures<'_>| {
            caps[0].to_ascii_uppercase()
        })
        .into_owned()
}

/// A skew ceiling of zero or less disables the check entirely; otherwise
/// the date must parse (RFC 1123 with a zone name, then with a numeric
/// offset) and sit within `allowed_ms` of now.
fn check_clock_skew(date_value: &str, allowed_ms: i64) -> bool {
    if allowed_ms <= 0 {
        return true;
    }
    let parsed = DateTime::parse_from_rfc2822(date_value)
        .or_else(|_| DateTime::parse_from_str(date_value, "%a, %d %b %Y %H:%M:%S %#z"));
    let when = match parsed {
        Ok(t) => t.with_timezone(&Utc),
        Err(e) => {
            tracing::debug!(date = %date_value, "hmac: date parsing failed: {}", e);
            return false;
        }
    };
    (Utc::now() - when).num_milliseconds().abs() <= allowed_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn request(method: Method, path: &str, headers: &[(&str, &str)]) -> GatewayRequest {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        GatewayRequest {
            method,
            uri: path.parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: map,
            body: Bytes::new(),
            peer_addr: "127.0.0.1:4000".parse().unwrap(),
        }
    }

    fn rfc1123_now() -> String {
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    #[test]
    fn parses_field_values() {
        let parsed = parse_field_values(
            r#"keyId="9876",algorithm="hmac-sha1",headers="x-test x-test-2",signature="sig%3D""#,
        )
        .unwrap();
        assert_eq!(parsed.key_id, "9876");
        assert_eq!(parsed.algorithm, "hmac-sha1");
        assert_eq!(parsed.headers, vec!["x-test", "x-test-2"]);
        assert_eq!(parsed.signature, "sig%3D");
    }

    #[test]
    fn missing_headers_field_defaults_to_date() {
        let parsed = parse_field_values(r#"keyId="k",signature="s""#).unwrap();
        assert_eq!(parsed.headers, vec!["date"]);
    }

    #[test]
    fn rejects_unknown_fields_and_bare_values() {
        assert!(parse_field_values(r#"keyId="k",nonsense="v""#).is_err());
        assert!(parse_field_values("justonetoken").is_err());
    }

    #[test]
    fn strip_prefix_variants() {
        assert_eq!(strip_signature_prefix(r#"Signature keyId="k""#), r#"keyId="k""#);
        assert_eq!(strip_signature_prefix(r#"signature keyId="k""#), r#"keyId="k""#);
        assert_eq!(strip_signature_prefix(r#"keyId="k""#), r#"keyId="k""#);
    }

    #[test]
    fn sign_verify_round_trip_all_algorithms() {
        let date = rfc1123_now();
        let req = request(Method::GET, "/widgets/7", &[("date", date.as_str())]);
        for algorithm in KNOWN_ALGORITHMS {
            let canonical = signature_string(&req, &["date".to_string()]);
            let signed = encode_signature(&canonical, "secret-key", algorithm);
            let again = encode_signature(&canonical, "secret-key", algorithm);
            assert_eq!(signed, again, "{algorithm} must be deterministic");
            assert!(constant_time_eq(&signed, &again));
        }
    }

    #[test]
    fn request_target_expansion() {
        let req = request(Method::POST, "/orders", &[]);
        let canonical = signature_string(&req, &["(request-target)".to_string()]);
        assert_eq!(canonical, "(request-target): post /orders");
    }

    #[test]
    fn aux_date_preferred_over_date() {
        let req = request(
            Method::GET,
            "/",
            &[
                ("date", "Mon, 02 Jan 2006 15:04:05 GMT"),
                ("x-aux-date", "Tue, 03 Jan 2006 15:04:05 GMT"),
            ],
        );
        let canonical = signature_string(&req, &["date".to_string()]);
        assert_eq!(canonical, "x-aux-date: Tue, 03 Jan 2006 15:04:05 GMT");
    }

    #[test]
    fn multi_header_canonical_string() {
        let req = request(
            Method::GET,
            "/x",
            &[("x-test", "a"), ("x-test-2", "b")],
        );
        let canonical =
            signature_string(&req, &["x-test".to_string(), "x-test-2".to_string()]);
        assert_eq!(canonical, "x-test: a\nx-test-2: b");
    }

    #[test]
    fn lowercase_escape_retry_accepts_case_variants() {
        let canonical = "date: Mon, 02 Jan 2006 15:04:05 GMT";
        let expected = encode_signature(canonical, "secret", "hmac-sha1");
        // A SHA-1 MAC base64-encodes to 28 chars with '=' padding, so the
        // escaped form always carries %3D. Lower-case the escapes the way
        // broken encoders do and check the retry path normalizes them.
        let lowered = expected
            .replace("%2F", "%2f")
            .replace("%2B", "%2b")
            .replace("%3D", "%3d");
        assert_ne!(lowered, expected);
        assert_eq!(uppercase_escapes(&lowered), expected);
    }

    #[test]
    fn clock_skew_disabled_accepts_anything() {
        assert!(check_clock_skew("not a date", 0));
        assert!(check_clock_skew("not a date", -1));
    }

    #[test]
    fn clock_skew_bounds_enforced() {
        assert!(check_clock_skew(&rfc1123_now(), 10_000));
        assert!(!check_clock_skew("Mon, 02 Jan 2006 15:04:05 GMT", 10_000));
        assert!(!check_clock_skew("garbage", 10_000));
    }

    #[test]
    fn numeric_offset_fallback_parses() {
        let stamped = Utc::now().format("%a, %d %b %Y %H:%M:%S +00").to_string();
        assert!(check_clock_skew(&stamped, 10_000));
    }
}
