use crate::config::{
    ApiDefinition, CircuitBreakerMeta, EndpointMeta, HeaderInjectMeta, JqTransformMeta,
    MethodTransformMeta, TransformMeta, UrlRewriteMeta, ValidateJsonMeta, VirtualMeta,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use http::{Method, Uri};
use regex::Regex;
use std::collections::HashMap;

/// Compiled per-endpoint matcher: regex anchored at the start of the
/// request path, optional method filter.
#[derive(Debug)]
pub struct CompiledEndpoint {
    pub method: Option<Method>,
    pub pattern: Regex,
}

impl CompiledEndpoint {
    fn compile(path: &str, method: &str) -> Result<Self> {
        let method = if method.is_empty() {
            None
        } else {
            Some(
                method
                    .to_ascii_uppercase()
                    .parse::<Method>()
                    .with_context(|| format!("invalid method '{method}'"))?,
            )
        };
        let pattern = Regex::new(&format!("^{path}"))
            .with_context(|| format!("invalid path pattern '{path}'"))?;
        Ok(Self { method, pattern })
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if let Some(ref m) = self.method {
            if m != method {
                return false;
            }
        }
        self.pattern.is_match(path)
    }
}

#[derive(Debug)]
pub struct CompiledRewrite {
    pub endpoint: CompiledEndpoint,
    pub match_pattern: Regex,
    pub rewrite_to: String,
}

#[derive(Debug)]
pub struct CompiledTransform {
    pub endpoint: CompiledEndpoint,
    pub merge: serde_json::Value,
}

#[derive(Debug)]
pub struct CompiledJqTransform {
    pub endpoint: CompiledEndpoint,
    pub filter: String,
}

#[derive(Debug)]
pub struct CompiledHeaderInject {
    pub endpoint: CompiledEndpoint,
    pub add_headers: HashMap<String, String>,
    pub delete_headers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_secs: u64,
}

#[derive(Debug)]
pub struct CompiledBreaker {
    pub endpoint: CompiledEndpoint,
    /// Stable key for the breaker registry; derived from the rule, not the
    /// request, so all requests matching one rule share one breaker.
    pub key: String,
    pub config: BreakerConfig,
}

#[derive(Debug)]
pub struct CompiledValidateJson {
    pub endpoint: CompiledEndpoint,
    pub schema: serde_json::Value,
}

#[derive(Debug)]
pub struct CompiledVirtual {
    pub endpoint: CompiledEndpoint,
    pub function_name: String,
}

/// One API version with every per-endpoint rule compiled.
#[derive(Debug, Default)]
pub struct CompiledVersion {
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub ignored: Vec<CompiledEndpoint>,
    pub white_list: Vec<CompiledEndpoint>,
    pub black_list: Vec<CompiledEndpoint>,
    pub url_rewrites: Vec<CompiledRewrite>,
    pub transforms: Vec<CompiledTransform>,
    pub transforms_response: Vec<CompiledTransform>,
    pub jq_transforms: Vec<CompiledJqTransform>,
    pub jq_transforms_response: Vec<CompiledJqTransform>,
    pub header_injects: Vec<CompiledHeaderInject>,
    pub header_injects_response: Vec<CompiledHeaderInject>,
    pub hard_timeouts: Vec<(CompiledEndpoint, u64)>,
    pub circuit_breakers: Vec<CompiledBreaker>,
    pub cache_paths: Vec<String>,
    pub method_transforms: Vec<(CompiledEndpoint, Method)>,
    pub validate_json: Vec<CompiledValidateJson>,
    pub virtual_endpoints: Vec<CompiledVirtual>,
    pub track_endpoints: Vec<CompiledEndpoint>,
    pub do_not_track_endpoints: Vec<CompiledEndpoint>,
    pub override_target: Option<Uri>,
    pub global_headers: HashMap<String, String>,
    pub global_headers_remove: Vec<String>,
    pub global_size_limit: u64,
}

impl CompiledVersion {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }
}

/// Immutable compiled description of one fronted API. Built once per
/// reload generation; the live routing table owns the current set.
#[derive(Debug)]
pub struct ApiSpec {
    pub def: ApiDefinition,
    pub target: Uri,
    /// Effective listen path; collision resolution may suffix it, so it is
    /// carried separately from the definition.
    pub listen_path: String,
    /// Lowercased at compile time.
    pub tag_headers: Vec<String>,
    pub versions: HashMap<String, CompiledVersion>,
    /// Flags precomputed so the terminal handler does no scanning unless a
    /// matching rule can exist.
    pub enforced_timeout_enabled: bool,
    pub circuit_breaker_enabled: bool,
}

impl ApiSpec {
    /// Compile a definition. Errors here are configuration errors: the
    /// loader logs them, marks the spec skipped, and continues with its
    /// siblings.
    pub fn compile(def: ApiDefinition) -> Result<Self> {
        if def.proxy.listen_path.is_empty() {
            anyhow::bail!("listen path is empty");
        }
        if def.proxy.listen_path.contains(' ') {
            anyhow::bail!("listen path contains spaces");
        }
        let target: Uri = def
            .proxy
            .target_url
            .parse()
            .with_context(|| format!("couldn't parse target URL '{}'", def.proxy.target_url))?;
        if target.scheme().is_none() || target.authority().is_none() {
            anyhow::bail!("target URL '{}' is not absolute", def.proxy.target_url);
        }

        let tag_headers = def
            .tag_headers
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .collect();

        let mut versions = HashMap::new();
        let mut enforced_timeout_enabled = false;
        let mut circuit_breaker_enabled = false;
        for (key, info) in &def.version_data.versions {
            let compiled = compile_version(&def.api_id, key, info)?;
            enforced_timeout_enabled |= !compiled.hard_timeouts.is_empty();
            circuit_breaker_enabled |= !compiled.circuit_breakers.is_empty();
            versions.insert(key.clone(), compiled);
        }

        let listen_path = def.proxy.listen_path.clone();
        Ok(Self {
            def,
            target,
            listen_path,
            tag_headers,
            versions,
            enforced_timeout_enabled,
            circuit_breaker_enabled,
        })
    }

    /// Version record for a resolved version name. A not-versioned API
    /// answers with its default (or sole) version.
    pub fn version(&self, name: Option<&str>) -> Option<&CompiledVersion> {
        if self.def.version_data.not_versioned {
            return self.default_version();
        }
        match name {
            Some(n) => self.versions.get(n),
            None => self.default_version(),
        }
    }

    pub fn default_version(&self) -> Option<&CompiledVersion> {
        if !self.def.version_data.default_version.is_empty() {
            return self.versions.get(&self.def.version_data.default_version);
        }
        self.versions.values().next()
    }

    /// Normalized name used by the fuzzy finder.
    pub fn normalized_name(&self) -> String {
        trim_categories(&self.def.name)
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect()
    }

    /// Release per-spec resources when this generation is retired.
    pub fn release(&self) {
        tracing::debug!(
            api_id = %self.def.api_id,
            api_name = %self.def.name,
            "spec: releasing retired generation resources"
        );
    }
}

/// Strip a trailing ` #category ...` tail from an API name. A `#` at the
/// start of the name yields an empty string rather than underflowing.
pub fn trim_categories(name: &str) -> &str {
    match name.find('#') {
        Some(i) => name[..i].trim_end(),
        None => name,
    }
}

fn compile_version(api_id: &str, key: &str, info: &crate::config::VersionInfo) -> Result<CompiledVersion> {
    let expires_at = if info.expires.is_empty() {
        None
    } else {
        Some(
            DateTime::parse_from_rfc3339(&info.expires)
                .with_context(|| format!("version '{key}': invalid expiry '{}'", info.expires))?
                .with_timezone(&Utc),
        )
    };

    let override_target = if info.override_target.is_empty() {
        None
    } else {
        let uri: Uri = info
            .override_target
            .parse()
            .with_context(|| format!("version '{key}': invalid override target"))?;
        Some(uri)
    };

    let compile_list = |metas: &[EndpointMeta]| -> Result<Vec<CompiledEndpoint>> {
        metas
            .iter()
            .map(|m| CompiledEndpoint::compile(&m.path, &m.method))
            .collect()
    };

    let ep = &info.extended_paths;
    let mut compiled = CompiledVersion {
        name: info.name.clone(),
        expires_at,
        ignored: compile_list(&ep.ignored)?,
        white_list: compile_list(&ep.white_list)?,
        black_list: compile_list(&ep.black_list)?,
        url_rewrites: compile_rewrites(&ep.url_rewrites)?,
        transforms: compile_transforms(&ep.transform)?,
        transforms_response: compile_transforms(&ep.transform_response)?,
        jq_transforms: compile_jq(&ep.transform_jq)?,
        jq_transforms_response: compile_jq(&ep.transform_jq_response)?,
        header_injects: compile_header_injects(&ep.transform_headers)?,
        header_injects_response: compile_header_injects(&ep.transform_response_headers)?,
        hard_timeouts: compile_timeouts(&ep.hard_timeouts)?,
        circuit_breakers: compile_breakers(api_id, &ep.circuit_breakers)?,
        cache_paths: ep.cache.clone(),
        method_transforms: compile_method_transforms(&ep.method_transforms)?,
        validate_json: compile_validators(&ep.validate_json)?,
        virtual_endpoints: compile_virtuals(&ep.virtual_endpoints)?,
        track_endpoints: compile_list(&ep.track_endpoints)?,
        do_not_track_endpoints: compile_list(&ep.do_not_track_endpoints)?,
        override_target,
        global_headers: info.global_headers.clone(),
        global_headers_remove: info.global_headers_remove.clone(),
        global_size_limit: info.global_size_limit,
    };

    // Fold the plain path lists in as method-less rules.
    for p in &info.paths.ignored {
        compiled.ignored.push(CompiledEndpoint::compile(p, "")?);
    }
    for p in &info.paths.white_list {
        compiled.white_list.push(CompiledEndpoint::compile(p, "")?);
    }
    for p in &info.paths.black_list {
        compiled.black_list.push(CompiledEndpoint::compile(p, "")?);
    }

    Ok(compiled)
}

fn compile_rewrites(metas: &[UrlRewriteMeta]) -> Result<Vec<CompiledRewrite>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledRewrite {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                match_pattern: Regex::new(&m.match_pattern)
                    .with_context(|| format!("invalid rewrite pattern '{}'", m.match_pattern))?,
                rewrite_to: m.rewrite_to.clone(),
            })
        })
        .collect()
}

fn compile_transforms(metas: &[TransformMeta]) -> Result<Vec<CompiledTransform>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledTransform {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                merge: m.merge.clone(),
            })
        })
        .collect()
}

fn compile_jq(metas: &[JqTransformMeta]) -> Result<Vec<CompiledJqTransform>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledJqTransform {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                filter: m.filter.clone(),
            })
        })
        .collect()
}

fn compile_header_injects(metas: &[HeaderInjectMeta]) -> Result<Vec<CompiledHeaderInject>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledHeaderInject {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                add_headers: m.add_headers.clone(),
                delete_headers: m.delete_headers.clone(),
            })
        })
        .collect()
}

fn compile_timeouts(metas: &[crate::config::HardTimeoutMeta]) -> Result<Vec<(CompiledEndpoint, u64)>> {
    metas
        .iter()
        .map(|m| Ok((CompiledEndpoint::compile(&m.path, &m.method)?, m.timeout_secs)))
        .collect()
}

fn compile_breakers(api_id: &str, metas: &[CircuitBreakerMeta]) -> Result<Vec<CompiledBreaker>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledBreaker {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                key: format!("{}:{}:{}", api_id, m.method, m.path),
                config: BreakerConfig {
                    failure_threshold: m.failure_threshold.max(1),
                    success_threshold: m.success_threshold.max(1),
                    open_duration_secs: m.return_to_service_after_secs,
                },
            })
        })
        .collect()
}

fn compile_method_transforms(
    metas: &[MethodTransformMeta],
) -> Result<Vec<(CompiledEndpoint, Method)>> {
    metas
        .iter()
        .map(|m| {
            let to: Method = m
                .to_method
                .to_ascii_uppercase()
                .parse()
                .with_context(|| format!("invalid transform method '{}'", m.to_method))?;
            Ok((CompiledEndpoint::compile(&m.path, &m.method)?, to))
        })
        .collect()
}

fn compile_validators(metas: &[ValidateJsonMeta]) -> Result<Vec<CompiledValidateJson>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledValidateJson {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                schema: m.schema.clone(),
            })
        })
        .collect()
}

fn compile_virtuals(metas: &[VirtualMeta]) -> Result<Vec<CompiledVirtual>> {
    metas
        .iter()
        .map(|m| {
            Ok(CompiledVirtual {
                endpoint: CompiledEndpoint::compile(&m.path, &m.method)?,
                function_name: m.function_name.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_def(listen: &str, target: &str) -> ApiDefinition {
        serde_json::from_value(serde_json::json!({
            "api_id": "1",
            "name": "test api",
            "proxy": {"listen_path": listen, "target_url": target},
            "version_data": {"not_versioned": true, "versions": {"Default": {"name": "Default"}}}
        }))
        .unwrap()
    }

    #[test]
    fn compiles_minimal_definition() {
        let spec = ApiSpec::compile(minimal_def("/test/", "http://127.0.0.1:8081/")).unwrap();
        assert_eq!(spec.listen_path, "/test/");
        assert!(spec.version(None).is_some());
        assert!(!spec.enforced_timeout_enabled);
    }

    #[test]
    fn rejects_empty_and_spaced_listen_paths() {
        assert!(ApiSpec::compile(minimal_def("", "http://h/")).is_err());
        assert!(ApiSpec::compile(minimal_def("/a b/", "http://h/")).is_err());
    }

    #[test]
    fn rejects_relative_target() {
        assert!(ApiSpec::compile(minimal_def("/test/", "/not-absolute")).is_err());
    }

    #[test]
    fn endpoint_matching_honors_method_and_anchor() {
        let ep = CompiledEndpoint::compile("/widgets", "POST").unwrap();
        assert!(ep.matches(&Method::POST, "/widgets"));
        assert!(ep.matches(&Method::POST, "/widgets/7"));
        assert!(!ep.matches(&Method::GET, "/widgets"));
        assert!(!ep.matches(&Method::POST, "/api/widgets"));
    }

    #[test]
    fn trim_categories_guards_leading_hash() {
        assert_eq!(trim_categories("My API #internal #beta"), "My API");
        assert_eq!(trim_categories("#internal"), "");
        assert_eq!(trim_categories("plain"), "plain");
    }

    #[test]
    fn normalized_name_strips_non_alphanumerics() {
        let mut def = minimal_def("/test/", "http://127.0.0.1:8081/");
        def.name = "My API v2 #internal".to_string();
        let spec = ApiSpec::compile(def).unwrap();
        assert_eq!(spec.normalized_name(), "MyAPIv2");
    }

    #[test]
    fn version_flags_computed() {
        let def: ApiDefinition = serde_json::from_value(serde_json::json!({
            "api_id": "2",
            "name": "flagged",
            "proxy": {"listen_path": "/f/", "target_url": "http://127.0.0.1:8081/"},
            "version_data": {
                "not_versioned": true,
                "versions": {"Default": {
                    "name": "Default",
                    "extended_paths": {
                        "hard_timeouts": [{"path": "/slow", "timeout_secs": 2}],
                        "circuit_breakers": [{
                            "path": "/flaky",
                            "failure_threshold": 3,
                            "return_to_service_after_secs": 10
                        }]
                    }
                }}
            }
        }))
        .unwrap();
        let spec = ApiSpec::compile(def).unwrap();
        assert!(spec.enforced_timeout_enabled);
        assert!(spec.circuit_breaker_enabled);
    }
}
