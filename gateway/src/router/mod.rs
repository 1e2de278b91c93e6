pub mod loader;

use crate::pipeline::ApiChain;
use crate::spec::ApiSpec;
use std::collections::HashMap;
use std::sync::Arc;

/// Reserved path segment under each listen path answering the per-caller
/// rate-limit query.
pub const RATE_LIMIT_SEGMENT: &str = "portico/rate-limits/";

/// One API registered in a generation: its effective listen path (after
/// collision resolution) and the compiled chains.
pub struct ApiEntry {
    pub listen_path: String,
    pub rate_limit_path: Option<String>,
    pub chain: Arc<ApiChain>,
    pub rate_limit_chain: Option<Arc<ApiChain>>,
    pub spec: Arc<ApiSpec>,
}

/// Listen paths of one host bucket, ordered by decreasing length (then
/// reverse-lexicographic) so `/foo-bar` is tried before `/foo`.
#[derive(Default)]
pub struct SubRouter {
    entries: Vec<Arc<ApiEntry>>,
}

pub enum RouteMatch {
    Api(Arc<ApiEntry>),
    RateLimits(Arc<ApiEntry>),
}

impl SubRouter {
    fn push(&mut self, entry: Arc<ApiEntry>) {
        self.entries.push(entry);
    }

    fn sort(&mut self) {
        self.entries.sort_by(|a, b| {
            b.listen_path
                .len()
                .cmp(&a.listen_path.len())
                .then_with(|| b.listen_path.cmp(&a.listen_path))
        });
    }

    fn match_path(&self, path: &str) -> Option<RouteMatch> {
        for entry in &self.entries {
            if let Some(ref rl_path) = entry.rate_limit_path {
                if path.starts_with(rl_path.as_str()) {
                    return Some(RouteMatch::RateLimits(entry.clone()));
                }
            }
            if path.starts_with(entry.listen_path.as_str()) {
                return Some(RouteMatch::Api(entry.clone()));
            }
        }
        None
    }

    pub fn listen_paths(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.listen_path.as_str()).collect()
    }
}

/// One immutable generation of the routing table. Built off-path by the
/// loader and swapped in atomically; a request resolves everything it
/// needs from the generation it loaded at start.
pub struct RoutingTable {
    /// Host buckets, construction-ordered by length desc then
    /// reverse-lexicographic. Lookup is exact-host.
    hosts: Vec<(String, SubRouter)>,
    /// Bucket for specs with no custom domain; also the fallback when a
    /// host bucket has no matching listen path.
    default: SubRouter,
    /// Every loaded spec (including internal-only ones) by API id, for the
    /// loop dispatcher and keep-path reload rule.
    by_id: HashMap<String, Arc<ApiEntry>>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self {
            hosts: Vec::new(),
            default: SubRouter::default(),
            by_id: HashMap::new(),
        }
    }

    pub(crate) fn from_parts(
        hosts: Vec<(String, SubRouter)>,
        default: SubRouter,
        by_id: HashMap<String, Arc<ApiEntry>>,
    ) -> Self {
        Self {
            hosts,
            default,
            by_id,
        }
    }

    /// Two-level dispatch: host bucket first (exact match, port stripped),
    /// then longest-prefix listen path; the default bucket backs up both.
    pub fn match_request(&self, host: &str, path: &str) -> Option<RouteMatch> {
        let host = host.split(':').next().unwrap_or(host);
        for (candidate, sub) in &self.hosts {
            if candidate.eq_ignore_ascii_case(host) {
                if let Some(matched) = sub.match_path(path) {
                    return Some(matched);
                }
                break;
            }
        }
        self.default.match_path(path)
    }

    pub fn lookup(&self, api_id: &str) -> Option<Arc<ApiEntry>> {
        self.by_id.get(api_id).cloned()
    }

    /// Loop-target resolution: an identifier may be an API id, the
    /// definition's database id, or the normalized API name.
    pub fn fuzzy_find(&self, search: &str) -> Option<Arc<ApiEntry>> {
        if search.is_empty() {
            return None;
        }
        self.by_id
            .values()
            .find(|entry| {
                entry.spec.def.api_id == search
                    || (!entry.spec.def.id.is_empty() && entry.spec.def.id == search)
                    || entry.spec.normalized_name() == search
            })
            .cloned()
    }

    pub fn api_count(&self) -> usize {
        self.by_id.len()
    }

    /// Release per-spec resources held by this generation. Called once on
    /// the outgoing table inside the reload critical section.
    pub fn release_all(&self) {
        for entry in self.by_id.values() {
            entry.spec.release();
        }
    }

    pub fn default_listen_paths(&self) -> Vec<&str> {
        self.default.listen_paths()
    }
}
