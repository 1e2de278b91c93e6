use crate::config::{ApiDefinition, GatewayConfig};
use crate::pipeline::assembler::{build_chain, build_rate_limit_chain, SharedHandles};
use crate::router::{ApiEntry, RoutingTable, SubRouter, RATE_LIMIT_SEGMENT};
use crate::spec::ApiSpec;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn domain_path(domain: &str, listen_path: &str) -> String {
    format!("{domain}{listen_path}")
}

/// Build a complete routing-table generation from materialized
/// definitions. Invalid definitions are skipped with a warning and never
/// abort their siblings; the caller swaps the returned table in whole.
pub fn build_routing_table(
    defs: &[ApiDefinition],
    shared: &SharedHandles,
    config: &GatewayConfig,
    previous: Option<&RoutingTable>,
) -> RoutingTable {
    // Compile every definition; configuration errors only cost the one spec.
    let mut specs: Vec<ApiSpec> = Vec::with_capacity(defs.len());
    for def in defs {
        let api_id = def.api_id.clone();
        let api_name = def.name.clone();
        match ApiSpec::compile(def.clone()) {
            Ok(spec) => {
                tracing::info!(api_id = %api_id, api_name = %api_name, "loading API");
                if !spec.def.session_provider.storage_engine.is_empty() {
                    tracing::info!(
                        api_id = %api_id,
                        engine = %spec.def.session_provider.storage_engine,
                        "session provider binding declared, using injected store"
                    );
                }
                specs.push(spec);
            }
            Err(e) => {
                tracing::warn!(api_id = %api_id, api_name = %api_name, "spec not valid, skipped: {e:#}");
            }
        }
    }

    // Sort by listen path from longer to shorter (ties broken
    // reverse-lexicographically) so /foo doesn't shadow /foo-bar and the
    // build order is deterministic.
    specs.sort_by(|a, b| {
        b.listen_path
            .len()
            .cmp(&a.listen_path.len())
            .then_with(|| b.listen_path.cmp(&a.listen_path))
    });

    resolve_collisions(&mut specs, previous);

    let mut by_id: HashMap<String, Arc<ApiEntry>> = HashMap::new();
    let mut default = SubRouter::default();
    let mut host_buckets: HashMap<String, SubRouter> = HashMap::new();

    // Deterministic host bucket creation order: length desc, then
    // reverse-lexicographic.
    let mut hosts: Vec<String> = specs
        .iter()
        .filter(|s| !s.def.domain.is_empty())
        .map(|s| s.def.domain.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    hosts.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));

    if config.enable_custom_domains {
        for host in &hosts {
            tracing::info!(domain = %host, "sub-router created for domain");
            host_buckets.insert(host.clone(), SubRouter::default());
        }
    }

    for spec in specs {
        let spec = Arc::new(spec);
        let chain = Arc::new(build_chain(spec.clone(), shared));
        let rate_limit_chain = build_rate_limit_chain(spec.clone(), shared).map(Arc::new);
        let rate_limit_path = rate_limit_chain
            .as_ref()
            .map(|_| format!("{}{}", spec.listen_path, RATE_LIMIT_SEGMENT));

        let entry = Arc::new(ApiEntry {
            listen_path: spec.listen_path.clone(),
            rate_limit_path,
            chain,
            rate_limit_chain,
            spec: spec.clone(),
        });

        by_id.insert(spec.def.api_id.clone(), entry.clone());

        // Internal APIs are reachable only through the loop dispatcher.
        if spec.def.internal {
            tracing::info!(api_id = %spec.def.api_id, "internal API, not registered on the router");
            continue;
        }

        let bucket = if spec.def.domain.is_empty() {
            &mut default
        } else if config.enable_custom_domains {
            match host_buckets.get_mut(&spec.def.domain) {
                Some(bucket) => bucket,
                None => &mut default,
            }
        } else {
            tracing::warn!(
                api_id = %spec.def.api_id,
                domain = %spec.def.domain,
                "trying to load API with a domain when custom domains are disabled"
            );
            &mut default
        };
        tracing::info!(
            api_id = %spec.def.api_id,
            "processed and listening on: {}{}",
            spec.def.domain,
            spec.listen_path
        );
        bucket.push(entry);
    }

    default.sort();
    let mut host_list: Vec<(String, SubRouter)> = Vec::with_capacity(host_buckets.len());
    for host in hosts {
        if let Some(mut bucket) = host_buckets.remove(&host) {
            bucket.sort();
            host_list.push((host, bucket));
        }
    }

    let table = RoutingTable::from_parts(host_list, default, by_id);
    metrics::gauge!("gateway_config_apis_total").set(table.api_count() as f64);
    table
}

/// Deterministic listen-path collision resolution. Within one (host,
/// listen-path) group exactly one spec keeps the original path: a spec
/// already loaded under that path in the previous generation wins,
/// otherwise the first in build order. Every other member is suffixed
/// with `-<api_id>`, then `_` until unique.
fn resolve_collisions(specs: &mut [ApiSpec], previous: Option<&RoutingTable>) {
    let mut used: HashSet<String> = HashSet::new();

    // Previously loaded specs keep their paths ahead of newcomers.
    let mut keeps: HashSet<String> = HashSet::new();
    if let Some(previous) = previous {
        for spec in specs.iter() {
            if let Some(prev) = previous.lookup(&spec.def.api_id) {
                if prev.listen_path == spec.listen_path
                    && used.insert(domain_path(&spec.def.domain, &spec.listen_path))
                {
                    keeps.insert(spec.def.api_id.clone());
                }
            }
        }
    }

    for spec in specs.iter_mut() {
        if keeps.contains(&spec.def.api_id) {
            continue;
        }
        if used.insert(domain_path(&spec.def.domain, &spec.listen_path)) {
            continue;
        }
        let original = spec.listen_path.clone();
        spec.listen_path = format!("{}-{}", spec.listen_path, spec.def.api_id);
        while !used.insert(domain_path(&spec.def.domain, &spec.listen_path)) {
            spec.listen_path.push('_');
        }
        tracing::warn!(
            api_id = %spec.def.api_id,
            from = %original,
            to = %spec.listen_path,
            "listen path collision, changed"
        );
    }
}
