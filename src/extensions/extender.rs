//! Extenders: the strategies that drive an [`Extension`] over a compiled
//! resource graph.
//!
//! Extenders own everything an extension must not: privilege checks before
//! any resource is touched, traversal order, per-resource error
//! accumulation, and rebuilding filter chains around patched filters. A
//! privilege mismatch is fatal and leaves the graph untouched; per-resource
//! patch failures keep the original resource and accumulate into one
//! `Error::Multiple`.

use envoy_types::pb::envoy::config::core::v3::TrafficDirection as CoreTrafficDirection;
use envoy_types::pb::envoy::config::listener::v3::{FilterChain, Listener};
use tracing::warn;

use crate::errors::{Error, ErrorAccumulator, Result};
use crate::extensions::{
    helpers, is_upstream_extension, Extension, Payload, RuntimeConfig, TrafficDirection,
    UpstreamData,
};
use crate::xds::{IndexedResources, Resource, ResourceKind, LOCAL_APP_CLUSTER_NAME};

/// Applies an extension to every resource, one at a time. Requires the
/// extension to come from the local service's own configuration.
pub struct BasicExtender<E: Extension> {
    extension: E,
}

/// Applies an extension through the batch callbacks, with gateway-aware
/// filter-chain selection. Requires local-service sourcing.
pub struct ListExtender<E: Extension> {
    extension: E,
}

/// Applies an allow-listed extension sourced from an upstream's config,
/// restricted to that upstream's resources.
pub struct UpstreamExtender<E: Extension> {
    extension: E,
}

fn check_privilege(config: &RuntimeConfig, upstream_extender: bool) -> Result<()> {
    let name = &config.extension.name;
    if upstream_extender {
        if !config.is_sourced_from_upstream {
            return Err(Error::privilege(format!(
                "extension {name:?} requires resources sourced from an upstream"
            )));
        }
        if !is_upstream_extension(name) {
            return Err(Error::privilege(format!(
                "extension {name:?} is not allowed to patch upstream resources"
            )));
        }
        return Ok(());
    }
    if config.is_sourced_from_upstream {
        return Err(Error::privilege(format!(
            "extension {name:?} cannot be applied to resources sourced from an upstream"
        )));
    }
    Ok(())
}

fn listener_direction(listener: &Listener) -> TrafficDirection {
    if listener.traffic_direction == CoreTrafficDirection::Inbound as i32
        || helpers::is_inbound_public_listener(listener)
    {
        TrafficDirection::Inbound
    } else {
        TrafficDirection::Outbound
    }
}

fn cluster_context<'a>(
    config: &'a RuntimeConfig,
    name: &str,
) -> (TrafficDirection, Option<&'a str>, Option<&'a UpstreamData>) {
    if name == LOCAL_APP_CLUSTER_NAME {
        return (TrafficDirection::Inbound, None, None);
    }
    match config.find_upstream_by_sni(name) {
        Some((service, upstream)) => (TrafficDirection::Outbound, Some(service), Some(upstream)),
        None => (TrafficDirection::Outbound, None, None),
    }
}

fn route_context<'a>(
    config: &'a RuntimeConfig,
    name: &str,
    route: &envoy_types::pb::envoy::config::route::v3::RouteConfiguration,
) -> (TrafficDirection, Option<&'a str>, Option<&'a UpstreamData>) {
    if helpers::is_route_to_local_app_cluster(route) {
        return (TrafficDirection::Inbound, None, None);
    }
    let upstream = config
        .find_upstream_by_envoy_id(name)
        .or_else(|| config.find_upstream_by_sni(name));
    match upstream {
        Some((service, upstream)) => (TrafficDirection::Outbound, Some(service), Some(upstream)),
        None => (TrafficDirection::Outbound, None, None),
    }
}

/// The upstream an outbound filter chain belongs to. Transparent-proxy
/// chains match by VIP prefix range, dedicated chains by SNI.
fn outbound_chain_upstream<'a>(
    config: &'a RuntimeConfig,
    tproxy: bool,
    chain: &FilterChain,
) -> Option<(&'a str, &'a UpstreamData)> {
    if tproxy {
        return config
            .upstreams
            .iter()
            .find(|(_, u)| {
                u.vip.as_deref().map(|vip| helpers::chain_matches_vip(chain, vip)).unwrap_or(false)
            })
            .map(|(name, u)| (name.as_str(), u));
    }
    helpers::chain_sni(chain).and_then(|sni| config.find_upstream_by_sni(sni))
}

fn patch_chain_filters<E: Extension>(
    extension: &mut E,
    config: &RuntimeConfig,
    direction: TrafficDirection,
    context: Option<(&str, &UpstreamData)>,
    chain: &mut FilterChain,
    acc: &mut ErrorAccumulator,
) {
    for filter in &mut chain.filters {
        let payload = Payload {
            runtime_config: config,
            traffic_direction: direction,
            service_name: context.map(|(name, _)| name),
            upstream: context.map(|(_, upstream)| upstream),
            message: filter.clone(),
        };
        match extension.patch_filter(payload) {
            Ok((patched, true)) => *filter = patched,
            Ok((_, false)) => {}
            Err(err) => acc.push(err),
        }
    }
}

impl<E: Extension> BasicExtender<E> {
    pub fn new(extension: E) -> Self {
        Self { extension }
    }

    pub fn into_extension(self) -> E {
        self.extension
    }

    pub fn extend(&mut self, config: &RuntimeConfig, resources: &mut IndexedResources) -> Result<()> {
        check_privilege(config, false)?;
        if !self.extension.can_apply(config) {
            return Ok(());
        }
        let mut acc = ErrorAccumulator::new();

        let mut clusters = resources.take_kind(ResourceKind::Cluster);
        for (key, resource) in clusters.iter_mut() {
            let Resource::Cluster(cluster) = resource else { continue };
            let (direction, service_name, upstream) = cluster_context(config, key);
            let payload = Payload {
                runtime_config: config,
                traffic_direction: direction,
                service_name,
                upstream,
                message: cluster.clone(),
            };
            match self.extension.patch_cluster(payload) {
                Ok((patched, true)) => *cluster = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }
        }
        resources.put_kind(ResourceKind::Cluster, clusters);

        let mut routes = resources.take_kind(ResourceKind::Route);
        for (key, resource) in routes.iter_mut() {
            let Resource::Route(route) = resource else { continue };
            let (direction, service_name, upstream) = route_context(config, key, route);
            let payload = Payload {
                runtime_config: config,
                traffic_direction: direction,
                service_name,
                upstream,
                message: route.clone(),
            };
            match self.extension.patch_route(payload) {
                Ok((patched, true)) => *route = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }
        }
        resources.put_kind(ResourceKind::Route, routes);

        let mut listeners = resources.take_kind(ResourceKind::Listener);
        for resource in listeners.values_mut() {
            let Resource::Listener(listener) = resource else { continue };
            let direction = listener_direction(listener);
            let payload = Payload {
                runtime_config: config,
                traffic_direction: direction,
                service_name: None,
                upstream: None,
                message: listener.clone(),
            };
            match self.extension.patch_listener(payload) {
                Ok((patched, true)) => *listener = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }

            let tproxy = helpers::is_outbound_tproxy_listener(listener);
            let default_chain = listener.default_filter_chain.iter_mut();
            for chain in listener.filter_chains.iter_mut().chain(default_chain) {
                let context = match direction {
                    TrafficDirection::Inbound => None,
                    TrafficDirection::Outbound => outbound_chain_upstream(config, tproxy, chain),
                };
                patch_chain_filters(
                    &mut self.extension,
                    config,
                    direction,
                    context,
                    chain,
                    &mut acc,
                );
            }
        }
        resources.put_kind(ResourceKind::Listener, listeners);

        finish(&config.extension.name, acc)
    }
}

impl<E: Extension> ListExtender<E> {
    pub fn new(extension: E) -> Self {
        Self { extension }
    }

    pub fn into_extension(self) -> E {
        self.extension
    }

    pub fn extend(&mut self, config: &RuntimeConfig, resources: &mut IndexedResources) -> Result<()> {
        check_privilege(config, false)?;
        if !self.extension.can_apply(config) {
            return Ok(());
        }
        let mut acc = ErrorAccumulator::new();

        let mut clusters = resources.take_kind(ResourceKind::Cluster);
        let keys: Vec<String> = clusters.keys().cloned().collect();
        let payloads: Vec<Payload<'_, _>> = keys
            .iter()
            .filter_map(|key| clusters.get(key)?.as_cluster().map(|c| (key, c.clone())))
            .map(|(key, cluster)| {
                let (direction, service_name, upstream) = cluster_context(config, key);
                Payload {
                    runtime_config: config,
                    traffic_direction: direction,
                    service_name,
                    upstream,
                    message: cluster,
                }
            })
            .collect();
        match self.extension.patch_clusters(payloads) {
            Ok((patched, true)) if patched.len() == keys.len() => {
                for (key, cluster) in keys.iter().zip(patched) {
                    clusters.insert(key.clone(), Resource::Cluster(cluster));
                }
            }
            Ok((patched, true)) => acc.push(Error::internal(format!(
                "batch cluster patch returned {} resources for {}",
                patched.len(),
                keys.len()
            ))),
            Ok((_, false)) => {}
            Err(err) => acc.push(err),
        }
        resources.put_kind(ResourceKind::Cluster, clusters);

        let mut routes = resources.take_kind(ResourceKind::Route);
        let keys: Vec<String> = routes.keys().cloned().collect();
        let payloads: Vec<Payload<'_, _>> = keys
            .iter()
            .filter_map(|key| routes.get(key)?.as_route().map(|r| (key, r.clone())))
            .map(|(key, route)| {
                let (direction, service_name, upstream) = route_context(config, key, &route);
                Payload {
                    runtime_config: config,
                    traffic_direction: direction,
                    service_name,
                    upstream,
                    message: route,
                }
            })
            .collect();
        match self.extension.patch_routes(payloads) {
            Ok((patched, true)) if patched.len() == keys.len() => {
                for (key, route) in keys.iter().zip(patched) {
                    routes.insert(key.clone(), Resource::Route(route));
                }
            }
            Ok((patched, true)) => acc.push(Error::internal(format!(
                "batch route patch returned {} resources for {}",
                patched.len(),
                keys.len()
            ))),
            Ok((_, false)) => {}
            Err(err) => acc.push(err),
        }
        resources.put_kind(ResourceKind::Route, routes);

        let mut listeners = resources.take_kind(ResourceKind::Listener);
        for resource in listeners.values_mut() {
            let Resource::Listener(listener) = resource else { continue };
            let direction = listener_direction(listener);
            let payload = Payload {
                runtime_config: config,
                traffic_direction: direction,
                service_name: None,
                upstream: None,
                message: listener.clone(),
            };
            match self.extension.patch_listener(payload) {
                Ok((patched, true)) => *listener = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }

            let tproxy = helpers::is_outbound_tproxy_listener(listener);
            let gateway = config.kind.is_gateway();
            let default_chain = listener.default_filter_chain.iter_mut();
            for chain in listener.filter_chains.iter_mut().chain(default_chain) {
                // Chain selection: gateways mutate every SNI-bearing chain;
                // connect proxies only chains that map to a known upstream.
                let context = match direction {
                    TrafficDirection::Inbound => None,
                    TrafficDirection::Outbound if gateway => {
                        if helpers::chain_sni(chain).is_none() {
                            continue;
                        }
                        outbound_chain_upstream(config, tproxy, chain)
                    }
                    TrafficDirection::Outbound => {
                        match outbound_chain_upstream(config, tproxy, chain) {
                            Some(context) => Some(context),
                            None => continue,
                        }
                    }
                };
                self.patch_chain_filters_batch(config, direction, context, chain, &mut acc);
            }
        }
        resources.put_kind(ResourceKind::Listener, listeners);

        finish(&config.extension.name, acc)
    }

    fn patch_chain_filters_batch(
        &mut self,
        config: &RuntimeConfig,
        direction: TrafficDirection,
        context: Option<(&str, &UpstreamData)>,
        chain: &mut FilterChain,
        acc: &mut ErrorAccumulator,
    ) {
        let payloads: Vec<Payload<'_, _>> = chain
            .filters
            .iter()
            .map(|filter| Payload {
                runtime_config: config,
                traffic_direction: direction,
                service_name: context.map(|(name, _)| name),
                upstream: context.map(|(_, upstream)| upstream),
                message: filter.clone(),
            })
            .collect();
        match self.extension.patch_filters(payloads) {
            Ok((patched, true)) if patched.len() == chain.filters.len() => {
                chain.filters = patched;
            }
            Ok((patched, true)) => acc.push(Error::internal(format!(
                "batch filter patch returned {} filters for {}",
                patched.len(),
                chain.filters.len()
            ))),
            Ok((_, false)) => {}
            Err(err) => acc.push(err),
        }
    }
}

impl<E: Extension> UpstreamExtender<E> {
    pub fn new(extension: E) -> Self {
        Self { extension }
    }

    pub fn into_extension(self) -> E {
        self.extension
    }

    pub fn extend(&mut self, config: &RuntimeConfig, resources: &mut IndexedResources) -> Result<()> {
        check_privilege(config, true)?;
        if !self.extension.can_apply(config) {
            return Ok(());
        }
        let mut acc = ErrorAccumulator::new();

        let mut listeners = resources.take_kind(ResourceKind::Listener);
        for resource in listeners.values_mut() {
            let Resource::Listener(listener) = resource else { continue };
            if listener_direction(listener) == TrafficDirection::Inbound {
                continue;
            }
            let tproxy = helpers::is_outbound_tproxy_listener(listener);
            let envoy_id = helpers::listener_envoy_id(&listener.name).to_string();
            let listener_upstream = config.find_upstream_by_envoy_id(&envoy_id);
            if listener_upstream.is_none() && !tproxy {
                continue;
            }

            let payload = Payload {
                runtime_config: config,
                traffic_direction: TrafficDirection::Outbound,
                service_name: listener_upstream.map(|(name, _)| name),
                upstream: listener_upstream.map(|(_, upstream)| upstream),
                message: listener.clone(),
            };
            match self.extension.patch_listener(payload) {
                Ok((patched, true)) => *listener = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }

            let default_chain = listener.default_filter_chain.iter_mut();
            for chain in listener.filter_chains.iter_mut().chain(default_chain) {
                let context = outbound_chain_upstream(config, tproxy, chain)
                    .or(listener_upstream);
                if context.is_none() {
                    continue;
                }
                patch_chain_filters(
                    &mut self.extension,
                    config,
                    TrafficDirection::Outbound,
                    context,
                    chain,
                    &mut acc,
                );
            }
        }
        resources.put_kind(ResourceKind::Listener, listeners);

        let mut routes = resources.take_kind(ResourceKind::Route);
        for (key, resource) in routes.iter_mut() {
            let Resource::Route(route) = resource else { continue };
            let upstream = config
                .find_upstream_by_envoy_id(key)
                .or_else(|| config.find_upstream_by_sni(key));
            let Some((service_name, upstream)) = upstream else { continue };
            let payload = Payload {
                runtime_config: config,
                traffic_direction: TrafficDirection::Outbound,
                service_name: Some(service_name),
                upstream: Some(upstream),
                message: route.clone(),
            };
            match self.extension.patch_route(payload) {
                Ok((patched, true)) => *route = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }
        }
        resources.put_kind(ResourceKind::Route, routes);

        let mut clusters = resources.take_kind(ResourceKind::Cluster);
        for (key, resource) in clusters.iter_mut() {
            let Resource::Cluster(cluster) = resource else { continue };
            let Some((service_name, upstream)) = config.find_upstream_by_sni(key) else {
                continue;
            };
            let payload = Payload {
                runtime_config: config,
                traffic_direction: TrafficDirection::Outbound,
                service_name: Some(service_name),
                upstream: Some(upstream),
                message: cluster.clone(),
            };
            match self.extension.patch_cluster(payload) {
                Ok((patched, true)) => *cluster = patched,
                Ok((_, false)) => {}
                Err(err) => acc.push(err),
            }
        }
        resources.put_kind(ResourceKind::Cluster, clusters);

        finish(&config.extension.name, acc)
    }
}

fn finish(extension_name: &str, acc: ErrorAccumulator) -> Result<()> {
    if !acc.is_empty() {
        warn!(extension = %extension_name, errors = acc.len(), "extension patching failed");
    }
    acc.into_result()
}
