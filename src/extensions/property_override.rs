//! The `builtin/property-override` extension: user-supplied JSON-Patch-style
//! mutations applied to compiled resources through the struct patcher.
//!
//! All argument validation happens at construction, including a dry run of
//! every patch against an empty message of its target type, so a bad path or
//! value never reaches a live resource graph.

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};
use crate::extensions::patcher::{patch_struct, Patch, PatchOp, PatchValue};
use crate::extensions::{Extension, ExtensionConfig, Payload, ProxyKind, RuntimeConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Cluster,
    ClusterLoadAssignment,
    Route,
    Listener,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceRef {
    pub name: String,
}

/// Which resources a patch applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceFilter {
    pub resource_type: ResourceType,
    pub traffic_direction: FilterDirection,
    /// Restricts an outbound patch to the named upstream services. Empty or
    /// absent means every service.
    #[serde(default)]
    pub services: Vec<ServiceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PatchArgs {
    resource_filter: ResourceFilter,
    op: PatchOp,
    path: String,
    #[serde(default)]
    value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Args {
    #[validate(length(min = 1, message = "at least one patch is required"))]
    patches: Vec<PatchArgs>,
    #[serde(default)]
    debug: bool,
    /// Proxy kinds the extension applies to. Empty means every kind.
    #[serde(default)]
    proxy_types: Vec<ProxyKind>,
}

#[derive(Debug, Clone)]
struct CompiledPatch {
    filter: ResourceFilter,
    patch: Patch,
}

#[derive(Debug)]
pub struct PropertyOverride {
    patches: Vec<CompiledPatch>,
    debug: bool,
    proxy_types: Vec<ProxyKind>,
}

impl PropertyOverride {
    pub fn from_config(config: &ExtensionConfig) -> Result<Self> {
        let args: Args = serde_json::from_value(config.arguments.clone())
            .map_err(|e| Error::config(format!("invalid property-override arguments: {e}")))?;
        args.validate()
            .map_err(|e| Error::config(format!("invalid property-override arguments: {e}")))?;

        let mut patches = Vec::with_capacity(args.patches.len());
        for patch_args in args.patches {
            let value = PatchValue::from_json(&patch_args.value)?;
            match patch_args.op {
                PatchOp::Add if value.is_none() => {
                    return Err(Error::config("field Value is required for add operations"));
                }
                PatchOp::Remove if value.is_some() => {
                    return Err(Error::config("field Value is not supported for remove operations"));
                }
                _ => {}
            }
            if patch_args.resource_filter.traffic_direction == FilterDirection::Inbound
                && !patch_args.resource_filter.services.is_empty()
            {
                return Err(Error::config(
                    "patch contains a service list for an inbound resource filter",
                ));
            }

            let compiled = CompiledPatch {
                filter: patch_args.resource_filter,
                patch: Patch { op: patch_args.op, path: patch_args.path, value },
            };
            // Dry run against an empty message so bad paths fail here.
            dry_run(&compiled, args.debug)?;
            patches.push(compiled);
        }

        Ok(Self { patches, debug: args.debug, proxy_types: args.proxy_types })
    }

    fn matching<'a>(
        &'a self,
        resource_type: ResourceType,
        payload_direction: FilterDirection,
        service_name: Option<&str>,
    ) -> impl Iterator<Item = &'a CompiledPatch> {
        let service_name = service_name.map(str::to_string);
        self.patches.iter().filter(move |p| {
            if p.filter.resource_type != resource_type
                || p.filter.traffic_direction != payload_direction
            {
                return false;
            }
            if p.filter.services.is_empty() {
                return true;
            }
            match &service_name {
                Some(name) => p.filter.services.iter().any(|s| &s.name == name),
                None => false,
            }
        })
    }
}

fn dry_run(compiled: &CompiledPatch, debug: bool) -> Result<()> {
    let result = match compiled.filter.resource_type {
        ResourceType::Cluster => patch_struct(&mut Cluster::default(), &compiled.patch, debug),
        ResourceType::ClusterLoadAssignment => {
            patch_struct(&mut ClusterLoadAssignment::default(), &compiled.patch, debug)
        }
        ResourceType::Route => {
            patch_struct(&mut RouteConfiguration::default(), &compiled.patch, debug)
        }
        ResourceType::Listener => patch_struct(&mut Listener::default(), &compiled.patch, debug),
    };
    result.map_err(|e| Error::config(format!("invalid patch: {e}")))
}

fn direction_of<M>(payload: &Payload<'_, M>) -> FilterDirection {
    if payload.is_inbound() {
        FilterDirection::Inbound
    } else {
        FilterDirection::Outbound
    }
}

impl Extension for PropertyOverride {
    fn can_apply(&self, config: &RuntimeConfig) -> bool {
        self.proxy_types.is_empty() || self.proxy_types.contains(&config.kind)
    }

    fn patch_cluster(&mut self, payload: Payload<'_, Cluster>) -> Result<(Cluster, bool)> {
        let direction = direction_of(&payload);
        let service = payload.service_name;
        let mut cluster = payload.message;
        let mut changed = false;

        for compiled in self.matching(ResourceType::Cluster, direction, service) {
            let before = cluster.clone();
            patch_struct(&mut cluster, &compiled.patch, self.debug)?;
            changed |= cluster != before;
        }
        // Load-assignment patches reach inline assignments through the
        // owning cluster.
        if let Some(assignment) = cluster.load_assignment.as_mut() {
            for compiled in self.matching(ResourceType::ClusterLoadAssignment, direction, service)
            {
                let before = assignment.clone();
                patch_struct(assignment, &compiled.patch, self.debug)?;
                changed |= *assignment != before;
            }
        }
        Ok((cluster, changed))
    }

    fn patch_route(
        &mut self,
        payload: Payload<'_, RouteConfiguration>,
    ) -> Result<(RouteConfiguration, bool)> {
        let direction = direction_of(&payload);
        let service = payload.service_name;
        let mut route = payload.message;
        let mut changed = false;
        for compiled in self.matching(ResourceType::Route, direction, service) {
            let before = route.clone();
            patch_struct(&mut route, &compiled.patch, self.debug)?;
            changed |= route != before;
        }
        Ok((route, changed))
    }

    fn patch_listener(&mut self, payload: Payload<'_, Listener>) -> Result<(Listener, bool)> {
        let direction = direction_of(&payload);
        let service = payload.service_name;
        let mut listener = payload.message;
        let mut changed = false;
        for compiled in self.matching(ResourceType::Listener, direction, service) {
            let before = listener.clone();
            patch_struct(&mut listener, &compiled.patch, self.debug)?;
            changed |= listener != before;
        }
        Ok((listener, changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::TrafficDirection;
    use serde_json::json;

    fn make(args: serde_json::Value) -> Result<PropertyOverride> {
        PropertyOverride::from_config(&ExtensionConfig {
            name: "builtin/property-override".to_string(),
            arguments: args,
            required: false,
        })
    }

    fn outbound_patch(path: &str, value: serde_json::Value) -> serde_json::Value {
        json!({
            "patches": [{
                "resourceFilter": {"resourceType": "cluster", "trafficDirection": "outbound"},
                "op": "add",
                "path": path,
                "value": value,
            }]
        })
    }

    fn payload<'a>(
        config: &'a RuntimeConfig,
        direction: TrafficDirection,
        service: Option<&'a str>,
        cluster: Cluster,
    ) -> Payload<'a, Cluster> {
        Payload {
            runtime_config: config,
            traffic_direction: direction,
            service_name: service,
            upstream: None,
            message: cluster,
        }
    }

    #[test]
    fn test_empty_patch_set_rejected() {
        let err = make(json!({"patches": []})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_add_without_value_rejected() {
        let err = make(json!({
            "patches": [{
                "resourceFilter": {"resourceType": "cluster", "trafficDirection": "outbound"},
                "op": "add",
                "path": "/outlier_detection/max_ejection_percent",
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Value is required"));
    }

    #[test]
    fn test_services_on_inbound_rejected() {
        let err = make(json!({
            "patches": [{
                "resourceFilter": {
                    "resourceType": "cluster",
                    "trafficDirection": "inbound",
                    "services": [{"name": "db"}],
                },
                "op": "remove",
                "path": "/outlier_detection",
            }]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("inbound"));
    }

    #[test]
    fn test_bad_path_rejected_at_construction() {
        let err = make(outbound_patch("/no_such_field", json!(1))).unwrap_err();
        assert!(err.to_string().contains("no match for field 'no_such_field'"));
    }

    #[test]
    fn test_patch_applies_to_matching_direction_only() {
        let mut ext =
            make(outbound_patch("/outlier_detection/max_ejection_percent", json!(50))).unwrap();
        let config = RuntimeConfig::default();

        let (cluster, changed) = ext
            .patch_cluster(payload(
                &config,
                TrafficDirection::Outbound,
                None,
                Cluster::default(),
            ))
            .unwrap();
        assert!(changed);
        let od = cluster.outlier_detection.unwrap();
        assert_eq!(od.max_ejection_percent.unwrap().value, 50);

        let (_, changed) = ext
            .patch_cluster(payload(
                &config,
                TrafficDirection::Inbound,
                None,
                Cluster::default(),
            ))
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_service_allowlist_filters_upstreams() {
        let mut ext = make(json!({
            "patches": [{
                "resourceFilter": {
                    "resourceType": "cluster",
                    "trafficDirection": "outbound",
                    "services": [{"name": "db"}],
                },
                "op": "add",
                "path": "/connect_timeout",
                "value": {"seconds": 10},
            }]
        }))
        .unwrap();
        let config = RuntimeConfig::default();

        let (cluster, changed) = ext
            .patch_cluster(payload(&config, TrafficDirection::Outbound, Some("db"), Cluster::default()))
            .unwrap();
        assert!(changed);
        assert_eq!(cluster.connect_timeout.unwrap().seconds, 10);

        let (_, changed) = ext
            .patch_cluster(payload(&config, TrafficDirection::Outbound, Some("web"), Cluster::default()))
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn test_proxy_types_gate_can_apply() {
        let ext = make(json!({
            "proxyTypes": ["mesh-gateway"],
            "patches": [{
                "resourceFilter": {"resourceType": "listener", "trafficDirection": "inbound"},
                "op": "remove",
                "path": "/stat_prefix",
            }]
        }))
        .unwrap();
        let mut config = RuntimeConfig::default();
        assert!(!ext.can_apply(&config));
        config.kind = ProxyKind::MeshGateway;
        assert!(ext.can_apply(&config));
    }
}
