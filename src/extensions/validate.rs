//! The `builtin/proxy/validate` extension: a read-only pass over one
//! upstream's resources that reports whether traffic to that upstream can
//! actually flow.
//!
//! Driven through the upstream extender, it records what it sees during the
//! patch callbacks and never mutates anything; [`Validate::messages`]
//! resolves the recorded requirements against the resource index afterwards.

use envoy_types::pb::envoy::config::core::v3::HealthStatus;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::RouteSpecifier;
use serde::Deserialize;
use serde_json::json;
use validator::Validate as ValidateArgs;
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::{Error, Result};
use crate::extensions::extender::UpstreamExtender;
use crate::extensions::{
    helpers, Extension, ExtensionConfig, Payload, ProxyKind, RuntimeConfig, UpstreamData,
};
use crate::xds::{IndexedResources, Resource, ResourceKind, PASSTHROUGH_CLUSTER_PREFIX};

/// One validation finding.
#[derive(Debug, Clone)]
pub struct Message {
    pub success: bool,
    pub message: String,
    pub possible_actions: Vec<String>,
}

impl Message {
    fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into(), possible_actions: Vec::new() }
    }

    fn fail(message: impl Into<String>, possible_actions: Vec<String>) -> Self {
        Self { success: false, message: message.into(), possible_actions }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Messages(pub Vec<Message>);

impl Messages {
    /// True when no finding is a failure.
    pub fn success(&self) -> bool {
        self.0.iter().all(|m| m.success)
    }
}

#[derive(Debug, Clone, Deserialize, ValidateArgs)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Args {
    #[validate(length(min = 1, message = "envoyId is required"))]
    envoy_id: String,
}

#[derive(Debug)]
pub struct Validate {
    envoy_id: String,
    listener_seen: bool,
    /// Route configurations the listener defers to via RDS.
    required_routes: BTreeSet<String>,
    /// Cluster names required directly by listener filters.
    required_clusters: BTreeSet<String>,
    /// Route name -> cluster names, for every route this run observed.
    seen_routes: BTreeMap<String, BTreeSet<String>>,
}

impl Validate {
    pub fn from_config(config: &ExtensionConfig) -> Result<Self> {
        let args: Args = serde_json::from_value(config.arguments.clone())
            .map_err(|e| Error::config(format!("invalid validate arguments: {e}")))?;
        args.validate()
            .map_err(|e| Error::config(format!("invalid validate arguments: {e}")))?;
        Ok(Self {
            envoy_id: args.envoy_id,
            listener_seen: false,
            required_routes: BTreeSet::new(),
            required_clusters: BTreeSet::new(),
            seen_routes: BTreeMap::new(),
        })
    }

    /// Resolve everything recorded during patching against the index.
    pub fn messages(&self, resources: &IndexedResources) -> Messages {
        let mut out = Vec::new();

        if !self.listener_seen {
            out.push(Message::fail(
                format!("No listener for upstream \"{}\"", self.envoy_id),
                vec![
                    "Check that the upstream is configured on this proxy".to_string(),
                    "Check intentions and exported services between the two services"
                        .to_string(),
                ],
            ));
            return Messages(out);
        }
        out.push(Message::ok(format!("Listener for upstream \"{}\" found", self.envoy_id)));

        let mut required_clusters = self.required_clusters.clone();
        for route_name in &self.required_routes {
            match self.seen_routes.get(route_name) {
                Some(clusters) => {
                    out.push(Message::ok(format!("Route \"{route_name}\" found")));
                    required_clusters.extend(clusters.iter().cloned());
                }
                None => out.push(Message::fail(
                    format!("No route \"{route_name}\" for upstream \"{}\"", self.envoy_id),
                    vec!["Check that the upstream's route configuration was delivered"
                        .to_string()],
                )),
            }
        }

        for cluster_name in &required_clusters {
            self.check_cluster(cluster_name, resources, &mut out);
        }

        Messages(out)
    }

    fn check_cluster(&self, name: &str, resources: &IndexedResources, out: &mut Vec<Message>) {
        if !resources.contains(ResourceKind::Cluster, name) {
            out.push(Message::fail(
                format!("No cluster \"{name}\" for upstream \"{}\"", self.envoy_id),
                vec!["Check that the upstream service is registered".to_string()],
            ));
            return;
        }
        out.push(Message::ok(format!("Cluster \"{name}\" found")));

        // Original-destination passthrough clusters carry no endpoints.
        if name.starts_with(PASSTHROUGH_CLUSTER_PREFIX) {
            return;
        }

        let children = resources.children(ResourceKind::Cluster, name);
        if !children.is_empty() {
            let any_healthy = children
                .iter()
                .any(|child| healthy_endpoints(resources, child) > 0);
            if any_healthy {
                out.push(Message::ok(format!(
                    "Healthy endpoints for at least one target of aggregate cluster \"{name}\""
                )));
            } else {
                out.push(Message::fail(
                    format!("No healthy endpoints for aggregate cluster \"{name}\""),
                    endpoint_actions(),
                ));
            }
            return;
        }

        if healthy_endpoints(resources, name) > 0 {
            out.push(Message::ok(format!("Healthy endpoints for cluster \"{name}\"")));
        } else {
            out.push(Message::fail(
                format!("No healthy endpoints for cluster \"{name}\""),
                endpoint_actions(),
            ));
        }
    }

    fn record_listener(&mut self, listener: &Listener) {
        self.listener_seen = true;
        let default_chain = listener.default_filter_chain.iter();
        for chain in listener.filter_chains.iter().chain(default_chain) {
            for filter in &chain.filters {
                if let Some((hcm, _)) =
                    helpers::get_http_connection_manager(std::slice::from_ref(filter))
                {
                    if let Some(RouteSpecifier::Rds(rds)) = &hcm.route_specifier {
                        self.required_routes.insert(rds.route_config_name.clone());
                        continue;
                    }
                }
                self.required_clusters.extend(helpers::filter_cluster_names(filter));
            }
        }
    }
}

fn endpoint_actions() -> Vec<String> {
    vec![
        "Check that the upstream service is healthy and registered".to_string(),
        "If the upstream is in a remote datacenter or peer, check connectivity to it"
            .to_string(),
    ]
}

/// Healthy (or unknown-health) endpoints for a cluster, from its inline load
/// assignment or its endpoint resource.
fn healthy_endpoints(resources: &IndexedResources, cluster_name: &str) -> usize {
    let inline = resources
        .get(ResourceKind::Cluster, cluster_name)
        .and_then(Resource::as_cluster)
        .and_then(|c| c.load_assignment.as_ref());
    let assignment = match inline {
        Some(assignment) => Some(assignment),
        None => resources
            .get(ResourceKind::Endpoints, cluster_name)
            .and_then(Resource::as_endpoints),
    };
    count_healthy(assignment)
}

fn count_healthy(assignment: Option<&ClusterLoadAssignment>) -> usize {
    let Some(assignment) = assignment else { return 0 };
    assignment
        .endpoints
        .iter()
        .flat_map(|locality| locality.lb_endpoints.iter())
        .filter(|e| {
            e.health_status == HealthStatus::Healthy as i32
                || e.health_status == HealthStatus::Unknown as i32
        })
        .count()
}

impl Extension for Validate {
    fn can_apply(&self, _config: &RuntimeConfig) -> bool {
        true
    }

    fn patch_listener(&mut self, payload: Payload<'_, Listener>) -> Result<(Listener, bool)> {
        self.record_listener(&payload.message);
        Ok((payload.message, false))
    }

    fn patch_route(
        &mut self,
        payload: Payload<'_, RouteConfiguration>,
    ) -> Result<(RouteConfiguration, bool)> {
        let clusters = helpers::route_cluster_names(&payload.message);
        self.seen_routes.insert(payload.message.name.clone(), clusters);
        Ok((payload.message, false))
    }
}

/// Validate one upstream of a compiled snapshot: can traffic to it flow?
///
/// Builds a runtime config where the single upstream claims every cluster
/// name, so no resource is filtered away, then drives [`Validate`] through
/// the upstream extender.
pub fn validate_upstream(
    service_name: &str,
    envoy_id: &str,
    vip: Option<String>,
    resources: &mut IndexedResources,
) -> Result<Messages> {
    let snis: BTreeSet<String> =
        resources.names_of_kind(ResourceKind::Cluster).into_iter().collect();
    let mut upstreams = BTreeMap::new();
    upstreams.insert(
        service_name.to_string(),
        UpstreamData {
            snis,
            envoy_id: envoy_id.to_string(),
            vip,
            outgoing_proxy_kind: ProxyKind::ConnectProxy,
        },
    );
    let config = RuntimeConfig {
        extension: ExtensionConfig {
            name: "builtin/proxy/validate".to_string(),
            arguments: json!({ "envoyId": envoy_id }),
            required: true,
        },
        kind: ProxyKind::ConnectProxy,
        service_name: service_name.to_string(),
        upstreams,
        is_sourced_from_upstream: true,
    };

    let validate = Validate::from_config(&config.extension)?;
    let mut extender = UpstreamExtender::new(validate);
    extender.extend(&config, resources)?;
    Ok(extender.into_extension().messages(resources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::envoy::config::endpoint::v3::{
        lb_endpoint, Endpoint, LbEndpoint, LocalityLbEndpoints,
    };

    fn assignment(cluster: &str, healthy: usize, unhealthy: usize) -> ClusterLoadAssignment {
        let endpoint = |status: HealthStatus| LbEndpoint {
            health_status: status as i32,
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint::default())),
            ..Default::default()
        };
        let mut lb_endpoints = Vec::new();
        lb_endpoints.extend((0..healthy).map(|_| endpoint(HealthStatus::Healthy)));
        lb_endpoints.extend((0..unhealthy).map(|_| endpoint(HealthStatus::Unhealthy)));
        ClusterLoadAssignment {
            cluster_name: cluster.to_string(),
            endpoints: vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }],
            ..Default::default()
        }
    }

    fn validate_for(envoy_id: &str) -> Validate {
        Validate::from_config(&ExtensionConfig {
            name: "builtin/proxy/validate".to_string(),
            arguments: json!({ "envoyId": envoy_id }),
            required: true,
        })
        .unwrap()
    }

    #[test]
    fn test_missing_envoy_id_is_config_error() {
        let err = Validate::from_config(&ExtensionConfig {
            name: "builtin/proxy/validate".to_string(),
            arguments: json!({}),
            required: true,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_no_listener_fails_fast() {
        let validate = validate_for("db");
        let resources = IndexedResources::new();
        let messages = validate.messages(&resources);
        assert!(!messages.success());
        assert_eq!(messages.0.len(), 1);
        assert_eq!(messages.0[0].message, "No listener for upstream \"db\"");
        assert!(!messages.0[0].possible_actions.is_empty());
    }

    #[test]
    fn test_unhealthy_cluster_reports_exact_message() {
        let mut validate = validate_for("db");
        validate.listener_seen = true;
        validate.required_clusters.insert("db-sni".to_string());

        let mut resources = IndexedResources::new();
        resources.insert(
            "db-sni".to_string(),
            Resource::Cluster(Cluster {
                name: "db-sni".to_string(),
                load_assignment: Some(assignment("db-sni", 0, 2)),
                ..Default::default()
            }),
        );

        let messages = validate.messages(&resources);
        assert!(!messages.success());
        let failure = messages.0.iter().find(|m| !m.success).unwrap();
        assert_eq!(failure.message, "No healthy endpoints for cluster \"db-sni\"");
    }

    #[test]
    fn test_healthy_cluster_passes() {
        let mut validate = validate_for("db");
        validate.listener_seen = true;
        validate.required_clusters.insert("db-sni".to_string());

        let mut resources = IndexedResources::new();
        resources.insert(
            "db-sni".to_string(),
            Resource::Cluster(Cluster { name: "db-sni".to_string(), ..Default::default() }),
        );
        resources.insert("db-sni".to_string(), Resource::Endpoints(assignment("db-sni", 1, 1)));

        let messages = validate.messages(&resources);
        assert!(messages.success(), "{:?}", messages.0);
    }

    #[test]
    fn test_passthrough_cluster_exempt_from_endpoint_checks() {
        let mut validate = validate_for("db");
        validate.listener_seen = true;
        validate.required_clusters.insert("passthrough~db".to_string());

        let mut resources = IndexedResources::new();
        resources.insert(
            "passthrough~db".to_string(),
            Resource::Cluster(Cluster { name: "passthrough~db".to_string(), ..Default::default() }),
        );

        assert!(validate.messages(&resources).success());
    }

    #[test]
    fn test_aggregate_cluster_needs_one_healthy_child() {
        let mut validate = validate_for("db");
        validate.listener_seen = true;
        validate.required_clusters.insert("db-sni".to_string());

        let mut resources = IndexedResources::new();
        resources.insert(
            "db-sni".to_string(),
            Resource::Cluster(Cluster { name: "db-sni".to_string(), ..Default::default() }),
        );
        for child in ["failover-target~db-sni~0", "failover-target~db-sni~1"] {
            resources.insert(
                child.to_string(),
                Resource::Cluster(Cluster { name: child.to_string(), ..Default::default() }),
            );
            resources.insert_child(ResourceKind::Cluster, "db-sni", child);
        }
        resources.insert(
            "failover-target~db-sni~0".to_string(),
            Resource::Endpoints(assignment("failover-target~db-sni~0", 0, 1)),
        );
        assert!(!validate.messages(&resources).success());

        resources.insert(
            "failover-target~db-sni~1".to_string(),
            Resource::Endpoints(assignment("failover-target~db-sni~1", 1, 0)),
        );
        assert!(validate.messages(&resources).success(), "one healthy child suffices");
    }

    #[test]
    fn test_missing_rds_route_is_a_failure() {
        let mut validate = validate_for("db");
        validate.listener_seen = true;
        validate.required_routes.insert("db".to_string());

        let messages = validate.messages(&IndexedResources::new());
        assert!(!messages.success());
        let failure = messages.0.iter().find(|m| !m.success).unwrap();
        assert!(failure.message.contains("No route \"db\""));
    }
}
