//! Cluster and load-assignment builders.
//!
//! Each IR cluster compiles to one Envoy cluster, or, for failover groups,
//! to an aggregate parent plus one child cluster per endpoint group. Child
//! clusters are recorded in the resource child index so downstream consumers
//! can follow the aggregate fan-out without decoding the custom cluster
//! config.

use envoy_types::pb::envoy::config::cluster::v3::{
    circuit_breakers, cluster, Cluster, CircuitBreakers, OutlierDetection,
};
use envoy_types::pb::envoy::config::core::v3::{
    HealthStatus as CoreHealthStatus, Http2ProtocolOptions,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint as EndpointProto, LbEndpoint,
    LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::clusters::aggregate::v3::ClusterConfig;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context, subject_alt_name_matcher, CertificateValidationContext, CommonTlsContext,
    SubjectAltNameMatcher, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options, HttpProtocolOptions,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::envoy::r#type::v3::Percent;
use envoy_types::pb::google::protobuf::{Duration, UInt32Value, UInt64Value};

use crate::errors::{Error, Result};
use crate::ir;
use crate::xds::{
    ads_config_source, inline_string, join_pem, make_any, make_socket_address,
    make_tls_certificate, make_transport_socket, IndexedResources, Resource, ResourceKind,
    AGGREGATE_CLUSTER_TYPE_NAME, AGGREGATE_CLUSTER_TYPE_URL, FAILOVER_CLUSTER_NAME_PREFIX,
    HTTP_PROTOCOL_OPTIONS_KEY, HTTP_PROTOCOL_OPTIONS_TYPE_URL, LOCAL_APP_CLUSTER_NAME,
    TLS_TRANSPORT_SOCKET_NAME, UPSTREAM_TLS_CONTEXT_TYPE_URL,
};

const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 5;

/// Compile one IR cluster into the index: the cluster itself, any inline or
/// EDS load assignment, and failover children.
pub fn build_cluster_resources(
    state: &ir::ProxyState,
    name: &str,
    cluster: &ir::Cluster,
    index: &mut IndexedResources,
) -> Result<()> {
    match &cluster.group {
        ir::ClusterGroup::EndpointGroup(group) => {
            let built = make_group_cluster(
                state,
                name,
                cluster.alt_stat_name.clone(),
                cluster.protocol,
                group,
            )?;
            insert_built(index, name, built);
        }
        ir::ClusterGroup::FailoverGroup(failover) => {
            let mut child_names = Vec::with_capacity(failover.endpoint_groups.len());
            for (i, group) in failover.endpoint_groups.iter().enumerate() {
                let child_name = failover_child_name(name, group, i);
                let alt_stat_name =
                    failover.config.use_alt_stat_name.then(|| name.to_string());
                let built = make_group_cluster(
                    state,
                    &child_name,
                    alt_stat_name,
                    cluster.protocol,
                    group,
                )?;
                index.insert_child(ResourceKind::Cluster, name, child_name.clone());
                insert_built(index, &child_name, built);
                child_names.push(child_name);
            }
            let aggregate = make_aggregate_cluster(name, cluster, &failover.config, &child_names);
            index.insert(name, Resource::Cluster(aggregate));
        }
    }
    Ok(())
}

/// Name of a failover child cluster. Unnamed groups fall back to their
/// position so the derived name stays unique.
pub fn failover_child_name(cluster_name: &str, group: &ir::EndpointGroup, position: usize) -> String {
    match &group.name {
        Some(name) => format!("{FAILOVER_CLUSTER_NAME_PREFIX}{cluster_name}~{name}"),
        None => format!("{FAILOVER_CLUSTER_NAME_PREFIX}{cluster_name}~{position}"),
    }
}

struct BuiltCluster {
    cluster: Cluster,
    load_assignment: Option<ClusterLoadAssignment>,
}

fn insert_built(index: &mut IndexedResources, name: &str, built: BuiltCluster) {
    index.insert(name, Resource::Cluster(built.cluster));
    if let Some(cla) = built.load_assignment {
        index.insert(name, Resource::Endpoints(cla));
    }
}

fn make_group_cluster(
    state: &ir::ProxyState,
    name: &str,
    alt_stat_name: Option<String>,
    protocol: ir::AppProtocol,
    group: &ir::EndpointGroup,
) -> Result<BuiltCluster> {
    let mut built = match &group.kind {
        ir::EndpointGroupKind::Dynamic(dynamic) => make_dynamic_cluster(state, name, dynamic)?,
        ir::EndpointGroupKind::Static(static_group) => {
            make_static_cluster(state, name, &static_group.config)
        }
        ir::EndpointGroupKind::Dns(dns) => make_dns_cluster(name, dns),
        ir::EndpointGroupKind::Passthrough(passthrough) => {
            make_passthrough_cluster(name, &passthrough.config)
        }
    };
    built.cluster.alt_stat_name = alt_stat_name.unwrap_or_default();
    if matches!(protocol, ir::AppProtocol::Http2 | ir::AppProtocol::Grpc) {
        apply_http2_protocol_options(&mut built.cluster);
    }
    Ok(built)
}

fn make_dynamic_cluster(
    state: &ir::ProxyState,
    name: &str,
    dynamic: &ir::DynamicEndpointGroup,
) -> Result<BuiltCluster> {
    let config = &dynamic.config;
    let mut cluster = Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Eds as i32,
        )),
        eds_cluster_config: Some(cluster::EdsClusterConfig {
            eds_config: Some(ads_config_source()),
            ..Default::default()
        }),
        connect_timeout: Some(seconds(
            config.connect_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
        )),
        ..Default::default()
    };

    if config.disable_panic_threshold {
        cluster.common_lb_config = Some(cluster::CommonLbConfig {
            healthy_panic_threshold: Some(Percent { value: 0.0 }),
            ..Default::default()
        });
    }
    if let Some(breakers) = &config.circuit_breakers {
        cluster.circuit_breakers = Some(make_circuit_breakers(breakers));
    }
    if let Some(outlier) = &config.outlier_detection {
        cluster.outlier_detection = Some(make_outlier_detection(outlier));
    }
    apply_lb_policy(&mut cluster, &config.lb_policy);

    if let Some(socket) = &dynamic.outbound_tls {
        match socket {
            ir::TransportSocket::OutboundMesh(tls) => {
                cluster.transport_socket = Some(make_upstream_tls_socket(state, name, tls)?);
            }
            other => {
                return Err(Error::build(
                    name,
                    format!("endpoint group carries a non-upstream transport socket: {other:?}"),
                ));
            }
        }
    }

    let load_assignment =
        state.endpoints_for(name).map(|endpoints| make_load_assignment(name, endpoints));
    Ok(BuiltCluster { cluster, load_assignment })
}

fn make_static_cluster(
    state: &ir::ProxyState,
    name: &str,
    config: &ir::StaticEndpointGroupConfig,
) -> BuiltCluster {
    let endpoints = state.endpoints_for(name).cloned().unwrap_or_default();
    let cluster = Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::Static as i32,
        )),
        connect_timeout: Some(seconds(
            config.connect_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
        )),
        load_assignment: Some(make_load_assignment(name, &endpoints)),
        ..Default::default()
    };
    BuiltCluster { cluster, load_assignment: None }
}

fn make_dns_cluster(name: &str, dns: &ir::DnsEndpointGroup) -> BuiltCluster {
    let endpoint = ir::Endpoint {
        host: dns.hostname.clone(),
        port: dns.port,
        health: ir::HealthStatus::Unknown,
        load_balancing_weight: None,
    };
    let cluster = Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::LogicalDns as i32,
        )),
        connect_timeout: Some(seconds(
            dns.config.connect_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
        )),
        load_assignment: Some(make_load_assignment(
            name,
            &ir::Endpoints { endpoints: vec![endpoint] },
        )),
        ..Default::default()
    };
    BuiltCluster { cluster, load_assignment: None }
}

fn make_passthrough_cluster(name: &str, config: &ir::StaticEndpointGroupConfig) -> BuiltCluster {
    let cluster = Cluster {
        name: name.to_string(),
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
            cluster::DiscoveryType::OriginalDst as i32,
        )),
        lb_policy: cluster::LbPolicy::ClusterProvided as i32,
        connect_timeout: Some(seconds(
            config.connect_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
        )),
        ..Default::default()
    };
    BuiltCluster { cluster, load_assignment: None }
}

fn make_aggregate_cluster(
    name: &str,
    ir_cluster: &ir::Cluster,
    config: &ir::FailoverGroupConfig,
    child_names: &[String],
) -> Cluster {
    Cluster {
        name: name.to_string(),
        alt_stat_name: ir_cluster.alt_stat_name.clone().unwrap_or_default(),
        connect_timeout: Some(seconds(
            config.connect_timeout_seconds.unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS),
        )),
        lb_policy: cluster::LbPolicy::ClusterProvided as i32,
        cluster_discovery_type: Some(cluster::ClusterDiscoveryType::ClusterType(
            cluster::CustomClusterType {
                name: AGGREGATE_CLUSTER_TYPE_NAME.to_string(),
                typed_config: Some(make_any(
                    AGGREGATE_CLUSTER_TYPE_URL,
                    &ClusterConfig { clusters: child_names.to_vec() },
                )),
            },
        )),
        ..Default::default()
    }
}

fn apply_lb_policy(cluster: &mut Cluster, policy: &ir::LbPolicy) {
    match policy {
        ir::LbPolicy::RoundRobin => {
            cluster.lb_policy = cluster::LbPolicy::RoundRobin as i32;
        }
        ir::LbPolicy::Random => {
            cluster.lb_policy = cluster::LbPolicy::Random as i32;
        }
        ir::LbPolicy::LeastRequest { choice_count } => {
            cluster.lb_policy = cluster::LbPolicy::LeastRequest as i32;
            if let Some(count) = choice_count {
                cluster.lb_config = Some(cluster::LbConfig::LeastRequestLbConfig(
                    cluster::LeastRequestLbConfig {
                        choice_count: Some(UInt32Value { value: *count }),
                        ..Default::default()
                    },
                ));
            }
        }
        ir::LbPolicy::RingHash { minimum_ring_size, maximum_ring_size } => {
            cluster.lb_policy = cluster::LbPolicy::RingHash as i32;
            if minimum_ring_size.is_some() || maximum_ring_size.is_some() {
                cluster.lb_config = Some(cluster::LbConfig::RingHashLbConfig(
                    cluster::RingHashLbConfig {
                        minimum_ring_size: minimum_ring_size.map(|v| UInt64Value { value: v }),
                        maximum_ring_size: maximum_ring_size.map(|v| UInt64Value { value: v }),
                        ..Default::default()
                    },
                ));
            }
        }
        ir::LbPolicy::Maglev => {
            cluster.lb_policy = cluster::LbPolicy::Maglev as i32;
        }
    }
}

fn make_circuit_breakers(breakers: &ir::CircuitBreakers) -> CircuitBreakers {
    CircuitBreakers {
        thresholds: vec![circuit_breakers::Thresholds {
            max_connections: breakers.max_connections.map(|v| UInt32Value { value: v }),
            max_pending_requests: breakers.max_pending_requests.map(|v| UInt32Value { value: v }),
            max_requests: breakers.max_requests.map(|v| UInt32Value { value: v }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn make_outlier_detection(outlier: &ir::OutlierDetection) -> OutlierDetection {
    OutlierDetection {
        consecutive_5xx: outlier.consecutive_5xx.map(|v| UInt32Value { value: v }),
        enforcing_consecutive_5xx: outlier
            .enforcing_consecutive_5xx
            .map(|v| UInt32Value { value: v }),
        interval: outlier.interval_seconds.map(seconds),
        base_ejection_time: outlier.base_ejection_time_seconds.map(seconds),
        max_ejection_percent: outlier.max_ejection_percent.map(|v| UInt32Value { value: v }),
        ..Default::default()
    }
}

fn apply_http2_protocol_options(cluster: &mut Cluster) {
    // The local app speaks whatever protocol arrived on the inbound side;
    // upstream clusters are pinned to HTTP/2 explicitly.
    let upstream_protocol_options = if cluster.name == LOCAL_APP_CLUSTER_NAME {
        http_protocol_options::UpstreamProtocolOptions::UseDownstreamProtocolConfig(
            http_protocol_options::UseDownstreamHttpConfig {
                http2_protocol_options: Some(Http2ProtocolOptions::default()),
                ..Default::default()
            },
        )
    } else {
        http_protocol_options::UpstreamProtocolOptions::ExplicitHttpConfig(
            http_protocol_options::ExplicitHttpConfig {
                protocol_config: Some(
                    http_protocol_options::explicit_http_config::ProtocolConfig::Http2ProtocolOptions(
                        Http2ProtocolOptions::default(),
                    ),
                ),
            },
        )
    };
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(upstream_protocol_options),
        ..Default::default()
    };
    cluster.typed_extension_protocol_options.insert(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        make_any(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    );
}

fn make_upstream_tls_socket(
    state: &ir::ProxyState,
    resource_name: &str,
    tls: &ir::OutboundMeshTls,
) -> Result<envoy_types::pb::envoy::config::core::v3::TransportSocket> {
    let leaf = state.leaf_certificates.get(&tls.identity_key).ok_or_else(|| {
        Error::build(resource_name, format!("leaf certificate {:?} not found", tls.identity_key))
    })?;
    let bundle = state.trust_bundles.get(&tls.trust_bundle_peer_name_key).ok_or_else(|| {
        Error::build(
            resource_name,
            format!("trust bundle {:?} not found", tls.trust_bundle_peer_name_key),
        )
    })?;

    let validation = CertificateValidationContext {
        trusted_ca: Some(inline_string(join_pem(&bundle.roots))),
        match_typed_subject_alt_names: tls
            .spiffe_ids
            .iter()
            .map(|id| SubjectAltNameMatcher {
                san_type: subject_alt_name_matcher::SanType::Uri as i32,
                matcher: Some(StringMatcher {
                    match_pattern: Some(MatchPattern::Exact(id.clone())),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let context = UpstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_certificates: vec![make_tls_certificate(leaf)],
            validation_context_type: Some(
                common_tls_context::ValidationContextType::ValidationContext(validation),
            ),
            ..Default::default()
        }),
        sni: tls.sni.clone(),
        ..Default::default()
    };
    Ok(make_transport_socket(TLS_TRANSPORT_SOCKET_NAME, UPSTREAM_TLS_CONTEXT_TYPE_URL, &context))
}

/// Endpoint list for one cluster, all in a single locality.
pub fn make_load_assignment(
    cluster_name: &str,
    endpoints: &ir::Endpoints,
) -> ClusterLoadAssignment {
    let lb_endpoints = endpoints.endpoints.iter().map(make_lb_endpoint).collect();
    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }],
        ..Default::default()
    }
}

fn make_lb_endpoint(endpoint: &ir::Endpoint) -> LbEndpoint {
    let health_status = match endpoint.health {
        ir::HealthStatus::Unknown => CoreHealthStatus::Unknown,
        ir::HealthStatus::Healthy => CoreHealthStatus::Healthy,
        ir::HealthStatus::Unhealthy => CoreHealthStatus::Unhealthy,
    };
    LbEndpoint {
        health_status: health_status as i32,
        load_balancing_weight: endpoint.load_balancing_weight.map(|v| UInt32Value { value: v }),
        host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(EndpointProto {
            address: Some(make_socket_address(&endpoint.host, endpoint.port)),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn seconds(value: u64) -> Duration {
    Duration { seconds: value as i64, nanos: 0 }
}
