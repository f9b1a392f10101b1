//! Listener and filter-chain builders.
//!
//! A listener compiles from its routers: each router becomes one filter
//! chain (match criteria, filter stack, optional downstream TLS), and the
//! optional default router becomes the default chain. Routers are sorted by
//! a stable key derived from their match before chains are built so the
//! output is deterministic regardless of IR ordering.

use envoy_types::pb::envoy::config::core::v3::{
    address, Address, CidrRange, Http2ProtocolOptions, Pipe, TrafficDirection,
};
use envoy_types::pb::envoy::config::listener::v3::{
    Filter, FilterChain, FilterChainMatch, Listener,
};
use envoy_types::pb::envoy::extensions::filters::http::grpc_http1_bridge::v3::Config as GrpcHttp1BridgeConfig;
use envoy_types::pb::envoy::extensions::filters::http::grpc_stats::v3::{
    filter_config, FilterConfig as GrpcStatsConfig,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router as HttpRouterConfig;
use envoy_types::pb::envoy::extensions::filters::network::connection_limit::v3::ConnectionLimit;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::sni_cluster::v3::SniCluster;
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{tcp_proxy, TcpProxy};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context, spiffe_cert_validator_config, CertificateValidationContext,
    CommonTlsContext, DownstreamTlsContext, SpiffeCertValidatorConfig,
};
use envoy_types::pb::envoy::config::core::v3::TypedExtensionConfig;
use envoy_types::pb::envoy::r#type::v3::Percent;
use envoy_types::pb::google::protobuf::{BoolValue, UInt32Value, UInt64Value};

use crate::errors::{Error, Result};
use crate::ir;
use crate::xds::{
    ads_config_source, inline_string, join_pem, make_any, make_filter, make_http_filter,
    make_socket_address, make_tls_certificate, make_transport_socket, route, IndexedResources,
    Resource, CONNECTION_LIMIT_FILTER_NAME, CONNECTION_LIMIT_TYPE_URL,
    DOWNSTREAM_TLS_CONTEXT_TYPE_URL, GRPC_HTTP1_BRIDGE_FILTER_NAME, GRPC_HTTP1_BRIDGE_TYPE_URL,
    GRPC_STATS_FILTER_NAME, GRPC_STATS_TYPE_URL, HTTP_CONNECTION_MANAGER_FILTER_NAME,
    HTTP_CONNECTION_MANAGER_TYPE_URL, HTTP_ROUTER_FILTER_NAME, HTTP_ROUTER_TYPE_URL,
    SNI_CLUSTER_FILTER_NAME, SNI_CLUSTER_TYPE_URL, SPIFFE_CERT_VALIDATOR_NAME,
    SPIFFE_CERT_VALIDATOR_TYPE_URL, TCP_PROXY_FILTER_NAME, TCP_PROXY_TYPE_URL,
    TLS_TRANSPORT_SOCKET_NAME,
};

/// Compile one IR listener into the index, along with any route
/// configurations its chains reference through RDS.
pub fn build_listener_resources(
    state: &ir::ProxyState,
    listener: &ir::Listener,
    index: &mut IndexedResources,
) -> Result<()> {
    let routers = sorted_routers(&listener.routers);
    let mut filter_chains = Vec::with_capacity(routers.len());
    for router in routers {
        filter_chains.push(make_filter_chain(state, listener, router, index)?);
    }
    let default_filter_chain = match &listener.default_router {
        Some(router) => Some(make_filter_chain(state, listener, router, index)?),
        None => None,
    };

    let built = Listener {
        name: listener.name.clone(),
        address: Some(make_bind_address(&listener.bind_address)),
        traffic_direction: traffic_direction(listener.direction) as i32,
        filter_chains,
        default_filter_chain,
        ..Default::default()
    };
    index.insert(listener.name.clone(), Resource::Listener(built));
    Ok(())
}

/// Stable ordering key for a router's match so chain order never depends on
/// map iteration upstream of the IR.
fn router_sort_key(router: &ir::Router) -> String {
    let Some(m) = &router.chain_match else {
        return String::new();
    };
    let port = m.destination_port.unwrap_or(0);
    if let Some(range) = m.prefix_ranges.first() {
        return format!("{}/{}:{}", range.address_prefix, range.prefix_len, port);
    }
    if let Some(server_name) = m.server_names.first() {
        return format!("{server_name}:{port}");
    }
    port.to_string()
}

fn sorted_routers(routers: &[ir::Router]) -> Vec<&ir::Router> {
    let mut sorted: Vec<&ir::Router> = routers.iter().collect();
    sorted.sort_by_key(|r| router_sort_key(r));
    sorted
}

fn make_bind_address(bind: &ir::BindAddress) -> Address {
    match bind {
        ir::BindAddress::HostPort { host, port } => make_socket_address(host, *port),
        ir::BindAddress::UnixSocket { path } => Address {
            address: Some(address::Address::Pipe(Pipe {
                path: path.clone(),
                ..Default::default()
            })),
        },
    }
}

fn traffic_direction(direction: ir::Direction) -> TrafficDirection {
    match direction {
        ir::Direction::Unspecified => TrafficDirection::Unspecified,
        ir::Direction::Inbound => TrafficDirection::Inbound,
        ir::Direction::Outbound => TrafficDirection::Outbound,
    }
}

fn make_filter_chain(
    state: &ir::ProxyState,
    listener: &ir::Listener,
    router: &ir::Router,
    index: &mut IndexedResources,
) -> Result<FilterChain> {
    let (filters, alpn_protocols) = match &router.destination {
        ir::Destination::L4(l4) => (make_l4_filters(l4), Vec::new()),
        ir::Destination::L7(l7) => {
            let filters = make_l7_filters(state, listener, l7, index)?;
            (filters, l7_alpn_protocols(l7.protocol))
        }
        ir::Destination::Sni(sni) => (make_sni_filters(sni), Vec::new()),
    };

    let transport_socket = match &router.inbound_tls {
        Some(tls) => {
            Some(make_downstream_tls_socket(state, &listener.name, tls, &alpn_protocols)?)
        }
        None => None,
    };

    Ok(FilterChain {
        filter_chain_match: router.chain_match.as_ref().map(make_filter_chain_match),
        filters,
        transport_socket,
        ..Default::default()
    })
}

fn make_filter_chain_match(m: &ir::Match) -> FilterChainMatch {
    FilterChainMatch {
        destination_port: m.destination_port.map(|v| UInt32Value { value: v }),
        prefix_ranges: m.prefix_ranges.iter().map(make_cidr_range).collect(),
        source_prefix_ranges: m.source_prefix_ranges.iter().map(make_cidr_range).collect(),
        server_names: m.server_names.clone(),
        application_protocols: m.alpn_protocols.clone(),
        ..Default::default()
    }
}

fn make_cidr_range(range: &ir::CidrRange) -> CidrRange {
    CidrRange {
        address_prefix: range.address_prefix.clone(),
        prefix_len: Some(UInt32Value { value: range.prefix_len }),
    }
}

fn make_l4_filters(l4: &ir::L4Destination) -> Vec<Filter> {
    let mut filters = Vec::new();
    if let Some(permissions) = &l4.traffic_permissions {
        filters.extend(super::rbac::build_network_rbac_filters(permissions, &l4.stat_prefix));
    }
    if l4.max_inbound_connections > 0 {
        filters.push(make_connection_limit_filter(&l4.stat_prefix, l4.max_inbound_connections));
    }
    filters.push(make_tcp_proxy_filter(&l4.name, &l4.stat_prefix));
    filters
}

fn make_sni_filters(sni: &ir::SniDestination) -> Vec<Filter> {
    vec![
        make_filter(SNI_CLUSTER_FILTER_NAME, SNI_CLUSTER_TYPE_URL, &SniCluster {}),
        // The sni_cluster filter fills the cluster in at connection time.
        make_tcp_proxy_filter("", &sni.stat_prefix),
    ]
}

fn make_l7_filters(
    state: &ir::ProxyState,
    listener: &ir::Listener,
    l7: &ir::L7Destination,
    index: &mut IndexedResources,
) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();
    if l7.max_inbound_connections > 0 {
        filters.push(make_connection_limit_filter(&l7.stat_prefix, l7.max_inbound_connections));
    }

    let ir_route = state.routes.get(&l7.name).ok_or_else(|| {
        Error::build(&listener.name, format!("route {:?} not found", l7.name))
    })?;
    let route_config = route::make_route_config(&l7.name, ir_route);
    let route_specifier = if l7.static_route {
        http_connection_manager::RouteSpecifier::RouteConfig(route_config)
    } else {
        index.insert(l7.name.clone(), Resource::Route(route_config));
        http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name: l7.name.clone(),
        })
    };

    let mut hcm = HttpConnectionManager {
        stat_prefix: l7.stat_prefix.clone(),
        codec_type: http_connection_manager::CodecType::Auto as i32,
        http_filters: make_http_filters(l7.protocol),
        // Tracing is propagated but never initiated here.
        tracing: Some(http_connection_manager::Tracing {
            random_sampling: Some(Percent { value: 0.0 }),
            ..Default::default()
        }),
        upgrade_configs: vec![http_connection_manager::UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            ..Default::default()
        }],
        route_specifier: Some(route_specifier),
        ..Default::default()
    };
    if matches!(l7.protocol, ir::L7Protocol::Http2 | ir::L7Protocol::Grpc) {
        hcm.http2_protocol_options = Some(Http2ProtocolOptions::default());
    }

    filters.push(make_filter(
        HTTP_CONNECTION_MANAGER_FILTER_NAME,
        HTTP_CONNECTION_MANAGER_TYPE_URL,
        &hcm,
    ));
    Ok(filters)
}

fn make_http_filters(protocol: ir::L7Protocol) -> Vec<HttpFilter> {
    let mut filters = Vec::new();
    if matches!(protocol, ir::L7Protocol::Grpc) {
        let stats = GrpcStatsConfig {
            per_method_stat_specifier: Some(
                filter_config::PerMethodStatSpecifier::StatsForAllMethods(BoolValue {
                    value: true,
                }),
            ),
            ..Default::default()
        };
        filters.push(make_http_filter(GRPC_STATS_FILTER_NAME, GRPC_STATS_TYPE_URL, &stats));
        filters.push(make_http_filter(
            GRPC_HTTP1_BRIDGE_FILTER_NAME,
            GRPC_HTTP1_BRIDGE_TYPE_URL,
            &GrpcHttp1BridgeConfig::default(),
        ));
    }
    filters.push(make_http_filter(
        HTTP_ROUTER_FILTER_NAME,
        HTTP_ROUTER_TYPE_URL,
        &HttpRouterConfig::default(),
    ));
    filters
}

fn l7_alpn_protocols(protocol: ir::L7Protocol) -> Vec<String> {
    match protocol {
        ir::L7Protocol::Http2 | ir::L7Protocol::Grpc => {
            vec!["h2".to_string(), "http/1.1".to_string()]
        }
        ir::L7Protocol::Http => vec!["http/1.1".to_string()],
    }
}

fn make_connection_limit_filter(stat_prefix: &str, max_connections: u64) -> Filter {
    let limit = ConnectionLimit {
        stat_prefix: stat_prefix.to_string(),
        max_connections: Some(UInt64Value { value: max_connections }),
        ..Default::default()
    };
    make_filter(CONNECTION_LIMIT_FILTER_NAME, CONNECTION_LIMIT_TYPE_URL, &limit)
}

fn make_tcp_proxy_filter(cluster: &str, stat_prefix: &str) -> Filter {
    let tcp = TcpProxy {
        stat_prefix: stat_prefix.to_string(),
        cluster_specifier: Some(tcp_proxy::ClusterSpecifier::Cluster(cluster.to_string())),
        ..Default::default()
    };
    make_filter(TCP_PROXY_FILTER_NAME, TCP_PROXY_TYPE_URL, &tcp)
}

fn make_downstream_tls_socket(
    state: &ir::ProxyState,
    resource_name: &str,
    tls: &ir::TransportSocket,
    chain_alpn: &[String],
) -> Result<envoy_types::pb::envoy::config::core::v3::TransportSocket> {
    let context = match tls {
        ir::TransportSocket::InboundMesh(mesh) => {
            make_inbound_mesh_context(state, resource_name, mesh, chain_alpn)?
        }
        ir::TransportSocket::InboundNonMesh(non_mesh) => {
            let leaf = state.leaf_certificates.get(&non_mesh.leaf_key).ok_or_else(|| {
                Error::build(
                    resource_name,
                    format!("leaf certificate {:?} not found", non_mesh.leaf_key),
                )
            })?;
            DownstreamTlsContext {
                common_tls_context: Some(CommonTlsContext {
                    tls_certificates: vec![make_tls_certificate(leaf)],
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
        ir::TransportSocket::OutboundMesh(_) => {
            return Err(Error::build(
                resource_name,
                "outbound transport socket on an inbound filter chain",
            ));
        }
    };
    Ok(make_transport_socket(TLS_TRANSPORT_SOCKET_NAME, DOWNSTREAM_TLS_CONTEXT_TYPE_URL, &context))
}

fn make_inbound_mesh_context(
    state: &ir::ProxyState,
    resource_name: &str,
    mesh: &ir::InboundMeshTls,
    chain_alpn: &[String],
) -> Result<DownstreamTlsContext> {
    let leaf = state.leaf_certificates.get(&mesh.identity_key).ok_or_else(|| {
        Error::build(resource_name, format!("leaf certificate {:?} not found", mesh.identity_key))
    })?;

    let mut bundles = Vec::with_capacity(mesh.trust_bundle_peer_name_keys.len());
    for key in &mesh.trust_bundle_peer_name_keys {
        let bundle = state.trust_bundles.get(key).ok_or_else(|| {
            Error::build(resource_name, format!("trust bundle {:?} not found", key))
        })?;
        bundles.push(bundle);
    }

    let validation = match bundles.len() {
        0 => None,
        1 => Some(CertificateValidationContext {
            trusted_ca: Some(inline_string(join_pem(&bundles[0].roots))),
            ..Default::default()
        }),
        // Multiple peer trust domains require the SPIFFE validator, which
        // selects the bundle by the presented certificate's trust domain.
        _ => {
            let mut trust_domains: Vec<spiffe_cert_validator_config::TrustDomain> = bundles
                .iter()
                .map(|bundle| spiffe_cert_validator_config::TrustDomain {
                    name: bundle.trust_domain.clone(),
                    trust_bundle: Some(inline_string(join_pem(&bundle.roots))),
                    ..Default::default()
                })
                .collect();
            trust_domains.sort_by(|a, b| a.name.cmp(&b.name));
            let validator = SpiffeCertValidatorConfig { trust_domains, ..Default::default() };
            Some(CertificateValidationContext {
                custom_validator_config: Some(TypedExtensionConfig {
                    name: SPIFFE_CERT_VALIDATOR_NAME.to_string(),
                    typed_config: Some(make_any(SPIFFE_CERT_VALIDATOR_TYPE_URL, &validator)),
                }),
                ..Default::default()
            })
        }
    };

    let alpn = if mesh.alpn_protocols.is_empty() {
        chain_alpn.to_vec()
    } else {
        mesh.alpn_protocols.clone()
    };
    Ok(DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_certificates: vec![make_tls_certificate(leaf)],
            alpn_protocols: alpn,
            validation_context_type: validation.map(
                common_tls_context::ValidationContextType::ValidationContext,
            ),
            ..Default::default()
        }),
        require_client_certificate: Some(BoolValue { value: true }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::{decode_any, ResourceKind};
    use envoy_types::pb::envoy::config::listener::v3::filter;

    fn decode_filter<M: prost::Message + Default>(filter: &Filter) -> M {
        match filter.config_type.as_ref().unwrap() {
            filter::ConfigType::TypedConfig(any) => decode_any(any).unwrap(),
            other => panic!("unexpected config type: {other:?}"),
        }
    }

    fn state_with_route(route_name: &str) -> ir::ProxyState {
        let mut state = ir::ProxyState::default();
        state.routes.insert(route_name.to_string(), ir::Route::default());
        state
    }

    fn l4_listener(l4: ir::L4Destination) -> ir::Listener {
        ir::Listener {
            name: "public_listener:0.0.0.0:20000".to_string(),
            direction: ir::Direction::Inbound,
            bind_address: ir::BindAddress::HostPort { host: "0.0.0.0".to_string(), port: 20000 },
            routers: vec![ir::Router {
                chain_match: None,
                destination: ir::Destination::L4(l4),
                inbound_tls: None,
            }],
            default_router: None,
        }
    }

    #[test]
    fn test_l4_chain_orders_rbac_limit_tcp_proxy() {
        let state = ir::ProxyState::default();
        let mut index = IndexedResources::new();
        let listener = l4_listener(ir::L4Destination {
            name: "local_app".to_string(),
            stat_prefix: "public_listener".to_string(),
            traffic_permissions: Some(ir::TrafficPermissions::default()),
            max_inbound_connections: 1024,
        });
        build_listener_resources(&state, &listener, &mut index).unwrap();

        let built = index
            .get(ResourceKind::Listener, &listener.name)
            .unwrap()
            .as_listener()
            .unwrap();
        assert_eq!(built.traffic_direction, TrafficDirection::Inbound as i32);
        let names: Vec<&str> =
            built.filter_chains[0].filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "envoy.filters.network.rbac",
                "envoy.filters.network.connection_limit",
                "envoy.filters.network.tcp_proxy"
            ]
        );
        let tcp: TcpProxy = decode_filter(built.filter_chains[0].filters.last().unwrap());
        assert_eq!(
            tcp.cluster_specifier,
            Some(tcp_proxy::ClusterSpecifier::Cluster("local_app".to_string()))
        );
    }

    #[test]
    fn test_grpc_chain_builds_hcm_with_bridge_filters() {
        let state = state_with_route("inbound-route");
        let mut index = IndexedResources::new();
        let mut listener = l4_listener(ir::L4Destination {
            name: "unused".to_string(),
            stat_prefix: String::new(),
            traffic_permissions: None,
            max_inbound_connections: 0,
        });
        listener.routers[0].destination = ir::Destination::L7(ir::L7Destination {
            name: "inbound-route".to_string(),
            stat_prefix: "public_listener".to_string(),
            protocol: ir::L7Protocol::Grpc,
            static_route: true,
            max_inbound_connections: 0,
        });
        build_listener_resources(&state, &listener, &mut index).unwrap();

        let built = index
            .get(ResourceKind::Listener, &listener.name)
            .unwrap()
            .as_listener()
            .unwrap();
        let hcm: HttpConnectionManager = decode_filter(&built.filter_chains[0].filters[0]);
        let http_filters: Vec<&str> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            http_filters,
            [
                "envoy.filters.http.grpc_stats",
                "envoy.filters.http.grpc_http1_bridge",
                "envoy.filters.http.router"
            ]
        );
        assert!(hcm.http2_protocol_options.is_some());
        assert_eq!(hcm.upgrade_configs[0].upgrade_type, "websocket");
        assert_eq!(hcm.tracing.unwrap().random_sampling.unwrap().value, 0.0);
        assert!(matches!(
            hcm.route_specifier,
            Some(http_connection_manager::RouteSpecifier::RouteConfig(_))
        ));
        // Static routes are inlined, not registered.
        assert_eq!(index.len_of_kind(ResourceKind::Route), 0);
    }

    #[test]
    fn test_rds_route_is_registered_top_level() {
        let state = state_with_route("inbound-route");
        let mut index = IndexedResources::new();
        let mut listener = l4_listener(ir::L4Destination {
            name: "unused".to_string(),
            stat_prefix: String::new(),
            traffic_permissions: None,
            max_inbound_connections: 0,
        });
        listener.routers[0].destination = ir::Destination::L7(ir::L7Destination {
            name: "inbound-route".to_string(),
            stat_prefix: "public_listener".to_string(),
            protocol: ir::L7Protocol::Http,
            static_route: false,
            max_inbound_connections: 0,
        });
        build_listener_resources(&state, &listener, &mut index).unwrap();

        assert!(index.contains(ResourceKind::Route, "inbound-route"));
        let built = index
            .get(ResourceKind::Listener, &listener.name)
            .unwrap()
            .as_listener()
            .unwrap();
        let hcm: HttpConnectionManager = decode_filter(&built.filter_chains[0].filters[0]);
        match hcm.route_specifier.unwrap() {
            http_connection_manager::RouteSpecifier::Rds(rds) => {
                assert_eq!(rds.route_config_name, "inbound-route");
                assert!(rds.config_source.is_some());
            }
            other => panic!("unexpected route specifier: {other:?}"),
        }
    }

    #[test]
    fn test_sni_chain_uses_dynamic_cluster() {
        let state = ir::ProxyState::default();
        let mut index = IndexedResources::new();
        let mut listener = l4_listener(ir::L4Destination {
            name: "unused".to_string(),
            stat_prefix: String::new(),
            traffic_permissions: None,
            max_inbound_connections: 0,
        });
        listener.routers[0].destination =
            ir::Destination::Sni(ir::SniDestination { stat_prefix: "upstream".to_string() });
        build_listener_resources(&state, &listener, &mut index).unwrap();

        let built = index
            .get(ResourceKind::Listener, &listener.name)
            .unwrap()
            .as_listener()
            .unwrap();
        let names: Vec<&str> =
            built.filter_chains[0].filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["envoy.filters.network.sni_cluster", "envoy.filters.network.tcp_proxy"]);
        let tcp: TcpProxy = decode_filter(&built.filter_chains[0].filters[1]);
        assert_eq!(tcp.cluster_specifier, Some(tcp_proxy::ClusterSpecifier::Cluster(String::new())));
    }

    #[test]
    fn test_routers_sorted_by_match_key() {
        let router = |sni: &str| ir::Router {
            chain_match: Some(ir::Match {
                server_names: vec![sni.to_string()],
                ..Default::default()
            }),
            destination: ir::Destination::Sni(ir::SniDestination::default()),
            inbound_tls: None,
        };
        let listener = ir::Listener {
            name: "outbound_listener:127.0.0.1:15001".to_string(),
            direction: ir::Direction::Outbound,
            bind_address: ir::BindAddress::HostPort {
                host: "127.0.0.1".to_string(),
                port: 15001,
            },
            routers: vec![router("web.dc1"), router("api.dc1"), router("db.dc1")],
            default_router: None,
        };
        let state = ir::ProxyState::default();
        let mut index = IndexedResources::new();
        build_listener_resources(&state, &listener, &mut index).unwrap();

        let built = index
            .get(ResourceKind::Listener, &listener.name)
            .unwrap()
            .as_listener()
            .unwrap();
        let snis: Vec<&str> = built
            .filter_chains
            .iter()
            .map(|c| c.filter_chain_match.as_ref().unwrap().server_names[0].as_str())
            .collect();
        assert_eq!(snis, ["api.dc1", "db.dc1", "web.dc1"]);
    }

    #[test]
    fn test_inbound_mesh_tls_with_multiple_bundles_uses_spiffe_validator() {
        let mut state = ir::ProxyState::default();
        state.leaf_certificates.insert(
            "identity".to_string(),
            ir::LeafCertificate { cert: "CERT".to_string(), key: "KEY".to_string() },
        );
        state.trust_bundles.insert(
            "dc2".to_string(),
            ir::TrustBundle { trust_domain: "dc2.internal".to_string(), roots: vec!["B".into()] },
        );
        state.trust_bundles.insert(
            "dc1".to_string(),
            ir::TrustBundle { trust_domain: "dc1.internal".to_string(), roots: vec!["A".into()] },
        );

        let mut listener = l4_listener(ir::L4Destination {
            name: "local_app".to_string(),
            stat_prefix: "public_listener".to_string(),
            traffic_permissions: None,
            max_inbound_connections: 0,
        });
        listener.routers[0].inbound_tls =
            Some(ir::TransportSocket::InboundMesh(ir::InboundMeshTls {
                identity_key: "identity".to_string(),
                trust_bundle_peer_name_keys: vec!["dc2".to_string(), "dc1".to_string()],
                alpn_protocols: vec![],
            }));
        let mut index = IndexedResources::new();
        build_listener_resources(&state, &listener, &mut index).unwrap();

        let built = index
            .get(ResourceKind::Listener, &listener.name)
            .unwrap()
            .as_listener()
            .unwrap();
        let socket = built.filter_chains[0].transport_socket.as_ref().unwrap();
        assert_eq!(socket.name, TLS_TRANSPORT_SOCKET_NAME);
        let any = match socket.config_type.as_ref().unwrap() {
            envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType::TypedConfig(
                any,
            ) => any,
        };
        let ctx: DownstreamTlsContext = decode_any(any).unwrap();
        assert_eq!(ctx.require_client_certificate.unwrap().value, true);
        let common = ctx.common_tls_context.unwrap();
        let validation = match common.validation_context_type.unwrap() {
            common_tls_context::ValidationContextType::ValidationContext(v) => v,
            other => panic!("unexpected validation context: {other:?}"),
        };
        let custom = validation.custom_validator_config.unwrap();
        assert_eq!(custom.name, SPIFFE_CERT_VALIDATOR_NAME);
        let spiffe: SpiffeCertValidatorConfig =
            decode_any(custom.typed_config.as_ref().unwrap()).unwrap();
        let domains: Vec<&str> =
            spiffe.trust_domains.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(domains, ["dc1.internal", "dc2.internal"]);
    }
}
