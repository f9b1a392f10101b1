//! # xDS Resource Model
//!
//! Resource kinds, the typed resource index produced by the compiler, and
//! the protobuf packing helpers shared by the builders and the extension
//! framework. All resources are `envoy-types` protobuf messages carried in a
//! closed [`Resource`] enum so the rest of the crate can dispatch on kind
//! without open-ended reflection.

pub mod cluster;
pub mod listener;
pub mod rbac;
pub mod resources;
pub mod route;

pub use resources::{CompiledResources, ResourceCompiler};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{
    address, data_source, socket_address, transport_socket, Address, DataSource, SocketAddress,
    TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::TlsCertificate;
use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, Listener};
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_filter, HttpFilter,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use std::collections::BTreeMap;
use std::fmt;

/// Cluster receiving inbound traffic for the local application.
pub const LOCAL_APP_CLUSTER_NAME: &str = "local_app";
/// Envoy ID of the inbound public listener.
pub const PUBLIC_LISTENER_NAME: &str = "public_listener";
/// Envoy ID of the outbound (tproxy) listener.
pub const OUTBOUND_LISTENER_NAME: &str = "outbound_listener";
/// Prefix of clusters that pass traffic through to the original destination.
pub const PASSTHROUGH_CLUSTER_PREFIX: &str = "passthrough~";
/// Prefix of child clusters generated for failover aggregates.
pub const FAILOVER_CLUSTER_NAME_PREFIX: &str = "failover-target~";

pub const HTTP_CONNECTION_MANAGER_FILTER_NAME: &str =
    "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY_FILTER_NAME: &str = "envoy.filters.network.tcp_proxy";
pub const CONNECTION_LIMIT_FILTER_NAME: &str = "envoy.filters.network.connection_limit";
pub const SNI_CLUSTER_FILTER_NAME: &str = "envoy.filters.network.sni_cluster";
pub const NETWORK_RBAC_FILTER_NAME: &str = "envoy.filters.network.rbac";
pub const HTTP_RBAC_FILTER_NAME: &str = "envoy.filters.http.rbac";
pub const HTTP_ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
pub const GRPC_HTTP1_BRIDGE_FILTER_NAME: &str = "envoy.filters.http.grpc_http1_bridge";
pub const GRPC_STATS_FILTER_NAME: &str = "envoy.filters.http.grpc_stats";
pub const AGGREGATE_CLUSTER_TYPE_NAME: &str = "envoy.clusters.aggregate";
pub const TLS_TRANSPORT_SOCKET_NAME: &str = "tls";
pub const SPIFFE_CERT_VALIDATOR_NAME: &str = "envoy.tls.cert_validator.spiffe";

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

pub const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
pub const CONNECTION_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.connection_limit.v3.ConnectionLimit";
pub const SNI_CLUSTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.sni_cluster.v3.SniCluster";
pub const NETWORK_RBAC_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.rbac.v3.RBAC";
pub const HTTP_RBAC_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.rbac.v3.RBAC";
pub const HTTP_ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub const GRPC_HTTP1_BRIDGE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.grpc_http1_bridge.v3.Config";
pub const GRPC_STATS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.grpc_stats.v3.FilterConfig";
pub const AGGREGATE_CLUSTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.clusters.aggregate.v3.ClusterConfig";
pub const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const SPIFFE_CERT_VALIDATOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.SPIFFECertValidatorConfig";
pub const HTTP_PROTOCOL_OPTIONS_KEY: &str =
    "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// The four resource kinds tracked by the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cluster,
    Endpoints,
    Listener,
    Route,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cluster,
        ResourceKind::Endpoints,
        ResourceKind::Listener,
        ResourceKind::Route,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => CLUSTER_TYPE_URL,
            ResourceKind::Endpoints => ENDPOINT_TYPE_URL,
            ResourceKind::Listener => LISTENER_TYPE_URL,
            ResourceKind::Route => ROUTE_TYPE_URL,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Endpoints => "endpoints",
            ResourceKind::Listener => "listener",
            ResourceKind::Route => "route",
        };
        write!(f, "{s}")
    }
}

/// One compiled protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Cluster(Cluster),
    Endpoints(ClusterLoadAssignment),
    Listener(Listener),
    Route(RouteConfiguration),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Cluster(_) => ResourceKind::Cluster,
            Resource::Endpoints(_) => ResourceKind::Endpoints,
            Resource::Listener(_) => ResourceKind::Listener,
            Resource::Route(_) => ResourceKind::Route,
        }
    }

    /// The resource's own name; the index key may differ (listeners key by
    /// Envoy ID plus address suffix).
    pub fn name(&self) -> &str {
        match self {
            Resource::Cluster(c) => &c.name,
            Resource::Endpoints(e) => &e.cluster_name,
            Resource::Listener(l) => &l.name,
            Resource::Route(r) => &r.name,
        }
    }

    pub fn as_cluster(&self) -> Option<&Cluster> {
        match self {
            Resource::Cluster(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_endpoints(&self) -> Option<&ClusterLoadAssignment> {
        match self {
            Resource::Endpoints(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_listener(&self) -> Option<&Listener> {
        match self {
            Resource::Listener(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_route(&self) -> Option<&RouteConfiguration> {
        match self {
            Resource::Route(r) => Some(r),
            _ => None,
        }
    }

    /// Pack into `google.protobuf.Any` for delivery.
    pub fn to_any(&self) -> Any {
        match self {
            Resource::Cluster(c) => make_any(CLUSTER_TYPE_URL, c),
            Resource::Endpoints(e) => make_any(ENDPOINT_TYPE_URL, e),
            Resource::Listener(l) => make_any(LISTENER_TYPE_URL, l),
            Resource::Route(r) => make_any(ROUTE_TYPE_URL, r),
        }
    }
}

/// Typed map of compiled resources: kind -> name/SNI -> resource, plus a
/// child index for parent/child pairs whose names differ (failover
/// aggregates and their child clusters).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexedResources {
    index: BTreeMap<ResourceKind, BTreeMap<String, Resource>>,
    child_index: BTreeMap<ResourceKind, BTreeMap<String, Vec<String>>>,
}

impl IndexedResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource under an explicit key. Names are unique within a
    /// kind; a second insert with the same key replaces the first.
    pub fn insert(&mut self, key: impl Into<String>, resource: Resource) {
        self.index.entry(resource.kind()).or_default().insert(key.into(), resource);
    }

    /// Record a parent/child relationship for `kind`.
    pub fn insert_child(
        &mut self,
        kind: ResourceKind,
        parent: impl Into<String>,
        child: impl Into<String>,
    ) {
        self.child_index
            .entry(kind)
            .or_default()
            .entry(parent.into())
            .or_default()
            .push(child.into());
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&Resource> {
        self.index.get(&kind)?.get(name)
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.get(kind, name).is_some()
    }

    pub fn children(&self, kind: ResourceKind, parent: &str) -> &[String] {
        self.child_index
            .get(&kind)
            .and_then(|m| m.get(parent))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All resources of a kind, keyed by index name.
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = (&String, &Resource)> {
        self.index.get(&kind).into_iter().flatten()
    }

    pub fn names_of_kind(&self, kind: ResourceKind) -> Vec<String> {
        self.index.get(&kind).map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn len_of_kind(&self, kind: ResourceKind) -> usize {
        self.index.get(&kind).map(BTreeMap::len).unwrap_or(0)
    }

    /// Take the map for one kind so it can be rebuilt entry by entry.
    pub(crate) fn take_kind(&mut self, kind: ResourceKind) -> BTreeMap<String, Resource> {
        self.index.remove(&kind).unwrap_or_default()
    }

    pub(crate) fn put_kind(&mut self, kind: ResourceKind, map: BTreeMap<String, Resource>) {
        self.index.insert(kind, map);
    }

    /// Flat `kind -> resources` projection for delivery.
    pub fn flatten(&self) -> BTreeMap<ResourceKind, Vec<Resource>> {
        let mut out = BTreeMap::new();
        for kind in ResourceKind::ALL {
            let resources: Vec<Resource> = self.of_kind(kind).map(|(_, r)| r.clone()).collect();
            out.insert(kind, resources);
        }
        out
    }
}

/// Pack a protobuf message into `google.protobuf.Any` under the given type URL.
pub fn make_any<M: Message>(type_url: &str, msg: &M) -> Any {
    debug_assert!(type_url.starts_with(TYPE_URL_PREFIX));
    Any { type_url: type_url.to_string(), value: msg.encode_to_vec() }
}

/// Decode an `Any` payload into a concrete message, ignoring the type URL.
pub fn decode_any<M: Message + Default>(any: &Any) -> Option<M> {
    M::decode(any.value.as_slice()).ok()
}

/// Build a named network filter with a typed config.
pub fn make_filter<M: Message>(name: &str, type_url: &str, msg: &M) -> Filter {
    Filter {
        name: name.to_string(),
        config_type: Some(filter::ConfigType::TypedConfig(make_any(type_url, msg))),
    }
}

/// Build a named HTTP filter with a typed config.
pub fn make_http_filter<M: Message>(name: &str, type_url: &str, msg: &M) -> HttpFilter {
    HttpFilter {
        name: name.to_string(),
        config_type: Some(http_filter::ConfigType::TypedConfig(make_any(type_url, msg))),
        ..Default::default()
    }
}

/// Build a transport socket with a typed config.
pub fn make_transport_socket<M: Message>(name: &str, type_url: &str, msg: &M) -> TransportSocket {
    TransportSocket {
        name: name.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(make_any(type_url, msg))),
    }
}

/// Config source pointing at the aggregated discovery stream.
pub(crate) fn ads_config_source() -> envoy_types::pb::envoy::config::core::v3::ConfigSource {
    use envoy_types::pb::envoy::config::core::v3::{
        config_source, AggregatedConfigSource, ApiVersion, ConfigSource,
    };
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(config_source::ConfigSourceSpecifier::Ads(
            AggregatedConfigSource {},
        )),
        ..Default::default()
    }
}

/// TCP socket address.
pub(crate) fn make_socket_address(host: &str, port: u32) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

/// Inline-string data source for PEM material.
pub(crate) fn inline_string(contents: impl Into<String>) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineString(contents.into())),
        ..Default::default()
    }
}

/// Concatenate PEM blocks, guaranteeing each ends with a newline so Envoy
/// accepts the bundle.
pub(crate) fn join_pem(blocks: &[String]) -> String {
    let mut out = String::new();
    for block in blocks {
        out.push_str(block);
        if !block.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Certificate chain plus private key from one leaf, carried inline.
pub(crate) fn make_tls_certificate(leaf: &crate::ir::LeafCertificate) -> TlsCertificate {
    TlsCertificate {
        certificate_chain: Some(inline_string(join_pem(std::slice::from_ref(&leaf.cert)))),
        private_key: Some(inline_string(join_pem(std::slice::from_ref(&leaf.key)))),
        ..Default::default()
    }
}
