//! Intermediate representation of a proxy's desired configuration.
//!
//! `ProxyState` is the protocol-agnostic input to the resource compiler: a
//! graph of named listeners, routers, clusters, endpoint groups, routes,
//! leaf certificates, and trust bundles. It is decoded from camelCase JSON
//! and consumed read-only; one `ProxyState` produces one compiled snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Full desired state for one proxy instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyState {
    pub listeners: Vec<Listener>,
    pub clusters: BTreeMap<String, Cluster>,
    pub routes: BTreeMap<String, Route>,
    pub endpoints: BTreeMap<String, Endpoints>,
    pub leaf_certificates: BTreeMap<String, LeafCertificate>,
    pub trust_bundles: BTreeMap<String, TrustBundle>,
}

/// Traffic direction of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    #[default]
    Unspecified,
    Inbound,
    Outbound,
}

/// Where a listener binds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindAddress {
    HostPort { host: String, port: u32 },
    UnixSocket { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
    pub bind_address: BindAddress,
    #[serde(default)]
    pub routers: Vec<Router>,
    #[serde(default)]
    pub default_router: Option<Box<Router>>,
}

/// One filter chain's worth of configuration: match criteria, a destination,
/// and optional inbound TLS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    #[serde(default, rename = "match")]
    pub chain_match: Option<Match>,
    pub destination: Destination,
    #[serde(default)]
    pub inbound_tls: Option<TransportSocket>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Match {
    pub alpn_protocols: Vec<String>,
    pub server_names: Vec<String>,
    pub destination_port: Option<u32>,
    pub prefix_ranges: Vec<CidrRange>,
    pub source_prefix_ranges: Vec<CidrRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CidrRange {
    pub address_prefix: String,
    pub prefix_len: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Destination {
    L4(L4Destination),
    L7(L7Destination),
    Sni(SniDestination),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L4Destination {
    /// Destination cluster name.
    pub name: String,
    #[serde(default)]
    pub stat_prefix: String,
    #[serde(default)]
    pub traffic_permissions: Option<TrafficPermissions>,
    #[serde(default)]
    pub max_inbound_connections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L7Destination {
    /// Route name this destination resolves through.
    pub name: String,
    #[serde(default)]
    pub stat_prefix: String,
    #[serde(default)]
    pub protocol: L7Protocol,
    /// Inline the route into the connection manager instead of referencing
    /// it through RDS.
    #[serde(default)]
    pub static_route: bool,
    #[serde(default)]
    pub max_inbound_connections: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SniDestination {
    #[serde(default)]
    pub stat_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum L7Protocol {
    #[default]
    Http,
    Http2,
    Grpc,
}

/// Authorization rules for an inbound destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrafficPermissions {
    pub default_allow: bool,
    pub allow_permissions: Vec<Permission>,
    pub deny_permissions: Vec<Permission>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Permission {
    pub principals: Vec<Principal>,
}

/// A source identity matched by SPIFFE URI regex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub spiffe_regex: String,
}

/// Connection TLS, one of the four supported variants. Outbound-non-mesh
/// connections carry no transport socket at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportSocket {
    InboundMesh(InboundMeshTls),
    InboundNonMesh(InboundNonMeshTls),
    OutboundMesh(OutboundMeshTls),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMeshTls {
    /// Key into `ProxyState::leaf_certificates`.
    pub identity_key: String,
    /// Keys into `ProxyState::trust_bundles`.
    #[serde(default)]
    pub trust_bundle_peer_name_keys: Vec<String>,
    /// Filled by the listener builder for L7 chains.
    #[serde(default)]
    pub alpn_protocols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundNonMeshTls {
    /// Key into `ProxyState::leaf_certificates`.
    pub leaf_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMeshTls {
    pub identity_key: String,
    pub trust_bundle_peer_name_key: String,
    #[serde(default)]
    pub spiffe_ids: Vec<String>,
    pub sni: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeafCertificate {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustBundle {
    pub trust_domain: String,
    #[serde(default)]
    pub roots: Vec<String>,
}

/// A logical cluster: either a single endpoint group or an ordered failover
/// list of groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    #[serde(default)]
    pub alt_stat_name: Option<String>,
    #[serde(default)]
    pub protocol: AppProtocol,
    pub group: ClusterGroup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppProtocol {
    #[default]
    Tcp,
    Http,
    Http2,
    Grpc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterGroup {
    EndpointGroup(EndpointGroup),
    FailoverGroup(FailoverGroup),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverGroup {
    pub endpoint_groups: Vec<EndpointGroup>,
    #[serde(default)]
    pub config: FailoverGroupConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailoverGroupConfig {
    pub use_alt_stat_name: bool,
    pub connect_timeout_seconds: Option<u64>,
}

/// One way of reaching a cluster's endpoints. The name is only meaningful
/// for failover children; an inline group takes its cluster's name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointGroup {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: EndpointGroupKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointGroupKind {
    Dynamic(DynamicEndpointGroup),
    Static(StaticEndpointGroup),
    Dns(DnsEndpointGroup),
    Passthrough(PassthroughEndpointGroup),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicEndpointGroup {
    pub config: DynamicEndpointGroupConfig,
    pub outbound_tls: Option<TransportSocket>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicEndpointGroupConfig {
    pub connect_timeout_seconds: Option<u64>,
    /// Disables panic routing by pinning the healthy panic threshold to 0%.
    pub disable_panic_threshold: bool,
    pub circuit_breakers: Option<CircuitBreakers>,
    pub outlier_detection: Option<OutlierDetection>,
    pub lb_policy: LbPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakers {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_requests: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlierDetection {
    pub consecutive_5xx: Option<u32>,
    pub enforcing_consecutive_5xx: Option<u32>,
    pub interval_seconds: Option<u64>,
    pub base_ejection_time_seconds: Option<u64>,
    pub max_ejection_percent: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    Random,
    LeastRequest {
        #[serde(default)]
        choice_count: Option<u32>,
    },
    RingHash {
        #[serde(default)]
        minimum_ring_size: Option<u64>,
        #[serde(default)]
        maximum_ring_size: Option<u64>,
    },
    Maglev,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticEndpointGroup {
    pub config: StaticEndpointGroupConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticEndpointGroupConfig {
    pub connect_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsEndpointGroup {
    pub hostname: String,
    pub port: u32,
    #[serde(default)]
    pub config: StaticEndpointGroupConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PassthroughEndpointGroup {
    pub config: StaticEndpointGroupConfig,
}

/// Resolved endpoints for one cluster name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Endpoints {
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub host: String,
    pub port: u32,
    #[serde(default)]
    pub health: HealthStatus,
    #[serde(default)]
    pub load_balancing_weight: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// A named route configuration referenced by L7 destinations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Route {
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    pub name: String,
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,
    #[serde(default)]
    pub route_rules: Vec<RouteRule>,
}

fn default_domains() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    #[serde(default, rename = "match")]
    pub rule_match: RouteMatch,
    pub destination: RouteDestination,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteMatch {
    pub path: Option<PathMatch>,
    pub headers: Vec<HeaderMatch>,
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatch {
    pub name: String,
    #[serde(default)]
    pub exact: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub present: Option<bool>,
    #[serde(default)]
    pub invert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteDestination {
    Cluster {
        name: String,
        #[serde(default)]
        config: Option<DestinationConfig>,
    },
    WeightedClusters {
        clusters: Vec<WeightedCluster>,
        #[serde(default)]
        config: Option<DestinationConfig>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedCluster {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationConfig {
    pub prefix_rewrite: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: Option<u32>,
    pub retriable_status_codes: Vec<u32>,
}

impl ProxyState {
    /// Endpoints for a cluster name, if resolved.
    pub fn endpoints_for(&self, name: &str) -> Option<&Endpoints> {
        self.endpoints.get(name)
    }
}
