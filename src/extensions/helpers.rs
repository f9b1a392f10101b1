//! Filter and resource inspection helpers shared by extensions.
//!
//! These cover the recurring needs of patch callbacks: finding the HTTP
//! connection manager in a chain, collecting the cluster names a filter or
//! route points at, classifying listeners and clusters, and inserting a
//! filter at an anchored position in a filter list.

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use envoy_types::pb::envoy::config::route::v3::{route, route_action, RouteConfiguration};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{tcp_proxy, TcpProxy};
use std::collections::BTreeSet;
use std::fmt;

use crate::errors::{Error, Result};
use crate::xds::{
    decode_any, make_filter, HTTP_CONNECTION_MANAGER_FILTER_NAME,
    HTTP_CONNECTION_MANAGER_TYPE_URL, LOCAL_APP_CLUSTER_NAME, OUTBOUND_LISTENER_NAME,
    PUBLIC_LISTENER_NAME, TCP_PROXY_FILTER_NAME,
};

/// The Envoy ID of a listener: its name up to the first `:`. Listeners are
/// named `<envoy_id>:<address>:<port>`; a name with no `:` has no ID.
pub fn listener_envoy_id(name: &str) -> &str {
    match name.split_once(':') {
        Some((id, _)) => id,
        None => "",
    }
}

pub fn is_inbound_public_listener(listener: &Listener) -> bool {
    listener_envoy_id(&listener.name) == PUBLIC_LISTENER_NAME
}

pub fn is_outbound_tproxy_listener(listener: &Listener) -> bool {
    listener_envoy_id(&listener.name) == OUTBOUND_LISTENER_NAME
}

pub fn is_local_app_cluster(cluster: &Cluster) -> bool {
    cluster.name == LOCAL_APP_CLUSTER_NAME
}

/// True when every route action in the configuration targets the local app
/// cluster and nothing else.
pub fn is_route_to_local_app_cluster(route: &RouteConfiguration) -> bool {
    let names = route_cluster_names(route);
    names.len() == 1 && names.contains(LOCAL_APP_CLUSTER_NAME)
}

/// The SNI a filter chain matches on, when it matches exactly by server name.
pub fn chain_sni(chain: &FilterChain) -> Option<&str> {
    chain.filter_chain_match.as_ref()?.server_names.first().map(String::as_str)
}

/// True when the chain's destination prefix ranges include the given VIP.
pub fn chain_matches_vip(chain: &FilterChain, vip: &str) -> bool {
    chain
        .filter_chain_match
        .as_ref()
        .map(|m| m.prefix_ranges.iter().any(|r| r.address_prefix == vip))
        .unwrap_or(false)
}

fn typed_config(filter: &Filter) -> Option<&envoy_types::pb::google::protobuf::Any> {
    match filter.config_type.as_ref()? {
        filter::ConfigType::TypedConfig(any) => Some(any),
        filter::ConfigType::ConfigDiscovery(_) => None,
    }
}

/// Find and decode the HTTP connection manager in a filter list, returning
/// it with its position.
pub fn get_http_connection_manager(filters: &[Filter]) -> Option<(HttpConnectionManager, usize)> {
    filters.iter().enumerate().find_map(|(i, f)| {
        if f.name != HTTP_CONNECTION_MANAGER_FILTER_NAME {
            return None;
        }
        decode_any(typed_config(f)?).map(|hcm| (hcm, i))
    })
}

pub fn get_tcp_proxy(filter: &Filter) -> Option<TcpProxy> {
    if filter.name != TCP_PROXY_FILTER_NAME {
        return None;
    }
    decode_any(typed_config(filter)?)
}

/// Cluster names a network filter routes traffic to. An HCM deferring to RDS
/// contributes nothing; the route configuration carries those names.
pub fn filter_cluster_names(filter: &Filter) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    if let Some((hcm, _)) = get_http_connection_manager(std::slice::from_ref(filter)) {
        if let Some(http_connection_manager::RouteSpecifier::RouteConfig(route)) =
            &hcm.route_specifier
        {
            names.extend(route_cluster_names(route));
        }
        return names;
    }
    if let Some(tcp) = get_tcp_proxy(filter) {
        match tcp.cluster_specifier {
            Some(tcp_proxy::ClusterSpecifier::Cluster(cluster)) if !cluster.is_empty() => {
                names.insert(cluster);
            }
            Some(tcp_proxy::ClusterSpecifier::WeightedClusters(weighted)) => {
                names.extend(weighted.clusters.into_iter().map(|c| c.name));
            }
            _ => {}
        }
    }
    names
}

/// Every cluster name referenced by a route configuration's actions.
pub fn route_cluster_names(route: &RouteConfiguration) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for vh in &route.virtual_hosts {
        for r in &vh.routes {
            let Some(route::Action::Route(action)) = &r.action else {
                continue;
            };
            match &action.cluster_specifier {
                Some(route_action::ClusterSpecifier::Cluster(cluster)) => {
                    names.insert(cluster.clone());
                }
                Some(route_action::ClusterSpecifier::WeightedClusters(weighted)) => {
                    names.extend(weighted.clusters.iter().map(|c| c.name.clone()));
                }
                _ => {}
            }
        }
    }
    names
}

/// Where to insert a filter relative to the existing list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertLocation {
    First,
    Last,
    BeforeFirstMatch,
    AfterFirstMatch,
    BeforeLastMatch,
    AfterLastMatch,
}

impl fmt::Display for InsertLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InsertLocation::First => "First",
            InsertLocation::Last => "Last",
            InsertLocation::BeforeFirstMatch => "BeforeFirstMatch",
            InsertLocation::AfterFirstMatch => "AfterFirstMatch",
            InsertLocation::BeforeLastMatch => "BeforeLastMatch",
            InsertLocation::AfterLastMatch => "AfterLastMatch",
        };
        write!(f, "{s}")
    }
}

/// An insertion anchor: a location and, for the match-relative locations,
/// the name of the filter to anchor on.
#[derive(Debug, Clone)]
pub struct InsertOptions {
    pub location: InsertLocation,
    pub filter_name: String,
}

impl InsertOptions {
    pub fn new(location: InsertLocation, filter_name: impl Into<String>) -> Self {
        Self { location, filter_name: filter_name.into() }
    }
}

/// Resolve an insertion anchor to an index into `names`. A match-relative
/// location whose anchor never occurs is an error.
pub fn locate_insert_index<'a>(
    options: &InsertOptions,
    names: impl Iterator<Item = &'a str>,
) -> Result<usize> {
    let names: Vec<&str> = names.collect();
    match options.location {
        InsertLocation::First => return Ok(0),
        InsertLocation::Last => return Ok(names.len()),
        _ => {}
    }

    let mut found = None;
    for (i, name) in names.iter().enumerate() {
        if *name != options.filter_name {
            continue;
        }
        match options.location {
            InsertLocation::BeforeFirstMatch => return Ok(i),
            InsertLocation::AfterFirstMatch => return Ok(i + 1),
            InsertLocation::BeforeLastMatch => found = Some(i),
            InsertLocation::AfterLastMatch => found = Some(i + 1),
            InsertLocation::First | InsertLocation::Last => unreachable!(),
        }
    }
    found.ok_or_else(|| {
        Error::patch(format!(
            "failed to find insert location {:?} for {:?}",
            options.location.to_string(),
            options.filter_name
        ))
    })
}

fn insert_at<T>(list: &mut Vec<T>, index: usize, item: T) {
    if index >= list.len() {
        list.push(item);
    } else {
        list.insert(index, item);
    }
}

/// Insert an HTTP filter into every HTTP connection manager on the listener.
/// A listener with no connection manager at all is an error.
pub fn insert_http_filter(
    listener: &mut Listener,
    filter: HttpFilter,
    options: &InsertOptions,
) -> Result<()> {
    let mut inserted = false;
    let chains = listener.filter_chains.iter_mut().chain(listener.default_filter_chain.iter_mut());
    for chain in chains {
        let Some((mut hcm, idx)) = get_http_connection_manager(&chain.filters) else {
            continue;
        };
        let insert_idx =
            locate_insert_index(options, hcm.http_filters.iter().map(|f| f.name.as_str()))
                .map_err(|e| {
                    Error::patch(format!("failed to insert {:?} filter: {e}", filter.name))
                })?;
        insert_at(&mut hcm.http_filters, insert_idx, filter.clone());
        chain.filters[idx] =
            make_filter(HTTP_CONNECTION_MANAGER_FILTER_NAME, HTTP_CONNECTION_MANAGER_TYPE_URL, &hcm);
        inserted = true;
    }
    if !inserted {
        return Err(Error::patch(format!(
            "failed to insert {:?} filter: no HTTP connection manager found",
            filter.name
        )));
    }
    Ok(())
}

/// Insert a network filter into every filter chain on the listener.
pub fn insert_network_filter(
    listener: &mut Listener,
    filter: Filter,
    options: &InsertOptions,
) -> Result<()> {
    let chains = listener.filter_chains.iter_mut().chain(listener.default_filter_chain.iter_mut());
    let mut touched = false;
    for chain in chains {
        let insert_idx =
            locate_insert_index(options, chain.filters.iter().map(|f| f.name.as_str())).map_err(
                |e| Error::patch(format!("failed to insert {:?} filter: {e}", filter.name)),
            )?;
        insert_at(&mut chain.filters, insert_idx, filter.clone());
        touched = true;
    }
    if !touched {
        return Err(Error::patch(format!(
            "failed to insert {:?} filter: listener has no filter chains",
            filter.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<&'static str> {
        vec!["a", "b", "b", "b", "c"]
    }

    fn insert_name(location: InsertLocation, anchor: &str) -> Vec<String> {
        let mut list: Vec<String> = names().into_iter().map(String::from).collect();
        let options = InsertOptions::new(location, anchor);
        let idx = locate_insert_index(&options, list.iter().map(String::as_str)).unwrap();
        insert_at(&mut list, idx, "test.filter".to_string());
        list
    }

    #[test]
    fn test_locate_insert_index_all_locations() {
        assert_eq!(insert_name(InsertLocation::First, ""), [
            "test.filter", "a", "b", "b", "b", "c"
        ]);
        assert_eq!(insert_name(InsertLocation::Last, ""), [
            "a", "b", "b", "b", "c", "test.filter"
        ]);
        assert_eq!(insert_name(InsertLocation::BeforeFirstMatch, "b"), [
            "a", "test.filter", "b", "b", "b", "c"
        ]);
        assert_eq!(insert_name(InsertLocation::AfterFirstMatch, "b"), [
            "a", "b", "test.filter", "b", "b", "c"
        ]);
        assert_eq!(insert_name(InsertLocation::BeforeLastMatch, "b"), [
            "a", "b", "b", "test.filter", "b", "c"
        ]);
        assert_eq!(insert_name(InsertLocation::AfterLastMatch, "b"), [
            "a", "b", "b", "b", "test.filter", "c"
        ]);
    }

    #[test]
    fn test_locate_insert_index_missing_anchor_is_error() {
        let options = InsertOptions::new(InsertLocation::AfterFirstMatch, "missing");
        let err = locate_insert_index(&options, names().into_iter()).unwrap_err();
        assert!(err.to_string().contains("failed to find insert location"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_listener_envoy_id() {
        assert_eq!(listener_envoy_id("public_listener:0.0.0.0:20000"), "public_listener");
        assert_eq!(listener_envoy_id("outbound_listener:127.0.0.1:15001"), "outbound_listener");
        assert_eq!(listener_envoy_id("bare"), "");
    }

    #[test]
    fn test_route_cluster_names_includes_weighted() {
        use envoy_types::pb::envoy::config::route::v3::{
            weighted_cluster, Route as RouteProto, RouteAction, VirtualHost, WeightedCluster,
        };
        let route = RouteConfiguration {
            name: "r".to_string(),
            virtual_hosts: vec![VirtualHost {
                routes: vec![
                    RouteProto {
                        action: Some(route::Action::Route(RouteAction {
                            cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
                                "api".to_string(),
                            )),
                            ..Default::default()
                        })),
                        ..Default::default()
                    },
                    RouteProto {
                        action: Some(route::Action::Route(RouteAction {
                            cluster_specifier: Some(
                                route_action::ClusterSpecifier::WeightedClusters(WeightedCluster {
                                    clusters: vec![
                                        weighted_cluster::ClusterWeight {
                                            name: "v1".to_string(),
                                            ..Default::default()
                                        },
                                        weighted_cluster::ClusterWeight {
                                            name: "v2".to_string(),
                                            ..Default::default()
                                        },
                                    ],
                                    ..Default::default()
                                }),
                            ),
                            ..Default::default()
                        })),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        };
        let names = route_cluster_names(&route);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), ["api", "v1", "v2"]);
    }

    #[test]
    fn test_filter_cluster_names_rds_contributes_nothing() {
        use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::Rds;
        let hcm = HttpConnectionManager {
            route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
                route_config_name: "some-route".to_string(),
                ..Default::default()
            })),
            ..Default::default()
        };
        let filter = make_filter(
            HTTP_CONNECTION_MANAGER_FILTER_NAME,
            HTTP_CONNECTION_MANAGER_TYPE_URL,
            &hcm,
        );
        assert!(filter_cluster_names(&filter).is_empty());
    }
}
