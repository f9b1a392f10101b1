//! Route configuration builders.
//!
//! IR routes are already close to Envoy's shape; this module maps virtual
//! hosts and route rules onto `RouteConfiguration` messages. Cluster
//! validation is always requested so Envoy rejects configs that reference
//! clusters missing from the snapshot.

use envoy_types::pb::envoy::config::route::v3::{
    header_matcher, route, route_action, route_match, weighted_cluster, HeaderMatcher,
    Route as RouteProto, RouteAction, RouteConfiguration, RouteMatch, RetryPolicy, VirtualHost,
    WeightedCluster,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::{BoolValue, Duration, UInt32Value};

use crate::ir;

/// Build a named `RouteConfiguration` from an IR route.
pub fn make_route_config(name: &str, route: &ir::Route) -> RouteConfiguration {
    RouteConfiguration {
        name: name.to_string(),
        virtual_hosts: route.virtual_hosts.iter().map(make_virtual_host).collect(),
        validate_clusters: Some(BoolValue { value: true }),
        ..Default::default()
    }
}

fn make_virtual_host(vh: &ir::VirtualHost) -> VirtualHost {
    VirtualHost {
        name: vh.name.clone(),
        domains: vh.domains.clone(),
        routes: vh.route_rules.iter().map(make_route_rule).collect(),
        ..Default::default()
    }
}

fn make_route_rule(rule: &ir::RouteRule) -> RouteProto {
    RouteProto {
        r#match: Some(make_route_match(&rule.rule_match)),
        action: Some(route::Action::Route(make_route_action(&rule.destination))),
        ..Default::default()
    }
}

fn make_route_match(m: &ir::RouteMatch) -> RouteMatch {
    let path_specifier = match &m.path {
        Some(ir::PathMatch::Exact(path)) => route_match::PathSpecifier::Path(path.clone()),
        Some(ir::PathMatch::Prefix(prefix)) => route_match::PathSpecifier::Prefix(prefix.clone()),
        Some(ir::PathMatch::Regex(regex)) => {
            route_match::PathSpecifier::SafeRegex(safe_regex(regex.clone()))
        }
        None => route_match::PathSpecifier::Prefix(String::new()),
    };

    let mut headers: Vec<HeaderMatcher> = m.headers.iter().map(make_header_matcher).collect();
    if !m.methods.is_empty() {
        // Envoy has no method matcher; multiple methods become one regex on
        // the :method pseudo-header.
        headers.push(HeaderMatcher {
            name: ":method".to_string(),
            header_match_specifier: Some(header_matcher::HeaderMatchSpecifier::StringMatch(
                StringMatcher {
                    match_pattern: Some(MatchPattern::SafeRegex(safe_regex(m.methods.join("|")))),
                    ..Default::default()
                },
            )),
            ..Default::default()
        });
    }

    RouteMatch { path_specifier: Some(path_specifier), headers, ..Default::default() }
}

fn make_header_matcher(h: &ir::HeaderMatch) -> HeaderMatcher {
    let specifier = if let Some(exact) = &h.exact {
        Some(header_matcher::HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::Exact(exact.clone())),
            ..Default::default()
        }))
    } else if let Some(regex) = &h.regex {
        Some(header_matcher::HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::SafeRegex(safe_regex(regex.clone()))),
            ..Default::default()
        }))
    } else {
        h.present.map(header_matcher::HeaderMatchSpecifier::PresentMatch)
    };
    HeaderMatcher {
        name: h.name.clone(),
        invert_match: h.invert,
        header_match_specifier: specifier,
        ..Default::default()
    }
}

fn make_route_action(destination: &ir::RouteDestination) -> RouteAction {
    let (specifier, config) = match destination {
        ir::RouteDestination::Cluster { name, config } => {
            (route_action::ClusterSpecifier::Cluster(name.clone()), config)
        }
        ir::RouteDestination::WeightedClusters { clusters, config } => {
            let weighted = WeightedCluster {
                clusters: clusters
                    .iter()
                    .map(|c| weighted_cluster::ClusterWeight {
                        name: c.name.clone(),
                        weight: Some(UInt32Value { value: c.weight }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            };
            (route_action::ClusterSpecifier::WeightedClusters(weighted), config)
        }
    };

    let mut action = RouteAction { cluster_specifier: Some(specifier), ..Default::default() };
    if let Some(config) = config {
        apply_destination_config(&mut action, config);
    }
    action
}

fn apply_destination_config(action: &mut RouteAction, config: &ir::DestinationConfig) {
    if let Some(prefix) = &config.prefix_rewrite {
        action.prefix_rewrite = prefix.clone();
    }
    action.timeout = config.timeout_seconds.map(seconds);
    if let Some(idle) = config.idle_timeout_seconds {
        action.idle_timeout = Some(seconds(idle));
    }
    if let Some(retry) = &config.retry_policy {
        action.retry_policy = Some(RetryPolicy {
            retry_on: retry.retry_on.clone(),
            num_retries: retry.num_retries.map(|v| UInt32Value { value: v }),
            retriable_status_codes: retry.retriable_status_codes.clone(),
            ..Default::default()
        });
    }
}

fn safe_regex(regex: String) -> RegexMatcher {
    RegexMatcher { regex, ..Default::default() }
}

fn seconds(value: u64) -> Duration {
    Duration { seconds: value as i64, nanos: 0 }
}
