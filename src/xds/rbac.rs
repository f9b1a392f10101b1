//! RBAC filter construction from IR traffic permissions.
//!
//! Inbound L4 destinations carry optional traffic permissions which compile
//! into network RBAC filters placed ahead of the TCP proxy. Two filters can
//! result: a DENY filter when any deny permissions are configured, and an
//! ALLOW filter whenever the default action is not allow-all. The ALLOW
//! filter is emitted even with zero policies so that an empty permission set
//! still rejects unmatched traffic. DENY always precedes ALLOW.

use envoy_types::pb::envoy::config::listener::v3::Filter;
use envoy_types::pb::envoy::config::rbac::v3::{
    permission, principal, rbac, Permission, Policy, Principal, Rbac,
};
use envoy_types::pb::envoy::extensions::filters::network::rbac::v3::Rbac as NetworkRbac;
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatcher, StringMatcher,
};

use crate::ir;
use crate::xds::{make_filter, NETWORK_RBAC_FILTER_NAME, NETWORK_RBAC_TYPE_URL};

/// Builds the network RBAC filters for an inbound destination.
///
/// Returns the filters in the order they must appear in the chain.
pub fn build_network_rbac_filters(
    permissions: &ir::TrafficPermissions,
    stat_prefix: &str,
) -> Vec<Filter> {
    let mut filters = Vec::new();

    if !permissions.deny_permissions.is_empty() {
        let rules = make_rbac_rules(rbac::Action::Deny, &permissions.deny_permissions);
        filters.push(make_network_rbac_filter(rules, stat_prefix));
    }

    if !permissions.default_allow {
        let rules = make_rbac_rules(rbac::Action::Allow, &permissions.allow_permissions);
        filters.push(make_network_rbac_filter(rules, stat_prefix));
    }

    filters
}

fn make_network_rbac_filter(rules: Rbac, stat_prefix: &str) -> Filter {
    let cfg = NetworkRbac {
        rules: Some(rules),
        stat_prefix: stat_prefix.to_string(),
        ..Default::default()
    };
    make_filter(NETWORK_RBAC_FILTER_NAME, NETWORK_RBAC_TYPE_URL, &cfg)
}

fn make_rbac_rules(action: rbac::Action, permissions: &[ir::Permission]) -> Rbac {
    let mut rules = Rbac { action: action as i32, ..Default::default() };
    for (i, permission) in permissions.iter().enumerate() {
        rules.policies.insert(policy_name(action, i), make_policy(permission));
    }
    rules
}

fn policy_name(action: rbac::Action, index: usize) -> String {
    let prefix = match action {
        rbac::Action::Deny => "deny",
        _ => "allow",
    };
    format!("{prefix}-{index:02}")
}

fn make_policy(permission: &ir::Permission) -> Policy {
    let principals = permission.principals.iter().map(make_spiffe_principal).collect();
    Policy {
        permissions: vec![Permission { rule: Some(permission::Rule::Any(true)) }],
        principals,
        ..Default::default()
    }
}

fn make_spiffe_principal(principal: &ir::Principal) -> Principal {
    Principal {
        identifier: Some(principal::Identifier::Authenticated(principal::Authenticated {
            principal_name: Some(StringMatcher {
                match_pattern: Some(MatchPattern::SafeRegex(RegexMatcher {
                    regex: principal.spiffe_regex.clone(),
                    ..Default::default()
                })),
                ..Default::default()
            }),
        })),
    }
}
