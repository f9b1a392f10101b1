//! # Extension Framework
//!
//! Extensions rewrite a compiled resource graph without rebuilding it. Each
//! extension implements [`Extension`] and is driven by one of the extenders
//! in [`extender`], which own traversal order, privilege checks, and error
//! accumulation. Builtin extensions live in [`property_override`] and
//! [`validate`]; the generic struct patcher they build on is in [`patcher`].

pub mod extender;
pub mod helpers;
pub mod patcher;
pub mod property_override;
pub mod validate;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::listener::v3::{Filter, Listener};
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::{Error, Result};
use crate::xds::FAILOVER_CLUSTER_NAME_PREFIX;

/// Extension names allowed to run against resources sourced from an
/// upstream's config rather than the local proxy's own.
pub const UPSTREAM_EXTENSION_NAMES: &[&str] = &["builtin/proxy/validate", "builtin/aws/lambda"];

pub fn is_upstream_extension(name: &str) -> bool {
    UPSTREAM_EXTENSION_NAMES.contains(&name)
}

/// Construct a builtin extension from its configuration. Argument decode or
/// validation failures block only this extension.
pub fn make_extension(config: &ExtensionConfig) -> Result<Box<dyn Extension>> {
    match config.name.as_str() {
        "builtin/property-override" => {
            Ok(Box::new(property_override::PropertyOverride::from_config(config)?))
        }
        "builtin/proxy/validate" => Ok(Box::new(validate::Validate::from_config(config)?)),
        other => Err(Error::config(format!("unsupported extension {other:?}"))),
    }
}

/// One configured extension: which one, and its free-form arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionConfig {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Required extensions turn patch failures into hard errors for the
    /// caller instead of best-effort skips.
    #[serde(default)]
    pub required: bool,
}

/// What kind of proxy the resources belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyKind {
    #[default]
    ConnectProxy,
    MeshGateway,
    TerminatingGateway,
    IngressGateway,
    ApiGateway,
}

impl ProxyKind {
    pub fn is_gateway(&self) -> bool {
        !matches!(self, ProxyKind::ConnectProxy)
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyKind::ConnectProxy => "connect-proxy",
            ProxyKind::MeshGateway => "mesh-gateway",
            ProxyKind::TerminatingGateway => "terminating-gateway",
            ProxyKind::IngressGateway => "ingress-gateway",
            ProxyKind::ApiGateway => "api-gateway",
        };
        write!(f, "{s}")
    }
}

/// Which side of the proxy a resource serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for TrafficDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficDirection::Inbound => write!(f, "inbound"),
            TrafficDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Everything known about one upstream of the configured service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamData {
    /// Every SNI / cluster name this upstream is reachable under.
    pub snis: BTreeSet<String>,
    pub envoy_id: String,
    /// Virtual IP, present for transparent-proxy data paths.
    pub vip: Option<String>,
    pub outgoing_proxy_kind: ProxyKind,
}

/// Runtime context an extension runs under: the extension's own config plus
/// the proxy and upstream topology it may consult.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub extension: ExtensionConfig,
    pub kind: ProxyKind,
    pub service_name: String,
    /// Upstream service name -> data.
    pub upstreams: BTreeMap<String, UpstreamData>,
    /// True when the extension comes from an upstream's config rather than
    /// the local service's own. Such runs are restricted to the allow-listed
    /// extensions and to that upstream's resources.
    pub is_sourced_from_upstream: bool,
}

impl RuntimeConfig {
    pub fn find_upstream_by_envoy_id(&self, envoy_id: &str) -> Option<(&str, &UpstreamData)> {
        self.upstreams
            .iter()
            .find(|(_, u)| u.envoy_id == envoy_id)
            .map(|(name, u)| (name.as_str(), u))
    }

    /// Match an SNI or cluster name against the upstream SNI sets. Failover
    /// child clusters are matched by the SNI embedded in their name.
    pub fn find_upstream_by_sni(&self, sni: &str) -> Option<(&str, &UpstreamData)> {
        let failover_sni = sni
            .strip_prefix(FAILOVER_CLUSTER_NAME_PREFIX)
            .and_then(|rest| rest.split_once('~'))
            .map(|(_, target)| target);
        self.upstreams
            .iter()
            .find(|(_, u)| {
                u.snis.contains(sni)
                    || failover_sni.map(|s| u.snis.contains(s)).unwrap_or(false)
            })
            .map(|(name, u)| (name.as_str(), u))
    }
}

/// The context handed to every patch callback, together with the message to
/// patch. Callbacks take ownership of the message and hand back the result.
pub struct Payload<'a, M> {
    pub runtime_config: &'a RuntimeConfig,
    pub traffic_direction: TrafficDirection,
    /// Owning upstream service name, when the resource maps to one.
    pub service_name: Option<&'a str>,
    pub upstream: Option<&'a UpstreamData>,
    pub message: M,
}

impl<'a, M> Payload<'a, M> {
    pub fn is_inbound(&self) -> bool {
        self.traffic_direction == TrafficDirection::Inbound
    }

    /// Same context, different message.
    pub fn with_message<N>(&self, message: N) -> Payload<'a, N> {
        Payload {
            runtime_config: self.runtime_config,
            traffic_direction: self.traffic_direction,
            service_name: self.service_name,
            upstream: self.upstream,
            message,
        }
    }
}

/// The extension contract. Per-resource callbacks return the (possibly
/// replaced) message and whether they changed it; defaults are pass-through,
/// so extensions implement only the hooks they care about. Batch hooks see
/// whole groups at once and default to the per-resource callbacks.
pub trait Extension {
    fn can_apply(&self, config: &RuntimeConfig) -> bool;

    fn patch_cluster(&mut self, payload: Payload<'_, Cluster>) -> Result<(Cluster, bool)> {
        Ok((payload.message, false))
    }

    fn patch_route(
        &mut self,
        payload: Payload<'_, RouteConfiguration>,
    ) -> Result<(RouteConfiguration, bool)> {
        Ok((payload.message, false))
    }

    fn patch_listener(&mut self, payload: Payload<'_, Listener>) -> Result<(Listener, bool)> {
        Ok((payload.message, false))
    }

    fn patch_filter(&mut self, payload: Payload<'_, Filter>) -> Result<(Filter, bool)> {
        Ok((payload.message, false))
    }

    fn patch_clusters(
        &mut self,
        payloads: Vec<Payload<'_, Cluster>>,
    ) -> Result<(Vec<Cluster>, bool)> {
        let mut out = Vec::with_capacity(payloads.len());
        let mut changed = false;
        for payload in payloads {
            let (cluster, patched) = self.patch_cluster(payload)?;
            changed |= patched;
            out.push(cluster);
        }
        Ok((out, changed))
    }

    fn patch_routes(
        &mut self,
        payloads: Vec<Payload<'_, RouteConfiguration>>,
    ) -> Result<(Vec<RouteConfiguration>, bool)> {
        let mut out = Vec::with_capacity(payloads.len());
        let mut changed = false;
        for payload in payloads {
            let (route, patched) = self.patch_route(payload)?;
            changed |= patched;
            out.push(route);
        }
        Ok((out, changed))
    }

    fn patch_filters(&mut self, payloads: Vec<Payload<'_, Filter>>) -> Result<(Vec<Filter>, bool)> {
        let mut out = Vec::with_capacity(payloads.len());
        let mut changed = false;
        for payload in payloads {
            let (filter, patched) = self.patch_filter(payload)?;
            changed |= patched;
            out.push(filter);
        }
        Ok((out, changed))
    }
}

// Boxed extensions from `make_extension` plug into the extenders directly.
// Every method forwards so the inner implementation is never bypassed.
impl Extension for Box<dyn Extension> {
    fn can_apply(&self, config: &RuntimeConfig) -> bool {
        (**self).can_apply(config)
    }

    fn patch_cluster(&mut self, payload: Payload<'_, Cluster>) -> Result<(Cluster, bool)> {
        (**self).patch_cluster(payload)
    }

    fn patch_route(
        &mut self,
        payload: Payload<'_, RouteConfiguration>,
    ) -> Result<(RouteConfiguration, bool)> {
        (**self).patch_route(payload)
    }

    fn patch_listener(&mut self, payload: Payload<'_, Listener>) -> Result<(Listener, bool)> {
        (**self).patch_listener(payload)
    }

    fn patch_filter(&mut self, payload: Payload<'_, Filter>) -> Result<(Filter, bool)> {
        (**self).patch_filter(payload)
    }

    fn patch_clusters(
        &mut self,
        payloads: Vec<Payload<'_, Cluster>>,
    ) -> Result<(Vec<Cluster>, bool)> {
        (**self).patch_clusters(payloads)
    }

    fn patch_routes(
        &mut self,
        payloads: Vec<Payload<'_, RouteConfiguration>>,
    ) -> Result<(Vec<RouteConfiguration>, bool)> {
        (**self).patch_routes(payloads)
    }

    fn patch_filters(&mut self, payloads: Vec<Payload<'_, Filter>>) -> Result<(Vec<Filter>, bool)> {
        (**self).patch_filters(payloads)
    }
}
