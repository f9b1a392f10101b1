//! Field tables for patchable protobuf messages.
//!
//! prost generates plain structs with no runtime reflection, so each message
//! the patcher can address carries a hand-built schema: an ordered list of
//! field names with typed accessor functions over `&mut dyn Any`. Accessors
//! return `false` on a downcast mismatch, which the engine reports as an
//! internal error; by construction it cannot happen when a schema is only
//! reached through its owning message.
//!
//! The tables cover the top-level resource messages and the nested config
//! messages extensions commonly tune. Fields whose shapes the patcher cannot
//! write (repeated messages, maps, `google.protobuf.Any`) are listed as
//! unsupported so setting them or descending into them fails with a specific
//! error instead of an unknown-field one; removal still clears them.

use envoy_types::pb::envoy::config::cluster::v3::{
    cluster, Cluster, CircuitBreakers, OutlierDetection, UpstreamConnectionOptions,
};
use envoy_types::pb::envoy::config::core::v3::{TcpKeepalive, TrafficDirection};
use envoy_types::pb::envoy::config::endpoint::v3::{cluster_load_assignment, ClusterLoadAssignment};
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::google::protobuf::{
    BoolValue, DoubleValue, Duration, UInt32Value, UInt64Value,
};
use once_cell::sync::Lazy;
use std::any::Any;

/// The scalar families a field can hold. Names follow protobuf kinds so
/// they can appear verbatim in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Double,
    String,
}

impl ScalarKind {
    pub fn name(&self) -> &'static str {
        match self {
            ScalarKind::Bool => "bool",
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Uint32 => "uint32",
            ScalarKind::Uint64 => "uint64",
            ScalarKind::Double => "double",
            ScalarKind::String => "string",
        }
    }

    /// Full name of the wrapper message carrying this scalar.
    pub fn wrapper_name(&self) -> &'static str {
        match self {
            ScalarKind::Bool => "google.protobuf.BoolValue",
            ScalarKind::Int32 => "google.protobuf.Int32Value",
            ScalarKind::Int64 => "google.protobuf.Int64Value",
            ScalarKind::Uint32 => "google.protobuf.UInt32Value",
            ScalarKind::Uint64 => "google.protobuf.UInt64Value",
            ScalarKind::Double => "google.protobuf.DoubleValue",
            ScalarKind::String => "google.protobuf.StringValue",
        }
    }
}

/// A scalar already coerced to the exact width of its target field.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
}

pub type ScalarSetFn = fn(&mut dyn Any, ScalarValue) -> bool;
pub type ScalarListSetFn = fn(&mut dyn Any, Vec<ScalarValue>) -> bool;
pub type EnumSetFn = fn(&mut dyn Any, i32) -> bool;
pub type ClearFn = fn(&mut dyn Any) -> bool;
pub type SchemaFn = fn() -> &'static MessageSchema;
pub type GetMessageMutFn = for<'a> fn(&'a mut dyn Any, bool) -> Option<&'a mut dyn Any>;

/// How one field is read and written.
pub enum FieldAccessor {
    Scalar {
        kind: ScalarKind,
        set: ScalarSetFn,
        clear: ClearFn,
    },
    ScalarList {
        kind: ScalarKind,
        set: ScalarListSetFn,
        clear: ClearFn,
    },
    Enum {
        enum_name: &'static str,
        from_name: fn(&str) -> Option<i32>,
        valid: fn(i32) -> bool,
        set: EnumSetFn,
        clear: ClearFn,
    },
    /// A well-known wrapper message, addressed as its scalar.
    Wrapper {
        kind: ScalarKind,
        set: ScalarSetFn,
        clear: ClearFn,
    },
    Message {
        schema: SchemaFn,
        /// Borrow the child message; `init` creates it when unset.
        get_mut: GetMessageMutFn,
        /// Replace the child with a fresh empty message.
        reset: ClearFn,
        clear: ClearFn,
    },
    /// Present in the message but not writable by the patcher. Removal
    /// still works: any field can be cleared back to its default.
    Unsupported {
        type_name: &'static str,
        clear: ClearFn,
    },
}

pub struct FieldSpec {
    pub name: &'static str,
    pub accessor: FieldAccessor,
}

pub struct MessageSchema {
    /// Full protobuf type name.
    pub type_name: &'static str,
    /// Declaration order; the order shows up in error listings.
    pub fields: Vec<FieldSpec>,
}

impl MessageSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A message with a patch schema. The root entry point of the patcher.
pub trait Patchable: Default + 'static {
    fn schema() -> &'static MessageSchema;
}

macro_rules! scalar_field {
    (@make $owner:ty, $field:ident, $kind:ident, $variant:ident) => {
        FieldSpec {
            name: stringify!($field),
            accessor: FieldAccessor::Scalar {
                kind: ScalarKind::$kind,
                set: |target, value| match (target.downcast_mut::<$owner>(), value) {
                    (Some(m), ScalarValue::$variant(v)) => {
                        m.$field = v;
                        true
                    }
                    _ => false,
                },
                clear: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = Default::default();
                        true
                    }
                    None => false,
                },
            },
        }
    };
    ($owner:ty, $field:ident, bool) => {
        scalar_field!(@make $owner, $field, Bool, Bool)
    };
    ($owner:ty, $field:ident, string) => {
        scalar_field!(@make $owner, $field, String, Str)
    };
    ($owner:ty, $field:ident, int32) => {
        scalar_field!(@make $owner, $field, Int32, I32)
    };
    ($owner:ty, $field:ident, int64) => {
        scalar_field!(@make $owner, $field, Int64, I64)
    };
    ($owner:ty, $field:ident, uint32) => {
        scalar_field!(@make $owner, $field, Uint32, U32)
    };
    ($owner:ty, $field:ident, uint64) => {
        scalar_field!(@make $owner, $field, Uint64, U64)
    };
    ($owner:ty, $field:ident, double) => {
        scalar_field!(@make $owner, $field, Double, F64)
    };
}

macro_rules! string_list_field {
    ($owner:ty, $field:ident) => {
        FieldSpec {
            name: stringify!($field),
            accessor: FieldAccessor::ScalarList {
                kind: ScalarKind::String,
                set: |target, values| {
                    let Some(m) = target.downcast_mut::<$owner>() else {
                        return false;
                    };
                    let mut out = Vec::with_capacity(values.len());
                    for value in values {
                        let ScalarValue::Str(s) = value else {
                            return false;
                        };
                        out.push(s);
                    }
                    m.$field = out;
                    true
                },
                clear: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field.clear();
                        true
                    }
                    None => false,
                },
            },
        }
    };
}

macro_rules! wrapper_field {
    (@make $owner:ty, $field:ident, $kind:ident, $variant:ident, $wrapper:ty) => {
        FieldSpec {
            name: stringify!($field),
            accessor: FieldAccessor::Wrapper {
                kind: ScalarKind::$kind,
                set: |target, value| match (target.downcast_mut::<$owner>(), value) {
                    (Some(m), ScalarValue::$variant(v)) => {
                        let mut wrapper = <$wrapper>::default();
                        wrapper.value = v;
                        m.$field = Some(wrapper);
                        true
                    }
                    _ => false,
                },
                clear: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = None;
                        true
                    }
                    None => false,
                },
            },
        }
    };
    ($owner:ty, $field:ident, bool) => {
        wrapper_field!(@make $owner, $field, Bool, Bool, BoolValue)
    };
    ($owner:ty, $field:ident, uint32) => {
        wrapper_field!(@make $owner, $field, Uint32, U32, UInt32Value)
    };
    ($owner:ty, $field:ident, uint64) => {
        wrapper_field!(@make $owner, $field, Uint64, U64, UInt64Value)
    };
    ($owner:ty, $field:ident, double) => {
        wrapper_field!(@make $owner, $field, Double, F64, DoubleValue)
    };
}

macro_rules! enum_field {
    ($owner:ty, $field:ident, $enum:ty, $name:expr) => {
        FieldSpec {
            name: stringify!($field),
            accessor: FieldAccessor::Enum {
                enum_name: $name,
                from_name: |s| <$enum>::from_str_name(s).map(|v| v as i32),
                valid: |i| <$enum>::try_from(i).is_ok(),
                set: |target, value| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = value;
                        true
                    }
                    None => false,
                },
                clear: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = 0;
                        true
                    }
                    None => false,
                },
            },
        }
    };
}

macro_rules! message_field {
    ($owner:ty, $field:ident, $child:ty, $schema:expr) => {
        FieldSpec {
            name: stringify!($field),
            accessor: FieldAccessor::Message {
                schema: $schema,
                get_mut: |target, init| {
                    let m = target.downcast_mut::<$owner>()?;
                    if init && m.$field.is_none() {
                        m.$field = Some(<$child>::default());
                    }
                    m.$field.as_mut().map(|v| v as &mut dyn Any)
                },
                reset: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = Some(<$child>::default());
                        true
                    }
                    None => false,
                },
                clear: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = None;
                        true
                    }
                    None => false,
                },
            },
        }
    };
}

macro_rules! unsupported_field {
    ($owner:ty, $field:ident, $type_name:expr) => {
        FieldSpec {
            name: stringify!($field),
            accessor: FieldAccessor::Unsupported {
                type_name: $type_name,
                clear: |target| match target.downcast_mut::<$owner>() {
                    Some(m) => {
                        m.$field = Default::default();
                        true
                    }
                    None => false,
                },
            },
        }
    };
}

pub static DURATION_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "google.protobuf.Duration",
    fields: vec![
        scalar_field!(Duration, seconds, int64),
        scalar_field!(Duration, nanos, int32),
    ],
});

pub static TCP_KEEPALIVE_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.core.v3.TcpKeepalive",
    fields: vec![
        wrapper_field!(TcpKeepalive, keepalive_probes, uint32),
        wrapper_field!(TcpKeepalive, keepalive_time, uint32),
        wrapper_field!(TcpKeepalive, keepalive_interval, uint32),
    ],
});

pub static UPSTREAM_CONNECTION_OPTIONS_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.cluster.v3.UpstreamConnectionOptions",
    fields: vec![message_field!(
        UpstreamConnectionOptions,
        tcp_keepalive,
        TcpKeepalive,
        || &*TCP_KEEPALIVE_SCHEMA
    )],
});

pub static OUTLIER_DETECTION_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.cluster.v3.OutlierDetection",
    fields: vec![
        wrapper_field!(OutlierDetection, consecutive_5xx, uint32),
        message_field!(OutlierDetection, interval, Duration, || &*DURATION_SCHEMA),
        message_field!(OutlierDetection, base_ejection_time, Duration, || &*DURATION_SCHEMA),
        wrapper_field!(OutlierDetection, max_ejection_percent, uint32),
        wrapper_field!(OutlierDetection, enforcing_consecutive_5xx, uint32),
        wrapper_field!(OutlierDetection, enforcing_success_rate, uint32),
        wrapper_field!(OutlierDetection, success_rate_minimum_hosts, uint32),
        wrapper_field!(OutlierDetection, success_rate_request_volume, uint32),
        wrapper_field!(OutlierDetection, success_rate_stdev_factor, uint32),
        wrapper_field!(OutlierDetection, consecutive_gateway_failure, uint32),
        wrapper_field!(OutlierDetection, enforcing_consecutive_gateway_failure, uint32),
        scalar_field!(OutlierDetection, split_external_local_origin_errors, bool),
        message_field!(OutlierDetection, max_ejection_time, Duration, || &*DURATION_SCHEMA),
    ],
});

pub static CIRCUIT_BREAKERS_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.cluster.v3.CircuitBreakers",
    fields: vec![
        unsupported_field!(
            CircuitBreakers,
            thresholds,
            "repeated envoy.config.cluster.v3.CircuitBreakers.Thresholds"
        ),
        unsupported_field!(
            CircuitBreakers,
            per_host_thresholds,
            "repeated envoy.config.cluster.v3.CircuitBreakers.Thresholds"
        ),
    ],
});

pub static LOAD_ASSIGNMENT_POLICY_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.endpoint.v3.ClusterLoadAssignment.Policy",
    fields: vec![
        unsupported_field!(
            cluster_load_assignment::Policy,
            drop_overloads,
            "repeated envoy.config.endpoint.v3.ClusterLoadAssignment.Policy.DropOverload"
        ),
        wrapper_field!(cluster_load_assignment::Policy, overprovisioning_factor, uint32),
        message_field!(
            cluster_load_assignment::Policy,
            endpoint_stale_after,
            Duration,
            || &*DURATION_SCHEMA
        ),
    ],
});

pub static CLUSTER_LOAD_ASSIGNMENT_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.endpoint.v3.ClusterLoadAssignment",
    fields: vec![
        scalar_field!(ClusterLoadAssignment, cluster_name, string),
        unsupported_field!(
            ClusterLoadAssignment,
            endpoints,
            "repeated envoy.config.endpoint.v3.LocalityLbEndpoints"
        ),
        unsupported_field!(
            ClusterLoadAssignment,
            named_endpoints,
            "map<string, envoy.config.endpoint.v3.Endpoint>"
        ),
        message_field!(
            ClusterLoadAssignment,
            policy,
            cluster_load_assignment::Policy,
            || &*LOAD_ASSIGNMENT_POLICY_SCHEMA
        ),
    ],
});

pub static CLUSTER_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.cluster.v3.Cluster",
    fields: vec![
        scalar_field!(Cluster, name, string),
        scalar_field!(Cluster, alt_stat_name, string),
        message_field!(Cluster, connect_timeout, Duration, || &*DURATION_SCHEMA),
        wrapper_field!(Cluster, per_connection_buffer_limit_bytes, uint32),
        enum_field!(
            Cluster,
            lb_policy,
            cluster::LbPolicy,
            "envoy.config.cluster.v3.Cluster.LbPolicy"
        ),
        enum_field!(
            Cluster,
            dns_lookup_family,
            cluster::DnsLookupFamily,
            "envoy.config.cluster.v3.Cluster.DnsLookupFamily"
        ),
        message_field!(Cluster, dns_refresh_rate, Duration, || &*DURATION_SCHEMA),
        scalar_field!(Cluster, respect_dns_ttl, bool),
        message_field!(Cluster, outlier_detection, OutlierDetection, || {
            &*OUTLIER_DETECTION_SCHEMA
        }),
        message_field!(Cluster, circuit_breakers, CircuitBreakers, || {
            &*CIRCUIT_BREAKERS_SCHEMA
        }),
        message_field!(
            Cluster,
            upstream_connection_options,
            UpstreamConnectionOptions,
            || &*UPSTREAM_CONNECTION_OPTIONS_SCHEMA
        ),
        message_field!(Cluster, cleanup_interval, Duration, || &*DURATION_SCHEMA),
        message_field!(Cluster, load_assignment, ClusterLoadAssignment, || {
            &*CLUSTER_LOAD_ASSIGNMENT_SCHEMA
        }),
        scalar_field!(Cluster, ignore_health_on_host_removal, bool),
        scalar_field!(Cluster, connection_pool_per_downstream_connection, bool),
        scalar_field!(Cluster, track_timeout_budgets, bool),
        unsupported_field!(Cluster, health_checks, "repeated envoy.config.core.v3.HealthCheck"),
        unsupported_field!(Cluster, filters, "repeated envoy.config.cluster.v3.Filter"),
        unsupported_field!(
            Cluster,
            transport_socket_matches,
            "repeated envoy.config.cluster.v3.Cluster.TransportSocketMatch"
        ),
        unsupported_field!(
            Cluster,
            typed_extension_protocol_options,
            "map<string, google.protobuf.Any>"
        ),
        unsupported_field!(Cluster, metadata, "envoy.config.core.v3.Metadata"),
    ],
});

pub static ROUTE_CONFIGURATION_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.route.v3.RouteConfiguration",
    fields: vec![
        scalar_field!(RouteConfiguration, name, string),
        unsupported_field!(
            RouteConfiguration,
            virtual_hosts,
            "repeated envoy.config.route.v3.VirtualHost"
        ),
        string_list_field!(RouteConfiguration, internal_only_headers),
        string_list_field!(RouteConfiguration, response_headers_to_remove),
        string_list_field!(RouteConfiguration, request_headers_to_remove),
        scalar_field!(RouteConfiguration, most_specific_header_mutations_wins, bool),
        wrapper_field!(RouteConfiguration, validate_clusters, bool),
        wrapper_field!(RouteConfiguration, max_direct_response_body_size_bytes, uint32),
        scalar_field!(RouteConfiguration, ignore_port_in_host_matching, bool),
        unsupported_field!(
            RouteConfiguration,
            response_headers_to_add,
            "repeated envoy.config.core.v3.HeaderValueOption"
        ),
        unsupported_field!(
            RouteConfiguration,
            request_headers_to_add,
            "repeated envoy.config.core.v3.HeaderValueOption"
        ),
    ],
});

pub static LISTENER_SCHEMA: Lazy<MessageSchema> = Lazy::new(|| MessageSchema {
    type_name: "envoy.config.listener.v3.Listener",
    fields: vec![
        scalar_field!(Listener, name, string),
        scalar_field!(Listener, stat_prefix, string),
        wrapper_field!(Listener, per_connection_buffer_limit_bytes, uint32),
        enum_field!(
            Listener,
            traffic_direction,
            TrafficDirection,
            "envoy.config.core.v3.TrafficDirection"
        ),
        wrapper_field!(Listener, enable_reuse_port, bool),
        wrapper_field!(Listener, transparent, bool),
        wrapper_field!(Listener, freebind, bool),
        scalar_field!(Listener, continue_on_listener_filters_timeout, bool),
        message_field!(Listener, listener_filters_timeout, Duration, || &*DURATION_SCHEMA),
        wrapper_field!(Listener, tcp_backlog_size, uint32),
        scalar_field!(Listener, ignore_global_conn_limit, bool),
        unsupported_field!(Listener, address, "envoy.config.core.v3.Address"),
        unsupported_field!(
            Listener,
            filter_chains,
            "repeated envoy.config.listener.v3.FilterChain"
        ),
        unsupported_field!(Listener, default_filter_chain, "envoy.config.listener.v3.FilterChain"),
        unsupported_field!(
            Listener,
            listener_filters,
            "repeated envoy.config.listener.v3.ListenerFilter"
        ),
        unsupported_field!(Listener, metadata, "envoy.config.core.v3.Metadata"),
    ],
});

impl Patchable for Cluster {
    fn schema() -> &'static MessageSchema {
        &CLUSTER_SCHEMA
    }
}

impl Patchable for RouteConfiguration {
    fn schema() -> &'static MessageSchema {
        &ROUTE_CONFIGURATION_SCHEMA
    }
}

impl Patchable for Listener {
    fn schema() -> &'static MessageSchema {
        &LISTENER_SCHEMA
    }
}

impl Patchable for ClusterLoadAssignment {
    fn schema() -> &'static MessageSchema {
        &CLUSTER_LOAD_ASSIGNMENT_SCHEMA
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_lookup_and_order() {
        let schema = Cluster::schema();
        assert_eq!(schema.type_name, "envoy.config.cluster.v3.Cluster");
        assert_eq!(schema.fields[0].name, "name");
        assert!(schema.field("outlier_detection").is_some());
        assert!(schema.field("does_not_exist").is_none());
    }

    #[test]
    fn test_scalar_accessor_sets_and_clears() {
        let schema = Cluster::schema();
        let spec = schema.field("alt_stat_name").unwrap();
        let FieldAccessor::Scalar { set, clear, kind } = &spec.accessor else {
            panic!("expected scalar accessor");
        };
        assert_eq!(*kind, ScalarKind::String);

        let mut cluster = Cluster::default();
        assert!(set(&mut cluster, ScalarValue::Str("alt".to_string())));
        assert_eq!(cluster.alt_stat_name, "alt");
        assert!(clear(&mut cluster));
        assert!(cluster.alt_stat_name.is_empty());
        // Wrong scalar variant is refused, not coerced here.
        assert!(!set(&mut cluster, ScalarValue::U32(1)));
    }

    #[test]
    fn test_message_accessor_initializes_on_demand() {
        let schema = Cluster::schema();
        let spec = schema.field("outlier_detection").unwrap();
        let FieldAccessor::Message { get_mut, clear, .. } = &spec.accessor else {
            panic!("expected message accessor");
        };

        let mut cluster = Cluster::default();
        assert!(get_mut(&mut cluster, false).is_none());
        assert!(get_mut(&mut cluster, true).is_some());
        assert!(cluster.outlier_detection.is_some());
        assert!(clear(&mut cluster));
        assert!(cluster.outlier_detection.is_none());
    }

    #[test]
    fn test_enum_accessor_resolves_names() {
        let schema = Cluster::schema();
        let spec = schema.field("lb_policy").unwrap();
        let FieldAccessor::Enum { from_name, valid, set, .. } = &spec.accessor else {
            panic!("expected enum accessor");
        };
        let ordinal = from_name("LEAST_REQUEST").unwrap();
        assert!(valid(ordinal));
        assert!(from_name("NOT_A_POLICY").is_none());
        assert!(!valid(999));

        let mut cluster = Cluster::default();
        assert!(set(&mut cluster, ordinal));
        assert_eq!(cluster.lb_policy, cluster::LbPolicy::LeastRequest as i32);
    }
}
