//! End-to-end extension runs over a compiled snapshot: property-override
//! patching, privilege enforcement, and anchored filter insertion across
//! several extensions in sequence.

use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::HttpFilter;

use meshplane::errors::{Error, Result};
use meshplane::extensions::extender::BasicExtender;
use meshplane::extensions::{
    helpers, make_extension, Extension, ExtensionConfig, Payload, RuntimeConfig,
};
use meshplane::ir::ProxyState;
use meshplane::xds::{IndexedResources, Resource, ResourceCompiler, ResourceKind};
use serde_json::json;

fn compiled_snapshot() -> IndexedResources {
    let state: ProxyState = serde_json::from_str(
        r#"{
            "clusters": {
                "local_app": {"group": {"endpointGroup": {"static": {}}}},
                "db.default.dc1.internal": {"group": {"endpointGroup": {"dynamic": {}}}}
            },
            "endpoints": {
                "db.default.dc1.internal": {
                    "endpoints": [{"host": "10.0.0.1", "port": 5432, "health": "healthy"}]
                }
            },
            "routes": {
                "inbound-route": {"virtualHosts": [{"name": "local", "routeRules": [
                    {"match": {}, "destination": {"cluster": {"name": "local_app"}}}
                ]}]}
            },
            "listeners": [
                {
                    "name": "public_listener:0.0.0.0:20000",
                    "direction": "inbound",
                    "bindAddress": {"hostPort": {"host": "0.0.0.0", "port": 20000}},
                    "routers": [{
                        "destination": {"l7": {
                            "name": "inbound-route",
                            "statPrefix": "public_listener",
                            "staticRoute": true
                        }}
                    }]
                },
                {
                    "name": "db:127.0.0.1:9191",
                    "direction": "outbound",
                    "bindAddress": {"hostPort": {"host": "127.0.0.1", "port": 9191}},
                    "routers": [{
                        "destination": {"l4": {
                            "name": "db.default.dc1.internal",
                            "statPrefix": "upstream.db"
                        }}
                    }]
                }
            ]
        }"#,
    )
    .unwrap();
    let compiled = ResourceCompiler::new(&state).compile();
    assert!(compiled.errors.is_empty(), "compile errors: {:?}", compiled.errors);
    compiled.resources
}

fn property_override_config(arguments: serde_json::Value) -> RuntimeConfig {
    RuntimeConfig {
        extension: ExtensionConfig {
            name: "builtin/property-override".to_string(),
            arguments,
            required: false,
        },
        ..Default::default()
    }
}

fn max_ejection_args(value: u32) -> serde_json::Value {
    json!({
        "patches": [{
            "resourceFilter": {"resourceType": "cluster", "trafficDirection": "outbound"},
            "op": "add",
            "path": "/outlier_detection/max_ejection_percent",
            "value": value,
        }]
    })
}

#[test]
fn test_property_override_patches_outbound_clusters_only() {
    let mut resources = compiled_snapshot();
    let config = property_override_config(max_ejection_args(42));
    let extension = make_extension(&config.extension).unwrap();
    let mut extender = BasicExtender::new(extension);
    extender.extend(&config, &mut resources).unwrap();

    let db = resources
        .get(ResourceKind::Cluster, "db.default.dc1.internal")
        .and_then(Resource::as_cluster)
        .unwrap();
    let od = db.outlier_detection.as_ref().unwrap();
    assert_eq!(od.max_ejection_percent.as_ref().unwrap().value, 42);

    // local_app is inbound, so the outbound filter skips it.
    let local = resources
        .get(ResourceKind::Cluster, "local_app")
        .and_then(Resource::as_cluster)
        .unwrap();
    assert!(local.outlier_detection.is_none());
}

#[test]
fn test_upstream_sourced_run_is_rejected_before_patching() {
    let mut resources = compiled_snapshot();
    let mut config = property_override_config(max_ejection_args(42));
    config.is_sourced_from_upstream = true;

    let extension = make_extension(&config.extension).unwrap();
    let mut extender = BasicExtender::new(extension);
    let err = extender.extend(&config, &mut resources).unwrap_err();
    assert!(matches!(err, Error::Privilege(_)), "got: {err}");

    let db = resources
        .get(ResourceKind::Cluster, "db.default.dc1.internal")
        .and_then(Resource::as_cluster)
        .unwrap();
    assert!(db.outlier_detection.is_none(), "graph must stay untouched");
}

#[test]
fn test_invalid_patch_arguments_rejected_at_construction() {
    let config = property_override_config(json!({
        "patches": [{
            "resourceFilter": {"resourceType": "cluster", "trafficDirection": "outbound"},
            "op": "add",
            "path": "/no_such_field",
            "value": 1,
        }]
    }));
    let err = make_extension(&config.extension).err().unwrap();
    assert!(err.to_string().contains("no match for field 'no_such_field'"));
}

/// Inserts one named HTTP filter at a fixed anchor.
struct InsertFilter {
    filter_name: String,
    options: helpers::InsertOptions,
}

impl Extension for InsertFilter {
    fn can_apply(&self, _config: &RuntimeConfig) -> bool {
        true
    }

    fn patch_listener(
        &mut self,
        payload: Payload<'_, envoy_types::pb::envoy::config::listener::v3::Listener>,
    ) -> Result<(envoy_types::pb::envoy::config::listener::v3::Listener, bool)> {
        let mut listener = payload.message;
        if helpers::get_http_connection_manager(
            listener.filter_chains.first().map(|c| c.filters.as_slice()).unwrap_or(&[]),
        )
        .is_none()
        {
            return Ok((listener, false));
        }
        let filter = HttpFilter { name: self.filter_name.clone(), ..Default::default() };
        helpers::insert_http_filter(&mut listener, filter, &self.options)?;
        Ok((listener, true))
    }
}

fn run_insert(
    resources: &mut IndexedResources,
    filter_name: &str,
    location: helpers::InsertLocation,
    anchor: &str,
) -> Result<()> {
    let config = RuntimeConfig {
        extension: ExtensionConfig {
            name: "builtin/property-override".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut extender = BasicExtender::new(InsertFilter {
        filter_name: filter_name.to_string(),
        options: helpers::InsertOptions::new(location, anchor),
    });
    extender.extend(&config, resources)
}

#[test]
fn test_sequential_extensions_anchor_against_latest_filter_list() {
    let mut resources = compiled_snapshot();

    // Each extension sees the filter list as left by the one before it.
    run_insert(&mut resources, "test.a", helpers::InsertLocation::First, "").unwrap();
    run_insert(
        &mut resources,
        "test.b",
        helpers::InsertLocation::AfterFirstMatch,
        "test.a",
    )
    .unwrap();
    run_insert(
        &mut resources,
        "test.c",
        helpers::InsertLocation::BeforeLastMatch,
        meshplane::xds::HTTP_ROUTER_FILTER_NAME,
    )
    .unwrap();

    let listener = resources
        .get(ResourceKind::Listener, "public_listener:0.0.0.0:20000")
        .and_then(Resource::as_listener)
        .unwrap();
    let (hcm, _) =
        helpers::get_http_connection_manager(&listener.filter_chains[0].filters).unwrap();
    let names: Vec<&str> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();

    assert_eq!(names[0], "test.a");
    assert_eq!(names[1], "test.b");
    assert_eq!(names[names.len() - 1], meshplane::xds::HTTP_ROUTER_FILTER_NAME);
    assert_eq!(names[names.len() - 2], "test.c");
}

#[test]
fn test_missing_anchor_names_location_and_filter() {
    let mut resources = compiled_snapshot();
    let err = run_insert(
        &mut resources,
        "test.x",
        helpers::InsertLocation::AfterFirstMatch,
        "does.not.exist",
    )
    .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("AfterFirstMatch"), "got: {message}");
    assert!(message.contains("does.not.exist"), "got: {message}");
}
