//! Compile a proxy state and validate its upstreams end to end.

use meshplane::extensions::validate::validate_upstream;
use meshplane::ir::ProxyState;
use meshplane::xds::{IndexedResources, ResourceCompiler};

fn state_json(endpoint_health: &str) -> String {
    format!(
        r#"{{
            "clusters": {{
                "local_app": {{"group": {{"endpointGroup": {{"static": {{}}}}}}}},
                "db.default.dc1.internal": {{"group": {{"endpointGroup": {{"dynamic": {{}}}}}}}}
            }},
            "endpoints": {{
                "db.default.dc1.internal": {{
                    "endpoints": [{{"host": "10.0.0.1", "port": 5432, "health": "{endpoint_health}"}}]
                }}
            }},
            "listeners": [
                {{
                    "name": "db:127.0.0.1:9191",
                    "direction": "outbound",
                    "bindAddress": {{"hostPort": {{"host": "127.0.0.1", "port": 9191}}}},
                    "routers": [{{
                        "destination": {{"l4": {{
                            "name": "db.default.dc1.internal",
                            "statPrefix": "upstream.db"
                        }}}}
                    }}]
                }}
            ]
        }}"#
    )
}

fn compile(json: &str) -> IndexedResources {
    let state: ProxyState = serde_json::from_str(json).unwrap();
    let compiled = ResourceCompiler::new(&state).compile();
    assert!(compiled.errors.is_empty(), "compile errors: {:?}", compiled.errors);
    compiled.resources
}

#[test]
fn test_validate_healthy_upstream_passes() {
    let mut resources = compile(&state_json("healthy"));
    let messages = validate_upstream("db", "db", None, &mut resources).unwrap();
    assert!(messages.success(), "findings: {:?}", messages.0);
    assert!(messages.0.iter().any(|m| m.message.contains("Listener")));
}

#[test]
fn test_validate_unhealthy_upstream_reports_cluster() {
    let mut resources = compile(&state_json("unhealthy"));
    let messages = validate_upstream("db", "db", None, &mut resources).unwrap();
    assert!(!messages.success());
    let failure = messages.0.iter().find(|m| !m.success).unwrap();
    assert_eq!(
        failure.message,
        "No healthy endpoints for cluster \"db.default.dc1.internal\""
    );
    assert!(!failure.possible_actions.is_empty());
}

#[test]
fn test_validate_missing_listener_fails_fast() {
    let mut resources = compile(&state_json("healthy"));
    let messages = validate_upstream("web", "web", None, &mut resources).unwrap();
    assert!(!messages.success());
    assert_eq!(messages.0.len(), 1);
    assert_eq!(messages.0[0].message, "No listener for upstream \"web\"");
}

fn rds_state_json(endpoint_health: &str) -> String {
    format!(
        r#"{{
            "clusters": {{
                "db-sni": {{"group": {{"endpointGroup": {{"dynamic": {{}}}}}}}}
            }},
            "endpoints": {{
                "db-sni": {{
                    "endpoints": [{{"host": "10.0.0.1", "port": 5432, "health": "{endpoint_health}"}}]
                }}
            }},
            "routes": {{
                "db": {{"virtualHosts": [{{"name": "db", "routeRules": [
                    {{"match": {{}}, "destination": {{"cluster": {{"name": "db-sni"}}}}}}
                ]}}]}}
            }},
            "listeners": [
                {{
                    "name": "db:127.0.0.1:9191",
                    "direction": "outbound",
                    "bindAddress": {{"hostPort": {{"host": "127.0.0.1", "port": 9191}}}},
                    "routers": [{{
                        "destination": {{"l7": {{
                            "name": "db",
                            "statPrefix": "upstream.db"
                        }}}}
                    }}]
                }}
            ]
        }}"#
    )
}

#[test]
fn test_validate_rds_route_to_healthy_cluster_passes() {
    let mut resources = compile(&rds_state_json("healthy"));
    let messages = validate_upstream("db", "db", None, &mut resources).unwrap();
    assert!(messages.success(), "findings: {:?}", messages.0);
    assert!(messages.0.iter().any(|m| m.message.contains("Route \"db\"")));
}

#[test]
fn test_validate_rds_route_to_unhealthy_cluster_fails() {
    let mut resources = compile(&rds_state_json("unhealthy"));
    let messages = validate_upstream("db", "db", None, &mut resources).unwrap();
    assert!(!messages.success());
    let failure = messages.0.iter().find(|m| !m.success).unwrap();
    assert_eq!(failure.message, "No healthy endpoints for cluster \"db-sni\"");
}

#[test]
fn test_validate_failover_upstream_needs_one_healthy_target() {
    let json = r#"{
        "clusters": {
            "db.default.dc1.internal": {
                "group": {"failoverGroup": {
                    "endpointGroups": [
                        {"name": "dc1", "dynamic": {}},
                        {"name": "dc2", "dynamic": {}}
                    ]
                }}
            }
        },
        "endpoints": {
            "failover-target~db.default.dc1.internal~dc1": {
                "endpoints": [{"host": "10.0.0.1", "port": 5432, "health": "unhealthy"}]
            },
            "failover-target~db.default.dc1.internal~dc2": {
                "endpoints": [{"host": "10.1.0.1", "port": 5432, "health": "healthy"}]
            }
        },
        "listeners": [
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
    }"#;
    let mut resources = compile(json);
    let messages = validate_upstream("db", "db", None, &mut resources).unwrap();
    assert!(messages.success(), "findings: {:?}", messages.0);

    let aggregate_checked = messages
        .0
        .iter()
        .any(|m| m.message.contains("aggregate cluster \"db.default.dc1.internal\""));
    assert!(aggregate_checked, "findings: {:?}", messages.0);
}
