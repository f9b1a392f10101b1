//! The resource compiler: drives the per-kind builders over a `ProxyState`
//! and collects the result into one [`IndexedResources`] snapshot.
//!
//! Failures are isolated per IR resource. A cluster that cannot build is
//! reported and skipped; every other resource still compiles, so one bad
//! entry never blanks the whole snapshot.

use tracing::{debug, warn};

use crate::errors::Error;
use crate::ir;
use crate::xds::{cluster, listener, IndexedResources, ResourceKind};

/// Compiles one `ProxyState` into xDS resources.
pub struct ResourceCompiler<'a> {
    state: &'a ir::ProxyState,
}

/// Output of a compile pass: the resource index plus the build errors for
/// resources that were skipped.
#[derive(Debug, Default)]
pub struct CompiledResources {
    pub resources: IndexedResources,
    pub errors: Vec<Error>,
}

impl<'a> ResourceCompiler<'a> {
    pub fn new(state: &'a ir::ProxyState) -> Self {
        Self { state }
    }

    pub fn compile(self) -> CompiledResources {
        let mut resources = IndexedResources::new();
        let mut errors = Vec::new();

        for (name, ir_cluster) in &self.state.clusters {
            match cluster::build_cluster_resources(self.state, name, ir_cluster, &mut resources) {
                Ok(()) => debug!(cluster = %name, "compiled cluster"),
                Err(err) => {
                    warn!(cluster = %name, error = %err, "skipping cluster");
                    errors.push(err);
                }
            }
        }

        for ir_listener in &self.state.listeners {
            match listener::build_listener_resources(self.state, ir_listener, &mut resources) {
                Ok(()) => debug!(listener = %ir_listener.name, "compiled listener"),
                Err(err) => {
                    warn!(listener = %ir_listener.name, error = %err, "skipping listener");
                    errors.push(err);
                }
            }
        }

        debug!(
            clusters = resources.len_of_kind(ResourceKind::Cluster),
            endpoints = resources.len_of_kind(ResourceKind::Endpoints),
            listeners = resources.len_of_kind(ResourceKind::Listener),
            routes = resources.len_of_kind(ResourceKind::Route),
            errors = errors.len(),
            "compile finished"
        );
        CompiledResources { resources, errors }
    }
}
