//! # Meshplane
//!
//! Meshplane translates a protocol-agnostic proxy configuration model into a
//! consistent graph of Envoy xDS resources (listeners, routes, clusters,
//! endpoints), lets pluggable extensions rewrite that graph under strict
//! ordering and privilege invariants, and validates the referential
//! completeness of the result.
//!
//! ## Core Components
//!
//! - **IR** ([`ir`]): the read-only `ProxyState` input model.
//! - **Compiler** ([`xds`]): cluster/endpoint, listener/filter-chain and
//!   route builders orchestrated into a typed [`xds::IndexedResources`].
//! - **Extension framework** ([`extensions`]): the extension contract, the
//!   Basic/List/Upstream driving strategies, a generic JSON-Patch-style
//!   struct patcher over schema-described protobuf messages, and the builtin
//!   `property-override` and `validate` extensions.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use meshplane::ir::ProxyState;
//! use meshplane::xds::ResourceCompiler;
//!
//! let state: ProxyState = serde_json::from_str("{}").unwrap();
//! let compiled = ResourceCompiler::new(&state).compile();
//! for err in &compiled.errors {
//!     eprintln!("failed resource: {err}");
//! }
//! let _index = compiled.resources;
//! ```

pub mod config;
pub mod errors;
pub mod extensions;
pub mod ir;
pub mod observability;
pub mod xds;

// Re-export commonly used types and traits
pub use errors::{Error, ErrorAccumulator, Result};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
