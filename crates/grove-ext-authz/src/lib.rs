//! External authorization service for the Grove portal.
//!
//! Implements the Envoy ext_authz `Check` contract on behalf of the GUARD
//! proxy. Every inbound API request is authorized against an in-memory
//! snapshot of portal applications (rebuilt periodically from the portal
//! database) and an in-memory set of rate-limited accounts (rebuilt
//! periodically from the usage warehouse). The request path performs only
//! in-memory lookups; all external I/O happens in background refresh tasks.

pub mod api_key;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod ratelimit;
pub mod response;
pub mod server;
pub mod store;

/// Generated Envoy ext_authz v3 types (see `proto/ext_authz.proto`).
pub mod proto {
    tonic::include_proto!("envoy.service.auth.v3");

    /// File descriptor set for gRPC server reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("ext_authz_descriptor");
}
