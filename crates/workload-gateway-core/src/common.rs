//! Shared protocol bindings, domain types and the RPC error type.
//!
//! - [`proto`] - generated Workload API and Envoy SDS bindings.
//! - [`types`] - selectors, SVIDs, bundles and workload updates exchanged
//!   between the endpoint services and the identity manager.
//! - [`error`] - the [`Error`] enum mapped onto `tonic::Status`.

pub mod error;
pub mod types;

pub use error::{Error, Result};

/// Generated gRPC bindings.
///
/// The module tree mirrors the proto packages so cross-package references
/// emitted by `prost` (`super::super::v3::DiscoveryRequest`) resolve.
pub mod proto {
    /// SPIFFE Workload API (`SpiffeWorkloadAPI`). The proto file declares no
    /// package, so `prost` writes it to `_.rs`.
    pub mod workload {
        include!(concat!(env!("OUT_DIR"), "/_.rs"));
    }

    pub mod envoy {
        pub mod service {
            pub mod discovery {
                /// `envoy.service.discovery.v2.SecretDiscoveryService`.
                pub mod v2 {
                    tonic::include_proto!("envoy.service.discovery.v2");
                }

                /// Discovery request/response messages shared by both SDS
                /// versions.
                pub mod v3 {
                    tonic::include_proto!("envoy.service.discovery.v3");
                }
            }

            pub mod secret {
                /// `envoy.service.secret.v3.SecretDiscoveryService`.
                pub mod v3 {
                    tonic::include_proto!("envoy.service.secret.v3");
                }
            }
        }

        pub mod extensions {
            pub mod transport_sockets {
                pub mod tls {
                    /// TLS secret payloads carried in discovery responses.
                    pub mod v3 {
                        tonic::include_proto!("envoy.extensions.transport_sockets.tls.v3");
                    }
                }
            }
        }
    }
}
