/// Builds the gRPC client and server code for the Workload API and the Envoy
/// secret discovery services using `tonic-prost-build`.
///
/// # Files and Paths
///
/// - `proto/workload.proto` - the SPIFFE Workload API. It declares no proto
///   package, so its bindings are emitted into `_.rs`.
/// - `proto/envoy/service/discovery/v2/sds.proto` - SDS v2 service.
/// - `proto/envoy/service/secret/v3/sds.proto` - SDS v3 service.
/// - `proto/envoy/service/discovery/v3/discovery.proto` and
///   `proto/envoy/extensions/transport_sockets/tls/v3/secret.proto` - the
///   request, response and secret messages shared by both SDS versions.
///
/// Well-known types (`google.protobuf.Any`, `google.protobuf.Struct`) map to
/// `prost-types`.
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
fn main() {
    tonic_prost_build::configure()
        .compile_protos(
            &[
                "proto/workload.proto",
                "proto/envoy/service/discovery/v2/sds.proto",
                "proto/envoy/service/secret/v3/sds.proto",
                "proto/envoy/service/discovery/v3/discovery.proto",
                "proto/envoy/extensions/transport_sockets/tls/v3/secret.proto",
            ],
            &["proto"],
        )
        .unwrap();
}
