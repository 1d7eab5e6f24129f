#![cfg(unix)]

use bytes::Bytes;
use hyper_util::rt::TokioIo;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint as ChannelEndpoint, Uri};
use tonic::Code;
use tonic::codegen::http::Request;
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};
use tower::{Service, service_fn};
use workload_gateway_core::{
    proto::envoy::{
        extensions::transport_sockets::tls::v3::Secret,
        service::{
            discovery::v3::DiscoveryRequest,
            secret::v3::secret_discovery_service_client::SecretDiscoveryServiceClient,
        },
    },
    proto::workload::{X509svidRequest, spiffe_workload_api_client::SpiffeWorkloadApiClient},
    types::{Bundle, Selector, TrustDomain, X509Svid},
};
use workload_gateway_server::server::{
    address::BindAddr,
    attestor::Attestor,
    endpoint::{Config, Endpoint},
    error::Error,
    manager::{Entry, StaticManager},
    peer::Caller,
    registry::HealthService,
    service::health,
};

/// Attests every caller with process credentials as `test:local`.
struct LocalAttestor;

#[tonic::async_trait]
impl Attestor for LocalAttestor {
    async fn attest(&self, caller: &Caller) -> workload_gateway_core::Result<Vec<Selector>> {
        Ok(if caller.is_local_process() {
            vec![Selector::new("test", "local")]
        } else {
            Vec::new()
        })
    }
}

fn manager() -> Arc<StaticManager> {
    let td = TrustDomain::parse("example.org").unwrap();
    let mut bundle = Bundle::new(td);
    bundle.x509_authorities = vec![Bytes::from_static(b"root-ca")];
    let manager = StaticManager::new(bundle);
    manager.set_entries(vec![Entry {
        selectors: vec![Selector::new("test", "local")],
        svid: X509Svid {
            spiffe_id: "spiffe://example.org/web".into(),
            cert_chain: vec![Bytes::from_static(b"leaf")],
            private_key: Bytes::from_static(b"key"),
            hint: "internal".into(),
        },
    }]);
    Arc::new(manager)
}

fn config(addr: BindAddr) -> Config {
    Config::new(
        addr,
        manager(),
        Arc::new(LocalAttestor),
        TrustDomain::parse("example.org").unwrap(),
    )
}

struct Running {
    cancel: CancellationToken,
    addr: BindAddr,
    handle: JoinHandle<(Endpoint, Result<(), Error>)>,
}

impl Running {
    async fn stop(self) -> (Endpoint, Result<(), Error>) {
        self.cancel.cancel();
        self.handle.await.unwrap()
    }
}

async fn start(config: Config) -> Running {
    let (tx, mut rx) = mpsc::channel(1);
    let mut endpoint = Endpoint::new(config).with_listening_hook(tx);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let result = endpoint.run(token).await;
        (endpoint, result)
    });
    let addr = rx.recv().await.expect("listening hook fired");
    Running {
        cancel,
        addr,
        handle,
    }
}

async fn connect_uds(path: &Path) -> Channel {
    let path = path.to_path_buf();
    ChannelEndpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .unwrap()
}

fn socket_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("test.sock")
}

fn with_security_header<T>(message: T) -> tonic::Request<T> {
    let mut req = tonic::Request::new(message);
    req.metadata_mut()
        .insert("workload.spiffe.io", "true".parse().unwrap());
    req
}

#[tokio::test]
async fn unknown_network_is_rejected() {
    let mut endpoint = Endpoint::new(config("udp://127.0.0.1:53".parse().unwrap()));
    let err = endpoint.run(CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "unknown network udp");
}

#[tokio::test]
async fn uds_serves_health_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    std::fs::write(&path, b"stale").unwrap();

    let running = start(config(BindAddr::Unix(path.clone()))).await;
    assert_eq!(running.addr, BindAddr::Unix(path.clone()));

    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o777);

    {
        let mut client = HealthClient::new(connect_uds(&path).await);
        let resp = client
            .check(HealthCheckRequest::default())
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status, i32::from(ServingStatus::Serving));
    }

    let (_, result) = running.stop().await;
    result.unwrap();
    assert!(!path.exists());
    assert!(UnixStream::connect(&path).await.is_err());
}

#[tokio::test]
async fn tcp_resolves_port_before_hook() {
    let running = start(config("127.0.0.1:0".parse().unwrap())).await;
    let BindAddr::Tcp(addr) = running.addr.clone() else {
        panic!("expected a TCP address, got {:?}", running.addr);
    };
    assert_ne!(addr.port(), 0);
    TcpStream::connect(addr).await.unwrap();

    let (endpoint, result) = running.stop().await;
    result.unwrap();
    assert_eq!(endpoint.addr(), &BindAddr::Tcp(addr));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn tcp_bind_conflict_names_stage() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    let mut endpoint = Endpoint::new(config(BindAddr::Tcp(addr)));
    let err = endpoint.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::CreateTcpListener(_)));
    assert!(err.to_string().starts_with("create TCP listener: "));
}

#[tokio::test]
async fn workload_api_requires_security_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let running = start(config(BindAddr::Unix(path.clone()))).await;

    {
        let mut client = SpiffeWorkloadApiClient::new(connect_uds(&path).await);

        let status = client
            .fetch_x509svid(X509svidRequest::default())
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "security header missing from request");

        let req = with_security_header(X509svidRequest::default());
        let mut stream = client.fetch_x509svid(req).await.unwrap().into_inner();
        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.svids.len(), 1);
        assert_eq!(first.svids[0].spiffe_id, "spiffe://example.org/web");
        assert_eq!(first.svids[0].x509_svid, b"leaf");
    }

    let (_, result) = running.stop().await;
    result.unwrap();
}

#[tokio::test]
async fn sds_v3_fetches_secrets_for_attested_caller() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let running = start(config(BindAddr::Unix(path.clone()))).await;

    {
        use prost::Message;

        let mut client = SecretDiscoveryServiceClient::new(connect_uds(&path).await);
        let resp = client
            .fetch_secrets(DiscoveryRequest {
                resource_names: vec!["default".into(), "ROOTCA".into()],
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        let names: Vec<_> = resp
            .resources
            .iter()
            .map(|any| Secret::decode(any.value.as_slice()).unwrap().name)
            .collect();
        assert_eq!(names, ["ROOTCA", "default"]);
    }

    let (_, result) = running.stop().await;
    result.unwrap();
}

#[tokio::test]
async fn health_slot_can_be_overridden() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let mut config = config(BindAddr::Unix(path.clone()));
    config.new_health = Some(Box::new(|_: health::Config| {
        HealthService::from_service(service_fn(|_req: Request<tonic::body::Body>| async {
            Ok::<_, std::convert::Infallible>(
                tonic::Status::unimplemented("stubbed").into_http::<tonic::body::Body>(),
            )
        }))
    }));
    let running = start(config).await;

    {
        let mut client = HealthClient::new(connect_uds(&path).await);
        let status = client
            .check(HealthCheckRequest::default())
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
        assert_eq!(status.message(), "stubbed");
    }

    let (_, result) = running.stop().await;
    result.unwrap();
}

#[tokio::test]
async fn cancel_ends_open_streams_and_releases_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let running = start(config(BindAddr::Unix(path.clone()))).await;

    let mut client = SpiffeWorkloadApiClient::new(connect_uds(&path).await);
    let mut stream = client
        .fetch_x509svid(with_security_header(X509svidRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert!(stream.message().await.unwrap().is_some());

    let (_, result) = tokio::time::timeout(Duration::from_secs(5), running.stop())
        .await
        .expect("run returns while a stream is open");
    result.unwrap();

    assert!(matches!(stream.message().await, Ok(None)));
    assert!(!path.exists());
    assert!(UnixStream::connect(&path).await.is_err());
}

#[tokio::test]
async fn in_flight_call_finishes_before_run_returns() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let entered = Arc::new(Notify::new());

    let mut config = config(BindAddr::Unix(path.clone()));
    let signal = entered.clone();
    config.new_health = Some(Box::new(move |c: health::Config| {
        let inner = health::HealthServer::new(health::Handler::new(c));
        HealthService::from_service(service_fn(move |req: Request<tonic::body::Body>| {
            let mut inner = inner.clone();
            let signal = signal.clone();
            async move {
                signal.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                inner.call(req).await
            }
        }))
    }));
    let running = start(config).await;

    let mut client = HealthClient::new(connect_uds(&path).await);
    let call = tokio::spawn(async move { client.check(HealthCheckRequest::default()).await });
    entered.notified().await;

    let (_, result) = running.stop().await;
    result.unwrap();

    let resp = call.await.unwrap().unwrap().into_inner();
    assert_eq!(resp.status, i32::from(ServingStatus::Serving));
    assert!(!path.exists());
}

#[tokio::test]
async fn dropping_run_releases_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = socket_path(&dir);
    let (tx, mut rx) = mpsc::channel(1);
    let mut endpoint = Endpoint::new(config(BindAddr::Unix(path.clone()))).with_listening_hook(tx);

    let run = endpoint.run(CancellationToken::new());
    assert!(tokio::time::timeout(Duration::from_millis(100), run).await.is_err());
    assert!(rx.recv().await.is_some());

    for _ in 0..100 {
        if !path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!path.exists());
    assert!(UnixStream::connect(&path).await.is_err());
}

