//! End-to-end gateway tests over real TLS connections
//!
//! Each test starts the gateway on `127.0.0.1:0` with an in-process
//! backend, then talks to it the way real clients do:
//! - HTTP/1.1 JSON calls
//! - HTTP/2 native gRPC
//! - the encrypted tunnel

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use lightgate::backend::{Backend, BackendCall, BackendError, BackendRegistry};
use lightgate::config::Config;
use lightgate::gateway::Gateway;
use lightgate::mux::grpc;
use lightgate::permissions::PermissionRegistry;
use lightgate::tls::DEFAULT_ORGANIZATION;
use lightgate::tunnel::TunnelClient;
use rustls::pki_types::ServerName;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use x509_parser::prelude::{FromDer, X509Certificate};

const PASSWORD: &str = "correct horse battery";
const PAIRING: &str = "tunnel pairing secret";

/// Answers `<backend>:<payload>`.
struct Echo;

#[async_trait]
impl Backend for Echo {
    async fn invoke(&self, call: BackendCall) -> Result<Bytes, BackendError> {
        let mut out = call.grant.backend.clone().into_bytes();
        out.push(b':');
        out.extend_from_slice(&call.payload);
        Ok(out.into())
    }
}

struct Running {
    addr: SocketAddr,
    cert_pem: String,
    macaroon: String,
    stop: Option<oneshot::Sender<()>>,
    served: tokio::task::JoinHandle<lightgate::Result<()>>,
    _dir: TempDir,
}

impl Running {
    /// Resolve the shutdown future and wait for `serve` to return.
    async fn shut_down(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.served).await.unwrap().unwrap();
    }
}

async fn start() -> Running {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.tls.cert_path = dir.path().join("tls.cert");
    config.tls.key_path = dir.path().join("tls.key");
    config.macaroons.root_key_path = dir.path().join("root_keys.json");
    config.ui.password = Some(PASSWORD.into());
    config.tunnel.enabled = true;
    config.tunnel.pairing_secret = Some(PAIRING.into());

    let mut backends = BackendRegistry::new();
    for id in PermissionRegistry::with_extra(&[]).unwrap().backends() {
        backends.insert(id, Arc::new(Echo));
    }

    let gateway = Gateway::with_backends(&config, backends).unwrap();
    let cert_pem = gateway.identity().cert_pem.clone();
    let caps = ["info:read".parse().unwrap()].into_iter().collect();
    let macaroon = gateway
        .credentials()
        .bake_scoped("node", &caps, &Default::default())
        .unwrap()
        .macaroon()
        .unwrap()
        .encode();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let served = tokio::spawn(gateway.serve(listener, async {
        let _ = stopped.await;
    }));

    Running {
        addr,
        cert_pem,
        macaroon,
        stop: Some(stop),
        served,
        _dir: dir,
    }
}

async fn connect(gw: &Running, alpn: &[&[u8]]) -> TlsStream<TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in lightgate::tls::load_certs(&gw.cert_pem).unwrap() {
        roots.add(cert).unwrap();
    }
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    let tcp = TcpStream::connect(gw.addr).await.unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

async fn http1(
    gw: &Running,
    request: Request<Full<Bytes>>,
) -> (StatusCode, hyper::HeaderMap, Bytes) {
    let tls = connect(gw, &[b"http/1.1"]).await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body)
}

fn json_post(path: &str) -> hyper::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("host", "localhost")
        .header("content-type", "application/json")
}

// ─────────────────────────────────────────────────────────────────────────────
// TLS identity
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn presented_certificate_carries_the_autogenerated_issuer() {
    // GIVEN: a freshly started gateway
    let gw = start().await;

    // WHEN: a client completes the TLS handshake
    let tls = connect(&gw, &[]).await;

    // THEN: the peer certificate's issuer organisation is the default
    let certs = tls.get_ref().1.peer_certificates().unwrap();
    let (_, cert) = X509Certificate::from_der(certs[0].as_ref()).unwrap();
    let orgs: Vec<_> = cert
        .issuer()
        .iter_organization()
        .map(|o| o.as_str().unwrap().to_string())
        .collect();
    assert_eq!(orgs, vec![DEFAULT_ORGANIZATION.to_string()]);
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON over HTTP/1.1
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn json_call_with_macaroon_is_forwarded() {
    let gw = start().await;
    let request = json_post("/v1/getinfo")
        .header("grpc-metadata-macaroon", &gw.macaroon)
        .body(Full::new(Bytes::from_static(b"{}")))
        .unwrap();

    let (status, _, body) = http1(&gw, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"node:{}");
}

#[tokio::test]
async fn json_rejections_look_the_same() {
    let gw = start().await;

    // no credential
    let anonymous = json_post("/v1/getinfo")
        .body(Full::new(Bytes::new()))
        .unwrap();
    // valid macaroon without the channel capability
    let missing_cap = json_post("/v1/channels")
        .header("grpc-metadata-macaroon", &gw.macaroon)
        .body(Full::new(Bytes::new()))
        .unwrap();

    let (s1, _, b1) = http1(&gw, anonymous).await;
    let (s2, _, b2) = http1(&gw, missing_cap).await;

    assert_eq!(s1, StatusCode::UNAUTHORIZED);
    assert_eq!(s1, s2);
    assert_eq!(b1, b2);
}

#[tokio::test]
async fn ui_login_session_reaches_session_endpoints_only() {
    let gw = start().await;

    // GIVEN: a session cookie from /auth/login
    let login = json_post("/auth/login")
        .body(Full::new(Bytes::from(format!(r#"{{"password":"{PASSWORD}"}}"#))))
        .unwrap();
    let (status, headers, _) = http1(&gw, login).await;
    assert_eq!(status, StatusCode::OK);
    let cookie = headers
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();

    // WHEN / THEN: a session endpoint is forwarded
    let info = json_post("/v1/getinfo")
        .header("cookie", &cookie)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, body) = http1(&gw, info).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"node:{}");

    // WHEN / THEN: macaroon baking is closed to sessions
    let bake = json_post("/v1/macaroon")
        .header("cookie", &cookie)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, _, _) = http1(&gw, bake).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unmatched_path_serves_the_ui_index() {
    let gw = start().await;
    let request = Request::builder()
        .uri("/channels/overview")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let (status, headers, body) = http1(&gw, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(
        headers["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );
    assert!(String::from_utf8_lossy(&body).contains("<html"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Native gRPC over HTTP/2
// ─────────────────────────────────────────────────────────────────────────────

async fn grpc_call(gw: &Running, method: &str, macaroon: Option<&str>) -> (String, Bytes) {
    let tls = connect(gw, &[b"h2"]).await;
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .unwrap();
    tokio::spawn(conn);

    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("https://localhost{method}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    if let Some(m) = macaroon {
        builder = builder.header("macaroon", m);
    }
    let request = builder
        .body(Full::new(grpc::encode_message(b"ping")))
        .unwrap();

    let response = sender.send_request(request).await.unwrap();
    let headers = response.headers().clone();
    let collected = response.into_body().collect().await.unwrap();
    let trailers = collected.trailers().cloned().unwrap_or_default();
    let status = trailers
        .get("grpc-status")
        .or_else(|| headers.get("grpc-status"))
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default();
    (status, collected.to_bytes())
}

#[tokio::test]
async fn native_grpc_call_round_trips_with_trailers() {
    let gw = start().await;

    let (status, body) = grpc_call(&gw, "/noderpc.Node/GetInfo", Some(&gw.macaroon)).await;

    assert_eq!(status, "0");
    assert_eq!(grpc::decode_unary(&body).unwrap(), Bytes::from_static(b"node:ping"));
}

#[tokio::test]
async fn native_grpc_rejection_is_unauthenticated() {
    let gw = start().await;

    let (anonymous, body) = grpc_call(&gw, "/noderpc.Node/GetInfo", None).await;
    let (wrong_backend, _) =
        grpc_call(&gw, "/swaprpc.SwapClient/ListSwaps", Some(&gw.macaroon)).await;

    assert_eq!(anonymous, "16");
    assert_eq!(wrong_backend, "16");
    assert!(body.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Tunnel
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tunnel_shares_the_gateway_port() {
    let gw = start().await;
    let tls = connect(&gw, &[]).await;

    let mut client = TunnelClient::connect(tls, PAIRING).await.unwrap();
    let reply = client
        .call(
            "/noderpc.Node/GetInfo",
            BTreeMap::new(),
            Bytes::from_static(b"hi"),
        )
        .await
        .unwrap();

    assert!(reply.is_ok());
    assert_eq!(&reply.payload[..], b"node:hi");

    let closed = client
        .call("/gatewayrpc.Sessions/ListSessions", BTreeMap::new(), Bytes::new())
        .await
        .unwrap();
    assert_eq!(closed.status, 16);
}

#[tokio::test]
async fn tunnel_with_wrong_pairing_secret_is_closed() {
    let gw = start().await;
    let tls = connect(&gw, &[]).await;

    let result = TunnelClient::connect(tls, "guessed secret").await;

    assert!(matches!(
        result,
        Err(lightgate::Error::TunnelHandshake(_))
    ));
}

#[tokio::test]
async fn shutdown_ends_open_tunnel_sessions() {
    // GIVEN: a working tunnel session
    let mut gw = start().await;
    let tls = connect(&gw, &[]).await;
    let mut client = TunnelClient::connect(tls, PAIRING).await.unwrap();
    let reply = client
        .call("/noderpc.Node/GetInfo", BTreeMap::new(), Bytes::new())
        .await
        .unwrap();
    assert!(reply.is_ok());

    // WHEN: the gateway shuts down
    gw.shut_down().await;

    // THEN: the session went down with it
    let after = client
        .call("/noderpc.Node/GetInfo", BTreeMap::new(), Bytes::new())
        .await;
    assert!(after.is_err());
}
