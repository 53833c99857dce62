//! Shared fixtures: a throwaway PKI, a running frontend pair and small
//! clients for both edges.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flowgate::auth::CallRecorder;
use flowgate::config::{Config, PrincipalConfig};
use flowgate::frontend::{Frontend, RunningFrontend};
use flowgate::mtls::{CaParams, CertGenerator, GeneratedCert, LeafCertParams, TlsConfigProvider};
use flowgate::pipeline::{AuthPipeline, PluggableHooks};
use flowgate::rpc::{ClientCodec, RpcClient};
use flowgate::service::{WorkflowService, default_registry};
use reqwest::Method;
use reqwest::header::HeaderMap;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::codec::Framed;

/// CN of the client certificate every fixture issues.
pub const CLIENT_CN: &str = "client.tls-sample.temporal.io";
/// Organization of the client certificate.
pub const CLIENT_ORG: &str = "Temporal Technologies";
/// OU of the client certificate.
pub const CLIENT_OU: &str = "Engineering";
/// Name the server certificate is issued for.
pub const SERVER_NAME: &str = "localhost";

/// CA, server and client certificates written to a temp dir.
pub struct TestPki {
    pub dir: TempDir,
    pub ca: GeneratedCert,
}

impl TestPki {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertGenerator::init_ca(&CaParams {
            cn: "flowgate Test CA",
            validity_days: 30,
        })
        .unwrap();
        let server = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: SERVER_NAME,
                sans: vec![SERVER_NAME.to_string(), "127.0.0.1".to_string()],
                validity_days: 30,
                ..LeafCertParams::default()
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        let client = CertGenerator::issue_leaf(
            &LeafCertParams {
                cn: CLIENT_CN,
                organization: Some(CLIENT_ORG),
                ou: Some(CLIENT_OU),
                validity_days: 30,
                ..LeafCertParams::default()
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();

        CertGenerator::write_to_dir(&ca, dir.path(), "ca").unwrap();
        CertGenerator::write_to_dir(&server, dir.path(), "server").unwrap();
        CertGenerator::write_to_dir(&client, dir.path(), "client").unwrap();
        Self { dir, ca }
    }

    fn path(&self, file: &str) -> String {
        self.dir.path().join(file).display().to_string()
    }

    /// Config pointing at this PKI, listening on ephemeral ports.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.frontend.rpc.address = "127.0.0.1:0".to_string();
        config.frontend.http.address = "127.0.0.1:0".to_string();
        config.tls.server.cert_file = self.path("server.crt");
        config.tls.server.key_file = self.path("server.key");
        config.tls.client_ca = self.path("ca.crt");
        config.tls.client.cert_file = Some(self.path("client.crt"));
        config.tls.client.key_file = Some(self.path("client.key"));
        config.tls.client.root_ca = Some(self.path("ca.crt"));
        config.tls.client.server_name = SERVER_NAME.to_string();
        config
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Grant the fixture client `system` both system-wide and on `default`.
pub fn grant_client(config: &mut Config, system: flowgate::auth::Role) {
    config.auth.principals.push(PrincipalConfig {
        common_name: CLIENT_CN.to_string(),
        system,
        namespaces: std::collections::HashMap::from([("default".to_string(), system)]),
    });
}

/// A running frontend pair plus everything needed to talk to it.
pub struct TestServer {
    pub pki: TestPki,
    pub running: RunningFrontend,
    pub tls: Arc<TlsConfigProvider>,
    pub pipeline: Arc<AuthPipeline>,
    pub service: Arc<WorkflowService>,
}

impl TestServer {
    /// Start with the fixture config, adjusted by `configure`.
    pub async fn start(configure: impl FnOnce(&mut Config)) -> Self {
        Self::start_with(configure, None).await
    }

    /// Start with a [`CallRecorder`] installed as both observer hooks.
    pub async fn start_recording(
        configure: impl FnOnce(&mut Config),
        recorder: Arc<CallRecorder>,
    ) -> Self {
        Self::start_with(configure, Some(recorder)).await
    }

    async fn start_with(
        configure: impl FnOnce(&mut Config),
        recorder: Option<Arc<CallRecorder>>,
    ) -> Self {
        let pki = TestPki::generate();
        let mut config = pki.config();
        configure(&mut config);
        config.validate().unwrap();

        let tls = Arc::new(TlsConfigProvider::from_config(&config.tls).unwrap());
        let service = WorkflowService::with_namespaces(["default"]);
        let registry = Arc::new(default_registry(&service));
        let pipeline = Arc::new(
            AuthPipeline::from_config(&config, registry, PluggableHooks::default()).unwrap(),
        );
        if let Some(recorder) = recorder {
            recorder.install(pipeline.hooks()).unwrap();
        }

        let running = Frontend::new(config.frontend.clone(), Arc::clone(&tls), Arc::clone(&pipeline))
            .start()
            .await
            .unwrap();

        Self {
            pki,
            running,
            tls,
            pipeline,
            service,
        }
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.running.rpc_addr()
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.running.http_addr().unwrap()
    }

    /// RPC client presenting the fixture client certificate.
    pub async fn rpc_client(&self) -> RpcClient {
        RpcClient::connect(
            self.rpc_addr(),
            self.tls.server_name(),
            self.tls.client_config().unwrap(),
        )
        .await
        .unwrap()
    }

    /// RPC client presenting no certificate.
    pub async fn anonymous_rpc_client(&self) -> flowgate::Result<RpcClient> {
        RpcClient::connect(
            self.rpc_addr(),
            self.tls.server_name(),
            self.tls.anonymous_client_config(),
        )
        .await
    }

    /// Framed RPC connection for writing frames by hand.
    pub async fn raw_rpc(&self) -> Framed<TlsStream<TcpStream>, ClientCodec> {
        let mut config = (*self.tls.client_config().unwrap()).clone();
        config.alpn_protocols = vec![b"flowgate-rpc/1".to_vec()];
        let tcp = TcpStream::connect(self.rpc_addr()).await.unwrap();
        let tls = TlsConnector::from(Arc::new(config))
            .connect(ServerName::try_from(SERVER_NAME).unwrap(), tcp)
            .await
            .unwrap();
        Framed::new(tls, ClientCodec::new())
    }

    /// HTTPS request with the fixture client certificate.
    pub async fn https(&self, request: HttpRequest<'_>) -> reqwest::Result<HttpResponse> {
        let config = self.tls.client_config().unwrap();
        let client = https_client(self.http_addr(), &config);
        send(&client, &self.https_base(), request).await
    }

    /// HTTPS request without a client certificate.
    pub async fn anonymous_https(&self, request: HttpRequest<'_>) -> reqwest::Result<HttpResponse> {
        let client = https_client(self.http_addr(), &self.tls.anonymous_client_config());
        send(&client, &self.https_base(), request).await
    }

    /// Plain `http://` request to the gateway port.
    pub async fn plain_http(&self, request: HttpRequest<'_>) -> reqwest::Result<HttpResponse> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        send(&client, &format!("http://{}", self.http_addr()), request).await
    }

    fn https_base(&self) -> String {
        format!("https://{SERVER_NAME}:{}", self.http_addr().port())
    }

    pub async fn stop(self) {
        self.running.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest client over `config`, speaking HTTP/1.1 and resolving the
/// server name to `addr`.
pub fn https_client(addr: SocketAddr, config: &ClientConfig) -> reqwest::Client {
    let mut config = config.clone();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .resolve(SERVER_NAME, addr)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap()
}

/// Request description shared by the HTTPS and plain helpers.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub headers: Vec<(&'a str, String)>,
    pub body: Option<Value>,
}

impl<'a> HttpRequest<'a> {
    pub fn get(path: &'a str) -> Self {
        Self {
            method: Method::GET,
            path,
            ..Self::default()
        }
    }

    pub fn post(path: &'a str, body: Value) -> Self {
        Self {
            method: Method::POST,
            path,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// Buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

async fn send(
    client: &reqwest::Client,
    base: &str,
    request: HttpRequest<'_>,
) -> reqwest::Result<HttpResponse> {
    let mut builder = client.request(request.method, format!("{base}{}", request.path));
    for (name, value) in request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await?.to_vec();
    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}

/// Send raw bytes over plain TCP and read until the server closes.
pub async fn plaintext_request(addr: SocketAddr, request: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut tcp = TcpStream::connect(addr).await?;
    tcp.write_all(request).await?;
    let mut raw = Vec::new();
    tcp.read_to_end(&mut raw).await?;
    Ok(raw)
}
