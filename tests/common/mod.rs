//! Shared utilities for integration testing.

use std::net::SocketAddr;

use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_client::ExternalProcessorClient, processing_request, HttpHeaders,
    ProcessingRequest,
};
use ext_proc_header_manipulation::config::ServerConfig;
use ext_proc_header_manipulation::lifecycle::Shutdown;
use ext_proc_header_manipulation::server::{GrpcServer, ServerError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::transport::Channel;

/// A server running on an ephemeral local port.
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start the gRPC server with `configure` applied to the default config.
#[allow(dead_code)]
pub async fn start_server_with(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = ServerConfig::default();
    config.listener.bind_address = addr.to_string();
    configure(&mut config);

    let shutdown = Shutdown::new();
    let server = GrpcServer::new(config);
    let handle = tokio::spawn(server.run(listener, shutdown.clone()));

    TestServer { addr, shutdown, handle }
}

pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

#[allow(dead_code)]
pub async fn processor_client(server: &TestServer) -> ExternalProcessorClient<Channel> {
    ExternalProcessorClient::new(
        tonic::transport::Endpoint::new(server.url()).unwrap().connect().await.unwrap(),
    )
}

#[allow(dead_code)]
pub fn header_set(pairs: &[(&str, &str)]) -> HttpHeaders {
    HttpHeaders {
        headers: Some(HeaderMap {
            headers: pairs
                .iter()
                .map(|(k, v)| HeaderValue {
                    key: k.to_string(),
                    raw_value: v.as_bytes().to_vec(),
                    ..Default::default()
                })
                .collect(),
        }),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn event(request: processing_request::Request) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(request),
        ..Default::default()
    }
}
