//! gRPC server setup.
//!
//! # Responsibilities
//! - Register the ext_proc and health services
//! - Apply listener settings (TLS, HTTP/2 stream limit)
//! - Serve on a bound listener until shutdown

use std::path::Path;

use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server as ext_proc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic_health::pb::health_server::HealthServer;

use crate::config::ServerConfig;
use crate::health::HealthService;
use crate::lifecycle::Shutdown;
use crate::processor::ProcessingService;
use crate::server::tls::load_tls_config;

/// Error type for server startup and transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// gRPC server hosting the external processor.
pub struct GrpcServer {
    config: ServerConfig,
}

impl GrpcServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run the server, accepting connections on the given listener until
    /// `shutdown` is triggered.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        let span = tracing::info_span!("ext_proc", listener = %addr);

        let mut builder =
            Server::builder().max_concurrent_streams(self.config.listener.max_concurrent_streams);

        if let Some(tls) = &self.config.listener.tls {
            let tls_config =
                load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
            builder = builder.tls_config(tls_config)?;
            tracing::info!(cert = %tls.cert_path, "TLS enabled");
        }

        let processing = ProcessingService::new(
            self.config.processor.clone(),
            shutdown.subscribe(),
            span.clone(),
        );
        let health = self
            .config
            .health
            .enabled
            .then(|| HealthServer::new(HealthService::new(span.clone())));

        tracing::info!(
            address = %addr,
            health = self.config.health.enabled,
            "gRPC server starting"
        );

        let server_shutdown = shutdown.subscribe();
        builder
            .add_optional_service(health)
            .add_service(ext_proc::ExternalProcessorServer::new(processing))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                server_shutdown.cancelled().await;
            })
            .await?;

        tracing::info!("gRPC server stopped");
        Ok(())
    }
}
