//! `grpc.health.v1.Health` responder.

use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::Health;
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};

/// Stateless health responder: always `SERVING`, no watch support.
pub struct HealthService {
    span: tracing::Span,
}

impl HealthService {
    pub fn new(span: tracing::Span) -> Self {
        Self { span }
    }
}

#[async_trait::async_trait]
impl Health for HealthService {
    type WatchStream = tokio_stream::Empty<Result<HealthCheckResponse, Status>>;

    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        tracing::debug!(
            parent: &self.span,
            service = %request.get_ref().service,
            "Handling health check request"
        );
        Ok(Response::new(HealthCheckResponse {
            status: ServingStatus::Serving as i32,
        }))
    }

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        Err(Status::unimplemented("watch is not implemented"))
    }
}
