//! gRPC binding for the ext_proc `ExternalProcessor` service.

use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessor;
use envoy_types::pb::envoy::service::ext_proc::v3::{ProcessingRequest, ProcessingResponse};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::config::ProcessorConfig;
use crate::observability::metrics;
use crate::processor::stream::{StreamError, StreamProcessor};

/// `ExternalProcessor` implementation spawning one [`StreamProcessor`] per call.
pub struct ProcessingService {
    config: ProcessorConfig,
    shutdown: CancellationToken,
    span: tracing::Span,
}

impl ProcessingService {
    /// `shutdown` is the parent of every per-stream cancellation token.
    pub fn new(config: ProcessorConfig, shutdown: CancellationToken, span: tracing::Span) -> Self {
        Self {
            config,
            shutdown,
            span,
        }
    }
}

#[async_trait::async_trait]
impl ExternalProcessor for ProcessingService {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.config.response_buffer);
        let cancel = self.shutdown.child_token();
        let processor = StreamProcessor::new(&self.span);

        tokio::spawn(async move {
            metrics::stream_opened();
            let result = processor.run(inbound, tx.clone(), cancel).await;
            metrics::stream_closed(result.as_ref().err().map_or("completed", StreamError::outcome));

            match result {
                Ok(()) => {}
                Err(StreamError::Send) => {
                    tracing::debug!(
                        stream = %processor.id(),
                        "Response stream gone, dropping stream"
                    );
                }
                Err(e) => {
                    if matches!(e, StreamError::Receive(_)) {
                        tracing::error!(stream = %processor.id(), error = %e, "Stream terminated");
                    } else {
                        tracing::debug!(stream = %processor.id(), "Stream cancelled");
                    }
                    // Best effort: never wait on a full buffer or a gone peer.
                    let _ = tx.try_send(Err(e.into()));
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
