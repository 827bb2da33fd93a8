//! Per-stream event loop.
//!
//! # Responsibilities
//! - Pull one `ProcessingRequest` at a time off the inbound stream
//! - Dispatch by event kind and build exactly one response per event
//! - Stop on peer half-close, cancellation, or transport failure
//!
//! # Lifecycle
//! ```text
//! loop:
//!     cancelled?           → Err(Cancelled), nothing sent
//!     recv → None          → Ok (peer half-closed)
//!     recv → Err(status)   → Err(Receive)
//!     recv → Some(event)   → dispatch → send
//!     send fails           → Err(Send)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_request, processing_response, HeadersResponse, HttpHeaders, ProcessingRequest,
    ProcessingResponse,
};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::Instrument;

use crate::observability::metrics;
use crate::processor::{instructions, mutation};

/// Sender half feeding the gRPC response stream.
pub type ResponseSender = mpsc::Sender<Result<ProcessingResponse, Status>>;

static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an ext_proc stream, used in log spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn new() -> Self {
        Self(STREAM_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Kind of a received processing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RequestHeaders,
    RequestBody,
    RequestTrailers,
    ResponseHeaders,
    ResponseBody,
    ResponseTrailers,
    /// No oneof variant this build understands.
    Unknown,
}

impl EventKind {
    pub fn of(request: &ProcessingRequest) -> Self {
        use processing_request::Request;
        match &request.request {
            Some(Request::RequestHeaders(_)) => Self::RequestHeaders,
            Some(Request::RequestBody(_)) => Self::RequestBody,
            Some(Request::RequestTrailers(_)) => Self::RequestTrailers,
            Some(Request::ResponseHeaders(_)) => Self::ResponseHeaders,
            Some(Request::ResponseBody(_)) => Self::ResponseBody,
            Some(Request::ResponseTrailers(_)) => Self::ResponseTrailers,
            None => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestHeaders => "request_headers",
            Self::RequestBody => "request_body",
            Self::RequestTrailers => "request_trailers",
            Self::ResponseHeaders => "response_headers",
            Self::ResponseBody => "response_body",
            Self::ResponseTrailers => "response_trailers",
            Self::Unknown => "unknown",
        }
    }
}

/// Why a stream stopped other than a clean half-close.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream cancelled")]
    Cancelled,

    #[error("cannot receive stream request: {0}")]
    Receive(#[source] Status),

    #[error("cannot send stream response")]
    Send,
}

impl StreamError {
    /// Metric label for the stream outcome.
    pub fn outcome(&self) -> &'static str {
        match self {
            StreamError::Cancelled => "cancelled",
            StreamError::Receive(_) => "receive_error",
            StreamError::Send => "send_error",
        }
    }
}

impl From<StreamError> for Status {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Cancelled => Status::cancelled(err.to_string()),
            StreamError::Receive(ref cause) => {
                Status::unknown(format!("cannot receive stream request: {}", cause.message()))
            }
            StreamError::Send => Status::unknown(err.to_string()),
        }
    }
}

/// Drives a single ext_proc stream.
pub struct StreamProcessor {
    id: StreamId,
    span: tracing::Span,
}

impl StreamProcessor {
    /// Create a processor logging under a child of `parent`.
    pub fn new(parent: &tracing::Span) -> Self {
        let id = StreamId::new();
        let span = tracing::debug_span!(parent: parent, "ext_proc_stream", stream = %id);
        Self { id, span }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Run the stream until the peer half-closes, the token is cancelled, or
    /// the transport fails.
    ///
    /// The token is also cancelled when the response half is dropped.
    pub async fn run<S>(
        &self,
        mut inbound: S,
        outbound: ResponseSender,
        cancel: CancellationToken,
    ) -> Result<(), StreamError>
    where
        S: Stream<Item = Result<ProcessingRequest, Status>> + Unpin,
    {
        async move {
            let mut sent: u64 = 0;
            loop {
                if cancel.is_cancelled() {
                    tracing::debug!(sent, "Context done");
                    return Err(StreamError::Cancelled);
                }

                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    _ = outbound.closed() => {
                        cancel.cancel();
                        None
                    }
                    item = inbound.next() => Some(item),
                };

                let request = match next {
                    None => {
                        tracing::debug!(sent, "Context done");
                        return Err(StreamError::Cancelled);
                    }
                    Some(None) => {
                        // Envoy half-closed the stream; nothing more to answer.
                        tracing::debug!(sent, "Stream closed by peer");
                        return Ok(());
                    }
                    Some(Some(Err(status))) => {
                        tracing::error!(error = %status, "Cannot receive stream request");
                        return Err(StreamError::Receive(status));
                    }
                    Some(Some(Ok(request))) => request,
                };

                let response = self.respond(request);

                tracing::debug!("Sending ProcessingResponse");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StreamError::Cancelled),
                    res = outbound.send(Ok(response)) => {
                        if res.is_err() {
                            tracing::error!("Send error: response stream closed");
                            return Err(StreamError::Send);
                        }
                    }
                }
                sent += 1;
            }
        }
        .instrument(self.span.clone())
        .await
    }

    /// Build the response for one event.
    pub fn respond(&self, request: ProcessingRequest) -> ProcessingResponse {
        use processing_request::Request;
        use processing_response::Response;

        let kind = EventKind::of(&request);
        metrics::record_event(kind);

        let response = match request.request {
            Some(Request::RequestHeaders(headers)) => {
                tracing::debug!(headers = ?headers.headers, "Got RequestHeaders");
                Some(Response::RequestHeaders(self.process_headers(&headers, kind)))
            }
            Some(Request::ResponseHeaders(headers)) => {
                tracing::debug!(headers = ?headers.headers, "Got ResponseHeaders");
                Some(Response::ResponseHeaders(self.process_headers(&headers, kind)))
            }
            Some(Request::RequestBody(_))
            | Some(Request::RequestTrailers(_))
            | Some(Request::ResponseBody(_))
            | Some(Request::ResponseTrailers(_)) => {
                tracing::debug!(kind = kind.as_str(), "Got event (passing through)");
                None
            }
            None => {
                tracing::warn!("Unknown request type, passing through");
                None
            }
        };

        ProcessingResponse {
            response,
            ..Default::default()
        }
    }

    /// Decode the directive and build the headers response.
    ///
    /// A missing directive still gets a `CommonResponse` envelope; a malformed
    /// one fails open with a bare response.
    fn process_headers(&self, headers: &HttpHeaders, kind: EventKind) -> HeadersResponse {
        let instructions = match instructions::decode(headers) {
            Ok(instructions) => Some(instructions.unwrap_or_default()),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed directive");
                metrics::record_directive_error();
                None
            }
        };

        let response = mutation::headers_response(instructions.as_ref());
        if mutation::mutation_of(&response).is_some() {
            metrics::record_header_mutation(kind);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::instructions::tests::header_set;
    use envoy_types::pb::envoy::service::ext_proc::v3::{HttpBody, HttpTrailers};
    use processing_request::Request;
    use processing_response::Response;

    fn event(request: Request) -> ProcessingRequest {
        ProcessingRequest {
            request: Some(request),
            ..Default::default()
        }
    }

    fn processor() -> StreamProcessor {
        StreamProcessor::new(&tracing::Span::none())
    }

    async fn run_events(
        events: Vec<Result<ProcessingRequest, Status>>,
    ) -> (Result<(), StreamError>, Vec<ProcessingResponse>) {
        let (tx, mut rx) = mpsc::channel(16);
        let result = processor()
            .run(tokio_stream::iter(events), tx, CancellationToken::new())
            .await;

        let mut responses = Vec::new();
        while let Ok(item) = rx.try_recv() {
            responses.push(item.expect("ok response"));
        }
        (result, responses)
    }

    fn headers_of(response: &ProcessingResponse) -> &HeadersResponse {
        match &response.response {
            Some(Response::RequestHeaders(h)) | Some(Response::ResponseHeaders(h)) => h,
            other => panic!("expected a headers response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_headers_without_directive_yield_empty_responses_in_order() {
        let (result, responses) = run_events(vec![
            Ok(event(Request::RequestHeaders(header_set(&[(":path", "/")])))),
            Ok(event(Request::ResponseHeaders(header_set(&[(":status", "200")])))),
        ])
        .await;

        assert!(result.is_ok());
        assert_eq!(responses.len(), 2);
        assert!(matches!(responses[0].response, Some(Response::RequestHeaders(_))));
        assert!(matches!(responses[1].response, Some(Response::ResponseHeaders(_))));
        for resp in &responses {
            let headers = headers_of(resp);
            assert!(headers.response.is_some());
            assert!(mutation::mutation_of(headers).is_none());
        }
    }

    #[tokio::test]
    async fn test_request_headers_directive_is_applied() {
        let directive = r#"{"addHeaders":{"X-Trace":"1"},"removeHeaders":["Cookie"]}"#;
        let headers = header_set(&[(":path", "/"), ("instructions", directive)]);
        let (result, responses) =
            run_events(vec![Ok(event(Request::RequestHeaders(headers)))]).await;

        assert!(result.is_ok());
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0].response, Some(Response::RequestHeaders(_))));

        let mutation = mutation::mutation_of(headers_of(&responses[0])).expect("mutation");
        assert_eq!(mutation.set_headers.len(), 1);
        let header = mutation.set_headers[0].header.as_ref().unwrap();
        assert_eq!(header.key, "X-Trace");
        assert_eq!(header.raw_value, b"1");
        assert_eq!(mutation.remove_headers, vec!["Cookie"]);
    }

    #[tokio::test]
    async fn test_response_headers_directive_is_applied() {
        let headers = header_set(&[("Instructions", r#"{"removeHeaders":["server"]}"#)]);
        let (_, responses) = run_events(vec![Ok(event(Request::ResponseHeaders(headers)))]).await;

        assert!(matches!(responses[0].response, Some(Response::ResponseHeaders(_))));
        let mutation = mutation::mutation_of(headers_of(&responses[0])).expect("mutation");
        assert_eq!(mutation.remove_headers, vec!["server"]);
    }

    #[tokio::test]
    async fn test_malformed_directive_fails_open() {
        let (result, responses) = run_events(vec![
            Ok(event(Request::RequestHeaders(header_set(&[("instructions", "{not json")])))),
            Ok(event(Request::ResponseHeaders(header_set(&[])))),
        ])
        .await;

        assert!(result.is_ok());
        assert_eq!(responses.len(), 2);
        assert_eq!(
            responses[0].response,
            Some(Response::RequestHeaders(HeadersResponse::default()))
        );
        assert!(headers_of(&responses[1]).response.is_some());
    }

    #[tokio::test]
    async fn test_body_and_trailers_pass_through() {
        let (result, responses) = run_events(vec![
            Ok(event(Request::RequestBody(HttpBody::default()))),
            Ok(event(Request::RequestTrailers(HttpTrailers::default()))),
            Ok(event(Request::ResponseBody(HttpBody::default()))),
            Ok(event(Request::ResponseTrailers(HttpTrailers::default()))),
        ])
        .await;

        assert!(result.is_ok());
        assert_eq!(responses.len(), 4);
        for resp in responses {
            assert_eq!(resp, ProcessingResponse::default());
        }
    }

    #[tokio::test]
    async fn test_unknown_event_kind_passes_through() {
        let (result, responses) = run_events(vec![Ok(ProcessingRequest::default())]).await;
        assert!(result.is_ok());
        assert_eq!(responses, vec![ProcessingResponse::default()]);
    }

    #[tokio::test]
    async fn test_receive_error_terminates_stream() {
        let (result, responses) = run_events(vec![
            Ok(event(Request::RequestBody(HttpBody::default()))),
            Err(Status::internal("connection reset")),
            Ok(event(Request::RequestBody(HttpBody::default()))),
        ])
        .await;

        assert_eq!(responses.len(), 1);
        let err = result.unwrap_err();
        assert!(matches!(err, StreamError::Receive(_)));

        let status: Status = err.into();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert!(status.message().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_event_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events = vec![Ok(event(Request::RequestBody(HttpBody::default())))];
        let result = processor().run(tokio_stream::iter(events), tx, cancel).await;

        assert!(matches!(result, Err(StreamError::Cancelled)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_receive() {
        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let inbound = tokio_stream::pending::<Result<ProcessingRequest, Status>>();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { processor().run(inbound, tx, cancel).await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_response_half_cancels_stream() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let cancel = CancellationToken::new();
        let inbound = tokio_stream::pending::<Result<ProcessingRequest, Status>>();

        let result = processor().run(inbound, tx, cancel.clone()).await;
        assert!(matches!(result, Err(StreamError::Cancelled)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_failure_terminates_stream() {
        let (tx, rx) = mpsc::channel(4);
        let mut rx = Some(rx);
        // Drop the receiver as the first event is pulled, after the
        // closed-channel check has already passed.
        let inbound = tokio_stream::iter(vec![Ok(event(Request::RequestBody(HttpBody::default())))])
            .map(move |item| {
                drop(rx.take());
                item
            });

        let err = processor()
            .run(inbound, tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Send));
        assert_eq!(err.outcome(), "send_error");

        let status = Status::from(err);
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert!(status.message().contains("cannot send stream response"));
    }

    #[tokio::test]
    async fn test_clean_end_after_n_events() {
        let events: Vec<_> = (0..5)
            .map(|_| Ok(event(Request::RequestHeaders(header_set(&[])))))
            .collect();
        let (result, responses) = run_events(events).await;
        assert!(result.is_ok());
        assert_eq!(responses.len(), 5);
    }

    #[test]
    fn test_event_kind_labels() {
        assert_eq!(EventKind::of(&ProcessingRequest::default()), EventKind::Unknown);
        assert_eq!(
            EventKind::of(&event(Request::ResponseTrailers(HttpTrailers::default()))).as_str(),
            "response_trailers"
        );
    }

    #[test]
    fn test_stream_ids_are_unique() {
        let a = StreamId::new();
        let b = StreamId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("stream-"));
    }
}
