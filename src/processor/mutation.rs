//! Header mutation building.
//!
//! Converts decoded [`Instructions`] into the ext_proc `HeadersResponse`
//! Envoy applies to the request or response headers.

use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    CommonResponse, HeaderMutation, HeadersResponse,
};

use crate::processor::instructions::Instructions;

/// Build the headers response for an optional directive.
///
/// - `None`: bare `HeadersResponse`, used when the directive failed to decode.
/// - Empty or missing directive: `CommonResponse` without a mutation.
/// - Otherwise: one set entry per `addHeaders` pair and `removeHeaders` verbatim.
pub fn headers_response(instructions: Option<&Instructions>) -> HeadersResponse {
    let Some(instructions) = instructions else {
        return HeadersResponse::default();
    };

    let mut common = CommonResponse::default();
    if !instructions.is_empty() {
        common.header_mutation = Some(header_mutation(instructions));
    }

    HeadersResponse {
        response: Some(common),
    }
}

/// Translate a directive into a `HeaderMutation`.
pub fn header_mutation(instructions: &Instructions) -> HeaderMutation {
    let set_headers = instructions
        .add_headers
        .iter()
        .map(|(key, value)| {
            tracing::info!(key = %key, value = %value, "Adding header");
            HeaderValueOption {
                header: Some(HeaderValue {
                    key: key.clone(),
                    raw_value: value.as_bytes().to_vec(),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    HeaderMutation {
        set_headers,
        remove_headers: instructions.remove_headers.clone(),
    }
}

/// The mutation carried by a headers response, if any.
pub fn mutation_of(response: &HeadersResponse) -> Option<&HeaderMutation> {
    response.response.as_ref()?.header_mutation.as_ref()
}
