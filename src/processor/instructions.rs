//! Directive decoding.
//!
//! # Responsibilities
//! - Locate the `instructions` header in an ext_proc header set
//! - Parse its value as a JSON mutation directive
//!
//! # Design Decisions
//! - Header name match is case-insensitive; the last matching header wins
//! - Unknown JSON fields are ignored, `null` fields read as empty
//! - Never touches the input header set

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::HeaderValue;
use envoy_types::pb::envoy::service::ext_proc::v3::HttpHeaders;
use serde::{Deserialize, Deserializer};

/// Name of the header carrying the JSON directive.
pub const DIRECTIVE_HEADER: &str = "instructions";

/// Error raised when a directive header is present but malformed.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("directive header is not a valid instruction object: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded header mutation directive.
///
/// ```json
/// {"addHeaders": {"X-Foo": "bar"}, "removeHeaders": ["X-Bar"]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instructions {
    /// Headers to set, keyed by name. Ordered so the built mutation is deterministic.
    #[serde(deserialize_with = "null_as_default")]
    pub add_headers: BTreeMap<String, String>,

    /// Header names to remove, in the order given.
    #[serde(deserialize_with = "null_as_default")]
    pub remove_headers: Vec<String>,
}

impl Instructions {
    /// Parse a directive from the raw header value.
    pub fn from_slice(raw: &[u8]) -> Result<Self, DecodeError> {
        let parsed: Option<Instructions> = serde_json::from_slice(raw)?;
        Ok(parsed.unwrap_or_default())
    }

    /// True when the directive asks for no change at all.
    pub fn is_empty(&self) -> bool {
        self.add_headers.is_empty() && self.remove_headers.is_empty()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Find the directive in `headers` and decode it.
///
/// Returns `Ok(None)` when no directive header is present, which is the
/// common case.
pub fn decode(headers: &HttpHeaders) -> Result<Option<Instructions>, DecodeError> {
    let directive = headers
        .headers
        .as_ref()
        .and_then(|map| {
            map.headers
                .iter()
                .rev()
                .find(|h| h.key.eq_ignore_ascii_case(DIRECTIVE_HEADER))
        });

    let Some(header) = directive else {
        return Ok(None);
    };

    match Instructions::from_slice(header_bytes(header)) {
        Ok(instructions) => {
            tracing::debug!(
                add = instructions.add_headers.len(),
                remove = instructions.remove_headers.len(),
                "Decoded header directive"
            );
            Ok(Some(instructions))
        }
        Err(e) => {
            tracing::error!(error = %e, "Error unmarshalling instructions");
            Err(e)
        }
    }
}

/// Envoy sends `raw_value`; older builds only fill `value`.
fn header_bytes(header: &HeaderValue) -> &[u8] {
    if header.raw_value.is_empty() {
        header.value.as_bytes()
    } else {
        &header.raw_value
    }
}
