use std::fmt;

use pockettts_base::TensorError;

/// The error taxonomy for the whole inference pipeline.
///
/// Every fallible operation in this crate returns one of these kinds; none of
/// them are retried internally and none are swallowed — they propagate to the
/// caller unchanged via `?`.
#[derive(Debug)]
pub enum CoreError {
    /// Container bytes malformed: safetensors header, truncated data, bad JSON.
    Format(String),
    /// Required tensor absent, shape mismatch, incompatible voice-embedding dim.
    Schema { detail: String },
    /// Unsupported dtype, unsupported tensor rank, tokenizer feature missing.
    Unsupported(String),
    /// Shape arithmetic overflow.
    Overflow(String),
    /// Not-loaded, closed runtime, no tokens.
    Runtime(String),
    /// Caller cancelled.
    Cancelled,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Format(msg) => write!(f, "format error: {msg}"),
            CoreError::Schema { detail } => write!(f, "schema error: {detail}"),
            CoreError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            CoreError::Overflow(msg) => write!(f, "overflow error: {msg}"),
            CoreError::Runtime(msg) => write!(f, "runtime error: {msg}"),
            CoreError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<TensorError> for CoreError {
    fn from(err: TensorError) -> Self {
        match err {
            TensorError::ShapeOverflow => CoreError::Overflow(err.to_string()),
            TensorError::ShapeMismatch { .. }
            | TensorError::RankMismatch { .. }
            | TensorError::IndexOutOfBounds { .. } => CoreError::Schema {
                detail: err.to_string(),
            },
        }
    }
}

/// Formats a short diagnostic list of available keys, capped per spec (§4.1
/// lookup contract: "enumerate up to eight available names for diagnostics").
pub(crate) fn available_keys_hint(keys: &[String]) -> String {
    let shown: Vec<&str> = keys.iter().take(8).map(String::as_str).collect();
    if keys.len() > shown.len() {
        format!("{} (and {} more)", shown.join(", "), keys.len() - shown.len())
    } else {
        shown.join(", ")
    }
}
