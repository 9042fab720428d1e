//! Error taxonomy for the steering core
//!
//! Client-side failures (bad identifiers, malformed vectors, oversized
//! requests) are distinct variants so callers can map them to 4xx-style
//! responses. Everything the forward-pass engine or weight loading throws is
//! wrapped as [`SteerError::Engine`], which displays a generic message; the
//! detail is logged where the failure is observed.

use thiserror::Error;

use crate::decoder::DecoderId;

/// Errors surfaced to callers of the service.
#[derive(Debug, Error)]
pub enum SteerError {
    /// The decoder id is not present in the catalog.
    #[error("unknown decoder: {0}")]
    UnknownDecoder(String),

    /// A steering feature references a decoder or index that cannot be resolved.
    #[error("invalid feature: {0}")]
    InvalidFeature(String),

    /// A direction vector contains inf or NaN values.
    #[error("steering vector contains inf or nan values")]
    DegenerateVector,

    /// Normalization was requested for a zero-length direction.
    #[error("zero norm steering vector")]
    ZeroNorm,

    /// The request needs more simultaneously resident decoders than allowed.
    #[error("requested {requested} decoders, but at most {max} can be loaded at once")]
    CapacityExceeded { requested: usize, max: usize },

    /// Malformed request shape (type list, prompt length, feature/vector choice).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The service is shutting down and no longer admits requests.
    #[error("service is shutting down")]
    ShuttingDown,

    /// Opaque failure from the engine or a weight source.
    #[error("inference engine failure")]
    Engine(#[source] anyhow::Error),
}

impl SteerError {
    /// True for errors caused by caller input (never retried).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, SteerError::Engine(_) | SteerError::ShuttingDown)
    }

    pub(crate) fn unknown(id: &DecoderId) -> Self {
        SteerError::UnknownDecoder(id.to_string())
    }
}

impl From<anyhow::Error> for SteerError {
    fn from(err: anyhow::Error) -> Self {
        // Core errors that travelled through an anyhow-returning hook keep their kind.
        match err.downcast::<SteerError>() {
            Ok(inner) => inner,
            Err(err) => SteerError::Engine(err),
        }
    }
}

impl From<candle_core::Error> for SteerError {
    fn from(err: candle_core::Error) -> Self {
        SteerError::Engine(err.into())
    }
}

/// Result alias used throughout the core.
pub type SteerResult<T> = std::result::Result<T, SteerError>;
