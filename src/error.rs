//! Tagged error taxonomy for the service core.
//!
//! Every fallible service operation returns [`Error`]. Each kind carries
//! enough context for a useful message; the HTTP status is attached at the
//! boundary via [`Error::status`], never at the call site. Per-URL fetch
//! failures are a separate, non-fatal type ([`crate::fetch::FetchError`])
//! because partial success is the normal mode there.

use axum::http::StatusCode;

/// Service-level error kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller supplied a filter the compiler rejected. Always 400.
    #[error("invalid filter: {0}")]
    FilterValidation(String),

    /// Embedding output did not match the configured dimension. 422.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    VectorDimMismatch { expected: usize, got: usize },

    /// The embedding backend (or another upstream model service) failed. 502.
    #[error("upstream service error: {0}")]
    Upstream(String),

    /// Worker referenced a task id that does not exist. 404.
    #[error("task {0} not found")]
    TaskNotFound(i64),

    /// Worker submitted a malformed chunk id. 400.
    #[error("invalid chunk id: {0}")]
    ChunkIdInvalid(String),

    /// The blob store rejected or failed a read/write. 502.
    #[error("blob store unavailable: {0}")]
    BlobUnavailable(String),

    /// A requested resource does not exist. 404.
    #[error("{0}")]
    NotFound(String),

    /// Generic caller error (empty query, bad body shape). 400.
    #[error("{0}")]
    BadRequest(String),

    /// Request body exceeded `BODY_LIMIT_BYTES`. 413.
    #[error("request body too large")]
    PayloadTooLarge,

    /// Empty or whitespace-only query text. 422.
    #[error("query must not be empty")]
    EmptyQuery,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// HTTP status for this error kind (boundary mapping, spec'd per kind).
    pub fn status(&self) -> StatusCode {
        match self {
            Error::FilterValidation(_) | Error::ChunkIdInvalid(_) | Error::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::VectorDimMismatch { .. } | Error::EmptyQuery => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::Upstream(_) | Error::BlobUnavailable(_) => StatusCode::BAD_GATEWAY,
            Error::TaskNotFound(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Database(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            Error::FilterValidation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::VectorDimMismatch {
                expected: 768,
                got: 1536
            }
            .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(Error::Upstream("embed".into()).status(), StatusCode::BAD_GATEWAY);
        assert_eq!(Error::TaskNotFound(7).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::ChunkIdInvalid("abc".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::BlobUnavailable("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
