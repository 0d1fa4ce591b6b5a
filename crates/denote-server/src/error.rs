use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Everything that can go wrong inside the secret exchange.
///
/// Callers outside the process never see the variant: every error renders as
/// the same `404 Not Found`, so a wrong key, a consumed secret and a secret
/// that never existed cannot be told apart.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("malformed input: {0}")]
    MalformedInput(&'static str),

    #[error("rate limited")]
    RateLimited,

    #[error("handler deadline exceeded")]
    Timeout,

    #[error("identifier collision persisted after {0} attempts")]
    Conflict(usize),

    #[error("cipher init: {0}")]
    CipherInit(String),

    #[error("persistence: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("random source: {0}")]
    RandomSource(#[from] rand::Error),

    #[error("blocking task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True for faults of the process itself rather than of the request.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Conflict(_)
                | Error::CipherInit(_)
                | Error::Persistence(_)
                | Error::RandomSource(_)
                | Error::Task(_)
        )
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if self.is_internal() {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "404 page not found\n",
        )
            .into_response()
    }
}
