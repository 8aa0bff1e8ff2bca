use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use stream_sync::{StoreError, Trace};
use thiserror::Error;

use crate::envelope;

/// Failures that end a request with status 500. Both carry the stages that
/// completed before the failure.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Malformed request: {reason}")]
    Malformed { reason: String, trace: Trace },

    #[error("Store error: {source}")]
    Store {
        #[source]
        source: StoreError,
        trace: Trace,
    },
}

impl ApiError {
    pub fn store(source: StoreError, trace: &Trace) -> Self {
        ApiError::Store {
            source,
            trace: trace.clone(),
        }
    }

    fn trace(&self) -> &Trace {
        match self {
            ApiError::Malformed { trace, .. } | ApiError::Store { trace, .. } => trace,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "Request failed");
        envelope(StatusCode::INTERNAL_SERVER_ERROR, &self.to_string(), self.trace(), None)
    }
}
