use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Errors raised while decoding, dispatching or encoding an admission review.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The envelope is malformed: bad JSON, wrong apiVersion/kind, invalid base64.
    #[error("invalid admission review: {0}")]
    Protocol(String),

    /// A field required to treat the payload as an admission request is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// The review carried no `request` at all.
    #[error("no request in review payload")]
    MissingRequest,

    /// A rule callback failed while the request was being dispatched.
    #[error("rule #{index} failed: {source:#}")]
    RuleCallback {
        index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// An error occurred while serializing the response.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Protocol(_) | Error::MissingField(_) | Error::MissingRequest => {
                StatusCode::BAD_REQUEST
            }
            Error::RuleCallback { .. } | Error::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = if status.is_server_error() {
            format!("Internal Error!\n{}", self)
        } else {
            self.to_string()
        };
        (status, body).into_response()
    }
}
