//! Conversion of `anyhow::Error` into the HTTP error envelope. All axum
//! handlers return `HttpResponseError`, which renders
//! `{"status":"error","errorType":"<kind>","error":"<message>"}` with the
//! status code derived from the attached `ErrorMetadata`.

use axum::response::{
    IntoResponse,
    Response,
};
use errors::ErrorMetadataAnyhowExt;
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status: String,
    #[serde(rename = "errorType")]
    pub error_type: String,
    pub error: String,
}

#[derive(Debug)]
pub struct HttpResponseError {
    trace: anyhow::Error,
}

impl HttpResponseError {
    /// The underlying error, for tests and middleware.
    pub fn trace(&self) -> &anyhow::Error {
        &self.trace
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        // Exit point of the HTTP layer: server-side faults are logged here
        // and nowhere else so each failure appears once.
        let status = self.trace.http_status();
        if status.is_server_error() {
            tracing::error!("request failed: {:#}", self.trace);
        }
        let envelope = ErrorEnvelope {
            status: "error".to_string(),
            error_type: self.trace.error_type().to_string(),
            error: self.trace.user_facing_message(),
        };
        (status, axum::Json(envelope)).into_response()
    }
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(trace: anyhow::Error) -> Self {
        Self { trace }
    }
}

impl From<HttpResponseError> for anyhow::Error {
    fn from(value: HttpResponseError) -> Self {
        value.trace
    }
}
