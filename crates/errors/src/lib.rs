use std::borrow::Cow;

use http::StatusCode;

/// `ErrorMetadata` can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags an error with the taxonomy kind
/// used to classify it at every protocol boundary.
///
/// The `msg` is conveyed as the user facing error message if it makes it to
/// the client.
///
/// The `short_msg` is a stable tag - available for tests and for metrics
/// logging - that is resilient to changes in copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The taxonomy kind associated with this error.
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, usable in tests for string matching.
    /// Eg `NonMonotonicTimestamp`
    pub short_msg: Cow<'static, str>,
    /// Human readable, developer facing. Should be longer and descriptive.
    /// Eg "sample timestamp 100 is not newer than the series head at 200"
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    ResourceExhausted,
    DeadlineExceeded,
    Unauthenticated,
    Internal,
    Unavailable,
}

const INTERNAL_ERROR: &str = "InternalError";
const INTERNAL_ERROR_MSG: &str = "An internal error occurred";

impl ErrorMetadata {
    /// Inputs violate a declared contract. Maps to 400 in HTTP.
    ///
    /// The short_msg should be CapitalCamelCased describing the error (eg
    /// InvalidMatcherRegex). The msg should be a descriptive message
    /// targeted toward the developer.
    pub fn invalid_argument(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidArgument,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Referenced entity absent. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A unique constraint was violated. Maps to 400 in HTTP.
    pub fn already_exists(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::AlreadyExists,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A queue or the disk pipeline is overloaded and the request was
    /// rejected. Maps to 503 in HTTP. Callers may retry with backoff.
    pub fn resource_exhausted(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::ResourceExhausted,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A time budget was crossed before the operation completed. Maps to
    /// 504 in HTTP.
    pub fn deadline_exceeded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::DeadlineExceeded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// An invariant was broken or IO failed. Maps to 500 in HTTP.
    ///
    /// If you do not need a custom user-visible message, prefer plain
    /// anyhow without any ErrorMetadata, which is shown to the user as a
    /// generic internal error.
    pub fn internal(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Internal,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Transient failure the caller may retry. Maps to 503 in HTTP.
    pub fn unavailable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unavailable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.code == ErrorCode::InvalidArgument
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_resource_exhausted(&self) -> bool {
        self.code == ErrorCode::ResourceExhausted
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.code == ErrorCode::DeadlineExceeded
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code == ErrorCode::Unauthenticated
    }

    pub fn is_unavailable(&self) -> bool {
        self.code == ErrorCode::Unavailable
    }

    /// True if the error is deterministically caused by the request and
    /// retrying without changing it cannot succeed.
    pub fn is_client_error(&self) -> bool {
        match self.code {
            ErrorCode::InvalidArgument
            | ErrorCode::NotFound
            | ErrorCode::AlreadyExists
            | ErrorCode::Unauthenticated => true,
            ErrorCode::ResourceExhausted
            | ErrorCode::DeadlineExceeded
            | ErrorCode::Internal
            | ErrorCode::Unavailable => false,
        }
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidArgument | ErrorCode::AlreadyExists => StatusCode::BAD_REQUEST,
            // HTTP has the unfortunate naming of 401 as unauthorized when
            // it's really about authentication.
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ResourceExhausted | ErrorCode::Unavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn grpc_status_code(&self) -> tonic::Code {
        match self {
            ErrorCode::InvalidArgument => tonic::Code::InvalidArgument,
            ErrorCode::NotFound => tonic::Code::NotFound,
            ErrorCode::AlreadyExists => tonic::Code::AlreadyExists,
            ErrorCode::ResourceExhausted => tonic::Code::ResourceExhausted,
            ErrorCode::DeadlineExceeded => tonic::Code::DeadlineExceeded,
            ErrorCode::Unauthenticated => tonic::Code::Unauthenticated,
            ErrorCode::Internal => tonic::Code::Internal,
            ErrorCode::Unavailable => tonic::Code::Unavailable,
        }
    }

    /// The `errorType` string reported in error response bodies.
    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid-argument",
            ErrorCode::NotFound => "not-found",
            ErrorCode::AlreadyExists => "already-exists",
            ErrorCode::ResourceExhausted => "resource-exhausted",
            ErrorCode::DeadlineExceeded => "deadline-exceeded",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Internal => "internal",
            ErrorCode::Unavailable => "unavailable",
        }
    }
}

/// Accessors for the `ErrorMetadata` attached to an `anyhow::Error`, with
/// internal-error defaults when no metadata was attached.
pub trait ErrorMetadataAnyhowExt {
    fn error_code(&self) -> ErrorCode;
    fn is_invalid_argument(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_resource_exhausted(&self) -> bool;
    fn is_deadline_exceeded(&self) -> bool;
    fn is_unauthenticated(&self) -> bool;
    fn is_client_error(&self) -> bool;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn user_facing_message(&self) -> String;
    fn http_status(&self) -> StatusCode;
    fn error_type(&self) -> &'static str;
    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_code(&self) -> ErrorCode {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.code;
        }
        ErrorCode::Internal
    }

    fn is_invalid_argument(&self) -> bool {
        self.error_code() == ErrorCode::InvalidArgument
    }

    fn is_not_found(&self) -> bool {
        self.error_code() == ErrorCode::NotFound
    }

    fn is_resource_exhausted(&self) -> bool {
        self.error_code() == ErrorCode::ResourceExhausted
    }

    fn is_deadline_exceeded(&self) -> bool {
        self.error_code() == ErrorCode::DeadlineExceeded
    }

    fn is_unauthenticated(&self) -> bool {
        self.error_code() == ErrorCode::Unauthenticated
    }

    fn is_client_error(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_client_error();
        }
        false
    }

    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    /// Message shown to the user. Untagged errors collapse to a generic
    /// internal message so internals never leak through a response body.
    fn user_facing_message(&self) -> String {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.msg.to_string();
        }
        INTERNAL_ERROR_MSG.to_string()
    }

    fn http_status(&self) -> StatusCode {
        self.error_code().http_status_code()
    }

    fn error_type(&self) -> &'static str {
        self.error_code().error_type()
    }

    fn map_error_metadata<F: FnOnce(ErrorMetadata) -> ErrorMetadata>(self, f: F) -> Self {
        match self.downcast::<ErrorMetadata>() {
            Ok(e) => f(e).into(),
            Err(other) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
    };

    #[test]
    fn test_metadata_survives_context_chain() {
        let err: anyhow::Error = anyhow::anyhow!("disk io failed")
            .context(ErrorMetadata::invalid_argument(
                "InvertedRange",
                "range end 5 precedes range start 10",
            ))
            .context("while querying series");
        assert!(err.is_invalid_argument());
        assert_eq!(err.short_msg(), "InvertedRange");
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type(), "invalid-argument");
    }

    #[test]
    fn test_untagged_error_is_internal() {
        let err = anyhow::anyhow!("spontaneous failure");
        assert_eq!(err.error_code(), ErrorCode::Internal);
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_facing_message(), "An internal error occurred");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_status_mappings() {
        assert_eq!(
            ErrorCode::ResourceExhausted.http_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorCode::DeadlineExceeded.grpc_status_code(),
            tonic::Code::DeadlineExceeded
        );
        assert_eq!(ErrorCode::Unavailable.error_type(), "unavailable");
    }

    #[test]
    fn test_map_error_metadata() {
        let err: anyhow::Error = ErrorMetadata::unauthenticated("BadToken", "unknown token").into();
        let err = err.map_error_metadata(|e| {
            ErrorMetadata::unauthenticated(e.short_msg, "token rejected")
        });
        assert_eq!(err.msg(), "token rejected");
        assert!(err.is_unauthenticated());
    }
}
