//! Error handling.

use axum::{
    http::header,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::error::Error;
use thiserror::Error;
use tracing::{event, Level};

/// Ensemble statistics server error type
///
/// This type encapsulates the various errors that may occur.
/// Contract violations on accumulators are not represented here: they panic.
#[derive(Debug, Error)]
pub enum EnsembleError {
    /// A channel to or from another task was closed
    #[error("{channel} channel closed")]
    ChannelClosed { channel: &'static str },

    /// Error reading or writing checkpoint data or sockets
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Error (de)serialising JSON data
    #[error("failed to (de)serialise JSON")]
    Json(#[from] serde_json::Error),

    /// The launcher did not answer within the allowed time
    #[error("no answer from launcher to {request} within {seconds}s")]
    LauncherTimeout { request: String, seconds: u64 },

    /// Options failed validation (single error)
    #[error("options are not valid")]
    OptionsValidationSingle(#[from] validator::ValidationError),

    /// Options failed validation (multiple errors)
    #[error("options are not valid")]
    OptionsValidation(#[from] validator::ValidationErrors),

    /// Two partitions of the global index space do not agree
    #[error("partition sizes sum to {actual}, expected {expected}")]
    PartitionMismatch { expected: usize, actual: usize },

    /// Malformed or unexpected message received from a peer
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// Error converting between integer types
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),

    /// Data names a field that is not configured
    #[error("unknown field {name}")]
    UnknownField { name: String },

    /// No record exists for the requested simulation group
    #[error("unknown simulation {id}")]
    UnknownSimulation { id: usize },
}

impl EnsembleError {
    /// Shorthand for a [EnsembleError::Protocol] error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        EnsembleError::Protocol {
            reason: reason.into(),
        }
    }
}

impl IntoResponse for EnsembleError {
    /// Convert from an `EnsembleError` into an [axum::response::Response].
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}

/// Body of error response
///
/// Implements serde (de)serialise.
#[derive(Deserialize, Serialize)]
struct ErrorBody {
    /// Main error message
    message: String,

    /// Optional list of causes
    #[serde(skip_serializing_if = "Option::is_none")]
    caused_by: Option<Vec<String>>,
}

impl ErrorBody {
    /// Return a new ErrorBody
    ///
    /// # Arguments
    ///
    /// * `error`: The error that occurred
    fn new<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        let message = error.to_string();
        let mut caused_by = None;
        let mut current = error.source();
        while let Some(source) = current {
            let mut causes: Vec<String> = caused_by.unwrap_or_default();
            causes.push(source.to_string());
            caused_by = Some(causes);
            current = source.source();
        }
        // Remove duplicate entries.
        if let Some(caused_by) = caused_by.as_mut() {
            caused_by.dedup()
        }
        ErrorBody { message, caused_by }
    }
}

/// A response to send in error cases
#[derive(Deserialize, Serialize)]
struct ErrorResponse {
    /// HTTP status of the response
    #[serde(skip)]
    status: StatusCode,

    /// Response body
    error: ErrorBody,
}

impl ErrorResponse {
    fn new<E>(status: StatusCode, error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        ErrorResponse {
            status,
            error: ErrorBody::new(error),
        }
    }

    /// Return a 400 bad request ErrorResponse
    fn bad_request<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// Return a 404 not found ErrorResponse
    fn not_found<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    /// Return a 500 internal server error ErrorResponse
    fn internal_server_error<E>(error: &E) -> Self
    where
        E: std::error::Error + Send + Sync,
    {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl From<EnsembleError> for ErrorResponse {
    /// Convert from an `EnsembleError` into an `ErrorResponse`.
    fn from(error: EnsembleError) -> Self {
        let response = match &error {
            // Bad request
            EnsembleError::OptionsValidationSingle(_)
            | EnsembleError::OptionsValidation(_)
            | EnsembleError::PartitionMismatch { .. }
            | EnsembleError::Protocol { .. } => Self::bad_request(&error),

            // Not found
            EnsembleError::UnknownField { .. } | EnsembleError::UnknownSimulation { .. } => {
                Self::not_found(&error)
            }

            // Internal server error
            EnsembleError::ChannelClosed { .. }
            | EnsembleError::Io(_)
            | EnsembleError::Json(_)
            | EnsembleError::LauncherTimeout { .. }
            | EnsembleError::TryFromInt(_) => Self::internal_server_error(&error),
        };

        // Log server errors.
        if response.status.is_server_error() {
            event!(Level::ERROR, "{}", error.to_string());
            let mut current = error.source();
            while let Some(source) = current {
                event!(Level::ERROR, "Caused by: {}", source.to_string());
                current = source.source();
            }
        }

        response
    }
}

impl IntoResponse for ErrorResponse {
    /// Convert from an `ErrorResponse` into an `axum::response::Response`.
    ///
    /// Renders the response as JSON.
    fn into_response(self) -> Response {
        let json_body = serde_json::to_string_pretty(&self);
        match json_body {
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialise error response: {}", err),
            )
                .into_response(),
            Ok(json_body) => (
                self.status,
                [(&header::CONTENT_TYPE, mime::APPLICATION_JSON.to_string())],
                json_body,
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hyper::HeaderMap;

    // Jump through the hoops to get the body as a string.
    async fn body_string(response: Response) -> String {
        String::from_utf8(
            hyper::body::to_bytes(response.into_body())
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap()
    }

    async fn test_ensemble_error(
        error: EnsembleError,
        status: StatusCode,
        message: &str,
        caused_by: Option<Vec<&'static str>>,
    ) {
        let response = error.into_response();
        assert_eq!(status, response.status());
        let mut headers = HeaderMap::new();
        headers.insert(&header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert_eq!(headers, *response.headers());
        let error_response: ErrorResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(message.to_string(), error_response.error.message);
        let caused_by = caused_by.map(|cb| cb.iter().map(|s| s.to_string()).collect());
        assert_eq!(caused_by, error_response.error.caused_by);
    }

    #[tokio::test]
    async fn channel_closed_error() {
        let error = EnsembleError::ChannelClosed { channel: "data" };
        let message = "data channel closed";
        test_ensemble_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn io_error() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "no checkpoint");
        let error = EnsembleError::Io(io_error);
        let message = "I/O error";
        let caused_by = Some(vec!["no checkpoint"]);
        test_ensemble_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, caused_by).await;
    }

    #[tokio::test]
    async fn launcher_timeout_error() {
        let error = EnsembleError::LauncherTimeout {
            request: "simu_info 3".to_string(),
            seconds: 5,
        };
        let message = "no answer from launcher to simu_info 3 within 5s";
        test_ensemble_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn options_validation_single() {
        let validation_error = validator::ValidationError::new("foo");
        let error = EnsembleError::OptionsValidationSingle(validation_error);
        let message = "options are not valid";
        let caused_by = Some(vec!["Validation error: foo [{}]"]);
        test_ensemble_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn options_validation() {
        let mut validation_errors = validator::ValidationErrors::new();
        let validation_error = validator::ValidationError::new("foo");
        validation_errors.add("bar", validation_error);
        let error = EnsembleError::OptionsValidation(validation_errors);
        let message = "options are not valid";
        let caused_by = Some(vec!["bar: Validation error: foo [{}]"]);
        test_ensemble_error(error, StatusCode::BAD_REQUEST, message, caused_by).await;
    }

    #[tokio::test]
    async fn partition_mismatch_error() {
        let error = EnsembleError::PartitionMismatch {
            expected: 10,
            actual: 9,
        };
        let message = "partition sizes sum to 9, expected 10";
        test_ensemble_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn protocol_error() {
        let error = EnsembleError::protocol("short header");
        let message = "protocol error: short header";
        test_ensemble_error(error, StatusCode::BAD_REQUEST, message, None).await;
    }

    #[tokio::test]
    async fn try_from_int_error() {
        let error = EnsembleError::TryFromInt(u8::try_from(-1_i8).unwrap_err());
        let message = "out of range integral type conversion attempted";
        test_ensemble_error(error, StatusCode::INTERNAL_SERVER_ERROR, message, None).await;
    }

    #[tokio::test]
    async fn unknown_field_error() {
        let error = EnsembleError::UnknownField {
            name: "pressure".to_string(),
        };
        let message = "unknown field pressure";
        test_ensemble_error(error, StatusCode::NOT_FOUND, message, None).await;
    }

    #[tokio::test]
    async fn unknown_simulation_error() {
        let error = EnsembleError::UnknownSimulation { id: 7 };
        let message = "unknown simulation 7";
        test_ensemble_error(error, StatusCode::NOT_FOUND, message, None).await;
    }
}
