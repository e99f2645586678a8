// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::any::Any;

use axum::{Json, response::IntoResponse};
use serde::Serialize;
use snafu::Snafu;
use splice_error::{ErrorExt, StackError, StatusCode};
use splice_staging::{ErrorKind, StagingError};
use strum::EnumProperty;
use tokio::task::JoinError;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code:      StatusCode,
    pub message:   String,
    /// The same request may succeed when sent again
    pub retryable: bool,
}

#[derive(Debug, Snafu, strum_macros::EnumProperty)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("Invalid argument: {reason}"))]
    #[strum(props(status_code = "invalid_argument"))]
    InvalidArgument { reason: String },

    #[snafu(display("Not found: {resource}"))]
    #[strum(props(status_code = "not_found"))]
    NotFound { resource: String },

    #[snafu(display("Conflict: {reason}"))]
    #[strum(props(status_code = "conflict"))]
    Conflict { reason: String },

    #[snafu(display("Incomplete upload: {reason}"))]
    #[strum(props(status_code = "incomplete_upload"))]
    IncompleteUpload { reason: String },

    #[snafu(display("Payload too large: {reason}"))]
    #[strum(props(status_code = "payload_too_large"))]
    PayloadTooLarge { reason: String },

    #[snafu(display("Range not satisfiable: {reason}"))]
    #[strum(props(status_code = "range_not_satisfiable"))]
    RangeNotSatisfiable { reason: String },

    #[snafu(display("Corrupt data: {reason}"))]
    #[strum(props(status_code = "corrupt_data"))]
    CorruptData { reason: String },

    #[snafu(display("Cancelled: {reason}"))]
    #[strum(props(status_code = "cancelled"))]
    Cancelled { reason: String },

    #[snafu(display("Internal error: {reason}"))]
    #[strum(props(status_code = "internal"))]
    Internal { reason: String },

    #[snafu(display("Storage failure"))]
    #[strum(props(status_code = "storage_unavailable"))]
    Storage { source: StagingError },
}

impl From<StagingError> for ApiError {
    fn from(error: StagingError) -> Self {
        let reason = error.to_string();
        match error.kind() {
            ErrorKind::NotFound => Self::NotFound { resource: reason },
            ErrorKind::IncompleteUpload => Self::IncompleteUpload { reason },
            ErrorKind::CorruptChunk | ErrorKind::Integrity => Self::CorruptData { reason },
            ErrorKind::RangeError => Self::RangeNotSatisfiable { reason },
            ErrorKind::InvalidArgument => Self::InvalidArgument { reason },
            ErrorKind::Conflict => Self::Conflict { reason },
            ErrorKind::TooLarge => Self::PayloadTooLarge { reason },
            ErrorKind::Cancelled => Self::Cancelled { reason },
            ErrorKind::Io => Self::Storage { source: error },
        }
    }
}

impl From<JoinError> for ApiError {
    fn from(error: JoinError) -> Self {
        let reason = error.to_string();
        if error.is_panic() {
            Self::Internal { reason }
        } else {
            Self::Cancelled { reason }
        }
    }
}

impl ErrorExt for ApiError {
    fn status_code(&self) -> StatusCode {
        self.get_str("status_code")
            .and_then(|value| value.parse().ok())
            .unwrap_or(StatusCode::Unknown)
    }

    fn as_any(&self) -> &dyn Any { self as _ }
}

impl StackError for ApiError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) {
        buf.push(format!("{layer}: {self}"));
        if let Self::Storage { source } = self {
            buf.push(format!("{}: {source}", layer + 1));
        }
    }

    fn next(&self) -> Option<&dyn StackError> { None }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code().http_status();
        if status.is_server_error() {
            let mut layers = Vec::new();
            self.debug_fmt(0, &mut layers);
            error!(error = ?layers, "Request failed");
        }
        let code = self.status_code();
        let body = Json(ErrorBody {
            code,
            message: self.output_msg(),
            retryable: code.is_retryable(),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use axum::http;

    use super::*;

    #[test]
    fn test_staging_errors_map_to_status() {
        let cases = [
            (
                StagingError::StagingNotFound { name: "f".into() },
                http::StatusCode::NOT_FOUND,
            ),
            (
                StagingError::IncompleteUpload {
                    name:     "f".into(),
                    expected: 3,
                    actual:   2,
                    missing:  vec![1],
                },
                http::StatusCode::PRECONDITION_FAILED,
            ),
            (
                StagingError::InvalidRange {
                    name:  "f".into(),
                    start: 5,
                    end:   1,
                    size:  4,
                },
                http::StatusCode::RANGE_NOT_SATISFIABLE,
            ),
            (
                StagingError::MergeInProgress { name: "f".into() },
                http::StatusCode::CONFLICT,
            ),
        ];

        for (error, expected) in cases {
            let api = ApiError::from(error);
            assert_eq!(api.status_code().http_status(), expected);
        }
    }

    #[test]
    fn test_storage_errors_are_not_leaked() {
        let api = ApiError::from(StagingError::Io {
            path:   "/secret/path".into(),
            source: std::io::Error::other("disk on fire"),
        });
        assert_eq!(api.status_code(), StatusCode::StorageUnavailable);
        let message = api.output_msg();
        assert!(!message.contains("/secret/path"));
        assert!(!message.contains("disk on fire"));
    }

    #[test]
    fn test_client_errors_carry_reason() {
        let api = ApiError::from(StagingError::IncompleteUpload {
            name:     "f".into(),
            expected: 3,
            actual:   2,
            missing:  vec![1],
        });
        assert!(api.output_msg().contains("missing [1]"));
    }

    #[tokio::test]
    async fn test_panicked_task_is_internal() {
        let error = tokio::spawn(async { panic!("merge task crashed"); })
            .await
            .unwrap_err();
        let api = ApiError::from(error);
        assert_eq!(api.status_code(), StatusCode::Internal);
        assert_eq!(
            api.status_code().http_status(),
            http::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_aborted_task_is_cancelled() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let api = ApiError::from(handle.await.unwrap_err());
        assert_eq!(api.status_code(), StatusCode::Cancelled);
    }

    #[tokio::test]
    async fn test_error_body_reports_retryable() {
        let conflict = ApiError::from(StagingError::MergeInProgress { name: "f".into() });
        let response = conflict.into_response();
        assert_eq!(response.status(), http::StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "conflict");
        assert_eq!(body["retryable"], true);

        let missing = ApiError::from(StagingError::ArtifactNotFound { name: "f".into() });
        let bytes = axum::body::to_bytes(missing.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["retryable"], false);
    }
}
