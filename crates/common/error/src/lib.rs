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

use std::{any::Any, error::Error as StdError, sync::Arc};

use http::StatusCode as HttpStatusCode;
use serde::Serialize;
use strum::EnumProperty;

/// Client-facing error classification shared by every splice surface.
///
/// Each code carries the HTTP status it is reported with.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumProperty,
    strum_macros::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StatusCode {
    #[strum(props(http_status = "400"))]
    InvalidArgument,
    #[strum(props(http_status = "404"))]
    NotFound,
    #[strum(props(http_status = "409"))]
    Conflict,
    /// Not every expected chunk has been staged yet.
    #[strum(props(http_status = "412"))]
    IncompleteUpload,
    #[strum(props(http_status = "413"))]
    PayloadTooLarge,
    #[strum(props(http_status = "416"))]
    RangeNotSatisfiable,
    /// Staged or merged data failed validation.
    #[strum(props(http_status = "422"))]
    CorruptData,
    #[strum(props(http_status = "503"))]
    Cancelled,
    #[strum(props(http_status = "500"))]
    StorageUnavailable,
    #[strum(props(http_status = "500"))]
    Internal,
    #[strum(props(http_status = "500"))]
    Unknown,
}

impl StatusCode {
    pub fn http_status(self) -> HttpStatusCode {
        self.get_str("http_status")
            .and_then(|value| value.parse::<u16>().ok())
            .and_then(|value| HttpStatusCode::from_u16(value).ok())
            .unwrap_or(HttpStatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Whether the client may retry the same request unchanged.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Conflict | Self::Cancelled | Self::StorageUnavailable
        )
    }
}

pub trait StackError: StdError {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>);

    fn next(&self) -> Option<&dyn StackError>;

    fn last(&self) -> &dyn StackError
    where
        Self: Sized,
    {
        let Some(mut result) = self.next() else {
            return self;
        };
        while let Some(err) = result.next() {
            result = err;
        }
        result
    }

    fn transparent(&self) -> bool { false }
}

pub trait ErrorExt: StackError {
    fn status_code(&self) -> StatusCode { StatusCode::Unknown }

    fn as_any(&self) -> &dyn Any;

    fn output_msg(&self) -> String
    where
        Self: Sized,
    {
        match self.status_code() {
            StatusCode::Unknown | StatusCode::Internal | StatusCode::StorageUnavailable => {
                format!("Internal error: {}", self.status_code())
            }
            _ => {
                let error = self.last();
                if let Some(external_error) = error.source() {
                    let mut root = external_error;
                    while let Some(source) = root.source() {
                        root = source;
                    }
                    if error.transparent() {
                        format!("{root}")
                    } else {
                        format!("{error}: {root}")
                    }
                } else {
                    format!("{error}")
                }
            }
        }
    }

    fn root_cause(&self) -> Option<&dyn StdError>
    where
        Self: Sized,
    {
        let error = self.last();
        let mut source = error.source()?;
        while let Some(next) = source.source() {
            source = next;
        }
        Some(source)
    }
}

impl<T: ?Sized + StackError> StackError for Arc<T> {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) { self.as_ref().debug_fmt(layer, buf) }

    fn next(&self) -> Option<&dyn StackError> { self.as_ref().next() }
}

impl<T: StackError> StackError for Box<T> {
    fn debug_fmt(&self, layer: usize, buf: &mut Vec<String>) { self.as_ref().debug_fmt(layer, buf) }

    fn next(&self) -> Option<&dyn StackError> { self.as_ref().next() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(StatusCode::NotFound.http_status(), HttpStatusCode::NOT_FOUND);
        assert_eq!(
            StatusCode::IncompleteUpload.http_status(),
            HttpStatusCode::PRECONDITION_FAILED
        );
        assert_eq!(
            StatusCode::RangeNotSatisfiable.http_status(),
            HttpStatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            StatusCode::Unknown.http_status(),
            HttpStatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_from_snake_case() {
        let code: StatusCode = "incomplete_upload".parse().unwrap();
        assert_eq!(code, StatusCode::IncompleteUpload);
        assert_eq!(StatusCode::CorruptData.to_string(), "corrupt_data");
    }

    #[test]
    fn test_retryable() {
        assert!(StatusCode::Conflict.is_retryable());
        assert!(!StatusCode::IncompleteUpload.is_retryable());
    }
}
