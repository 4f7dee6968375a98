use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::ContentRange;
use thiserror::Error;

use crate::ByteRange;

/// Errors raised before any body is streamed.
///
/// Apart from [`RangeError::NotSatisfiable`], these are caller bugs: the
/// negotiator never produces an empty or out-of-bounds range list.
#[derive(Debug, Error)]
pub enum RangeError {
    #[error("at least one range expected")]
    NoRanges,

    #[error("range {range} is outside a resource of {size} bytes")]
    OutOfBounds { range: ByteRange, size: u64 },

    #[error("invalid multipart boundary {0:?}")]
    InvalidBoundary(String),

    #[error("invalid content type {0:?}")]
    InvalidContentType(String),

    #[error("requested range not satisfiable for a resource of {size} bytes")]
    NotSatisfiable { size: u64 },
}

impl IntoResponse for RangeError {
    fn into_response(self) -> Response {
        match self {
            RangeError::NotSatisfiable { size } => {
                let header = TypedHeader(ContentRange::unsatisfied_bytes(size));
                (StatusCode::RANGE_NOT_SATISFIABLE, header, ()).into_response()
            }
            err => {
                tracing::error!(error = %err, "failed to build range response");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

/// Failures while producing a committed 206 body.
///
/// These travel through the body's error channel as [`io::Error`], since the
/// status line and headers have already gone out by the time they happen.
#[derive(Debug, Error)]
pub enum StreamFault {
    #[error("could not seek to range start: expected offset {expected}, landed on {actual}")]
    SeekMismatch { expected: u64, actual: u64 },

    #[error("source ended after {received} of {} bytes of range {range}", .range.len())]
    UnexpectedEof { range: ByteRange, received: u64 },

    #[error("range {range} starts before stream position {position}")]
    RangeBehindCursor { range: ByteRange, position: u64 },
}

impl From<StreamFault> for io::Error {
    fn from(fault: StreamFault) -> Self {
        let kind = match fault {
            StreamFault::SeekMismatch { .. } => io::ErrorKind::InvalidInput,
            StreamFault::UnexpectedEof { .. } => io::ErrorKind::UnexpectedEof,
            StreamFault::RangeBehindCursor { .. } => io::ErrorKind::InvalidInput,
        };
        tracing::warn!(error = %fault, "range stream fault");
        io::Error::new(kind, fault)
    }
}
