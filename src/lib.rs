//! # axum-byteranges
//!
//! HTTP byte-range responses for [`axum`][1], including
//! `multipart/byteranges` bodies for requests naming several ranges.
//!
//! The crate is split along the life of a range request:
//!
//! - [`negotiate`] reads `Range` and `If-Range` against a
//!   [`ResourceDescriptor`] and returns a [`RangeResult`] verdict.
//! - [`response_range`] turns a body and the negotiated ranges into a
//!   complete `206 Partial Content` response, streaming a single window
//!   ([`RangedStream`], [`SlicedStream`]) or a multipart document
//!   ([`MultipartStream`]).
//! - [`Ranged`] glues both together as an [`IntoResponse`] responder that
//!   also answers `200` and `416`.
//!
//! Bodies are any [`RangeReadable`]: a seekable reader such as
//! [`tokio::fs::File`], an in-memory buffer, or a forward-only byte stream.
//!
//! ```no_run
//! use axum::Router;
//! use axum::http::{HeaderMap, StatusCode};
//! use axum::response::{IntoResponse, Response};
//! use axum::routing::get;
//!
//! use axum_byteranges::{FileResource, Ranged};
//!
//! async fn file(headers: HeaderMap) -> Response {
//!     match FileResource::open("document.txt").await {
//!         Ok(file) => Ranged::file(headers, file).into_response(),
//!         Err(_) => StatusCode::NOT_FOUND.into_response(),
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let app = Router::<()>::new().route("/", get(file));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! [1]: https://docs.rs/axum

mod error;
pub mod etag;
mod file;
mod headers;
mod multipart;
mod negotiate;
mod response;
mod source;
mod stream;

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, IF_RANGE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{AcceptRanges, ContentLength, HeaderMapExt};
use tokio::io::AsyncSeek;

pub use error::{RangeError, StreamFault};
pub use file::FileResource;
pub use headers::{content_range, multipart_byteranges};
pub use multipart::{generate_boundary, render_preamble, render_postscript, MultipartStream};
pub use negotiate::{negotiate, parse_range, IfRange, RangeResult};
pub use response::{response_range, RangeOptions, ResponseInit, DEFAULT_CHUNK_SIZE};
pub use source::{RangeCursor, RangeReadable, SeekableBody};
pub use stream::{RangedStream, SlicedStream};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning the position the seek landed on.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        AsyncSeek::poll_complete(self, cx)
    }
}

/// An inclusive, zero-indexed window of bytes within a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a byte range covering `start..=end`.
    pub fn new(start: u64, end: u64) -> Self {
        ByteRange { start, end }
    }

    /// Number of bytes in the range. Never zero for a well formed range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `start <= end < size` holds.
    pub fn fits(&self, size: u64) -> bool {
        self.start <= self.end && self.end < size
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// What the negotiator needs to know about a resource: its length and, for
/// date-based `If-Range` checks, its modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

impl ResourceDescriptor {
    pub fn new(size: u64) -> Self {
        ResourceDescriptor { size, mtime: None }
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }

    /// Derive a descriptor from file metadata. Platforms without modification
    /// times yield a descriptor without `mtime`.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        ResourceDescriptor {
            size: metadata.len(),
            mtime: metadata.modified().ok(),
        }
    }
}

/// The main responder type. Implements [`IntoResponse`].
///
/// Runs [`negotiate`] over the request headers and answers with the full
/// entity, a partial response built by [`response_range`], or
/// `416 Range Not Satisfiable`.
pub struct Ranged {
    request: HeaderMap,
    descriptor: ResourceDescriptor,
    body: RangeReadable,
    etag: Option<String>,
    options: RangeOptions,
}

impl fmt::Debug for Ranged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ranged")
            .field("descriptor", &self.descriptor)
            .field("body", &self.body)
            .field("etag", &self.etag)
            .finish()
    }
}

impl Ranged {
    /// Construct a ranged response over any [`RangeReadable`] body, given the
    /// headers of the request being answered.
    pub fn new(request: HeaderMap, descriptor: ResourceDescriptor, body: impl Into<RangeReadable>) -> Self {
        Ranged {
            request,
            descriptor,
            body: body.into(),
            etag: None,
            options: RangeOptions::default(),
        }
    }

    /// Construct a ranged response for an opened file, taking its size,
    /// modification time and guessed content type.
    pub fn file(request: HeaderMap, file: FileResource) -> Self {
        let (body, descriptor, content_type) = file.into_parts();
        let options = RangeOptions::default().content_type(content_type);
        Ranged { request, descriptor, body, etag: None, options }
    }

    /// The current entity tag of the resource, compared against strong
    /// `If-Range` validators.
    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn options(mut self, options: RangeOptions) -> Self {
        self.options = options;
        self
    }

    /// Responds to the request. Returns [`RangeError::NotSatisfiable`] if the
    /// requested range could not be satisfied.
    pub fn try_respond(self) -> Result<RangedResponse, RangeError> {
        let size = self.descriptor.size;

        let etag = match self.etag {
            Some(etag) => Some(etag),
            None if self.request.contains_key(IF_RANGE) => match &self.body {
                RangeReadable::RandomAccess(bytes) => Some(etag::calculate(bytes)),
                _ => None,
            },
            None => None,
        };

        match negotiate(&self.request, &self.descriptor, etag.as_deref()) {
            RangeResult::Unsatisfiable => Err(RangeError::NotSatisfiable { size }),
            RangeResult::Full => {
                let body = match size {
                    0 => Body::empty(),
                    _ => response::single_range_body(self.body, ByteRange::new(0, size - 1), &self.options),
                };
                Ok(RangedResponse::Full {
                    content_length: ContentLength(size),
                    content_type: self.options.content_type,
                    body,
                })
            }
            RangeResult::Partial(ranges) => {
                let init = ResponseInit::default();
                let response = response_range(self.body, size, &ranges, init, self.options)?;
                Ok(RangedResponse::Partial(response))
            }
        }
    }
}

impl IntoResponse for Ranged {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Outcome of [`Ranged::try_respond`]. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse {
    /// The whole entity, because no usable range was requested.
    Full {
        content_length: ContentLength,
        content_type: Option<String>,
        body: Body,
    },
    /// A complete `206 Partial Content` response.
    Partial(Response),
}

impl IntoResponse for RangedResponse {
    fn into_response(self) -> Response {
        match self {
            RangedResponse::Full { content_length, content_type, body } => {
                let mut response = Response::new(body);
                let headers = response.headers_mut();
                headers.typed_insert(AcceptRanges::bytes());
                headers.typed_insert(content_length);
                if let Some(value) = content_type.and_then(|t| HeaderValue::try_from(t).ok()) {
                    headers.insert(CONTENT_TYPE, value);
                }
                *response.status_mut() = StatusCode::OK;
                response
            }
            RangedResponse::Partial(response) => response,
        }
    }
}
