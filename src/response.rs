use std::io;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures::stream;
use serde::Deserialize;

use crate::source::{slice_window, BoxedBody};
use crate::{content_range, multipart_byteranges};
use crate::{ByteRange, MultipartStream, RangeError, RangeReadable, RangedStream, SlicedStream};

/// Read size used when none is configured: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 524_288;

/// Knobs for [`response_range`]. Every field has a default, so partial
/// configurations deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RangeOptions {
    /// Release the source once the last range has been read.
    #[serde(alias = "autoClose")]
    pub auto_close: bool,
    /// Multipart boundary. A fresh one is generated per response if unset.
    pub boundary: Option<String>,
    #[serde(alias = "chunkSize")]
    pub chunk_size: usize,
    /// Media type of the resource, used for `Content-Type` of single range
    /// responses and of every multipart part.
    #[serde(rename = "type")]
    pub content_type: Option<String>,
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions {
            auto_close: true,
            boundary: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            content_type: None,
        }
    }
}

impl RangeOptions {
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<Option<String>>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Headers the caller wants on the `206` response, such as `Cache-Control`
/// or `ETag`. Range headers are applied on top of them.
#[derive(Debug, Clone, Default)]
pub struct ResponseInit {
    pub headers: HeaderMap,
}

impl ResponseInit {
    pub fn new(headers: HeaderMap) -> Self {
        ResponseInit { headers }
    }
}

/// Build a complete `206 Partial Content` response for already negotiated
/// ranges.
///
/// One range is streamed as is. Several ranges become a
/// `multipart/byteranges` body, ordered by ascending `start`. Errors are
/// reported before any body is created.
pub fn response_range(
    body: impl Into<RangeReadable>,
    size: u64,
    ranges: &[ByteRange],
    init: ResponseInit,
    options: RangeOptions,
) -> Result<Response, RangeError> {
    let body = body.into();
    let mut headers = init.headers;

    let body = match ranges {
        [] => return Err(RangeError::NoRanges),
        [range] => {
            if !range.fits(size) {
                return Err(RangeError::OutOfBounds { range: *range, size });
            }
            content_range(&mut headers, *range, size, options.content_type.as_deref())?;

            tracing::debug!(%range, size, "serving single range");
            single_range_body(body, *range, &options)
        }
        _ => {
            let stream = MultipartStream::new(body, ranges, size, &options)?;
            multipart_byteranges(&mut headers, stream.boundary(), stream.content_length())?;

            tracing::debug!(
                ranges = ranges.len(),
                content_length = stream.content_length(),
                boundary = stream.boundary(),
                "serving multipart/byteranges",
            );
            Body::new(stream)
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Stream exactly the bytes of `range`, picking the extraction strategy by
/// source kind.
pub(crate) fn single_range_body(source: RangeReadable, range: ByteRange, options: &RangeOptions) -> Body {
    match source {
        RangeReadable::Seekable(body) => {
            let stream = RangedStream::new(BoxedBody(body), range)
                .chunk_size(options.chunk_size)
                .auto_close(options.auto_close);
            Body::new(stream)
        }
        RangeReadable::RandomAccess(bytes) => match slice_window(&bytes, range) {
            Ok(window) => Body::from(window),
            Err(fault) => Body::from_stream(stream::once(async move { Err::<bytes::Bytes, _>(io::Error::from(fault)) })),
        },
        RangeReadable::SequentialStream(upstream) => Body::from_stream(SlicedStream::new(upstream, range)),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use assert_matches::assert_matches;
    use axum::body::Body;
    use axum::http::header::{CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
    use axum::http::{HeaderMap, HeaderValue, StatusCode};
    use bytes::Bytes;
    use futures::stream;

    use super::{response_range, RangeOptions, ResponseInit, DEFAULT_CHUNK_SIZE};
    use crate::{ByteRange, RangeError, RangeReadable};

    const DATA: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    async fn collect_body(body: Body) -> Result<String, axum::Error> {
        let bytes = axum::body::to_bytes(body, usize::MAX).await?;
        Ok(String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_single_range_from_memory() {
        let options = RangeOptions::default().content_type("text/plain".to_string());
        let response = response_range(DATA, 62, &[ByteRange::new(10, 15)], ResponseInit::default(), options).unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!("bytes 10-15/62", response.headers()[CONTENT_RANGE]);
        assert_eq!("6", response.headers()[CONTENT_LENGTH]);
        assert_eq!("text/plain", response.headers()[CONTENT_TYPE]);
        assert_eq!("ABCDEF", collect_body(response.into_body()).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_range_from_file() {
        let file = tokio::fs::File::open("test/fixture.txt").await.unwrap();
        let options = RangeOptions::default().chunk_size(4);
        let response = response_range(file, 54, &[ByteRange::new(6, 10)], ResponseInit::default(), options).unwrap();

        assert_eq!("bytes 6-10/54", response.headers()[CONTENT_RANGE]);
        assert!(!response.headers().contains_key(CONTENT_TYPE));
        assert_eq!("world", collect_body(response.into_body()).await.unwrap());
    }

    #[tokio::test]
    async fn test_single_range_from_stream() {
        let chunks: Vec<io::Result<Bytes>> = DATA.as_bytes().chunks(5).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        let source = RangeReadable::stream(stream::iter(chunks));
        let response = response_range(source, 62, &[ByteRange::new(58, 61)], ResponseInit::default(), RangeOptions::default()).unwrap();

        assert_eq!("4", response.headers()[CONTENT_LENGTH]);
        assert_eq!("wxyz", collect_body(response.into_body()).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_stream_errors_in_body() {
        let source = RangeReadable::stream(stream::iter(vec![Ok(Bytes::from_static(b"0123"))]));
        let response = response_range(source, 62, &[ByteRange::new(2, 9)], ResponseInit::default(), RangeOptions::default()).unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert!(collect_body(response.into_body()).await.is_err());
    }

    #[tokio::test]
    async fn test_init_headers_are_merged() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let options = RangeOptions::default().content_type("text/plain".to_string());
        let response = response_range(DATA, 62, &[ByteRange::new(0, 0)], ResponseInit::new(headers), options).unwrap();

        assert_eq!("no-cache", response.headers()[CACHE_CONTROL]);
        assert_eq!("application/json", response.headers()[CONTENT_TYPE]);
    }

    #[tokio::test]
    async fn test_multiple_ranges() {
        let options = RangeOptions::default().boundary("xyz");
        let ranges = [ByteRange::new(3, 4), ByteRange::new(0, 1)];
        let response = response_range(DATA, 62, &ranges, ResponseInit::default(), options).unwrap();

        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!("multipart/byteranges; boundary=xyz", response.headers()[CONTENT_TYPE]);
        assert!(!response.headers().contains_key(CONTENT_RANGE));

        let expected = concat!(
            "\r\n--xyz\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 0-1/62\r\n\r\n01",
            "\r\n--xyz\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes 3-4/62\r\n\r\n34",
            "\r\n--xyz--\r\n",
        );
        let length: usize = response.headers()[CONTENT_LENGTH].to_str().unwrap().parse().unwrap();
        assert_eq!(expected.len(), length);
        assert_eq!(expected, collect_body(response.into_body()).await.unwrap());
    }

    #[test]
    fn test_usage_errors() {
        assert_matches!(
            response_range(DATA, 62, &[], ResponseInit::default(), RangeOptions::default()),
            Err(RangeError::NoRanges)
        );
        assert_matches!(
            response_range(DATA, 62, &[ByteRange::new(10, 62)], ResponseInit::default(), RangeOptions::default()),
            Err(RangeError::OutOfBounds { size: 62, .. })
        );
        assert_matches!(
            response_range(DATA, 62, &[ByteRange::new(0, 1), ByteRange::new(2, 3)], ResponseInit::default(), RangeOptions::default().boundary("")),
            Err(RangeError::InvalidBoundary(_))
        );
    }

    #[test]
    fn test_options_deserialize() {
        let options: RangeOptions = serde_json::from_str(r#"{"type": "video/mp4", "chunkSize": 1024}"#).unwrap();
        assert_eq!(
            RangeOptions::default().content_type("video/mp4".to_string()).chunk_size(1024),
            options,
        );

        let options: RangeOptions = serde_json::from_str(r#"{"auto_close": false, "boundary": "b"}"#).unwrap();
        assert!(!options.auto_close);
        assert_eq!(Some("b".to_string()), options.boundary);
        assert_eq!(DEFAULT_CHUNK_SIZE, options.chunk_size);
    }
}
