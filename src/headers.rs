use std::borrow::Cow;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue};
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, HeaderMapExt};

use crate::{ByteRange, RangeError};

/// Apply the headers of a single-range `206` response.
///
/// `Content-Type` is only set when the map has none yet. Calling this twice
/// with the same arguments leaves the map unchanged.
pub fn content_range(
    headers: &mut HeaderMap,
    range: ByteRange,
    size: u64,
    content_type: Option<&str>,
) -> Result<(), RangeError> {
    let content_range = ContentRange::bytes(range.start..=range.end, size)
        .map_err(|_| RangeError::OutOfBounds { range, size })?;

    headers.typed_insert(AcceptRanges::bytes());
    headers.typed_insert(content_range);
    headers.typed_insert(ContentLength(range.len()));

    if let Some(content_type) = content_type {
        if !headers.contains_key(CONTENT_TYPE) {
            let value = HeaderValue::from_str(content_type)
                .map_err(|_| RangeError::InvalidContentType(content_type.to_string()))?;
            headers.insert(CONTENT_TYPE, value);
        }
    }

    Ok(())
}

/// Apply the headers of a `multipart/byteranges` response.
pub fn multipart_byteranges(
    headers: &mut HeaderMap,
    boundary: &str,
    content_length: u64,
) -> Result<(), RangeError> {
    let content_type = HeaderValue::from_str(&format!("multipart/byteranges; boundary={}", quote_param(boundary)))
        .map_err(|_| RangeError::InvalidBoundary(boundary.to_string()))?;

    headers.typed_insert(AcceptRanges::bytes());
    headers.insert(CONTENT_TYPE, content_type);
    headers.typed_insert(ContentLength(content_length));

    Ok(())
}

/// A parameter value as a token when it is one, quoted otherwise. Boundaries
/// never contain `"` or `\`, so nothing needs escaping.
fn quote_param(value: &str) -> Cow<'_, str> {
    let is_tchar = |c: char| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c);

    match !value.is_empty() && value.chars().all(is_tchar) {
        true => Cow::Borrowed(value),
        false => Cow::Owned(format!("\"{}\"", value)),
    }
}
