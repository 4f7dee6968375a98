use std::iter;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::header::{IF_RANGE, RANGE};
use axum::http::{HeaderMap, HeaderValue};
use axum_extra::headers::{Header, IfModifiedSince};

use crate::{ByteRange, ResourceDescriptor};

/// Verdict of [`negotiate`] for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeResult {
    /// The `Range` header is malformed, uses another unit, or names bytes
    /// outside the resource. Answer `416 Range Not Satisfiable`.
    Unsatisfiable,
    /// Ignore any range and serve the full entity.
    Full,
    /// Serve exactly these ranges, in the order the client listed them.
    /// Never empty.
    Partial(Vec<ByteRange>),
}

impl RangeResult {
    /// `false` only when the request should be answered with `416`.
    pub fn is_ok(&self) -> bool {
        !matches!(self, RangeResult::Unsatisfiable)
    }

    /// The ranges to serve, `None` for a full or unsatisfiable response.
    pub fn ranges(&self) -> Option<&[ByteRange]> {
        match self {
            RangeResult::Partial(ranges) => Some(ranges),
            _ => None,
        }
    }
}

/// A parsed `If-Range` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfRange {
    /// `W/"..."`, never usable for byte-exact decisions.
    Weak(String),
    /// `"..."`, including the quotes.
    Strong(String),
    Date(SystemTime),
    /// Neither an entity tag nor an HTTP date.
    Invalid,
}

impl IfRange {
    pub fn parse(value: &HeaderValue) -> IfRange {
        let bytes = trim_ascii(value.as_bytes());

        let (weak, tag) = match bytes.strip_prefix(b"W/") {
            Some(tag) => (true, tag),
            None => (false, bytes),
        };
        if is_entity_tag(tag) {
            let tag = String::from_utf8_lossy(tag).into_owned();
            return if weak { IfRange::Weak(tag) } else { IfRange::Strong(tag) };
        }

        match IfModifiedSince::decode(&mut iter::once(value)) {
            Ok(date) => IfRange::Date(SystemTime::from(date)),
            Err(_) => IfRange::Invalid,
        }
    }

    /// Whether the precondition holds, i.e. the client's copy still matches
    /// the current representation and the range may be honoured.
    fn matches(&self, descriptor: &ResourceDescriptor, etag: Option<&str>) -> bool {
        match self {
            IfRange::Weak(_) | IfRange::Invalid => false,
            IfRange::Strong(tag) => etag.map(str::trim) == Some(tag.as_str()),
            IfRange::Date(date) => match descriptor.mtime {
                Some(mtime) => !modified_since(mtime, *date),
                None => false,
            },
        }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if !first.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    while let [rest @ .., last] = bytes {
        if !last.is_ascii_whitespace() {
            break;
        }
        bytes = rest;
    }
    bytes
}

/// `"` 1*etagc `"`, where etagc is `%x21 / %x23-7E / obs-text`, plus the
/// space some servers put in tags.
fn is_entity_tag(bytes: &[u8]) -> bool {
    match bytes {
        [b'"', inner @ .., b'"'] if !inner.is_empty() => inner
            .iter()
            .all(|&b| b == b' ' || b == b'!' || (0x23..=0x7e).contains(&b) || b >= 0x80),
        _ => false,
    }
}

/// HTTP dates carry whole seconds, so sub-second precision of the
/// modification time is dropped before comparing.
fn modified_since(mtime: SystemTime, date: SystemTime) -> bool {
    let mtime = mtime.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let date = date.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    mtime > date
}

/// Decide whether the `Range` of a request can be served for a resource.
///
/// `etag` is the current entity tag of the resource, compared against a
/// strong `If-Range` validator. Without one, a strong validator cannot be
/// confirmed and the full entity is served.
pub fn negotiate(headers: &HeaderMap, descriptor: &ResourceDescriptor, etag: Option<&str>) -> RangeResult {
    if let Some(value) = headers.get(IF_RANGE) {
        let if_range = IfRange::parse(value);
        if !if_range.matches(descriptor, etag) {
            tracing::debug!(?if_range, "If-Range precondition not met, serving full entity");
            return RangeResult::Full;
        }
    }

    let Some(value) = headers.get(RANGE) else {
        return RangeResult::Full;
    };

    let result = match value.to_str() {
        Ok(value) => parse_range(value, descriptor.size),
        Err(_) => RangeResult::Unsatisfiable,
    };
    tracing::debug!(range = ?value, size = descriptor.size, ?result, "negotiated range request");
    result
}

/// Parse a `Range` header value such as `bytes=0-499, -500` against a
/// resource of `size` bytes.
///
/// A single malformed or out-of-bounds item makes the whole request
/// unsatisfiable. Ranges are returned in request order, neither sorted nor
/// merged.
pub fn parse_range(value: &str, size: u64) -> RangeResult {
    let Some((unit, range_set)) = value.split_once('=') else {
        return RangeResult::Unsatisfiable;
    };
    if unit.trim() != "bytes" {
        return RangeResult::Unsatisfiable;
    }

    let mut ranges = Vec::new();
    for item in range_set.split(',') {
        match parse_item(item.trim(), size) {
            Some(range) if range.fits(size) => ranges.push(range),
            _ => return RangeResult::Unsatisfiable,
        }
    }

    RangeResult::Partial(ranges)
}

fn parse_item(item: &str, size: u64) -> Option<ByteRange> {
    let (start, end) = item.split_once('-')?;
    let last = size.checked_sub(1)?;

    match (start, end) {
        ("", suffix) => {
            let suffix = parse_position(suffix)?;
            Some(ByteRange::new(size.checked_sub(suffix)?, last))
        }
        (start, "") => Some(ByteRange::new(parse_position(start)?, last)),
        (start, end) => Some(ByteRange::new(parse_position(start)?, parse_position(end)?)),
    }
}

fn parse_position(digits: &str) -> Option<u64> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
