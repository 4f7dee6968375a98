use std::fmt;
use std::io;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use http_body::{Body, Frame, SizeHint};

use crate::source::RangeReader;
use crate::{ByteRange, RangeError, RangeOptions, RangeReadable};

const DEFAULT_PART_TYPE: &str = "application/octet-stream";

/// Generate a boundary string unique to this response.
pub fn generate_boundary() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("RANGE_BOUNDARY-{}----", timestamp)
}

/// The delimiter and part headers written ahead of each range.
///
/// Used both while streaming and while precomputing `Content-Length`, so the
/// two can never disagree.
pub fn render_preamble(boundary: &str, content_type: &str, range: ByteRange, size: u64) -> String {
    format!(
        "\r\n--{}\r\nContent-Type: {}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
        boundary, content_type, range.start, range.end, size,
    )
}

/// The closing delimiter written after the last range.
pub fn render_postscript(boundary: &str) -> String {
    format!("\r\n--{}--\r\n", boundary)
}

/// RFC 2046 boundary: 1 to 70 `bchars`, not ending in a space.
pub(crate) fn validate_boundary(boundary: &str) -> Result<(), RangeError> {
    let is_bchar = |c: char| c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c);

    if boundary.is_empty() || boundary.len() > 70 || boundary.ends_with(' ') || !boundary.chars().all(is_bchar) {
        return Err(RangeError::InvalidBoundary(boundary.to_string()));
    }
    Ok(())
}

/// Content types end up verbatim inside header lines.
pub(crate) fn validate_content_type(content_type: &str) -> Result<(), RangeError> {
    let printable = |b: u8| b == b'\t' || (b' '..=b'~').contains(&b);

    if content_type.is_empty() || !content_type.bytes().all(printable) {
        return Err(RangeError::InvalidContentType(content_type.to_string()));
    }
    Ok(())
}

type Pull = BoxFuture<'static, (RangeReader, io::Result<Bytes>)>;

fn pull(mut reader: RangeReader, range: ByteRange, offset: u64) -> Pull {
    async move {
        let result = reader.read_chunk(range, offset).await;
        (reader, result)
    }.boxed()
}

enum PartState {
    /// The next range's preamble is due.
    Ready(RangeReader),
    /// Extracting the next chunk of the current range.
    Emitting(Pull),
    /// Every range is out, the postscript is due.
    Closing(RangeReader),
    /// Postscript sent. Holds the source when it is not auto-closed.
    Finished(Option<RangeReader>),
    Failed,
}

/// A lazily produced `multipart/byteranges` body.
///
/// Each pull yields one piece: a part preamble, at most `chunk_size` bytes
/// of a range's payload, or the postscript. Ranges are served in ascending
/// order of `start`. Overlapping and repeated ranges are served in full,
/// forward-only sources replaying the overlap from memory.
pub struct MultipartStream {
    state: PartState,
    ranges: Vec<ByteRange>,
    next: usize,
    offset: u64,
    size: u64,
    boundary: String,
    content_type: String,
    content_length: u64,
    auto_close: bool,
}

impl fmt::Debug for MultipartStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartStream")
            .field("ranges", &self.ranges)
            .field("next", &self.next)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("boundary", &self.boundary)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .finish()
    }
}

impl MultipartStream {
    pub fn new(
        source: impl Into<RangeReadable>,
        ranges: &[ByteRange],
        size: u64,
        options: &RangeOptions,
    ) -> Result<Self, RangeError> {
        if ranges.is_empty() {
            return Err(RangeError::NoRanges);
        }
        if let Some(range) = ranges.iter().find(|range| !range.fits(size)) {
            return Err(RangeError::OutOfBounds { range: *range, size });
        }

        let boundary = match &options.boundary {
            Some(boundary) => boundary.clone(),
            None => generate_boundary(),
        };
        validate_boundary(&boundary)?;

        let content_type = options.content_type.clone().unwrap_or_else(|| DEFAULT_PART_TYPE.to_string());
        validate_content_type(&content_type)?;

        let mut ranges = ranges.to_vec();
        // stable, so ties keep request order
        ranges.sort_by_key(|range| range.start);

        let content_length = ranges
            .iter()
            .map(|range| render_preamble(&boundary, &content_type, *range, size).len() as u64 + range.len())
            .sum::<u64>()
            + render_postscript(&boundary).len() as u64;

        let reader = RangeReader::new(source.into(), options.chunk_size);

        Ok(MultipartStream {
            state: PartState::Ready(reader),
            offset: ranges[0].start,
            ranges,
            next: 0,
            size,
            boundary,
            content_type,
            content_length,
            auto_close: options.auto_close,
        })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Exact number of bytes the stream will produce.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// The ranges in emission order.
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    fn is_done(&self) -> bool {
        matches!(self.state, PartState::Finished(_) | PartState::Failed)
    }
}

impl Drop for MultipartStream {
    fn drop(&mut self) {
        if !self.is_done() {
            tracing::debug!(
                boundary = %self.boundary,
                emitted = self.next,
                total = self.ranges.len(),
                "multipart body dropped before completion",
            );
        }
    }
}

impl Stream for MultipartStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();

        match mem::replace(&mut this.state, PartState::Failed) {
            PartState::Ready(mut reader) => {
                let range = this.ranges[this.next];
                let preamble = render_preamble(&this.boundary, &this.content_type, range, this.size);

                // sorted, so the next range starts lowest among those left
                reader.retain_from(this.ranges.get(this.next + 1).map(|next| next.start));
                this.offset = range.start;

                tracing::trace!(%range, part = this.next, "emitting multipart range");
                this.state = PartState::Emitting(pull(reader, range, range.start));

                Poll::Ready(Some(Ok(Bytes::from(preamble))))
            }
            PartState::Emitting(mut current) => match current.poll_unpin(cx) {
                Poll::Pending => {
                    this.state = PartState::Emitting(current);
                    Poll::Pending
                }
                Poll::Ready((reader, Ok(chunk))) => {
                    let range = this.ranges[this.next];
                    this.offset += chunk.len() as u64;

                    this.state = if this.offset <= range.end {
                        PartState::Emitting(pull(reader, range, this.offset))
                    } else {
                        this.next += 1;
                        match this.next < this.ranges.len() {
                            true => PartState::Ready(reader),
                            false => PartState::Closing(reader),
                        }
                    };
                    Poll::Ready(Some(Ok(chunk)))
                }
                // the reader, and with it the source, is dropped here
                Poll::Ready((_, Err(e))) => Poll::Ready(Some(Err(e))),
            },
            PartState::Closing(mut reader) => {
                reader.finish();
                this.state = PartState::Finished(match this.auto_close {
                    true => None,
                    false => Some(reader),
                });
                Poll::Ready(Some(Ok(Bytes::from(render_postscript(&this.boundary)))))
            }
            PartState::Finished(reader) => {
                this.state = PartState::Finished(reader);
                Poll::Ready(None)
            }
            PartState::Failed => Poll::Ready(None),
        }
    }
}

impl Body for MultipartStream {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.content_length)
    }

    fn is_end_stream(&self) -> bool {
        self.is_done()
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}
