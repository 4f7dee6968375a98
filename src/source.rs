use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::poll_fn;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::{AsyncSeekStart, ByteRange, StreamFault};

/// A body that can be positioned before reading, such as a file.
pub trait SeekableBody: AsyncRead + AsyncSeekStart + Send {}

impl<T: AsyncRead + AsyncSeekStart + Send + ?Sized> SeekableBody for T {}

/// A byte source that ranges can be extracted from.
pub enum RangeReadable {
    /// Positioned with a seek before every range. Closed by dropping it.
    Seekable(Pin<Box<dyn SeekableBody>>),
    /// Byte-addressable data, sliced without copying.
    RandomAccess(Bytes),
    /// A forward-only stream. Whoever holds it is its only reader, and ranges
    /// must be extracted in ascending order.
    SequentialStream(BoxStream<'static, io::Result<Bytes>>),
}

impl RangeReadable {
    pub fn seekable<B>(body: B) -> Self
    where
        B: AsyncRead + AsyncSeekStart + Send + 'static,
    {
        RangeReadable::Seekable(Box::pin(body))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        RangeReadable::SequentialStream(stream.boxed())
    }

    /// Wrap a forward-only reader (a pipe, a socket, a decoder) as a
    /// sequential stream of chunks of at most `chunk_size` bytes.
    pub fn reader<R>(reader: R, chunk_size: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let chunk_size = chunk_size.max(1);
        let stream = async_stream::try_stream! {
            let mut reader = Box::pin(reader);
            loop {
                let mut buffer = BytesMut::with_capacity(chunk_size);
                if reader.read_buf(&mut buffer).await? == 0 {
                    break;
                }
                yield buffer.freeze();
            }
        };
        RangeReadable::stream(stream)
    }
}

impl fmt::Debug for RangeReadable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeReadable::Seekable(_) => f.write_str("Seekable"),
            RangeReadable::RandomAccess(bytes) => f.debug_tuple("RandomAccess").field(&bytes.len()).finish(),
            RangeReadable::SequentialStream(_) => f.write_str("SequentialStream"),
        }
    }
}

impl From<Bytes> for RangeReadable {
    fn from(bytes: Bytes) -> Self {
        RangeReadable::RandomAccess(bytes)
    }
}

impl From<Vec<u8>> for RangeReadable {
    fn from(bytes: Vec<u8>) -> Self {
        RangeReadable::RandomAccess(bytes.into())
    }
}

impl From<&'static [u8]> for RangeReadable {
    fn from(bytes: &'static [u8]) -> Self {
        RangeReadable::RandomAccess(Bytes::from_static(bytes))
    }
}

impl From<String> for RangeReadable {
    fn from(text: String) -> Self {
        RangeReadable::RandomAccess(text.into())
    }
}

impl From<&'static str> for RangeReadable {
    fn from(text: &'static str) -> Self {
        RangeReadable::RandomAccess(Bytes::from_static(text.as_bytes()))
    }
}

impl From<tokio::fs::File> for RangeReadable {
    fn from(file: tokio::fs::File) -> Self {
        RangeReadable::seekable(file)
    }
}

/// Read position within a forward-only stream, carried from one range to
/// the next.
///
/// `pending` holds the unconsumed tail of the last chunk, which always starts
/// at `position`. It is re-examined before anything else is pulled from
/// upstream.
///
/// With a retention floor set, consumed bytes at or after the floor are also
/// kept, so that a later range overlapping an earlier one can be served
/// without rewinding. `retained` always ends at `position`.
#[derive(Debug, Default)]
pub struct RangeCursor {
    position: u64,
    pending: Option<Bytes>,
    retained: BytesMut,
    floor: Option<u64>,
}

impl RangeCursor {
    pub fn new() -> Self {
        RangeCursor::default()
    }

    /// Absolute offset of the next byte not yet handed out.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn take_pending(&mut self) -> Option<Bytes> {
        self.pending.take()
    }

    /// Whether every byte of `range` has already gone past the cursor.
    pub fn is_past(&self, range: ByteRange) -> bool {
        self.position > range.end
    }

    /// Keep consumed bytes from `floor` onwards for replay. With `None`, only
    /// bytes already retained and not yet replayed are kept.
    pub fn retain_from(&mut self, floor: Option<u64>) {
        self.floor = floor;
    }

    /// Number of bytes currently held for replay.
    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }

    fn retained_start(&self) -> u64 {
        self.position - self.retained.len() as u64
    }

    /// Feed the next chunk of the stream, which begins at [`position`].
    ///
    /// Returns the part of the chunk falling inside `range`, if any. Bytes
    /// before the range are discarded, bytes after it are kept as pending.
    ///
    /// [`position`]: RangeCursor::position
    pub fn advance(&mut self, mut chunk: Bytes, range: ByteRange) -> Option<Bytes> {
        let len = chunk.len() as u64;
        let skip = range.start.saturating_sub(self.position);
        if skip >= len {
            self.consume(&chunk);
            return None;
        }

        let take = (range.end + 1).saturating_sub(self.position).min(len);
        if take <= skip {
            self.pending = Some(chunk);
            return None;
        }

        // take <= len, which came from a usize
        let tail = chunk.split_off(take as usize);
        if !tail.is_empty() {
            self.pending = Some(tail);
        }
        self.consume(&chunk);
        Some(chunk.slice(skip as usize..))
    }

    /// Move `position` past `chunk`, which starts at `position`, keeping
    /// whatever lies at or after the floor.
    fn consume(&mut self, chunk: &Bytes) {
        if let Some(floor) = self.floor {
            let from = floor.saturating_sub(self.position);
            if from < chunk.len() as u64 {
                self.retained.extend_from_slice(&chunk[from as usize..]);
            }
        }
        self.position += chunk.len() as u64;
    }

    /// Forget retained bytes that neither `offset` nor the floor can reach.
    fn trim(&mut self, offset: u64) {
        let keep_from = self.floor.map_or(offset, |floor| floor.min(offset));
        let start = self.retained_start();
        if keep_from > start {
            let stale = (keep_from - start).min(self.retained.len() as u64);
            self.retained.advance(stale as usize);
        }
    }

    /// Up to `max` already consumed bytes starting at `offset`.
    fn replay(&self, offset: u64, max: usize) -> Option<Bytes> {
        let start = self.retained_start();
        if offset < start || offset >= self.position {
            return None;
        }
        let from = (offset - start) as usize;
        let to = self.retained.len().min(from + max);
        Some(Bytes::copy_from_slice(&self.retained[from..to]))
    }

    /// Up to `max` bytes of `chunk`, which starts at `position`, from
    /// `offset` onwards. `offset` must not lie behind `position`.
    fn window(&mut self, mut chunk: Bytes, offset: u64, max: usize) -> Option<Bytes> {
        let len = chunk.len() as u64;
        let skip = offset - self.position;
        if skip >= len {
            self.consume(&chunk);
            return None;
        }

        // skip + take <= len, which came from a usize
        let take = (len - skip).min(max as u64);
        let tail = chunk.split_off((skip + take) as usize);
        if !tail.is_empty() {
            self.pending = Some(tail);
        }
        self.consume(&chunk);
        Some(chunk.slice(skip as usize..))
    }
}

/// Owns a source for the life of a response and extracts ranges from it, one
/// chunk of at most `chunk_size` bytes at a time.
pub(crate) struct RangeReader {
    source: RangeReadable,
    cursor: RangeCursor,
    chunk_size: usize,
    /// Where a seekable source will read next, if known.
    seeked: Option<u64>,
}

impl RangeReader {
    pub(crate) fn new(source: RangeReadable, chunk_size: usize) -> Self {
        RangeReader {
            source,
            cursor: RangeCursor::new(),
            chunk_size: chunk_size.max(1),
            seeked: None,
        }
    }

    /// Lowest offset any range still to be read starts at, so a forward-only
    /// source can keep bytes that ranges overlapping the current one need.
    pub(crate) fn retain_from(&mut self, floor: Option<u64>) {
        self.cursor.retain_from(floor);
    }

    /// Drop anything held for replay once no range is left to read.
    pub(crate) fn finish(&mut self) {
        self.cursor.floor = None;
        self.cursor.retained = BytesMut::new();
    }

    /// Produce the next bytes of `range`, starting at `offset`. The result is
    /// never empty and never longer than the chunk size or the rest of the
    /// range.
    pub(crate) async fn read_chunk(&mut self, range: ByteRange, offset: u64) -> io::Result<Bytes> {
        debug_assert!(range.start <= offset && offset <= range.end);
        let rest = range.end - offset + 1;
        let max = usize::try_from(rest).map_or(self.chunk_size, |rest| rest.min(self.chunk_size));

        match &mut self.source {
            RangeReadable::Seekable(body) => {
                let result = read_seekable(body, self.seeked, range, offset, max).await;
                self.seeked = result.as_ref().ok().map(|chunk| offset + chunk.len() as u64);
                result
            }
            RangeReadable::RandomAccess(bytes) => {
                let window = ByteRange::new(offset, offset + max as u64 - 1);
                slice_window(bytes, window).map_err(|_| {
                    let received = (bytes.len() as u64).saturating_sub(range.start).min(range.len());
                    StreamFault::UnexpectedEof { range, received }.into()
                })
            }
            RangeReadable::SequentialStream(stream) => {
                read_sequential(stream, &mut self.cursor, range, offset, max).await
            }
        }
    }
}

/// A boxed [`SeekableBody`] with a sized, `Unpin` face, as taken by
/// [`RangedStream`](crate::RangedStream).
pub(crate) struct BoxedBody(pub(crate) Pin<Box<dyn SeekableBody>>);

impl AsyncRead for BoxedBody {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().0.as_mut().poll_read(cx, buf)
    }
}

impl AsyncSeekStart for BoxedBody {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        self.get_mut().0.as_mut().start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        self.get_mut().0.as_mut().poll_complete(cx)
    }
}

/// Seek `body` to `position`, failing if the seek lands anywhere else.
pub(crate) async fn seek_start(body: &mut Pin<Box<dyn SeekableBody>>, position: u64) -> io::Result<()> {
    // settle any seek still in flight before starting a new one
    poll_fn(|cx| body.as_mut().poll_complete(cx)).await?;
    body.as_mut().start_seek(position)?;
    let landed = poll_fn(|cx| body.as_mut().poll_complete(cx)).await?;
    if landed != position {
        return Err(StreamFault::SeekMismatch { expected: position, actual: landed }.into());
    }
    Ok(())
}

async fn read_seekable(
    body: &mut Pin<Box<dyn SeekableBody>>,
    seeked: Option<u64>,
    range: ByteRange,
    offset: u64,
    max: usize,
) -> io::Result<Bytes> {
    if seeked != Some(offset) {
        seek_start(body, offset).await?;
    }

    let mut buffer = BytesMut::zeroed(max);
    let n = body.read(&mut buffer).await?;
    if n == 0 {
        return Err(StreamFault::UnexpectedEof { range, received: offset - range.start }.into());
    }
    buffer.truncate(n);
    Ok(buffer.freeze())
}

pub(crate) fn slice_window(bytes: &Bytes, range: ByteRange) -> Result<Bytes, StreamFault> {
    let available = bytes.len() as u64;
    if range.end >= available {
        let received = available.saturating_sub(range.start);
        return Err(StreamFault::UnexpectedEof { range, received });
    }
    // range.end < bytes.len(), so both bounds fit in usize
    Ok(bytes.slice(range.start as usize..=range.end as usize))
}

async fn read_sequential(
    stream: &mut BoxStream<'static, io::Result<Bytes>>,
    cursor: &mut RangeCursor,
    range: ByteRange,
    offset: u64,
    max: usize,
) -> io::Result<Bytes> {
    cursor.trim(offset);

    if offset < cursor.position() {
        return cursor.replay(offset, max).ok_or_else(|| {
            StreamFault::RangeBehindCursor { range, position: cursor.position() }.into()
        });
    }

    loop {
        let chunk = match cursor.take_pending() {
            Some(chunk) => chunk,
            None => match stream.next().await {
                Some(chunk) => chunk?,
                None => {
                    let received = offset - range.start;
                    return Err(StreamFault::UnexpectedEof { range, received }.into());
                }
            },
        };
        if let Some(window) = cursor.window(chunk, offset, max) {
            return Ok(window);
        }
    }
}
