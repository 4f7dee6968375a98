use std::{io, mem};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::{AsyncSeekStart, ByteRange, RangeCursor, StreamFault, DEFAULT_CHUNK_SIZE};

/// Streams exactly one range out of a seekable body: one seek, then chunked
/// reads until the range is exhausted. Implements [`Stream`] and [`Body`].
pub struct RangedStream<B> {
    state: StreamState,
    range: ByteRange,
    chunk_size: usize,
    auto_close: bool,
    body: Option<B>,
}

#[derive(Debug)]
enum StreamState {
    Seek,
    Seeking,
    Reading { buffer: BytesMut, remaining: u64 },
    Done,
}

impl<B: AsyncRead + AsyncSeekStart + Unpin> RangedStream<B> {
    pub fn new(body: B, range: ByteRange) -> Self {
        RangedStream {
            state: StreamState::Seek,
            range,
            chunk_size: DEFAULT_CHUNK_SIZE,
            auto_close: true,
            body: Some(body),
        }
    }

    /// Upper bound on the size of each read, and so of each emitted chunk.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Whether to drop (and so close) the body as soon as the last byte of
    /// the range has been read. Otherwise it lives as long as the stream.
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    fn finish(&mut self) {
        self.state = StreamState::Done;
        if self.auto_close {
            self.body = None;
        }
    }

    fn fail(&mut self, err: io::Error) -> Poll<Option<io::Result<Bytes>>> {
        self.state = StreamState::Done;
        self.body = None;
        Poll::Ready(Some(Err(err)))
    }
}

impl<B> Drop for RangedStream<B> {
    fn drop(&mut self) {
        if !matches!(self.state, StreamState::Done) {
            tracing::debug!(range = %self.range, "range body dropped before completion");
        }
    }
}

impl<B: AsyncRead + AsyncSeekStart + Unpin> Body for RangedStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.range.len())
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>)
        -> Poll<Option<io::Result<Frame<Bytes>>>>
    {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: AsyncRead + AsyncSeekStart + Unpin> Stream for RangedStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>
    ) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();
        let start = this.range.start;

        let Some(body) = this.body.as_mut().filter(|_| !matches!(this.state, StreamState::Done)) else {
            return Poll::Ready(None);
        };

        if let StreamState::Seek = this.state {
            if let Err(e) = Pin::new(&mut *body).start_seek(start) {
                return this.fail(e);
            }
            this.state = StreamState::Seeking;
        }

        if let StreamState::Seeking = this.state {
            match Pin::new(&mut *body).poll_complete(cx) {
                Poll::Pending => { return Poll::Pending; }
                Poll::Ready(Err(e)) => { return this.fail(e); }
                Poll::Ready(Ok(landed)) if landed != start => {
                    return this.fail(StreamFault::SeekMismatch { expected: start, actual: landed }.into());
                }
                Poll::Ready(Ok(_)) => {
                    let buffer = BytesMut::with_capacity(this.chunk_size);
                    let remaining = this.range.len();
                    this.state = StreamState::Reading { buffer, remaining };
                }
            }
        }

        let StreamState::Reading { buffer, remaining } = &mut this.state else {
            return Poll::Ready(None);
        };

        let uninit = buffer.spare_capacity_mut();

        // calculate max number of bytes to read in this iteration, the
        // smaller of the buffer size and the number of bytes remaining
        let nbytes = std::cmp::min(
            uninit.len(),
            usize::try_from(*remaining).unwrap_or(usize::MAX),
        );

        let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

        match Pin::new(&mut *body).poll_read(cx, &mut read_buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => this.fail(e),
            Poll::Ready(Ok(())) => match read_buf.filled().len() {
                0 => {
                    let received = this.range.len() - *remaining;
                    let range = this.range;
                    this.fail(StreamFault::UnexpectedEof { range, received }.into())
                }
                n => {
                    // SAFETY: poll_read has filled the buffer with `n`
                    // additional bytes. `buffer.len` should always be
                    // 0 here, but include it for rigorous correctness
                    unsafe { buffer.set_len(buffer.len() + n); }

                    let chunk = mem::replace(buffer, BytesMut::with_capacity(this.chunk_size));

                    // n <= remaining due to the cmp::min above
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        this.finish();
                    }

                    Poll::Ready(Some(Ok(chunk.freeze())))
                }
            },
        }
    }
}

/// Passes through only the bytes of one range from an upstream stream of
/// arbitrarily sized chunks, ending as soon as the range is complete.
#[pin_project]
pub struct SlicedStream<S> {
    #[pin]
    upstream: S,
    range: ByteRange,
    cursor: RangeCursor,
    done: bool,
}

impl<S> SlicedStream<S> {
    pub fn new(upstream: S, range: ByteRange) -> Self {
        SlicedStream {
            upstream,
            range,
            cursor: RangeCursor::new(),
            done: false,
        }
    }
}

impl<S: Stream<Item = io::Result<Bytes>>> Stream for SlicedStream<S> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();
        let range = *this.range;

        while !*this.done {
            match ready!(this.upstream.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let slice = this.cursor.advance(chunk, range);
                    if this.cursor.is_past(range) {
                        *this.done = true;
                        this.cursor.take_pending();
                    }
                    if let Some(slice) = slice {
                        return Poll::Ready(Some(Ok(slice)));
                    }
                }
                Some(Err(e)) => {
                    *this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    *this.done = true;
                    let received = this.cursor.position().saturating_sub(range.start);
                    return Poll::Ready(Some(Err(StreamFault::UnexpectedEof { range, received }.into())));
                }
            }
        }

        Poll::Ready(None)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::task::{Context, Poll};

    use bytes::Bytes;
    use futures::{pin_mut, stream, Stream, StreamExt};
    use http_body::Body;
    use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

    use super::{RangedStream, SlicedStream};
    use crate::ByteRange;

    const DATA: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    async fn collect_chunks(stream: impl Stream<Item = io::Result<Bytes>>) -> io::Result<Vec<Bytes>> {
        let mut chunks = Vec::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk?);
        }
        Ok(chunks)
    }

    fn concat(chunks: &[Bytes]) -> String {
        chunks.iter().map(|c| std::str::from_utf8(c).unwrap()).collect()
    }

    /// Flags when it is dropped.
    struct Tracked {
        inner: Cursor<&'static [u8]>,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl AsyncRead for Tracked {
        fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncSeek for Tracked {
        fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    #[tokio::test]
    async fn test_ranged_stream_chunks() {
        let stream = RangedStream::new(Cursor::new(DATA), ByteRange::new(10, 35)).chunk_size(10);
        assert_eq!(Some(26), Body::size_hint(&stream).exact());

        let chunks = collect_chunks(stream).await.unwrap();
        assert_eq!(vec![10, 10, 6], chunks.iter().map(Bytes::len).collect::<Vec<_>>());
        assert_eq!("ABCDEFGHIJKLMNOPQRSTUVWXYZ", concat(&chunks));
    }

    #[tokio::test]
    async fn test_ranged_stream_single_byte() {
        let stream = RangedStream::new(Cursor::new(DATA), ByteRange::new(61, 61));
        assert_eq!("z", concat(&collect_chunks(stream).await.unwrap()));
    }

    #[tokio::test]
    async fn test_ranged_stream_short_source() {
        let stream = RangedStream::new(Cursor::new(DATA), ByteRange::new(50, 70));

        let err = collect_chunks(stream).await.unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }

    #[tokio::test]
    async fn test_ranged_stream_closes_on_completion() {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = Tracked { inner: Cursor::new(DATA), dropped: dropped.clone() };
        let stream = RangedStream::new(body, ByteRange::new(0, 3));
        pin_mut!(stream);

        assert_eq!(&b"0123"[..], stream.next().await.unwrap().unwrap());
        assert!(dropped.load(Ordering::SeqCst));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ranged_stream_keeps_body_open() {
        let dropped = Arc::new(AtomicBool::new(false));
        let body = Tracked { inner: Cursor::new(DATA), dropped: dropped.clone() };
        let stream = RangedStream::new(body, ByteRange::new(0, 3)).auto_close(false);
        let mut stream = Box::pin(stream);

        assert_eq!(&b"0123"[..], stream.next().await.unwrap().unwrap());
        assert!(stream.next().await.is_none());
        assert!(!dropped.load(Ordering::SeqCst));

        drop(stream);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sliced_stream_trims_head_and_tail() {
        let chunks: Vec<io::Result<Bytes>> = DATA.chunks(7).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        let sliced = SlicedStream::new(stream::iter(chunks), ByteRange::new(5, 24));

        let out = collect_chunks(sliced).await.unwrap();
        assert_eq!("56789ABCDEFGHIJKLMNO", concat(&out));
        assert_eq!(vec![2, 7, 7, 4], out.iter().map(Bytes::len).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_sliced_stream_stops_pulling_after_range() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let upstream = stream::iter(DATA.chunks(4).map(Bytes::copy_from_slice).collect::<Vec<_>>())
            .map(move |chunk| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(chunk)
            });

        let out = collect_chunks(SlicedStream::new(upstream, ByteRange::new(0, 5))).await.unwrap();
        assert_eq!("012345", concat(&out));
        assert_eq!(2, pulled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sliced_stream_premature_end() {
        let upstream = stream::iter(vec![Ok(Bytes::from_static(b"0123456789"))]);

        let err = collect_chunks(SlicedStream::new(upstream, ByteRange::new(8, 12))).await.unwrap_err();
        assert_eq!(io::ErrorKind::UnexpectedEof, err.kind());
    }
}
