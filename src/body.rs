//! Body framing enforcement.
//!
//! [`RequestBody`] and [`ResponseBody`] wrap the wire codec's raw sink and
//! source. They count the bytes that actually move, enforce the declared
//! content length, and report each direction's completion exactly once,
//! whether the body ends cleanly, fails, or is dropped mid-flight.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project::{pin_project, pinned_drop};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::call::ExchangeCore;
use crate::error::{Error, FramingError};

fn framing_io(framing: FramingError) -> io::Error {
    let kind = match framing {
        FramingError::Overrun { .. } => io::ErrorKind::InvalidData,
        FramingError::Truncated { .. } => io::ErrorKind::UnexpectedEof,
    };
    io::Error::new(kind, framing)
}

// io::Error is not Clone; the completion path keeps a reconstruction and the
// caller gets the original.
fn mirror(error: &io::Error) -> io::Error {
    io::Error::new(error.kind(), error.to_string())
}

/// A request body sink with content-length enforcement.
///
/// Writing more than the declared length fails immediately; shutting down
/// short of it reports the body as truncated. A wrapper dropped before
/// shutdown completes the direction as canceled unless the declared length
/// was reached.
#[pin_project(PinnedDrop)]
#[derive(Debug)]
pub struct RequestBody<W> {
    #[pin]
    inner: W,
    core: Arc<ExchangeCore>,
    content_length: Option<u64>,
    written: u64,
    completed: bool,
}

impl<W> RequestBody<W> {
    pub(crate) fn new(inner: W, core: Arc<ExchangeCore>, content_length: Option<u64>) -> Self {
        Self {
            inner,
            core,
            content_length,
            written: 0,
            completed: false,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl<W: AsyncWrite> AsyncWrite for RequestBody<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if *this.completed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "request body already completed",
            )));
        }
        if let Some(expected) = *this.content_length {
            if *this.written + buf.len() as u64 > expected {
                *this.completed = true;
                let framing = FramingError::Overrun { expected };
                let _ = this
                    .core
                    .complete_request(*this.written, Some(Error::Framing(framing.clone())));
                return Poll::Ready(Err(framing_io(framing)));
            }
        }
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                *this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(error)) => {
                *this.completed = true;
                let _ = this
                    .core
                    .complete_request(*this.written, Some(Error::Io(mirror(&error))));
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_flush(cx) {
            Poll::Ready(Err(error)) if !*this.completed => {
                *this.completed = true;
                let _ = this
                    .core
                    .complete_request(*this.written, Some(Error::Io(mirror(&error))));
                Poll::Ready(Err(error))
            }
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                if !*this.completed {
                    *this.completed = true;
                    match *this.content_length {
                        Some(expected) if *this.written < expected => {
                            let framing = FramingError::Truncated {
                                expected,
                                actual: *this.written,
                            };
                            let _ = this.core.complete_request(
                                *this.written,
                                Some(Error::Framing(framing.clone())),
                            );
                            return Poll::Ready(Err(framing_io(framing)));
                        }
                        _ => {
                            let _ = this.core.complete_request(*this.written, None);
                        }
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                if !*this.completed {
                    *this.completed = true;
                    let _ = this
                        .core
                        .complete_request(*this.written, Some(Error::Io(mirror(&error))));
                }
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl<W> PinnedDrop for RequestBody<W> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.completed {
            return;
        }
        *this.completed = true;
        match *this.content_length {
            // A fully written body that was never shut down still counts.
            Some(expected) if *this.written == expected => {
                let _ = this.core.complete_request(*this.written, None);
            }
            Some(expected) => {
                let _ = this.core.complete_request(
                    *this.written,
                    Some(Error::Framing(FramingError::Truncated {
                        expected,
                        actual: *this.written,
                    })),
                );
            }
            None => {
                let _ = this
                    .core
                    .complete_request(*this.written, Some(Error::Canceled));
            }
        }
    }
}

/// A response body source with content-length enforcement.
///
/// With a declared length, reading exactly that many bytes completes the
/// body without waiting for the transport's end of stream, and anything
/// beyond it is an overrun. Without one, a clean end of stream completes
/// the body. A wrapper dropped before either completes the direction as
/// canceled.
#[pin_project(PinnedDrop)]
#[derive(Debug)]
pub struct ResponseBody<R> {
    #[pin]
    inner: R,
    core: Arc<ExchangeCore>,
    content_length: Option<u64>,
    read: u64,
    completed: bool,
    // logical EOF: further polls read nothing
    done: bool,
}

impl<R> ResponseBody<R> {
    pub(crate) fn new(inner: R, core: Arc<ExchangeCore>, content_length: Option<u64>) -> Self {
        Self {
            inner,
            core,
            content_length,
            read: 0,
            completed: false,
            done: false,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }
}

impl<R: AsyncRead> AsyncRead for ResponseBody<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.done {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                if n == 0 {
                    *this.done = true;
                    if let Some(expected) = *this.content_length {
                        if *this.read < expected {
                            *this.completed = true;
                            let framing = FramingError::Truncated {
                                expected,
                                actual: *this.read,
                            };
                            let _ = this.core.complete_response(
                                *this.read,
                                Some(Error::Framing(framing.clone())),
                            );
                            return Poll::Ready(Err(framing_io(framing)));
                        }
                    }
                    if !*this.completed {
                        *this.completed = true;
                        let _ = this.core.complete_response(*this.read, None);
                    }
                    return Poll::Ready(Ok(()));
                }
                *this.read += n;
                if let Some(expected) = *this.content_length {
                    if *this.read > expected {
                        *this.completed = true;
                        *this.done = true;
                        let framing = FramingError::Overrun { expected };
                        let _ = this.core.complete_response(
                            *this.read,
                            Some(Error::Framing(framing.clone())),
                        );
                        return Poll::Ready(Err(framing_io(framing)));
                    }
                    if *this.read == expected {
                        // Exact length: complete now, without waiting for the
                        // transport to end the stream.
                        *this.completed = true;
                        *this.done = true;
                        let _ = this.core.complete_response(*this.read, None);
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => {
                *this.completed = true;
                *this.done = true;
                let _ = this
                    .core
                    .complete_response(*this.read, Some(Error::Io(mirror(&error))));
                Poll::Ready(Err(error))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl<R> PinnedDrop for ResponseBody<R> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.completed {
            return;
        }
        *this.completed = true;
        let _ = this
            .core
            .complete_response(*this.read, Some(Error::Canceled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};

    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::address::Address;
    use crate::call::{CallId, Exchange, Options, Transmitter};
    use crate::codec::{Codec, CodecFactory};
    use crate::conn::Connection;
    use crate::dns::{Dns, StaticDns};
    use crate::events::EventListener;
    use crate::pool::{Pool, PoolConfig};

    #[derive(Debug, Default)]
    struct Recording(Mutex<Vec<String>>);

    impl Recording {
        fn contains(&self, entry: &str) -> bool {
            self.0.lock().iter().any(|e| e == entry)
        }

        fn any_starts_with(&self, prefix: &str) -> bool {
            self.0.lock().iter().any(|e| e.starts_with(prefix))
        }
    }

    impl EventListener for Recording {
        fn request_body_end(&self, _call: CallId, bytes: u64) {
            self.0.lock().push(format!("request_body_end:{bytes}"));
        }

        fn request_failed(&self, _call: CallId, error: &Error) {
            self.0.lock().push(format!("request_failed:{error}"));
        }

        fn response_body_end(&self, _call: CallId, bytes: u64) {
            self.0.lock().push(format!("response_body_end:{bytes}"));
        }

        fn response_failed(&self, _call: CallId, error: &Error) {
            self.0.lock().push(format!("response_failed:{error}"));
        }
    }

    #[derive(Debug)]
    struct NoopCodec;

    impl Codec for NoopCodec {
        fn cancel(&self) {}
    }

    #[derive(Debug)]
    struct NoopFactory;

    impl CodecFactory for NoopFactory {
        fn bind(&self, _connection: &Arc<Connection>) -> Arc<dyn Codec> {
            Arc::new(NoopCodec)
        }
    }

    async fn exchange() -> (Exchange, Transmitter, Arc<Recording>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let dns: Arc<dyn Dns> =
            Arc::new(StaticDns::new().with("one.example", [IpAddr::V4(Ipv4Addr::LOCALHOST)]));
        let address = Arc::new(Address::new("one.example", addr.port()).with_dns(dns));

        let events = Arc::new(Recording::default());
        let transmitter = Transmitter::new(
            Pool::new(PoolConfig::default()),
            Options::default(),
            events.clone(),
        );
        transmitter.prepare(address);
        let exchange = transmitter.new_exchange(&NoopFactory, true).await.unwrap();
        (exchange, transmitter, events)
    }

    #[tokio::test]
    async fn request_completes_on_shutdown() {
        let (exchange, _tx, events) = exchange().await;
        let (sink, _keep) = tokio::io::duplex(1024);
        let mut body = exchange.request_body(sink, Some(5));
        body.write_all(b"hello").await.unwrap();
        body.shutdown().await.unwrap();
        assert_eq!(body.written(), 5);
        assert!(events.contains("request_body_end:5"));
    }

    #[tokio::test]
    async fn writing_past_the_declared_length_is_an_overrun() {
        let (exchange, _tx, events) = exchange().await;
        let (sink, _keep) = tokio::io::duplex(1024);
        let mut body = exchange.request_body(sink, Some(3));
        let error = body.write_all(b"hello").await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::InvalidData);
        assert!(events.any_starts_with("request_failed:"));
    }

    #[tokio::test]
    async fn shutting_down_short_is_truncation() {
        let (exchange, _tx, events) = exchange().await;
        let (sink, _keep) = tokio::io::duplex(1024);
        let mut body = exchange.request_body(sink, Some(5));
        body.write_all(b"hi").await.unwrap();
        let error = body.shutdown().await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
        assert!(events.any_starts_with("request_failed:"));
    }

    #[tokio::test]
    async fn exact_length_response_completes_without_eof() {
        let (exchange, _tx, events) = exchange().await;
        let (source, mut far) = tokio::io::duplex(1024);
        far.write_all(b"hello").await.unwrap();
        // The far end stays open: completion must not depend on EOF.

        let mut body = exchange.response_body(source, Some(5));
        let mut buf = [0u8; 5];
        body.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert!(events.contains("response_body_end:5"));

        // Past the declared length the wrapper is at EOF.
        let n = body.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn a_short_response_stream_is_truncation() {
        let (exchange, _tx, events) = exchange().await;
        let (source, mut far) = tokio::io::duplex(1024);
        far.write_all(b"hi").await.unwrap();
        drop(far);

        let mut body = exchange.response_body(source, Some(5));
        let mut sink = Vec::new();
        let error = body.read_to_end(&mut sink).await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
        assert!(events.any_starts_with("response_failed:"));
    }

    #[tokio::test]
    async fn an_unbounded_response_completes_at_eof() {
        let (exchange, _tx, events) = exchange().await;
        let (source, mut far) = tokio::io::duplex(1024);
        far.write_all(b"streaming").await.unwrap();
        drop(far);

        let mut body = exchange.response_body(source, None);
        let mut sink = Vec::new();
        body.read_to_end(&mut sink).await.unwrap();
        assert_eq!(sink, b"streaming");
        assert!(events.contains("response_body_end:9"));
    }

    #[tokio::test]
    async fn a_quiet_source_leaves_the_reader_pending() {
        let (exchange, _tx, _events) = exchange().await;
        let (source, _far) = tokio::io::duplex(1024);
        let mut body = exchange.response_body(source, Some(5));
        let mut buf = [0u8; 5];
        let mut read = std::pin::pin!(body.read_exact(&mut buf));
        assert!(futures_util::poll!(read.as_mut()).is_pending());
    }

    #[tokio::test]
    async fn dropping_an_unfinished_body_fails_the_direction() {
        let (exchange, _tx, events) = exchange().await;
        let (source, _far) = tokio::io::duplex(1024);
        let body = exchange.response_body(source, Some(5));
        drop(body);
        assert!(events.any_starts_with("response_failed:"));
    }

    #[tokio::test]
    async fn completion_fires_once_per_direction() {
        let (exchange, _tx, events) = exchange().await;
        let (sink, _keep) = tokio::io::duplex(1024);
        let mut body = exchange.request_body(sink, Some(2));
        body.write_all(b"ok").await.unwrap();
        body.shutdown().await.unwrap();
        drop(body);

        let count = events
            .0
            .lock()
            .iter()
            .filter(|e| e.starts_with("request_body_end:"))
            .count();
        assert_eq!(count, 1);
    }
}
