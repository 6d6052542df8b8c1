//! Per-connection session handling.
//!
//! A session reads one frame at a time, converts it and writes exactly one
//! reply before reading the next frame. A request that cannot be computed is
//! answered with the fallback reply and the session carries on; only `quit`
//! or a closed stream ends it.

use crate::protocol::{self, Frame, FrameDecoder, Query, Reply, Request};
use crate::transformer::{Point, TransformError, Transformer, TransformerFactory};
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 1024;

/// Handle a single client connection until `quit` or end of stream.
pub async fn handle_session<S>(mut stream: S, factory: &dyn TransformerFactory) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut decoder = FrameDecoder::default();
    let mut short_read = false;
    let mut transformer: Option<Box<dyn Transformer>> = None;

    loop {
        let frame = match decoder.decode(&mut buffer, short_read) {
            Some(Frame::Line(frame)) => frame,
            Some(Frame::Overflow) => {
                debug!(max = protocol::MAX_LINE_LENGTH, "Request line too long");
                stream.write_all(&Reply::Fallback.encode()).await?;
                continue;
            }
            None => {
                buffer.reserve(BUFFER_SIZE);
                let spare = buffer.capacity() - buffer.len();
                let n = stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    trace!("Connection closed by client");
                    return Ok(());
                }
                short_read = n < spare;
                continue;
            }
        };

        let query = match protocol::parse_request(&frame) {
            Ok(Request::Quit) => {
                stream.write_all(&Reply::Ack.encode()).await?;
                stream.shutdown().await?;
                trace!("Session ended by quit");
                return Ok(());
            }
            Ok(Request::Convert(query)) => Ok(query),
            Err(e) => Err(e),
        };

        info!(request = %String::from_utf8_lossy(&frame).trim(), "Processing");

        let reply = match query {
            Ok(query) => match convert(&mut transformer, factory, query).await {
                Ok(point) => Reply::Point(point),
                Err(e) => {
                    debug!(error = %e, "Conversion failed");
                    Reply::Fallback
                }
            },
            Err(e) => {
                debug!(error = %e, "Malformed request");
                Reply::Fallback
            }
        };

        stream.write_all(&reply.encode()).await?;
    }
}

/// Run one conversion on the blocking pool.
///
/// The session's transformer moves onto the blocking thread and back. If the
/// transformer panics it is lost and the next request creates a fresh one.
async fn convert(
    slot: &mut Option<Box<dyn Transformer>>,
    factory: &dyn TransformerFactory,
    query: Query,
) -> Result<Point, TransformError> {
    let mut transformer = match slot.take() {
        Some(transformer) => transformer,
        None => factory.create(),
    };

    let task = tokio::task::spawn_blocking(move || {
        let result = transformer.convert(query.lat, query.lon, &query.obstime);
        (transformer, result)
    });

    match task.await {
        Ok((transformer, result)) => {
            *slot = Some(transformer);
            match result {
                Ok(point) if !point.is_finite() => Err(TransformError::Failed(format!(
                    "non-finite result {}, {}",
                    point.x, point.y
                ))),
                other => other,
            }
        }
        Err(e) => Err(TransformError::Failed(format!("transformer task failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FALLBACK_REPLY;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::io::Builder;

    struct Constant(Point);

    impl Transformer for Constant {
        fn convert(&mut self, _: f64, _: f64, _: &str) -> Result<Point, TransformError> {
            Ok(self.0)
        }
    }

    /// Returns the inputs swapped so replies can be matched to requests.
    struct Swap;

    impl Transformer for Swap {
        fn convert(&mut self, lat: f64, lon: f64, _: &str) -> Result<Point, TransformError> {
            Ok(Point::new(lon, lat))
        }
    }

    /// Fails for one obstime, panics for another, swaps otherwise.
    struct Flaky;

    impl Transformer for Flaky {
        fn convert(&mut self, lat: f64, lon: f64, obstime: &str) -> Result<Point, TransformError> {
            match obstime {
                "fail" => Err(TransformError::Failed("bad obstime".to_string())),
                "panic" => panic!("transformer blew up"),
                "nan" => Ok(Point::new(f64::NAN, 0.0)),
                _ => Ok(Point::new(lon, lat)),
            }
        }
    }

    fn constant(x: f64, y: f64) -> impl TransformerFactory {
        move || Box::new(Constant(Point::new(x, y))) as Box<dyn Transformer>
    }

    fn swap() -> impl TransformerFactory {
        || Box::new(Swap) as Box<dyn Transformer>
    }

    #[tokio::test]
    async fn test_successful_conversion() {
        let stream = Builder::new()
            .read(b"10.0 20.0 2020-01-01T00:00:00\n")
            .write(b"1.5, -2.25")
            .build();

        handle_session(stream, &constant(1.5, -2.25)).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_fallback() {
        let stream = Builder::new()
            .read(b"abc def xyz\n")
            .write(FALLBACK_REPLY)
            .read(b"1.0 2.0\n")
            .write(FALLBACK_REPLY)
            .build();

        handle_session(stream, &constant(1.5, -2.25)).await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_acknowledges_and_stops_reading() {
        // Nothing after the ack may be read or written; the mock panics on
        // any unexpected operation.
        let stream = Builder::new().read(b"quit\n").write(b"ok").build();

        handle_session(stream, &swap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_without_newline() {
        let stream = Builder::new().read(b"  quit ").write(b"ok").build();

        handle_session(stream, &swap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_answered_in_order() {
        let stream = Builder::new()
            .read(b"1.0 2.0 t\n3.0 4.0 t\n")
            .write(b"2.0, 1.0")
            .write(b"4.0, 3.0")
            .read(b"5.0 6.0 t")
            .write(b"6.0, 5.0")
            .read(b"quit\n")
            .write(b"ok")
            .build();

        handle_session(stream, &swap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_do_not_end_session() {
        let factory = || Box::new(Flaky) as Box<dyn Transformer>;
        let stream = Builder::new()
            .read(b"1.0 2.0 fail\n")
            .write(FALLBACK_REPLY)
            .read(b"1.0 2.0 panic\n")
            .write(FALLBACK_REPLY)
            .read(b"1.0 2.0 nan\n")
            .write(FALLBACK_REPLY)
            .read(b"1.0 2.0 ok\n")
            .write(b"2.0, 1.0")
            .build();

        handle_session(stream, &factory).await.unwrap();
    }

    #[tokio::test]
    async fn test_transformer_created_once_per_session() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Swap) as Box<dyn Transformer>
        };

        let stream = Builder::new()
            .read(b"1.0 2.0 t\n")
            .write(b"2.0, 1.0")
            .read(b"3.0 4.0 t\n")
            .write(b"4.0, 3.0")
            .build();

        handle_session(stream, &factory).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quit_before_any_request_creates_no_transformer() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let factory = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Swap) as Box<dyn Transformer>
        };

        let stream = Builder::new().read(b"quit").write(b"ok").build();

        handle_session(stream, &factory).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_long_line_gets_one_reply() {
        let mut line = b"1.0 2.0 ".to_vec();
        line.extend(std::iter::repeat(b't').take(3000));
        line.push(b'\n');

        let stream = Builder::new()
            .read(&line)
            .write(b"2.0, 1.0")
            .read(b"3.0 4.0 t\n")
            .write(b"4.0, 3.0")
            .build();

        handle_session(stream, &swap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_line_over_limit_gets_one_fallback() {
        let mut line = b"1.0 2.0 ".to_vec();
        line.extend(std::iter::repeat(b't').take(protocol::MAX_LINE_LENGTH * 2));
        line.push(b'\n');

        let stream = Builder::new()
            .read(&line)
            .write(FALLBACK_REPLY)
            .read(b"3.0 4.0 t\n")
            .write(b"4.0, 3.0")
            .build();

        handle_session(stream, &swap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_stream_ends_silently() {
        let stream = Builder::new().build();

        handle_session(stream, &swap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_error_ends_session() {
        let stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        assert!(handle_session(stream, &swap()).await.is_err());
    }
}
