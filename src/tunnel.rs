use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Ceiling on bytes buffered per direction before reads are paused.
pub const MAX_INTERMEDIARY_BUFFER: usize = 64 * 1024;

/// Bytes pulled from the source socket per read.
const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Reading from the source and flushing to the destination.
    Active,
    /// Buffer over the ceiling; reads stay paused until it drains.
    Backpressured,
    /// Source reached EOF; flush what is left, then shut the destination down.
    Draining,
    /// Terminal.
    Closed,
}

/// One direction of an established tunnel: a FIFO buffer between a source
/// socket and a destination socket, with its own flow-control state. The
/// paired direction never touches this buffer.
struct Direction {
    label: &'static str,
    state: State,
    buf: BytesMut,
    bytes: u64,
}

impl Direction {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            state: State::Active,
            buf: BytesMut::with_capacity(READ_CHUNK),
            bytes: 0,
        }
    }

    fn poll_pump<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut src: Pin<&mut R>,
        mut dst: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            if self.state == State::Closed {
                return Poll::Ready(Ok(()));
            }

            // Flush whatever the destination will take right now.
            while !self.buf.is_empty() {
                match dst.as_mut().poll_write(cx, &self.buf) {
                    Poll::Pending => break,
                    Poll::Ready(Ok(0)) => {
                        // Destination can never take more; stop sourcing it.
                        self.state = State::Closed;
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    Poll::Ready(Ok(n)) => {
                        self.buf.advance(n);
                        self.bytes += n as u64;
                    }
                    Poll::Ready(Err(e)) => {
                        self.state = State::Closed;
                        return Poll::Ready(Err(e));
                    }
                }
            }

            if self.state == State::Backpressured && self.buf.len() < MAX_INTERMEDIARY_BUFFER {
                self.state = State::Active;
            }

            match self.state {
                State::Draining => {
                    if !self.buf.is_empty() {
                        // Write waker is registered from the flush above.
                        return Poll::Pending;
                    }
                    match dst.as_mut().poll_shutdown(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(result) => {
                            self.state = State::Closed;
                            result?;
                        }
                    }
                }
                State::Backpressured => return Poll::Pending,
                State::Active => {
                    let mut chunk = [0u8; READ_CHUNK];
                    let mut read_buf = ReadBuf::new(&mut chunk);
                    match src.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(())) if read_buf.filled().is_empty() => {
                            self.state = State::Draining;
                        }
                        Poll::Ready(Ok(())) => {
                            self.buf.extend_from_slice(read_buf.filled());
                            if self.buf.len() > MAX_INTERMEDIARY_BUFFER {
                                self.state = State::Backpressured;
                            }
                        }
                        Poll::Ready(Err(e)) => {
                            // Treat a broken source like EOF; the destination
                            // still gets the buffered bytes.
                            tracing::debug!(direction = self.label, error = %e, "tunnel read failed");
                            self.state = State::Draining;
                        }
                    }
                }
                State::Closed => {}
            }
        }
    }
}

/// Bidirectional byte pump between two live sockets.
///
/// Takes ownership of both sockets at protocol-switch handoff and runs
/// until both directions have shut down. Each direction owns its buffer
/// and flow control; a fault on one socket tears down only the directions
/// that can no longer make progress.
pub struct Tunnel<C, O> {
    client: C,
    origin: O,
    client_to_origin: Direction,
    origin_to_client: Direction,
}

impl<C, O> Tunnel<C, O>
where
    C: AsyncRead + AsyncWrite + Unpin,
    O: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(client: C, origin: O) -> Self {
        Self {
            client,
            origin,
            client_to_origin: Direction::new("client->origin"),
            origin_to_client: Direction::new("origin->client"),
        }
    }

    /// Pump until both directions are closed. Returns the byte counts
    /// relayed client-to-origin and origin-to-client.
    pub async fn run(mut self) -> (u64, u64) {
        std::future::poll_fn(|cx| self.poll_directions(cx)).await
    }

    fn poll_directions(&mut self, cx: &mut Context<'_>) -> Poll<(u64, u64)> {
        let up = poll_settled(
            &mut self.client_to_origin,
            cx,
            Pin::new(&mut self.client),
            Pin::new(&mut self.origin),
        );
        let down = poll_settled(
            &mut self.origin_to_client,
            cx,
            Pin::new(&mut self.origin),
            Pin::new(&mut self.client),
        );
        if up && down {
            Poll::Ready((self.client_to_origin.bytes, self.origin_to_client.bytes))
        } else {
            Poll::Pending
        }
    }
}

/// Poll one direction; true once it has reached its terminal state.
/// Faults are local to the direction and only logged.
fn poll_settled<R, W>(
    dir: &mut Direction,
    cx: &mut Context<'_>,
    src: Pin<&mut R>,
    dst: Pin<&mut W>,
) -> bool
where
    R: AsyncRead + ?Sized,
    W: AsyncWrite + ?Sized,
{
    match dir.poll_pump(cx, src, dst) {
        Poll::Ready(Ok(())) => true,
        Poll::Ready(Err(e)) => {
            tracing::debug!(direction = dir.label, error = %e, "tunnel direction failed");
            true
        }
        Poll::Pending => false,
    }
}
