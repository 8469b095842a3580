//! TCP front end: accept connections, frame lines, dispatch, reply.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::handler::HitHandler;
use crate::metrics::{gauge, increment, MetricsSink};
use crate::wire::{self, Reply, Request};

/// Default cap on one request line, newline excluded.
pub const DEFAULT_MAX_LINE_LEN: usize = 8 * 1024;

/// Default time given to live connections to finish after shutdown begins.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The divvy TCP server.
///
/// Each accepted connection runs on its own task and processes requests
/// strictly in order: one line in, one reply out. The rule table behind the
/// handler is immutable, so connections share it without synchronization.
pub struct Server<S> {
    listener: TcpListener,
    handler: Arc<HitHandler<S>>,
    sink: S,
    max_line_len: usize,
    max_connections: Option<usize>,
    shutdown_grace: Duration,
    connections: Arc<AtomicUsize>,
}

impl<S> Server<S>
where
    S: MetricsSink + Sync,
    S::Future: Send + 'static,
{
    /// Wrap a bound listener.
    pub fn new(listener: TcpListener, handler: HitHandler<S>, sink: S) -> Self {
        Self {
            listener,
            handler: Arc::new(handler),
            sink,
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_connections: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the per-line byte cap.
    pub fn with_max_line_len(mut self, max: usize) -> Self {
        self.max_line_len = max;
        self
    }

    /// Cap concurrent connections; excess accepts are closed immediately.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Override how long live connections get to finish after shutdown
    /// begins.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// The bound address, useful with an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves. The listener closes
    /// immediately; live connections get the grace period to finish and are
    /// force-closed after it.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            handler,
            sink,
            max_line_len,
            max_connections,
            shutdown_grace,
            connections,
        } = self;
        let addr = listener.local_addr()?;
        info!(%addr, "listening");
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let open = connections.load(Ordering::Relaxed);
                            if max_connections.is_some_and(|cap| open >= cap) {
                                warn!(%peer, open, "connection cap reached, closing");
                                drop(stream);
                                continue;
                            }
                            let open = connections.fetch_add(1, Ordering::Relaxed) + 1;
                            gauge(&sink, "connections", open as i64).await;
                            debug!(%peer, open, "connected");

                            let handler = Arc::clone(&handler);
                            let sink = sink.clone();
                            let connections = Arc::clone(&connections);
                            tasks.spawn(async move {
                                let result =
                                    handle_connection(stream, handler, sink.clone(), max_line_len)
                                        .await;
                                let open = connections.fetch_sub(1, Ordering::Relaxed) - 1;
                                gauge(&sink, "connections", open as i64).await;
                                debug!(%peer, open, "disconnected");
                                match result {
                                    Ok(()) => {}
                                    Err(error) if is_disconnect(&error) => {
                                        debug!(%peer, %error, "peer went away");
                                    }
                                    Err(error) => {
                                        warn!(%peer, %error, "connection failed");
                                        increment(&sink, "error.internal").await;
                                    }
                                }
                            });
                        }
                        Err(error) => {
                            warn!(%error, "failed to accept connection");
                        }
                    }
                }
            }
        }

        // Stop accepting right away, then give live connections the grace
        // period before tearing them down.
        drop(listener);
        if !tasks.is_empty() {
            info!(open = tasks.len(), "draining connections");
            let drained =
                timeout(shutdown_grace, async { while tasks.join_next().await.is_some() {} }).await;
            if drained.is_err() {
                warn!(open = tasks.len(), "grace deadline elapsed, force-closing connections");
                tasks.shutdown().await;
            }
        }

        Ok(())
    }

    /// Run until ctrl-C.
    pub async fn run_until_ctrl_c(self) -> io::Result<()> {
        self.run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_connection<S>(
    stream: TcpStream,
    handler: Arc<HitHandler<S>>,
    sink: S,
    max_line_len: usize,
) -> io::Result<()>
where
    S: MetricsSink + Sync,
    S::Future: Send + 'static,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        let request = match read_capped_line(&mut reader, &mut buf, max_line_len).await? {
            LineRead::Eof => return Ok(()),
            LineRead::TooLong => Err(ProtocolError::LineTooLong),
            LineRead::Line => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                wire::parse_request(line)
            }
        };

        match request {
            Ok(Request::Hit(op)) => {
                let reply = handler.handle(op).await;
                write_reply(&mut write_half, &reply).await?;
            }
            Err(err) => {
                increment(&sink, format!("error.{}", err.kind())).await;
                write_reply(&mut write_half, &Reply::from_error(&err)).await?;
                if err.is_fatal() {
                    return Ok(());
                }
            }
        }
    }
}

/// Whether an I/O error just means the peer hung up.
fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

/// Read one LF-terminated line into `buf`, refusing to buffer more than
/// `max_len` bytes of content. The limit is enforced mid-read so an
/// unterminated line cannot grow the buffer without bound.
async fn read_capped_line(
    reader: &mut BufReader<OwnedReadHalf>,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<LineRead> {
    let mut limited = reader.take(max_len as u64 + 1);
    let n = limited.read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.last() != Some(&b'\n') {
        if buf.len() > max_len {
            return Ok(LineRead::TooLong);
        }
        // Peer closed mid-line; nothing left to answer.
        return Ok(LineRead::Eof);
    }
    Ok(LineRead::Line)
}

async fn write_reply<W>(writer: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(reply.to_line().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capped_read_accepts_lines_at_the_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"12345\nway too long\n").await.unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut buf = Vec::new();
        assert!(matches!(
            read_capped_line(&mut reader, &mut buf, 5).await.unwrap(),
            LineRead::Line
        ));
        assert_eq!(buf, b"12345\n".to_vec());

        buf.clear();
        assert!(matches!(
            read_capped_line(&mut reader, &mut buf, 5).await.unwrap(),
            LineRead::TooLong
        ));

        client.await.unwrap();
    }
}
