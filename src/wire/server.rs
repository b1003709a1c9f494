//! TCP front end speaking newline-delimited JSON.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::service::AdmissionService;
use crate::error::Result;
use crate::ratelimit::Dispatcher;

/// Longest request line accepted by default, newline excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 8 * 1024;

/// Admission server: one JSON request per line in, one JSON response per
/// line out.
pub struct AdmissionServer {
    /// Address to bind to
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    max_line_bytes: usize,
}

impl AdmissionServer {
    /// Create a server for `addr` answering from `dispatcher`.
    pub fn new(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            addr,
            dispatcher,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Cap request lines at `max_line_bytes`. Longer lines are discarded
    /// and answered with an error.
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Run until the process is killed.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Run until `signal` resolves. Open connections are closed once the
    /// request they are processing has been answered.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind admission server");
            e
        })?;
        self.serve_listener(listener, signal).await
    }

    /// Accept connections on an already bound listener until `signal`
    /// resolves. The configured address is ignored.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        run(listener, self.dispatcher, self.max_line_bytes, signal).await
    }
}

async fn run<F>(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    max_line_bytes: usize,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        algorithm = ?dispatcher.algorithm(),
        max_line_bytes = max_line_bytes,
        "Admission server listening"
    );

    let service = Arc::new(AdmissionService::new(dispatcher));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut incoming = TcpListenerStream::new(listener);
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = &mut signal => break,
            next = incoming.next() => {
                let stream = match next {
                    Some(Ok(stream)) => stream,
                    Some(Err(e)) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                    None => break,
                };
                let peer = match stream.peer_addr() {
                    Ok(peer) => peer,
                    Err(e) => {
                        debug!(error = %e, "Connection closed before it was accepted");
                        continue;
                    }
                };

                let span = info_span!("connection", id = %Uuid::new_v4(), peer = %peer);
                let service = Arc::clone(&service);
                let shutdown = shutdown_rx.clone();
                tokio::spawn(
                    async move {
                        let result =
                            handle_connection(stream, peer, service, shutdown, max_line_bytes)
                                .await;
                        if let Err(e) = result {
                            debug!(error = %e, "Connection ended with error");
                        }
                    }
                    .instrument(span),
                );
            }
        }
    }

    let _ = shutdown_tx.send(true);
    info!(addr = %local_addr, "Admission server stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: Arc<AdmissionService>,
    mut shutdown: watch::Receiver<bool>,
    max_line_bytes: usize,
) -> Result<()> {
    debug!("Connection opened");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, &mut buf, max_line_bytes) => frame?,
            _ = shutdown.changed() => break,
        };

        let mut response = match frame {
            Frame::Eof => break,
            Frame::TooLong => {
                warn!(max_line_bytes = max_line_bytes, "Request line too long");
                format!(r#"{{"error":"request line exceeds {max_line_bytes} bytes"}}"#)
            }
            Frame::Line(line) if line.trim().is_empty() => continue,
            Frame::Line(line) => service.handle_line(&line, peer).await,
        };
        response.push('\n');
        writer.write_all(response.as_bytes()).await?;
    }

    debug!("Connection closed");
    Ok(())
}

#[derive(Debug, PartialEq)]
enum Frame {
    Line(String),
    /// The line was longer than allowed and has been skipped
    TooLong,
    Eof,
}

/// Read one newline-terminated line holding at most `max_len` bytes.
///
/// Never buffers more than `max_len + 1` bytes of a line: an over-long line
/// is drained up to its newline in bounded chunks and reported as
/// [`Frame::TooLong`]. A final line without a newline is still returned.
async fn read_frame<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max_len as u64 + 1;
    buf.clear();
    if (&mut *reader).take(limit).read_until(b'\n', buf).await? == 0 {
        return Ok(Frame::Eof);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() as u64 == limit {
        loop {
            buf.clear();
            let read = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
            if read == 0 || buf.last() == Some(&b'\n') {
                break;
            }
        }
        buf.clear();
        return Ok(Frame::TooLong);
    }

    Ok(Frame::Line(String::from_utf8_lossy(buf).into_owned()))
}
