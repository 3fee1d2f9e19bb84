//! # Request Transport
//!
//! A small TCP request/response layer. A [`Server`] owns a listener and a
//! registry of named handlers; the accept loop spawns one session task per
//! connection, and each session reads newline-delimited JSON requests,
//! dispatches on the `COMMAND` name and writes the JSON response back on
//! the same connection, which may then carry further request/response
//! pairs.
//!
//! The peer owns the server, not the other way round: handlers are boxed
//! async closures capturing the peer state, so the transport never needs a
//! back-reference. Shutdown is posted to the accept loop through a
//! [`Notify`] rather than touching the listener from another task;
//! in-flight sessions run to completion.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use tracing::{debug, trace, warn};

use crate::messages::{decode_request, decode_response, encode_request, encode_response, Request, Response};

/// Upper bound on a single serialized request or response line.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// How long a client call waits for the reply, forwarding hops included.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport-level failures, distinct from protocol-level `SUCCESS=false`.
#[derive(Debug)]
pub enum TransportError {
    /// Dialing or talking to the peer failed.
    Unreachable(std::io::Error),
    /// No reply within [`REQUEST_TIMEOUT`].
    TimedOut,
    /// The peer replied with something that is not a response object.
    Malformed(String),
    /// The peer closed the connection before replying.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unreachable(err) => write!(f, "peer unreachable: {err}"),
            TransportError::TimedOut => write!(f, "request timed out"),
            TransportError::Malformed(detail) => write!(f, "malformed response: {detail}"),
            TransportError::Closed => write!(f, "connection closed before reply"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Unreachable(err)
    }
}

/// A named request handler: an async closure from request to response.
pub type Handler =
    Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync>;

/// Registry handed to the server: command name → handler.
pub type HandlerMap = HashMap<&'static str, Handler>;

/// Wrap an async handler function into the boxed form the registry wants.
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// The accept loop plus its shutdown switch.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl Server {
    /// Bind and start serving immediately.
    pub async fn bind(addr: &str, port: u16, handlers: HandlerMap) -> Result<Self> {
        let listener = TcpListener::bind((addr, port))
            .await
            .with_context(|| format!("failed to bind {addr}:{port}"))?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let handlers = Arc::new(handlers);

        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        // Close requests are posted here so the listener is
                        // only ever touched from its own task.
                        _ = shutdown.notified() => {
                            debug!(addr = %local_addr, "server shutting down");
                            break;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, remote)) => {
                                    trace!(%remote, "accepted connection");
                                    let handlers = handlers.clone();
                                    tokio::spawn(async move {
                                        if let Err(err) = run_session(stream, handlers).await {
                                            debug!(%remote, error = %err, "session ended with error");
                                        }
                                    });
                                }
                                Err(err) => {
                                    warn!(error = %err, "accept failed");
                                }
                            }
                        }
                    }
                }
            });
        }

        Ok(Server { local_addr, shutdown })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. In-flight sessions complete.
    pub fn kill(&self) {
        self.shutdown.notify_one();
    }
}

/// Serve one connection: request line in, response line out, repeat until
/// the client hangs up.
async fn run_session(stream: TcpStream, handlers: Arc<HandlerMap>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let line = match read_bounded_line(&mut reader).await? {
            Some(line) => line,
            None => return Ok(()), // client closed
        };

        let response = dispatch(&line, &handlers).await;
        let mut payload = encode_response(&response).context("response serialization failed")?;
        payload.push('\n');
        write_half.write_all(payload.as_bytes()).await?;
    }
}

/// Parse and route a single request line.
async fn dispatch(line: &str, handlers: &HandlerMap) -> Response {
    let request = match decode_request(line) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "rejecting unparseable request");
            return Response::fail(format!("invalid request: {err}"));
        }
    };

    let name = request.command.name();
    match handlers.get(name) {
        Some(handler) => {
            trace!(command = name, "dispatching request");
            handler(request).await
        }
        None => Response::fail(format!("invalid command: {name}")),
    }
}

/// Read one `\n`-terminated line of at most [`MAX_MESSAGE_SIZE`] bytes.
/// Returns `None` on a clean EOF before any byte arrives.
async fn read_bounded_line<R>(reader: &mut BufReader<R>) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut bounded = reader.take(MAX_MESSAGE_SIZE as u64 + 1);
    let read = bounded.read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("request exceeds {MAX_MESSAGE_SIZE} bytes");
    }
    let line = String::from_utf8(buf).context("request is not UTF-8")?;
    Ok(Some(line))
}

/// Send one request to `addr:port` and await the reply.
///
/// Opens a fresh connection per call; the whole exchange is bounded by
/// [`REQUEST_TIMEOUT`] so a wedged peer surfaces as
/// [`TransportError::TimedOut`] rather than a hang.
pub async fn send_request(
    addr: &str,
    port: u16,
    request: &Request,
) -> Result<Response, TransportError> {
    let payload = {
        let mut text = encode_request(request)
            .map_err(|err| TransportError::Malformed(err.to_string()))?;
        text.push('\n');
        text
    };

    let exchange = async {
        let stream = TcpStream::connect((addr, port)).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(payload.as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let read = (&mut reader)
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Err(TransportError::Closed);
        }
        decode_response(line.trim_end())
            .map_err(|err| TransportError::Malformed(err.to_string()))
    };

    match timeout(REQUEST_TIMEOUT, exchange).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::messages::Command;

    fn echo_handlers() -> HandlerMap {
        let mut map = HandlerMap::new();
        map.insert(
            "GET_SUCC",
            handler(|request: Request| async move {
                match request.command {
                    Command::GetSuccessor { key } => {
                        Response::with_fragment(format!("saw {}", key.to_hex()))
                    }
                    _ => Response::fail("wrong variant"),
                }
            }),
        );
        map
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let server = Server::bind("127.0.0.1", 0, echo_handlers()).await.unwrap();
        let port = server.local_addr().port();

        let key = Key::hash("probe");
        let request = Request::new(Command::GetSuccessor { key });
        let response = send_request("127.0.0.1", port, &request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.fragment.unwrap(), format!("saw {}", key.to_hex()));

        server.kill();
    }

    #[tokio::test]
    async fn unregistered_command_fails_cleanly() {
        let server = Server::bind("127.0.0.1", 0, echo_handlers()).await.unwrap();
        let port = server.local_addr().port();

        let request = Request::new(Command::Maintenance);
        let response = send_request("127.0.0.1", port, &request).await.unwrap();
        assert!(!response.success);
        assert!(response.errors.unwrap().contains("invalid command"));

        server.kill();
    }

    #[tokio::test]
    async fn connection_carries_multiple_requests() {
        let server = Server::bind("127.0.0.1", 0, echo_handlers()).await.unwrap();
        let port = server.local_addr().port();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        for round in 0..3 {
            let request = Request::new(Command::GetSuccessor { key: Key::hash(&round.to_string()) });
            let mut text = encode_request(&request).unwrap();
            text.push('\n');
            write_half.write_all(text.as_bytes()).await.unwrap();

            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let reply: Response = decode_response(line.trim_end()).unwrap();
            assert!(reply.success, "round {round}");
        }

        server.kill();
    }

    #[tokio::test]
    async fn malformed_request_gets_error_response() {
        let server = Server::bind("127.0.0.1", 0, echo_handlers()).await.unwrap();
        let port = server.local_addr().port();

        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"this is not json\n").await.unwrap();

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        let reply: Response = decode_response(line.trim_end()).unwrap();
        assert!(!reply.success);
        assert!(reply.errors.unwrap().contains("invalid request"));

        server.kill();
    }

    #[tokio::test]
    async fn killed_server_stops_accepting() {
        let server = Server::bind("127.0.0.1", 0, echo_handlers()).await.unwrap();
        let port = server.local_addr().port();
        server.kill();

        // Give the accept loop a moment to observe the shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let request = Request::new(Command::GetSuccessor { key: Key::hash("x") });
        assert!(send_request("127.0.0.1", port, &request).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transport_error() {
        let request = Request::new(Command::Maintenance);
        // Port 1 is essentially never listening.
        let err = send_request("127.0.0.1", 1, &request).await.unwrap_err();
        match err {
            TransportError::Unreachable(_) | TransportError::TimedOut => {}
            other => panic!("unexpected error: {other}"),
        }
    }
}
