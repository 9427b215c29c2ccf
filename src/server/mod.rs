//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a [`Kernel`],
//! typically an [`HttpCache`](crate::cache::HttpCache) wrapping the origin.
//! Supports HTTP/1.1 persistent connections (keep-alive) out of the box.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::kernel::{Kernel, RequestType};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The rttp HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// [`Kernel`] as main requests.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use rttp_cache::kernel::{KernelError, kernel_fn};
/// use rttp_cache::server::Server;
/// use rttp_cache::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(Arc::new(kernel_fn(|_req: Request| async {
///         Ok::<_, KernelError>(Response::new(StatusCode::Ok).body("Hello!"))
///     }))).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `kernel`.
    ///
    /// Each request carries the peer's IP address and is handled as a
    /// [`RequestType::Main`] request with `catch` enabled. A kernel that still
    /// fails produces a `500 Internal Server Error`. The kernel is shared
    /// across all spawned Tokio tasks.
    ///
    /// This method runs until the process is terminated or an unrecoverable
    /// listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<K>(self, kernel: Arc<K>) -> Result<(), ServerError>
    where
        K: Kernel + ?Sized + 'static,
    {
        info!(address = %self.local_addr, "rttp listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let kernel = Arc::clone(&kernel);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, kernel.as_ref()).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<K>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    kernel: &K,
) -> Result<(), std::io::Error>
where
    K: Kernel + ?Sized,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;

        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            break;
        }

        // Guard against excessively large requests.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large, sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Request entity too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            break;
        }

        // Attempt to parse the buffered data as an HTTP request.
        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                // Headers not yet fully received; read more data.
                continue;
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                let response = Response::new(StatusCode::BadRequest)
                    .body(format!("Bad Request: {e}"))
                    .keep_alive(false);
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set.
        let content_length = request.content_length().unwrap_or(0);
        let total_needed = body_offset + content_length;
        if buf.len() < total_needed {
            continue;
        }

        let mut request =
            request.with_body(Bytes::copy_from_slice(&buf[body_offset..total_needed]));
        request.set_remote_addr(peer_addr.ip());
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = match kernel.handle(request, RequestType::Main, true).await {
            Ok(response) => response,
            Err(e) => {
                error!(peer = %peer_addr, error = %e, "kernel failed, sending 500");
                Response::new(StatusCode::InternalServerError).body("Internal Server Error")
            }
        };
        let response = response.keep_alive(keep_alive);
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        // Drop the consumed request bytes from the buffer.
        let _ = buf.split_to(total_needed);

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KernelError, kernel_fn};

    async fn serve<K: Kernel + 'static>(kernel: K) -> SocketAddr {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(Arc::new(kernel)));
        addr
    }

    async fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn dispatches_to_the_kernel_with_peer_address() {
        let addr = serve(kernel_fn(|req: Request| async move {
            let peer = req.remote_addr().map(|ip| ip.to_string()).unwrap_or_default();
            Ok::<_, KernelError>(Response::new(StatusCode::Ok).body(format!("{} {}", req.path(), peer)))
        }))
        .await;

        let text = roundtrip(addr, b"GET /hi HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("/hi 127.0.0.1"));
    }

    #[tokio::test]
    async fn kernel_errors_become_500() {
        let addr = serve(kernel_fn(|_req: Request| async {
            Err::<Response, _>(KernelError::new("boom"))
        }))
        .await;

        let text = roundtrip(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[tokio::test]
    async fn request_body_is_exactly_content_length() {
        let addr = serve(kernel_fn(|req: Request| async move {
            Ok::<_, KernelError>(Response::new(StatusCode::Ok).body_bytes(req.body().to_vec()))
        }))
        .await;

        let text = roundtrip(
            addr,
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        assert!(text.ends_with("\r\n\r\nhello"));
    }
}
