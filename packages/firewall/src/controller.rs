//! Protocol handlers attached to accepted connections.
//!
//! The HTTP handler is a placeholder: it serves HTTP/1.x on the metered
//! stream and answers every request with a short plain-text acknowledgement.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::metered::MeteredStream;
use crate::network::NetworkProtocol;

/// Requests for this path are never answered.
pub const HANG_PATH: &str = "/wait/hang";

/// Serves the protocol of one port on its accepted connections.
#[async_trait]
pub trait PortController: Send + Sync + 'static {
    fn protocol(&self) -> NetworkProtocol;

    /// Serve `stream` until the peer is done with it.
    async fn serve(&self, stream: MeteredStream<TcpStream>) -> io::Result<()>;
}

/// The controller serving `protocol`.
pub fn controller_for(protocol: NetworkProtocol) -> Arc<dyn PortController> {
    match protocol {
        NetworkProtocol::Http => Arc::new(HttpEchoController),
    }
}

/// Placeholder HTTP/1.x responder.
#[derive(Debug, Default)]
pub struct HttpEchoController;

impl HttpEchoController {
    /// Answer requests on `stream` until it closes or asks to.
    pub async fn respond<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        http1::Builder::new()
            .keep_alive(true)
            .serve_connection(TokioIo::new(stream), service_fn(acknowledge))
            .await
            .map_err(into_io_error)
    }
}

#[async_trait]
impl PortController for HttpEchoController {
    fn protocol(&self) -> NetworkProtocol {
        NetworkProtocol::Http
    }

    async fn serve(&self, stream: MeteredStream<TcpStream>) -> io::Result<()> {
        self.respond(stream).await
    }
}

async fn acknowledge(request: Request<Incoming>) -> Result<Response<Full<Bytes>>, http::Error> {
    if request.uri().path() == HANG_PATH {
        std::future::pending::<()>().await;
    }
    // Unread bodies would stop the connection from being reused.
    let _ = request.into_body().collect().await;

    let body = format!("RR-OK [{}] --> {}\n", Uuid::new_v4(), unix_time());
    Response::builder()
        .header(CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(body)))
}

fn into_io_error(err: hyper::Error) -> io::Error {
    let kind = if err.is_parse() || err.is_parse_too_large() {
        io::ErrorKind::InvalidData
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, err)
}

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn exchange(request: &str) -> String {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { HttpEchoController.respond(server).await });

        client.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        task.await.unwrap().unwrap();
        response
    }

    #[tokio::test]
    async fn responds_and_closes() {
        let response = exchange("GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("content-type: text/plain\r\n"));
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert!(body.starts_with("RR-OK ["));
        assert!(body.ends_with('\n'));
        assert!(response.contains(&format!("content-length: {}\r\n", body.len())));
    }

    #[tokio::test]
    async fn keep_alive_serves_several_requests() {
        let response = exchange(concat!(
            "GET /one HTTP/1.1\r\nHost: localhost\r\n\r\n",
            "POST /two HTTP/1.1\r\nHost: localhost\r\ncontent-length: 4\r\n\r\nping",
            "GET /three HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        ))
        .await;

        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 3);
        assert_eq!(response.matches("RR-OK [").count(), 3);
    }

    #[tokio::test]
    async fn chunked_body_keeps_connection_usable() {
        let response = exchange(concat!(
            "POST /a HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n",
            "4\r\nping\r\n0\r\n\r\n",
            "GET /b HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        ))
        .await;

        assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
        assert_eq!(response.matches("RR-OK [").count(), 2);
    }

    #[tokio::test]
    async fn hang_path_never_answers() {
        let (mut client, server) = tokio::io::duplex(4096);
        let _task = tokio::spawn(async move { HttpEchoController.respond(server).await });

        client
            .write_all(b"GET /wait/hang HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err(), "no response expected");
    }

    #[tokio::test]
    async fn malformed_request_is_an_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { HttpEchoController.respond(server).await });
        client.write_all(b"NONSENSE\r\n\r\n").await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
