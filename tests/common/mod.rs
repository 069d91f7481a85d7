//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use sluice::net::Listener;
use sluice::{BufferPool, HttpServer, ServerConfig, Shutdown};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub pool: BufferPool,
    pub shutdown: Shutdown,
    pub task: JoinHandle<()>,
}

impl TestServer {
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Small buffers and short deadlines, so limits are easy to hit.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.buffers.buffer_size = 4096;
    config.buffers.pool_capacity = 64;
    config.limits.max_header_bytes = 2048;
    config.timeouts.read_ms = 2_000;
    config.timeouts.write_ms = 2_000;
    config.timeouts.shutdown_grace_ms = 500;
    config
}

/// Bind an ephemeral port and run `server` on it.
pub async fn start(server: HttpServer) -> TestServer {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = tcp.local_addr().unwrap();
    let listener = Listener::from_tcp(tcp, server.config().listener.max_connections);
    let pool = server.pool().clone();
    let shutdown = Shutdown::new();
    let stop = shutdown.clone();
    let task = tokio::spawn(async move {
        server.run(listener, stop).await.unwrap();
    });
    TestServer {
        addr,
        pool,
        shutdown,
        task,
    }
}

/// A parsed response: status line, lower-cased headers and the decoded body.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Reads responses off a stream, keeping bytes that belong to the next one.
pub struct ResponseReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: AsyncRead + Unpin> ResponseReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf)
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        self.buf.extend_from_slice(&chunk[..n]);
        n > 0
    }

    async fn line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = String::from_utf8(self.buf[..pos].to_vec()).unwrap();
                self.buf.drain(..pos + 2);
                return line;
            }
            assert!(self.fill().await, "connection closed mid-line");
        }
    }

    /// Exactly `n` bytes, waiting for them if needed.
    pub async fn exact(&mut self, n: usize) -> Vec<u8> {
        while self.buf.len() < n {
            assert!(self.fill().await, "connection closed mid-body");
        }
        self.buf.drain(..n).collect()
    }

    /// Read one status line and header block.
    pub async fn head(&mut self) -> (u16, Vec<(String, String)>) {
        let status_line = self.line().await;
        let status = status_line
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| panic!("bad status line: {status_line}"));
        let mut headers = Vec::new();
        loop {
            let line = self.line().await;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').unwrap();
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
        (status, headers)
    }

    /// Read one complete response, decoding a chunked body.
    pub async fn response(&mut self) -> Response {
        let (status, headers) = self.head().await;
        let find = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        let body = if find("transfer-encoding").as_deref() == Some("chunked") {
            let mut body = Vec::new();
            loop {
                let size = usize::from_str_radix(self.line().await.trim(), 16).unwrap();
                if size == 0 {
                    assert_eq!(self.line().await, "");
                    break;
                }
                body.extend(self.exact(size).await);
                assert_eq!(self.line().await, "");
            }
            body
        } else if let Some(len) = find("content-length") {
            self.exact(len.parse().unwrap()).await
        } else if status == 101 {
            Vec::new()
        } else {
            while self.fill().await {}
            std::mem::take(&mut self.buf)
        };
        Response {
            status,
            headers,
            body,
        }
    }

    /// Everything until the peer closes.
    pub async fn rest(&mut self) -> Vec<u8> {
        while self.fill().await {}
        std::mem::take(&mut self.buf)
    }
}

/// Poll `pool` until every buffer is back, or give up after a second.
pub async fn wait_for_idle_pool(pool: &BufferPool) -> usize {
    for _ in 0..100 {
        if pool.live() == 0 {
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pool.live()
}
