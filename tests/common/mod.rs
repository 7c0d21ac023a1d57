//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use txn_proxy::config::{ProxyConfig, RemapRule};
use txn_proxy::net::io::{boxed, BoxIo};
use txn_proxy::net::ConnectionId;
use txn_proxy::upstream::{
    ConnectError, ConnectOptions, Connector, ResolveError, ResolveOptions, Resolver, TcpConnector,
};
use txn_proxy::{run_transaction, ClientConn, EngineServices, TxnSnapshot};

/// A request as the mock origin saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What the mock origin writes back.
#[derive(Debug, Clone)]
pub struct Reply {
    /// Written in order, with `pause` between parts.
    pub parts: Vec<Vec<u8>>,
    pub pause: Duration,
    /// Close the connection after writing.
    pub close: bool,
}

impl Reply {
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            parts: vec![text.into().into_bytes()],
            pause: Duration::ZERO,
            close: false,
        }
    }

    /// 200 with a Content-Length body on a keep-alive connection.
    pub fn ok(body: &str) -> Self {
        Self::raw(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
    }

    pub fn with_headers(headers: &str, body: &str) -> Self {
        Self::raw(format!(
            "HTTP/1.1 200 OK\r\n{}Content-Length: {}\r\n\r\n{}",
            headers,
            body.len(),
            body
        ))
    }

    pub fn redirect(location: &str) -> Self {
        Self::raw(format!(
            "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\n\r\n",
            location
        ))
    }

    pub fn slow(parts: Vec<&str>, pause: Duration) -> Self {
        Self {
            parts: parts.into_iter().map(|p| p.as_bytes().to_vec()).collect(),
            pause,
            close: false,
        }
    }

    pub fn closing(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Origin server on an ephemeral port.
pub struct MockOrigin {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub requests: Arc<Mutex<Vec<SeenRequest>>>,
}

impl MockOrigin {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self) -> Option<SeenRequest> {
        self.requests.lock().last().cloned()
    }
}

/// Start a keep-alive origin that answers every request with `handler`.
pub async fn start_origin<F>(handler: F) -> MockOrigin
where
    F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    {
        let connections = Arc::clone(&connections);
        let requests = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                let requests = Arc::clone(&requests);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        let Some(seen) = read_request(&mut socket, &mut buf).await else {
                            break;
                        };
                        requests.lock().push(seen.clone());
                        let reply = handler(&seen);
                        for (i, part) in reply.parts.iter().enumerate() {
                            if i > 0 && !reply.pause.is_zero() {
                                tokio::time::sleep(reply.pause).await;
                            }
                            if socket.write_all(part).await.is_err() {
                                return;
                            }
                        }
                        if reply.close {
                            let _ = socket.shutdown().await;
                            break;
                        }
                    }
                });
            }
        });
    }

    MockOrigin {
        addr,
        connections,
        requests,
    }
}

/// Start an origin that responds with `response` and closes each connection.
pub async fn start_mock_backend(response: &'static str) -> MockOrigin {
    start_origin(move |_| {
        Reply::raw(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            response.len(),
            response
        ))
        .closing()
    })
    .await
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn read_request<S>(socket: &mut S, buf: &mut Vec<u8>) -> Option<SeenRequest>
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut raw = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut raw);
        if let Ok(httparse::Status::Complete(len)) = req.parse(buf) {
            let headers: Vec<(String, String)> = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            let method = req.method.unwrap_or_default().to_string();
            let path = req.path.unwrap_or_default().to_string();
            let body_len = headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            buf.drain(..len);
            while buf.len() < body_len {
                if fill(socket, buf).await == 0 {
                    return None;
                }
            }
            let body = buf.drain(..body_len).collect();
            return Some(SeenRequest {
                method,
                path,
                headers,
                body,
            });
        }
        if fill(socket, buf).await == 0 {
            return None;
        }
    }
}

async fn fill<S: AsyncRead + Unpin>(socket: &mut S, buf: &mut Vec<u8>) -> usize {
    let mut chunk = [0u8; 4096];
    match socket.read(&mut chunk).await {
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            n
        }
        Err(_) => 0,
    }
}

/// Connector that counts connects and then dials over TCP.
#[derive(Debug, Default)]
pub struct CountingConnector {
    pub connects: AtomicUsize,
}

impl CountingConnector {
    pub fn count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, addr: SocketAddr, options: &ConnectOptions) -> Result<BoxIo, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        TcpConnector.connect(addr, options).await
    }
}

/// Resolver answering from a fixed table of full socket addresses; the
/// requested port is ignored so names can point at ephemeral ports.
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    hosts: Mutex<std::collections::HashMap<String, Vec<SocketAddr>>>,
    pub calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn with(self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        self.hosts.lock().insert(host.to_string(), addrs);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for ScriptedResolver {
    async fn resolve(
        &self,
        name: &str,
        _port: u16,
        _options: &ResolveOptions,
    ) -> Result<Vec<SocketAddr>, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(name.to_string()))
    }
}

/// Config with fast retries and a single remap rule per `(host, origin)` pair.
pub fn config_with_rules(rules: &[(&str, &str)]) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.origin.retry_base_delay_ms = 1;
    config.origin.retry_max_delay_ms = 5;
    config.remap.rules = rules
        .iter()
        .enumerate()
        .map(|(i, (host, origin))| RemapRule {
            name: format!("rule-{}", i),
            host: Some(host.to_string()),
            path_prefix: None,
            origin: origin.to_string(),
            preserve_host: false,
            priority: 0,
        })
        .collect();
    config
}

/// Drives `run_transaction` over one end of an in-memory pipe, the way the
/// server's client loop does over a socket.
pub fn spawn_session(services: Arc<EngineServices>, config: Arc<ProxyConfig>) -> TestClient {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let snapshot = TxnSnapshot::new(config);
    let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    let handle = tokio::spawn(async move {
        let mut conn = ClientConn::new(ConnectionId::new(), boxed(server), peer, local);
        let mut served = 0u32;
        while let Some(next) = run_transaction(Arc::clone(&services), snapshot.clone(), conn).await {
            served += 1;
            conn = next;
        }
        served
    });
    TestClient {
        stream: client,
        buf: Vec::new(),
        session: handle,
    }
}

/// A parsed response.
#[derive(Debug)]
pub struct TestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct TestClient {
    pub stream: tokio::io::DuplexStream,
    buf: Vec<u8>,
    pub session: tokio::task::JoinHandle<u32>,
}

impl TestClient {
    pub async fn send(&mut self, request: &str) {
        self.stream.write_all(request.as_bytes()).await.unwrap();
    }

    pub async fn get(&mut self, host: &str, path: &str) -> TestResponse {
        self.send(&format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host))
            .await;
        self.response(false).await
    }

    /// Read just the status line and headers.
    pub async fn head_only(&mut self) -> TestResponse {
        let (status, headers) = self.read_head().await;
        TestResponse {
            status,
            headers,
            body: Vec::new(),
        }
    }

    /// Read one response; `no_body` for responses to HEAD.
    pub async fn response(&mut self, no_body: bool) -> TestResponse {
        let (status, headers) = self.read_head().await;
        let find = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.to_ascii_lowercase())
        };
        let body = if no_body || status == 204 || status == 304 {
            Vec::new()
        } else if find("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
            self.read_chunked().await
        } else if let Some(len) = find("content-length").and_then(|v| v.trim().parse().ok()) {
            self.read_exact(len).await
        } else {
            self.read_to_end().await
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }

    async fn read_head(&mut self) -> (u16, Vec<(String, String)>) {
        loop {
            let mut raw = [httparse::EMPTY_HEADER; 64];
            let mut res = httparse::Response::new(&mut raw);
            if let httparse::Status::Complete(len) = res.parse(&self.buf).unwrap() {
                let status = res.code.unwrap();
                let headers = res
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                self.buf.drain(..len);
                return (status, headers);
            }
            assert!(self.fill().await > 0, "connection closed before response head");
        }
    }

    async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        while self.buf.len() < len {
            assert!(self.fill().await > 0, "connection closed mid-body");
        }
        self.buf.drain(..len).collect()
    }

    async fn read_line(&mut self) -> String {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return String::from_utf8_lossy(&line[..pos]).into_owned();
            }
            assert!(self.fill().await > 0, "connection closed mid-chunk");
        }
    }

    async fn read_chunked(&mut self) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let line = self.read_line().await;
            let size_str = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_str, 16).unwrap();
            if size == 0 {
                // Trailers end with an empty line.
                while !self.read_line().await.is_empty() {}
                return body;
            }
            body.extend(self.read_exact(size).await);
            self.read_exact(2).await;
        }
    }

    async fn read_to_end(&mut self) -> Vec<u8> {
        while self.fill().await > 0 {}
        std::mem::take(&mut self.buf)
    }

    async fn fill(&mut self) -> usize {
        fill(&mut self.stream, &mut self.buf).await
    }

    /// True once the proxy side has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut chunk = [0u8; 64];
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut chunk)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
