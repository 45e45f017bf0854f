//! MJPEG HTTP server
//!
//! One accept task spawning a task per connection, plus a refresh task that
//! copies source frames into endpoint caches. Both observe a broadcast
//! shutdown signal.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::endpoint::{Endpoint, EndpointTable};
use super::http::read_request;
use super::mjpeg::{create_mjpeg_part, ClientGuard, RESPONSE_HEAD};
use crate::config::ServerConfig;
use crate::error::{AppError, Result};
use crate::video::FrameSource;

/// Time allowed for a client to send its request head
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ServerStatus {
    Stopped,
    Running(SocketAddr),
    Error(String),
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running(addr) => write!(f, "running on {}", addr),
            Self::Error(err) => write!(f, "error: {}", err),
        }
    }
}

/// Per-connection settings copied from the server config
#[derive(Clone, Copy)]
struct ClientSettings {
    poll: Duration,
    keepalive: Duration,
}

pub struct MjpegServer {
    config: ServerConfig,
    endpoints: Arc<EndpointTable>,
    status: Arc<RwLock<ServerStatus>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    client_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    clients: Arc<AtomicUsize>,
}

impl MjpegServer {
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            endpoints: Arc::new(EndpointTable::new(config.jpeg_quality)),
            config,
            status: Arc::new(RwLock::new(ServerStatus::Stopped)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            client_handles: Arc::new(Mutex::new(Vec::new())),
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serve `source` at `path` (case-insensitive); replaces an existing mapping
    pub fn register_endpoint(&self, path: &str, source: Arc<dyn FrameSource>) -> Result<()> {
        self.endpoints.register(path, source).map(|_| ())
    }

    pub fn endpoint(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.get(path)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.paths()
    }

    pub fn status(&self) -> ServerStatus {
        self.status.read().clone()
    }

    /// Viewers currently receiving a stream
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Bind and start serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let ServerStatus::Running(addr) = self.status() {
            return Ok(addr);
        }

        let bind_addr: SocketAddr = format!("{}:{}", self.config.bind, self.config.port)
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid MJPEG bind address: {}", e)))?;

        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                let message = format!("MJPEG bind {} failed: {}", bind_addr, e);
                *self.status.write() = ServerStatus::Error(message.clone());
                return Err(AppError::Io(io::Error::new(e.kind(), message)));
            }
        };
        let local_addr = listener.local_addr()?;

        let settings = ClientSettings {
            poll: self.config.refresh_interval(),
            keepalive: self.config.keepalive(),
        };

        let refresh = tokio::spawn(refresh_loop(
            self.endpoints.clone(),
            self.config.refresh_interval(),
            self.shutdown_tx.subscribe(),
        ));

        let endpoints = self.endpoints.clone();
        let clients = self.clients.clone();
        let client_handles = self.client_handles.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let status = self.status.clone();

        let accept = tokio::spawn(async move {
            info!("MJPEG server listening on {}", local_addr);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("MJPEG server shutdown signal received");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let endpoints = endpoints.clone();
                                let clients = clients.clone();
                                let shutdown_rx = shutdown_tx.subscribe();
                                let handle = tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, peer, endpoints, clients, settings, shutdown_rx).await {
                                        log_client_error(peer, &e);
                                    }
                                });
                                let mut handles = client_handles.lock();
                                handles.retain(|task| !task.is_finished());
                                handles.push(handle);
                            }
                            Err(e) => {
                                warn!("MJPEG accept failed: {}", e);
                            }
                        }
                    }
                }
            }

            *status.write() = ServerStatus::Stopped;
        });

        *self.status.write() = ServerStatus::Running(local_addr);
        let mut tasks = self.tasks.lock();
        tasks.push(refresh);
        tasks.push(accept);
        Ok(local_addr)
    }

    /// Stop accepting, end every stream and wait for the tasks to finish
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        let clients: Vec<_> = self.client_handles.lock().drain(..).collect();
        for handle in tasks.into_iter().chain(clients) {
            handle.abort();
            let _ = handle.await;
        }

        *self.status.write() = ServerStatus::Stopped;
        info!("MJPEG server stopped");
    }
}

async fn refresh_loop(
    endpoints: Arc<EndpointTable>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => endpoints.refresh_all(),
        }
    }
}

fn log_client_error(peer: SocketAddr, err: &AppError) {
    match err {
        AppError::Io(e)
            if matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ) =>
        {
            debug!("MJPEG client {} disconnected", peer)
        }
        _ => warn!("MJPEG client {} ended with error: {}", peer, err),
    }
}

/// Serve one connection. Unknown paths and non-GET requests are dropped
/// without writing a byte.
async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    endpoints: Arc<EndpointTable>,
    clients: Arc<AtomicUsize>,
    settings: ClientSettings,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let request = match tokio::time::timeout(REQUEST_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => {
            debug!("Dropping {}: {}", peer, e);
            return Ok(());
        }
        Err(_) => {
            debug!("Dropping {}: no request within {:?}", peer, REQUEST_TIMEOUT);
            return Ok(());
        }
    };

    if !request.method.eq_ignore_ascii_case("GET") {
        debug!("Dropping {}: {} {}", peer, request.method, request.path);
        return Ok(());
    }
    let Some(endpoint) = endpoints.get(&request.path) else {
        debug!("Dropping {}: no endpoint at {}", peer, request.path);
        return Ok(());
    };

    let _guard = ClientGuard::new(clients);
    info!("MJPEG client {} connected to {}", peer, endpoint.path());

    stream.write_all(RESPONSE_HEAD).await?;

    let mut ticker = tokio::time::interval(settings.poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sent: Option<u64> = None;
    let mut last_write = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
        }

        // != rather than > so a source restart with a lower sequence is still sent
        if last_sent == Some(endpoint.sequence()) && last_write.elapsed() < settings.keepalive {
            continue;
        }

        let encoding = endpoint.clone();
        let encoded = tokio::task::spawn_blocking(move || encoding.jpeg())
            .await
            .map_err(|e| AppError::Jpeg(format!("encode task failed: {}", e)))??;

        stream.write_all(&create_mjpeg_part(&encoded.data)).await?;
        last_sent = Some(encoded.sequence);
        last_write = Instant::now();
    }

    info!("MJPEG client {} disconnected from {}", peer, endpoint.path());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::endpoint::tests::StaticSource;
    use tokio::io::AsyncReadExt;

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            refresh_interval_ms: 5,
            keepalive_ms: 100,
            ..ServerConfig::default()
        }
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Test client reading a multipart stream
    struct Viewer {
        stream: TcpStream,
        buf: Vec<u8>,
    }

    impl Viewer {
        async fn connect(addr: SocketAddr, request: &[u8]) -> Self {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(request).await.unwrap();
            Self {
                stream,
                buf: Vec::new(),
            }
        }

        async fn fill(&mut self) {
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("read timed out")
                .unwrap();
            assert!(n > 0, "server closed the stream");
            self.buf.extend_from_slice(&chunk[..n]);
        }

        async fn head(&mut self) -> String {
            loop {
                if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                    let head: Vec<u8> = self.buf.drain(..pos + 4).collect();
                    return String::from_utf8_lossy(&head).to_string();
                }
                self.fill().await;
            }
        }

        /// Next JPEG payload, checking the part framing
        async fn part(&mut self) -> Vec<u8> {
            loop {
                if let Some((jpeg, used)) = parse_part(&self.buf) {
                    self.buf.drain(..used);
                    return jpeg;
                }
                self.fill().await;
            }
        }
    }

    fn parse_part(data: &[u8]) -> Option<(Vec<u8>, usize)> {
        let head_end = find(data, b"\r\n\r\n")? + 4;
        assert!(data.starts_with(b"--frame\r\n"));
        let head = std::str::from_utf8(&data[..head_end]).unwrap();
        assert!(head.contains("Content-Type: image/jpeg\r\n"));
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let end = head_end + length;
        if data.len() < end + 2 {
            return None;
        }
        assert_eq!(&data[end..end + 2], b"\r\n");
        Some((data[head_end..end].to_vec(), end + 2))
    }

    #[tokio::test]
    async fn test_registered_path_streams_parts() {
        let server = MjpegServer::new(test_config());
        server
            .register_endpoint("/Cam", StaticSource::new([255, 0, 0], 1))
            .unwrap();
        let addr = server.start().await.unwrap();

        let mut viewer =
            Viewer::connect(addr, b"GET /cam HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let head = viewer.head().await;
        assert!(head.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(head.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));

        let jpeg = viewer.part().await;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(server.client_count(), 1);

        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_parts_follow_source_and_keepalive() {
        let source = StaticSource::new([255, 0, 0], 1);
        let server = MjpegServer::new(test_config());
        server.register_endpoint("/a", source.clone()).unwrap();
        let addr = server.start().await.unwrap();

        let mut viewer = Viewer::connect(addr, b"GET /A HTTP/1.0\r\n\r\n").await;
        viewer.head().await;
        let first = viewer.part().await;

        // unchanged source: the same image is resent on keepalive
        let resent = viewer.part().await;
        assert_eq!(resent, first);

        source.set([0, 0, 255], 2);
        let mut changed = false;
        for _ in 0..10 {
            if viewer.part().await != first {
                changed = true;
                break;
            }
        }
        assert!(changed);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_requests_get_zero_bytes() {
        let server = MjpegServer::new(test_config());
        server
            .register_endpoint("/cam", StaticSource::new([0, 255, 0], 1))
            .unwrap();
        let addr = server.start().await.unwrap();

        for request in [
            &b"GET /other HTTP/1.1\r\n\r\n"[..],
            &b"POST /cam HTTP/1.1\r\n\r\n"[..],
            &b"garbage\r\n\r\n"[..],
        ] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(request).await.unwrap();
            let mut buf = Vec::new();
            let result =
                tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
                    .await
                    .expect("connection was not closed");
            if let Err(e) = result {
                assert_eq!(e.kind(), io::ErrorKind::ConnectionReset);
            }
            assert!(buf.is_empty());
        }
        assert_eq!(server.client_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_client_count_drops_after_disconnect() {
        let server = MjpegServer::new(test_config());
        server
            .register_endpoint("/cam", StaticSource::new([0, 255, 0], 1))
            .unwrap();
        let addr = server.start().await.unwrap();

        let mut viewer = Viewer::connect(addr, b"GET /cam HTTP/1.1\r\n\r\n").await;
        viewer.head().await;
        viewer.part().await;
        assert_eq!(server.client_count(), 1);
        drop(viewer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.client_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(server.client_count(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let server = MjpegServer::new(test_config());
        assert_eq!(server.status(), ServerStatus::Stopped);
        let addr = server.start().await.unwrap();
        assert_eq!(server.start().await.unwrap(), addr);
        assert_eq!(server.status(), ServerStatus::Running(addr));
        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_bad_bind_address() {
        let server = MjpegServer::new(ServerConfig {
            bind: "not-an-ip".to_string(),
            ..test_config()
        });
        assert!(server.start().await.is_err());
    }
}
