/// HTTP network client backed by reqwest.
///
/// Each started transfer runs as its own tokio task and reports back to the
/// coordinator through the shared event channel: progress while the body
/// streams, credential challenges on 401/407, and a final completion.
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use batchget_shared::network::{request_credentials, request_proxy_credentials};
use batchget_shared::{
    BatchError, BatchResult, Credentials, Direction, EventSender, NetworkClient, NetworkEvent,
    TransferError, TransferId, TransferOutcome, TransferTask, UploadMethod,
};
use reqwest::header::{CONTENT_LENGTH, PROXY_AUTHORIZATION};
use reqwest::{Body, Client, Proxy, Response, StatusCode, Url};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Settings for the underlying HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_agent: String,
    /// Explicit proxy for every request. System proxy variables are ignored.
    pub proxy: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("batchget/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy: None,
        }
    }
}

/// [`NetworkClient`] that performs transfers with reqwest.
pub struct HttpNetworkClient {
    http: Client,
    events: EventSender,
    /// Proxy credentials handed out by the coordinator, shared by every transfer.
    proxy_auth: Arc<Mutex<Option<Credentials>>>,
    /// Flipped to true by `quit`.
    shutdown: watch::Sender<bool>,
}

impl HttpNetworkClient {
    pub fn new(config: &ClientConfig, events: EventSender) -> BatchResult<Self> {
        let mut builder = Client::builder()
            .user_agent(config.user_agent.as_str())
            .no_proxy();

        if let Some(proxy) = &config.proxy {
            let proxy = Proxy::all(proxy.as_str())
                .map_err(|e| BatchError::Config(format!("Invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let http = builder
            .build()
            .map_err(|e| BatchError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            http,
            events,
            proxy_auth: Arc::new(Mutex::new(None)),
            shutdown,
        })
    }

    /// Receiver that turns true once the coordinator has asked to quit.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

impl NetworkClient for HttpNetworkClient {
    fn start(&mut self, task: &TransferTask) -> Result<(), TransferError> {
        let url = Url::parse(&task.request.url).map_err(|e| {
            TransferError::Transport(format!("Invalid URL {}: {}", task.request.url, e))
        })?;

        let job = TransferJob {
            id: task.id,
            url,
            headers: task.request.headers.clone(),
            direction: task.direction.clone(),
            http: self.http.clone(),
            events: self.events.clone(),
            proxy_auth: self.proxy_auth.clone(),
        };

        tokio::spawn(async move {
            let id = job.id;
            let outcome = job.run().await;
            if job.events.send(NetworkEvent::Completed { id, outcome }).is_err() {
                warn!("Coordinator gone, dropping completion of transfer {}", id.short());
            }
        });

        Ok(())
    }

    fn quit(&mut self) {
        info!("Network client shutting down");
        self.shutdown.send_replace(true);
    }
}

/// Everything one in-flight transfer needs, owned by its task.
struct TransferJob {
    id: TransferId,
    url: Url,
    headers: Vec<(String, String)>,
    direction: Direction,
    http: Client,
    events: EventSender,
    proxy_auth: Arc<Mutex<Option<Credentials>>>,
}

impl TransferJob {
    async fn run(&self) -> TransferOutcome {
        let mut auth: Option<Credentials> = None;
        let mut proxy_auth = self.proxy_auth.lock().await.clone();

        loop {
            let (response, sent) = match self.send(auth.as_ref(), proxy_auth.as_ref()).await {
                Ok(r) => r,
                Err(e) => return TransferOutcome::failed(None, e),
            };
            let status = response.status();
            let code = status.as_u16();
            debug!("Transfer {} got HTTP {}", self.id.short(), code);

            // The coordinator hands credentials out once; an empty answer ends it.
            if status == StatusCode::UNAUTHORIZED {
                let credentials = request_credentials(&self.events, self.id).await;
                if credentials.is_empty() {
                    return TransferOutcome::failed(
                        Some(code),
                        TransferError::AuthenticationFailed,
                    );
                }
                auth = Some(credentials);
                continue;
            }

            if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                match self.proxy_credentials(proxy_auth.as_ref()).await {
                    Some(credentials) => {
                        proxy_auth = Some(credentials);
                        continue;
                    }
                    None => {
                        return TransferOutcome::failed(
                            Some(code),
                            TransferError::ProxyAuthenticationFailed,
                        )
                    }
                }
            }

            if status.is_client_error() || status.is_server_error() {
                return TransferOutcome::failed(
                    Some(code),
                    TransferError::from_status(code, status.canonical_reason()),
                );
            }

            return match &self.direction {
                Direction::Download { destination } => self.save(response, destination).await,
                Direction::Upload { .. } => TransferOutcome::succeeded(code, sent),
            };
        }
    }

    /// Credentials to retry a 407 with, or `None` when there are none left.
    ///
    /// The cache lock is held while the coordinator is asked, so parallel
    /// transfers challenged together wait for the first answer and reuse it
    /// instead of each spending the one-shot proxy credentials.
    async fn proxy_credentials(&self, sent: Option<&Credentials>) -> Option<Credentials> {
        let mut cached = self.proxy_auth.lock().await;
        if let Some(credentials) = cached.as_ref().filter(|c| Some(*c) != sent) {
            return Some(credentials.clone());
        }

        let fresh = request_proxy_credentials(&self.events).await;
        if fresh.is_empty() {
            return None;
        }
        *cached = Some(fresh.clone());
        Some(fresh)
    }

    /// Issue the request once. Returns the response and the body bytes sent.
    async fn send(
        &self,
        auth: Option<&Credentials>,
        proxy_auth: Option<&Credentials>,
    ) -> Result<(Response, u64), TransferError> {
        let (mut builder, sent) = match &self.direction {
            Direction::Download { .. } => (self.http.get(self.url.clone()), 0),
            Direction::Upload { source, method } => {
                let file = tokio::fs::File::open(source)
                    .await
                    .map_err(|e| source_error(source, e))?;
                let len = file
                    .metadata()
                    .await
                    .map_err(|e| source_error(source, e))?
                    .len();
                let builder = match method {
                    UploadMethod::Put => self.http.put(self.url.clone()),
                    UploadMethod::Post => self.http.post(self.url.clone()),
                };
                let body = Body::wrap_stream(ReaderStream::new(file));
                (builder.header(CONTENT_LENGTH, len.to_string()).body(body), len)
            }
        };

        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = auth {
            builder = builder.basic_auth(&credentials.user, Some(&credentials.password));
        }
        if let Some(credentials) = proxy_auth {
            builder = builder.header(PROXY_AUTHORIZATION, basic_value(credentials));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        Ok((response, sent))
    }

    /// Stream the response body into `destination`, reporting progress.
    async fn save(&self, mut response: Response, destination: &Path) -> TransferOutcome {
        let code = response.status().as_u16();
        let total = response.content_length();

        let mut file = match tokio::fs::File::create(destination).await {
            Ok(f) => f,
            Err(e) => {
                return TransferOutcome::failed(Some(code), destination_error(destination, e))
            }
        };

        let mut written: u64 = 0;
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        let error = destination_error(destination, e);
                        return TransferOutcome::failed(Some(code), error);
                    }
                    written += chunk.len() as u64;
                    let progress = NetworkEvent::Progress {
                        id: self.id,
                        transferred: written,
                        total,
                    };
                    if self.events.send(progress).is_err() {
                        debug!("Coordinator gone, dropping progress of {}", self.id.short());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let error = TransferError::Transport(e.to_string());
                    return TransferOutcome::failed(Some(code), error);
                }
            }
        }

        if let Err(e) = file.flush().await {
            return TransferOutcome::failed(Some(code), destination_error(destination, e));
        }

        TransferOutcome::succeeded(code, written)
    }
}

/// `Basic <base64(user:password)>` header value.
fn basic_value(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.user, credentials.password);
    format!("Basic {}", STANDARD.encode(raw))
}

fn source_error(path: &Path, e: std::io::Error) -> TransferError {
    TransferError::SourceUnavailable {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn destination_error(path: &Path, e: std::io::Error) -> TransferError {
    TransferError::Destination {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchget_shared::network::event_channel;
    use batchget_shared::{QueueMode, TransferCoordinator, TransferRequest, TransferStatus};
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    const OK_HELLO: &str =
        "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    const UNAUTHORIZED: &str = "HTTP/1.1 401 Unauthorized\r\n\
        WWW-Authenticate: Basic realm=\"test\"\r\n\
        Content-Length: 0\r\nConnection: close\r\n\r\n";
    const PROXY_AUTH: &str = "HTTP/1.1 407 Proxy Authentication Required\r\n\
        Proxy-Authenticate: Basic realm=\"proxy\"\r\n\
        Content-Length: 0\r\nConnection: close\r\n\r\n";
    const NOT_FOUND: &str =
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const CREATED: &str =
        "HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

    /// Answer one connection per canned response, returning the raw requests.
    async fn serve(responses: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                seen.push(read_request(&mut stream).await);
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
            seen
        });

        (base, handle)
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn coordinator(
        config: &ClientConfig,
        mode: QueueMode,
        proxy_credentials: Credentials,
    ) -> (TransferCoordinator<HttpNetworkClient>, batchget_shared::EventReceiver) {
        let (events, rx) = event_channel();
        let client = HttpNetworkClient::new(config, events).unwrap();
        (TransferCoordinator::new(client, mode, proxy_credentials), rx)
    }

    /// Coordinator over a client with no proxy.
    fn direct(
        mode: QueueMode,
    ) -> (TransferCoordinator<HttpNetworkClient>, batchget_shared::EventReceiver) {
        coordinator(&ClientConfig::default(), mode, Credentials::default())
    }

    /// Proxy that answers 407 unless the request carries `expected` proxy
    /// credentials. Serves connections concurrently until aborted.
    async fn serve_proxy(expected: Credentials) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let expected = expected.clone();
                tokio::spawn(async move {
                    let request = read_request(&mut stream).await;
                    let authorized = has_basic_header(
                        &request,
                        "proxy-authorization",
                        &expected.user,
                        &expected.password,
                    );
                    let response = if authorized { OK_HELLO } else { PROXY_AUTH };
                    stream.write_all(response.as_bytes()).await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        (base, handle)
    }

    fn has_basic_header(request: &str, header: &str, user: &str, password: &str) -> bool {
        let value = basic_value(&Credentials::new(user, password));
        request
            .lines()
            .any(|l| {
                l.to_lowercase().starts_with(&format!("{}:", header)) && l.ends_with(&value)
            })
    }

    #[tokio::test]
    async fn test_download_writes_file() {
        let (base, server) = serve(vec![OK_HELLO]).await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("hello.txt");

        let (mut c, mut rx) = direct(QueueMode::Parallel);
        let shutdown = c.client().shutdown_signal();
        c.register_transfer(TransferTask::download(
            TransferRequest::new(format!("{}/hello.txt", base)),
            Credentials::default(),
            &destination,
        ));
        c.run(&mut rx).await;

        assert!(*shutdown.borrow());
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "hello");
        assert_eq!(c.history()[0].status, TransferStatus::Done);
        assert_eq!(c.history()[0].http_status, Some(200));
        assert_eq!(c.stats().bytes, 5);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /hello.txt HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_credentials_answer_challenge() {
        let (base, server) = serve(vec![UNAUTHORIZED, OK_HELLO]).await;
        let dir = tempfile::tempdir().unwrap();

        let (mut c, mut rx) = direct(QueueMode::Parallel);
        c.register_transfer(TransferTask::download(
            TransferRequest::new(format!("{}/private", base)),
            Credentials::new("alice", "secret"),
            dir.path().join("private"),
        ));
        c.run(&mut rx).await;

        assert_eq!(c.failed_count(), 0);
        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!has_basic_header(&requests[0], "authorization", "alice", "secret"));
        assert!(has_basic_header(&requests[1], "authorization", "alice", "secret"));
    }

    #[tokio::test]
    async fn test_rejected_credentials_fail_without_looping() {
        let (base, server) = serve(vec![UNAUTHORIZED, UNAUTHORIZED]).await;
        let dir = tempfile::tempdir().unwrap();

        let (mut c, mut rx) = direct(QueueMode::Parallel);
        c.register_transfer(TransferTask::download(
            TransferRequest::new(format!("{}/private", base)),
            Credentials::new("alice", "wrong"),
            dir.path().join("private"),
        ));
        c.run(&mut rx).await;

        let task = &c.history()[0];
        assert_eq!(task.status, TransferStatus::Failed);
        assert_eq!(task.http_status, Some(401));
        assert_eq!(task.error, Some(TransferError::AuthenticationFailed));
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_error_status_leaves_no_file() {
        let (base, server) = serve(vec![NOT_FOUND]).await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("missing");

        let (mut c, mut rx) = direct(QueueMode::Serial);
        c.register_transfer(TransferTask::download(
            TransferRequest::new(format!("{}/missing", base)),
            Credentials::default(),
            &destination,
        ));
        c.run(&mut rx).await;

        let task = &c.history()[0];
        assert!(matches!(task.error, Some(TransferError::HttpStatus { code: 404, .. })));
        assert!(!destination.exists());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_put_uploads_file_body() {
        let (base, server) = serve(vec![CREATED]).await;
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.txt");
        std::fs::write(&source, b"payload").unwrap();

        let (mut c, mut rx) = direct(QueueMode::Parallel);
        c.register_transfer(
            TransferTask::upload(
                TransferRequest::new(format!("{}/up", base)).with_header("X-Batch", "1"),
                Credentials::default(),
                &source,
                UploadMethod::Put,
            )
            .unwrap(),
        );
        c.run(&mut rx).await;

        let task = &c.history()[0];
        assert_eq!(task.status, TransferStatus::Done);
        assert_eq!(task.http_status, Some(201));
        assert_eq!(task.transferred, 7);

        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("PUT /up HTTP/1.1"));
        assert!(requests[0].to_lowercase().contains("x-batch: 1"));
        assert!(requests[0].ends_with("payload"));
    }

    #[tokio::test]
    async fn test_proxy_credentials_answer_challenge() {
        let (proxy, server) = serve(vec![PROXY_AUTH, OK_HELLO]).await;
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            proxy: Some(proxy),
            ..ClientConfig::default()
        };

        let proxy_credentials = Credentials::new("proxy", "pw");
        let (mut c, mut rx) = coordinator(&config, QueueMode::Parallel, proxy_credentials);
        c.register_transfer(TransferTask::download(
            TransferRequest::new("http://downloads.example/file.bin"),
            Credentials::default(),
            dir.path().join("file.bin"),
        ));
        c.run(&mut rx).await;

        assert_eq!(c.failed_count(), 0);
        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET http://downloads.example/file.bin HTTP/1.1"));
        assert!(has_basic_header(&requests[1], "proxy-authorization", "proxy", "pw"));
    }

    #[tokio::test]
    async fn test_parallel_transfers_share_proxy_credentials() {
        let (proxy, server) = serve_proxy(Credentials::new("proxy", "pw")).await;
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            proxy: Some(proxy),
            ..ClientConfig::default()
        };

        let proxy_credentials = Credentials::new("proxy", "pw");
        let (mut c, mut rx) = coordinator(&config, QueueMode::Parallel, proxy_credentials);
        for n in 0..3 {
            c.register_transfer(TransferTask::download(
                TransferRequest::new(format!("http://downloads.example/f{}", n)),
                Credentials::default(),
                dir.path().join(format!("f{}", n)),
            ));
        }
        c.run(&mut rx).await;
        server.abort();

        assert_eq!(c.failed_count(), 0);
        assert_eq!(c.history().len(), 3);
        for n in 0..3 {
            let body = std::fs::read_to_string(dir.path().join(format!("f{}", n))).unwrap();
            assert_eq!(body, "hello");
        }
    }

    #[tokio::test]
    async fn test_download_reports_progress() {
        let (base, server) = serve(vec![OK_HELLO]).await;
        let dir = tempfile::tempdir().unwrap();
        let (events, mut rx) = event_channel();
        let mut client = HttpNetworkClient::new(&ClientConfig::default(), events).unwrap();

        let task = TransferTask::download(
            TransferRequest::new(format!("{}/hello.txt", base)),
            Credentials::default(),
            dir.path().join("hello.txt"),
        );
        client.start(&task).unwrap();

        let mut progress = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                NetworkEvent::Progress { id, transferred, total } => {
                    assert_eq!(id, task.id);
                    progress.push((transferred, total));
                }
                NetworkEvent::Completed { id, outcome } => {
                    assert_eq!(id, task.id);
                    assert_eq!(outcome, TransferOutcome::succeeded(200, 5));
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }

        assert!(!progress.is_empty());
        assert!(progress.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(progress.last(), Some(&(5, Some(5))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_url_is_refused_at_start() {
        let (events, _rx) = event_channel();
        let mut client = HttpNetworkClient::new(&ClientConfig::default(), events).unwrap();
        let task = TransferTask::download(
            TransferRequest::new("not a url"),
            Credentials::default(),
            "unused",
        );
        assert!(matches!(client.start(&task), Err(TransferError::Transport(_))));
    }

    #[test]
    fn test_basic_value() {
        assert_eq!(
            basic_value(&Credentials::new("Aladdin", "open sesame")),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
