//! The proxy server and its per-session visit recorder.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
};

use {
    time::OffsetDateTime,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream},
        sync::{Mutex, watch},
    },
    tracing::{debug, info, warn},
};

use {
    crate::error::{Error, Result},
    vigil_activity::ActivityStore,
};

/// Records each observed domain once per proxy session.
///
/// The de-duplication set lives here because its lifetime is the session's:
/// a fresh proxy means a fresh set, with no process-wide globals involved.
struct SessionRecorder {
    store: ActivityStore,
    seen: Mutex<HashSet<String>>,
}

impl SessionRecorder {
    fn new(store: ActivityStore) -> Self {
        Self {
            store,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Append a visit record unless this domain was already logged this
    /// session. A failed store write is dropped with a warning; observation
    /// must never break the tunnel.
    async fn record_once(&self, domain: &str) {
        let mut seen = self.seen.lock().await;
        if seen.contains(domain) {
            return;
        }
        match self
            .store
            .record_visit(domain, OffsetDateTime::now_utc())
            .await
        {
            Ok(()) => {
                seen.insert(domain.to_string());
                info!(domain = %domain, "visit logged");
            },
            Err(e) => warn!(domain = %domain, error = %e, "failed to record visit"),
        }
    }
}

/// HTTP proxy that observes and forwards the monitored browser's traffic.
pub struct ObservingProxy {
    listener: TcpListener,
    addr: SocketAddr,
    recorder: Arc<SessionRecorder>,
}

impl ObservingProxy {
    /// Bind the listener eagerly so an occupied port fails at startup, not
    /// on the first tick.
    pub async fn bind(listener_addr: SocketAddr, store: ActivityStore) -> Result<Self> {
        let listener = TcpListener::bind(listener_addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            recorder: Arc::new(SessionRecorder::new(store)),
        })
    }

    /// The address the proxy listens on.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept and serve connections until the `shutdown` signal flips.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.addr, "observing proxy listening");

        loop {
            tokio::select! {
                accept = self.listener.accept() => {
                    match accept {
                        Ok((stream, peer)) => {
                            if !peer.ip().is_loopback() {
                                debug!(peer = %peer, "rejected proxy connection from non-loopback peer");
                                drop(stream);
                                continue;
                            }
                            let recorder = Arc::clone(&self.recorder);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, recorder).await {
                                    debug!(peer = %peer, error = %e, "proxy client error");
                                }
                            });
                        },
                        Err(e) => {
                            warn!(error = %e, "proxy accept error");
                        },
                    }
                },
                _ = shutdown_signal(&shutdown) => {
                    info!("observing proxy shutting down");
                    break;
                },
            }
        }
        Ok(())
    }
}

async fn shutdown_signal(rx: &watch::Receiver<bool>) {
    let mut rx = rx.clone();
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Read the request line and dispatch on CONNECT vs. plain forward.
async fn handle_client(stream: TcpStream, recorder: Arc<SessionRecorder>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end();

    if request_line.is_empty() {
        return Err(Error::message("empty request"));
    }

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(Error::message(format!(
            "malformed request line: {request_line}"
        )));
    }

    let method = parts[0];
    let target = parts[1];

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(reader, target, recorder).await
    } else {
        handle_forward(reader, method, target, recorder).await
    }
}

/// Tunnel a CONNECT request, recording the domain on successful connect.
async fn handle_connect(
    mut reader: BufReader<TcpStream>,
    target: &str,
    recorder: Arc<SessionRecorder>,
) -> Result<()> {
    let (domain, port) = split_host_port(target, 443);

    // Consume the remaining request headers.
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
    }

    let upstream = match TcpStream::connect((domain.as_str(), port)).await {
        Ok(s) => s,
        Err(e) => {
            let resp = format!("HTTP/1.1 502 Bad Gateway\r\n\r\n{e}");
            reader.get_mut().write_all(resp.as_bytes()).await?;
            return Ok(());
        },
    };

    recorder.record_once(&domain).await;

    let resp = "HTTP/1.1 200 Connection Established\r\n\r\n";
    reader.get_mut().write_all(resp.as_bytes()).await?;

    tunnel(reader.into_inner(), upstream).await;
    Ok(())
}

/// Forward a plain HTTP request, recording the domain on successful connect.
async fn handle_forward(
    mut reader: BufReader<TcpStream>,
    method: &str,
    target: &str,
    recorder: Arc<SessionRecorder>,
) -> Result<()> {
    let domain = host_of_url(target)?;
    let port = port_of_url(target);

    let mut headers = String::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
        headers.push_str(&line);
    }

    let mut upstream = match TcpStream::connect((domain.as_str(), port)).await {
        Ok(s) => s,
        Err(e) => {
            let resp = format!("HTTP/1.1 502 Bad Gateway\r\n\r\n{e}");
            reader.get_mut().write_all(resp.as_bytes()).await?;
            return Ok(());
        },
    };

    recorder.record_once(&domain).await;

    // Upstream expects a relative path, not the absolute proxy URI.
    let request_line = format!("{method} {} HTTP/1.1\r\n", path_of_url(target));
    upstream.write_all(request_line.as_bytes()).await?;
    upstream.write_all(headers.as_bytes()).await?;
    upstream.write_all(b"\r\n").await?;

    tunnel(reader.into_inner(), upstream).await;
    Ok(())
}

/// Bidirectional copy until either side closes.
async fn tunnel(mut client: TcpStream, upstream: TcpStream) {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let c2u = tokio::io::copy(&mut client_read, &mut upstream_write);
    let u2c = tokio::io::copy(&mut upstream_read, &mut client_write);
    let _ = tokio::join!(c2u, u2c);
}

/// Split `host:port`, falling back to `default_port`.
fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    if let Some((host, port_str)) = target.rsplit_once(':') {
        let port = port_str.parse().unwrap_or(default_port);
        (host.to_string(), port)
    } else {
        (target.to_string(), default_port)
    }
}

/// Hostname of an absolute HTTP URL.
fn host_of_url(url: &str) -> Result<String> {
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);

    let host_port = after_scheme.split('/').next().unwrap_or(after_scheme);
    if host_port.is_empty() {
        return Err(Error::message(format!("no host in url: {url}")));
    }

    if let Some((host, _)) = host_port.rsplit_once(':') {
        Ok(host.to_string())
    } else {
        Ok(host_port.to_string())
    }
}

/// Port of an absolute HTTP URL, defaulting by scheme.
fn port_of_url(url: &str) -> u16 {
    let default = if url.starts_with("https://") { 443 } else { 80 };
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);

    let host_port = after_scheme.split('/').next().unwrap_or(after_scheme);
    match host_port.rsplit_once(':') {
        Some((_, port_str)) => port_str.parse().unwrap_or(default),
        None => default,
    }
}

/// Relative path of an absolute URL.
fn path_of_url(url: &str) -> String {
    let after_scheme = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);

    match after_scheme.find('/') {
        Some(slash) => after_scheme[slash..].to_string(),
        None => "/".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        std::time::Duration,
        tokio::io::AsyncReadExt,
        vigil_activity::VisitSource,
    };

    use super::*;

    #[test]
    fn split_host_port_defaults() {
        assert_eq!(
            split_host_port("github.com:443", 443),
            ("github.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("example.com", 443),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_host_port("api.example.com:8080", 443),
            ("api.example.com".to_string(), 8080)
        );
    }

    #[test]
    fn host_of_url_strips_scheme_and_port() {
        assert_eq!(host_of_url("http://example.com/path").unwrap(), "example.com");
        assert_eq!(
            host_of_url("https://api.github.com:443/v1").unwrap(),
            "api.github.com"
        );
        assert_eq!(host_of_url("http://localhost:8080/").unwrap(), "localhost");
        assert!(host_of_url("http:///nope").is_err());
    }

    #[test]
    fn port_of_url_defaults_by_scheme() {
        assert_eq!(port_of_url("http://example.com/path"), 80);
        assert_eq!(port_of_url("https://example.com/path"), 443);
        assert_eq!(port_of_url("http://example.com:8080/path"), 8080);
    }

    #[test]
    fn path_of_url_is_relative() {
        assert_eq!(path_of_url("http://example.com/a/b"), "/a/b");
        assert_eq!(path_of_url("http://example.com"), "/");
    }

    async fn temp_store() -> (tempfile::TempDir, ActivityStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ActivityStore::open(&dir.path().join("activity.db"))
            .await
            .unwrap();
        (dir, store)
    }

    /// Upstream that accepts connections and echoes nothing.
    async fn silent_upstream() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    async fn start_proxy(store: ActivityStore) -> (SocketAddr, watch::Sender<bool>) {
        let proxy = ObservingProxy::bind("127.0.0.1:0".parse().unwrap(), store)
            .await
            .unwrap();
        let addr = proxy.addr();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = proxy.run(rx).await;
        });
        (addr, tx)
    }

    async fn connect_through(proxy: SocketAddr, target: &str) -> String {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        let request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[tokio::test]
    async fn connect_tunnel_records_the_visit() {
        let (_dir, store) = temp_store().await;
        let (_upstream, upstream_port) = silent_upstream().await;
        let (proxy_addr, _shutdown) = start_proxy(store.clone()).await;

        let response = connect_through(proxy_addr, &format!("127.0.0.1:{upstream_port}")).await;
        assert!(response.starts_with("HTTP/1.1 200"));

        let counts = store
            .count_visits_since(OffsetDateTime::now_utc() - Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(counts.get("127.0.0.1"), Some(&1));
    }

    #[tokio::test]
    async fn repeat_visits_are_logged_once_per_session() {
        let (_dir, store) = temp_store().await;
        let (_upstream, upstream_port) = silent_upstream().await;
        let (proxy_addr, _shutdown) = start_proxy(store.clone()).await;

        let target = format!("127.0.0.1:{upstream_port}");
        connect_through(proxy_addr, &target).await;
        connect_through(proxy_addr, &target).await;
        connect_through(proxy_addr, &target).await;

        let counts = store
            .count_visits_since(OffsetDateTime::now_utc() - Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(counts.get("127.0.0.1"), Some(&1));
    }

    #[tokio::test]
    async fn unreachable_upstream_returns_502_and_records_nothing() {
        let (_dir, store) = temp_store().await;
        // Grab a port with nothing listening on it.
        let (listener, dead_port) = silent_upstream().await;
        drop(listener);
        let (proxy_addr, _shutdown) = start_proxy(store.clone()).await;

        let response = connect_through(proxy_addr, &format!("127.0.0.1:{dead_port}")).await;
        assert!(response.starts_with("HTTP/1.1 502"));

        let counts = store
            .count_visits_since(OffsetDateTime::now_utc() - Duration::from_secs(60))
            .await
            .unwrap();
        assert!(counts.is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_stops_the_proxy() {
        let (_dir, store) = temp_store().await;
        let (proxy_addr, shutdown) = start_proxy(store).await;

        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The listener is gone once shutdown completes.
        assert!(TcpStream::connect(proxy_addr).await.is_err());
    }
}
