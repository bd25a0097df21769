//! Forward and Direct backends
//!
//! `Forward` sends traffic through a fixed configured target: a SOCKS server, a chained HTTP
//! proxy or a plain TCP relay. `Direct` is the same connection type without a target, dialing
//! each request's own host.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::PROXY_AUTHORIZATION;
use http::HeaderValue;
use tracing::{debug, error, info, warn};
use url::Url;

use super::handler::relay_http;
use super::remote::{IdlePool, RemoteConnection, RemoteConnectionManager, UpstreamDial};
use super::transport::{into_transport, ProxyTransport, Transport};
use super::tunnel::TunnelHandler;
use crate::error::{Result, SnovaError};
use crate::http::{with_default_port, HttpRequest};
use crate::models::session::{INTERNAL_SERVER_ERROR, TUNNEL_ESTABLISHED};
use crate::models::{Event, SessionConnection};

pub const FORWARD_NAME: &str = "Forward";
pub const DIRECT_NAME: &str = "Direct";

/// Where a forward connection actually dials
#[derive(Debug, Clone)]
enum Upstream {
    /// The request's own host
    Direct,
    /// The request's host, through a SOCKS server
    Socks(Url),
    /// A chained HTTP proxy
    HttpProxy(Url),
    /// A fixed `host:port` that receives the traffic as-is
    Relay(String),
}

impl Upstream {
    fn parse(target: &str) -> Result<Self> {
        let url = Url::parse(target)?;
        match url.scheme().to_ascii_lowercase().as_str() {
            "socks" | "socks4" | "socks4a" | "socks5" | "socks5h" => {
                ProxyTransport::url_addr(&url)?;
                Ok(Upstream::Socks(url))
            }
            s if s.starts_with("socks") => Err(SnovaError::UnsupportedProtocol(s.to_string())),
            "http" | "https" => {
                ProxyTransport::url_addr(&url)?;
                Ok(Upstream::HttpProxy(url))
            }
            _ => Ok(Upstream::Relay(ProxyTransport::url_addr(&url)?)),
        }
    }
}

struct ForwardSettings {
    name: String,
    upstream: Upstream,
}

impl ForwardSettings {
    async fn dial(&self, target: &str, tunnel: bool) -> Result<Transport> {
        match &self.upstream {
            Upstream::Direct => Ok(into_transport(ProxyTransport::dial_with_retry(target).await?)),
            Upstream::Socks(url) => Ok(into_transport(ProxyTransport::dial_socks(url, target).await?)),
            Upstream::Relay(addr) => Ok(into_transport(ProxyTransport::dial_with_retry(addr).await?)),
            Upstream::HttpProxy(url) => {
                let stream = ProxyTransport::dial_with_retry(&ProxyTransport::url_addr(url)?).await?;
                if tunnel {
                    let credentials = ProxyTransport::url_credentials(url);
                    let tunnel = ProxyTransport::connect_tunnel(stream, target, credentials).await?;
                    Ok(into_transport(tunnel))
                } else {
                    Ok(into_transport(stream))
                }
            }
        }
    }
}

/// A connection handed out by a [`ForwardManager`]
pub struct ForwardConnection {
    forward_conn: Option<Transport>,
    /// Request authority the held transport was dialed for
    proxy_addr: String,
    settings: Arc<ForwardSettings>,
}

impl ForwardConnection {
    fn new(settings: Arc<ForwardSettings>) -> Self {
        Self {
            forward_conn: None,
            proxy_addr: String::new(),
            settings,
        }
    }

    /// Reuse the held transport if it was dialed for `host`, otherwise redial
    async fn init_forward_conn(&mut self, host: &str, tunnel: bool) {
        let target = with_default_port(host, if tunnel { 443 } else { 80 });
        if self.forward_conn.is_some() && self.proxy_addr == target {
            return;
        }
        self.forward_conn = None;

        let settings = Arc::clone(&self.settings);
        match settings.dial(&target, tunnel).await {
            Ok(transport) => {
                self.forward_conn = Some(transport);
                self.proxy_addr = target;
            }
            Err(e) => error!("Failed to dial address:{} for reason:{}", target, e),
        }
    }

    /// The request as written upstream, with proxy credentials when chained
    fn outbound(&self, req: &HttpRequest) -> Result<Option<HttpRequest>> {
        let Upstream::HttpProxy(url) = &self.settings.upstream else {
            return Ok(None);
        };
        let Some((username, password)) = ProxyTransport::url_credentials(url) else {
            return Ok(None);
        };
        let encoded = BASE64.encode(format!("{}:{}", username, password));
        let value = HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|e| SnovaError::InvalidProxyAddress(e.to_string()))?;
        let mut req = req.clone();
        req.headers.insert(PROXY_AUTHORIZATION, value);
        Ok(Some(req))
    }
}

#[async_trait]
impl UpstreamDial for ForwardConnection {
    async fn dial_or_reuse(&mut self, host: &str) {
        self.init_forward_conn(host, false).await;
    }

    fn transport_mut(&mut self) -> Option<&mut Transport> {
        self.forward_conn.as_mut()
    }

    fn proxy_form(&self) -> bool {
        matches!(self.settings.upstream, Upstream::HttpProxy(_))
    }

    fn drop_transport(&mut self) {
        self.forward_conn = None;
    }
}

#[async_trait]
impl RemoteConnection for ForwardConnection {
    async fn request(
        &mut self,
        session: &mut SessionConnection,
        event: &Event,
    ) -> Result<Option<Event>> {
        let Event::HttpRequest(ev) = event;
        let req = &ev.request;
        let tunnel = session.is_tunnel();

        self.init_forward_conn(&req.host, tunnel).await;
        if self.forward_conn.is_none() {
            warn!("Failed to connect forward proxy");
            let _ = session.write_raw(INTERNAL_SERVER_ERROR).await;
            session.close().await;
            return Err(SnovaError::DialFailure(format!(
                "no upstream connection for {}",
                req.host
            )));
        }

        info!("Session[{}]Request URL:{} {}", ev.hash, req.method, req.uri);
        if tunnel {
            if let Err(e) = session.write_raw(TUNNEL_ESTABLISHED).await {
                debug!("Client went away before the tunnel started: {}", e);
            } else if let Some(remote) = self.forward_conn.as_mut() {
                TunnelHandler::relay(&mut session.local, remote).await;
            }
            self.close()?;
            session.close().await;
            return Ok(None);
        }

        match self.outbound(req)? {
            Some(chained) => relay_http(self, session, &chained).await?,
            None => relay_http(self, session, req).await?,
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.forward_conn = None;
        Ok(())
    }

    fn connection_manager(&self) -> &str {
        &self.settings.name
    }

    fn is_connected(&self) -> bool {
        self.forward_conn.is_some()
    }
}

/// Manager for [`ForwardConnection`]s sharing one upstream target
pub struct ForwardManager {
    target: String,
    settings: Arc<ForwardSettings>,
    idle: IdlePool<Box<dyn RemoteConnection>>,
}

impl ForwardManager {
    /// Forward through `target` (`socks5://`, `http://`, or any `scheme://host:port` relay)
    pub fn new(target: &str, pool_size: usize) -> Result<Self> {
        let upstream = Upstream::parse(target)?;
        Ok(Self::with_upstream(
            format!("{}{}", FORWARD_NAME, target),
            target.to_string(),
            upstream,
            pool_size,
        ))
    }

    /// Dial every request's own host
    pub fn direct(pool_size: usize) -> Self {
        Self::with_upstream(DIRECT_NAME.to_string(), String::new(), Upstream::Direct, pool_size)
    }

    fn with_upstream(name: String, target: String, upstream: Upstream, pool_size: usize) -> Self {
        Self {
            target,
            settings: Arc::new(ForwardSettings { name, upstream }),
            idle: IdlePool::new(pool_size),
        }
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.len()
    }
}

impl RemoteConnectionManager for ForwardManager {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn arg(&self) -> &str {
        &self.target
    }

    fn get_remote_connection(&self, _event: &Event) -> Result<Box<dyn RemoteConnection>> {
        let mut conn = self
            .idle
            .pop()
            .unwrap_or_else(|| Box::new(ForwardConnection::new(self.settings.clone())));
        conn.close()?;
        Ok(conn)
    }

    fn recycle_remote_connection(&self, conn: Box<dyn RemoteConnection>) {
        if !self.idle.push(conn) {
            debug!("{} idle pool full, dropping connection", self.settings.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::Ordering;

    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{timeout, Duration};
    use tokio_test::io::Builder;

    use crate::models::{SessionState, SessionType};
    use crate::proxy::test_util::{
        event, read_head, refused_addr, spawn_echo_once, spawn_origin, spawn_socks5,
        HELLO_RESPONSE,
    };

    #[test]
    fn names_and_targets() {
        let direct = ForwardManager::direct(4);
        assert_eq!(direct.name(), "Direct");
        assert_eq!(direct.arg(), "");

        let socks = ForwardManager::new("socks5://127.0.0.1:1080", 4).unwrap();
        assert_eq!(socks.name(), "Forwardsocks5://127.0.0.1:1080");
        assert_eq!(socks.arg(), "socks5://127.0.0.1:1080");

        let other = ForwardManager::new("http://10.0.0.1:3128", 4).unwrap();
        assert_ne!(socks.name(), other.name());
    }

    #[test]
    fn rejects_unusable_targets() {
        assert!(ForwardManager::new("not a url", 4).is_err());
        assert!(matches!(
            ForwardManager::new("socks6://127.0.0.1:1080", 4),
            Err(SnovaError::UnsupportedProtocol(_))
        ));
    }

    #[tokio::test]
    async fn plain_get_is_relayed_verbatim_and_recycled() {
        let (origin, _, heads) = spawn_origin(HELLO_RESPONSE).await;
        let manager = ForwardManager::direct(4);
        let ev = event(7, format!("GET http://{}/ HTTP/1.1\r\n\r\n", origin).as_bytes()).await;

        let client = Builder::new().write(HELLO_RESPONSE).build();
        let mut session = SessionConnection::new(client, SessionType::Plain);
        let mut conn = manager.get_remote_connection(&ev).unwrap();
        conn.request(&mut session, &ev).await.unwrap();

        assert_eq!(session.state, SessionState::RecvHttp);
        assert!(conn.is_connected());
        assert_eq!(conn.connection_manager(), "Direct");
        assert_eq!(
            heads.lock()[0],
            format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", origin)
        );

        manager.recycle_remote_connection(conn);
        assert_eq!(manager.idle_connections(), 1);
    }

    #[tokio::test]
    async fn same_host_reuses_transport_and_new_host_redials() {
        let (first, first_accepts, _) = spawn_origin(HELLO_RESPONSE).await;
        let (second, second_accepts, _) = spawn_origin(HELLO_RESPONSE).await;
        let manager = ForwardManager::direct(4);

        let client = Builder::new()
            .write(HELLO_RESPONSE)
            .write(HELLO_RESPONSE)
            .write(HELLO_RESPONSE)
            .build();
        let mut session = SessionConnection::new(client, SessionType::Plain);

        let to_first = event(1, format!("GET http://{}/a HTTP/1.1\r\n\r\n", first).as_bytes()).await;
        let to_second =
            event(1, format!("GET http://{}/b HTTP/1.1\r\n\r\n", second).as_bytes()).await;

        let mut conn = manager.get_remote_connection(&to_first).unwrap();
        conn.request(&mut session, &to_first).await.unwrap();
        conn.request(&mut session, &to_first).await.unwrap();
        assert_eq!(first_accepts.load(Ordering::SeqCst), 1);

        conn.request(&mut session, &to_second).await.unwrap();
        assert_eq!(first_accepts.load(Ordering::SeqCst), 1);
        assert_eq!(second_accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_connect_answers_500_and_closes() {
        let addr = refused_addr().await;
        let manager = ForwardManager::direct(4);
        let ev = event(3, format!("CONNECT {} HTTP/1.1\r\n\r\n", addr).as_bytes()).await;

        let client = Builder::new().write(INTERNAL_SERVER_ERROR).build();
        let mut session = SessionConnection::new(client, SessionType::HttpsTunnel);
        let mut conn = manager.get_remote_connection(&ev).unwrap();
        let err = conn.request(&mut session, &ev).await.unwrap_err();

        assert!(err.is_dial_failure());
        assert!(!err.responds_500());
        assert_eq!(session.state, SessionState::SessionClose);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn tunnel_relays_until_both_sides_finish() {
        let echo = spawn_echo_once().await;
        let manager = Arc::new(ForwardManager::direct(4));
        let ev = event(9, format!("CONNECT {} HTTP/1.1\r\n\r\n", echo).as_bytes()).await;

        let (mut client, local) = duplex(4096);
        let task_manager = manager.clone();
        let task = tokio::spawn(async move {
            let mut session = SessionConnection::new(local, SessionType::HttpsTunnel);
            let mut conn = task_manager.get_remote_connection(&ev).unwrap();
            conn.request(&mut session, &ev).await.unwrap();
            (session.state, conn.is_connected())
        });

        let mut established = [0u8; TUNNEL_ESTABLISHED.len()];
        client.read_exact(&mut established).await.unwrap();
        assert_eq!(&established[..], TUNNEL_ESTABLISHED);

        client.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"ping");

        // the remote side is done, the client side is still open
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        client.shutdown().await.unwrap();
        let (state, connected) = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(state, SessionState::SessionClose);
        assert!(!connected);
    }

    #[tokio::test]
    async fn socks_target_carries_origin_form_requests_and_is_reused() {
        let (origin, accepts, heads) = spawn_origin(HELLO_RESPONSE).await;
        let (socks, targets) = spawn_socks5(None).await;
        let manager = ForwardManager::new(&format!("socks5://{}", socks), 4).unwrap();
        let ev = event(4, format!("GET http://{}/via-socks HTTP/1.1\r\n\r\n", origin).as_bytes()).await;

        let client = Builder::new()
            .write(HELLO_RESPONSE)
            .write(HELLO_RESPONSE)
            .build();
        let mut session = SessionConnection::new(client, SessionType::Plain);
        let mut conn = manager.get_remote_connection(&ev).unwrap();
        conn.request(&mut session, &ev).await.unwrap();
        conn.request(&mut session, &ev).await.unwrap();

        assert_eq!(*targets.lock(), vec![origin.to_string()]);
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(
            heads.lock()[0],
            format!("GET /via-socks HTTP/1.1\r\nHost: {}\r\n\r\n", origin)
        );
        assert_eq!(session.state, SessionState::RecvHttp);
    }

    #[tokio::test]
    async fn chained_http_proxy_gets_proxy_form_with_credentials() {
        let (proxy, _, heads) = spawn_origin(HELLO_RESPONSE).await;
        let manager = ForwardManager::new(&format!("http://user:pass@{}", proxy), 4).unwrap();
        let ev = event(5, b"GET http://example.com/index.html HTTP/1.1\r\n\r\n").await;

        let client = Builder::new().write(HELLO_RESPONSE).build();
        let mut session = SessionConnection::new(client, SessionType::Plain);
        let mut conn = manager.get_remote_connection(&ev).unwrap();
        conn.request(&mut session, &ev).await.unwrap();

        let head = heads.lock()[0].clone();
        assert!(head.starts_with("GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[tokio::test]
    async fn chained_http_proxy_refusing_connect_answers_500() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let head = read_head(&mut stream).await.unwrap();
            assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
            stream
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let manager = ForwardManager::new(&format!("http://{}", proxy), 4).unwrap();
        let ev = event(6, b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await;
        let client = Builder::new().write(INTERNAL_SERVER_ERROR).build();
        let mut session = SessionConnection::new(client, SessionType::HttpsTunnel);
        let mut conn = manager.get_remote_connection(&ev).unwrap();

        let err = conn.request(&mut session, &ev).await.unwrap_err();
        assert!(err.is_dial_failure());
        assert_eq!(session.state, SessionState::SessionClose);
    }

    #[tokio::test]
    async fn pool_is_bounded_and_hands_out_closed_connections() {
        let (origin, _, _) = spawn_origin(HELLO_RESPONSE).await;
        let manager = ForwardManager::direct(1);
        let ev = event(2, format!("GET http://{}/ HTTP/1.1\r\n\r\n", origin).as_bytes()).await;

        let client = Builder::new().write(HELLO_RESPONSE).build();
        let mut session = SessionConnection::new(client, SessionType::Plain);
        let mut used = manager.get_remote_connection(&ev).unwrap();
        used.request(&mut session, &ev).await.unwrap();
        assert!(used.is_connected());

        let spare = manager.get_remote_connection(&ev).unwrap();
        manager.recycle_remote_connection(used);
        manager.recycle_remote_connection(spare);
        assert_eq!(manager.idle_connections(), 1);

        let reused = manager.get_remote_connection(&ev).unwrap();
        assert!(!reused.is_connected());
        assert_eq!(manager.idle_connections(), 0);

        let fresh = manager.get_remote_connection(&ev).unwrap();
        assert!(!fresh.is_connected());
    }
}
