//! Google backend
//!
//! Two managers share this connection type. `GoogleHttp` sends plain requests to the HTTP
//! front host on port 80, `GoogleHttps` to the HTTPS front host over TLS. Tunnels always go
//! to the HTTPS host. With a global upstream proxy enabled every transport is first
//! CONNECT-tunneled through it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::handler::relay_http;
use super::remote::{IdlePool, RemoteConnection, RemoteConnectionManager, UpstreamDial};
use super::tls;
use super::transport::{into_transport, ProxyTransport, Transport};
use super::tunnel::TunnelHandler;
use crate::config::{GoogleConfig, UpstreamProxyConfig};
use crate::error::{Result, SnovaError};
use crate::http::with_default_port;
use crate::models::session::{INTERNAL_SERVER_ERROR, TUNNEL_ESTABLISHED};
use crate::models::{Event, SessionConnection};

pub const GOOGLE_HTTP_NAME: &str = "GoogleHttp";
pub const GOOGLE_HTTPS_NAME: &str = "GoogleHttps";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoogleVariant {
    Http,
    Https,
}

impl GoogleVariant {
    pub fn name(&self) -> &'static str {
        match self {
            GoogleVariant::Http => GOOGLE_HTTP_NAME,
            GoogleVariant::Https => GOOGLE_HTTPS_NAME,
        }
    }
}

struct GoogleSettings {
    variant: GoogleVariant,
    http_host: String,
    https_host: String,
    connect_timeout: Duration,
    /// Set only when chaining through the global proxy is enabled
    proxy: Option<UpstreamProxyConfig>,
}

impl GoogleSettings {
    fn https_authority(&self) -> String {
        with_default_port(&self.https_host, 443)
    }

    fn http_authority(&self) -> String {
        with_default_port(&self.http_host, 80)
    }

    async fn dial(&self, addr: &str) -> Result<tokio::net::TcpStream> {
        ProxyTransport::dial(addr, self.connect_timeout).await
    }

    /// Open a CONNECT tunnel to the HTTPS host through the global proxy
    async fn dial_over_proxy(&self, proxy: &UpstreamProxyConfig) -> Result<Transport> {
        info!("Google use proxy:{}", proxy.addr());
        let stream = self.dial(&proxy.addr()).await?;
        let credentials = proxy
            .username
            .as_deref()
            .map(|user| (user, proxy.password.as_deref().unwrap_or("")));
        let tunnel =
            ProxyTransport::connect_tunnel(stream, &self.https_authority(), credentials).await?;
        Ok(into_transport(tunnel))
    }

    async fn dial_http(&self) -> Result<(Transport, bool)> {
        if let Some(proxy) = &self.proxy {
            let tunnel = self.dial_over_proxy(proxy).await?;
            let tls = tls::wrap_insecure(tunnel, &self.https_host).await?;
            return Ok((into_transport(tls), true));
        }

        match self.variant {
            GoogleVariant::Http => {
                let addr = self.http_authority();
                debug!("Google dialing {}", addr);
                Ok((into_transport(self.dial(&addr).await?), false))
            }
            GoogleVariant::Https => {
                let addr = self.https_authority();
                debug!("Google dialing {}", addr);
                let stream = self.dial(&addr).await?;
                let tls = tls::wrap_insecure(stream, &self.https_host).await?;
                Ok((into_transport(tls), false))
            }
        }
    }
}

/// A connection handed out by a [`GoogleManager`]
pub struct GoogleConnection {
    /// Transport plain requests are written to
    http_client: Option<Transport>,
    /// Raw transport used for tunnels
    https_client: Option<Transport>,
    /// Request host `http_client` was set up for
    proxy_addr: String,
    over_proxy: bool,
    settings: Arc<GoogleSettings>,
}

impl GoogleConnection {
    fn new(settings: Arc<GoogleSettings>) -> Self {
        Self {
            http_client: None,
            https_client: None,
            proxy_addr: String::new(),
            over_proxy: false,
            settings,
        }
    }

    async fn init_https_client(&mut self) {
        if self.https_client.is_some() {
            return;
        }

        let settings = Arc::clone(&self.settings);
        let dialed = match &settings.proxy {
            Some(proxy) => settings.dial_over_proxy(proxy).await.map(|t| (t, true)),
            None => {
                let addr = settings.https_authority();
                settings.dial(&addr).await.map(|s| (into_transport(s), false))
            }
        };
        match dialed {
            Ok((transport, over_proxy)) => {
                self.https_client = Some(transport);
                self.over_proxy = over_proxy;
            }
            Err(e) => error!(
                "Failed to dial address:{} for reason:{}",
                self.settings.https_host, e
            ),
        }
    }

    async fn init_http_client(&mut self, host: &str) {
        let host = with_default_port(host, 80);
        if self.http_client.is_some() && self.proxy_addr == host {
            return;
        }
        self.close_transports();

        let settings = Arc::clone(&self.settings);
        match settings.dial_http().await {
            Ok((transport, over_proxy)) => {
                self.http_client = Some(transport);
                self.over_proxy = over_proxy;
                self.proxy_addr = host;
            }
            Err(e) => error!("Failed to reach google {} site: {}", self.settings.variant.name(), e),
        }
    }

    fn close_transports(&mut self) {
        self.http_client = None;
        self.https_client = None;
    }

    async fn reject(&mut self, session: &mut SessionConnection, what: &str) -> SnovaError {
        warn!("Failed to connect google {} site", what);
        let _ = session.write_raw(INTERNAL_SERVER_ERROR).await;
        session.close().await;
        self.close_transports();
        SnovaError::DialFailure(format!("google {} site unreachable", what))
    }
}

#[async_trait]
impl UpstreamDial for GoogleConnection {
    async fn dial_or_reuse(&mut self, host: &str) {
        self.init_http_client(host).await;
    }

    fn transport_mut(&mut self) -> Option<&mut Transport> {
        self.http_client.as_mut()
    }

    fn proxy_form(&self) -> bool {
        self.over_proxy && self.settings.proxy.is_some()
    }

    fn drop_transport(&mut self) {
        self.close_transports();
    }
}

#[async_trait]
impl RemoteConnection for GoogleConnection {
    async fn request(
        &mut self,
        session: &mut SessionConnection,
        event: &Event,
    ) -> Result<Option<Event>> {
        let Event::HttpRequest(ev) = event;
        let req = &ev.request;

        if session.is_tunnel() {
            self.init_https_client().await;
            if self.https_client.is_none() {
                self.init_https_client().await;
            }
            info!("Session[{}]Request URL:{} {}", ev.hash, req.method, req.uri);
            if self.https_client.is_none() {
                return Err(self.reject(session, "https").await);
            }

            if let Err(e) = session.write_raw(TUNNEL_ESTABLISHED).await {
                debug!("Client went away before the tunnel started: {}", e);
            } else if let Some(remote) = self.https_client.as_mut() {
                TunnelHandler::relay(&mut session.local, remote).await;
            }
            self.close()?;
            session.close().await;
            return Ok(None);
        }

        self.init_http_client(&req.host).await;
        if self.http_client.is_none() {
            self.init_http_client(&req.host).await;
        }
        if self.http_client.is_none() {
            return Err(self.reject(session, "http").await);
        }

        info!("Session[{}]Request URL:{} {}", ev.hash, req.method, req.uri);
        relay_http(self, session, req).await?;
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.close_transports();
        Ok(())
    }

    fn connection_manager(&self) -> &str {
        self.settings.variant.name()
    }

    fn is_connected(&self) -> bool {
        self.http_client.is_some() || self.https_client.is_some()
    }
}

/// Manager for one Google variant
pub struct GoogleManager {
    settings: Arc<GoogleSettings>,
    idle: IdlePool<Box<dyn RemoteConnection>>,
}

impl GoogleManager {
    /// `proxy` is only used when `config.use_global_proxy` is set
    pub fn new(
        variant: GoogleVariant,
        config: &GoogleConfig,
        proxy: Option<&UpstreamProxyConfig>,
        pool_size: usize,
    ) -> Self {
        let proxy = proxy.filter(|_| config.use_global_proxy).cloned();
        Self {
            settings: Arc::new(GoogleSettings {
                variant,
                http_host: config.http_host.clone(),
                https_host: config.https_host.clone(),
                connect_timeout: config.connect_timeout,
                proxy,
            }),
            idle: IdlePool::new(pool_size),
        }
    }

    pub fn variant(&self) -> GoogleVariant {
        self.settings.variant
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.len()
    }
}

impl RemoteConnectionManager for GoogleManager {
    fn name(&self) -> &str {
        self.settings.variant.name()
    }

    fn arg(&self) -> &str {
        match self.settings.variant {
            GoogleVariant::Http => &self.settings.http_host,
            GoogleVariant::Https => &self.settings.https_host,
        }
    }

    fn get_remote_connection(&self, _event: &Event) -> Result<Box<dyn RemoteConnection>> {
        let mut conn = self
            .idle
            .pop()
            .unwrap_or_else(|| Box::new(GoogleConnection::new(self.settings.clone())));
        conn.close()?;
        Ok(conn)
    }

    fn recycle_remote_connection(&self, conn: Box<dyn RemoteConnection>) {
        if !self.idle.push(conn) {
            debug!("{} idle pool full, dropping connection", self.name());
        }
    }
}
