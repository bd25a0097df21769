//! Upstream transport layer
//!
//! Dialing primitives shared by the backends: plain TCP with tiered timeouts, SOCKS
//! chaining, and HTTP CONNECT handshakes against an upstream proxy.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use http::header::PROXY_AUTHORIZATION;
use http::{HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};
use url::Url;

use crate::error::{Result, SnovaError};
use crate::http::{HttpRequest, HttpResponse};

/// Timeout of the first direct dial attempt
pub const FIRST_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout of the single retry after a failed first attempt
pub const RETRY_DIAL_TIMEOUT: Duration = Duration::from_secs(4);

/// Anything a client or upstream connection can be carried over
pub trait ProxyStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn ProxyStream>;

/// A live upstream connection together with its read buffer.
///
/// The buffer lives as long as the connection so bytes read past one response are
/// still there for the next one.
pub type Transport = BufReader<BoxedStream>;

pub fn into_transport<S: ProxyStream>(stream: S) -> Transport {
    BufReader::new(Box::new(stream) as BoxedStream)
}

/// Proxy transport handler
pub struct ProxyTransport;

impl ProxyTransport {
    /// Dial `addr` over TCP, bounded by `timeout`
    pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SnovaError::Timeout)?
            .map_err(|e| SnovaError::DialFailure(format!("TCP connect to {} failed: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Dial with the short timeout, then once more with the longer one
    #[instrument]
    pub async fn dial_with_retry(addr: &str) -> Result<TcpStream> {
        match Self::dial(addr, FIRST_DIAL_TIMEOUT).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!("First dial to {} failed ({}), retrying", addr, e);
                Self::dial(addr, RETRY_DIAL_TIMEOUT).await
            }
        }
    }

    /// Reach `target` (`host:port`) through the SOCKS server described by `proxy`.
    ///
    /// `socks4`/`socks4a` use SOCKS4 (user id taken from the URL user name), every other
    /// `socks*` scheme uses SOCKS5 with optional username/password.
    #[instrument(skip(proxy), fields(proxy = %proxy.host_str().unwrap_or_default()))]
    pub async fn dial_socks(proxy: &Url, target: &str) -> Result<TcpStream> {
        let proxy_host = proxy.host_str().ok_or_else(|| {
            SnovaError::InvalidProxyAddress(format!("SOCKS URL {} has no host", proxy))
        })?;
        let proxy_addr = format_tcp_addr(proxy_host, proxy.port().unwrap_or(1080));
        let (host, port) = parse_host_port(target)?;

        let socket = Self::dial_with_retry(&proxy_addr).await?;
        let target_addr = (host.as_str(), port);
        let username = proxy.username();
        let password = proxy.password().unwrap_or("");

        let stream = match proxy.scheme().to_lowercase().as_str() {
            "socks4" | "socks4a" => {
                if username.is_empty() {
                    Socks4Stream::connect_with_socket(socket, target_addr)
                        .await?
                        .into_inner()
                } else {
                    Socks4Stream::connect_with_userid_and_socket(socket, target_addr, username)
                        .await?
                        .into_inner()
                }
            }
            "socks" | "socks5" | "socks5h" => {
                if username.is_empty() {
                    Socks5Stream::connect_with_socket(socket, target_addr)
                        .await?
                        .into_inner()
                } else {
                    Socks5Stream::connect_with_password_and_socket(
                        socket,
                        target_addr,
                        username,
                        password,
                    )
                    .await?
                    .into_inner()
                }
            }
            other => return Err(SnovaError::UnsupportedProtocol(other.to_string())),
        };

        debug!("SOCKS connection to {} established", target);
        Ok(stream)
    }

    /// Ask the HTTP proxy on the other end of `stream` to open a tunnel to `authority`.
    ///
    /// Anything other than `200` fails the handshake. The returned reader keeps whatever
    /// the proxy sent after its response head.
    #[instrument(skip(stream, credentials))]
    pub async fn connect_tunnel<S: ProxyStream>(
        stream: S,
        authority: &str,
        credentials: Option<(&str, &str)>,
    ) -> Result<BufReader<S>> {
        let mut request = HttpRequest::connect(authority);
        if let Some((username, password)) = credentials {
            let encoded = BASE64.encode(format!("{}:{}", username, password));
            let value = HeaderValue::from_str(&format!("Basic {}", encoded))
                .map_err(|e| SnovaError::HandshakeFailure(e.to_string()))?;
            request.headers.insert(PROXY_AUTHORIZATION, value);
        }

        let mut reader = BufReader::new(stream);
        request
            .write_to(reader.get_mut(), false)
            .await
            .map_err(|e| SnovaError::HandshakeFailure(format!("failed to send CONNECT: {}", e)))?;

        let response = HttpResponse::read_from(&mut reader, &request)
            .await
            .map_err(|e| SnovaError::HandshakeFailure(e.to_string()))?;
        if response.status != StatusCode::OK {
            return Err(SnovaError::HandshakeFailure(format!(
                "CONNECT {} answered {}",
                authority, response.status
            )));
        }

        debug!("HTTP CONNECT tunnel to {} established", authority);
        Ok(reader)
    }

    /// Credentials embedded in a proxy URL, if any
    pub fn url_credentials(url: &Url) -> Option<(&str, &str)> {
        if url.username().is_empty() {
            None
        } else {
            Some((url.username(), url.password().unwrap_or("")))
        }
    }

    /// `host:port` of a proxy URL, defaulting the port from its scheme
    pub fn url_addr(url: &Url) -> Result<String> {
        let host = url.host_str().ok_or_else(|| {
            SnovaError::InvalidProxyAddress(format!("{} has no host", url))
        })?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = url.port_or_known_default().unwrap_or(80);
        Ok(format_tcp_addr(host, port))
    }
}

/// Split `host:port`, accepting bracketed IPv6 like `[::1]:8080`
pub fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let url = Url::parse(&format!("http://{}", addr)).map_err(|e| {
        SnovaError::InvalidProxyAddress(format!("Invalid address '{}': {}", addr, e))
    })?;

    let host = url.host_str().ok_or_else(|| {
        SnovaError::InvalidProxyAddress(format!("Invalid address '{}': missing host", addr))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let port = url.port_or_known_default().ok_or_else(|| {
        SnovaError::InvalidProxyAddress(format!("Invalid address '{}': missing port", addr))
    })?;

    Ok((host.to_string(), port))
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
