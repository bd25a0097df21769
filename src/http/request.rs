use http::header::{CONTENT_LENGTH, EXPECT, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{
    canonical_name, content_length, header_map, is_chunked, read_head, wants_close,
    with_default_port, BodyFraming, MAX_HEADERS,
};
use crate::error::{Result, SnovaError};

/// A parsed client request head.
///
/// The body is not read here; it stays in the client stream and is streamed upstream
/// according to `body` once the head went out.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Request target exactly as the client sent it
    pub uri: String,
    /// Authority the request is addressed to (`host` or `host:port`)
    pub host: String,
    /// HTTP/1.x minor version
    pub version: u8,
    pub headers: HeaderMap,
    pub body: BodyFraming,
    /// The client sent `Expect: 100-continue` and waits before sending its body
    pub expect_continue: bool,
    /// The connection should be closed once the response went out
    pub close: bool,
    scheme: String,
    path: String,
}

impl HttpRequest {
    /// Read the next request from a client stream.
    ///
    /// Returns `Ok(None)` if the client closed the connection between requests.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncBufRead + Unpin,
    {
        let Some(head) = read_head(reader).await? else {
            return Ok(None);
        };

        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut storage);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(SnovaError::InvalidRequest("incomplete request head".into()))
            }
            Err(e) => return Err(SnovaError::InvalidRequest(e.to_string())),
        }

        let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
            .map_err(|e| SnovaError::InvalidRequest(e.to_string()))?;
        let uri = parsed.path.unwrap_or_default().to_string();
        let version = parsed.version.unwrap_or(1);
        let mut headers = header_map(parsed.headers)?;

        let (scheme, host, path) = resolve_target(&method, &uri, &headers)?;
        let close = wants_close(version, &headers);
        let body = request_framing(&headers)?;

        // answered locally; the upstream gets the body right behind the head
        let expect_continue = headers
            .get(EXPECT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false);
        if expect_continue {
            headers.remove(EXPECT);
        }

        Ok(Some(Self {
            method,
            uri,
            host,
            version,
            headers,
            body,
            expect_continue,
            close,
            scheme,
            path,
        }))
    }

    /// A bodyless `CONNECT` to `authority`, as sent to an upstream HTTP proxy
    pub fn connect(authority: &str) -> Self {
        Self {
            method: Method::CONNECT,
            uri: authority.to_string(),
            host: authority.to_string(),
            version: 1,
            headers: HeaderMap::new(),
            body: BodyFraming::Empty,
            expect_continue: false,
            close: false,
            scheme: "https".to_string(),
            path: String::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Origin-form request target (`/path?query`)
    pub fn request_uri(&self) -> &str {
        &self.path
    }

    /// Absolute-form request target, as written to an HTTP proxy
    pub fn proxy_uri(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }

    /// Serialize the request head, in absolute form when `proxy_form` is set
    pub fn to_wire(&self, proxy_form: bool) -> Vec<u8> {
        let target = if self.is_connect() {
            self.host.clone()
        } else if proxy_form {
            self.proxy_uri()
        } else {
            self.path.clone()
        };

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, target).as_bytes());
        out.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());

        for (name, value) in &self.headers {
            if name == HOST || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
                continue;
            }
            out.extend_from_slice(canonical_name(name.as_str()).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        match self.body {
            BodyFraming::Chunked => out.extend_from_slice(b"Transfer-Encoding: chunked\r\n"),
            BodyFraming::Sized(len) if len > 0 => {
                out.extend_from_slice(format!("Content-Length: {}\r\n", len).as_bytes())
            }
            _ if matches!(self.method, Method::POST | Method::PUT | Method::PATCH) => {
                out.extend_from_slice(b"Content-Length: 0\r\n")
            }
            _ => {}
        }

        out.extend_from_slice(b"\r\n");
        out
    }

    /// Write the request head onto `writer` and flush it
    pub async fn write_to<W>(&self, writer: &mut W, proxy_form: bool) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.to_wire(proxy_form)).await?;
        writer.flush().await
    }
}

/// Body framing of a client request; a request without length or coding has no body
fn request_framing(headers: &HeaderMap) -> Result<BodyFraming> {
    if headers.contains_key(TRANSFER_ENCODING) {
        if is_chunked(headers) {
            return Ok(BodyFraming::Chunked);
        }
        return Err(SnovaError::InvalidRequest("unsupported transfer coding".into()));
    }
    Ok(match content_length(headers)? {
        Some(0) | None => BodyFraming::Empty,
        Some(len) => BodyFraming::Sized(len),
    })
}

/// Work out `(scheme, authority, origin-form path)` for a request target
fn resolve_target(
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
) -> Result<(String, String, String)> {
    if *method == Method::CONNECT {
        if uri.is_empty() {
            return Err(SnovaError::InvalidRequest("CONNECT without authority".into()));
        }
        let authority = with_default_port(uri, 443);
        return Ok(("https".to_string(), authority.clone(), authority));
    }

    let lower = uri.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let parsed: http::Uri = uri
            .parse()
            .map_err(|e: http::uri::InvalidUri| SnovaError::InvalidRequest(e.to_string()))?;
        let authority = parsed
            .authority()
            .map(|a| a.as_str().rsplit('@').next().unwrap_or(a.as_str()).to_string())
            .filter(|a| !a.is_empty())
            .ok_or_else(|| SnovaError::InvalidRequest(format!("missing host in {}", uri)))?;
        let path = parsed
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|pq| !pq.is_empty())
            .unwrap_or_else(|| "/".to_string());
        let scheme = parsed.scheme_str().unwrap_or("http").to_ascii_lowercase();
        return Ok((scheme, authority, path));
    }

    let host = headers
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| SnovaError::InvalidRequest("request without Host".into()))?;
    Ok(("http".to_string(), host.to_string(), uri.to_string()))
}
