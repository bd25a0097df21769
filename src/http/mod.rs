//! Minimal HTTP/1.x wire codec
//!
//! The proxy needs byte-level control over what goes to the upstream and back to the
//! client (proxy-form vs origin-form request lines, verbatim response relay, leftover
//! bytes staying in the connection's buffer), so messages are framed here on top of
//! `httparse` instead of going through a full client stack. Only heads are parsed into
//! memory; bodies are streamed from one side to the other according to their framing.

mod request;
mod response;

pub use request::HttpRequest;
pub use response::HttpResponse;

use std::io;
use std::net::Ipv6Addr;

use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a request or response header section
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound for a chunk-size or trailer line
const MAX_LINE_SIZE: usize = 8 * 1024;

/// Upper bound for the number of header fields in one message
const MAX_HEADERS: usize = 100;

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    /// `Content-Length` bytes
    Sized(u64),
    /// `Transfer-Encoding: chunked`, relayed chunk by chunk as received
    Chunked,
    /// Runs until the sender closes the connection (responses only)
    UntilClose,
}

impl BodyFraming {
    pub fn is_empty(&self) -> bool {
        matches!(self, BodyFraming::Empty | BodyFraming::Sized(0))
    }
}

/// The side of a body copy that failed
#[derive(Debug)]
pub enum CopyError {
    /// The source failed, sent malformed framing or ended early
    Read(io::Error),
    /// The destination could not be written
    Write(io::Error),
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Read(e) => write!(f, "read side failed: {}", e),
            CopyError::Write(e) => write!(f, "write side failed: {}", e),
        }
    }
}

/// Read one header section (start line through the empty line).
///
/// Returns `Ok(None)` when the peer closed the stream before sending anything.
pub(crate) async fn read_head<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let n = read_line_limited(reader, &mut head, MAX_HEAD_SIZE, "header section too large")
            .await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(unexpected_eof("connection closed inside header section"));
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                // stray CRLF between pipelined messages
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

/// Append one `\n`-terminated line to `out`, failing as soon as `out` grows past `limit`.
///
/// Returns the number of bytes appended; `0` means the stream ended.
async fn read_line_limited<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    limit: usize,
    too_long: &'static str,
) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let start = out.len();
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(out.len() - start);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    out.extend_from_slice(&available[..=i]);
                    (true, i + 1)
                }
                None => {
                    out.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);

        if out.len() > limit {
            return Err(invalid_data(too_long));
        }
        if done {
            return Ok(out.len() - start);
        }
    }
}

/// Stream one body from `reader` to `writer` according to `framing`, returning the number
/// of wire bytes copied. Bytes past the end of the body stay buffered in `reader`.
pub(crate) async fn copy_body<R, W>(
    framing: BodyFraming,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = match framing {
        BodyFraming::Empty => 0,
        BodyFraming::Sized(len) => copy_exact(reader, writer, len).await?,
        BodyFraming::Chunked => copy_chunked(reader, writer).await?,
        BodyFraming::UntilClose => copy_to_eof(reader, writer).await?,
    };
    writer.flush().await.map_err(CopyError::Write)?;
    Ok(copied)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut remaining = len;
    while remaining > 0 {
        let available = reader.fill_buf().await.map_err(CopyError::Read)?;
        if available.is_empty() {
            return Err(CopyError::Read(unexpected_eof("connection closed inside body")));
        }
        let n = available
            .len()
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        writer
            .write_all(&available[..n])
            .await
            .map_err(CopyError::Write)?;
        reader.consume(n);
        remaining -= n as u64;
    }
    Ok(len)
}

async fn copy_to_eof<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut copied = 0u64;
    loop {
        let available = reader.fill_buf().await.map_err(CopyError::Read)?;
        if available.is_empty() {
            return Ok(copied);
        }
        let n = available.len();
        writer.write_all(available).await.map_err(CopyError::Write)?;
        reader.consume(n);
        copied += n as u64;
    }
}

/// Pass a chunked body through unchanged, flushing after every chunk
async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut copied = 0u64;
    let mut line = Vec::new();
    loop {
        let size = {
            read_line_required(reader, &mut line, "chunk size line too long").await?;
            parse_chunk_size(&line).map_err(CopyError::Read)?
        };
        copied += write_line(writer, &line).await?;

        if size == 0 {
            loop {
                read_line_required(reader, &mut line, "chunk trailer line too long").await?;
                copied += write_line(writer, &line).await?;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(copied);
                }
            }
        }

        copied += copy_exact(reader, writer, size).await?;
        read_line_required(reader, &mut line, "chunk is not terminated by CRLF").await?;
        if line != b"\r\n" && line != b"\n" {
            return Err(CopyError::Read(invalid_data("chunk is not terminated by CRLF")));
        }
        copied += write_line(writer, &line).await?;
        writer.flush().await.map_err(CopyError::Write)?;
    }
}

async fn read_line_required<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    too_long: &'static str,
) -> Result<(), CopyError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let n = read_line_limited(reader, line, MAX_LINE_SIZE, too_long)
        .await
        .map_err(CopyError::Read)?;
    if n == 0 || !line.ends_with(b"\n") {
        return Err(CopyError::Read(unexpected_eof(
            "connection closed inside chunked body",
        )));
    }
    Ok(())
}

async fn write_line<W>(writer: &mut W, line: &[u8]) -> Result<u64, CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(line).await.map_err(CopyError::Write)?;
    Ok(line.len() as u64)
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let line = std::str::from_utf8(line).map_err(|_| invalid_data("chunk size line is not ascii"))?;
    let digits = line.trim().split(';').next().unwrap_or("").trim();
    u64::from_str_radix(digits, 16).map_err(|_| invalid_data("invalid chunk size"))
}

pub(crate) fn header_map(headers: &[httparse::Header<'_>]) -> io::Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| invalid_data("invalid header name"))?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| invalid_data("invalid header value"))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Whether a message with this version and headers asks for the connection to close
pub(crate) fn wants_close(minor_version: u8, headers: &HeaderMap) -> bool {
    let mut has_close = false;
    let mut has_keep_alive = false;
    for value in headers.get_all(CONNECTION) {
        let Ok(value) = value.to_str() else { continue };
        for token in value.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                has_close = true;
            } else if token.eq_ignore_ascii_case("keep-alive") {
                has_keep_alive = true;
            }
        }
    }
    has_close || (minor_version == 0 && !has_keep_alive)
}

pub(crate) fn content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    match headers.get(CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(Some)
            .ok_or_else(|| invalid_data("invalid Content-Length")),
    }
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// `Content-type` -> `Content-Type`, the way header names usually travel on the wire
pub(crate) fn canonical_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Append `:port` unless `host` already carries one. Bare IPv6 literals get bracketed.
pub fn with_default_port(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        return format!("[{}]:{}", host, port);
    }
    let has_port = match host.rsplit_once(':') {
        Some((name, digits)) => {
            !digits.is_empty()
                && digits.bytes().all(|b| b.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn unexpected_eof(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, msg)
}
