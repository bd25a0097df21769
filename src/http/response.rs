use bytes::Bytes;
use http::header::TRANSFER_ENCODING;
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{
    content_length, copy_body, header_map, is_chunked, read_head, wants_close, BodyFraming,
    CopyError, HttpRequest, MAX_HEADERS,
};
use crate::error::{Result, SnovaError};

/// An upstream response head, kept as the exact bytes read off the wire.
///
/// The body is still in the upstream reader; [`HttpResponse::relay`] streams it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// HTTP/1.x minor version
    pub version: u8,
    pub headers: HeaderMap,
    pub body: BodyFraming,
    /// The upstream will not reuse the connection after this response
    pub close: bool,
    head: Bytes,
}

impl HttpResponse {
    /// Read one response head, framed against the request that produced it
    pub async fn read_from<R>(reader: &mut R, req: &HttpRequest) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let head = read_head(reader)
            .await
            .map_err(|e| SnovaError::ReadFailure(e.to_string()))?
            .ok_or_else(|| {
                SnovaError::ReadFailure("connection closed before response".to_string())
            })?;

        let (status, version, headers) = {
            let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut parsed = httparse::Response::new(&mut storage);
            match parsed.parse(&head) {
                Ok(httparse::Status::Complete(_)) => {}
                Ok(httparse::Status::Partial) => {
                    return Err(SnovaError::ReadFailure("incomplete response head".into()))
                }
                Err(e) => return Err(SnovaError::ReadFailure(e.to_string())),
            }
            let code = parsed
                .code
                .ok_or_else(|| SnovaError::ReadFailure("missing status code".into()))?;
            let status = StatusCode::from_u16(code)
                .map_err(|e| SnovaError::ReadFailure(e.to_string()))?;
            let headers =
                header_map(parsed.headers).map_err(|e| SnovaError::ReadFailure(e.to_string()))?;
            (status, parsed.version.unwrap_or(1), headers)
        };

        let mut close = wants_close(version, &headers);

        let bodyless = req.method == Method::HEAD
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
            || (req.is_connect() && status.is_success());

        let body = if bodyless {
            BodyFraming::Empty
        } else if is_chunked(&headers) {
            BodyFraming::Chunked
        } else if let Some(len) = content_length(&headers)
            .map_err(|e| SnovaError::ReadFailure(e.to_string()))?
            .filter(|_| !headers.contains_key(TRANSFER_ENCODING))
        {
            BodyFraming::Sized(len)
        } else {
            BodyFraming::UntilClose
        };
        if body == BodyFraming::UntilClose || status == StatusCode::SWITCHING_PROTOCOLS {
            close = true;
        }

        Ok(Self {
            status,
            version,
            headers,
            body,
            close,
            head: Bytes::from(head),
        })
    }

    /// A 1xx head that is followed by another response to the same request
    pub fn is_interim(&self) -> bool {
        self.status.is_informational() && self.status != StatusCode::SWITCHING_PROTOCOLS
    }

    /// The response head exactly as received
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Write the head to `writer`, then stream the body out of `reader` as it arrives.
    ///
    /// Returns the number of bytes relayed. Whatever follows the body stays in `reader`.
    pub async fn relay<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
    ) -> std::result::Result<u64, CopyError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(&self.head).await.map_err(CopyError::Write)?;
        let body = copy_body(self.body, reader, writer).await?;
        Ok(self.head.len() as u64 + body)
    }
}
