//! Plain request handling with write retry
//!
//! Shared by every backend: write the request head onto the upstream transport, resyncing
//! once if a reused connection turns out to be dead, stream the request body behind it, then
//! relay one response back verbatim as it arrives.

use http::StatusCode;
use tracing::{debug, instrument, warn};

use super::remote::UpstreamDial;
use super::tunnel::TunnelHandler;
use crate::error::{Result, SnovaError};
use crate::http::{copy_body, CopyError, HttpRequest, HttpResponse};
use crate::models::session::CONTINUE;
use crate::models::{SessionConnection, SessionState};

/// Write attempts per request, the first one included
pub const WRITE_ATTEMPTS: usize = 2;

/// Write the head of `req` to the upstream, redialing toward `req.host` and retrying once on failure.
///
/// A pooled connection may have been closed by the far end while idle; the first write
/// then fails and the fresh transport takes the second one.
pub(crate) async fn write_http_request<C>(conn: &mut C, req: &HttpRequest) -> Result<()>
where
    C: UpstreamDial + ?Sized,
{
    let mut last_error = String::from("no upstream connection");
    for attempt in 1..=WRITE_ATTEMPTS {
        if attempt > 1 {
            conn.dial_or_reuse(&req.host).await;
        }
        let proxy_form = conn.proxy_form();
        if let Some(transport) = conn.transport_mut() {
            match req.write_to(transport, proxy_form).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Failed to write request to {} (attempt {}/{}): {}",
                        req.host, attempt, WRITE_ATTEMPTS, e
                    );
                    last_error = e.to_string();
                }
            }
        }
        conn.drop_transport();
    }
    Err(SnovaError::WriteFailure(last_error))
}

/// Serve one request/response cycle of a plain session
#[instrument(skip_all, fields(host = %req.host))]
pub(crate) async fn relay_http<C>(
    conn: &mut C,
    session: &mut SessionConnection,
    req: &HttpRequest,
) -> Result<()>
where
    C: UpstreamDial + ?Sized,
{
    write_http_request(conn, req).await?;

    if !req.body.is_empty() {
        if req.expect_continue {
            if let Err(e) = session.write_raw(CONTINUE).await {
                debug!("Failed to send 100 Continue to client: {}", e);
            }
        }
        let transport = conn
            .transport_mut()
            .ok_or_else(|| SnovaError::WriteFailure("upstream connection lost".into()))?;
        match copy_body(req.body, &mut session.local, transport).await {
            Ok(bytes) => debug!("Request body of {} bytes sent", bytes),
            Err(CopyError::Read(e)) => {
                conn.drop_transport();
                session.close().await;
                return Err(SnovaError::ReadFailure(format!("client request body: {}", e)));
            }
            Err(CopyError::Write(e)) => {
                conn.drop_transport();
                return Err(SnovaError::WriteFailure(e.to_string()));
            }
        }
    }

    let response = loop {
        let transport = conn
            .transport_mut()
            .ok_or_else(|| SnovaError::ReadFailure("upstream connection lost".into()))?;
        let response = match HttpResponse::read_from(transport, req).await {
            Ok(response) => response,
            Err(e) => {
                conn.drop_transport();
                return Err(e);
            }
        };
        if !response.is_interim() {
            break response;
        }
        debug!("Upstream sent interim {}", response.status);
        if let Err(e) = session.write_raw(response.head()).await {
            debug!("Failed to write interim response to client: {}", e);
            session.close().await;
            conn.drop_transport();
            return Ok(());
        }
    };
    debug!("Upstream answered {}", response.status);

    let transport = conn
        .transport_mut()
        .ok_or_else(|| SnovaError::ReadFailure("upstream connection lost".into()))?;

    if response.status == StatusCode::SWITCHING_PROTOCOLS {
        if session.write_raw(response.head()).await.is_ok() {
            TunnelHandler::relay(&mut session.local, transport).await;
        }
        session.close().await;
        conn.drop_transport();
        return Ok(());
    }

    match response.relay(transport, &mut session.local).await {
        Ok(bytes) => {
            debug!("Relayed {} response bytes", bytes);
            if response.close || req.close {
                session.close().await;
                conn.drop_transport();
            } else {
                session.state = SessionState::RecvHttp;
            }
            Ok(())
        }
        Err(CopyError::Read(e)) => {
            // the client already has part of the response
            session.close().await;
            conn.drop_transport();
            Err(SnovaError::ReadFailure(e.to_string()))
        }
        Err(CopyError::Write(e)) => {
            debug!("Failed to write response to client: {}", e);
            session.close().await;
            conn.drop_transport();
            Ok(())
        }
    }
}
