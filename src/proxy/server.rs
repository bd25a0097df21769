//! Local proxy listener and session dispatcher
//!
//! Accepts client connections, parses their requests and hands each one to the backend the
//! router picks, keeping the same remote connection across keep-alive requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use super::registry::ManagerRegistry;
use super::remote::RemoteConnection;
use super::routing::Router;
use super::transport::ProxyStream;
use crate::config::ServerConfig;
use crate::error::{Result, SnovaError};
use crate::http::HttpRequest;
use crate::models::session::INTERNAL_SERVER_ERROR;
use crate::models::{Event, SessionConnection, SessionState, SessionType};

/// Proxy server
pub struct ProxyServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ServerConfig, registry: Arc<ManagerRegistry>, router: Router) -> Self {
        Self {
            config,
            dispatcher: Arc::new(Dispatcher::new(registry, router)),
        }
    }

    /// Bind the configured address and serve until `shutdown` flips to `true`
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Proxy server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let _ = stream.set_nodelay(true);
                            let dispatcher = self.dispatcher.clone();
                            tokio::spawn(async move {
                                dispatcher.serve_session(stream, client_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Drives one client session: parse, route, request, repeat
pub struct Dispatcher {
    registry: Arc<ManagerRegistry>,
    router: Router,
    next_hash: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: Arc<ManagerRegistry>, router: Router) -> Self {
        Self {
            registry,
            router,
            next_hash: AtomicU64::new(1),
        }
    }

    pub async fn serve_session<S: ProxyStream>(&self, stream: S, client_addr: SocketAddr) {
        let hash = self.next_hash.fetch_add(1, Ordering::Relaxed);
        debug!("Session[{}] accepted from {}", hash, client_addr);

        let mut session = SessionConnection::new(stream, SessionType::Plain);
        let mut current: Option<Box<dyn RemoteConnection>> = None;

        while session.state == SessionState::RecvHttp {
            let request = match HttpRequest::read_from(&mut session.local).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    debug!("Session[{}] sent an unreadable request: {}", hash, e);
                    let _ = session.write_raw(INTERNAL_SERVER_ERROR).await;
                    session.close().await;
                    break;
                }
            };
            if request.is_connect() {
                session.kind = SessionType::HttpsTunnel;
            }

            let event = Event::http_request(hash, request);
            if let Err(e) = self.dispatch(&mut session, &event, &mut current).await {
                debug!("Session[{}] failed: {}", hash, e);
                if let Some(mut conn) = current.take() {
                    let _ = conn.close();
                }
                if e.responds_500() && !session.is_closed() {
                    let _ = session.write_raw(INTERNAL_SERVER_ERROR).await;
                }
                session.close().await;
            }
        }

        if let Some(conn) = current.take() {
            if session.is_tunnel() {
                debug!("Session[{}] tunnel finished, discarding connection", hash);
            } else {
                self.recycle(conn);
            }
        }
        session.close().await;
        debug!("Session[{}] closed", hash);
    }

    /// Route one event and run it on the session's current connection
    async fn dispatch(
        &self,
        session: &mut SessionConnection,
        event: &Event,
        current: &mut Option<Box<dyn RemoteConnection>>,
    ) -> Result<()> {
        let Event::HttpRequest(ev) = event;
        let name = self.router.select(&ev.request.host, session.is_tunnel());
        let manager = self
            .registry
            .get(name)
            .ok_or_else(|| SnovaError::UnknownBackend(name.to_string()))?;

        if let Some(old) = current.take_if(|conn| conn.connection_manager() != manager.name()) {
            self.recycle(old);
        }
        if current.is_none() {
            *current = Some(manager.get_remote_connection(event)?);
        }
        let conn = current
            .as_mut()
            .ok_or_else(|| SnovaError::UnknownBackend(name.to_string()))?;

        conn.request(session, event).await?;
        Ok(())
    }

    fn recycle(&self, conn: Box<dyn RemoteConnection>) {
        match self.registry.get(conn.connection_manager()) {
            Some(manager) => manager.recycle_remote_connection(conn),
            None => debug!("No manager named {} to take the connection back", conn.connection_manager()),
        }
    }
}
