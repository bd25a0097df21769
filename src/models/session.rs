use tokio::io::{AsyncWriteExt, BufReader};

use crate::proxy::transport::{BoxedStream, ProxyStream};

/// Written to the client once a CONNECT tunnel is up
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Written to a client that asked for `Expect: 100-continue`, once its head went upstream
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Written to the client when the upstream could not be reached
pub const INTERNAL_SERVER_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// Raw bytes after a CONNECT
    HttpsTunnel,
    /// Discrete HTTP request/response cycles
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the client's next request
    RecvHttp,
    /// Nothing more will be served on this client connection
    SessionClose,
}

/// Per-client-connection context
pub struct SessionConnection {
    /// Buffered client stream; requests are parsed from it and responses written to it
    pub local: BufReader<BoxedStream>,
    pub kind: SessionType,
    pub state: SessionState,
    closed: bool,
}

impl SessionConnection {
    pub fn new<S: ProxyStream>(stream: S, kind: SessionType) -> Self {
        Self {
            local: BufReader::new(Box::new(stream) as BoxedStream),
            kind,
            state: SessionState::RecvHttp,
            closed: false,
        }
    }

    pub fn is_tunnel(&self) -> bool {
        self.kind == SessionType::HttpsTunnel
    }

    /// Write synthesized bytes straight to the client
    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.local.write_all(bytes).await?;
        self.local.flush().await
    }

    /// Shut the client stream down and mark the session terminal. Idempotent.
    pub async fn close(&mut self) {
        self.state = SessionState::SessionClose;
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.local.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for SessionConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConnection")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish()
    }
}
