//! Proxy core
//!
//! This module provides:
//! - The backend contract (`RemoteConnection` / `RemoteConnectionManager`) and idle pooling
//! - Forward, Direct and Google backends
//! - Plain request relay with write retry, and the CONNECT tunnel relay
//! - Routing, the manager registry and the local listener

pub mod forward;
pub mod google;
pub mod handler;
pub mod registry;
pub mod remote;
pub mod routing;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_util;

pub use forward::{ForwardManager, DIRECT_NAME, FORWARD_NAME};
pub use google::{GoogleManager, GoogleVariant, GOOGLE_HTTPS_NAME, GOOGLE_HTTP_NAME};
pub use registry::ManagerRegistry;
pub use remote::{IdlePool, RemoteConnection, RemoteConnectionManager};
pub use routing::Router;
pub use server::{Dispatcher, ProxyServer};
pub use transport::ProxyTransport;
pub use tunnel::TunnelHandler;
