//! Snova - HTTP/HTTPS forward proxy
//!
//! A local proxy that relays client requests and CONNECT tunnels through interchangeable
//! upstream backends.
//!
//! ## Features
//!
//! - Direct dialing, SOCKS4/4a/5 chaining and HTTP proxy chaining (`Forward` backends)
//! - A dual HTTP/HTTPS `Google` backend with optional CONNECT chaining and relaxed TLS
//! - Per-backend bounded idle connection pools
//! - Transparent redial when a reused upstream connection went stale
//! - Host based routing between backends

pub mod config;
pub mod error;
pub mod http;
pub mod models;
pub mod proxy;

pub use config::Config;
pub use error::{Result, SnovaError};
