//! Transport abstraction.
//!
//! The connection only needs a duplex byte stream; where it comes from
//! (plain TCP, TLS, an in-process pipe in tests) is the transport's
//! business. A [`Transport`] is a factory: `connect` yields a fresh
//! boxed stream per dial.

pub mod tcp;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

pub use tcp::TcpTransport;

/// Boxed future used at the transport seam (object-safe async methods).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Duplex byte stream produced by a transport.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Factory for duplex byte streams.
pub trait Transport: Send + Sync {
    /// Open a stream to `host:port`.
    fn connect(&self, host: &str, port: u16) -> BoxFuture<'static, std::io::Result<Box<dyn IoStream>>>;
}

/// Hook resolving a hostname to candidate addresses.
///
/// Installed on [`TcpTransport`] when gossip resolution should go through
/// a custom resolver instead of the system one.
pub type DnsResolver = Arc<dyn Fn(String) -> BoxFuture<'static, std::io::Result<Vec<IpAddr>>> + Send + Sync>;
