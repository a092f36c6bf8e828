//! Plain TCP transport.

use std::io;
use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use super::{BoxFuture, DnsResolver, IoStream, Transport};

/// Transport dialing plain TCP sockets.
///
/// Hostnames resolving to several addresses are tried in order until one
/// accepts; `TCP_NODELAY` is set so small control lines are not delayed by
/// Nagle batching.
#[derive(Default)]
pub struct TcpTransport {
    resolver: Option<DnsResolver>,
}

impl TcpTransport {
    /// Create a transport using the system resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport with a custom DNS resolution hook.
    pub fn with_resolver(resolver: DnsResolver) -> Self {
        Self {
            resolver: Some(resolver),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> BoxFuture<'static, io::Result<Box<dyn IoStream>>> {
        let host = host.to_string();
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let addrs = resolve(&host, port, resolver).await?;
            let mut last_err = None;
            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        stream.set_nodelay(true)?;
                        return Ok(Box::new(stream) as Box<dyn IoStream>);
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {host}"))
            }))
        })
    }
}

/// Resolve `host` to socket addresses, via the hook when one is installed.
async fn resolve(
    host: &str,
    port: u16,
    resolver: Option<DnsResolver>,
) -> io::Result<Vec<SocketAddr>> {
    // Literal addresses skip resolution entirely.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    match resolver {
        Some(resolve) => {
            let ips = resolve(host.to_string()).await?;
            Ok(ips.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
        }
        None => Ok(tokio::net::lookup_host((host, port)).await?.collect()),
    }
}
