//! Ordered pool of known server endpoints.
//!
//! Seeded from configuration, extended by server-announced cluster peers
//! (gossip), and consulted by the reconnect loop in round-robin order.
//! Gossip may remove peers it previously announced, but seed-configured
//! endpoints are never auto-removed, and the pool is never left empty: a
//! default endpoint is reinstated when the last server is evicted.

use std::collections::VecDeque;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::mux::rand_u64;

/// Default host used when no servers are configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default client port.
pub const DEFAULT_PORT: u16 = 4222;

/// One known server address plus its dial bookkeeping.
#[derive(Debug, Clone)]
pub struct ServerEndpoint {
    /// Hostname or IP literal.
    pub host: String,
    /// Port to dial.
    pub port: u16,
    /// Hostname to present for TLS verification when `host` is an IP
    /// announced by gossip.
    pub tls_name: Option<String>,
    /// Endpoint came from gossip rather than configuration.
    pub discovered: bool,
    /// Dial attempts made against this endpoint.
    pub connect_attempts: u32,
    /// When the last dial attempt started.
    pub last_attempt: Option<Instant>,
}

impl ServerEndpoint {
    /// Parse `host`, `host:port`, or `nats://host:port`.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url
            .strip_prefix("nats://")
            .or_else(|| url.strip_prefix("tls://"))
            .unwrap_or(url);
        if trimmed.is_empty() {
            return Err(Error::Protocol(format!("invalid server url: {url:?}")));
        }
        let (host, port) = match trimmed.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Protocol(format!("invalid server port in {url:?}")))?;
                (host, port)
            }
            None => (trimmed, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::Protocol(format!("invalid server url: {url:?}")));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            tls_name: None,
            discovered: false,
            connect_attempts: 0,
            last_attempt: None,
        })
    }

    /// `host:port` form, used as the pool identity of this endpoint.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn default_endpoint() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls_name: None,
            discovered: false,
            connect_attempts: 0,
            last_attempt: None,
        }
    }
}

/// Result of merging a gossip announcement into the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolUpdate {
    /// Addresses newly added from the announcement.
    pub added: Vec<String>,
    /// Gossip-discovered addresses dropped because they are gone from it.
    pub deleted: Vec<String>,
}

impl PoolUpdate {
    /// True when the announcement changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}

/// Ordered, mutable list of known servers. The head is always "current".
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: VecDeque<ServerEndpoint>,
    first_selection_done: bool,
}

impl ServerPool {
    /// Build a pool from configured seeds, falling back to the default
    /// endpoint when none are given.
    pub fn new(seeds: &[String], randomize: bool) -> Result<Self> {
        let mut servers: VecDeque<ServerEndpoint> = seeds
            .iter()
            .map(|url| ServerEndpoint::parse(url))
            .collect::<Result<_>>()?;
        if servers.is_empty() {
            servers.push_back(ServerEndpoint::default_endpoint());
        }
        if randomize && servers.len() > 1 {
            shuffle(&mut servers);
        }
        Ok(Self {
            servers,
            first_selection_done: false,
        })
    }

    /// The current endpoint.
    pub fn current(&self) -> &ServerEndpoint {
        &self.servers[0]
    }

    /// Mutable access to the current endpoint (attempt bookkeeping).
    pub fn current_mut(&mut self) -> &mut ServerEndpoint {
        &mut self.servers[0]
    }

    /// Advance to the next endpoint and return it.
    ///
    /// The very first selection keeps the configured order; every later
    /// call moves the head to the tail.
    pub fn rotate(&mut self) -> &ServerEndpoint {
        if self.first_selection_done {
            if let Some(head) = self.servers.pop_front() {
                self.servers.push_back(head);
            }
        } else {
            self.first_selection_done = true;
        }
        &self.servers[0]
    }

    /// Evict the current endpoint.
    ///
    /// Returns `true` when the eviction emptied the pool; the default
    /// endpoint is reinstated so the pool invariant holds, but the caller
    /// should treat the pool as exhausted.
    pub fn remove_current(&mut self) -> bool {
        self.servers.pop_front();
        if self.servers.is_empty() {
            self.servers.push_back(ServerEndpoint::default_endpoint());
            return true;
        }
        false
    }

    /// Merge a server-announced peer list.
    ///
    /// Adds peers not yet present and removes gossip-discovered peers no
    /// longer announced. Seed-configured endpoints and the current head
    /// (the server being talked to) are never removed.
    pub fn update(&mut self, announced: &[String], tls_name: Option<&str>) -> PoolUpdate {
        let mut update = PoolUpdate::default();

        let announced: Vec<ServerEndpoint> = announced
            .iter()
            .filter_map(|url| ServerEndpoint::parse(url).ok())
            .collect();

        for peer in &announced {
            if !self.servers.iter().any(|s| s.addr() == peer.addr()) {
                let mut endpoint = peer.clone();
                endpoint.discovered = true;
                if endpoint.host.parse::<std::net::IpAddr>().is_ok() {
                    endpoint.tls_name = tls_name.map(str::to_string);
                }
                update.added.push(endpoint.addr());
                self.servers.push_back(endpoint);
            }
        }

        let keep_head = self.servers[0].addr();
        let announced_addrs: Vec<String> = announced.iter().map(ServerEndpoint::addr).collect();
        self.servers.retain(|s| {
            let keep = !s.discovered || s.addr() == keep_head || announced_addrs.contains(&s.addr());
            if !keep {
                update.deleted.push(s.addr());
            }
            keep
        });

        update
    }

    /// Number of known endpoints.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Iterate over all endpoints, current first.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &ServerEndpoint> {
        self.servers.iter()
    }
}

/// Fisher-Yates shuffle driven by the time-seeded generator.
fn shuffle(servers: &mut VecDeque<ServerEndpoint>) {
    for i in (1..servers.len()).rev() {
        let j = (rand_u64() % (i as u64 + 1)) as usize;
        servers.swap(i, j);
    }
}
