//! Client configuration.
//!
//! [`Options`] collects everything the connection needs up front: the seed
//! server list, reconnect and heartbeat policy, handshake identity, and the
//! transport/authenticator seams. Builder-style methods mutate and return
//! `self`, so configuration reads as a chain:
//!
//! ```
//! use natswire::Options;
//! use std::time::Duration;
//!
//! let opts = Options::new()
//!     .server("demo.example.com:4222")
//!     .name("billing-worker")
//!     .reconnect_wait(Duration::from_millis(500))
//!     .randomize_servers(false);
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::auth::Authenticator;
use crate::transport::Transport;

/// Default interval between heartbeat probes.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Default missed-probe count before a connection is declared stale.
pub const DEFAULT_MAX_PINGS_OUT: u32 = 2;

/// Default base wait between reconnect attempts against the same server.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);

/// Default dial attempts per server before it is evicted from the pool.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default outbound buffer size that forces an immediate flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Client configuration.
#[derive(Clone)]
pub struct Options {
    /// Seed servers as `host:port` (an optional `nats://` prefix is accepted).
    pub servers: Vec<String>,
    /// Client name reported to the server.
    pub name: Option<String>,
    /// Ask the server to echo `+OK` for every accepted command.
    pub verbose: bool,
    /// Ask the server for strict subject checking.
    pub pedantic: bool,
    /// Receive the client's own publishes back on matching subscriptions.
    pub echo: bool,
    /// Reconnect after a lost connection instead of closing.
    pub reconnect: bool,
    /// Dial attempts per server before eviction; `None` means unlimited.
    pub max_reconnect_attempts: Option<u32>,
    /// Base wait between reconnect attempts against the same server.
    pub reconnect_wait: Duration,
    /// Upper bound of the random jitter added to the reconnect wait.
    pub reconnect_jitter: Duration,
    /// Jitter bound used instead when the transport is TLS (handshakes are
    /// costlier, so thundering herds hurt more).
    pub reconnect_jitter_tls: Duration,
    /// Shuffle the server pool once at startup.
    pub randomize_servers: bool,
    /// Deadline for a single dial + handshake.
    pub connect_timeout: Duration,
    /// Interval between heartbeat ticks.
    pub ping_interval: Duration,
    /// Missed heartbeat probes before the connection is declared stale.
    pub max_pings_out: u32,
    /// Default deadline for `request()`.
    pub request_timeout: Duration,
    /// Prefix for the shared request inbox subject.
    pub inbox_prefix: String,
    /// Outbound buffer size past which a flush is forced immediately.
    pub flush_threshold: usize,
    /// Consecutive identical auth errors that abort reconnection.
    pub max_consecutive_auth_errors: u32,
    /// Transport is TLS; selects the larger reconnect jitter.
    pub tls: bool,
    /// Credential producer invoked on every handshake.
    pub authenticator: Option<Authenticator>,
    /// Transport factory; defaults to plain TCP.
    pub transport: Option<Arc<dyn Transport>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            name: None,
            verbose: false,
            pedantic: false,
            echo: true,
            reconnect: true,
            max_reconnect_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            reconnect_jitter: Duration::from_millis(100),
            reconnect_jitter_tls: Duration::from_secs(1),
            randomize_servers: true,
            connect_timeout: Duration::from_secs(5),
            ping_interval: DEFAULT_PING_INTERVAL,
            max_pings_out: DEFAULT_MAX_PINGS_OUT,
            request_timeout: Duration::from_secs(10),
            inbox_prefix: "_INBOX".to_string(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            max_consecutive_auth_errors: 2,
            tls: false,
            authenticator: None,
            transport: None,
        }
    }
}

impl Options {
    /// Create options with defaults and an empty server list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one seed server.
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.servers.push(server.into());
        self
    }

    /// Add several seed servers.
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers.extend(servers.into_iter().map(Into::into));
        self
    }

    /// Set the client name reported to the server.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Disable reconnection; a lost connection closes the client.
    pub fn no_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }

    /// Set the per-server dial attempt ceiling; `None` is unlimited.
    pub fn max_reconnect_attempts(mut self, max: Option<u32>) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    /// Set the base wait between reconnect attempts.
    pub fn reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Enable or disable shuffling of the server pool at startup.
    pub fn randomize_servers(mut self, randomize: bool) -> Self {
        self.randomize_servers = randomize;
        self
    }

    /// Set the heartbeat interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the missed-probe ceiling for staleness detection.
    pub fn max_pings_out(mut self, max: u32) -> Self {
        self.max_pings_out = max;
        self
    }

    /// Set the default request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the shared inbox subject prefix.
    pub fn inbox_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.inbox_prefix = prefix.into();
        self
    }

    /// Disable delivery of this client's own publishes.
    pub fn no_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Install a credential producer.
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Install a custom transport factory (TLS, in-process pipes, ...).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Jitter bound applicable to this configuration.
    pub(crate) fn jitter_bound(&self) -> Duration {
        if self.tls {
            self.reconnect_jitter_tls
        } else {
            self.reconnect_jitter
        }
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("servers", &self.servers)
            .field("name", &self.name)
            .field("verbose", &self.verbose)
            .field("pedantic", &self.pedantic)
            .field("echo", &self.echo)
            .field("reconnect", &self.reconnect)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_wait", &self.reconnect_wait)
            .field("randomize_servers", &self.randomize_servers)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("request_timeout", &self.request_timeout)
            .field("inbox_prefix", &self.inbox_prefix)
            .field("flush_threshold", &self.flush_threshold)
            .field(
                "max_consecutive_auth_errors",
                &self.max_consecutive_auth_errors,
            )
            .field("tls", &self.tls)
            .field("authenticator", &self.authenticator.is_some())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}
