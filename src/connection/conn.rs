//! Connection state machine and the public [`Client`] handle.
//!
//! The connection runs as a dedicated task (the "actor") that exclusively
//! owns the socket, the wire parser, the subscription registry, the
//! request mux, and the server pool. External callers hold a cheap
//! cloneable [`Client`] and talk to the actor over a command channel, so
//! no shared state needs locking: ordering is guaranteed by the actor's
//! mailbox.
//!
//! Lifecycle:
//!
//! ```text
//! disconnected → dialing → awaiting-info → connected ─┐
//!        ▲                                            │
//!        └───────────── reconnecting ◄────────────────┤
//!                                                     ▼
//!                                         draining → closed
//! ```
//!
//! Every dial gets a fresh parser and a fresh writer task; partial frames
//! and heartbeat counts never leak across reconnects. While disconnected,
//! published frames buffer locally and are flushed after the server has
//! been sent `SUB` lines for every active subscription.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{Error, PermissionOperation, Result, ServerError};
use crate::mux::{rand_u64, RequestMux};
use crate::options::Options;
use crate::protocol::headers::HeaderMap;
use crate::protocol::parser::{Parser, ServerOp};
use crate::protocol::wire::{
    encode_connect, encode_hpub, encode_ping, encode_pong, encode_pub, encode_sub, encode_unsub,
    validate_subject, ConnectInfo, ServerInfo,
};
use crate::subs::{Message, MessageSink, SubscribeOptions, Subscription, SubscriptionRegistry};
use crate::transport::{IoStream, TcpTransport, Transport};

use super::heartbeat::{Heartbeat, HeartbeatAction};
use super::pool::{PoolUpdate, ServerPool};
use super::writer::{spawn_writer, OutboundBuffer, WriterHandle};

/// Read buffer size for socket chunks.
const READ_BUF_SIZE: usize = 64 * 1024;

/// Maximum commands handled per wake-up before flushing.
const MAX_COMMAND_BATCH: usize = 64;

/// Connectivity notifications delivered through [`Client::status`].
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Initial connection established.
    Connected,
    /// Connection lost; reconnection is starting.
    Disconnected,
    /// Connection re-established after a loss.
    Reconnected,
    /// The connection reached its terminal state.
    Closed,
    /// Gossip changed the known server set.
    ServerUpdate(PoolUpdate),
    /// A server error that was not routed to a specific caller.
    Error(ServerError),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Disconnected,
    Dialing,
    AwaitingInfo,
    Connected,
    Reconnecting,
    Draining,
    Closed,
}

/// Commands sent from [`Client`] handles to the connection actor.
#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        subject: String,
        queue: Option<String>,
        max: Option<u64>,
        sink: MessageSink,
        resp: oneshot::Sender<Result<u64>>,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    Request {
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
        resp: oneshot::Sender<Result<Message>>,
    },
    RequestTimeout {
        token: String,
    },
    Flush {
        resp: oneshot::Sender<Result<()>>,
    },
    Drain {
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

/// Completion waiting on a server `PONG`, resolved in FIFO order.
///
/// Every outbound `PING` pushes exactly one waiter, so each `PONG` pairs
/// with the ping that caused it.
#[derive(Debug)]
enum PongWaiter {
    /// A `flush()` caller.
    Flush(oneshot::Sender<Result<()>>),
    /// A heartbeat probe; the pong only matters as traffic.
    Probe,
    /// The drain sequence's final barrier.
    Drain,
}

/// Counter cells shared between the actor and client handles.
#[derive(Debug, Default)]
pub(crate) struct StatsInner {
    pub in_msgs: AtomicU64,
    pub out_msgs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    pub reconnects: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> Stats {
        Stats {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Messages delivered to this client.
    pub in_msgs: u64,
    /// Messages published by this client.
    pub out_msgs: u64,
    /// Raw bytes read from the socket.
    pub in_bytes: u64,
    /// Raw bytes handed to the writer.
    pub out_bytes: u64,
    /// Successful reconnections.
    pub reconnects: u64,
}

/// Options for a single request.
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Headers to attach to the request publish.
    pub headers: Option<HeaderMap>,
    /// Deadline override; falls back to `Options::request_timeout`.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach headers to the request.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Override the request deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Handle to a running connection.
///
/// Cheap to clone; every clone talks to the same connection task.
#[derive(Debug, Clone)]
pub struct Client {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_tx: broadcast::Sender<Event>,
    stats: Arc<StatsInner>,
    request_timeout: Duration,
}

impl Client {
    /// Connect using the given options.
    ///
    /// Each configured server is tried once, in pool order; the first
    /// successful dial + handshake wins. Returns an error when every
    /// server rejects the connection.
    pub async fn connect(options: Options) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(64);
        let stats = Arc::new(StatsInner::default());
        let request_timeout = options.request_timeout;

        let mut conn = Connection::new(
            options,
            cmd_rx,
            cmd_tx.downgrade(),
            status_tx.clone(),
            stats.clone(),
        )?;
        conn.initial_connect().await?;
        tokio::spawn(conn.run());

        Ok(Self {
            cmd_tx,
            status_tx,
            stats,
            request_timeout,
        })
    }

    /// Publish `payload` to `subject`.
    pub async fn publish(&self, subject: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(subject.into(), None, None, payload.into())
            .await
    }

    /// Publish with an explicit reply subject.
    pub async fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_inner(subject.into(), Some(reply.into()), None, payload.into())
            .await
    }

    /// Publish with a header block.
    pub async fn publish_with_headers(
        &self,
        subject: impl Into<String>,
        headers: HeaderMap,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.publish_inner(subject.into(), None, Some(headers), payload.into())
            .await
    }

    async fn publish_inner(
        &self,
        subject: String,
        reply: Option<String>,
        headers: Option<HeaderMap>,
        payload: Bytes,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish {
                subject,
                reply,
                headers,
                payload,
                resp,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Subscribe to a subject with pull-based delivery.
    pub async fn subscribe(&self, subject: impl Into<String>) -> Result<Subscription> {
        self.subscribe_with(subject, SubscribeOptions::new()).await
    }

    /// Subscribe with queue group, delivery ceiling, or callback delivery.
    pub async fn subscribe_with(
        &self,
        subject: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let subject = subject.into();
        let SubscribeOptions {
            queue,
            max,
            callback,
        } = options;

        let (sink, item_rx) = match callback {
            Some(f) => (MessageSink::Callback(f), None),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (MessageSink::Channel(tx), Some(rx))
            }
        };

        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                subject: subject.clone(),
                queue,
                max,
                sink,
                resp,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        let sid = rx.await.map_err(|_| Error::ConnectionClosed)??;

        Ok(Subscription::new(sid, subject, item_rx, self.cmd_tx.clone()))
    }

    /// Publish a request and await its reply via the shared inbox.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<Message> {
        self.request_with(subject, payload, RequestOptions::new())
            .await
    }

    /// Request with per-call headers or deadline.
    pub async fn request_with(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        options: RequestOptions,
    ) -> Result<Message> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                subject: subject.into(),
                headers: options.headers,
                payload: payload.into(),
                timeout: options.timeout.unwrap_or(self.request_timeout),
                resp,
            })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Round-trip to the server: `PING`, resolved by its `PONG`.
    ///
    /// Completion confirms the server has processed everything written
    /// before the ping. Waiters resolve in FIFO order.
    pub async fn flush(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Flush { resp })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Gracefully drain: unsubscribe everything, let in-flight messages
    /// arrive, flush, then close.
    pub async fn drain(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Drain { resp })
            .map_err(|_| Error::ConnectionClosed)?;
        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Close immediately, rejecting all pending requests.
    pub async fn close(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close { resp }).is_err() {
            return Ok(()); // already closed
        }
        let _ = rx.await;
        Ok(())
    }

    /// Subscribe to connectivity notifications.
    pub fn status(&self) -> broadcast::Receiver<Event> {
        self.status_tx.subscribe()
    }

    /// Snapshot of the connection counters.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }
}

/// The connection actor. Owns every piece of mutable connection state.
pub(crate) struct Connection {
    opts: Options,
    transport: Arc<dyn Transport>,
    pool: ServerPool,
    subs: SubscriptionRegistry,
    mux: RequestMux,
    state: ConnState,
    server_info: Option<ServerInfo>,
    parser: Parser,
    reader: Option<ReadHalf<Box<dyn IoStream>>>,
    writer: Option<WriterHandle>,
    /// Live-connection coalescing buffer.
    outbound: OutboundBuffer,
    /// Frames buffered while disconnected; flushed after resubscription.
    pending: BytesMut,
    pong_waiters: VecDeque<PongWaiter>,
    /// Flushes requested while disconnected; turned into pings on reconnect.
    parked_flushes: Vec<oneshot::Sender<Result<()>>>,
    drain_resp: Option<oneshot::Sender<Result<()>>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_weak: mpsc::WeakUnboundedSender<Command>,
    status_tx: broadcast::Sender<Event>,
    stats: Arc<StatsInner>,
    last_err: Option<Error>,
}

impl Connection {
    pub(crate) fn new(
        opts: Options,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        cmd_weak: mpsc::WeakUnboundedSender<Command>,
        status_tx: broadcast::Sender<Event>,
        stats: Arc<StatsInner>,
    ) -> Result<Self> {
        let pool = ServerPool::new(&opts.servers, opts.randomize_servers)?;
        let transport = opts
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(TcpTransport::new()));
        let mux = RequestMux::new(&opts.inbox_prefix);
        let outbound = OutboundBuffer::new(opts.flush_threshold);
        Ok(Self {
            opts,
            transport,
            pool,
            subs: SubscriptionRegistry::new(),
            mux,
            state: ConnState::Disconnected,
            server_info: None,
            parser: Parser::new(),
            reader: None,
            writer: None,
            outbound,
            pending: BytesMut::new(),
            pong_waiters: VecDeque::new(),
            parked_flushes: Vec::new(),
            drain_resp: None,
            cmd_rx,
            cmd_weak,
            status_tx,
            stats,
            last_err: None,
        })
    }

    /// Try every pool server once, in order; first handshake wins.
    pub(crate) async fn initial_connect(&mut self) -> Result<()> {
        let mut last_err: Option<Error> = None;
        for _ in 0..self.pool.len() {
            let endpoint = self.pool.rotate();
            let (host, port) = (endpoint.host.clone(), endpoint.port);
            {
                let current = self.pool.current_mut();
                current.connect_attempts += 1;
                current.last_attempt = Some(Instant::now());
            }
            match self.dial(&host, port).await {
                Ok(()) => {
                    self.pool.current_mut().connect_attempts = 0;
                    self.after_connect(false).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("connect to {host}:{port} failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        self.state = ConnState::Closed;
        Err(last_err.unwrap_or(Error::NoServersAvailable))
    }

    /// Actor main loop; runs until the connection closes.
    pub(crate) async fn run(mut self) {
        loop {
            match self.state {
                ConnState::Connected | ConnState::Draining => self.run_connected().await,
                ConnState::Reconnecting => self.run_reconnect().await,
                _ => break,
            }
        }
        tracing::debug!("connection task finished");
    }

    /// Steady-state loop: commands, socket reads, heartbeat ticks.
    async fn run_connected(&mut self) {
        let Some(mut reader) = self.reader.take() else {
            self.do_close(Some(Error::Disconnected));
            return;
        };
        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut heartbeat = Heartbeat::new(self.opts.ping_interval, self.opts.max_pings_out);
        let period = heartbeat.interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        while matches!(self.state, ConnState::Connected | ConnState::Draining) {
            // Flush whatever the previous wake-up coalesced.
            if !self.outbound.is_empty() {
                let bytes = self.outbound.take();
                self.stats
                    .out_bytes
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                let Some(writer) = self.writer.clone() else {
                    self.begin_disconnect(Error::Disconnected);
                    break;
                };
                if let Err(e) = writer.send(bytes).await {
                    self.begin_disconnect(e);
                    break;
                }
            }

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => {
                        self.handle_command(cmd);
                        // Coalesce whatever else is already queued, but
                        // stop early once the buffer demands a flush.
                        for _ in 1..MAX_COMMAND_BATCH {
                            if self.outbound.over_threshold() {
                                break;
                            }
                            match self.cmd_rx.try_recv() {
                                Ok(cmd) => self.handle_command(cmd),
                                Err(_) => break,
                            }
                        }
                    }
                    None => {
                        // Every client handle is gone.
                        self.do_close(None);
                    }
                },
                result = reader.read(&mut buf) => match result {
                    Ok(0) => self.begin_disconnect(Error::Disconnected),
                    Ok(n) => {
                        heartbeat.note_traffic();
                        self.stats.in_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        match self.parser.feed(&buf[..n]) {
                            Ok(ops) => {
                                for op in ops {
                                    self.dispatch_op(op);
                                }
                            }
                            // Framing errors are fatal: the stream position
                            // is corrupt, so no reconnect-and-resume.
                            Err(e) => self.do_close(Some(e.into())),
                        }
                    }
                    Err(e) => self.begin_disconnect(Error::Io(e)),
                },
                _ = ticker.tick() => match heartbeat.tick() {
                    HeartbeatAction::Healthy => {}
                    HeartbeatAction::Probe => {
                        encode_ping(self.outbound.buf_mut());
                        self.pong_waiters.push_back(PongWaiter::Probe);
                    }
                    HeartbeatAction::Stale => self.begin_disconnect(Error::StaleConnection),
                },
            }
        }
        // The reader (and any partial parser state) dies with this scope;
        // the next dial starts clean.
    }

    /// Reconnect loop: rotate the pool, back off per server, redial.
    async fn run_reconnect(&mut self) {
        let mut consecutive_auth: Option<(String, u32)> = None;

        while self.state == ConnState::Reconnecting {
            let endpoint = self.pool.rotate();
            let attempts = endpoint.connect_attempts;
            let last_attempt = endpoint.last_attempt;
            let (host, port) = (endpoint.host.clone(), endpoint.port);

            if let Some(max) = self.opts.max_reconnect_attempts {
                if attempts >= max {
                    tracing::warn!("evicting {host}:{port} after {attempts} failed attempts");
                    if self.pool.remove_current() {
                        let err = self.last_err.take().unwrap_or(Error::NoServersAvailable);
                        self.do_close(Some(err));
                        return;
                    }
                    continue;
                }
            }

            // Gate on this server's own last attempt, with jitter.
            if let Some(last) = last_attempt {
                let due = last + self.backoff_wait();
                if due > Instant::now() {
                    self.wait_serving_commands(due).await;
                    if self.state != ConnState::Reconnecting {
                        return;
                    }
                }
            }

            {
                let current = self.pool.current_mut();
                current.connect_attempts += 1;
                current.last_attempt = Some(Instant::now());
            }

            match self.dial(&host, port).await {
                Ok(()) => {
                    self.pool.current_mut().connect_attempts = 0;
                    self.after_connect(true).await;
                    return;
                }
                Err(e) => {
                    // The failed dial left the state mid-handshake.
                    self.state = ConnState::Reconnecting;
                    if let Error::Authentication(ref msg) = e {
                        // Two consecutive identical auth errors mean the
                        // credential is bad, not the network; stop hot-looping.
                        match &mut consecutive_auth {
                            Some((prev, count)) if prev == msg => {
                                *count += 1;
                                if *count >= self.opts.max_consecutive_auth_errors {
                                    self.do_close(Some(e));
                                    return;
                                }
                            }
                            _ => consecutive_auth = Some((msg.clone(), 1)),
                        }
                    } else {
                        consecutive_auth = None;
                    }
                    tracing::warn!("reconnect to {host}:{port} failed: {e}");
                    self.last_err = Some(e);
                }
            }
        }
    }

    /// Base reconnect wait plus random jitter (larger under TLS).
    fn backoff_wait(&self) -> Duration {
        let bound = self.opts.jitter_bound().as_millis() as u64;
        let jitter = if bound == 0 { 0 } else { rand_u64() % bound };
        self.opts.reconnect_wait + Duration::from_millis(jitter)
    }

    /// Sleep until `due` while still answering client commands.
    async fn wait_serving_commands(&mut self, due: Instant) {
        let deadline = tokio::time::Instant::from_std(due);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        self.do_close(None);
                        return;
                    }
                },
            }
            if self.state != ConnState::Reconnecting {
                return;
            }
        }
    }

    /// Dial one server and run the INFO/CONNECT/PING handshake.
    ///
    /// On success the connection holds a fresh reader, parser, and writer
    /// task, and `state` is `Connected`.
    async fn dial(&mut self, host: &str, port: u16) -> Result<()> {
        self.state = ConnState::Dialing;
        let stream = tokio::time::timeout(
            self.opts.connect_timeout,
            self.transport.connect(host, port),
        )
        .await
        .map_err(|_| Error::Timeout)??;

        let (mut reader, mut write_half) = tokio::io::split(stream);
        // Fresh parser per dial: stale partial frames must never leak
        // across reconnects.
        let mut parser = Parser::new();
        let mut buf = vec![0u8; READ_BUF_SIZE];

        self.state = ConnState::AwaitingInfo;
        let deadline = tokio::time::Instant::now() + self.opts.connect_timeout;

        // The first frame from the server must be INFO.
        let mut info = loop {
            let n = tokio::time::timeout_at(deadline, reader.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout)??;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            let mut ops = parser.feed(&buf[..n])?.into_iter();
            match ops.next() {
                Some(ServerOp::Info(json)) => break ServerInfo::parse(&json)?,
                Some(op) => {
                    return Err(Error::Protocol(format!(
                        "expected INFO to start the handshake, got {op:?}"
                    )))
                }
                None => continue,
            }
        };

        // CONNECT with credentials (signing the nonce if one was issued),
        // then PING; the connection is up once that PING is answered.
        let credentials = self
            .opts
            .authenticator
            .as_ref()
            .map(|auth| auth(info.nonce.as_deref()))
            .unwrap_or_default();
        let mut connect = ConnectInfo {
            verbose: self.opts.verbose,
            pedantic: self.opts.pedantic,
            tls_required: self.opts.tls,
            name: self.opts.name.clone(),
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            echo: self.opts.echo,
            headers: true,
            no_responders: true,
            auth_token: None,
            user: None,
            pass: None,
            jwt: None,
            nkey: None,
            sig: None,
        };
        connect.apply_credentials(credentials);

        let mut handshake = BytesMut::new();
        encode_connect(&mut handshake, &connect)?;
        encode_ping(&mut handshake);
        write_half.write_all(&handshake).await?;
        write_half.flush().await?;

        // Ops that arrive in the same chunk as the PONG must not be lost.
        let mut leftover: Vec<ServerOp> = Vec::new();
        'await_pong: loop {
            let n = tokio::time::timeout_at(deadline, reader.read(&mut buf))
                .await
                .map_err(|_| Error::Timeout)??;
            if n == 0 {
                return Err(Error::Disconnected);
            }
            let mut ops = parser.feed(&buf[..n])?.into_iter();
            while let Some(op) = ops.next() {
                match op {
                    ServerOp::Pong => {
                        leftover.extend(ops);
                        break 'await_pong;
                    }
                    ServerOp::Err(description) => {
                        return match ServerError::classify(&description) {
                            ServerError::Authentication(msg) => Err(Error::Authentication(msg)),
                            _ => Err(Error::Server(description)),
                        };
                    }
                    ServerOp::Info(json) => {
                        // The server may update its INFO mid-handshake.
                        info = ServerInfo::parse(&json)?;
                    }
                    ServerOp::Ok => {}
                    other => leftover.push(other),
                }
            }
        }

        let (writer, _task) = spawn_writer(write_half);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.parser = parser;
        self.state = ConnState::Connected;
        self.absorb_info(info);
        for op in leftover {
            self.dispatch_op(op);
        }
        Ok(())
    }

    /// Post-handshake bookkeeping shared by connect and reconnect.
    ///
    /// Resubscription frames are queued before anything buffered while
    /// disconnected, so the server knows every subscription before it sees
    /// the backlog of publishes.
    async fn after_connect(&mut self, reconnecting: bool) {
        for entry in self.subs.all() {
            encode_sub(
                self.outbound.buf_mut(),
                &entry.subject,
                entry.queue.as_deref(),
                entry.sid,
            );
            if let Some(max) = entry.max {
                let remaining = max.saturating_sub(entry.received);
                encode_unsub(self.outbound.buf_mut(), entry.sid, Some(remaining));
            }
        }

        for tx in self.parked_flushes.drain(..) {
            encode_ping(self.outbound.buf_mut());
            self.pong_waiters.push_back(PongWaiter::Flush(tx));
        }

        if !self.pending.is_empty() {
            let backlog = self.pending.split();
            self.outbound.buf_mut().extend_from_slice(&backlog);
        }

        if reconnecting {
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            self.emit(Event::Reconnected);
        } else {
            self.emit(Event::Connected);
        }
    }

    /// Route one parsed operation.
    fn dispatch_op(&mut self, op: ServerOp) {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply,
                header,
                payload,
            } => self.handle_msg(subject, sid, reply, header, payload),
            ServerOp::Info(json) => match ServerInfo::parse(&json) {
                Ok(info) => self.absorb_info(info),
                Err(e) => tracing::warn!("ignoring malformed INFO update: {e}"),
            },
            // Server keep-alive probes are answered without delay: the
            // response goes out with this wake-up's flush.
            ServerOp::Ping => encode_pong(self.outbound.buf_mut()),
            ServerOp::Pong => match self.pong_waiters.pop_front() {
                Some(PongWaiter::Flush(tx)) => {
                    let _ = tx.send(Ok(()));
                }
                // A probe's answer; the read path already noted traffic.
                Some(PongWaiter::Probe) => {}
                Some(PongWaiter::Drain) => self.finish_drain(),
                None => {}
            },
            ServerOp::Ok => {}
            ServerOp::Err(description) => self.handle_server_err(&description),
        }
    }

    /// Deliver a message to its subscription or pending request.
    fn handle_msg(
        &mut self,
        subject: Bytes,
        sid: u64,
        reply: Option<Bytes>,
        header: Option<Bytes>,
        payload: Bytes,
    ) {
        self.stats.in_msgs.fetch_add(1, Ordering::Relaxed);

        let (is_mux, exhausted) = match self.subs.get_mut(sid) {
            Some(entry) => {
                entry.received += 1;
                (matches!(entry.sink, MessageSink::Mux), entry.exhausted())
            }
            None => {
                tracing::debug!("dropping message for unknown sid {sid}");
                return;
            }
        };

        let headers = header.and_then(|block| match HeaderMap::decode(&block) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!("discarding undecodable header block: {e}");
                None
            }
        });
        let message = Message {
            subject: String::from_utf8_lossy(&subject).into_owned(),
            reply: reply.map(|r| String::from_utf8_lossy(&r).into_owned()),
            headers,
            payload,
            sid,
        };

        if is_mux {
            if !self.mux.resolve(message) {
                tracing::debug!("dropping reply with no pending request");
            }
        } else if let Some(entry) = self.subs.get_mut(sid) {
            if !entry.sink.deliver(Ok(message)) {
                // Receiver dropped its handle; reap and tell the server.
                self.subs.remove(sid);
                if self.state == ConnState::Connected {
                    encode_unsub(self.outbound.buf_mut(), sid, None);
                }
                return;
            }
        }

        if exhausted {
            self.subs.remove(sid);
        }
    }

    /// Merge a (post-handshake or handshake) INFO into connection state.
    fn absorb_info(&mut self, info: ServerInfo) {
        let tls_name = {
            let current = self.pool.current();
            if current.host.parse::<IpAddr>().is_err() {
                Some(current.host.clone())
            } else {
                current.tls_name.clone()
            }
        };
        let update = self.pool.update(&info.connect_urls, tls_name.as_deref());
        if !update.is_empty() {
            self.emit(Event::ServerUpdate(update));
        }
        self.server_info = Some(info);
    }

    /// Classify and route a server `-ERR`.
    fn handle_server_err(&mut self, description: &str) {
        let classified = ServerError::classify(description);
        match classified {
            ServerError::Permissions {
                operation: PermissionOperation::Subscription,
                ref subject,
                ref queue,
            } => {
                // Deliver only to the subscription that caused it.
                if let Some(sid) = self.subs.find_by_subject(subject, queue.as_deref()) {
                    if let Some(mut entry) = self.subs.remove(sid) {
                        entry.sink.deliver(Err(Error::Permissions {
                            operation: PermissionOperation::Subscription,
                            subject: subject.clone(),
                        }));
                        return;
                    }
                }
                self.emit(Event::Error(classified));
            }
            ServerError::Permissions {
                operation: PermissionOperation::Publish,
                ref subject,
                ..
            } => {
                // A denied request publish fails that one pending request.
                let routed = self.mux.fail_matching_subject(
                    subject,
                    Error::Permissions {
                        operation: PermissionOperation::Publish,
                        subject: subject.clone(),
                    },
                );
                if !routed {
                    self.emit(Event::Error(classified));
                }
            }
            ServerError::Authentication(ref msg) => {
                // The server drops the socket after this; the reconnect
                // loop sees the same error again if the credential is bad.
                self.last_err = Some(Error::Authentication(msg.clone()));
                self.emit(Event::Error(classified));
            }
            ServerError::StaleConnection => self.begin_disconnect(Error::StaleConnection),
            ServerError::Other(ref msg) => {
                self.last_err = Some(Error::Server(msg.clone()));
                self.emit(Event::Error(classified));
            }
        }
    }

    /// Handle one client command. Never blocks; socket writes happen at
    /// the loop's flush point.
    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish {
                subject,
                reply,
                headers,
                payload,
                resp,
            } => {
                let result = self.do_publish(&subject, reply.as_deref(), headers, &payload);
                let _ = resp.send(result);
            }
            Command::Subscribe {
                subject,
                queue,
                max,
                sink,
                resp,
            } => {
                let result = self.do_subscribe(subject, queue, max, sink);
                let _ = resp.send(result);
            }
            Command::Unsubscribe { sid, max } => self.do_unsubscribe(sid, max),
            Command::Request {
                subject,
                headers,
                payload,
                timeout,
                resp,
            } => self.do_request(subject, headers, payload, timeout, resp),
            Command::RequestTimeout { token } => {
                // No-op when the reply already resolved it; tokens are
                // never reused, so this can only hit its own request.
                if let Some(pending) = self.mux.cancel(&token) {
                    let _ = pending.tx.send(Err(Error::Timeout));
                }
            }
            Command::Flush { resp } => match self.state {
                ConnState::Connected | ConnState::Draining => {
                    encode_ping(self.outbound.buf_mut());
                    self.pong_waiters.push_back(PongWaiter::Flush(resp));
                }
                ConnState::Reconnecting => self.parked_flushes.push(resp),
                _ => {
                    let _ = resp.send(Err(Error::ConnectionClosed));
                }
            },
            Command::Drain { resp } => self.do_drain(resp),
            Command::Close { resp } => {
                self.do_close(None);
                let _ = resp.send(());
            }
        }
    }

    fn do_publish(
        &mut self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<HeaderMap>,
        payload: &[u8],
    ) -> Result<()> {
        if self.state == ConnState::Closed {
            return Err(Error::ConnectionClosed);
        }
        validate_subject(subject)?;
        if let Some(reply) = reply {
            validate_subject(reply)?;
        }
        if let Some(info) = &self.server_info {
            if payload.len() > info.max_payload {
                return Err(Error::MaxPayloadExceeded {
                    size: payload.len(),
                    max_payload: info.max_payload,
                });
            }
            if headers.is_some() && !info.headers {
                return Err(Error::Protocol(
                    "server does not support message headers".to_string(),
                ));
            }
        }

        let buf = if self.state == ConnState::Reconnecting {
            &mut self.pending
        } else {
            self.outbound.buf_mut()
        };
        match headers {
            Some(h) => encode_hpub(buf, subject, reply, &h, payload),
            None => encode_pub(buf, subject, reply, payload),
        }
        self.stats.out_msgs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn do_subscribe(
        &mut self,
        subject: String,
        queue: Option<String>,
        max: Option<u64>,
        sink: MessageSink,
    ) -> Result<u64> {
        match self.state {
            ConnState::Closed => return Err(Error::ConnectionClosed),
            ConnState::Draining => return Err(Error::Draining),
            _ => {}
        }
        validate_subject(&subject)?;
        if let Some(queue) = queue.as_deref() {
            validate_subject(queue)?;
        }

        let sid = self.subs.add(subject.clone(), queue.clone(), max, sink);
        if self.state == ConnState::Connected {
            encode_sub(self.outbound.buf_mut(), &subject, queue.as_deref(), sid);
            if let Some(max) = max {
                encode_unsub(self.outbound.buf_mut(), sid, Some(max));
            }
        }
        // While reconnecting, the SUB goes out with resubscription.
        Ok(sid)
    }

    fn do_unsubscribe(&mut self, sid: u64, max: Option<u64>) {
        match max {
            None => {
                if self.subs.remove(sid).is_some() && self.state == ConnState::Connected {
                    encode_unsub(self.outbound.buf_mut(), sid, None);
                }
            }
            Some(max) => {
                let Some(entry) = self.subs.get_mut(sid) else {
                    return;
                };
                if entry.received >= max {
                    self.subs.remove(sid);
                    if self.state == ConnState::Connected {
                        encode_unsub(self.outbound.buf_mut(), sid, None);
                    }
                } else {
                    self.subs.set_max(sid, Some(max));
                    if self.state == ConnState::Connected {
                        encode_unsub(self.outbound.buf_mut(), sid, Some(max));
                    }
                }
            }
        }
    }

    fn do_request(
        &mut self,
        subject: String,
        headers: Option<HeaderMap>,
        payload: Bytes,
        timeout: Duration,
        resp: oneshot::Sender<Result<Message>>,
    ) {
        match self.state {
            ConnState::Closed => {
                let _ = resp.send(Err(Error::ConnectionClosed));
                return;
            }
            ConnState::Draining => {
                let _ = resp.send(Err(Error::Draining));
                return;
            }
            _ => {}
        }
        if let Err(e) = validate_subject(&subject) {
            let _ = resp.send(Err(e));
            return;
        }
        if let Some(info) = &self.server_info {
            if payload.len() > info.max_payload {
                let _ = resp.send(Err(Error::MaxPayloadExceeded {
                    size: payload.len(),
                    max_payload: info.max_payload,
                }));
                return;
            }
        }

        // The shared wildcard subscription is created lazily on the first
        // request and then resubscribed like any other subscription.
        if self.mux.sid().is_none() {
            let wildcard = self.mux.wildcard_subject().to_string();
            let sid = self.subs.add(wildcard.clone(), None, None, MessageSink::Mux);
            self.mux.set_sid(sid);
            if self.state == ConnState::Connected {
                encode_sub(self.outbound.buf_mut(), &wildcard, None, sid);
            }
        }

        let reply = self.mux.register(subject.clone(), resp);
        let token = self
            .mux
            .token_of(&reply)
            .expect("mux-minted reply subject carries its token");

        let buf = if self.state == ConnState::Reconnecting {
            &mut self.pending
        } else {
            self.outbound.buf_mut()
        };
        match headers {
            Some(h) => encode_hpub(buf, &subject, Some(&reply), &h, &payload),
            None => encode_pub(buf, &subject, Some(&reply), &payload),
        }
        self.stats.out_msgs.fetch_add(1, Ordering::Relaxed);

        // Cooperative timeout racing the resolver: it rejects and
        // deregisters only its own request.
        let weak = self.cmd_weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::RequestTimeout { token });
            }
        });
    }

    fn do_drain(&mut self, resp: oneshot::Sender<Result<()>>) {
        match self.state {
            ConnState::Connected => {}
            ConnState::Draining => {
                let _ = resp.send(Err(Error::Draining));
                return;
            }
            _ => {
                let _ = resp.send(Err(Error::ConnectionClosed));
                return;
            }
        }

        self.state = ConnState::Draining;
        let sids: Vec<u64> = self.subs.all().map(|entry| entry.sid).collect();
        for sid in sids {
            encode_unsub(self.outbound.buf_mut(), sid, None);
        }
        // In-flight deliveries keep arriving until the server answers this
        // ping; the Drain waiter then completes the shutdown.
        encode_ping(self.outbound.buf_mut());
        self.pong_waiters.push_back(PongWaiter::Drain);
        self.drain_resp = Some(resp);
    }

    /// Drain barrier reached: everything before the final ping was
    /// processed by the server and delivered locally.
    fn finish_drain(&mut self) {
        if let Some(resp) = self.drain_resp.take() {
            let _ = resp.send(Ok(()));
        }
        self.do_close(None);
    }

    /// Transition to reconnecting (or closed when reconnect is disabled).
    fn begin_disconnect(&mut self, err: Error) {
        match self.state {
            ConnState::Closed => return,
            // A drain cannot complete without the connection; give up.
            ConnState::Draining => {
                if let Some(resp) = self.drain_resp.take() {
                    let _ = resp.send(Err(Error::Disconnected));
                }
                self.do_close(Some(err));
                return;
            }
            _ => {}
        }
        tracing::warn!("connection lost: {err}");

        self.writer = None;
        self.reader = None;
        // Unsent frames survive the disconnect and flush after resubscription.
        if !self.outbound.is_empty() {
            let leftover = self.outbound.take();
            self.pending.extend_from_slice(&leftover);
        }
        for waiter in self.pong_waiters.drain(..) {
            if let PongWaiter::Flush(tx) = waiter {
                let _ = tx.send(Err(Error::Disconnected));
            }
        }
        self.last_err = Some(err);

        if self.opts.reconnect {
            self.state = ConnState::Reconnecting;
            self.emit(Event::Disconnected);
        } else {
            let err = self.last_err.take();
            self.do_close(err);
        }
    }

    /// Terminal teardown: reject all pending work and emit `Closed`.
    fn do_close(&mut self, reason: Option<Error>) {
        if self.state == ConnState::Closed {
            return;
        }
        if let Some(reason) = reason {
            tracing::error!("closing connection: {reason}");
            self.last_err = Some(reason);
        }
        self.state = ConnState::Closed;
        self.writer = None;
        self.reader = None;

        self.mux.dissolve_all(|| Error::ConnectionClosed);
        // Dropping the sinks closes subscriber channels; pull handles see
        // end-of-stream on their next `next()`.
        let _ = self.subs.drain();
        for waiter in self.pong_waiters.drain(..) {
            if let PongWaiter::Flush(tx) = waiter {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }
        for tx in self.parked_flushes.drain(..) {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        if let Some(resp) = self.drain_resp.take() {
            let _ = resp.send(Err(Error::ConnectionClosed));
        }
        self.emit(Event::Closed);
    }

    fn emit(&self, event: Event) {
        // No receivers is fine; status consumers are optional.
        let _ = self.status_tx.send(event);
    }
}
