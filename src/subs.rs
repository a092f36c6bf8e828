//! Subscriptions: registry, delivery sinks, and the public handle.
//!
//! The connection owns a [`SubscriptionRegistry`] mapping subscription ids
//! to subscriber state. Ids come from a strictly increasing counter and are
//! never reused, so a message for a cancelled id can never race into a
//! newer subscription.
//!
//! Delivery goes through one internal [`MessageSink`] abstraction with two
//! adapters: a channel sink backing the pull-based [`Subscription`] handle,
//! and a callback sink invoking a user closure inline. The dispatch logic
//! upstream is written once against the sink.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::conn::Command;
use crate::error::{Error, Result};
use crate::protocol::headers::HeaderMap;

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Reply subject for request/reply exchanges.
    pub reply: Option<String>,
    /// Decoded headers, when the frame carried a header block.
    pub headers: Option<HeaderMap>,
    /// Payload bytes, exactly as published.
    pub payload: Bytes,
    /// Subscription id this message was delivered to.
    pub sid: u64,
}

/// Internal delivery target of a subscription.
pub(crate) enum MessageSink {
    /// Queue for a pull-based [`Subscription`] handle.
    Channel(mpsc::UnboundedSender<Result<Message>>),
    /// User closure invoked inline on the connection task.
    Callback(Box<dyn FnMut(Result<Message>) + Send>),
    /// Messages belong to the request multiplexer, not a subscriber.
    Mux,
}

impl MessageSink {
    /// Deliver one item. Returns `false` when the receiver is gone and the
    /// subscription should be reaped.
    pub(crate) fn deliver(&mut self, item: Result<Message>) -> bool {
        match self {
            Self::Channel(tx) => tx.send(item).is_ok(),
            Self::Callback(f) => {
                f(item);
                true
            }
            Self::Mux => true,
        }
    }
}

impl std::fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(_) => f.write_str("MessageSink::Channel"),
            Self::Callback(_) => f.write_str("MessageSink::Callback"),
            Self::Mux => f.write_str("MessageSink::Mux"),
        }
    }
}

/// State held per active subscription.
#[derive(Debug)]
pub(crate) struct SubEntry {
    pub sid: u64,
    pub subject: String,
    pub queue: Option<String>,
    /// Auto-unsubscribe after this many deliveries.
    pub max: Option<u64>,
    /// Messages delivered so far.
    pub received: u64,
    pub sink: MessageSink,
}

impl SubEntry {
    /// True once the delivery ceiling has been reached.
    pub fn exhausted(&self) -> bool {
        self.max.is_some_and(|max| self.received >= max)
    }
}

/// Map of subscription id to subscriber state.
///
/// Owned exclusively by the connection task; external callers reach it
/// only through the connection's public operations.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    subs: HashMap<u64, SubEntry>,
    next_sid: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subs: HashMap::new(),
            next_sid: 0,
        }
    }

    /// Register a subscription and assign the next id.
    ///
    /// Ids increase strictly and are never reused, even after removal.
    pub fn add(
        &mut self,
        subject: String,
        queue: Option<String>,
        max: Option<u64>,
        sink: MessageSink,
    ) -> u64 {
        self.next_sid += 1;
        let sid = self.next_sid;
        self.subs.insert(
            sid,
            SubEntry {
                sid,
                subject,
                queue,
                max,
                received: 0,
                sink,
            },
        );
        sid
    }

    pub fn get_mut(&mut self, sid: u64) -> Option<&mut SubEntry> {
        self.subs.get_mut(&sid)
    }

    pub fn remove(&mut self, sid: u64) -> Option<SubEntry> {
        self.subs.remove(&sid)
    }

    /// Update the auto-unsubscribe ceiling for an active subscription.
    pub fn set_max(&mut self, sid: u64, max: Option<u64>) {
        if let Some(entry) = self.subs.get_mut(&sid) {
            entry.max = max;
        }
    }

    /// Find the subscription a server permission error refers to.
    pub fn find_by_subject(&self, subject: &str, queue: Option<&str>) -> Option<u64> {
        self.subs
            .values()
            .find(|entry| entry.subject == subject && entry.queue.as_deref() == queue)
            .map(|entry| entry.sid)
    }

    /// Iterate over all active subscriptions.
    pub fn all(&self) -> impl Iterator<Item = &SubEntry> {
        self.subs.values()
    }

    /// Remove and return every subscription.
    pub fn drain(&mut self) -> Vec<SubEntry> {
        self.subs.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }
}

/// Options for `subscribe_with`.
pub struct SubscribeOptions {
    /// Queue group to join; members share delivery of each message.
    pub queue: Option<String>,
    /// Auto-unsubscribe after this many messages.
    pub max: Option<u64>,
    /// Deliver through this callback instead of the pull handle.
    pub callback: Option<Box<dyn FnMut(Result<Message>) + Send>>,
}

impl SubscribeOptions {
    /// Options with no queue group, no ceiling, pull-based delivery.
    pub fn new() -> Self {
        Self {
            queue: None,
            max: None,
            callback: None,
        }
    }

    /// Join a queue group.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Auto-unsubscribe after `max` messages.
    pub fn max_messages(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }

    /// Deliver via a callback; the returned handle yields no messages.
    pub fn callback(mut self, f: impl FnMut(Result<Message>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(f));
        self
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("queue", &self.queue)
            .field("max", &self.max)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Handle to an active subscription.
///
/// Pull messages with [`next`](Self::next); dropping the handle closes the
/// delivery channel, which the connection notices on the next delivery and
/// unsubscribes server-side.
#[derive(Debug)]
pub struct Subscription {
    sid: u64,
    subject: String,
    rx: Option<mpsc::UnboundedReceiver<Result<Message>>>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        sid: u64,
        subject: String,
        rx: Option<mpsc::UnboundedReceiver<Result<Message>>>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            sid,
            subject,
            rx,
            cmd_tx,
        }
    }

    /// Subscription id assigned by the connection.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Wait for the next delivery.
    ///
    /// Returns `None` once the subscription is closed (unsubscribed,
    /// exhausted, drained, or connection closed), or always for
    /// callback-based subscriptions. An `Err` item carries a server error
    /// routed specifically to this subscription, e.g. a permissions
    /// violation for its subject.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stop this subscription.
    pub fn unsubscribe(&self) -> Result<()> {
        self.cmd_tx
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: None,
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Stop after `max` total messages have been delivered.
    pub fn unsubscribe_after(&self, max: u64) -> Result<()> {
        self.cmd_tx
            .send(Command::Unsubscribe {
                sid: self.sid,
                max: Some(max),
            })
            .map_err(|_| Error::ConnectionClosed)
    }
}
