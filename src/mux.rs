//! Request/reply multiplexing over a shared inbox.
//!
//! One wildcard subscription (`<prefix>.<entropy>.*`) serves every
//! concurrent request on the connection. Each request mints a unique token,
//! appends it to the shared prefix to form its reply subject, and registers
//! a resolver keyed by token. Inbound messages on the wildcard are
//! demultiplexed by stripping the prefix to recover the token, then the
//! matching pending request is resolved exactly once.
//!
//! A 503 status with an empty payload means the request subject had no
//! responders; that resolves the one pending request with a typed error
//! instead of data.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::subs::Message;

/// State of one in-flight request.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    /// Subject the request was published to, for permission-error matching.
    pub subject: String,
    /// Resolver for the caller awaiting the reply.
    pub tx: oneshot::Sender<Result<Message>>,
}

/// Correlation registry for multiplexed requests.
#[derive(Debug)]
pub(crate) struct RequestMux {
    /// Shared inbox prefix, unique per connection.
    prefix: String,
    /// Subject of the wildcard subscription covering all reply inboxes.
    wildcard: String,
    /// Sid of the wildcard subscription, once it has been created.
    sid: Option<u64>,
    next_token: u64,
    pending: HashMap<String, PendingRequest>,
}

impl RequestMux {
    /// Create a mux with a freshly minted unique inbox prefix.
    pub fn new(inbox_prefix: &str) -> Self {
        let prefix = format!("{inbox_prefix}.{:016X}", rand_u64());
        let wildcard = format!("{prefix}.*");
        Self {
            prefix,
            wildcard,
            sid: None,
            next_token: 0,
            pending: HashMap::new(),
        }
    }

    /// Subject of the shared wildcard subscription.
    pub fn wildcard_subject(&self) -> &str {
        &self.wildcard
    }

    /// Sid of the wildcard subscription, when already established.
    pub fn sid(&self) -> Option<u64> {
        self.sid
    }

    pub fn set_sid(&mut self, sid: u64) {
        self.sid = Some(sid);
    }

    /// Register a pending request; returns its unique reply subject.
    pub fn register(&mut self, subject: String, tx: oneshot::Sender<Result<Message>>) -> String {
        self.next_token += 1;
        let token = format!("{:X}", self.next_token);
        let reply = format!("{}.{}", self.prefix, token);
        self.pending.insert(token, PendingRequest { subject, tx });
        reply
    }

    /// Token of a reply subject, when it belongs to this mux.
    pub fn token_of(&self, reply_subject: &str) -> Option<String> {
        reply_subject
            .strip_prefix(&self.prefix)?
            .strip_prefix('.')
            .map(str::to_string)
    }

    /// Resolve the pending request a reply message belongs to.
    ///
    /// Returns `false` for unknown tokens (a reply that raced a timeout or
    /// cancellation); such messages are dropped by the caller.
    pub fn resolve(&mut self, message: Message) -> bool {
        let Some(token) = self.token_of(&message.subject) else {
            return false;
        };
        let Some(pending) = self.pending.remove(&token) else {
            return false;
        };
        let no_responders = message.payload.is_empty()
            && message
                .headers
                .as_ref()
                .is_some_and(|h| h.is_no_responders());
        let outcome = if no_responders {
            Err(Error::NoResponders)
        } else {
            Ok(message)
        };
        let _ = pending.tx.send(outcome);
        true
    }

    /// Cancel a pending request by token; used by timeouts.
    ///
    /// The resolver is dropped without firing, so only the cancelling
    /// caller observes the outcome; other pending requests are untouched.
    pub fn cancel(&mut self, token: &str) -> Option<PendingRequest> {
        self.pending.remove(token)
    }

    /// Fail the one pending request whose publish subject matches.
    ///
    /// Used to route a server publish-permission error to the caller that
    /// triggered it. Returns `false` when no pending request matches.
    pub fn fail_matching_subject(&mut self, subject: &str, err: Error) -> bool {
        let token = self
            .pending
            .iter()
            .find(|(_, p)| p.subject == subject)
            .map(|(token, _)| token.clone());
        match token {
            Some(token) => {
                if let Some(pending) = self.pending.remove(&token) {
                    let _ = pending.tx.send(Err(err));
                }
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with a connection-level error.
    pub fn dissolve_all(&mut self, make_err: impl Fn() -> Error) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(Err(make_err()));
        }
    }

    /// Number of requests still awaiting replies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Time-seeded random u64 for inbox entropy and reconnect jitter.
///
/// Not cryptographic: uniqueness per process is all that is needed, and
/// the multiplier shuffle keeps successive calls from correlating.
pub(crate) fn rand_u64() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    nanos.wrapping_mul(0x517cc1b727220a95) ^ pid.rotate_left(32)
}
