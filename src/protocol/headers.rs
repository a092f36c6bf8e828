//! Message header block codec.
//!
//! Header blocks ride inside `HPUB`/`HMSG` frames: a `NATS/1.0` version
//! line (optionally carrying a status code and description), `Key: Value`
//! lines, and a terminating blank line. The block length is declared up
//! front by the frame's header-length field, so the codec never scans past
//! its input.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Literal version prefix of every header block.
pub const HDR_VERSION: &str = "NATS/1.0";

/// Status code the server uses to signal that a request had no responders.
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Ordered multi-map of message headers, plus an optional inline status.
///
/// Insertion order is preserved; repeated keys are allowed and kept in
/// arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    status: Option<u16>,
    description: Option<String>,
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, removing any previous values for `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.retain(|(k, _)| k != &key);
        self.entries.push((key, value.into()));
    }

    /// Add a value for `key`, keeping existing ones.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in insertion order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of key/value entries (the status line does not count).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no key/value entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inline status code, when the server attached one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Free-text description following the status code.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// True when this block carries the no-responders status.
    pub fn is_no_responders(&self) -> bool {
        self.status == Some(STATUS_NO_RESPONDERS)
    }

    /// Encode the block: version line, entries, terminating blank line.
    ///
    /// Client-originated blocks never carry a status, so none is written.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(HDR_VERSION.as_bytes());
        buf.extend_from_slice(b"\r\n");
        for (key, value) in &self.entries {
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
    }

    /// Encoded length in bytes, for the frame's header-length field.
    pub fn encoded_len(&self) -> usize {
        let mut n = HDR_VERSION.len() + 2 + 2;
        for (key, value) in &self.entries {
            n += key.len() + 2 + value.len() + 2;
        }
        n
    }

    /// Decode a header block received in an `HMSG` frame.
    ///
    /// Tolerates a missing final CRLF (the declared header length is
    /// authoritative) but rejects a bad version line or a `Key: Value`
    /// line without a colon.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::Protocol("header block is not valid UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");

        let version_line = lines
            .next()
            .ok_or_else(|| Error::Protocol("empty header block".to_string()))?;
        if !version_line.starts_with(HDR_VERSION) {
            return Err(Error::Protocol(format!(
                "bad header version line: {version_line:?}"
            )));
        }

        let mut map = Self::new();
        let rest = version_line[HDR_VERSION.len()..].trim();
        if !rest.is_empty() {
            let (code, description) = match rest.split_once(' ') {
                Some((code, description)) => (code, Some(description.trim().to_string())),
                None => (rest, None),
            };
            let code = code
                .parse::<u16>()
                .map_err(|_| Error::Protocol(format!("bad header status code: {code:?}")))?;
            map.status = Some(code);
            map.description = description;
        }

        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("malformed header line: {line:?}")))?;
            map.append(key.trim(), value.trim());
        }
        Ok(map)
    }
}
