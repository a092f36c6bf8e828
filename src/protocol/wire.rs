//! Outbound frame encoding and handshake JSON bodies.
//!
//! The client side of the protocol is ASCII control lines, optionally
//! followed by a binary payload and a trailing CRLF:
//!
//! ```text
//! CONNECT {json}\r\n
//! PUB <subject> [reply] <#bytes>\r\n<payload>\r\n
//! HPUB <subject> [reply] <#hdr-bytes> <#total-bytes>\r\n<hdr><payload>\r\n
//! SUB <subject> [queue] <sid>\r\n
//! UNSUB <sid> [max-msgs]\r\n
//! PING\r\n / PONG\r\n
//! ```
//!
//! Encoders append into a caller-owned `BytesMut` so same-task writes
//! coalesce into one buffer before hitting the socket.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::protocol::headers::HeaderMap;

/// Line terminator for every control line.
pub const CRLF: &[u8] = b"\r\n";

/// Capabilities and identity announced by the server in its `INFO` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    /// Unique id of the server instance.
    #[serde(default)]
    pub server_id: String,
    /// Configured server name.
    #[serde(default)]
    pub server_name: String,
    /// Server version string.
    #[serde(default)]
    pub version: String,
    /// Protocol level; 1 and above supports asynchronous INFO updates.
    #[serde(default)]
    pub proto: i32,
    /// Hostname the server believes it is reachable at.
    #[serde(default)]
    pub host: String,
    /// Port the server is listening on.
    #[serde(default)]
    pub port: u16,
    /// Largest payload the server accepts, in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Client id assigned by the server.
    #[serde(default)]
    pub client_id: u64,
    /// Whether the server requires authentication.
    #[serde(default)]
    pub auth_required: bool,
    /// Whether the server requires TLS.
    #[serde(default)]
    pub tls_required: bool,
    /// Whether the server can upgrade to TLS.
    #[serde(default)]
    pub tls_available: bool,
    /// Whether the server understands header frames (`HPUB`/`HMSG`).
    #[serde(default)]
    pub headers: bool,
    /// Cluster peers announced for client failover (gossip).
    #[serde(default)]
    pub connect_urls: Vec<String>,
    /// Nonce the client must sign when using signature auth.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Whether the server is shutting down and shedding clients.
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
}

fn default_max_payload() -> usize {
    1024 * 1024
}

impl ServerInfo {
    /// Parse the JSON body of an `INFO` frame.
    pub fn parse(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }
}

/// Body of the `CONNECT` frame sent during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    /// Echo `+OK` for every accepted command.
    pub verbose: bool,
    /// Reject messages with strict subject checking.
    pub pedantic: bool,
    /// Client demands a TLS connection.
    pub tls_required: bool,
    /// Optional client name, shown in server monitoring.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Implementation language of this client.
    pub lang: String,
    /// Client library version.
    pub version: String,
    /// Protocol level the client speaks.
    pub protocol: i32,
    /// Whether the server should echo the client's own publishes back.
    pub echo: bool,
    /// Client understands header frames.
    pub headers: bool,
    /// Client wants 503 status replies for requests with no responders.
    pub no_responders: bool,
    /// Authentication token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Username for user/password auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Password for user/password auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    /// User JWT for decentralized auth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// Public NKey.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    /// Signed server nonce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl ConnectInfo {
    /// Merge authenticator-produced credential fields into this body.
    pub fn apply_credentials(&mut self, creds: Credentials) {
        self.auth_token = creds.token;
        self.user = creds.user;
        self.pass = creds.pass;
        self.jwt = creds.jwt;
        self.nkey = creds.nkey;
        self.sig = creds.sig;
    }
}

/// Validate a subject for outbound use.
///
/// Subjects must be non-empty and free of whitespace and CRLF; anything
/// else would corrupt the control line.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty()
        || subject
            .bytes()
            .any(|b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n')
    {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

/// Append a `PUB` frame.
pub fn encode_pub(buf: &mut BytesMut, subject: &str, reply: Option<&str>, payload: &[u8]) {
    buf.extend_from_slice(b"PUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(reply) = reply {
        buf.extend_from_slice(reply.as_bytes());
        buf.extend_from_slice(b" ");
    }
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// Append an `HPUB` frame carrying a header block.
pub fn encode_hpub(
    buf: &mut BytesMut,
    subject: &str,
    reply: Option<&str>,
    headers: &HeaderMap,
    payload: &[u8],
) {
    let header_len = headers.encoded_len();
    buf.extend_from_slice(b"HPUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(reply) = reply {
        buf.extend_from_slice(reply.as_bytes());
        buf.extend_from_slice(b" ");
    }
    buf.extend_from_slice(header_len.to_string().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice((header_len + payload.len()).to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    headers.encode_into(buf);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(CRLF);
}

/// Append a `SUB` frame.
pub fn encode_sub(buf: &mut BytesMut, subject: &str, queue: Option<&str>, sid: u64) {
    buf.extend_from_slice(b"SUB ");
    buf.extend_from_slice(subject.as_bytes());
    buf.extend_from_slice(b" ");
    if let Some(queue) = queue {
        buf.extend_from_slice(queue.as_bytes());
        buf.extend_from_slice(b" ");
    }
    buf.extend_from_slice(sid.to_string().as_bytes());
    buf.extend_from_slice(CRLF);
}

/// Append an `UNSUB` frame, optionally with an auto-unsubscribe count.
pub fn encode_unsub(buf: &mut BytesMut, sid: u64, max_msgs: Option<u64>) {
    buf.extend_from_slice(b"UNSUB ");
    buf.extend_from_slice(sid.to_string().as_bytes());
    if let Some(max) = max_msgs {
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(max.to_string().as_bytes());
    }
    buf.extend_from_slice(CRLF);
}

/// Append a `CONNECT` frame with the serialized handshake body.
pub fn encode_connect(buf: &mut BytesMut, info: &ConnectInfo) -> Result<()> {
    let body = serde_json::to_vec(info)?;
    buf.extend_from_slice(b"CONNECT ");
    buf.extend_from_slice(&body);
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Append a `PING` frame.
pub fn encode_ping(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PING\r\n");
}

/// Append a `PONG` frame.
pub fn encode_pong(buf: &mut BytesMut) {
    buf.extend_from_slice(b"PONG\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pub_without_reply() {
        let mut buf = BytesMut::new();
        encode_pub(&mut buf, "foo.bar", None, b"hello");
        assert_eq!(&buf[..], b"PUB foo.bar 5\r\nhello\r\n");
    }

    #[test]
    fn test_encode_pub_with_reply() {
        let mut buf = BytesMut::new();
        encode_pub(&mut buf, "svc.echo", Some("_INBOX.abc.1"), b"hi");
        assert_eq!(&buf[..], b"PUB svc.echo _INBOX.abc.1 2\r\nhi\r\n");
    }

    #[test]
    fn test_encode_pub_empty_payload() {
        let mut buf = BytesMut::new();
        encode_pub(&mut buf, "tick", None, b"");
        assert_eq!(&buf[..], b"PUB tick 0\r\n\r\n");
    }

    #[test]
    fn test_encode_hpub_lengths() {
        let mut headers = HeaderMap::new();
        headers.insert("A", "1");

        let mut buf = BytesMut::new();
        encode_hpub(&mut buf, "foo", None, &headers, b"body");

        // NATS/1.0\r\nA: 1\r\n\r\n = 10 + 6 + 2 = 18 header bytes
        let expected = b"HPUB foo 18 22\r\nNATS/1.0\r\nA: 1\r\n\r\nbody\r\n";
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_encode_sub_and_queue() {
        let mut buf = BytesMut::new();
        encode_sub(&mut buf, "orders.*", Some("workers"), 7);
        assert_eq!(&buf[..], b"SUB orders.* workers 7\r\n");

        buf.clear();
        encode_sub(&mut buf, "orders.*", None, 8);
        assert_eq!(&buf[..], b"SUB orders.* 8\r\n");
    }

    #[test]
    fn test_encode_unsub() {
        let mut buf = BytesMut::new();
        encode_unsub(&mut buf, 3, None);
        assert_eq!(&buf[..], b"UNSUB 3\r\n");

        buf.clear();
        encode_unsub(&mut buf, 3, Some(10));
        assert_eq!(&buf[..], b"UNSUB 3 10\r\n");
    }

    #[test]
    fn test_encode_connect_skips_absent_credentials() {
        let info = ConnectInfo {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".to_string(),
            version: "0.1.0".to_string(),
            protocol: 1,
            echo: true,
            headers: true,
            no_responders: true,
            auth_token: None,
            user: None,
            pass: None,
            jwt: None,
            nkey: None,
            sig: None,
        };

        let mut buf = BytesMut::new();
        encode_connect(&mut buf, &info).unwrap();

        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("CONNECT {"));
        assert!(text.ends_with("}\r\n"));
        assert!(text.contains("\"no_responders\":true"));
        assert!(!text.contains("auth_token"));
        assert!(!text.contains("user"));
    }

    #[test]
    fn test_connect_applies_credentials() {
        let mut info = ConnectInfo {
            verbose: false,
            pedantic: false,
            tls_required: false,
            name: None,
            lang: "rust".to_string(),
            version: "0.1.0".to_string(),
            protocol: 1,
            echo: true,
            headers: true,
            no_responders: true,
            auth_token: None,
            user: None,
            pass: None,
            jwt: None,
            nkey: None,
            sig: None,
        };
        info.apply_credentials(Credentials {
            user: Some("alice".to_string()),
            pass: Some("s3cret".to_string()),
            ..Credentials::default()
        });

        let mut buf = BytesMut::new();
        encode_connect(&mut buf, &info).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.contains("\"user\":\"alice\""));
        assert!(text.contains("\"pass\":\"s3cret\""));
    }

    #[test]
    fn test_server_info_parse_defaults() {
        let info = ServerInfo::parse(br#"{"server_id":"S1","max_payload":2048}"#).unwrap();
        assert_eq!(info.server_id, "S1");
        assert_eq!(info.max_payload, 2048);
        assert!(!info.headers);
        assert!(info.connect_urls.is_empty());
    }

    #[test]
    fn test_server_info_parse_connect_urls() {
        let info = ServerInfo::parse(
            br#"{"proto":1,"headers":true,"connect_urls":["10.0.0.1:4222","10.0.0.2:4222"]}"#,
        )
        .unwrap();
        assert_eq!(info.connect_urls.len(), 2);
        assert!(info.headers);
    }

    #[test]
    fn test_validate_subject() {
        assert!(validate_subject("foo.bar").is_ok());
        assert!(validate_subject("foo.*").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("foo bar").is_err());
        assert!(validate_subject("foo\r\nPUB x 0").is_err());
    }
}
