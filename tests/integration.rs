//! End-to-end tests against an in-process mock server.
//!
//! The mock speaks just enough of the server side of the protocol to
//! exercise the client: it sends `INFO`, completes the `CONNECT`/`PING`
//! handshake, and then scripts whatever frames each test needs.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use natswire::{Client, Error, Event, Options};

const DEFAULT_INFO: &str =
    r#"{"server_id":"TEST","proto":1,"headers":true,"max_payload":1048576}"#;

/// Client operation parsed by the mock server.
#[derive(Debug)]
enum Op {
    Connect(serde_json::Value),
    Ping,
    Pong,
    Sub {
        subject: String,
        queue: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Hpub {
        subject: String,
        reply: Option<String>,
        header: Vec<u8>,
        payload: Vec<u8>,
    },
}

struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    fn url(&self) -> String {
        let addr = self.listener.local_addr().unwrap();
        format!("127.0.0.1:{}", addr.port())
    }

    /// Accept a connection and run the full handshake with `info`.
    async fn accept_with_info(&self, info: &str) -> MockConn {
        let mut conn = self.accept_raw().await;
        conn.send(format!("INFO {info}\r\n").as_bytes()).await;
        conn.handshake().await;
        conn
    }

    /// Accept a connection and run the full handshake.
    async fn accept(&self) -> MockConn {
        self.accept_with_info(DEFAULT_INFO).await
    }

    /// Accept without sending anything yet.
    async fn accept_raw(&self) -> MockConn {
        let (stream, _) = self.listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        MockConn {
            reader: BufReader::new(read_half),
            writer: write_half,
            connect: serde_json::Value::Null,
        }
    }
}

struct MockConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Body of the CONNECT frame seen during the handshake.
    connect: serde_json::Value,
}

impl MockConn {
    async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Read ops until the handshake PING, then answer PONG.
    async fn handshake(&mut self) {
        loop {
            match self.recv_op().await {
                Op::Connect(body) => self.connect = body,
                Op::Ping => {
                    self.send(b"PONG\r\n").await;
                    return;
                }
                other => panic!("unexpected op during handshake: {other:?}"),
            }
        }
    }

    /// Parse the next client operation off the socket.
    async fn recv_op(&mut self) -> Op {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await.unwrap();
        assert!(n > 0, "client closed the connection");
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        let text = String::from_utf8(line).unwrap();
        let (verb, rest) = text.split_once(' ').unwrap_or((text.as_str(), ""));

        match verb {
            "CONNECT" => Op::Connect(serde_json::from_str(rest).unwrap()),
            "PING" => Op::Ping,
            "PONG" => Op::Pong,
            "SUB" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                match tokens.as_slice() {
                    [subject, sid] => Op::Sub {
                        subject: subject.to_string(),
                        queue: None,
                        sid: sid.parse().unwrap(),
                    },
                    [subject, queue, sid] => Op::Sub {
                        subject: subject.to_string(),
                        queue: Some(queue.to_string()),
                        sid: sid.parse().unwrap(),
                    },
                    _ => panic!("bad SUB: {text}"),
                }
            }
            "UNSUB" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                match tokens.as_slice() {
                    [sid] => Op::Unsub {
                        sid: sid.parse().unwrap(),
                        max: None,
                    },
                    [sid, max] => Op::Unsub {
                        sid: sid.parse().unwrap(),
                        max: Some(max.parse().unwrap()),
                    },
                    _ => panic!("bad UNSUB: {text}"),
                }
            }
            "PUB" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                let (subject, reply, len) = match tokens.as_slice() {
                    [subject, len] => (subject.to_string(), None, len.parse().unwrap()),
                    [subject, reply, len] => (
                        subject.to_string(),
                        Some(reply.to_string()),
                        len.parse().unwrap(),
                    ),
                    _ => panic!("bad PUB: {text}"),
                };
                Op::Pub {
                    subject,
                    reply,
                    payload: self.read_payload(len).await,
                }
            }
            "HPUB" => {
                let tokens: Vec<&str> = rest.split_whitespace().collect();
                let (subject, reply, hlen, tlen) = match tokens.as_slice() {
                    [subject, hlen, tlen] => (
                        subject.to_string(),
                        None,
                        hlen.parse::<usize>().unwrap(),
                        tlen.parse::<usize>().unwrap(),
                    ),
                    [subject, reply, hlen, tlen] => (
                        subject.to_string(),
                        Some(reply.to_string()),
                        hlen.parse().unwrap(),
                        tlen.parse().unwrap(),
                    ),
                    _ => panic!("bad HPUB: {text}"),
                };
                let mut all = self.read_payload(tlen).await;
                let payload = all.split_off(hlen);
                Op::Hpub {
                    subject,
                    reply,
                    header: all,
                    payload,
                }
            }
            _ => panic!("unexpected client op: {text}"),
        }
    }

    /// Read `len` payload bytes plus the trailing CRLF.
    async fn read_payload(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len + 2];
        self.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[len..], b"\r\n");
        buf.truncate(len);
        buf
    }
}

fn test_options(server: &MockServer) -> Options {
    Options::new()
        .server(server.url())
        .randomize_servers(false)
        .reconnect_wait(Duration::from_millis(10))
}

/// Connect a client while the mock accepts and handshakes.
async fn connect_pair(server: &MockServer, opts: Options) -> (Client, MockConn) {
    let (conn, client) = tokio::join!(server.accept(), Client::connect(opts));
    (client.unwrap(), conn)
}

async fn wait_for_event(
    status: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&Event) -> bool,
) -> Event {
    loop {
        let event = timeout(Duration::from_secs(5), status.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("status stream ended");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn test_handshake_sends_connect_then_ping() {
    let server = MockServer::bind().await;
    let opts = test_options(&server).name("itest");
    let (_client, conn) = connect_pair(&server, opts).await;

    let body = &conn.connect;
    assert_eq!(body["name"], "itest");
    assert_eq!(body["protocol"], 1);
    assert_eq!(body["headers"], true);
    assert_eq!(body["no_responders"], true);
    assert_eq!(body["lang"], "rust");
    assert!(body.get("user").is_none());
}

#[tokio::test]
async fn test_auth_error_during_handshake_fails_connect() {
    let server = MockServer::bind().await;
    let url = server.url();

    let accept = async {
        let mut conn = server.accept_raw().await;
        conn.send(format!("INFO {DEFAULT_INFO}\r\n").as_bytes()).await;
        // Read CONNECT and PING, then reject.
        let _ = conn.recv_op().await;
        let _ = conn.recv_op().await;
        conn.send(b"-ERR 'Authorization Violation'\r\n").await;
        conn
    };
    let connect = Client::connect(
        Options::new()
            .server(url)
            .no_reconnect()
            .randomize_servers(false),
    );
    let (_conn, result) = tokio::join!(accept, connect);

    match result {
        Err(Error::Authentication(msg)) => assert!(msg.contains("Authorization")),
        other => panic!("expected authentication error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_subscribe_roundtrip() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let mut sub = client.subscribe("greet.*").await.unwrap();
    let sid = match conn.recv_op().await {
        Op::Sub { subject, sid, .. } => {
            assert_eq!(subject, "greet.*");
            sid
        }
        other => panic!("expected SUB, got {other:?}"),
    };

    client.publish("greet.joe", "hello").await.unwrap();
    match conn.recv_op().await {
        Op::Pub {
            subject, payload, ..
        } => {
            assert_eq!(subject, "greet.joe");
            assert_eq!(payload, b"hello");
        }
        other => panic!("expected PUB, got {other:?}"),
    }

    conn.send(format!("MSG greet.joe {sid} 5\r\nhello\r\n").as_bytes())
        .await;
    let message = timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(message.subject, "greet.joe");
    assert_eq!(&message.payload[..], b"hello");
    assert!(message.headers.is_none());

    let stats = client.stats();
    assert_eq!(stats.in_msgs, 1);
    assert_eq!(stats.out_msgs, 1);
}

#[tokio::test]
async fn test_headers_delivered_and_published() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let mut sub = client.subscribe("evt").await.unwrap();
    let sid = match conn.recv_op().await {
        Op::Sub { sid, .. } => sid,
        other => panic!("expected SUB, got {other:?}"),
    };

    // Inbound HMSG with a header block.
    let block = "NATS/1.0\r\nX-Trace: abc\r\n\r\n";
    let frame = format!(
        "HMSG evt {sid} {} {}\r\n{block}body\r\n",
        block.len(),
        block.len() + 4
    );
    conn.send(frame.as_bytes()).await;

    let message = timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let headers = message.headers.expect("headers expected");
    assert_eq!(headers.get("X-Trace"), Some("abc"));
    assert_eq!(&message.payload[..], b"body");

    // Outbound HPUB.
    let mut headers = natswire::HeaderMap::new();
    headers.insert("X-Req", "1");
    client
        .publish_with_headers("evt.out", headers, "ping")
        .await
        .unwrap();
    match conn.recv_op().await {
        Op::Hpub {
            subject,
            header,
            payload,
            ..
        } => {
            assert_eq!(subject, "evt.out");
            let text = String::from_utf8(header).unwrap();
            assert!(text.starts_with("NATS/1.0\r\n"));
            assert!(text.contains("X-Req: 1"));
            assert_eq!(payload, b"ping");
        }
        other => panic!("expected HPUB, got {other:?}"),
    }
}

#[tokio::test]
async fn test_concurrent_requests_correlate_replies() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let c1 = client.clone();
    let c2 = client.clone();
    let c3 = client.clone();
    let r1 = tokio::spawn(async move { c1.request("svc.a", "q1").await });
    let r2 = tokio::spawn(async move { c2.request("svc.b", "q2").await });
    let r3 = tokio::spawn(async move { c3.request("svc.c", "q3").await });

    // First request creates the wildcard inbox subscription.
    let mux_sid = match conn.recv_op().await {
        Op::Sub { subject, sid, .. } => {
            assert!(subject.ends_with(".*"));
            sid
        }
        other => panic!("expected mux SUB, got {other:?}"),
    };

    // Gather the three publishes; order across tasks is arbitrary.
    let mut requests = Vec::new();
    for _ in 0..3 {
        match conn.recv_op().await {
            Op::Pub {
                subject,
                reply,
                payload,
            } => requests.push((subject, reply.unwrap(), payload)),
            other => panic!("expected PUB, got {other:?}"),
        }
    }

    // Reply in reverse arrival order.
    for (_subject, reply, payload) in requests.iter().rev() {
        let body = format!("re:{}", String::from_utf8_lossy(payload));
        let frame = format!("MSG {reply} {mux_sid} {}\r\n{body}\r\n", body.len());
        conn.send(frame.as_bytes()).await;
    }

    let m1 = r1.await.unwrap().unwrap();
    let m2 = r2.await.unwrap().unwrap();
    let m3 = r3.await.unwrap().unwrap();
    assert_eq!(&m1.payload[..], b"re:q1");
    assert_eq!(&m2.payload[..], b"re:q2");
    assert_eq!(&m3.payload[..], b"re:q3");
}

#[tokio::test]
async fn test_request_no_responders() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let handle = tokio::spawn({
        let client = client.clone();
        async move { client.request("nobody.home", "hi").await }
    });

    let mux_sid = match conn.recv_op().await {
        Op::Sub { sid, .. } => sid,
        other => panic!("expected SUB, got {other:?}"),
    };
    let reply = match conn.recv_op().await {
        Op::Pub { reply, .. } => reply.unwrap(),
        other => panic!("expected PUB, got {other:?}"),
    };

    // 503 status, no payload: the typed no-responders outcome.
    let block = "NATS/1.0 503\r\n\r\n";
    let frame = format!(
        "HMSG {reply} {mux_sid} {} {}\r\n{block}\r\n",
        block.len(),
        block.len()
    );
    conn.send(frame.as_bytes()).await;

    match handle.await.unwrap() {
        Err(Error::NoResponders) => {}
        other => panic!("expected NoResponders, got {other:?}"),
    }
}

#[tokio::test]
async fn test_request_timeout_rejects_only_that_request() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let fast = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .request_with(
                    "svc.slow",
                    "x",
                    natswire::RequestOptions::new().timeout(Duration::from_millis(50)),
                )
                .await
        }
    });
    let slow = tokio::spawn({
        let client = client.clone();
        async move { client.request("svc.ok", "y").await }
    });

    let mux_sid = match conn.recv_op().await {
        Op::Sub { sid, .. } => sid,
        other => panic!("expected SUB, got {other:?}"),
    };
    let mut replies = std::collections::HashMap::new();
    for _ in 0..2 {
        match conn.recv_op().await {
            Op::Pub { subject, reply, .. } => {
                replies.insert(subject, reply.unwrap());
            }
            other => panic!("expected PUB, got {other:?}"),
        }
    }

    // Never answer svc.slow; answer svc.ok after the other timed out.
    match fast.await.unwrap() {
        Err(Error::Timeout) => {}
        other => panic!("expected Timeout, got {other:?}"),
    }
    let reply = &replies["svc.ok"];
    conn.send(format!("MSG {reply} {mux_sid} 2\r\nok\r\n").as_bytes())
        .await;
    let message = slow.await.unwrap().unwrap();
    assert_eq!(&message.payload[..], b"ok");
}

#[tokio::test]
async fn test_flush_resolves_on_pong() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let flush = tokio::spawn({
        let client = client.clone();
        async move { client.flush().await }
    });

    match conn.recv_op().await {
        Op::Ping => conn.send(b"PONG\r\n").await,
        other => panic!("expected PING, got {other:?}"),
    }
    flush.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_reconnect_resubscribes_before_buffered_publish() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;
    let mut status = client.status();

    let _sub = client.subscribe("orders.*").await.unwrap();
    let sid = match conn.recv_op().await {
        Op::Sub { subject, sid, .. } => {
            assert_eq!(subject, "orders.*");
            sid
        }
        other => panic!("expected SUB, got {other:?}"),
    };

    // Server drops the connection.
    drop(conn);
    wait_for_event(&mut status, |e| *e == Event::Disconnected).await;

    // Published while disconnected: buffered locally.
    let publish = tokio::spawn({
        let client = client.clone();
        async move { client.publish("orders.new", "item-1").await }
    });

    // Let the client back in; resubscription must precede the backlog.
    let mut conn = server.accept().await;
    wait_for_event(&mut status, |e| *e == Event::Reconnected).await;
    publish.await.unwrap().unwrap();

    match conn.recv_op().await {
        Op::Sub { subject, sid: resid, .. } => {
            assert_eq!(subject, "orders.*");
            assert_eq!(resid, sid, "sid survives the reconnect");
        }
        other => panic!("expected SUB before the buffered PUB, got {other:?}"),
    }
    match conn.recv_op().await {
        Op::Pub {
            subject, payload, ..
        } => {
            assert_eq!(subject, "orders.new");
            assert_eq!(payload, b"item-1");
        }
        other => panic!("expected buffered PUB, got {other:?}"),
    }
    assert_eq!(client.stats().reconnects, 1);
}

#[tokio::test]
async fn test_heartbeat_staleness_forces_reconnect() {
    let server = MockServer::bind().await;
    let opts = test_options(&server)
        .ping_interval(Duration::from_millis(50))
        .max_pings_out(2);
    let (client, conn) = connect_pair(&server, opts).await;
    let mut status = client.status();

    // Keep the socket open but never answer probes: silence, not a
    // socket error, is what staleness detection is for.
    let _silent = conn;

    wait_for_event(&mut status, |e| *e == Event::Disconnected).await;
    let _conn2 = server.accept().await;
    wait_for_event(&mut status, |e| *e == Event::Reconnected).await;
}

#[tokio::test]
async fn test_permission_error_routed_to_subscription() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let mut allowed = client.subscribe("public").await.unwrap();
    let mut denied = client.subscribe("secret").await.unwrap();
    let _ = conn.recv_op().await;
    let _ = conn.recv_op().await;

    conn.send(b"-ERR 'Permissions Violation for Subscription to \"secret\"'\r\n")
        .await;

    match timeout(Duration::from_secs(2), denied.next()).await.unwrap() {
        Some(Err(Error::Permissions { subject, .. })) => assert_eq!(subject, "secret"),
        other => panic!("expected permissions error, got {other:?}"),
    }
    // The denied subscription is closed; the other one is untouched.
    assert!(denied.next().await.is_none());
    conn.send(format!("MSG public {} 2\r\nok\r\n", allowed.sid()).as_bytes())
        .await;
    let message = timeout(Duration::from_secs(2), allowed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(&message.payload[..], b"ok");
}

#[tokio::test]
async fn test_gossip_update_emits_server_event() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;
    let mut status = client.status();

    conn.send(
        br#"INFO {"proto":1,"headers":true,"connect_urls":["10.0.0.9:4222"]}"#
            .as_slice(),
    )
    .await;
    conn.send(b"\r\n").await;

    let event = wait_for_event(&mut status, |e| matches!(e, Event::ServerUpdate(_))).await;
    match event {
        Event::ServerUpdate(update) => {
            assert_eq!(update.added, vec!["10.0.0.9:4222".to_string()]);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_failing_server_evicted_and_healthy_server_reused() {
    // Two servers: A healthy, B always refuses (bound then dropped).
    let server_a = MockServer::bind().await;
    let refused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let refused_url = format!("127.0.0.1:{}", refused.local_addr().unwrap().port());
    drop(refused);

    let opts = Options::new()
        .servers([server_a.url(), refused_url])
        .randomize_servers(false)
        .reconnect_wait(Duration::from_millis(10))
        .max_reconnect_attempts(Some(1));
    let (client, mut conn) = connect_pair(&server_a, opts).await;
    let mut status = client.status();

    // Drop A twice; each time the pool rotates through B, fails there,
    // and comes back to A. B is evicted once past its attempt ceiling.
    for _ in 0..2 {
        drop(conn);
        wait_for_event(&mut status, |e| *e == Event::Disconnected).await;
        conn = server_a.accept().await;
        wait_for_event(&mut status, |e| *e == Event::Reconnected).await;
    }

    // Client still functional against A.
    client.publish("after", "x").await.unwrap();
    match conn.recv_op().await {
        Op::Pub { subject, .. } => assert_eq!(subject, "after"),
        other => panic!("expected PUB, got {other:?}"),
    }
    assert_eq!(client.stats().reconnects, 2);
}

#[tokio::test]
async fn test_two_identical_auth_errors_abort_reconnect() {
    let server = MockServer::bind().await;
    let opts = test_options(&server);
    let (client, conn) = connect_pair(&server, opts).await;
    let mut status = client.status();

    drop(conn);
    wait_for_event(&mut status, |e| *e == Event::Disconnected).await;

    // Two reconnect attempts rejected with the same auth error.
    for _ in 0..2 {
        let mut conn = server.accept_raw().await;
        conn.send(format!("INFO {DEFAULT_INFO}\r\n").as_bytes()).await;
        let _ = conn.recv_op().await; // CONNECT
        let _ = conn.recv_op().await; // PING
        conn.send(b"-ERR 'Authorization Violation'\r\n").await;
    }

    wait_for_event(&mut status, |e| *e == Event::Closed).await;
    match client.publish("x", "y").await {
        Err(Error::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_drain_unsubscribes_delivers_inflight_then_closes() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;
    let mut status = client.status();

    let mut sub = client.subscribe("jobs").await.unwrap();
    let sid = match conn.recv_op().await {
        Op::Sub { sid, .. } => sid,
        other => panic!("expected SUB, got {other:?}"),
    };

    let drain = tokio::spawn({
        let client = client.clone();
        async move { client.drain().await }
    });

    match conn.recv_op().await {
        Op::Unsub { sid: unsid, .. } => assert_eq!(unsid, sid),
        other => panic!("expected UNSUB, got {other:?}"),
    }
    match conn.recv_op().await {
        Op::Ping => {}
        other => panic!("expected drain PING, got {other:?}"),
    }

    // An in-flight message raced the unsubscribe; it is still delivered
    // because it arrives before the drain barrier's PONG.
    conn.send(format!("MSG jobs {sid} 4\r\nlast\r\n").as_bytes())
        .await;
    conn.send(b"PONG\r\n").await;

    drain.await.unwrap().unwrap();
    wait_for_event(&mut status, |e| *e == Event::Closed).await;

    let message = sub.next().await.unwrap().unwrap();
    assert_eq!(&message.payload[..], b"last");
    assert!(sub.next().await.is_none());

    match client.subscribe("more").await {
        Err(Error::ConnectionClosed) => {}
        other => panic!("expected ConnectionClosed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_local_validation_failures() {
    let server = MockServer::bind().await;
    let info = r#"{"server_id":"TEST","proto":1,"headers":true,"max_payload":16}"#;
    let opts = test_options(&server);
    let (conn, client) = tokio::join!(server.accept_with_info(info), Client::connect(opts));
    let client = client.unwrap();
    let _conn = conn;

    match client.publish("", "x").await {
        Err(Error::InvalidSubject(_)) => {}
        other => panic!("expected InvalidSubject, got {other:?}"),
    }
    match client.publish("bad subject", "x").await {
        Err(Error::InvalidSubject(_)) => {}
        other => panic!("expected InvalidSubject, got {other:?}"),
    }
    match client.publish("big", vec![0u8; 32]).await {
        Err(Error::MaxPayloadExceeded { size: 32, max_payload: 16 }) => {}
        other => panic!("expected MaxPayloadExceeded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscription_auto_unsubscribe_after_max() {
    let server = MockServer::bind().await;
    let (client, mut conn) = connect_pair(&server, test_options(&server)).await;

    let mut sub = client
        .subscribe_with("counted", natswire::SubscribeOptions::new().max_messages(2))
        .await
        .unwrap();
    let sid = match conn.recv_op().await {
        Op::Sub { sid, .. } => sid,
        other => panic!("expected SUB, got {other:?}"),
    };
    match conn.recv_op().await {
        Op::Unsub { sid: unsid, max } => {
            assert_eq!(unsid, sid);
            assert_eq!(max, Some(2));
        }
        other => panic!("expected UNSUB max, got {other:?}"),
    }

    conn.send(format!("MSG counted {sid} 1\r\na\r\nMSG counted {sid} 1\r\nb\r\n").as_bytes())
        .await;

    assert_eq!(&sub.next().await.unwrap().unwrap().payload[..], b"a");
    assert_eq!(&sub.next().await.unwrap().unwrap().payload[..], b"b");
    // Registry entry is gone after the ceiling: the channel closes.
    assert!(sub.next().await.is_none());
}
