//! Incremental wire-protocol parser.
//!
//! Converts an unbounded sequence of byte chunks into typed protocol
//! operations, tolerating frames split at any position: mid-verb,
//! mid-argument-line, mid-payload, even between the CR and LF of a line
//! terminator. Input chunks arrive straight from socket reads, so the
//! parser never assumes alignment.
//!
//! The state machine is byte-driven: one dedicated state per character of
//! each verb literal (case-insensitive), then argument accumulation until
//! CRLF, then exact-length binary payload consumption for `MSG`/`HMSG`.
//! When a chunk ends mid-frame, the consumed partial bytes are snapshotted
//! into owned buffers ([`FrameBuffer`]) so the next `feed` call resumes
//! correctly — subject and reply slices are always copied out of the chunk,
//! never left dangling.
//!
//! Any malformed verb, non-numeric sid/size, or header length exceeding the
//! total length is a fatal [`ParseError`]: resuming after corruption risks
//! misinterpreting binary payload bytes as protocol control data, so the
//! caller must tear the connection down.
//!
//! # Example
//!
//! ```
//! use natswire::protocol::{Parser, ServerOp};
//!
//! let mut parser = Parser::new();
//! let ops = parser.feed(b"PING\r\nMSG foo 1 5\r\nhello\r\n").unwrap();
//! assert_eq!(ops.len(), 2);
//! assert_eq!(ops[0], ServerOp::Ping);
//! ```

use bytes::Bytes;

use crate::error::ParseError;
use crate::protocol::frame_buffer::FrameBuffer;

/// Parser state, one step per protocol byte position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    OpStart,
    OpPlus,
    OpPlusO,
    OpPlusOk,
    OpPlusOkLf,
    OpMinus,
    OpMinusE,
    OpMinusEr,
    OpMinusErr,
    OpMinusErrSpc,
    MinusErrArg,
    OpM,
    OpMs,
    OpMsg,
    OpMsgSpc,
    MsgArg,
    MsgPayload,
    MsgEnd,
    MsgEndLf,
    OpH,
    OpP,
    OpPi,
    OpPin,
    OpPing,
    OpPingLf,
    OpPo,
    OpPon,
    OpPong,
    OpPongLf,
    OpI,
    OpIn,
    OpInf,
    OpInfo,
    OpInfoSpc,
    InfoArg,
}

/// Parsed argument line of a `MSG`/`HMSG` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgArgs {
    /// Subject the message was published to (owned copy).
    pub subject: Bytes,
    /// Subscription id the server is delivering to.
    pub sid: u64,
    /// Reply subject, when the publisher requested one.
    pub reply: Option<Bytes>,
    /// Length of the header block; zero for plain `MSG`.
    pub header_len: usize,
    /// Total payload length (header bytes + body bytes).
    pub total_len: usize,
}

/// A complete protocol operation received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    /// `INFO {json}` — raw JSON body, decoded upstream.
    Info(Bytes),
    /// `MSG`/`HMSG` — delivered message. `header` holds the undecoded
    /// header block for `HMSG`; `payload` is the body only.
    Msg {
        subject: Bytes,
        sid: u64,
        reply: Option<Bytes>,
        header: Option<Bytes>,
        payload: Bytes,
    },
    /// `+OK` acknowledgment (verbose mode).
    Ok,
    /// Server keep-alive probe; must be answered with `PONG`.
    Ping,
    /// Server answer to a client `PING`.
    Pong,
    /// `-ERR '<description>'` with quotes stripped.
    Err(String),
}

/// Incremental protocol parser.
///
/// One parser instance per connection: partial-frame state must never leak
/// across reconnects, so a fresh `Parser::new()` is created on every dial.
#[derive(Debug, Default)]
pub struct Parser {
    state: ParseState,
    /// Current MSG path is an `HMSG` (argument line carries a header length).
    hdr: bool,
    /// Start offset of the in-progress argument line within the current chunk.
    arg_start: usize,
    /// 1 when the CR of a CRLF was consumed and the LF is still expected.
    drop: usize,
    /// Snapshot of a partial argument line spanning chunks.
    arg_buf: Option<FrameBuffer>,
    /// Snapshot of a partial payload spanning chunks.
    msg_buf: Option<FrameBuffer>,
    /// Parsed argument line awaiting its payload.
    args: Option<MsgArgs>,
}

impl Default for ParseState {
    fn default() -> Self {
        Self::OpStart
    }
}

impl Parser {
    /// Create a parser at the start state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, for diagnostics.
    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Consume one input chunk and return every operation it completes.
    ///
    /// May return an empty vector when the chunk ends mid-frame; the
    /// partial state is retained for the next call. A returned error is
    /// fatal: the parser's stream position is corrupt and the connection
    /// must be torn down.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<ServerOp>, ParseError> {
        use ParseState::*;

        let mut ops = Vec::new();
        let mut i = 0;
        self.arg_start = 0;

        while i < chunk.len() {
            if self.state == MsgPayload {
                i = self.consume_payload(chunk, i, &mut ops);
                continue;
            }

            let b = chunk[i];
            match self.state {
                OpStart => match b {
                    b'M' | b'm' => {
                        self.hdr = false;
                        self.state = OpM;
                    }
                    b'H' | b'h' => self.state = OpH,
                    b'P' | b'p' => self.state = OpP,
                    b'+' => self.state = OpPlus,
                    b'-' => self.state = OpMinus,
                    b'I' | b'i' => self.state = OpI,
                    _ => return Err(self.fail(chunk, i, "unknown protocol operation")),
                },

                OpH => match b {
                    b'M' | b'm' => {
                        self.hdr = true;
                        self.state = OpM;
                    }
                    _ => return Err(self.fail(chunk, i, "expected HMSG")),
                },

                OpM => match b {
                    b'S' | b's' => self.state = OpMs,
                    _ => return Err(self.fail(chunk, i, "expected MSG")),
                },
                OpMs => match b {
                    b'G' | b'g' => self.state = OpMsg,
                    _ => return Err(self.fail(chunk, i, "expected MSG")),
                },
                OpMsg => match b {
                    b' ' | b'\t' => self.state = OpMsgSpc,
                    _ => return Err(self.fail(chunk, i, "expected space after MSG")),
                },
                OpMsgSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.arg_start = i;
                        self.state = MsgArg;
                        continue;
                    }
                },
                MsgArg => match b {
                    b'\n' => {
                        let args = match self.arg_buf.take() {
                            Some(buf) => process_msg_args(buf.view(), self.hdr),
                            None => {
                                process_msg_args(&chunk[self.arg_start..i - self.drop], self.hdr)
                            }
                        }
                        .map_err(|msg| self.fail(chunk, i, msg))?;
                        self.drop = 0;
                        self.args = Some(args);
                        self.msg_buf = None;
                        self.state = MsgPayload;
                    }
                    b'\r' => {
                        if self.drop == 1 {
                            return Err(self.fail(chunk, i, "expected LF after CR"));
                        }
                        self.drop = 1;
                    }
                    _ => {
                        if self.drop == 1 {
                            return Err(self.fail(chunk, i, "expected LF after CR"));
                        }
                        if let Some(buf) = self.arg_buf.as_mut() {
                            buf.extend(&[b]);
                        }
                    }
                },
                MsgEnd => match b {
                    b'\r' => self.state = MsgEndLf,
                    _ => return Err(self.fail(chunk, i, "expected CRLF after payload")),
                },
                MsgEndLf => match b {
                    b'\n' => self.state = OpStart,
                    _ => return Err(self.fail(chunk, i, "expected CRLF after payload")),
                },

                OpP => match b {
                    b'I' | b'i' => self.state = OpPi,
                    b'O' | b'o' => self.state = OpPo,
                    _ => return Err(self.fail(chunk, i, "expected PING or PONG")),
                },
                OpPi => match b {
                    b'N' | b'n' => self.state = OpPin,
                    _ => return Err(self.fail(chunk, i, "expected PING")),
                },
                OpPin => match b {
                    b'G' | b'g' => self.state = OpPing,
                    _ => return Err(self.fail(chunk, i, "expected PING")),
                },
                OpPing => match b {
                    b'\r' => self.state = OpPingLf,
                    _ => return Err(self.fail(chunk, i, "expected CRLF after PING")),
                },
                OpPingLf => match b {
                    b'\n' => {
                        ops.push(ServerOp::Ping);
                        self.state = OpStart;
                    }
                    _ => return Err(self.fail(chunk, i, "expected CRLF after PING")),
                },
                OpPo => match b {
                    b'N' | b'n' => self.state = OpPon,
                    _ => return Err(self.fail(chunk, i, "expected PONG")),
                },
                OpPon => match b {
                    b'G' | b'g' => self.state = OpPong,
                    _ => return Err(self.fail(chunk, i, "expected PONG")),
                },
                OpPong => match b {
                    b'\r' => self.state = OpPongLf,
                    _ => return Err(self.fail(chunk, i, "expected CRLF after PONG")),
                },
                OpPongLf => match b {
                    b'\n' => {
                        ops.push(ServerOp::Pong);
                        self.state = OpStart;
                    }
                    _ => return Err(self.fail(chunk, i, "expected CRLF after PONG")),
                },

                OpPlus => match b {
                    b'O' | b'o' => self.state = OpPlusO,
                    _ => return Err(self.fail(chunk, i, "expected +OK")),
                },
                OpPlusO => match b {
                    b'K' | b'k' => self.state = OpPlusOk,
                    _ => return Err(self.fail(chunk, i, "expected +OK")),
                },
                OpPlusOk => match b {
                    b'\r' => self.state = OpPlusOkLf,
                    _ => return Err(self.fail(chunk, i, "expected CRLF after +OK")),
                },
                OpPlusOkLf => match b {
                    b'\n' => {
                        ops.push(ServerOp::Ok);
                        self.state = OpStart;
                    }
                    _ => return Err(self.fail(chunk, i, "expected CRLF after +OK")),
                },

                OpMinus => match b {
                    b'E' | b'e' => self.state = OpMinusE,
                    _ => return Err(self.fail(chunk, i, "expected -ERR")),
                },
                OpMinusE => match b {
                    b'R' | b'r' => self.state = OpMinusEr,
                    _ => return Err(self.fail(chunk, i, "expected -ERR")),
                },
                OpMinusEr => match b {
                    b'R' | b'r' => self.state = OpMinusErr,
                    _ => return Err(self.fail(chunk, i, "expected -ERR")),
                },
                OpMinusErr => match b {
                    b' ' | b'\t' => self.state = OpMinusErrSpc,
                    _ => return Err(self.fail(chunk, i, "expected space after -ERR")),
                },
                OpMinusErrSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.arg_start = i;
                        self.state = MinusErrArg;
                        continue;
                    }
                },
                MinusErrArg => match b {
                    b'\n' => {
                        let description = match self.arg_buf.take() {
                            Some(buf) => err_description(buf.view()),
                            None => err_description(&chunk[self.arg_start..i - self.drop]),
                        };
                        ops.push(ServerOp::Err(description));
                        self.drop = 0;
                        self.state = OpStart;
                    }
                    b'\r' => {
                        if self.drop == 1 {
                            return Err(self.fail(chunk, i, "expected LF after CR"));
                        }
                        self.drop = 1;
                    }
                    _ => {
                        if self.drop == 1 {
                            return Err(self.fail(chunk, i, "expected LF after CR"));
                        }
                        if let Some(buf) = self.arg_buf.as_mut() {
                            buf.extend(&[b]);
                        }
                    }
                },

                OpI => match b {
                    b'N' | b'n' => self.state = OpIn,
                    _ => return Err(self.fail(chunk, i, "expected INFO")),
                },
                OpIn => match b {
                    b'F' | b'f' => self.state = OpInf,
                    _ => return Err(self.fail(chunk, i, "expected INFO")),
                },
                OpInf => match b {
                    b'O' | b'o' => self.state = OpInfo,
                    _ => return Err(self.fail(chunk, i, "expected INFO")),
                },
                OpInfo => match b {
                    b' ' | b'\t' => self.state = OpInfoSpc,
                    _ => return Err(self.fail(chunk, i, "expected space after INFO")),
                },
                OpInfoSpc => match b {
                    b' ' | b'\t' => {}
                    _ => {
                        self.arg_start = i;
                        self.state = InfoArg;
                        continue;
                    }
                },
                InfoArg => match b {
                    b'\n' => {
                        let json = match self.arg_buf.take() {
                            Some(mut buf) => buf.take_all(),
                            None => Bytes::copy_from_slice(&chunk[self.arg_start..i - self.drop]),
                        };
                        ops.push(ServerOp::Info(json));
                        self.drop = 0;
                        self.state = OpStart;
                    }
                    b'\r' => {
                        if self.drop == 1 {
                            return Err(self.fail(chunk, i, "expected LF after CR"));
                        }
                        self.drop = 1;
                    }
                    _ => {
                        if self.drop == 1 {
                            return Err(self.fail(chunk, i, "expected LF after CR"));
                        }
                        if let Some(buf) = self.arg_buf.as_mut() {
                            buf.extend(&[b]);
                        }
                    }
                },

                MsgPayload => unreachable!("payload consumption is handled before the byte match"),
            }
            i += 1;
        }

        // Chunk ended mid-argument-line: snapshot the consumed bytes so the
        // next feed call continues from an owned buffer instead of a slice
        // into a chunk that is about to be discarded.
        if matches!(self.state, MsgArg | MinusErrArg | InfoArg) && self.arg_buf.is_none() {
            self.arg_buf = Some(FrameBuffer::from_slice(
                &chunk[self.arg_start..chunk.len() - self.drop],
            ));
        }

        Ok(ops)
    }

    /// Consume payload bytes for the pending message, emitting it once
    /// `total_len` bytes have been gathered. Returns the new chunk offset.
    fn consume_payload(&mut self, chunk: &[u8], i: usize, ops: &mut Vec<ServerOp>) -> usize {
        let total = self
            .args
            .as_ref()
            .expect("MsgPayload state requires parsed args")
            .total_len;
        let buffered = self.msg_buf.as_ref().map_or(0, FrameBuffer::len);
        let needed = total - buffered;
        let available = chunk.len() - i;

        if available < needed {
            match self.msg_buf.as_mut() {
                Some(buf) => buf.extend(&chunk[i..]),
                None => self.msg_buf = Some(FrameBuffer::from_slice(&chunk[i..])),
            }
            return chunk.len();
        }

        let payload = match self.msg_buf.take() {
            Some(mut buf) => {
                buf.extend(&chunk[i..i + needed]);
                buf.take_all()
            }
            None => Bytes::copy_from_slice(&chunk[i..i + needed]),
        };
        let args = self.args.take().expect("MsgPayload state requires parsed args");
        ops.push(build_msg(args, payload));
        self.state = ParseState::MsgEnd;
        i + needed
    }

    fn fail(&self, chunk: &[u8], pos: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(self.state, message, chunk, pos)
    }
}

/// Assemble the final operation, splitting the header block from the body.
fn build_msg(args: MsgArgs, payload: Bytes) -> ServerOp {
    let (header, body) = if args.header_len > 0 {
        (
            Some(payload.slice(..args.header_len)),
            payload.slice(args.header_len..),
        )
    } else {
        (None, payload)
    };
    ServerOp::Msg {
        subject: args.subject,
        sid: args.sid,
        reply: args.reply,
        header,
        payload: body,
    }
}

/// Tokenize and validate a `MSG`/`HMSG` argument line.
///
/// `MSG`: `subject sid [reply] total` (3 or 4 tokens).
/// `HMSG`: `subject sid [reply] hdr total` (4 or 5 tokens).
fn process_msg_args(arg: &[u8], hdr: bool) -> Result<MsgArgs, String> {
    let tokens: Vec<&[u8]> = arg
        .split(|b| *b == b' ' || *b == b'\t')
        .filter(|t| !t.is_empty())
        .collect();

    let (subject, sid, reply, header_len, total_len) = match (hdr, tokens.len()) {
        (false, 3) => (tokens[0], tokens[1], None, None, tokens[2]),
        (false, 4) => (tokens[0], tokens[1], Some(tokens[2]), None, tokens[3]),
        (true, 4) => (tokens[0], tokens[1], None, Some(tokens[2]), tokens[3]),
        (true, 5) => (
            tokens[0],
            tokens[1],
            Some(tokens[2]),
            Some(tokens[3]),
            tokens[4],
        ),
        (_, n) => return Err(format!("wrong number of message arguments: {n}")),
    };

    let sid = parse_num(sid).ok_or("Bad or Missing Sid")?;
    let total_len = parse_num(total_len).ok_or("Bad or Missing Size")? as usize;
    let header_len = match header_len {
        Some(t) => parse_num(t).ok_or("Bad or Missing Header Size")? as usize,
        None => 0,
    };
    if header_len > total_len {
        return Err("Header Size larger than Total Size".to_string());
    }

    Ok(MsgArgs {
        subject: Bytes::copy_from_slice(subject),
        sid,
        reply: reply.map(Bytes::copy_from_slice),
        header_len,
        total_len,
    })
}

/// Parse a non-negative decimal; a sign or any non-digit byte fails.
fn parse_num(token: &[u8]) -> Option<u64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

/// Decode an `-ERR` description, stripping the conventional single quotes.
fn err_description(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    trimmed
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(trimmed)
        .to_string()
}
