//! # STOMP 1.2 frame codec
//!
//! The coordination backend speaks STOMP over a text transport. A frame is
//!
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//!
//! where `^@` is a NUL byte. A lone end-of-line between frames is a
//! heart-beat. Header values are escaped (`\r`, `\n`, `:`, `\\`) on every
//! frame except `CONNECT` and `CONNECTED`.

use std::fmt;
use std::time::Duration;

use crate::error::{Result, TrackerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED carry raw header values.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Header lookup; the first occurrence of a repeated header wins.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    // ------------------------------------------------------------------------
    // Client frames
    // ------------------------------------------------------------------------

    /// CONNECT with optional bearer authentication and heart-beat offer.
    pub fn connect(host: &str, bearer_token: Option<&str>, heartbeat: HeartBeat) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", heartbeat.to_string());
        if let Some(token) = bearer_token {
            frame = frame.header("Authorization", format!("Bearer {}", token));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, json_body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(json_body)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Frame::new(Command::Disconnect).header("receipt", receipt)
    }

    // ------------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------------

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');

        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }

        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),
    Heartbeat,
}

/// Decode every frame and heart-beat in a text message.
///
/// The message must hold complete frames only; use [`FrameBuffer`] when a
/// frame may be split across messages.
pub fn decode(input: &str) -> Result<Vec<Inbound>> {
    let (out, consumed) = decode_prefix(input)?;
    if consumed < input.len() {
        return Err(frame_error("truncated frame"));
    }
    Ok(out)
}

/// Upper bound on buffered bytes of an incomplete frame.
pub const MAX_PENDING_BYTES: usize = 1 << 20;

/// Reassembles frames that arrive split across several text messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append a text message and return every unit it completed.
    ///
    /// An incomplete trailing frame is kept for the next call. Malformed
    /// input is still an error.
    pub fn push(&mut self, text: &str) -> Result<Vec<Inbound>> {
        self.pending.push_str(text);
        let (out, consumed) = decode_prefix(&self.pending)?;
        self.pending.drain(..consumed);
        if self.pending.len() > MAX_PENDING_BYTES {
            return Err(frame_error(format!(
                "incomplete frame exceeds {} bytes",
                MAX_PENDING_BYTES
            )));
        }
        Ok(out)
    }
}

fn frame_error(message: impl Into<String>) -> TrackerError {
    TrackerError::Frame {
        message: message.into(),
    }
}

/// Decode complete units from the front of `input`.
///
/// Returns them with the number of bytes consumed; an incomplete frame at
/// the end is left unconsumed.
fn decode_prefix(input: &str) -> Result<(Vec<Inbound>, usize)> {
    let buf = input.as_bytes();
    let mut pos = 0;
    let mut out = Vec::new();

    while pos < buf.len() {
        // EOLs between frames are heart-beats
        if buf[pos] == b'\n' {
            out.push(Inbound::Heartbeat);
            pos += 1;
            continue;
        }
        if buf[pos] == b'\r' {
            match buf.get(pos + 1) {
                Some(b'\n') => {
                    out.push(Inbound::Heartbeat);
                    pos += 2;
                    continue;
                }
                None => break,
                Some(_) => {}
            }
        }

        match decode_frame(input, pos)? {
            Some((frame, next)) => {
                out.push(Inbound::Frame(frame));
                pos = next;
            }
            None => break,
        }
    }

    Ok((out, pos))
}

/// Read one line starting at `pos`; returns the line without its EOL and
/// the offset just past the EOL, or `None` if the EOL has not arrived.
fn read_line(input: &str, pos: usize) -> Option<(&str, usize)> {
    let rest = &input[pos..];
    let end = rest.find('\n')?;
    let line = rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]);
    Some((line, pos + end + 1))
}

/// Decode the frame starting at `start`. `Ok(None)` means it is incomplete.
fn decode_frame(input: &str, start: usize) -> Result<Option<(Frame, usize)>> {
    let Some((command_line, mut pos)) = read_line(input, start) else {
        return Ok(None);
    };
    let command = Command::parse(command_line)
        .ok_or_else(|| frame_error(format!("unknown command '{}'", command_line)))?;
    let mut frame = Frame::new(command);

    loop {
        let Some((line, next)) = read_line(input, pos) else {
            return Ok(None);
        };
        pos = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| frame_error(format!("malformed header '{}'", line)))?;
        if command.escapes_headers() {
            frame.headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            frame.headers.push((name.to_string(), value.to_string()));
        }
    }

    let rest = &input[pos..];
    let body_len = match frame.get("content-length") {
        Some(len) => {
            let len: usize = len
                .trim()
                .parse()
                .map_err(|_| frame_error(format!("bad content-length '{}'", len)))?;
            if rest.len() <= len {
                return Ok(None);
            }
            if rest.as_bytes()[len] != 0 {
                return Err(frame_error("body does not end at content-length"));
            }
            len
        }
        None => match rest.find('\0') {
            Some(end) => end,
            None => return Ok(None),
        },
    };

    frame.body = rest
        .get(..body_len)
        .ok_or_else(|| frame_error("content-length splits a character"))?
        .to_string();
    Ok(Some((frame, pos + body_len + 1)))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(escaped: &str) -> Result<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(frame_error(format!(
                    "undefined escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

// ============================================================================
// Heart-beating
// ============================================================================

/// The `heart-beat` header: `outgoing,incoming` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartBeat {
    /// Smallest interval at which this side can send
    pub outgoing_ms: u64,
    /// Desired interval at which this side wants to receive
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub fn symmetric(interval: Duration) -> Self {
        let ms = interval.as_millis() as u64;
        Self {
            outgoing_ms: ms,
            incoming_ms: ms,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (out, inc) = value.split_once(',')?;
        Some(Self {
            outgoing_ms: out.trim().parse().ok()?,
            incoming_ms: inc.trim().parse().ok()?,
        })
    }

    /// Negotiate with the server's CONNECTED header.
    ///
    /// Returns `(send_every, expect_every)`; `None` disables that direction.
    pub fn negotiate(&self, server: &HeartBeat) -> (Option<Duration>, Option<Duration>) {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                None
            } else {
                Some(Duration::from_millis(ours.max(theirs)))
            }
        };
        (
            pick(self.outgoing_ms, server.incoming_ms),
            pick(self.incoming_ms, server.outgoing_ms),
        )
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}
