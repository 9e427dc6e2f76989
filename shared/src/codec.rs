//! Text wire protocol for both transports.
//!
//! Game messages use `TAG:field;field`, chat messages use `TAG|field|field`.
//! The tag ends at the first `:` or `|`, whichever comes first, so chat bodies
//! may freely contain colons and trailing fields may contain pipes.
//!
//! Floats are always written with two decimals (`{:.2}`), which rounds to the
//! nearest representable two-decimal string based on the exact binary value
//! (exact ties round half to even). Parsing goes through `str::parse`, so
//! neither direction depends on a locale.

use std::fmt;
use thiserror::Error;

/// A single decoded line of either protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `HELLO`, the authoritative handshake.
    Hello,
    /// `ASSIGN:<id>`
    Assign(u32),
    /// `INPUT:<axis>`
    Input(f32),
    /// `POS:<x>;<y>`, client-authoritative mode only.
    Position { x: f32, y: f32 },
    /// `PLAYER:<id>:<x>;<y>`
    PlayerState { id: u32, x: f32, y: f32 },
    /// `BALL:<x>;<y>`
    BallState { x: f32, y: f32 },
    /// `SCORE:<left>;<right>`
    Score { left: u32, right: u32 },
    /// `CONNECT|<name>`
    Connect(String),
    /// `CHAT|<sender>|<body>`
    Chat { sender: String, body: String },
    /// `DISCONNECT|<name>`
    Disconnect(String),
    /// `SYSTEM|<text>`
    System(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),
    #[error("{tag} message has the wrong number of fields")]
    FieldCount { tag: &'static str },
    #[error("invalid number {value:?} in {tag} message")]
    InvalidNumber { tag: &'static str, value: String },
}

impl DecodeError {
    /// Unknown tags are tolerated by every receiver; everything else is malformed.
    pub fn is_unknown_tag(&self) -> bool {
        matches!(self, DecodeError::UnknownTag(_))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Hello => f.write_str("HELLO"),
            Message::Assign(id) => write!(f, "ASSIGN:{id}"),
            Message::Input(value) => write!(f, "INPUT:{value:.2}"),
            Message::Position { x, y } => write!(f, "POS:{x:.2};{y:.2}"),
            Message::PlayerState { id, x, y } => write!(f, "PLAYER:{id}:{x:.2};{y:.2}"),
            Message::BallState { x, y } => write!(f, "BALL:{x:.2};{y:.2}"),
            Message::Score { left, right } => write!(f, "SCORE:{left};{right}"),
            Message::Connect(name) => write!(f, "CONNECT|{name}"),
            Message::Chat { sender, body } => write!(f, "CHAT|{sender}|{body}"),
            Message::Disconnect(name) => write!(f, "DISCONNECT|{name}"),
            Message::System(text) => write!(f, "SYSTEM|{text}"),
        }
    }
}

/// Encodes a message without any line terminator (datagram form).
pub fn encode(message: &Message) -> Vec<u8> {
    message.to_string().into_bytes()
}

/// Encodes a message as a newline-terminated line (stream form).
pub fn encode_line(message: &Message) -> String {
    let mut line = message.to_string();
    line.push('\n');
    line
}

/// Decodes one datagram or one line read from a stream.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    decode_line(text)
}

pub fn decode_line(line: &str) -> Result<Message, DecodeError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    if line.is_empty() {
        return Err(DecodeError::Empty);
    }
    if line == "HELLO" {
        return Ok(Message::Hello);
    }

    let Some(split) = line.find([':', '|']) else {
        return Err(DecodeError::UnknownTag(line.to_string()));
    };
    let (tag, delimiter, rest) = (&line[..split], &line[split..split + 1], &line[split + 1..]);

    match (tag, delimiter) {
        ("ASSIGN", ":") => Ok(Message::Assign(parse_u32("ASSIGN", rest)?)),
        ("INPUT", ":") => Ok(Message::Input(parse_f32("INPUT", rest)?)),
        ("POS", ":") => {
            let (x, y) = parse_pair("POS", rest)?;
            Ok(Message::Position { x, y })
        }
        ("PLAYER", ":") => {
            let (id, coords) = rest
                .split_once(':')
                .ok_or(DecodeError::FieldCount { tag: "PLAYER" })?;
            let id = parse_u32("PLAYER", id)?;
            let (x, y) = parse_pair("PLAYER", coords)?;
            Ok(Message::PlayerState { id, x, y })
        }
        ("BALL", ":") => {
            let (x, y) = parse_pair("BALL", rest)?;
            Ok(Message::BallState { x, y })
        }
        ("SCORE", ":") => {
            let (left, right) = rest
                .split_once(';')
                .ok_or(DecodeError::FieldCount { tag: "SCORE" })?;
            Ok(Message::Score {
                left: parse_u32("SCORE", left)?,
                right: parse_u32("SCORE", right)?,
            })
        }
        ("CONNECT", "|") => Ok(Message::Connect(first_field("CONNECT", rest)?)),
        ("DISCONNECT", "|") => Ok(Message::Disconnect(first_field("DISCONNECT", rest)?)),
        ("CHAT", "|") => {
            let (sender, body) = rest
                .split_once('|')
                .ok_or(DecodeError::FieldCount { tag: "CHAT" })?;
            Ok(Message::Chat {
                sender: sender.to_string(),
                body: body.to_string(),
            })
        }
        ("SYSTEM", "|") => Ok(Message::System(rest.to_string())),
        _ => Err(DecodeError::UnknownTag(tag.to_string())),
    }
}

fn first_field(tag: &'static str, rest: &str) -> Result<String, DecodeError> {
    let field = rest.split('|').next().unwrap_or_default();
    if field.is_empty() {
        return Err(DecodeError::FieldCount { tag });
    }
    Ok(field.to_string())
}

fn parse_pair(tag: &'static str, text: &str) -> Result<(f32, f32), DecodeError> {
    let mut parts = text.split(';');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(x), Some(y), None) => Ok((parse_f32(tag, x)?, parse_f32(tag, y)?)),
        _ => Err(DecodeError::FieldCount { tag }),
    }
}

fn parse_f32(tag: &'static str, text: &str) -> Result<f32, DecodeError> {
    match text.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(DecodeError::InvalidNumber {
            tag,
            value: text.to_string(),
        }),
    }
}

fn parse_u32(tag: &'static str, text: &str) -> Result<u32, DecodeError> {
    text.parse::<u32>().map_err(|_| DecodeError::InvalidNumber {
        tag,
        value: text.to_string(),
    })
}
