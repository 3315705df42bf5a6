//! Datagram codec: `:<sender>:<serial>:<timestamp>:<kind>:<field>:...:` in ASCII.
//!
//! Text fields are percent-escaped (`:` as `%3A`, `%` as `%25`, controls and
//! non-ASCII bytes as `%XX`), so a field can never be split by the separator.
//! Text without those characters is written verbatim.

use std::borrow::Cow;
use std::fmt::Write as _;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::identity::{Identifier, IdentifierError};
use crate::protocol::{Body, Capabilities, Header, Kind, Message, ReplyTo, Timestamp};

const SEPARATOR: char = ':';

/// Bytes escaped inside text fields.
const FIELD: &AsciiSet = &CONTROLS.add(b':').add(b'%');

/// Leading tokens before the kind-specific fields: sender, serial, timestamp, kind.
const HEADER_TOKENS: usize = 4;

/// Encode a message into one datagram. Fails rather than truncating when the result
/// would exceed `max_len` bytes.
pub fn encode_message(msg: &Message, max_len: usize) -> Result<Vec<u8>, MessageEncodeError> {
    let mut out = String::with_capacity(128);
    let h = &msg.header;
    let _ = write!(
        out,
        ":{}:{}:{}:{}:",
        escape(h.sender.as_str()),
        h.serial,
        h.timestamp,
        msg.kind()
    );
    match &msg.body {
        Body::Advertisement {
            server_port,
            capabilities,
        } => {
            let _ = write!(
                out,
                "{}:search={},download={}:",
                server_port, capabilities.search, capabilities.download
            );
        }
        Body::SearchRequest { query } => {
            let _ = write!(out, "{}:", escape(query));
        }
        Body::SearchResult { reply_to, path } => {
            write_reply_to(&mut out, reply_to);
            let _ = write!(out, "{}:", escape(path));
        }
        Body::SearchError { reply_to } => write_reply_to(&mut out, reply_to),
        Body::DownloadRequest { target, query } => {
            let _ = write!(out, "{}:{}:", escape(target.as_str()), escape(query));
        }
        Body::DownloadResult {
            reply_to,
            query,
            port,
        } => {
            write_reply_to(&mut out, reply_to);
            let _ = write!(out, "{}:{}:", escape(query), port);
        }
        Body::DownloadError {
            reply_to,
            match_count,
        } => {
            write_reply_to(&mut out, reply_to);
            let _ = write!(out, "{}:", match_count);
        }
    }
    if out.len() > max_len {
        return Err(MessageEncodeError::TooLarge {
            len: out.len(),
            max: max_len,
        });
    }
    Ok(out.into_bytes())
}

fn write_reply_to(out: &mut String, reply_to: &ReplyTo) {
    let _ = write!(
        out,
        "{}:{}:",
        escape(reply_to.identifier.as_str()),
        reply_to.serial
    );
}

fn escape(s: &str) -> Cow<'_, str> {
    utf8_percent_encode(s, FIELD).into()
}

/// Error encoding a message into a datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageEncodeError {
    #[error("message is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },
}

/// Decode one datagram. Trailing NUL padding and whitespace are ignored.
pub fn decode_message(bytes: &[u8]) -> Result<Message, MessageDecodeError> {
    if !bytes.is_ascii() {
        return Err(MessageDecodeError::NotAscii);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| MessageDecodeError::NotAscii)?;
    let text = text.trim_matches(|c: char| c == '\0' || c.is_ascii_whitespace());
    let rest = text
        .strip_prefix(SEPARATOR)
        .ok_or(MessageDecodeError::MissingLeadingSeparator)?;
    let mut tokens: Vec<&str> = rest.split(SEPARATOR).collect();
    if tokens.last() == Some(&"") {
        tokens.pop();
    }
    if tokens.len() < HEADER_TOKENS {
        return Err(MessageDecodeError::Truncated {
            found: tokens.len(),
        });
    }

    let sender = parse_identifier(tokens[0])?;
    let serial = parse_number::<u64>("serial", tokens[1])?;
    let timestamp = Timestamp::parse(tokens[2])
        .ok_or_else(|| MessageDecodeError::BadTimestamp(tokens[2].to_string()))?;
    let kind = Kind::from_token(tokens[3])
        .ok_or_else(|| MessageDecodeError::UnknownKind(tokens[3].to_string()))?;
    let fields = &tokens[HEADER_TOKENS..];
    let expected = field_count(kind);
    if fields.len() != expected {
        return Err(MessageDecodeError::FieldCount {
            kind,
            expected,
            found: fields.len(),
        });
    }

    let body = match kind {
        Kind::Advertisement => Body::Advertisement {
            server_port: parse_number("server port", fields[0])?,
            capabilities: parse_capabilities(fields[1])?,
        },
        Kind::SearchRequest => Body::SearchRequest {
            query: unescape(fields[0])?,
        },
        Kind::SearchResult => Body::SearchResult {
            reply_to: parse_reply_to(fields)?,
            path: unescape(fields[2])?,
        },
        Kind::SearchError => Body::SearchError {
            reply_to: parse_reply_to(fields)?,
        },
        Kind::DownloadRequest => Body::DownloadRequest {
            target: parse_identifier(fields[0])?,
            query: unescape(fields[1])?,
        },
        Kind::DownloadResult => Body::DownloadResult {
            reply_to: parse_reply_to(fields)?,
            query: unescape(fields[2])?,
            port: parse_number("transfer port", fields[3])?,
        },
        Kind::DownloadError => Body::DownloadError {
            reply_to: parse_reply_to(fields)?,
            match_count: parse_number("match count", fields[2])?,
        },
    };

    Ok(Message {
        header: Header {
            sender,
            serial,
            timestamp,
        },
        body,
    })
}

fn field_count(kind: Kind) -> usize {
    match kind {
        Kind::SearchRequest => 1,
        Kind::Advertisement | Kind::SearchError | Kind::DownloadRequest => 2,
        Kind::SearchResult | Kind::DownloadError => 3,
        Kind::DownloadResult => 4,
    }
}

fn parse_reply_to(fields: &[&str]) -> Result<ReplyTo, MessageDecodeError> {
    Ok(ReplyTo {
        identifier: parse_identifier(fields[0])?,
        serial: parse_number("reply serial", fields[1])?,
    })
}

fn parse_identifier(token: &str) -> Result<Identifier, MessageDecodeError> {
    Ok(Identifier::parse(&unescape(token)?)?)
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    token: &str,
) -> Result<T, MessageDecodeError> {
    token.parse().map_err(|_| MessageDecodeError::BadNumber {
        field,
        value: token.to_string(),
    })
}

/// `search=<bool>,download=<bool>`; unknown services are ignored.
fn parse_capabilities(token: &str) -> Result<Capabilities, MessageDecodeError> {
    let mut caps = Capabilities::default();
    for pair in token.split(',').filter(|p| !p.is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| MessageDecodeError::BadCapabilities(token.to_string()))?;
        let value = match value {
            "true" => true,
            "false" => false,
            _ => return Err(MessageDecodeError::BadCapabilities(token.to_string())),
        };
        match name {
            "search" => caps.search = value,
            "download" => caps.download = value,
            _ => {}
        }
    }
    Ok(caps)
}

fn unescape(token: &str) -> Result<String, MessageDecodeError> {
    let bytes = token.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'%'
            && !(i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit())
        {
            return Err(MessageDecodeError::BadEscape(token.to_string()));
        }
    }
    percent_decode_str(token)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| MessageDecodeError::BadEscape(token.to_string()))
}

/// Why a datagram could not be decoded. The receive loop drops and logs these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageDecodeError {
    #[error("datagram is not ASCII text")]
    NotAscii,
    #[error("datagram does not start with ':'")]
    MissingLeadingSeparator,
    #[error("header truncated: {found} of 4 tokens")]
    Truncated { found: usize },
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("{kind} expects {expected} fields, found {found}")]
    FieldCount {
        kind: Kind,
        expected: usize,
        found: usize,
    },
    #[error("{field} is not a number: {value:?}")]
    BadNumber { field: &'static str, value: String },
    #[error("bad timestamp {0:?}")]
    BadTimestamp(String),
    #[error("bad capability list {0:?}")]
    BadCapabilities(String),
    #[error("bad percent escape in {0:?}")]
    BadEscape(String),
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}
