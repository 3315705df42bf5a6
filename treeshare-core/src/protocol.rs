//! treeshare wire protocol: message header, the seven message kinds, timestamps.

use std::fmt;

use chrono::{Local, NaiveDateTime, Timelike};

use crate::identity::Identifier;

/// Timestamp layout on the wire: `yyyyMMdd-HHmmss.SSS`, local time.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S%.3f";

/// Header timestamp, millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(NaiveDateTime);

impl Timestamp {
    pub fn now() -> Self {
        Self::from_naive(Local::now().naive_local())
    }

    /// Truncates to whole milliseconds so that the value survives the wire.
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        let millis = dt.nanosecond() / 1_000_000 * 1_000_000;
        Timestamp(dt.with_nanosecond(millis).unwrap_or(dt))
    }

    pub fn parse(s: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
            .ok()
            .map(Self::from_naive)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

/// Fields common to every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub sender: Identifier,
    /// Chosen by the originator; echoed back in replies as the correlation key.
    pub serial: u64,
    pub timestamp: Timestamp,
}

/// Correlation key carried by every reply: who asked, and which of their requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplyTo {
    pub identifier: Identifier,
    pub serial: u64,
}

/// Advertised services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub search: bool,
    pub download: bool,
}

/// Message kinds, with their wire tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Advertisement,
    SearchRequest,
    SearchResult,
    SearchError,
    DownloadRequest,
    DownloadResult,
    DownloadError,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Advertisement => "advertisement",
            Kind::SearchRequest => "search-request",
            Kind::SearchResult => "search-result",
            Kind::SearchError => "search-error",
            Kind::DownloadRequest => "download-request",
            Kind::DownloadResult => "download-result",
            Kind::DownloadError => "download-error",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "advertisement" => Kind::Advertisement,
            "search-request" => Kind::SearchRequest,
            "search-result" => Kind::SearchResult,
            "search-error" => Kind::SearchError,
            "download-request" => Kind::DownloadRequest,
            "download-result" => Kind::DownloadResult,
            "download-error" => Kind::DownloadError,
            _ => return None,
        })
    }

    /// Request kind a reply of this kind answers, if this is a reply.
    pub fn answers(&self) -> Option<Kind> {
        match self {
            Kind::SearchResult | Kind::SearchError => Some(Kind::SearchRequest),
            Kind::DownloadResult | Kind::DownloadError => Some(Kind::DownloadRequest),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific payload. Closed set; every match over it is exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Periodic announcement of presence and services.
    Advertisement {
        server_port: u16,
        capabilities: Capabilities,
    },
    SearchRequest {
        query: String,
    },
    /// One per matched path.
    SearchResult {
        reply_to: ReplyTo,
        path: String,
    },
    /// Search found nothing.
    SearchError {
        reply_to: ReplyTo,
    },
    /// Addressed to one node; everyone else drops it.
    DownloadRequest {
        target: Identifier,
        query: String,
    },
    /// Exactly one match; a transfer listener is waiting on `port`.
    DownloadResult {
        reply_to: ReplyTo,
        query: String,
        port: u16,
    },
    /// `match_count` is 0 (nothing) or more than 1 (ambiguous query).
    DownloadError {
        reply_to: ReplyTo,
        match_count: u32,
    },
}

impl Body {
    pub fn kind(&self) -> Kind {
        match self {
            Body::Advertisement { .. } => Kind::Advertisement,
            Body::SearchRequest { .. } => Kind::SearchRequest,
            Body::SearchResult { .. } => Kind::SearchResult,
            Body::SearchError { .. } => Kind::SearchError,
            Body::DownloadRequest { .. } => Kind::DownloadRequest,
            Body::DownloadResult { .. } => Kind::DownloadResult,
            Body::DownloadError { .. } => Kind::DownloadError,
        }
    }

    pub fn reply_to(&self) -> Option<&ReplyTo> {
        match self {
            Body::SearchResult { reply_to, .. }
            | Body::SearchError { reply_to }
            | Body::DownloadResult { reply_to, .. }
            | Body::DownloadError { reply_to, .. } => Some(reply_to),
            Body::Advertisement { .. }
            | Body::SearchRequest { .. }
            | Body::DownloadRequest { .. } => None,
        }
    }
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn kind(&self) -> Kind {
        self.body.kind()
    }

    pub fn sender(&self) -> &Identifier {
        &self.header.sender
    }

    /// Correlation key a reply to this message must carry.
    #[cfg(test)]
    pub fn reply_key(&self) -> ReplyTo {
        ReplyTo {
            identifier: self.header.sender.clone(),
            serial: self.header.serial,
        }
    }
}
