//! Host-driven API: the host feeds datagrams in and gets routes, replies and reports back.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::identity::{Identifier, SerialGenerator};
use crate::protocol::{Body, Capabilities, Header, Kind, Message, ReplyTo, Timestamp};
use crate::registry::{PeerEntry, PeerRegistry, Upsert};
use crate::search::Match;
use crate::wire::{self, MessageDecodeError};

/// A request this node issued and is still collecting replies for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub serial: u64,
    pub kind: Kind,
    pub query: String,
    pub issued_at: Instant,
}

/// A request from a peer that this node has agreed to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub reply_to: ReplyTo,
    pub query: String,
}

/// Outcome of a reply to one of our requests, ready to show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    SearchHit {
        from: Identifier,
        query: String,
        path: String,
    },
    SearchMiss {
        from: Identifier,
        query: String,
    },
    /// The peer is listening for us on `port`.
    DownloadReady {
        from: Identifier,
        query: String,
        port: u16,
    },
    DownloadNoMatch {
        from: Identifier,
        query: String,
    },
    /// Query matched several files; the user must narrow it down.
    DownloadAmbiguous {
        from: Identifier,
        query: String,
        matches: u32,
    },
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::SearchHit { from, path, .. } => write!(f, "search result: {} @ {}", path, from),
            Report::SearchMiss { from, query } => {
                write!(f, "search error: no results for {:?} @ {}", query, from)
            }
            Report::DownloadReady { from, query, .. } => {
                write!(f, "download result: found {:?} @ {}", query, from)
            }
            Report::DownloadNoMatch { from, query } => {
                write!(f, "download error: no match for {:?} @ {}", query, from)
            }
            Report::DownloadAmbiguous {
                from,
                query,
                matches,
            } => write!(
                f,
                "download error: {:?} is ambiguous, {} matching files @ {}",
                query, matches, from
            ),
        }
    }
}

/// Why an inbound message was not handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Non-advertisement message we sent ourselves, looped back by the group.
    OwnMessage,
    SearchDisabled,
    DownloadDisabled,
    /// Download request aimed at another node.
    NotTarget,
    /// Reply to a different requester overheard on the group.
    ForeignReply,
    /// Addressed to us, but no outstanding request of that kind has that serial.
    UnsolicitedReply,
}

/// Where an inbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Advertisement applied to the registry.
    Peer(Identifier, Upsert),
    SearchRequest(IncomingRequest),
    DownloadRequest(IncomingRequest),
    SearchResponse(Report),
    DownloadResponse(Report),
    Dropped(DropReason),
}

/// Server-side decision for a download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadPlan {
    /// Zero or several matches: send this `download-error`, open nothing.
    Refuse(Message),
    /// Exactly one match: open a transfer listener for `file`, then call
    /// [`ShareCore::download_result`] with its port.
    Serve { file: PathBuf, request: IncomingRequest },
}

/// Refusals when issuing a download request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("{0} has not advertised on the group")]
    UnknownPeer(Identifier),
    #[error("{0} does not offer downloads")]
    DownloadUnsupported(Identifier),
}

/// Protocol engine for one node. Shared between tasks behind an `Arc`; all state is
/// internally synchronized.
#[derive(Debug)]
pub struct ShareCore {
    identifier: Identifier,
    capabilities: Capabilities,
    registry: PeerRegistry,
    serials: SerialGenerator,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl ShareCore {
    pub fn new(identifier: Identifier, capabilities: Capabilities) -> Self {
        Self {
            registry: PeerRegistry::new(identifier.clone()),
            identifier,
            capabilities,
            serials: SerialGenerator::new(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Decode and route one datagram.
    pub fn on_datagram(&self, bytes: &[u8], now: Instant) -> Result<Route, MessageDecodeError> {
        let msg = wire::decode_message(bytes)?;
        Ok(self.on_message(msg, now))
    }

    /// Classify a decoded message. Only advertisements touch state here (registry upsert)
    /// and download replies retire their pending request so a duplicate cannot start a
    /// second transfer.
    pub fn on_message(&self, msg: Message, now: Instant) -> Route {
        let Message { header, body } = msg;
        if let Body::Advertisement {
            server_port,
            capabilities,
        } = body
        {
            let id = header.sender;
            let outcome = self.registry.upsert(PeerEntry {
                identifier: id.clone(),
                server_port,
                capabilities,
                last_seen: now,
            });
            return Route::Peer(id, outcome);
        }
        if header.sender == self.identifier {
            return Route::Dropped(DropReason::OwnMessage);
        }
        let reply_to = ReplyTo {
            identifier: header.sender.clone(),
            serial: header.serial,
        };
        match body {
            Body::Advertisement { .. } => Route::Dropped(DropReason::OwnMessage),
            Body::SearchRequest { query } => {
                if !self.capabilities.search {
                    return Route::Dropped(DropReason::SearchDisabled);
                }
                Route::SearchRequest(IncomingRequest { reply_to, query })
            }
            Body::DownloadRequest { target, query } => {
                if target != self.identifier {
                    return Route::Dropped(DropReason::NotTarget);
                }
                if !self.capabilities.download {
                    return Route::Dropped(DropReason::DownloadDisabled);
                }
                Route::DownloadRequest(IncomingRequest { reply_to, query })
            }
            Body::SearchResult { reply_to, path } => {
                match self.correlate(&reply_to, Kind::SearchResult, false) {
                    Ok(pending) => Route::SearchResponse(Report::SearchHit {
                        from: header.sender,
                        query: pending.query,
                        path,
                    }),
                    Err(reason) => Route::Dropped(reason),
                }
            }
            Body::SearchError { reply_to } => {
                match self.correlate(&reply_to, Kind::SearchError, false) {
                    Ok(pending) => Route::SearchResponse(Report::SearchMiss {
                        from: header.sender,
                        query: pending.query,
                    }),
                    Err(reason) => Route::Dropped(reason),
                }
            }
            Body::DownloadResult {
                reply_to,
                query,
                port,
            } => match self.correlate(&reply_to, Kind::DownloadResult, true) {
                Ok(_) => Route::DownloadResponse(Report::DownloadReady {
                    from: header.sender,
                    query,
                    port,
                }),
                Err(reason) => Route::Dropped(reason),
            },
            Body::DownloadError {
                reply_to,
                match_count,
            } => match self.correlate(&reply_to, Kind::DownloadError, true) {
                Ok(pending) if match_count == 0 => {
                    Route::DownloadResponse(Report::DownloadNoMatch {
                        from: header.sender,
                        query: pending.query,
                    })
                }
                Ok(pending) => Route::DownloadResponse(Report::DownloadAmbiguous {
                    from: header.sender,
                    query: pending.query,
                    matches: match_count,
                }),
                Err(reason) => Route::Dropped(reason),
            },
        }
    }

    /// Match a reply against our outstanding requests by (identifier, serial).
    fn correlate(
        &self,
        reply_to: &ReplyTo,
        reply_kind: Kind,
        retire: bool,
    ) -> Result<PendingRequest, DropReason> {
        if reply_to.identifier != self.identifier {
            return Err(DropReason::ForeignReply);
        }
        let mut pending = self.pending();
        let answers = pending
            .get(&reply_to.serial)
            .is_some_and(|p| Some(p.kind) == reply_kind.answers());
        if !answers {
            return Err(DropReason::UnsolicitedReply);
        }
        let found = if retire {
            pending.remove(&reply_to.serial)
        } else {
            pending.get(&reply_to.serial).cloned()
        };
        found.ok_or(DropReason::UnsolicitedReply)
    }

    fn header(&self) -> Header {
        Header {
            sender: self.identifier.clone(),
            serial: self.serials.next(),
            timestamp: Timestamp::now(),
        }
    }

    fn message(&self, body: Body) -> Message {
        Message {
            header: self.header(),
            body,
        }
    }

    fn track(&self, msg: &Message, query: &str, now: Instant) {
        self.pending().insert(
            msg.header.serial,
            PendingRequest {
                serial: msg.header.serial,
                kind: msg.kind(),
                query: query.to_string(),
                issued_at: now,
            },
        );
    }

    /// Our periodic advertisement.
    pub fn advertisement(&self, server_port: u16) -> Message {
        self.message(Body::Advertisement {
            server_port,
            capabilities: self.capabilities,
        })
    }

    /// Build a search request and start collecting its replies.
    pub fn search_request(&self, query: &str, now: Instant) -> Message {
        let msg = self.message(Body::SearchRequest {
            query: query.to_string(),
        });
        self.track(&msg, query, now);
        msg
    }

    /// Build a download request for a peer we have heard advertise download capability.
    pub fn download_request(
        &self,
        target: &Identifier,
        query: &str,
        now: Instant,
    ) -> Result<Message, RequestError> {
        let peer = self
            .registry
            .lookup(target)
            .ok_or_else(|| RequestError::UnknownPeer(target.clone()))?;
        if !peer.capabilities.download {
            return Err(RequestError::DownloadUnsupported(target.clone()));
        }
        let msg = self.message(Body::DownloadRequest {
            target: target.clone(),
            query: query.to_string(),
        });
        self.track(&msg, query, now);
        Ok(msg)
    }

    #[cfg(test)]
    pub fn pending_request(&self, serial: u64) -> Option<PendingRequest> {
        self.pending().get(&serial).cloned()
    }

    /// Forget requests issued more than `ttl` ago; their late replies will be dropped.
    pub fn expire_requests(&self, now: Instant, ttl: Duration) -> usize {
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|_, p| now.saturating_duration_since(p.issued_at) <= ttl);
        before - pending.len()
    }

    /// Replies to a search request: one `search-result` per match, or one `search-error`.
    pub fn answer_search(&self, request: &IncomingRequest, matches: &[Match]) -> Vec<Message> {
        if matches.is_empty() {
            return vec![self.message(Body::SearchError {
                reply_to: request.reply_to.clone(),
            })];
        }
        matches
            .iter()
            .map(|m| {
                self.message(Body::SearchResult {
                    reply_to: request.reply_to.clone(),
                    path: m.logical.clone(),
                })
            })
            .collect()
    }

    /// Decide how to answer a download request given the files its query matched.
    pub fn plan_download(&self, request: IncomingRequest, mut matches: Vec<Match>) -> DownloadPlan {
        if matches.len() == 1 {
            if let Some(only) = matches.pop() {
                return DownloadPlan::Serve {
                    file: only.absolute,
                    request,
                };
            }
        }
        DownloadPlan::Refuse(self.message(Body::DownloadError {
            reply_to: request.reply_to,
            match_count: matches.len().min(u32::MAX as usize) as u32,
        }))
    }

    /// `download-result` pointing the requester at the transfer listener.
    pub fn download_result(&self, request: &IncomingRequest, port: u16) -> Message {
        self.message(Body::DownloadResult {
            reply_to: request.reply_to.clone(),
            query: request.query.clone(),
            port,
        })
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}
