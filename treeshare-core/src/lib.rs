//! treeshare protocol engine: multicast peer discovery, substring search and
//! point-to-point download handshake.
//! Host-driven: no I/O; host passes datagrams in and receives routes, replies and reports.

pub mod core;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod search;
pub mod transfer;
pub mod wire;

pub use crate::core::{
    DownloadPlan, DropReason, IncomingRequest, PendingRequest, Report, RequestError, Route,
    ShareCore,
};
pub use identity::{Identifier, IdentifierError, SerialGenerator};
pub use protocol::{Body, Capabilities, Header, Kind, Message, ReplyTo, Timestamp};
pub use registry::{PeerEntry, PeerRegistry, Upsert};
pub use search::{Match, MatchFinder};
pub use transfer::{FileHeader, HeaderError, TRANSFER_CHUNK_SIZE};
pub use wire::{decode_message, encode_message, MessageDecodeError, MessageEncodeError};
