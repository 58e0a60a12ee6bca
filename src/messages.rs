//! # Wire Protocol Messages
//!
//! All serializable types exchanged between peer sessions. Messages are
//! serialized using bincode with size limits to prevent memory exhaustion.
//!
//! ## Layering
//!
//! ```text
//! Frame::Sealed(seal(SignedEnvelope))  |  Frame::Clear(SignedEnvelope)
//!   SignedEnvelope { m: bincode(Envelope), s: ed25519 signature over m }
//!     Envelope { v, a, m: MessageType, p: Payload, t, c }
//! ```
//!
//! Only the introduction travels in a clear frame: it carries the ephemeral
//! box key the remote end needs to seal everything after it.
//!
//! ## Security Limits
//!
//! - `MAX_VALUE_SIZE`: Maximum size of stored values (1 MiB less the
//!   envelope reserve, so one record always fits in one message)
//! - `MAX_DESERIALIZE_SIZE`: Maximum deserialization buffer (prevents OOM)
//! - All deserialization uses `deserialize_bounded()` with size limits

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identity::{Contact, Identity};
use crate::records::{Key, SignedRecord, UserIdClaim};
use crate::relay::SignedSignal;

/// Envelope format version. Envelopes carrying any other value are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Room kept in every message for everything except a record's value:
/// envelope header, signatures, sealing, record fields and contacts.
pub const MESSAGE_OVERHEAD_RESERVE: usize = 64 * 1024;

/// Maximum size of a stored value in the DHT (1 MiB less the reserve).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024 - MESSAGE_OVERHEAD_RESERVE;

/// Bytes a packed envelope adds around its payload: header fields, two
/// signatures, the seal and the length prefixes of each layer.
pub const ENVELOPE_FRAMING: usize = 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE + MESSAGE_OVERHEAD_RESERVE) as u64;

/// Maximum contacts accepted in a single response.
/// SECURITY: Bounds the work a single peer can push into a lookup round.
pub const MAX_CONTACTS_PER_RESPONSE: usize = 100;

/// Maximum records accepted in a single page.
pub const MAX_RECORDS_PER_RESPONSE: usize = 64;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same options used for decoding, so signed bytes are stable.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Encoded size of `value`; `usize::MAX` when it exceeds the decode limit.
pub fn encoded_len<T: Serialize + ?Sized>(value: &T) -> usize {
    bincode_options()
        .serialized_size(value)
        .ok()
        .and_then(|n| usize::try_from(n).ok())
        .unwrap_or(usize::MAX)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Reply = 0,
    Introduce = 1,
    Add = 2,
    Shutdown = 3,
    Ping = 4,
    Store = 5,
    FindNode = 6,
    FindValueAuthor = 7,
    ReceiveMessages = 8,
    Signal = 9,
    Signalled = 10,
    SetUserId = 11,
    GetUserId = 12,
    FindValue = 13,
}

/// Sent once by each side at session start, in a clear frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introduction {
    /// Ephemeral X25519 key the remote end seals frames to.
    pub pk: [u8; 32],
    /// Listen addresses of the sender. Empty when not directly reachable.
    pub addrs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    Introduce(Introduction),
    Add {
        added: bool,
    },
    Shutdown,
    Ping,
    Store {
        record: SignedRecord,
        k: u32,
    },
    FindNode {
        target: Identity,
        k: u32,
    },
    FindValueAuthor {
        key: Key,
        author: Identity,
        k: u32,
    },
    ReceiveMessages {
        since: u64,
    },
    Signal {
        offer: SignedSignal,
    },
    Signalled {
        offer: SignedSignal,
    },
    SetUserId {
        claim: UserIdClaim,
        k: u32,
    },
    GetUserId {
        user_hash: Key,
        k: u32,
    },
    FindValue {
        key: Key,
        k: u32,
        since: u64,
    },
}

impl Request {
    pub fn message_type(&self) -> MessageType {
        match self {
            Request::Introduce(_) => MessageType::Introduce,
            Request::Add { .. } => MessageType::Add,
            Request::Shutdown => MessageType::Shutdown,
            Request::Ping => MessageType::Ping,
            Request::Store { .. } => MessageType::Store,
            Request::FindNode { .. } => MessageType::FindNode,
            Request::FindValueAuthor { .. } => MessageType::FindValueAuthor,
            Request::ReceiveMessages { .. } => MessageType::ReceiveMessages,
            Request::Signal { .. } => MessageType::Signal,
            Request::Signalled { .. } => MessageType::Signalled,
            Request::SetUserId { .. } => MessageType::SetUserId,
            Request::GetUserId { .. } => MessageType::GetUserId,
            Request::FindValue { .. } => MessageType::FindValue,
        }
    }
}

/// Outcome the relay reports for a `Signal` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SignalReply {
    /// The relay has no active session to the target.
    NoRoute,
    /// The relay is the target.
    Myself,
    /// The target's signed answer.
    Answer(SignedSignal),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Nodes(Vec<Contact>),
    Value {
        nodes: Vec<Contact>,
        record: Option<SignedRecord>,
    },
    Values {
        nodes: Vec<Contact>,
        records: Vec<SignedRecord>,
        next: u64,
    },
    Messages {
        records: Vec<SignedRecord>,
        next: u64,
    },
    UserIdSet {
        nodes: Vec<Contact>,
    },
    UserIdTaken,
    UserId {
        nodes: Vec<Contact>,
        claim: Option<UserIdClaim>,
    },
    Signal(SignalReply),
    Signalled {
        answer: Option<SignedSignal>,
    },
    Added {
        added: bool,
    },
}

impl Response {
    /// The same reply with every contact and record removed.
    pub fn stripped(&self) -> Response {
        match self {
            Response::Nodes(_) => Response::Nodes(Vec::new()),
            Response::Value { .. } => Response::Value {
                nodes: Vec::new(),
                record: None,
            },
            Response::Values { .. } => Response::Values {
                nodes: Vec::new(),
                records: Vec::new(),
                next: 0,
            },
            Response::Messages { .. } => Response::Messages {
                records: Vec::new(),
                next: 0,
            },
            Response::UserIdSet { .. } => Response::UserIdSet { nodes: Vec::new() },
            Response::UserId { claim, .. } => Response::UserId {
                nodes: Vec::new(),
                claim: claim.clone(),
            },
            other => other.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    Request(Request),
    Reply(Response),
}

impl Payload {
    /// The message type this payload must be announced with.
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Request(request) => request.message_type(),
            Payload::Reply(_) => MessageType::Reply,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub v: u32,
    /// Author identity.
    pub a: Identity,
    pub m: MessageType,
    pub p: Payload,
    /// Epoch milliseconds at packing time.
    pub t: u64,
    /// Request counter; replies echo the request's counter.
    pub c: u64,
}

impl Envelope {
    pub fn is_consistent(&self) -> bool {
        self.p.message_type() == self.m
    }
}

/// Serialized envelope plus the author's signature over exactly those bytes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub m: Vec<u8>,
    pub s: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Frame {
    Sealed(Vec<u8>),
    Clear(Vec<u8>),
}
