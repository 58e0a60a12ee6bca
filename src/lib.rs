//! # meshdht - Peer-to-Peer Distributed Hash Table
//!
//! meshdht is a DHT core built on authenticated, encrypted peer sessions:
//!
//! - **Identity**: Ed25519 keypairs; the 32-byte public key is the node id
//! - **Sessions**: signed envelopes sealed to per-session X25519 keys, with
//!   counter-correlated request/reply over any duplex byte channel
//! - **Routing**: XOR-distance k-buckets with ping-and-replace admission
//! - **Lookup**: iterative closest-node search driving every DHT operation
//! - **Signaling Relay**: connects to nodes without reachable addresses by
//!   relaying signed connection offers through a shared neighbour
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for concurrent state:
//! - `Node` and `PeerSession` are handles talking to private actors over channels
//! - Actors own all mutable state and process commands sequentially
//! - Sessions reach the node only through the narrow `SessionHost` trait
//!
//! ## Security Model
//!
//! - Every envelope is signed by its author and bound to the session's identity
//! - Every stored record and user-name claim is signed and verified on receipt
//! - Faults are classified (transport, protocol, malicious) and destroy only
//!   the session they occur on
//! - All decoding is size-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: routing table, session registry, DHT operations |
//! | `identity` | Keypairs, identities, XOR distance, contacts |
//! | `crypto` | Domain-separated signatures, sealed boxes |
//! | `records` | Signed records and user-name claims |
//! | `storage` | Storage trait and in-memory store |
//! | `messages` | Wire types and bounded serialization |
//! | `envelope` | Envelope packing/unpacking and the fault taxonomy |
//! | `session` | Peer session state machine and RPC surface |
//! | `routing` | K-bucket routing table |
//! | `lookup` | Iterative closest-node lookup |
//! | `relay` | Signaling relay for NAT traversal |
//! | `transport` | Duplex frame channels, TCP framing, connectors |

mod crypto;
mod envelope;
mod identity;
mod lookup;
mod messages;
mod node;
mod records;
mod relay;
mod routing;
mod session;
mod storage;
mod transport;

pub use crypto::{BoxKeypair, SealError, SignatureError, seal};
pub use envelope::{EnvelopeCodec, Fault, FaultClass, DEFAULT_MAX_CLOCK_SKEW, DEFAULT_MAX_MESSAGE_SIZE};
pub use identity::{distance_cmp, Contact, Identity, Keypair};
pub use lookup::{iterative_lookup, LookupConfig, LookupError, LookupOutcome, PeerResolver};
pub use messages::{
    Envelope, Introduction, MessageType, Request, Response, SignalReply, MAX_VALUE_SIZE,
    PROTOCOL_VERSION,
};
pub use node::{Node, NodeConfig, Peer};
pub use records::{normalize_user_id, user_id_hash, Key, RecordError, SignedRecord, UserIdClaim};
pub use relay::{
    answer_offer, initiate, relay_decision, target_decision, InitiatorState, InitiatorStep,
    RelayDecision, RelayOutcome, SignalInitiator, SignedSignal, TargetDecision,
};
pub use routing::{bucket_index, Admission, PendingAdmission, RoutingTable};
pub use session::{
    DestroyReason, PeerSession, SessionConfig, SessionEvent, SessionHost, SessionId, SessionState,
    ValuesPage,
};
pub use storage::{MemoryStorage, Storage};
pub use transport::{Connector, MemoryConnector, MemoryNetwork, OfferId, TcpConnector, Transport};
