//! # Peer Sessions
//!
//! A [`PeerSession`] is one authenticated, encrypted conversation with one
//! remote node over one [`Transport`]. It follows the actor pattern: the
//! handle is cheap to clone and talks to a private `SessionActor` that owns
//! the transport, the [`EnvelopeCodec`], the pending-request map and the state.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──spawn──▶ Introducing ──remote Introduce──▶ Active
//!    │                    │                              │
//!    └────────────────────┴──────── any fault ───────────┴──▶ Destroyed
//! ```
//!
//! Destruction fails every pending request, drops the transport and emits
//! [`SessionEvent::Destroyed`]. Faults never cross session boundaries.
//!
//! ## Request Handling
//!
//! Inbound requests other than lifecycle messages are served on spawned
//! tasks against a [`SessionHost`], so a slow storage call never stalls the
//! frame loop. Outbound requests are correlated by counter; the caller bounds
//! the wait and reports expiry back to the actor, which destroys the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::envelope::{
    DEFAULT_MAX_CLOCK_SKEW, DEFAULT_MAX_MESSAGE_SIZE, EnvelopeCodec, Fault, FaultClass,
};
use crate::identity::{Contact, Identity, Keypair};
use crate::messages::{
    ENVELOPE_FRAMING, Introduction, MAX_CONTACTS_PER_RESPONSE, MAX_RECORDS_PER_RESPONSE,
    MESSAGE_OVERHEAD_RESERVE, Payload, Request, Response, SignalReply, encoded_len,
};
use crate::records::{Key, SignedRecord, UserIdClaim};
use crate::relay::{self, SignedSignal};
use crate::storage::Storage;
use crate::transport::Transport;

/// Default time to wait for a reply before the session is considered dead.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(65);

/// Default time allowed for the remote introduction.
pub const DEFAULT_INTRODUCTION_TIMEOUT: Duration = Duration::from_secs(62);

/// Default number of records served per page.
pub const DEFAULT_MESSAGE_PAGE_SIZE: usize = 16;

/// Session command channel depth.
const SESSION_COMMAND_CHANNEL_SIZE: usize = 64;

/// Counter used by the introduction; requests start at 1.
const INTRODUCTION_COUNTER: u64 = 0;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub reply_timeout: Duration,
    pub introduction_timeout: Duration,
    pub max_message_size: usize,
    pub max_clock_skew: Duration,
    /// Records per `ReceiveMessages`/`FindValue` page served by this node.
    pub message_page_size: usize,
    /// Release the session once neither side keeps the other in its table.
    pub bilateral_add: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            introduction_timeout: DEFAULT_INTRODUCTION_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            message_page_size: DEFAULT_MESSAGE_PAGE_SIZE,
            bilateral_add: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Introducing,
    Active,
    Destroyed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DestroyReason {
    /// The transport closed.
    Closed,
    /// Local graceful shutdown.
    LocalShutdown,
    /// The remote sent `Shutdown`.
    RemoteShutdown,
    /// Neither side keeps the other in its routing table.
    Released,
    /// Every handle was dropped.
    Dropped,
    Fault(Fault),
}

impl DestroyReason {
    /// The error pending requests are failed with.
    pub fn as_fault(&self) -> Fault {
        match self {
            DestroyReason::Fault(fault) => fault.clone(),
            _ => Fault::TransportClosed,
        }
    }
}

impl From<Fault> for DestroyReason {
    fn from(fault: Fault) -> Self {
        DestroyReason::Fault(fault)
    }
}

/// Lifecycle signals delivered to the session's owner.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Active {
        session: SessionId,
        contact: Contact,
    },
    /// Reputation extension point; always followed by `Destroyed`.
    Fault {
        session: SessionId,
        remote: Option<Identity>,
        fault: Fault,
    },
    Destroyed {
        session: SessionId,
        remote: Option<Identity>,
        reason: DestroyReason,
    },
}

#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub state: SessionState,
    pub remote: Option<Contact>,
    pub reason: Option<DestroyReason>,
}

/// Capabilities a session needs from the node that owns it.
#[async_trait]
pub trait SessionHost: Send + Sync + 'static {
    fn keypair(&self) -> &Keypair;

    /// Addresses announced in our introduction.
    fn listen_addrs(&self) -> Vec<String>;

    fn storage(&self) -> Arc<dyn Storage>;

    /// Tolerated skew for relayed signals.
    fn max_clock_skew(&self) -> Duration {
        DEFAULT_MAX_CLOCK_SKEW
    }

    /// Up to `k` known contacts closest to `target`, the local node included.
    async fn closest(&self, target: &Identity, k: usize) -> Vec<Contact>;

    /// A record addressed to this node was stored.
    async fn deliver(&self, record: SignedRecord);

    /// Active session to `id`, if one exists.
    async fn session_to(&self, id: &Identity) -> Option<PeerSession>;

    /// Target side of the signaling relay: open a transport for `offer`,
    /// spawn a session expecting its author, and return the signed answer.
    async fn accept_signal(&self, offer: &SignedSignal) -> Option<SignedSignal>;
}

enum Command {
    Request {
        counter: u64,
        request: Request,
        reply: oneshot::Sender<Result<Response, Fault>>,
    },
    Expire {
        counter: u64,
    },
    Respond {
        counter: u64,
        result: Result<Response, Fault>,
    },
    SetAdded(bool),
    RemoteAdded(bool),
    Close(DestroyReason),
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Response, Fault>>,
    created_at: Instant,
}

// ============================================================================
// Session Handle
// ============================================================================

/// Handle to a peer session actor.
#[derive(Clone)]
pub struct PeerSession {
    id: SessionId,
    cmd_tx: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
    counter: Arc<AtomicU64>,
    reply_timeout: Duration,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("remote", &self.remote_identity())
            .finish()
    }
}

impl PeerSession {
    /// Start a session over `transport`.
    ///
    /// `expected` pins the remote identity for outbound sessions; inbound
    /// sessions learn it from the introduction.
    pub fn spawn(
        host: Arc<dyn SessionHost>,
        transport: Transport,
        expected: Option<Identity>,
        config: SessionConfig,
        events: mpsc::Sender<SessionEvent>,
    ) -> PeerSession {
        let id = SessionId::next();
        let (cmd_tx, cmd_rx) = mpsc::channel(SESSION_COMMAND_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: SessionState::Created,
            remote: None,
            reason: None,
        });
        let codec = EnvelopeCodec::new(
            host.keypair().clone(),
            config.max_message_size,
            config.max_clock_skew,
        );
        let (outbound, inbound) = transport.into_parts();

        let actor = SessionActor {
            id,
            host,
            codec,
            outbound,
            inbound,
            expected,
            state: SessionState::Created,
            remote: None,
            pending: HashMap::new(),
            status_tx,
            events,
            weak_tx: cmd_tx.downgrade(),
            added: false,
            remote_added: None,
            config: config.clone(),
        };
        tokio::spawn(actor.run(cmd_rx));

        PeerSession {
            id,
            cmd_tx,
            status: status_rx,
            counter: Arc::new(AtomicU64::new(INTRODUCTION_COUNTER + 1)),
            reply_timeout: config.reply_timeout,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn remote_identity(&self) -> Option<Identity> {
        self.status.borrow().remote.as_ref().map(|c| c.identity)
    }

    pub fn remote_contact(&self) -> Option<Contact> {
        self.status.borrow().remote.clone()
    }

    pub fn destroy_reason(&self) -> Option<DestroyReason> {
        self.status.borrow().reason.clone()
    }

    /// Resolves with the remote contact once introduced, or with the cause
    /// of destruction.
    pub async fn wait_active(&self) -> Result<Contact, Fault> {
        let mut status = self.status.clone();
        loop {
            {
                let current = status.borrow_and_update();
                match current.state {
                    SessionState::Active => {
                        return current.remote.clone().ok_or(Fault::NotIntroduced);
                    }
                    SessionState::Destroyed => {
                        return Err(current
                            .reason
                            .as_ref()
                            .map(DestroyReason::as_fault)
                            .unwrap_or(Fault::TransportClosed));
                    }
                    _ => {}
                }
            }
            if status.changed().await.is_err() {
                return Err(Fault::TransportClosed);
            }
        }
    }

    /// Resolves once the session is destroyed.
    pub async fn closed(&self) {
        let mut status = self.status.clone();
        loop {
            if status.borrow_and_update().state == SessionState::Destroyed {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send a request and wait for its reply, bounded by the reply timeout.
    pub async fn request(&self, request: Request) -> Result<Response, Fault> {
        if !self.is_active() {
            return Err(Fault::SessionNotActive);
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                counter,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Fault::SessionNotActive)?;

        match tokio::time::timeout(self.reply_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Fault::TransportClosed),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::Expire { counter }).await;
                Err(Fault::ReplyTimeout)
            }
        }
    }

    /// Destroy the session with `fault`.
    pub async fn abort(&self, fault: Fault) {
        let _ = self.cmd_tx.send(Command::Close(fault.into())).await;
    }

    async fn unexpected<T>(&self) -> Result<T, Fault> {
        self.abort(Fault::UnexpectedReply).await;
        Err(Fault::UnexpectedReply)
    }

    /// Send `Shutdown`, wait for the acknowledgement, then destroy.
    pub async fn shutdown(&self) {
        if self.is_active() {
            let _ = self.request(Request::Shutdown).await;
        }
        let _ = self
            .cmd_tx
            .send(Command::Close(DestroyReason::LocalShutdown))
            .await;
        self.closed().await;
    }

    // ------------------------------------------------------------------------
    // RPC surface
    // ------------------------------------------------------------------------

    /// `true` when the remote acknowledged.
    pub async fn ping(&self) -> bool {
        matches!(self.request(Request::Ping).await, Ok(Response::Ack))
    }

    pub async fn find_node(&self, target: Identity, k: usize) -> Result<Vec<Contact>, Fault> {
        match self
            .request(Request::FindNode {
                target,
                k: wire_k(k),
            })
            .await?
        {
            Response::Nodes(nodes) => Ok(sanitize_contacts(nodes)),
            _ => self.unexpected().await,
        }
    }

    /// Store `record` on the remote; returns the contacts it knows closest to the key.
    pub async fn store(&self, record: SignedRecord, k: usize) -> Result<Vec<Contact>, Fault> {
        match self
            .request(Request::Store {
                record,
                k: wire_k(k),
            })
            .await?
        {
            Response::Nodes(nodes) => Ok(sanitize_contacts(nodes)),
            _ => self.unexpected().await,
        }
    }

    /// Point lookup of `author`'s record under `key`. A returned record that
    /// fails verification destroys the session.
    pub async fn find_value_author(
        &self,
        key: Key,
        author: Identity,
        k: usize,
    ) -> Result<(Vec<Contact>, Option<SignedRecord>), Fault> {
        match self
            .request(Request::FindValueAuthor {
                key,
                author,
                k: wire_k(k),
            })
            .await?
        {
            Response::Value { nodes, record } => {
                if let Some(record) = &record
                    && record.verify_for(&key, &author).is_err()
                {
                    self.abort(Fault::ForgedRecord).await;
                    return Err(Fault::ForgedRecord);
                }
                Ok((sanitize_contacts(nodes), record))
            }
            _ => self.unexpected().await,
        }
    }

    /// One page of records from any author under `key` newer than `since`.
    pub async fn find_value(&self, key: Key, k: usize, since: u64) -> Result<ValuesPage, Fault> {
        match self
            .request(Request::FindValue {
                key,
                k: wire_k(k),
                since,
            })
            .await?
        {
            Response::Values {
                nodes,
                records,
                next,
            } => {
                let records = self.checked_records(records, &key).await?;
                Ok(ValuesPage {
                    nodes: sanitize_contacts(nodes),
                    records,
                    next,
                })
            }
            _ => self.unexpected().await,
        }
    }

    /// One page of records the remote holds under our own id.
    pub async fn receive_messages(
        &self,
        own_id: Identity,
        since: u64,
    ) -> Result<(Vec<SignedRecord>, u64), Fault> {
        match self.request(Request::ReceiveMessages { since }).await? {
            Response::Messages { records, next } => {
                let records = self.checked_records(records, own_id.as_bytes()).await?;
                Ok((records, next))
            }
            _ => self.unexpected().await,
        }
    }

    async fn checked_records(
        &self,
        mut records: Vec<SignedRecord>,
        key: &Key,
    ) -> Result<Vec<SignedRecord>, Fault> {
        if records
            .iter()
            .any(|r| r.verify().is_err() || r.key() != key)
        {
            self.abort(Fault::ForgedRecord).await;
            return Err(Fault::ForgedRecord);
        }
        records.truncate(MAX_RECORDS_PER_RESPONSE);
        Ok(records)
    }

    /// `Some(nodes)` when the claim was accepted, `None` when the name is taken.
    pub async fn set_user_id(
        &self,
        claim: UserIdClaim,
        k: usize,
    ) -> Result<Option<Vec<Contact>>, Fault> {
        match self
            .request(Request::SetUserId {
                claim,
                k: wire_k(k),
            })
            .await?
        {
            Response::UserIdSet { nodes } => Ok(Some(sanitize_contacts(nodes))),
            Response::UserIdTaken => Ok(None),
            _ => self.unexpected().await,
        }
    }

    pub async fn get_user_id(
        &self,
        user_hash: Key,
        k: usize,
    ) -> Result<(Vec<Contact>, Option<UserIdClaim>), Fault> {
        match self
            .request(Request::GetUserId {
                user_hash,
                k: wire_k(k),
            })
            .await?
        {
            Response::UserId { nodes, claim } => {
                if let Some(claim) = &claim
                    && (claim.verify().is_err() || claim.user_hash != user_hash)
                {
                    self.abort(Fault::ForgedClaim).await;
                    return Err(Fault::ForgedClaim);
                }
                Ok((sanitize_contacts(nodes), claim))
            }
            _ => self.unexpected().await,
        }
    }

    /// Ask this session's remote to relay `offer` to its target.
    pub async fn signal(&self, offer: SignedSignal) -> Result<SignalReply, Fault> {
        match self.request(Request::Signal { offer }).await? {
            Response::Signal(reply) => Ok(reply),
            _ => self.unexpected().await,
        }
    }

    /// Hand a relayed offer to this session's remote, the target.
    pub async fn signalled(&self, offer: SignedSignal) -> Result<Option<SignedSignal>, Fault> {
        match self.request(Request::Signalled { offer }).await? {
            Response::Signalled { answer } => Ok(answer),
            _ => self.unexpected().await,
        }
    }

    /// Announce whether we keep the remote in our routing table; returns the
    /// remote's flag.
    pub async fn set_added(&self, added: bool) -> Result<bool, Fault> {
        let _ = self.cmd_tx.send(Command::SetAdded(added)).await;
        match self.request(Request::Add { added }).await? {
            Response::Added { added: remote } => {
                let _ = self.cmd_tx.send(Command::RemoteAdded(remote)).await;
                Ok(remote)
            }
            _ => self.unexpected().await,
        }
    }
}

/// A page of `FindValue` results.
#[derive(Clone, Debug)]
pub struct ValuesPage {
    pub nodes: Vec<Contact>,
    pub records: Vec<SignedRecord>,
    /// Cursor for the next page; 0 when exhausted.
    pub next: u64,
}

fn wire_k(k: usize) -> u32 {
    k.min(MAX_CONTACTS_PER_RESPONSE) as u32
}

/// SECURITY: Drop structurally invalid contacts and cap the count.
fn sanitize_contacts(nodes: Vec<Contact>) -> Vec<Contact> {
    if nodes.len() > MAX_CONTACTS_PER_RESPONSE {
        warn!(
            count = nodes.len(),
            max = MAX_CONTACTS_PER_RESPONSE,
            "peer returned too many contacts, truncating"
        );
    }
    nodes
        .into_iter()
        .filter(|c| c.identity.is_valid() && c.validate_structure())
        .take(MAX_CONTACTS_PER_RESPONSE)
        .collect()
}

// ============================================================================
// Session Actor
// ============================================================================

struct SessionActor {
    id: SessionId,
    host: Arc<dyn SessionHost>,
    codec: EnvelopeCodec,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    expected: Option<Identity>,
    state: SessionState,
    remote: Option<Contact>,
    pending: HashMap<u64, PendingRequest>,
    status_tx: watch::Sender<SessionStatus>,
    events: mpsc::Sender<SessionEvent>,
    weak_tx: mpsc::WeakSender<Command>,
    added: bool,
    remote_added: Option<bool>,
    config: SessionConfig,
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        if let Err(reason) = self.introduce().await {
            self.destroy(reason).await;
            return;
        }
        let intro_deadline = tokio::time::sleep(self.config.introduction_timeout);
        tokio::pin!(intro_deadline);

        let reason = loop {
            let step = tokio::select! {
                frame = self.inbound.recv() => match frame {
                    Some(bytes) => self.on_frame(bytes).await,
                    None => Err(DestroyReason::Closed),
                },
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => Err(DestroyReason::Dropped),
                },
                _ = &mut intro_deadline, if self.state != SessionState::Active => {
                    Err(Fault::IntroductionTimeout.into())
                }
            };
            if let Err(reason) = step {
                break reason;
            }
        };
        self.destroy(reason).await;
    }

    fn publish(&self, reason: Option<DestroyReason>) {
        let _ = self.status_tx.send(SessionStatus {
            state: self.state,
            remote: self.remote.clone(),
            reason,
        });
    }

    fn remote_id(&self) -> Option<Identity> {
        self.remote.as_ref().map(|c| c.identity)
    }

    async fn introduce(&mut self) -> Result<(), DestroyReason> {
        let intro = Introduction {
            pk: self.codec.local_box_key(),
            addrs: self.host.listen_addrs(),
        };
        let frame = self
            .codec
            .pack_request(Request::Introduce(intro), INTRODUCTION_COUNTER)?;
        self.send_frame(frame).await?;
        self.state = SessionState::Introducing;
        self.publish(None);
        Ok(())
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), DestroyReason> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| DestroyReason::Fault(Fault::SendFailed))
    }

    async fn on_frame(&mut self, bytes: Vec<u8>) -> Result<(), DestroyReason> {
        if bytes.len() > self.codec.max_message_size() {
            warn!(
                session = %self.id,
                size = bytes.len(),
                max = self.codec.max_message_size(),
                "peer sent oversized frame"
            );
            return Err(Fault::PayloadTooLarge.into());
        }
        let envelope = self.codec.unpack(&bytes)?;
        trace!(session = %self.id, kind = ?envelope.m, counter = envelope.c, "frame received");

        match self.state {
            SessionState::Introducing => match envelope.p {
                Payload::Request(Request::Introduce(intro)) => {
                    self.on_introduce(envelope.a, intro).await
                }
                _ => Err(Fault::NotIntroduced.into()),
            },
            SessionState::Active => {
                if Some(envelope.a) != self.remote_id() {
                    return Err(Fault::IdentityMismatch.into());
                }
                if let Some(remote) = self.remote.as_mut() {
                    remote.touch();
                }
                match envelope.p {
                    Payload::Request(Request::Introduce(_)) => {
                        Err(Fault::DoubleIntroduction.into())
                    }
                    Payload::Reply(response) => match self.pending.remove(&envelope.c) {
                        Some(pending) => {
                            trace!(
                                session = %self.id,
                                counter = envelope.c,
                                elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
                                "reply matched"
                            );
                            let _ = pending.reply.send(Ok(response));
                            Ok(())
                        }
                        None => Err(Fault::UnmatchedReply.into()),
                    },
                    Payload::Request(request) => self.on_request(envelope.c, request).await,
                }
            }
            SessionState::Created | SessionState::Destroyed => Err(Fault::NotIntroduced.into()),
        }
    }

    async fn on_introduce(
        &mut self,
        author: Identity,
        intro: Introduction,
    ) -> Result<(), DestroyReason> {
        if let Some(expected) = self.expected
            && expected != author
        {
            return Err(Fault::IdentityMismatch.into());
        }
        if author == self.codec.local_identity() {
            return Err(Fault::IdentityMismatch.into());
        }
        let contact = Contact::new(author, intro.addrs);
        if !contact.validate_structure() {
            return Err(Fault::Malformed.into());
        }

        self.codec.set_remote_box_key(intro.pk);
        self.remote = Some(contact.clone());
        self.state = SessionState::Active;
        self.publish(None);
        debug!(session = %self.id, peer = %author.short(), "session active");

        let _ = self
            .events
            .send(SessionEvent::Active {
                session: self.id,
                contact,
            })
            .await;
        Ok(())
    }

    async fn on_request(&mut self, counter: u64, request: Request) -> Result<(), DestroyReason> {
        match request {
            Request::Ping => self.reply(counter, Response::Ack).await,
            Request::Shutdown => {
                self.reply(counter, Response::Ack).await?;
                Err(DestroyReason::RemoteShutdown)
            }
            Request::Add { added } => {
                self.reply(counter, Response::Added { added: self.added }).await?;
                self.remote_added = Some(added);
                self.check_release()
            }
            request => {
                let Some(remote) = self.remote_id() else {
                    return Err(Fault::NotIntroduced.into());
                };
                let host = self.host.clone();
                let weak = self.weak_tx.clone();
                let limits = ReplyLimits {
                    page_size: self.config.message_page_size,
                    budget: self.config.max_message_size.saturating_sub(ENVELOPE_FRAMING),
                };
                tokio::spawn(async move {
                    let result = serve_request(host, remote, request, limits).await;
                    if let Some(tx) = weak.upgrade() {
                        let _ = tx.send(Command::Respond { counter, result }).await;
                    }
                });
                Ok(())
            }
        }
    }

    /// A reply we cannot pack is our own failure: it goes out stripped of
    /// contacts and records, or not at all, and the session survives.
    async fn reply(&self, counter: u64, response: Response) -> Result<(), DestroyReason> {
        let frame = match self.codec.pack_reply(response.clone(), counter) {
            Ok(frame) => frame,
            Err(fault) => {
                warn!(session = %self.id, counter, fault = %fault, "reply does not fit, sending it stripped");
                match self.codec.pack_reply(response.stripped(), counter) {
                    Ok(frame) => frame,
                    Err(fault) => {
                        warn!(session = %self.id, counter, fault = %fault, "failed to pack reply");
                        return Ok(());
                    }
                }
            }
        };
        self.send_frame(frame).await
    }

    fn check_release(&self) -> Result<(), DestroyReason> {
        if self.config.bilateral_add && !self.added && self.remote_added == Some(false) {
            return Err(DestroyReason::Released);
        }
        Ok(())
    }

    async fn on_command(&mut self, cmd: Command) -> Result<(), DestroyReason> {
        match cmd {
            Command::Request {
                counter,
                request,
                reply,
            } => {
                if self.state != SessionState::Active {
                    let _ = reply.send(Err(Fault::SessionNotActive));
                    return Ok(());
                }
                let frame = match self.codec.pack_request(request, counter) {
                    Ok(frame) => frame,
                    Err(fault) => {
                        let _ = reply.send(Err(fault));
                        return Ok(());
                    }
                };
                self.pending.insert(
                    counter,
                    PendingRequest {
                        reply,
                        created_at: Instant::now(),
                    },
                );
                self.send_frame(frame).await
            }
            Command::Expire { counter } => {
                if self.pending.remove(&counter).is_some() {
                    return Err(Fault::ReplyTimeout.into());
                }
                Ok(())
            }
            Command::Respond { counter, result } => match result {
                Ok(response) => self.reply(counter, response).await,
                Err(fault) => Err(fault.into()),
            },
            Command::SetAdded(added) => {
                self.added = added;
                Ok(())
            }
            Command::RemoteAdded(added) => {
                self.remote_added = Some(added);
                self.check_release()
            }
            Command::Close(reason) => Err(reason),
        }
    }

    async fn destroy(&mut self, reason: DestroyReason) {
        let remote = self.remote_id();
        let peer = remote.map(|id| id.short()).unwrap_or_default();

        if let DestroyReason::Fault(fault) = &reason {
            match fault.class() {
                FaultClass::Malicious => {
                    warn!(session = %self.id, peer = %peer, fault = %fault, "malicious peer")
                }
                _ => debug!(session = %self.id, peer = %peer, fault = %fault, "session fault"),
            }
            let _ = self
                .events
                .send(SessionEvent::Fault {
                    session: self.id,
                    remote,
                    fault: fault.clone(),
                })
                .await;
        }

        let failure = reason.as_fault();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(failure.clone()));
        }

        self.state = SessionState::Destroyed;
        self.publish(Some(reason.clone()));
        debug!(session = %self.id, peer = %peer, reason = ?reason, "session destroyed");

        let _ = self
            .events
            .send(SessionEvent::Destroyed {
                session: self.id,
                remote,
                reason,
            })
            .await;
    }
}

// ============================================================================
// Request Handlers
// ============================================================================

/// Size limits for one served reply.
#[derive(Clone, Copy, Debug)]
struct ReplyLimits {
    /// Records per page.
    page_size: usize,
    /// Bytes the reply payload may take.
    budget: usize,
}

impl ReplyLimits {
    /// Contacts never take more than part of the reserve, leaving the rest
    /// of the budget for records.
    fn contacts(&self) -> usize {
        self.budget.min(MESSAGE_OVERHEAD_RESERVE / 2)
    }
}

async fn serve_request(
    host: Arc<dyn SessionHost>,
    remote: Identity,
    request: Request,
    limits: ReplyLimits,
) -> Result<Response, Fault> {
    let storage = host.storage();
    match request {
        Request::FindNode { target, k } => {
            Ok(Response::Nodes(host.closest(&target, clamp_k(k)).await))
        }
        Request::Store { record, k } => {
            if record.verify().is_err() {
                return Err(Fault::ForgedRecord);
            }
            let key = *record.key();
            let addressed_to_us = key == *host.keypair().identity().as_bytes();
            match storage.store_record(record.clone()).await {
                Ok(true) if addressed_to_us => host.deliver(record).await,
                Ok(_) => {}
                Err(e) => debug!(peer = %remote.short(), error = ?e, "failed to store record"),
            }
            Ok(Response::Nodes(
                host.closest(&Identity::from_bytes(key), clamp_k(k)).await,
            ))
        }
        Request::FindValueAuthor { key, author, k } => {
            let record = storage
                .record_by_author(&key, &author)
                .await
                .unwrap_or_else(|e| {
                    debug!(error = ?e, "storage lookup failed");
                    None
                });
            let nodes = fit_contacts(
                host.closest(&Identity::from_bytes(key), clamp_k(k)).await,
                limits.contacts(),
            );
            let room = limits.budget.saturating_sub(encoded_len(&nodes));
            let record = record.filter(|r| {
                let fits = encoded_len(r) <= room;
                if !fits {
                    debug!(peer = %remote.short(), "record does not fit in a reply");
                }
                fits
            });
            Ok(Response::Value { nodes, record })
        }
        Request::FindValue { key, k, since } => {
            let nodes = fit_contacts(
                host.closest(&Identity::from_bytes(key), clamp_k(k)).await,
                limits.contacts(),
            );
            let room = limits.budget.saturating_sub(encoded_len(&nodes));
            let (records, next) = page(storage.as_ref(), &key, since, limits.page_size, room).await;
            Ok(Response::Values {
                nodes,
                records,
                next,
            })
        }
        Request::ReceiveMessages { since } => {
            let (records, next) = page(
                storage.as_ref(),
                remote.as_bytes(),
                since,
                limits.page_size,
                limits.budget,
            )
            .await;
            Ok(Response::Messages { records, next })
        }
        Request::SetUserId { claim, k } => {
            if claim.verify().is_err() {
                return Err(Fault::ForgedClaim);
            }
            let user_hash = claim.user_hash;
            let accepted = storage.set_user_id(claim).await.unwrap_or_else(|e| {
                debug!(error = ?e, "failed to store user id");
                false
            });
            if accepted {
                let nodes = host
                    .closest(&Identity::from_bytes(user_hash), clamp_k(k))
                    .await;
                Ok(Response::UserIdSet { nodes })
            } else {
                Ok(Response::UserIdTaken)
            }
        }
        Request::GetUserId { user_hash, k } => {
            let claim = storage.get_user_id(&user_hash).await.unwrap_or_else(|e| {
                debug!(error = ?e, "user id lookup failed");
                None
            });
            let nodes = host
                .closest(&Identity::from_bytes(user_hash), clamp_k(k))
                .await;
            Ok(Response::UserId { nodes, claim })
        }
        Request::Signal { offer } => relay::serve_signal(host.as_ref(), remote, offer).await,
        Request::Signalled { offer } => relay::serve_signalled(host.as_ref(), remote, offer).await,
        Request::Introduce(_) | Request::Add { .. } | Request::Shutdown | Request::Ping => {
            Err(Fault::Malformed)
        }
    }
}

fn clamp_k(k: u32) -> usize {
    (k as usize).min(MAX_CONTACTS_PER_RESPONSE)
}

/// Leading contacts whose encoding fits in `budget` bytes.
fn fit_contacts(nodes: Vec<Contact>, budget: usize) -> Vec<Contact> {
    let mut used = encoded_len(&Vec::<Contact>::new());
    nodes
        .into_iter()
        .take_while(|c| {
            used = used.saturating_add(encoded_len(c));
            used <= budget
        })
        .collect()
}

/// Records newer than `since` whose encoding fits in `budget` bytes.
///
/// The cursor is the timestamp of the last record considered whenever the
/// page was cut short by either the record count or the byte budget, and 0
/// once the key is exhausted. A record that could never fit is skipped.
async fn page(
    storage: &dyn Storage,
    key: &Key,
    since: u64,
    page_size: usize,
    budget: usize,
) -> (Vec<SignedRecord>, u64) {
    let limit = page_size.clamp(1, MAX_RECORDS_PER_RESPONSE);
    let fetched = storage
        .records_since(key, since, limit)
        .await
        .unwrap_or_else(|e| {
            debug!(error = ?e, "storage page failed");
            Vec::new()
        });
    let exhausted = fetched.len() < limit;

    let mut used = encoded_len(&Vec::<SignedRecord>::new());
    let mut cursor = since;
    let mut records = Vec::with_capacity(fetched.len());
    for record in fetched {
        let size = encoded_len(&record);
        if used.saturating_add(size) > budget {
            if records.is_empty() {
                debug!(key = %hex::encode(&key[..8]), size, "record larger than a reply, skipping");
                cursor = record.timestamp();
                continue;
            }
            return (records, cursor);
        }
        used += size;
        cursor = record.timestamp();
        records.push(record);
    }
    let next = if exhausted { 0 } else { cursor };
    (records, next)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::seal;
    use crate::envelope::DEFAULT_MAX_CLOCK_SKEW;
    use crate::messages::{Envelope, Frame, MAX_VALUE_SIZE, MessageType, encode, deserialize_bounded};
    use crate::storage::MemoryStorage;

    pub(crate) struct TestHost {
        keypair: Keypair,
        storage: Arc<MemoryStorage>,
        inbox: mpsc::Sender<SignedRecord>,
        contacts: Vec<Contact>,
    }

    impl TestHost {
        pub(crate) fn new(keypair: Keypair) -> (Arc<Self>, mpsc::Receiver<SignedRecord>) {
            let (inbox, inbox_rx) = mpsc::channel(16);
            let host = Arc::new(Self {
                contacts: vec![Contact::unreachable(keypair.identity())],
                keypair,
                storage: Arc::new(MemoryStorage::new()),
                inbox,
            });
            (host, inbox_rx)
        }
    }

    #[async_trait]
    impl SessionHost for TestHost {
        fn keypair(&self) -> &Keypair {
            &self.keypair
        }

        fn listen_addrs(&self) -> Vec<String> {
            vec![]
        }

        fn storage(&self) -> Arc<dyn Storage> {
            self.storage.clone()
        }

        async fn closest(&self, _target: &Identity, k: usize) -> Vec<Contact> {
            self.contacts.iter().take(k).cloned().collect()
        }

        async fn deliver(&self, record: SignedRecord) {
            let _ = self.inbox.send(record).await;
        }

        async fn session_to(&self, _id: &Identity) -> Option<PeerSession> {
            None
        }

        async fn accept_signal(&self, _offer: &SignedSignal) -> Option<SignedSignal> {
            None
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            reply_timeout: Duration::from_millis(300),
            introduction_timeout: Duration::from_millis(300),
            ..SessionConfig::default()
        }
    }

    pub(crate) struct Connected {
        pub a: PeerSession,
        pub b: PeerSession,
        pub a_events: mpsc::Receiver<SessionEvent>,
        pub b_events: mpsc::Receiver<SessionEvent>,
        pub a_kp: Keypair,
        pub b_kp: Keypair,
        pub b_inbox: mpsc::Receiver<SignedRecord>,
    }

    pub(crate) async fn connected(config: SessionConfig) -> Connected {
        let a_kp = Keypair::generate();
        let b_kp = Keypair::generate();
        let (a_host, _) = TestHost::new(a_kp.clone());
        let (b_host, b_inbox) = TestHost::new(b_kp.clone());
        let (ta, tb) = Transport::pair(16);
        let (a_tx, a_events) = mpsc::channel(64);
        let (b_tx, b_events) = mpsc::channel(64);

        let a = PeerSession::spawn(a_host, ta, Some(b_kp.identity()), config.clone(), a_tx);
        let b = PeerSession::spawn(b_host, tb, None, config, b_tx);
        a.wait_active().await.unwrap();
        b.wait_active().await.unwrap();
        Connected {
            a,
            b,
            a_events,
            b_events,
            a_kp,
            b_kp,
            b_inbox,
        }
    }

    async fn next_fault(events: &mut mpsc::Receiver<SessionEvent>) -> Fault {
        loop {
            match events.recv().await {
                Some(SessionEvent::Fault { fault, .. }) => return fault,
                Some(_) => continue,
                None => panic!("event stream ended without a fault"),
            }
        }
    }

    /// Hand-driven remote end speaking the envelope protocol directly.
    pub(crate) struct RawPeer {
        pub codec: EnvelopeCodec,
        pub transport: Transport,
        remote_key: Option<[u8; 32]>,
    }

    impl RawPeer {
        fn new(transport: Transport) -> Self {
            Self {
                codec: EnvelopeCodec::new(
                    Keypair::generate(),
                    DEFAULT_MAX_MESSAGE_SIZE,
                    DEFAULT_MAX_CLOCK_SKEW,
                ),
                transport,
                remote_key: None,
            }
        }

        pub(crate) async fn read_intro(&mut self) -> Envelope {
            let frame = self.transport.recv().await.unwrap();
            let envelope = self.codec.unpack(&frame).unwrap();
            if let Payload::Request(Request::Introduce(intro)) = &envelope.p {
                self.codec.set_remote_box_key(intro.pk);
                self.remote_key = Some(intro.pk);
            }
            envelope
        }

        pub(crate) async fn send_intro(&self) {
            let intro = Introduction {
                pk: self.codec.local_box_key(),
                addrs: vec![],
            };
            let frame = self
                .codec
                .pack_request(Request::Introduce(intro), 0)
                .unwrap();
            self.transport.send(frame).await.unwrap();
        }
    }

    pub(crate) fn spawn_against_raw(config: SessionConfig) -> (PeerSession, mpsc::Receiver<SessionEvent>, RawPeer) {
        let (host, _) = TestHost::new(Keypair::generate());
        let (ta, tb) = Transport::pair(16);
        let (tx, events) = mpsc::channel(64);
        let session = PeerSession::spawn(host, ta, None, config, tx);
        (session, events, RawPeer::new(tb))
    }

    #[tokio::test]
    async fn sessions_introduce_and_ping() {
        let c = connected(SessionConfig::default()).await;
        assert_eq!(c.a.remote_identity(), Some(c.b_kp.identity()));
        assert_eq!(c.b.remote_identity(), Some(c.a_kp.identity()));
        assert!(c.a.ping().await);
        assert!(c.b.ping().await);
    }

    #[tokio::test]
    async fn introduction_is_counter_zero_in_clear() {
        let (_session, _events, mut raw) = spawn_against_raw(SessionConfig::default());
        let frame = raw.transport.recv().await.unwrap();
        let decoded: Frame = deserialize_bounded(&frame).unwrap();
        assert!(matches!(decoded, Frame::Clear(_)));
        let envelope = raw.codec.unpack(&frame).unwrap();
        assert_eq!(envelope.m, MessageType::Introduce);
        assert_eq!(envelope.c, 0);
    }

    #[tokio::test]
    async fn concurrent_requests_are_correlated() {
        let c = connected(SessionConfig::default()).await;
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let a = c.a.clone();
            handles.push(tokio::spawn(async move {
                a.find_node(Identity::from_bytes([i; 32]), 4).await
            }));
        }
        for handle in handles {
            let nodes = handle.await.unwrap().unwrap();
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].identity, c.b_kp.identity());
        }
    }

    #[tokio::test]
    async fn expected_identity_mismatch_is_malicious() {
        let (host_a, _) = TestHost::new(Keypair::generate());
        let (host_b, _) = TestHost::new(Keypair::generate());
        let (ta, tb) = Transport::pair(16);
        let (a_tx, mut a_events) = mpsc::channel(64);
        let (b_tx, _b_events) = mpsc::channel(64);

        let wrong = Keypair::generate().identity();
        let a = PeerSession::spawn(host_a, ta, Some(wrong), SessionConfig::default(), a_tx);
        let _b = PeerSession::spawn(host_b, tb, None, SessionConfig::default(), b_tx);

        assert_eq!(a.wait_active().await.unwrap_err(), Fault::IdentityMismatch);
        assert_eq!(next_fault(&mut a_events).await, Fault::IdentityMismatch);
        assert_eq!(a.state(), SessionState::Destroyed);
    }

    #[tokio::test]
    async fn unmatched_reply_destroys_session() {
        let (session, mut events, mut raw) = spawn_against_raw(SessionConfig::default());
        raw.read_intro().await;
        raw.send_intro().await;
        session.wait_active().await.unwrap();

        let frame = raw.codec.pack_reply(Response::Ack, 999).unwrap();
        raw.transport.send(frame).await.unwrap();

        assert_eq!(next_fault(&mut events).await, Fault::UnmatchedReply);
        session.closed().await;
        assert!(!session.ping().await);
        assert_eq!(session.request(Request::Ping).await.unwrap_err(), Fault::SessionNotActive);
    }

    #[tokio::test]
    async fn request_before_introduction_is_protocol_fault() {
        let (session, mut events, mut raw) = spawn_against_raw(SessionConfig::default());
        raw.read_intro().await;
        let frame = raw.codec.pack_request(Request::Ping, 1).unwrap();
        raw.transport.send(frame).await.unwrap();

        assert_eq!(next_fault(&mut events).await, Fault::NotIntroduced);
        assert!(session.wait_active().await.is_err());
    }

    #[tokio::test]
    async fn double_introduction_is_malicious() {
        let (session, mut events, mut raw) = spawn_against_raw(SessionConfig::default());
        raw.read_intro().await;
        raw.send_intro().await;
        session.wait_active().await.unwrap();

        let intro = Introduction {
            pk: raw.codec.local_box_key(),
            addrs: vec![],
        };
        let frame = raw.codec.pack_request(Request::Introduce(intro), 0).unwrap();
        raw.transport.send(frame).await.unwrap();

        let fault = next_fault(&mut events).await;
        assert_eq!(fault, Fault::DoubleIntroduction);
        assert!(fault.is_malicious());
    }

    #[tokio::test]
    async fn envelope_from_other_author_after_introduction() {
        let (session, mut events, mut raw) = spawn_against_raw(SessionConfig::default());
        raw.read_intro().await;
        raw.send_intro().await;
        session.wait_active().await.unwrap();

        let impostor = Keypair::generate();
        let envelope = Envelope {
            v: crate::messages::PROTOCOL_VERSION,
            a: impostor.identity(),
            m: MessageType::Ping,
            p: Payload::Request(Request::Ping),
            t: crate::identity::now_ms(),
            c: 1,
        };
        let bytes = encode(&envelope).unwrap();
        let s = crate::crypto::sign_with_domain(
            &impostor,
            crate::crypto::ENVELOPE_SIGNATURE_DOMAIN,
            &bytes,
        );
        let signed = encode(&crate::messages::SignedEnvelope { m: bytes, s }).unwrap();
        let remote_key = raw.remote_key.unwrap();
        let frame = encode(&Frame::Sealed(seal(&remote_key, &signed).unwrap())).unwrap();
        raw.transport.send(frame).await.unwrap();

        assert_eq!(next_fault(&mut events).await, Fault::IdentityMismatch);
    }

    #[tokio::test]
    async fn reply_timeout_destroys_session() {
        let (session, mut events, mut raw) = spawn_against_raw(fast_config());
        raw.read_intro().await;
        raw.send_intro().await;
        session.wait_active().await.unwrap();

        assert_eq!(session.request(Request::Ping).await.unwrap_err(), Fault::ReplyTimeout);
        assert_eq!(next_fault(&mut events).await, Fault::ReplyTimeout);
        session.closed().await;
    }

    #[tokio::test]
    async fn introduction_timeout_destroys_session() {
        let (session, mut events, _raw) = spawn_against_raw(fast_config());
        assert_eq!(next_fault(&mut events).await, Fault::IntroductionTimeout);
        assert_eq!(session.wait_active().await.unwrap_err(), Fault::IntroductionTimeout);
    }

    #[tokio::test]
    async fn transport_close_fails_pending_and_destroys() {
        let (session, mut events, mut raw) = spawn_against_raw(SessionConfig::default());
        raw.read_intro().await;
        raw.send_intro().await;
        session.wait_active().await.unwrap();

        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.request(Request::Ping).await })
        };
        let _ = raw.transport.recv().await;
        drop(raw);

        assert_eq!(pending.await.unwrap().unwrap_err(), Fault::TransportClosed);
        loop {
            match events.recv().await {
                Some(SessionEvent::Destroyed { reason, .. }) => {
                    assert_eq!(reason, DestroyReason::Closed);
                    break;
                }
                Some(_) => continue,
                None => panic!("no destroyed event"),
            }
        }
    }

    #[tokio::test]
    async fn store_then_find_value_author() {
        let mut c = connected(SessionConfig::default()).await;
        let key = [5u8; 32];
        let record = SignedRecord::sign(&c.a_kp, key, b"v".to_vec()).unwrap();
        let nodes = c.a.store(record.clone(), 20).await.unwrap();
        assert_eq!(nodes.len(), 1);

        let (_, found) = c.a.find_value_author(key, c.a_kp.identity(), 20).await.unwrap();
        assert_eq!(found, Some(record));

        let (_, missing) = c.a.find_value_author(key, c.b_kp.identity(), 20).await.unwrap();
        assert!(missing.is_none());
        assert!(c.b_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn store_under_responder_id_is_delivered() {
        let mut c = connected(SessionConfig::default()).await;
        let key = *c.b_kp.identity().as_bytes();
        let record = SignedRecord::sign(&c.a_kp, key, b"hello b".to_vec()).unwrap();
        c.a.store(record.clone(), 20).await.unwrap();
        assert_eq!(c.b_inbox.recv().await.unwrap(), record);

        let (records, next) = c.b.receive_messages(c.b_kp.identity(), 0).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn receive_messages_pages_requester_records() {
        let config = SessionConfig {
            message_page_size: 2,
            ..SessionConfig::default()
        };
        let c = connected(config).await;
        let a_key = *c.a_kp.identity().as_bytes();
        let now = crate::identity::now_ms();
        for ts in 1..=3u64 {
            let sender = Keypair::generate();
            let record = SignedRecord::sign_at(&sender, a_key, vec![ts as u8], now + ts).unwrap();
            c.a.store(record, 20).await.unwrap();
        }

        let (first, next) = c.a.receive_messages(c.a_kp.identity(), 0).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(next, now + 2);
        let (rest, next) = c.a.receive_messages(c.a_kp.identity(), next).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(next, 0);
    }

    #[tokio::test]
    async fn large_values_are_paged_one_per_reply() {
        let c = connected(SessionConfig::default()).await;
        let key = [9u8; 32];
        let now = crate::identity::now_ms();
        for ts in 1..=2u64 {
            let author = Keypair::generate();
            let record = SignedRecord::sign_at(&author, key, vec![ts as u8; 600 * 1024], now + ts).unwrap();
            c.a.store(record, 20).await.unwrap();
        }

        let first = c.a.find_value(key, 20, 0).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.next, now + 1);
        let second = c.a.find_value(key, 20, first.next).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].value()[0], 2);
        assert_eq!(second.next, 0);
        assert!(c.a.is_active() && c.b.is_active());
    }

    #[tokio::test]
    async fn largest_value_round_trips() {
        let c = connected(SessionConfig::default()).await;
        let key = [8u8; 32];
        let record = SignedRecord::sign(&c.a_kp, key, vec![7u8; MAX_VALUE_SIZE]).unwrap();
        c.a.store(record, 20).await.unwrap();

        let (_, found) = c.a.find_value_author(key, c.a_kp.identity(), 20).await.unwrap();
        assert_eq!(found.unwrap().value().len(), MAX_VALUE_SIZE);
        assert!(c.a.is_active() && c.b.is_active());
    }

    #[tokio::test]
    async fn page_skips_records_larger_than_the_budget() {
        let storage = MemoryStorage::new();
        let key = [6u8; 32];
        let now = crate::identity::now_ms();
        let big = SignedRecord::sign_at(&Keypair::generate(), key, vec![0u8; 4096], now + 1).unwrap();
        let small = SignedRecord::sign_at(&Keypair::generate(), key, b"s".to_vec(), now + 2).unwrap();
        storage.store_record(big).await.unwrap();
        storage.store_record(small).await.unwrap();

        let (records, next) = page(&storage, &key, 0, 16, 1024).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value(), b"s");
        assert_eq!(next, 0);

        let (records, next) = page(&storage, &key, 0, 1, 1024).await;
        assert!(records.is_empty());
        assert_eq!(next, now + 1, "cursor moves past a record that can never fit");
    }

    #[test]
    fn contacts_are_cut_to_budget() {
        let contacts: Vec<Contact> = (0..50)
            .map(|_| Contact::new(Keypair::generate().identity(), vec!["x".repeat(200); 8]))
            .collect();
        let fitted = fit_contacts(contacts.clone(), 16 * 1024);
        assert!(!fitted.is_empty() && fitted.len() < contacts.len());
        assert!(encoded_len(&fitted) <= 16 * 1024);
    }

    #[tokio::test]
    async fn forged_store_faults_the_sender() {
        let mut c = connected(SessionConfig::default()).await;
        let mut record = SignedRecord::sign(&c.a_kp, [1u8; 32], b"v".to_vec()).unwrap();
        record.entry.value = b"forged".to_vec();

        assert!(c.a.store(record, 20).await.is_err());
        assert_eq!(next_fault(&mut c.b_events).await, Fault::ForgedRecord);
        c.a.closed().await;
    }

    #[tokio::test]
    async fn user_id_claims_first_wins() {
        let c = connected(SessionConfig::default()).await;
        let claim = UserIdClaim::sign(&c.a_kp, "alice").unwrap();
        assert!(c.a.set_user_id(claim.clone(), 20).await.unwrap().is_some());

        let rival = {
            let mut fresh = UserIdClaim::sign(&c.b_kp, "alice").unwrap();
            while fresh.timestamp <= claim.timestamp {
                tokio::time::sleep(Duration::from_millis(2)).await;
                fresh = UserIdClaim::sign(&c.b_kp, "alice").unwrap();
            }
            fresh
        };
        assert!(c.a.set_user_id(rival, 20).await.unwrap().is_none());

        let (_, found) = c.a.get_user_id(claim.user_hash, 20).await.unwrap();
        assert_eq!(found.map(|c| c.author), Some(c.a_kp.identity()));
    }

    #[tokio::test]
    async fn forged_claim_faults_the_sender() {
        let mut c = connected(SessionConfig::default()).await;
        let mut claim = UserIdClaim::sign(&c.a_kp, "alice").unwrap();
        claim.author = c.b_kp.identity();
        assert!(c.a.set_user_id(claim, 20).await.is_err());
        assert_eq!(next_fault(&mut c.b_events).await, Fault::ForgedClaim);
    }

    #[tokio::test]
    async fn graceful_shutdown_destroys_both_sides() {
        let c = connected(SessionConfig::default()).await;
        c.a.shutdown().await;
        assert_eq!(c.a.destroy_reason(), Some(DestroyReason::LocalShutdown));
        c.b.closed().await;
        assert_eq!(c.b.destroy_reason(), Some(DestroyReason::RemoteShutdown));
    }

    #[tokio::test]
    async fn bilateral_release_when_neither_side_keeps_the_other() {
        let config = SessionConfig {
            bilateral_add: true,
            ..SessionConfig::default()
        };
        let c = connected(config).await;
        assert!(!c.a.set_added(false).await.unwrap());
        c.a.closed().await;
        c.b.closed().await;
        assert_eq!(c.b.destroy_reason(), Some(DestroyReason::Released));
    }

    #[tokio::test]
    async fn bilateral_add_keeps_session_when_one_side_adds() {
        let config = SessionConfig {
            bilateral_add: true,
            ..SessionConfig::default()
        };
        let c = connected(config).await;
        assert!(!c.a.set_added(true).await.unwrap());
        assert!(c.b.set_added(false).await.unwrap());
        assert!(c.a.ping().await);
    }
}
