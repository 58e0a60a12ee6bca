//! # High-Level Node API
//!
//! A [`Node`] owns the routing table and every peer session, and exposes the
//! DHT operations built on the iterative lookup.
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let node = Node::spawn(
//!     Keypair::generate(),
//!     NodeConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(network.connector()),
//! );
//! node.startup(&["seed:1".to_string()]).await?;
//!
//! let stored_on = node.put(key, b"value".to_vec()).await?;
//! let record = node.get_author(key, author).await?;
//! ```
//!
//! ## Actor Architecture
//!
//! - `Node`: public handle; serializes startup and shutdown with a lifecycle lock
//! - `NodeContext`: the capabilities sessions and lookups need (`SessionHost`)
//! - `NodeActor`: owns the `RoutingTable` and the session registry; all
//!   mutations arrive as commands or session lifecycle events
//!
//! ## Session Registry
//!
//! | Set | Contents |
//! |-----|----------|
//! | `connecting` | spawned, not yet introduced |
//! | `sessions` | active, remote held in the routing table |
//! | `detached` | active, remote not in the routing table (LRU bounded) |
//!
//! A routing entry exists exactly as long as its session is active. When a
//! bucket is full, every remote occupant is pinged and at most one dead
//! occupant is replaced.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::envelope::{DEFAULT_MAX_CLOCK_SKEW, DEFAULT_MAX_MESSAGE_SIZE};
use crate::identity::{Contact, Identity, Keypair, now_ms};
use crate::lookup::{
    DEFAULT_MAX_ROUNDS, DEFAULT_OVERSAMPLE, DEFAULT_PER_QUERY_TIMEOUT, LookupConfig, LookupOutcome,
    PeerResolver, iterative_lookup,
};
use crate::messages::{MAX_VALUE_SIZE, MESSAGE_OVERHEAD_RESERVE};
use crate::records::{Key, SignedRecord, UserIdClaim, normalize_user_id, user_id_hash};
use crate::relay::{self, RelayOutcome, SignedSignal};
use crate::routing::{
    Admission, BUCKET_STALE_THRESHOLD, DEFAULT_K, PendingAdmission, RoutingTable,
    random_id_for_bucket,
};
use crate::session::{
    DEFAULT_INTRODUCTION_TIMEOUT, DEFAULT_MESSAGE_PAGE_SIZE, DEFAULT_REPLY_TIMEOUT, PeerSession,
    SessionConfig, SessionEvent, SessionHost, SessionId,
};
use crate::storage::Storage;
use crate::transport::{Connector, Transport};

/// Default bound on active sessions kept outside the routing table.
pub const DEFAULT_DETACHED_SESSION_CAPACITY: usize = 256;

/// Default interval between stale-bucket refresh passes.
pub const DEFAULT_BUCKET_REFRESH_INTERVAL: Duration = BUCKET_STALE_THRESHOLD;

const NODE_COMMAND_CHANNEL_SIZE: usize = 128;
const SESSION_EVENT_CHANNEL_SIZE: usize = 256;
const INBOX_CHANNEL_SIZE: usize = 256;

/// SECURITY: Bounds how many pages one peer can make us fetch in a single operation.
const MAX_PAGES_PER_PEER: usize = 64;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Bucket capacity and lookup fan-out.
    pub k: usize,
    /// Candidate oversampling factor during lookups.
    pub oversample: usize,
    pub max_message_size: usize,
    /// Tolerated difference between envelope timestamps and local time.
    pub max_clock_skew: Duration,
    pub reply_timeout: Duration,
    pub introduction_timeout: Duration,
    /// Bound on resolving and querying one peer during a lookup.
    pub per_query_timeout: Duration,
    pub max_lookup_rounds: usize,
    /// Records served per page.
    pub message_page_size: usize,
    pub detached_session_capacity: usize,
    /// Release sessions neither side keeps in its routing table.
    pub bilateral_add: bool,
    pub bucket_refresh_interval: Duration,
    /// Addresses announced to peers. Empty for nodes only reachable by signaling.
    pub listen_addrs: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            oversample: DEFAULT_OVERSAMPLE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            introduction_timeout: DEFAULT_INTRODUCTION_TIMEOUT,
            per_query_timeout: DEFAULT_PER_QUERY_TIMEOUT,
            max_lookup_rounds: DEFAULT_MAX_ROUNDS,
            message_page_size: DEFAULT_MESSAGE_PAGE_SIZE,
            detached_session_capacity: DEFAULT_DETACHED_SESSION_CAPACITY,
            bilateral_add: false,
            bucket_refresh_interval: DEFAULT_BUCKET_REFRESH_INTERVAL,
            listen_addrs: Vec::new(),
        }
    }
}

impl NodeConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reply_timeout: self.reply_timeout,
            introduction_timeout: self.introduction_timeout,
            max_message_size: self.max_message_size,
            max_clock_skew: self.max_clock_skew,
            message_page_size: self.message_page_size,
            bilateral_add: self.bilateral_add,
        }
    }

    /// Largest value a record may carry and still fit one message under
    /// `max_message_size`.
    pub fn max_value_size(&self) -> usize {
        MAX_VALUE_SIZE.min(self.max_message_size.saturating_sub(MESSAGE_OVERHEAD_RESERVE))
    }

    fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            oversample: self.oversample,
            per_query_timeout: self.per_query_timeout,
            max_rounds: self.max_lookup_rounds,
        }
    }
}

/// A lookup participant: this node, served from local state, or a session.
#[derive(Clone, Debug)]
pub enum Peer {
    Local,
    Remote(PeerSession),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

fn ensure_running(state: Lifecycle) -> Result<()> {
    match state {
        Lifecycle::Running => Ok(()),
        Lifecycle::Idle => bail!("node has not been started"),
        Lifecycle::Stopped => bail!("node is shut down"),
    }
}

enum Command {
    Spawn {
        transport: Transport,
        expected: Option<Identity>,
        reply: oneshot::Sender<PeerSession>,
    },
    Closest {
        target: Identity,
        k: usize,
        reply: oneshot::Sender<Vec<Contact>>,
    },
    Seeds {
        target: Identity,
        width: usize,
        reply: oneshot::Sender<Vec<(Contact, Option<Peer>)>>,
    },
    SessionTo {
        id: Identity,
        reply: oneshot::Sender<Option<PeerSession>>,
    },
    PingResults {
        pending: PendingAdmission,
        results: Vec<(Identity, bool)>,
    },
    StaleBuckets {
        reply: oneshot::Sender<Vec<usize>>,
    },
    MarkBucketRefreshed(usize),
    RoutingContacts {
        reply: oneshot::Sender<Vec<Contact>>,
    },
    AllSessions {
        reply: oneshot::Sender<Vec<PeerSession>>,
    },
    Quit,
}

// ============================================================================
// Node Handle
// ============================================================================

pub struct Node {
    ctx: Arc<NodeContext>,
    cmd_tx: mpsc::Sender<Command>,
    lifecycle: RwLock<Lifecycle>,
    inbox: TakeOnce<SignedRecord>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Start the node actor. Call [`Node::startup`] before using the node.
    pub fn spawn(
        keypair: Keypair,
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        connector: Arc<dyn Connector>,
    ) -> Node {
        let (cmd_tx, cmd_rx) = mpsc::channel(NODE_COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_SIZE);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CHANNEL_SIZE);

        let local = Contact::new(keypair.identity(), config.listen_addrs.clone());
        let capacity = NonZeroUsize::new(config.detached_session_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let routing = RoutingTable::new(local, config.k);

        let ctx = Arc::new(NodeContext {
            keypair,
            config,
            storage,
            connector,
            cmd_tx: cmd_tx.downgrade(),
            inbox_tx,
        });

        let actor = NodeActor {
            ctx: ctx.clone(),
            routing,
            sessions: HashMap::new(),
            detached: LruCache::new(capacity),
            connecting: HashMap::new(),
            pinging: HashSet::new(),
            events_tx,
        };
        tokio::spawn(actor.run(cmd_rx, events_rx));

        Node {
            ctx,
            cmd_tx,
            lifecycle: RwLock::new(Lifecycle::Idle),
            inbox: Mutex::new(Some(inbox_rx)),
            refresh_task: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Identity {
        self.ctx.keypair.identity()
    }

    pub fn contact(&self) -> Contact {
        Contact::new(self.identity(), self.ctx.config.listen_addrs.clone())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    /// Dial the seeds, then look up our own id to populate the routing table.
    pub async fn startup(&self, seeds: &[String]) -> Result<()> {
        let mut lifecycle = self.lifecycle.write().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running => bail!("node already started"),
            Lifecycle::Stopped => bail!("node is shut down"),
        }

        let mut joined = 0usize;
        for addr in seeds {
            match self.ctx.dial(addr).await {
                Ok(contact) => {
                    debug!(seed = %addr, peer = %contact.identity.short(), "connected to seed");
                    joined += 1;
                }
                Err(e) => warn!(seed = %addr, error = %e, "failed to connect to seed"),
            }
        }
        if !seeds.is_empty() && joined == 0 {
            warn!(seeds = seeds.len(), "no seed reachable, starting isolated");
        }

        let own = self.identity();
        let found = self
            .ctx
            .find_node(own)
            .await
            .context("self lookup failed")?;

        *self.refresh_task.lock().await = Some(spawn_bucket_refresh(self.ctx.clone()));
        *lifecycle = Lifecycle::Running;
        info!(
            identity = %own.short(),
            seeds = joined,
            neighbours = found.len(),
            "node started"
        );
        Ok(())
    }

    /// Hand an inbound transport to a new session.
    pub async fn accept(&self, transport: Transport) -> Result<()> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx
            .spawn_session(transport, None)
            .await
            .context("node actor stopped")?;
        Ok(())
    }

    /// Dial `addr` and wait for the session to become active.
    pub async fn connect(&self, addr: &str) -> Result<Contact> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.dial(addr).await
    }

    /// Sign and store `value` under `key`; returns how many nodes stored it,
    /// this node included.
    pub async fn put(&self, key: Key, value: Vec<u8>) -> Result<usize> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.put(key, value).await
    }

    /// Newest record `author` stored under `key`.
    pub async fn get_author(&self, key: Key, author: Identity) -> Result<Option<SignedRecord>> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.get_author(key, author).await
    }

    /// Newest record per author under `key`, oldest first.
    pub async fn get(&self, key: Key) -> Result<Vec<SignedRecord>> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.get(key).await
    }

    pub async fn find_node(&self, target: Identity) -> Result<Vec<Contact>> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.find_node(target).await
    }

    /// Store `value` under the target's id, where the target will collect it.
    pub async fn send_message(&self, target: Identity, value: Vec<u8>) -> Result<usize> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.put(*target.as_bytes(), value).await
    }

    /// Records stored under our own id newer than `since`, oldest first.
    pub async fn receive_messages(&self, since: u64) -> Result<Vec<SignedRecord>> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.receive_messages(since).await
    }

    /// Claim `name`. `false` when another identity holds it.
    pub async fn set_user_id(&self, name: &str) -> Result<bool> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.set_user_id(name).await
    }

    pub async fn get_user_id(&self, name: &str) -> Result<Option<UserIdClaim>> {
        let lifecycle = self.lifecycle.read().await;
        ensure_running(*lifecycle)?;
        self.ctx.get_user_id(name).await
    }

    /// Records stored on this node under its own id, as they arrive.
    pub async fn messages(&self) -> Result<mpsc::Receiver<SignedRecord>> {
        self.inbox
            .lock()
            .await
            .take()
            .context("message receiver already taken")
    }

    /// Contacts currently in the routing table, this node included.
    pub async fn routing_contacts(&self) -> Vec<Contact> {
        self.ctx
            .request(|reply| Command::RoutingContacts { reply })
            .await
            .unwrap_or_default()
    }

    /// Shut down every session, then stop the actor.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        *lifecycle = Lifecycle::Stopped;

        if let Some(task) = self.refresh_task.lock().await.take() {
            task.abort();
        }

        let sessions = self
            .ctx
            .request(|reply| Command::AllSessions { reply })
            .await
            .unwrap_or_default();
        let count = sessions.len();
        let mut join_set = JoinSet::new();
        for session in sessions {
            join_set.spawn(async move { session.shutdown().await });
        }
        while join_set.join_next().await.is_some() {}

        let _ = self.cmd_tx.send(Command::Quit).await;
        info!(identity = %self.identity().short(), sessions = count, "node shut down");
    }
}

fn spawn_bucket_refresh(ctx: Arc<NodeContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ctx.config.bucket_refresh_interval);
        interval.tick().await;
        loop {
            interval.tick().await;

            let Some(stale) = ctx.request(|reply| Command::StaleBuckets { reply }).await else {
                break;
            };
            if stale.is_empty() {
                continue;
            }
            debug!(count = stale.len(), "refreshing stale routing buckets");

            let local = ctx.keypair.identity();
            for bucket_idx in stale {
                let target = random_id_for_bucket(&local, bucket_idx);
                if let Err(e) = ctx.find_node(target).await {
                    debug!(bucket = bucket_idx, error = ?e, "bucket refresh lookup failed");
                }
                ctx.send(Command::MarkBucketRefreshed(bucket_idx)).await;
            }
        }
    })
}

// ============================================================================
// Node Context
// ============================================================================

struct NodeContext {
    keypair: Keypair,
    config: NodeConfig,
    storage: Arc<dyn Storage>,
    connector: Arc<dyn Connector>,
    cmd_tx: mpsc::WeakSender<Command>,
    inbox_tx: mpsc::Sender<SignedRecord>,
}

impl NodeContext {
    fn local_id(&self) -> Identity {
        self.keypair.identity()
    }

    async fn send(&self, cmd: Command) {
        if let Some(tx) = self.cmd_tx.upgrade() {
            let _ = tx.send(cmd).await;
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command + Send,
    ) -> Option<T> {
        let tx = self.cmd_tx.upgrade()?;
        let (reply, rx) = oneshot::channel();
        tx.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    async fn spawn_session(
        &self,
        transport: Transport,
        expected: Option<Identity>,
    ) -> Option<PeerSession> {
        self.request(|reply| Command::Spawn {
            transport,
            expected,
            reply,
        })
        .await
    }

    /// Spawn a session and wait for the introduction.
    async fn connect(&self, transport: Transport, expected: Option<Identity>) -> Result<PeerSession> {
        let session = self
            .spawn_session(transport, expected)
            .await
            .context("node actor stopped")?;
        session
            .wait_active()
            .await
            .context("session failed before introduction")?;
        Ok(session)
    }

    async fn dial(&self, addr: &str) -> Result<Contact> {
        let transport = self.connector.dial(addr).await?;
        let session = self.connect(transport, None).await?;
        session
            .remote_contact()
            .context("session lost its remote contact")
    }

    /// Direct connection to one of `contact`'s announced addresses.
    async fn dial_contact(&self, contact: &Contact) -> Option<PeerSession> {
        for addr in &contact.addrs {
            let transport = match self.connector.dial(addr).await {
                Ok(transport) => transport,
                Err(e) => {
                    trace!(peer = %contact.identity.short(), addr = %addr, error = %e, "dial failed");
                    continue;
                }
            };
            match self.connect(transport, Some(contact.identity)).await {
                Ok(session) => return Some(session),
                Err(e) => debug!(peer = %contact.identity.short(), error = %e, "direct session failed"),
            }
        }
        None
    }

    /// Signaled connection to `target` through `relay`.
    async fn connect_via(&self, relay_session: &PeerSession, target: Identity) -> Option<PeerSession> {
        let outcome = relay::initiate(
            &self.keypair,
            relay_session,
            target,
            &self.connector,
            self.config.max_clock_skew,
        )
        .await;
        match outcome {
            Ok(RelayOutcome::Connected(transport)) => {
                match self.connect(transport, Some(target)).await {
                    Ok(session) => Some(session),
                    Err(e) => {
                        debug!(peer = %target.short(), error = %e, "signaled session failed");
                        None
                    }
                }
            }
            Ok(RelayOutcome::RelayIsTarget) => Some(relay_session.clone()),
            Ok(RelayOutcome::NoRoute) => {
                trace!(peer = %target.short(), "relay has no route to target");
                None
            }
            Err(e) => {
                debug!(peer = %target.short(), error = %e, "signaling failed");
                None
            }
        }
    }

    async fn lookup<F, Fut>(self: &Arc<Self>, target: Identity, k: usize, op: F) -> Result<LookupOutcome>
    where
        F: Fn(Peer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Vec<Contact>>> + Send + 'static,
    {
        let config = self.config.lookup_config();
        let width = k.saturating_mul(config.oversample.max(1));
        let seeds = self
            .request(|reply| Command::Seeds {
                target,
                width,
                reply,
            })
            .await
            .context("node actor stopped")?;
        let resolver: Arc<dyn PeerResolver<Peer>> = Arc::new(NodeResolver { ctx: self.clone() });
        Ok(iterative_lookup(target, k, seeds, resolver, op, &config).await?)
    }

    fn is_plausible(&self, record: &SignedRecord) -> bool {
        let skew = u64::try_from(self.config.max_clock_skew.as_millis()).unwrap_or(u64::MAX);
        record.timestamp() < now_ms().saturating_add(skew)
    }

    /// Store locally, delivering records addressed to us.
    async fn store_local(&self, record: SignedRecord) -> bool {
        let addressed_to_us = record.key() == self.local_id().as_bytes();
        match self.storage.store_record(record.clone()).await {
            Ok(stored) => {
                if stored && addressed_to_us {
                    self.deliver(record).await;
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "local store failed");
                false
            }
        }
    }

    /// Every local record under `key` newer than `since`.
    async fn local_records(&self, key: &Key, since: u64) -> Vec<SignedRecord> {
        let limit = self.config.message_page_size.max(1);
        let mut out = Vec::new();
        let mut cursor = since;
        for _ in 0..MAX_PAGES_PER_PEER {
            let page = match self.storage.records_since(key, cursor, limit).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "local page failed");
                    break;
                }
            };
            let full = page.len() == limit;
            cursor = page.last().map(|r| r.timestamp()).unwrap_or(cursor);
            out.extend(page);
            if !full {
                break;
            }
        }
        out
    }

    // ------------------------------------------------------------------------
    // DHT operations
    // ------------------------------------------------------------------------

    async fn put(self: &Arc<Self>, key: Key, value: Vec<u8>) -> Result<usize> {
        let max = self.config.max_value_size();
        if value.len() > max {
            bail!("value of {} bytes exceeds {max}", value.len());
        }
        let record = SignedRecord::sign(&self.keypair, key, value).context("invalid record")?;
        let k = self.config.k;
        let target = Identity::from_bytes(key);
        let stored = Arc::new(AtomicUsize::new(0));

        let ctx = self.clone();
        let counter = stored.clone();
        self.lookup(target, k, move |peer| {
            let ctx = ctx.clone();
            let counter = counter.clone();
            let record = record.clone();
            async move {
                match peer {
                    Peer::Local => {
                        if ctx.store_local(record).await {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(ctx.closest(&target, k).await)
                    }
                    Peer::Remote(session) => match session.store(record, k).await {
                        Ok(nodes) => {
                            counter.fetch_add(1, Ordering::Relaxed);
                            Some(nodes)
                        }
                        Err(fault) => {
                            trace!(peer = ?session.remote_identity(), fault = %fault, "store failed");
                            Some(Vec::new())
                        }
                    },
                }
            }
        })
        .await?;

        let count = stored.load(Ordering::Relaxed);
        debug!(key = %hex::encode(&key[..8]), stored = count, "put completed");
        Ok(count)
    }

    async fn get_author(self: &Arc<Self>, key: Key, author: Identity) -> Result<Option<SignedRecord>> {
        let k = self.config.k;
        let target = Identity::from_bytes(key);
        let best: Arc<Mutex<Option<SignedRecord>>> = Arc::new(Mutex::new(None));

        let ctx = self.clone();
        let found = best.clone();
        self.lookup(target, k, move |peer| {
            let ctx = ctx.clone();
            let found = found.clone();
            async move {
                let (nodes, record) = match peer {
                    Peer::Local => {
                        let record = ctx
                            .storage
                            .record_by_author(&key, &author)
                            .await
                            .unwrap_or_else(|e| {
                                warn!(error = %e, "local lookup failed");
                                None
                            });
                        (ctx.closest(&target, k).await, record)
                    }
                    Peer::Remote(session) => {
                        match session.find_value_author(key, author, k).await {
                            Ok(found) => found,
                            Err(_) => return Some(Vec::new()),
                        }
                    }
                };
                if let Some(record) = record
                    && ctx.is_plausible(&record)
                {
                    let mut best = found.lock().await;
                    if best.as_ref().is_none_or(|current| record.is_newer_than(current)) {
                        *best = Some(record);
                    }
                }
                Some(nodes)
            }
        })
        .await?;

        Ok(best.lock().await.take())
    }

    async fn get(self: &Arc<Self>, key: Key) -> Result<Vec<SignedRecord>> {
        let k = self.config.k;
        let target = Identity::from_bytes(key);
        let newest: Arc<Mutex<HashMap<Identity, SignedRecord>>> = Arc::new(Mutex::new(HashMap::new()));

        let ctx = self.clone();
        let merged = newest.clone();
        self.lookup(target, k, move |peer| {
            let ctx = ctx.clone();
            let merged = merged.clone();
            async move {
                let (nodes, records) = match peer {
                    Peer::Local => (ctx.closest(&target, k).await, ctx.local_records(&key, 0).await),
                    Peer::Remote(session) => {
                        let mut nodes = Vec::new();
                        let mut records = Vec::new();
                        let mut since = 0;
                        for page_no in 0..MAX_PAGES_PER_PEER {
                            let Ok(page) = session.find_value(key, k, since).await else {
                                break;
                            };
                            if page_no == 0 {
                                nodes = page.nodes;
                            }
                            records.extend(page.records);
                            if page.next <= since {
                                break;
                            }
                            since = page.next;
                        }
                        (nodes, records)
                    }
                };
                let mut merged = merged.lock().await;
                for record in records {
                    if !ctx.is_plausible(&record) {
                        continue;
                    }
                    let author = record.author();
                    if merged.get(&author).is_none_or(|current| record.is_newer_than(current)) {
                        merged.insert(author, record);
                    }
                }
                Some(nodes)
            }
        })
        .await?;

        let mut records: Vec<SignedRecord> = newest.lock().await.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.timestamp());
        Ok(records)
    }

    async fn find_node(self: &Arc<Self>, target: Identity) -> Result<Vec<Contact>> {
        let k = self.config.k;
        let ctx = self.clone();
        let outcome = self
            .lookup(target, k, move |peer| {
                let ctx = ctx.clone();
                async move {
                    match peer {
                        Peer::Local => Some(ctx.closest(&target, k).await),
                        Peer::Remote(session) => Some(session.find_node(target, k).await.unwrap_or_default()),
                    }
                }
            })
            .await?;
        Ok(outcome.closest)
    }

    async fn receive_messages(self: &Arc<Self>, since: u64) -> Result<Vec<SignedRecord>> {
        let k = self.config.k;
        let own = self.local_id();
        let key = *own.as_bytes();
        let inbox: Arc<Mutex<HashMap<(Identity, u64), SignedRecord>>> = Arc::new(Mutex::new(HashMap::new()));

        let ctx = self.clone();
        let merged = inbox.clone();
        self.lookup(own, k, move |peer| {
            let ctx = ctx.clone();
            let merged = merged.clone();
            async move {
                let (nodes, records) = match peer {
                    Peer::Local => (ctx.closest(&own, k).await, ctx.local_records(&key, since).await),
                    Peer::Remote(session) => {
                        let nodes = session.find_node(own, k).await.unwrap_or_default();
                        let mut records = Vec::new();
                        let mut cursor = since;
                        for _ in 0..MAX_PAGES_PER_PEER {
                            let Ok((page, next)) = session.receive_messages(own, cursor).await else {
                                break;
                            };
                            records.extend(page);
                            if next <= cursor {
                                break;
                            }
                            cursor = next;
                        }
                        (nodes, records)
                    }
                };
                let mut merged = merged.lock().await;
                for record in records {
                    if record.timestamp() > since && ctx.is_plausible(&record) {
                        merged.insert((record.author(), record.timestamp()), record);
                    }
                }
                Some(nodes)
            }
        })
        .await?;

        let mut records: Vec<SignedRecord> = inbox.lock().await.drain().map(|(_, r)| r).collect();
        records.sort_by_key(|r| r.timestamp());
        Ok(records)
    }

    async fn set_user_id(self: &Arc<Self>, name: &str) -> Result<bool> {
        let claim = UserIdClaim::sign(&self.keypair, name).context("invalid user id")?;
        let k = self.config.k;
        let target = Identity::from_bytes(claim.user_hash);
        let taken = Arc::new(AtomicBool::new(false));

        let ctx = self.clone();
        let flag = taken.clone();
        self.lookup(target, k, move |peer| {
            let ctx = ctx.clone();
            let flag = flag.clone();
            let claim = claim.clone();
            async move {
                let accepted = match peer {
                    Peer::Local => match ctx.storage.set_user_id(claim).await {
                        Ok(true) => Some(ctx.closest(&target, k).await),
                        Ok(false) => None,
                        Err(e) => {
                            warn!(error = %e, "local user id store failed");
                            return Some(Vec::new());
                        }
                    },
                    Peer::Remote(session) => match session.set_user_id(claim, k).await {
                        Ok(accepted) => accepted,
                        Err(_) => return Some(Vec::new()),
                    },
                };
                if accepted.is_none() {
                    flag.store(true, Ordering::Relaxed);
                }
                accepted
            }
        })
        .await?;

        Ok(!taken.load(Ordering::Relaxed))
    }

    async fn get_user_id(self: &Arc<Self>, name: &str) -> Result<Option<UserIdClaim>> {
        let normalized = normalize_user_id(name).context("invalid user id")?;
        let user_hash = user_id_hash(&normalized);
        let k = self.config.k;
        let target = Identity::from_bytes(user_hash);
        let found: Arc<Mutex<Option<UserIdClaim>>> = Arc::new(Mutex::new(None));

        let ctx = self.clone();
        let slot = found.clone();
        self.lookup(target, k, move |peer| {
            let ctx = ctx.clone();
            let slot = slot.clone();
            async move {
                let (nodes, claim) = match peer {
                    Peer::Local => {
                        let claim = ctx.storage.get_user_id(&user_hash).await.unwrap_or_else(|e| {
                            warn!(error = %e, "local user id lookup failed");
                            None
                        });
                        (ctx.closest(&target, k).await, claim)
                    }
                    Peer::Remote(session) => match session.get_user_id(user_hash, k).await {
                        Ok(found) => found,
                        Err(_) => return Some(Vec::new()),
                    },
                };
                match claim {
                    Some(claim) => {
                        slot.lock().await.get_or_insert(claim);
                        None
                    }
                    None => Some(nodes),
                }
            }
        })
        .await?;

        Ok(found.lock().await.take())
    }
}

#[async_trait]
impl SessionHost for NodeContext {
    fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn listen_addrs(&self) -> Vec<String> {
        self.config.listen_addrs.clone()
    }

    fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    fn max_clock_skew(&self) -> Duration {
        self.config.max_clock_skew
    }

    async fn closest(&self, target: &Identity, k: usize) -> Vec<Contact> {
        let target = *target;
        self.request(|reply| Command::Closest { target, k, reply })
            .await
            .unwrap_or_default()
    }

    async fn deliver(&self, record: SignedRecord) {
        if self.inbox_tx.try_send(record).is_err() {
            debug!("inbox full or closed, dropping delivered record");
        }
    }

    async fn session_to(&self, id: &Identity) -> Option<PeerSession> {
        let id = *id;
        self.request(|reply| Command::SessionTo { id, reply })
            .await
            .flatten()
    }

    async fn accept_signal(&self, offer: &SignedSignal) -> Option<SignedSignal> {
        let (answer, transport) =
            match relay::answer_offer(&self.keypair, self.connector.as_ref(), offer).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    debug!(from = %offer.from.short(), error = %e, "failed to accept relayed offer");
                    return None;
                }
            };
        self.spawn_session(transport, Some(offer.from)).await?;
        Some(answer)
    }
}

struct NodeResolver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl PeerResolver<Peer> for NodeResolver {
    async fn resolve(&self, contact: &Contact, via: Option<&Peer>) -> Option<Peer> {
        if contact.is_local(&self.ctx.local_id()) {
            return Some(Peer::Local);
        }
        if let Some(session) = self.ctx.session_to(&contact.identity).await {
            return Some(Peer::Remote(session));
        }
        if let Some(session) = self.ctx.dial_contact(contact).await {
            return Some(Peer::Remote(session));
        }
        match via {
            Some(Peer::Remote(relay_session)) => self
                .ctx
                .connect_via(relay_session, contact.identity)
                .await
                .map(Peer::Remote),
            _ => None,
        }
    }
}

// ============================================================================
// Node Actor
// ============================================================================

struct NodeActor {
    ctx: Arc<NodeContext>,
    routing: RoutingTable,
    sessions: HashMap<Identity, PeerSession>,
    detached: LruCache<SessionId, PeerSession>,
    connecting: HashMap<SessionId, PeerSession>,
    /// Buckets with a ping round in flight.
    pinging: HashSet<usize>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Quit) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(event) = events_rx.recv() => self.on_event(event),
            }
        }
        debug!(identity = %self.routing.local_identity().short(), "node actor stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Spawn {
                transport,
                expected,
                reply,
            } => {
                let session = PeerSession::spawn(
                    self.ctx.clone(),
                    transport,
                    expected,
                    self.ctx.config.session_config(),
                    self.events_tx.clone(),
                );
                self.connecting.insert(session.id(), session.clone());
                let _ = reply.send(session);
            }
            Command::Closest { target, k, reply } => {
                let _ = reply.send(self.routing.closest(&target, k));
            }
            Command::Seeds {
                target,
                width,
                reply,
            } => {
                let local = self.routing.local_identity();
                let seeds = self
                    .routing
                    .closest(&target, width)
                    .into_iter()
                    .map(|contact| {
                        let peer = if contact.identity == local {
                            Some(Peer::Local)
                        } else {
                            self.session_for(&contact.identity).map(Peer::Remote)
                        };
                        (contact, peer)
                    })
                    .collect();
                let _ = reply.send(seeds);
            }
            Command::SessionTo { id, reply } => {
                let _ = reply.send(self.session_for(&id));
            }
            Command::PingResults { pending, results } => self.on_ping_results(pending, results),
            Command::StaleBuckets { reply } => {
                let threshold = self.ctx.config.bucket_refresh_interval;
                let _ = reply.send(self.routing.stale_bucket_indices(threshold));
            }
            Command::MarkBucketRefreshed(idx) => self.routing.mark_bucket_refreshed(idx),
            Command::RoutingContacts { reply } => {
                let local = self.routing.local_identity();
                let _ = reply.send(self.routing.closest(&local, self.routing.len()));
            }
            Command::AllSessions { reply } => {
                let mut all: Vec<PeerSession> = self.sessions.values().cloned().collect();
                all.extend(self.detached.iter().map(|(_, s)| s.clone()));
                all.extend(self.connecting.values().cloned());
                let _ = reply.send(all);
            }
            Command::Quit => {}
        }
    }

    fn session_for(&self, id: &Identity) -> Option<PeerSession> {
        if let Some(session) = self.sessions.get(id)
            && session.is_active()
        {
            return Some(session.clone());
        }
        self.detached
            .iter()
            .map(|(_, s)| s)
            .find(|s| s.remote_identity() == Some(*id) && s.is_active())
            .cloned()
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Active { session, contact } => {
                let Some(handle) = self.connecting.remove(&session) else {
                    trace!(session = %session, "activation for unknown session");
                    return;
                };
                self.register(handle, contact);
            }
            SessionEvent::Fault {
                session,
                remote,
                fault,
            } => {
                trace!(
                    session = %session,
                    peer = ?remote.map(|id| id.short()),
                    fault = %fault,
                    class = ?fault.class(),
                    "session faulted"
                );
            }
            SessionEvent::Destroyed {
                session, remote, ..
            } => {
                self.connecting.remove(&session);
                self.detached.pop(&session);
                let Some(id) = remote else {
                    return;
                };
                if self.sessions.get(&id).map(|s| s.id()) == Some(session) {
                    self.sessions.remove(&id);
                    self.routing.remove(&id);
                    debug!(peer = %id.short(), "contact removed from routing table");
                    self.promote_detached(&id);
                }
            }
        }
    }

    fn register(&mut self, handle: PeerSession, contact: Contact) {
        let id = contact.identity;
        if self
            .sessions
            .get(&id)
            .is_some_and(|existing| existing.id() != handle.id() && existing.is_active())
        {
            self.detach(handle);
            return;
        }
        match self.routing.admit(contact) {
            Admission::Inserted | Admission::Refreshed => {
                self.sessions.insert(id, handle.clone());
                self.announce_added(handle, true);
            }
            Admission::Full(pending) => {
                self.detach(handle);
                self.spawn_pings(pending);
            }
            Admission::Rejected => self.detach(handle),
        }
    }

    fn promote_detached(&mut self, id: &Identity) {
        let candidate = self
            .detached
            .iter()
            .find(|(_, s)| s.remote_identity() == Some(*id) && s.is_active())
            .map(|(sid, _)| *sid);
        if let Some(sid) = candidate
            && let Some(handle) = self.detached.pop(&sid)
            && let Some(contact) = handle.remote_contact()
        {
            self.register(handle, contact);
        }
    }

    fn detach(&mut self, handle: PeerSession) {
        self.announce_added(handle.clone(), false);
        let id = handle.id();
        if let Some((evicted_id, evicted)) = self.detached.push(id, handle)
            && evicted_id != id
        {
            debug!(session = %evicted_id, "detached session capacity reached, closing oldest");
            tokio::spawn(async move { evicted.shutdown().await });
        }
    }

    fn announce_added(&self, handle: PeerSession, added: bool) {
        if !self.ctx.config.bilateral_add {
            return;
        }
        tokio::spawn(async move {
            let _ = handle.set_added(added).await;
        });
    }

    fn spawn_pings(&mut self, pending: PendingAdmission) {
        if !self.pinging.insert(pending.bucket_index) {
            return;
        }
        let targets: Vec<(Identity, Option<PeerSession>)> = pending
            .occupants
            .iter()
            .map(|c| (c.identity, self.sessions.get(&c.identity).cloned()))
            .collect();
        let cmd_tx = self.ctx.cmd_tx.clone();

        tokio::spawn(async move {
            let mut join_set = JoinSet::new();
            for (id, session) in targets {
                join_set.spawn(async move {
                    let alive = match session {
                        Some(session) => session.ping().await,
                        None => false,
                    };
                    (id, alive)
                });
            }
            let mut results = Vec::with_capacity(pending.occupants.len());
            while let Some(joined) = join_set.join_next().await {
                if let Ok(result) = joined {
                    results.push(result);
                }
            }
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::PingResults { pending, results }).await;
            }
        });
    }

    fn on_ping_results(&mut self, pending: PendingAdmission, results: Vec<(Identity, bool)>) {
        self.pinging.remove(&pending.bucket_index);
        let candidate = pending.candidate.identity;
        let Some(evicted) = self.routing.apply_ping_results(pending, &results) else {
            return;
        };
        if let Some(session) = self.sessions.remove(&evicted) {
            tokio::spawn(async move { session.shutdown().await });
        }
        if self.routing.contains(&candidate) {
            let sid = self
                .detached
                .iter()
                .find(|(_, s)| s.remote_identity() == Some(candidate))
                .map(|(sid, _)| *sid);
            match sid.and_then(|sid| self.detached.pop(&sid)) {
                Some(handle) if handle.is_active() => {
                    self.sessions.insert(candidate, handle.clone());
                    self.announce_added(handle, true);
                }
                _ => {
                    self.routing.remove(&candidate);
                }
            }
        }
    }
}
