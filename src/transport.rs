//! # Transport Byte Pipes
//!
//! A [`Transport`] is a duplex channel of whole frames. Closing is signalled by
//! the inbound side returning `None`; dropping a transport closes it for the
//! remote end.
//!
//! | Adapter | Use |
//! |---------|-----|
//! | [`Transport::pair`] | In-process pair, unit tests |
//! | [`Transport::from_tcp`] | u32 big-endian length-prefixed TCP stream |
//! | [`MemoryNetwork`] | Simulated network of listeners and offers |
//!
//! A [`Connector`] opens transports: by dialing an address, or through an
//! offer/answer exchange carried over the signaling relay when the target
//! has no reachable address.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

/// Frames buffered in each direction before senders wait.
pub const FRAME_CHANNEL_CAPACITY: usize = 64;

/// Time a TCP offer waits for the target to connect back.
const OFFER_ACCEPT_TIMEOUT: Duration = Duration::from_secs(15);

/// Duplex frame channel to one remote endpoint.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: mpsc::Receiver<Vec<u8>>,
    remote_addr: Option<String>,
}

impl Transport {
    pub fn new(
        outbound: mpsc::Sender<Vec<u8>>,
        inbound: mpsc::Receiver<Vec<u8>>,
        remote_addr: Option<String>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            remote_addr,
        }
    }

    /// Two connected in-memory endpoints.
    pub fn pair(capacity: usize) -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (Transport::new(a_tx, b_rx, None), Transport::new(b_tx, a_rx, None))
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| anyhow::anyhow!("transport closed"))
    }

    /// Next frame, or `None` once the remote end is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    pub(crate) fn into_parts(self) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
        (self.outbound, self.inbound)
    }

    /// Wrap a TCP stream with u32 big-endian length framing.
    ///
    /// Frames longer than `max_frame` are rejected before their body is read
    /// and close the transport.
    pub fn from_tcp(stream: TcpStream, max_frame: usize) -> Transport {
        let remote_addr = stream.peer_addr().ok().map(|a| a.to_string());
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(FRAME_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(FRAME_CHANNEL_CAPACITY);

        let peer = remote_addr.clone().unwrap_or_default();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let len = frame.len() as u32;
                if let Err(e) = writer.write_all(&len.to_be_bytes()).await {
                    debug!(peer = %peer, error = ?e, "tcp write failed");
                    break;
                }
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(peer = %peer, error = ?e, "tcp write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let peer = remote_addr.clone().unwrap_or_default();
        tokio::spawn(async move {
            loop {
                let mut len_buf = [0u8; 4];
                tokio::select! {
                    _ = in_tx.closed() => break,
                    res = reader.read_exact(&mut len_buf) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
                let len = u32::from_be_bytes(len_buf) as usize;
                if len > max_frame {
                    warn!(peer = %peer, size = len, max = max_frame, "peer sent oversized frame");
                    break;
                }
                let mut frame = vec![0u8; len];
                if reader.read_exact(&mut frame).await.is_err() {
                    break;
                }
                trace!(peer = %peer, size = len, "tcp frame received");
                if in_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Transport::new(out_tx, in_rx, remote_addr)
    }
}

/// Identifies an offer created by the local connector.
pub type OfferId = u64;

/// Opens transports to remote nodes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to a listen address announced by a peer.
    async fn dial(&self, addr: &str) -> Result<Transport>;

    /// Initiator side: produce an offer to be relayed to the target.
    async fn create_offer(&self) -> Result<(OfferId, Vec<u8>)>;

    /// Initiator side: finish the connection with the target's answer.
    async fn complete_offer(&self, offer_id: OfferId, answer: &[u8]) -> Result<Transport>;

    /// Target side: accept a relayed offer, returning the answer and the transport.
    async fn accept_offer(&self, offer: &[u8]) -> Result<(Vec<u8>, Transport)>;

    /// Initiator side: release an offer that will never be answered.
    async fn cancel_offer(&self, _offer_id: OfferId) {}
}

// ============================================================================
// TCP Connector
// ============================================================================

/// TCP connector.
///
/// Offers are connection reversals: the initiator binds an ephemeral listener
/// and ships its address as the offer, the target dials it and answers with
/// the offer id.
pub struct TcpConnector {
    bind_ip: IpAddr,
    max_frame: usize,
    next_offer: AtomicU64,
    offers: Mutex<HashMap<OfferId, TcpListener>>,
}

impl TcpConnector {
    pub fn new(bind_ip: IpAddr, max_frame: usize) -> Self {
        Self {
            bind_ip,
            max_frame,
            next_offer: AtomicU64::new(1),
            offers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, addr: &str) -> Result<Transport> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream.set_nodelay(true).ok();
        Ok(Transport::from_tcp(stream, self.max_frame))
    }

    async fn create_offer(&self) -> Result<(OfferId, Vec<u8>)> {
        if self.bind_ip.is_unspecified() {
            bail!("offer needs a concrete bind address, not {}", self.bind_ip);
        }
        let listener = TcpListener::bind(SocketAddr::new(self.bind_ip, 0))
            .await
            .context("failed to bind offer listener")?;
        let addr = listener.local_addr()?;
        let id = self.next_offer.fetch_add(1, Ordering::Relaxed);

        let mut offer = id.to_be_bytes().to_vec();
        offer.extend_from_slice(addr.to_string().as_bytes());
        self.offers.lock().await.insert(id, listener);
        Ok((id, offer))
    }

    async fn complete_offer(&self, offer_id: OfferId, answer: &[u8]) -> Result<Transport> {
        let listener = self
            .offers
            .lock()
            .await
            .remove(&offer_id)
            .context("unknown offer")?;
        if answer != offer_id.to_be_bytes() {
            bail!("answer does not match offer");
        }
        let (stream, peer) = tokio::time::timeout(OFFER_ACCEPT_TIMEOUT, listener.accept())
            .await
            .context("offer was not connected in time")??;
        debug!(offer = offer_id, peer = %peer, "offer connected");
        stream.set_nodelay(true).ok();
        // Whoever connected is checked against the target by the session's
        // introduction, not here.
        Ok(Transport::from_tcp(stream, self.max_frame).with_remote_addr(peer.to_string()))
    }

    async fn cancel_offer(&self, offer_id: OfferId) {
        self.offers.lock().await.remove(&offer_id);
    }

    async fn accept_offer(&self, offer: &[u8]) -> Result<(Vec<u8>, Transport)> {
        if offer.len() < 8 {
            bail!("offer too short");
        }
        let (id, addr) = offer.split_at(8);
        let addr = std::str::from_utf8(addr).context("offer address is not utf-8")?;
        let addr = offer_addr(addr)?;
        debug!(addr = %addr, "dialing relayed offer");
        let transport = self.dial(&addr.to_string()).await?;
        Ok((id.to_vec(), transport))
    }
}

/// Parse the address carried by a relayed TCP offer.
///
/// Only a literal socket address is accepted, never a hostname, and never one
/// that cannot name a single listening peer.
fn offer_addr(addr: &str) -> Result<SocketAddr> {
    let parsed: SocketAddr = addr
        .parse()
        .with_context(|| format!("offer address {addr:?} is not a socket address"))?;
    let ip = parsed.ip();
    let broadcast = matches!(ip, IpAddr::V4(v4) if v4.is_broadcast());
    if parsed.port() == 0 || ip.is_unspecified() || ip.is_multicast() || broadcast {
        warn!(addr = %parsed, "rejecting relayed offer address");
        bail!("offer address {parsed} cannot be dialed");
    }
    Ok(parsed)
}

// ============================================================================
// In-Process Network
// ============================================================================

#[derive(Default)]
struct NetworkInner {
    listeners: HashMap<String, mpsc::Sender<Transport>>,
    offers: HashMap<OfferId, Transport>,
    next_offer: OfferId,
}

/// In-process network of listeners, used to run many nodes in one process.
///
/// A node that never calls [`MemoryNetwork::listen`] behaves like a NAT-bound
/// peer: it can dial out and accept relayed offers but cannot be dialed.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listen address; inbound transports arrive on the receiver.
    pub async fn listen(&self, addr: &str) -> Result<mpsc::Receiver<Transport>> {
        let mut inner = self.inner.lock().await;
        if inner.listeners.contains_key(addr) {
            bail!("address {addr} already in use");
        }
        let (tx, rx) = mpsc::channel(16);
        inner.listeners.insert(addr.to_string(), tx);
        Ok(rx)
    }

    /// Remove a listener; later dials to `addr` fail.
    pub async fn unlisten(&self, addr: &str) {
        self.inner.lock().await.listeners.remove(addr);
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            pending: Mutex::new(HashMap::new()),
        }
    }
}

/// [`Connector`] over a [`MemoryNetwork`].
pub struct MemoryConnector {
    network: MemoryNetwork,
    pending: Mutex<HashMap<OfferId, Transport>>,
}

impl MemoryConnector {
    /// Offers created and neither completed nor cancelled.
    pub async fn pending_offers(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn dial(&self, addr: &str) -> Result<Transport> {
        let listener = self
            .network
            .inner
            .lock()
            .await
            .listeners
            .get(addr)
            .cloned()
            .with_context(|| format!("connection refused: {addr}"))?;
        let (local, remote) = Transport::pair(FRAME_CHANNEL_CAPACITY);
        listener
            .send(remote)
            .await
            .map_err(|_| anyhow::anyhow!("connection refused: {addr}"))?;
        Ok(local.with_remote_addr(addr))
    }

    async fn create_offer(&self) -> Result<(OfferId, Vec<u8>)> {
        let (local, remote) = Transport::pair(FRAME_CHANNEL_CAPACITY);
        let id = {
            let mut inner = self.network.inner.lock().await;
            inner.next_offer += 1;
            let id = inner.next_offer;
            inner.offers.insert(id, remote);
            id
        };
        self.pending.lock().await.insert(id, local);
        Ok((id, id.to_be_bytes().to_vec()))
    }

    async fn complete_offer(&self, offer_id: OfferId, answer: &[u8]) -> Result<Transport> {
        let transport = self
            .pending
            .lock()
            .await
            .remove(&offer_id)
            .context("unknown offer")?;
        if answer != offer_id.to_be_bytes() {
            bail!("answer does not match offer");
        }
        Ok(transport)
    }

    async fn cancel_offer(&self, offer_id: OfferId) {
        self.pending.lock().await.remove(&offer_id);
        self.network.inner.lock().await.offers.remove(&offer_id);
    }

    async fn accept_offer(&self, offer: &[u8]) -> Result<(Vec<u8>, Transport)> {
        let id_bytes: [u8; 8] = offer.try_into().map_err(|_| anyhow::anyhow!("malformed offer"))?;
        let id = OfferId::from_be_bytes(id_bytes);
        let transport = self
            .network
            .inner
            .lock()
            .await
            .offers
            .remove(&id)
            .context("offer expired or already accepted")?;
        Ok((id_bytes.to_vec(), transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_delivers_frames_both_ways() {
        let (mut a, mut b) = Transport::pair(4);
        a.send(b"ping".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping");
        b.send(b"pong".to_vec()).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (a, mut b) = Transport::pair(4);
        drop(a);
        assert!(b.recv().await.is_none());
        assert!(b.send(vec![1]).await.is_err());
    }

    #[tokio::test]
    async fn tcp_framing_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = TcpConnector::new("127.0.0.1".parse().unwrap(), 1024);

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Transport::from_tcp(stream, 1024)
        });
        let mut client = connector.dial(&addr).await.unwrap();
        let mut server = accept.await.unwrap();

        client.send(vec![7u8; 300]).await.unwrap();
        client.send(Vec::new()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), vec![7u8; 300]);
        assert_eq!(server.recv().await.unwrap(), Vec::<u8>::new());

        server.send(b"reply".to_vec()).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn tcp_rejects_oversized_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Transport::from_tcp(stream, 16)
        });
        let mut raw = TcpStream::connect(addr).await.unwrap();
        let mut server = accept.await.unwrap();

        raw.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();
        assert!(server.recv().await.is_none());
    }

    #[tokio::test]
    async fn tcp_offer_reversal() {
        let initiator = TcpConnector::new("127.0.0.1".parse().unwrap(), 1024);
        let target = TcpConnector::new("127.0.0.1".parse().unwrap(), 1024);

        let (offer_id, offer) = initiator.create_offer().await.unwrap();
        let (answer, mut target_side) = target.accept_offer(&offer).await.unwrap();
        let mut initiator_side = initiator.complete_offer(offer_id, &answer).await.unwrap();

        initiator_side.send(b"hi".to_vec()).await.unwrap();
        assert_eq!(target_side.recv().await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn tcp_offer_address_must_name_one_peer() {
        let target = TcpConnector::new("127.0.0.1".parse().unwrap(), 1024);
        let bad = [
            "0.0.0.0:4000",
            "224.0.0.1:4000",
            "255.255.255.255:4000",
            "127.0.0.1:0",
            "localhost:4000",
            "[::]:4000",
        ];
        for addr in bad {
            let mut offer = 1u64.to_be_bytes().to_vec();
            offer.extend_from_slice(addr.as_bytes());
            assert!(target.accept_offer(&offer).await.is_err(), "{addr} was dialed");
        }

        let wildcard = TcpConnector::new("0.0.0.0".parse().unwrap(), 1024);
        assert!(wildcard.create_offer().await.is_err());
    }

    #[tokio::test]
    async fn memory_network_dial_and_offer() {
        let network = MemoryNetwork::new();
        let mut incoming = network.listen("mem://a").await.unwrap();
        let connector = network.connector();

        let mut dialed = connector.dial("mem://a").await.unwrap();
        let mut accepted = incoming.recv().await.unwrap();
        dialed.send(b"x".to_vec()).await.unwrap();
        assert_eq!(accepted.recv().await.unwrap(), b"x");

        assert!(connector.dial("mem://nowhere").await.is_err());
        assert!(network.listen("mem://a").await.is_err());

        let other = network.connector();
        let (id, offer) = connector.create_offer().await.unwrap();
        let (answer, mut target_side) = other.accept_offer(&offer).await.unwrap();
        let mut initiator_side = connector.complete_offer(id, &answer).await.unwrap();
        target_side.send(b"y".to_vec()).await.unwrap();
        assert_eq!(initiator_side.recv().await.unwrap(), b"y");

        assert!(other.accept_offer(&offer).await.is_err());
    }
}
