//! Signaling relay behaviour against a real relay node.
//!
//! The initiator and target here are bare sessions with scripted hosts, so
//! the test controls exactly what the target answers.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use common::{TestNetwork, TestNode, TEST_TIMEOUT};
use meshdht::{
    initiate, Connector, Contact, Fault, Identity, Keypair, MemoryStorage,
    PeerSession, RelayOutcome, SessionConfig, SessionEvent, SessionHost, SignalReply,
    SignedRecord, SignedSignal, Storage, DEFAULT_MAX_CLOCK_SKEW,
};

/// Host for a bare session. With `forge_with` set it answers every relayed
/// offer with a signature from that keypair instead of its own.
struct ScriptedHost {
    keypair: Keypair,
    storage: Arc<MemoryStorage>,
    forge_with: Option<Keypair>,
}

impl ScriptedHost {
    fn new(forge_with: Option<Keypair>) -> Arc<Self> {
        Arc::new(Self {
            keypair: Keypair::generate(),
            storage: Arc::new(MemoryStorage::new()),
            forge_with,
        })
    }
}

#[async_trait]
impl SessionHost for ScriptedHost {
    fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![]
    }

    fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    async fn closest(&self, _target: &Identity, _k: usize) -> Vec<Contact> {
        vec![Contact::unreachable(self.keypair.identity())]
    }

    async fn deliver(&self, _record: SignedRecord) {}

    async fn session_to(&self, _id: &Identity) -> Option<PeerSession> {
        None
    }

    async fn accept_signal(&self, offer: &SignedSignal) -> Option<SignedSignal> {
        self.forge_with
            .as_ref()
            .map(|forger| SignedSignal::sign(forger, offer.from, b"answer".to_vec()))
    }
}

struct BarePeer {
    host: Arc<ScriptedHost>,
    session: PeerSession,
    events: mpsc::Receiver<SessionEvent>,
    connector: Arc<dyn Connector>,
}

async fn bare_peer(net: &TestNetwork, relay: &TestNode, host: Arc<ScriptedHost>) -> BarePeer {
    let connector: Arc<dyn Connector> = Arc::new(net.network.connector());
    let addr = relay.addr.as_deref().expect("relay must listen");
    let transport = connector.dial(addr).await.expect("dial failed");
    let (events_tx, events) = mpsc::channel(64);
    let session = PeerSession::spawn(
        host.clone(),
        transport,
        Some(relay.node.identity()),
        SessionConfig::default(),
        events_tx,
    );
    session.wait_active().await.expect("introduction failed");
    BarePeer {
        host,
        session,
        events,
        connector,
    }
}

/// Retry while the relay has not registered the target yet.
async fn initiate_until_routed(peer: &BarePeer, target: Identity) -> anyhow::Result<RelayOutcome> {
    timeout(TEST_TIMEOUT, async {
        loop {
            match initiate(
                &peer.host.keypair,
                &peer.session,
                target,
                &peer.connector,
                DEFAULT_MAX_CLOCK_SKEW,
            )
            .await
            {
                Ok(RelayOutcome::NoRoute) => sleep(Duration::from_millis(20)).await,
                other => return other,
            }
        }
    })
    .await
    .expect("relay never routed the signal")
}

async fn next_fault(events: &mut mpsc::Receiver<SessionEvent>) -> Fault {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(SessionEvent::Fault { fault, .. }) => return fault,
                Some(_) => continue,
                None => panic!("event stream ended without a fault"),
            }
        }
    })
    .await
    .expect("no fault reported")
}

#[tokio::test]
async fn forged_answer_destroys_the_relay_session() {
    let net = TestNetwork::new();
    let relay = net.listening(&[]).await;
    let target = bare_peer(&net, &relay, ScriptedHost::new(Some(Keypair::generate()))).await;
    let mut initiator = bare_peer(&net, &relay, ScriptedHost::new(None)).await;

    let result = initiate_until_routed(&initiator, target.host.keypair.identity()).await;
    assert!(result.is_err(), "forged answer must not yield a connection");

    let fault = next_fault(&mut initiator.events).await;
    assert_eq!(fault, Fault::ForgedSignalAnswer);
    assert!(fault.is_malicious());
    timeout(TEST_TIMEOUT, initiator.session.closed())
        .await
        .expect("relay session still open");
    assert!(target.session.is_active(), "only the relay session is destroyed");

    relay.shutdown().await;
}

#[tokio::test]
async fn declining_target_yields_no_route() {
    let net = TestNetwork::new();
    let relay = net.listening(&[]).await;
    let target = bare_peer(&net, &relay, ScriptedHost::new(None)).await;
    let initiator = bare_peer(&net, &relay, ScriptedHost::new(None)).await;

    // Wait for the relay to know the target, then expect a declined signal.
    timeout(TEST_TIMEOUT, async {
        while !relay
            .node
            .routing_contacts()
            .await
            .iter()
            .any(|c| c.identity == target.host.keypair.identity())
        {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("relay never registered the target");

    let outcome = initiate(
        &initiator.host.keypair,
        &initiator.session,
        target.host.keypair.identity(),
        &initiator.connector,
        DEFAULT_MAX_CLOCK_SKEW,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, RelayOutcome::NoRoute));
    assert!(initiator.session.is_active());

    relay.shutdown().await;
}

#[tokio::test]
async fn unknown_target_yields_no_route() {
    let net = TestNetwork::new();
    let relay = net.listening(&[]).await;
    let initiator = bare_peer(&net, &relay, ScriptedHost::new(None)).await;

    let stranger = Keypair::generate().identity();
    let outcome = initiate(
        &initiator.host.keypair,
        &initiator.session,
        stranger,
        &initiator.connector,
        DEFAULT_MAX_CLOCK_SKEW,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, RelayOutcome::NoRoute));
    assert!(initiator.session.is_active());

    relay.shutdown().await;
}

#[tokio::test]
async fn signalling_the_relay_itself_reuses_the_session() {
    let net = TestNetwork::new();
    let relay = net.listening(&[]).await;
    let initiator = bare_peer(&net, &relay, ScriptedHost::new(None)).await;

    let outcome = initiate(
        &initiator.host.keypair,
        &initiator.session,
        relay.node.identity(),
        &initiator.connector,
        DEFAULT_MAX_CLOCK_SKEW,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, RelayOutcome::RelayIsTarget));

    relay.shutdown().await;
}

#[tokio::test]
async fn offer_in_someone_elses_name_faults_the_requester() {
    let net = TestNetwork::new();
    let relay = net.listening(&[]).await;
    let initiator = bare_peer(&net, &relay, ScriptedHost::new(None)).await;

    let impostor = Keypair::generate();
    let offer = SignedSignal::sign(&impostor, Keypair::generate().identity(), b"offer".to_vec());
    let reply: Result<SignalReply, Fault> = initiator.session.signal(offer).await;
    assert!(reply.is_err());
    timeout(TEST_TIMEOUT, initiator.session.closed())
        .await
        .expect("relay kept a misbehaving session open");

    relay.shutdown().await;
}
