//! # Signaling Relay
//!
//! Establishes a direct transport to a node that has no reachable address by
//! carrying a connection offer and its answer through a node both sides
//! already have a session with.
//!
//! ## Roles
//!
//! ```text
//! Initiator ──Signal(offer)──▶ Relay ──Signalled(offer)──▶ Target
//! Initiator ◀──Answer(answer)── Relay ◀──answer────────── Target
//! Initiator ══════════════ direct transport ══════════════ Target
//! ```
//!
//! Offers and answers are [`SignedSignal`]s, so the relay can neither forge
//! nor redirect them. The role logic is kept as pure decision functions and
//! the [`SignalInitiator`] state machine; the async glue at the bottom drives
//! them over sessions and a [`Connector`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, SIGNAL_SIGNATURE_DOMAIN};
use crate::envelope::Fault;
use crate::identity::{now_ms, Identity, Keypair};
use crate::messages::{encode, Response, SignalReply};
use crate::session::{PeerSession, SessionHost};
use crate::transport::{Connector, OfferId, Transport};

/// Maximum size of the connector payload inside a signal.
/// SECURITY: Offers are relayed by third parties; keep them small.
pub const MAX_SIGNAL_DATA: usize = 16 * 1024;

// ============================================================================
// Signed Signals
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSignal {
    pub from: Identity,
    pub to: Identity,
    /// Opaque connector offer or answer.
    pub data: Vec<u8>,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignalBody<'a> {
    from: &'a Identity,
    to: &'a Identity,
    data: &'a [u8],
    timestamp: u64,
}

impl SignedSignal {
    pub fn sign(keypair: &Keypair, to: Identity, data: Vec<u8>) -> Self {
        let mut signal = Self {
            from: keypair.identity(),
            to,
            data,
            timestamp: now_ms(),
            signature: Vec::new(),
        };
        signal.signature = sign_with_domain(keypair, SIGNAL_SIGNATURE_DOMAIN, &signal.body());
        signal
    }

    fn body(&self) -> Vec<u8> {
        encode(&SignalBody {
            from: &self.from,
            to: &self.to,
            data: &self.data,
            timestamp: self.timestamp,
        })
        .unwrap_or_default()
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        if self.data.len() > MAX_SIGNAL_DATA {
            return Err(SignatureError::VerificationFailed);
        }
        verify_with_domain(&self.from, SIGNAL_SIGNATURE_DOMAIN, &self.body(), &self.signature)
    }

    pub fn is_fresh(&self, max_skew: Duration) -> bool {
        u128::from(now_ms().abs_diff(self.timestamp)) <= max_skew.as_millis()
    }
}

// ============================================================================
// Initiator State Machine
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    OfferCreated,
    AwaitingAnswer,
    Answered,
    Connected,
    Failed,
}

/// What the initiator does after the relay's reply.
#[derive(Debug, PartialEq, Eq)]
pub enum InitiatorStep {
    /// The relay cannot reach the target.
    NoRoute,
    /// The relay is the target; reuse the relay session.
    UseRelay,
    /// Complete the offer with this answer payload.
    Complete(Vec<u8>),
}

#[derive(Debug)]
pub struct SignalInitiator {
    local: Identity,
    target: Identity,
    relay: Identity,
    max_skew: Duration,
    state: InitiatorState,
}

impl SignalInitiator {
    pub fn new(local: Identity, target: Identity, relay: Identity, max_skew: Duration) -> Self {
        Self {
            local,
            target,
            relay,
            max_skew,
            state: InitiatorState::Idle,
        }
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    pub fn offer_created(&mut self) {
        self.state = InitiatorState::OfferCreated;
    }

    pub fn offer_sent(&mut self) {
        self.state = InitiatorState::AwaitingAnswer;
    }

    pub fn connected(&mut self) {
        self.state = InitiatorState::Connected;
    }

    pub fn failed(&mut self) {
        self.state = InitiatorState::Failed;
    }

    /// Evaluate the relay's reply. An `Err` is a fault on the relay session.
    pub fn on_reply(&mut self, reply: SignalReply) -> Result<InitiatorStep, Fault> {
        if self.state != InitiatorState::AwaitingAnswer {
            self.failed();
            return Err(Fault::UnexpectedReply);
        }
        match reply {
            SignalReply::NoRoute => {
                self.failed();
                Ok(InitiatorStep::NoRoute)
            }
            SignalReply::Myself => {
                if self.relay != self.target {
                    self.failed();
                    return Err(Fault::ForgedSignalAnswer);
                }
                self.connected();
                Ok(InitiatorStep::UseRelay)
            }
            SignalReply::Answer(answer) => {
                if let Err(fault) = self.validate_answer(&answer) {
                    self.failed();
                    return Err(fault);
                }
                self.state = InitiatorState::Answered;
                Ok(InitiatorStep::Complete(answer.data))
            }
        }
    }

    fn validate_answer(&self, answer: &SignedSignal) -> Result<(), Fault> {
        if answer.verify().is_err()
            || answer.from != self.target
            || answer.to != self.local
            || !answer.is_fresh(self.max_skew)
        {
            return Err(Fault::ForgedSignalAnswer);
        }
        Ok(())
    }
}

// ============================================================================
// Relay and Target Decisions
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum RelayDecision {
    Myself,
    Forward(Identity),
}

/// Relay role: check an offer received from `requester`.
pub fn relay_decision(
    local: &Identity,
    requester: &Identity,
    offer: &SignedSignal,
) -> Result<RelayDecision, Fault> {
    if offer.verify().is_err() {
        return Err(Fault::AuthenticationFailed);
    }
    if offer.from != *requester || offer.to == offer.from {
        return Err(Fault::MisdirectedSignal);
    }
    if offer.to == *local {
        return Ok(RelayDecision::Myself);
    }
    Ok(RelayDecision::Forward(offer.to))
}

#[derive(Debug, PartialEq, Eq)]
pub enum TargetDecision {
    Accept,
    AlreadyKnown,
}

/// Target role: check an offer handed over by a relay.
pub fn target_decision(
    local: &Identity,
    offer: &SignedSignal,
    already_known: bool,
    max_skew: Duration,
) -> Result<TargetDecision, Fault> {
    if offer.verify().is_err() {
        return Err(Fault::AuthenticationFailed);
    }
    if offer.to != *local {
        return Err(Fault::MisdirectedSignal);
    }
    if !offer.is_fresh(max_skew) {
        return Err(Fault::StaleTimestamp);
    }
    if already_known {
        return Ok(TargetDecision::AlreadyKnown);
    }
    Ok(TargetDecision::Accept)
}

// ============================================================================
// Session Handlers
// ============================================================================

/// Serve `Signal` from `requester`.
pub(crate) async fn serve_signal(
    host: &dyn SessionHost,
    requester: Identity,
    offer: SignedSignal,
) -> Result<Response, Fault> {
    let local = host.keypair().identity();
    let target = match relay_decision(&local, &requester, &offer)? {
        RelayDecision::Myself => return Ok(Response::Signal(SignalReply::Myself)),
        RelayDecision::Forward(target) => target,
    };
    let Some(session) = host.session_to(&target).await else {
        debug!(from = %requester.short(), to = %target.short(), "no route for signal");
        return Ok(Response::Signal(SignalReply::NoRoute));
    };
    let reply = match session.signalled(offer).await {
        Ok(Some(answer)) => SignalReply::Answer(answer),
        Ok(None) => SignalReply::NoRoute,
        Err(e) => {
            debug!(to = %target.short(), error = %e, "target failed to answer signal");
            SignalReply::NoRoute
        }
    };
    Ok(Response::Signal(reply))
}

/// Serve `Signalled` from `relay`.
pub(crate) async fn serve_signalled(
    host: &dyn SessionHost,
    relay: Identity,
    offer: SignedSignal,
) -> Result<Response, Fault> {
    let local = host.keypair().identity();
    let known = host.session_to(&offer.from).await.is_some();
    match target_decision(&local, &offer, known, host.max_clock_skew())? {
        TargetDecision::AlreadyKnown => Ok(Response::Signalled { answer: None }),
        TargetDecision::Accept => {
            debug!(from = %offer.from.short(), relay = %relay.short(), "accepting relayed offer");
            let answer = host.accept_signal(&offer).await;
            Ok(Response::Signalled { answer })
        }
    }
}

/// Target side: accept `offer` through `connector` and sign the answer.
pub async fn answer_offer(
    keypair: &Keypair,
    connector: &dyn Connector,
    offer: &SignedSignal,
) -> Result<(SignedSignal, Transport)> {
    let (answer, transport) = connector.accept_offer(&offer.data).await?;
    if answer.len() > MAX_SIGNAL_DATA {
        bail!("answer exceeds {MAX_SIGNAL_DATA} bytes");
    }
    Ok((SignedSignal::sign(keypair, offer.from, answer), transport))
}

#[derive(Debug)]
pub enum RelayOutcome {
    NoRoute,
    /// The relay session already reaches the target.
    RelayIsTarget,
    /// A new transport to the target; spawn a session expecting it.
    Connected(Transport),
}

/// An offer not yet completed. Dropping it cancels the offer, so an
/// initiation abandoned mid-flight (lookup timeout, aborted task) does not
/// leave the connector holding it.
struct PendingOffer {
    connector: Arc<dyn Connector>,
    id: Option<OfferId>,
}

impl PendingOffer {
    fn new(connector: Arc<dyn Connector>, id: OfferId) -> Self {
        Self {
            connector,
            id: Some(id),
        }
    }

    /// Hand the offer over for completion; the guard no longer cancels it.
    fn take(&mut self) -> Option<OfferId> {
        self.id.take()
    }

    async fn cancel(mut self) {
        if let Some(id) = self.id.take() {
            self.connector.cancel_offer(id).await;
        }
    }
}

impl Drop for PendingOffer {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let connector = self.connector.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connector.cancel_offer(id).await });
            }
            Err(_) => debug!(offer = id, "runtime gone, offer not cancelled"),
        }
    }
}

/// Initiator side: ask `relay` to connect us to `target`.
///
/// A forged or misdirected answer destroys the relay session.
pub async fn initiate(
    keypair: &Keypair,
    relay: &PeerSession,
    target: Identity,
    connector: &Arc<dyn Connector>,
    max_skew: Duration,
) -> Result<RelayOutcome> {
    let Some(relay_id) = relay.remote_identity() else {
        bail!("relay session is not active");
    };
    let mut machine = SignalInitiator::new(keypair.identity(), target, relay_id, max_skew);

    let (offer_id, offer_data) = connector.create_offer().await?;
    let mut pending = PendingOffer::new(connector.clone(), offer_id);
    machine.offer_created();
    let offer = SignedSignal::sign(keypair, target, offer_data);

    machine.offer_sent();
    let reply = match relay.signal(offer).await {
        Ok(reply) => reply,
        Err(fault) => {
            pending.cancel().await;
            machine.failed();
            bail!("signal via relay failed: {fault}");
        }
    };

    match machine.on_reply(reply) {
        Err(fault) => {
            pending.cancel().await;
            warn!(relay = %relay_id.short(), target = %target.short(), fault = %fault, "relay returned bad signal answer");
            relay.abort(fault.clone()).await;
            Err(fault.into())
        }
        Ok(InitiatorStep::NoRoute) => {
            pending.cancel().await;
            Ok(RelayOutcome::NoRoute)
        }
        Ok(InitiatorStep::UseRelay) => {
            pending.cancel().await;
            Ok(RelayOutcome::RelayIsTarget)
        }
        Ok(InitiatorStep::Complete(answer)) => {
            let Some(offer_id) = pending.take() else {
                bail!("offer already released");
            };
            match connector.complete_offer(offer_id, &answer).await {
                Ok(transport) => {
                    machine.connected();
                    Ok(RelayOutcome::Connected(transport))
                }
                Err(e) => {
                    machine.failed();
                    Err(e)
                }
            }
        }
    }
}
