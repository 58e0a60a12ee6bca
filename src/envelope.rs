//! # Envelope Codec
//!
//! Packs typed payloads into signed, sealed frames and unpacks inbound frames
//! into verified envelopes. Every rejection is a [`Fault`]; the owning session
//! destroys itself on any of them.
//!
//! ## Unpack Order
//!
//! 1. size limit
//! 2. frame decode
//! 3. unseal with the session's box secret
//! 4. signed wrapper decode
//! 5. envelope decode, signature against the claimed author
//! 6. type agreement, version, clock skew
//! 7. clear frames carry only the introduction

use std::time::Duration;

use thiserror::Error;

use crate::crypto::{self, BoxKeypair, ENVELOPE_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, Identity, Keypair};
use crate::messages::{
    deserialize_bounded, encode, Envelope, Frame, MessageType, Payload, Request, Response,
    SignedEnvelope, PROTOCOL_VERSION,
};

/// Default bound on any serialized stage of a message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default tolerated difference between the sender's and our clock.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(2 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultClass {
    /// The link failed; nothing is implied about the peer.
    Transport,
    /// The peer broke the protocol, possibly by bug.
    Protocol,
    /// The peer presented forged or contradictory credentials.
    Malicious,
}

/// Reasons a session is torn down.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("transport closed")]
    TransportClosed,
    #[error("failed to send frame")]
    SendFailed,
    #[error("reply timed out")]
    ReplyTimeout,
    #[error("introduction timed out")]
    IntroductionTimeout,
    #[error("session is not active")]
    SessionNotActive,

    #[error("payload too large")]
    PayloadTooLarge,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("malformed message")]
    Malformed,
    #[error("protocol version mismatch")]
    VersionMismatch,
    #[error("timestamp outside tolerated clock skew")]
    StaleTimestamp,
    #[error("reply does not match a pending request")]
    UnmatchedReply,
    #[error("message before introduction")]
    NotIntroduced,
    #[error("unexpected cleartext frame")]
    UnexpectedCleartext,
    #[error("unexpected reply type")]
    UnexpectedReply,

    #[error("signature verification failed")]
    AuthenticationFailed,
    #[error("peer introduced itself twice")]
    DoubleIntroduction,
    #[error("peer identity does not match")]
    IdentityMismatch,
    #[error("forged record")]
    ForgedRecord,
    #[error("forged user id claim")]
    ForgedClaim,
    #[error("forged signal answer")]
    ForgedSignalAnswer,
    #[error("misdirected signal")]
    MisdirectedSignal,
}

impl Fault {
    pub fn class(&self) -> FaultClass {
        match self {
            Fault::TransportClosed
            | Fault::SendFailed
            | Fault::ReplyTimeout
            | Fault::IntroductionTimeout
            | Fault::SessionNotActive => FaultClass::Transport,
            Fault::PayloadTooLarge
            | Fault::DecryptionFailed
            | Fault::Malformed
            | Fault::VersionMismatch
            | Fault::StaleTimestamp
            | Fault::UnmatchedReply
            | Fault::NotIntroduced
            | Fault::UnexpectedCleartext
            | Fault::UnexpectedReply => FaultClass::Protocol,
            Fault::AuthenticationFailed
            | Fault::DoubleIntroduction
            | Fault::IdentityMismatch
            | Fault::ForgedRecord
            | Fault::ForgedClaim
            | Fault::ForgedSignalAnswer
            | Fault::MisdirectedSignal => FaultClass::Malicious,
        }
    }

    pub fn is_malicious(&self) -> bool {
        self.class() == FaultClass::Malicious
    }
}

/// Per-session envelope packer and verifier.
pub struct EnvelopeCodec {
    keypair: Keypair,
    box_keypair: BoxKeypair,
    remote_box_key: Option<[u8; 32]>,
    max_message_size: usize,
    max_clock_skew: Duration,
}

impl EnvelopeCodec {
    pub fn new(keypair: Keypair, max_message_size: usize, max_clock_skew: Duration) -> Self {
        Self {
            keypair,
            box_keypair: BoxKeypair::generate(),
            remote_box_key: None,
            max_message_size,
            max_clock_skew,
        }
    }

    pub fn local_identity(&self) -> Identity {
        self.keypair.identity()
    }

    /// Ephemeral key announced in our introduction.
    pub fn local_box_key(&self) -> [u8; 32] {
        self.box_keypair.public_key()
    }

    /// Once set, every outbound frame is sealed.
    pub fn set_remote_box_key(&mut self, pk: [u8; 32]) {
        self.remote_box_key = Some(pk);
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn pack_request(&self, request: Request, counter: u64) -> Result<Vec<u8>, Fault> {
        self.pack(Payload::Request(request), counter, now_ms())
    }

    pub fn pack_reply(&self, response: Response, counter: u64) -> Result<Vec<u8>, Fault> {
        self.pack(Payload::Reply(response), counter, now_ms())
    }

    fn pack(&self, payload: Payload, counter: u64, timestamp: u64) -> Result<Vec<u8>, Fault> {
        let envelope = Envelope {
            v: PROTOCOL_VERSION,
            a: self.keypair.identity(),
            m: payload.message_type(),
            p: payload,
            t: timestamp,
            c: counter,
        };
        let envelope_bytes = self.bounded(encode(&envelope))?;
        let signature =
            crypto::sign_with_domain(&self.keypair, ENVELOPE_SIGNATURE_DOMAIN, &envelope_bytes);
        let signed = SignedEnvelope {
            m: envelope_bytes,
            s: signature,
        };
        let signed_bytes = self.bounded(encode(&signed))?;

        let frame = match &self.remote_box_key {
            Some(pk) => {
                let sealed = crypto::seal(pk, &signed_bytes).map_err(|_| Fault::DecryptionFailed)?;
                Frame::Sealed(sealed)
            }
            None => Frame::Clear(signed_bytes),
        };
        self.bounded(encode(&frame))
    }

    fn bounded(&self, encoded: Result<Vec<u8>, bincode::Error>) -> Result<Vec<u8>, Fault> {
        let bytes = encoded.map_err(|_| Fault::PayloadTooLarge)?;
        if bytes.len() > self.max_message_size {
            return Err(Fault::PayloadTooLarge);
        }
        Ok(bytes)
    }

    pub fn unpack(&self, bytes: &[u8]) -> Result<Envelope, Fault> {
        if bytes.len() > self.max_message_size {
            return Err(Fault::PayloadTooLarge);
        }
        let frame: Frame = deserialize_bounded(bytes).map_err(|_| Fault::Malformed)?;
        let (signed_bytes, clear) = match frame {
            Frame::Sealed(sealed) => {
                let opened = self
                    .box_keypair
                    .open(&sealed)
                    .map_err(|_| Fault::DecryptionFailed)?;
                (opened, false)
            }
            Frame::Clear(inner) => (inner, true),
        };

        let signed: SignedEnvelope =
            deserialize_bounded(&signed_bytes).map_err(|_| Fault::Malformed)?;
        let envelope: Envelope = deserialize_bounded(&signed.m).map_err(|_| Fault::Malformed)?;
        crypto::verify_with_domain(&envelope.a, ENVELOPE_SIGNATURE_DOMAIN, &signed.m, &signed.s)
            .map_err(|_| Fault::AuthenticationFailed)?;

        if !envelope.is_consistent() {
            return Err(Fault::Malformed);
        }
        if envelope.v != PROTOCOL_VERSION {
            return Err(Fault::VersionMismatch);
        }
        let skew = now_ms().abs_diff(envelope.t);
        if u128::from(skew) > self.max_clock_skew.as_millis() {
            return Err(Fault::StaleTimestamp);
        }
        if clear && envelope.m != MessageType::Introduce {
            return Err(Fault::UnexpectedCleartext);
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Introduction;

    fn codec_pair() -> (EnvelopeCodec, EnvelopeCodec) {
        let mut a = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let mut b = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let a_pk = a.local_box_key();
        a.set_remote_box_key(b.local_box_key());
        b.set_remote_box_key(a_pk);
        (a, b)
    }

    fn introduce(codec: &EnvelopeCodec) -> Request {
        Request::Introduce(Introduction {
            pk: codec.local_box_key(),
            addrs: vec![],
        })
    }

    #[test]
    fn sealed_request_roundtrip() {
        let (a, b) = codec_pair();
        let frame = a.pack_request(Request::Ping, 5).unwrap();
        let envelope = b.unpack(&frame).unwrap();
        assert_eq!(envelope.a, a.local_identity());
        assert_eq!(envelope.c, 5);
        assert_eq!(envelope.m, MessageType::Ping);
    }

    #[test]
    fn clear_introduction_accepted() {
        let a = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let b = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let frame = a.pack_request(introduce(&a), 0).unwrap();
        let envelope = b.unpack(&frame).unwrap();
        assert_eq!(envelope.m, MessageType::Introduce);
    }

    #[test]
    fn clear_non_introduction_rejected() {
        let a = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let b = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let frame = a.pack_request(Request::Ping, 1).unwrap();
        assert_eq!(b.unpack(&frame).unwrap_err(), Fault::UnexpectedCleartext);
    }

    #[test]
    fn bit_flip_in_signed_region_is_rejected() {
        let a = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let b = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let frame = a.pack_request(introduce(&a), 0).unwrap();

        // Clear frame: 4-byte variant tag, 8-byte length, then the signed wrapper,
        // whose first 8 bytes are the envelope length.
        let signed_start = 4 + 8 + 8;
        let envelope_len = {
            let mut len = [0u8; 8];
            len.copy_from_slice(&frame[12..20]);
            u64::from_le_bytes(len) as usize
        };
        for offset in [0, envelope_len / 2, envelope_len - 1] {
            for bit in 0..8 {
                let mut tampered = frame.clone();
                tampered[signed_start + offset] ^= 1 << bit;
                let err = b.unpack(&tampered).unwrap_err();
                assert!(
                    matches!(err, Fault::AuthenticationFailed | Fault::Malformed),
                    "offset {offset} bit {bit} gave {err:?}"
                );
            }
        }
    }

    #[test]
    fn bit_flip_in_sealed_frame_fails_decryption() {
        let (a, b) = codec_pair();
        let mut frame = a.pack_request(Request::Ping, 1).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x80;
        assert_eq!(b.unpack(&frame).unwrap_err(), Fault::DecryptionFailed);
    }

    #[test]
    fn frame_sealed_to_other_session_fails() {
        let (a, _b) = codec_pair();
        let stranger = EnvelopeCodec::new(Keypair::generate(), DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_CLOCK_SKEW);
        let frame = a.pack_request(Request::Ping, 1).unwrap();
        assert_eq!(stranger.unpack(&frame).unwrap_err(), Fault::DecryptionFailed);
    }

    #[test]
    fn stale_timestamp_rejected_despite_valid_signature() {
        let (a, b) = codec_pair();
        let old = now_ms() - 3 * 60 * 1000;
        let frame = a.pack(Payload::Request(Request::Ping), 1, old).unwrap();
        assert_eq!(b.unpack(&frame).unwrap_err(), Fault::StaleTimestamp);

        let future = now_ms() + 3 * 60 * 1000;
        let frame = a.pack(Payload::Request(Request::Ping), 1, future).unwrap();
        assert_eq!(b.unpack(&frame).unwrap_err(), Fault::StaleTimestamp);

        let slight = now_ms() - 30 * 1000;
        let frame = a.pack(Payload::Request(Request::Ping), 1, slight).unwrap();
        assert!(b.unpack(&frame).is_ok());
    }

    #[test]
    fn wrong_version_rejected() {
        let (a, b) = codec_pair();
        let envelope = Envelope {
            v: PROTOCOL_VERSION + 1,
            a: a.local_identity(),
            m: MessageType::Ping,
            p: Payload::Request(Request::Ping),
            t: now_ms(),
            c: 1,
        };
        let envelope_bytes = encode(&envelope).unwrap();
        let s = crypto::sign_with_domain(&a.keypair, ENVELOPE_SIGNATURE_DOMAIN, &envelope_bytes);
        let signed = encode(&SignedEnvelope { m: envelope_bytes, s }).unwrap();
        let sealed = crypto::seal(&b.local_box_key(), &signed).unwrap();
        let frame = encode(&Frame::Sealed(sealed)).unwrap();
        assert_eq!(b.unpack(&frame).unwrap_err(), Fault::VersionMismatch);
    }

    #[test]
    fn signature_by_other_key_rejected() {
        let (a, b) = codec_pair();
        let impostor = Keypair::generate();
        let envelope = Envelope {
            v: PROTOCOL_VERSION,
            a: a.local_identity(),
            m: MessageType::Ping,
            p: Payload::Request(Request::Ping),
            t: now_ms(),
            c: 1,
        };
        let envelope_bytes = encode(&envelope).unwrap();
        let s = crypto::sign_with_domain(&impostor, ENVELOPE_SIGNATURE_DOMAIN, &envelope_bytes);
        let signed = encode(&SignedEnvelope { m: envelope_bytes, s }).unwrap();
        let sealed = crypto::seal(&b.local_box_key(), &signed).unwrap();
        let frame = encode(&Frame::Sealed(sealed)).unwrap();
        assert_eq!(b.unpack(&frame).unwrap_err(), Fault::AuthenticationFailed);
    }

    #[test]
    fn oversized_payload_rejected_both_ways() {
        let small = EnvelopeCodec::new(Keypair::generate(), 256, DEFAULT_MAX_CLOCK_SKEW);
        let err = small
            .pack_request(
                Request::ReceiveMessages { since: 0 },
                1,
            )
            .and_then(|_| {
                small.pack_request(
                    Request::Introduce(Introduction {
                        pk: [0u8; 32],
                        addrs: vec!["x".repeat(300)],
                    }),
                    0,
                )
            })
            .unwrap_err();
        assert_eq!(err, Fault::PayloadTooLarge);
        assert_eq!(small.unpack(&vec![0u8; 257]).unwrap_err(), Fault::PayloadTooLarge);
    }

    #[test]
    fn garbage_is_malformed() {
        let (_a, b) = codec_pair();
        assert_eq!(b.unpack(&[9, 9, 9]).unwrap_err(), Fault::Malformed);
    }

    #[test]
    fn fault_classes() {
        assert_eq!(Fault::ReplyTimeout.class(), FaultClass::Transport);
        assert_eq!(Fault::UnmatchedReply.class(), FaultClass::Protocol);
        assert_eq!(Fault::StaleTimestamp.class(), FaultClass::Protocol);
        assert!(Fault::ForgedSignalAnswer.is_malicious());
        assert!(Fault::AuthenticationFailed.is_malicious());
    }
}
