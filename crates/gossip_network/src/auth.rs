//! Cluster authentication: challenge/response handshake keyed by the
//! shared cluster key.
//!
//! # Wire exchange
//!
//! ```text
//! initiator                                   responder
//!     | -- HELLO     { node, nonce_i } ------------> |
//!     | <- CHALLENGE { node, nonce_r, proof_r } ---- |
//!     | -- PROOF     { proof_i } ------------------> |
//!     | <- OUTCOME   { accepted } ------------------- |
//! ```
//!
//! `proof_r = HMAC(key, "responder" || nonce_i || nonce_r || id_r)` and
//! `proof_i = HMAC(key, "initiator" || nonce_r || nonce_i || id_i)`. Each
//! side proves knowledge of the key over the nonce the *other* side picked,
//! so a recorded exchange cannot be replayed. The key itself never leaves
//! the process. Either side may answer with a rejecting OUTCOME instead of
//! continuing; both then fail with [`NetworkError::Authentication`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{Frame, FrameCodec, frame_type};
use crate::config::ClusterConfig;
use crate::error::NetworkError;
use crate::identity::{NodeConfig, NodeId};

type HmacSha256 = Hmac<Sha256>;

/// Length of a handshake nonce in bytes.
pub const NONCE_LEN: usize = 32;

/// Length of proofs and session tokens in bytes.
pub const MAC_LEN: usize = 32;

/// Payload limit while a connection is still unauthenticated. The configured
/// frame limit applies only once the handshake succeeds.
pub const HANDSHAKE_MAX_FRAME_SIZE: usize = 16 * 1024;

const SESSION_LABEL: &[u8] = b"gossip-session";

/// Which end of the connection produced a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn label(self) -> &'static [u8] {
        match self {
            Self::Initiator => b"gossip-initiator",
            Self::Responder => b"gossip-responder",
        }
    }
}

/// A fresh random nonce one side sends to the other.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(with = "hex_array")]
    nonce: [u8; NONCE_LEN],
}

impl Challenge {
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", hex::encode(self.nonce))
    }
}

/// Keyed proof that the sender holds the cluster key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof(#[serde(with = "hex_array")] [u8; MAC_LEN]);

impl fmt::Debug for Proof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proof({})", hex::encode(self.0))
    }
}

/// Per-connection secret derived from both nonces once the handshake
/// succeeds. Available for per-message integrity checks.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken([u8; MAC_LEN]);

impl SessionToken {
    pub fn as_bytes(&self) -> &[u8; MAC_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

/// Result of a completed handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    /// The identity the peer declared (and proved) during the handshake.
    pub peer: NodeConfig,
    /// Token shared by both ends of the connection.
    pub session: SessionToken,
}

// ── Wire payloads ───────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct HelloPayload {
    node: NodeConfig,
    challenge: Challenge,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChallengePayload {
    node: NodeConfig,
    challenge: Challenge,
    proof: Proof,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProofPayload {
    proof: Proof,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutcomePayload {
    accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Proves and verifies cluster membership using the shared cluster key.
#[derive(Clone)]
pub struct Authenticator {
    cluster_key: Arc<[u8]>,
    handshake_timeout: Duration,
}

impl Authenticator {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            cluster_key: Arc::from(config.cluster_key.as_slice()),
            handshake_timeout: config.handshake_timeout,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Generate the nonce this side challenges its peer with.
    pub fn begin_handshake(&self) -> Challenge {
        Challenge {
            nonce: rand::random(),
        }
    }

    /// Compute the proof `prover` presents in `role`, answering the peer's
    /// `challenge` and binding our own `counter` nonce.
    pub fn respond_to_challenge(
        &self,
        role: Role,
        challenge: &Challenge,
        counter: &Challenge,
        prover: &NodeId,
    ) -> Proof {
        Proof(self.mac(&[
            role.label(),
            &challenge.nonce,
            &counter.nonce,
            prover.as_bytes(),
        ]))
    }

    /// Recompute the proof the peer should have sent and compare in
    /// constant time.
    pub fn verify_proof(
        &self,
        proof: &Proof,
        role: Role,
        expected_challenge: &Challenge,
        counter: &Challenge,
        prover: &NodeId,
    ) -> bool {
        let expected = self.respond_to_challenge(role, expected_challenge, counter, prover);
        expected.0[..].ct_eq(&proof.0[..]).into()
    }

    /// Derive the session token both sides share after a successful
    /// handshake.
    pub fn session_token(&self, initiator: &Challenge, responder: &Challenge) -> SessionToken {
        SessionToken(self.mac(&[SESSION_LABEL, &initiator.nonce, &responder.nonce]))
    }

    fn mac(&self, parts: &[&[u8]]) -> [u8; MAC_LEN] {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.cluster_key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        for part in parts {
            mac.update(part);
        }
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    // -----------------------------------------------------------------------
    // Handshake drivers
    // -----------------------------------------------------------------------

    /// Run the handshake as the side that opened the connection.
    ///
    /// Fails if the peer cannot prove the cluster key, or if it is not the
    /// node we meant to reach.
    pub async fn initiate<S>(
        &self,
        framed: &mut Framed<S, FrameCodec>,
        local: &NodeConfig,
        expected_peer: NodeId,
    ) -> Result<Handshake, NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.with_timeout(self.run_initiator(framed, local, expected_peer))
            .await
    }

    /// Run the handshake as the side that accepted the connection.
    pub async fn respond<S>(
        &self,
        framed: &mut Framed<S, FrameCodec>,
        local: &NodeConfig,
    ) -> Result<Handshake, NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.with_timeout(self.run_responder(framed, local)).await
    }

    async fn with_timeout<F>(&self, fut: F) -> Result<Handshake, NetworkError>
    where
        F: Future<Output = Result<Handshake, NetworkError>>,
    {
        match tokio::time::timeout(self.handshake_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Authentication(format!(
                "Handshake timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }

    async fn run_initiator<S>(
        &self,
        framed: &mut Framed<S, FrameCodec>,
        local: &NodeConfig,
        expected_peer: NodeId,
    ) -> Result<Handshake, NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = self.begin_handshake();
        send_payload(
            framed,
            frame_type::HELLO,
            &HelloPayload {
                node: local.clone(),
                challenge: ours.clone(),
            },
        )
        .await?;

        let reply: ChallengePayload = recv_payload(framed, frame_type::CHALLENGE).await?;
        let peer_id = reply.node.node_id();

        if peer_id != expected_peer {
            reject(framed, "unexpected node identity").await;
            return Err(NetworkError::Authentication(format!(
                "Expected node {expected_peer}, peer identified as {peer_id}"
            )));
        }

        if !self.verify_proof(&reply.proof, Role::Responder, &ours, &reply.challenge, &peer_id) {
            reject(framed, "invalid proof").await;
            return Err(NetworkError::Authentication(format!(
                "Node {peer_id} failed to prove the cluster key"
            )));
        }

        let proof = self.respond_to_challenge(
            Role::Initiator,
            &reply.challenge,
            &ours,
            &local.node_id(),
        );
        send_payload(framed, frame_type::PROOF, &ProofPayload { proof }).await?;

        let outcome: OutcomePayload = recv_payload(framed, frame_type::OUTCOME).await?;
        if !outcome.accepted {
            return Err(rejected_by(peer_id, outcome.reason));
        }

        debug!("Handshake with {peer_id} complete (initiator)");
        Ok(Handshake {
            peer: reply.node,
            session: self.session_token(&ours, &reply.challenge),
        })
    }

    async fn run_responder<S>(
        &self,
        framed: &mut Framed<S, FrameCodec>,
        local: &NodeConfig,
    ) -> Result<Handshake, NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let hello: HelloPayload = recv_payload(framed, frame_type::HELLO).await?;
        let peer_id = hello.node.node_id();

        if peer_id == local.node_id() {
            reject(framed, "node cannot connect to itself").await;
            return Err(NetworkError::Authentication(
                "Peer claimed our own node identity".to_string(),
            ));
        }

        let ours = self.begin_handshake();
        let proof = self.respond_to_challenge(
            Role::Responder,
            &hello.challenge,
            &ours,
            &local.node_id(),
        );
        send_payload(
            framed,
            frame_type::CHALLENGE,
            &ChallengePayload {
                node: local.clone(),
                challenge: ours.clone(),
                proof,
            },
        )
        .await?;

        // The initiator answers with its proof, or rejects ours.
        let frame = recv_frame(framed).await?;
        let reply: ProofPayload = match frame.message_type {
            frame_type::PROOF => decode_payload(&frame)?,
            frame_type::OUTCOME => {
                let outcome: OutcomePayload = decode_payload(&frame)?;
                return Err(rejected_by(peer_id, outcome.reason));
            }
            other => return Err(unexpected_frame(frame_type::PROOF, other)),
        };

        if !self.verify_proof(&reply.proof, Role::Initiator, &ours, &hello.challenge, &peer_id) {
            reject(framed, "invalid proof").await;
            return Err(NetworkError::Authentication(format!(
                "Node {peer_id} failed to prove the cluster key"
            )));
        }

        send_payload(
            framed,
            frame_type::OUTCOME,
            &OutcomePayload {
                accepted: true,
                reason: None,
            },
        )
        .await?;

        debug!("Handshake with {peer_id} complete (responder)");
        Ok(Handshake {
            peer: hello.node,
            session: self.session_token(&hello.challenge, &ours),
        })
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("cluster_key", &"<redacted>")
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

async fn send_payload<S, T>(
    framed: &mut Framed<S, FrameCodec>,
    message_type: u8,
    payload: &T,
) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = serde_json::to_vec(payload)?;
    framed.send(Frame::new(message_type, bytes)).await
}

async fn recv_frame<S>(framed: &mut Framed<S, FrameCodec>) -> Result<Frame, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(frame) => frame,
        None => Err(NetworkError::Authentication(
            "Peer closed the connection during the handshake".to_string(),
        )),
    }
}

async fn recv_payload<S, T>(
    framed: &mut Framed<S, FrameCodec>,
    expected_type: u8,
) -> Result<T, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let frame = recv_frame(framed).await?;
    if frame.message_type == frame_type::OUTCOME && expected_type != frame_type::OUTCOME {
        let outcome: OutcomePayload = decode_payload(&frame)?;
        if !outcome.accepted {
            return Err(NetworkError::Authentication(format!(
                "Handshake rejected by peer: {}",
                outcome.reason.unwrap_or_else(|| "no reason given".to_string())
            )));
        }
    }
    if frame.message_type != expected_type {
        return Err(unexpected_frame(expected_type, frame.message_type));
    }
    decode_payload(&frame)
}

fn decode_payload<T: DeserializeOwned>(frame: &Frame) -> Result<T, NetworkError> {
    serde_json::from_slice(&frame.payload)
        .map_err(|e| NetworkError::Protocol(format!("Malformed handshake frame: {e}")))
}

/// Tell the peer why we are giving up. Best effort; the caller is about to
/// drop the connection anyway.
async fn reject<S>(framed: &mut Framed<S, FrameCodec>, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = OutcomePayload {
        accepted: false,
        reason: Some(reason.to_string()),
    };
    if let Err(e) = send_payload(framed, frame_type::OUTCOME, &outcome).await {
        warn!("Failed to send handshake rejection: {e}");
    }
}

fn rejected_by(peer_id: NodeId, reason: Option<String>) -> NetworkError {
    NetworkError::Authentication(format!(
        "Handshake rejected by {peer_id}: {}",
        reason.unwrap_or_else(|| "no reason given".to_string())
    ))
}

fn unexpected_frame(expected: u8, actual: u8) -> NetworkError {
    NetworkError::Protocol(format!(
        "Expected handshake frame {expected:#04x}, got {actual:#04x}"
    ))
}

// ---------------------------------------------------------------------------
// Serde helper for fixed-size byte arrays
// ---------------------------------------------------------------------------

mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(d)?;
        let mut out = [0u8; N];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
