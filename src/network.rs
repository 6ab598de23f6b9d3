use crate::bounded_set::BoundedSet;
use crate::types::{ConfirmVote, FinalityVote, Vote, VoteKey, VoteKind, VoteMessage};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;

pub type PeerId = u64;

/// Misbehavior weights applied to a peer that sent a bad vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Misbehavior {
    WrongMessageType,
    NotADelegate,
    UnknownAccount,
    BadSignature,
}

impl Misbehavior {
    pub fn weight(self) -> u32 {
        match self {
            Misbehavior::WrongMessageType => 100,
            Misbehavior::NotADelegate => 2,
            Misbehavior::UnknownAccount => 10,
            Misbehavior::BadSignature => 10,
        }
    }
}

/// Messages queued for a peer's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    Confirm(ConfirmVote),
    Finality(FinalityVote),
}

/// Peer transport collaborator. Pushes must not block: implementations
/// queue the message and return.
pub trait Transport: Send + Sync {
    fn for_each_peer(&self, f: &mut dyn FnMut(PeerId));
    fn push_confirm_vote(&self, peer: PeerId, vote: &ConfirmVote);
    fn push_finality_vote(&self, peer: PeerId, vote: &FinalityVote);
    fn penalize(&self, peer: PeerId, misbehavior: Misbehavior);

    /// Records that `peer` already has `vote`, so it is not echoed back.
    fn note_received(&self, _peer: PeerId, _vote: &Vote) {}
}

/// Dispatch from a vote type to the matching transport push.
pub trait GossipVote: VoteMessage {
    fn push(&self, transport: &dyn Transport, peer: PeerId);
}

impl GossipVote for ConfirmVote {
    fn push(&self, transport: &dyn Transport, peer: PeerId) {
        transport.push_confirm_vote(peer, self);
    }
}

impl GossipVote for FinalityVote {
    fn push(&self, transport: &dyn Transport, peer: PeerId) {
        transport.push_finality_vote(peer, self);
    }
}

/// Pushes `vote` to every connected peer.
pub fn broadcast<V: GossipVote>(transport: &dyn Transport, vote: &V) {
    transport.for_each_peer(&mut |peer| vote.push(transport, peer));
}

struct Peer {
    sender: mpsc::UnboundedSender<PeerMessage>,
    known_confirm: Mutex<BoundedSet<VoteKey>>,
    known_finality: Mutex<BoundedSet<VoteKey>>,
    score: Mutex<u32>,
}

impl Peer {
    fn known(&self, kind: VoteKind) -> &Mutex<BoundedSet<VoteKey>> {
        match kind {
            VoteKind::Confirm => &self.known_confirm,
            VoteKind::Finality => &self.known_finality,
        }
    }

    /// Marks the vote known; returns false if the peer already had it.
    fn learn(&self, vote: &Vote) -> bool {
        self.known(vote.kind)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vote.key())
    }
}

/// Connected peers, each with an unbounded outbound queue drained by its
/// writer task. A slow socket only grows its own queue.
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Peer>>,
    known_capacity: usize,
    ban_score: u32,
}

impl PeerSet {
    pub fn new(known_capacity: usize, ban_score: u32) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            known_capacity,
            ban_score,
        }
    }

    /// Registers a peer and returns the receiving end of its queue.
    pub fn connect(&self, peer: PeerId) -> mpsc::UnboundedReceiver<PeerMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let entry = Peer {
            sender,
            known_confirm: Mutex::new(BoundedSet::new(self.known_capacity)),
            known_finality: Mutex::new(BoundedSet::new(self.known_capacity)),
            score: Mutex::new(0),
        };
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer, entry);
        log::debug!(target: "net", "peer {} connected", peer);
        receiver
    }

    pub fn disconnect(&self, peer: PeerId) {
        if self
            .peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer)
            .is_some()
        {
            log::debug!(target: "net", "peer {} disconnected", peer);
        }
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&peer)
    }

    pub fn misbehavior(&self, peer: PeerId) -> u32 {
        self.peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .map(|p| *p.score.lock().unwrap_or_else(PoisonError::into_inner))
            .unwrap_or(0)
    }

    fn push(&self, peer: PeerId, vote: &Vote, message: PeerMessage) {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = peers.get(&peer) else {
            return;
        };
        if !entry.learn(vote) {
            return;
        }
        if entry.sender.send(message).is_err() {
            log::debug!(target: "net", "peer {} queue closed, dropping {} vote", peer, vote.kind);
        }
    }
}

impl Transport for PeerSet {
    fn for_each_peer(&self, f: &mut dyn FnMut(PeerId)) {
        let ids: Vec<PeerId> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        for id in ids {
            f(id);
        }
    }

    fn push_confirm_vote(&self, peer: PeerId, vote: &ConfirmVote) {
        self.push(peer, &vote.0, PeerMessage::Confirm(vote.clone()));
    }

    fn push_finality_vote(&self, peer: PeerId, vote: &FinalityVote) {
        self.push(peer, &vote.0, PeerMessage::Finality(vote.clone()));
    }

    fn penalize(&self, peer: PeerId, misbehavior: Misbehavior) {
        let banned = {
            let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = peers.get(&peer) else {
                return;
            };
            let mut score = entry.score.lock().unwrap_or_else(PoisonError::into_inner);
            let before = *score;
            *score = score.saturating_add(misbehavior.weight());
            log::info!(
                target: "net",
                "misbehaving peer {}: {:?}, score {} -> {}",
                peer,
                misbehavior,
                before,
                *score
            );
            *score >= self.ban_score
        };
        if banned {
            log::warn!(target: "net", "peer {} reached ban score, disconnecting", peer);
            self.disconnect(peer);
        }
    }

    fn note_received(&self, peer: PeerId, vote: &Vote) {
        if let Some(entry) = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
        {
            entry.learn(vote);
        }
    }
}
