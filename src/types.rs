use crate::crypto::{Hash, hash_data};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Block height (u32, as carried on the wire).
pub type Height = u32;

/// Registration id of a delegate account: the block height where the account
/// was registered and its index inside that block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegId {
    pub height: u32,
    pub index: u16,
}

impl RegId {
    pub fn new(height: u32, index: u16) -> Self {
        Self { height, index }
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.index)
    }
}

/// Lightweight reference into the block index. Never owns the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub height: Height,
    pub hash: Hash,
    /// Zero for genesis.
    pub parent_hash: Hash,
    /// Block timestamp, unix seconds.
    pub time: u64,
}

impl BlockRef {
    pub fn has_parent(&self) -> bool {
        self.height > 0
    }

    pub fn id(&self) -> String {
        format!("[{}]{}", self.height, self.hash)
    }
}

/// Round type of a vote message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteKind {
    /// First round: local finality evidence.
    Confirm,
    /// Second round: global finality evidence.
    Finality,
}

impl fmt::Display for VoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteKind::Confirm => write!(f, "confirm"),
            VoteKind::Finality => write!(f, "finality"),
        }
    }
}

/// A signed vote as carried on the wire. Confirm and finality votes share
/// this shape and differ only in `kind`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub kind: VoteKind,
    pub height: Height,
    pub block_hash: Hash,
    pub parent_hash: Hash,
    pub validator: RegId,
    pub signature: Vec<u8>,
}

/// Dedup identity of a vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteKey {
    pub validator: RegId,
    pub block_hash: Hash,
}

impl Vote {
    pub fn unsigned(kind: VoteKind, block: &BlockRef, validator: RegId) -> Self {
        Self {
            kind,
            height: block.height,
            block_hash: block.hash,
            parent_hash: block.parent_hash,
            validator,
            signature: vec![],
        }
    }

    /// Hash covered by the signature: every field except the signature.
    pub fn signing_hash(&self) -> Hash {
        hash_data(&(
            self.kind,
            self.height,
            &self.block_hash,
            &self.parent_hash,
            &self.validator,
        ))
    }

    pub fn key(&self) -> VoteKey {
        VoteKey {
            validator: self.validator,
            block_hash: self.block_hash,
        }
    }

    pub fn block_id(&self) -> String {
        format!("[{}]{}", self.height, self.block_hash)
    }
}

/// A vote message of one round type. The vote store and the coordinator are
/// generic over this.
pub trait VoteMessage: Clone + fmt::Debug + Send + Sync + 'static {
    /// Round type expected on this message's channel.
    const KIND: VoteKind;

    fn from_vote(vote: Vote) -> Self;
    fn vote(&self) -> &Vote;

    fn height(&self) -> Height {
        self.vote().height
    }

    fn block_hash(&self) -> Hash {
        self.vote().block_hash
    }

    fn validator(&self) -> RegId {
        self.vote().validator
    }

    fn key(&self) -> VoteKey {
        self.vote().key()
    }
}

/// First-round vote: "I saw this block as tip and consider its parent valid".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmVote(pub Vote);

/// Second-round vote: "I attest this block, once confirmed, is irreversible".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityVote(pub Vote);

impl VoteMessage for ConfirmVote {
    const KIND: VoteKind = VoteKind::Confirm;

    fn from_vote(vote: Vote) -> Self {
        ConfirmVote(vote)
    }

    fn vote(&self) -> &Vote {
        &self.0
    }
}

impl VoteMessage for FinalityVote {
    const KIND: VoteKind = VoteKind::Finality;

    fn from_vote(vote: Vote) -> Self {
        FinalityVote(vote)
    }

    fn vote(&self) -> &Vote {
        &self.0
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Encodes a vote payload. Envelope framing is the transport's concern.
pub fn encode_vote(vote: &Vote) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(vote)?)
}

pub fn decode_vote(bytes: &[u8]) -> Result<Vote, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}
