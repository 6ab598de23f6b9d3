//! Vote records for the two finality rounds.
//!
//! A [`VoteStore`] deduplicates votes of one round type, keeps one
//! collection per block hash (one vote per delegate) and answers quorum
//! queries against a delegate set. It also remembers which blocks this node
//! already voted for, so repeated tip processing does not re-broadcast.
//!
//! Memory is bounded twice. A validator may hold votes for at most
//! [`MAX_HASHES_PER_VALIDATOR`] blocks at one height, and the store keeps at
//! most `block_limit` collections. When full, collections above the last
//! observed tip are evicted first, highest first; a collection at or below
//! the tip is never evicted to make room for one above it.
//!
//! Every store has a single internal mutex. Data leaves the store by copy;
//! no reference into a collection outlives the lock.

use crate::bounded_set::BoundedSet;
use crate::config::{DEFAULT_MAX_TRACKED_BLOCKS, QuorumRatio};
use crate::crypto::Hash;
use crate::types::{ConfirmVote, FinalityVote, Height, RegId, VoteKey, VoteMessage};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Distinct blocks one validator may have votes recorded for at one height.
/// Two leaves room for an honest vote on each side of a one-block reorg.
pub const MAX_HASHES_PER_VALIDATOR: usize = 2;

/// Operations the coordinator needs from a store of one round type.
pub trait VoteRecords<V: VoteMessage>: Send + Sync {
    fn is_known(&self, vote: &V) -> bool;
    fn add_known(&self, vote: &V);
    /// Records the vote and returns the size of its block's collection, or
    /// `None` if the store declined it.
    fn insert(&self, vote: V) -> Option<usize>;
    fn check_quorum(&self, block_hash: &Hash, delegates: &BTreeSet<RegId>) -> bool;
    fn is_broadcasted(&self, block_hash: &Hash) -> bool;
    /// Returns false if the block was already marked.
    fn mark_broadcasted(&self, block_hash: Hash) -> bool;
    /// Chain height that ranks collections for eviction.
    fn observe_tip(&self, height: Height);
}

struct BlockVotes<V> {
    height: Height,
    votes: HashMap<RegId, V>,
}

struct Inner<V> {
    known: BoundedSet<VoteKey>,
    blocks: HashMap<Hash, BlockVotes<V>>,
    heights: BTreeMap<Height, Vec<Hash>>,
    /// Votes recorded per height, over every collection at that height.
    height_votes: BTreeMap<Height, usize>,
    broadcasted: BoundedSet<Hash>,
    block_limit: usize,
    tip: Height,
}

impl<V: VoteMessage> Inner<V> {
    fn tally(&self, block_hash: &Hash, delegates: &BTreeSet<RegId>) -> usize {
        self.blocks
            .get(block_hash)
            .map(|entry| {
                entry
                    .votes
                    .keys()
                    .filter(|validator| delegates.contains(validator))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Blocks at `height` that `validator` already has a vote recorded for.
    fn hashes_voted(&self, validator: &RegId, height: Height) -> usize {
        self.heights
            .get(&height)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter(|hash| {
                        self.blocks
                            .get(*hash)
                            .is_some_and(|entry| entry.votes.contains_key(validator))
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn drop_height(&mut self, height: Height) {
        if let Some(hashes) = self.heights.remove(&height) {
            for hash in hashes {
                self.blocks.remove(&hash);
            }
        }
        self.height_votes.remove(&height);
    }

    /// Drops the newest collection at `height`.
    fn evict_one(&mut self, height: Height) -> bool {
        let Some(hashes) = self.heights.get_mut(&height) else {
            return false;
        };
        let Some(hash) = hashes.pop() else {
            return false;
        };
        let emptied = hashes.is_empty();
        if let Some(entry) = self.blocks.remove(&hash) {
            if let Some(count) = self.height_votes.get_mut(&height) {
                *count = count.saturating_sub(entry.votes.len());
            }
        }
        if emptied {
            self.heights.remove(&height);
            self.height_votes.remove(&height);
        }
        true
    }

    /// Frees one slot for a collection at `incoming`. Returns false if every
    /// tracked collection ranks above the incoming one.
    fn make_room(&mut self, incoming: Height) -> bool {
        let Some(highest) = self.heights.keys().next_back().copied() else {
            return false;
        };
        if highest > self.tip {
            if incoming >= highest {
                return false;
            }
            return self.evict_one(highest);
        }
        if incoming > self.tip {
            return false;
        }
        match self.heights.keys().next().copied() {
            Some(lowest) if lowest <= incoming => self.evict_one(lowest),
            _ => false,
        }
    }
}

/// Vote records of one round type.
pub struct VoteStore<V: VoteMessage> {
    inner: Mutex<Inner<V>>,
    quorum: QuorumRatio,
}

/// First-round store.
pub type ConfirmVoteStore = VoteStore<ConfirmVote>;

impl<V: VoteMessage> VoteStore<V> {
    pub fn new(quorum: QuorumRatio, known_capacity: usize, broadcast_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                known: BoundedSet::new(known_capacity),
                blocks: HashMap::new(),
                heights: BTreeMap::new(),
                height_votes: BTreeMap::new(),
                broadcasted: BoundedSet::new(broadcast_capacity),
                block_limit: DEFAULT_MAX_TRACKED_BLOCKS,
                tip: 0,
            }),
            quorum,
        }
    }

    /// Caps the number of block collections kept.
    pub fn with_block_limit(self, limit: usize) -> Self {
        self.lock().block_limit = limit.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn quorum(&self) -> QuorumRatio {
        self.quorum
    }

    /// Number of votes recorded for a block from members of `delegates`.
    pub fn tally(&self, block_hash: &Hash, delegates: &BTreeSet<RegId>) -> usize {
        self.lock().tally(block_hash, delegates)
    }

    /// Copy of a block's collection.
    pub fn votes_for(&self, block_hash: &Hash) -> Vec<V> {
        self.lock()
            .blocks
            .get(block_hash)
            .map(|entry| entry.votes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Votes recorded for any block at `height`.
    pub fn votes_at_height(&self, height: Height) -> usize {
        self.lock().height_votes.get(&height).copied().unwrap_or(0)
    }

    /// Drops all collections for blocks below `height`.
    pub fn prune_below(&self, height: Height) {
        let mut inner = self.lock();
        let stale: Vec<Height> = inner.heights.range(..height).map(|(h, _)| *h).collect();
        for h in stale {
            inner.drop_height(h);
        }
    }

    pub fn tracked_blocks(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Height a tracked block was recorded at.
    pub fn block_height(&self, block_hash: &Hash) -> Option<Height> {
        self.lock().blocks.get(block_hash).map(|entry| entry.height)
    }
}

impl<V: VoteMessage> VoteRecords<V> for VoteStore<V> {
    fn is_known(&self, vote: &V) -> bool {
        self.lock().known.contains(&vote.key())
    }

    fn add_known(&self, vote: &V) {
        self.lock().known.insert(vote.key());
    }

    fn insert(&self, vote: V) -> Option<usize> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let key = vote.key();
        inner.known.insert(key);

        let height = vote.height();
        let block_hash = vote.block_hash();
        let exists = match inner.blocks.get(&block_hash) {
            Some(entry) if entry.votes.contains_key(&key.validator) => {
                log::debug!(
                    target: "pbft",
                    "duplicate {} vote dropped, miner={}, block=[{}]{}",
                    V::KIND,
                    key.validator,
                    height,
                    block_hash
                );
                return Some(entry.votes.len());
            }
            entry => entry.is_some(),
        };
        if inner.hashes_voted(&key.validator, height) >= MAX_HASHES_PER_VALIDATOR {
            log::debug!(
                target: "pbft",
                "{} vote declined, miner={} already voted for {} blocks at height {}",
                V::KIND,
                key.validator,
                MAX_HASHES_PER_VALIDATOR,
                height
            );
            return None;
        }
        if !exists {
            if inner.blocks.len() >= inner.block_limit && !inner.make_room(height) {
                log::debug!(
                    target: "pbft",
                    "{} vote declined, store full, block=[{}]{}",
                    V::KIND,
                    height,
                    block_hash
                );
                return None;
            }
            inner.heights.entry(height).or_default().push(block_hash);
            inner.blocks.insert(
                block_hash,
                BlockVotes {
                    height,
                    votes: HashMap::new(),
                },
            );
        }

        *inner.height_votes.entry(height).or_insert(0) += 1;
        let entry = inner.blocks.get_mut(&block_hash)?;
        entry.votes.insert(key.validator, vote);
        Some(entry.votes.len())
    }

    fn check_quorum(&self, block_hash: &Hash, delegates: &BTreeSet<RegId>) -> bool {
        let count = self.tally(block_hash, delegates);
        self.quorum.is_reached(count, delegates.len())
    }

    fn is_broadcasted(&self, block_hash: &Hash) -> bool {
        self.lock().broadcasted.contains(block_hash)
    }

    fn mark_broadcasted(&self, block_hash: Hash) -> bool {
        self.lock().broadcasted.insert(block_hash)
    }

    fn observe_tip(&self, height: Height) {
        self.lock().tip = height;
    }
}

/// Second-round store. Global finality is only attempted for a height once
/// enough votes arrived for it, so this store exposes the per-height count.
pub struct FinalityVoteStore {
    votes: VoteStore<FinalityVote>,
}

impl FinalityVoteStore {
    pub fn new(quorum: QuorumRatio, known_capacity: usize, broadcast_capacity: usize) -> Self {
        Self {
            votes: VoteStore::new(quorum, known_capacity, broadcast_capacity),
        }
    }

    pub fn with_block_limit(self, limit: usize) -> Self {
        Self {
            votes: self.votes.with_block_limit(limit),
        }
    }

    /// Votes accepted for any block at `height` and still tracked.
    pub fn vote_count_for_height(&self, height: Height) -> usize {
        self.votes.votes_at_height(height)
    }

    pub fn quorum(&self) -> QuorumRatio {
        self.votes.quorum()
    }

    pub fn tally(&self, block_hash: &Hash, delegates: &BTreeSet<RegId>) -> usize {
        self.votes.tally(block_hash, delegates)
    }

    pub fn votes_for(&self, block_hash: &Hash) -> Vec<FinalityVote> {
        self.votes.votes_for(block_hash)
    }

    pub fn prune_below(&self, height: Height) {
        self.votes.prune_below(height);
    }

    pub fn tracked_blocks(&self) -> usize {
        self.votes.tracked_blocks()
    }
}

impl VoteRecords<FinalityVote> for FinalityVoteStore {
    fn is_known(&self, vote: &FinalityVote) -> bool {
        self.votes.is_known(vote)
    }

    fn add_known(&self, vote: &FinalityVote) {
        self.votes.add_known(vote);
    }

    fn insert(&self, vote: FinalityVote) -> Option<usize> {
        self.votes.insert(vote)
    }

    fn check_quorum(&self, block_hash: &Hash, delegates: &BTreeSet<RegId>) -> bool {
        self.votes.check_quorum(block_hash, delegates)
    }

    fn is_broadcasted(&self, block_hash: &Hash) -> bool {
        self.votes.is_broadcasted(block_hash)
    }

    fn mark_broadcasted(&self, block_hash: Hash) -> bool {
        self.votes.mark_broadcasted(block_hash)
    }

    fn observe_tip(&self, height: Height) {
        self.votes.observe_tip(height);
    }
}
