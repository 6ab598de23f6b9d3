//! Finality coordinator.
//!
//! Owns the local and global finality pointers, validates inbound confirm
//! and finality votes, advances the pointers when a quorum of the delegate
//! set in effect agrees, and emits this node's own votes.
//!
//! Lock order, everywhere: chain view, then the pointer mutex, then a vote
//! store's mutex.

use crate::chain::{ChainIndex, ChainView, SyncStatus};
use crate::config::{ConfigError, FinalityConfig};
use crate::crypto::Hash;
use crate::delegates::{ActiveDelegates, DelegateCache};
use crate::network::{self, GossipVote, Misbehavior, PeerId, Transport};
use crate::storage::{FinalityRecord, FinalityStore, StorageError};
use crate::types::{BlockRef, ConfirmVote, FinalityVote, Height, Vote, VoteKind, VoteMessage};
use crate::vote_store::{ConfirmVoteStore, FinalityVoteStore, VoteRecords, VoteStore};
use crate::wallet::{AccountRegistry, Wallet, sign_vote};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinalityError {
    #[error("get active delegates error")]
    DelegatesUnavailable,
    #[error(
        "global finality block changed at height {height}: recorded {recorded}, canonical {canonical}"
    )]
    FinalityBlockChanged {
        height: Height,
        recorded: Hash,
        canonical: Hash,
    },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Why a well-formed vote was dropped without penalty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Height outside the accepted window around the tip.
    OutOfRange,
    /// The block at that height on the canonical chain has another hash.
    NotOnActiveChain,
    /// The vote store declined it: the validator already has votes for too
    /// many blocks at that height, or the store is full of higher-ranked
    /// collections.
    NotRecorded,
}

/// Result of processing one inbound vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Recorded and relayed. `advanced` is set when the vote moved the
    /// finality pointer of its round.
    Accepted { advanced: bool },
    Duplicate,
    Ignored(IgnoreReason),
    Rejected(Misbehavior),
}

/// Result of processing a new tip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TipOutcome {
    pub local_advanced: bool,
    pub confirm_broadcast: bool,
    pub global_advanced: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FinalityPointer {
    pub block: BlockRef,
    /// Unix seconds of the last move.
    pub last_update: u64,
}

#[derive(Default)]
struct Pointers {
    local: Option<FinalityPointer>,
    global: Option<FinalityPointer>,
}

impl Pointers {
    fn local_height(&self) -> Height {
        self.local.map(|p| p.block.height).unwrap_or(0)
    }

    fn global_height(&self) -> Height {
        self.global.map(|p| p.block.height).unwrap_or(0)
    }
}

enum Check {
    Pass,
    Ignore(IgnoreReason),
    Reject(Misbehavior),
}

/// Collaborators injected into the coordinator.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainIndex>,
    pub delegates: Arc<dyn DelegateCache>,
    pub accounts: Arc<dyn AccountRegistry>,
    pub wallet: Arc<dyn Wallet>,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn FinalityStore>,
    pub status: Arc<dyn SyncStatus>,
}

pub struct FinalityCoordinator {
    config: FinalityConfig,
    deps: Collaborators,
    pointers: Mutex<Pointers>,
    confirm_votes: ConfirmVoteStore,
    finality_votes: FinalityVoteStore,
}

impl FinalityCoordinator {
    /// Builds the coordinator and seeds both pointers from the persisted
    /// global finality, if that block is still canonical.
    pub fn new(config: FinalityConfig, deps: Collaborators) -> Result<Self, FinalityError> {
        config.validate()?;
        let confirm_votes = VoteStore::new(
            config.quorum,
            config.known_cache_size,
            config.broadcast_cache_size,
        )
        .with_block_limit(config.max_tracked_blocks);
        let finality_votes = FinalityVoteStore::new(
            config.quorum,
            config.known_cache_size,
            config.broadcast_cache_size,
        )
        .with_block_limit(config.max_tracked_blocks);

        let mut pointers = Pointers::default();
        if let Some(record) = deps.storage.get_global_finality()? {
            let view = deps.chain.view();
            match view.at_height(record.height) {
                Some(block) if block.hash == record.hash => {
                    log::info!(
                        target: "pbft",
                        "loaded global finality {}",
                        block.id()
                    );
                    let pointer = FinalityPointer {
                        block,
                        last_update: deps.status.now(),
                    };
                    pointers.local = Some(pointer);
                    pointers.global = Some(pointer);
                }
                _ => log::warn!(
                    target: "pbft",
                    "persisted global finality [{}]{} is not on the active chain, starting from genesis",
                    record.height,
                    record.hash
                ),
            }
        }

        Ok(Self {
            config,
            deps,
            pointers: Mutex::new(pointers),
            confirm_votes,
            finality_votes,
        })
    }

    pub fn confirm_votes(&self) -> &ConfirmVoteStore {
        &self.confirm_votes
    }

    pub fn finality_votes(&self) -> &FinalityVoteStore {
        &self.finality_votes
    }

    fn lock_pointers(&self) -> MutexGuard<'_, Pointers> {
        self.pointers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_delegates(&self) -> Result<ActiveDelegates, FinalityError> {
        self.deps.delegates.active_delegates().ok_or_else(|| {
            log::error!(target: "pbft", "get active delegates error");
            FinalityError::DelegatesUnavailable
        })
    }

    pub fn local_pointer(&self) -> Option<FinalityPointer> {
        self.lock_pointers().local
    }

    pub fn global_pointer(&self) -> Option<FinalityPointer> {
        self.lock_pointers().global
    }

    /// Locally final block; genesis until the first advance.
    pub fn local_finality(&self) -> BlockRef {
        let view = self.deps.chain.view();
        let local = self.lock_pointers().local;
        local
            .map(|p| p.block)
            .or_else(|| view.genesis())
            .unwrap_or_else(|| view.tip())
    }

    /// Globally final block; genesis until the first commit.
    pub fn global_finality(&self) -> BlockRef {
        let view = self.deps.chain.view();
        let global = self.lock_pointers().global;
        global
            .map(|p| p.block)
            .or_else(|| view.genesis())
            .unwrap_or_else(|| view.tip())
    }

    /// Unix seconds of the last local finality move, 0 if it never moved.
    pub fn local_last_update(&self) -> u64 {
        self.lock_pointers()
            .local
            .map(|p| p.last_update)
            .unwrap_or(0)
    }

    /// Liveness escape hatch: forces local finality to the current tip.
    /// Called by the miner when local finality stalled; never automatic.
    pub fn reset_local_on_timeout(&self) {
        let view = self.deps.chain.view();
        let tip = view.tip();
        let mut pointers = self.lock_pointers();
        log::warn!(
            target: "pbft",
            "local finality timed out at height {}, reset to tip {}",
            pointers.local_height(),
            tip.id()
        );
        pointers.local = Some(FinalityPointer {
            block: tip,
            last_update: self.deps.status.now(),
        });
    }

    /// Walks back from the tip and moves local finality to the highest
    /// ancestor with a confirm quorum. Returns true if the pointer moved.
    pub fn advance_local(&self) -> Result<bool, FinalityError> {
        let view = self.deps.chain.view();
        let tip = view.tip();
        if tip.height == 0 {
            return Ok(false);
        }
        let delegates = self.active_delegates()?;
        let mut pointers = self.lock_pointers();
        let floor = pointers.local_height();

        let mut cursor = Some(tip);
        while let Some(block) = cursor {
            if block.height <= floor
                || block.height == 0
                || block.height + self.config.local_lookback <= tip.height
            {
                break;
            }
            if self
                .confirm_votes
                .check_quorum(&block.hash, &delegates.set_at(block.height))
            {
                log::info!(
                    target: "pbft",
                    "local finality advanced {} -> {}",
                    floor,
                    block.id()
                );
                pointers.local = Some(FinalityPointer {
                    block,
                    last_update: self.deps.status.now(),
                });
                return Ok(true);
            }
            cursor = view.parent(&block);
        }
        Ok(false)
    }

    /// Walks back from the tip and commits the highest ancestor with a
    /// finality quorum. Returns true if global finality moved.
    pub fn advance_global(&self) -> Result<bool, FinalityError> {
        let view = self.deps.chain.view();
        let tip = view.tip();
        let delegates = self.active_delegates()?;
        let mut pointers = self.lock_pointers();
        let floor = pointers.global_height();

        let mut cursor = Some(tip);
        while let Some(block) = cursor {
            if block.height <= floor
                || block.height == 0
                || block.height + self.config.global_lookback <= tip.height
            {
                break;
            }
            if self
                .finality_votes
                .check_quorum(&block.hash, &delegates.set_at(block.height))
            {
                return self.commit_global(&*view, &mut pointers, block.height);
            }
            cursor = view.parent(&block);
        }
        Ok(false)
    }

    /// Commits global finality at `height` after re-checking monotonicity
    /// and continuity against the current chain.
    pub fn try_commit_global(&self, height: Height) -> Result<bool, FinalityError> {
        let view = self.deps.chain.view();
        let mut pointers = self.lock_pointers();
        self.commit_global(&*view, &mut pointers, height)
    }

    fn commit_global(
        &self,
        view: &dyn ChainView,
        pointers: &mut Pointers,
        height: Height,
    ) -> Result<bool, FinalityError> {
        if pointers.local_height() < height {
            log::debug!(
                target: "pbft",
                "global finality {} cannot pass local finality {}",
                height,
                pointers.local_height()
            );
            return Ok(false);
        }
        if let Some(global) = pointers.global {
            if global.block.height >= height {
                return Ok(false);
            }
            if let Some(canonical) = view.at_height(global.block.height) {
                if canonical.hash != global.block.hash {
                    log::error!(
                        target: "pbft",
                        "Global finality block changed: recorded {}, canonical {}",
                        global.block.id(),
                        canonical.id()
                    );
                    return Err(FinalityError::FinalityBlockChanged {
                        height: global.block.height,
                        recorded: global.block.hash,
                        canonical: canonical.hash,
                    });
                }
            }
        } else if height == 0 {
            return Ok(false);
        }
        let Some(block) = view.at_height(height) else {
            return Ok(false);
        };

        self.deps.storage.save_global_finality(&FinalityRecord {
            height: block.height,
            hash: block.hash,
        })?;
        log::info!(
            target: "pbft",
            "global finality advanced {} -> {}",
            pointers.global_height(),
            block.id()
        );
        pointers.global = Some(FinalityPointer {
            block,
            last_update: self.deps.status.now(),
        });
        self.confirm_votes.prune_below(height);
        self.finality_votes.prune_below(height);
        Ok(true)
    }

    /// Tip trigger: local advance, own confirm vote, finality vote for a new
    /// local block, then global advance.
    pub fn on_new_tip(&self) -> Result<TipOutcome, FinalityError> {
        let tip_height = self.deps.chain.view().height();
        self.confirm_votes.observe_tip(tip_height);
        self.finality_votes.observe_tip(tip_height);

        let local_advanced = self.advance_local()?;
        let confirm_broadcast = self.broadcast_confirm()?;
        if local_advanced {
            self.broadcast_finality(&self.local_finality())?;
        }
        let global_advanced = self.advance_global()?;
        Ok(TipOutcome {
            local_advanced,
            confirm_broadcast,
            global_advanced,
        })
    }

    /// Inbound confirm vote from `peer`.
    pub fn on_confirm_vote(
        &self,
        peer: PeerId,
        vote: ConfirmVote,
    ) -> Result<VoteOutcome, FinalityError> {
        if let Some(outcome) = self.admit(peer, &vote, &self.confirm_votes)? {
            return Ok(outcome);
        }
        let Some(count) = self.confirm_votes.insert(vote.clone()) else {
            return Ok(VoteOutcome::Ignored(IgnoreReason::NotRecorded));
        };
        log::debug!(
            target: "pbft",
            "confirm vote from peer {} accepted, miner={}, block={}, votes={}",
            peer,
            vote.validator(),
            vote.0.block_id(),
            count
        );

        let advanced = self.advance_local_for(&vote.0)?;
        network::broadcast(self.deps.transport.as_ref(), &vote);
        if advanced {
            let block = self.local_finality();
            if let Err(e) = self.broadcast_finality(&block) {
                log::warn!(
                    target: "pbft",
                    "finality broadcast for {} failed: {}",
                    block.id(),
                    e
                );
            }
        }
        Ok(VoteOutcome::Accepted { advanced })
    }

    /// Inbound finality vote from `peer`.
    pub fn on_finality_vote(
        &self,
        peer: PeerId,
        vote: FinalityVote,
    ) -> Result<VoteOutcome, FinalityError> {
        if let Some(outcome) = self.admit(peer, &vote, &self.finality_votes)? {
            return Ok(outcome);
        }
        let Some(count) = self.finality_votes.insert(vote.clone()) else {
            return Ok(VoteOutcome::Ignored(IgnoreReason::NotRecorded));
        };
        log::debug!(
            target: "pbft",
            "finality vote from peer {} accepted, miner={}, block={}, votes={}",
            peer,
            vote.validator(),
            vote.0.block_id(),
            count
        );

        let advanced = self.advance_global_for(&vote.0);
        network::broadcast(self.deps.transport.as_ref(), &vote);
        Ok(VoteOutcome::Accepted {
            advanced: advanced?,
        })
    }

    /// Dedup and validation shared by both rounds. `Some` ends processing.
    fn admit<V: VoteMessage>(
        &self,
        peer: PeerId,
        vote: &V,
        store: &dyn VoteRecords<V>,
    ) -> Result<Option<VoteOutcome>, FinalityError> {
        if store.is_known(vote) {
            log::debug!(
                target: "net",
                "duplicate {} vote, miner={}, block={}",
                V::KIND,
                vote.validator(),
                vote.vote().block_id()
            );
            return Ok(Some(VoteOutcome::Duplicate));
        }

        let (check, tip_height) = {
            let view = self.deps.chain.view();
            let pointer = {
                let pointers = self.lock_pointers();
                match V::KIND {
                    VoteKind::Confirm => pointers.local,
                    VoteKind::Finality => pointers.global,
                }
            };
            let pointer = pointer.map(|p| p.block);
            let check = self.check_vote(&*view, peer, vote.vote(), V::KIND, pointer)?;
            (check, view.height())
        };
        match check {
            Check::Pass => {
                self.deps.transport.note_received(peer, vote.vote());
                store.add_known(vote);
                store.observe_tip(tip_height);
                Ok(None)
            }
            Check::Ignore(reason) => {
                log::debug!(
                    target: "pbft",
                    "{} vote ignored ({:?}), miner={}, block={}",
                    V::KIND,
                    reason,
                    vote.validator(),
                    vote.vote().block_id()
                );
                Ok(Some(VoteOutcome::Ignored(reason)))
            }
            Check::Reject(misbehavior) => {
                log::info!(
                    target: "net",
                    "{} vote check failed ({:?}), peer={}, miner={}, block={}",
                    V::KIND,
                    misbehavior,
                    peer,
                    vote.validator(),
                    vote.vote().block_id()
                );
                Ok(Some(VoteOutcome::Rejected(misbehavior)))
            }
        }
    }

    /// Validation of an inbound vote against the chain and delegate set.
    fn check_vote(
        &self,
        view: &dyn ChainView,
        peer: PeerId,
        vote: &Vote,
        expected: VoteKind,
        pointer: Option<BlockRef>,
    ) -> Result<Check, FinalityError> {
        let transport = self.deps.transport.as_ref();
        if vote.kind != expected {
            transport.penalize(peer, Misbehavior::WrongMessageType);
            return Ok(Check::Reject(Misbehavior::WrongMessageType));
        }

        let tip_height = view.height();
        let mut min_height = tip_height.saturating_sub(self.config.recent_window);
        if let Some(pointer) = pointer.filter(|p| view.contains(p)) {
            min_height = min_height.max(pointer.height.min(tip_height));
        }
        let max_height = tip_height.saturating_add(self.config.recent_window);
        if vote.height < min_height || vote.height > max_height {
            log::debug!(
                target: "pbft",
                "vote height {} is out of valid range [{}, {}]",
                vote.height,
                min_height,
                max_height
            );
            return Ok(Check::Ignore(IgnoreReason::OutOfRange));
        }

        if vote.height <= tip_height {
            let on_chain = view
                .at_height(vote.height)
                .is_some_and(|b| b.hash == vote.block_hash);
            if !on_chain {
                return Ok(Check::Ignore(IgnoreReason::NotOnActiveChain));
            }
        }

        let delegates = self.active_delegates()?;
        if !delegates.contains_at(vote.height, &vote.validator) {
            // Tolerated: the set may have rotated under the sender.
            log::info!(
                target: "net",
                "miner={} of vote is not in the delegate list, block={}",
                vote.validator,
                vote.block_id()
            );
            transport.penalize(peer, Misbehavior::NotADelegate);
        }

        let Some(account) = self.deps.accounts.get_account(&vote.validator) else {
            transport.penalize(peer, Misbehavior::UnknownAccount);
            return Ok(Check::Reject(Misbehavior::UnknownAccount));
        };
        if !account.verify_vote(vote) {
            transport.penalize(peer, Misbehavior::BadSignature);
            return Ok(Check::Reject(Misbehavior::BadSignature));
        }
        Ok(Check::Pass)
    }

    /// Local finality check for the block a confirm vote points at.
    fn advance_local_for(&self, vote: &Vote) -> Result<bool, FinalityError> {
        let view = self.deps.chain.view();
        let Some(block) = view
            .at_height(vote.height)
            .filter(|b| b.hash == vote.block_hash && b.has_parent())
        else {
            return Ok(false);
        };
        let delegates = self.active_delegates()?;

        let mut pointers = self.lock_pointers();
        if block.height <= pointers.local_height() {
            log::debug!(
                target: "pbft",
                "vote height {} is not above local finality {}",
                block.height,
                pointers.local_height()
            );
            return Ok(false);
        }
        if !self
            .confirm_votes
            .check_quorum(&block.hash, &delegates.set_at(block.height))
        {
            return Ok(false);
        }
        log::info!(
            target: "pbft",
            "local finality advanced {} -> {} by vote",
            pointers.local_height(),
            block.id()
        );
        pointers.local = Some(FinalityPointer {
            block,
            last_update: self.deps.status.now(),
        });
        Ok(true)
    }

    /// Global finality check for the block a finality vote points at, gated
    /// on the vote count for its height.
    fn advance_global_for(&self, vote: &Vote) -> Result<bool, FinalityError> {
        let view = self.deps.chain.view();
        let Some(block) = view
            .at_height(vote.height)
            .filter(|b| b.hash == vote.block_hash)
        else {
            log::debug!(
                target: "pbft",
                "block {} of finality vote is not active",
                vote.block_id()
            );
            return Ok(false);
        };
        let delegates = self.active_delegates()?;
        let set = delegates.set_at(block.height);
        let needed = self.finality_votes.quorum().min_votes(set.len());
        if self.finality_votes.vote_count_for_height(block.height) < needed {
            return Ok(false);
        }

        let mut pointers = self.lock_pointers();
        if block.height <= pointers.global_height() {
            log::debug!(
                target: "pbft",
                "vote height {} is not above global finality {}",
                block.height,
                pointers.global_height()
            );
            return Ok(false);
        }
        if !self.finality_votes.check_quorum(&block.hash, &set) {
            return Ok(false);
        }
        self.commit_global(&*view, &mut pointers, block.height)
    }

    /// Signs and broadcasts this node's confirm votes for the current tip.
    /// Returns true if votes for the tip were sent, now or earlier.
    pub fn broadcast_confirm(&self) -> Result<bool, FinalityError> {
        if !self.config.gen_block || self.deps.status.is_initial_block_download() {
            return Ok(false);
        }
        let view = self.deps.chain.view();
        let tip = view.tip();
        let age = self.deps.status.now().saturating_sub(tip.time);
        if age > self.config.confirm_staleness_secs {
            log::debug!(
                target: "pbft",
                "tip {} is {}s old, not confirming",
                tip.id(),
                age
            );
            return Ok(false);
        }
        self.broadcast_votes::<ConfirmVote>(&tip, &self.confirm_votes)
    }

    /// Signs and broadcasts this node's finality votes for `block`.
    pub fn broadcast_finality(&self, block: &BlockRef) -> Result<bool, FinalityError> {
        if !self.config.gen_block || self.deps.status.is_initial_block_download() {
            return Ok(false);
        }
        self.broadcast_votes::<FinalityVote>(block, &self.finality_votes)
    }

    fn broadcast_votes<V: GossipVote>(
        &self,
        block: &BlockRef,
        store: &dyn VoteRecords<V>,
    ) -> Result<bool, FinalityError> {
        if store.is_broadcasted(&block.hash) {
            return Ok(true);
        }
        if !block.has_parent() {
            return Ok(false);
        }
        let delegates = self.active_delegates()?;
        if !store.mark_broadcasted(block.hash) {
            // Claimed by a concurrent caller.
            return Ok(true);
        }
        let wallet = self.deps.wallet.as_ref();

        for regid in delegates.list_at(block.height) {
            let Some(account) = self.deps.accounts.get_account(regid) else {
                log::debug!(target: "pbft", "no account for delegate {}", regid);
                continue;
            };
            let Some(key) = wallet.find_key(&account) else {
                continue;
            };
            let mut vote = Vote::unsigned(V::KIND, block, *regid);
            if let Err(e) = sign_vote(wallet, &key, &mut vote) {
                log::warn!(
                    target: "pbft",
                    "failed to sign {} vote for {} as {}: {}",
                    V::KIND,
                    block.id(),
                    regid,
                    e
                );
                continue;
            }
            let vote = V::from_vote(vote);
            network::broadcast(self.deps.transport.as_ref(), &vote);
            store.insert(vote);
            log::info!(
                target: "pbft",
                "generated and broadcast {} vote, block={}, bp={}",
                V::KIND,
                block.id(),
                regid
            );
        }
        Ok(true)
    }
}
