use crate::crypto::{Hash, hash_data};
use crate::types::{BlockRef, Height};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// Read access to the block index under the chain-wide lock.
///
/// A view is a consistent snapshot: the tip and every lookup answer for the
/// same chain state until the view is dropped. Ancestor walks must be done
/// through a single view.
pub trait ChainView {
    fn tip(&self) -> BlockRef;
    /// Canonical block at `height`.
    fn at_height(&self, height: Height) -> Option<BlockRef>;
    /// Any indexed block, canonical or not.
    fn get(&self, hash: &Hash) -> Option<BlockRef>;

    fn height(&self) -> Height {
        self.tip().height
    }

    /// True if `block` is on the canonical chain.
    fn contains(&self, block: &BlockRef) -> bool {
        self.at_height(block.height)
            .is_some_and(|b| b.hash == block.hash)
    }

    fn parent(&self, block: &BlockRef) -> Option<BlockRef> {
        if !block.has_parent() {
            return None;
        }
        self.get(&block.parent_hash)
    }

    fn genesis(&self) -> Option<BlockRef> {
        self.at_height(0)
    }
}

/// Block index collaborator. `view` acquires the chain-wide lock.
pub trait ChainIndex: Send + Sync {
    fn view(&self) -> Box<dyn ChainView + '_>;
}

#[derive(Debug)]
struct ChainState {
    active: Vec<BlockRef>,
    index: HashMap<Hash, BlockRef>,
}

/// In-memory block index with reorg support.
#[derive(Debug)]
pub struct MemChain {
    state: RwLock<ChainState>,
}

struct MemChainView<'a> {
    state: RwLockReadGuard<'a, ChainState>,
}

impl ChainView for MemChainView<'_> {
    fn tip(&self) -> BlockRef {
        // The active chain always holds genesis.
        self.state.active[self.state.active.len() - 1]
    }

    fn at_height(&self, height: Height) -> Option<BlockRef> {
        self.state.active.get(height as usize).copied()
    }

    fn get(&self, hash: &Hash) -> Option<BlockRef> {
        self.state.index.get(hash).copied()
    }
}

impl ChainIndex for MemChain {
    fn view(&self) -> Box<dyn ChainView + '_> {
        Box::new(MemChainView {
            state: self.state.read().unwrap_or_else(PoisonError::into_inner),
        })
    }
}

impl MemChain {
    /// Chain holding only a genesis block with the given timestamp.
    pub fn new(genesis_time: u64) -> Self {
        let genesis = BlockRef {
            height: 0,
            hash: hash_data(&("genesis", genesis_time)),
            parent_hash: Hash::default(),
            time: genesis_time,
        };
        let mut index = HashMap::new();
        index.insert(genesis.hash, genesis);
        Self {
            state: RwLock::new(ChainState {
                active: vec![genesis],
                index,
            }),
        }
    }

    /// Appends one block on top of the tip. `salt` distinguishes forks.
    pub fn push(&self, time: u64, salt: u64) -> BlockRef {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let parent = state.active[state.active.len() - 1];
        let block = BlockRef {
            height: parent.height + 1,
            hash: hash_data(&(parent.height + 1, &parent.hash, salt)),
            parent_hash: parent.hash,
            time,
        };
        state.active.push(block);
        state.index.insert(block.hash, block);
        block
    }

    /// Appends `count` blocks spaced `spacing` seconds after the tip.
    pub fn extend(&self, count: u32, spacing: u64) -> BlockRef {
        let mut tip = self.view().tip();
        for _ in 0..count {
            tip = self.push(tip.time + spacing, 0);
        }
        tip
    }

    /// Replaces every block above `fork_height` with a new branch of
    /// `new_len` blocks. Replaced blocks stay indexed but leave the
    /// canonical chain.
    pub fn reorg(&self, fork_height: Height, new_len: u32, salt: u64) -> BlockRef {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.active.truncate(fork_height as usize + 1);
        }
        let mut tip = self.view().tip();
        for _ in 0..new_len {
            tip = self.push(tip.time + 1, salt);
        }
        log::info!(
            target: "pbft",
            "chain reorganised above height {}, new tip {}",
            fork_height,
            tip.id()
        );
        tip
    }
}

/// Node status collaborator: sync state and wall clock.
pub trait SyncStatus: Send + Sync {
    fn is_initial_block_download(&self) -> bool;
    /// Unix seconds.
    fn now(&self) -> u64;
}

/// Sync status with an optional pinned clock.
#[derive(Debug, Default)]
pub struct NodeStatus {
    ibd: AtomicBool,
    pinned_time: Option<AtomicU64>,
}

impl NodeStatus {
    /// Synced node reading the system clock.
    pub fn system() -> Self {
        Self::default()
    }

    /// Synced node whose clock only moves through `set_time`.
    pub fn pinned(now: u64) -> Self {
        Self {
            ibd: AtomicBool::new(false),
            pinned_time: Some(AtomicU64::new(now)),
        }
    }

    pub fn set_initial_block_download(&self, ibd: bool) {
        self.ibd.store(ibd, Ordering::SeqCst);
    }

    /// No-op on a system clock.
    pub fn set_time(&self, now: u64) {
        if let Some(pinned) = &self.pinned_time {
            pinned.store(now, Ordering::SeqCst);
        }
    }
}

impl SyncStatus for NodeStatus {
    fn is_initial_block_download(&self) -> bool {
        self.ibd.load(Ordering::SeqCst)
    }

    fn now(&self) -> u64 {
        match &self.pinned_time {
            Some(pinned) => pinned.load(Ordering::SeqCst),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}
