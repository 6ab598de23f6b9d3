#![allow(dead_code)]

use pbft_finality::chain::{ChainIndex, MemChain, NodeStatus};
use pbft_finality::config::FinalityConfig;
use pbft_finality::crypto::{PrivateKey, generate_keypair_from_id, sign};
use pbft_finality::delegates::{ActiveDelegates, StaticDelegates};
use pbft_finality::network::{PeerMessage, PeerSet};
use pbft_finality::storage::{FinalityStore, MemStorage};
use pbft_finality::types::{BlockRef, ConfirmVote, FinalityVote, Height, RegId, Vote, VoteKind};
use pbft_finality::wallet::{Account, AccountBook, KeyStore};
use pbft_finality::{Collaborators, FinalityCoordinator, FinalityError};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const GENESIS_TIME: u64 = 1_700_000_000;
pub const BLOCK_SPACING: u64 = 3;

pub fn regid(i: usize) -> RegId {
    RegId::new(1, i as u16)
}

pub fn delegate_key(i: usize) -> PrivateKey {
    generate_keypair_from_id(i as u64 + 1).1
}

/// Vote signed with delegate `i`'s owner key.
pub fn signed_vote(kind: VoteKind, block: &BlockRef, i: usize) -> Vote {
    let mut vote = Vote::unsigned(kind, block, regid(i));
    vote.signature = sign(&delegate_key(i), &vote.signing_hash().0);
    vote
}

pub fn confirm(block: &BlockRef, i: usize) -> ConfirmVote {
    ConfirmVote(signed_vote(VoteKind::Confirm, block, i))
}

pub fn finality(block: &BlockRef, i: usize) -> FinalityVote {
    FinalityVote(signed_vote(VoteKind::Finality, block, i))
}

/// Drains a peer queue.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<PeerMessage>) -> Vec<PeerMessage> {
    let mut out = vec![];
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

pub fn count_confirms(messages: &[PeerMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, PeerMessage::Confirm(_)))
        .count()
}

pub fn count_finality(messages: &[PeerMessage]) -> usize {
    messages
        .iter()
        .filter(|m| matches!(m, PeerMessage::Finality(_)))
        .count()
}

/// One node with in-memory collaborators.
pub struct TestNode {
    pub chain: Arc<MemChain>,
    pub delegates: Arc<StaticDelegates>,
    pub accounts: Arc<AccountBook>,
    pub wallet: Arc<KeyStore>,
    pub peers: Arc<PeerSet>,
    pub status: Arc<NodeStatus>,
    pub storage: Arc<dyn FinalityStore>,
    pub coordinator: FinalityCoordinator,
}

impl TestNode {
    pub fn tip(&self) -> BlockRef {
        self.chain.view().tip()
    }

    pub fn block(&self, height: Height) -> BlockRef {
        self.chain
            .view()
            .at_height(height)
            .unwrap_or_else(|| panic!("no block at height {}", height))
    }
}

pub struct NodeBuilder {
    delegates: usize,
    accounts: usize,
    blocks: u32,
    local_keys: Vec<usize>,
    config: FinalityConfig,
    chain: Option<Arc<MemChain>>,
    storage: Option<Arc<dyn FinalityStore>>,
}

impl NodeBuilder {
    /// Four delegates, twenty blocks, no local keys.
    pub fn new() -> Self {
        Self {
            delegates: 4,
            accounts: 0,
            blocks: 20,
            local_keys: vec![],
            config: FinalityConfig::default(),
            chain: None,
            storage: None,
        }
    }

    pub fn delegates(mut self, n: usize) -> Self {
        self.delegates = n;
        self
    }

    /// Registered accounts, at least one per delegate.
    pub fn accounts(mut self, n: usize) -> Self {
        self.accounts = n;
        self
    }

    pub fn blocks(mut self, n: u32) -> Self {
        self.blocks = n;
        self
    }

    /// Delegates whose keys this node holds. Implies block generation.
    pub fn local_keys(mut self, keys: &[usize]) -> Self {
        self.local_keys = keys.to_vec();
        self.config.gen_block = true;
        self
    }

    pub fn config(mut self, config: FinalityConfig) -> Self {
        self.config = config;
        self
    }

    /// Reuses an existing chain; `blocks` is then ignored.
    pub fn chain(mut self, chain: Arc<MemChain>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn FinalityStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn try_build(self) -> Result<TestNode, FinalityError> {
        let chain = match self.chain {
            Some(chain) => chain,
            None => {
                let chain = Arc::new(MemChain::new(GENESIS_TIME));
                chain.extend(self.blocks, BLOCK_SPACING);
                chain
            }
        };
        let delegates = Arc::new(StaticDelegates::new(ActiveDelegates::fixed(
            (0..self.delegates).map(regid).collect(),
        )));

        let accounts = Arc::new(AccountBook::new());
        for i in 0..self.accounts.max(self.delegates) {
            accounts.register(Account {
                regid: regid(i),
                owner_pubkey: delegate_key(i).public_key(),
                miner_pubkey: None,
            });
        }
        let wallet = Arc::new(KeyStore::new());
        for &i in &self.local_keys {
            wallet.add_key(delegate_key(i));
        }

        let peers = Arc::new(PeerSet::new(
            self.config.known_cache_size,
            self.config.ban_score,
        ));
        let status = Arc::new(NodeStatus::pinned(chain.view().tip().time + 1));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemStorage::new()) as Arc<dyn FinalityStore>);

        let coordinator = FinalityCoordinator::new(
            self.config,
            Collaborators {
                chain: chain.clone(),
                delegates: delegates.clone(),
                accounts: accounts.clone(),
                wallet: wallet.clone(),
                transport: peers.clone(),
                storage: storage.clone(),
                status: status.clone(),
            },
        )?;

        Ok(TestNode {
            chain,
            delegates,
            accounts,
            wallet,
            peers,
            status,
            storage,
            coordinator,
        })
    }

    pub fn build(self) -> TestNode {
        self.try_build().expect("failed to build test node")
    }
}
