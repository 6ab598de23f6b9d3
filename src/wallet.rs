use crate::crypto::{Hash, PrivateKey, PublicKey, sign, verify};
use crate::types::{RegId, Vote};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Key not found in wallet: {0:?}")]
    KeyNotFound(PublicKey),
    #[error("Wallet locked")]
    Locked,
}

/// On-chain account of a delegate. Votes may be signed with the owner key or
/// with the dedicated miner key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub regid: RegId,
    pub owner_pubkey: PublicKey,
    pub miner_pubkey: Option<PublicKey>,
}

impl Account {
    /// True if `vote` is signed by either of the account's keys.
    pub fn verify_vote(&self, vote: &Vote) -> bool {
        let message = vote.signing_hash();
        if verify(&self.owner_pubkey, &message.0, &vote.signature) {
            return true;
        }
        self.miner_pubkey
            .as_ref()
            .is_some_and(|pk| verify(pk, &message.0, &vote.signature))
    }
}

/// Account lookup collaborator.
pub trait AccountRegistry: Send + Sync {
    fn get_account(&self, regid: &RegId) -> Option<Account>;
}

/// Local key store collaborator. Keys are addressed by their public key.
pub trait Wallet: Send + Sync {
    /// Key this node would sign with for `account`, if it holds one.
    fn find_key(&self, account: &Account) -> Option<PublicKey>;
    fn sign(&self, key: &PublicKey, hash: &Hash) -> Result<Vec<u8>, WalletError>;

    fn has_usable_key(&self, account: &Account) -> bool {
        self.find_key(account).is_some()
    }
}

/// Signs `vote` in place with `key`.
pub fn sign_vote(wallet: &dyn Wallet, key: &PublicKey, vote: &mut Vote) -> Result<(), WalletError> {
    vote.signature = wallet.sign(key, &vote.signing_hash())?;
    Ok(())
}

/// In-memory account registry.
#[derive(Debug, Default)]
pub struct AccountBook {
    accounts: RwLock<HashMap<RegId, Account>>,
}

impl AccountBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, account: Account) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.regid, account);
    }
}

impl AccountRegistry for AccountBook {
    fn get_account(&self, regid: &RegId) -> Option<Account> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(regid)
            .cloned()
    }
}

/// In-memory wallet.
#[derive(Debug, Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<PublicKey, PrivateKey>>,
    locked: RwLock<bool>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_key(&self, key: PrivateKey) -> PublicKey {
        let pk = key.public_key();
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pk.clone(), key);
        pk
    }

    pub fn set_locked(&self, locked: bool) {
        *self.locked.write().unwrap_or_else(PoisonError::into_inner) = locked;
    }

    fn holds(&self, pk: &PublicKey) -> bool {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(pk)
    }
}

impl Wallet for KeyStore {
    fn find_key(&self, account: &Account) -> Option<PublicKey> {
        // Prefer the miner key so the owner key can stay offline.
        if let Some(miner) = account.miner_pubkey.as_ref().filter(|pk| self.holds(pk)) {
            return Some(miner.clone());
        }
        self.holds(&account.owner_pubkey)
            .then(|| account.owner_pubkey.clone())
    }

    fn sign(&self, key: &PublicKey, hash: &Hash) -> Result<Vec<u8>, WalletError> {
        if *self.locked.read().unwrap_or_else(PoisonError::into_inner) {
            return Err(WalletError::Locked);
        }
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let sk = keys
            .get(key)
            .ok_or_else(|| WalletError::KeyNotFound(key.clone()))?;
        Ok(sign(sk, &hash.0))
    }
}
