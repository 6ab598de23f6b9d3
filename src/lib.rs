pub mod bounded_set;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod delegates;
pub mod finality;
pub mod network;
pub mod storage;
pub mod types;
pub mod vote_store;
pub mod wallet;

pub use finality::{Collaborators, FinalityCoordinator, FinalityError, VoteOutcome};
