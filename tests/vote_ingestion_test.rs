mod common;

use common::*;
use pbft_finality::config::FinalityConfig;
use pbft_finality::crypto::{Hash, sign};
use pbft_finality::finality::IgnoreReason;
use pbft_finality::network::{Misbehavior, PeerMessage};
use pbft_finality::types::{BlockRef, ConfirmVote, FinalityVote, RegId, Vote, VoteKind};
use pbft_finality::{FinalityError, VoteOutcome};

#[test]
fn test_simple_quorum_reaches_both_rounds() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 1. Four delegates, quorum is three
    let node = NodeBuilder::new().build();
    let _rx = node.peers.connect(1);
    let tip = node.tip();
    assert_eq!(node.coordinator.local_finality(), node.block(0));

    // 2. Confirm round
    for i in 0..2 {
        let outcome = node.coordinator.on_confirm_vote(1, confirm(&tip, i)).unwrap();
        assert_eq!(outcome, VoteOutcome::Accepted { advanced: false });
    }
    let outcome = node.coordinator.on_confirm_vote(1, confirm(&tip, 2)).unwrap();
    assert_eq!(outcome, VoteOutcome::Accepted { advanced: true });
    assert_eq!(node.coordinator.local_finality(), tip);
    assert_eq!(
        node.coordinator.local_last_update(),
        tip.time + 1,
        "Timestamp should come from the node clock"
    );
    assert_eq!(node.coordinator.global_finality(), node.block(0));

    // 3. Finality round
    for i in 0..2 {
        let outcome = node.coordinator.on_finality_vote(1, finality(&tip, i)).unwrap();
        assert_eq!(outcome, VoteOutcome::Accepted { advanced: false });
    }
    assert_eq!(node.coordinator.finality_votes().vote_count_for_height(tip.height), 2);
    let outcome = node.coordinator.on_finality_vote(1, finality(&tip, 2)).unwrap();
    assert_eq!(outcome, VoteOutcome::Accepted { advanced: true });
    assert_eq!(node.coordinator.global_finality(), tip);

    let record = node.storage.get_global_finality().unwrap().unwrap();
    assert_eq!(record.height, tip.height);
    assert_eq!(record.hash, tip.hash);
    assert_eq!(node.peers.misbehavior(1), 0);
}

#[test]
fn test_duplicate_vote_is_dropped() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let tip = node.tip();

    let vote = confirm(&tip, 0);
    assert_eq!(
        node.coordinator.on_confirm_vote(1, vote.clone()).unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );
    assert_eq!(
        node.coordinator.on_confirm_vote(2, vote).unwrap(),
        VoteOutcome::Duplicate
    );
    assert_eq!(node.coordinator.confirm_votes().votes_for(&tip.hash).len(), 1);
}

#[test]
fn test_stale_and_far_future_votes_are_ignored() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 1. Tip at 1000, accepted window is [900, 1100]
    let node = NodeBuilder::new().blocks(1000).build();
    let _rx = node.peers.connect(1);

    let stale = confirm(&node.block(850), 0);
    assert_eq!(
        node.coordinator.on_confirm_vote(1, stale).unwrap(),
        VoteOutcome::Ignored(IgnoreReason::OutOfRange)
    );
    assert_eq!(node.peers.misbehavior(1), 0, "Stale votes are not penalized");

    let far = BlockRef {
        height: 1101,
        hash: Hash([0x11; 32]),
        parent_hash: Hash([0x10; 32]),
        time: 0,
    };
    assert_eq!(
        node.coordinator.on_confirm_vote(1, confirm(&far, 0)).unwrap(),
        VoteOutcome::Ignored(IgnoreReason::OutOfRange)
    );

    // 2. Ahead of the tip but inside the window: no chain check yet
    let ahead = BlockRef {
        height: 1050,
        hash: Hash([0x22; 32]),
        parent_hash: Hash([0x21; 32]),
        time: 0,
    };
    assert_eq!(
        node.coordinator.on_confirm_vote(1, confirm(&ahead, 0)).unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );

    // 3. Window lower bound is inclusive
    assert_eq!(
        node.coordinator
            .on_confirm_vote(1, confirm(&node.block(900), 0))
            .unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );
    assert_eq!(node.peers.misbehavior(1), 0);
}

#[test]
fn test_vote_for_side_chain_block_is_ignored() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let _rx = node.peers.connect(1);

    let canonical = node.block(10);
    let fork = BlockRef {
        hash: Hash([0xaa; 32]),
        ..canonical
    };
    assert_eq!(
        node.coordinator.on_confirm_vote(1, confirm(&fork, 0)).unwrap(),
        VoteOutcome::Ignored(IgnoreReason::NotOnActiveChain)
    );
    assert_eq!(node.peers.misbehavior(1), 0);
}

#[test]
fn test_pointer_raises_lower_bound() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let tip = node.tip();
    for i in 0..3 {
        node.coordinator.on_confirm_vote(1, confirm(&tip, i)).unwrap();
    }
    assert_eq!(node.coordinator.local_finality(), tip);

    // Below the local pointer
    assert_eq!(
        node.coordinator
            .on_confirm_vote(1, confirm(&node.block(19), 0))
            .unwrap(),
        VoteOutcome::Ignored(IgnoreReason::OutOfRange)
    );
    // At the local pointer
    assert_eq!(
        node.coordinator.on_confirm_vote(1, confirm(&tip, 3)).unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );
    // The finality round is bounded by the global pointer, still unset
    assert_eq!(
        node.coordinator
            .on_finality_vote(1, finality(&node.block(19), 0))
            .unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );
}

#[test]
fn test_forged_non_delegate_vote_is_penalized_but_kept() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 1. Delegate 4 has an account but is not in the active set
    let node = NodeBuilder::new().accounts(5).build();
    let _rx = node.peers.connect(1);
    let tip = node.tip();

    let outcome = node.coordinator.on_confirm_vote(1, confirm(&tip, 4)).unwrap();
    assert_eq!(outcome, VoteOutcome::Accepted { advanced: false });
    assert_eq!(node.peers.misbehavior(1), Misbehavior::NotADelegate.weight());

    // 2. It never counts towards quorum
    for i in 0..2 {
        let outcome = node.coordinator.on_confirm_vote(1, confirm(&tip, i)).unwrap();
        assert_eq!(outcome, VoteOutcome::Accepted { advanced: false });
    }
    assert_eq!(node.coordinator.confirm_votes().votes_for(&tip.hash).len(), 3);
    assert_eq!(node.coordinator.local_finality(), node.block(0));

    let outcome = node.coordinator.on_confirm_vote(1, confirm(&tip, 2)).unwrap();
    assert_eq!(outcome, VoteOutcome::Accepted { advanced: true });
}

#[test]
fn test_wrong_message_type_bans_peer() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let _rx = node.peers.connect(1);
    let tip = node.tip();

    let mislabeled = FinalityVote(signed_vote(VoteKind::Confirm, &tip, 0));
    assert_eq!(
        node.coordinator.on_finality_vote(1, mislabeled).unwrap(),
        VoteOutcome::Rejected(Misbehavior::WrongMessageType)
    );
    assert!(!node.peers.is_connected(1), "Peer should be banned at score 100");
    assert!(node.coordinator.finality_votes().votes_for(&tip.hash).is_empty());
}

#[test]
fn test_unknown_account_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let _rx = node.peers.connect(1);
    let tip = node.tip();

    let mut vote = Vote::unsigned(VoteKind::Confirm, &tip, RegId::new(99, 0));
    vote.signature = sign(&delegate_key(0), &vote.signing_hash().0);
    assert_eq!(
        node.coordinator.on_confirm_vote(1, ConfirmVote(vote)).unwrap(),
        VoteOutcome::Rejected(Misbehavior::UnknownAccount)
    );
    assert_eq!(
        node.peers.misbehavior(1),
        Misbehavior::NotADelegate.weight() + Misbehavior::UnknownAccount.weight()
    );
}

#[test]
fn test_bad_signature_rejected_and_not_marked_known() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let _rx = node.peers.connect(1);
    let tip = node.tip();

    // 1. Delegate 0's vote signed with delegate 1's key
    let mut forged = Vote::unsigned(VoteKind::Confirm, &tip, regid(0));
    forged.signature = sign(&delegate_key(1), &forged.signing_hash().0);
    assert_eq!(
        node.coordinator.on_confirm_vote(1, ConfirmVote(forged)).unwrap(),
        VoteOutcome::Rejected(Misbehavior::BadSignature)
    );
    assert_eq!(node.peers.misbehavior(1), Misbehavior::BadSignature.weight());

    // 2. The genuine vote is still accepted afterwards
    assert_eq!(
        node.coordinator.on_confirm_vote(2, confirm(&tip, 0)).unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );
}

#[test]
fn test_accepted_votes_are_relayed() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let mut origin = node.peers.connect(1);
    let mut other = node.peers.connect(2);
    let tip = node.tip();

    let vote = confirm(&tip, 0);
    node.coordinator.on_confirm_vote(1, vote.clone()).unwrap();

    assert!(drain(&mut origin).is_empty(), "No echo to the sender");
    assert_eq!(drain(&mut other), vec![PeerMessage::Confirm(vote.clone())]);

    // Rejected and ignored votes are not relayed
    let side = BlockRef {
        hash: Hash([1; 32]),
        ..node.block(5)
    };
    node.coordinator.on_confirm_vote(1, confirm(&side, 1)).unwrap();
    assert!(drain(&mut other).is_empty());
}

#[test]
fn test_delegate_cache_unavailable() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let tip = node.tip();
    node.delegates.set(None);

    let result = node.coordinator.on_confirm_vote(1, confirm(&tip, 0));
    assert!(matches!(result, Err(FinalityError::DelegatesUnavailable)));
    assert!(matches!(
        node.coordinator.advance_local(),
        Err(FinalityError::DelegatesUnavailable)
    ));
    assert!(
        node.coordinator.confirm_votes().votes_for(&tip.hash).is_empty(),
        "Nothing is recorded when validation aborts"
    );
}

#[test]
fn test_rejected_vote_does_not_suppress_relay_to_sender() {
    let _ = env_logger::builder().is_test(true).try_init();
    let node = NodeBuilder::new().build();
    let mut first = node.peers.connect(1);
    let _second = node.peers.connect(2);
    let tip = node.tip();

    // 1. Peer 1 sends delegate 0's vote with a bad signature
    let mut forged = Vote::unsigned(VoteKind::Confirm, &tip, regid(0));
    forged.signature = sign(&delegate_key(1), &forged.signing_hash().0);
    assert_eq!(
        node.coordinator.on_confirm_vote(1, ConfirmVote(forged)).unwrap(),
        VoteOutcome::Rejected(Misbehavior::BadSignature)
    );

    // 2. The genuine vote arrives from peer 2 and still reaches peer 1
    let genuine = confirm(&tip, 0);
    assert_eq!(
        node.coordinator.on_confirm_vote(2, genuine.clone()).unwrap(),
        VoteOutcome::Accepted { advanced: false }
    );
    assert_eq!(
        drain(&mut first),
        vec![PeerMessage::Confirm(genuine)],
        "Peer 1 never had a valid copy"
    );
}

#[test]
fn test_junk_future_votes_cannot_evict_honest_tallies() {
    let _ = env_logger::builder().is_test(true).try_init();

    // 1. Small store, honest votes for the tip from delegates 0 and 1
    let config = FinalityConfig {
        max_tracked_blocks: 32,
        ..FinalityConfig::default()
    };
    let node = NodeBuilder::new().config(config).build();
    let _rx = node.peers.connect(1);
    let tip = node.tip();
    for i in 0..2 {
        assert_eq!(
            node.coordinator.on_confirm_vote(1, confirm(&tip, i)).unwrap(),
            VoteOutcome::Accepted { advanced: false }
        );
    }

    // 2. Delegate 3 signs three made-up blocks at every height ahead of the tip
    for height in tip.height + 1..=tip.height + 100 {
        for k in 0..3u8 {
            let mut hash = [0xee; 32];
            hash[..4].copy_from_slice(&height.to_be_bytes());
            hash[4] = k;
            let junk = BlockRef {
                height,
                hash: Hash(hash),
                parent_hash: Hash([0xef; 32]),
                time: 0,
            };
            let outcome = node.coordinator.on_confirm_vote(1, confirm(&junk, 3)).unwrap();
            if k == 2 {
                assert_eq!(
                    outcome,
                    VoteOutcome::Ignored(IgnoreReason::NotRecorded),
                    "A third hash at one height exceeds the per-validator cap"
                );
            } else {
                assert!(matches!(
                    outcome,
                    VoteOutcome::Accepted { advanced: false }
                        | VoteOutcome::Ignored(IgnoreReason::NotRecorded)
                ));
            }
        }
    }
    assert!(node.coordinator.confirm_votes().tracked_blocks() <= 32);
    assert_eq!(
        node.coordinator.confirm_votes().votes_for(&tip.hash).len(),
        2,
        "Honest tally at the tip survives"
    );

    // 3. The third honest vote still finalizes the tip
    assert_eq!(
        node.coordinator.on_confirm_vote(1, confirm(&tip, 2)).unwrap(),
        VoteOutcome::Accepted { advanced: true }
    );
    assert_eq!(node.coordinator.local_finality(), tip);
    assert_eq!(node.peers.misbehavior(1), 0);
}
