//! Switching the consensus tip between competing chains

mod common;

use common::{test_config, Harness, PEER_A, PEER_B};
use tessera_common::network::NetworkParams;
use tessera_module_consensus::{
    chained_header::ValidationState, chained_header_tree::TieBreak,
    configuration::ConsensusConfig, manager_error::ConsensusManagerError,
};
use tessera_test_utils::{coinbase, spend, ChainBuilder, ChainEvent};

/// Main chain of `length` blocks, fully synced from `PEER_A`
async fn synced(length: u64) -> (Harness, ChainBuilder) {
    let h = Harness::new().await;
    let mut main = h.chain();
    main.mine_n(length);
    h.sync(PEER_A, &main, 1..=length).await;
    assert_eq!(h.manager.tip().unwrap(), main.tip());
    h.events.take();
    (h, main)
}

#[tokio::test]
async fn heavier_fork_replaces_the_tip() {
    let (h, main) = synced(10).await;
    let mut fork = main.fork_at(5, 1);
    fork.mine_n(7);

    h.manager.headers_presented(PEER_B, fork.headers(6..=12)).await.unwrap();
    assert_eq!(h.manager.best_known_tip().unwrap(), fork.tip());

    for height in 6..=10 {
        h.deliver(PEER_B, &fork, height).await.unwrap();
        assert_eq!(h.manager.tip().unwrap(), main.tip(), "switched early at {height}");
    }
    h.deliver(PEER_B, &fork, 11).await.unwrap();
    assert_eq!(h.manager.tip().unwrap(), fork.hash_height(11));
    h.deliver(PEER_B, &fork, 12).await.unwrap();
    assert_eq!(h.manager.tip().unwrap(), fork.tip());

    let mut expected: Vec<ChainEvent> =
        main.hash_heights(6..=10).into_iter().rev().map(ChainEvent::Disconnected).collect();
    expected.extend(fork.hash_heights(6..=12).into_iter().map(ChainEvent::Connected));
    assert_eq!(h.events.events(), expected);

    assert_eq!(h.manager.header_at(6).unwrap().as_ref(), Some(fork.header(6)));
    assert_eq!(h.manager.header_at(5).unwrap().as_ref(), Some(main.header(5)));
    assert!(h.banning.bans().is_empty());
}

#[tokio::test]
async fn equal_work_keeps_the_current_tip() {
    let (h, main) = synced(8).await;
    let mut fork = main.fork_at(5, 1);
    fork.mine_n(3);

    h.manager.headers_presented(PEER_B, fork.headers(6..=8)).await.unwrap();
    assert_eq!(h.manager.best_known_tip().unwrap(), main.tip());
    for height in 6..=8 {
        h.deliver(PEER_B, &fork, height).await.unwrap();
    }
    assert_eq!(h.manager.tip().unwrap(), main.tip());
    assert!(h.events.events().is_empty());

    // One more block tips the balance
    fork.mine();
    h.manager.headers_presented(PEER_B, fork.headers(9..=9)).await.unwrap();
    assert_eq!(h.downloader.requested().last(), Some(&fork.tip()));
    h.deliver(PEER_B, &fork, 9).await.unwrap();

    assert_eq!(h.manager.tip().unwrap(), fork.tip());
    let events = h.events.events();
    assert_eq!(events.len(), 3 + 4);
    assert_eq!(events[0], ChainEvent::Disconnected(main.tip()));
    assert_eq!(events[6], ChainEvent::Connected(fork.tip()));
}

#[tokio::test]
async fn failing_fork_is_rolled_back() {
    let (h, main) = synced(6).await;
    let mut fork = main.fork_at(3, 1);
    fork.mine();
    // Spends an output that never existed
    let phantom = coinbase(999, 9, 1);
    let bad = fork.mine_with(vec![spend(&phantom, 0, &[1])]);
    fork.mine_n(2);

    h.manager.headers_presented(PEER_B, fork.headers(4..=7)).await.unwrap();
    for height in 4..=6 {
        h.deliver(PEER_B, &fork, height).await.unwrap();
    }
    assert_eq!(h.manager.tip().unwrap(), main.tip());

    let result = h.deliver(PEER_B, &fork, 7).await;
    match result {
        Err(ConsensusManagerError::Rule { hash, peer, error }) => {
            assert_eq!(hash, bad.hash());
            assert_eq!(peer, Some(PEER_B));
            assert_eq!(error.code, "bad-txns-inputs-missingorspent");
        }
        other => panic!("expected a rule failure, got {other:?}"),
    }

    assert_eq!(h.manager.tip().unwrap(), main.tip());
    assert_eq!(h.manager.best_known_tip().unwrap(), main.tip());
    assert!(h.events.events().is_empty());
    assert!(h.banning.is_banned(PEER_B));
    assert!(!h.banning.is_banned(PEER_A));

    assert_eq!(h.state_of(&fork.hash_height(4).hash), Some(ValidationState::PartiallyValidated));
    for height in 5..=7 {
        assert_eq!(h.state_of(&fork.hash_height(height).hash), Some(ValidationState::Invalid));
    }

    // The main chain's coins are back in place
    assert!(h.coin_view.contains(&tessera_common::OutPoint::new(main.coinbase_of(6).txid(), 0)));
    assert!(!h.coin_view.contains(&tessera_common::OutPoint::new(fork.coinbase_of(4).txid(), 0)));

    // And the main chain still extends
    let mut main = main;
    main.mine();
    h.sync(PEER_A, &main, 7..=7).await;
    assert_eq!(h.manager.tip().unwrap(), main.tip());
}

#[tokio::test]
async fn sibling_tie_break_follows_configuration() {
    let params = NetworkParams::regtest();
    let mut base = ChainBuilder::new(&params);
    base.mine_n(2);
    let mut left = base.fork_at(2, 1);
    left.mine();
    let mut right = base.fork_at(2, 2);
    right.mine();
    let lowest = if left.tip().hash < right.tip().hash { left.tip() } else { right.tip() };

    for (tie_break, expected) in [(TieBreak::EarliestSeen, left.tip()), (TieBreak::LowestHash, lowest)] {
        let h = Harness::with_config(ConsensusConfig {
            tie_break,
            ..test_config()
        })
        .await;
        h.manager.headers_presented(PEER_A, base.headers(1..=2)).await.unwrap();
        h.manager.headers_presented(PEER_A, left.headers(3..=3)).await.unwrap();
        h.manager.headers_presented(PEER_B, right.headers(3..=3)).await.unwrap();
        assert_eq!(h.manager.best_known_tip().unwrap(), expected, "{tie_break:?}");
    }
}
