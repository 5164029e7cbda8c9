//! End-to-end fetch → stage → apply tests against the in-memory store.

mod common;

use common::*;

use stakeindex_core::model::TransactionKind;
use stakeindex_core::store::{CursorStore, EventLogStore, StakingReader};
use stakeindex_core::{
    ApplyOutcome, EventId, EventKind, FetchLoop, FetchOutcome, IndexPhase, IndexerState,
    IndexerStatus, TokenAmount,
};

fn amount(n: u128) -> TokenAmount {
    TokenAmount::from_u128(n)
}

// ─── Stake lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stake_then_unstake_with_reward() {
    let chain = ScriptedChain::new(250).with_events([
        pool_created(50, 0, 1),
        staked(100, 0, ALICE, 1, 1_000),
        unstaked(200, 0, ALICE, 1, 1_000, 50),
    ]);
    let p = Pipeline::new(chain, 1_000, 50);

    let report = p.sync(IndexPhase::Backfill).await;
    assert_eq!(report.applied, 3);
    assert_eq!(report.skipped, 0);

    let txs = p.store.transactions().unwrap();
    let kinds: Vec<_> = txs.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransactionKind::Stake,
            TransactionKind::Unstake,
            TransactionKind::Reward
        ]
    );
    assert_eq!(txs[2].amount, amount(50));
    assert_eq!(txs[2].pool_id, Some(1));

    let user = p.store.user_aggregate(ALICE).await.unwrap().unwrap();
    assert_eq!(user.total_staked, TokenAmount::ZERO);
    assert_eq!(user.total_rewards, amount(50));
    assert_eq!(user.active_stakes, 0);
    assert_eq!(user.total_stakes, 1);
    assert!(user.active_pools.is_empty());

    let pool = p.store.pool_aggregate(1).await.unwrap().unwrap();
    assert_eq!(pool.total_staked, TokenAmount::ZERO);
    assert_eq!(pool.total_rewards_distributed, amount(50));
    assert_eq!(pool.params.as_ref().map(|p| p.apy), Some(1_200));

    let stakes = p.store.stakes(ALICE).await.unwrap();
    assert_eq!(stakes.len(), 1);
    assert!(!stakes[0].active);
    assert_eq!(stakes[0].closed_by, Some(EventId::new(tx_hash(200, 0), 0)));
    assert_eq!(stakes[0].reward, amount(50));
    assert!(!stakes[0].early_unstake);

    let status = IndexerStatus::read(p.store.as_ref(), "staking", false, IndexerState::Idle, epoch())
        .await
        .unwrap();
    assert_eq!(status.last_processed_block, 200);
    assert_eq!(status.last_fetched_block, Some(250));
    assert_eq!(status.unprocessed_events, 0);
    assert_eq!(status.total_events, 3);
}

#[tokio::test]
async fn unstake_without_reward_is_early() {
    let chain = ScriptedChain::new(50).with_events([
        staked(10, 0, ALICE, 0, 500),
        unstaked(20, 0, ALICE, 0, 500, 0),
    ]);
    let p = Pipeline::new(chain, 100, 50);
    p.sync(IndexPhase::Backfill).await;

    let txs = p.store.transactions().unwrap();
    assert_eq!(txs.len(), 2);
    assert!(txs.iter().all(|t| t.kind != TransactionKind::Reward));

    let stake = &p.store.stakes(ALICE).await.unwrap()[0];
    assert!(stake.early_unstake);
    assert_eq!(stake.reward, TokenAmount::ZERO);
}

#[tokio::test]
async fn unmatched_unstake_is_skipped_without_writes() {
    let chain = ScriptedChain::new(50).with_events([unstaked(20, 0, BOB, 3, 700, 10)]);
    let p = Pipeline::new(chain, 100, 50);

    let report = p.sync(IndexPhase::Backfill).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 0);

    assert!(p.store.transactions().unwrap().is_empty());
    assert!(p.store.user_aggregate(BOB).await.unwrap().is_none());

    let staged = p.store.staged_events().unwrap();
    assert!(staged[0].processed);
    assert!(staged[0].note.as_deref().unwrap().contains("no active stake"));
}

#[tokio::test]
async fn unstake_prefers_stake_with_equal_amount() {
    let chain = ScriptedChain::new(50).with_events([
        staked(10, 0, ALICE, 0, 100),
        staked(11, 0, ALICE, 0, 300),
        unstaked(20, 0, ALICE, 0, 300, 5),
    ]);
    let p = Pipeline::new(chain, 100, 50);
    p.sync(IndexPhase::Backfill).await;

    let active = p.store.active_stakes(ALICE).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].amount, amount(100));

    let user = p.store.user_aggregate(ALICE).await.unwrap().unwrap();
    assert_eq!(user.total_staked, amount(100));
    assert_eq!(user.total_stakes, 2);
}

#[tokio::test]
async fn reward_claim_adds_to_rewards_only() {
    let chain = ScriptedChain::new(50).with_events([
        staked(10, 0, ALICE, 0, 100),
        reward_claimed(30, 0, ALICE, 7),
    ]);
    let p = Pipeline::new(chain, 100, 50);
    p.sync(IndexPhase::Backfill).await;

    let user = p.store.user_aggregate(ALICE).await.unwrap().unwrap();
    assert_eq!(user.total_staked, amount(100));
    assert_eq!(user.total_rewards, amount(7));

    let claim = p.store.recent_transactions(1, Some(ALICE)).await.unwrap();
    assert_eq!(claim[0].kind, TransactionKind::Reward);
    assert_eq!(claim[0].pool_id, None);
}

#[tokio::test]
async fn malformed_payload_is_skipped_with_note() {
    let bad = raw(
        EventKind::Staked,
        15,
        2,
        serde_json::json!({ "topics": ["0x00"], "data": "0x", "decodeError": "short data" }),
    );
    let chain = ScriptedChain::new(50).with_events([bad, staked(16, 0, ALICE, 0, 10)]);
    let p = Pipeline::new(chain, 100, 50);

    let report = p.sync(IndexPhase::Backfill).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.applied, 1);

    let staged = p.store.staged_events().unwrap();
    let note = staged
        .iter()
        .find(|e| e.event.block_number == 15)
        .and_then(|e| e.note.clone())
        .unwrap();
    assert!(note.contains("Malformed event"), "{note}");
}

// ─── Ordering ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn apply_follows_chain_position_not_staging_order() {
    // Fetched kind by kind, so both Staked rows come back before the Unstaked row.
    let chain = ScriptedChain::new(50).with_events([
        staked(20, 3, ALICE, 0, 1_000),
        unstaked(20, 5, ALICE, 0, 1_000, 0),
        staked(20, 7, ALICE, 0, 2_000),
    ]);
    let p = Pipeline::new(chain, 100, 1);
    p.sync(IndexPhase::Backfill).await;

    let active = p.store.active_stakes(ALICE).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].amount, amount(2_000));
    assert_eq!(active[0].opened_by, EventId::new(tx_hash(20, 7), 7));
}

#[tokio::test]
async fn apply_mid_chunk_never_sees_a_later_event_first() {
    let chain = ScriptedChain::new(100).with_events([staked(100, 0, ALICE, 0, 1_000)]);
    let p = Pipeline::new(chain, 100, 50);
    p.sync(IndexPhase::Live).await;

    p.chain.push(unstaked(105, 0, ALICE, 0, 1_000, 0));
    p.chain.push(staked(150, 0, BOB, 0, 10));
    p.chain.set_head(200);
    let gate = p.chain.pause_on(EventKind::Unstaked);

    // Apply fires while the fetch tick for [101, 200] is parked between kinds.
    let (fetched, mid_chunk) = tokio::join!(p.fetch.tick(), async {
        gate.reached().await;
        let report = p.apply.tick(IndexPhase::Live).await;
        gate.open();
        report
    });
    assert!(!fetched.unwrap().is_caught_up());
    assert_eq!(mid_chunk.unwrap().processed(), 0);

    let report = p.apply.drain(IndexPhase::Live).await.unwrap();
    assert_eq!(report.applied, 2);

    let blocks: Vec<_> = p.notifier.sent().iter().map(|n| n.block_number).collect();
    assert_eq!(blocks, vec![100, 105, 150]);
    assert!(p.store.active_stakes(ALICE).await.unwrap().is_empty());
}

#[tokio::test]
async fn stake_and_unstake_in_different_chunks() {
    let chain = ScriptedChain::new(35).with_events([
        staked(5, 0, ALICE, 2, 40),
        unstaked(15, 0, ALICE, 2, 40, 4),
        staked(25, 1, BOB, 2, 60),
    ]);
    let p = Pipeline::new(chain, 10, 2);

    let chunks = p.fetch.catch_up().await.unwrap();
    assert_eq!(chunks, 4);
    assert_eq!(p.store.load("staking").await.unwrap(), Some(35));

    let report = p.apply.drain(IndexPhase::Backfill).await.unwrap();
    assert_eq!(report.applied, 3);

    let pool = p.store.pool_aggregate(2).await.unwrap().unwrap();
    assert_eq!(pool.total_staked, amount(60));
    assert_eq!(pool.active_stakers, 1);
    assert_eq!(pool.total_rewards_distributed, amount(4));
}

// ─── Idempotency and recovery ────────────────────────────────────────────────

#[tokio::test]
async fn restaging_the_same_range_is_a_no_op() {
    let chain = ScriptedChain::new(100).with_events([
        staked(10, 0, ALICE, 0, 1),
        staked(20, 0, BOB, 0, 2),
    ]);
    let p = Pipeline::new(chain, 1_000, 50);
    p.sync(IndexPhase::Backfill).await;
    let txs_before = p.store.transactions().unwrap().len();

    // A second loop under another cursor key re-reads the same blocks.
    let config = stakeindex_core::IndexerBuilder::new()
        .id("replay")
        .contract_address(CONTRACT)
        .build()
        .unwrap();
    let replay = FetchLoop::new(&config, p.chain.clone(), p.store.clone());
    match replay.tick().await.unwrap() {
        FetchOutcome::Staged { stats, .. } => {
            assert_eq!(stats.unchanged, 2);
            assert_eq!(stats.inserted, 0);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(p.store.total_count().await.unwrap(), 2);
    assert_eq!(p.store.unprocessed_count().await.unwrap(), 0);
    assert_eq!(p.store.transactions().unwrap().len(), txs_before);
}

#[tokio::test]
async fn changed_content_is_restaged_and_reapplied() {
    let chain = ScriptedChain::new(100).with_events([pool_created(10, 0, 4)]);
    let p = Pipeline::new(chain, 1_000, 50);
    p.sync(IndexPhase::Backfill).await;

    let mut changed = pool_created(10, 0, 4);
    changed.block_timestamp += 1;
    let outcome = p.store.append(changed).await.unwrap();
    assert_eq!(outcome, stakeindex_core::AppendOutcome::Updated);
    assert_eq!(p.store.unprocessed_count().await.unwrap(), 1);

    let report = p.apply.drain(IndexPhase::Backfill).await.unwrap();
    assert_eq!(report.already_applied, 1);
    assert_eq!(p.store.pools().await.unwrap().len(), 1);
}

#[tokio::test]
async fn applying_an_event_twice_writes_once() {
    let p = Pipeline::new(ScriptedChain::new(0), 100, 50);
    let stake = staked(10, 0, ALICE, 0, 1_000);
    let unstake = unstaked(11, 0, ALICE, 0, 1_000, 25);

    assert!(matches!(
        p.apply.apply_event(&stake).await.unwrap(),
        ApplyOutcome::Applied(Some(_))
    ));
    assert_eq!(
        p.apply.apply_event(&stake).await.unwrap(),
        ApplyOutcome::AlreadyApplied
    );
    assert!(matches!(
        p.apply.apply_event(&unstake).await.unwrap(),
        ApplyOutcome::Applied(Some(_))
    ));
    assert_eq!(
        p.apply.apply_event(&unstake).await.unwrap(),
        ApplyOutcome::AlreadyApplied
    );

    assert_eq!(p.store.transactions().unwrap().len(), 3);
    let user = p.store.user_aggregate(ALICE).await.unwrap().unwrap();
    assert_eq!(user.total_rewards, amount(25));
    assert_eq!(user.total_stakes, 1);
}

#[tokio::test]
async fn crash_before_mark_processed_replays_cleanly() {
    let chain = ScriptedChain::new(50).with_events([
        staked(10, 0, ALICE, 0, 1_000),
        unstaked(20, 0, ALICE, 0, 1_000, 50),
    ]);
    let p = Pipeline::new(chain, 100, 50);
    p.fetch.catch_up().await.unwrap();

    // Rows written, but the process died before marking the events processed.
    for staged in p.store.staged_events().unwrap() {
        p.apply.apply_event(&staged.event).await.unwrap();
    }
    assert_eq!(p.store.unprocessed_count().await.unwrap(), 2);

    let report = p.apply.drain(IndexPhase::Backfill).await.unwrap();
    assert_eq!(report.already_applied, 2);
    assert_eq!(report.applied, 0);
    assert_eq!(p.store.unprocessed_count().await.unwrap(), 0);
    assert_eq!(p.store.transactions().unwrap().len(), 3);

    let user = p.store.user_aggregate(ALICE).await.unwrap().unwrap();
    assert_eq!(user.total_staked, TokenAmount::ZERO);
    assert_eq!(user.total_rewards, amount(50));
}

#[tokio::test]
async fn failed_fetch_leaves_cursor_in_place() {
    let chain = ScriptedChain::new(100).with_events([
        staked(10, 0, ALICE, 0, 1),
        unstaked(12, 0, ALICE, 0, 1, 0),
    ]);
    let p = Pipeline::new(chain, 1_000, 50);

    p.chain.fail_on(Some(EventKind::Unstaked));
    let err = p.fetch.tick().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(p.store.load("staking").await.unwrap(), None);
    // The Staked rows fetched before the failure were never staged.
    assert_eq!(p.store.total_count().await.unwrap(), 0);

    p.chain.fail_on(None);
    let outcome = p.fetch.tick().await.unwrap();
    assert!(!outcome.is_caught_up());
    assert_eq!(p.store.load("staking").await.unwrap(), Some(100));
    assert_eq!(p.store.total_count().await.unwrap(), 2);
}

#[tokio::test]
async fn caught_up_tick_does_not_move_cursor() {
    let p = Pipeline::new(ScriptedChain::new(40), 100, 50);
    p.fetch.catch_up().await.unwrap();
    assert_eq!(p.store.load("staking").await.unwrap(), Some(40));

    let outcome = p.fetch.tick().await.unwrap();
    assert_eq!(outcome, FetchOutcome::CaughtUp { head: 40 });
    assert_eq!(p.store.load("staking").await.unwrap(), Some(40));
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn user_pool_and_platform_totals_agree() {
    let chain = ScriptedChain::new(500).with_events([
        pool_created(1, 0, 0),
        pool_created(1, 1, 1),
        staked(10, 0, ALICE, 0, 1_000),
        staked(11, 0, ALICE, 1, 250),
        staked(12, 0, BOB, 0, 400),
        staked(13, 0, BOB, 1, 600),
        unstaked(50, 0, BOB, 0, 400, 12),
        staked(60, 0, ALICE, 0, 5),
        unstaked(70, 0, ALICE, 1, 250, 3),
        reward_claimed(80, 0, BOB, 9),
    ]);
    let p = Pipeline::new(chain, 64, 3);
    p.sync(IndexPhase::Backfill).await;

    let alice = p.store.user_aggregate(ALICE).await.unwrap().unwrap();
    let bob = p.store.user_aggregate(BOB).await.unwrap().unwrap();
    assert_eq!(alice.total_staked, amount(1_005));
    assert_eq!(bob.total_staked, amount(600));
    assert_eq!(alice.active_pools, vec![0]);
    assert_eq!(bob.active_pools, vec![1]);

    let pools = p.store.pools().await.unwrap();
    let pool_total: TokenAmount = pools.iter().map(|p| p.total_staked).sum();
    assert_eq!(pool_total, amount(1_605));

    let stats = p.store.platform_stats().await.unwrap();
    assert_eq!(stats.total_value_locked, amount(1_605));
    assert_eq!(stats.total_value_locked, alice.total_staked.saturating_add(bob.total_staked));
    assert_eq!(stats.total_rewards, amount(24));
    assert_eq!(stats.total_users, 2);
    assert_eq!(stats.total_stakers, 2);
    assert_eq!(stats.active_stakes, 3);
    assert_eq!(stats.total_pools, 2);

    let top = p.store.top_stakers(10).await.unwrap();
    let order: Vec<_> = top.iter().map(|u| u.address.as_str()).collect();
    assert_eq!(order, vec![ALICE, BOB]);
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[tokio::test]
async fn notifications_only_for_live_events() {
    let chain = ScriptedChain::new(100).with_events([staked(10, 0, ALICE, 0, 1)]);
    let p = Pipeline::new(chain, 1_000, 50);

    let backfill = p.sync(IndexPhase::Backfill).await;
    assert_eq!(backfill.notified, 0);
    assert!(p.notifier.sent().is_empty());

    p.chain.push(unstaked(150, 0, ALICE, 0, 1, 2));
    p.chain.push(reward_claimed(151, 0, ALICE, 3));
    p.chain.set_head(200);
    let live = p.sync(IndexPhase::Live).await;
    assert_eq!(live.applied, 2);
    assert_eq!(live.notified, 1);

    let sent = p.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_address, ALICE);
    assert_eq!(sent[0].reward, Some(amount(2)));
    assert_eq!(sent[0].block_number, 150);
}

#[tokio::test]
async fn notifier_failure_does_not_block_apply() {
    let chain = ScriptedChain::new(100).with_events([staked(10, 0, ALICE, 0, 1)]);
    let p = Pipeline::with_notifier(chain, 1_000, 50, RecordingNotifier::failing());

    let report = p.sync(IndexPhase::Live).await;
    assert_eq!(report.applied, 1);
    assert_eq!(report.notified, 0);
    assert_eq!(p.store.unprocessed_count().await.unwrap(), 0);
}
