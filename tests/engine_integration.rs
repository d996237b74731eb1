//! End-to-end job lifecycle over the mock chain seam.

use bsc_wallet_sender::error::RetryPolicy;
use bsc_wallet_sender::explorer::ExplorerClient;
use bsc_wallet_sender::jobs::{EngineSettings, JobEngine, JobState};
use bsc_wallet_sender::limiter::ApiRateLimiter;
use bsc_wallet_sender::nonce::NonceAuthority;
use bsc_wallet_sender::pipeline::{GasPolicy, TransactionPipeline};
use bsc_wallet_sender::store::{JobStore, MemoryJobStore};
use bsc_wallet_sender::testing::{mock_pool, MockChainClient, ReceiptBehavior, TEST_PRIVATE_KEY};
use bsc_wallet_sender::token::TokenService;
use ethers::abi::{encode, Token};
use ethers::types::U256;
use ethers::utils::id;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    engine: Arc<JobEngine>,
    nonce: Arc<NonceAuthority>,
    store: Arc<MemoryJobStore>,
}

fn harness(client: MockChainClient, unit_interval: Duration, max_jobs: usize) -> Harness {
    let pool = Arc::new(mock_pool(client));
    let limiter = Arc::new(ApiRateLimiter::new(10_000, 10_000));
    let nonce = Arc::new(NonceAuthority::new(
        pool.clone(),
        Duration::from_secs(3600),
        100,
    ));
    let pipeline = Arc::new(TransactionPipeline::new(
        pool.clone(),
        nonce.clone(),
        limiter.clone(),
        56,
        Duration::from_millis(400),
        Duration::from_millis(10),
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        None,
    ));
    let tokens = Arc::new(TokenService::new(pool.clone(), limiter.clone()));
    let explorer = Arc::new(ExplorerClient::new(
        "http://127.0.0.1:1/api".to_string(),
        vec![],
        limiter,
    ));
    let store = Arc::new(MemoryJobStore::new());

    let engine = JobEngine::new(
        pipeline,
        tokens,
        explorer,
        store.clone(),
        EngineSettings {
            chain_id: 56,
            max_concurrent_jobs: max_jobs,
            control_poll: Duration::from_millis(10),
            unit_interval,
            gas_policy: GasPolicy::NetworkSuggested,
        },
    );
    engine.start();
    Harness {
        engine,
        nonce,
        store,
    }
}

fn recipients(count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| format!("0x{:040x}", 0xa000 + i))
        .collect()
}

#[tokio::test]
async fn distribution_completes_with_exact_counts() {
    let h = harness(
        MockChainClient::new("http://node").with_transaction_count(7),
        Duration::from_millis(1),
        2,
    );

    let id = h
        .engine
        .submit(
            "airdrop",
            "distribution",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "recipients": recipients(3),
                "amount_each": "0.5",
            }),
            5,
        )
        .await
        .unwrap();

    // The submission went through the durable store contract.
    let record = h.store.get_job(id).await.unwrap().unwrap();
    assert_eq!(record.mode, "distribution");

    let progress = h
        .engine
        .wait_until_done(id, Duration::from_secs(10))
        .await
        .expect("job must finish");
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.total_count, 3);
    assert_eq!(progress.done_count + progress.failed_count, 3);
    assert_eq!(progress.failed_count, 0);
    assert!(progress.is_done);

    // No Reserved ticket left behind.
    assert_eq!(h.nonce.pending_total().await, 0);
}

#[tokio::test]
async fn unknown_mode_rejected_at_submission() {
    let h = harness(
        MockChainClient::new("http://node"),
        Duration::from_millis(1),
        2,
    );
    let err = h
        .engine
        .submit("nope", "yield_farm", json!({}), 5)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Unknown job mode"));
}

#[tokio::test]
async fn unusable_key_fails_job_before_first_unit() {
    let h = harness(
        MockChainClient::new("http://node"),
        Duration::from_millis(1),
        2,
    );
    let id = h
        .engine
        .submit(
            "bad key",
            "distribution",
            json!({
                "sender_key": "not-a-key",
                "recipients": recipients(2),
                "amount_each": "1",
            }),
            5,
        )
        .await
        .unwrap();

    let progress = h
        .engine
        .wait_until_done(id, Duration::from_secs(5))
        .await
        .expect("job must finish");
    assert_eq!(progress.state, JobState::Failed);
    assert_eq!(progress.done_count, 0);
    assert_eq!(progress.failed_count, 0);
    assert!(progress.error.unwrap().contains("Fatal Config"));
}

#[tokio::test]
async fn cancel_stops_within_poll_interval_without_stranding_tickets() {
    let h = harness(
        MockChainClient::new("http://node").with_transaction_count(0),
        Duration::from_millis(50),
        2,
    );

    let id = h
        .engine
        .submit(
            "big airdrop",
            "distribution",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "recipients": recipients(50),
                "amount_each": "0.1",
            }),
            5,
        )
        .await
        .unwrap();

    // Let a couple of units land first.
    loop {
        let progress = h.engine.progress(id).await.unwrap();
        if progress.done_count + progress.failed_count >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(h.engine.cancel(id).await);
    let progress = h
        .engine
        .wait_until_done(id, Duration::from_secs(2))
        .await
        .expect("cancel must take effect within the polling interval");
    assert_eq!(progress.state, JobState::Cancelled);
    assert!(progress.is_done);
    assert!(progress.done_count + progress.failed_count < 50);

    // A cancelled unit-in-flight still resolved its ticket.
    assert_eq!(h.nonce.pending_total().await, 0);
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let h = harness(
        MockChainClient::new("http://node"),
        Duration::from_millis(50),
        2,
    );

    let id = h
        .engine
        .submit(
            "pausable",
            "distribution",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "recipients": recipients(10),
                "amount_each": "0.1",
            }),
            5,
        )
        .await
        .unwrap();

    loop {
        let progress = h.engine.progress(id).await.unwrap();
        if progress.done_count >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(h.engine.pause(id).await);
    let frozen = h.engine.progress(id).await.unwrap();
    assert_eq!(frozen.state, JobState::Paused);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let still = h.engine.progress(id).await.unwrap();
    // At most the unit already in flight landed while paused.
    assert!(still.done_count + still.failed_count <= frozen.done_count + frozen.failed_count + 1);

    assert!(h.engine.resume(id).await);
    let progress = h
        .engine
        .wait_until_done(id, Duration::from_secs(10))
        .await
        .expect("job must finish after resume");
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.done_count, 10);
}

#[tokio::test]
async fn jobs_beyond_worker_bound_stay_queued() {
    let h = harness(
        MockChainClient::new("http://node"),
        Duration::from_millis(50),
        1,
    );

    let first = h
        .engine
        .submit(
            "first",
            "distribution",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "recipients": recipients(10),
                "amount_each": "0.1",
            }),
            5,
        )
        .await
        .unwrap();
    let second = h
        .engine
        .submit(
            "second",
            "distribution",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "recipients": recipients(2),
                "amount_each": "0.1",
            }),
            5,
        )
        .await
        .unwrap();

    loop {
        let progress = h.engine.progress(first).await.unwrap();
        if progress.done_count >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        h.engine.progress(second).await.unwrap().state,
        JobState::Queued
    );

    let done_second = h
        .engine
        .wait_until_done(second, Duration::from_secs(10))
        .await
        .expect("queued job must run once a slot frees");
    assert_eq!(done_second.state, JobState::Completed);
}

#[tokio::test]
async fn confirmation_timeouts_do_not_abort_the_job() {
    let h = harness(
        MockChainClient::new("http://node").with_receipt_behavior(ReceiptBehavior::Never),
        Duration::from_millis(1),
        2,
    );

    let id = h
        .engine
        .submit(
            "all timeouts",
            "distribution",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "recipients": recipients(2),
                "amount_each": "0.1",
            }),
            5,
        )
        .await
        .unwrap();

    let progress = h
        .engine
        .wait_until_done(id, Duration::from_secs(10))
        .await
        .expect("job must finish despite timeouts");
    // Every unit was recorded as failed and the loop kept going.
    assert_eq!(progress.total_count, 2);
    assert_eq!(progress.failed_count, 2);
    assert_eq!(progress.done_count, 0);
    assert_eq!(progress.state, JobState::Failed);
    assert_eq!(h.nonce.pending_total().await, 0);
}

#[tokio::test]
async fn auto_sell_scales_by_fetched_decimals() {
    // A 9-decimal token, not the 18-decimal default.
    let client = MockChainClient::new("http://node")
        .with_transaction_count(0)
        .with_call_response(
            id("decimals()"),
            encode(&[Token::Uint(U256::from(9u64))]).into(),
        )
        .with_call_response(
            id("symbol()"),
            encode(&[Token::String("NINE".to_string())]).into(),
        )
        .with_call_response(
            id("allowance(address,address)"),
            encode(&[Token::Uint(U256::MAX)]).into(),
        );
    let h = harness(client.clone(), Duration::from_millis(1), 2);

    let id_job = h
        .engine
        .submit(
            "sell nine",
            "auto_sell",
            json!({
                "sender_key": TEST_PRIVATE_KEY,
                "token_address": "0x00000000000000000000000000000000000000aa",
                "sell_amount_each": "5",
                "cycles": 1,
            }),
            5,
        )
        .await
        .unwrap();

    let progress = h
        .engine
        .wait_until_done(id_job, Duration::from_secs(10))
        .await
        .expect("job must finish");
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.done_count, 1);

    // Exactly one signed transaction went out, and its swap amountIn was
    // scaled by 10^9, not the 18-decimal default.
    assert_eq!(client.sent_transactions().len(), 1);
    let calldata = client.estimated_calldata();
    let swap = calldata.last().expect("swap calldata captured");
    let amount_in = U256::from_big_endian(&swap[4..36]);
    assert_eq!(amount_in, U256::from(5u64) * U256::exp10(9));
}
