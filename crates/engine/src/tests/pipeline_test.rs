//! Pipeline Integration Tests
//!
//! Runs the worker, publisher and coordinator against the in-memory ledger,
//! which rejects any block that breaks its account chain:
//! - Round-robin production order
//! - Halt handshake mid-round
//! - Publish order and pool settlement after full and partial epochs
//! - Send/receive epoch alternation through the coordinator
//! - Deadline spacing and the deadline halt path

use std::{sync::Arc, time::Duration};

use ledger_rpc::{BlockKind, LedgerError, MemoryLedger};

use crate::{
    account_pool::{Account, AccountPool},
    coordinator::{CoordinatorConfig, CoordinatorEvent, ScheduleCoordinator},
    error::EngineError,
    publisher::publish,
    worker::{EpochMode, PipelineState, PrecomputeWorker, WorkerConfig, WorkerEvent},
};

/// Helper to open a pool over a fresh in-memory ledger
async fn pipeline(balances: &[u128], latency: Duration) -> (Arc<MemoryLedger>, PipelineState) {
    let ledger = Arc::new(MemoryLedger::with_balances("W", balances).with_latency(latency));
    let pool = AccountPool::open(ledger.clone(), balances.len()).await.unwrap();
    (ledger, PipelineState::new(pool, 10))
}

fn rounds(rounds: usize) -> WorkerConfig {
    WorkerConfig {
        rounds: Some(rounds),
        ..Default::default()
    }
}

/// Helper asserting the pool's local view matches the ledger
fn assert_pool_matches_ledger(state: &PipelineState, ledger: &MemoryLedger) {
    for account in state.pool.accounts() {
        assert_eq!(
            account.balance,
            ledger.balance_of(&account.address),
            "balance of {}",
            account.address
        );
        assert_eq!(
            Some(account.head.clone()),
            ledger.head_of(&account.address),
            "head of {}",
            account.address
        );
    }
}

#[tokio::test]
async fn test_round_robin_order_and_chain_continuity() {
    let (_, mut state) = pipeline(&[100, 100, 100, 100], Duration::ZERO).await;
    state.begin_epoch();
    let heads: Vec<String> = state.pool.accounts().iter().map(|a| a.head.clone()).collect();

    let mut worker = PrecomputeWorker::spawn(state, rounds(3), EpochMode::Send, None, None);
    assert_eq!(worker.next_event().await, Some(WorkerEvent::Exhausted(12)));
    let state = worker.join().await.unwrap();

    for k in 0..12usize {
        let (account, round) = (k % 4, k / 4);
        let entry = state.buffer.get(account, round).unwrap();
        assert_eq!(entry.block.kind, BlockKind::Send);
        assert_eq!(entry.block.account, format!("acct_{}", account));
        assert_eq!(entry.block.counterpart, format!("acct_{}", (account + 1) % 4));
        assert_eq!(entry.block.balance_after, 100 - (round as u128 + 1));

        let expected_previous = if round == 0 {
            heads[account].clone()
        } else {
            state.buffer.get(account, round - 1).unwrap().hash.clone()
        };
        assert_eq!(entry.block.previous, expected_previous);
    }
    assert!(state.buffer.get(0, 3).is_none());
    assert_eq!(state.pool.account(2).balance, 97);
}

#[tokio::test]
async fn test_first_round_covers_every_account() {
    let (_, mut state) = pipeline(&[100, 100, 100, 100], Duration::ZERO).await;
    state.begin_epoch();

    let mut worker = PrecomputeWorker::spawn(state, rounds(1), EpochMode::Send, None, None);
    assert_eq!(worker.next_event().await, Some(WorkerEvent::Exhausted(4)));
    let state = worker.join().await.unwrap();

    for account in 0..4 {
        assert!(state.buffer.get(account, 0).is_some());
        assert!(state.buffer.get(account, 1).is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_halt_mid_round_handshake() {
    let (_, mut state) = pipeline(&[100, 100, 100, 100], Duration::from_millis(10)).await;
    state.begin_epoch();

    let mut worker =
        PrecomputeWorker::spawn(state, WorkerConfig::default(), EpochMode::Send, None, None);

    // Five blocks done, the sixth in flight
    tokio::time::sleep(Duration::from_millis(55)).await;
    let count = worker.halt().await.unwrap().unwrap();
    assert!(count > 4 && count < 8, "count {}", count);

    // Halt, halted, count: nothing else follows
    assert_eq!(worker.next_event().await, None);

    let state = worker.join().await.unwrap();
    assert_eq!(state.buffer.len() as u64, count);
}

#[tokio::test]
async fn test_halt_after_exhaustion_is_accepted() {
    let (_, mut state) = pipeline(&[2, 2], Duration::ZERO).await;
    state.begin_epoch();

    // Balances run out after two rounds
    let mut worker =
        PrecomputeWorker::spawn(state, WorkerConfig::default(), EpochMode::Send, None, None);
    tokio::task::yield_now().await;
    let count = worker.halt().await.unwrap();
    let state = worker.join().await.unwrap();

    assert!(count.unwrap() <= 4);
    assert_eq!(state.buffer.len() as u64, count.unwrap());
}

#[tokio::test]
async fn test_send_then_receive_epoch_restores_balances() {
    let (ledger, mut state) = pipeline(&[100, 100, 100, 100], Duration::ZERO).await;

    // Send epoch
    state.begin_epoch();
    let mut worker = PrecomputeWorker::spawn(state, rounds(3), EpochMode::Send, None, None);
    let produced = match worker.next_event().await {
        Some(WorkerEvent::Exhausted(n)) => n,
        other => panic!("unexpected {:?}", other),
    };
    let mut state = worker.join().await.unwrap();
    let report = publish(&*ledger, &state.buffer, produced, None).await.unwrap();
    assert_eq!(report.published, 12);
    assert_eq!(ledger.processed_count(), 12);
    state.finish_epoch(EpochMode::Send, &report);

    assert_eq!(state.sends_published, 12);
    assert_eq!(ledger.total_pending(), 12);
    assert_pool_matches_ledger(&state, &ledger);

    // Receive epoch claims every send
    state.begin_epoch();
    let limit = Some(state.sends_published);
    let mut worker = PrecomputeWorker::spawn(state, rounds(3), EpochMode::Receive, limit, None);
    assert_eq!(worker.next_event().await, Some(WorkerEvent::Exhausted(12)));
    let mut state = worker.join().await.unwrap();

    let first = state.buffer.get(0, 0).unwrap();
    assert_eq!(first.block.kind, BlockKind::Receive);
    // Account 0 claims the send made by its predecessor, account 3
    assert_eq!(first.block.counterpart, state.prior_sends.get(3, 0).unwrap().hash);

    let report = publish(&*ledger, &state.buffer, 12, limit).await.unwrap();
    state.finish_epoch(EpochMode::Receive, &report);

    assert_eq!(ledger.total_pending(), 0);
    assert_eq!(ledger.total_balance(), 400);
    for account in state.pool.accounts() {
        assert_eq!(account.balance, 100);
    }
    assert_pool_matches_ledger(&state, &ledger);
}

#[tokio::test]
async fn test_truncated_publish_rolls_back_unpublished_blocks() {
    let (ledger, mut state) = pipeline(&[100, 100, 100, 100], Duration::ZERO).await;

    state.begin_epoch();
    let mut worker = PrecomputeWorker::spawn(state, rounds(2), EpochMode::Send, None, None);
    assert_eq!(worker.next_event().await, Some(WorkerEvent::Exhausted(8)));
    let mut state = worker.join().await.unwrap();

    let report = publish(&*ledger, &state.buffer, 8, Some(5)).await.unwrap();
    assert_eq!(report.published, 5);
    state.finish_epoch(EpochMode::Send, &report);

    let balances: Vec<u128> = state.pool.accounts().iter().map(|a| a.balance).collect();
    assert_eq!(balances, vec![98, 99, 99, 99]);
    assert_pool_matches_ledger(&state, &ledger);

    // The next epoch builds on the rolled back heads and the ledger accepts it
    state.begin_epoch();
    let mut worker = PrecomputeWorker::spawn(state, rounds(1), EpochMode::Send, None, None);
    assert_eq!(worker.next_event().await, Some(WorkerEvent::Exhausted(4)));
    let state = worker.join().await.unwrap();
    publish(&*ledger, &state.buffer, 4, None).await.unwrap();
    assert_eq!(ledger.processed_count(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_receive_epoch_after_partial_send_epoch() {
    let (ledger, mut state) = pipeline(&[100, 100, 100, 100], Duration::from_millis(10)).await;

    state.begin_epoch();
    let mut worker =
        PrecomputeWorker::spawn(state, WorkerConfig::default(), EpochMode::Send, None, None);
    tokio::time::sleep(Duration::from_millis(55)).await;
    let produced = worker.halt().await.unwrap().unwrap();
    let mut state = worker.join().await.unwrap();
    let report = publish(&*ledger, &state.buffer, produced, None).await.unwrap();
    state.finish_epoch(EpochMode::Send, &report);
    assert_eq!(state.sends_published, produced);

    // Only receives whose send reached the ledger are produced
    state.begin_epoch();
    let limit = Some(state.sends_published);
    let mut worker =
        PrecomputeWorker::spawn(state, WorkerConfig::default(), EpochMode::Receive, limit, None);
    let received = match worker.next_event().await {
        Some(WorkerEvent::Exhausted(n)) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert!(received <= produced);
    let mut state = worker.join().await.unwrap();
    let report = publish(&*ledger, &state.buffer, received, limit).await.unwrap();
    state.finish_epoch(EpochMode::Receive, &report);
    state.pool.sweep_pending().await.unwrap();

    assert_eq!(ledger.total_pending(), 0);
    assert_eq!(state.pool.total_balance(), 400);
    assert_pool_matches_ledger(&state, &ledger);
}

#[tokio::test]
async fn test_coordinator_alternates_epochs() {
    let (ledger, state) = pipeline(&[50, 50, 50], Duration::ZERO).await;
    let config = CoordinatorConfig {
        epoch_secs: 3600,
        max_epochs: 4,
        worker: rounds(2),
        ..Default::default()
    };
    let coordinator = ScheduleCoordinator::new(config);
    let mut events = coordinator.subscribe();

    let state = coordinator.run(state).await.unwrap();

    let mut modes = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::Published(summary) = event {
            assert_eq!(summary.published, 6);
            modes.push(summary.mode);
        }
    }
    assert_eq!(
        modes,
        vec![EpochMode::Send, EpochMode::Receive, EpochMode::Send, EpochMode::Receive]
    );
    assert_eq!(ledger.processed_count(), 24);
    assert_eq!(ledger.total_pending(), 0);
    assert_eq!(ledger.total_balance(), 150);
    assert_pool_matches_ledger(&state, &ledger);
}

#[tokio::test]
async fn test_consecutive_deadlines_are_one_epoch_apart() {
    let (_, state) = pipeline(&[50, 50, 50], Duration::ZERO).await;
    let config = CoordinatorConfig {
        epoch_secs: 3600,
        max_epochs: 4,
        worker: rounds(1),
        ..Default::default()
    };
    let coordinator = ScheduleCoordinator::new(config);
    let mut events = coordinator.subscribe();

    // Every epoch finishes long before its deadline
    coordinator.run(state).await.unwrap();

    let mut deadlines = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::Scheduled { deadline, .. } = event {
            deadlines.push(deadline);
        }
    }
    assert_eq!(deadlines.len(), 4);
    for pair in deadlines.windows(2) {
        assert_eq!(pair[1] - pair[0], chrono::Duration::seconds(3600));
    }
}

#[tokio::test(start_paused = true)]
async fn test_deadline_halts_production_and_publishes_the_count() {
    let balances = [10_000, 10_000, 10_000, 10_000];
    let (ledger, state) = pipeline(&balances, Duration::from_millis(10)).await;
    // Unbounded rounds: only the deadline can stop the worker
    let config = CoordinatorConfig {
        epoch_secs: 30,
        max_epochs: 1,
        ..Default::default()
    };
    let mut coordinator = ScheduleCoordinator::new(config);

    let (state, summary) = coordinator.run_epoch(state).await.unwrap();

    assert!(summary.halted);
    assert!(summary.produced < 40_000, "produced {}", summary.produced);
    assert_eq!(summary.published, summary.produced);
    assert_eq!(ledger.processed_count(), summary.produced);
    assert_eq!(state.sends_published, summary.produced);
    assert_pool_matches_ledger(&state, &ledger);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_between_epochs() {
    let (ledger, state) = pipeline(&[50, 50, 50], Duration::ZERO).await;
    // Holding keeps epoch 0 open until the stop request has been sent
    let config = CoordinatorConfig {
        epoch_secs: 60,
        hold_until_deadline: true,
        worker: rounds(2),
        ..Default::default()
    };
    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let coordinator = ScheduleCoordinator::new(config).with_shutdown(shutdown);
    let mut events = coordinator.subscribe();

    let run = tokio::spawn(coordinator.run(state));

    // Ask to stop while the first epoch is still running
    match events.recv().await.unwrap() {
        CoordinatorEvent::Scheduled { epoch, .. } => assert_eq!(epoch, 0),
        other => panic!("unexpected {:?}", other),
    }
    stop.send(true).unwrap();
    let state = run.await.unwrap().unwrap();

    // The send epoch finished and nothing after it ran
    assert_eq!(ledger.processed_count(), 6);
    assert_eq!(ledger.total_pending(), 6);
    assert_pool_matches_ledger(&state, &ledger);
}

#[tokio::test]
async fn test_ledger_failure_ends_the_run() {
    let ledger = Arc::new(MemoryLedger::with_balances("W", &[10]));
    let mut ghost = Account::new("ghost".to_string());
    ghost.balance = 10;
    let pool = AccountPool::new(ledger.clone(), vec![ghost]);
    let state = PipelineState::new(pool, 10);

    let config = CoordinatorConfig {
        epoch_secs: 3600,
        max_epochs: 1,
        ..Default::default()
    };
    match ScheduleCoordinator::new(config).run(state).await {
        Err(EngineError::Ledger(LedgerError::Ledger { action, message })) => {
            assert_eq!(action, "block_create");
            assert!(message.contains("wallet W"), "{}", message);
        }
        Err(other) => panic!("unexpected {}", other),
        Ok(_) => panic!("an unknown account must fail the epoch"),
    }
}
