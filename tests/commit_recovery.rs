//! Crash, recovery and durability tests for the atomic commit layer.

use intentguard::wal::{self, WalEntry, WalOp};
use intentguard::{
    AtomicCommitLayer, Balances, Cmp, CommitOutcome, CommitStep, ConsensusResult, Decimal, Expr,
    GuardConfig, GuardError, Intent, NullSink, Orchestrator, Predicate, RecoveryReport,
    DEFAULT_PRECISION,
};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Test Fixtures
// ============================================================================

fn ledger(entries: &[(&str, &str)]) -> Balances {
    entries
        .iter()
        .map(|(account, value)| (account.to_string(), Decimal::parse(value, DEFAULT_PRECISION).unwrap()))
        .collect()
}

fn transfer(id: &str, from: &str, to: &str, amount: &str) -> Intent {
    Intent::new(
        id,
        vec![Predicate::new(Expr::balance(from), Cmp::Ge, Expr::lit(amount))],
        vec![
            Predicate::new(
                Expr::post_balance(from),
                Cmp::Eq,
                Expr::sub(Expr::balance(from), Expr::lit(amount)),
            ),
            Predicate::new(
                Expr::post_balance(to),
                Cmp::Eq,
                Expr::add(Expr::balance(to), Expr::lit(amount)),
            ),
        ],
    )
}

fn init(dir: &Path) {
    AtomicCommitLayer::initialize(dir, ledger(&[("alice", "100"), ("bob", "0")])).expect("initialize");
}

fn open(dir: &Path) -> (Orchestrator, RecoveryReport) {
    open_with(GuardConfig::with_data_dir(dir))
}

fn open_with(config: GuardConfig) -> (Orchestrator, RecoveryReport) {
    Orchestrator::recover_from_crash(config, Arc::new(NullSink)).expect("recovery")
}

async fn approved(orch: &Orchestrator, id: &str, amount: &str) -> ConsensusResult {
    let result = orch.verify_transaction(&transfer(id, "alice", "bob", amount)).await;
    assert!(result.is_approved(), "{}", result.rationale());
    result
}

fn temp_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

fn wal_ops(dir: &Path, tx_id: &str) -> Vec<WalOp> {
    wal::replay(&dir.join("wal.log"))
        .unwrap()
        .records
        .into_iter()
        .filter(|r| r.entry.tx_id == tx_id)
        .map(|r| r.entry.op)
        .collect()
}

// ============================================================================
// Initialization Tests
// ============================================================================

#[test]
fn test_initialize_refuses_existing_ledger() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let again = AtomicCommitLayer::initialize(dir.path(), Balances::new());
    assert!(matches!(again, Err(GuardError::AlreadyInitialized { .. })));
}

#[test]
fn test_initialize_rejects_negative_genesis() {
    let dir = tempfile::tempdir().unwrap();
    let result = AtomicCommitLayer::initialize(dir.path(), ledger(&[("alice", "-1")]));
    assert!(matches!(result, Err(GuardError::Validation { .. })));
    assert!(!dir.path().join("state.json").exists());
}

#[test]
fn test_fresh_ledger_recovers_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let genesis = AtomicCommitLayer::initialize(dir.path(), ledger(&[("alice", "100")])).unwrap();
    let (layer, report) = AtomicCommitLayer::recover(dir.path(), 100).unwrap();
    assert!(report.merkle_verified);
    assert!(report.uncommitted_discarded.is_empty());
    assert_eq!(report.merkle_root, genesis.merkle_root);
    assert_eq!(report.state_version, 0);
    assert_eq!(layer.snapshot().unwrap().balances, genesis.balances);
}

// ============================================================================
// Fatal Startup Conditions
// ============================================================================

#[test]
fn test_missing_state_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    fs::remove_file(dir.path().join("state.json")).unwrap();

    let err = AtomicCommitLayer::recover(dir.path(), 100).unwrap_err();
    assert!(matches!(err, GuardError::StateMissing { .. }));
    assert!(err.is_fatal());
    assert!(err.to_string().contains("state missing"));
    assert!(!dir.path().join("state.json").exists(), "must not materialize an empty ledger");
}

#[test]
fn test_missing_state_refuses_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let result = Orchestrator::recover_from_crash(GuardConfig::with_data_dir(dir.path()), Arc::new(NullSink));
    assert!(matches!(result, Err(GuardError::StateMissing { .. })));
}

#[test]
fn test_tampered_balance_is_merkle_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let path = dir.path().join("state.json");
    let mut state: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    state["balances"]["bob"] = serde_json::json!("1000000");
    fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

    match AtomicCommitLayer::recover(dir.path(), 100) {
        Err(GuardError::MerkleMismatch { expected, computed, path: reported }) => {
            assert_ne!(expected, computed);
            assert_eq!(reported, path);
        }
        other => panic!("expected MerkleMismatch, got {other:?}"),
    }
}

#[test]
fn test_malformed_state_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    fs::write(dir.path().join("state.json"), b"{\"version\": 1, \"balances\": ").unwrap();
    let err = AtomicCommitLayer::recover(dir.path(), 100).unwrap_err();
    assert!(matches!(err, GuardError::StateMalformed { .. }));
    assert!(err.is_fatal());
}

#[test]
fn test_state_with_imprecise_balance_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let path = dir.path().join("state.json");
    let mut state: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    state["balances"]["bob"] = serde_json::json!("1.");
    fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();
    assert!(matches!(
        AtomicCommitLayer::recover(dir.path(), 100),
        Err(GuardError::StateMalformed { .. })
    ));
}

#[test]
fn test_corrupt_wal_record_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let wal_path = dir.path().join("wal.log");
    let good = wal::encode_line(&WalEntry::new(WalOp::Begin, "tx-1", "aa")).unwrap();
    let mut file = fs::OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(b"deadbeef\t{\"op\":\"BEGIN\"}\n").unwrap();
    file.write_all(good.as_bytes()).unwrap();
    drop(file);
    let before = fs::read(&wal_path).unwrap();

    match AtomicCommitLayer::recover(dir.path(), 100) {
        Err(GuardError::WalCorrupt { offset, raw, .. }) => {
            assert_eq!(offset, 0);
            assert!(raw.contains("deadbeef"));
        }
        other => panic!("expected WalCorrupt, got {other:?}"),
    }
    assert_eq!(fs::read(&wal_path).unwrap(), before, "a failed recovery must not rewrite the WAL");
}

#[test]
fn test_commit_without_begin_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let line = wal::encode_line(&WalEntry::new(WalOp::Commit, "ghost", "aa")).unwrap();
    fs::write(dir.path().join("wal.log"), line).unwrap();
    let err = AtomicCommitLayer::recover(dir.path(), 100).unwrap_err();
    assert!(matches!(err, GuardError::WalCorrupt { reason, .. } if reason.contains("without an open BEGIN")));
}

#[test]
fn test_missing_wal_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    fs::remove_file(dir.path().join("wal.log")).unwrap();
    assert!(matches!(
        AtomicCommitLayer::recover(dir.path(), 100),
        Err(GuardError::WalCorrupt { .. })
    ));
}

// ============================================================================
// WAL Replay Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_torn_tail_is_truncated() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    {
        let (orch, _) = open(dir.path());
        let result = approved(&orch, "tx-1", "10").await;
        assert_eq!(orch.commit("tx-1", &result).unwrap(), CommitOutcome::Committed);
    }
    let wal_path = dir.path().join("wal.log");
    let intact = fs::metadata(&wal_path).unwrap().len();
    let torn = wal::encode_line(&WalEntry::new(WalOp::Begin, "tx-2", "bb")).unwrap();
    let mut file = fs::OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&torn.as_bytes()[..torn.len() / 2]).unwrap();
    drop(file);

    let (orch, report) = open(dir.path());
    assert!(report.torn_tail_truncated);
    assert!(report.uncommitted_discarded.is_empty());
    assert_eq!(fs::metadata(&wal_path).unwrap().len(), intact);
    assert_eq!(orch.ledger().balances().unwrap()["bob"], Decimal::from(10));
}

#[test]
fn test_orphaned_temp_files_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    fs::write(dir.path().join("state.json.stray.tmp"), b"{}").unwrap();
    fs::write(dir.path().join("wal.log.compact.tmp"), b"").unwrap();
    let (_layer, report) = AtomicCommitLayer::recover(dir.path(), 100).unwrap();
    assert_eq!(
        report.orphaned_temp_files_removed,
        vec!["state.json.stray.tmp".to_string(), "wal.log.compact.tmp".to_string()]
    );
    assert!(temp_files(dir.path()).is_empty());
}

#[test]
fn test_fatal_wal_keeps_torn_tail_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let wal_path = dir.path().join("wal.log");
    let begin = wal::encode_line(&WalEntry::new(WalOp::Begin, "tx-1", "aa")).unwrap();
    let torn = wal::encode_line(&WalEntry::new(WalOp::Commit, "tx-1", "aa")).unwrap();
    fs::write(&wal_path, format!("{begin}{begin}{}", &torn[..torn.len() - 5])).unwrap();
    let before = fs::read(&wal_path).unwrap();

    let err = AtomicCommitLayer::recover(dir.path(), 100).unwrap_err();
    assert!(matches!(err, GuardError::WalCorrupt { reason, .. } if reason.contains("duplicate BEGIN")));
    assert_eq!(fs::read(&wal_path).unwrap(), before);
}

// ============================================================================
// Commit Protocol Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_result_leaves_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let (orch, _) = open(dir.path());
    let result = orch.verify_transaction(&transfer("tx-big", "alice", "bob", "150")).await;
    assert!(!result.is_approved());
    assert_eq!(orch.commit("tx-big", &result).unwrap(), CommitOutcome::Discarded);
    assert_eq!(fs::metadata(dir.path().join("wal.log")).unwrap().len(), 0);
    assert_eq!(orch.ledger().snapshot().unwrap().version, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_duplicate_tx_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let (orch, _) = open(dir.path());
    let first = approved(&orch, "tx-1", "10").await;
    assert_eq!(orch.commit("tx-1", &first).unwrap(), CommitOutcome::Committed);
    let second = approved(&orch, "tx-1b", "10").await;
    assert!(matches!(
        orch.commit("tx-1", &second),
        Err(GuardError::InvalidTransition { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_tx_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let (orch, _) = open(dir.path());
    let result = approved(&orch, "tx-1", "10").await;
    assert!(matches!(orch.commit("../escape", &result), Err(GuardError::Validation { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_committed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let root = {
        let (orch, _) = open(dir.path());
        for (i, amount) in ["10", "20.5", "0.25"].iter().enumerate() {
            let id = format!("tx-{i}");
            let result = approved(&orch, &id, amount).await;
            assert_eq!(orch.commit(&id, &result).unwrap(), CommitOutcome::Committed);
        }
        orch.ledger().snapshot().unwrap().merkle_root.clone()
    };
    let (orch, report) = open(dir.path());
    assert_eq!(report.merkle_root, root);
    assert_eq!(report.state_version, 3);
    let balances = orch.ledger().balances().unwrap();
    assert_eq!(balances["alice"], Decimal::parse("69.25", DEFAULT_PRECISION).unwrap());
    assert_eq!(balances["bob"], Decimal::parse("30.75", DEFAULT_PRECISION).unwrap());

    let proof = orch.ledger().merkle_proof("bob").unwrap().expect("bob has a leaf");
    assert!(proof.verify(&root));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wal_compaction_keeps_log_bounded() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let config = GuardConfig {
        wal_compaction_threshold: 2,
        ..GuardConfig::with_data_dir(dir.path())
    };
    {
        let (orch, _) = open_with(config.clone());
        for i in 0..5 {
            let id = format!("tx-{i}");
            let result = approved(&orch, &id, "1").await;
            assert_eq!(orch.commit(&id, &result).unwrap(), CommitOutcome::Committed);
        }
        let records = wal::replay(&dir.path().join("wal.log")).unwrap().records;
        assert!(records.len() <= 2, "compaction should drop closed records, kept {}", records.len());
    }
    let (orch, report) = open_with(config);
    assert_eq!(report.state_version, 5);
    assert_eq!(orch.ledger().balances().unwrap()["bob"], Decimal::from(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tx_id_stays_reserved_after_compaction() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let config = GuardConfig {
        wal_compaction_threshold: 1,
        ..GuardConfig::with_data_dir(dir.path())
    };
    {
        let (orch, _) = open_with(config.clone());
        let first = approved(&orch, "tx-1", "10").await;
        assert_eq!(orch.commit("tx-1", &first).unwrap(), CommitOutcome::Committed);
        assert!(wal::replay(&dir.path().join("wal.log")).unwrap().records.is_empty());

        let again = approved(&orch, "tx-1-again", "10").await;
        assert!(matches!(orch.commit("tx-1", &again), Err(GuardError::InvalidTransition { .. })));
    }

    let (orch, _) = open_with(config);
    let again = approved(&orch, "tx-1-restart", "10").await;
    assert!(matches!(orch.commit("tx-1", &again), Err(GuardError::InvalidTransition { .. })));
    assert_eq!(orch.ledger().balances().unwrap()["bob"], Decimal::from(10));

    let retired = wal::replay(&dir.path().join("wal.retired.log")).unwrap().records;
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].entry.tx_id, "tx-1");
    assert_eq!(retired[0].entry.op, WalOp::Commit);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rolled_back_id_stays_reserved_after_compaction() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    {
        let (orch, _) = open(dir.path());
        let result = approved(&orch, "tx-lost", "10").await;
        let _ = orch.ledger().commit_interrupted("tx-lost", &result, CommitStep::BeginLogged);
    }
    let config = GuardConfig {
        wal_compaction_threshold: 1,
        ..GuardConfig::with_data_dir(dir.path())
    };
    let (orch, report) = open_with(config);
    assert_eq!(report.uncommitted_discarded, vec!["tx-lost".to_string()]);
    let retry = approved(&orch, "tx-retry", "10").await;
    assert!(matches!(orch.commit("tx-lost", &retry), Err(GuardError::InvalidTransition { .. })));
    assert_eq!(orch.commit("tx-retry", &retry).unwrap(), CommitOutcome::Committed);
}

#[test]
fn test_open_begin_for_retired_id_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let retired = wal::encode_line(&WalEntry::new(WalOp::Commit, "tx-1", "aa")).unwrap();
    fs::write(dir.path().join("wal.retired.log"), retired).unwrap();
    let begin = wal::encode_line(&WalEntry::new(WalOp::Begin, "tx-1", "bb")).unwrap();
    fs::write(dir.path().join("wal.log"), begin).unwrap();
    assert!(matches!(
        AtomicCommitLayer::recover(dir.path(), 100),
        Err(GuardError::WalCorrupt { reason, .. }) if reason.contains("retired")
    ));
}

// ============================================================================
// Crash Simulation Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_crash_at_every_step_is_all_or_nothing() {
    for step in CommitStep::ALL {
        let dir = tempfile::tempdir().unwrap();
        init(dir.path());
        let genesis_root = {
            let (orch, _) = open(dir.path());
            let root = orch.ledger().snapshot().unwrap().merkle_root.clone();
            let result = approved(&orch, "tx-crash", "40").await;
            let _ = orch.ledger().commit_interrupted("tx-crash", &result, step);
            assert!(orch.ledger().fault().unwrap().is_some());
            root
        };

        let (orch, report) = open(dir.path());
        let balances = orch.ledger().balances().unwrap();
        let state = orch.ledger().snapshot().unwrap();
        if step == CommitStep::CommitLogged {
            assert!(report.uncommitted_discarded.is_empty(), "{step:?}");
            assert_eq!(balances["alice"], Decimal::from(60), "{step:?}");
            assert_eq!(balances["bob"], Decimal::from(40), "{step:?}");
            assert_eq!(wal_ops(dir.path(), "tx-crash"), vec![WalOp::Begin, WalOp::Commit]);
        } else {
            assert_eq!(report.uncommitted_discarded, vec!["tx-crash".to_string()], "{step:?}");
            assert_eq!(balances["alice"], Decimal::from(100), "{step:?}");
            assert_eq!(balances["bob"], Decimal::ZERO, "{step:?}");
            assert_eq!(state.merkle_root, genesis_root, "{step:?}");
            assert_eq!(state.version, 0, "{step:?}");
            assert_eq!(wal_ops(dir.path(), "tx-crash"), vec![WalOp::Begin, WalOp::Rollback]);
        }
        assert_eq!(report.reverted.is_empty(), step != CommitStep::Renamed, "{step:?}");
        assert!(temp_files(dir.path()).is_empty(), "{step:?}");
        assert!(orch.ledger().open_transactions().unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_halted_layer_refuses_commits() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let (orch, _) = open(dir.path());
    let first = approved(&orch, "tx-1", "10").await;
    let crashed = orch.ledger().commit_interrupted("tx-1", &first, CommitStep::TempWritten);
    assert!(matches!(crashed, Err(GuardError::Interrupted { .. })));

    let second = orch.verify_transaction(&transfer("tx-2", "alice", "bob", "5")).await;
    assert!(matches!(orch.commit("tx-2", &second), Err(GuardError::InvalidTransition { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recovery_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    {
        let (orch, _) = open(dir.path());
        let kept = approved(&orch, "tx-kept", "25").await;
        assert_eq!(orch.commit("tx-kept", &kept).unwrap(), CommitOutcome::Committed);
        let lost = approved(&orch, "tx-lost", "50").await;
        let _ = orch.ledger().commit_interrupted("tx-lost", &lost, CommitStep::Renamed);
    }

    let (first_state, first_wal) = {
        let (orch, report) = open(dir.path());
        assert_eq!(report.uncommitted_discarded, vec!["tx-lost".to_string()]);
        (
            orch.ledger().snapshot().unwrap(),
            fs::read(dir.path().join("wal.log")).unwrap(),
        )
    };
    let state_bytes = fs::read(dir.path().join("state.json")).unwrap();

    let (orch, report) = open(dir.path());
    assert!(report.uncommitted_discarded.is_empty());
    assert!(report.reverted.is_empty());
    assert_eq!(orch.ledger().snapshot().unwrap(), first_state);
    assert_eq!(fs::read(dir.path().join("state.json")).unwrap(), state_bytes);
    assert_eq!(fs::read(dir.path().join("wal.log")).unwrap(), first_wal);
    assert_eq!(first_state.balances["bob"], Decimal::from(25));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tampered_undo_record_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    {
        let (orch, _) = open(dir.path());
        let result = approved(&orch, "tx-1", "40").await;
        let _ = orch.ledger().commit_interrupted("tx-1", &result, CommitStep::Renamed);
    }
    let path = dir.path().join("state.json");
    let mut state: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    state["undo"]["prior_balances"]["alice"] = serde_json::json!("1000");
    fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();

    let err = AtomicCommitLayer::recover(dir.path(), 100).unwrap_err();
    assert!(matches!(err, GuardError::StateMalformed { reason, .. } if reason.contains("undo")));
}

// ============================================================================
// Commit Scaling Tests
// ============================================================================

/// Median commit latency with `prior` committed transactions already in the WAL.
async fn median_commit_latency(prior: usize) -> Duration {
    let dir = tempfile::tempdir().unwrap();
    init(dir.path());
    let mut history = String::new();
    for i in 0..prior {
        let tx = format!("hist-{i}");
        history.push_str(&wal::encode_line(&WalEntry::new(WalOp::Begin, tx.as_str(), "00")).unwrap());
        history.push_str(&wal::encode_line(&WalEntry::new(WalOp::Commit, tx.as_str(), "00")).unwrap());
    }
    fs::write(dir.path().join("wal.log"), history).unwrap();

    let config = GuardConfig {
        wal_compaction_threshold: 1_000_000,
        ..GuardConfig::with_data_dir(dir.path())
    };
    let (orch, report) = open_with(config);
    assert_eq!(report.wal_entries_scanned, prior * 2);

    let wal_path = dir.path().join("wal.log");
    let mut samples = Vec::new();
    for i in 0..15 {
        let id = format!("tx-{i}");
        let result = approved(&orch, &id, "1").await;
        let size_before = fs::metadata(&wal_path).unwrap().len();
        let started = Instant::now();
        assert_eq!(orch.commit(&id, &result).unwrap(), CommitOutcome::Committed);
        samples.push(started.elapsed());

        // append-only: exactly two new lines, history untouched
        let appended = fs::metadata(&wal_path).unwrap().len() - size_before;
        let expected = wal::encode_line(&WalEntry::new(WalOp::Begin, id.as_str(), "x")).unwrap().len();
        assert!(appended < 4 * expected as u64, "commit rewrote the log ({appended} bytes)");
    }
    samples.sort();
    samples[samples.len() / 2]
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_latency_does_not_scale_with_history() {
    let small = median_commit_latency(100).await;
    let medium = median_commit_latency(1_000).await;
    let large = median_commit_latency(10_000).await;

    // Linear growth would be 100x from 100 to 10,000 entries.
    let floor = small.max(Duration::from_millis(1));
    assert!(medium < floor * 20, "1k: {medium:?} vs 100: {small:?}");
    assert!(large < floor * 20, "10k: {large:?} vs 100: {small:?}");
}
