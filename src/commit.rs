//! Atomic commit layer.
//!
//! Owns the two mutable shared resources of the system: the write-ahead log
//! and the canonical state file. A transaction moves through
//! `BEGIN-LOGGED → STATE-WRITTEN → COMMIT-LOGGED`; a crash anywhere before
//! COMMIT-LOGGED leaves it DISCARDED after [`AtomicCommitLayer::recover`].
//!
//! The canonical state carries an undo record for the last transaction it
//! applied. If that transaction never reached COMMIT, recovery restores the
//! prior balances from it, after checking the undo record against the
//! checksummed BEGIN payload hash.

use crate::conservation::check_conservation;
use crate::decimal::Decimal;
use crate::error::{GuardError, GuardResult};
use crate::merkle::{merkle_root_hex, MerkleProof};
use crate::types::{balance_of, compute_content_hash, BalanceChange, BalanceDelta, Balances, ConsensusResult};
use crate::wal::{self, sync_dir, WalEntry, WalOp, WriteAheadLog};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

pub const STATE_FILE: &str = "state.json";
pub const WAL_FILE: &str = "wal.log";
/// Terminal records moved out of the WAL by compaction. Keeps every used
/// transaction id reserved.
pub const RETIRED_FILE: &str = "wal.retired.log";

/// Maximum transaction id length.
pub const MAX_TX_ID_LEN: usize = 128;

/// What recovery needs to take back a transaction that was written to the
/// canonical state but never logged as committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoRecord {
    pub tx_id: String,
    pub intent_hash: String,
    pub prior_version: u64,
    pub prior_tx_id: Option<String>,
    pub prior_payload_hash: Option<String>,
    /// Balance of each touched account before the transaction; `None` if the
    /// account did not exist.
    pub prior_balances: BTreeMap<String, Option<Decimal>>,
}

/// Canonical ledger state as stored in `state.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    pub version: u64,
    pub balances: Balances,
    pub merkle_root: String,
    #[serde(default)]
    pub last_tx_id: Option<String>,
    #[serde(default)]
    pub last_payload_hash: Option<String>,
    #[serde(default)]
    pub undo: Option<UndoRecord>,
}

impl LedgerState {
    /// Version-0 state holding `balances`.
    pub fn genesis(balances: Balances) -> GuardResult<Self> {
        if let Some((account, balance)) = balances.iter().find(|(_, b)| b.is_negative()) {
            return Err(GuardError::Validation {
                field: format!("balances.{account}"),
                message: format!("genesis balance {balance} is negative"),
            });
        }
        let balances: Balances = balances.into_iter().map(|(a, b)| (a, b.normalize())).collect();
        Ok(Self {
            version: 0,
            merkle_root: merkle_root_hex(&balances),
            balances,
            last_tx_id: None,
            last_payload_hash: None,
            undo: None,
        })
    }

    /// Merkle root recomputed from the balances.
    pub fn computed_root(&self) -> String {
        merkle_root_hex(&self.balances)
    }

    fn applied(&self, tx_id: &str, intent_hash: &str, payload_hash: &str, delta: &BalanceDelta) -> GuardResult<Self> {
        let version = self.version.checked_add(1).ok_or_else(|| GuardError::Overflow {
            operation: "ledger version".to_string(),
        })?;
        let mut balances = self.balances.clone();
        let mut prior_balances = BTreeMap::new();
        for (account, change) in &delta.changes {
            prior_balances.insert(account.clone(), self.balances.get(account).copied());
            balances.insert(account.clone(), change.after.normalize());
        }
        Ok(Self {
            version,
            merkle_root: merkle_root_hex(&balances),
            balances,
            last_tx_id: Some(tx_id.to_string()),
            last_payload_hash: Some(payload_hash.to_string()),
            undo: Some(UndoRecord {
                tx_id: tx_id.to_string(),
                intent_hash: intent_hash.to_string(),
                prior_version: self.version,
                prior_tx_id: self.last_tx_id.clone(),
                prior_payload_hash: self.last_payload_hash.clone(),
                prior_balances,
            }),
        })
    }

    /// State before `undo` was applied.
    fn reverted(&self, undo: &UndoRecord) -> Self {
        let mut balances = self.balances.clone();
        for (account, prior) in &undo.prior_balances {
            match prior {
                Some(value) => {
                    balances.insert(account.clone(), *value);
                }
                None => {
                    balances.remove(account);
                }
            }
        }
        Self {
            version: undo.prior_version,
            merkle_root: merkle_root_hex(&balances),
            balances,
            last_tx_id: undo.prior_tx_id.clone(),
            last_payload_hash: undo.prior_payload_hash.clone(),
            undo: None,
        }
    }

    /// The delta `undo` reverses, as it was hashed at BEGIN.
    fn undone_delta(&self, undo: &UndoRecord) -> BalanceDelta {
        let changes = undo
            .prior_balances
            .iter()
            .map(|(account, prior)| {
                let change = BalanceChange {
                    before: prior.unwrap_or(Decimal::ZERO),
                    after: balance_of(&self.balances, account),
                };
                (account.clone(), change)
            })
            .collect();
        BalanceDelta { changes }
    }
}

/// Identity of a transaction's payload, recorded with every WAL entry.
pub fn payload_hash(tx_id: &str, intent_hash: &str, delta: &BalanceDelta) -> String {
    let changes: serde_json::Map<String, serde_json::Value> = delta
        .changes
        .iter()
        .map(|(account, change)| {
            let value = serde_json::json!({
                "before": change.before.normalize().to_string(),
                "after": change.after.normalize().to_string(),
            });
            (account.clone(), value)
        })
        .collect();
    compute_content_hash(&serde_json::json!({
        "tx_id": tx_id,
        "intent_hash": intent_hash,
        "changes": changes,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitOutcome {
    Committed,
    Discarded,
}

impl std::fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Committed => write!(f, "COMMITTED"),
            Self::Discarded => write!(f, "DISCARDED"),
        }
    }
}

/// Points in the commit protocol where a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitStep {
    /// BEGIN appended and synced.
    BeginLogged,
    /// New state built in memory only.
    StateApplied,
    /// Temp state file written and synced.
    TempWritten,
    /// Temp file renamed over the canonical state.
    Renamed,
    /// COMMIT appended and synced.
    CommitLogged,
}

impl CommitStep {
    pub const ALL: [CommitStep; 5] = [
        Self::BeginLogged,
        Self::StateApplied,
        Self::TempWritten,
        Self::Renamed,
        Self::CommitLogged,
    ];
}

/// What startup recovery found and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Transactions with BEGIN but no COMMIT, now logged as ROLLBACK.
    pub uncommitted_discarded: Vec<String>,
    /// Subset of the above whose writes had reached the canonical state and
    /// were reverted.
    pub reverted: Vec<String>,
    pub merkle_verified: bool,
    pub state_version: u64,
    pub merkle_root: String,
    pub wal_entries_scanned: usize,
    pub torn_tail_truncated: bool,
    pub orphaned_temp_files_removed: Vec<String>,
}

#[derive(Debug)]
struct WalIndex {
    log: WriteAheadLog,
    /// BEGIN entries without a terminal record, in log order.
    open: Vec<WalEntry>,
    /// Every transaction id that reached a terminal record, retired or not.
    closed: HashSet<String>,
    /// Terminal records in the WAL not yet copied to the retired log.
    unretired: Vec<WalEntry>,
    terminal_records: usize,
}

impl WalIndex {
    fn is_open(&self, tx_id: &str) -> bool {
        self.open.iter().any(|e| e.tx_id == tx_id)
    }
}

#[derive(Debug)]
struct Ledger {
    state: Arc<LedgerState>,
    balances: Arc<Balances>,
}

/// Write-ahead-logged, Merkle-verified ledger store.
///
/// Lock order is `ledger` then `wal`; `fault` and `in_flight` are leaves.
#[derive(Debug)]
pub struct AtomicCommitLayer {
    dir: PathBuf,
    state_path: PathBuf,
    compaction_threshold: usize,
    ledger: Mutex<Ledger>,
    wal: Mutex<WalIndex>,
    fault: Mutex<Option<String>>,
    in_flight: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Exclusive hold on a set of accounts for one begin…commit sequence.
struct AccountGuard<'a> {
    layer: &'a AtomicCommitLayer,
    accounts: Vec<String>,
}

impl Drop for AccountGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.layer.in_flight.lock() {
            for account in &self.accounts {
                busy.remove(account);
            }
        }
        self.layer.released.notify_all();
    }
}

fn validate_tx_id(tx_id: &str) -> GuardResult<()> {
    let valid = !tx_id.is_empty()
        && tx_id.len() <= MAX_TX_ID_LEN
        && !tx_id.starts_with('.')
        && tx_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(GuardError::Validation {
            field: "tx_id".to_string(),
            message: format!(
                "'{tx_id}' must be 1..={MAX_TX_ID_LEN} characters of [A-Za-z0-9._-] not starting with '.'"
            ),
        })
    }
}

fn temp_path(dir: &Path, label: &str) -> PathBuf {
    dir.join(format!("{STATE_FILE}.{label}.tmp"))
}

fn is_temp_file(name: &str) -> bool {
    (name.starts_with(&format!("{STATE_FILE}.")) && name.ends_with(".tmp"))
        || name == format!("{WAL_FILE}.compact.tmp")
}

fn write_temp(path: &Path, state: &LedgerState) -> GuardResult<()> {
    let bytes = serde_json::to_vec_pretty(state)?;
    let mut file = File::create(path).map_err(|e| GuardError::io(path, e))?;
    file.write_all(&bytes).map_err(|e| GuardError::io(path, e))?;
    file.sync_all().map_err(|e| GuardError::io(path, e))?;
    Ok(())
}

/// Write `state` to `temp`, then atomically rename it over `canonical`.
fn replace_state(dir: &Path, temp: &Path, canonical: &Path, state: &LedgerState) -> GuardResult<()> {
    write_temp(temp, state)?;
    fs::rename(temp, canonical).map_err(|e| GuardError::io(canonical, e))?;
    sync_dir(dir)
}

fn load_state(path: &Path) -> GuardResult<LedgerState> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(GuardError::StateMissing {
                path: path.to_path_buf(),
            })
        }
        Err(e) => return Err(GuardError::io(path, e)),
    };
    let state: LedgerState = serde_json::from_slice(&bytes).map_err(|e| GuardError::StateMalformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if let Some((account, balance)) = state.balances.iter().find(|(_, b)| b.is_negative()) {
        return Err(GuardError::StateMalformed {
            path: path.to_path_buf(),
            reason: format!("account '{account}' holds negative balance {balance}"),
        });
    }
    let computed = state.computed_root();
    if computed != state.merkle_root {
        return Err(GuardError::MerkleMismatch {
            path: path.to_path_buf(),
            expected: state.merkle_root.clone(),
            computed,
        });
    }
    Ok(state)
}

impl AtomicCommitLayer {
    /// Create the genesis ledger in `dir`. Refuses to touch an existing one.
    pub fn initialize(dir: impl AsRef<Path>, genesis: Balances) -> GuardResult<LedgerState> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| GuardError::io(dir, e))?;
        let state_path = dir.join(STATE_FILE);
        let wal_path = dir.join(WAL_FILE);
        let retired_path = dir.join(RETIRED_FILE);
        for path in [&state_path, &wal_path, &retired_path] {
            if path.exists() {
                return Err(GuardError::AlreadyInitialized { path: path.clone() });
            }
        }
        let state = LedgerState::genesis(genesis)?;
        WriteAheadLog::create(&wal_path)?;
        replace_state(dir, &temp_path(dir, "genesis"), &state_path, &state)?;
        tracing::info!(
            dir = %dir.display(),
            accounts = state.balances.len(),
            merkle_root = %state.merkle_root,
            "initialized ledger"
        );
        Ok(state)
    }

    /// Verify the on-disk ledger in `dir` and resolve interrupted
    /// transactions. This is the only way to obtain a commit layer.
    ///
    /// Missing, malformed or Merkle-mismatched state and any corrupt WAL
    /// record are fatal. Every check runs before the first write, so a fatal
    /// error leaves the files exactly as they were.
    pub fn recover(dir: impl AsRef<Path>, compaction_threshold: usize) -> GuardResult<(Self, RecoveryReport)> {
        let dir = dir.as_ref().to_path_buf();
        let state_path = dir.join(STATE_FILE);
        let wal_path = dir.join(WAL_FILE);
        let retired_path = dir.join(RETIRED_FILE);

        let mut state = load_state(&state_path)?;
        if !wal_path.exists() {
            return Err(GuardError::WalCorrupt {
                path: wal_path,
                offset: 0,
                raw: String::new(),
                reason: "write-ahead log missing".to_string(),
            });
        }

        let retired_replay = if retired_path.exists() {
            Some(wal::replay(&retired_path)?)
        } else {
            None
        };
        let mut retired: HashSet<String> = HashSet::new();
        for record in retired_replay.iter().flat_map(|r| &r.records) {
            if !record.entry.op.is_terminal() {
                return Err(GuardError::WalCorrupt {
                    path: retired_path.clone(),
                    offset: record.offset,
                    raw: record.raw.clone(),
                    reason: format!("{:?} record in retired log", record.entry.op),
                });
            }
            retired.insert(record.entry.tx_id.clone());
        }

        let replay = wal::replay(&wal_path)?;
        let mut open: Vec<WalEntry> = Vec::new();
        let mut closed = HashSet::new();
        let mut unretired = Vec::new();
        let mut terminal_records = 0usize;
        for record in &replay.records {
            let entry = &record.entry;
            let corrupt = |reason: String| GuardError::WalCorrupt {
                path: wal_path.clone(),
                offset: record.offset,
                raw: record.raw.clone(),
                reason,
            };
            match entry.op {
                WalOp::Begin => {
                    if closed.contains(&entry.tx_id) || open.iter().any(|e| e.tx_id == entry.tx_id) {
                        return Err(corrupt(format!("duplicate BEGIN for '{}'", entry.tx_id)));
                    }
                    open.push(entry.clone());
                }
                WalOp::Commit | WalOp::Rollback => {
                    let Some(pos) = open.iter().position(|e| e.tx_id == entry.tx_id) else {
                        return Err(corrupt(format!(
                            "{:?} for '{}' without an open BEGIN",
                            entry.op, entry.tx_id
                        )));
                    };
                    open.remove(pos);
                    closed.insert(entry.tx_id.clone());
                    if !retired.contains(&entry.tx_id) {
                        unretired.push(entry.clone());
                    }
                    terminal_records += 1;
                }
            }
        }
        if let Some(begin) = open.iter().find(|e| retired.contains(&e.tx_id)) {
            return Err(GuardError::WalCorrupt {
                path: wal_path,
                offset: 0,
                raw: String::new(),
                reason: format!("open BEGIN for retired transaction '{}'", begin.tx_id),
            });
        }
        let revert = match state.undo.clone() {
            Some(undo) => match open.iter().find(|e| e.tx_id == undo.tx_id) {
                Some(begin) => {
                    let delta = state.undone_delta(&undo);
                    if payload_hash(&undo.tx_id, &undo.intent_hash, &delta) != begin.payload_hash {
                        return Err(GuardError::StateMalformed {
                            path: state_path,
                            reason: format!(
                                "undo record for '{}' does not match its BEGIN payload",
                                undo.tx_id
                            ),
                        });
                    }
                    Some(undo)
                }
                None => None,
            },
            None => None,
        };
        closed.extend(retired);

        // Nothing has been written yet; from here on recovery repairs.
        if let Some(offset) = replay.truncated_at {
            wal::truncate_tail(&wal_path, offset)?;
        }
        if let Some(offset) = retired_replay.as_ref().and_then(|r| r.truncated_at) {
            wal::truncate_tail(&retired_path, offset)?;
        }

        let mut report = RecoveryReport {
            uncommitted_discarded: Vec::new(),
            reverted: Vec::new(),
            merkle_verified: true,
            state_version: 0,
            merkle_root: String::new(),
            wal_entries_scanned: replay.records.len(),
            torn_tail_truncated: replay.truncated_at.is_some(),
            orphaned_temp_files_removed: Vec::new(),
        };

        let mut log = WriteAheadLog::open(&wal_path)?;
        for begin in std::mem::take(&mut open) {
            let tx_id = begin.tx_id.clone();
            if let Some(undo) = revert.as_ref().filter(|u| u.tx_id == tx_id) {
                let reverted = state.reverted(undo);
                replace_state(&dir, &temp_path(&dir, "recovery"), &state_path, &reverted)?;
                tracing::warn!(
                    tx_id = %tx_id,
                    version = reverted.version,
                    merkle_root = %reverted.merkle_root,
                    "reverted uncommitted transaction from canonical state"
                );
                state = reverted;
                report.reverted.push(tx_id.clone());
            }
            let rollback = WalEntry::new(WalOp::Rollback, tx_id.as_str(), begin.payload_hash.as_str());
            log.append(&rollback)?;
            unretired.push(rollback);
            tracing::warn!(tx_id = %tx_id, "discarded transaction without COMMIT record");
            closed.insert(tx_id.clone());
            terminal_records += 1;
            report.uncommitted_discarded.push(tx_id);
        }

        let entries = fs::read_dir(&dir).map_err(|e| GuardError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| GuardError::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_temp_file(&name) {
                continue;
            }
            let path = entry.path();
            fs::remove_file(&path).map_err(|e| GuardError::io(&path, e))?;
            tracing::warn!(path = %path.display(), "removed orphaned temporary file");
            report.orphaned_temp_files_removed.push(name);
        }
        if !report.orphaned_temp_files_removed.is_empty() {
            report.orphaned_temp_files_removed.sort();
            sync_dir(&dir)?;
        }

        report.state_version = state.version;
        report.merkle_root = state.merkle_root.clone();
        tracing::info!(
            dir = %dir.display(),
            version = state.version,
            merkle_root = %state.merkle_root,
            wal_entries = report.wal_entries_scanned,
            discarded = report.uncommitted_discarded.len(),
            "ledger recovered"
        );

        let balances = Arc::new(state.balances.clone());
        let layer = Self {
            dir,
            state_path,
            compaction_threshold,
            ledger: Mutex::new(Ledger {
                state: Arc::new(state),
                balances,
            }),
            wal: Mutex::new(WalIndex {
                log,
                open,
                closed,
                unretired,
                terminal_records,
            }),
            fault: Mutex::new(None),
            in_flight: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        };
        if terminal_records >= compaction_threshold {
            layer.compact_wal()?;
        }
        Ok((layer, report))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn wal_path(&self) -> PathBuf {
        self.dir.join(WAL_FILE)
    }

    /// Current canonical state.
    pub fn snapshot(&self) -> GuardResult<Arc<LedgerState>> {
        Ok(Arc::clone(&self.ledger.lock()?.state))
    }

    /// Copy-on-write view of the current balances.
    pub fn balances(&self) -> GuardResult<Arc<Balances>> {
        Ok(Arc::clone(&self.ledger.lock()?.balances))
    }

    pub fn merkle_proof(&self, account: &str) -> GuardResult<Option<MerkleProof>> {
        Ok(MerkleProof::build(&self.ledger.lock()?.balances, account))
    }

    /// Transactions with BEGIN logged and no terminal record yet.
    pub fn open_transactions(&self) -> GuardResult<Vec<String>> {
        Ok(self.wal.lock()?.open.iter().map(|e| e.tx_id.clone()).collect())
    }

    /// Set when an I/O failure left the ledger needing recovery.
    pub fn fault(&self) -> GuardResult<Option<String>> {
        Ok(self.fault.lock()?.clone())
    }

    /// Rewrite the WAL keeping only BEGIN records of open transactions.
    /// Terminal records are first appended to the retired log, so their ids
    /// stay reserved. Returns the number of records dropped from the WAL.
    pub fn compact_wal(&self) -> GuardResult<usize> {
        let mut wal = self.wal.lock()?;
        if !wal.unretired.is_empty() {
            WriteAheadLog::open_or_create(&self.dir.join(RETIRED_FILE))?.append_all(&wal.unretired)?;
        }
        let live: Vec<WalEntry> = wal.open.clone();
        let dropped = wal.terminal_records * 2;
        let before = wal.log.len();
        wal.log.rewrite(live.iter())?;
        wal.unretired.clear();
        wal.terminal_records = 0;
        tracing::info!(
            path = %wal.log.path().display(),
            live = live.len(),
            dropped,
            bytes_before = before,
            bytes_after = wal.log.len(),
            "compacted write-ahead log"
        );
        Ok(dropped)
    }

    /// Durably apply an approved result's delta as transaction `tx_id`.
    ///
    /// Rejected results, results without a delta, deltas that no longer
    /// conserve value and deltas whose `before` balances are stale are
    /// DISCARDED without touching the WAL or the state.
    pub fn commit(&self, tx_id: &str, result: &ConsensusResult) -> GuardResult<CommitOutcome> {
        self.run_protocol(tx_id, result, None)
    }

    /// Run the protocol up to and including `crash_after`, then stop as if
    /// the process died there. The layer refuses further commits afterwards;
    /// drop it and call [`AtomicCommitLayer::recover`].
    pub fn commit_interrupted(
        &self,
        tx_id: &str,
        result: &ConsensusResult,
        crash_after: CommitStep,
    ) -> GuardResult<CommitOutcome> {
        self.run_protocol(tx_id, result, Some(crash_after))
    }

    fn ensure_serving(&self, tx_id: &str) -> GuardResult<()> {
        match self.fault.lock()?.as_ref() {
            Some(reason) => Err(GuardError::InvalidTransition {
                tx_id: tx_id.to_string(),
                reason: format!("commit layer halted ({reason}); restart recovery required"),
            }),
            None => Ok(()),
        }
    }

    fn halt(&self, tx_id: &str, reason: String) {
        tracing::error!(tx_id = %tx_id, reason = %reason, "commit layer halted");
        if let Ok(mut fault) = self.fault.lock() {
            fault.get_or_insert(reason);
        }
    }

    fn crashed_at(&self, tx_id: &str, step: CommitStep) -> GuardError {
        self.halt(tx_id, format!("simulated crash after {step:?}"));
        GuardError::Interrupted {
            reason: format!("simulated crash after {step:?}"),
        }
    }

    fn lock_accounts(&self, delta: &BalanceDelta) -> GuardResult<AccountGuard<'_>> {
        let accounts: Vec<String> = delta.accounts().map(str::to_string).collect();
        let mut busy = self.in_flight.lock()?;
        while accounts.iter().any(|a| busy.contains(a)) {
            busy = self.released.wait(busy)?;
        }
        busy.extend(accounts.iter().cloned());
        Ok(AccountGuard { layer: self, accounts })
    }

    fn log(&self, op: WalOp, tx_id: &str, payload_hash: &str) -> GuardResult<()> {
        let mut wal = self.wal.lock()?;
        let known = wal.is_open(tx_id);
        if op == WalOp::Begin && (known || wal.closed.contains(tx_id)) {
            return Err(GuardError::InvalidTransition {
                tx_id: tx_id.to_string(),
                reason: "transaction id already used".to_string(),
            });
        }
        if op.is_terminal() && !known {
            return Err(GuardError::InvalidTransition {
                tx_id: tx_id.to_string(),
                reason: format!("{op:?} without an open BEGIN"),
            });
        }
        let entry = WalEntry::new(op, tx_id, payload_hash);
        wal.log.append(&entry)?;
        if op == WalOp::Begin {
            wal.open.push(entry);
        } else {
            wal.open.retain(|e| e.tx_id != tx_id);
            wal.closed.insert(tx_id.to_string());
            wal.unretired.push(entry);
            wal.terminal_records += 1;
        }
        Ok(())
    }

    /// Undo a transaction whose state write never reached the canonical file.
    fn abort(&self, tx_id: &str, payload_hash: &str, temp: Option<&Path>) {
        if let Some(temp) = temp {
            if let Err(e) = fs::remove_file(temp) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %temp.display(), error = %e, "could not remove temp state file");
                }
            }
        }
        if let Err(e) = self.log(WalOp::Rollback, tx_id, payload_hash) {
            self.halt(tx_id, format!("ROLLBACK could not be logged: {e}"));
        }
    }

    fn run_protocol(
        &self,
        tx_id: &str,
        result: &ConsensusResult,
        crash_after: Option<CommitStep>,
    ) -> GuardResult<CommitOutcome> {
        validate_tx_id(tx_id)?;
        self.ensure_serving(tx_id)?;

        if !result.is_approved() {
            tracing::debug!(tx_id = %tx_id, intent = %result.intent_id(), "discarding rejected result");
            return Ok(CommitOutcome::Discarded);
        }
        if result.intent_hash().is_empty() {
            tracing::warn!(tx_id = %tx_id, intent = %result.intent_id(), "discarding result without an intent hash");
            return Ok(CommitOutcome::Discarded);
        }
        let Some(delta) = result.delta() else {
            tracing::warn!(tx_id = %tx_id, "discarding approved result without a balance delta");
            return Ok(CommitOutcome::Discarded);
        };
        if let Err(reason) = check_conservation(delta) {
            tracing::warn!(tx_id = %tx_id, reason = %reason, "discarding non-conserving delta");
            return Ok(CommitOutcome::Discarded);
        }
        let payload_hash = payload_hash(tx_id, result.intent_hash(), delta);

        let _accounts = self.lock_accounts(delta)?;
        {
            let ledger = self.ledger.lock()?;
            let stale = delta
                .changes
                .iter()
                .find(|(account, change)| balance_of(&ledger.state.balances, account) != change.before);
            if let Some((account, change)) = stale {
                tracing::warn!(
                    tx_id = %tx_id,
                    account = %account,
                    expected = %change.before,
                    actual = %balance_of(&ledger.state.balances, account),
                    "discarding stale delta"
                );
                return Ok(CommitOutcome::Discarded);
            }
        }

        // 1. BEGIN
        self.log(WalOp::Begin, tx_id, &payload_hash)?;
        if crash_after == Some(CommitStep::BeginLogged) {
            return Err(self.crashed_at(tx_id, CommitStep::BeginLogged));
        }

        let mut ledger = self.ledger.lock()?;
        // 2. apply in memory
        let next = match ledger.state.applied(tx_id, result.intent_hash(), &payload_hash, delta) {
            Ok(next) => next,
            Err(e) => {
                self.abort(tx_id, &payload_hash, None);
                return Err(e);
            }
        };
        if crash_after == Some(CommitStep::StateApplied) {
            return Err(self.crashed_at(tx_id, CommitStep::StateApplied));
        }

        // 3. temp file
        let temp = temp_path(&self.dir, tx_id);
        if let Err(e) = write_temp(&temp, &next) {
            self.abort(tx_id, &payload_hash, Some(&temp));
            return Err(e);
        }
        if crash_after == Some(CommitStep::TempWritten) {
            return Err(self.crashed_at(tx_id, CommitStep::TempWritten));
        }

        // 4. atomic replace
        if let Err(e) = fs::rename(&temp, &self.state_path) {
            self.abort(tx_id, &payload_hash, Some(&temp));
            return Err(GuardError::io(&self.state_path, e));
        }
        ledger.balances = Arc::new(next.balances.clone());
        ledger.state = Arc::new(next);
        if let Err(e) = sync_dir(&self.dir) {
            self.halt(tx_id, format!("state directory sync failed: {e}"));
            return Err(e);
        }
        if crash_after == Some(CommitStep::Renamed) {
            return Err(self.crashed_at(tx_id, CommitStep::Renamed));
        }

        // 5. COMMIT
        if let Err(e) = self.log(WalOp::Commit, tx_id, &payload_hash) {
            self.halt(tx_id, format!("COMMIT could not be logged: {e}"));
            return Err(e);
        }
        tracing::info!(
            tx_id = %tx_id,
            version = ledger.state.version,
            accounts = delta.changes.len(),
            merkle_root = %ledger.state.merkle_root,
            "transaction committed"
        );
        drop(ledger);
        if crash_after == Some(CommitStep::CommitLogged) {
            self.halt(tx_id, "simulated crash after CommitLogged".to_string());
            return Ok(CommitOutcome::Committed);
        }

        let due = self.wal.lock()?.terminal_records >= self.compaction_threshold;
        if due {
            self.compact_wal()?;
        }
        Ok(CommitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_id_rules() {
        assert!(validate_tx_id("tx-001_a.b").is_ok());
        assert!(validate_tx_id("").is_err());
        assert!(validate_tx_id(".hidden").is_err());
        assert!(validate_tx_id("a/b").is_err());
        assert!(validate_tx_id(&"x".repeat(MAX_TX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn temp_file_names() {
        assert!(is_temp_file("state.json.tx-1.tmp"));
        assert!(is_temp_file("wal.log.compact.tmp"));
        assert!(!is_temp_file("state.json"));
        assert!(!is_temp_file("wal.log"));
    }

    #[test]
    fn revert_restores_prior_root() {
        let mut genesis = Balances::new();
        genesis.insert("alice".to_string(), Decimal::from(100));
        let state = LedgerState::genesis(genesis).unwrap();
        let mut changes = BTreeMap::new();
        changes.insert(
            "alice".to_string(),
            BalanceChange { before: Decimal::from(100), after: Decimal::ZERO },
        );
        changes.insert(
            "bob".to_string(),
            BalanceChange { before: Decimal::ZERO, after: Decimal::from(100) },
        );
        let delta = BalanceDelta { changes };
        let hash = payload_hash("tx-1", "intent", &delta);
        let next = state.applied("tx-1", "intent", &hash, &delta).unwrap();
        let undo = next.undo.clone().unwrap();

        assert_eq!(payload_hash("tx-1", "intent", &next.undone_delta(&undo)), hash);
        let back = next.reverted(&undo);
        assert_eq!(back.merkle_root, state.merkle_root);
        assert_eq!(back.balances, state.balances);
        assert_eq!(back.version, 0);
    }
}
