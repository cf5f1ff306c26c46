//! intentguard - fail-closed verification and commit kernel
//!
//! Verifies proposed ledger transitions with several independent verifiers,
//! reaches a fail-closed consensus, and commits approved transitions through
//! a write-ahead log and a Merkle-verified canonical state.

pub mod error;
pub mod decimal;
pub mod types;
pub mod terms;
pub mod config;
pub mod solver;
pub mod verifier;
pub mod logic;
pub mod conservation;
pub mod pattern;
pub mod gating;
pub mod engine;
pub mod merkle;
pub mod wal;
pub mod commit;
pub mod events;
pub mod orchestrator;

pub use error::{GuardError, GuardResult};
pub use decimal::{Decimal, DEFAULT_PRECISION, MAX_PRECISION};
pub use types::{
    Balances, BalanceChange, BalanceDelta, Cmp, ConsensusResult, Decision, Expr,
    FinalDecision, Intent, IntentMetadata, Predicate, Verdict, VariableFlags, VerifierId,
    compute_content_hash,
};
pub use config::{GuardConfig, PatternConfig};
pub use verifier::{run_bounded, Expert, ExpertPool, VerificationContext, Verifier};
pub use logic::LogicVerifier;
pub use conservation::{check_conservation, derive_delta, ConservationVerifier, DeltaError};
pub use pattern::{Finding, PatternKind, PatternVerifier};
pub use gating::{GatingNetwork, IntentFeatures};
pub use engine::{ConsensusConfig, ConsensusEngine};
pub use merkle::MerkleProof;
pub use commit::{AtomicCommitLayer, CommitOutcome, CommitStep, LedgerState, RecoveryReport};
pub use events::{EventSink, JsonLinesSink, MemorySink, NullSink, VerificationEvent};
pub use orchestrator::{sink_from_config, Orchestrator};
