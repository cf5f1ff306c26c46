//! Core data types for intentguard.

use crate::decimal::Decimal;
use crate::error::{GuardError, GuardResult};
use crate::terms;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Account balances keyed by account name. Absent accounts hold zero.
pub type Balances = BTreeMap<String, Decimal>;

/// Balance of `account`, zero when the account has never been credited.
pub fn balance_of(balances: &Balances, account: &str) -> Decimal {
    balances.get(account).copied().unwrap_or(Decimal::ZERO)
}

/// Arithmetic term over intent variables.
///
/// Literals keep the exact text the intent compiler produced; they are only
/// turned into numbers by [`Decimal::parse`] at verification time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Lit(String),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
}

impl Expr {
    pub fn lit(text: impl Into<String>) -> Self {
        Self::Lit(text.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    /// Pre-state balance of `account`.
    pub fn balance(account: &str) -> Self {
        Self::Var(terms::pre_balance_var(account))
    }

    /// Post-state balance of `account`.
    pub fn post_balance(account: &str) -> Self {
        Self::Var(terms::post_balance_var(account))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Self::Add(Box::new(lhs), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::Sub(Box::new(lhs), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Self::Mul(Box::new(lhs), Box::new(rhs))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(inner: Expr) -> Self {
        Self::Neg(Box::new(inner))
    }

    pub fn depth(&self) -> usize {
        match self {
            Self::Lit(_) | Self::Var(_) => 1,
            Self::Neg(e) => 1 + e.depth(),
            Self::Add(a, b) | Self::Sub(a, b) | Self::Mul(a, b) => 1 + a.depth().max(b.depth()),
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            Self::Lit(_) | Self::Var(_) => 1,
            Self::Neg(e) => 1 + e.node_count(),
            Self::Add(a, b) | Self::Sub(a, b) | Self::Mul(a, b) => {
                1 + a.node_count() + b.node_count()
            }
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        !matches!(self, Self::Lit(_) | Self::Var(_))
    }

    pub fn collect_variables<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::Lit(_) => {}
            Self::Var(name) => {
                out.insert(name.as_str());
            }
            Self::Neg(e) => e.collect_variables(out),
            Self::Add(a, b) | Self::Sub(a, b) | Self::Mul(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
        }
    }

    pub fn collect_literals<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Lit(text) => out.push(text.as_str()),
            Self::Var(_) => {}
            Self::Neg(e) => e.collect_literals(out),
            Self::Add(a, b) | Self::Sub(a, b) | Self::Mul(a, b) => {
                a.collect_literals(out);
                b.collect_literals(out);
            }
        }
    }

    pub fn variables(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_variables(&mut out);
        out
    }

    pub fn mentions(&self, name: &str) -> bool {
        self.variables().contains(name)
    }
}

/// Comparison operator of a predicate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// Atomic comparison `lhs op rhs`. A list of predicates is a conjunction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Predicate {
    pub lhs: Expr,
    pub op: Cmp,
    pub rhs: Expr,
}

impl Predicate {
    pub fn new(lhs: Expr, op: Cmp, rhs: Expr) -> Self {
        Self { lhs, op, rhs }
    }

    pub fn depth(&self) -> usize {
        self.lhs.depth().max(self.rhs.depth())
    }

    pub fn node_count(&self) -> usize {
        1 + self.lhs.node_count() + self.rhs.node_count()
    }

    pub fn variables(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.lhs.collect_variables(&mut out);
        self.rhs.collect_variables(&mut out);
        out
    }

    pub fn literals(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.lhs.collect_literals(&mut out);
        self.rhs.collect_literals(&mut out);
        out
    }

    /// `<account>.balance' == expr` (either orientation) as `(account, expr)`.
    pub fn balance_assignment(&self) -> Option<(String, &Expr)> {
        if self.op != Cmp::Eq {
            return None;
        }
        let post_account = |e: &Expr| match e {
            Expr::Var(name) => terms::parse_balance_term(name)
                .filter(|t| t.post)
                .map(|t| t.account),
            _ => None,
        };
        if let Some(account) = post_account(&self.lhs) {
            return Some((account, &self.rhs));
        }
        post_account(&self.rhs).map(|account| (account, &self.lhs))
    }
}

/// Per-variable flags set by the intent compiler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VariableFlags {
    /// Value is supplied by an external oracle.
    #[serde(default)]
    pub external: bool,
    /// Value is privacy-restricted.
    #[serde(default)]
    pub secret: bool,
}

/// Solve metadata attached to an intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IntentMetadata {
    pub priority: u32,
    pub target: String,
}

/// Proposed state transition produced by the intent compiler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Intent {
    pub id: String,
    pub guard: Vec<Predicate>,
    pub verify: Vec<Predicate>,
    #[serde(default)]
    pub metadata: IntentMetadata,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableFlags>,
}

impl Intent {
    /// Maximum predicates across guard and verify.
    pub const MAX_PREDICATES: usize = 1024;
    /// Maximum nesting of a single expression.
    pub const MAX_EXPR_DEPTH: usize = 64;

    pub fn new(id: impl Into<String>, guard: Vec<Predicate>, verify: Vec<Predicate>) -> Self {
        Self {
            id: id.into(),
            guard,
            verify,
            metadata: IntentMetadata::default(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, priority: u32, target: impl Into<String>) -> Self {
        self.metadata = IntentMetadata {
            priority,
            target: target.into(),
        };
        self
    }

    pub fn with_flags(mut self, name: impl Into<String>, flags: VariableFlags) -> Self {
        self.variables.insert(name.into(), flags);
        self
    }

    pub fn flags(&self, name: &str) -> VariableFlags {
        self.variables.get(name).copied().unwrap_or_default()
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Predicate> {
        self.guard.iter().chain(self.verify.iter())
    }

    pub fn validate(&self) -> GuardResult<()> {
        if self.id.is_empty() {
            return Err(GuardError::Validation {
                field: "id".to_string(),
                message: "Intent must have a non-empty ID".to_string(),
            });
        }
        let count = self.guard.len() + self.verify.len();
        if count > Self::MAX_PREDICATES {
            return Err(GuardError::ResourceLimit {
                resource: "intent_predicates".to_string(),
                limit: Self::MAX_PREDICATES,
                actual: count,
            });
        }
        for predicate in self.predicates() {
            let depth = predicate.depth();
            if depth > Self::MAX_EXPR_DEPTH {
                return Err(GuardError::ResourceLimit {
                    resource: "expression_depth".to_string(),
                    limit: Self::MAX_EXPR_DEPTH,
                    actual: depth,
                });
            }
            if predicate.variables().iter().any(|v| v.is_empty()) {
                return Err(GuardError::Validation {
                    field: "variables".to_string(),
                    message: "variable names must be non-empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Content-addressed identity of the intent.
    pub fn content_hash(&self) -> GuardResult<String> {
        Ok(compute_content_hash(&serde_json::to_value(self)?))
    }
}

/// Identifier of one member of the expert pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VerifierId {
    Logic,
    Conservation,
    Pattern,
}

impl VerifierId {
    pub const ALL: [VerifierId; 3] = [Self::Logic, Self::Conservation, Self::Pattern];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logic => "logic",
            Self::Conservation => "conservation",
            Self::Pattern => "pattern",
        }
    }
}

impl std::fmt::Display for VerifierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One verifier's opinion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approve,
    Reject,
    Uncertain,
}

/// A verifier's decision with its confidence and diagnostic.
///
/// Confidence is clamped into `[0.0, 1.0]` on construction; NaN becomes 0.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Verdict {
    verifier_id: VerifierId,
    decision: Decision,
    confidence: f64,
    latency: Duration,
    diagnostic: String,
}

impl Verdict {
    fn new(
        verifier_id: VerifierId,
        decision: Decision,
        confidence: f64,
        diagnostic: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            verifier_id,
            decision,
            confidence,
            latency: Duration::ZERO,
            diagnostic: diagnostic.into(),
        }
    }

    pub fn approve(verifier_id: VerifierId, confidence: f64, diagnostic: impl Into<String>) -> Self {
        Self::new(verifier_id, Decision::Approve, confidence, diagnostic)
    }

    pub fn reject(verifier_id: VerifierId, confidence: f64, diagnostic: impl Into<String>) -> Self {
        Self::new(verifier_id, Decision::Reject, confidence, diagnostic)
    }

    pub fn uncertain(verifier_id: VerifierId, diagnostic: impl Into<String>) -> Self {
        Self::new(verifier_id, Decision::Uncertain, 0.0, diagnostic)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn verifier_id(&self) -> VerifierId {
        self.verifier_id
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    pub fn diagnostic(&self) -> &str {
        &self.diagnostic
    }
}

/// Before/after balance of one account touched by a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceChange {
    pub before: Decimal,
    pub after: Decimal,
}

/// Exact balance changes an approved intent applies to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BalanceDelta {
    pub changes: BTreeMap<String, BalanceChange>,
}

impl BalanceDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Sum of balances before the transaction.
    pub fn inputs(&self) -> GuardResult<Decimal> {
        Decimal::try_sum(self.changes.values().map(|c| &c.before))
    }

    /// Sum of balances after the transaction.
    pub fn outputs(&self) -> GuardResult<Decimal> {
        Decimal::try_sum(self.changes.values().map(|c| &c.after))
    }

    pub fn content_hash(&self) -> GuardResult<String> {
        Ok(compute_content_hash(&serde_json::to_value(self)?))
    }
}

/// Final outcome of consensus. There is no uncertain outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDecision {
    Approved,
    Rejected,
}

/// Aggregation of all verdicts collected for one intent.
///
/// Only the consensus engine and orchestrator construct this, so an
/// `Approved` result reaching the commit layer always went through the
/// fail-closed aggregation rule.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConsensusResult {
    pub(crate) intent_id: String,
    pub(crate) intent_hash: String,
    pub(crate) final_decision: FinalDecision,
    pub(crate) activated: BTreeSet<VerifierId>,
    pub(crate) verdicts: Vec<Verdict>,
    pub(crate) rationale: String,
    pub(crate) delta: Option<BalanceDelta>,
}

impl ConsensusResult {
    pub fn intent_id(&self) -> &str {
        &self.intent_id
    }

    pub fn intent_hash(&self) -> &str {
        &self.intent_hash
    }

    pub fn final_decision(&self) -> FinalDecision {
        self.final_decision
    }

    pub fn is_approved(&self) -> bool {
        self.final_decision == FinalDecision::Approved
    }

    pub fn activated(&self) -> &BTreeSet<VerifierId> {
        &self.activated
    }

    pub fn verdicts(&self) -> &[Verdict] {
        &self.verdicts
    }

    pub fn verdict(&self, id: VerifierId) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| v.verifier_id() == id)
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    /// Balance changes to apply; present only on approved results.
    pub fn delta(&self) -> Option<&BalanceDelta> {
        self.delta.as_ref()
    }

    pub(crate) fn downgrade(mut self, reason: impl Into<String>) -> Self {
        self.final_decision = FinalDecision::Rejected;
        self.rationale = format!("{}; {}", self.rationale, reason.into());
        self.delta = None;
        self
    }
}

/// Compute a deterministic content-addressable hash for an artifact.
pub fn compute_content_hash(obj: &serde_json::Value) -> String {
    // Use compact serialization with sorted keys for determinism
    let serialized = canonical_json(obj);
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Produce canonical JSON with deterministic key ordering.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
        serde_json::Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        _ => serde_json::to_string(value).unwrap_or_else(|_| "null".to_string()),
    }
}
