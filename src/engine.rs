//! Consensus engine for intentguard.
use crate::config::GuardConfig;
use crate::types::{ConsensusResult, Decision, FinalDecision, Verdict, VerifierId};
use std::collections::BTreeSet;

/// Confidence thresholds for aggregation.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub approval_threshold: f64,
    pub rejection_threshold: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            approval_threshold: 0.75,
            rejection_threshold: 0.9,
        }
    }
}

impl From<&GuardConfig> for ConsensusConfig {
    fn from(config: &GuardConfig) -> Self {
        Self {
            approval_threshold: config.approval_threshold,
            rejection_threshold: config.rejection_threshold,
        }
    }
}

/// Fail-closed aggregation of verifier verdicts.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    config: ConsensusConfig,
}

impl ConsensusEngine {
    /// Create a consensus engine with default thresholds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a consensus engine with custom thresholds.
    pub fn with_config(config: ConsensusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// A REJECT confident enough to end consensus on its own.
    pub fn is_short_circuit(&self, verdict: &Verdict) -> bool {
        verdict.decision() == Decision::Reject
            && verdict.confidence() >= self.config.rejection_threshold
    }

    fn approves(&self, verdict: &Verdict) -> bool {
        verdict.decision() == Decision::Approve
            && verdict.confidence() >= self.config.approval_threshold
    }

    /// Aggregate verdicts for the `activated` verifiers.
    ///
    /// 1. any short-circuit REJECT gives REJECTED;
    /// 2. otherwise every activated verifier approving above threshold gives APPROVED;
    /// 3. anything else, including a missing verdict, gives REJECTED.
    ///
    /// All verdicts are kept in the result.
    pub fn aggregate(&self, activated: &BTreeSet<VerifierId>, verdicts: Vec<Verdict>) -> ConsensusResult {
        let (final_decision, rationale) = self.decide(activated, &verdicts);
        ConsensusResult {
            intent_id: String::new(),
            intent_hash: String::new(),
            final_decision,
            activated: activated.clone(),
            verdicts,
            rationale,
            delta: None,
        }
    }

    /// REJECTED result for an intent that never reached the verifiers.
    pub fn refuse(&self, reason: impl Into<String>) -> ConsensusResult {
        ConsensusResult {
            intent_id: String::new(),
            intent_hash: String::new(),
            final_decision: FinalDecision::Rejected,
            activated: BTreeSet::new(),
            verdicts: Vec::new(),
            rationale: reason.into(),
            delta: None,
        }
    }

    fn decide(&self, activated: &BTreeSet<VerifierId>, verdicts: &[Verdict]) -> (FinalDecision, String) {
        if let Some(v) = verdicts.iter().find(|v| self.is_short_circuit(v)) {
            return (
                FinalDecision::Rejected,
                format!(
                    "{} rejected with confidence {:.2}: {}",
                    v.verifier_id(),
                    v.confidence(),
                    v.diagnostic()
                ),
            );
        }
        if activated.is_empty() {
            return (FinalDecision::Rejected, "no verifier was activated".to_string());
        }

        let mut blockers = Vec::new();
        for id in activated {
            match verdicts.iter().find(|v| v.verifier_id() == *id) {
                None => blockers.push(format!("{id}: no verdict")),
                Some(v) if self.approves(v) => {}
                Some(v) => blockers.push(match v.decision() {
                    Decision::Approve => format!(
                        "{id}: approval confidence {:.2} below {:.2}",
                        v.confidence(),
                        self.config.approval_threshold
                    ),
                    Decision::Reject => format!(
                        "{id}: rejected with confidence {:.2}: {}",
                        v.confidence(),
                        v.diagnostic()
                    ),
                    Decision::Uncertain => format!("{id}: uncertain: {}", v.diagnostic()),
                }),
            }
        }

        if blockers.is_empty() {
            let ids: Vec<&str> = activated.iter().map(|id| id.as_str()).collect();
            (
                FinalDecision::Approved,
                format!("unanimous approval by {}", ids.join(", ")),
            )
        } else {
            (FinalDecision::Rejected, blockers.join("; "))
        }
    }
}

impl Default for ConsensusEngine {
    fn default() -> Self {
        Self {
            config: ConsensusConfig::default(),
        }
    }
}
