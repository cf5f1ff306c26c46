//! Gating network: cheap static routing of intents to verifiers.
//!
//! Gating only bounds cost. Consensus still refuses anything the activated
//! verifiers do not unanimously approve.

use crate::config::GuardConfig;
use crate::decimal::{Decimal, MAX_PRECISION};
use crate::error::GuardResult;
use crate::pattern::looks_anomalous;
use crate::terms;
use crate::types::{Cmp, Intent, VerifierId};
use serde::Serialize;
use std::collections::BTreeSet;

/// Routing signals extracted once per intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntentFeatures {
    /// Verify predicates that mention a post-state balance.
    pub balance_mutations: usize,
    /// Predicates that constrain values: every guard predicate, and every
    /// verify predicate other than a literal balance assignment.
    pub relational_predicates: usize,
    /// Total expression nodes.
    pub complexity: usize,
    /// Oracle or secret variables, variable products, extreme literals,
    /// or self-reference.
    pub anomalous: bool,
}

impl IntentFeatures {
    pub fn extract(intent: &Intent, magnitude_limit: &Decimal, precision: u32) -> Self {
        let balance_mutations = intent
            .verify
            .iter()
            .filter(|p| p.variables().iter().any(|v| terms::is_post_balance_var(v)))
            .count();
        let relational_predicates = intent.guard.len()
            + intent
                .verify
                .iter()
                .filter(|p| {
                    p.op != Cmp::Eq
                        || p.lhs.is_arithmetic()
                        || p.rhs.is_arithmetic()
                        || p.balance_assignment().is_none()
                })
                .count();
        let complexity = intent.predicates().map(|p| p.node_count()).sum();
        Self {
            balance_mutations,
            relational_predicates,
            complexity,
            anomalous: looks_anomalous(intent, magnitude_limit, precision),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatingNetwork {
    complexity_threshold: usize,
    magnitude_limit: Decimal,
    precision: u32,
}

impl GatingNetwork {
    pub fn from_config(config: &GuardConfig) -> GuardResult<Self> {
        Ok(Self {
            complexity_threshold: config.pattern.complexity_threshold,
            magnitude_limit: Decimal::parse(&config.pattern.magnitude_limit, MAX_PRECISION)?,
            precision: config.decimal_precision,
        })
    }

    pub fn features(&self, intent: &Intent) -> IntentFeatures {
        IntentFeatures::extract(intent, &self.magnitude_limit, self.precision)
    }

    /// Verifiers to activate. Never empty: no signal activates all of them.
    pub fn select(&self, features: &IntentFeatures) -> BTreeSet<VerifierId> {
        let mut selected = BTreeSet::new();
        if features.balance_mutations > 0 {
            selected.insert(VerifierId::Conservation);
        }
        if features.relational_predicates > 0 {
            selected.insert(VerifierId::Logic);
        }
        if features.anomalous || features.complexity > self.complexity_threshold {
            selected.insert(VerifierId::Pattern);
        }
        if selected.is_empty() {
            selected.extend(VerifierId::ALL);
        }
        selected
    }
}
