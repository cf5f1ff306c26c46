//! Logic verifier: satisfiability of guard and verify predicates.

use crate::decimal::Decimal;
use crate::error::{GuardError, GuardResult};
use crate::solver::{translate_predicate, Constraint, Rational, Solver, SolverOutcome, TranslateError};
use crate::terms;
use crate::types::{balance_of, Verdict, VerifierId};
use crate::verifier::{run_bounded, VerificationContext, Verifier};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Maps solver outcomes onto verdicts.
///
/// | outcome | verdict |
/// |---|---|
/// | sat | APPROVE |
/// | unsat | REJECT |
/// | unknown, overflow, malformed input | UNCERTAIN |
#[derive(Debug, Clone)]
pub struct LogicVerifier {
    max_constraints: usize,
}

impl LogicVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_constraints(max_constraints: usize) -> Self {
        Self { max_constraints }
    }

    /// Constraints for every predicate plus pinned pre-state balances.
    fn build_query(&self, ctx: &VerificationContext) -> Result<Vec<Constraint>, TranslateError> {
        let intent = ctx.intent();
        let mut constraints = Vec::with_capacity(intent.guard.len() + intent.verify.len());
        let mut referenced = BTreeSet::new();
        for predicate in intent.predicates() {
            constraints.push(translate_predicate(predicate, ctx.precision())?);
            referenced.extend(predicate.variables());
        }
        for name in referenced {
            let Some(term) = terms::parse_balance_term(name) else {
                continue;
            };
            if term.post || intent.flags(name).external {
                continue;
            }
            let value: Decimal = balance_of(ctx.balances(), &term.account);
            let pinned = Rational::from_decimal(&value)
                .and_then(|r| Constraint::pin(name, r))
                .ok_or(TranslateError::Overflow)?;
            constraints.push(pinned);
        }
        Ok(constraints)
    }

    fn check(&self, ctx: &VerificationContext, deadline: Instant) -> GuardResult<Verdict> {
        let id = VerifierId::Logic;
        let constraints = match self.build_query(ctx) {
            Ok(c) => c,
            Err(TranslateError::Malformed(reason)) => {
                return Err(GuardError::Validation {
                    field: "literal".to_string(),
                    message: reason,
                })
            }
            Err(TranslateError::NonLinear) => {
                return Ok(Verdict::uncertain(id, "solver unknown: non-linear term"))
            }
            Err(TranslateError::Overflow) => {
                return Ok(Verdict::uncertain(id, "solver unknown: arithmetic overflow"))
            }
        };

        let solver = Solver::new(deadline, ctx.cancel_token().clone())
            .with_max_constraints(self.max_constraints);
        // APPROVE is only reachable from the Sat arm.
        Ok(match solver.check(constraints) {
            SolverOutcome::Sat(proof) => Verdict::approve(
                id,
                1.0,
                format!(
                    "satisfiable over {} variables ({} branch(es) explored)",
                    proof.variables(),
                    proof.branches()
                ),
            ),
            SolverOutcome::Unsat { reason } => {
                Verdict::reject(id, 1.0, format!("contradiction proven: {reason}"))
            }
            SolverOutcome::Unknown { reason } => {
                Verdict::uncertain(id, format!("solver unknown: {reason}"))
            }
        })
    }
}

impl Default for LogicVerifier {
    fn default() -> Self {
        Self {
            max_constraints: Solver::DEFAULT_MAX_CONSTRAINTS,
        }
    }
}

impl Verifier for LogicVerifier {
    fn id(&self) -> VerifierId {
        VerifierId::Logic
    }

    fn verify(&self, ctx: &VerificationContext, timeout: Duration) -> Verdict {
        run_bounded(self.id(), timeout, |deadline| self.check(ctx, deadline))
    }
}
