//! Conservation verifier and exact balance-delta derivation.
//!
//! Every balance assignment `acct.balance' == expr` in the verify set is
//! evaluated with [`Decimal`] arithmetic against the pre-state snapshot. The
//! transition conserves value iff the touched accounts hold exactly the same
//! total before and after, and no account ends below zero.

use crate::decimal::Decimal;
use crate::error::GuardResult;
use crate::terms;
use crate::types::{balance_of, Balances, BalanceChange, BalanceDelta, Cmp, Expr, Intent, Verdict, VerifierId};
use crate::verifier::{ensure_live, run_bounded, VerificationContext, Verifier};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Why no conserving delta could be derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaError {
    /// The intent provably breaks a ledger rule (precision loss, overdraft,
    /// imbalance, duplicate assignment).
    Violation(String),
    /// The delta depends on values this layer cannot resolve.
    Indeterminate(String),
}

impl std::fmt::Display for DeltaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Violation(reason) => write!(f, "violation: {reason}"),
            Self::Indeterminate(reason) => write!(f, "indeterminate: {reason}"),
        }
    }
}

/// Literal bindings `name == literal` for non-balance, non-external variables.
fn literal_bindings(intent: &Intent, precision: u32) -> Result<BTreeMap<String, Decimal>, DeltaError> {
    let mut bindings: BTreeMap<String, Decimal> = BTreeMap::new();
    for predicate in intent.predicates() {
        if predicate.op != Cmp::Eq {
            continue;
        }
        let (name, text) = match (&predicate.lhs, &predicate.rhs) {
            (Expr::Var(name), Expr::Lit(text)) | (Expr::Lit(text), Expr::Var(name)) => (name, text),
            _ => continue,
        };
        if terms::is_balance_var(name) || intent.flags(name).external {
            continue;
        }
        let value = Decimal::parse(text, precision).map_err(|e| DeltaError::Violation(e.to_string()))?;
        if let Some(previous) = bindings.insert(name.clone(), value) {
            if previous != value {
                return Err(DeltaError::Indeterminate(format!(
                    "'{name}' bound to both {previous} and {value}"
                )));
            }
        }
    }
    Ok(bindings)
}

fn evaluate(
    expr: &Expr,
    balances: &Balances,
    bindings: &BTreeMap<String, Decimal>,
    precision: u32,
) -> Result<Decimal, DeltaError> {
    let arith = |r: GuardResult<Decimal>| r.map_err(|e| DeltaError::Violation(e.to_string()));
    match expr {
        Expr::Lit(text) => Decimal::parse(text, precision).map_err(|e| DeltaError::Violation(e.to_string())),
        Expr::Var(name) => match terms::parse_balance_term(name) {
            Some(term) if !term.post => Ok(balance_of(balances, &term.account)),
            Some(_) => Err(DeltaError::Indeterminate(format!(
                "post-state balance '{name}' used as an input"
            ))),
            None => bindings
                .get(name)
                .copied()
                .ok_or_else(|| DeltaError::Indeterminate(format!("'{name}' has no exact value"))),
        },
        Expr::Neg(inner) => arith(evaluate(inner, balances, bindings, precision)?.checked_neg()),
        Expr::Add(a, b) => {
            let a = evaluate(a, balances, bindings, precision)?;
            let b = evaluate(b, balances, bindings, precision)?;
            arith(a.checked_add(&b))
        }
        Expr::Sub(a, b) => {
            let a = evaluate(a, balances, bindings, precision)?;
            let b = evaluate(b, balances, bindings, precision)?;
            arith(a.checked_sub(&b))
        }
        Expr::Mul(a, b) => {
            let a = evaluate(a, balances, bindings, precision)?;
            let b = evaluate(b, balances, bindings, precision)?;
            arith(a.checked_mul(&b))
        }
    }
}

/// Exact before/after balances of every account the intent assigns.
pub fn derive_delta(intent: &Intent, balances: &Balances, precision: u32) -> Result<BalanceDelta, DeltaError> {
    let bindings = literal_bindings(intent, precision)?;
    let mut changes = BTreeMap::new();
    for predicate in &intent.verify {
        let Some((account, expr)) = predicate.balance_assignment() else {
            continue;
        };
        let after = evaluate(expr, balances, &bindings, precision)?;
        let change = BalanceChange {
            before: balance_of(balances, &account),
            after,
        };
        if changes.insert(account.clone(), change).is_some() {
            return Err(DeltaError::Violation(format!(
                "account '{account}' is assigned more than once"
            )));
        }
    }
    Ok(BalanceDelta { changes })
}

/// `sum(inputs) == sum(outputs)` exactly, and no overdraft.
pub fn check_conservation(delta: &BalanceDelta) -> Result<(), DeltaError> {
    let violation = |e: crate::error::GuardError| DeltaError::Violation(e.to_string());
    for (account, change) in &delta.changes {
        if change.after.is_negative() {
            return Err(DeltaError::Violation(format!(
                "account '{account}' would fall to {} (was {})",
                change.after, change.before
            )));
        }
    }
    let inputs = delta.inputs().map_err(violation)?;
    let outputs = delta.outputs().map_err(violation)?;
    if inputs != outputs {
        return Err(DeltaError::Violation(format!(
            "value not conserved: inputs {inputs} != outputs {outputs}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct ConservationVerifier;

impl ConservationVerifier {
    pub fn new() -> Self {
        Self
    }

    fn check(&self, ctx: &VerificationContext, deadline: Instant) -> GuardResult<Verdict> {
        let id = VerifierId::Conservation;
        ensure_live(ctx, deadline)?;
        let delta = match derive_delta(ctx.intent(), ctx.balances(), ctx.precision()) {
            Ok(delta) => delta,
            Err(DeltaError::Violation(reason)) => return Ok(Verdict::reject(id, 1.0, reason)),
            Err(DeltaError::Indeterminate(reason)) => return Ok(Verdict::uncertain(id, reason)),
        };
        ensure_live(ctx, deadline)?;
        if delta.is_empty() {
            return Ok(Verdict::approve(id, 1.0, "no balance-affecting terms"));
        }
        Ok(match check_conservation(&delta) {
            Ok(()) => Verdict::approve(
                id,
                1.0,
                format!("{} account(s) balanced exactly", delta.changes.len()),
            ),
            Err(DeltaError::Violation(reason)) => Verdict::reject(id, 1.0, reason),
            Err(DeltaError::Indeterminate(reason)) => Verdict::uncertain(id, reason),
        })
    }
}

impl Verifier for ConservationVerifier {
    fn id(&self) -> VerifierId {
        VerifierId::Conservation
    }

    fn verify(&self, ctx: &VerificationContext, timeout: Duration) -> Verdict {
        run_bounded(self.id(), timeout, |deadline| self.check(ctx, deadline))
    }
}
