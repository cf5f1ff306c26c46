//! Pattern verifier: static scan for known exploit shapes.
//!
//! Findings carry weights that are summed into a score. Below
//! `reject_score` the verifier still approves, but with confidence lowered by
//! the score, which can be enough to keep consensus from approving.

use crate::config::PatternConfig;
use crate::decimal::{Decimal, MAX_PRECISION};
use crate::error::GuardResult;
use crate::types::{Cmp, Expr, Intent, Verdict, VerifierId};
use crate::verifier::{ensure_live, run_bounded, VerificationContext, Verifier};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Multiplication by a literal at least this large counts as amplification.
const AMPLIFICATION_FACTOR: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Product of two variables, or an unbounded oracle value moving balances.
    UnboundedArithmetic,
    /// Literal of extreme magnitude or large amplification factor.
    MagnitudeJump,
    /// A post-state variable defined in terms of itself.
    SelfReferentialMutation,
    /// Privacy-restricted value flowing into a balance.
    SecretLeak,
}

impl PatternKind {
    pub fn weight(&self) -> f64 {
        match self {
            Self::UnboundedArithmetic => 0.4,
            Self::MagnitudeJump => 0.3,
            Self::SelfReferentialMutation => 0.6,
            Self::SecretLeak => 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: PatternKind,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct PatternVerifier {
    magnitude_limit: Decimal,
    clean_confidence: f64,
    reject_score: f64,
}

fn has_variable_product(expr: &Expr) -> bool {
    match expr {
        Expr::Lit(_) | Expr::Var(_) => false,
        Expr::Neg(e) => has_variable_product(e),
        Expr::Add(a, b) | Expr::Sub(a, b) => has_variable_product(a) || has_variable_product(b),
        Expr::Mul(a, b) => {
            (!a.variables().is_empty() && !b.variables().is_empty())
                || has_variable_product(a)
                || has_variable_product(b)
        }
    }
}

fn amplifying_literals(expr: &Expr, precision: u32, out: &mut Vec<String>) {
    match expr {
        Expr::Lit(_) | Expr::Var(_) => {}
        Expr::Neg(e) => amplifying_literals(e, precision, out),
        Expr::Add(a, b) | Expr::Sub(a, b) => {
            amplifying_literals(a, precision, out);
            amplifying_literals(b, precision, out);
        }
        Expr::Mul(a, b) => {
            for side in [a.as_ref(), b.as_ref()] {
                if let Expr::Lit(text) = side {
                    let big = Decimal::parse(text, precision)
                        .and_then(|v| v.abs())
                        .is_ok_and(|v| v >= Decimal::from(AMPLIFICATION_FACTOR));
                    if big {
                        out.push(text.clone());
                    }
                }
            }
            amplifying_literals(a, precision, out);
            amplifying_literals(b, precision, out);
        }
    }
}

impl PatternVerifier {
    pub fn from_config(config: &PatternConfig) -> GuardResult<Self> {
        Ok(Self {
            magnitude_limit: Decimal::parse(&config.magnitude_limit, MAX_PRECISION)?,
            clean_confidence: config.clean_confidence,
            reject_score: config.reject_score,
        })
    }

    /// All exploit shapes present in `intent`.
    pub fn scan(&self, ctx: &VerificationContext, deadline: Instant) -> GuardResult<Vec<Finding>> {
        let intent = ctx.intent();
        let mut findings = Vec::new();

        let bounded: BTreeSet<&str> = intent
            .guard
            .iter()
            .filter(|p| p.op != Cmp::Ne)
            .flat_map(|p| p.variables())
            .collect();

        for predicate in intent.predicates() {
            ensure_live(ctx, deadline)?;

            for side in [&predicate.lhs, &predicate.rhs] {
                if has_variable_product(side) {
                    findings.push(Finding {
                        kind: PatternKind::UnboundedArithmetic,
                        detail: "product of two variable terms".to_string(),
                    });
                }
                let mut amplifiers = Vec::new();
                amplifying_literals(side, ctx.precision(), &mut amplifiers);
                for literal in amplifiers {
                    findings.push(Finding {
                        kind: PatternKind::MagnitudeJump,
                        detail: format!("multiplication by {literal}"),
                    });
                }
            }

            for literal in predicate.literals() {
                let huge = Decimal::parse(literal, ctx.precision())
                    .and_then(|v| v.abs())
                    .is_ok_and(|v| v >= self.magnitude_limit);
                if huge {
                    findings.push(Finding {
                        kind: PatternKind::MagnitudeJump,
                        detail: format!("literal {literal} at or above {}", self.magnitude_limit),
                    });
                }
            }

            let lhs_vars = predicate.lhs.variables();
            let rhs_vars = predicate.rhs.variables();
            for shared in lhs_vars.intersection(&rhs_vars) {
                if shared.ends_with('\'') {
                    findings.push(Finding {
                        kind: PatternKind::SelfReferentialMutation,
                        detail: format!("'{shared}' appears on both sides"),
                    });
                }
            }
        }

        for predicate in &intent.verify {
            let Some((account, expr)) = predicate.balance_assignment() else {
                continue;
            };
            for name in expr.variables() {
                let flags = intent.flags(name);
                if flags.external && !bounded.contains(name) {
                    findings.push(Finding {
                        kind: PatternKind::UnboundedArithmetic,
                        detail: format!("external '{name}' moves '{account}' without a guard bound"),
                    });
                }
                if flags.secret {
                    findings.push(Finding {
                        kind: PatternKind::SecretLeak,
                        detail: format!("secret '{name}' flows into '{account}'"),
                    });
                }
            }
        }

        Ok(findings)
    }

    fn check(&self, ctx: &VerificationContext, deadline: Instant) -> GuardResult<Verdict> {
        let id = VerifierId::Pattern;
        let findings = self.scan(ctx, deadline)?;
        if findings.is_empty() {
            return Ok(Verdict::approve(id, self.clean_confidence, "no known exploit shapes"));
        }
        let score: f64 = findings.iter().map(|f| f.kind.weight()).sum::<f64>().min(1.0);
        let summary = findings
            .iter()
            .map(|f| f.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        if score >= self.reject_score {
            Ok(Verdict::reject(id, score, format!("score {score:.2}: {summary}")))
        } else {
            Ok(Verdict::approve(
                id,
                self.clean_confidence - score,
                format!("score {score:.2}: {summary}"),
            ))
        }
    }
}

impl Verifier for PatternVerifier {
    fn id(&self) -> VerifierId {
        VerifierId::Pattern
    }

    fn verify(&self, ctx: &VerificationContext, timeout: Duration) -> Verdict {
        run_bounded(self.id(), timeout, |deadline| self.check(ctx, deadline))
    }
}

/// Whether `intent` carries any shape the pattern verifier looks for.
pub(crate) fn looks_anomalous(intent: &Intent, magnitude_limit: &Decimal, precision: u32) -> bool {
    if intent.variables.values().any(|f| f.external || f.secret) {
        return true;
    }
    intent.predicates().any(|p| {
        has_variable_product(&p.lhs)
            || has_variable_product(&p.rhs)
            || p.literals().iter().any(|lit| {
                Decimal::parse(lit, precision)
                    .and_then(|v| v.abs())
                    .is_ok_and(|v| v >= *magnitude_limit)
            })
            || p.lhs
                .variables()
                .intersection(&p.rhs.variables())
                .any(|v| v.ends_with('\''))
    })
}
