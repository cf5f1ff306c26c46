//! Decision procedure for conjunctions of linear constraints over the reals.
//!
//! Equalities are eliminated by substitution, inequalities by Fourier-Motzkin,
//! and disequalities by enumerating `<`/`>` branches. All arithmetic is exact
//! over `i128` rationals. Overflow, non-linear terms, constraint blow-up,
//! deadline expiry and cancellation all surface as [`SolverOutcome::Unknown`];
//! only a completed elimination with no contradiction yields
//! [`SolverOutcome::Sat`], and [`SatProof`] cannot be built anywhere else.

use crate::decimal::Decimal;
use crate::types::{Cmp, Expr, Predicate};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Exact fraction with a positive, reduced denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Rational {
    num: i128,
    den: i128,
}

fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    // gcd of two i128 magnitudes only exceeds i128::MAX for (MIN, MIN) or (MIN, 0).
    i128::try_from(a).unwrap_or(1)
}

impl Rational {
    pub const ZERO: Rational = Rational { num: 0, den: 1 };
    pub const ONE: Rational = Rational { num: 1, den: 1 };
    pub const MINUS_ONE: Rational = Rational { num: -1, den: 1 };

    pub fn new(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let (mut num, mut den) = if den < 0 {
            (num.checked_neg()?, den.checked_neg()?)
        } else {
            (num, den)
        };
        let g = gcd(num, den);
        if g > 1 {
            num /= g;
            den /= g;
        }
        Some(Self { num, den })
    }

    pub fn from_decimal(value: &Decimal) -> Option<Self> {
        let den = 10i128.checked_pow(value.scale())?;
        Self::new(value.mantissa(), den)
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    pub fn signum(&self) -> i128 {
        self.num.signum()
    }

    pub fn checked_add(&self, other: &Self) -> Option<Self> {
        let g = gcd(self.den, other.den);
        let lhs = self.num.checked_mul(other.den / g)?;
        let rhs = other.num.checked_mul(self.den / g)?;
        let den = (self.den / g).checked_mul(other.den)?;
        Self::new(lhs.checked_add(rhs)?, den)
    }

    pub fn checked_mul(&self, other: &Self) -> Option<Self> {
        let g1 = gcd(self.num, other.den).max(1);
        let g2 = gcd(other.num, self.den).max(1);
        let num = (self.num / g1).checked_mul(other.num / g2)?;
        let den = (self.den / g2).checked_mul(other.den / g1)?;
        Self::new(num, den)
    }

    pub fn checked_neg(&self) -> Option<Self> {
        Some(Self {
            num: self.num.checked_neg()?,
            den: self.den,
        })
    }

    pub fn checked_recip(&self) -> Option<Self> {
        Self::new(self.den, self.num)
    }

    pub fn abs(&self) -> Option<Self> {
        if self.num < 0 {
            self.checked_neg()
        } else {
            Some(*self)
        }
    }

    pub fn cmp_zero(&self) -> Ordering {
        self.num.cmp(&0)
    }
}

/// `sum(coeffs[v] * v) + constant`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Linear {
    coeffs: BTreeMap<String, Rational>,
    constant: Rational,
}

impl Default for Rational {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Linear {
    pub fn constant(value: Rational) -> Self {
        Self {
            coeffs: BTreeMap::new(),
            constant: value,
        }
    }

    pub fn variable(name: &str) -> Self {
        let mut coeffs = BTreeMap::new();
        coeffs.insert(name.to_string(), Rational::ONE);
        Self {
            coeffs,
            constant: Rational::ZERO,
        }
    }

    fn is_constant(&self) -> bool {
        self.coeffs.is_empty()
    }

    fn coeff(&self, var: &str) -> Rational {
        self.coeffs.get(var).copied().unwrap_or(Rational::ZERO)
    }

    fn checked_add(&self, other: &Self) -> Option<Self> {
        let mut out = self.clone();
        for (var, c) in &other.coeffs {
            let sum = out.coeff(var).checked_add(c)?;
            if sum.is_zero() {
                out.coeffs.remove(var);
            } else {
                out.coeffs.insert(var.clone(), sum);
            }
        }
        out.constant = out.constant.checked_add(&other.constant)?;
        Some(out)
    }

    fn checked_scale(&self, k: &Rational) -> Option<Self> {
        if k.is_zero() {
            return Some(Self::default());
        }
        let mut coeffs = BTreeMap::new();
        for (var, c) in &self.coeffs {
            coeffs.insert(var.clone(), c.checked_mul(k)?);
        }
        Some(Self {
            coeffs,
            constant: self.constant.checked_mul(k)?,
        })
    }

    fn checked_sub(&self, other: &Self) -> Option<Self> {
        self.checked_add(&other.checked_scale(&Rational::MINUS_ONE)?)
    }

    /// Replace `var` with `replacement`.
    fn substitute(&self, var: &str, replacement: &Self) -> Option<Self> {
        let c = self.coeff(var);
        if c.is_zero() {
            return Some(self.clone());
        }
        let mut without = self.clone();
        without.coeffs.remove(var);
        without.checked_add(&replacement.checked_scale(&c)?)
    }

    /// Scale so the leading coefficient has magnitude one.
    fn normalized(&self) -> Option<Self> {
        match self.coeffs.values().next() {
            Some(lead) => self.checked_scale(&lead.abs()?.checked_recip()?),
            None => Some(self.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Relation {
    Eq,
    Ne,
    Le,
    Lt,
}

/// `linear relation 0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Constraint {
    linear: Linear,
    relation: Relation,
}

impl Constraint {
    pub fn new(linear: Linear, relation: Relation) -> Self {
        Self { linear, relation }
    }

    /// Pin `var` to an exact value.
    pub fn pin(var: &str, value: Rational) -> Option<Self> {
        let linear = Linear::variable(var).checked_sub(&Linear::constant(value))?;
        Some(Self::new(linear, Relation::Eq))
    }

    fn holds_trivially(&self) -> bool {
        let c = self.linear.constant.cmp_zero();
        match self.relation {
            Relation::Eq => c == Ordering::Equal,
            Relation::Ne => c != Ordering::Equal,
            Relation::Le => c != Ordering::Greater,
            Relation::Lt => c == Ordering::Less,
        }
    }
}

/// Why an expression could not be turned into a linear term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// A literal is not an exact decimal.
    Malformed(String),
    /// Product of two non-constant terms.
    NonLinear,
    Overflow,
}

pub fn translate_expr(expr: &Expr, precision: u32) -> Result<Linear, TranslateError> {
    match expr {
        Expr::Lit(text) => {
            let value =
                Decimal::parse(text, precision).map_err(|e| TranslateError::Malformed(e.to_string()))?;
            let r = Rational::from_decimal(&value).ok_or(TranslateError::Overflow)?;
            Ok(Linear::constant(r))
        }
        Expr::Var(name) => Ok(Linear::variable(name)),
        Expr::Neg(inner) => translate_expr(inner, precision)?
            .checked_scale(&Rational::MINUS_ONE)
            .ok_or(TranslateError::Overflow),
        Expr::Add(a, b) => translate_expr(a, precision)?
            .checked_add(&translate_expr(b, precision)?)
            .ok_or(TranslateError::Overflow),
        Expr::Sub(a, b) => translate_expr(a, precision)?
            .checked_sub(&translate_expr(b, precision)?)
            .ok_or(TranslateError::Overflow),
        Expr::Mul(a, b) => {
            let a = translate_expr(a, precision)?;
            let b = translate_expr(b, precision)?;
            let (k, term) = match (a.is_constant(), b.is_constant()) {
                (true, _) => (a.constant, b),
                (_, true) => (b.constant, a),
                _ => return Err(TranslateError::NonLinear),
            };
            term.checked_scale(&k).ok_or(TranslateError::Overflow)
        }
    }
}

pub fn translate_predicate(predicate: &Predicate, precision: u32) -> Result<Constraint, TranslateError> {
    let lhs = translate_expr(&predicate.lhs, precision)?;
    let rhs = translate_expr(&predicate.rhs, precision)?;
    let diff = lhs.checked_sub(&rhs).ok_or(TranslateError::Overflow)?;
    let flipped = || rhs.checked_sub(&lhs).ok_or(TranslateError::Overflow);
    Ok(match predicate.op {
        Cmp::Eq => Constraint::new(diff, Relation::Eq),
        Cmp::Ne => Constraint::new(diff, Relation::Ne),
        Cmp::Lt => Constraint::new(diff, Relation::Lt),
        Cmp::Le => Constraint::new(diff, Relation::Le),
        Cmp::Gt => Constraint::new(flipped()?, Relation::Lt),
        Cmp::Ge => Constraint::new(flipped()?, Relation::Le),
    })
}

/// Evidence that elimination finished without contradiction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatProof {
    variables: usize,
    branches: usize,
}

impl SatProof {
    pub fn variables(&self) -> usize {
        self.variables
    }

    pub fn branches(&self) -> usize {
        self.branches
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverOutcome {
    Sat(SatProof),
    Unsat { reason: String },
    Unknown { reason: String },
}

enum Step {
    Sat,
    Unsat(String),
    Unknown(String),
}

/// Bounded solver instance for one query.
#[derive(Debug, Clone)]
pub struct Solver {
    deadline: Instant,
    cancel: CancellationToken,
    max_constraints: usize,
    max_disequalities: usize,
}

impl Solver {
    pub const DEFAULT_MAX_CONSTRAINTS: usize = 4096;
    pub const DEFAULT_MAX_DISEQUALITIES: usize = 8;

    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self {
            deadline,
            cancel,
            max_constraints: Self::DEFAULT_MAX_CONSTRAINTS,
            max_disequalities: Self::DEFAULT_MAX_DISEQUALITIES,
        }
    }

    pub fn with_max_constraints(mut self, max_constraints: usize) -> Self {
        self.max_constraints = max_constraints;
        self
    }

    pub fn check(&self, constraints: Vec<Constraint>) -> SolverOutcome {
        let variables = {
            let mut vars = std::collections::BTreeSet::new();
            for c in &constraints {
                vars.extend(c.linear.coeffs.keys().cloned());
            }
            vars.len()
        };

        let (mut base, mut disequalities) = (Vec::new(), Vec::new());
        for c in constraints {
            if c.relation != Relation::Ne {
                base.push(c);
            } else if c.linear.is_constant() {
                if !c.holds_trivially() {
                    return SolverOutcome::Unsat {
                        reason: "constant disequality is false".to_string(),
                    };
                }
            } else {
                disequalities.push(c.linear);
            }
        }
        if disequalities.len() > self.max_disequalities {
            return SolverOutcome::Unknown {
                reason: format!(
                    "{} disequalities exceed case-split budget {}",
                    disequalities.len(),
                    self.max_disequalities
                ),
            };
        }

        let branches = 1usize << disequalities.len();
        let mut unknown: Option<String> = None;
        let mut last_unsat = String::from("no satisfying branch");
        for mask in 0..branches {
            let mut branch = base.clone();
            for (i, linear) in disequalities.iter().enumerate() {
                let side = if mask & (1 << i) == 0 {
                    Some(linear.clone())
                } else {
                    linear.checked_scale(&Rational::MINUS_ONE)
                };
                match side {
                    Some(l) => branch.push(Constraint::new(l, Relation::Lt)),
                    None => {
                        return SolverOutcome::Unknown {
                            reason: "overflow splitting disequality".to_string(),
                        }
                    }
                }
            }
            match self.check_conjunction(branch) {
                Step::Sat => {
                    return SolverOutcome::Sat(SatProof {
                        variables,
                        branches: mask + 1,
                    })
                }
                Step::Unsat(reason) => last_unsat = reason,
                Step::Unknown(reason) => {
                    // Cancellation and deadline end the whole query.
                    if self.expired() {
                        return SolverOutcome::Unknown { reason };
                    }
                    unknown.get_or_insert(reason);
                }
            }
        }
        match unknown {
            Some(reason) => SolverOutcome::Unknown { reason },
            None => SolverOutcome::Unsat { reason: last_unsat },
        }
    }

    fn expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    fn budget_check(&self) -> Option<Step> {
        if self.cancel.is_cancelled() {
            return Some(Step::Unknown("cancelled".to_string()));
        }
        if Instant::now() >= self.deadline {
            return Some(Step::Unknown("deadline exceeded".to_string()));
        }
        None
    }

    fn check_conjunction(&self, constraints: Vec<Constraint>) -> Step {
        let overflow = || Step::Unknown("rational overflow".to_string());
        let (mut equalities, mut inequalities): (Vec<_>, Vec<_>) = constraints
            .into_iter()
            .partition(|c| c.relation == Relation::Eq);

        while let Some(eq) = equalities.pop() {
            if let Some(stop) = self.budget_check() {
                return stop;
            }
            let Some((var, c)) = eq
                .linear
                .coeffs
                .iter()
                .next()
                .map(|(v, c)| (v.clone(), *c))
            else {
                if !eq.holds_trivially() {
                    return Step::Unsat("equalities are contradictory".to_string());
                }
                continue;
            };
            // var = -(rest) / c
            let mut rest = eq.linear.clone();
            rest.coeffs.remove(&var);
            let Some(factor) = c.checked_recip().and_then(|r| r.checked_neg()) else {
                return overflow();
            };
            let Some(replacement) = rest.checked_scale(&factor) else {
                return overflow();
            };
            for other in equalities.iter_mut().chain(inequalities.iter_mut()) {
                match other.linear.substitute(&var, &replacement) {
                    Some(l) => other.linear = l,
                    None => return overflow(),
                }
            }
        }

        loop {
            if let Some(stop) = self.budget_check() {
                return stop;
            }
            let mut live = Vec::with_capacity(inequalities.len());
            for c in inequalities {
                if c.linear.is_constant() {
                    if !c.holds_trivially() {
                        return Step::Unsat("inequalities are contradictory".to_string());
                    }
                } else {
                    match c.linear.normalized() {
                        Some(linear) => live.push(Constraint::new(linear, c.relation)),
                        None => return overflow(),
                    }
                }
            }
            live.sort();
            live.dedup();
            if live.is_empty() {
                return Step::Sat;
            }
            if live.len() > self.max_constraints {
                return Step::Unknown(format!(
                    "{} constraints exceed budget {}",
                    live.len(),
                    self.max_constraints
                ));
            }

            let Some(var) = pick_variable(&live) else {
                return Step::Sat;
            };
            let (mut upper, mut lower, mut next) = (Vec::new(), Vec::new(), Vec::new());
            for c in live {
                match c.linear.coeff(&var).cmp_zero() {
                    Ordering::Greater => upper.push(c),
                    Ordering::Less => lower.push(c),
                    Ordering::Equal => next.push(c),
                }
            }
            for up in &upper {
                for low in &lower {
                    let Some(up_k) = low.linear.coeff(&var).abs() else {
                        return overflow();
                    };
                    let low_k = up.linear.coeff(&var);
                    let combined = up
                        .linear
                        .checked_scale(&up_k)
                        .zip(low.linear.checked_scale(&low_k))
                        .and_then(|(a, b)| a.checked_add(&b));
                    let Some(mut linear) = combined else {
                        return overflow();
                    };
                    linear.coeffs.remove(&var);
                    let relation = if up.relation == Relation::Lt || low.relation == Relation::Lt {
                        Relation::Lt
                    } else {
                        Relation::Le
                    };
                    next.push(Constraint::new(linear, relation));
                }
            }
            inequalities = next;
        }
    }
}

/// Variable whose elimination produces the fewest new constraints.
fn pick_variable(constraints: &[Constraint]) -> Option<String> {
    let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for c in constraints {
        for (var, k) in &c.linear.coeffs {
            let entry = counts.entry(var.as_str()).or_default();
            if k.signum() > 0 {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }
    counts
        .into_iter()
        .min_by_key(|(_, (p, n))| p * n)
        .map(|(var, _)| var.to_string())
}
