//! Verifier contract and the closed expert pool.
//!
//! Every verifier is a pure function of a [`VerificationContext`] and a
//! timeout. Faults never cross [`run_bounded`]: errors, panics and overruns all
//! come back as an UNCERTAIN [`Verdict`].

use crate::config::GuardConfig;
use crate::conservation::ConservationVerifier;
use crate::error::{GuardError, GuardResult};
use crate::logic::LogicVerifier;
use crate::pattern::PatternVerifier;
use crate::types::{Balances, Decision, Intent, Verdict, VerifierId};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Read-only inputs shared by all verifiers for one intent.
#[derive(Debug, Clone)]
pub struct VerificationContext {
    intent: Arc<Intent>,
    balances: Arc<Balances>,
    precision: u32,
    cancel: CancellationToken,
}

impl VerificationContext {
    pub fn new(intent: Arc<Intent>, balances: Arc<Balances>, precision: u32) -> Self {
        Self {
            intent,
            balances,
            precision,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    /// Copy-on-write snapshot of account balances taken before verification.
    pub fn balances(&self) -> &Balances {
        &self.balances
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One specialised verifier.
pub trait Verifier: Send + Sync {
    fn id(&self) -> VerifierId;

    /// Produce a verdict within `timeout`. Must not panic or block past it.
    fn verify(&self, ctx: &VerificationContext, timeout: Duration) -> Verdict;
}

/// Run `check` as verifier `id`, converting every failure mode into UNCERTAIN.
///
/// `check` receives the absolute deadline it should honour. A result that
/// arrives after the deadline is discarded in favour of UNCERTAIN.
pub fn run_bounded<F>(id: VerifierId, timeout: Duration, check: F) -> Verdict
where
    F: FnOnce(Instant) -> GuardResult<Verdict>,
{
    let started = Instant::now();
    let deadline = started + timeout;
    let verdict = match catch_unwind(AssertUnwindSafe(|| check(deadline))) {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(e)) => Verdict::uncertain(id, format!("internal fault: {e}")),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Verdict::uncertain(id, format!("internal fault: panic: {message}"))
        }
    };
    let elapsed = started.elapsed();
    let verdict = if elapsed > timeout && verdict.decision() != Decision::Uncertain {
        Verdict::uncertain(
            id,
            format!("timed out after {}ms (limit {}ms)", elapsed.as_millis(), timeout.as_millis()),
        )
    } else {
        verdict
    };
    tracing::debug!(
        verifier = %id,
        decision = ?verdict.decision(),
        confidence = verdict.confidence(),
        elapsed_us = elapsed.as_micros() as u64,
        "verifier finished"
    );
    verdict.with_latency(elapsed)
}

/// Deadline or cancellation check for long-running loops.
pub(crate) fn ensure_live(ctx: &VerificationContext, deadline: Instant) -> GuardResult<()> {
    if ctx.is_cancelled() {
        return Err(GuardError::Interrupted {
            reason: "cancelled".to_string(),
        });
    }
    if Instant::now() >= deadline {
        return Err(GuardError::Interrupted {
            reason: "deadline exceeded".to_string(),
        });
    }
    Ok(())
}

/// Closed set of experts, dispatched by tag.
#[derive(Debug, Clone)]
pub enum Expert {
    Logic(LogicVerifier),
    Conservation(ConservationVerifier),
    Pattern(PatternVerifier),
}

impl Verifier for Expert {
    fn id(&self) -> VerifierId {
        match self {
            Self::Logic(v) => v.id(),
            Self::Conservation(v) => v.id(),
            Self::Pattern(v) => v.id(),
        }
    }

    fn verify(&self, ctx: &VerificationContext, timeout: Duration) -> Verdict {
        match self {
            Self::Logic(v) => v.verify(ctx, timeout),
            Self::Conservation(v) => v.verify(ctx, timeout),
            Self::Pattern(v) => v.verify(ctx, timeout),
        }
    }
}

/// All configured experts, keyed by id.
#[derive(Debug, Clone)]
pub struct ExpertPool {
    experts: BTreeMap<VerifierId, Arc<Expert>>,
}

impl ExpertPool {
    pub fn from_config(config: &GuardConfig) -> GuardResult<Self> {
        let mut experts = BTreeMap::new();
        experts.insert(
            VerifierId::Logic,
            Arc::new(Expert::Logic(LogicVerifier::new())),
        );
        experts.insert(
            VerifierId::Conservation,
            Arc::new(Expert::Conservation(ConservationVerifier::new())),
        );
        experts.insert(
            VerifierId::Pattern,
            Arc::new(Expert::Pattern(PatternVerifier::from_config(&config.pattern)?)),
        );
        Ok(Self { experts })
    }

    pub fn get(&self, id: VerifierId) -> Option<Arc<Expert>> {
        self.experts.get(&id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = VerifierId> + '_ {
        self.experts.keys().copied()
    }
}
