//! Orchestrator: the public face of the kernel.
//!
//! Built once at startup by [`Orchestrator::recover_from_crash`]; all
//! components hang off one shared context, nothing is global.

use crate::commit::{AtomicCommitLayer, CommitOutcome, RecoveryReport};
use crate::config::GuardConfig;
use crate::conservation::{check_conservation, derive_delta};
use crate::engine::{ConsensusConfig, ConsensusEngine};
use crate::error::GuardResult;
use crate::events::{EventSink, JsonLinesSink, NullSink, VerificationEvent};
use crate::gating::{GatingNetwork, IntentFeatures};
use crate::types::{ConsensusResult, Intent, Verdict, VerifierId};
use crate::verifier::{ExpertPool, VerificationContext, Verifier};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Slack on top of a verifier's own timeout before the join gives up on it.
const JOIN_GRACE: Duration = Duration::from_millis(50);

struct GuardContext {
    config: GuardConfig,
    pool: ExpertPool,
    gating: GatingNetwork,
    consensus: ConsensusEngine,
    ledger: AtomicCommitLayer,
    sink: Arc<dyn EventSink>,
    workers: Arc<Semaphore>,
}

/// Verification and commit entry point. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<GuardContext>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("data_dir", &self.ctx.config.data_dir)
            .field("workers", &self.ctx.config.worker_count())
            .finish_non_exhaustive()
    }
}

/// Event sink named by `config.event_log`, or one that drops everything.
pub fn sink_from_config(config: &GuardConfig) -> GuardResult<Arc<dyn EventSink>> {
    Ok(match &config.event_log {
        Some(path) => Arc::new(JsonLinesSink::open(path)?),
        None => Arc::new(NullSink),
    })
}

impl Orchestrator {
    /// Verify the ledger under `config.data_dir`, resolve interrupted
    /// transactions and build the orchestrator. Fatal ledger conditions are
    /// returned as errors; no orchestrator exists without a verified ledger.
    pub fn recover_from_crash(
        config: GuardConfig,
        sink: Arc<dyn EventSink>,
    ) -> GuardResult<(Self, RecoveryReport)> {
        config.validate()?;
        let (ledger, report) =
            AtomicCommitLayer::recover(&config.data_dir, config.wal_compaction_threshold)?;
        let pool = ExpertPool::from_config(&config)?;
        let gating = GatingNetwork::from_config(&config)?;
        let consensus = ConsensusEngine::with_config(ConsensusConfig::from(&config));
        let workers = Arc::new(Semaphore::new(config.worker_count()));
        tracing::info!(
            data_dir = %config.data_dir.display(),
            workers = config.worker_count(),
            experts = pool.ids().count(),
            "orchestrator ready"
        );
        let ctx = GuardContext {
            config,
            pool,
            gating,
            consensus,
            ledger,
            sink,
            workers,
        };
        Ok((Self { ctx: Arc::new(ctx) }, report))
    }

    pub fn config(&self) -> &GuardConfig {
        &self.ctx.config
    }

    pub fn ledger(&self) -> &AtomicCommitLayer {
        &self.ctx.ledger
    }

    pub fn consensus(&self) -> &ConsensusEngine {
        &self.ctx.consensus
    }

    /// Run the activated verifiers for `intent` and aggregate their verdicts.
    ///
    /// Never fails: anything that prevents a trustworthy decision yields
    /// REJECTED with the reason in the rationale.
    pub async fn verify_transaction(&self, intent: &Intent) -> ConsensusResult {
        let started = Instant::now();
        let (mut result, features) = match intent.content_hash() {
            Ok(intent_hash) => {
                let (mut result, features) = self.decide(intent).await;
                result.intent_hash = intent_hash;
                (result, features)
            }
            Err(e) => (self.ctx.consensus.refuse(format!("intent cannot be hashed: {e}")), None),
        };
        result.intent_id = intent.id.clone();

        tracing::info!(
            intent = %result.intent_id,
            decision = ?result.final_decision,
            activated = result.activated.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "verification finished"
        );
        let event = VerificationEvent::from_result(&result, features, started.elapsed());
        if let Err(e) = event.to_value().and_then(|v| self.ctx.sink.accept(v)) {
            tracing::warn!(intent = %result.intent_id, error = %e, "event sink rejected verification event");
        }
        result
    }

    async fn decide(&self, intent: &Intent) -> (ConsensusResult, Option<IntentFeatures>) {
        let ctx = &self.ctx;
        if let Err(e) = intent.validate() {
            return (ctx.consensus.refuse(format!("invalid intent: {e}")), None);
        }
        let balances = match ctx.ledger.balances() {
            Ok(balances) => balances,
            Err(e) => return (ctx.consensus.refuse(format!("ledger unavailable: {e}")), None),
        };

        let features = ctx.gating.features(intent);
        let activated = ctx.gating.select(&features);
        tracing::debug!(intent = %intent.id, ?features, ?activated, "gating selected verifiers");

        let cancel = CancellationToken::new();
        let vctx = VerificationContext::new(
            Arc::new(intent.clone()),
            Arc::clone(&balances),
            ctx.config.decimal_precision,
        )
        .with_cancellation(cancel.clone());

        let verdicts = self.run_verifiers(&activated, vctx, &cancel).await;
        let result = ctx.consensus.aggregate(&activated, verdicts);
        if !result.is_approved() {
            return (result, Some(features));
        }

        let delta = derive_delta(intent, &balances, ctx.config.decimal_precision)
            .and_then(|delta| check_conservation(&delta).map(|()| delta));
        let result = match delta {
            Ok(delta) => ConsensusResult {
                delta: Some(delta),
                ..result
            },
            Err(e) => result.downgrade(format!("no committable delta: {e}")),
        };
        (result, Some(features))
    }

    async fn run_verifiers(
        &self,
        activated: &BTreeSet<VerifierId>,
        vctx: VerificationContext,
        cancel: &CancellationToken,
    ) -> Vec<Verdict> {
        let mut set = JoinSet::new();
        for &id in activated {
            let Some(expert) = self.ctx.pool.get(id) else {
                continue;
            };
            let timeout = self.ctx.config.timeout_for(id);
            let vctx = vctx.clone();
            let workers = Arc::clone(&self.ctx.workers);
            set.spawn(async move {
                let permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Verdict::uncertain(id, "worker pool closed"),
                };
                let task = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    expert.verify(&vctx, timeout)
                });
                match tokio::time::timeout(timeout + JOIN_GRACE, task).await {
                    Ok(Ok(verdict)) => verdict,
                    Ok(Err(e)) => Verdict::uncertain(id, format!("internal fault: verifier task failed: {e}")),
                    Err(_) => Verdict::uncertain(
                        id,
                        format!("timed out after {}ms", timeout.as_millis()),
                    ),
                }
            });
        }

        let mut verdicts: Vec<Verdict> = Vec::with_capacity(activated.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(verdict) => {
                    let short_circuit = self.ctx.consensus.is_short_circuit(&verdict);
                    verdicts.push(verdict);
                    if short_circuit && !cancel.is_cancelled() {
                        tracing::debug!("short-circuit REJECT, cancelling remaining verifiers");
                        cancel.cancel();
                        set.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => tracing::warn!(error = %e, "verifier task panicked"),
            }
        }

        for &id in activated {
            if verdicts.iter().all(|v| v.verifier_id() != id) {
                let reason = if cancel.is_cancelled() {
                    "cancelled after short-circuit rejection"
                } else {
                    "no verdict returned"
                };
                verdicts.push(Verdict::uncertain(id, reason));
            }
        }
        verdicts
    }

    /// Durably apply an approved result as transaction `tx_id`.
    pub fn commit(&self, tx_id: &str, result: &ConsensusResult) -> GuardResult<CommitOutcome> {
        self.ctx.ledger.commit(tx_id, result)
    }
}
