//! Forensic event sink.
//!
//! The core emits one JSON event per verification. Sinks only need to accept
//! a `serde_json::Value`; what they do with it is up to them.

use crate::error::{GuardError, GuardResult};
use crate::gating::IntentFeatures;
use crate::types::{ConsensusResult, Decision, FinalDecision, VerifierId};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait EventSink: Send + Sync {
    fn accept(&self, event: serde_json::Value) -> GuardResult<()>;
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn accept(&self, _event: serde_json::Value) -> GuardResult<()> {
        Ok(())
    }
}

/// Appends one JSON document per line to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> GuardResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GuardError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonLinesSink {
    fn accept(&self, event: serde_json::Value) -> GuardResult<()> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = self.file.lock()?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| GuardError::io(&self.path, e))
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<serde_json::Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn accept(&self, event: serde_json::Value) -> GuardResult<()> {
        self.events.lock()?.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifierRecord {
    pub verifier: VerifierId,
    pub decision: Decision,
    pub confidence: f64,
    pub latency_us: u64,
    pub diagnostic: String,
}

/// One record per call to `verify_transaction`.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationEvent {
    pub event: &'static str,
    pub timestamp_ms: u64,
    pub intent_id: String,
    pub intent_hash: String,
    pub final_decision: FinalDecision,
    pub activated: Vec<VerifierId>,
    pub verdicts: Vec<VerifierRecord>,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<IntentFeatures>,
    pub total_latency_us: u64,
}

impl VerificationEvent {
    pub fn from_result(result: &ConsensusResult, features: Option<IntentFeatures>, elapsed: Duration) -> Self {
        let verdicts = result
            .verdicts()
            .iter()
            .map(|v| VerifierRecord {
                verifier: v.verifier_id(),
                decision: v.decision(),
                confidence: v.confidence(),
                latency_us: v.latency().as_micros() as u64,
                diagnostic: v.diagnostic().to_string(),
            })
            .collect();
        Self {
            event: "verification",
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            intent_id: result.intent_id().to_string(),
            intent_hash: result.intent_hash().to_string(),
            final_decision: result.final_decision(),
            activated: result.activated().iter().copied().collect(),
            verdicts,
            rationale: result.rationale().to_string(),
            features,
            total_latency_us: elapsed.as_micros() as u64,
        }
    }

    pub fn to_value(&self) -> GuardResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
