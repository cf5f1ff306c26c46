//! Runtime configuration.
//!
//! Values come from an optional TOML file, then `INTENTGUARD_*` environment
//! overrides, then [`GuardConfig::validate`]. Every default here is a tuning
//! choice, not a correctness requirement.

use crate::decimal::{DEFAULT_PRECISION, MAX_PRECISION};
use crate::error::{GuardError, GuardResult};
use crate::types::VerifierId;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "INTENTGUARD_";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GuardConfig {
    pub logic_timeout_ms: u64,
    pub conservation_timeout_ms: u64,
    pub pattern_timeout_ms: u64,
    /// Minimum confidence for an APPROVE to count towards approval.
    pub approval_threshold: f64,
    /// Minimum confidence for a REJECT to short-circuit consensus.
    pub rejection_threshold: f64,
    /// Directory holding the WAL and the canonical state file.
    pub data_dir: PathBuf,
    /// Significant digits accepted when parsing monetary literals.
    pub decimal_precision: u32,
    /// Concurrent verifier slots; 0 means one per available core.
    pub max_workers: usize,
    /// Terminal WAL records tolerated before the log is compacted.
    pub wal_compaction_threshold: usize,
    /// Optional JSON-lines file receiving one forensic event per verification.
    pub event_log: Option<PathBuf>,
    pub pattern: PatternConfig,
}

/// Tuning for the pattern verifier and the gating network.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PatternConfig {
    /// Literals at or above this magnitude are suspicious.
    pub magnitude_limit: String,
    /// Expression node count above which an intent counts as complex.
    pub complexity_threshold: usize,
    /// Confidence reported when no exploit shape is found.
    pub clean_confidence: f64,
    /// Finding score at which the verdict flips from APPROVE to REJECT.
    pub reject_score: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            magnitude_limit: "1000000000000".to_string(),
            complexity_threshold: 48,
            clean_confidence: 0.9,
            reject_score: 0.5,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            logic_timeout_ms: 2_000,
            conservation_timeout_ms: 500,
            pattern_timeout_ms: 250,
            approval_threshold: 0.75,
            rejection_threshold: 0.9,
            data_dir: PathBuf::from("ledger"),
            decimal_precision: DEFAULT_PRECISION,
            max_workers: 0,
            wal_compaction_threshold: 50_000,
            event_log: None,
            pattern: PatternConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> GuardResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (if given), apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> GuardResult<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| GuardError::io(path, e))?;
                toml::from_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `INTENTGUARD_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> GuardResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("LOGIC_TIMEOUT_MS") {
            self.logic_timeout_ms = parse_env("LOGIC_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("CONSERVATION_TIMEOUT_MS") {
            self.conservation_timeout_ms = parse_env("CONSERVATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("PATTERN_TIMEOUT_MS") {
            self.pattern_timeout_ms = parse_env("PATTERN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("APPROVAL_THRESHOLD") {
            self.approval_threshold = parse_env("APPROVAL_THRESHOLD", &v)?;
        }
        if let Some(v) = get("REJECTION_THRESHOLD") {
            self.rejection_threshold = parse_env("REJECTION_THRESHOLD", &v)?;
        }
        if let Some(v) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DECIMAL_PRECISION") {
            self.decimal_precision = parse_env("DECIMAL_PRECISION", &v)?;
        }
        if let Some(v) = get("MAX_WORKERS") {
            self.max_workers = parse_env("MAX_WORKERS", &v)?;
        }
        if let Some(v) = get("WAL_COMPACTION_THRESHOLD") {
            self.wal_compaction_threshold = parse_env("WAL_COMPACTION_THRESHOLD", &v)?;
        }
        if let Some(v) = get("EVENT_LOG") {
            self.event_log = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> GuardResult<()> {
        for (field, value) in [
            ("approval_threshold", self.approval_threshold),
            ("rejection_threshold", self.rejection_threshold),
            ("pattern.clean_confidence", self.pattern.clean_confidence),
            ("pattern.reject_score", self.pattern.reject_score),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardError::Validation {
                    field: field.to_string(),
                    message: format!("must be within [0.0, 1.0], got {value}"),
                });
            }
        }
        if self.decimal_precision == 0 || self.decimal_precision > MAX_PRECISION {
            return Err(GuardError::Validation {
                field: "decimal_precision".to_string(),
                message: format!("must be within 1..={MAX_PRECISION}"),
            });
        }
        for id in VerifierId::ALL {
            if self.timeout_for(id).is_zero() {
                return Err(GuardError::Validation {
                    field: format!("{id}_timeout_ms"),
                    message: "timeout must be positive".to_string(),
                });
            }
        }
        if self.wal_compaction_threshold == 0 {
            return Err(GuardError::Validation {
                field: "wal_compaction_threshold".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(GuardError::Validation {
                field: "data_dir".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        crate::decimal::Decimal::parse(&self.pattern.magnitude_limit, MAX_PRECISION)?;
        Ok(())
    }

    /// Individual deadline of one verifier.
    pub fn timeout_for(&self, id: VerifierId) -> Duration {
        let ms = match id {
            VerifierId::Logic => self.logic_timeout_ms,
            VerifierId::Conservation => self.conservation_timeout_ms,
            VerifierId::Pattern => self.pattern_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Effective worker pool size.
    pub fn worker_count(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> GuardResult<T> {
    value.trim().parse().map_err(|_| GuardError::Config {
        message: format!("{ENV_PREFIX}{name}: cannot parse '{value}'"),
    })
}
