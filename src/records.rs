//! Decision and Ground-Truth Records
//!
//! Everything the engine persists: calibration points, historical
//! validations, decisions, outcomes and coverage checkpoints. All records
//! are append-only; none is mutated after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextVector;
use crate::fusion::FusionStats;
use crate::stratum::Stratum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Automate,
    Escalate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automate => "AUTOMATE",
            Self::Escalate => "ESCALATE",
        }
    }
}

/// Why a decision was forced to ESCALATE outside the normal gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// Stratum has not passed the seed-safe-set check
    StratumLocked,
    /// safetyUCB above the hard threshold
    SafetyBoundExceeded,
    /// A detector timed out or failed
    EvidenceUnavailable,
    /// No stratum had enough calibration data
    CalibrationInsufficient,
    /// Context vector failed validation
    FeatureValidationFailed,
    /// A persistence read failed or timed out
    StoreReadFailed,
}

/// One calibration observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationDataPoint {
    pub stratum: Stratum,
    pub nonconformity_score: f64,
    /// Importance weight for covariate shift
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

/// Ground-truth validation used by the seed-safe-set check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalValidation {
    pub stratum: Stratum,
    pub context_hash: u64,
    pub safety_false_negative: bool,
    pub timestamp: DateTime<Utc>,
}

/// Calibrated uncertainty attached to a decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionInterval {
    pub lower: f64,
    pub upper: f64,
}

impl PredictionInterval {
    pub fn full() -> Self {
        Self {
            lower: 0.0,
            upper: 1.0,
        }
    }

    pub fn width(&self) -> f64 {
        (self.upper - self.lower).max(0.0)
    }

    pub fn contains(&self, y: f64) -> bool {
        y >= self.lower - 1e-12 && y <= self.upper + 1e-12
    }
}

/// Immutable record of one automate/escalate decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub assessment_id: String,
    pub stratum: Stratum,
    /// `None` when feature validation failed
    pub context_vector: Option<ContextVector>,
    pub fusion_stats: FusionStats,
    pub cp_set_size: usize,
    pub interval: PredictionInterval,
    pub reward_ucb: f64,
    pub safety_ucb: f64,
    pub action: Action,
    pub arm_id: String,
    pub shadow: bool,
    pub unlocked: bool,
    pub critic_version: u64,
    #[serde(default)]
    pub escalation_reasons: Vec<EscalationReason>,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    /// Whether the caller may execute the automated path
    pub fn is_actionable_automation(&self) -> bool {
        self.action == Action::Automate && !self.shadow
    }
}

/// Ground truth resolved for a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub decision_id: Uuid,
    pub safety_false_negative: bool,
    pub realized_reward: f64,
    /// Whether damage was confirmed; enables calibration and coverage
    #[serde(default)]
    pub damage_confirmed: Option<bool>,
    /// Importance weight for the resulting calibration point
    #[serde(default = "default_weight")]
    pub calibration_weight: f64,
    pub validated_at: DateTime<Utc>,
}

fn default_weight() -> f64 {
    1.0
}

/// Periodic coverage measurement for one stratum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageCheckpoint {
    pub stratum: Stratum,
    pub target_coverage: f64,
    pub observed_coverage: f64,
    pub wilson_lower_bound: f64,
    pub samples: usize,
    pub violation: bool,
    pub timestamp: DateTime<Utc>,
}
