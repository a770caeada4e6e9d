//! Engine Configuration
//!
//! One validated configuration struct, built once at startup and passed down.
//! Core logic never reads the environment. The defaults in `SafetyConfig` and
//! `ConformalConfig` are part of the safety contract and are pinned by tests.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;
use crate::stats::RateBound;

/// Hard safety threshold on the safety UCB
pub const DEFAULT_DELTA_T: f64 = 0.001;
/// Nominal conformal coverage
pub const DEFAULT_TARGET_COVERAGE: f64 = 0.90;
/// Minimum calibration points for a stratum to be used without correction
pub const DEFAULT_MIN_CALIBRATION_SAMPLES: usize = 100;
/// Historical validations required before a stratum can unlock automation
pub const DEFAULT_SEED_SET_SIZE: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Automate only when safetyUCB <= delta_t
    pub delta_t: f64,
    /// Minimum historical validations for the seed safe set
    pub seed_set_size: u64,
    /// Maximum upper bound on the SFN rate for unlocking
    pub max_sfn_upper_bound: f64,
    /// Confidence level of the SFN rate bound
    pub sfn_bound_confidence: f64,
    /// Construction of the SFN rate bound
    pub sfn_bound: RateBound,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            delta_t: DEFAULT_DELTA_T,
            seed_set_size: DEFAULT_SEED_SET_SIZE,
            max_sfn_upper_bound: 0.005,
            sfn_bound_confidence: 0.95,
            sfn_bound: RateBound::Exact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConformalConfig {
    pub target_coverage: f64,
    pub min_calibration_samples: usize,
    /// Below this count even the broadest stratum is unusable
    pub min_ssbc_samples: usize,
    /// Probability that realized miscoverage exceeds the nominal level
    pub ssbc_delta: f64,
    /// Tighter SSBC delta used for strata with an open coverage violation
    pub violation_ssbc_delta: f64,
    /// Most recent calibration points read per decision
    pub calibration_window: usize,
}

impl Default for ConformalConfig {
    fn default() -> Self {
        Self {
            target_coverage: DEFAULT_TARGET_COVERAGE,
            min_calibration_samples: DEFAULT_MIN_CALIBRATION_SAMPLES,
            min_ssbc_samples: 20,
            ssbc_delta: 0.05,
            violation_ssbc_delta: 0.01,
            calibration_window: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Detector identities, in the order of `weights` and `correlation`
    pub detectors: Vec<String>,
    /// Fusion weights (sum to 1)
    pub weights: Vec<f64>,
    /// Correlation matrix over detector identities (unit diagonal)
    pub correlation: Vec<Vec<f64>>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            detectors: vec![
                "sam3".to_string(),
                "gpt4".to_string(),
                "scene_graph".to_string(),
            ],
            weights: vec![0.5, 0.3, 0.2],
            correlation: vec![
                vec![1.0, 0.2, 0.15],
                vec![0.2, 1.0, 0.2],
                vec![0.15, 0.2, 1.0],
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CriticConfig {
    /// Name under which the critic state is persisted
    pub agent_name: String,
    /// Ridge prior: A starts as lambda * I
    pub lambda: f64,
    /// Exploration coefficient for the reward UCB
    pub reward_beta: f64,
    /// Exploration coefficient for the safety UCB
    pub safety_beta: f64,
    /// Persist a checkpoint every N applied outcomes
    pub persist_every: u64,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            agent_name: "safe-lucb".to_string(),
            lambda: 1.0,
            reward_beta: 0.5,
            safety_beta: 0.02,
            persist_every: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    /// Most recent validated outcomes considered per stratum
    pub window_size: usize,
    /// Strata with fewer outcomes in the window are never flagged
    pub min_window_samples: usize,
    /// Violation when the Wilson lower bound falls this far below target
    pub violation_tolerance: f64,
    pub confidence: f64,
    pub interval_secs: u64,
    pub lookback_days: i64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            window_size: 500,
            min_window_samples: 30,
            violation_tolerance: 0.05,
            confidence: 0.95,
            interval_secs: 3600,
            lookback_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Global shadow-mode override
    pub shadow_mode: bool,
    pub evidence_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub outcome_queue_capacity: usize,
    pub write_queue_capacity: usize,
    pub write_max_retries: u32,
    pub write_retry_base_delay_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shadow_mode: false,
            evidence_timeout_ms: 2000,
            store_timeout_ms: 500,
            outcome_queue_capacity: 10_000,
            write_queue_capacity: 10_000,
            write_max_retries: 3,
            write_retry_base_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub safety: SafetyConfig,
    pub conformal: ConformalConfig,
    pub fusion: FusionConfig,
    pub critic: CriticConfig,
    pub coverage: CoverageConfig,
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.safety;
        if !(s.delta_t > 0.0 && s.delta_t < 1.0) {
            return Err(ConfigError::invalid("safety.delta_t", "must be in (0, 1)"));
        }
        if s.seed_set_size == 0 {
            return Err(ConfigError::invalid("safety.seed_set_size", "must be positive"));
        }
        if !(s.max_sfn_upper_bound > 0.0 && s.max_sfn_upper_bound < 1.0) {
            return Err(ConfigError::invalid(
                "safety.max_sfn_upper_bound",
                "must be in (0, 1)",
            ));
        }
        check_probability("safety.sfn_bound_confidence", s.sfn_bound_confidence)?;

        let c = &self.conformal;
        check_probability("conformal.target_coverage", c.target_coverage)?;
        check_probability("conformal.ssbc_delta", c.ssbc_delta)?;
        check_probability("conformal.violation_ssbc_delta", c.violation_ssbc_delta)?;
        if c.min_calibration_samples == 0 {
            return Err(ConfigError::invalid(
                "conformal.min_calibration_samples",
                "must be positive",
            ));
        }
        if c.min_ssbc_samples == 0 || c.min_ssbc_samples > c.min_calibration_samples {
            return Err(ConfigError::invalid(
                "conformal.min_ssbc_samples",
                "must be in 1..=min_calibration_samples",
            ));
        }
        if c.calibration_window < c.min_calibration_samples {
            return Err(ConfigError::invalid(
                "conformal.calibration_window",
                "must be at least min_calibration_samples",
            ));
        }

        self.validate_fusion()?;

        let k = &self.critic;
        if !(k.lambda > 0.0 && k.lambda.is_finite()) {
            return Err(ConfigError::invalid("critic.lambda", "must be positive"));
        }
        if !(k.reward_beta >= 0.0 && k.safety_beta > 0.0) {
            return Err(ConfigError::invalid(
                "critic.safety_beta",
                "exploration coefficients must be non-negative, safety_beta positive",
            ));
        }
        if k.agent_name.trim().is_empty() {
            return Err(ConfigError::invalid("critic.agent_name", "must not be empty"));
        }

        let v = &self.coverage;
        check_probability("coverage.confidence", v.confidence)?;
        if !(v.violation_tolerance >= 0.0 && v.violation_tolerance < 1.0) {
            return Err(ConfigError::invalid(
                "coverage.violation_tolerance",
                "must be in [0, 1)",
            ));
        }
        if v.window_size == 0 || v.interval_secs == 0 || v.lookback_days <= 0 {
            return Err(ConfigError::invalid(
                "coverage",
                "window_size, interval_secs and lookback_days must be positive",
            ));
        }

        let r = &self.runtime;
        if r.evidence_timeout_ms == 0 || r.store_timeout_ms == 0 {
            return Err(ConfigError::invalid("runtime", "timeouts must be positive"));
        }
        if r.outcome_queue_capacity == 0 || r.write_queue_capacity == 0 {
            return Err(ConfigError::invalid("runtime", "queue capacities must be positive"));
        }

        Ok(())
    }

    fn validate_fusion(&self) -> Result<(), ConfigError> {
        let f = &self.fusion;
        let n = f.detectors.len();
        if n == 0 {
            return Err(ConfigError::invalid("fusion.detectors", "at least one detector required"));
        }
        if f.weights.len() != n {
            return Err(ConfigError::invalid(
                "fusion.weights",
                format!("expected {n} weights, got {}", f.weights.len()),
            ));
        }
        if f.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConfigError::invalid("fusion.weights", "weights must be finite and >= 0"));
        }
        let sum: f64 = f.weights.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::invalid(
                "fusion.weights",
                format!("weights must sum to 1, got {sum}"),
            ));
        }
        if f.correlation.len() != n || f.correlation.iter().any(|row| row.len() != n) {
            return Err(ConfigError::invalid(
                "fusion.correlation",
                format!("must be a {n}x{n} matrix"),
            ));
        }
        for i in 0..n {
            if (f.correlation[i][i] - 1.0).abs() > 1e-9 {
                return Err(ConfigError::invalid("fusion.correlation", "diagonal must be 1"));
            }
            for j in 0..n {
                let rho = f.correlation[i][j];
                if !rho.is_finite() || !(-1.0..=1.0).contains(&rho) {
                    return Err(ConfigError::invalid(
                        "fusion.correlation",
                        "entries must be in [-1, 1]",
                    ));
                }
                if (rho - f.correlation[j][i]).abs() > 1e-9 {
                    return Err(ConfigError::invalid("fusion.correlation", "must be symmetric"));
                }
            }
        }
        Ok(())
    }
}

fn check_probability(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, "must be in (0, 1)"))
    }
}
