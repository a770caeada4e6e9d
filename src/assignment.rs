//! Deterministic Experiment Assignment
//!
//! Keys are hashed with xxh3 into 10,000 buckets and read as a percentage in
//! [0, 100). The same `(experiment, key)` always lands in the same arm, in
//! every process. Rollout inclusion uses a separately salted hash so that
//! arm choice and rollout are independent.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// Arm used for keys outside the rollout or without an experiment
pub const CONTROL_ARM: &str = "control";

const BUCKETS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    pub name: String,
    pub allocation_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment_id: String,
    #[serde(default)]
    pub arms: Vec<Arm>,
    #[serde(default = "default_rollout")]
    pub rollout_percent: f64,
    #[serde(default)]
    pub shadow_mode: bool,
}

fn default_rollout() -> f64 {
    100.0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub arm_id: String,
    pub shadow: bool,
    pub in_rollout: bool,
}

/// Position of `input` in [0, 100) with 0.01 resolution
pub fn bucket_percent(input: &str) -> f64 {
    (xxh3_64(input.as_bytes()) % BUCKETS) as f64 / 100.0
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentAssignmentEngine {
    global_shadow: bool,
}

impl ExperimentAssignmentEngine {
    pub fn new(global_shadow: bool) -> Self {
        Self { global_shadow }
    }

    pub fn global_shadow(&self) -> bool {
        self.global_shadow
    }

    pub fn assign(&self, experiment: Option<&ExperimentConfig>, key: &str) -> Assignment {
        let Some(experiment) = experiment else {
            return Assignment {
                arm_id: CONTROL_ARM.to_string(),
                shadow: self.global_shadow,
                in_rollout: false,
            };
        };

        let shadow = experiment.shadow_mode || self.global_shadow;
        let rollout = bucket_percent(&format!("{}:rollout:{}", experiment.experiment_id, key));
        let in_rollout = rollout < experiment.rollout_percent.clamp(0.0, 100.0);

        let arm_id = if in_rollout {
            let bucket = bucket_percent(&format!("{}:{}", experiment.experiment_id, key));
            Self::pick_arm(&experiment.arms, bucket)
                .unwrap_or(CONTROL_ARM)
                .to_string()
        } else {
            CONTROL_ARM.to_string()
        };

        Assignment {
            arm_id,
            shadow,
            in_rollout,
        }
    }

    fn pick_arm(arms: &[Arm], bucket: f64) -> Option<&str> {
        let ratio = |arm: &Arm| {
            if arm.allocation_ratio.is_finite() {
                arm.allocation_ratio.max(0.0)
            } else {
                0.0
            }
        };
        let total: f64 = arms.iter().map(ratio).sum();
        if total <= 0.0 {
            return None;
        }

        let mut cumulative = 0.0;
        let mut last = None;
        for arm in arms.iter().filter(|a| ratio(a) > 0.0) {
            cumulative += ratio(arm) / total * 100.0;
            last = Some(arm.name.as_str());
            if bucket < cumulative {
                return last;
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn experiment(rollout: f64, shadow: bool) -> ExperimentConfig {
        ExperimentConfig {
            experiment_id: "gate-v2".to_string(),
            arms: vec![
                Arm {
                    name: "baseline".to_string(),
                    allocation_ratio: 0.5,
                },
                Arm {
                    name: "treatment".to_string(),
                    allocation_ratio: 0.5,
                },
            ],
            rollout_percent: rollout,
            shadow_mode: shadow,
        }
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let engine = ExperimentAssignmentEngine::new(false);
        let exp = experiment(100.0, false);
        let first = engine.assign(Some(&exp), "claim-123");
        for _ in 0..10 {
            assert_eq!(engine.assign(Some(&exp), "claim-123"), first);
        }
        // fresh engine, same answer
        assert_eq!(ExperimentAssignmentEngine::new(false).assign(Some(&exp), "claim-123"), first);
    }

    #[test]
    fn test_split_roughly_follows_ratios() {
        let engine = ExperimentAssignmentEngine::new(false);
        let exp = experiment(100.0, false);
        let treated = (0..4000)
            .filter(|i| engine.assign(Some(&exp), &format!("key-{i}")).arm_id == "treatment")
            .count();
        assert!((1700..=2300).contains(&treated), "treated = {treated}");
    }

    #[test]
    fn test_zero_rollout_is_control() {
        let engine = ExperimentAssignmentEngine::new(false);
        let exp = experiment(0.0, false);
        for i in 0..100 {
            let a = engine.assign(Some(&exp), &format!("key-{i}"));
            assert_eq!(a.arm_id, CONTROL_ARM);
            assert!(!a.in_rollout);
        }
    }

    #[test]
    fn test_shadow_override() {
        let exp = experiment(100.0, false);
        assert!(!ExperimentAssignmentEngine::new(false).assign(Some(&exp), "k").shadow);
        assert!(ExperimentAssignmentEngine::new(true).assign(Some(&exp), "k").shadow);
        assert!(ExperimentAssignmentEngine::new(false).assign(Some(&experiment(100.0, true)), "k").shadow);
    }

    #[test]
    fn test_missing_or_empty_experiment() {
        let engine = ExperimentAssignmentEngine::new(true);
        let none = engine.assign(None, "k");
        assert_eq!(none.arm_id, CONTROL_ARM);
        assert!(none.shadow);

        let mut empty = experiment(100.0, false);
        empty.arms.clear();
        assert_eq!(engine.assign(Some(&empty), "k").arm_id, CONTROL_ARM);
    }

    #[test]
    fn test_bucket_range() {
        for i in 0..1000 {
            let b = bucket_percent(&format!("x{i}"));
            assert!((0.0..100.0).contains(&b));
        }
    }
}
