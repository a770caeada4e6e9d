//! Correlation-Aware Detector Fusion
//!
//! Combines per-detector (confidence, variance) readings into one estimate:
//!
//! ```text
//! fusedConfidence = Σ wᵢ cᵢ
//! fusedVariance   = Σ wᵢ² σᵢ²                  (epistemic)
//!                 + Σ wᵢ (cᵢ - μ)²              (disagreement)
//!                 + Σ_{i≠j} wᵢ wⱼ ρᵢⱼ σᵢ σⱼ     (correlation penalty)
//! ```
//!
//! The penalty captures shared systematic error between detectors and is
//! always applied. Missing detectors are dropped and the remaining weights
//! renormalized; with no readings at all the result is maximal uncertainty.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::debug;

use crate::config::FusionConfig;
use crate::evidence::DetectorReading;

/// Output of fusion for one request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionStats {
    pub fused_confidence: f64,
    pub fused_variance: f64,
    pub disagreement_variance: f64,
    pub epistemic_variance: f64,
    pub correlation_penalty: f64,
    pub detectors_used: usize,
}

impl FusionStats {
    /// Result when no detector reported
    pub fn no_evidence() -> Self {
        Self {
            fused_confidence: 0.0,
            fused_variance: 1.0,
            disagreement_variance: 0.0,
            epistemic_variance: 0.0,
            correlation_penalty: 0.0,
            detectors_used: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Present {
    index: usize,
    weight: f64,
    confidence: f64,
    sigma: f64,
}

#[derive(Debug, Clone)]
pub struct DetectorFusionEngine {
    index: HashMap<String, usize>,
    weights: Vec<f64>,
    correlation: Vec<Vec<f64>>,
}

impl DetectorFusionEngine {
    /// Build from a validated fusion config
    pub fn new(config: &FusionConfig) -> Self {
        let index = config
            .detectors
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self {
            index,
            weights: config.weights.clone(),
            correlation: config.correlation.clone(),
        }
    }

    pub fn detectors(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    pub fn fuse(&self, readings: &[DetectorReading]) -> FusionStats {
        let mut present: SmallVec<[Present; 8]> = SmallVec::new();

        for reading in readings {
            let Some(&index) = self.index.get(&reading.detector_id) else {
                debug!(detector = %reading.detector_id, "Ignoring reading from unknown detector");
                continue;
            };
            if !reading.confidence.is_finite() || !reading.variance.is_finite() {
                continue;
            }
            if present.iter().any(|p| p.index == index) {
                continue;
            }
            present.push(Present {
                index,
                weight: self.weights[index],
                confidence: reading.confidence.clamp(0.0, 1.0),
                sigma: reading.variance.clamp(0.0, 1.0).sqrt(),
            });
        }

        let total_weight: f64 = present.iter().map(|p| p.weight).sum();
        if present.is_empty() || total_weight <= 0.0 {
            return FusionStats::no_evidence();
        }
        for p in present.iter_mut() {
            p.weight /= total_weight;
        }

        let fused_confidence: f64 = present.iter().map(|p| p.weight * p.confidence).sum();

        let epistemic_variance: f64 = present
            .iter()
            .map(|p| p.weight * p.weight * p.sigma * p.sigma)
            .sum();

        let disagreement_variance: f64 = present
            .iter()
            .map(|p| p.weight * (p.confidence - fused_confidence).powi(2))
            .sum();

        let mut correlation_penalty = 0.0;
        for a in &present {
            for b in &present {
                if a.index == b.index {
                    continue;
                }
                let rho = self.correlation[a.index][b.index];
                correlation_penalty += a.weight * b.weight * rho * a.sigma * b.sigma;
            }
        }

        let fused_variance =
            (epistemic_variance + disagreement_variance + correlation_penalty).clamp(0.0, 1.0);

        FusionStats {
            fused_confidence,
            fused_variance,
            disagreement_variance,
            epistemic_variance,
            correlation_penalty,
            detectors_used: present.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readings() -> Vec<DetectorReading> {
        vec![
            DetectorReading::new("sam3", 0.8, 0.02),
            DetectorReading::new("gpt4", 0.7, 0.03),
            DetectorReading::new("scene_graph", 0.75, 0.025),
        ]
    }

    fn identity(n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect()
    }

    #[test]
    fn test_weighted_mean() {
        let engine = DetectorFusionEngine::new(&FusionConfig::default());
        let stats = engine.fuse(&readings());
        assert!((stats.fused_confidence - 0.76).abs() < 1e-12);
        assert_eq!(stats.detectors_used, 3);
        assert!((stats.disagreement_variance - 0.0019).abs() < 1e-12);
        assert!((stats.epistemic_variance - 0.0087).abs() < 1e-12);
    }

    #[test]
    fn test_correlation_penalty_inflates_variance() {
        let engine = DetectorFusionEngine::new(&FusionConfig::default());
        let independent = DetectorFusionEngine::new(&FusionConfig {
            correlation: identity(3),
            ..FusionConfig::default()
        });

        let correlated = engine.fuse(&readings());
        let naive = independent.fuse(&readings());

        assert_eq!(naive.correlation_penalty, 0.0);
        let ratio = correlated.fused_variance / naive.fused_variance;
        assert!((1.20..=1.30).contains(&ratio), "inflation ratio = {ratio}");
    }

    #[test]
    fn test_missing_detector_renormalizes() {
        let engine = DetectorFusionEngine::new(&FusionConfig::default());
        let stats = engine.fuse(&[
            DetectorReading::new("sam3", 0.8, 0.02),
            DetectorReading::new("gpt4", 0.6, 0.02),
        ]);
        // weights 0.5 and 0.3 renormalize to 0.625 / 0.375
        assert!((stats.fused_confidence - 0.725).abs() < 1e-12);
        assert_eq!(stats.detectors_used, 2);
    }

    #[test]
    fn test_no_readings_is_maximal_uncertainty() {
        let engine = DetectorFusionEngine::new(&FusionConfig::default());
        let stats = engine.fuse(&[]);
        assert_eq!(stats.fused_confidence, 0.0);
        assert_eq!(stats.fused_variance, 1.0);

        let unknown = engine.fuse(&[DetectorReading::new("yolo-legacy", 0.9, 0.01)]);
        assert_eq!(unknown, FusionStats::no_evidence());
    }

    #[test]
    fn test_duplicate_and_invalid_readings_ignored() {
        let engine = DetectorFusionEngine::new(&FusionConfig::default());
        let stats = engine.fuse(&[
            DetectorReading::new("sam3", 0.8, 0.02),
            DetectorReading::new("sam3", 0.1, 0.02),
            DetectorReading::new("gpt4", f64::NAN, 0.02),
        ]);
        assert_eq!(stats.detectors_used, 1);
        assert!((stats.fused_confidence - 0.8).abs() < 1e-12);
    }
}
