//! Context Feature Construction
//!
//! The critic scores a fixed 12-dimensional context. `ContextFeatureBuilder`
//! is the only way to assemble one from raw signals, and `ContextVector`
//! can only exist once validated (length 12, every component finite), so
//! decision-time scoring and outcome-time learning always see the same
//! feature order.
//!
//! | idx | feature                  | rule                                   |
//! |-----|--------------------------|----------------------------------------|
//! | 0   | fusion_confidence        | direct                                 |
//! | 1   | fusion_variance          | clamped to [0, 1]                      |
//! | 2   | cp_set_size_normalized   | min(setSize, 10) / 10                  |
//! | 3   | safety_critical          | 0 / 1 hazard flag                      |
//! | 4   | lighting_quality         | [0, 1]                                 |
//! | 5   | image_clarity            | [0, 1]                                 |
//! | 6   | property_age_normalized  | age / 100, clamped                     |
//! | 7   | num_damage_sites_norm    | min(count, 10) / 10                    |
//! | 8   | detector_disagreement    | sqrt(disagreementVariance)             |
//! | 9   | ood_score                | low conf + high var + no detections    |
//! | 10  | region_encoded           | xxh3(region) -> [0, 1]                 |
//! | 11  | property_age_bin_encoded | 0.1 / 0.3 / 0.6 / 0.9                  |

use serde::{Deserialize, Serialize};

use crate::error::FeatureError;
use crate::stratum::AgeBin;

pub const CONTEXT_DIM: usize = 12;

pub const FEATURE_NAMES: [&str; CONTEXT_DIM] = [
    "fusion_confidence",
    "fusion_variance",
    "cp_set_size_normalized",
    "safety_critical",
    "lighting_quality",
    "image_clarity",
    "property_age_normalized",
    "num_damage_sites_normalized",
    "detector_disagreement",
    "ood_score",
    "region_encoded",
    "property_age_bin_encoded",
];

/// Feature positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Feature {
    FusionConfidence = 0,
    FusionVariance = 1,
    CpSetSize = 2,
    SafetyCritical = 3,
    LightingQuality = 4,
    ImageClarity = 5,
    PropertyAge = 6,
    DamageSites = 7,
    DetectorDisagreement = 8,
    OodScore = 9,
    Region = 10,
    AgeBin = 11,
}

/// Validated, immutable context vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct ContextVector([f64; CONTEXT_DIM]);

impl ContextVector {
    /// Validate an already-assembled slice (e.g. restored from storage)
    pub fn from_slice(values: &[f64]) -> Result<Self, FeatureError> {
        if values.len() != CONTEXT_DIM {
            return Err(FeatureError::wrong_length(values.len()));
        }
        let mut out = [0.0; CONTEXT_DIM];
        for (i, &v) in values.iter().enumerate() {
            if !v.is_finite() {
                return Err(FeatureError::NonFinite {
                    index: i,
                    name: FEATURE_NAMES[i],
                    value: v,
                });
            }
            out[i] = v;
        }
        Ok(Self(out))
    }

    pub fn as_array(&self) -> &[f64; CONTEXT_DIM] {
        &self.0
    }

    pub fn get(&self, feature: Feature) -> f64 {
        self.0[feature as usize]
    }

    pub fn dot(&self, weights: &[f64; CONTEXT_DIM]) -> f64 {
        self.0.iter().zip(weights.iter()).map(|(x, w)| x * w).sum()
    }
}

impl TryFrom<Vec<f64>> for ContextVector {
    type Error = FeatureError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::from_slice(&values)
    }
}

impl From<ContextVector> for Vec<f64> {
    fn from(v: ContextVector) -> Self {
        v.0.to_vec()
    }
}

/// Raw signals feeding the context vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureInputs {
    pub fusion_confidence: f64,
    pub fusion_variance: f64,
    pub disagreement_variance: f64,
    pub cp_set_size: usize,
    pub safety_critical: bool,
    pub lighting_quality: f64,
    pub image_clarity: f64,
    pub property_age_years: f64,
    pub num_damage_sites: usize,
    /// Bounding boxes reported across all detectors
    pub detection_count: usize,
    pub region: String,
}

pub struct ContextFeatureBuilder;

impl ContextFeatureBuilder {
    pub fn build(inputs: &FeatureInputs) -> Result<ContextVector, FeatureError> {
        let age_bin = AgeBin::from_age(inputs.property_age_years);

        let values = [
            inputs.fusion_confidence,
            clamp_unit(inputs.fusion_variance),
            inputs.cp_set_size.min(10) as f64 / 10.0,
            if inputs.safety_critical { 1.0 } else { 0.0 },
            clamp_unit(inputs.lighting_quality),
            clamp_unit(inputs.image_clarity),
            clamp_unit(inputs.property_age_years / 100.0),
            inputs.num_damage_sites.min(10) as f64 / 10.0,
            clamp_unit(inputs.disagreement_variance).sqrt(),
            Self::ood_score(
                inputs.fusion_confidence,
                inputs.fusion_variance,
                inputs.detection_count,
            ),
            Self::region_encoding(&inputs.region),
            age_bin.encoded(),
        ];

        ContextVector::from_slice(&values)
    }

    /// Low confidence, high variance and an empty detection list all push
    /// the score up
    pub fn ood_score(confidence: f64, variance: f64, detection_count: usize) -> f64 {
        let low_confidence = 1.0 - clamp_unit(confidence);
        let high_variance = clamp_unit(variance * 4.0);
        let no_detections = if detection_count == 0 { 1.0 } else { 0.0 };
        clamp_unit(0.4 * low_confidence + 0.4 * high_variance + 0.2 * no_detections)
    }

    /// Deterministic across processes and platforms
    pub fn region_encoding(region: &str) -> f64 {
        let normalized = region.trim().to_lowercase();
        let hash = xxhash_rust::xxh3::xxh3_64(normalized.as_bytes());
        hash as f64 / u64::MAX as f64
    }
}

/// NaN passes through so validation can reject it
fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { v } else { v.clamp(0.0, 1.0) }
}
