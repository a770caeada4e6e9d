//! Seed Safe Set Validation
//!
//! A stratum may be unlocked for automation only when its validation history
//! shows both:
//!
//! - at least `seed_set_size` validations with zero safety false negatives
//! - an upper confidence bound on the false-negative rate at or below
//!   `max_sfn_upper_bound`
//!
//! Either condition alone keeps the stratum locked.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SafetyConfig;
use crate::records::HistoricalValidation;
use crate::stratum::Stratum;

/// Verdict plus the evidence behind it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedSafeStatus {
    pub stratum: Stratum,
    pub unlocked: bool,
    pub validations: u64,
    pub false_negatives: u64,
    /// Upper bound on the SFN rate at the configured confidence
    pub upper_bound: f64,
}

impl SeedSafeStatus {
    /// Status used when validation history could not be read
    pub fn locked(stratum: Stratum) -> Self {
        Self {
            stratum,
            unlocked: false,
            validations: 0,
            false_negatives: 0,
            upper_bound: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeedSafeSetValidator {
    config: SafetyConfig,
}

impl SeedSafeSetValidator {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    /// Evaluate from raw counts
    pub fn evaluate_counts(&self, stratum: &Stratum, validations: u64, false_negatives: u64) -> SeedSafeStatus {
        let upper_bound = self.config.sfn_bound.upper(
            false_negatives,
            validations,
            self.config.sfn_bound_confidence,
        );

        let enough_samples = validations >= self.config.seed_set_size && false_negatives == 0;
        let bound_ok = validations > 0 && upper_bound <= self.config.max_sfn_upper_bound;
        let unlocked = enough_samples && bound_ok;

        debug!(
            stratum = %stratum,
            validations,
            false_negatives,
            upper_bound,
            unlocked,
            "Seed safe set evaluated"
        );

        SeedSafeStatus {
            stratum: stratum.clone(),
            unlocked,
            validations,
            false_negatives,
            upper_bound,
        }
    }

    /// Evaluate from validation history; only records in `stratum` count
    pub fn evaluate(&self, stratum: &Stratum, history: &[HistoricalValidation]) -> SeedSafeStatus {
        let (validations, false_negatives) = history
            .iter()
            .filter(|v| stratum.contains(&v.stratum))
            .fold((0u64, 0u64), |(n, x), v| {
                (n + 1, x + u64::from(v.safety_false_negative))
            });
        self.evaluate_counts(stratum, validations, false_negatives)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::RateBound;
    use crate::stratum::AgeBin;
    use chrono::Utc;

    fn leaf() -> Stratum {
        Stratum::leaf("residential", AgeBin::New, "bristol")
    }

    fn history(n: usize, failures: usize) -> Vec<HistoricalValidation> {
        (0..n)
            .map(|i| HistoricalValidation {
                stratum: leaf(),
                context_hash: i as u64,
                safety_false_negative: i < failures,
                timestamp: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_unlocks_at_seed_size_with_no_failures() {
        let validator = SeedSafeSetValidator::new(SafetyConfig::default());
        let status = validator.evaluate(&leaf(), &history(1000, 0));
        assert!(status.unlocked);
        assert_eq!(status.validations, 1000);
        assert!((0.0035..=0.0037).contains(&status.upper_bound));
    }

    #[test]
    fn test_count_alone_is_not_enough() {
        let validator = SeedSafeSetValidator::new(SafetyConfig::default());
        // one failure in 5000 keeps the bound under 0.5% but breaks zero-SFN
        let status = validator.evaluate(&leaf(), &history(5000, 1));
        assert!(status.upper_bound <= 0.005);
        assert!(!status.unlocked);

        let status = validator.evaluate(&leaf(), &history(999, 0));
        assert!(!status.unlocked);
    }

    #[test]
    fn test_bound_alone_is_not_enough() {
        // a loose bound requirement cannot compensate for the sample count
        let config = SafetyConfig {
            max_sfn_upper_bound: 0.05,
            ..SafetyConfig::default()
        };
        let validator = SeedSafeSetValidator::new(config);
        let status = validator.evaluate_counts(&leaf(), 200, 0);
        assert!(status.upper_bound <= 0.05);
        assert!(!status.unlocked);

        // enough samples with a bound that is too tight to satisfy
        let config = SafetyConfig {
            max_sfn_upper_bound: 0.001,
            ..SafetyConfig::default()
        };
        let validator = SeedSafeSetValidator::new(config);
        let status = validator.evaluate_counts(&leaf(), 1000, 0);
        assert!(!status.unlocked);
    }

    #[test]
    fn test_wilson_bound_variant() {
        let config = SafetyConfig {
            sfn_bound: RateBound::Wilson,
            ..SafetyConfig::default()
        };
        let validator = SeedSafeSetValidator::new(config);
        let status = validator.evaluate_counts(&leaf(), 1000, 0);
        assert!(status.unlocked);
        assert!((status.upper_bound - 0.003827).abs() < 1e-4);
    }

    #[test]
    fn test_other_strata_ignored() {
        let validator = SeedSafeSetValidator::new(SafetyConfig::default());
        let other = Stratum::leaf("residential", AgeBin::New, "york");
        let status = validator.evaluate(&other, &history(1000, 0));
        assert_eq!(status.validations, 0);
        assert!(!status.unlocked);
        assert!(!SeedSafeStatus::locked(leaf()).unlocked);
    }
}
