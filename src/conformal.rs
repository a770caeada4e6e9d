//! Mondrian Conformal Prediction with Small-Sample Correction
//!
//! Calibration is partitioned by stratum. For each request:
//!
//! - Walk leaf -> parent -> global and use the first level holding at least
//!   `min_calibration_samples` points.
//! - If none qualifies, take the broadest level with at least
//!   `min_ssbc_samples` points and shrink α with SSBC so the coverage
//!   guarantee still holds with probability 1-δ.
//! - Below that, report `CalibrationInsufficient`: maximal set, full interval.
//!
//! Nonconformity is `|c - y|`, so the threshold q̂ is a half-width around the
//! fused confidence. The set size is the number of 0.1-wide probability bins
//! the interval touches.
//!
//! Strata flagged by the coverage monitor skip their leaf level and use the
//! stricter `violation_ssbc_delta`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::ConformalConfig;
use crate::records::{CalibrationDataPoint, PredictionInterval};
use crate::stats::{regularized_incomplete_beta, weighted_quantile};
use crate::stratum::{Stratum, StratumLevel};

/// Number of probability bins used to express set size
pub const PROBABILITY_BINS: usize = 10;

/// Nonconformity of an observed label against a predicted confidence
pub fn nonconformity(confidence: f64, label: f64) -> f64 {
    (confidence - label).abs()
}

/// Small-sample beta correction.
///
/// Returns the largest α' <= α such that, over calibration draws of size n,
/// `P(coverage < 1 - α) <= δ`. Coverage of split conformal at level α' is
/// distributed `Beta((n+1)(1-α'), (n+1)α')`, so the miss rate `1 - coverage`
/// is `Beta((n+1)α', (n+1)(1-α'))` and the violation tail is
/// `1 - I_α((n+1)α', (n+1)(1-α'))`. The tail grows with α', so bisect.
pub fn ssbc_alpha(n: usize, alpha: f64, delta: f64) -> f64 {
    if n == 0 || !(alpha > 0.0 && alpha < 1.0) || !(delta > 0.0 && delta < 1.0) {
        return 0.0;
    }
    let m = (n + 1) as f64;
    let tail = |a: f64| 1.0 - regularized_incomplete_beta(m * a, m * (1.0 - a), alpha);

    if tail(alpha) <= delta {
        return alpha;
    }

    let mut lo = 1e-9;
    let mut hi = alpha;
    if tail(lo) > delta {
        return 0.0;
    }
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if tail(mid) > delta {
            hi = mid;
        } else {
            lo = mid;
        }
        if hi - lo < 1e-10 {
            break;
        }
    }
    lo
}

/// Number of `PROBABILITY_BINS` bins intersecting `[lower, upper]`
pub fn bins_touched(lower: f64, upper: f64) -> usize {
    let bins = PROBABILITY_BINS as f64;
    let last = PROBABILITY_BINS - 1;
    let first_bin = ((lower * bins + 1e-9).floor().max(0.0) as usize).min(last);
    let last_bin = (((upper * bins - 1e-9).ceil() - 1.0).max(0.0) as usize).min(last);
    last_bin.max(first_bin) - first_bin + 1
}

/// Result of one conformal query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConformalResult {
    pub prediction_set_size: usize,
    pub interval: PredictionInterval,
    /// Nonconformity threshold q̂
    pub threshold: f64,
    /// Stratum whose calibration data was used
    pub stratum_used: Option<Stratum>,
    pub level_used: Option<StratumLevel>,
    pub samples: usize,
    pub alpha: f64,
    /// α after SSBC; equals `alpha` when no correction applied
    pub effective_alpha: f64,
    pub ssbc_applied: bool,
    pub calibration_insufficient: bool,
}

impl ConformalResult {
    fn insufficient(alpha: f64, samples: usize) -> Self {
        Self {
            prediction_set_size: PROBABILITY_BINS,
            interval: PredictionInterval::full(),
            threshold: 1.0,
            stratum_used: None,
            level_used: None,
            samples,
            alpha,
            effective_alpha: 0.0,
            ssbc_applied: false,
            calibration_insufficient: true,
        }
    }

    pub fn interval_width(&self) -> f64 {
        self.interval.width()
    }
}

pub struct ConformalPredictionEngine {
    config: ConformalConfig,
    /// Strata keys with an open coverage violation
    flagged: RwLock<Arc<HashSet<String>>>,
}

impl ConformalPredictionEngine {
    pub fn new(config: ConformalConfig) -> Self {
        Self {
            config,
            flagged: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &ConformalConfig {
        &self.config
    }

    fn flagged_snapshot(&self) -> Arc<HashSet<String>> {
        match self.flagged.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the set of strata under coverage violation
    pub fn set_flagged_strata(&self, strata: impl IntoIterator<Item = Stratum>) {
        let next: HashSet<String> = strata.into_iter().map(|s| s.key()).collect();
        if !next.is_empty() {
            info!(count = next.len(), "Coverage violations active; tightening calibration");
        }
        let next = Arc::new(next);
        match self.flagged.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn is_flagged(&self, stratum: &Stratum) -> bool {
        self.flagged_snapshot().contains(&stratum.key())
    }

    /// Calibrated prediction for `point_score` (the fused confidence).
    ///
    /// `history` may hold points from any stratum; only those contained in
    /// the hierarchy of `stratum` are used.
    pub fn predict(
        &self,
        stratum: &Stratum,
        point_score: f64,
        target_coverage: f64,
        history: &[CalibrationDataPoint],
    ) -> ConformalResult {
        let alpha = (1.0 - target_coverage).clamp(1e-6, 1.0 - 1e-6);
        let flagged = self.flagged_snapshot();
        let stratum_flagged = stratum
            .hierarchy()
            .iter()
            .any(|s| flagged.contains(&s.key()));

        let levels = stratum.hierarchy();
        let mut pools: Vec<Vec<(f64, f64)>> = levels
            .iter()
            .map(|level| {
                history
                    .iter()
                    .filter(|p| level.contains(&p.stratum) && p.nonconformity_score.is_finite())
                    .map(|p| (p.nonconformity_score, p.weight))
                    .collect()
            })
            .collect();

        let start = if flagged.contains(&stratum.key()) { 1 } else { 0 };
        let delta = if stratum_flagged {
            self.config.violation_ssbc_delta
        } else {
            self.config.ssbc_delta
        };

        let chosen = (start..levels.len()).find(|&i| pools[i].len() >= self.config.min_calibration_samples);

        let (index, effective_alpha, ssbc_applied) = match chosen {
            // flagged strata keep the correction even with plenty of data
            Some(i) if stratum_flagged => (i, ssbc_alpha(pools[i].len(), alpha, delta), true),
            Some(i) => (i, alpha, false),
            None => {
                let broadest = levels.len() - 1;
                let n = pools[broadest].len();
                if n < self.config.min_ssbc_samples {
                    debug!(stratum = %stratum, available = n, "Calibration insufficient");
                    return ConformalResult::insufficient(alpha, n);
                }
                (broadest, ssbc_alpha(n, alpha, delta), true)
            }
        };

        let mut pool = std::mem::take(&mut pools[index]);
        let n = pool.len();
        let level = (1.0 - effective_alpha) * (1.0 + 1.0 / n as f64);
        let threshold = if level >= 1.0 || effective_alpha <= 0.0 {
            1.0
        } else {
            weighted_quantile(&mut pool, level).unwrap_or(1.0)
        };

        let c = point_score.clamp(0.0, 1.0);
        let interval = PredictionInterval {
            lower: (c - threshold).max(0.0),
            upper: (c + threshold).min(1.0),
        };

        ConformalResult {
            prediction_set_size: bins_touched(interval.lower, interval.upper),
            interval,
            threshold,
            stratum_used: Some(levels[index].clone()),
            level_used: Some(levels[index].level()),
            samples: n,
            alpha,
            effective_alpha,
            ssbc_applied,
            calibration_insufficient: false,
        }
    }
}
