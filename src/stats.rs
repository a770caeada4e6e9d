//! Statistical Primitives
//!
//! Closed-form and numerically-solved building blocks shared by the
//! conformal engine, the seed-safe-set validator and the coverage monitor:
//! - Lanczos log-gamma and the regularized incomplete beta function
//! - Beta quantiles by bisection
//! - Normal quantiles (Acklam's rational approximation)
//! - Wilson score and exact (Clopper-Pearson) binomial bounds
//! - Weighted empirical quantiles

use serde::{Deserialize, Serialize};

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEF: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// Natural log of the gamma function for x > 0
pub fn ln_gamma(x: f64) -> f64 {
    if x < 0.5 {
        // Reflection formula
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let mut acc = LANCZOS_COEF[0];
    for (i, &c) in LANCZOS_COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }
    let t = x + LANCZOS_G + 0.5;
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

/// Continued fraction for the incomplete beta (modified Lentz)
fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 3e-14;
    const FPMIN: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < FPMIN {
        d = FPMIN;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < FPMIN {
            d = FPMIN;
        }
        c = 1.0 + aa / c;
        if c.abs() < FPMIN {
            c = FPMIN;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPS {
            break;
        }
    }

    h
}

/// Regularized incomplete beta function I_x(a, b), the CDF of Beta(a, b) at x
pub fn regularized_incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

/// Quantile of Beta(a, b): smallest x with I_x(a, b) >= p
pub fn beta_quantile(p: f64, a: f64, b: f64) -> f64 {
    let p = p.clamp(0.0, 1.0);
    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if regularized_incomplete_beta(a, b, mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-15 {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Inverse of the standard normal CDF
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.024_25;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    }
}

/// Two-sided critical value for a confidence level (0.95 -> 1.96)
pub fn z_for_confidence(confidence: f64) -> f64 {
    let confidence = if confidence.is_finite() {
        confidence.clamp(0.5, 0.999_999)
    } else {
        0.95
    };
    normal_quantile(1.0 - (1.0 - confidence) / 2.0)
}

/// Wilson score interval `(lower, upper)` for a binomial proportion
pub fn wilson_interval(successes: u64, trials: u64, confidence: f64) -> (f64, f64) {
    if trials == 0 {
        return (0.0, 1.0);
    }
    let n = trials as f64;
    let p_hat = successes.min(trials) as f64 / n;
    let z = z_for_confidence(confidence);
    let z2 = z * z;

    let denom = 1.0 + z2 / n;
    let center = (p_hat + z2 / (2.0 * n)) / denom;
    let radius = z * ((p_hat * (1.0 - p_hat) / n) + z2 / (4.0 * n * n)).sqrt() / denom;

    ((center - radius).clamp(0.0, 1.0), (center + radius).clamp(0.0, 1.0))
}

/// Clopper-Pearson upper limit on a failure rate
pub fn exact_upper_bound(failures: u64, trials: u64, confidence: f64) -> f64 {
    if trials == 0 || failures >= trials {
        return 1.0;
    }
    let tail = (1.0 - confidence.clamp(0.0, 1.0)) / 2.0;
    if failures == 0 {
        // Closed form of Beta(1, n) quantile
        return 1.0 - tail.powf(1.0 / trials as f64);
    }
    beta_quantile(
        1.0 - tail,
        failures as f64 + 1.0,
        (trials - failures) as f64,
    )
}

/// Construction used for an upper confidence bound on a rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateBound {
    /// Wilson score interval upper limit
    Wilson,
    /// Clopper-Pearson (exact) upper limit
    #[default]
    Exact,
}

impl RateBound {
    pub fn upper(self, failures: u64, trials: u64, confidence: f64) -> f64 {
        match self {
            Self::Wilson => wilson_interval(failures, trials, confidence).1,
            Self::Exact => exact_upper_bound(failures, trials, confidence),
        }
    }
}

/// Weighted empirical quantile: smallest score whose cumulative normalized
/// weight reaches `level`. Returns `None` for empty input or zero total weight.
pub fn weighted_quantile(points: &mut [(f64, f64)], level: f64) -> Option<f64> {
    let total: f64 = points
        .iter()
        .map(|&(_, w)| if w.is_finite() { w.max(0.0) } else { 0.0 })
        .sum();
    if points.is_empty() || total <= 0.0 {
        return None;
    }

    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let level = level.clamp(0.0, 1.0);
    let mut cumulative = 0.0;
    for &(score, weight) in points.iter() {
        let w = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
        cumulative += w / total;
        if cumulative + 1e-12 >= level {
            return Some(score);
        }
    }
    points.last().map(|&(score, _)| score)
}
