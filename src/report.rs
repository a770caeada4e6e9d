//! Metrics Surface
//!
//! Aggregates over a lookback window: automation rate, safety false
//! negative rate with a Wilson interval, and per-stratum coverage.

use serde::{Deserialize, Serialize};

use crate::records::{Action, CoverageCheckpoint, Decision, Outcome};
use crate::stats::wilson_interval;

const SFN_CONFIDENCE: f64 = 0.95;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub lookback_hours: i64,
    pub decisions: u64,
    /// Decisions whose action was AUTOMATE, shadow included
    pub automated: u64,
    pub shadow_decisions: u64,
    pub automation_rate: f64,
    pub outcomes: u64,
    pub sfn_count: u64,
    pub sfn_rate: f64,
    /// 95% Wilson interval on the SFN rate
    pub sfn_rate_interval: (f64, f64),
    pub strata: Vec<CoverageCheckpoint>,
}

pub fn summarize(
    lookback_hours: i64,
    decisions: &[Decision],
    resolved: &[(Decision, Outcome)],
    strata: Vec<CoverageCheckpoint>,
) -> MetricsSummary {
    let total = decisions.len() as u64;
    let automated = decisions.iter().filter(|d| d.action == Action::Automate).count() as u64;
    let shadow_decisions = decisions.iter().filter(|d| d.shadow).count() as u64;

    let outcomes = resolved.len() as u64;
    let sfn_count = resolved.iter().filter(|(_, o)| o.safety_false_negative).count() as u64;

    MetricsSummary {
        lookback_hours,
        decisions: total,
        automated,
        shadow_decisions,
        automation_rate: if total == 0 { 0.0 } else { automated as f64 / total as f64 },
        outcomes,
        sfn_count,
        sfn_rate: if outcomes == 0 { 0.0 } else { sfn_count as f64 / outcomes as f64 },
        sfn_rate_interval: wilson_interval(sfn_count, outcomes, SFN_CONFIDENCE),
        strata,
    }
}
