//! Rolling Coverage Monitor
//!
//! Periodic background job, never on the decision path. For each stratum it
//! takes the most recent validated outcomes (bounded by window and
//! lookback), checks whether the ground truth fell inside the decision's
//! prediction interval, and computes the Wilson lower bound of that
//! coverage. A stratum is in violation when it has enough samples and the
//! lower bound sits more than `violation_tolerance` below target.
//!
//! Each run appends `CoverageCheckpoint`s and replaces the conformal
//! engine's flagged set. It never touches the critic.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CoverageConfig;
use crate::conformal::ConformalPredictionEngine;
use crate::error::EngineError;
use crate::records::{CoverageCheckpoint, Decision, Outcome};
use crate::stats::wilson_interval;
use crate::store::{DecisionStore, with_timeout};
use crate::stratum::Stratum;

pub struct CoverageMonitor {
    config: CoverageConfig,
    target_coverage: f64,
    store_timeout: Duration,
    store: Arc<dyn DecisionStore>,
    conformal: Arc<ConformalPredictionEngine>,
}

impl CoverageMonitor {
    pub fn new(
        config: CoverageConfig,
        target_coverage: f64,
        store_timeout: Duration,
        store: Arc<dyn DecisionStore>,
        conformal: Arc<ConformalPredictionEngine>,
    ) -> Self {
        Self {
            config,
            target_coverage,
            store_timeout,
            store,
            conformal,
        }
    }

    /// Checkpoint for one stratum from raw counts
    pub fn assess(&self, stratum: &Stratum, covered: u64, samples: u64, now: DateTime<Utc>) -> CoverageCheckpoint {
        let observed_coverage = if samples == 0 {
            0.0
        } else {
            covered as f64 / samples as f64
        };
        let (wilson_lower_bound, _) = wilson_interval(covered, samples, self.config.confidence);
        let violation = samples as usize >= self.config.min_window_samples
            && wilson_lower_bound < self.target_coverage - self.config.violation_tolerance;

        CoverageCheckpoint {
            stratum: stratum.clone(),
            target_coverage: self.target_coverage,
            observed_coverage,
            wilson_lower_bound,
            samples: samples as usize,
            violation,
            timestamp: now,
        }
    }

    /// Group labelled outcomes by stratum and assess each rolling window
    pub fn evaluate(&self, resolved: &[(Decision, Outcome)], now: DateTime<Utc>) -> Vec<CoverageCheckpoint> {
        let mut by_stratum: BTreeMap<&Stratum, Vec<(&Decision, &Outcome)>> = BTreeMap::new();
        for (decision, outcome) in resolved {
            if outcome.damage_confirmed.is_some() {
                by_stratum
                    .entry(&decision.stratum)
                    .or_default()
                    .push((decision, outcome));
            }
        }

        by_stratum
            .into_iter()
            .map(|(stratum, mut items)| {
                items.sort_by(|a, b| b.1.validated_at.cmp(&a.1.validated_at));
                items.truncate(self.config.window_size);

                let covered = items
                    .iter()
                    .filter(|(d, o)| {
                        let y = if o.damage_confirmed == Some(true) { 1.0 } else { 0.0 };
                        d.interval.contains(y)
                    })
                    .count() as u64;
                self.assess(stratum, covered, items.len() as u64, now)
            })
            .collect()
    }

    /// One monitoring pass
    pub async fn run_once(&self) -> Result<Vec<CoverageCheckpoint>, EngineError> {
        let now = Utc::now();
        let since = now - ChronoDuration::days(self.config.lookback_days);
        let resolved = with_timeout("resolved_since", self.store_timeout, self.store.resolved_since(since)).await?;

        let checkpoints = self.evaluate(&resolved, now);
        let mut flagged = Vec::new();
        for checkpoint in &checkpoints {
            if checkpoint.violation {
                warn!(
                    stratum = %checkpoint.stratum,
                    observed = checkpoint.observed_coverage,
                    wilson_lower = checkpoint.wilson_lower_bound,
                    target = checkpoint.target_coverage,
                    samples = checkpoint.samples,
                    "Coverage violation"
                );
                flagged.push(checkpoint.stratum.clone());
            }
            let append = self.store.append_coverage_checkpoint(checkpoint.clone());
            if let Err(e) = with_timeout("append_coverage_checkpoint", self.store_timeout, append).await {
                error!(stratum = %checkpoint.stratum, error = %e, "Failed to persist coverage checkpoint");
            }
        }
        self.conformal.set_flagged_strata(flagged);

        debug!(strata = checkpoints.len(), "Coverage pass complete");
        Ok(checkpoints)
    }

    /// Run every `interval_secs` until `token` is cancelled
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
            info!(interval_secs = self.config.interval_secs, "Coverage monitor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Coverage pass failed");
                        }
                    }
                }
            }
            info!("Coverage monitor stopped");
        })
    }
}
