//! Persistence Contracts
//!
//! `DecisionStore` is the seam between the engine and whatever database
//! backs it. Reads are keyed by stratum, agent name or experiment id; writes
//! are append-only except for the critic checkpoint, which is upserted.
//!
//! `InMemoryStore` backs single-process deployments and tests. It can be
//! told to fail reads or a number of writes to exercise fail-safe paths.
//! Calibration points can be capped so long-running processes keep a
//! bounded pool; validation counts are kept per leaf so the seed-set check
//! never copies the history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::assignment::ExperimentConfig;
use crate::error::StoreError;
use crate::records::{
    CalibrationDataPoint, CoverageCheckpoint, Decision, HistoricalValidation, Outcome,
};
use crate::stratum::Stratum;

#[async_trait]
pub trait DecisionStore: Send + Sync {
    // ---- reads ----

    /// The most recent `limit` calibration points recorded in any leaf
    /// contained by `stratum`, oldest first
    async fn calibration_points(
        &self,
        stratum: &Stratum,
        limit: usize,
    ) -> Result<Vec<CalibrationDataPoint>, StoreError>;
    /// Validations recorded in any leaf contained by `stratum`
    async fn validations(&self, stratum: &Stratum) -> Result<Vec<HistoricalValidation>, StoreError>;
    /// `(validations, safety false negatives)` under `stratum`
    async fn validation_counts(&self, stratum: &Stratum) -> Result<(u64, u64), StoreError> {
        let history = self.validations(stratum).await?;
        let failures = history.iter().filter(|v| v.safety_false_negative).count() as u64;
        Ok((history.len() as u64, failures))
    }
    /// Serialized critic checkpoint for `agent_name`
    async fn critic_state(&self, agent_name: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn experiment(&self, experiment_id: &str) -> Result<Option<ExperimentConfig>, StoreError>;
    async fn coverage_checkpoints(&self, stratum: &Stratum) -> Result<Vec<CoverageCheckpoint>, StoreError>;
    async fn decision(&self, decision_id: Uuid) -> Result<Option<Decision>, StoreError>;
    async fn decisions_since(&self, since: DateTime<Utc>) -> Result<Vec<Decision>, StoreError>;
    /// Outcomes validated since `since`, joined with their decisions
    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<(Decision, Outcome)>, StoreError>;

    // ---- writes ----

    async fn append_decision(&self, decision: Decision) -> Result<(), StoreError>;
    /// Fails with `Duplicate` if the decision already has an outcome
    async fn append_outcome(&self, outcome: Outcome) -> Result<(), StoreError>;
    async fn append_validation(&self, validation: HistoricalValidation) -> Result<(), StoreError>;
    async fn append_calibration_point(&self, point: CalibrationDataPoint) -> Result<(), StoreError>;
    async fn append_coverage_checkpoint(&self, checkpoint: CoverageCheckpoint) -> Result<(), StoreError>;
    async fn upsert_critic_state(&self, agent_name: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    async fn put_experiment(&self, experiment: ExperimentConfig) -> Result<(), StoreError>;
}

/// Run a store call under a timeout
pub async fn with_timeout<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            op,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[derive(Default)]
struct Tables {
    decisions: Vec<Decision>,
    decision_index: HashMap<Uuid, usize>,
    outcomes: Vec<Outcome>,
    outcome_index: HashMap<Uuid, usize>,
    validations: Vec<HistoricalValidation>,
    /// per leaf: (validations, safety false negatives)
    validation_counts: HashMap<Stratum, (u64, u64)>,
    calibration: VecDeque<CalibrationDataPoint>,
    coverage: Vec<CoverageCheckpoint>,
    critic_states: HashMap<String, Vec<u8>>,
    experiments: HashMap<String, ExperimentConfig>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    /// Oldest calibration points are evicted beyond this count
    calibration_retention: Option<usize>,
    fail_reads: AtomicBool,
    failing_writes: AtomicU32,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calibration_retention(retention: usize) -> Self {
        Self {
            calibration_retention: Some(retention.max(1)),
            ..Self::default()
        }
    }

    /// Make every read fail until cleared
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn decision_count(&self) -> usize {
        self.read_tables(|t| t.decisions.len())
    }

    pub fn outcome_count(&self) -> usize {
        self.read_tables(|t| t.outcomes.len())
    }

    fn read_tables<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        match self.tables.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> T {
        match self.tables.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("write rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DecisionStore for InMemoryStore {
    async fn calibration_points(
        &self,
        stratum: &Stratum,
        limit: usize,
    ) -> Result<Vec<CalibrationDataPoint>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            let mut recent: Vec<CalibrationDataPoint> = t
                .calibration
                .iter()
                .rev()
                .filter(|p| stratum.contains(&p.stratum))
                .take(limit)
                .cloned()
                .collect();
            recent.reverse();
            recent
        }))
    }

    async fn validations(&self, stratum: &Stratum) -> Result<Vec<HistoricalValidation>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            t.validations
                .iter()
                .filter(|v| stratum.contains(&v.stratum))
                .cloned()
                .collect()
        }))
    }

    async fn validation_counts(&self, stratum: &Stratum) -> Result<(u64, u64), StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            t.validation_counts
                .iter()
                .filter(|(leaf, _)| stratum.contains(*leaf))
                .fold((0, 0), |(n, x), (_, (dn, dx))| (n + dn, x + dx))
        }))
    }

    async fn critic_state(&self, agent_name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| t.critic_states.get(agent_name).cloned()))
    }

    async fn experiment(&self, experiment_id: &str) -> Result<Option<ExperimentConfig>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| t.experiments.get(experiment_id).cloned()))
    }

    async fn coverage_checkpoints(&self, stratum: &Stratum) -> Result<Vec<CoverageCheckpoint>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            t.coverage
                .iter()
                .filter(|c| &c.stratum == stratum)
                .cloned()
                .collect()
        }))
    }

    async fn decision(&self, decision_id: Uuid) -> Result<Option<Decision>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            t.decision_index
                .get(&decision_id)
                .and_then(|&i| t.decisions.get(i))
                .cloned()
        }))
    }

    async fn decisions_since(&self, since: DateTime<Utc>) -> Result<Vec<Decision>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            t.decisions
                .iter()
                .filter(|d| d.timestamp >= since)
                .cloned()
                .collect()
        }))
    }

    async fn resolved_since(&self, since: DateTime<Utc>) -> Result<Vec<(Decision, Outcome)>, StoreError> {
        self.check_read()?;
        Ok(self.read_tables(|t| {
            t.outcomes
                .iter()
                .filter(|o| o.validated_at >= since)
                .filter_map(|o| {
                    let decision = t.decision_index.get(&o.decision_id).and_then(|&i| t.decisions.get(i))?;
                    Some((decision.clone(), o.clone()))
                })
                .collect()
        }))
    }

    async fn append_decision(&self, decision: Decision) -> Result<(), StoreError> {
        self.check_write()?;
        self.write_tables(|t| {
            if t.decision_index.contains_key(&decision.decision_id) {
                return Err(StoreError::Duplicate(decision.decision_id.to_string()));
            }
            t.decision_index.insert(decision.decision_id, t.decisions.len());
            t.decisions.push(decision);
            Ok(())
        })
    }

    async fn append_outcome(&self, outcome: Outcome) -> Result<(), StoreError> {
        self.check_write()?;
        self.write_tables(|t| {
            if t.outcome_index.contains_key(&outcome.decision_id) {
                return Err(StoreError::Duplicate(outcome.decision_id.to_string()));
            }
            t.outcome_index.insert(outcome.decision_id, t.outcomes.len());
            t.outcomes.push(outcome);
            Ok(())
        })
    }

    async fn append_validation(&self, validation: HistoricalValidation) -> Result<(), StoreError> {
        self.check_write()?;
        self.write_tables(|t| {
            let counts = t.validation_counts.entry(validation.stratum.clone()).or_default();
            counts.0 += 1;
            if validation.safety_false_negative {
                counts.1 += 1;
            }
            t.validations.push(validation);
        });
        Ok(())
    }

    async fn append_calibration_point(&self, point: CalibrationDataPoint) -> Result<(), StoreError> {
        self.check_write()?;
        let retention = self.calibration_retention;
        self.write_tables(|t| {
            t.calibration.push_back(point);
            if let Some(cap) = retention {
                while t.calibration.len() > cap {
                    t.calibration.pop_front();
                }
            }
        });
        Ok(())
    }

    async fn append_coverage_checkpoint(&self, checkpoint: CoverageCheckpoint) -> Result<(), StoreError> {
        self.check_write()?;
        self.write_tables(|t| t.coverage.push(checkpoint));
        Ok(())
    }

    async fn upsert_critic_state(&self, agent_name: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.check_write()?;
        self.write_tables(|t| t.critic_states.insert(agent_name.to_string(), bytes));
        Ok(())
    }

    async fn put_experiment(&self, experiment: ExperimentConfig) -> Result<(), StoreError> {
        self.check_write()?;
        self.write_tables(|t| t.experiments.insert(experiment.experiment_id.clone(), experiment));
        Ok(())
    }
}
