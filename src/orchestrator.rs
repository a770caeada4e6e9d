//! Decision Orchestrator
//!
//! One request runs fusion -> conformal -> features -> seed-set check ->
//! critic -> assignment on the caller's task. The only suspension points
//! are the detector fetches and the store reads, each under its own
//! timeout.
//!
//! Fail-safe policy: every failure is converted into a conservative value
//! and recorded as an escalation reason, and any escalation reason forces
//! ESCALATE. AUTOMATE is reachable only through the fully evaluated happy
//! path and the critic's safety gate.
//!
//! Writes never block the response. Decisions and calibration points go
//! through the `PersistenceWriter`; critic updates go through the
//! single-writer `OutcomeLearner`. Validations are written inline because
//! the seed-set check reads them back: a validated safety false negative
//! also locks its stratum in process, so a lost write can never leave the
//! stratum unlocked.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::assignment::ExperimentAssignmentEngine;
use crate::checkpoint::CriticCheckpoint;
use crate::config::EngineConfig;
use crate::conformal::{ConformalPredictionEngine, nonconformity};
use crate::context::{ContextFeatureBuilder, ContextVector, FeatureInputs};
use crate::coverage::CoverageMonitor;
use crate::critic::{CriticHandle, CriticModelState, SafeLucbCritic};
use crate::error::{EngineError, StoreError};
use crate::evidence::{
    DetectorEvidence, EvidenceRequest, EvidenceSource, GatheredEvidence, detection_count,
    gather_evidence, readings_from_evidence,
};
use crate::feedback::{LearnerUpdate, OutcomeLearner};
use crate::fusion::DetectorFusionEngine;
use crate::records::{
    Action, CalibrationDataPoint, Decision, EscalationReason, HistoricalValidation, Outcome,
};
use crate::report::{MetricsSummary, summarize};
use crate::seed_set::{SeedSafeSetValidator, SeedSafeStatus};
use crate::store::{DecisionStore, with_timeout};
use crate::stratum::{AgeBin, Stratum};
use crate::writer::{PersistenceWriter, WriteOp, WriterConfig};

/// Inbound assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub assessment_id: String,
    pub property_type: String,
    pub property_age_years: f64,
    pub region: String,
    #[serde(default)]
    pub experiment_id: Option<String>,
    /// Stable key for arm assignment; defaults to `assessment_id`
    #[serde(default)]
    pub assignment_key: Option<String>,
    pub lighting_quality: f64,
    pub image_clarity: f64,
    #[serde(default)]
    pub safety_critical: bool,
    #[serde(default)]
    pub num_damage_sites: usize,
    #[serde(default)]
    pub image_refs: Vec<String>,
    /// Pre-computed detector output; when absent the configured sources are queried
    #[serde(default)]
    pub evidence: Option<Vec<DetectorEvidence>>,
}

impl DecisionRequest {
    pub fn stratum(&self) -> Stratum {
        Stratum::leaf(
            self.property_type.clone(),
            AgeBin::from_age(self.property_age_years),
            self.region.clone(),
        )
    }

    fn assignment_key(&self) -> &str {
        self.assignment_key.as_deref().unwrap_or(&self.assessment_id)
    }
}

/// What the caller gets back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub decision_id: Uuid,
    pub action: Action,
    pub arm_id: String,
    pub shadow: bool,
    pub reward_ucb: f64,
    pub safety_ucb: f64,
    pub cp_set_size: usize,
    pub escalation_reasons: Vec<EscalationReason>,
}

impl From<&Decision> for DecisionResponse {
    fn from(d: &Decision) -> Self {
        Self {
            decision_id: d.decision_id,
            action: d.action,
            arm_id: d.arm_id.clone(),
            shadow: d.shadow,
            reward_ucb: d.reward_ucb,
            safety_ucb: d.safety_ucb,
            cp_set_size: d.cp_set_size,
            escalation_reasons: d.escalation_reasons.clone(),
        }
    }
}

/// Result of recording an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeReceipt {
    pub decision_id: Uuid,
    pub critic_update_queued: bool,
    pub calibration_recorded: bool,
    /// The validation reached the store before returning
    pub validation_recorded: bool,
}

/// Stable hash of a context vector
pub fn context_hash(context: &ContextVector) -> u64 {
    let mut bytes = Vec::with_capacity(context.as_array().len() * 8);
    for v in context.as_array() {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    xxh3_64(&bytes)
}

fn push_reason(reasons: &mut Vec<EscalationReason>, reason: EscalationReason) {
    if !reasons.contains(&reason) {
        reasons.push(reason);
    }
}

pub struct DecisionOrchestrator {
    config: EngineConfig,
    store: Arc<dyn DecisionStore>,
    sources: Vec<Arc<dyn EvidenceSource>>,
    fusion: DetectorFusionEngine,
    conformal: Arc<ConformalPredictionEngine>,
    seed_set: SeedSafeSetValidator,
    critic: SafeLucbCritic,
    critic_state: Arc<CriticHandle>,
    assignment: ExperimentAssignmentEngine,
    writer: Arc<PersistenceWriter>,
    learner: OutcomeLearner,
    coverage: Arc<CoverageMonitor>,
    /// Strata with a validated safety false negative seen by this process
    sfn_locked: RwLock<HashSet<Stratum>>,
}

impl DecisionOrchestrator {
    /// Validate config, restore the critic from its last checkpoint and
    /// start the writer and learner. Must run inside a tokio runtime.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn DecisionStore>,
        sources: Vec<Arc<dyn EvidenceSource>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let store_timeout = Duration::from_millis(config.runtime.store_timeout_ms);
        let critic_state = Arc::new(CriticHandle::from_config(&config.critic));
        let mut restored_learner = None;

        let agent = config.critic.agent_name.clone();
        match with_timeout("critic_state", store_timeout, store.critic_state(&agent)).await {
            Ok(Some(bytes)) => match CriticCheckpoint::from_bytes(&bytes) {
                Ok(checkpoint) => {
                    restored_learner = Some(checkpoint.learner);
                    critic_state.install(checkpoint.state);
                }
                Err(e) => warn!(agent = %agent, error = %e, "Ignoring unreadable critic checkpoint"),
            },
            Ok(None) => info!(agent = %agent, "No critic checkpoint; starting from prior"),
            Err(e) => warn!(agent = %agent, error = %e, "Critic checkpoint read failed; starting from prior"),
        }

        let writer = Arc::new(PersistenceWriter::spawn(store.clone(), WriterConfig::from(&config.runtime)));
        let learner = OutcomeLearner::spawn(
            critic_state.clone(),
            Some(writer.clone()),
            config.runtime.outcome_queue_capacity,
            config.critic.persist_every,
        );
        if let Some(stats) = restored_learner {
            learner.restore_stats(&stats);
        }

        let conformal = Arc::new(ConformalPredictionEngine::new(config.conformal.clone()));
        let coverage = Arc::new(CoverageMonitor::new(
            config.coverage.clone(),
            config.conformal.target_coverage,
            store_timeout,
            store.clone(),
            conformal.clone(),
        ));

        info!(
            detectors = config.fusion.detectors.len(),
            sources = sources.len(),
            shadow = config.runtime.shadow_mode,
            delta_t = config.safety.delta_t,
            "Decision orchestrator ready"
        );

        Ok(Self {
            fusion: DetectorFusionEngine::new(&config.fusion),
            seed_set: SeedSafeSetValidator::new(config.safety.clone()),
            critic: SafeLucbCritic::new(&config.critic, &config.safety),
            assignment: ExperimentAssignmentEngine::new(config.runtime.shadow_mode),
            config,
            store,
            sources,
            conformal,
            critic_state,
            writer,
            learner,
            coverage,
            sfn_locked: RwLock::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn critic_handle(&self) -> &Arc<CriticHandle> {
        &self.critic_state
    }

    pub fn critic_snapshot(&self) -> Arc<CriticModelState> {
        self.critic_state.snapshot()
    }

    pub fn conformal(&self) -> &Arc<ConformalPredictionEngine> {
        &self.conformal
    }

    pub fn coverage_monitor(&self) -> Arc<CoverageMonitor> {
        self.coverage.clone()
    }

    pub fn writer(&self) -> &PersistenceWriter {
        &self.writer
    }

    pub fn learner(&self) -> &OutcomeLearner {
        &self.learner
    }

    fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.config.runtime.store_timeout_ms)
    }

    /// Whether a safety false negative was validated for `stratum` since start
    pub fn is_sfn_locked(&self, stratum: &Stratum) -> bool {
        match self.sfn_locked.read() {
            Ok(guard) => guard.contains(stratum),
            Err(poisoned) => poisoned.into_inner().contains(stratum),
        }
    }

    fn lock_stratum(&self, stratum: &Stratum) {
        let inserted = match self.sfn_locked.write() {
            Ok(mut guard) => guard.insert(stratum.clone()),
            Err(poisoned) => poisoned.into_inner().insert(stratum.clone()),
        };
        if inserted {
            warn!(stratum = %stratum, "Stratum locked after safety false negative");
        }
    }

    /// Full decision: gather evidence (unless supplied inline), then decide
    pub async fn decide(&self, request: &DecisionRequest) -> Decision {
        let gathered = match &request.evidence {
            Some(items) => GatheredEvidence {
                items: items.clone(),
                unavailable: Vec::new(),
            },
            None => {
                let evidence_request = EvidenceRequest {
                    assessment_id: request.assessment_id.clone(),
                    image_refs: request.image_refs.clone(),
                };
                gather_evidence(
                    &self.sources,
                    &evidence_request,
                    Duration::from_millis(self.config.runtime.evidence_timeout_ms),
                )
                .await
            }
        };
        self.decide_with_evidence(request, gathered).await
    }

    pub async fn decide_with_evidence(&self, request: &DecisionRequest, mut gathered: GatheredEvidence) -> Decision {
        let mut reasons = Vec::new();
        let stratum = request.stratum();
        let timeout = self.store_timeout();

        // ---- fusion ----
        gathered.require(self.fusion.detectors());
        let readings = readings_from_evidence(&gathered.items);
        let fusion_stats = self.fusion.fuse(&readings);
        if !gathered.is_complete() || fusion_stats.detectors_used == 0 {
            warn!(
                assessment_id = %request.assessment_id,
                unavailable = ?gathered.unavailable,
                detectors_used = fusion_stats.detectors_used,
                "Evidence unavailable"
            );
            push_reason(&mut reasons, EscalationReason::EvidenceUnavailable);
        }

        // ---- conformal ----
        let history = match with_timeout(
            "calibration_points",
            timeout,
            self.store
                .calibration_points(&stratum.global(), self.config.conformal.calibration_window),
        )
        .await
        {
            Ok(points) => points,
            Err(e) => {
                warn!(stratum = %stratum, error = %e, "Calibration read failed");
                push_reason(&mut reasons, EscalationReason::StoreReadFailed);
                Vec::new()
            }
        };
        let conformal = self.conformal.predict(
            &stratum,
            fusion_stats.fused_confidence,
            self.config.conformal.target_coverage,
            &history,
        );
        if conformal.calibration_insufficient {
            warn!(stratum = %stratum, available = conformal.samples, "Calibration insufficient");
            push_reason(&mut reasons, EscalationReason::CalibrationInsufficient);
        }

        // ---- features ----
        let inputs = FeatureInputs {
            fusion_confidence: fusion_stats.fused_confidence,
            fusion_variance: fusion_stats.fused_variance,
            disagreement_variance: fusion_stats.disagreement_variance,
            cp_set_size: conformal.prediction_set_size,
            safety_critical: request.safety_critical,
            lighting_quality: request.lighting_quality,
            image_clarity: request.image_clarity,
            property_age_years: request.property_age_years,
            num_damage_sites: request.num_damage_sites,
            detection_count: detection_count(&gathered.items),
            region: request.region.clone(),
        };
        let context = match ContextFeatureBuilder::build(&inputs) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(assessment_id = %request.assessment_id, error = %e, "Feature validation failed");
                push_reason(&mut reasons, EscalationReason::FeatureValidationFailed);
                None
            }
        };

        // ---- seed safe set ----
        let counts = with_timeout("validation_counts", timeout, self.store.validation_counts(&stratum)).await;
        let mut seed = match counts {
            Ok((n, x)) => self.seed_set.evaluate_counts(&stratum, n, x),
            Err(e) => {
                warn!(stratum = %stratum, error = %e, "Validation history read failed");
                push_reason(&mut reasons, EscalationReason::StoreReadFailed);
                SeedSafeStatus::locked(stratum.clone())
            }
        };
        if seed.unlocked && self.is_sfn_locked(&stratum) {
            debug!(stratum = %stratum, "Store reports unlocked; held locked after safety false negative");
            seed.unlocked = false;
        }

        // ---- critic ----
        let snapshot = self.critic_state.snapshot();
        let (reward_ucb, safety_ucb, mut action) = match context {
            Some(ctx) => {
                let verdict = self.critic.evaluate(&snapshot, ctx, seed.unlocked);
                for reason in &verdict.reasons {
                    push_reason(&mut reasons, *reason);
                }
                (verdict.reward_ucb, verdict.safety_ucb, verdict.action)
            }
            None => (0.0, 1.0, Action::Escalate),
        };

        // ---- assignment ----
        let experiment = match &request.experiment_id {
            Some(id) => match with_timeout("experiment", timeout, self.store.experiment(id)).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(experiment_id = %id, error = %e, "Experiment read failed");
                    push_reason(&mut reasons, EscalationReason::StoreReadFailed);
                    None
                }
            },
            None => None,
        };
        let assignment = self.assignment.assign(experiment.as_ref(), request.assignment_key());

        if !reasons.is_empty() {
            action = Action::Escalate;
        }

        let decision = Decision {
            decision_id: Uuid::new_v4(),
            assessment_id: request.assessment_id.clone(),
            stratum,
            context_vector: context,
            fusion_stats,
            cp_set_size: conformal.prediction_set_size,
            interval: conformal.interval,
            reward_ucb,
            safety_ucb,
            action,
            arm_id: assignment.arm_id,
            shadow: assignment.shadow,
            unlocked: seed.unlocked,
            critic_version: snapshot.version,
            escalation_reasons: reasons,
            timestamp: Utc::now(),
        };

        info!(
            decision_id = %decision.decision_id,
            action = decision.action.as_str(),
            safety_ucb = decision.safety_ucb,
            shadow = decision.shadow,
            arm = %decision.arm_id,
            "Decision made"
        );

        // logged even in shadow mode; a lost record never blocks the caller
        if self.writer.try_enqueue(WriteOp::Decision(decision.clone())).is_err() {
            error!(decision_id = %decision.decision_id, "Decision record could not be queued");
        }

        decision
    }

    /// The only sanctioned path to an automated side effect. Returns whether
    /// `effect` ran.
    pub fn execute_automation<F>(&self, decision: &Decision, effect: F) -> bool
    where
        F: FnOnce(&Decision),
    {
        if !decision.is_actionable_automation() {
            debug!(
                decision_id = %decision.decision_id,
                action = decision.action.as_str(),
                shadow = decision.shadow,
                "Automation refused"
            );
            return false;
        }
        effect(decision);
        true
    }

    /// Record ground truth for a logged decision
    pub async fn record_outcome(&self, outcome: Outcome) -> Result<OutcomeReceipt, EngineError> {
        let timeout = self.store_timeout();
        let decision = with_timeout("decision", timeout, self.store.decision(outcome.decision_id))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("decision {}", outcome.decision_id)))?;

        if outcome.safety_false_negative {
            self.lock_stratum(&decision.stratum);
        }

        match with_timeout("append_outcome", timeout, self.store.append_outcome(outcome.clone())).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                warn!(decision_id = %outcome.decision_id, error = %e, "Outcome append failed; queueing");
                if self.writer.try_enqueue(WriteOp::Outcome(outcome.clone())).is_err() {
                    return Err(e.into());
                }
            }
            Err(e) => return Err(e.into()),
        }

        let validation = HistoricalValidation {
            stratum: decision.stratum.clone(),
            context_hash: decision.context_vector.as_ref().map(context_hash).unwrap_or(0),
            safety_false_negative: outcome.safety_false_negative,
            timestamp: outcome.validated_at,
        };
        let written = with_timeout(
            "append_validation",
            timeout,
            self.store.append_validation(validation.clone()),
        )
        .await;
        let validation_recorded = match written {
            Ok(()) => true,
            Err(e) => {
                error!(
                    decision_id = %outcome.decision_id,
                    stratum = %decision.stratum,
                    safety_false_negative = outcome.safety_false_negative,
                    error = %e,
                    "Validation write failed; queueing"
                );
                let _ = self.writer.try_enqueue(WriteOp::Validation(validation));
                false
            }
        };

        let calibration_recorded = match outcome.damage_confirmed {
            Some(confirmed) if decision.fusion_stats.detectors_used > 0 => {
                let y = if confirmed { 1.0 } else { 0.0 };
                let weight = if outcome.calibration_weight.is_finite() && outcome.calibration_weight > 0.0 {
                    outcome.calibration_weight
                } else {
                    1.0
                };
                let point = CalibrationDataPoint {
                    stratum: decision.stratum.clone(),
                    nonconformity_score: nonconformity(decision.fusion_stats.fused_confidence, y),
                    weight,
                    timestamp: outcome.validated_at,
                };
                self.writer.try_enqueue(WriteOp::Calibration(point)).is_ok()
            }
            _ => false,
        };

        let critic_update_queued = match decision.context_vector {
            Some(context) => self
                .learner
                .submit(LearnerUpdate {
                    decision_id: decision.decision_id,
                    context,
                    realized_reward: outcome.realized_reward,
                    safety_false_negative: outcome.safety_false_negative,
                })
                .is_ok(),
            None => false,
        };

        if outcome.safety_false_negative {
            warn!(
                decision_id = %decision.decision_id,
                stratum = %decision.stratum,
                action = decision.action.as_str(),
                "Safety false negative validated"
            );
        }

        Ok(OutcomeReceipt {
            decision_id: decision.decision_id,
            critic_update_queued,
            calibration_recorded,
            validation_recorded,
        })
    }

    /// Aggregates over the last `lookback_hours`
    pub async fn metrics_summary(&self, lookback_hours: i64) -> Result<MetricsSummary, EngineError> {
        let timeout = self.store_timeout();
        let since = Utc::now() - ChronoDuration::hours(lookback_hours.max(0));
        let decisions = with_timeout("decisions_since", timeout, self.store.decisions_since(since)).await?;
        let resolved = with_timeout("resolved_since", timeout, self.store.resolved_since(since)).await?;
        let strata = self.coverage.evaluate(&resolved, Utc::now());
        Ok(summarize(lookback_hours, &decisions, &resolved, strata))
    }

    /// Wait for queued critic updates and writes to drain
    pub async fn flush(&self) {
        self.learner.flush().await;
        self.writer.flush().await;
    }

    /// Final checkpoint, then drain the writer
    pub async fn shutdown(&self) {
        self.learner.shutdown().await;
        self.writer.flush().await;
        info!(version = self.critic_state.version(), "Decision orchestrator stopped");
    }
}
