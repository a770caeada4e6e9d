//! End-to-end decision path tests against the in-memory store.

use async_trait::async_trait;
use chrono::Utc;
use safeauto_core::assignment::{Arm, ExperimentConfig};
use safeauto_core::checkpoint::CriticCheckpoint;
use safeauto_core::context::Feature;
use safeauto_core::critic::SafeLucbCritic;
use safeauto_core::error::StoreError;
use safeauto_core::evidence::{BoundingBox, DetectorEvidence, EvidenceRequest, EvidenceSource};
use safeauto_core::records::{CalibrationDataPoint, HistoricalValidation};
use safeauto_core::stratum::Stratum;
use safeauto_core::{
    Action, ContextVector, DecisionOrchestrator, DecisionRequest, DecisionStore, EngineConfig,
    EngineError, EscalationReason, InMemoryStore, Outcome,
};
use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

fn evidence(id: &str, confidence: f64) -> DetectorEvidence {
    DetectorEvidence {
        detector_id: id.to_string(),
        bounding_boxes: vec![BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 40.0,
            height: 40.0,
        }],
        confidence,
        class_label: "roof_damage".to_string(),
        variance: Some(0.1),
    }
}

fn request(safety_critical: bool) -> DecisionRequest {
    DecisionRequest {
        assessment_id: "assess-001".to_string(),
        property_type: "residential".to_string(),
        property_age_years: 35.0,
        region: "London".to_string(),
        experiment_id: None,
        assignment_key: None,
        lighting_quality: 0.8,
        image_clarity: 0.9,
        safety_critical,
        num_damage_sites: 3,
        image_refs: Vec::new(),
        evidence: Some(vec![
            evidence("sam3", 0.9),
            evidence("gpt4", 0.9),
            evidence("scene_graph", 0.9),
        ]),
    }
}

fn leaf() -> Stratum {
    request(false).stratum()
}

/// 1000 clean validations and 200 calibration points in the request's leaf
async fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    for i in 0..1000u64 {
        store
            .append_validation(HistoricalValidation {
                stratum: leaf(),
                context_hash: i,
                safety_false_negative: false,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }
    for i in 0..200 {
        store
            .append_calibration_point(CalibrationDataPoint {
                stratum: leaf(),
                nonconformity_score: (i % 100) as f64 / 1000.0,
                weight: 1.0,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
    }
    store
}

async fn engine(config: EngineConfig, store: Arc<InMemoryStore>) -> DecisionOrchestrator {
    DecisionOrchestrator::start(config, store, Vec::new()).await.unwrap()
}

fn train(orchestrator: &DecisionOrchestrator, context: &ContextVector, n: usize) {
    for _ in 0..n {
        orchestrator.critic_handle().apply(context, 1.0, false);
    }
}

#[tokio::test]
async fn test_scenario_a_automates_trained_unlocked_stratum() {
    let orchestrator = engine(EngineConfig::default(), seeded_store().await).await;

    let first = orchestrator.decide(&request(false)).await;
    let context = first.context_vector.unwrap();
    assert!((context.get(Feature::FusionConfidence) - 0.9).abs() < 1e-9);
    assert_eq!(first.cp_set_size, 2);
    assert_eq!(context.get(Feature::CpSetSize), 0.2);
    assert!(first.unlocked);
    // an untrained critic is too uncertain to automate
    assert_eq!(first.action, Action::Escalate);

    train(&orchestrator, &context, 1000);

    let decision = orchestrator.decide(&request(false)).await;
    assert_eq!(decision.context_vector, Some(context));
    assert_eq!(decision.action, Action::Automate);
    assert!(decision.safety_ucb <= 0.001);
    assert!(decision.escalation_reasons.is_empty());
    assert!(!decision.shadow);

    let mut ran = false;
    assert!(orchestrator.execute_automation(&decision, |_| ran = true));
    assert!(ran);
}

#[tokio::test]
async fn test_scenario_b_safety_critical_escalates() {
    let orchestrator = engine(EngineConfig::default(), seeded_store().await).await;
    let baseline = orchestrator.decide(&request(false)).await.context_vector.unwrap();
    train(&orchestrator, &baseline, 1000);

    let decision = orchestrator.decide(&request(true)).await;
    assert_eq!(decision.action, Action::Escalate);
    assert!(decision.safety_ucb > 0.001);
    assert!(decision.escalation_reasons.contains(&EscalationReason::SafetyBoundExceeded));

    // reward estimate is unchanged by the hazard flag
    let hazard = decision.context_vector.unwrap();
    let critic = SafeLucbCritic::new(&EngineConfig::default().critic, &EngineConfig::default().safety);
    let state = orchestrator.critic_snapshot();
    let safe = critic.evaluate(&state, baseline, true);
    let flagged = critic.evaluate(&state, hazard, true);
    assert!((safe.reward_estimate - flagged.reward_estimate).abs() < 1e-9);
}

#[tokio::test]
async fn test_shadow_decisions_never_execute() {
    let mut config = EngineConfig::default();
    config.runtime.shadow_mode = true;
    let orchestrator = engine(config, seeded_store().await).await;
    let context = orchestrator.decide(&request(false)).await.context_vector.unwrap();
    train(&orchestrator, &context, 1000);

    let decision = orchestrator.decide(&request(false)).await;
    // computed and logged exactly as normal
    assert_eq!(decision.action, Action::Automate);
    assert!(decision.shadow);

    let executed = Cell::new(false);
    assert!(!orchestrator.execute_automation(&decision, |_| executed.set(true)));
    assert!(!executed.get());
}

#[tokio::test]
async fn test_experiment_shadow_and_arm() {
    let store = seeded_store().await;
    store
        .put_experiment(ExperimentConfig {
            experiment_id: "gate-v2".to_string(),
            arms: vec![Arm {
                name: "treatment".to_string(),
                allocation_ratio: 1.0,
            }],
            rollout_percent: 100.0,
            shadow_mode: true,
        })
        .await
        .unwrap();
    let orchestrator = engine(EngineConfig::default(), store.clone()).await;

    let mut req = request(false);
    req.experiment_id = Some("gate-v2".to_string());
    let first = orchestrator.decide(&req).await;
    let second = orchestrator.decide(&req).await;
    assert_eq!(first.arm_id, "treatment");
    assert!(first.shadow);
    assert_eq!((first.arm_id, first.shadow), (second.arm_id, second.shadow));
}

struct Slow;

#[async_trait]
impl EvidenceSource for Slow {
    fn detector_id(&self) -> &str {
        "gpt4"
    }
    async fn fetch(&self, _request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(vec![evidence("gpt4", 0.9)])
    }
}

struct Fixed(&'static str);

#[async_trait]
impl EvidenceSource for Fixed {
    fn detector_id(&self) -> &str {
        self.0
    }
    async fn fetch(&self, _request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
        Ok(vec![evidence(self.0, 0.9)])
    }
}

#[tokio::test]
async fn test_evidence_timeout_forces_escalate() {
    let mut config = EngineConfig::default();
    config.runtime.evidence_timeout_ms = 50;
    let sources: Vec<Arc<dyn EvidenceSource>> =
        vec![Arc::new(Fixed("sam3")), Arc::new(Slow), Arc::new(Fixed("scene_graph"))];
    let orchestrator = DecisionOrchestrator::start(config, seeded_store().await, sources)
        .await
        .unwrap();
    let context = orchestrator.decide(&request(false)).await.context_vector.unwrap();
    train(&orchestrator, &context, 1000);

    let mut req = request(false);
    req.evidence = None;
    let decision = orchestrator.decide(&req).await;
    assert_eq!(decision.fusion_stats.detectors_used, 2);
    assert_eq!(decision.action, Action::Escalate);
    assert!(decision.escalation_reasons.contains(&EscalationReason::EvidenceUnavailable));
}

struct Empty;

#[async_trait]
impl EvidenceSource for Empty {
    fn detector_id(&self) -> &str {
        "gpt4"
    }
    async fn fetch(&self, _request: &EvidenceRequest) -> Result<Vec<DetectorEvidence>, EngineError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_silent_detector_forces_escalate() {
    let sources: Vec<Arc<dyn EvidenceSource>> =
        vec![Arc::new(Fixed("sam3")), Arc::new(Empty), Arc::new(Fixed("scene_graph"))];
    let orchestrator = DecisionOrchestrator::start(EngineConfig::default(), seeded_store().await, sources)
        .await
        .unwrap();
    let context = orchestrator.decide(&request(false)).await.context_vector.unwrap();
    train(&orchestrator, &context, 1000);

    let mut req = request(false);
    req.evidence = None;
    let decision = orchestrator.decide(&req).await;
    assert_eq!(decision.fusion_stats.detectors_used, 2);
    assert_eq!(decision.action, Action::Escalate);
    assert!(decision.escalation_reasons.contains(&EscalationReason::EvidenceUnavailable));

    // inline evidence missing a configured detector
    let mut req = request(false);
    req.evidence = Some(vec![evidence("sam3", 0.9), evidence("scene_graph", 0.9)]);
    let decision = orchestrator.decide(&req).await;
    assert_eq!(decision.action, Action::Escalate);
    assert!(decision.escalation_reasons.contains(&EscalationReason::EvidenceUnavailable));
}

#[tokio::test]
async fn test_store_read_failure_is_conservative() {
    let store = seeded_store().await;
    let orchestrator = engine(EngineConfig::default(), store.clone()).await;
    store.set_fail_reads(true);

    let decision = orchestrator.decide(&request(false)).await;
    assert_eq!(decision.action, Action::Escalate);
    assert!(!decision.unlocked);
    assert_eq!(decision.cp_set_size, 10);
    assert!(decision.escalation_reasons.contains(&EscalationReason::StoreReadFailed));
}

#[tokio::test]
async fn test_no_calibration_is_maximal_uncertainty() {
    let orchestrator = engine(EngineConfig::default(), Arc::new(InMemoryStore::new())).await;
    let decision = orchestrator.decide(&request(false)).await;
    assert_eq!(decision.cp_set_size, 10);
    assert_eq!(decision.interval.width(), 1.0);
    assert_eq!(decision.action, Action::Escalate);
    assert!(decision.escalation_reasons.contains(&EscalationReason::CalibrationInsufficient));
    assert!(decision.escalation_reasons.contains(&EscalationReason::StratumLocked));
}

#[tokio::test]
async fn test_invalid_features_escalate() {
    let orchestrator = engine(EngineConfig::default(), seeded_store().await).await;
    let mut req = request(false);
    req.lighting_quality = f64::NAN;

    let decision = orchestrator.decide(&req).await;
    assert_eq!(decision.action, Action::Escalate);
    assert!(decision.context_vector.is_none());
    assert!(decision.escalation_reasons.contains(&EscalationReason::FeatureValidationFailed));
}

fn outcome_for(decision_id: uuid::Uuid, damaged: bool, sfn: bool) -> Outcome {
    Outcome {
        decision_id,
        safety_false_negative: sfn,
        realized_reward: 1.0,
        damage_confirmed: Some(damaged),
        calibration_weight: 1.0,
        validated_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_outcome_feeds_critic_calibration_and_validations() {
    let store = seeded_store().await;
    let orchestrator = engine(EngineConfig::default(), store.clone()).await;
    let decision = orchestrator.decide(&request(false)).await;
    orchestrator.flush().await;

    let receipt = orchestrator
        .record_outcome(outcome_for(decision.decision_id, true, false))
        .await
        .unwrap();
    assert!(receipt.critic_update_queued);
    assert!(receipt.calibration_recorded);
    orchestrator.flush().await;

    assert_eq!(orchestrator.critic_snapshot().observations, 1);
    assert_eq!(store.validations(&leaf()).await.unwrap().len(), 1001);
    let calibration = store.calibration_points(&leaf(), usize::MAX).await.unwrap();
    assert_eq!(calibration.len(), 201);
    let newest = calibration.last().unwrap();
    assert!((newest.nonconformity_score - 0.1).abs() < 1e-9);

    let duplicate = orchestrator
        .record_outcome(outcome_for(decision.decision_id, true, false))
        .await;
    assert!(matches!(duplicate, Err(EngineError::Store(StoreError::Duplicate(_)))));

    let unknown = orchestrator
        .record_outcome(outcome_for(uuid::Uuid::new_v4(), true, false))
        .await;
    assert!(matches!(unknown, Err(EngineError::Store(StoreError::NotFound(_)))));
}

#[tokio::test]
async fn test_sfn_outcome_relocks_stratum() {
    let store = seeded_store().await;
    let orchestrator = engine(EngineConfig::default(), store.clone()).await;
    let decision = orchestrator.decide(&request(false)).await;
    assert!(decision.unlocked);
    orchestrator.flush().await;

    let receipt = orchestrator
        .record_outcome(outcome_for(decision.decision_id, true, true))
        .await
        .unwrap();
    // written before returning, no flush needed
    assert!(receipt.validation_recorded);
    assert_eq!(store.validation_counts(&leaf()).await.unwrap(), (1001, 1));
    orchestrator.flush().await;

    let next = orchestrator.decide(&request(false)).await;
    assert!(!next.unlocked);
    assert_eq!(next.action, Action::Escalate);
}

#[tokio::test]
async fn test_sfn_locks_stratum_when_validation_write_is_lost() {
    let store = seeded_store().await;
    let mut config = EngineConfig::default();
    config.runtime.write_queue_capacity = 1;
    config.runtime.write_max_retries = 0;
    let orchestrator = engine(config, store.clone()).await;

    let context = orchestrator.decide(&request(false)).await.context_vector.unwrap();
    orchestrator.flush().await;
    train(&orchestrator, &context, 1000);
    let decision = orchestrator.decide(&request(false)).await;
    assert_eq!(decision.action, Action::Automate);
    orchestrator.flush().await;

    store.fail_next_writes(u32::MAX);
    let recorded = orchestrator
        .record_outcome(outcome_for(decision.decision_id, true, true))
        .await;
    if let Ok(receipt) = &recorded {
        assert!(!receipt.validation_recorded);
    }
    orchestrator.flush().await;
    store.fail_next_writes(0);

    // the store never saw the failure and still reports a clean history
    assert_eq!(store.validation_counts(&leaf()).await.unwrap(), (1000, 0));
    assert!(orchestrator.is_sfn_locked(&leaf()));

    let next = orchestrator.decide(&request(false)).await;
    assert!(!next.unlocked);
    assert_eq!(next.action, Action::Escalate);
    assert!(next.escalation_reasons.contains(&EscalationReason::StratumLocked));
}

#[tokio::test]
async fn test_critic_checkpoint_survives_restart() {
    let store = seeded_store().await;
    let mut config = EngineConfig::default();
    config.critic.persist_every = 5;

    let orchestrator = engine(config.clone(), store.clone()).await;
    for i in 0..7 {
        let mut req = request(false);
        req.assessment_id = format!("assess-{i}");
        let decision = orchestrator.decide(&req).await;
        orchestrator.flush().await;
        orchestrator
            .record_outcome(outcome_for(decision.decision_id, true, false))
            .await
            .unwrap();
    }
    orchestrator.shutdown().await;

    let bytes = store.critic_state("safe-lucb").await.unwrap().unwrap();
    assert_eq!(CriticCheckpoint::from_bytes(&bytes).unwrap().state.version, 7);

    let restarted = engine(config, store).await;
    assert_eq!(restarted.critic_snapshot().version, 7);
    assert_eq!(restarted.critic_snapshot().observations, 7);
}

#[tokio::test]
async fn test_metrics_summary() {
    let store = seeded_store().await;
    let orchestrator = engine(EngineConfig::default(), store.clone()).await;
    for i in 0..4 {
        let mut req = request(false);
        req.assessment_id = format!("assess-{i}");
        let decision = orchestrator.decide(&req).await;
        orchestrator.flush().await;
        orchestrator
            .record_outcome(outcome_for(decision.decision_id, true, i == 0))
            .await
            .unwrap();
    }
    orchestrator.flush().await;

    let summary = orchestrator.metrics_summary(24).await.unwrap();
    assert_eq!(summary.decisions, 4);
    assert_eq!(summary.automated, 0);
    assert_eq!(summary.outcomes, 4);
    assert_eq!(summary.sfn_count, 1);
    assert_eq!(summary.strata.len(), 1);
    assert_eq!(summary.strata[0].samples, 4);
}
