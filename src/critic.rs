//! Safe-LUCB Critic
//!
//! Linear contextual bandit with two heads over the same design matrix:
//!
//! ```text
//! A = λI + Σ xxᵀ          θ = A⁻¹ b_r          φ = A⁻¹ b_s
//! rewardUCB = θᵀx + β_r √(xᵀA⁻¹x)
//! safetyUCB = φᵀx + β_s √(xᵀA⁻¹x)
//! ```
//!
//! A⁻¹ is maintained directly with Sherman-Morrison, so each update is
//! O(d²). The exploration bonus shrinks as similar contexts accumulate.
//!
//! The per-decision flow is a typed stage machine
//! `FeaturesReady -> Scored -> Gated -> CriticDecision`; a stage can only be
//! built from the one before it, so no decision skips the safety gate.
//!
//! `CriticHandle` owns the shared state. Readers take a versioned `Arc`
//! snapshot without blocking; updates clone, mutate and swap under a writer
//! lock so no reader sees a half-applied update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{CriticConfig, SafetyConfig};
use crate::context::{CONTEXT_DIM, ContextVector};
use crate::records::{Action, EscalationReason};

type Vector = [f64; CONTEXT_DIM];
type Matrix = [[f64; CONTEXT_DIM]; CONTEXT_DIM];

// ============================================================================
// Model state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticModelState {
    pub agent_name: String,
    /// Reward head
    pub theta: Vector,
    /// Safety head
    pub phi: Vector,
    /// Inverse of the regularized design matrix
    pub a_inv: Matrix,
    pub b_reward: Vector,
    pub b_safety: Vector,
    pub observations: u64,
    /// Incremented on every applied update
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl CriticModelState {
    /// Zero prior with `A = λI`
    pub fn new(agent_name: impl Into<String>, lambda: f64) -> Self {
        let lambda = if lambda.is_finite() && lambda > 0.0 { lambda } else { 1.0 };
        let mut a_inv = [[0.0; CONTEXT_DIM]; CONTEXT_DIM];
        for (i, row) in a_inv.iter_mut().enumerate() {
            row[i] = 1.0 / lambda;
        }
        Self {
            agent_name: agent_name.into(),
            theta: [0.0; CONTEXT_DIM],
            phi: [0.0; CONTEXT_DIM],
            a_inv,
            b_reward: [0.0; CONTEXT_DIM],
            b_safety: [0.0; CONTEXT_DIM],
            observations: 0,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    fn a_inv_times(&self, x: &Vector) -> Vector {
        let mut out = [0.0; CONTEXT_DIM];
        for (i, row) in self.a_inv.iter().enumerate() {
            out[i] = row.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
        }
        out
    }

    /// `√(xᵀA⁻¹x)`
    pub fn confidence_width(&self, context: &ContextVector) -> f64 {
        let x = context.as_array();
        let ax = self.a_inv_times(x);
        let quad: f64 = x.iter().zip(ax.iter()).map(|(a, b)| a * b).sum();
        quad.max(0.0).sqrt()
    }

    pub fn reward_estimate(&self, context: &ContextVector) -> f64 {
        context.dot(&self.theta)
    }

    pub fn safety_estimate(&self, context: &ContextVector) -> f64 {
        context.dot(&self.phi)
    }

    /// Apply one resolved outcome. Non-finite rewards are rejected and
    /// leave the state untouched.
    pub fn update(&mut self, context: &ContextVector, reward: f64, safety_false_negative: bool) -> bool {
        if !reward.is_finite() {
            warn!(agent = %self.agent_name, reward, "Rejecting non-finite reward");
            return false;
        }
        let x = context.as_array();
        let ax = self.a_inv_times(x);
        let denom = 1.0 + x.iter().zip(ax.iter()).map(|(a, b)| a * b).sum::<f64>();
        if !denom.is_finite() || denom <= 0.0 {
            warn!(agent = %self.agent_name, denom, "Skipping degenerate update");
            return false;
        }

        // A⁻¹ is symmetric, so xᵀA⁻¹ = (A⁻¹x)ᵀ
        for i in 0..CONTEXT_DIM {
            for j in 0..CONTEXT_DIM {
                self.a_inv[i][j] -= ax[i] * ax[j] / denom;
            }
        }

        let safety = if safety_false_negative { 1.0 } else { 0.0 };
        for i in 0..CONTEXT_DIM {
            self.b_reward[i] += reward * x[i];
            self.b_safety[i] += safety * x[i];
        }
        self.theta = self.a_inv_times(&self.b_reward);
        self.phi = self.a_inv_times(&self.b_safety);

        self.observations += 1;
        self.version += 1;
        self.updated_at = Utc::now();
        true
    }
}

// ============================================================================
// Decision stages
// ============================================================================

/// Validated context, not yet scored
#[derive(Debug, Clone)]
pub struct FeaturesReady {
    context: ContextVector,
    unlocked: bool,
}

impl FeaturesReady {
    pub fn new(context: ContextVector, unlocked: bool) -> Self {
        Self { context, unlocked }
    }
}

/// Point estimates and upper confidence bounds
#[derive(Debug, Clone)]
pub struct Scored {
    ready: FeaturesReady,
    pub reward_estimate: f64,
    pub safety_estimate: f64,
    pub reward_ucb: f64,
    pub safety_ucb: f64,
    pub critic_version: u64,
}

/// Scores with the gate applied
#[derive(Debug, Clone)]
pub struct Gated {
    scored: Scored,
    action: Action,
    reasons: Vec<EscalationReason>,
}

impl Gated {
    pub fn action(&self) -> Action {
        self.action
    }

    pub fn decide(self) -> CriticDecision {
        CriticDecision {
            reward_estimate: self.scored.reward_estimate,
            safety_estimate: self.scored.safety_estimate,
            reward_ucb: self.scored.reward_ucb,
            safety_ucb: self.scored.safety_ucb,
            action: self.action,
            unlocked: self.scored.ready.unlocked,
            critic_version: self.scored.critic_version,
            reasons: self.reasons,
        }
    }
}

/// Final critic output for one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticDecision {
    pub reward_estimate: f64,
    pub safety_estimate: f64,
    pub reward_ucb: f64,
    pub safety_ucb: f64,
    pub action: Action,
    pub unlocked: bool,
    pub critic_version: u64,
    pub reasons: Vec<EscalationReason>,
}

// ============================================================================
// Critic
// ============================================================================

#[derive(Debug, Clone)]
pub struct SafeLucbCritic {
    reward_beta: f64,
    safety_beta: f64,
    delta_t: f64,
}

impl SafeLucbCritic {
    pub fn new(critic: &CriticConfig, safety: &SafetyConfig) -> Self {
        Self {
            reward_beta: critic.reward_beta,
            safety_beta: critic.safety_beta,
            delta_t: safety.delta_t,
        }
    }

    pub fn delta_t(&self) -> f64 {
        self.delta_t
    }

    pub fn score(&self, state: &CriticModelState, ready: FeaturesReady) -> Scored {
        let width = state.confidence_width(&ready.context);
        let reward_estimate = state.reward_estimate(&ready.context);
        let safety_estimate = state.safety_estimate(&ready.context);
        Scored {
            reward_ucb: reward_estimate + self.reward_beta * width,
            safety_ucb: (safety_estimate + self.safety_beta * width).max(0.0),
            reward_estimate,
            safety_estimate,
            critic_version: state.version,
            ready,
        }
    }

    /// AUTOMATE iff the stratum is unlocked and safetyUCB <= δ_t. The reward
    /// estimate plays no part.
    pub fn gate(&self, scored: Scored) -> Gated {
        let mut reasons = Vec::new();
        if !scored.ready.unlocked {
            reasons.push(EscalationReason::StratumLocked);
        }
        if !(scored.safety_ucb.is_finite() && scored.safety_ucb <= self.delta_t) {
            reasons.push(EscalationReason::SafetyBoundExceeded);
        }
        let action = if reasons.is_empty() {
            Action::Automate
        } else {
            Action::Escalate
        };
        Gated {
            scored,
            action,
            reasons,
        }
    }

    pub fn evaluate(&self, state: &CriticModelState, context: ContextVector, unlocked: bool) -> CriticDecision {
        let ready = FeaturesReady::new(context, unlocked);
        let scored = self.score(state, ready);
        self.gate(scored).decide()
    }
}

// ============================================================================
// Shared handle
// ============================================================================

/// Copy-on-write owner of the critic state
pub struct CriticHandle {
    current: RwLock<Arc<CriticModelState>>,
    writer: Mutex<()>,
}

impl CriticHandle {
    pub fn new(state: CriticModelState) -> Self {
        Self {
            current: RwLock::new(Arc::new(state)),
            writer: Mutex::new(()),
        }
    }

    pub fn from_config(config: &CriticConfig) -> Self {
        Self::new(CriticModelState::new(config.agent_name.clone(), config.lambda))
    }

    pub fn snapshot(&self) -> Arc<CriticModelState> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    fn swap(&self, next: Arc<CriticModelState>) {
        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = next;
    }

    /// Apply one outcome and publish the new snapshot
    pub fn apply(&self, context: &ContextVector, reward: f64, safety_false_negative: bool) -> Arc<CriticModelState> {
        let _writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (*self.snapshot()).clone();
        if !next.update(context, reward, safety_false_negative) {
            return self.snapshot();
        }
        let next = Arc::new(next);
        self.swap(Arc::clone(&next));
        next
    }

    /// Replace the state wholesale (checkpoint restore)
    pub fn install(&self, state: CriticModelState) {
        let _writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        info!(
            agent = %state.agent_name,
            version = state.version,
            observations = state.observations,
            "Installing critic state"
        );
        self.swap(Arc::new(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn context(values: [f64; CONTEXT_DIM]) -> ContextVector {
        ContextVector::from_slice(&values).unwrap()
    }

    fn typical() -> ContextVector {
        context([0.9, 0.05, 0.2, 0.0, 0.8, 0.9, 0.35, 0.3, 0.04, 0.05, 0.42, 0.3])
    }

    fn critic() -> SafeLucbCritic {
        SafeLucbCritic::new(&CriticConfig::default(), &SafetyConfig::default())
    }

    fn trained(n: usize) -> CriticModelState {
        let mut state = CriticModelState::new("test", 1.0);
        for _ in 0..n {
            state.update(&typical(), 1.0, false);
        }
        state
    }

    #[test]
    fn test_fresh_critic_escalates() {
        let state = CriticModelState::new("test", 1.0);
        let decision = critic().evaluate(&state, typical(), true);
        assert_eq!(decision.action, Action::Escalate);
        assert!(decision.safety_ucb > 0.001);
        assert_eq!(decision.reasons, vec![EscalationReason::SafetyBoundExceeded]);
    }

    #[test]
    fn test_trained_critic_automates_unlocked_only() {
        let state = trained(1000);
        let decision = critic().evaluate(&state, typical(), true);
        assert_eq!(decision.action, Action::Automate);
        assert!(decision.safety_ucb <= 0.001);
        assert!(decision.reward_estimate > 0.9);

        let locked = critic().evaluate(&state, typical(), false);
        assert_eq!(locked.action, Action::Escalate);
        assert_eq!(locked.reasons, vec![EscalationReason::StratumLocked]);
    }

    #[test]
    fn test_new_direction_escalates_with_same_reward() {
        let state = trained(1000);
        let mut hazard = *typical().as_array();
        hazard[3] = 1.0;
        let hazard = context(hazard);

        let base = critic().evaluate(&state, typical(), true);
        let flagged = critic().evaluate(&state, hazard, true);
        assert_eq!(flagged.action, Action::Escalate);
        assert!(flagged.safety_ucb > 0.001);
        assert!((flagged.reward_estimate - base.reward_estimate).abs() < 1e-9);
    }

    #[test]
    fn test_sfn_outcomes_raise_safety_estimate() {
        let mut state = trained(100);
        let before = state.safety_estimate(&typical());
        for _ in 0..10 {
            state.update(&typical(), 0.0, true);
        }
        assert!(state.safety_estimate(&typical()) > before);
        assert_eq!(state.observations, 110);
        assert_eq!(state.version, 110);
    }

    #[test]
    fn test_non_finite_reward_rejected() {
        let mut state = CriticModelState::new("test", 1.0);
        assert!(!state.update(&typical(), f64::NAN, false));
        assert_eq!(state.observations, 0);
    }

    #[test]
    fn test_handle_snapshots_are_isolated() {
        let handle = CriticHandle::from_config(&CriticConfig::default());
        let before = handle.snapshot();
        let after = handle.apply(&typical(), 1.0, false);
        assert_eq!(before.version, 0);
        assert_eq!(after.version, 1);
        assert_eq!(handle.version(), 1);
        assert_eq!(before.observations, 0);
    }

    proptest! {
        #[test]
        fn prop_bonus_shrinks_with_observations(
            values in proptest::collection::vec(0.0f64..1.0, CONTEXT_DIM),
            steps in 1usize..40,
        ) {
            let x = ContextVector::from_slice(&values).unwrap();
            let mut state = CriticModelState::new("prop", 1.0);
            let mut last = state.confidence_width(&x);
            for _ in 0..steps {
                state.update(&x, 0.5, false);
                let width = state.confidence_width(&x);
                prop_assert!(width <= last + 1e-12);
                last = width;
            }
        }

        #[test]
        fn prop_gate_never_automates_unsafe(
            values in proptest::collection::vec(0.0f64..1.0, CONTEXT_DIM),
            unlocked in any::<bool>(),
            sfn in any::<bool>(),
            n in 0usize..50,
        ) {
            let x = ContextVector::from_slice(&values).unwrap();
            let mut state = CriticModelState::new("prop", 1.0);
            for _ in 0..n {
                state.update(&x, 1.0, sfn);
            }
            let decision = critic().evaluate(&state, x, unlocked);
            if decision.action == Action::Automate {
                prop_assert!(unlocked);
                prop_assert!(decision.safety_ucb <= 0.001);
            }
        }
    }
}
