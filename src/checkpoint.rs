//! Critic Checkpoints
//!
//! The critic state is serialized with bincode and upserted into the store
//! under its agent name. Checkpoints carry a format version; anything newer
//! than this build understands is refused rather than half-read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::critic::CriticModelState;
use crate::error::CheckpointError;

/// Version for checkpoint format migrations
pub const CHECKPOINT_VERSION: u32 = 1;

/// Counters from the outcome learner
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerCheckpoint {
    pub total_received: u64,
    pub total_applied: u64,
    pub total_rejected: u64,
    pub safety_false_negatives: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticCheckpoint {
    /// Format version
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub state: CriticModelState,
    pub learner: LearnerCheckpoint,
}

impl CriticCheckpoint {
    pub fn capture(state: &CriticModelState, learner: LearnerCheckpoint) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            created_at: Utc::now(),
            state: state.clone(),
            learner,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CheckpointError> {
        bincode::serialize(self).map_err(|e| CheckpointError::SerializationFailed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let checkpoint: CriticCheckpoint = bincode::deserialize(bytes)
            .map_err(|e| CheckpointError::DeserializationFailed(e.to_string()))?;

        if checkpoint.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: checkpoint.version,
                max_supported: CHECKPOINT_VERSION,
            });
        }
        checkpoint.validate()?;
        Ok(checkpoint)
    }

    /// A restored state must be entirely finite
    fn validate(&self) -> Result<(), CheckpointError> {
        let s = &self.state;
        let finite = s
            .theta
            .iter()
            .chain(s.phi.iter())
            .chain(s.b_reward.iter())
            .chain(s.b_safety.iter())
            .chain(s.a_inv.iter().flatten())
            .all(|v| v.is_finite());
        if !finite {
            return Err(CheckpointError::InvalidState(format!(
                "non-finite parameters in critic `{}`",
                s.agent_name
            )));
        }
        if s.agent_name.is_empty() {
            return Err(CheckpointError::InvalidState("empty agent name".to_string()));
        }
        Ok(())
    }
}

/// Decides when the learner should persist
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    persist_every: u64,
    last_persisted_version: u64,
    checkpoints_written: u64,
}

impl CheckpointManager {
    pub fn new(persist_every: u64) -> Self {
        Self {
            persist_every: persist_every.max(1),
            last_persisted_version: 0,
            checkpoints_written: 0,
        }
    }

    pub fn should_persist(&self, version: u64) -> bool {
        version >= self.last_persisted_version + self.persist_every
    }

    pub fn mark_persisted(&mut self, version: u64) {
        self.last_persisted_version = version;
        self.checkpoints_written += 1;
    }

    pub fn checkpoints_written(&self) -> u64 {
        self.checkpoints_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextVector;

    fn trained_state() -> CriticModelState {
        let mut state = CriticModelState::new("safe-lucb", 1.0);
        let x = ContextVector::from_slice(&[0.5; 12]).unwrap();
        for _ in 0..5 {
            state.update(&x, 1.0, false);
        }
        state
    }

    #[test]
    fn test_checkpoint_restores_state() {
        let state = trained_state();
        let learner = LearnerCheckpoint {
            total_received: 5,
            total_applied: 5,
            ..LearnerCheckpoint::default()
        };
        let bytes = CriticCheckpoint::capture(&state, learner).to_bytes().unwrap();
        let restored = CriticCheckpoint::from_bytes(&bytes).unwrap();
        assert_eq!(restored.state, state);
        assert_eq!(restored.learner.total_applied, 5);
    }

    #[test]
    fn test_rejects_future_version() {
        let mut checkpoint = CriticCheckpoint::capture(&trained_state(), LearnerCheckpoint::default());
        checkpoint.version = CHECKPOINT_VERSION + 1;
        let bytes = checkpoint.to_bytes().unwrap();
        assert!(matches!(
            CriticCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_rejects_corrupt_bytes_and_nan_state() {
        assert!(CriticCheckpoint::from_bytes(&[1, 2, 3]).is_err());

        let mut state = trained_state();
        state.theta[0] = f64::NAN;
        let bytes = CriticCheckpoint::capture(&state, LearnerCheckpoint::default())
            .to_bytes()
            .unwrap();
        assert!(matches!(
            CriticCheckpoint::from_bytes(&bytes),
            Err(CheckpointError::InvalidState(_))
        ));
    }

    #[test]
    fn test_manager_cadence() {
        let mut manager = CheckpointManager::new(50);
        assert!(!manager.should_persist(49));
        assert!(manager.should_persist(50));
        manager.mark_persisted(50);
        assert!(!manager.should_persist(99));
        assert!(manager.should_persist(100));
        assert_eq!(manager.checkpoints_written(), 1);
    }
}
