//! Outcome Feedback Loop
//!
//! Resolved outcomes update the critic. The update rule is incremental and
//! order-sensitive, so every update goes through one bounded crossbeam
//! queue drained by a single learner thread, in the order outcomes were
//! resolved. The learner is the only writer of `CriticHandle`; decision
//! requests keep reading snapshots while it works.
//!
//! Every `persist_every` applied updates, and on shutdown, the learner
//! hands a bincode checkpoint of the critic to the persistence writer.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, CriticCheckpoint, LearnerCheckpoint};
use crate::context::ContextVector;
use crate::critic::CriticHandle;
use crate::error::EngineError;
use crate::writer::{PersistenceWriter, WriteOp};

/// One critic update derived from an outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerUpdate {
    pub decision_id: Uuid,
    /// Context the decision was scored with
    pub context: ContextVector,
    pub realized_reward: f64,
    pub safety_false_negative: bool,
}

#[derive(Debug, Default)]
pub struct LearnerStats {
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped: AtomicU64,
    pub safety_false_negatives: AtomicU64,
    pub checkpoints: AtomicU64,
}

impl LearnerStats {
    pub fn snapshot(&self) -> LearnerCheckpoint {
        LearnerCheckpoint {
            total_received: self.received.load(Ordering::Relaxed),
            total_applied: self.applied.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            safety_false_negatives: self.safety_false_negatives.load(Ordering::Relaxed),
        }
    }

    fn restore(&self, from: &LearnerCheckpoint) {
        self.received.store(from.total_received, Ordering::Relaxed);
        self.applied.store(from.total_applied, Ordering::Relaxed);
        self.rejected.store(from.total_rejected, Ordering::Relaxed);
        self.safety_false_negatives
            .store(from.safety_false_negatives, Ordering::Relaxed);
    }
}

enum Message {
    Update(LearnerUpdate),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub struct OutcomeLearner {
    sender: Sender<Message>,
    stats: Arc<LearnerStats>,
    critic: Arc<CriticHandle>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OutcomeLearner {
    /// Start the learner thread. `writer` receives periodic checkpoints.
    pub fn spawn(
        critic: Arc<CriticHandle>,
        writer: Option<Arc<PersistenceWriter>>,
        capacity: usize,
        persist_every: u64,
    ) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        let stats = Arc::new(LearnerStats::default());

        let worker = {
            let critic = critic.clone();
            let stats = stats.clone();
            std::thread::Builder::new()
                .name("outcome-learner".to_string())
                .spawn(move || {
                    learner_loop(receiver, critic, writer, stats, CheckpointManager::new(persist_every));
                })
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to start outcome learner thread");
                None
            }
        };

        Self {
            sender,
            stats,
            critic,
            worker: std::sync::Mutex::new(worker),
        }
    }

    pub fn stats(&self) -> &LearnerStats {
        &self.stats
    }

    pub fn critic(&self) -> &Arc<CriticHandle> {
        &self.critic
    }

    /// Seed counters from a restored checkpoint
    pub fn restore_stats(&self, from: &LearnerCheckpoint) {
        self.stats.restore(from);
    }

    /// Queue an update (non-blocking)
    pub fn submit(&self, update: LearnerUpdate) -> Result<(), EngineError> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        match self.sender.try_send(Message::Update(update)) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Outcome queue full; critic update dropped");
                Err(EngineError::QueueClosed)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::QueueClosed)
            }
        }
    }

    /// Hand a control message to the learner from the blocking pool; the
    /// queue may be full and crossbeam's `send` parks the calling thread.
    async fn send_control(&self, message: Message) -> bool {
        let sender = self.sender.clone();
        match tokio::task::spawn_blocking(move || sender.send(message).is_ok()).await {
            Ok(sent) => sent,
            Err(e) => {
                error!(error = %e, "Learner control send failed");
                false
            }
        }
    }

    /// Wait until every update submitted before this call is applied
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.send_control(Message::Flush(ack)).await {
            let _ = done.await;
        }
    }

    /// Apply pending updates, write a final checkpoint and stop the thread
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.send_control(Message::Shutdown(ack)).await {
            let _ = done.await;
        }
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                _ => error!("Outcome learner thread panicked"),
            }
        }
    }
}

fn persist(critic: &CriticHandle, writer: Option<&PersistenceWriter>, stats: &LearnerStats) {
    let Some(writer) = writer else {
        return;
    };
    let state = critic.snapshot();
    match CriticCheckpoint::capture(&state, stats.snapshot()).to_bytes() {
        Ok(bytes) => {
            let op = WriteOp::CriticState {
                agent_name: state.agent_name.clone(),
                bytes,
            };
            if writer.try_enqueue(op).is_ok() {
                stats.checkpoints.fetch_add(1, Ordering::Relaxed);
                debug!(version = state.version, "Critic checkpoint queued");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize critic checkpoint"),
    }
}

fn learner_loop(
    receiver: Receiver<Message>,
    critic: Arc<CriticHandle>,
    writer: Option<Arc<PersistenceWriter>>,
    stats: Arc<LearnerStats>,
    mut checkpoints: CheckpointManager,
) {
    info!("Outcome learner started");

    while let Ok(message) = receiver.recv() {
        match message {
            Message::Update(update) => {
                let before = critic.version();
                let state = critic.apply(
                    &update.context,
                    update.realized_reward,
                    update.safety_false_negative,
                );
                if state.version == before {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                stats.applied.fetch_add(1, Ordering::Relaxed);
                if update.safety_false_negative {
                    stats.safety_false_negatives.fetch_add(1, Ordering::Relaxed);
                    warn!(decision_id = %update.decision_id, "Safety false negative recorded");
                }
                if checkpoints.should_persist(state.version) {
                    persist(&critic, writer.as_deref(), &stats);
                    checkpoints.mark_persisted(state.version);
                }
            }
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
            Message::Shutdown(ack) => {
                persist(&critic, writer.as_deref(), &stats);
                let _ = ack.send(());
                break;
            }
        }
    }

    info!(applied = stats.applied.load(Ordering::Relaxed), "Outcome learner stopped");
}
