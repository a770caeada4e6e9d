//! Non-Blocking Persistence Writer
//!
//! Decisions and ground-truth records are handed to a bounded queue and
//! written by a background task with exponential-backoff retries. The
//! decision path never waits on a write: a full queue or an exhausted retry
//! budget drops the record and logs it at `error!`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::StoreError;
use crate::records::{CalibrationDataPoint, CoverageCheckpoint, Decision, HistoricalValidation, Outcome};
use crate::store::DecisionStore;

#[derive(Debug, Clone)]
pub enum WriteOp {
    Decision(Decision),
    Outcome(Outcome),
    Validation(HistoricalValidation),
    Calibration(CalibrationDataPoint),
    Coverage(CoverageCheckpoint),
    CriticState { agent_name: String, bytes: Vec<u8> },
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decision(_) => "decision",
            Self::Outcome(_) => "outcome",
            Self::Validation(_) => "validation",
            Self::Calibration(_) => "calibration",
            Self::Coverage(_) => "coverage",
            Self::CriticState { .. } => "critic_state",
        }
    }
}

enum Message {
    Write(WriteOp),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub channel_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_ms: u64,
}

impl From<&RuntimeConfig> for WriterConfig {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            channel_capacity: runtime.write_queue_capacity,
            max_retries: runtime.write_max_retries,
            retry_base_delay_ms: runtime.write_retry_base_delay_ms,
            timeout_ms: runtime.store_timeout_ms,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

#[derive(Debug, Default)]
pub struct WriterStats {
    pub written: AtomicU64,
    pub retried: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct PersistenceWriter {
    tx: mpsc::Sender<Message>,
    stats: Arc<WriterStats>,
}

impl PersistenceWriter {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn(store: Arc<dyn DecisionStore>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stats = Arc::new(WriterStats::default());
        let stats_clone = stats.clone();

        tokio::spawn(async move {
            Self::worker(rx, store, config, stats_clone).await;
        });

        Self { tx, stats }
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Queue a write without waiting
    pub fn try_enqueue(&self, op: WriteOp) -> Result<(), WriteOp> {
        match self.tx.try_send(Message::Write(op)) {
            Ok(_) => Ok(()),
            Err(mpsc::error::TrySendError::Full(Message::Write(op)))
            | Err(mpsc::error::TrySendError::Closed(Message::Write(op))) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(kind = op.kind(), "Write queue unavailable; record dropped");
                Err(op)
            }
            Err(_) => Ok(()),
        }
    }

    /// Wait until every write queued before this call has been attempted
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Message::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn worker(
        mut rx: mpsc::Receiver<Message>,
        store: Arc<dyn DecisionStore>,
        config: WriterConfig,
        stats: Arc<WriterStats>,
    ) {
        info!(capacity = config.channel_capacity, "Persistence writer started");

        while let Some(message) = rx.recv().await {
            match message {
                Message::Write(op) => Self::write_with_retry(store.as_ref(), op, &config, &stats).await,
                Message::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        info!("Persistence writer stopped");
    }

    async fn write_once(store: &dyn DecisionStore, op: &WriteOp, timeout: Duration) -> Result<(), StoreError> {
        let fut = async {
            match op.clone() {
                WriteOp::Decision(d) => store.append_decision(d).await,
                WriteOp::Outcome(o) => store.append_outcome(o).await,
                WriteOp::Validation(v) => store.append_validation(v).await,
                WriteOp::Calibration(p) => store.append_calibration_point(p).await,
                WriteOp::Coverage(c) => store.append_coverage_checkpoint(c).await,
                WriteOp::CriticState { agent_name, bytes } => {
                    store.upsert_critic_state(&agent_name, bytes).await
                }
            }
        };
        crate::store::with_timeout(op.kind(), timeout, fut).await
    }

    async fn write_with_retry(store: &dyn DecisionStore, op: WriteOp, config: &WriterConfig, stats: &WriterStats) {
        let timeout = Duration::from_millis(config.timeout_ms);

        for attempt in 0..=config.max_retries {
            match Self::write_once(store, &op, timeout).await {
                Ok(()) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                    debug!(kind = op.kind(), attempt, "Record persisted");
                    return;
                }
                Err(e) if !e.is_retryable() => {
                    warn!(kind = op.kind(), error = %e, "Write rejected; not retrying");
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    warn!(kind = op.kind(), attempt, error = %e, "Write failed");
                }
            }

            if attempt < config.max_retries {
                stats.retried.fetch_add(1, Ordering::Relaxed);
                let delay = config.retry_base_delay_ms * (1 << attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        stats.failed.fetch_add(1, Ordering::Relaxed);
        error!(kind = op.kind(), "Record lost after max retries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::stratum::{AgeBin, Stratum};
    use chrono::Utc;

    fn config() -> WriterConfig {
        WriterConfig {
            channel_capacity: 16,
            max_retries: 3,
            retry_base_delay_ms: 1,
            timeout_ms: 100,
        }
    }

    fn validation() -> WriteOp {
        WriteOp::Validation(HistoricalValidation {
            stratum: Stratum::leaf("residential", AgeBin::New, "hull"),
            context_hash: 7,
            safety_false_negative: false,
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_writes(2);
        let writer = PersistenceWriter::spawn(store.clone(), config());

        writer.try_enqueue(validation()).unwrap();
        writer.flush().await;

        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 1);
        assert_eq!(writer.stats().retried.load(Ordering::Relaxed), 2);
        let stratum = Stratum::leaf("residential", AgeBin::New, "hull");
        assert_eq!(store.validations(&stratum).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_writes(10);
        let writer = PersistenceWriter::spawn(store.clone(), config());

        writer.try_enqueue(validation()).unwrap();
        writer.flush().await;

        assert_eq!(writer.stats().written.load(Ordering::Relaxed), 0);
        assert_eq!(writer.stats().failed.load(Ordering::Relaxed), 1);
        assert_eq!(writer.stats().retried.load(Ordering::Relaxed), 3);
    }
}
