//! Work proof recorder: detached, retrying settlement to the ledger
//!
//! `enqueue` returns as soon as the proof is queued. A single worker drains the
//! queue in order, so ledger nonces are never contended. Each task id settles
//! at most once; re-enqueueing a queued or settled task is a no-op.
//!
//! Finished statuses are kept for a retention window (and up to a count), and
//! per-caller tallies up to a count, least recently active evicted first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use utoipa::ToSchema;

use super::contract::{LedgerError, UserWorkload, WorkLedger};
use super::proof::WorkProof;
use crate::identity::CallerIdentity;
use crate::prelude::{unix_millis, RwArc};

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    pub backoff: Duration,
    /// Bound on one submit (broadcast plus confirmation)
    pub attempt_timeout: Duration,
    /// How long a settled or failed status stays queryable
    pub retention: Duration,
    /// Cap on finished statuses kept, regardless of age
    pub max_finished: usize,
    /// Cap on per-caller tallies
    pub max_callers: usize,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(120),
            retention: Duration::from_secs(3600),
            max_finished: 10_000,
            max_callers: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SettlementStatus {
    Queued,
    Submitting {
        attempt: u32,
    },
    #[serde(rename_all = "camelCase")]
    Settled {
        #[schema(value_type = String)]
        tx_hash: B256,
        block_number: u64,
    },
    Failed {
        error: String,
        attempts: u32,
    },
}

impl SettlementStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, SettlementStatus::Queued | SettlementStatus::Submitting { .. })
    }
}

/// Per-caller activity kept locally, keyed by canonical caller key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallerTally {
    pub canonical_uuid: String,
    pub total_tasks: u64,
    pub settled_tasks: u64,
    pub last_activity_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Settlement worker has stopped")]
    WorkerStopped,
}

struct SettlementJob {
    proof: WorkProof,
    caller_key: String,
}

struct Tracked {
    status: SettlementStatus,
    finished_at: Option<Instant>,
}

/// Status per task plus the order in which tasks finished
#[derive(Default)]
struct StatusBook {
    tasks: HashMap<String, Tracked>,
    finished: VecDeque<(Instant, String)>,
}

impl StatusBook {
    fn get(&self, task_id: &str) -> Option<&SettlementStatus> {
        self.tasks.get(task_id).map(|t| &t.status)
    }

    fn set(&mut self, task_id: &str, status: SettlementStatus, settings: &RecorderSettings) {
        let now = Instant::now();
        let finished_at = (!status.is_pending()).then_some(now);
        if finished_at.is_some() {
            self.finished.push_back((now, task_id.to_string()));
        }
        self.tasks.insert(task_id.to_string(), Tracked { status, finished_at });
        self.prune(now, settings);
    }

    /// Forget finished tasks past the retention window or beyond the cap
    fn prune(&mut self, now: Instant, settings: &RecorderSettings) {
        while let Some((at, _)) = self.finished.front() {
            let expired = now.saturating_duration_since(*at) >= settings.retention;
            if !expired && self.finished.len() <= settings.max_finished {
                break;
            }
            let Some((at, task_id)) = self.finished.pop_front() else {
                break;
            };
            // Skip entries superseded by a later re-queue of the same task
            if self.tasks.get(&task_id).is_some_and(|t| t.finished_at == Some(at)) {
                self.tasks.remove(&task_id);
            }
        }
    }
}

#[derive(Clone)]
pub struct WorkProofRecorder {
    queue: mpsc::UnboundedSender<SettlementJob>,
    book: RwArc<StatusBook>,
    tallies: RwArc<HashMap<String, CallerTally>>,
    ledger: Arc<dyn WorkLedger>,
    settings: Arc<RecorderSettings>,
}

impl WorkProofRecorder {
    /// Create the recorder and spawn its settlement worker
    pub fn start(ledger: Arc<dyn WorkLedger>, settings: RecorderSettings) -> (Self, JoinHandle<()>) {
        let (queue, rx) = mpsc::unbounded_channel();
        let recorder = Self {
            queue,
            book: Arc::new(RwLock::new(StatusBook::default())),
            tallies: Arc::new(RwLock::new(HashMap::new())),
            ledger,
            settings: Arc::new(settings),
        };
        let worker = tokio::spawn(recorder.clone().run(rx));
        (recorder, worker)
    }

    pub fn ledger_description(&self) -> String {
        self.ledger.describe()
    }

    /// Queue a proof for settlement; returns the task's status afterwards
    pub async fn enqueue(&self, proof: WorkProof, caller: &CallerIdentity) -> Result<SettlementStatus, RecorderError> {
        {
            let mut book = self.book.write().await;
            match book.get(&proof.task_id) {
                Some(existing) if !matches!(existing, SettlementStatus::Failed { .. }) => {
                    return Ok(existing.clone());
                }
                Some(_) => {
                    tracing::info!(task_id = %proof.task_id, "Re-queueing failed settlement");
                }
                None => {
                    self.tally_task(&caller.canonical_uuid, proof.timestamp_ms).await;
                }
            }
            book.set(&proof.task_id, SettlementStatus::Queued, &self.settings);
        }

        let task_id = proof.task_id.clone();
        let job = SettlementJob {
            proof,
            caller_key: caller.canonical_uuid.clone(),
        };
        if self.queue.send(job).is_err() {
            let failed = SettlementStatus::Failed {
                error: RecorderError::WorkerStopped.to_string(),
                attempts: 0,
            };
            self.set_status(&task_id, failed).await;
            return Err(RecorderError::WorkerStopped);
        }

        Ok(SettlementStatus::Queued)
    }

    pub async fn status(&self, task_id: &str) -> Option<SettlementStatus> {
        self.book.read().await.get(task_id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.book.read().await.tasks.values().filter(|t| t.status.is_pending()).count()
    }

    /// Number of task statuses currently held
    pub async fn tracked_count(&self) -> usize {
        self.book.read().await.tasks.len()
    }

    pub async fn tally(&self, canonical_uuid: &str) -> CallerTally {
        self.tallies
            .read()
            .await
            .get(canonical_uuid)
            .cloned()
            .unwrap_or_else(|| CallerTally {
                canonical_uuid: canonical_uuid.to_string(),
                ..Default::default()
            })
    }

    pub async fn caller_count(&self) -> usize {
        self.tallies.read().await.len()
    }

    /// Aggregate kept by the ledger contract for `user`
    pub async fn user_workload(&self, user: Address) -> Result<UserWorkload, LedgerError> {
        self.ledger.user_workload(user).await
    }

    async fn tally_task(&self, key: &str, at_ms: u64) {
        let mut tallies = self.tallies.write().await;
        if !tallies.contains_key(key) && tallies.len() >= self.settings.max_callers {
            let idlest = tallies
                .values()
                .min_by_key(|t| t.last_activity_ms)
                .map(|t| t.canonical_uuid.clone());
            if let Some(idlest) = idlest {
                tallies.remove(&idlest);
            }
        }
        let tally = tallies.entry(key.to_string()).or_insert_with(|| CallerTally {
            canonical_uuid: key.to_string(),
            ..Default::default()
        });
        tally.total_tasks += 1;
        tally.last_activity_ms = tally.last_activity_ms.max(at_ms);
    }

    async fn set_status(&self, task_id: &str, status: SettlementStatus) {
        self.book.write().await.set(task_id, status, &self.settings);
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<SettlementJob>) {
        tracing::info!(ledger = %self.ledger.describe(), "Settlement worker started");
        while let Some(job) = rx.recv().await {
            // A task settled by an earlier job for the same id is never resubmitted
            if let Some(SettlementStatus::Settled { .. }) = self.status(&job.proof.task_id).await {
                continue;
            }
            self.settle(job).await;
        }
        tracing::info!("Settlement worker stopped");
    }

    async fn settle(&self, job: SettlementJob) {
        let settings = self.settings.clone();
        let task_id = job.proof.task_id.clone();
        let max_attempts = settings.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            self.set_status(&task_id, SettlementStatus::Submitting { attempt }).await;

            let outcome = tokio::time::timeout(settings.attempt_timeout, self.ledger.submit(&job.proof)).await;
            match outcome {
                Ok(Ok(receipt)) => {
                    tracing::info!(
                        task_id = %task_id,
                        tx_hash = %receipt.tx_hash,
                        block = receipt.block_number,
                        attempt,
                        "Work proof settled"
                    );
                    self.set_status(
                        &task_id,
                        SettlementStatus::Settled {
                            tx_hash: receipt.tx_hash,
                            block_number: receipt.block_number,
                        },
                    )
                    .await;
                    if let Some(tally) = self.tallies.write().await.get_mut(&job.caller_key) {
                        tally.settled_tasks += 1;
                        tally.last_activity_ms = tally.last_activity_ms.max(unix_millis());
                    }
                    return;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("attempt timed out after {:?}", settings.attempt_timeout),
            }

            tracing::warn!(task_id = %task_id, attempt, max_attempts, error = %last_error, "Work proof submission failed");

            if attempt < max_attempts {
                let delay = settings.backoff.saturating_mul(1u32 << (attempt - 1).min(16));
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(task_id = %task_id, attempts = max_attempts, error = %last_error, "Work proof settlement abandoned");
        self.set_status(
            &task_id,
            SettlementStatus::Failed {
                error: last_error,
                attempts: max_attempts,
            },
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::contract::{LedgerReceipt, MemoryLedger};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` submits, then settles
    struct FlakyLedger {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl WorkLedger for FlakyLedger {
        async fn submit(&self, proof: &WorkProof) -> Result<LedgerReceipt, LedgerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(LedgerError::Decode("node unavailable".to_string()));
            }
            Ok(LedgerReceipt {
                tx_hash: proof.proof_hash,
                block_number: 100 + n as u64,
            })
        }

        async fn user_workload(&self, _user: Address) -> Result<UserWorkload, LedgerError> {
            Ok(UserWorkload::default())
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn fast_settings(max_attempts: u32) -> RecorderSettings {
        RecorderSettings {
            max_attempts,
            backoff: Duration::from_millis(10),
            attempt_timeout: Duration::from_secs(5),
            ..RecorderSettings::default()
        }
    }

    async fn wait_until_done(recorder: &WorkProofRecorder, task_id: &str) -> SettlementStatus {
        for _ in 0..1000 {
            match recorder.status(task_id).await {
                Some(s) if !s.is_pending() => return s,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        panic!("settlement of {} never finished", task_id);
    }

    #[tokio::test]
    async fn test_enqueue_settles_in_background() {
        let ledger = Arc::new(MemoryLedger::new());
        let (recorder, _worker) = WorkProofRecorder::start(ledger.clone(), fast_settings(3));
        let caller = CallerIdentity::new("alice");
        let proof = WorkProof::build("t1", "search", b"in", b"out", 5, unix_millis());

        let status = recorder.enqueue(proof.clone(), &caller).await.unwrap();
        assert_eq!(status, SettlementStatus::Queued);

        match wait_until_done(&recorder, "t1").await {
            SettlementStatus::Settled { tx_hash, .. } => assert_eq!(tx_hash, proof.proof_hash),
            other => panic!("unexpected {:?}", other),
        }
        assert!(ledger.recorded("t1").await.is_some());

        let tally = recorder.tally(&caller.canonical_uuid).await;
        assert_eq!(tally.total_tasks, 1);
        assert_eq!(tally.settled_tasks, 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let ledger = Arc::new(FlakyLedger { failures: 2, calls: AtomicU32::new(0) });
        let (recorder, _worker) = WorkProofRecorder::start(ledger.clone(), fast_settings(5));
        let proof = WorkProof::build("t1", "search", b"", b"", 1, 1);
        recorder.enqueue(proof, &CallerIdentity::anonymous()).await.unwrap();

        assert!(matches!(wait_until_done(&recorder, "t1").await, SettlementStatus::Settled { .. }));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let ledger = Arc::new(FlakyLedger { failures: u32::MAX, calls: AtomicU32::new(0) });
        let (recorder, _worker) = WorkProofRecorder::start(ledger.clone(), fast_settings(3));
        let proof = WorkProof::build("t1", "search", b"", b"", 1, 1);
        recorder.enqueue(proof, &CallerIdentity::anonymous()).await.unwrap();

        match wait_until_done(&recorder, "t1").await {
            SettlementStatus::Failed { attempts, error } => {
                assert_eq!(attempts, 3);
                assert!(error.contains("node unavailable"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_idempotent() {
        let ledger = Arc::new(FlakyLedger { failures: 0, calls: AtomicU32::new(0) });
        let (recorder, _worker) = WorkProofRecorder::start(ledger.clone(), fast_settings(3));
        let caller = CallerIdentity::new("bob");
        let proof = WorkProof::build("t1", "search", b"", b"", 1, 1);

        recorder.enqueue(proof.clone(), &caller).await.unwrap();
        wait_until_done(&recorder, "t1").await;
        let again = recorder.enqueue(proof, &caller).await.unwrap();

        assert!(matches!(again, SettlementStatus::Settled { .. }));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.tally(&caller.canonical_uuid).await.total_tasks, 1);
    }

    #[tokio::test]
    async fn test_stopped_worker_reports_failure() {
        let ledger = Arc::new(MemoryLedger::new());
        let (recorder, worker) = WorkProofRecorder::start(ledger, fast_settings(1));
        worker.abort();
        let _ = worker.await;

        let proof = WorkProof::build("t1", "search", b"", b"", 1, 1);
        let err = recorder.enqueue(proof, &CallerIdentity::anonymous()).await.unwrap_err();
        assert!(matches!(err, RecorderError::WorkerStopped));
        assert!(matches!(recorder.status("t1").await, Some(SettlementStatus::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_status_expires_after_retention() {
        let ledger = Arc::new(MemoryLedger::new());
        let settings = RecorderSettings {
            retention: Duration::from_secs(3600),
            ..fast_settings(1)
        };
        let (recorder, _worker) = WorkProofRecorder::start(ledger, settings);
        let caller = CallerIdentity::anonymous();

        recorder.enqueue(WorkProof::build("t1", "search", b"", b"", 1, 1), &caller).await.unwrap();
        wait_until_done(&recorder, "t1").await;

        tokio::time::advance(Duration::from_secs(1800)).await;
        recorder.enqueue(WorkProof::build("t2", "search", b"", b"", 1, 2), &caller).await.unwrap();
        wait_until_done(&recorder, "t2").await;
        assert!(recorder.status("t1").await.is_some());

        tokio::time::advance(Duration::from_secs(1900)).await;
        recorder.enqueue(WorkProof::build("t3", "search", b"", b"", 1, 3), &caller).await.unwrap();
        wait_until_done(&recorder, "t3").await;

        assert_eq!(recorder.status("t1").await, None);
        assert!(recorder.status("t2").await.is_some());
        assert_eq!(recorder.tracked_count().await, 2);
    }

    #[tokio::test]
    async fn test_finished_statuses_are_capped() {
        let ledger = Arc::new(MemoryLedger::new());
        let settings = RecorderSettings {
            max_finished: 2,
            ..fast_settings(1)
        };
        let (recorder, _worker) = WorkProofRecorder::start(ledger, settings);
        let caller = CallerIdentity::anonymous();

        for task in ["t1", "t2", "t3"] {
            recorder.enqueue(WorkProof::build(task, "search", b"", b"", 1, 1), &caller).await.unwrap();
            wait_until_done(&recorder, task).await;
        }

        assert_eq!(recorder.tracked_count().await, 2);
        assert_eq!(recorder.status("t1").await, None);
        assert!(matches!(recorder.status("t3").await, Some(SettlementStatus::Settled { .. })));
    }

    #[tokio::test]
    async fn test_idlest_caller_tally_is_evicted() {
        let ledger = Arc::new(MemoryLedger::new());
        let settings = RecorderSettings {
            max_callers: 2,
            ..fast_settings(1)
        };
        let (recorder, _worker) = WorkProofRecorder::start(ledger, settings);
        // Settlement stamps wall-clock time, which stays below these
        const FAR_FUTURE_MS: u64 = 4_000_000_000_000_000;
        let (alice, bob, carol) = (CallerIdentity::new("alice"), CallerIdentity::new("bob"), CallerIdentity::new("carol"));

        recorder.enqueue(WorkProof::build("t1", "search", b"", b"", 1, FAR_FUTURE_MS), &alice).await.unwrap();
        recorder.enqueue(WorkProof::build("t2", "search", b"", b"", 1, 5), &bob).await.unwrap();
        recorder.enqueue(WorkProof::build("t3", "search", b"", b"", 1, FAR_FUTURE_MS + 1), &carol).await.unwrap();

        assert_eq!(recorder.caller_count().await, 2);
        assert_eq!(recorder.tally(&bob.canonical_uuid).await.total_tasks, 0);
        assert_eq!(recorder.tally(&alice.canonical_uuid).await.total_tasks, 1);
        assert_eq!(recorder.tally(&carol.canonical_uuid).await.total_tasks, 1);
    }

    #[test]
    fn test_status_serialization() {
        let s = SettlementStatus::Settled { tx_hash: B256::ZERO, block_number: 9 };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["status"], "settled");
        assert_eq!(json["blockNumber"], 9);
        assert_eq!(serde_json::to_value(SettlementStatus::Queued).unwrap()["status"], "queued");
    }
}
