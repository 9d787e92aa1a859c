//! Background jobs - expiry sweeps and ledger forensics
//!
//! Interval jobs that keep the store honest while no request is in
//! flight. Each run isolates per-item failures so one bad row never
//! starves the rest of the sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use crate::alerts::{AlertKind, AlertSink};
use crate::models::{ProofState, RefundStatus, TaskStatus};
use crate::store::EscrowStore;

/// Expires stale proof submissions and overdue open tasks
pub struct ExpirySweepJob {
    store: Arc<dyn EscrowStore>,
    /// Hours a submission may sit unreviewed before expiring
    proof_ttl_hours: i64,
}

impl ExpirySweepJob {
    pub fn new(store: Arc<dyn EscrowStore>, proof_ttl_hours: i64) -> Self {
        Self {
            store,
            proof_ttl_hours,
        }
    }

    /// Run one sweep; returns (proofs expired, tasks expired)
    pub async fn run(&self) -> (usize, usize) {
        let now = Utc::now();
        let cutoff = now - Duration::hours(self.proof_ttl_hours);
        let mut proofs_expired = 0;
        let mut tasks_expired = 0;

        let result = async {
            let mut tx = self.store.begin().await?;

            for proof in tx.stale_submitted_proofs(cutoff).await? {
                match tx.update_proof_state(proof.id, ProofState::Expired, None).await {
                    Ok(_) => proofs_expired += 1,
                    Err(err) => warn!(proof_id = %proof.id, error = %err, "could not expire proof"),
                }
            }

            for task in tx.expired_open_tasks(now).await? {
                match tx.transition_task(task.id, TaskStatus::Expired).await {
                    Ok(_) => tasks_expired += 1,
                    Err(err) => warn!(task_id = %task.id, error = %err, "could not expire task"),
                }
            }

            tx.commit().await
        }
        .await;

        if let Err(err) = result {
            error!(error = %err, "expiry sweep aborted");
        } else if proofs_expired + tasks_expired > 0 {
            info!(proofs_expired, tasks_expired, "expiry sweep finished");
        }
        (proofs_expired, tasks_expired)
    }
}

/// Forensic scan over the ledgers. A payout persisted without its hold,
/// or an experience row without a release, indicates a bug and must
/// alert.
pub struct LedgerAuditJob {
    store: Arc<dyn EscrowStore>,
    alerts: AlertSink,
}

impl LedgerAuditJob {
    pub fn new(store: Arc<dyn EscrowStore>, alerts: AlertSink) -> Self {
        Self { store, alerts }
    }

    /// Run one scan; returns the number of findings
    pub async fn run(&self) -> usize {
        let mut findings = 0;

        let result = async {
            let mut tx = self.store.begin().await?;

            for payout in tx.payouts_without_hold().await? {
                findings += 1;
                self.alerts.fire(
                    AlertKind::LedgerDriftDetected,
                    format!(
                        "payout {} committed without an escrow hold for task {}",
                        payout.id, payout.task_id
                    ),
                    json!({ "payout_id": payout.id, "task_id": payout.task_id }),
                );
            }

            for entry in tx.xp_without_release().await? {
                findings += 1;
                self.alerts.fire(
                    AlertKind::LedgerDriftDetected,
                    format!(
                        "xp entry {} exists without a released escrow for task {}",
                        entry.id, entry.task_id
                    ),
                    json!({ "entry_id": entry.id, "task_id": entry.task_id }),
                );
            }

            tx.commit().await
        }
        .await;

        if let Err(err) = result {
            error!(error = %err, "ledger audit aborted");
        }
        findings
    }
}

/// Drains the durable job queue and dispatches known kinds
pub struct QueueDrainJob {
    store: Arc<dyn EscrowStore>,
    alerts: AlertSink,
}

impl QueueDrainJob {
    pub fn new(store: Arc<dyn EscrowStore>, alerts: AlertSink) -> Self {
        Self { store, alerts }
    }

    /// Claim and dispatch due jobs; returns how many were handled
    pub async fn run(&self) -> usize {
        let mut handled = 0;

        let result = async {
            let mut tx = self.store.begin().await?;
            let due = tx.claim_due_jobs(Utc::now(), 50).await?;

            for job in due {
                match job.kind.as_str() {
                    "reconcile_negative_balance" => {
                        // Re-raise while the failure is still on the books
                        let task_id = job
                            .payload
                            .get("task_id")
                            .and_then(|v| v.as_str())
                            .and_then(|s| uuid::Uuid::parse_str(s).ok());
                        if let Some(task_id) = task_id {
                            if let Some(lock) = tx.lock_task_money(task_id).await? {
                                if lock.refund_status == Some(RefundStatus::Failed) {
                                    self.alerts.fire(
                                        AlertKind::NegativeBalance,
                                        format!(
                                            "forced refund for task {task_id} still unreconciled"
                                        ),
                                        job.payload.clone(),
                                    );
                                }
                            }
                        }
                        handled += 1;
                    }
                    other => {
                        warn!(job_id = %job.id, kind = other, "unknown job kind dropped");
                        handled += 1;
                    }
                }
            }
            tx.commit().await
        }
        .await;

        if let Err(err) = result {
            error!(error = %err, "queue drain aborted");
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProofArtifact, ProofQuality, Task, TaskCategory};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn sweep_expires_stale_proofs_and_overdue_tasks() {
        let store = Arc::new(MemoryStore::new());

        let worker = Uuid::new_v4();
        let mut overdue = Task::new(Uuid::new_v4(), TaskCategory::Errand, 2_000);
        overdue.deadline = Some(Utc::now() - Duration::hours(1));
        let mut fresh = Task::new(Uuid::new_v4(), TaskCategory::Errand, 2_000);
        fresh.deadline = Some(Utc::now() + Duration::hours(1));
        let mut proofed = Task::new(Uuid::new_v4(), TaskCategory::Errand, 2_000);
        proofed.status = TaskStatus::ProofSubmitted;
        proofed.assigned_worker_id = Some(worker);

        let stale_proof = ProofArtifact {
            id: Uuid::new_v4(),
            task_id: proofed.id,
            worker_id: worker,
            state: ProofState::Submitted,
            quality: ProofQuality::Basic,
            photo_urls: vec![],
            note: None,
            geo: None,
            captured_at: None,
            rejection_reason: None,
            submitted_at: Utc::now() - Duration::hours(100),
            resolved_at: None,
        };

        let mut tx = store.begin().await.unwrap();
        tx.insert_task(&overdue).await.unwrap();
        tx.insert_task(&fresh).await.unwrap();
        tx.insert_task(&proofed).await.unwrap();
        tx.insert_proof(&stale_proof).await.unwrap();
        tx.commit().await.unwrap();

        let sweep = ExpirySweepJob::new(store.clone(), 72);
        let (proofs, tasks) = sweep.run().await;
        assert_eq!(proofs, 1);
        assert_eq!(tasks, 1);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.get_task(overdue.id).await.unwrap().unwrap().status,
            TaskStatus::Expired
        );
        assert_eq!(
            tx.get_task(fresh.id).await.unwrap().unwrap().status,
            TaskStatus::Open
        );
        assert_eq!(
            tx.get_proof(stale_proof.id).await.unwrap().unwrap().state,
            ProofState::Expired
        );
        drop(tx);

        // A second run finds nothing
        let (proofs, tasks) = sweep.run().await;
        assert_eq!(proofs + tasks, 0);
    }

    #[tokio::test]
    async fn audit_is_quiet_on_an_empty_store() {
        let store = Arc::new(MemoryStore::new());
        let audit = LedgerAuditJob::new(store, AlertSink::disabled());
        assert_eq!(audit.run().await, 0);
    }
}
