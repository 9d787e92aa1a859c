//! In-memory store for tests and ephemeral runs
//!
//! Implements the full store contract against process memory with the
//! same fault behavior as Postgres: append-only ledgers, guarded
//! terminal updates, conflict-ignore event appends. A transaction
//! clones the state, mutates the clone, and swaps it back on commit;
//! the global mutex gives strictly serializable transactions, which is
//! stronger than — and therefore compatible with — the per-task
//! serialization the engines rely on.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{EscrowStore, ProfileSummary, StoreTx, WalletSummary};
use crate::error::CoreError;
use crate::models::{
    AdminLock, BadgeAward, BalanceSnapshot, EscrowHold, MoneyState, MoneyStateLock, PayoutStatus,
    ProofArtifact, ProofState, QueuedJob, RefundStatus, Task, TaskStatus, TrustChange,
    WorkerPayout, XpEntry,
};
use crate::CoreResult;

#[derive(Default, Clone)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    locks: HashMap<Uuid, MoneyStateLock>,
    holds: HashMap<Uuid, EscrowHold>,
    payouts: Vec<WorkerPayout>,
    processed_events: Vec<(String, String)>,
    xp: Vec<XpEntry>,
    trust: Vec<TrustChange>,
    badges: Vec<BadgeAward>,
    proofs: Vec<ProofArtifact>,
    admin_locks: Vec<AdminLock>,
    snapshots: Vec<BalanceSnapshot>,
    jobs: Vec<QueuedJob>,
}

/// In-memory implementation of [`EscrowStore`]
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTx {
    /// Held until commit or drop; taking it out releases the store
    guard: Option<OwnedMutexGuard<MemoryState>>,
    work: MemoryState,
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let guard = self.inner.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard: Some(guard),
            work,
        }))
    }

    async fn wallet_summary(&self, user_id: Uuid) -> CoreResult<WalletSummary> {
        let state = self.inner.lock().await;
        let mut summary = WalletSummary::default();
        for hold in state.holds.values() {
            if hold.poster_id == user_id {
                match hold.status {
                    MoneyState::Held | MoneyState::LockedDispute => {
                        summary.held_total += hold.gross_amount
                    }
                    MoneyState::Refunded => summary.refunded_total += hold.gross_amount,
                    _ => {}
                }
            }
        }
        for payout in &state.payouts {
            if payout.worker_id == user_id {
                match payout.status {
                    PayoutStatus::Completed => summary.released_total += payout.net_amount,
                    PayoutStatus::Pending | PayoutStatus::Processing => {
                        summary.pending_payout_total += payout.net_amount
                    }
                    PayoutStatus::Failed => {}
                }
            }
        }
        Ok(summary)
    }

    async fn profile_summary(&self, user_id: Uuid) -> CoreResult<ProfileSummary> {
        let state = self.inner.lock().await;
        let xp_total = state
            .xp
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.final_amount)
            .sum();
        let completed_tasks = state.xp.iter().filter(|e| e.user_id == user_id).count() as i64;
        let trust_tier = state
            .trust
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.new_tier)
            .max()
            .unwrap_or(1);
        let badges = state
            .badges
            .iter()
            .filter(|b| b.user_id == user_id)
            .map(|b| b.badge_id.clone())
            .collect();
        Ok(ProfileSummary {
            xp_total,
            completed_tasks,
            trust_tier,
            badges,
        })
    }
}

impl MemoryTx {
    fn lock_or_missing(&mut self, task_id: Uuid) -> CoreResult<&mut MoneyStateLock> {
        self.work
            .locks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::storage(format!("no money lock for task {task_id}")))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get_task(&mut self, task_id: Uuid) -> CoreResult<Option<Task>> {
        Ok(self.work.tasks.get(&task_id).cloned())
    }

    async fn insert_task(&mut self, task: &Task) -> CoreResult<()> {
        if self.work.tasks.contains_key(&task.id) {
            return Err(CoreError::storage(format!("task {} already exists", task.id)));
        }
        self.work.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn transition_task(&mut self, task_id: Uuid, to: TaskStatus) -> CoreResult<Task> {
        let task = self
            .work
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::storage(format!("no task {task_id}")))?;
        task.status.assert_transition(to)?;
        task.status = to;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn assign_worker(&mut self, task_id: Uuid, worker_id: Uuid) -> CoreResult<()> {
        let task = self
            .work
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::storage(format!("no task {task_id}")))?;
        task.assigned_worker_id = Some(worker_id);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn lock_task_scope(&mut self, _task_id: Uuid) -> CoreResult<()> {
        // The global mutex already serializes every transaction
        Ok(())
    }

    async fn lock_task_money(&mut self, task_id: Uuid) -> CoreResult<Option<MoneyStateLock>> {
        Ok(self.work.locks.get(&task_id).cloned())
    }

    async fn insert_money_lock(&mut self, lock: &MoneyStateLock) -> CoreResult<()> {
        if self.work.locks.contains_key(&lock.task_id) {
            return Err(CoreError::storage(format!(
                "money lock for task {} already exists",
                lock.task_id
            )));
        }
        self.work.locks.insert(lock.task_id, lock.clone());
        Ok(())
    }

    async fn update_money_lock(
        &mut self,
        lock: &MoneyStateLock,
        expected_version: i64,
    ) -> CoreResult<()> {
        let existing = self.lock_or_missing(lock.task_id)?;
        if existing.current_state.is_immutable() {
            return Err(CoreError::internal(format!(
                "terminal mutation blocked on money lock {} ({})",
                lock.task_id, existing.current_state
            )));
        }
        if existing.current_state == MoneyState::Released
            && !matches!(
                lock.current_state,
                MoneyState::Released | MoneyState::Refunded | MoneyState::PartialRefund
            )
        {
            return Err(CoreError::internal(format!(
                "terminal mutation blocked on money lock {} (released)",
                lock.task_id
            )));
        }
        if existing.version != expected_version {
            return Err(CoreError::concurrency(format!(
                "money lock version moved: expected {expected_version}, found {}",
                existing.version
            )));
        }
        *existing = lock.clone();
        Ok(())
    }

    async fn claim_refund(&mut self, task_id: Uuid) -> CoreResult<Option<MoneyStateLock>> {
        let lock = self.lock_or_missing(task_id)?;
        match lock.refund_status {
            None | Some(RefundStatus::Failed) => {
                lock.refund_status = Some(RefundStatus::Pending);
                lock.updated_at = Utc::now();
                Ok(Some(lock.clone()))
            }
            Some(RefundStatus::Pending) | Some(RefundStatus::Refunded) => Ok(None),
        }
    }

    async fn set_refund_status(
        &mut self,
        task_id: Uuid,
        status: Option<RefundStatus>,
    ) -> CoreResult<()> {
        let lock = self.lock_or_missing(task_id)?;
        lock.refund_status = status;
        lock.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_escrow_hold(&mut self, hold: &EscrowHold) -> CoreResult<()> {
        if self.work.holds.contains_key(&hold.task_id) {
            return Err(CoreError::storage(format!(
                "escrow hold for task {} already exists",
                hold.task_id
            )));
        }
        self.work.holds.insert(hold.task_id, hold.clone());
        Ok(())
    }

    async fn get_escrow_hold(&mut self, task_id: Uuid) -> CoreResult<Option<EscrowHold>> {
        Ok(self.work.holds.get(&task_id).cloned())
    }

    async fn set_escrow_status(&mut self, task_id: Uuid, status: MoneyState) -> CoreResult<()> {
        let hold = self
            .work
            .holds
            .get_mut(&task_id)
            .ok_or_else(|| CoreError::storage(format!("no escrow hold for task {task_id}")))?;
        hold.status = status;
        hold.updated_at = Utc::now();
        match status {
            MoneyState::Released => hold.released_at = Some(Utc::now()),
            MoneyState::Refunded | MoneyState::PartialRefund => {
                hold.refunded_at = Some(Utc::now())
            }
            _ => {}
        }
        Ok(())
    }

    async fn insert_payout(&mut self, payout: &WorkerPayout) -> CoreResult<()> {
        if self.work.payouts.iter().any(|p| p.task_id == payout.task_id) {
            return Err(CoreError::storage(format!(
                "payout for task {} already exists",
                payout.task_id
            )));
        }
        self.work.payouts.push(payout.clone());
        Ok(())
    }

    async fn get_payout_for_task(&mut self, task_id: Uuid) -> CoreResult<Option<WorkerPayout>> {
        Ok(self
            .work
            .payouts
            .iter()
            .find(|p| p.task_id == task_id)
            .cloned())
    }

    async fn append_event(&mut self, event_id: &str, event_type: &str) -> CoreResult<bool> {
        if self
            .work
            .processed_events
            .iter()
            .any(|(id, _)| id == event_id)
        {
            return Ok(false);
        }
        self.work
            .processed_events
            .push((event_id.to_string(), event_type.to_string()));
        Ok(true)
    }

    async fn insert_xp_entry(&mut self, entry: &XpEntry) -> CoreResult<bool> {
        if self.work.xp.iter().any(|e| e.task_id == entry.task_id) {
            return Ok(false);
        }
        self.work.xp.push(entry.clone());
        Ok(true)
    }

    async fn xp_total(&mut self, user_id: Uuid) -> CoreResult<i64> {
        Ok(self
            .work
            .xp
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.final_amount)
            .sum())
    }

    async fn recent_awards(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<XpEntry>> {
        Ok(self
            .work
            .xp
            .iter()
            .filter(|e| e.user_id == user_id && e.awarded_at >= since)
            .cloned()
            .collect())
    }

    async fn award_days(&mut self, user_id: Uuid, limit: i64) -> CoreResult<Vec<NaiveDate>> {
        let mut days: Vec<NaiveDate> = self
            .work
            .xp
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.awarded_at.date_naive())
            .collect();
        days.sort_unstable();
        days.dedup();
        days.reverse();
        days.truncate(limit as usize);
        Ok(days)
    }

    async fn completed_task_count(&mut self, user_id: Uuid) -> CoreResult<i64> {
        Ok(self.work.xp.iter().filter(|e| e.user_id == user_id).count() as i64)
    }

    async fn net_earned_total(&mut self, user_id: Uuid) -> CoreResult<i64> {
        Ok(self
            .work
            .payouts
            .iter()
            .filter(|p| p.worker_id == user_id && p.status == PayoutStatus::Completed)
            .map(|p| p.net_amount)
            .sum())
    }

    async fn append_trust_change(&mut self, change: &TrustChange) -> CoreResult<()> {
        self.work.trust.push(change.clone());
        Ok(())
    }

    async fn current_tier(&mut self, user_id: Uuid) -> CoreResult<i16> {
        Ok(self
            .work
            .trust
            .iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.new_tier)
            .max()
            .unwrap_or(1))
    }

    async fn append_badge(&mut self, award: &BadgeAward) -> CoreResult<bool> {
        if self
            .work
            .badges
            .iter()
            .any(|b| b.user_id == award.user_id && b.badge_id == award.badge_id)
        {
            return Ok(false);
        }
        self.work.badges.push(award.clone());
        Ok(true)
    }

    async fn insert_proof(&mut self, proof: &ProofArtifact) -> CoreResult<()> {
        if self.work.proofs.iter().any(|p| p.task_id == proof.task_id) {
            return Err(CoreError::storage(format!(
                "proof for task {} already exists",
                proof.task_id
            )));
        }
        self.work.proofs.push(proof.clone());
        Ok(())
    }

    async fn get_proof(&mut self, proof_id: Uuid) -> CoreResult<Option<ProofArtifact>> {
        Ok(self.work.proofs.iter().find(|p| p.id == proof_id).cloned())
    }

    async fn get_proof_for_task(&mut self, task_id: Uuid) -> CoreResult<Option<ProofArtifact>> {
        Ok(self
            .work
            .proofs
            .iter()
            .find(|p| p.task_id == task_id)
            .cloned())
    }

    async fn update_proof_state(
        &mut self,
        proof_id: Uuid,
        state: ProofState,
        reason: Option<&str>,
    ) -> CoreResult<ProofArtifact> {
        let proof = self
            .work
            .proofs
            .iter_mut()
            .find(|p| p.id == proof_id)
            .ok_or_else(|| CoreError::storage(format!("no proof {proof_id}")))?;
        proof.state.assert_transition(state)?;
        proof.state = state;
        proof.rejection_reason = reason.map(|r| r.to_string());
        proof.resolved_at = Some(Utc::now());
        Ok(proof.clone())
    }

    async fn insert_admin_lock(&mut self, lock: &AdminLock) -> CoreResult<()> {
        self.work.admin_locks.push(lock.clone());
        Ok(())
    }

    async fn is_account_locked(&mut self, user_id: Uuid) -> CoreResult<bool> {
        Ok(self.work.admin_locks.iter().any(|l| l.user_id == user_id))
    }

    async fn insert_balance_snapshot(&mut self, snapshot: &BalanceSnapshot) -> CoreResult<()> {
        self.work.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn enqueue_job(&mut self, job: &QueuedJob) -> CoreResult<()> {
        self.work.jobs.push(job.clone());
        Ok(())
    }

    async fn claim_due_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<QueuedJob>> {
        let mut claimed = Vec::new();
        for job in self.work.jobs.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            if job.claimed_at.is_none() && job.run_at <= now {
                job.claimed_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn stale_submitted_proofs(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<ProofArtifact>> {
        Ok(self
            .work
            .proofs
            .iter()
            .filter(|p| p.state == ProofState::Submitted && p.submitted_at < cutoff)
            .cloned()
            .collect())
    }

    async fn expired_open_tasks(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<Task>> {
        Ok(self
            .work
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Open && t.deadline.map(|d| d < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn payouts_without_hold(&mut self) -> CoreResult<Vec<WorkerPayout>> {
        Ok(self
            .work
            .payouts
            .iter()
            .filter(|p| !self.work.holds.contains_key(&p.task_id))
            .cloned()
            .collect())
    }

    async fn xp_without_release(&mut self) -> CoreResult<Vec<XpEntry>> {
        // A forced refund legitimately leaves the lock in refunded while
        // the xp row stays; the payout row proves the release happened.
        Ok(self
            .work
            .xp
            .iter()
            .filter(|entry| {
                let lock_terminal = self
                    .work
                    .locks
                    .get(&entry.task_id)
                    .map(|l| l.current_state.is_terminal())
                    .unwrap_or(false);
                let payout_exists = self
                    .work
                    .payouts
                    .iter()
                    .any(|p| p.task_id == entry.task_id);
                !(lock_terminal && payout_exists)
            })
            .cloned()
            .collect())
    }

    async fn commit(&mut self) -> CoreResult<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| CoreError::internal("transaction already committed"))?;
        *guard = std::mem::take(&mut self.work);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskCategory;

    #[tokio::test]
    async fn rollback_discards_uncommitted_writes() {
        let store = MemoryStore::new();
        let task = Task::new(Uuid::new_v4(), TaskCategory::Errand, 5_000);

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_task(&task).await.unwrap();
            // dropped without commit
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_task(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_event_is_conflict_ignore() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        assert!(tx.append_event("evt_1", "payment_intent.succeeded").await.unwrap());
        assert!(!tx.append_event("evt_1", "payment_intent.succeeded").await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.append_event("evt_1", "payment_intent.succeeded").await.unwrap());
    }

    #[tokio::test]
    async fn immutable_lock_rows_reject_updates() {
        let store = MemoryStore::new();
        let task_id = Uuid::new_v4();
        let mut lock = MoneyStateLock::held(task_id, "pi_1".to_string());

        let mut tx = store.begin().await.unwrap();
        tx.insert_money_lock(&lock).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        lock.advance(MoneyState::Refunded).unwrap();
        let expected = lock.version;
        lock.version += 1;
        tx.update_money_lock(&lock, expected).await.unwrap();
        tx.commit().await.unwrap();

        // Any further update is a terminal-mutation fault
        let mut tx = store.begin().await.unwrap();
        let mut tampered = tx.lock_task_money(task_id).await.unwrap().unwrap();
        tampered.current_state = MoneyState::Held;
        let err = tx.update_money_lock(&tampered, tampered.version).await.unwrap_err();
        match err {
            CoreError::Internal(msg) => assert!(msg.contains("terminal mutation blocked")),
            other => panic!("expected internal fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn claim_refund_admits_exactly_one_claimant() {
        let store = MemoryStore::new();
        let task_id = Uuid::new_v4();
        let lock = MoneyStateLock::held(task_id, "pi_1".to_string());

        let mut tx = store.begin().await.unwrap();
        tx.insert_money_lock(&lock).await.unwrap();
        assert!(tx.claim_refund(task_id).await.unwrap().is_some());
        assert!(tx.claim_refund(task_id).await.unwrap().is_none());

        // A failed refund frees the slot again
        tx.set_refund_status(task_id, Some(RefundStatus::Failed)).await.unwrap();
        assert!(tx.claim_refund(task_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn xp_ledger_is_unique_per_task() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let task = Uuid::new_v4();
        let entry = XpEntry {
            id: Uuid::new_v4(),
            user_id: user,
            task_id: task,
            base_amount: 100,
            decay_factor: 1.0,
            streak_multiplier: 1.0,
            final_amount: 100,
            awarded_at: Utc::now(),
        };

        let mut tx = store.begin().await.unwrap();
        assert!(tx.insert_xp_entry(&entry).await.unwrap());
        let dup = XpEntry {
            id: Uuid::new_v4(),
            ..entry.clone()
        };
        assert!(!tx.insert_xp_entry(&dup).await.unwrap());
        assert_eq!(tx.xp_total(user).await.unwrap(), 100);
    }
}
