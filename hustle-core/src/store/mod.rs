//! Durable store for the money and trust core
//!
//! The store is the only authority for the sequencing of internal state
//! transitions; everything else is advisory. [`EscrowStore`] hands out
//! transactions; [`StoreTx`] is the row-locked mutation surface the
//! engines compose. Append-only ledgers reject update/delete at the
//! store layer, and terminal money states are blocked by a guarded
//! UPDATE — zero affected rows is a fault, never a silent no-op.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{
    AdminLock, BadgeAward, BalanceSnapshot, EscrowHold, MoneyState, MoneyStateLock, ProofArtifact,
    ProofState, QueuedJob, RefundStatus, Task, TaskStatus, TrustChange, WorkerPayout, XpEntry,
};
use crate::CoreResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Wallet totals for a user, read-only
#[derive(Debug, Clone, Default, Serialize)]
pub struct WalletSummary {
    pub held_total: i64,
    pub released_total: i64,
    pub refunded_total: i64,
    pub pending_payout_total: i64,
}

/// Profile totals for a user, read-only
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileSummary {
    pub xp_total: i64,
    pub completed_tasks: i64,
    pub trust_tier: i16,
    pub badges: Vec<String>,
}

/// Handle to the durable store
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Open a transaction. All mutations happen inside one.
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>>;

    /// Wallet summary for a user (read-only, no lock)
    async fn wallet_summary(&self, user_id: Uuid) -> CoreResult<WalletSummary>;

    /// Profile summary for a user (read-only, no lock)
    async fn profile_summary(&self, user_id: Uuid) -> CoreResult<ProfileSummary>;
}

/// One open transaction against the store.
///
/// Dropping a transaction without calling [`StoreTx::commit`] rolls it
/// back. Methods that lock rows (`lock_task_money`) hold the lock until
/// commit or rollback, which is what serializes money events per task.
#[async_trait]
pub trait StoreTx: Send {
    // --- tasks ---

    async fn get_task(&mut self, task_id: Uuid) -> CoreResult<Option<Task>>;

    async fn insert_task(&mut self, task: &Task) -> CoreResult<()>;

    /// Move a task to `to` after asserting the task machine admits it
    async fn transition_task(&mut self, task_id: Uuid, to: TaskStatus) -> CoreResult<Task>;

    /// Assign a worker to an open task
    async fn assign_worker(&mut self, task_id: Uuid, worker_id: Uuid) -> CoreResult<()>;

    // --- money state lock ---

    /// Take the per-task advisory lock. Serializes money events for
    /// tasks that do not have a lock row yet (first HOLD_ESCROW).
    async fn lock_task_scope(&mut self, task_id: Uuid) -> CoreResult<()>;

    /// `SELECT ... FOR UPDATE` on the money lock row
    async fn lock_task_money(&mut self, task_id: Uuid) -> CoreResult<Option<MoneyStateLock>>;

    async fn insert_money_lock(&mut self, lock: &MoneyStateLock) -> CoreResult<()>;

    /// Guarded update: refuses terminal rows and stale versions. The
    /// caller passes the lock with its version already bumped and the
    /// version it read (`expected_version`). Zero affected rows maps to
    /// CONCURRENCY_CONFLICT (stale) or an internal terminal-mutation
    /// fault (immutable row).
    async fn update_money_lock(
        &mut self,
        lock: &MoneyStateLock,
        expected_version: i64,
    ) -> CoreResult<()>;

    /// Atomically claim the refund slot:
    /// `refund_status NULL|failed -> pending`. Returns the updated lock,
    /// or None when the refund is already pending or complete.
    async fn claim_refund(&mut self, task_id: Uuid) -> CoreResult<Option<MoneyStateLock>>;

    /// Set refund progress without touching the state column
    async fn set_refund_status(
        &mut self,
        task_id: Uuid,
        status: Option<RefundStatus>,
    ) -> CoreResult<()>;

    // --- escrow holds ---

    async fn insert_escrow_hold(&mut self, hold: &EscrowHold) -> CoreResult<()>;

    async fn get_escrow_hold(&mut self, task_id: Uuid) -> CoreResult<Option<EscrowHold>>;

    /// Mirror the lock state onto the hold. Amounts are immutable.
    async fn set_escrow_status(&mut self, task_id: Uuid, status: MoneyState) -> CoreResult<()>;

    // --- worker payouts ---

    async fn insert_payout(&mut self, payout: &WorkerPayout) -> CoreResult<()>;

    async fn get_payout_for_task(&mut self, task_id: Uuid) -> CoreResult<Option<WorkerPayout>>;

    // --- processed gateway events ---

    /// Conflict-ignore insert into the processed-events table.
    /// Returns true iff this caller owns the event.
    async fn append_event(&mut self, event_id: &str, event_type: &str) -> CoreResult<bool>;

    // --- experience ledger ---

    /// Insert an award; returns false when the task already has one
    async fn insert_xp_entry(&mut self, entry: &XpEntry) -> CoreResult<bool>;

    async fn xp_total(&mut self, user_id: Uuid) -> CoreResult<i64>;

    async fn recent_awards(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<XpEntry>>;

    /// Distinct award days, most recent first
    async fn award_days(&mut self, user_id: Uuid, limit: i64) -> CoreResult<Vec<NaiveDate>>;

    async fn completed_task_count(&mut self, user_id: Uuid) -> CoreResult<i64>;

    /// Lifetime net amount paid out to the worker
    async fn net_earned_total(&mut self, user_id: Uuid) -> CoreResult<i64>;

    // --- trust ledger ---

    async fn append_trust_change(&mut self, change: &TrustChange) -> CoreResult<()>;

    /// Latest tier for the user; tier 1 when no change recorded yet
    async fn current_tier(&mut self, user_id: Uuid) -> CoreResult<i16>;

    // --- badge ledger ---

    /// Append a badge; returns false when the user already holds it
    async fn append_badge(&mut self, award: &BadgeAward) -> CoreResult<bool>;

    // --- proof artifacts ---

    async fn insert_proof(&mut self, proof: &ProofArtifact) -> CoreResult<()>;

    async fn get_proof(&mut self, proof_id: Uuid) -> CoreResult<Option<ProofArtifact>>;

    async fn get_proof_for_task(&mut self, task_id: Uuid) -> CoreResult<Option<ProofArtifact>>;

    /// Move a proof to `state` after asserting the proof machine admits it
    async fn update_proof_state(
        &mut self,
        proof_id: Uuid,
        state: ProofState,
        reason: Option<&str>,
    ) -> CoreResult<ProofArtifact>;

    // --- admin locks ---

    async fn insert_admin_lock(&mut self, lock: &AdminLock) -> CoreResult<()>;

    async fn is_account_locked(&mut self, user_id: Uuid) -> CoreResult<bool>;

    // --- balance snapshots ---

    async fn insert_balance_snapshot(&mut self, snapshot: &BalanceSnapshot) -> CoreResult<()>;

    // --- job queue ---

    async fn enqueue_job(&mut self, job: &QueuedJob) -> CoreResult<()>;

    /// Claim jobs due at `now`, marking them claimed
    async fn claim_due_jobs(&mut self, now: DateTime<Utc>, limit: i64)
        -> CoreResult<Vec<QueuedJob>>;

    // --- sweep and audit queries ---

    /// Proofs still `submitted` whose submission is older than `cutoff`
    async fn stale_submitted_proofs(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<ProofArtifact>>;

    /// OPEN tasks whose deadline has passed
    async fn expired_open_tasks(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<Task>>;

    /// Payout rows whose task has no escrow hold — an ordering violation
    async fn payouts_without_hold(&mut self) -> CoreResult<Vec<WorkerPayout>>;

    /// Experience rows whose money lock never reached `released`
    async fn xp_without_release(&mut self) -> CoreResult<Vec<XpEntry>>;

    /// Commit the transaction. The transaction is unusable afterwards.
    async fn commit(&mut self) -> CoreResult<()>;
}
