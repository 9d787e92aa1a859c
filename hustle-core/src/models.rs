//! Core data models for the money and trust core
//!
//! This module contains the entities persisted by the durable store and
//! the three state machines (task, money lock, proof). Every machine
//! exposes `assert_transition`; callers must check before any write.
//! All monetary amounts are integer minor units (cents).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;
use crate::CoreResult;

/// Business lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Posted, no worker yet
    Open,
    /// Worker assigned, escrow may be held
    Accepted,
    /// Worker submitted a proof artifact
    ProofSubmitted,
    /// Under arbitration
    Disputed,
    /// Proof accepted, payout may release
    Completed,
    /// Cancelled by the poster
    Cancelled,
    /// Deadline passed without completion
    Expired,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Accepted => "ACCEPTED",
            Self::ProofSubmitted => "PROOF_SUBMITTED",
            Self::Disputed => "DISPUTED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(Self::Open),
            "ACCEPTED" => Some(Self::Accepted),
            "PROOF_SUBMITTED" => Some(Self::ProofSubmitted),
            "DISPUTED" => Some(Self::Disputed),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    fn transition_allowed(self, to: TaskStatus) -> bool {
        matches!(
            (self, to),
            (Self::Open, Self::Accepted)
                | (Self::Open, Self::Cancelled)
                | (Self::Open, Self::Expired)
                | (Self::Accepted, Self::ProofSubmitted)
                | (Self::Accepted, Self::Disputed)
                | (Self::Accepted, Self::Cancelled)
                | (Self::ProofSubmitted, Self::Disputed)
                | (Self::ProofSubmitted, Self::Completed)
                | (Self::Disputed, Self::Completed)
        )
    }

    /// Fail with ILLEGAL_TRANSITION unless `self -> to` is defined
    pub fn assert_transition(self, to: TaskStatus) -> CoreResult<()> {
        if self.transition_allowed(to) {
            Ok(())
        } else {
            Err(CoreError::illegal_transition("task", self.as_str(), to.as_str()))
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task money state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoneyState {
    /// Lock row exists but no confirmed hold yet
    Initial,
    /// Poster funds authorized at the gateway, not yet captured
    Held,
    /// Frozen pending dispute resolution
    LockedDispute,
    /// Captured and transferred to the worker
    Released,
    /// Returned to the poster in full
    Refunded,
    /// Reversal recovered less than the full net payout
    PartialRefund,
}

impl MoneyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Held => "held",
            Self::LockedDispute => "locked_dispute",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::PartialRefund => "partial_refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(Self::Initial),
            "held" => Some(Self::Held),
            "locked_dispute" => Some(Self::LockedDispute),
            "released" => Some(Self::Released),
            "refunded" => Some(Self::Refunded),
            "partial_refund" => Some(Self::PartialRefund),
            _ => None,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::Refunded | Self::PartialRefund)
    }

    /// Terminal states the store refuses to mutate under any event.
    /// `released` is terminal for the normal flow but admits the admin
    /// reversal transitions; `refunded`/`partial_refund` admit nothing.
    pub fn is_immutable(self) -> bool {
        matches!(self, Self::Refunded | Self::PartialRefund)
    }

    fn transition_allowed(self, to: MoneyState) -> bool {
        matches!(
            (self, to),
            (Self::Initial, Self::Held)
                | (Self::Held, Self::Released)
                | (Self::Held, Self::Refunded)
                | (Self::Held, Self::LockedDispute)
                | (Self::LockedDispute, Self::Released)
                | (Self::LockedDispute, Self::Refunded)
                | (Self::LockedDispute, Self::PartialRefund)
                | (Self::Released, Self::Refunded)
                | (Self::Released, Self::PartialRefund)
        )
    }

    /// Fail with ILLEGAL_TRANSITION unless `self -> to` is defined
    pub fn assert_transition(self, to: MoneyState) -> CoreResult<()> {
        if self.transition_allowed(to) {
            Ok(())
        } else {
            Err(CoreError::illegal_transition("money", self.as_str(), to.as_str()))
        }
    }

    /// Engine events admitted from this state
    pub fn next_allowed_events(self) -> &'static [MoneyEvent] {
        match self {
            Self::Initial => &[MoneyEvent::HoldEscrow],
            Self::Held => &[
                MoneyEvent::ReleasePayout,
                MoneyEvent::RefundEscrow,
                MoneyEvent::LockDispute,
            ],
            Self::LockedDispute => &[MoneyEvent::ReleasePayout, MoneyEvent::RefundEscrow],
            Self::Released => &[MoneyEvent::ForceRefund],
            Self::Refunded | Self::PartialRefund => &[],
        }
    }
}

impl std::fmt::Display for MoneyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events accepted by the money state engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoneyEvent {
    HoldEscrow,
    ReleasePayout,
    RefundEscrow,
    ForceRefund,
    LockDispute,
}

impl MoneyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HoldEscrow => "HOLD_ESCROW",
            Self::ReleasePayout => "RELEASE_PAYOUT",
            Self::RefundEscrow => "REFUND_ESCROW",
            Self::ForceRefund => "FORCE_REFUND",
            Self::LockDispute => "LOCK_DISPUTE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HOLD_ESCROW" => Some(Self::HoldEscrow),
            "RELEASE_PAYOUT" => Some(Self::ReleasePayout),
            "REFUND_ESCROW" => Some(Self::RefundEscrow),
            "FORCE_REFUND" => Some(Self::ForceRefund),
            "LOCK_DISPUTE" => Some(Self::LockDispute),
            _ => None,
        }
    }

    /// The money state this event lands in when it succeeds cleanly.
    /// FORCE_REFUND may also land in `partial_refund`.
    pub fn target_state(self) -> MoneyState {
        match self {
            Self::HoldEscrow => MoneyState::Held,
            Self::ReleasePayout => MoneyState::Released,
            Self::RefundEscrow => MoneyState::Refunded,
            Self::ForceRefund => MoneyState::Refunded,
            Self::LockDispute => MoneyState::LockedDispute,
        }
    }
}

impl std::fmt::Display for MoneyEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refund progress on a money lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Refunded,
    Failed,
}

impl RefundStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "refunded" => Some(Self::Refunded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Worker payout lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Standard transfers settle on the gateway's schedule; instant payouts
/// cost the worker a fee deducted from their net
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutType {
    Standard,
    Instant,
}

impl PayoutType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Instant => "instant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(Self::Standard),
            "instant" => Some(Self::Instant),
            _ => None,
        }
    }
}

/// Proof artifact state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofState {
    Submitted,
    Accepted,
    Rejected,
    Expired,
}

impl ProofState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(Self::Submitted),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected | Self::Expired)
    }

    /// Fail with ILLEGAL_TRANSITION unless `self -> to` is defined.
    /// There is no way back to `submitted`.
    pub fn assert_transition(self, to: ProofState) -> CoreResult<()> {
        let allowed = matches!(
            (self, to),
            (Self::Submitted, Self::Accepted)
                | (Self::Submitted, Self::Rejected)
                | (Self::Submitted, Self::Expired)
        );
        if allowed {
            Ok(())
        } else {
            Err(CoreError::illegal_transition("proof", self.as_str(), to.as_str()))
        }
    }
}

/// Proof quality derived from the submission payload shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofQuality {
    Basic,
    Standard,
    Enhanced,
}

impl ProofQuality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "BASIC",
            Self::Standard => "STANDARD",
            Self::Enhanced => "ENHANCED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BASIC" => Some(Self::Basic),
            "STANDARD" => Some(Self::Standard),
            "ENHANCED" => Some(Self::Enhanced),
            _ => None,
        }
    }
}

/// Task categories used by the reward base table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Errand,
    Delivery,
    Cleaning,
    Assembly,
    Yardwork,
    Moving,
    Tech,
    Other,
}

impl TaskCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Errand => "errand",
            Self::Delivery => "delivery",
            Self::Cleaning => "cleaning",
            Self::Assembly => "assembly",
            Self::Yardwork => "yardwork",
            Self::Moving => "moving",
            Self::Tech => "tech",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "errand" => Some(Self::Errand),
            "delivery" => Some(Self::Delivery),
            "cleaning" => Some(Self::Cleaning),
            "assembly" => Some(Self::Assembly),
            "yardwork" => Some(Self::Yardwork),
            "moving" => Some(Self::Moving),
            "tech" => Some(Self::Tech),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Task row as the core sees it. The feed and task CRUD live outside the
/// core; this mirror exists so the engines can enforce lifecycle
/// invariants against the authoritative row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub poster_id: Uuid,
    pub assigned_worker_id: Option<Uuid>,
    pub category: TaskCategory,
    pub price_cents: i64,
    pub status: TaskStatus,
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new open task
    pub fn new(poster_id: Uuid, category: TaskCategory, price_cents: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            poster_id,
            assigned_worker_id: None,
            category,
            price_cents,
            status: TaskStatus::Open,
            deadline: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row per task; owns the money state machine and serializes every
/// monetary event for the task via `SELECT ... FOR UPDATE`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoneyStateLock {
    pub task_id: Uuid,
    pub current_state: MoneyState,
    pub next_allowed_events: Vec<MoneyEvent>,
    pub gateway_payment_intent_id: Option<String>,
    pub gateway_transfer_id: Option<String>,
    pub refund_status: Option<RefundStatus>,
    /// Monotone counter for optimistic concurrency
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MoneyStateLock {
    /// Create a lock in `held` with a confirmed payment intent
    pub fn held(task_id: Uuid, payment_intent_id: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            current_state: MoneyState::Held,
            next_allowed_events: MoneyState::Held.next_allowed_events().to_vec(),
            gateway_payment_intent_id: Some(payment_intent_id),
            gateway_transfer_id: None,
            refund_status: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to` after asserting the machine admits it
    pub fn advance(&mut self, to: MoneyState) -> CoreResult<()> {
        self.current_state.assert_transition(to)?;
        self.current_state = to;
        self.next_allowed_events = to.next_allowed_events().to_vec();
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether the engine admits `event` from the current state
    pub fn allows(&self, event: MoneyEvent) -> bool {
        self.next_allowed_events.contains(&event)
    }
}

/// Escrow hold for a task. The three amounts are immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowHold {
    pub id: Uuid,
    pub task_id: Uuid,
    pub poster_id: Uuid,
    pub worker_id: Uuid,
    pub gross_amount: i64,
    pub platform_fee_amount: i64,
    pub net_payout_amount: i64,
    pub status: MoneyState,
    pub gateway_payment_intent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl EscrowHold {
    pub fn new(
        task_id: Uuid,
        poster_id: Uuid,
        worker_id: Uuid,
        gross_amount: i64,
        platform_fee_amount: i64,
        payment_intent_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            poster_id,
            worker_id,
            gross_amount,
            platform_fee_amount,
            net_payout_amount: gross_amount - platform_fee_amount,
            status: MoneyState::Held,
            gateway_payment_intent_id: payment_intent_id,
            created_at: now,
            updated_at: now,
            released_at: None,
            refunded_at: None,
        }
    }
}

/// Split a gross amount into (platform fee, worker net) using basis points
pub fn split_amounts(gross: i64, fee_bps: u32) -> (i64, i64) {
    let fee = gross * i64::from(fee_bps) / 10_000;
    (fee, gross - fee)
}

/// One row per released task in `hustler_payouts`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPayout {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub gateway_transfer_id: String,
    pub gateway_charge_id: Option<String>,
    pub destination_account_id: Option<String>,
    pub payout_type: PayoutType,
    /// Instant payout fee; zero for standard transfers
    pub fee_amount: i64,
    /// Post-fee amount the worker actually receives
    pub net_amount: i64,
    pub status: PayoutStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Proof artifact submitted by the worker; at most one per task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofArtifact {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: Uuid,
    pub state: ProofState,
    pub quality: ProofQuality,
    pub photo_urls: Vec<String>,
    pub note: Option<String>,
    pub geo: Option<GeoPoint>,
    pub captured_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Submission location, when the capture device provided one
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Append-only experience award; unique per task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XpEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub task_id: Uuid,
    pub base_amount: i64,
    pub decay_factor: f64,
    pub streak_multiplier: f64,
    pub final_amount: i64,
    pub awarded_at: DateTime<Utc>,
}

/// Append-only trust tier change; tiers only ever increase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustChange {
    pub id: Uuid,
    pub user_id: Uuid,
    pub old_tier: i16,
    pub new_tier: i16,
    pub reason: String,
    pub awarded_at: DateTime<Utc>,
}

/// Append-only badge award; unique per (user, badge)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeAward {
    pub id: Uuid,
    pub user_id: Uuid,
    pub badge_id: String,
    pub tier: i16,
    pub awarded_at: DateTime<Utc>,
}

/// Administrative freeze of a user account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminLock {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub locked_at: DateTime<Utc>,
}

impl AdminLock {
    pub fn new(user_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            reason: reason.into(),
            locked_at: Utc::now(),
        }
    }
}

/// Destination balance observed before a transfer reversal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub account_id: String,
    pub balance: i64,
    pub reason: String,
    pub taken_at: DateTime<Utc>,
}

/// Durable one-shot background job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            run_at,
            created_at: Utc::now(),
            claimed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_machine_admits_the_documented_paths() {
        assert!(TaskStatus::Open.assert_transition(TaskStatus::Accepted).is_ok());
        assert!(TaskStatus::Accepted
            .assert_transition(TaskStatus::ProofSubmitted)
            .is_ok());
        assert!(TaskStatus::ProofSubmitted
            .assert_transition(TaskStatus::Completed)
            .is_ok());
        assert!(TaskStatus::Disputed
            .assert_transition(TaskStatus::Completed)
            .is_ok());
        assert!(TaskStatus::Accepted.assert_transition(TaskStatus::Cancelled).is_ok());

        // No resurrection from terminal states
        for terminal in [TaskStatus::Completed, TaskStatus::Cancelled, TaskStatus::Expired] {
            assert!(terminal.is_terminal());
            assert!(terminal.assert_transition(TaskStatus::Open).is_err());
            assert!(terminal.assert_transition(TaskStatus::Accepted).is_err());
        }
    }

    #[test]
    fn money_machine_rejects_release_from_initial() {
        let err = MoneyState::Initial
            .assert_transition(MoneyState::Released)
            .unwrap_err();
        match err {
            CoreError::IllegalTransition { machine, .. } => assert_eq!(machine, "money"),
            other => panic!("expected illegal transition, got {other:?}"),
        }
    }

    #[test]
    fn money_terminal_states_admit_nothing_except_admin_reversal() {
        assert!(MoneyState::Released.is_terminal());
        assert!(!MoneyState::Released.is_immutable());
        assert!(MoneyState::Released
            .assert_transition(MoneyState::Refunded)
            .is_ok());
        assert!(MoneyState::Released
            .assert_transition(MoneyState::PartialRefund)
            .is_ok());
        assert!(MoneyState::Released.assert_transition(MoneyState::Held).is_err());

        for immutable in [MoneyState::Refunded, MoneyState::PartialRefund] {
            assert!(immutable.is_immutable());
            assert!(immutable.next_allowed_events().is_empty());
        }
    }

    #[test]
    fn proof_machine_has_no_way_back_to_submitted() {
        assert!(ProofState::Submitted.assert_transition(ProofState::Accepted).is_ok());
        assert!(ProofState::Rejected.assert_transition(ProofState::Submitted).is_err());
        assert!(ProofState::Accepted.assert_transition(ProofState::Rejected).is_err());
    }

    #[test]
    fn lock_advance_tracks_allowed_events() {
        let mut lock = MoneyStateLock::held(Uuid::new_v4(), "pi_1".to_string());
        assert!(lock.allows(MoneyEvent::ReleasePayout));
        assert!(lock.allows(MoneyEvent::RefundEscrow));
        assert!(!lock.allows(MoneyEvent::HoldEscrow));

        lock.advance(MoneyState::Released).unwrap();
        assert!(lock.allows(MoneyEvent::ForceRefund));
        assert!(!lock.allows(MoneyEvent::ReleasePayout));

        lock.advance(MoneyState::Refunded).unwrap();
        assert!(lock.next_allowed_events.is_empty());
        assert!(lock.advance(MoneyState::Held).is_err());
    }

    #[test]
    fn fee_split_matches_the_published_schedule() {
        // 12% platform fee on a $100 task
        let (fee, net) = split_amounts(10_000, 1_200);
        assert_eq!(fee, 1_200);
        assert_eq!(net, 8_800);

        // Rounding goes to the platform's disadvantage (floor of the fee)
        let (fee, net) = split_amounts(999, 1_200);
        assert_eq!(fee, 119);
        assert_eq!(net, 880);
        assert_eq!(fee + net, 999);
    }

    #[test]
    fn enum_text_round_trips() {
        for s in [
            MoneyState::Initial,
            MoneyState::Held,
            MoneyState::LockedDispute,
            MoneyState::Released,
            MoneyState::Refunded,
            MoneyState::PartialRefund,
        ] {
            assert_eq!(MoneyState::parse(s.as_str()), Some(s));
        }
        for e in [
            MoneyEvent::HoldEscrow,
            MoneyEvent::ReleasePayout,
            MoneyEvent::RefundEscrow,
            MoneyEvent::ForceRefund,
            MoneyEvent::LockDispute,
        ] {
            assert_eq!(MoneyEvent::parse(e.as_str()), Some(e));
        }
        for c in [
            TaskCategory::Errand,
            TaskCategory::Delivery,
            TaskCategory::Cleaning,
            TaskCategory::Assembly,
            TaskCategory::Yardwork,
            TaskCategory::Moving,
            TaskCategory::Tech,
            TaskCategory::Other,
        ] {
            assert_eq!(TaskCategory::parse(c.as_str()), Some(c));
        }
        assert_eq!(TaskStatus::parse("PROOF_SUBMITTED"), Some(TaskStatus::ProofSubmitted));
        assert_eq!(ProofQuality::parse("ENHANCED"), Some(ProofQuality::Enhanced));
        assert_eq!(MoneyState::parse("bogus"), None);
        assert_eq!(TaskCategory::parse("bogus"), None);
    }
}
