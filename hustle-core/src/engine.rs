//! Money state engine - owns every monetary transition for a task
//!
//! Single entry point `handle(task_id, event, ctx)`. Each event runs
//! under the per-task row lock, validates its preconditions, drives the
//! gateway saga steps with their compensations, and persists the new
//! state atomically with its side tables. RELEASE_PAYOUT is the only
//! site that awards rewards, inside the same transaction that moves the
//! lock to `released`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertSink};
use crate::authority::AuthorityGate;
use crate::config::FeeSettings;
use crate::error::CoreError;
use crate::gateway::{
    CaptureMethod, ChargeRef, CreateIntentRequest, GatewayError, IntentStatus, PaymentGateway,
    TransferRequest,
};
use crate::models::{
    split_amounts, BalanceSnapshot, EscrowHold, MoneyEvent, MoneyState, MoneyStateLock,
    PayoutStatus, PayoutType, ProofState, QueuedJob, RefundStatus, TaskStatus, WorkerPayout,
};
use crate::rewards::{AwardResult, RewardLedger};
use crate::store::{EscrowStore, StoreTx};
use crate::CoreResult;

/// Who is asking for the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRole {
    Poster,
    Worker,
    Admin,
    Service,
    Ai,
}

/// Caller identity as the transport resolved it
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn poster(user_id: Uuid) -> Self {
        Self { user_id, role: ActorRole::Poster }
    }

    pub fn worker(user_id: Uuid) -> Self {
        Self { user_id, role: ActorRole::Worker }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self { user_id, role: ActorRole::Admin }
    }

    pub fn service(user_id: Uuid) -> Self {
        Self { user_id, role: ActorRole::Service }
    }

    pub fn ai() -> Self {
        Self { user_id: Uuid::nil(), role: ActorRole::Ai }
    }
}

/// Gateway primitives the event needs, supplied by the caller
#[derive(Debug, Clone)]
pub struct EventContext {
    pub actor: Actor,
    pub payment_method: Option<String>,
    pub destination_account_id: Option<String>,
    pub amount: Option<i64>,
    pub payout_type: PayoutType,
    pub reason: Option<String>,
}

impl EventContext {
    fn bare(actor: Actor) -> Self {
        Self {
            actor,
            payment_method: None,
            destination_account_id: None,
            amount: None,
            payout_type: PayoutType::Standard,
            reason: None,
        }
    }

    pub fn hold(actor: Actor, payment_method: impl Into<String>, amount: i64) -> Self {
        Self {
            payment_method: Some(payment_method.into()),
            amount: Some(amount),
            ..Self::bare(actor)
        }
    }

    pub fn release(actor: Actor, destination_account_id: impl Into<String>) -> Self {
        Self {
            destination_account_id: Some(destination_account_id.into()),
            ..Self::bare(actor)
        }
    }

    pub fn instant_release(actor: Actor, destination_account_id: impl Into<String>) -> Self {
        Self {
            payout_type: PayoutType::Instant,
            ..Self::release(actor, destination_account_id)
        }
    }

    pub fn refund(actor: Actor) -> Self {
        Self::bare(actor)
    }

    pub fn force_refund(actor: Actor) -> Self {
        Self::bare(actor)
    }

    /// Forced refund clawing back only part of the net payout
    pub fn force_refund_partial(actor: Actor, amount: i64) -> Self {
        Self {
            amount: Some(amount),
            ..Self::bare(actor)
        }
    }

    pub fn dispute(actor: Actor, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::bare(actor)
        }
    }
}

/// What a successful event changed
#[derive(Debug, Clone)]
pub struct MoneyTransition {
    pub task_id: Uuid,
    pub event: MoneyEvent,
    pub from: Option<MoneyState>,
    pub to: MoneyState,
    pub version: i64,
    pub hold: Option<EscrowHold>,
    pub payout: Option<WorkerPayout>,
    pub award: Option<AwardResult>,
}

/// Gateway side effects with their undo, recorded as the saga advances
/// and executed in reverse on failure
#[derive(Debug)]
enum Compensation {
    CancelIntent(String),
    RefundCharge(ChargeRef),
    ReverseTransfer { transfer_id: String, amount: i64 },
}

/// The engine. One per process; construct with [`MoneyStateEngine::new`].
pub struct MoneyStateEngine {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn PaymentGateway>,
    alerts: AlertSink,
    rewards: RewardLedger,
    fees: FeeSettings,
    authority: AuthorityGate,
}

fn subsystem_for(event: MoneyEvent) -> &'static str {
    match event {
        MoneyEvent::HoldEscrow => "escrow.capture",
        MoneyEvent::ReleasePayout => "escrow.release",
        MoneyEvent::RefundEscrow | MoneyEvent::ForceRefund => "escrow.refund",
        MoneyEvent::LockDispute => "dispute.finalize",
    }
}

/// Map a disallowed event to IDEMPOTENT_REPLAY when the lock already
/// sits in the event's landing state, ILLEGAL_TRANSITION otherwise
fn reject_event(lock: &MoneyStateLock, event: MoneyEvent) -> CoreError {
    let replay = lock.current_state == event.target_state()
        || (event == MoneyEvent::ForceRefund && lock.current_state == MoneyState::PartialRefund);
    if replay {
        CoreError::IdempotentReplay {
            state: lock.current_state,
        }
    } else {
        CoreError::illegal_transition(
            "money",
            lock.current_state.as_str(),
            event.target_state().as_str(),
        )
    }
}

impl MoneyStateEngine {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        alerts: AlertSink,
        rewards: RewardLedger,
        fees: FeeSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            alerts,
            rewards,
            fees,
            authority: AuthorityGate::new(),
        }
    }

    /// Apply a money event to a task
    pub async fn handle(
        &self,
        task_id: Uuid,
        event: MoneyEvent,
        ctx: EventContext,
    ) -> CoreResult<MoneyTransition> {
        // Money movement is A0: an AI actor never reaches a side effect
        if ctx.actor.role == ActorRole::Ai {
            self.authority.enforce(event.as_str(), subsystem_for(event))?;
        }

        info!(%task_id, event = event.as_str(), "handling money event");
        match event {
            MoneyEvent::HoldEscrow => self.hold_escrow(task_id, ctx).await,
            MoneyEvent::ReleasePayout => self.release_payout(task_id, ctx).await,
            MoneyEvent::RefundEscrow => self.refund_escrow(task_id, ctx).await,
            MoneyEvent::ForceRefund => self.force_refund(task_id, ctx).await,
            MoneyEvent::LockDispute => self.lock_dispute(task_id, ctx).await,
        }
    }

    /// Run recorded compensations in reverse order; alert on any failure
    async fn compensate(&self, task_id: Uuid, compensations: Vec<Compensation>) {
        for compensation in compensations.into_iter().rev() {
            let result = match &compensation {
                Compensation::CancelIntent(intent_id) => {
                    self.gateway.cancel_payment_intent(intent_id).await
                }
                Compensation::RefundCharge(charge) => self.gateway.refund_charge(charge).await,
                Compensation::ReverseTransfer {
                    transfer_id,
                    amount,
                } => {
                    self.gateway
                        .create_transfer_reversal(transfer_id, *amount)
                        .await
                }
            };
            if let Err(err) = result {
                self.alerts.fire(
                    AlertKind::CompensationFailed,
                    format!("compensation failed for task {task_id}: {err}"),
                    json!({ "task_id": task_id, "step": format!("{compensation:?}") }),
                );
            }
        }
    }

    /// Abort a saga after a gateway failure: roll back the local
    /// transaction, undo gateway side effects, record the failure, and
    /// hand back the error for the caller to return
    async fn abort_saga(
        &self,
        tx: Box<dyn StoreTx>,
        task_id: Uuid,
        compensations: Vec<Compensation>,
        err: GatewayError,
        mark_refund_failed: bool,
    ) -> CoreError {
        // Release the row lock before talking to the gateway again
        drop(tx);
        self.compensate(task_id, compensations).await;

        if mark_refund_failed {
            match self.store.begin().await {
                Ok(mut marker) => {
                    if let Err(e) = marker
                        .set_refund_status(task_id, Some(RefundStatus::Failed))
                        .await
                    {
                        error!(%task_id, error = %e, "failed to record saga failure");
                    } else if let Err(e) = marker.commit().await {
                        error!(%task_id, error = %e, "failed to commit saga failure marker");
                    }
                }
                Err(e) => error!(%task_id, error = %e, "failed to open saga failure marker"),
            }
        }

        self.alerts.fire(
            AlertKind::SagaAborted,
            format!("money saga aborted for task {task_id}: {err}"),
            json!({ "task_id": task_id }),
        );
        CoreError::Gateway(err)
    }

    async fn hold_escrow(&self, task_id: Uuid, ctx: EventContext) -> CoreResult<MoneyTransition> {
        let payment_method = ctx
            .payment_method
            .clone()
            .ok_or_else(|| CoreError::precondition("a payment method is required to hold escrow"))?;
        let amount = ctx
            .amount
            .ok_or_else(|| CoreError::precondition("an amount is required to hold escrow"))?;
        if amount <= 0 {
            return Err(CoreError::precondition("amount must be positive"));
        }

        let mut tx = self.store.begin().await?;
        tx.lock_task_scope(task_id).await?;
        let existing = tx.lock_task_money(task_id).await?;
        if let Some(lock) = &existing {
            if lock.current_state != MoneyState::Initial {
                return Err(reject_event(lock, MoneyEvent::HoldEscrow));
            }
        }

        let task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no task {task_id}")))?;
        if task.status != TaskStatus::Accepted {
            return Err(CoreError::precondition(format!(
                "escrow holds require an accepted task (status is {})",
                task.status
            )));
        }
        let worker_id = task
            .assigned_worker_id
            .ok_or_else(|| CoreError::precondition("task has no assigned worker"))?;

        // Saga: create the manual-capture intent, then confirm it.
        // Creation leaves nothing to undo; a failed confirm cancels.
        let intent = self
            .gateway
            .create_payment_intent(&CreateIntentRequest {
                amount,
                currency: "usd".to_string(),
                payment_method,
                capture_method: CaptureMethod::Manual,
                task_id,
            })
            .await
            .map_err(CoreError::Gateway)?;

        let confirmed = match self.gateway.confirm_payment_intent(&intent.id).await {
            Ok(confirmed) => confirmed,
            Err(err) => {
                let comps = vec![Compensation::CancelIntent(intent.id)];
                return Err(self.abort_saga(tx, task_id, comps, err, false).await);
            }
        };
        if confirmed.status != IntentStatus::RequiresCapture {
            let comps = vec![Compensation::CancelIntent(intent.id.clone())];
            let err = GatewayError::Api {
                status: 409,
                message: format!("intent {} confirmed into unexpected state", intent.id),
            };
            return Err(self.abort_saga(tx, task_id, comps, err, false).await);
        }

        let (fee, _net) = split_amounts(amount, self.fees.platform_fee_bps);
        let hold = EscrowHold::new(task_id, task.poster_id, worker_id, amount, fee, intent.id.clone());

        let from = existing.as_ref().map(|l| l.current_state);
        let lock = match existing {
            Some(mut lock) => {
                let expected = lock.version;
                lock.advance(MoneyState::Held)?;
                lock.gateway_payment_intent_id = Some(intent.id.clone());
                lock.version += 1;
                tx.update_money_lock(&lock, expected).await?;
                lock
            }
            None => {
                let lock = MoneyStateLock::held(task_id, intent.id.clone());
                tx.insert_money_lock(&lock).await?;
                lock
            }
        };
        tx.insert_escrow_hold(&hold).await?;
        tx.commit().await?;

        info!(%task_id, intent_id = %intent.id, gross = amount, fee, "escrow held");
        Ok(MoneyTransition {
            task_id,
            event: MoneyEvent::HoldEscrow,
            from,
            to: MoneyState::Held,
            version: lock.version,
            hold: Some(hold),
            payout: None,
            award: None,
        })
    }

    async fn release_payout(&self, task_id: Uuid, ctx: EventContext) -> CoreResult<MoneyTransition> {
        let destination = ctx.destination_account_id.clone().ok_or_else(|| {
            CoreError::precondition("worker has no destination account for payout")
        })?;

        let mut tx = self.store.begin().await?;
        tx.lock_task_scope(task_id).await?;
        let lock = tx
            .lock_task_money(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no money state for task {task_id}")))?;
        if !lock.allows(MoneyEvent::ReleasePayout) {
            return Err(reject_event(&lock, MoneyEvent::ReleasePayout));
        }

        let task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no task {task_id}")))?;
        if task.status != TaskStatus::Completed {
            return Err(CoreError::precondition(format!(
                "payout requires a completed task (status is {})",
                task.status
            )));
        }
        let proof_accepted = tx
            .get_proof_for_task(task_id)
            .await?
            .map(|p| p.state == ProofState::Accepted)
            .unwrap_or(false);
        if !proof_accepted {
            return Err(CoreError::precondition(
                "payout requires an accepted proof artifact",
            ));
        }
        let worker_id = task
            .assigned_worker_id
            .ok_or_else(|| CoreError::precondition("task has no assigned worker"))?;
        if tx.is_account_locked(worker_id).await? {
            return Err(CoreError::precondition(
                "worker account is administratively locked",
            ));
        }
        let hold = tx
            .get_escrow_hold(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("held lock without escrow hold for {task_id}")))?;
        let intent_id = lock
            .gateway_payment_intent_id
            .clone()
            .ok_or_else(|| CoreError::internal(format!("held lock without intent for {task_id}")))?;

        // Saga step (a): capture. Undo is refunding the captured charge.
        let mut compensations = Vec::new();
        let captured = match self.gateway.capture_payment_intent(&intent_id).await {
            Ok(captured) => captured,
            Err(err) => return Err(self.abort_saga(tx, task_id, compensations, err, true).await),
        };
        let charge_id = match captured.latest_charge_id {
            Some(charge_id) => charge_id,
            None => {
                let err = GatewayError::Api {
                    status: 500,
                    message: format!("capture of {intent_id} reported no charge"),
                };
                return Err(self.abort_saga(tx, task_id, compensations, err, true).await);
            }
        };
        compensations.push(Compensation::RefundCharge(ChargeRef::Charge(charge_id.clone())));

        // Saga step (b): transfer the net to the worker. Undo reverses it.
        let transfer = match self
            .gateway
            .create_transfer(&TransferRequest {
                amount: hold.net_payout_amount,
                destination_account_id: destination.clone(),
                transfer_group: task_id.to_string(),
                source_charge: Some(charge_id.clone()),
            })
            .await
        {
            Ok(transfer) => transfer,
            Err(err) => return Err(self.abort_saga(tx, task_id, compensations, err, true).await),
        };
        compensations.push(Compensation::ReverseTransfer {
            transfer_id: transfer.id.clone(),
            amount: hold.net_payout_amount,
        });

        // Saga step (c): optional instant payout. The worker bears the
        // fee; the payout row records the post-fee net.
        let (instant_fee, net_amount) = match ctx.payout_type {
            PayoutType::Standard => (0, hold.net_payout_amount),
            PayoutType::Instant => {
                match self
                    .gateway
                    .create_instant_payout(&destination, hold.net_payout_amount)
                    .await
                {
                    Ok(payout) => (payout.fee_amount, hold.net_payout_amount - payout.fee_amount),
                    Err(err) => {
                        return Err(self.abort_saga(tx, task_id, compensations, err, true).await)
                    }
                }
            }
        };

        let expected = lock.version;
        let mut lock = lock;
        lock.advance(MoneyState::Released)?;
        lock.gateway_transfer_id = Some(transfer.id.clone());
        lock.version += 1;
        tx.update_money_lock(&lock, expected).await?;
        tx.set_escrow_status(task_id, MoneyState::Released).await?;

        let now = Utc::now();
        let payout = WorkerPayout {
            id: Uuid::new_v4(),
            escrow_id: hold.id,
            task_id,
            worker_id,
            gateway_transfer_id: transfer.id.clone(),
            gateway_charge_id: Some(charge_id),
            destination_account_id: Some(destination),
            payout_type: ctx.payout_type,
            fee_amount: instant_fee,
            net_amount,
            status: PayoutStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        tx.insert_payout(&payout).await?;

        // Reward award rides the release transaction (and only this one)
        let award = self
            .rewards
            .award_for_task(&mut *tx, &task, worker_id, &hold)
            .await?;
        tx.commit().await?;

        info!(
            %task_id,
            transfer_id = %transfer.id,
            net = net_amount,
            payout_type = ctx.payout_type.as_str(),
            "payout released"
        );
        Ok(MoneyTransition {
            task_id,
            event: MoneyEvent::ReleasePayout,
            from: Some(MoneyState::Held),
            to: MoneyState::Released,
            version: lock.version,
            hold: Some(hold),
            payout: Some(payout),
            award: Some(award),
        })
    }

    async fn refund_escrow(&self, task_id: Uuid, ctx: EventContext) -> CoreResult<MoneyTransition> {
        let mut tx = self.store.begin().await?;
        tx.lock_task_scope(task_id).await?;
        let lock = tx
            .lock_task_money(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no money state for task {task_id}")))?;
        if !lock.allows(MoneyEvent::RefundEscrow) {
            return Err(reject_event(&lock, MoneyEvent::RefundEscrow));
        }

        let hold = tx
            .get_escrow_hold(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("held lock without escrow hold for {task_id}")))?;
        let authorized = match ctx.actor.role {
            ActorRole::Admin => true,
            ActorRole::Poster => ctx.actor.user_id == hold.poster_id,
            _ => false,
        };
        if !authorized {
            return Err(CoreError::precondition(
                "only the poster or an admin can refund a held escrow",
            ));
        }

        let from = lock.current_state;
        let mut lock = match tx.claim_refund(task_id).await? {
            Some(lock) => lock,
            None => {
                return Err(match lock.refund_status {
                    Some(RefundStatus::Refunded) => CoreError::IdempotentReplay {
                        state: lock.current_state,
                    },
                    _ => CoreError::concurrency(format!(
                        "a refund is already pending for task {task_id}"
                    )),
                })
            }
        };

        let intent_id = lock
            .gateway_payment_intent_id
            .clone()
            .ok_or_else(|| CoreError::internal(format!("held lock without intent for {task_id}")))?;

        // Pre-capture: cancel returns the authorization, no compensation
        if let Err(err) = self.gateway.cancel_payment_intent(&intent_id).await {
            return Err(self.abort_saga(tx, task_id, Vec::new(), err, true).await);
        }

        let expected = lock.version;
        lock.advance(MoneyState::Refunded)?;
        lock.refund_status = Some(RefundStatus::Refunded);
        lock.version += 1;
        tx.update_money_lock(&lock, expected).await?;
        tx.set_escrow_status(task_id, MoneyState::Refunded).await?;

        // Cancel the task too, when its machine admits it
        if let Some(task) = tx.get_task(task_id).await? {
            if task.status.assert_transition(TaskStatus::Cancelled).is_ok() {
                tx.transition_task(task_id, TaskStatus::Cancelled).await?;
            }
        }
        tx.commit().await?;

        info!(%task_id, intent_id = %intent_id, "escrow refunded");
        Ok(MoneyTransition {
            task_id,
            event: MoneyEvent::RefundEscrow,
            from: Some(from),
            to: MoneyState::Refunded,
            version: lock.version,
            hold: Some(hold),
            payout: None,
            award: None,
        })
    }

    async fn force_refund(&self, task_id: Uuid, ctx: EventContext) -> CoreResult<MoneyTransition> {
        if ctx.actor.role != ActorRole::Admin {
            return Err(CoreError::precondition("forced refunds are admin-only"));
        }

        let mut tx = self.store.begin().await?;
        tx.lock_task_scope(task_id).await?;
        let lock = tx
            .lock_task_money(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no money state for task {task_id}")))?;
        if !lock.allows(MoneyEvent::ForceRefund) {
            return Err(reject_event(&lock, MoneyEvent::ForceRefund));
        }

        let hold = tx
            .get_escrow_hold(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("released lock without hold for {task_id}")))?;
        let payout = tx
            .get_payout_for_task(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("released lock without payout for {task_id}")))?;
        let worker_id = payout.worker_id;
        let destination = payout
            .destination_account_id
            .clone()
            .or_else(|| ctx.destination_account_id.clone())
            .ok_or_else(|| {
                CoreError::precondition("no destination account on record for reversal")
            })?;
        let charge = payout
            .gateway_charge_id
            .clone()
            .map(ChargeRef::Charge)
            .or_else(|| {
                lock.gateway_payment_intent_id
                    .clone()
                    .map(ChargeRef::PaymentIntent)
            })
            .ok_or_else(|| CoreError::internal(format!("no charge on record for {task_id}")))?;

        let from = lock.current_state;
        let mut lock = match tx.claim_refund(task_id).await? {
            Some(lock) => lock,
            None => {
                return Err(match lock.refund_status {
                    Some(RefundStatus::Refunded) => CoreError::IdempotentReplay {
                        state: lock.current_state,
                    },
                    _ => CoreError::concurrency(format!(
                        "a refund is already pending for task {task_id}"
                    )),
                })
            }
        };

        // Full reversal unless the admin asked for a partial clawback
        let needed = hold.net_payout_amount;
        let reversal_amount = ctx.amount.unwrap_or(needed);
        if reversal_amount <= 0 || reversal_amount > needed {
            return Err(CoreError::precondition(format!(
                "reversal amount must be within (0, {needed}]"
            )));
        }

        // Step (a): snapshot the destination balance before reversing
        let balance = match self.gateway.retrieve_balance(&destination).await {
            Ok(balance) => balance,
            Err(err) => return Err(self.abort_saga(tx, task_id, Vec::new(), err, true).await),
        };
        tx.insert_balance_snapshot(&BalanceSnapshot {
            id: Uuid::new_v4(),
            worker_id,
            account_id: destination.clone(),
            balance,
            reason: "force_refund".to_string(),
            taken_at: Utc::now(),
        })
        .await?;

        // Step (b): reverse the transfer. The gateway is authoritative
        // for the balance; a refusal is the NEGATIVE_BALANCE path.
        match self
            .gateway
            .create_transfer_reversal(&payout.gateway_transfer_id, reversal_amount)
            .await
        {
            Ok(()) => {}
            Err(GatewayError::InsufficientFunds) => {
                return Err(self
                    .negative_balance(tx, task_id, worker_id, &destination, balance, reversal_amount)
                    .await)
            }
            Err(err) => return Err(self.abort_saga(tx, task_id, Vec::new(), err, true).await),
        }

        // Step (c): refund the poster's charge in full
        if let Err(err) = self.gateway.refund_charge(&charge).await {
            // The reversal already landed; park for operator follow-up
            drop(tx);
            if let Ok(mut marker) = self.store.begin().await {
                let _ = marker
                    .set_refund_status(task_id, Some(RefundStatus::Failed))
                    .await;
                let _ = marker.commit().await;
            }
            self.alerts.fire(
                AlertKind::CompensationFailed,
                format!("charge refund failed after reversal for task {task_id}: {err}"),
                json!({ "task_id": task_id, "worker_id": worker_id }),
            );
            return Err(CoreError::Gateway(err));
        }

        let to = if reversal_amount == needed {
            MoneyState::Refunded
        } else {
            MoneyState::PartialRefund
        };
        let expected = lock.version;
        lock.advance(to)?;
        lock.refund_status = Some(RefundStatus::Refunded);
        lock.version += 1;
        tx.update_money_lock(&lock, expected).await?;
        tx.set_escrow_status(task_id, to).await?;
        tx.commit().await?;

        info!(%task_id, recovered = reversal_amount, state = to.as_str(), "forced refund applied");
        Ok(MoneyTransition {
            task_id,
            event: MoneyEvent::ForceRefund,
            from: Some(from),
            to,
            version: lock.version,
            hold: Some(hold),
            payout: Some(payout),
            award: None,
        })
    }

    /// The reversal cannot be funded: lock the worker account, record
    /// the failure, queue a reconcile job, and alert
    async fn negative_balance(
        &self,
        tx: Box<dyn StoreTx>,
        task_id: Uuid,
        worker_id: Uuid,
        destination: &str,
        available: i64,
        needed: i64,
    ) -> CoreError {
        drop(tx);
        let record = async {
            let mut marker = self.store.begin().await?;
            marker
                .set_refund_status(task_id, Some(RefundStatus::Failed))
                .await?;
            marker
                .insert_admin_lock(&crate::models::AdminLock::new(
                    worker_id,
                    format!("destination balance too low for reversal on task {task_id}"),
                ))
                .await?;
            marker
                .insert_balance_snapshot(&BalanceSnapshot {
                    id: Uuid::new_v4(),
                    worker_id,
                    account_id: destination.to_string(),
                    balance: available,
                    reason: "force_refund_insufficient".to_string(),
                    taken_at: Utc::now(),
                })
                .await?;
            marker
                .enqueue_job(&QueuedJob::new(
                    "reconcile_negative_balance",
                    json!({ "task_id": task_id, "worker_id": worker_id }),
                    Utc::now(),
                ))
                .await?;
            marker.commit().await
        }
        .await;
        if let Err(err) = record {
            error!(%task_id, error = %err, "failed to record negative-balance outcome");
        }

        self.alerts.fire(
            AlertKind::LedgerDriftDetected,
            format!(
                "transfer reversal refused for task {task_id}: needed {needed}, available {available}"
            ),
            json!({ "task_id": task_id, "worker_id": worker_id }),
        );
        warn!(%task_id, %worker_id, needed, available, "worker account locked after failed reversal");
        CoreError::NegativeBalance {
            worker_id,
            needed,
            available,
        }
    }

    async fn lock_dispute(&self, task_id: Uuid, ctx: EventContext) -> CoreResult<MoneyTransition> {
        let mut tx = self.store.begin().await?;
        tx.lock_task_scope(task_id).await?;
        let lock = tx
            .lock_task_money(task_id)
            .await?
            .ok_or_else(|| CoreError::precondition(format!("no money state for task {task_id}")))?;
        if !lock.allows(MoneyEvent::LockDispute) {
            return Err(reject_event(&lock, MoneyEvent::LockDispute));
        }

        let hold = tx
            .get_escrow_hold(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("held lock without escrow hold for {task_id}")))?;
        let authorized = match ctx.actor.role {
            ActorRole::Admin => true,
            ActorRole::Poster => ctx.actor.user_id == hold.poster_id,
            ActorRole::Worker => ctx.actor.user_id == hold.worker_id,
            _ => false,
        };
        if !authorized {
            return Err(CoreError::precondition(
                "only a party to the task or an admin can open a dispute",
            ));
        }

        let from = lock.current_state;
        let expected = lock.version;
        let mut lock = lock;
        lock.advance(MoneyState::LockedDispute)?;
        lock.version += 1;
        tx.update_money_lock(&lock, expected).await?;
        tx.set_escrow_status(task_id, MoneyState::LockedDispute).await?;

        if let Some(task) = tx.get_task(task_id).await? {
            if task.status.assert_transition(TaskStatus::Disputed).is_ok() {
                tx.transition_task(task_id, TaskStatus::Disputed).await?;
            }
        }
        tx.commit().await?;

        info!(%task_id, reason = ctx.reason.as_deref().unwrap_or(""), "money frozen for dispute");
        Ok(MoneyTransition {
            task_id,
            event: MoneyEvent::LockDispute,
            from: Some(from),
            to: MoneyState::LockedDispute,
            version: lock.version,
            hold: Some(hold),
            payout: None,
            award: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeSettings;
    use crate::error::ErrorKind;
    use crate::gateway::FakePaymentGateway;
    use crate::models::{Task, TaskCategory};
    use crate::rewards::RewardConfig;
    use crate::store::MemoryStore;

    fn engine_with(
        store: Arc<MemoryStore>,
        gateway: Arc<FakePaymentGateway>,
    ) -> MoneyStateEngine {
        MoneyStateEngine::new(
            store,
            gateway,
            AlertSink::disabled(),
            RewardLedger::new(RewardConfig::default()),
            FeeSettings::default(),
        )
    }

    async fn seed_accepted_task(store: &MemoryStore) -> (Uuid, Uuid, Uuid) {
        let poster = Uuid::new_v4();
        let worker = Uuid::new_v4();
        let mut task = Task::new(poster, TaskCategory::Errand, 10_000);
        task.status = TaskStatus::Accepted;
        task.assigned_worker_id = Some(worker);
        let mut tx = store.begin().await.unwrap();
        tx.insert_task(&task).await.unwrap();
        tx.commit().await.unwrap();
        (task.id, poster, worker)
    }

    #[tokio::test]
    async fn ai_actors_are_rejected_before_side_effects() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakePaymentGateway::new());
        let engine = engine_with(store.clone(), gateway.clone());
        let (task_id, _, _) = seed_accepted_task(&store).await;

        let err = engine
            .handle(
                task_id,
                MoneyEvent::HoldEscrow,
                EventContext::hold(Actor::ai(), "pm_card_ok", 10_000),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorityViolation);

        // No gateway call, no lock row
        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_task_money(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn declined_payment_method_leaves_no_state() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakePaymentGateway::new());
        gateway.decline_payment_method("pm_card_bad");
        let engine = engine_with(store.clone(), gateway.clone());
        let (task_id, poster, _) = seed_accepted_task(&store).await;

        let err = engine
            .handle(
                task_id,
                MoneyEvent::HoldEscrow,
                EventContext::hold(Actor::poster(poster), "pm_card_bad", 10_000),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GatewayError);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_task_money(task_id).await.unwrap().is_none());
        assert!(tx.get_escrow_hold(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_requires_a_completed_task() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakePaymentGateway::new());
        let engine = engine_with(store.clone(), gateway.clone());
        let (task_id, poster, _) = seed_accepted_task(&store).await;

        engine
            .handle(
                task_id,
                MoneyEvent::HoldEscrow,
                EventContext::hold(Actor::poster(poster), "pm_card_ok", 10_000),
            )
            .await
            .unwrap();

        let err = engine
            .handle(
                task_id,
                MoneyEvent::ReleasePayout,
                EventContext::release(Actor::admin(Uuid::new_v4()), "acct_w1"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

        // The hold is untouched
        let mut tx = store.begin().await.unwrap();
        let lock = tx.lock_task_money(task_id).await.unwrap().unwrap();
        assert_eq!(lock.current_state, MoneyState::Held);
    }

    #[tokio::test]
    async fn failed_transfer_compensates_the_capture() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakePaymentGateway::new());
        let engine = engine_with(store.clone(), gateway.clone());
        let (task_id, poster, worker) = seed_accepted_task(&store).await;

        engine
            .handle(
                task_id,
                MoneyEvent::HoldEscrow,
                EventContext::hold(Actor::poster(poster), "pm_card_ok", 10_000),
            )
            .await
            .unwrap();

        // Complete the task with an accepted proof out-of-band
        let mut tx = store.begin().await.unwrap();
        tx.insert_proof(&crate::models::ProofArtifact {
            id: Uuid::new_v4(),
            task_id,
            worker_id: worker,
            state: ProofState::Accepted,
            quality: crate::models::ProofQuality::Standard,
            photo_urls: vec!["https://cdn.example/p.jpg".to_string()],
            note: None,
            geo: None,
            captured_at: None,
            rejection_reason: None,
            submitted_at: Utc::now(),
            resolved_at: Some(Utc::now()),
        })
        .await
        .unwrap();
        tx.transition_task(task_id, TaskStatus::ProofSubmitted).await.unwrap();
        tx.transition_task(task_id, TaskStatus::Completed).await.unwrap();
        tx.commit().await.unwrap();

        gateway.fail_next_transfer();
        let err = engine
            .handle(
                task_id,
                MoneyEvent::ReleasePayout,
                EventContext::release(Actor::admin(Uuid::new_v4()), "acct_w1"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GatewayError);

        // The captured charge was refunded and the lock stayed held with
        // the failure recorded
        assert_eq!(gateway.refunded_charges().len(), 1);
        let mut tx = store.begin().await.unwrap();
        let lock = tx.lock_task_money(task_id).await.unwrap().unwrap();
        assert_eq!(lock.current_state, MoneyState::Held);
        assert_eq!(lock.refund_status, Some(RefundStatus::Failed));
        assert!(tx.get_payout_for_task(task_id).await.unwrap().is_none());
    }
}
