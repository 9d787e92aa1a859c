//! Webhook recovery pipeline
//!
//! Consumes gateway-verified events and heals divergence between the
//! local store and the gateway's authoritative record. This is a
//! recovery path, not a primary path: it only repairs the window
//! between a gateway success and a lost local commit, and it never
//! awards rewards. Nothing thrown here crosses the boundary — the
//! transport always answers success, or the gateway would retry
//! forever.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertKind, AlertSink};
use crate::config::FeeSettings;
use crate::error::CoreError;
use crate::gateway::GatewayEvent;
use crate::idempotency::IdempotencyGuard;
use crate::models::{
    split_amounts, EscrowHold, MoneyState, MoneyStateLock, PayoutStatus, PayoutType, TaskStatus,
    WorkerPayout,
};
use crate::store::{EscrowStore, StoreTx};
use crate::CoreResult;

/// How the pipeline disposed of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// The event drove a recovery write
    Processed,
    /// Already seen; no-op
    Replayed,
    /// Observed-only event type, or nothing to heal
    Ignored,
    /// An internal error was swallowed, logged, and alerted
    Quarantined,
}

/// Idempotent, crash-tolerant consumer of gateway events
pub struct WebhookRecovery {
    store: Arc<dyn EscrowStore>,
    guard: Arc<IdempotencyGuard>,
    alerts: AlertSink,
    fees: FeeSettings,
}

impl WebhookRecovery {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        guard: Arc<IdempotencyGuard>,
        alerts: AlertSink,
        fees: FeeSettings,
    ) -> Self {
        Self {
            store,
            guard,
            alerts,
            fees,
        }
    }

    /// Handle one verified event. Infallible by contract.
    pub async fn handle(&self, event: GatewayEvent) -> WebhookDisposition {
        if self.guard.cached(&event.id).await {
            debug!(event_id = %event.id, "webhook replay short-circuited in cache");
            return WebhookDisposition::Replayed;
        }

        match self.process(&event).await {
            Ok(disposition) => {
                self.guard.record(&event.id).await;
                disposition
            }
            Err(err) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %err,
                    "webhook processing failed; parked for operators"
                );
                self.alerts.fire(
                    AlertKind::WebhookQuarantined,
                    format!("webhook {} ({}) failed: {err}", event.id, event.event_type),
                    json!({ "event_id": event.id, "event_type": event.event_type }),
                );
                WebhookDisposition::Quarantined
            }
        }
    }

    /// The fallible body. The conflict-ignore insert into the processed
    /// events table rides the same transaction as the recovery writes,
    /// so duplicate concurrent deliveries race on the insert and every
    /// loser rolls back its work.
    async fn process(&self, event: &GatewayEvent) -> CoreResult<WebhookDisposition> {
        let mut tx = self.store.begin().await?;
        if !tx.append_event(&event.id, &event.event_type).await? {
            debug!(event_id = %event.id, "webhook replay short-circuited in store");
            return Ok(WebhookDisposition::Replayed);
        }

        let disposition = match event.event_type.as_str() {
            "payment_intent.succeeded" => self.recover_hold(&mut *tx, event).await?,
            "transfer.created" => self.recover_release(&mut *tx, event).await?,
            other => {
                // Payout results, account updates, and the rest are
                // observed-only; they never mutate the state machines
                debug!(event_id = %event.id, event_type = other, "observed-only webhook");
                WebhookDisposition::Ignored
            }
        };
        tx.commit().await?;
        Ok(disposition)
    }

    /// A HOLD_ESCROW saga crashed between gateway confirm and local
    /// commit: rebuild the lock and hold from the gateway's record
    async fn recover_hold(
        &self,
        tx: &mut dyn StoreTx,
        event: &GatewayEvent,
    ) -> CoreResult<WebhookDisposition> {
        let task_id = match event.task_id {
            Some(task_id) => task_id,
            None => {
                warn!(event_id = %event.id, "intent event without task metadata");
                return Ok(WebhookDisposition::Ignored);
            }
        };
        tx.lock_task_scope(task_id).await?;

        let existing = tx.lock_task_money(task_id).await?;
        if let Some(lock) = &existing {
            if lock.current_state != MoneyState::Initial {
                // Already held or further along; the primary path won
                debug!(%task_id, state = lock.current_state.as_str(), "nothing to heal");
                return Ok(WebhookDisposition::Ignored);
            }
        }

        let task = tx
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("webhook names unknown task {task_id}")))?;
        let worker_id = task.assigned_worker_id.ok_or_else(|| {
            CoreError::internal(format!("cannot recover hold for unassigned task {task_id}"))
        })?;
        let intent_id = event
            .object_id
            .clone()
            .ok_or_else(|| CoreError::internal("intent event without an intent id"))?;
        let gross = event
            .amount
            .ok_or_else(|| CoreError::internal("intent event without an amount"))?;

        let (fee, _net) = split_amounts(gross, self.fees.platform_fee_bps);
        let hold = EscrowHold::new(task_id, task.poster_id, worker_id, gross, fee, intent_id.clone());

        match existing {
            Some(mut lock) => {
                let expected = lock.version;
                lock.advance(MoneyState::Held)?;
                lock.gateway_payment_intent_id = Some(intent_id);
                lock.version += 1;
                tx.update_money_lock(&lock, expected).await?;
            }
            None => {
                tx.insert_money_lock(&MoneyStateLock::held(task_id, intent_id)).await?;
            }
        }
        tx.insert_escrow_hold(&hold).await?;
        if task.status == TaskStatus::Open {
            tx.transition_task(task_id, TaskStatus::Accepted).await?;
        }

        info!(%task_id, event_id = %event.id, gross, "escrow hold recovered from webhook");
        Ok(WebhookDisposition::Processed)
    }

    /// A RELEASE_PAYOUT saga crashed after the transfer: move the lock
    /// to released and record the payout. Rewards stay coupled to the
    /// engine's release path and are never granted from here.
    async fn recover_release(
        &self,
        tx: &mut dyn StoreTx,
        event: &GatewayEvent,
    ) -> CoreResult<WebhookDisposition> {
        let task_id = match event.task_id {
            Some(task_id) => task_id,
            None => {
                warn!(event_id = %event.id, "transfer event without task metadata");
                return Ok(WebhookDisposition::Ignored);
            }
        };
        tx.lock_task_scope(task_id).await?;

        let lock = match tx.lock_task_money(task_id).await? {
            Some(lock) if lock.current_state == MoneyState::Held => lock,
            Some(lock) => {
                debug!(%task_id, state = lock.current_state.as_str(), "nothing to heal");
                return Ok(WebhookDisposition::Ignored);
            }
            None => {
                warn!(%task_id, event_id = %event.id, "transfer event for task without money state");
                return Ok(WebhookDisposition::Ignored);
            }
        };

        let hold = tx
            .get_escrow_hold(task_id)
            .await?
            .ok_or_else(|| CoreError::internal(format!("held lock without hold for {task_id}")))?;
        let transfer_id = event
            .object_id
            .clone()
            .ok_or_else(|| CoreError::internal("transfer event without a transfer id"))?;

        let expected = lock.version;
        let mut lock = lock;
        lock.advance(MoneyState::Released)?;
        lock.gateway_transfer_id = Some(transfer_id.clone());
        lock.version += 1;
        tx.update_money_lock(&lock, expected).await?;
        tx.set_escrow_status(task_id, MoneyState::Released).await?;

        let now = chrono::Utc::now();
        tx.insert_payout(&WorkerPayout {
            id: Uuid::new_v4(),
            escrow_id: hold.id,
            task_id,
            worker_id: hold.worker_id,
            gateway_transfer_id: transfer_id,
            gateway_charge_id: event.source_charge.clone(),
            destination_account_id: event.destination_account_id.clone(),
            payout_type: PayoutType::Standard,
            fee_amount: 0,
            net_amount: hold.net_payout_amount,
            status: PayoutStatus::Completed,
            created_at: now,
            updated_at: now,
        })
        .await?;

        info!(%task_id, event_id = %event.id, "payout release recovered from webhook");
        Ok(WebhookDisposition::Processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskCategory};
    use crate::store::MemoryStore;
    use chrono::Utc;

    fn recovery(store: Arc<MemoryStore>) -> WebhookRecovery {
        WebhookRecovery::new(
            store,
            Arc::new(IdempotencyGuard::new(64)),
            AlertSink::disabled(),
            FeeSettings::default(),
        )
    }

    fn intent_event(id: &str, task_id: Uuid, amount: i64) -> GatewayEvent {
        GatewayEvent {
            id: id.to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            object_id: Some("pi_recovered".to_string()),
            amount: Some(amount),
            task_id: Some(task_id),
            destination_account_id: None,
            source_charge: None,
            created_at: Utc::now(),
        }
    }

    async fn seed_assigned_task(store: &MemoryStore, status: TaskStatus) -> (Uuid, Uuid) {
        let worker = Uuid::new_v4();
        let mut task = Task::new(Uuid::new_v4(), TaskCategory::Delivery, 10_000);
        task.status = status;
        task.assigned_worker_id = Some(worker);
        let mut tx = store.begin().await.unwrap();
        tx.insert_task(&task).await.unwrap();
        tx.commit().await.unwrap();
        (task.id, worker)
    }

    #[tokio::test]
    async fn recovers_a_missing_hold_and_accepts_the_task() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = recovery(store.clone());
        let (task_id, _) = seed_assigned_task(&store, TaskStatus::Open).await;

        let disposition = pipeline.handle(intent_event("evt_1", task_id, 10_000)).await;
        assert_eq!(disposition, WebhookDisposition::Processed);

        let mut tx = store.begin().await.unwrap();
        let lock = tx.lock_task_money(task_id).await.unwrap().unwrap();
        assert_eq!(lock.current_state, MoneyState::Held);
        let hold = tx.get_escrow_hold(task_id).await.unwrap().unwrap();
        assert_eq!(hold.gross_amount, 10_000);
        assert_eq!(hold.platform_fee_amount, 1_200);
        let task = tx.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Accepted);
    }

    #[tokio::test]
    async fn replays_are_no_ops() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = recovery(store.clone());
        let (task_id, _) = seed_assigned_task(&store, TaskStatus::Open).await;

        assert_eq!(
            pipeline.handle(intent_event("evt_1", task_id, 10_000)).await,
            WebhookDisposition::Processed
        );
        assert_eq!(
            pipeline.handle(intent_event("evt_1", task_id, 10_000)).await,
            WebhookDisposition::Replayed
        );

        // A second pipeline instance (fresh cache) still defers to the store
        let cold = recovery(store.clone());
        assert_eq!(
            cold.handle(intent_event("evt_1", task_id, 10_000)).await,
            WebhookDisposition::Replayed
        );
    }

    #[tokio::test]
    async fn hold_events_after_the_primary_path_do_nothing() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = recovery(store.clone());
        let (task_id, _) = seed_assigned_task(&store, TaskStatus::Accepted).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_money_lock(&MoneyStateLock::held(task_id, "pi_primary".to_string()))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            pipeline.handle(intent_event("evt_2", task_id, 10_000)).await,
            WebhookDisposition::Ignored
        );

        // The primary intent id is untouched
        let mut tx = store.begin().await.unwrap();
        let lock = tx.lock_task_money(task_id).await.unwrap().unwrap();
        assert_eq!(lock.gateway_payment_intent_id.as_deref(), Some("pi_primary"));
    }

    #[tokio::test]
    async fn observed_only_events_never_mutate() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = recovery(store.clone());
        let (task_id, _) = seed_assigned_task(&store, TaskStatus::Open).await;

        let event = GatewayEvent {
            event_type: "payout.failed".to_string(),
            ..intent_event("evt_3", task_id, 10_000)
        };
        assert_eq!(pipeline.handle(event).await, WebhookDisposition::Ignored);

        let mut tx = store.begin().await.unwrap();
        assert!(tx.lock_task_money(task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn broken_events_are_quarantined_not_thrown() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = recovery(store.clone());

        // Intent event naming a task that does not exist
        let event = intent_event("evt_4", Uuid::new_v4(), 10_000);
        assert_eq!(pipeline.handle(event).await, WebhookDisposition::Quarantined);
    }
}
