#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use hustle_core::alerts::{AlertKind, AlertSink, MemoryAlertChannel};
use hustle_core::config::CoreConfig;
use hustle_core::engine::{Actor, EventContext, MoneyTransition};
use hustle_core::gateway::FakePaymentGateway;
use hustle_core::models::{MoneyEvent, Task, TaskCategory, TaskStatus};
use hustle_core::proofs::ProofPayload;
use hustle_core::store::{EscrowStore, MemoryStore};
use hustle_core::{Core, CoreResult};

/// A core wired against the in-memory store, the fake gateway, and a
/// recording alert channel
pub struct Harness {
    pub core: Core,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakePaymentGateway>,
    pub ops: Arc<MemoryAlertChannel>,
}

pub fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(FakePaymentGateway::new());
    let ops = MemoryAlertChannel::new();
    let alerts = AlertSink::new(vec![ops.clone()]);
    let core = Core::with_parts(
        CoreConfig::default(),
        store.clone(),
        gateway.clone(),
        alerts,
    );
    Harness {
        core,
        store,
        gateway,
        ops,
    }
}

pub struct SeededTask {
    pub task_id: Uuid,
    pub poster: Uuid,
    pub worker: Uuid,
}

/// Insert an ACCEPTED task with an assigned worker
pub async fn seed_accepted_task(h: &Harness, price_cents: i64) -> SeededTask {
    let poster = Uuid::new_v4();
    let worker = Uuid::new_v4();
    let mut task = Task::new(poster, TaskCategory::Cleaning, price_cents);
    task.status = TaskStatus::Accepted;
    task.assigned_worker_id = Some(worker);

    let mut tx = h.store.begin().await.unwrap();
    tx.insert_task(&task).await.unwrap();
    tx.commit().await.unwrap();

    SeededTask {
        task_id: task.id,
        poster,
        worker,
    }
}

/// Drive HOLD_ESCROW for a seeded task
pub async fn hold_escrow(h: &Harness, t: &SeededTask, amount: i64) -> CoreResult<MoneyTransition> {
    h.core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::HoldEscrow,
            EventContext::hold(Actor::poster(t.poster), "pm_card_ok", amount),
        )
        .await
}

/// Worker submits a photo proof, an admin accepts it, the task completes
pub async fn prove_and_complete(h: &Harness, t: &SeededTask) {
    let receipt = h
        .core
        .proofs
        .submit(
            t.task_id,
            t.worker,
            ProofPayload {
                photo_urls: vec!["https://cdn.hustle.example/proof.jpg".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.core.proofs.accept(receipt.proof_id).await.unwrap();
    h.core.proofs.complete_task(t.task_id).await.unwrap();
}

/// Drive RELEASE_PAYOUT to the worker's connected account
pub async fn release_payout(h: &Harness, t: &SeededTask) -> CoreResult<MoneyTransition> {
    h.core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::ReleasePayout,
            EventContext::release(Actor::admin(Uuid::new_v4()), worker_account(t)),
        )
        .await
}

pub fn worker_account(t: &SeededTask) -> String {
    format!("acct_{}", t.worker.simple())
}

/// Spin until the recording channel has seen `count` alerts of `kind`
pub async fn wait_for_alerts(ops: &MemoryAlertChannel, kind: AlertKind, count: usize) {
    for _ in 0..200 {
        if ops.count_of(kind) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} alert(s) of {:?}, saw {}", kind, ops.count_of(kind));
}
