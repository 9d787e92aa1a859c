//! End-to-end money lifecycle scenarios against the in-memory store
//! and the fake gateway

mod common;

use common::*;

use uuid::Uuid;

use hustle_core::alerts::AlertKind;
use hustle_core::authority::AuthorityLevel;
use hustle_core::engine::{Actor, EventContext};
use hustle_core::error::ErrorKind;
use hustle_core::gateway::PaymentGateway;
use hustle_core::models::{MoneyEvent, MoneyState, PayoutType, RefundStatus, TaskStatus};
use hustle_core::store::{EscrowStore, StoreTx};
use hustle_core::CoreError;

#[tokio::test]
async fn happy_path_hold_complete_release() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;

    // Hold: 12% platform fee comes out of the gross
    let transition = hold_escrow(&h, &t, 10_000).await.unwrap();
    assert_eq!(transition.to, MoneyState::Held);
    let hold = transition.hold.unwrap();
    assert_eq!(hold.gross_amount, 10_000);
    assert_eq!(hold.platform_fee_amount, 1_200);
    assert_eq!(hold.net_payout_amount, 8_800);

    prove_and_complete(&h, &t).await;

    let transition = release_payout(&h, &t).await.unwrap();
    assert_eq!(transition.to, MoneyState::Released);
    let payout = transition.payout.unwrap();
    assert_eq!(payout.net_amount, 8_800);
    assert_eq!(payout.fee_amount, 0);
    assert_eq!(payout.worker_id, t.worker);

    let award = transition.award.unwrap();
    assert!(!award.already_awarded);
    assert!(award.applied > 0);

    // The worker's balance at the gateway reflects the transfer
    assert_eq!(
        h.gateway.retrieve_balance(&worker_account(&t)).await.unwrap(),
        8_800
    );

    // One xp row, keyed by the task
    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.xp_total(t.worker).await.unwrap(), award.applied);
    let entry = award.entry.unwrap();
    assert_eq!(entry.task_id, t.task_id);

    // A second release is a replay, not a second payout
    drop(tx);
    let err = release_payout(&h, &t).await.unwrap_err();
    match err {
        CoreError::IdempotentReplay { state } => assert_eq!(state, MoneyState::Released),
        other => panic!("expected idempotent replay, got {other:?}"),
    }
    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.xp_total(t.worker).await.unwrap(), award.applied);
}

#[tokio::test]
async fn pre_capture_refund_returns_funds_and_cancels_the_task() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();

    let transition = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::RefundEscrow,
            EventContext::refund(Actor::poster(t.poster)),
        )
        .await
        .unwrap();
    assert_eq!(transition.to, MoneyState::Refunded);

    // The intent was cancelled, nothing was transferred, no xp
    assert_eq!(h.gateway.canceled_intents().len(), 1);
    let mut tx = h.store.begin().await.unwrap();
    assert!(tx.get_payout_for_task(t.task_id).await.unwrap().is_none());
    assert_eq!(tx.xp_total(t.worker).await.unwrap(), 0);
    let task = tx.get_task(t.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    // Refund again: replay with the prior result
    drop(tx);
    let err = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::RefundEscrow,
            EventContext::refund(Actor::poster(t.poster)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdempotentReplay);
}

#[tokio::test]
async fn strangers_cannot_refund_a_held_escrow() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();

    let err = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::RefundEscrow,
            EventContext::refund(Actor::poster(Uuid::new_v4())),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[tokio::test]
async fn force_refund_with_sufficient_balance_keeps_the_xp() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();
    prove_and_complete(&h, &t).await;
    let release = release_payout(&h, &t).await.unwrap();
    let awarded = release.award.unwrap().applied;

    let transition = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::ForceRefund,
            EventContext::force_refund(Actor::admin(Uuid::new_v4())),
        )
        .await
        .unwrap();
    assert_eq!(transition.to, MoneyState::Refunded);

    // Transfer clawed back, charge refunded to the poster
    let payout = transition.payout.unwrap();
    assert_eq!(h.gateway.reversed_amount(&payout.gateway_transfer_id), 8_800);
    assert_eq!(h.gateway.refunded_charges().len(), 1);

    // The xp ledger is append-only: the award survives the reversal
    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(tx.xp_total(t.worker).await.unwrap(), awarded);

    // The lock is now immutable for everything
    drop(tx);
    let err = release_payout(&h, &t).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
}

#[tokio::test]
async fn force_refund_with_insufficient_balance_locks_the_worker() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();
    prove_and_complete(&h, &t).await;
    release_payout(&h, &t).await.unwrap();

    // The worker has already spent most of the payout
    h.gateway.set_balance(&worker_account(&t), 100);

    let err = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::ForceRefund,
            EventContext::force_refund(Actor::admin(Uuid::new_v4())),
        )
        .await
        .unwrap_err();
    match err {
        CoreError::NegativeBalance {
            worker_id,
            needed,
            available,
        } => {
            assert_eq!(worker_id, t.worker);
            assert_eq!(needed, 8_800);
            assert_eq!(available, 100);
        }
        other => panic!("expected negative balance, got {other:?}"),
    }

    wait_for_alerts(&h.ops, AlertKind::LedgerDriftDetected, 1).await;

    let mut tx = h.store.begin().await.unwrap();
    let lock = tx.lock_task_money(t.task_id).await.unwrap().unwrap();
    assert_eq!(lock.current_state, MoneyState::Released);
    assert_eq!(lock.refund_status, Some(RefundStatus::Failed));
    assert!(tx.is_account_locked(t.worker).await.unwrap());

    // The follow-up job landed in the queue
    let due = tx.claim_due_jobs(chrono::Utc::now(), 10).await.unwrap();
    assert!(due.iter().any(|j| j.kind == "reconcile_negative_balance"));
}

#[tokio::test]
async fn partial_force_refund_lands_in_partial_refund() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();
    prove_and_complete(&h, &t).await;
    release_payout(&h, &t).await.unwrap();

    let transition = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::ForceRefund,
            EventContext::force_refund_partial(Actor::admin(Uuid::new_v4()), 4_000),
        )
        .await
        .unwrap();
    assert_eq!(transition.to, MoneyState::PartialRefund);

    let payout = transition.payout.unwrap();
    assert_eq!(h.gateway.reversed_amount(&payout.gateway_transfer_id), 4_000);

    // Terminal: a second forced refund replays
    let err = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::ForceRefund,
            EventContext::force_refund(Actor::admin(Uuid::new_v4())),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdempotentReplay);
}

#[tokio::test]
async fn release_requires_an_accepted_proof() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();

    // Submit and reject the proof, then push the task to COMPLETED via
    // the dispute path to isolate the proof precondition
    let receipt = h
        .core
        .proofs
        .submit(
            t.task_id,
            t.worker,
            hustle_core::proofs::ProofPayload {
                photo_urls: vec!["https://cdn.hustle.example/blurry.jpg".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.core.proofs.reject(receipt.proof_id, "photo is unusable").await.unwrap();

    let mut tx = h.store.begin().await.unwrap();
    tx.transition_task(t.task_id, TaskStatus::Disputed).await.unwrap();
    tx.transition_task(t.task_id, TaskStatus::Completed).await.unwrap();
    tx.commit().await.unwrap();

    let err = release_payout(&h, &t).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    // The hold is untouched and refundable
    let mut tx = h.store.begin().await.unwrap();
    let lock = tx.lock_task_money(t.task_id).await.unwrap().unwrap();
    assert_eq!(lock.current_state, MoneyState::Held);
}

#[tokio::test]
async fn instant_payout_fee_is_borne_by_the_worker() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();
    prove_and_complete(&h, &t).await;

    let transition = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::ReleasePayout,
            EventContext::instant_release(Actor::admin(Uuid::new_v4()), worker_account(&t)),
        )
        .await
        .unwrap();

    let payout = transition.payout.unwrap();
    assert_eq!(payout.payout_type, PayoutType::Instant);
    // 1.5% of 8_800 = 132, deducted from the worker's net
    assert_eq!(payout.fee_amount, 132);
    assert_eq!(payout.net_amount, 8_668);
    assert_eq!(payout.fee_amount + payout.net_amount, 8_800);
}

#[tokio::test]
async fn dispute_freezes_then_admin_refunds() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();

    let transition = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::LockDispute,
            EventContext::dispute(Actor::poster(t.poster), "work not finished"),
        )
        .await
        .unwrap();
    assert_eq!(transition.to, MoneyState::LockedDispute);

    let mut tx = h.store.begin().await.unwrap();
    assert_eq!(
        tx.get_task(t.task_id).await.unwrap().unwrap().status,
        TaskStatus::Disputed
    );
    drop(tx);

    // A frozen task no longer accepts proof submissions
    let receipt = h
        .core
        .proofs
        .submit(
            t.task_id,
            t.worker,
            hustle_core::proofs::ProofPayload {
                photo_urls: vec!["https://cdn.hustle.example/done.jpg".to_string()],
                ..Default::default()
            },
        )
        .await
        .map(|r| r.proof_id);
    // Submission requires ACCEPTED; under dispute it is refused
    assert!(receipt.is_err());

    // Proofless dispute resolutions refund instead
    let transition = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::RefundEscrow,
            EventContext::refund(Actor::admin(Uuid::new_v4())),
        )
        .await
        .unwrap();
    assert_eq!(transition.to, MoneyState::Refunded);
}

#[tokio::test]
async fn ai_proposed_money_actions_are_rejected_by_name() {
    let h = harness();

    // Scenario: the orchestrator plans createTask -> ... -> awardXP
    let decision = h.core.authority.validate("awardXP", "xp.award");
    assert!(!decision.allowed);
    assert_eq!(decision.required_level, AuthorityLevel::A0Forbidden);

    // And the engine enforces the same rule before any side effect
    let t = seed_accepted_task(&h, 10_000).await;
    let err = h
        .core
        .engine
        .handle(
            t.task_id,
            MoneyEvent::HoldEscrow,
            EventContext::hold(Actor::ai(), "pm_card_ok", 10_000),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthorityViolation);

    let mut tx = h.store.begin().await.unwrap();
    assert!(tx.lock_task_money(t.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn summaries_reflect_the_lifecycle() {
    let h = harness();
    let t = seed_accepted_task(&h, 10_000).await;
    hold_escrow(&h, &t, 10_000).await.unwrap();
    prove_and_complete(&h, &t).await;
    let release = release_payout(&h, &t).await.unwrap();

    let wallet = h.store.wallet_summary(t.worker).await.unwrap();
    assert_eq!(wallet.released_total, 8_800);
    assert_eq!(wallet.held_total, 0);

    let profile = h.store.profile_summary(t.worker).await.unwrap();
    assert_eq!(profile.xp_total, release.award.unwrap().applied);
    assert_eq!(profile.completed_tasks, 1);
    assert!(profile.badges.contains(&"first_gig".to_string()));
}
