//! PostgreSQL implementation of the durable store
//!
//! Raw parameterized queries over sqlx. The schema is bootstrapped in
//! code, including the append-only triggers that make the ledgers
//! reject update/delete below the application layer. Money events are
//! serialized per task by `SELECT ... FOR UPDATE` on `money_state_lock`
//! plus a transaction-scoped advisory lock for tasks that have no lock
//! row yet.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{EscrowStore, ProfileSummary, StoreTx, WalletSummary};
use crate::error::CoreError;
use crate::models::{
    AdminLock, BadgeAward, BalanceSnapshot, EscrowHold, GeoPoint, MoneyEvent, MoneyState,
    MoneyStateLock, PayoutStatus, PayoutType, ProofArtifact, ProofQuality, ProofState, QueuedJob,
    RefundStatus, Task, TaskCategory, TaskStatus, TrustChange, WorkerPayout, XpEntry,
};
use crate::CoreResult;

/// Postgres-backed [`EscrowStore`]
pub struct PostgresStore {
    pool: PgPool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id UUID PRIMARY KEY,
        poster_id UUID NOT NULL,
        assigned_worker_id UUID,
        category TEXT NOT NULL,
        price_cents BIGINT NOT NULL CHECK (price_cents > 0),
        status TEXT NOT NULL,
        deadline TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS money_state_lock (
        task_id UUID PRIMARY KEY,
        current_state TEXT NOT NULL CHECK (current_state IN
            ('initial', 'held', 'locked_dispute', 'released', 'refunded', 'partial_refund')),
        next_allowed_events TEXT[] NOT NULL,
        gateway_payment_intent_id TEXT,
        gateway_transfer_id TEXT,
        refund_status TEXT CHECK (refund_status IN ('pending', 'refunded', 'failed')),
        version BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS escrow_holds (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL UNIQUE,
        poster_id UUID NOT NULL,
        worker_id UUID NOT NULL,
        gross_amount BIGINT NOT NULL CHECK (gross_amount > 0),
        platform_fee_amount BIGINT NOT NULL CHECK (platform_fee_amount >= 0),
        net_payout_amount BIGINT NOT NULL CHECK (net_payout_amount >= 0),
        status TEXT NOT NULL,
        gateway_payment_intent_id TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        released_at TIMESTAMPTZ,
        refunded_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_escrow_holds_poster ON escrow_holds(poster_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS hustler_payouts (
        id UUID PRIMARY KEY,
        escrow_id UUID NOT NULL,
        task_id UUID NOT NULL UNIQUE,
        worker_id UUID NOT NULL,
        gateway_transfer_id TEXT NOT NULL,
        gateway_charge_id TEXT,
        destination_account_id TEXT,
        payout_type TEXT NOT NULL CHECK (payout_type IN ('standard', 'instant')),
        fee_amount BIGINT NOT NULL CHECK (fee_amount >= 0),
        net_amount BIGINT NOT NULL CHECK (net_amount >= 0),
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_hustler_payouts_worker ON hustler_payouts(worker_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processed_stripe_events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        received_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS xp_ledger (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        task_id UUID NOT NULL UNIQUE,
        base_amount BIGINT NOT NULL,
        decay_factor DOUBLE PRECISION NOT NULL,
        streak_multiplier DOUBLE PRECISION NOT NULL,
        final_amount BIGINT NOT NULL,
        awarded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_xp_ledger_user_awarded ON xp_ledger(user_id, awarded_at DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS proof_submissions (
        id UUID PRIMARY KEY,
        task_id UUID NOT NULL UNIQUE,
        worker_id UUID NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('submitted', 'accepted', 'rejected', 'expired')),
        quality TEXT NOT NULL CHECK (quality IN ('BASIC', 'STANDARD', 'ENHANCED')),
        photo_urls TEXT[] NOT NULL,
        note TEXT,
        geo_lat DOUBLE PRECISION,
        geo_lon DOUBLE PRECISION,
        captured_at TIMESTAMPTZ,
        rejection_reason TEXT,
        submitted_at TIMESTAMPTZ NOT NULL,
        resolved_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trust_ledger (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        old_tier SMALLINT NOT NULL,
        new_tier SMALLINT NOT NULL,
        reason TEXT NOT NULL,
        awarded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_trust_ledger_user ON trust_ledger(user_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS badge_ledger (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        badge_id TEXT NOT NULL,
        tier SMALLINT NOT NULL,
        awarded_at TIMESTAMPTZ NOT NULL,
        UNIQUE (user_id, badge_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS admin_locks (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        reason TEXT NOT NULL,
        locked_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_admin_locks_user ON admin_locks(user_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS balance_snapshots (
        id UUID PRIMARY KEY,
        worker_id UUID NOT NULL,
        account_id TEXT NOT NULL,
        balance BIGINT NOT NULL,
        reason TEXT NOT NULL,
        taken_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS job_queue (
        id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        payload JSONB NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        claimed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_job_queue_due ON job_queue(run_at) WHERE claimed_at IS NULL
    "#,
    r#"
    CREATE OR REPLACE FUNCTION hustle_append_only() RETURNS trigger AS $$
    BEGIN
        RAISE EXCEPTION 'append-only violation on %', TG_TABLE_NAME;
    END
    $$ LANGUAGE plpgsql
    "#,
];

const APPEND_ONLY_TABLES: &[&str] = &[
    "xp_ledger",
    "trust_ledger",
    "badge_ledger",
    "processed_stripe_events",
    "balance_snapshots",
];

impl PostgresStore {
    /// Connect and bootstrap the schema
    pub async fn connect(database_url: &str, max_connections: u32) -> CoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool without running migrations
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables, indexes, and append-only triggers
    pub async fn migrate(&self) -> CoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        for table in APPEND_ONLY_TABLES {
            let drop = format!("DROP TRIGGER IF EXISTS {table}_append_only ON {table}");
            sqlx::query(&drop).execute(&mut *tx).await.map_err(db_err)?;
            let create = format!(
                "CREATE TRIGGER {table}_append_only BEFORE UPDATE OR DELETE ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION hustle_append_only()"
            );
            sqlx::query(&create)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }
}

fn db_err(err: sqlx::Error) -> CoreError {
    let text = err.to_string();
    if text.contains("append-only violation") {
        CoreError::internal(text)
    } else {
        CoreError::storage(text)
    }
}

fn events_to_text(events: &[MoneyEvent]) -> Vec<String> {
    events.iter().map(|e| e.as_str().to_string()).collect()
}

fn parse_state(raw: &str) -> CoreResult<MoneyState> {
    MoneyState::parse(raw)
        .ok_or_else(|| CoreError::internal(format!("unknown money state in store: {raw}")))
}

fn task_from_row(row: &PgRow) -> CoreResult<Task> {
    let category: String = row.try_get("category").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(Task {
        id: row.try_get("id").map_err(db_err)?,
        poster_id: row.try_get("poster_id").map_err(db_err)?,
        assigned_worker_id: row.try_get("assigned_worker_id").map_err(db_err)?,
        category: TaskCategory::parse(&category)
            .ok_or_else(|| CoreError::internal(format!("unknown task category: {category}")))?,
        price_cents: row.try_get("price_cents").map_err(db_err)?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| CoreError::internal(format!("unknown task status: {status}")))?,
        deadline: row.try_get("deadline").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn lock_from_row(row: &PgRow) -> CoreResult<MoneyStateLock> {
    let state: String = row.try_get("current_state").map_err(db_err)?;
    let events: Vec<String> = row.try_get("next_allowed_events").map_err(db_err)?;
    let refund: Option<String> = row.try_get("refund_status").map_err(db_err)?;
    let mut allowed = Vec::with_capacity(events.len());
    for raw in &events {
        allowed.push(MoneyEvent::parse(raw).ok_or_else(|| {
            CoreError::internal(format!("unknown money event in store: {raw}"))
        })?);
    }
    Ok(MoneyStateLock {
        task_id: row.try_get("task_id").map_err(db_err)?,
        current_state: parse_state(&state)?,
        next_allowed_events: allowed,
        gateway_payment_intent_id: row.try_get("gateway_payment_intent_id").map_err(db_err)?,
        gateway_transfer_id: row.try_get("gateway_transfer_id").map_err(db_err)?,
        refund_status: refund
            .map(|raw| {
                RefundStatus::parse(&raw).ok_or_else(|| {
                    CoreError::internal(format!("unknown refund status in store: {raw}"))
                })
            })
            .transpose()?,
        version: row.try_get("version").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn hold_from_row(row: &PgRow) -> CoreResult<EscrowHold> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(EscrowHold {
        id: row.try_get("id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        poster_id: row.try_get("poster_id").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        gross_amount: row.try_get("gross_amount").map_err(db_err)?,
        platform_fee_amount: row.try_get("platform_fee_amount").map_err(db_err)?,
        net_payout_amount: row.try_get("net_payout_amount").map_err(db_err)?,
        status: parse_state(&status)?,
        gateway_payment_intent_id: row.try_get("gateway_payment_intent_id").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        released_at: row.try_get("released_at").map_err(db_err)?,
        refunded_at: row.try_get("refunded_at").map_err(db_err)?,
    })
}

fn payout_from_row(row: &PgRow) -> CoreResult<WorkerPayout> {
    let payout_type: String = row.try_get("payout_type").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(WorkerPayout {
        id: row.try_get("id").map_err(db_err)?,
        escrow_id: row.try_get("escrow_id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        gateway_transfer_id: row.try_get("gateway_transfer_id").map_err(db_err)?,
        gateway_charge_id: row.try_get("gateway_charge_id").map_err(db_err)?,
        destination_account_id: row.try_get("destination_account_id").map_err(db_err)?,
        payout_type: PayoutType::parse(&payout_type)
            .ok_or_else(|| CoreError::internal(format!("unknown payout type: {payout_type}")))?,
        fee_amount: row.try_get("fee_amount").map_err(db_err)?,
        net_amount: row.try_get("net_amount").map_err(db_err)?,
        status: PayoutStatus::parse(&status)
            .ok_or_else(|| CoreError::internal(format!("unknown payout status: {status}")))?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn proof_from_row(row: &PgRow) -> CoreResult<ProofArtifact> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let quality: String = row.try_get("quality").map_err(db_err)?;
    let lat: Option<f64> = row.try_get("geo_lat").map_err(db_err)?;
    let lon: Option<f64> = row.try_get("geo_lon").map_err(db_err)?;
    Ok(ProofArtifact {
        id: row.try_get("id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        worker_id: row.try_get("worker_id").map_err(db_err)?,
        state: ProofState::parse(&state)
            .ok_or_else(|| CoreError::internal(format!("unknown proof state: {state}")))?,
        quality: ProofQuality::parse(&quality)
            .ok_or_else(|| CoreError::internal(format!("unknown proof quality: {quality}")))?,
        photo_urls: row.try_get("photo_urls").map_err(db_err)?,
        note: row.try_get("note").map_err(db_err)?,
        geo: match (lat, lon) {
            (Some(lat), Some(lon)) => Some(GeoPoint { lat, lon }),
            _ => None,
        },
        captured_at: row.try_get("captured_at").map_err(db_err)?,
        rejection_reason: row.try_get("rejection_reason").map_err(db_err)?,
        submitted_at: row.try_get("submitted_at").map_err(db_err)?,
        resolved_at: row.try_get("resolved_at").map_err(db_err)?,
    })
}

fn xp_from_row(row: &PgRow) -> CoreResult<XpEntry> {
    Ok(XpEntry {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        task_id: row.try_get("task_id").map_err(db_err)?,
        base_amount: row.try_get("base_amount").map_err(db_err)?,
        decay_factor: row.try_get("decay_factor").map_err(db_err)?,
        streak_multiplier: row.try_get("streak_multiplier").map_err(db_err)?,
        final_amount: row.try_get("final_amount").map_err(db_err)?,
        awarded_at: row.try_get("awarded_at").map_err(db_err)?,
    })
}

fn job_from_row(row: &PgRow) -> CoreResult<QueuedJob> {
    Ok(QueuedJob {
        id: row.try_get("id").map_err(db_err)?,
        kind: row.try_get("kind").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
        run_at: row.try_get("run_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        claimed_at: row.try_get("claimed_at").map_err(db_err)?,
    })
}

struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn tx(&mut self) -> CoreResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| CoreError::internal("transaction already committed"))
    }
}

#[async_trait]
impl EscrowStore for PostgresStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgTx { tx: Some(tx) }))
    }

    async fn wallet_summary(&self, user_id: Uuid) -> CoreResult<WalletSummary> {
        let hold_row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(gross_amount) FILTER (WHERE status IN ('held', 'locked_dispute')), 0)::BIGINT
                    AS held_total,
                COALESCE(SUM(gross_amount) FILTER (WHERE status = 'refunded'), 0)::BIGINT
                    AS refunded_total
            FROM escrow_holds
            WHERE poster_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let payout_row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(net_amount) FILTER (WHERE status = 'completed'), 0)::BIGINT
                    AS released_total,
                COALESCE(SUM(net_amount) FILTER (WHERE status IN ('pending', 'processing')), 0)::BIGINT
                    AS pending_total
            FROM hustler_payouts
            WHERE worker_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(WalletSummary {
            held_total: hold_row.try_get("held_total").map_err(db_err)?,
            refunded_total: hold_row.try_get("refunded_total").map_err(db_err)?,
            released_total: payout_row.try_get("released_total").map_err(db_err)?,
            pending_payout_total: payout_row.try_get("pending_total").map_err(db_err)?,
        })
    }

    async fn profile_summary(&self, user_id: Uuid) -> CoreResult<ProfileSummary> {
        let xp_row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(final_amount), 0)::BIGINT AS xp_total, COUNT(*) AS completed
            FROM xp_ledger
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let tier_row = sqlx::query(
            r#"SELECT COALESCE(MAX(new_tier), 1)::SMALLINT AS tier FROM trust_ledger WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let badge_rows = sqlx::query(
            r#"SELECT badge_id FROM badge_ledger WHERE user_id = $1 ORDER BY awarded_at"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut badges = Vec::with_capacity(badge_rows.len());
        for row in &badge_rows {
            badges.push(row.try_get("badge_id").map_err(db_err)?);
        }

        Ok(ProfileSummary {
            xp_total: xp_row.try_get("xp_total").map_err(db_err)?,
            completed_tasks: xp_row.try_get("completed").map_err(db_err)?,
            trust_tier: tier_row.try_get("tier").map_err(db_err)?,
            badges,
        })
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn get_task(&mut self, task_id: Uuid) -> CoreResult<Option<Task>> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn insert_task(&mut self, task: &Task) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO tasks (id, poster_id, assigned_worker_id, category, price_cents,
                               status, deadline, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(task.id)
        .bind(task.poster_id)
        .bind(task.assigned_worker_id)
        .bind(task.category.as_str())
        .bind(task.price_cents)
        .bind(task.status.as_str())
        .bind(task.deadline)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn transition_task(&mut self, task_id: Uuid, to: TaskStatus) -> CoreResult<Task> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::storage(format!("no task {task_id}")))?;
        let task = task_from_row(&row)?;
        task.status.assert_transition(to)?;

        let updated = sqlx::query(
            "UPDATE tasks SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(task_id)
        .bind(to.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        task_from_row(&updated)
    }

    async fn assign_worker(&mut self, task_id: Uuid, worker_id: Uuid) -> CoreResult<()> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "UPDATE tasks SET assigned_worker_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::storage(format!("no task {task_id}")));
        }
        Ok(())
    }

    async fn lock_task_scope(&mut self, task_id: Uuid) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1::text, 7))")
            .bind(task_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn lock_task_money(&mut self, task_id: Uuid) -> CoreResult<Option<MoneyStateLock>> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM money_state_lock WHERE task_id = $1 FOR UPDATE")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn insert_money_lock(&mut self, lock: &MoneyStateLock) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO money_state_lock (task_id, current_state, next_allowed_events,
                gateway_payment_intent_id, gateway_transfer_id, refund_status, version,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(lock.task_id)
        .bind(lock.current_state.as_str())
        .bind(events_to_text(&lock.next_allowed_events))
        .bind(&lock.gateway_payment_intent_id)
        .bind(&lock.gateway_transfer_id)
        .bind(lock.refund_status.map(|s| s.as_str()))
        .bind(lock.version)
        .bind(lock.created_at)
        .bind(lock.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_money_lock(
        &mut self,
        lock: &MoneyStateLock,
        expected_version: i64,
    ) -> CoreResult<()> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            UPDATE money_state_lock
            SET current_state = $2,
                next_allowed_events = $3,
                gateway_payment_intent_id = $4,
                gateway_transfer_id = $5,
                refund_status = $6,
                version = $7,
                updated_at = $8
            WHERE task_id = $1
              AND version = $9
              AND current_state NOT IN ('refunded', 'partial_refund')
              AND (current_state <> 'released'
                   OR $2 IN ('released', 'refunded', 'partial_refund'))
            "#,
        )
        .bind(lock.task_id)
        .bind(lock.current_state.as_str())
        .bind(events_to_text(&lock.next_allowed_events))
        .bind(&lock.gateway_payment_intent_id)
        .bind(&lock.gateway_transfer_id)
        .bind(lock.refund_status.map(|s| s.as_str()))
        .bind(lock.version)
        .bind(lock.updated_at)
        .bind(expected_version)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Zero affected rows: classify the refusal
        let row = sqlx::query(
            "SELECT current_state, version FROM money_state_lock WHERE task_id = $1",
        )
        .bind(lock.task_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        match row {
            None => Err(CoreError::storage(format!(
                "no money lock for task {}",
                lock.task_id
            ))),
            Some(row) => {
                let state: String = row.try_get("current_state").map_err(db_err)?;
                let version: i64 = row.try_get("version").map_err(db_err)?;
                let state = parse_state(&state)?;
                if state.is_immutable() || state == MoneyState::Released {
                    Err(CoreError::internal(format!(
                        "terminal mutation blocked on money lock {} ({state})",
                        lock.task_id
                    )))
                } else {
                    Err(CoreError::concurrency(format!(
                        "money lock version moved: expected {expected_version}, found {version}"
                    )))
                }
            }
        }
    }

    async fn claim_refund(&mut self, task_id: Uuid) -> CoreResult<Option<MoneyStateLock>> {
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            UPDATE money_state_lock
            SET refund_status = 'pending', updated_at = NOW()
            WHERE task_id = $1
              AND (refund_status IS NULL OR refund_status = 'failed')
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(db_err)?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn set_refund_status(
        &mut self,
        task_id: Uuid,
        status: Option<RefundStatus>,
    ) -> CoreResult<()> {
        let tx = self.tx()?;
        let result = sqlx::query(
            "UPDATE money_state_lock SET refund_status = $2, updated_at = NOW() WHERE task_id = $1",
        )
        .bind(task_id)
        .bind(status.map(|s| s.as_str()))
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::storage(format!("no money lock for task {task_id}")));
        }
        Ok(())
    }

    async fn insert_escrow_hold(&mut self, hold: &EscrowHold) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO escrow_holds (id, task_id, poster_id, worker_id, gross_amount,
                platform_fee_amount, net_payout_amount, status, gateway_payment_intent_id,
                created_at, updated_at, released_at, refunded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(hold.id)
        .bind(hold.task_id)
        .bind(hold.poster_id)
        .bind(hold.worker_id)
        .bind(hold.gross_amount)
        .bind(hold.platform_fee_amount)
        .bind(hold.net_payout_amount)
        .bind(hold.status.as_str())
        .bind(&hold.gateway_payment_intent_id)
        .bind(hold.created_at)
        .bind(hold.updated_at)
        .bind(hold.released_at)
        .bind(hold.refunded_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_escrow_hold(&mut self, task_id: Uuid) -> CoreResult<Option<EscrowHold>> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM escrow_holds WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(hold_from_row).transpose()
    }

    async fn set_escrow_status(&mut self, task_id: Uuid, status: MoneyState) -> CoreResult<()> {
        let tx = self.tx()?;
        // Amount columns are never touched after insert (INV-4)
        let result = sqlx::query(
            r#"
            UPDATE escrow_holds
            SET status = $2,
                updated_at = NOW(),
                released_at = CASE WHEN $2 = 'released' THEN NOW() ELSE released_at END,
                refunded_at = CASE WHEN $2 IN ('refunded', 'partial_refund') THEN NOW()
                              ELSE refunded_at END
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CoreError::storage(format!("no escrow hold for task {task_id}")));
        }
        Ok(())
    }

    async fn insert_payout(&mut self, payout: &WorkerPayout) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO hustler_payouts (id, escrow_id, task_id, worker_id,
                gateway_transfer_id, gateway_charge_id, destination_account_id, payout_type,
                fee_amount, net_amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payout.id)
        .bind(payout.escrow_id)
        .bind(payout.task_id)
        .bind(payout.worker_id)
        .bind(&payout.gateway_transfer_id)
        .bind(&payout.gateway_charge_id)
        .bind(&payout.destination_account_id)
        .bind(payout.payout_type.as_str())
        .bind(payout.fee_amount)
        .bind(payout.net_amount)
        .bind(payout.status.as_str())
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_payout_for_task(&mut self, task_id: Uuid) -> CoreResult<Option<WorkerPayout>> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM hustler_payouts WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(payout_from_row).transpose()
    }

    async fn append_event(&mut self, event_id: &str, event_type: &str) -> CoreResult<bool> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            INSERT INTO processed_stripe_events (event_id, event_type, received_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_xp_entry(&mut self, entry: &XpEntry) -> CoreResult<bool> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            INSERT INTO xp_ledger (id, user_id, task_id, base_amount, decay_factor,
                streak_multiplier, final_amount, awarded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (task_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(entry.task_id)
        .bind(entry.base_amount)
        .bind(entry.decay_factor)
        .bind(entry.streak_multiplier)
        .bind(entry.final_amount)
        .bind(entry.awarded_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn xp_total(&mut self, user_id: Uuid) -> CoreResult<i64> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT COALESCE(SUM(final_amount), 0)::BIGINT AS total FROM xp_ledger WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        row.try_get("total").map_err(db_err)
    }

    async fn recent_awards(
        &mut self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<XpEntry>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM xp_ledger
            WHERE user_id = $1 AND awarded_at >= $2
            ORDER BY awarded_at DESC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(xp_from_row).collect()
    }

    async fn award_days(&mut self, user_id: Uuid, limit: i64) -> CoreResult<Vec<NaiveDate>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT (awarded_at AT TIME ZONE 'UTC')::date AS day
            FROM xp_ledger
            WHERE user_id = $1
            ORDER BY day DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter()
            .map(|row| row.try_get::<NaiveDate, _>("day").map_err(db_err))
            .collect()
    }

    async fn completed_task_count(&mut self, user_id: Uuid) -> CoreResult<i64> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM xp_ledger WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;
        row.try_get("n").map_err(db_err)
    }

    async fn net_earned_total(&mut self, user_id: Uuid) -> CoreResult<i64> {
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(net_amount), 0)::BIGINT AS total
            FROM hustler_payouts
            WHERE worker_id = $1 AND status = 'completed'
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        row.try_get("total").map_err(db_err)
    }

    async fn append_trust_change(&mut self, change: &TrustChange) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO trust_ledger (id, user_id, old_tier, new_tier, reason, awarded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(change.id)
        .bind(change.user_id)
        .bind(change.old_tier)
        .bind(change.new_tier)
        .bind(&change.reason)
        .bind(change.awarded_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn current_tier(&mut self, user_id: Uuid) -> CoreResult<i16> {
        let tx = self.tx()?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(new_tier), 1)::SMALLINT AS tier FROM trust_ledger WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        row.try_get("tier").map_err(db_err)
    }

    async fn append_badge(&mut self, award: &BadgeAward) -> CoreResult<bool> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            INSERT INTO badge_ledger (id, user_id, badge_id, tier, awarded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, badge_id) DO NOTHING
            "#,
        )
        .bind(award.id)
        .bind(award.user_id)
        .bind(&award.badge_id)
        .bind(award.tier)
        .bind(award.awarded_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_proof(&mut self, proof: &ProofArtifact) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO proof_submissions (id, task_id, worker_id, state, quality, photo_urls,
                note, geo_lat, geo_lon, captured_at, rejection_reason, submitted_at, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(proof.id)
        .bind(proof.task_id)
        .bind(proof.worker_id)
        .bind(proof.state.as_str())
        .bind(proof.quality.as_str())
        .bind(&proof.photo_urls)
        .bind(&proof.note)
        .bind(proof.geo.map(|g| g.lat))
        .bind(proof.geo.map(|g| g.lon))
        .bind(proof.captured_at)
        .bind(&proof.rejection_reason)
        .bind(proof.submitted_at)
        .bind(proof.resolved_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_proof(&mut self, proof_id: Uuid) -> CoreResult<Option<ProofArtifact>> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM proof_submissions WHERE id = $1")
            .bind(proof_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(proof_from_row).transpose()
    }

    async fn get_proof_for_task(&mut self, task_id: Uuid) -> CoreResult<Option<ProofArtifact>> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM proof_submissions WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(proof_from_row).transpose()
    }

    async fn update_proof_state(
        &mut self,
        proof_id: Uuid,
        state: ProofState,
        reason: Option<&str>,
    ) -> CoreResult<ProofArtifact> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT * FROM proof_submissions WHERE id = $1 FOR UPDATE")
            .bind(proof_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| CoreError::storage(format!("no proof {proof_id}")))?;
        let proof = proof_from_row(&row)?;
        proof.state.assert_transition(state)?;

        let updated = sqlx::query(
            r#"
            UPDATE proof_submissions
            SET state = $2, rejection_reason = $3, resolved_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(proof_id)
        .bind(state.as_str())
        .bind(reason)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)?;
        proof_from_row(&updated)
    }

    async fn insert_admin_lock(&mut self, lock: &AdminLock) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            "INSERT INTO admin_locks (id, user_id, reason, locked_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(lock.id)
        .bind(lock.user_id)
        .bind(&lock.reason)
        .bind(lock.locked_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn is_account_locked(&mut self, user_id: Uuid) -> CoreResult<bool> {
        let tx = self.tx()?;
        let row = sqlx::query("SELECT COUNT(*) AS n FROM admin_locks WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)?;
        let count: i64 = row.try_get("n").map_err(db_err)?;
        Ok(count > 0)
    }

    async fn insert_balance_snapshot(&mut self, snapshot: &BalanceSnapshot) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO balance_snapshots (id, worker_id, account_id, balance, reason, taken_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.worker_id)
        .bind(&snapshot.account_id)
        .bind(snapshot.balance)
        .bind(&snapshot.reason)
        .bind(snapshot.taken_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn enqueue_job(&mut self, job: &QueuedJob) -> CoreResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, kind, payload, run_at, created_at, claimed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(job.id)
        .bind(&job.kind)
        .bind(&job.payload)
        .bind(job.run_at)
        .bind(job.created_at)
        .bind(job.claimed_at)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn claim_due_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<QueuedJob>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            r#"
            UPDATE job_queue
            SET claimed_at = $1
            WHERE id IN (
                SELECT id FROM job_queue
                WHERE claimed_at IS NULL AND run_at <= $1
                ORDER BY run_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn stale_submitted_proofs(
        &mut self,
        cutoff: DateTime<Utc>,
    ) -> CoreResult<Vec<ProofArtifact>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM proof_submissions
            WHERE state = 'submitted' AND submitted_at < $1
            ORDER BY submitted_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(proof_from_row).collect()
    }

    async fn expired_open_tasks(&mut self, now: DateTime<Utc>) -> CoreResult<Vec<Task>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE status = 'OPEN' AND deadline IS NOT NULL AND deadline < $1
            ORDER BY deadline
            "#,
        )
        .bind(now)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn payouts_without_hold(&mut self) -> CoreResult<Vec<WorkerPayout>> {
        let tx = self.tx()?;
        let rows = sqlx::query(
            r#"
            SELECT p.* FROM hustler_payouts p
            LEFT JOIN escrow_holds h ON h.task_id = p.task_id
            WHERE h.id IS NULL
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(payout_from_row).collect()
    }

    async fn xp_without_release(&mut self) -> CoreResult<Vec<XpEntry>> {
        let tx = self.tx()?;
        // A forced refund legitimately leaves the lock terminal while the
        // xp row stays; the payout row proves the release happened.
        let rows = sqlx::query(
            r#"
            SELECT x.* FROM xp_ledger x
            LEFT JOIN money_state_lock l ON l.task_id = x.task_id
            LEFT JOIN hustler_payouts p ON p.task_id = x.task_id
            WHERE l.task_id IS NULL
               OR l.current_state NOT IN ('released', 'refunded', 'partial_refund')
               OR p.id IS NULL
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(xp_from_row).collect()
    }

    async fn commit(&mut self) -> CoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| CoreError::internal("transaction already committed"))?;
        tx.commit().await.map_err(db_err)
    }
}
