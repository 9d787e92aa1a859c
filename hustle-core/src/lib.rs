//! Money and trust core for the Hustle task marketplace
//!
//! This crate owns every monetary transition for a task and the
//! non-monetary rewards gated on them:
//! - a durable money state machine coordinated with the payment gateway
//!   via saga steps with known compensations
//! - an idempotent webhook recovery pipeline that heals crashes between
//!   a gateway success and the local commit
//! - an append-only reward ledger (experience, trust tiers, badges)
//! - the authority and proof gates that bound AI participation and task
//!   completion
//!
//! Transport, auth, the AI orchestrator, and the feed query live
//! outside; they call in through [`Core`].

pub mod alerts;
pub mod authority;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod jobs;
pub mod models;
pub mod proofs;
pub mod rewards;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use alerts::{AlertSink, WebhookAlertChannel};
use authority::AuthorityGate;
use config::CoreConfig;
use engine::MoneyStateEngine;
use gateway::http::HttpGatewayConfig;
use gateway::{HttpPaymentGateway, PaymentGateway};
use idempotency::IdempotencyGuard;
use proofs::ProofGate;
use rewards::RewardLedger;
use store::{EscrowStore, PostgresStore};
use webhook::WebhookRecovery;

pub use error::{CoreError, ErrorKind};

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// The assembled core: one value owning the store handle, the gateway
/// client, the alert sink, and the bounded idempotency cache. Handlers
/// receive it explicitly; there are no process-global singletons.
pub struct Core {
    pub config: CoreConfig,
    pub store: Arc<dyn EscrowStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub alerts: AlertSink,
    pub guard: Arc<IdempotencyGuard>,
    pub authority: AuthorityGate,
    pub engine: MoneyStateEngine,
    pub proofs: ProofGate,
    pub webhooks: WebhookRecovery,
}

impl Core {
    /// Wire a core from explicit parts. Tests pass an in-memory store
    /// and a fake gateway here.
    pub fn with_parts(
        config: CoreConfig,
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn PaymentGateway>,
        alerts: AlertSink,
    ) -> Self {
        let guard = Arc::new(IdempotencyGuard::new(config.idempotency_cache_size));
        let engine = MoneyStateEngine::new(
            store.clone(),
            gateway.clone(),
            alerts.clone(),
            RewardLedger::new(config.rewards.clone()),
            config.fees.clone(),
        );
        let proofs = ProofGate::new(store.clone(), config.proofs.clone());
        let webhooks = WebhookRecovery::new(
            store.clone(),
            guard.clone(),
            alerts.clone(),
            config.fees.clone(),
        );
        Self {
            config,
            store,
            gateway,
            alerts,
            guard,
            authority: AuthorityGate::new(),
            engine,
            proofs,
            webhooks,
        }
    }

    /// Connect to Postgres and the configured gateway
    pub async fn connect(config: CoreConfig) -> CoreResult<Self> {
        let store = Arc::new(
            PostgresStore::connect(&config.database_url, config.max_connections).await?,
        );
        let gateway = Arc::new(
            HttpPaymentGateway::new(HttpGatewayConfig::from(&config.gateway))
                .map_err(CoreError::Gateway)?,
        );

        let mut channels: Vec<Arc<dyn alerts::AlertChannel>> = Vec::new();
        if let Some(url) = &config.alerts.webhook_url {
            channels.push(Arc::new(WebhookAlertChannel::new("ops-primary", url)));
        }
        if let Some(url) = &config.alerts.fallback_webhook_url {
            channels.push(Arc::new(WebhookAlertChannel::new("ops-fallback", url)));
        }
        let alerts = AlertSink::new(channels);

        Ok(Self::with_parts(config, store, gateway, alerts))
    }
}
