//! Alert sink for invariant violations
//!
//! One-way, best-effort operator notification. Every alert is logged
//! first; delivery to the configured channels is fire-and-forget and
//! falls through to the next channel when one refuses. `fire` never
//! blocks the caller.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

/// Alert types the core raises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertKind {
    /// A forensic scan or reversal found ledgers out of agreement
    LedgerDriftDetected,
    /// Transfer reversal refused for insufficient destination funds
    NegativeBalance,
    /// A money saga failed mid-flight and was compensated
    SagaAborted,
    /// A saga compensation itself failed; manual follow-up required
    CompensationFailed,
    /// The store rejected a write to an append-only ledger
    AppendOnlyViolation,
    /// A terminal state machine row was asked to mutate
    TerminalMutationBlocked,
    /// A webhook event errored internally and was parked
    WebhookQuarantined,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LedgerDriftDetected => "LEDGER_DRIFT_DETECTED",
            Self::NegativeBalance => "NEGATIVE_BALANCE",
            Self::SagaAborted => "SAGA_ABORTED",
            Self::CompensationFailed => "COMPENSATION_FAILED",
            Self::AppendOnlyViolation => "APPEND_ONLY_VIOLATION",
            Self::TerminalMutationBlocked => "TERMINAL_MUTATION_BLOCKED",
            Self::WebhookQuarantined => "WEBHOOK_QUARANTINED",
        }
    }
}

/// A single operator alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub metadata: serde_json::Value,
    pub fired_at: DateTime<Utc>,
}

/// One delivery channel (webhook, pager, log)
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, alert: &Alert) -> Result<(), String>;
}

/// Multi-channel, never-blocking alert dispatcher
#[derive(Clone, Default)]
pub struct AlertSink {
    channels: Vec<Arc<dyn AlertChannel>>,
}

impl AlertSink {
    pub fn new(channels: Vec<Arc<dyn AlertChannel>>) -> Self {
        Self { channels }
    }

    /// Log-only sink
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Fire an alert. Logs synchronously, delivers asynchronously.
    pub fn fire(&self, kind: AlertKind, message: impl Into<String>, metadata: serde_json::Value) {
        let alert = Alert {
            kind,
            message: message.into(),
            metadata,
            fired_at: Utc::now(),
        };
        error!(
            kind = kind.as_str(),
            metadata = %alert.metadata,
            "{}",
            alert.message
        );

        if self.channels.is_empty() {
            return;
        }
        let channels = self.channels.clone();
        // Detach delivery so a slow channel can never block money paths.
        // Outside a runtime (sync tests) the log line above is the alert.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for channel in &channels {
                    match channel.deliver(&alert).await {
                        Ok(()) => return,
                        Err(reason) => warn!(
                            channel = channel.name(),
                            reason, "alert channel refused delivery, trying next"
                        ),
                    }
                }
                error!(kind = alert.kind.as_str(), "all alert channels refused delivery");
            });
        }
    }
}

/// Delivers alerts as JSON posts to an operations webhook
pub struct WebhookAlertChannel {
    name: String,
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertChannel {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }
}

/// Records alerts in memory; used by tests to assert on firing
#[derive(Default)]
pub struct MemoryAlertChannel {
    fired: std::sync::Mutex<Vec<Alert>>,
}

impl MemoryAlertChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fired(&self) -> Vec<Alert> {
        self.fired.lock().unwrap().clone()
    }

    pub fn count_of(&self, kind: AlertKind) -> usize {
        self.fired.lock().unwrap().iter().filter(|a| a.kind == kind).count()
    }
}

#[async_trait]
impl AlertChannel for MemoryAlertChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), String> {
        self.fired.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
