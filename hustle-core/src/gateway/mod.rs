//! Payment gateway interface
//!
//! The gateway is network-attached state the core never owns: it is
//! authoritative for money in transit, while the core is authoritative
//! for the task's business lifecycle. Every method here is a saga step
//! with a known compensation; the engine decides which to pair.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

pub mod fake;
pub mod http;

pub use fake::FakePaymentGateway;
pub use http::HttpPaymentGateway;

/// Result type alias for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway failures the engine must distinguish
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The payment method was refused
    #[error("payment declined: {0}")]
    Declined(String),

    /// Transfer reversal refused: the destination balance is short.
    /// Modeled explicitly because it drives the NEGATIVE_BALANCE path.
    #[error("insufficient funds at destination")]
    InsufficientFunds,

    /// The call exceeded its deadline; the side effect may still have landed
    #[error("gateway timeout: {0}")]
    Timeout(String),

    /// The gateway rejected the request
    #[error("gateway api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Could not reach the gateway at all
    #[error("gateway transport error: {0}")]
    Transport(String),

    /// Webhook payload failed signature verification
    #[error("webhook signature mismatch")]
    InvalidSignature,

    /// Webhook payload could not be parsed
    #[error("malformed webhook payload: {0}")]
    MalformedEvent(String),
}

/// Capture mode for a payment intent; escrow always uses manual capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMethod {
    Automatic,
    Manual,
}

/// Payment intent lifecycle at the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    RequiresConfirmation,
    RequiresCapture,
    Processing,
    Succeeded,
    Canceled,
}

/// Request to authorize the poster's funds
#[derive(Debug, Clone)]
pub struct CreateIntentRequest {
    pub amount: i64,
    pub currency: String,
    pub payment_method: String,
    pub capture_method: CaptureMethod,
    pub task_id: Uuid,
}

/// Payment intent as the gateway reports it
#[derive(Debug, Clone)]
pub struct PaymentIntent {
    pub id: String,
    pub status: IntentStatus,
    pub latest_charge_id: Option<String>,
}

/// Request to move captured funds to the worker's connected account
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub amount: i64,
    pub destination_account_id: String,
    pub transfer_group: String,
    pub source_charge: Option<String>,
}

/// Transfer as the gateway reports it
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
}

/// Instant payout receipt; the fee is borne by the worker
#[derive(Debug, Clone)]
pub struct InstantPayout {
    pub id: String,
    pub fee_amount: i64,
}

/// Reference to a captured charge, directly or via its intent
#[derive(Debug, Clone)]
pub enum ChargeRef {
    Charge(String),
    PaymentIntent(String),
}

/// Gateway-verified webhook event, flattened to what the recovery
/// pipeline consumes
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub id: String,
    pub event_type: String,
    /// Id of the object the event describes (intent, transfer, payout, ...)
    pub object_id: Option<String>,
    pub amount: Option<i64>,
    pub task_id: Option<Uuid>,
    pub destination_account_id: Option<String>,
    pub source_charge: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent holding the poster's funds
    async fn create_payment_intent(&self, req: &CreateIntentRequest)
        -> GatewayResult<PaymentIntent>;

    /// Confirm a previously created intent
    async fn confirm_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent>;

    /// Capture a confirmed manual-capture intent
    async fn capture_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent>;

    /// Cancel an intent; acts as a refund if already captured
    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<()>;

    /// Transfer captured funds to a connected account
    async fn create_transfer(&self, req: &TransferRequest) -> GatewayResult<Transfer>;

    /// Claw a transfer back; may fail with [`GatewayError::InsufficientFunds`]
    async fn create_transfer_reversal(&self, transfer_id: &str, amount: i64) -> GatewayResult<()>;

    /// Refund a captured charge to the payer
    async fn refund_charge(&self, charge: &ChargeRef) -> GatewayResult<()>;

    /// Push funds to the worker's bank immediately, for a fee
    async fn create_instant_payout(
        &self,
        destination_account_id: &str,
        amount: i64,
    ) -> GatewayResult<InstantPayout>;

    /// Available balance on a connected account
    async fn retrieve_balance(&self, account_id: &str) -> GatewayResult<i64>;
}

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook delivery and parse it into a [`GatewayEvent`].
///
/// The signature header carries `t=<unix>,v1=<hex hmac>`; the mac is
/// computed over `"{t}.{raw body}"` with the endpoint secret.
pub fn verify_webhook(
    raw_body: &[u8],
    signature: &str,
    secret: &str,
) -> GatewayResult<GatewayEvent> {
    let mut timestamp: Option<&str> = None;
    let mut provided: Option<Vec<u8>> = None;
    for part in signature.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => {
                provided = Some(hex::decode(v).map_err(|_| GatewayError::InvalidSignature)?)
            }
            _ => {}
        }
    }
    let (timestamp, provided) = match (timestamp, provided) {
        (Some(t), Some(p)) => (t, p),
        _ => return Err(GatewayError::InvalidSignature),
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::InvalidSignature)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    mac.verify_slice(&provided)
        .map_err(|_| GatewayError::InvalidSignature)?;

    parse_event(raw_body)
}

/// Parse a verified webhook body
pub fn parse_event(raw_body: &[u8]) -> GatewayResult<GatewayEvent> {
    #[derive(Deserialize)]
    struct WireEvent {
        id: String,
        #[serde(rename = "type")]
        event_type: String,
        #[serde(default)]
        created: i64,
        data: WireData,
    }
    #[derive(Deserialize)]
    struct WireData {
        object: WireObject,
    }
    #[derive(Deserialize)]
    struct WireObject {
        id: Option<String>,
        amount: Option<i64>,
        #[serde(default)]
        metadata: std::collections::HashMap<String, String>,
        destination: Option<String>,
        source_transaction: Option<String>,
    }

    let wire: WireEvent = serde_json::from_slice(raw_body)
        .map_err(|e| GatewayError::MalformedEvent(e.to_string()))?;

    let task_id = wire
        .data
        .object
        .metadata
        .get("task_id")
        .and_then(|s| Uuid::parse_str(s).ok());

    Ok(GatewayEvent {
        id: wire.id,
        event_type: wire.event_type,
        object_id: wire.data.object.id,
        amount: wire.data.object.amount,
        task_id,
        destination_account_id: wire.data.object.destination,
        source_charge: wire.data.object.source_transaction,
        created_at: Utc
            .timestamp_opt(wire.created, 0)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

/// Compute the signature header value for a body; used by the fake
/// gateway and the tests to produce verifiable deliveries
pub fn sign_webhook(raw_body: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    let digest = mac.finalize().into_bytes();
    format!("t={},v1={}", timestamp, hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body(event_id: &str, task_id: Uuid) -> Vec<u8> {
        serde_json::json!({
            "id": event_id,
            "type": "payment_intent.succeeded",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "pi_123",
                "amount": 10_000,
                "metadata": { "task_id": task_id.to_string() }
            }}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn verify_round_trip() {
        let task_id = Uuid::new_v4();
        let body = sample_body("evt_1", task_id);
        let header = sign_webhook(&body, "whsec_test", 1_700_000_000);

        let event = verify_webhook(&body, &header, "whsec_test").unwrap();
        assert_eq!(event.id, "evt_1");
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.object_id.as_deref(), Some("pi_123"));
        assert_eq!(event.amount, Some(10_000));
        assert_eq!(event.task_id, Some(task_id));
    }

    #[test]
    fn verify_rejects_wrong_secret_and_tampering() {
        let body = sample_body("evt_2", Uuid::new_v4());
        let header = sign_webhook(&body, "whsec_test", 1_700_000_000);

        match verify_webhook(&body, &header, "whsec_other") {
            Err(GatewayError::InvalidSignature) => {}
            other => panic!("expected signature mismatch, got {other:?}"),
        }

        let mut tampered = body.clone();
        let pos = tampered.len() - 3;
        tampered[pos] ^= 1;
        match verify_webhook(&tampered, &header, "whsec_test") {
            Err(GatewayError::InvalidSignature) => {}
            other => panic!("expected signature mismatch, got {other:?}"),
        }
    }

    #[test]
    fn events_without_task_metadata_still_parse() {
        let body = serde_json::json!({
            "id": "evt_3",
            "type": "payout.paid",
            "data": { "object": { "id": "po_1" } }
        })
        .to_string()
        .into_bytes();

        let event = parse_event(&body).unwrap();
        assert_eq!(event.task_id, None);
        assert_eq!(event.object_id.as_deref(), Some("po_1"));
    }
}
