//! HTTPS payment gateway client
//!
//! Thin REST client for the card-processing gateway. Requests are
//! form-encoded with the secret key as a bearer token; every call
//! carries the configured deadline so a wedged gateway surfaces as
//! [`GatewayError::Timeout`] instead of a hung saga.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use super::{
    CaptureMethod, ChargeRef, CreateIntentRequest, GatewayError, GatewayResult, InstantPayout,
    IntentStatus, PaymentGateway, PaymentIntent, Transfer, TransferRequest,
};
use async_trait::async_trait;

/// Configuration for the HTTPS gateway client
#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    /// Gateway API origin
    pub base_url: String,
    /// Secret API key
    pub secret_key: String,
    /// Per-request deadline in seconds
    pub request_timeout_secs: u64,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.stripe.com".to_string(),
            secret_key: String::new(),
            request_timeout_secs: 20,
        }
    }
}

/// REST client for the payment gateway
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: HttpGatewayConfig,
}

#[derive(Deserialize)]
struct WireIntent {
    id: String,
    status: String,
    latest_charge: Option<String>,
}

#[derive(Deserialize)]
struct WireTransfer {
    id: String,
}

#[derive(Deserialize)]
struct WirePayout {
    id: String,
    #[serde(default)]
    fee: i64,
}

#[derive(Deserialize)]
struct WireBalance {
    available: Vec<WireBalanceEntry>,
}

#[derive(Deserialize)]
struct WireBalanceEntry {
    amount: i64,
}

#[derive(Deserialize)]
struct WireErrorBody {
    error: WireErrorDetail,
}

#[derive(Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl HttpPaymentGateway {
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> GatewayResult<T> {
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await
            .map_err(classify_transport)?;
        decode_response(response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> GatewayResult<T> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(classify_transport)?;
        decode_response(response).await
    }
}

fn classify_transport(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout(err.to_string())
    } else {
        GatewayError::Transport(err.to_string())
    }
}

async fn decode_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> GatewayResult<T> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;

    if status.is_success() {
        return serde_json::from_slice(&body).map_err(|e| GatewayError::Api {
            status: status.as_u16(),
            message: format!("undecodable success body: {e}"),
        });
    }

    match serde_json::from_slice::<WireErrorBody>(&body) {
        Ok(parsed) if parsed.error.code == "insufficient_funds" => {
            Err(GatewayError::InsufficientFunds)
        }
        Ok(parsed) if status.as_u16() == 402 => {
            Err(GatewayError::Declined(parsed.error.message))
        }
        Ok(parsed) => Err(GatewayError::Api {
            status: status.as_u16(),
            message: parsed.error.message,
        }),
        Err(_) => {
            warn!(status = status.as_u16(), "gateway returned undecodable error body");
            Err(GatewayError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

fn intent_status(raw: &str) -> IntentStatus {
    match raw {
        "requires_confirmation" => IntentStatus::RequiresConfirmation,
        "requires_capture" => IntentStatus::RequiresCapture,
        "processing" => IntentStatus::Processing,
        "succeeded" => IntentStatus::Succeeded,
        "canceled" => IntentStatus::Canceled,
        other => {
            warn!(status = other, "unknown intent status from gateway");
            IntentStatus::Processing
        }
    }
}

impl From<WireIntent> for PaymentIntent {
    fn from(wire: WireIntent) -> Self {
        Self {
            status: intent_status(&wire.status),
            id: wire.id,
            latest_charge_id: wire.latest_charge,
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn create_payment_intent(
        &self,
        req: &CreateIntentRequest,
    ) -> GatewayResult<PaymentIntent> {
        let capture = match req.capture_method {
            CaptureMethod::Manual => "manual",
            CaptureMethod::Automatic => "automatic",
        };
        let wire: WireIntent = self
            .post_form(
                "/v1/payment_intents",
                &[
                    ("amount", req.amount.to_string()),
                    ("currency", req.currency.clone()),
                    ("payment_method", req.payment_method.clone()),
                    ("capture_method", capture.to_string()),
                    ("metadata[task_id]", req.task_id.to_string()),
                ],
            )
            .await?;
        Ok(wire.into())
    }

    async fn confirm_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let wire: WireIntent = self
            .post_form(&format!("/v1/payment_intents/{intent_id}/confirm"), &[])
            .await?;
        Ok(wire.into())
    }

    async fn capture_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let wire: WireIntent = self
            .post_form(&format!("/v1/payment_intents/{intent_id}/capture"), &[])
            .await?;
        Ok(wire.into())
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<()> {
        let _: WireIntent = self
            .post_form(&format!("/v1/payment_intents/{intent_id}/cancel"), &[])
            .await?;
        Ok(())
    }

    async fn create_transfer(&self, req: &TransferRequest) -> GatewayResult<Transfer> {
        let mut form = vec![
            ("amount", req.amount.to_string()),
            ("currency", "usd".to_string()),
            ("destination", req.destination_account_id.clone()),
            ("transfer_group", req.transfer_group.clone()),
        ];
        if let Some(charge) = &req.source_charge {
            form.push(("source_transaction", charge.clone()));
        }
        let wire: WireTransfer = self.post_form("/v1/transfers", &form).await?;
        Ok(Transfer { id: wire.id })
    }

    async fn create_transfer_reversal(&self, transfer_id: &str, amount: i64) -> GatewayResult<()> {
        let _: WireTransfer = self
            .post_form(
                &format!("/v1/transfers/{transfer_id}/reversals"),
                &[("amount", amount.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn refund_charge(&self, charge: &ChargeRef) -> GatewayResult<()> {
        let form = match charge {
            ChargeRef::Charge(id) => ("charge", id.clone()),
            ChargeRef::PaymentIntent(id) => ("payment_intent", id.clone()),
        };
        let _: serde_json::Value = self.post_form("/v1/refunds", &[form]).await?;
        Ok(())
    }

    async fn create_instant_payout(
        &self,
        destination_account_id: &str,
        amount: i64,
    ) -> GatewayResult<InstantPayout> {
        let wire: WirePayout = self
            .post_form(
                "/v1/payouts",
                &[
                    ("amount", amount.to_string()),
                    ("currency", "usd".to_string()),
                    ("method", "instant".to_string()),
                    ("destination", destination_account_id.to_string()),
                ],
            )
            .await?;
        Ok(InstantPayout {
            id: wire.id,
            fee_amount: wire.fee,
        })
    }

    async fn retrieve_balance(&self, account_id: &str) -> GatewayResult<i64> {
        let wire: WireBalance = self
            .get_json(&format!("/v1/balance?account={account_id}"))
            .await?;
        Ok(wire.available.iter().map(|entry| entry.amount).sum())
    }
}
