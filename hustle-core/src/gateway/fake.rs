//! Programmable in-process gateway double
//!
//! Simulates the payment gateway's observable behavior (intent
//! lifecycle, transfers, balances, reversals) so engine flows can be
//! exercised end to end without the network. Failure knobs let tests
//! drive every saga branch.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    CaptureMethod, ChargeRef, CreateIntentRequest, GatewayError, GatewayResult, InstantPayout,
    IntentStatus, PaymentGateway, PaymentIntent, Transfer, TransferRequest,
};

#[derive(Debug, Clone)]
struct FakeIntent {
    amount: i64,
    status: IntentStatus,
    charge_id: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeTransfer {
    amount: i64,
    destination: String,
    reversed_amount: i64,
}

#[derive(Default)]
struct FakeState {
    seq: u64,
    intents: HashMap<String, FakeIntent>,
    transfers: HashMap<String, FakeTransfer>,
    balances: HashMap<String, i64>,
    refunded_charges: Vec<String>,
    canceled_intents: Vec<String>,
    instant_payouts: Vec<(String, i64)>,
    declined_methods: HashSet<String>,
    fail_confirm: bool,
    fail_capture: bool,
    fail_transfer: bool,
    fail_refund: bool,
}

/// In-memory stand-in for the payment gateway
#[derive(Default)]
pub struct FakePaymentGateway {
    state: Mutex<FakeState>,
    /// Instant payout fee in basis points, deducted from the payout amount
    pub instant_fee_bps: u32,
}

impl FakePaymentGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            instant_fee_bps: 150, // 1.5%
        }
    }

    fn next_id(state: &mut FakeState, prefix: &str) -> String {
        state.seq += 1;
        format!("{}_{}", prefix, state.seq)
    }

    /// Make a payment method decline on intent creation
    pub fn decline_payment_method(&self, method: &str) {
        self.state
            .lock()
            .unwrap()
            .declined_methods
            .insert(method.to_string());
    }

    /// Fail the next confirm call with a timeout
    pub fn fail_next_confirm(&self) {
        self.state.lock().unwrap().fail_confirm = true;
    }

    /// Fail the next capture call
    pub fn fail_next_capture(&self) {
        self.state.lock().unwrap().fail_capture = true;
    }

    /// Fail the next transfer call
    pub fn fail_next_transfer(&self) {
        self.state.lock().unwrap().fail_transfer = true;
    }

    /// Fail the next charge refund call
    pub fn fail_next_refund(&self) {
        self.state.lock().unwrap().fail_refund = true;
    }

    /// Force a connected account's available balance
    pub fn set_balance(&self, account_id: &str, balance: i64) {
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(account_id.to_string(), balance);
    }

    /// Charges refunded so far, oldest first
    pub fn refunded_charges(&self) -> Vec<String> {
        self.state.lock().unwrap().refunded_charges.clone()
    }

    /// Intents canceled so far, oldest first
    pub fn canceled_intents(&self) -> Vec<String> {
        self.state.lock().unwrap().canceled_intents.clone()
    }

    /// Total amount reversed off a transfer
    pub fn reversed_amount(&self, transfer_id: &str) -> i64 {
        self.state
            .lock()
            .unwrap()
            .transfers
            .get(transfer_id)
            .map(|t| t.reversed_amount)
            .unwrap_or(0)
    }

    /// Instant payouts issued so far as (destination, amount after fee)
    pub fn instant_payouts(&self) -> Vec<(String, i64)> {
        self.state.lock().unwrap().instant_payouts.clone()
    }
}

#[async_trait]
impl PaymentGateway for FakePaymentGateway {
    async fn create_payment_intent(
        &self,
        req: &CreateIntentRequest,
    ) -> GatewayResult<PaymentIntent> {
        let mut state = self.state.lock().unwrap();
        if state.declined_methods.contains(&req.payment_method) {
            return Err(GatewayError::Declined(format!(
                "payment method {} was declined",
                req.payment_method
            )));
        }
        if req.amount <= 0 {
            return Err(GatewayError::Api {
                status: 400,
                message: "amount must be positive".to_string(),
            });
        }
        debug_assert_eq!(req.capture_method, CaptureMethod::Manual);

        let id = Self::next_id(&mut state, "pi");
        state.intents.insert(
            id.clone(),
            FakeIntent {
                amount: req.amount,
                status: IntentStatus::RequiresConfirmation,
                charge_id: None,
            },
        );
        Ok(PaymentIntent {
            id,
            status: IntentStatus::RequiresConfirmation,
            latest_charge_id: None,
        })
    }

    async fn confirm_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_confirm) {
            return Err(GatewayError::Timeout("confirm timed out".to_string()));
        }
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such intent {intent_id}"),
            })?;
        intent.status = IntentStatus::RequiresCapture;
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status: IntentStatus::RequiresCapture,
            latest_charge_id: None,
        })
    }

    async fn capture_payment_intent(&self, intent_id: &str) -> GatewayResult<PaymentIntent> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_capture) {
            return Err(GatewayError::Timeout("capture timed out".to_string()));
        }
        let charge_id = Self::next_id(&mut state, "ch");
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such intent {intent_id}"),
            })?;
        if intent.status != IntentStatus::RequiresCapture {
            return Err(GatewayError::Api {
                status: 400,
                message: format!("intent {intent_id} is not capturable"),
            });
        }
        intent.status = IntentStatus::Succeeded;
        intent.charge_id = Some(charge_id.clone());
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            status: IntentStatus::Succeeded,
            latest_charge_id: Some(charge_id),
        })
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such intent {intent_id}"),
            })?;
        // Cancel acts as refund when already captured
        if let Some(charge) = intent.charge_id.clone() {
            intent.status = IntentStatus::Canceled;
            state.refunded_charges.push(charge);
        } else {
            intent.status = IntentStatus::Canceled;
        }
        state.canceled_intents.push(intent_id.to_string());
        Ok(())
    }

    async fn create_transfer(&self, req: &TransferRequest) -> GatewayResult<Transfer> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_transfer) {
            return Err(GatewayError::Timeout("transfer timed out".to_string()));
        }
        let id = Self::next_id(&mut state, "tr");
        state.transfers.insert(
            id.clone(),
            FakeTransfer {
                amount: req.amount,
                destination: req.destination_account_id.clone(),
                reversed_amount: 0,
            },
        );
        *state
            .balances
            .entry(req.destination_account_id.clone())
            .or_insert(0) += req.amount;
        Ok(Transfer { id })
    }

    async fn create_transfer_reversal(&self, transfer_id: &str, amount: i64) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        let destination = state
            .transfers
            .get(transfer_id)
            .map(|t| t.destination.clone())
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("no such transfer {transfer_id}"),
            })?;
        let balance = state.balances.get(&destination).copied().unwrap_or(0);
        if balance < amount {
            return Err(GatewayError::InsufficientFunds);
        }
        *state.balances.get_mut(&destination).unwrap() -= amount;
        let transfer = state.transfers.get_mut(transfer_id).unwrap();
        transfer.reversed_amount += amount;
        Ok(())
    }

    async fn refund_charge(&self, charge: &ChargeRef) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_refund) {
            return Err(GatewayError::Timeout("refund timed out".to_string()));
        }
        let charge_id = match charge {
            ChargeRef::Charge(id) => id.clone(),
            ChargeRef::PaymentIntent(intent_id) => state
                .intents
                .get(intent_id)
                .and_then(|i| i.charge_id.clone())
                .ok_or_else(|| GatewayError::Api {
                    status: 400,
                    message: format!("intent {intent_id} has no charge to refund"),
                })?,
        };
        state.refunded_charges.push(charge_id);
        Ok(())
    }

    async fn create_instant_payout(
        &self,
        destination_account_id: &str,
        amount: i64,
    ) -> GatewayResult<InstantPayout> {
        let mut state = self.state.lock().unwrap();
        let balance = state
            .balances
            .get(destination_account_id)
            .copied()
            .unwrap_or(0);
        if balance < amount {
            return Err(GatewayError::InsufficientFunds);
        }
        let fee = amount * i64::from(self.instant_fee_bps) / 10_000;
        let id = Self::next_id(&mut state, "po");
        state
            .instant_payouts
            .push((destination_account_id.to_string(), amount - fee));
        Ok(InstantPayout {
            id,
            fee_amount: fee,
        })
    }

    async fn retrieve_balance(&self, account_id: &str) -> GatewayResult<i64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(account_id)
            .copied()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn intent_request(method: &str) -> CreateIntentRequest {
        CreateIntentRequest {
            amount: 10_000,
            currency: "usd".to_string(),
            payment_method: method.to_string(),
            capture_method: CaptureMethod::Manual,
            task_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn intent_lifecycle_create_confirm_capture() {
        let gateway = FakePaymentGateway::new();
        let intent = gateway
            .create_payment_intent(&intent_request("pm_card_ok"))
            .await
            .unwrap();
        assert_eq!(intent.status, IntentStatus::RequiresConfirmation);

        let intent = gateway.confirm_payment_intent(&intent.id).await.unwrap();
        assert_eq!(intent.status, IntentStatus::RequiresCapture);

        let intent = gateway.capture_payment_intent(&intent.id).await.unwrap();
        assert_eq!(intent.status, IntentStatus::Succeeded);
        assert!(intent.latest_charge_id.is_some());
    }

    #[tokio::test]
    async fn declined_method_never_creates_an_intent() {
        let gateway = FakePaymentGateway::new();
        gateway.decline_payment_method("pm_card_bad");
        let result = gateway
            .create_payment_intent(&intent_request("pm_card_bad"))
            .await;
        match result {
            Err(GatewayError::Declined(_)) => {}
            other => panic!("expected decline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reversal_respects_destination_balance() {
        let gateway = FakePaymentGateway::new();
        let transfer = gateway
            .create_transfer(&TransferRequest {
                amount: 8_800,
                destination_account_id: "acct_w1".to_string(),
                transfer_group: "task".to_string(),
                source_charge: None,
            })
            .await
            .unwrap();
        assert_eq!(gateway.retrieve_balance("acct_w1").await.unwrap(), 8_800);

        // Drain the account, then the reversal must refuse
        gateway.set_balance("acct_w1", 100);
        match gateway.create_transfer_reversal(&transfer.id, 8_800).await {
            Err(GatewayError::InsufficientFunds) => {}
            other => panic!("expected insufficient funds, got {other:?}"),
        }

        gateway.set_balance("acct_w1", 8_800);
        gateway
            .create_transfer_reversal(&transfer.id, 8_800)
            .await
            .unwrap();
        assert_eq!(gateway.reversed_amount(&transfer.id), 8_800);
        assert_eq!(gateway.retrieve_balance("acct_w1").await.unwrap(), 0);
    }
}
