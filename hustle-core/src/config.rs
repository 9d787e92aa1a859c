//! Configuration for the money and trust core
//!
//! Defaults layered with `HUSTLE_`-prefixed environment variables
//! (double underscore for nesting, e.g. `HUSTLE_FEES__PLATFORM_FEE_BPS`).

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::gateway::http::HttpGatewayConfig;
use crate::proofs::ProofGateConfig;
use crate::rewards::RewardConfig;
use crate::CoreResult;

/// Platform fee schedule, in basis points of the gross amount
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSettings {
    /// Platform cut taken out of every escrow hold
    pub platform_fee_bps: u32,
    /// Extra fee the worker pays for an instant payout
    pub instant_payout_fee_bps: u32,
}

impl Default for FeeSettings {
    fn default() -> Self {
        Self {
            platform_fee_bps: 1_200,      // 12%
            instant_payout_fee_bps: 150,  // 1.5%
        }
    }
}

/// Payment gateway endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    pub base_url: String,
    pub secret_key: String,
    /// Endpoint secret for webhook signature verification
    pub webhook_secret: String,
    pub request_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.stripe.com".to_string(),
            secret_key: String::new(),
            webhook_secret: String::new(),
            request_timeout_secs: 20,
        }
    }
}

impl From<&GatewaySettings> for HttpGatewayConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            secret_key: settings.secret_key.clone(),
            request_timeout_secs: settings.request_timeout_secs,
        }
    }
}

/// Operator alert delivery endpoints; both optional
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertSettings {
    pub webhook_url: Option<String>,
    pub fallback_webhook_url: Option<String>,
}

/// Top-level configuration for a [`crate::Core`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub idempotency_cache_size: usize,
    pub fees: FeeSettings,
    pub gateway: GatewaySettings,
    pub alerts: AlertSettings,
    pub rewards: RewardConfig,
    pub proofs: ProofGateConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/hustle".to_string(),
            max_connections: 5,
            idempotency_cache_size: 4_096,
            fees: FeeSettings::default(),
            gateway: GatewaySettings::default(),
            alerts: AlertSettings::default(),
            rewards: RewardConfig::default(),
            proofs: ProofGateConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load defaults layered with the process environment
    pub fn from_env() -> CoreResult<Self> {
        dotenv::dotenv().ok();
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&CoreConfig::default()).map_err(cfg_err)?)
            .add_source(config::Environment::with_prefix("HUSTLE").separator("__"))
            .build()
            .map_err(cfg_err)?;
        settings.try_deserialize().map_err(cfg_err)
    }
}

fn cfg_err(err: config::ConfigError) -> CoreError {
    CoreError::internal(format!("configuration: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_published_fee_schedule() {
        let config = CoreConfig::default();
        assert_eq!(config.fees.platform_fee_bps, 1_200);
        assert_eq!(config.fees.instant_payout_fee_bps, 150);
        assert!(config.idempotency_cache_size > 0);
    }
}
