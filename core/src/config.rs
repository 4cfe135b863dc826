//! Engine configuration
//!
//! Loaded from an optional `estate.toml` / `config/estate.toml` file and then
//! from environment variables (`REFERRAL_REWARD_RATE`, `MIN_WITHDRAWAL`,
//! `SCHEDULER_TIMEZONE`, `REFERRAL_DEPTH_CAP`, ...). Every monetary policy
//! constant of the engine lives here and nowhere else.

use chrono_tz::Tz;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EstateError, EstateResult};

/// How an approved investment is paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FundingPolicy {
    /// Paid outside the platform; approval records a memo transaction only
    External,
    /// Paid from the investor's wallet; approval debits it
    Wallet,
}

/// Policy constants recognised by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Fraction of an approved investment credited to the direct referrer
    pub referral_reward_rate: Decimal,

    /// Multiplier applied per upline level beyond the direct referrer
    pub referral_upline_decay: Decimal,

    /// Smallest withdrawal a user may request
    pub min_withdrawal: Decimal,

    /// IANA zone used for month-boundary arithmetic and scheduling
    pub scheduler_timezone: String,

    /// Maximum traversal depth for upline/downline queries
    pub referral_depth_cap: usize,

    /// Funding model for approved investments
    pub funding_policy: FundingPolicy,

    /// Local hour at which the daily payout tick fires
    pub payout_hour: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            referral_reward_rate: Decimal::new(5, 4), // 0.05%
            referral_upline_decay: Decimal::new(1, 1),
            min_withdrawal: Decimal::new(100, 0),
            scheduler_timezone: "Africa/Cairo".to_string(),
            referral_depth_cap: 10,
            funding_policy: FundingPolicy::External,
            payout_hour: 0,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from config files and the environment
    pub fn from_env() -> EstateResult<Self> {
        let config = Config::builder()
            .add_source(File::with_name("estate").required(false))
            .add_source(File::with_name("config/estate").required(false))
            .add_source(Environment::default().try_parsing(false))
            .build()?;

        let engine_config: EngineConfig = config.try_deserialize()?;
        engine_config.validate()?;

        info!(
            reward_rate = %engine_config.referral_reward_rate,
            min_withdrawal = %engine_config.min_withdrawal,
            timezone = %engine_config.scheduler_timezone,
            funding = ?engine_config.funding_policy,
            "Engine configuration loaded"
        );

        Ok(engine_config)
    }

    /// Validates configuration
    pub fn validate(&self) -> EstateResult<()> {
        if self.referral_reward_rate <= Decimal::ZERO || self.referral_reward_rate >= Decimal::ONE {
            return Err(EstateError::Configuration(format!(
                "referral_reward_rate must be in (0, 1), got {}",
                self.referral_reward_rate
            )));
        }

        if self.referral_upline_decay < Decimal::ZERO || self.referral_upline_decay > Decimal::ONE {
            return Err(EstateError::Configuration(format!(
                "referral_upline_decay must be in [0, 1], got {}",
                self.referral_upline_decay
            )));
        }

        if self.min_withdrawal <= Decimal::ZERO {
            return Err(EstateError::Configuration(
                "min_withdrawal must be positive".to_string(),
            ));
        }

        if self.referral_depth_cap == 0 {
            return Err(EstateError::Configuration(
                "referral_depth_cap must be at least 1".to_string(),
            ));
        }

        if self.payout_hour > 23 {
            return Err(EstateError::Configuration(format!(
                "payout_hour must be between 0 and 23, got {}",
                self.payout_hour
            )));
        }

        self.timezone()?;
        Ok(())
    }

    /// Parsed scheduler timezone
    pub fn timezone(&self) -> EstateResult<Tz> {
        self.scheduler_timezone.parse::<Tz>().map_err(|_| {
            EstateError::Configuration(format!(
                "unknown scheduler timezone '{}'",
                self.scheduler_timezone
            ))
        })
    }
}
