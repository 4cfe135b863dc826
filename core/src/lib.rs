//! # Estate Core
//!
//! Financial state engine for fractional ownership of rentable assets
//! (real-estate units and vehicles). Users buy equal shares of an asset
//! through an operator-reviewed investment workflow, receive monthly rental
//! income per share, earn referral rewards and withdraw wallet funds.
//!
//! ## Layout
//!
//! - [`ledger`]: the only writer of user balances
//! - [`registry`]: asset counters and share issuance
//! - [`investment`] / [`withdrawal`]: operator-reviewed workflows
//! - [`referral`]: per (user, asset) codes and multi-level rewards
//! - [`payout`]: month-aware rental income sweep
//! - [`engine`]: the facade tying them together over a [`store::Store`]
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use estate_core::prelude::*;
//!
//! # async fn run() -> EstateResult<()> {
//! let engine = EstateEngine::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .config(EngineConfig::default())
//!     .build()?;
//!
//! let user = engine.register_user("Mona", "mona@example.com", "hash").await?;
//! let summary = engine.run_payouts().await?;
//! # let _ = (user, summary);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod investment;
pub mod ledger;
pub mod memory;
pub mod notify;
pub mod payout;
pub mod queries;
pub mod referral;
pub mod registry;
pub mod store;
pub mod types;
pub mod withdrawal;

#[cfg(test)]
mod testing;

pub use engine::{EstateEngine, EstateEngineBuilder};
pub use error::{EstateError, EstateResult};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{EngineConfig, FundingPolicy};
    pub use crate::engine::EstateEngine;
    pub use crate::error::{EstateError, EstateResult};
    pub use crate::memory::MemoryStore;
    pub use crate::notify::{Notification, NotificationKind, NotificationSink, NullNotifier};
    pub use crate::payout::PayoutSummary;
    pub use crate::store::{Session, Store};
    pub use crate::types::*;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
