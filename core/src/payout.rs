//! Payout engine: credits accrued monthly rent to shareholders.
//!
//! Each share is settled in its own session with the share row locked. The
//! number of months owed is derived from the approval date and the last
//! payout stamp, so re-running the sweep within a month credits nothing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::clock::{months_elapsed, Clock};
use crate::config::EngineConfig;
use crate::error::{EstateError, EstateResult};
use crate::ledger::Ledger;
use crate::notify::{dispatch, Effects, NotificationKind, NotificationSink};
use crate::store::{Session, Store};
use crate::types::{
    AssetId, InvestmentStatus, Share, ShareId, Transaction, TransactionKind, UserId,
};

/// Marks a share as paid up to `paid_at`
#[derive(Debug, Clone, PartialEq)]
pub struct PayoutStamp {
    share_id: ShareId,
    paid_at: DateTime<Utc>,
}

impl PayoutStamp {
    pub fn share_id(&self) -> ShareId {
        self.share_id
    }

    pub fn paid_at(&self) -> DateTime<Utc> {
        self.paid_at
    }
}

/// Settlement of one share
#[derive(Debug, Clone, PartialEq)]
pub struct SharePayout {
    pub share_id: ShareId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub months: u32,
    pub amount: Decimal,
    /// Absent when the asset's rent is zero
    pub transaction: Option<Transaction>,
}

/// A share the sweep could not settle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayoutFailure {
    pub share_id: ShareId,
    pub error: String,
}

/// Aggregate result of one sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayoutSummary {
    /// Shares examined
    pub processed: usize,
    /// Shares that received a credit
    pub credited: usize,
    pub distributed: Decimal,
    pub errors: Vec<PayoutFailure>,
}

#[derive(Debug, Clone)]
pub struct PayoutEngine {
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    ledger: Ledger,
}

impl PayoutEngine {
    pub fn new(clock: Arc<dyn Clock>, config: Arc<EngineConfig>, ledger: Ledger) -> Self {
        Self {
            clock,
            config,
            ledger,
        }
    }

    /// Settles every share, one session per share.
    ///
    /// A failing share is rolled back and reported; the sweep carries on.
    /// Rental income notifications are grouped per (user, asset) and sent
    /// once every share has been committed.
    #[instrument(skip(self, store, sink))]
    pub async fn sweep(
        &self,
        store: &dyn Store,
        sink: &dyn NotificationSink,
    ) -> EstateResult<PayoutSummary> {
        let share_ids = {
            let mut session = store.begin().await?;
            let ids = session.share_ids().await?;
            session.rollback().await?;
            ids
        };

        let mut summary = PayoutSummary::default();
        let mut credited: BTreeMap<(UserId, AssetId), (Decimal, usize)> = BTreeMap::new();

        for share_id in share_ids {
            summary.processed += 1;
            match self.settle_in_session(store, share_id).await {
                Ok(Some(payout)) if payout.amount > Decimal::ZERO => {
                    summary.credited += 1;
                    summary.distributed += payout.amount;
                    let entry = credited
                        .entry((payout.user_id, payout.asset_id))
                        .or_insert((Decimal::ZERO, 0));
                    entry.0 += payout.amount;
                    entry.1 += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(share_id = %share_id, error = %e, "Share payout failed");
                    summary.errors.push(PayoutFailure {
                        share_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut effects = Effects::new();
        for ((user_id, asset_id), (amount, shares)) in credited {
            effects.notify(
                user_id,
                NotificationKind::RentalIncome,
                json!({
                    "asset_id": asset_id,
                    "amount": amount.to_string(),
                    "shares": shares,
                }),
            );
        }
        dispatch(sink, effects).await;

        info!(
            processed = summary.processed,
            credited = summary.credited,
            distributed = %summary.distributed,
            errors = summary.errors.len(),
            "Payout sweep finished"
        );
        Ok(summary)
    }

    async fn settle_in_session(
        &self,
        store: &dyn Store,
        share_id: ShareId,
    ) -> EstateResult<Option<SharePayout>> {
        let mut session = store.begin().await?;
        match self.pay_share(session.as_mut(), share_id).await {
            Ok(payout) => {
                session.commit().await?;
                Ok(payout)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(share_id = %share_id, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Credits whatever whole months `share_id` is owed and stamps it.
    ///
    /// Returns `None` when nothing is owed.
    #[instrument(skip(self, session))]
    pub async fn pay_share(
        &self,
        session: &mut dyn Session,
        share_id: ShareId,
    ) -> EstateResult<Option<SharePayout>> {
        let share = session
            .lock_share(share_id)
            .await?
            .ok_or_else(|| EstateError::not_found(format!("share {}", share_id)))?;
        let asset = session
            .asset(share.asset_id)
            .await?
            .ok_or_else(|| EstateError::not_found(format!("asset {}", share.asset_id)))?;

        let tz = self.config.timezone()?;
        let now = self.clock.now();
        let approved_at = self.approval_date(session, &share).await?;

        let owed = months_elapsed(approved_at, now, tz);
        let paid = share
            .last_payout_at
            .map(|at| months_elapsed(approved_at, at, tz))
            .unwrap_or(0);
        let months = owed.saturating_sub(paid);
        if months == 0 {
            debug!(share_id = %share_id, "Nothing owed");
            return Ok(None);
        }

        let amount = asset.income_per_share() * Decimal::from(months);
        let transaction = if amount > Decimal::ZERO {
            let period = now.with_timezone(&tz).format("%Y-%m").to_string();
            let description = format!(
                "Rental income for {} ({} month(s) through {})",
                asset.title, months, period
            );
            Some(
                self.ledger
                    .credit_wallet(
                        session,
                        share.user_id,
                        amount,
                        TransactionKind::RentalIncome,
                        &description,
                    )
                    .await?,
            )
        } else {
            None
        };

        session
            .apply_payout_stamp(&PayoutStamp {
                share_id,
                paid_at: now,
            })
            .await?;

        Ok(Some(SharePayout {
            share_id,
            user_id: share.user_id,
            asset_id: asset.id,
            months,
            amount,
            transaction,
        }))
    }

    /// Review timestamp of the approved request behind the share, falling
    /// back to the purchase timestamp
    async fn approval_date(
        &self,
        session: &mut dyn Session,
        share: &Share,
    ) -> EstateResult<DateTime<Utc>> {
        if let Some(request_id) = share.investment_request_id {
            if let Some(request) = session.investment_request(request_id).await? {
                if request.status == InvestmentStatus::Approved {
                    if let Some(reviewed_at) = request.reviewed_at {
                        return Ok(reviewed_at);
                    }
                }
            }
        }

        let fallback = session
            .approved_investment_request(share.user_id, share.asset_id)
            .await?
            .and_then(|r| r.reviewed_at);
        Ok(fallback.unwrap_or(share.purchased_at))
    }
}
