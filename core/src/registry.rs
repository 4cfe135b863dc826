//! Share registry: the only component that issues shares or moves the asset
//! availability counter and closed flag.

use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EstateError, EstateResult};
use crate::store::Session;
use crate::types::{Asset, AssetId, InvestmentRequestId, NewAsset, Share, UserId};

/// New values for an asset's registry-owned columns
#[derive(Debug, Clone, PartialEq)]
pub struct AssetCounters {
    asset_id: AssetId,
    shares_available: u32,
    is_closed: bool,
}

impl AssetCounters {
    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn shares_available(&self) -> u32 {
        self.shares_available
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }
}

/// Shares to insert together with the counters they consume
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    shares: Vec<Share>,
    counters: AssetCounters,
}

impl Allocation {
    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn counters(&self) -> &AssetCounters {
        &self.counters
    }
}

/// Result of closing an asset
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub asset: Asset,
    /// False when the asset was already closed
    pub changed: bool,
}

/// Maintains share ownership and asset availability
#[derive(Debug, Clone)]
pub struct ShareRegistry {
    clock: Arc<dyn Clock>,
}

impl ShareRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Validates and inserts a new asset with every share available
    #[instrument(skip(self, session, new_asset), fields(title = %new_asset.title))]
    pub async fn create_asset(
        &self,
        session: &mut dyn Session,
        new_asset: NewAsset,
    ) -> EstateResult<Asset> {
        if new_asset.title.trim().is_empty() {
            return Err(EstateError::invalid("asset title is required"));
        }
        if new_asset.total_shares == 0 {
            return Err(EstateError::invalid("total_shares must be at least 1"));
        }
        if new_asset.total_price <= Decimal::ZERO {
            return Err(EstateError::invalid("total_price must be positive"));
        }
        if new_asset.monthly_rent < Decimal::ZERO {
            return Err(EstateError::invalid("monthly_rent must not be negative"));
        }

        let asset = Asset {
            id: Uuid::new_v4(),
            title: new_asset.title,
            description: new_asset.description,
            location: new_asset.location,
            total_price: new_asset.total_price,
            total_shares: new_asset.total_shares,
            shares_available: new_asset.total_shares,
            monthly_rent: new_asset.monthly_rent,
            is_closed: false,
            details: new_asset.details,
            created_at: self.clock.now(),
        };
        session.insert_asset(&asset).await?;

        info!(asset_id = %asset.id, kind = %asset.kind(), total_shares = asset.total_shares, "Asset created");
        Ok(asset)
    }

    /// Issues `count` shares of `asset_id` to `user_id`.
    ///
    /// Holds the asset row for the rest of the session, so concurrent
    /// allocations against the last shares are decided one at a time.
    #[instrument(skip(self, session))]
    pub async fn allocate(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        asset_id: AssetId,
        count: u32,
        investment_request_id: Option<InvestmentRequestId>,
    ) -> EstateResult<Vec<Share>> {
        if count == 0 {
            return Err(EstateError::invalid("share count must be at least 1"));
        }

        let asset = lock_asset(session, asset_id).await?;
        if !asset.can_allocate(count) {
            return Err(EstateError::NotAvailable {
                asset_id,
                requested: count,
                available: if asset.is_closed { 0 } else { asset.shares_available },
            });
        }

        let now = self.clock.now();
        let share_price = asset.share_price();
        let shares: Vec<Share> = (0..count)
            .map(|_| Share {
                id: Uuid::new_v4(),
                user_id,
                asset_id,
                asset_kind: asset.kind(),
                share_price,
                purchased_at: now,
                last_payout_at: None,
                investment_request_id,
            })
            .collect();

        let remaining = asset.shares_available - count;
        let allocation = Allocation {
            shares,
            counters: AssetCounters {
                asset_id,
                shares_available: remaining,
                is_closed: remaining == 0,
            },
        };
        session.apply_allocation(&allocation).await?;

        if remaining == 0 {
            info!(asset_id = %asset_id, "Asset sold out and closed");
        }

        Ok(allocation.shares)
    }

    /// Sets the closed flag; no further shares can be sold
    #[instrument(skip(self, session))]
    pub async fn close(&self, session: &mut dyn Session, asset_id: AssetId) -> EstateResult<Closure> {
        let mut asset = lock_asset(session, asset_id).await?;
        if asset.is_closed {
            return Ok(Closure {
                asset,
                changed: false,
            });
        }

        let counters = AssetCounters {
            asset_id,
            shares_available: asset.shares_available,
            is_closed: true,
        };
        session.apply_asset_counters(&counters).await?;
        asset.is_closed = true;

        info!(asset_id = %asset_id, "Asset closed by operator");
        Ok(Closure {
            asset,
            changed: true,
        })
    }

    /// Number of shares `user_id` holds in `asset_id`
    pub async fn holdings(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<u32> {
        let count = session
            .shares_for_user(user_id)
            .await?
            .iter()
            .filter(|s| s.asset_id == asset_id)
            .count();
        Ok(count as u32)
    }

    /// Distinct holders of `asset_id`
    pub async fn investors(&self, session: &mut dyn Session, asset_id: AssetId) -> EstateResult<Vec<UserId>> {
        let mut seen = HashSet::new();
        let investors = session
            .shares_for_asset(asset_id)
            .await?
            .into_iter()
            .filter_map(|s| seen.insert(s.user_id).then_some(s.user_id))
            .collect();
        Ok(investors)
    }

    /// Sold proportion `(T - A) / T`
    pub async fn completion(&self, session: &mut dyn Session, asset_id: AssetId) -> EstateResult<Decimal> {
        let asset = session
            .asset(asset_id)
            .await?
            .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))?;
        Ok(asset.completion())
    }
}

async fn lock_asset(session: &mut dyn Session, asset_id: AssetId) -> EstateResult<Asset> {
    session
        .lock_asset(asset_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))
}
