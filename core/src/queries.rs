//! Derived read-only views.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{EstateError, EstateResult};
use crate::store::Session;
use crate::types::{Asset, AssetId, AssetKind, AssetStatus, UserId};

/// A user's position in one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub asset_id: AssetId,
    pub asset_title: String,
    pub asset_kind: AssetKind,
    pub shares: u32,
    /// Sum of issuance prices
    pub invested: Decimal,
    pub expected_monthly_income: Decimal,
    pub asset_completion: Decimal,
}

/// Holdings grouped by asset plus totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub holdings: Vec<Holding>,
    pub total_shares: u64,
    pub total_invested: Decimal,
    pub expected_monthly_income: Decimal,
}

/// Listing figures for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetStats {
    pub asset: Asset,
    pub status: AssetStatus,
    pub investors: usize,
    pub shares_sold: u32,
    pub completion: Decimal,
    pub share_price: Decimal,
    pub income_per_share: Decimal,
}

pub async fn portfolio(session: &mut dyn Session, user_id: UserId) -> EstateResult<Portfolio> {
    let shares = session.shares_for_user(user_id).await?;

    let mut grouped: BTreeMap<AssetId, (u32, Decimal)> = BTreeMap::new();
    for share in &shares {
        let entry = grouped.entry(share.asset_id).or_insert((0, Decimal::ZERO));
        entry.0 += 1;
        entry.1 += share.share_price;
    }

    let mut portfolio = Portfolio::default();
    for (asset_id, (count, invested)) in grouped {
        let asset = session
            .asset(asset_id)
            .await?
            .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))?;
        let income = asset.income_per_share() * Decimal::from(count);

        portfolio.total_shares += u64::from(count);
        portfolio.total_invested += invested;
        portfolio.expected_monthly_income += income;
        portfolio.holdings.push(Holding {
            asset_id,
            asset_title: asset.title.clone(),
            asset_kind: asset.kind(),
            shares: count,
            invested,
            expected_monthly_income: income,
            asset_completion: asset.completion(),
        });
    }

    portfolio
        .holdings
        .sort_by(|a, b| b.invested.cmp(&a.invested).then(a.asset_title.cmp(&b.asset_title)));
    Ok(portfolio)
}

pub async fn asset_stats(session: &mut dyn Session, asset_id: AssetId) -> EstateResult<AssetStats> {
    let asset = session
        .asset(asset_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))?;
    let investors: HashSet<UserId> = session
        .shares_for_asset(asset_id)
        .await?
        .into_iter()
        .map(|s| s.user_id)
        .collect();

    Ok(AssetStats {
        status: asset.status(),
        investors: investors.len(),
        shares_sold: asset.shares_sold(),
        completion: asset.completion(),
        share_price: asset.share_price(),
        income_per_share: asset.income_per_share(),
        asset,
    })
}

/// Open assets first, then by creation time, newest first
pub async fn asset_listing(session: &mut dyn Session) -> EstateResult<Vec<Asset>> {
    let mut assets = session.list_assets().await?;
    assets.sort_by(|a, b| {
        (a.status() == AssetStatus::Closed)
            .cmp(&(b.status() == AssetStatus::Closed))
            .then(b.created_at.cmp(&a.created_at))
    });
    Ok(assets)
}
