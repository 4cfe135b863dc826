//! Row types and their mapping to domain values.
//!
//! Enums are stored as their lowercase names, counts as `BIGINT` and
//! structured blobs (KYC, asset details) as `JSONB`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use estate_core::types::{
    Asset, AssetDetails, AssetKind, InvestmentRequest, KycProfile, KycSnapshot, ReferralNode,
    ReferralUsage, Share, Transaction, User, WithdrawalRequest,
};
use estate_core::EstateError;

use crate::error::{DatabaseError, DatabaseResult};

fn parse<T>(table: &'static str, value: &str) -> DatabaseResult<T>
where
    T: FromStr<Err = EstateError>,
{
    value.parse().map_err(|e| DatabaseError::corrupt(table, e))
}

fn count(table: &'static str, column: &str, value: i64) -> DatabaseResult<u32> {
    u32::try_from(value)
        .map_err(|_| DatabaseError::corrupt(table, format!("{} out of range: {}", column, value)))
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub wallet_balance: Decimal,
    pub rewards_balance: Decimal,
    pub is_admin: bool,
    pub referral_number: String,
    pub kyc: Json<KycProfile>,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            name: row.name,
            email: row.email,
            password_hash: row.password_hash,
            wallet_balance: row.wallet_balance,
            rewards_balance: row.rewards_balance,
            is_admin: row.is_admin,
            referral_number: row.referral_number,
            kyc: row.kyc.0,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub location: String,
    pub total_price: Decimal,
    pub total_shares: i64,
    pub shares_available: i64,
    pub monthly_rent: Decimal,
    pub is_closed: bool,
    pub kind: String,
    pub details: Json<AssetDetails>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for Asset {
    type Error = DatabaseError;

    fn try_from(row: AssetRow) -> DatabaseResult<Self> {
        let kind: AssetKind = parse("assets", &row.kind)?;
        let details = row.details.0;
        if details.kind() != kind {
            return Err(DatabaseError::corrupt(
                "assets",
                format!("asset {} is tagged {} but carries {} details", row.id, kind, details.kind()),
            ));
        }

        Ok(Asset {
            id: row.id,
            title: row.title,
            description: row.description,
            location: row.location,
            total_price: row.total_price,
            total_shares: count("assets", "total_shares", row.total_shares)?,
            shares_available: count("assets", "shares_available", row.shares_available)?,
            monthly_rent: row.monthly_rent,
            is_closed: row.is_closed,
            details,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ShareRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub asset_kind: String,
    pub share_price: Decimal,
    pub purchased_at: DateTime<Utc>,
    pub last_payout_at: Option<DateTime<Utc>>,
    pub investment_request_id: Option<Uuid>,
}

impl TryFrom<ShareRow> for Share {
    type Error = DatabaseError;

    fn try_from(row: ShareRow) -> DatabaseResult<Self> {
        Ok(Share {
            id: row.id,
            user_id: row.user_id,
            asset_id: row.asset_id,
            asset_kind: parse("shares", &row.asset_kind)?,
            share_price: row.share_price,
            purchased_at: row.purchased_at,
            last_payout_at: row.last_payout_at,
            investment_request_id: row.investment_request_id,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub kind: String,
    pub account: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = DatabaseError;

    fn try_from(row: TransactionRow) -> DatabaseResult<Self> {
        Ok(Transaction {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            kind: parse("transactions", &row.kind)?,
            account: parse("transactions", &row.account)?,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct InvestmentRequestRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub asset_kind: String,
    pub shares_requested: i64,
    pub kyc: Json<KycSnapshot>,
    pub referrer_user_id: Option<Uuid>,
    pub status: String,
    pub admin_notes: Option<String>,
    pub missing_documents: Vec<String>,
    pub reviewed_by: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub contract_ref: Option<String>,
}

impl TryFrom<InvestmentRequestRow> for InvestmentRequest {
    type Error = DatabaseError;

    fn try_from(row: InvestmentRequestRow) -> DatabaseResult<Self> {
        Ok(InvestmentRequest {
            id: row.id,
            user_id: row.user_id,
            asset_id: row.asset_id,
            asset_kind: parse("investment_requests", &row.asset_kind)?,
            shares_requested: count("investment_requests", "shares_requested", row.shares_requested)?,
            kyc: row.kyc.0,
            referrer_user_id: row.referrer_user_id,
            status: parse("investment_requests", &row.status)?,
            admin_notes: row.admin_notes,
            missing_documents: row.missing_documents,
            reviewed_by: row.reviewed_by,
            submitted_at: row.submitted_at,
            reviewed_at: row.reviewed_at,
            contract_ref: row.contract_ref,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct WithdrawalRequestRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub payment_method: String,
    pub account_details: Option<String>,
    pub status: String,
    pub admin_notes: Option<String>,
    pub processed_by: Option<Uuid>,
    pub submitted_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WithdrawalRequestRow> for WithdrawalRequest {
    type Error = DatabaseError;

    fn try_from(row: WithdrawalRequestRow) -> DatabaseResult<Self> {
        Ok(WithdrawalRequest {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            payment_method: parse("withdrawal_requests", &row.payment_method)?,
            account_details: row.account_details,
            status: parse("withdrawal_requests", &row.status)?,
            admin_notes: row.admin_notes,
            processed_by: row.processed_by,
            submitted_at: row.submitted_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ReferralNodeRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub asset_id: Uuid,
    pub asset_kind: String,
    pub code: String,
    pub referrer_node_id: Option<Uuid>,
    pub level: i64,
    pub rewards_earned: Decimal,
    pub joined_at: DateTime<Utc>,
}

impl TryFrom<ReferralNodeRow> for ReferralNode {
    type Error = DatabaseError;

    fn try_from(row: ReferralNodeRow) -> DatabaseResult<Self> {
        Ok(ReferralNode {
            id: row.id,
            user_id: row.user_id,
            asset_id: row.asset_id,
            asset_kind: parse("referral_nodes", &row.asset_kind)?,
            code: row.code,
            referrer_node_id: row.referrer_node_id,
            level: count("referral_nodes", "level", row.level)?,
            rewards_earned: row.rewards_earned,
            joined_at: row.joined_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ReferralUsageRow {
    pub id: Uuid,
    pub referrer_user_id: Uuid,
    pub referee_user_id: Uuid,
    pub asset_id: Uuid,
    pub asset_kind: String,
    pub investment_amount: Decimal,
    pub shares_purchased: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ReferralUsageRow> for ReferralUsage {
    type Error = DatabaseError;

    fn try_from(row: ReferralUsageRow) -> DatabaseResult<Self> {
        Ok(ReferralUsage {
            id: row.id,
            referrer_user_id: row.referrer_user_id,
            referee_user_id: row.referee_user_id,
            asset_id: row.asset_id,
            asset_kind: parse("referral_usages", &row.asset_kind)?,
            investment_amount: row.investment_amount,
            shares_purchased: count("referral_usages", "shares_purchased", row.shares_purchased)?,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estate_core::types::{InvestmentStatus, TransactionKind};
    use rust_decimal_macros::dec;

    fn asset_row(kind: &str, details: AssetDetails) -> AssetRow {
        AssetRow {
            id: Uuid::new_v4(),
            title: "Sheikh Zayed Villa".to_string(),
            description: String::new(),
            location: "Giza".to_string(),
            total_price: dec!(5000000),
            total_shares: 500,
            shares_available: 120,
            monthly_rent: dec!(25000),
            is_closed: false,
            kind: kind.to_string(),
            details: Json(details),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_asset_row_mapping() {
        let asset = Asset::try_from(asset_row("unit", AssetDetails::Unit)).unwrap();
        assert_eq!(asset.shares_available, 120);
        assert_eq!(asset.share_price(), dec!(10000));

        let err = Asset::try_from(asset_row("vehicle", AssetDetails::Unit)).unwrap_err();
        assert!(matches!(err, DatabaseError::Corrupt { table: "assets", .. }));

        let mut negative = asset_row("unit", AssetDetails::Unit);
        negative.shares_available = -1;
        assert!(Asset::try_from(negative).is_err());
    }

    #[test]
    fn test_enum_columns() {
        let row = TransactionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: dec!(-120),
            kind: "reward_payout".to_string(),
            account: "rewards".to_string(),
            description: "payout".to_string(),
            created_at: Utc::now(),
        };
        let tx = Transaction::try_from(row.clone()).unwrap();
        assert_eq!(tx.kind, TransactionKind::RewardPayout);

        let bad = TransactionRow {
            kind: "bonus".to_string(),
            ..row
        };
        assert!(Transaction::try_from(bad).is_err());
        assert_eq!(
            parse::<InvestmentStatus>("investment_requests", "under_review").unwrap(),
            InvestmentStatus::UnderReview
        );
    }
}
