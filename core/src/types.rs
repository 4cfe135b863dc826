//! Core domain types for the fractional ownership engine.
//!
//! Entities reference each other by identifier only; nothing here embeds an
//! entity graph.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{EstateError, EstateResult};

/// Unique identifiers for domain entities
pub type UserId = Uuid;
pub type AssetId = Uuid;
pub type ShareId = Uuid;
pub type TransactionId = Uuid;
pub type InvestmentRequestId = Uuid;
pub type WithdrawalRequestId = Uuid;
pub type ReferralNodeId = Uuid;
pub type ReferralUsageId = Uuid;

/// Decimal places kept for credited amounts
pub const MONEY_SCALE: u32 = 2;

/// Rounds a monetary amount to [`MONEY_SCALE`] places, midpoint away from zero
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Stable lowercase name used in storage and notifications
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EstateError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(EstateError::invalid(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Identity and admin flag of the caller, supplied by the external auth layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub is_admin: bool,
}

impl Actor {
    /// A regular end user
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    /// An operator with the admin flag
    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    /// Fails unless the caller carries the admin flag
    pub fn require_admin(&self) -> EstateResult<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(EstateError::Unauthorized(format!(
                "user {} is not an operator",
                self.user_id
            )))
        }
    }

    /// Fails unless the caller is `user_id` or an operator
    pub fn require_access(&self, user_id: UserId) -> EstateResult<()> {
        if self.is_admin || self.user_id == user_id {
            Ok(())
        } else {
            Err(EstateError::Unauthorized(format!(
                "user {} cannot act for user {}",
                self.user_id, user_id
            )))
        }
    }
}

/// KYC attributes stored on the user profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycProfile {
    pub phone: Option<String>,
    pub national_id: Option<String>,
    pub address: Option<String>,
    pub date_of_birth: Option<String>,
    pub nationality: Option<String>,
    pub occupation: Option<String>,
}

impl KycProfile {
    /// True once every KYC attribute has a non-blank value
    pub fn is_complete(&self) -> bool {
        [
            &self.phone,
            &self.national_id,
            &self.address,
            &self.date_of_birth,
            &self.nationality,
            &self.occupation,
        ]
        .iter()
        .all(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
    }
}

/// Registered platform user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    /// Opaque credential material; verification happens outside the core
    pub password_hash: String,
    /// Liquid internal balance, written only through the ledger
    pub wallet_balance: Decimal,
    /// Segregated referral rewards, written only through the ledger
    pub rewards_balance: Decimal,
    pub is_admin: bool,
    pub referral_number: String,
    pub kyc: KycProfile,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Creates a user with empty balances and a referral number derived from its id
    pub fn new(name: String, email: String, password_hash: String, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name,
            email,
            password_hash,
            wallet_balance: Decimal::ZERO,
            rewards_balance: Decimal::ZERO,
            is_admin: false,
            referral_number: referral_number_for(id),
            kyc: KycProfile::default(),
            created_at: now,
        }
    }
}

/// Referral number derived from a user identity (`IPI` + 10 hex digits)
pub fn referral_number_for(id: UserId) -> String {
    let hex = id.simple().to_string().to_ascii_uppercase();
    format!("IPI{}", &hex[..10])
}

/// Variant tag of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    /// Real-estate unit
    Unit,
    /// Rentable vehicle
    Vehicle,
}

string_enum!(AssetKind {
    Unit => "unit",
    Vehicle => "vehicle",
});

/// Vehicle-specific descriptive fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDetails {
    pub brand: String,
    pub model: String,
    pub year: u16,
}

/// Variant-specific metadata; financial semantics are identical across variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetDetails {
    Unit,
    Vehicle(VehicleDetails),
}

impl AssetDetails {
    /// Variant tag for these details
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetDetails::Unit => AssetKind::Unit,
            AssetDetails::Vehicle(_) => AssetKind::Vehicle,
        }
    }
}

/// A rentable asset divided into a fixed number of equal shares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub title: String,
    pub description: String,
    pub location: String,
    pub total_price: Decimal,
    /// Fixed at creation, at least 1
    pub total_shares: u32,
    /// Maintained by the share registry
    pub shares_available: u32,
    pub monthly_rent: Decimal,
    /// Maintained by the share registry
    pub is_closed: bool,
    pub details: AssetDetails,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    /// Variant tag of this asset
    pub fn kind(&self) -> AssetKind {
        self.details.kind()
    }

    /// Price of a single share
    pub fn share_price(&self) -> Decimal {
        self.total_price / Decimal::from(self.total_shares)
    }

    /// Monthly rent attributable to one share, rounded to money precision
    pub fn income_per_share(&self) -> Decimal {
        round_money(self.monthly_rent / Decimal::from(self.total_shares))
    }

    /// Number of shares already issued
    pub fn shares_sold(&self) -> u32 {
        self.total_shares.saturating_sub(self.shares_available)
    }

    /// Proportion of shares sold, between 0 and 1
    pub fn completion(&self) -> Decimal {
        Decimal::from(self.shares_sold()) / Decimal::from(self.total_shares)
    }

    /// Checks if `count` shares could be issued right now
    pub fn can_allocate(&self, count: u32) -> bool {
        count >= 1 && !self.is_closed && self.shares_available >= count
    }

    /// Lifecycle label shown to investors
    pub fn status(&self) -> AssetStatus {
        if self.is_closed || self.shares_available == 0 {
            AssetStatus::Closed
        } else if self.shares_available == self.total_shares {
            AssetStatus::New
        } else {
            AssetStatus::Available
        }
    }
}

/// Derived listing status of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    New,
    Available,
    Closed,
}

/// Operator input for publishing an asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAsset {
    pub title: String,
    pub description: String,
    pub location: String,
    pub total_price: Decimal,
    pub total_shares: u32,
    pub monthly_rent: Decimal,
    pub details: AssetDetails,
}

/// Operator edit of descriptive fields; counters are never touched here
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub monthly_rent: Option<Decimal>,
    pub details: Option<AssetDetails>,
}

/// One indivisible ownership unit of an asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Share {
    pub id: ShareId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub asset_kind: AssetKind,
    /// Price at issuance
    pub share_price: Decimal,
    pub purchased_at: DateTime<Utc>,
    pub last_payout_at: Option<DateTime<Utc>>,
    /// Approved investment request that caused the issuance
    pub investment_request_id: Option<InvestmentRequestId>,
}

/// Kind of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    SharePurchase,
    RentalIncome,
    Reward,
    RewardPayout,
}

string_enum!(TransactionKind {
    Deposit => "deposit",
    Withdrawal => "withdrawal",
    SharePurchase => "share_purchase",
    RentalIncome => "rental_income",
    Reward => "reward",
    RewardPayout => "reward_payout",
});

/// Balance a transaction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceAccount {
    Wallet,
    Rewards,
    /// Observational record; no balance changes
    Memo,
}

string_enum!(BalanceAccount {
    Wallet => "wallet",
    Rewards => "rewards",
    Memo => "memo",
});

/// Immutable signed record of a balance change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub user_id: UserId,
    /// Positive is a credit, negative a debit; never zero
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub account: BalanceAccount,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Investment request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    DocumentsMissing,
}

string_enum!(InvestmentStatus {
    Pending => "pending",
    UnderReview => "under_review",
    Approved => "approved",
    Rejected => "rejected",
    DocumentsMissing => "documents_missing",
});

impl InvestmentStatus {
    /// Whether an operator decision may move the request from `self` to `next`.
    ///
    /// `documents_missing -> under_review` is not listed: only the owner's
    /// resubmission takes that edge.
    pub fn can_transition_to(&self, next: InvestmentStatus) -> bool {
        use InvestmentStatus::*;
        matches!(
            (self, next),
            (Pending, UnderReview)
                | (UnderReview, Approved)
                | (UnderReview, Rejected)
                | (UnderReview, DocumentsMissing)
        )
    }

    /// Approved and rejected requests never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvestmentStatus::Approved | InvestmentStatus::Rejected)
    }
}

/// References to identity documents uploaded by the external file service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycDocuments {
    pub id_front: String,
    pub id_back: String,
    pub proof_of_address: String,
}

/// KYC data captured with an investment request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycSnapshot {
    pub full_name: String,
    pub phone: String,
    pub national_id: String,
    pub address: String,
    pub date_of_birth: String,
    pub nationality: String,
    pub occupation: String,
    pub documents: KycDocuments,
}

impl KycSnapshot {
    /// Rejects the snapshot if any required field is blank
    pub fn validate(&self) -> EstateResult<()> {
        let fields = [
            ("full_name", &self.full_name),
            ("phone", &self.phone),
            ("national_id", &self.national_id),
            ("address", &self.address),
            ("date_of_birth", &self.date_of_birth),
            ("nationality", &self.nationality),
            ("occupation", &self.occupation),
            ("id_document_front", &self.documents.id_front),
            ("id_document_back", &self.documents.id_back),
            ("proof_of_address", &self.documents.proof_of_address),
        ];

        match fields.iter().find(|(_, value)| value.trim().is_empty()) {
            Some((name, _)) => Err(EstateError::invalid(format!(
                "KYC field {} is required",
                name
            ))),
            None => Ok(()),
        }
    }

    /// Profile attributes carried by this snapshot
    pub fn to_profile(&self) -> KycProfile {
        KycProfile {
            phone: Some(self.phone.clone()),
            national_id: Some(self.national_id.clone()),
            address: Some(self.address.clone()),
            date_of_birth: Some(self.date_of_birth.clone()),
            nationality: Some(self.nationality.clone()),
            occupation: Some(self.occupation.clone()),
        }
    }
}

/// A KYC-bearing proposal to purchase shares, subject to operator review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentRequest {
    pub id: InvestmentRequestId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub asset_kind: AssetKind,
    pub shares_requested: u32,
    pub kyc: KycSnapshot,
    pub referrer_user_id: Option<UserId>,
    pub status: InvestmentStatus,
    pub admin_notes: Option<String>,
    pub missing_documents: Vec<String>,
    pub reviewed_by: Option<UserId>,
    pub submitted_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub contract_ref: Option<String>,
}

/// Operator decision applied to an investment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewDecision {
    StartReview {
        notes: Option<String>,
    },
    Approve {
        notes: Option<String>,
    },
    Reject {
        notes: Option<String>,
    },
    RequestDocuments {
        notes: Option<String>,
        missing_documents: Vec<String>,
    },
}

impl ReviewDecision {
    /// Status the request moves to
    pub fn target(&self) -> InvestmentStatus {
        match self {
            ReviewDecision::StartReview { .. } => InvestmentStatus::UnderReview,
            ReviewDecision::Approve { .. } => InvestmentStatus::Approved,
            ReviewDecision::Reject { .. } => InvestmentStatus::Rejected,
            ReviewDecision::RequestDocuments { .. } => InvestmentStatus::DocumentsMissing,
        }
    }

    /// Operator notes attached to the decision
    pub fn notes(&self) -> Option<&str> {
        match self {
            ReviewDecision::StartReview { notes }
            | ReviewDecision::Approve { notes }
            | ReviewDecision::Reject { notes }
            | ReviewDecision::RequestDocuments { notes, .. } => notes.as_deref(),
        }
    }
}

/// User input for an investment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestmentSubmission {
    pub asset_id: AssetId,
    pub shares_requested: u32,
    pub kyc: KycSnapshot,
    pub referral_code: Option<String>,
}

/// Withdrawal request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

string_enum!(WithdrawalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Cancelled => "cancelled",
});

/// Destination channel for withdrawn funds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Instapay,
    Wallet,
    Company,
}

string_enum!(PaymentMethod {
    Instapay => "instapay",
    Wallet => "wallet",
    Company => "company",
});

impl PaymentMethod {
    /// Company pickups need no destination account
    pub fn requires_account_details(&self) -> bool {
        !matches!(self, PaymentMethod::Company)
    }
}

/// A request to move wallet funds to an external destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: WithdrawalRequestId,
    pub user_id: UserId,
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub account_details: Option<String>,
    pub status: WithdrawalStatus,
    pub admin_notes: Option<String>,
    pub processed_by: Option<UserId>,
    pub submitted_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// User input for a withdrawal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalSubmission {
    pub amount: Decimal,
    pub payment_method: PaymentMethod,
    pub account_details: Option<String>,
}

/// Per (user, asset) referral anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralNode {
    pub id: ReferralNodeId,
    pub user_id: UserId,
    pub asset_id: AssetId,
    pub asset_kind: AssetKind,
    pub code: String,
    pub referrer_node_id: Option<ReferralNodeId>,
    pub level: u32,
    pub rewards_earned: Decimal,
    pub joined_at: DateTime<Utc>,
}

/// Append-only record of a successful referred investment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralUsage {
    pub id: ReferralUsageId,
    pub referrer_user_id: UserId,
    pub referee_user_id: UserId,
    pub asset_id: AssetId,
    pub asset_kind: AssetKind,
    pub investment_amount: Decimal,
    pub shares_purchased: u32,
    pub created_at: DateTime<Utc>,
}

/// 1-based page selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl PageRequest {
    /// Creates a page request, clamping to sane bounds
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, 200),
        }
    }

    /// Number of rows to skip
    pub fn offset(&self) -> usize {
        (self.page.max(1) as usize - 1) * self.per_page as usize
    }
}

/// A page of results with the total row count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl<T> Page<T> {
    /// Number of pages for the total
    pub fn pages(&self) -> u64 {
        if self.per_page == 0 {
            0
        } else {
            self.total.div_ceil(u64::from(self.per_page))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_asset(total_shares: u32, shares_available: u32) -> Asset {
        Asset {
            id: Uuid::new_v4(),
            title: "Nile View".to_string(),
            description: "Two-bedroom unit".to_string(),
            location: "Cairo".to_string(),
            total_price: dec!(1000000),
            total_shares,
            shares_available,
            monthly_rent: dec!(1000),
            is_closed: false,
            details: AssetDetails::Unit,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_asset_derived_values() {
        let asset = sample_asset(100, 75);
        assert_eq!(asset.share_price(), dec!(10000));
        assert_eq!(asset.income_per_share(), dec!(10));
        assert_eq!(asset.shares_sold(), 25);
        assert_eq!(asset.completion(), dec!(0.25));
        assert_eq!(asset.status(), AssetStatus::Available);
        assert!(asset.can_allocate(75));
        assert!(!asset.can_allocate(76));
        assert!(!asset.can_allocate(0));
    }

    #[test]
    fn test_income_per_share_rounds() {
        let mut asset = sample_asset(3, 3);
        asset.monthly_rent = dec!(1000);
        assert_eq!(asset.income_per_share(), dec!(333.33));
    }

    #[test]
    fn test_investment_transitions() {
        use InvestmentStatus::*;
        assert!(Pending.can_transition_to(UnderReview));
        assert!(UnderReview.can_transition_to(DocumentsMissing));
        assert!(!DocumentsMissing.can_transition_to(UnderReview));
        assert!(!Pending.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(UnderReview));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(Approved.is_terminal());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("instapay".parse::<PaymentMethod>().unwrap(), PaymentMethod::Instapay);
        assert_eq!(" Company ".parse::<PaymentMethod>().unwrap(), PaymentMethod::Company);
        assert!(matches!(
            "paypal".parse::<PaymentMethod>(),
            Err(EstateError::InvalidInput(_))
        ));
        assert_eq!(
            "documents_missing".parse::<InvestmentStatus>().unwrap(),
            InvestmentStatus::DocumentsMissing
        );
        assert_eq!(TransactionKind::RewardPayout.to_string(), "reward_payout");
    }

    #[test]
    fn test_kyc_validation() {
        let mut kyc = KycSnapshot {
            full_name: "Mona Adel".to_string(),
            phone: "+201000000000".to_string(),
            national_id: "29801011234567".to_string(),
            address: "Zamalek, Cairo".to_string(),
            date_of_birth: "1998-01-01".to_string(),
            nationality: "EG".to_string(),
            occupation: "Engineer".to_string(),
            documents: KycDocuments {
                id_front: "front.png".to_string(),
                id_back: "back.png".to_string(),
                proof_of_address: "bill.pdf".to_string(),
            },
        };
        assert!(kyc.validate().is_ok());
        assert!(kyc.to_profile().is_complete());

        kyc.occupation = "  ".to_string();
        let err = kyc.validate().unwrap_err();
        assert_eq!(err, EstateError::invalid("KYC field occupation is required"));
    }

    #[test]
    fn test_actor_access() {
        let owner = Uuid::new_v4();
        assert!(Actor::user(owner).require_access(owner).is_ok());
        assert!(Actor::admin(Uuid::new_v4()).require_access(owner).is_ok());
        assert!(matches!(
            Actor::user(Uuid::new_v4()).require_access(owner),
            Err(EstateError::Unauthorized(_))
        ));
        assert!(Actor::user(owner).require_admin().is_err());
    }

    #[test]
    fn test_referral_number_is_derived() {
        let id = Uuid::new_v4();
        let number = referral_number_for(id);
        assert!(number.starts_with("IPI"));
        assert_eq!(number.len(), 13);
        assert_eq!(number, referral_number_for(id));
    }

    #[test]
    fn test_page_math() {
        let page: Page<u8> = Page {
            items: vec![],
            page: 2,
            per_page: 20,
            total: 41,
        };
        assert_eq!(page.pages(), 3);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
        assert_eq!(PageRequest::new(0, 0).offset(), 0);
    }
}
