//! Persistence seam.
//!
//! Every engine action runs inside one [`Session`] obtained from a [`Store`].
//! A session is a single atomic unit: either [`Session::commit`] persists all
//! of its writes or none of them survive. Dropping a session without
//! committing rolls it back.
//!
//! Balance columns, share rows, asset counters and payout stamps can only be
//! written through argument types that the owning component alone can build
//! ([`LedgerEntry`], [`Allocation`], [`AssetCounters`], [`PayoutStamp`]).
//! Transactions have no update or delete method.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::EstateResult;
use crate::ledger::LedgerEntry;
use crate::payout::PayoutStamp;
use crate::registry::{Allocation, AssetCounters};
use crate::types::{
    Asset, AssetId, InvestmentRequest, InvestmentRequestId, InvestmentStatus, Page, PageRequest,
    ReferralNode, ReferralNodeId, ReferralUsage, Share, ShareId, Transaction, User, UserId,
    WithdrawalRequest, WithdrawalRequestId, WithdrawalStatus,
};

/// Factory for transactional sessions
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a new session
    async fn begin(&self) -> EstateResult<Box<dyn Session>>;
}

/// A transactional view of the durable state.
///
/// `lock_*` methods read a row and hold it against concurrent writers until
/// the session ends.
#[async_trait]
pub trait Session: Send {
    // Users

    async fn insert_user(&mut self, user: &User) -> EstateResult<()>;

    async fn user(&mut self, id: UserId) -> EstateResult<Option<User>>;

    async fn user_by_email(&mut self, email: &str) -> EstateResult<Option<User>>;

    async fn lock_user(&mut self, id: UserId) -> EstateResult<Option<User>>;

    /// Persists profile fields; balances are ignored
    async fn update_user_profile(&mut self, user: &User) -> EstateResult<()>;

    async fn list_user_ids(&mut self) -> EstateResult<Vec<UserId>>;

    /// Writes the entry's balances and appends its transaction
    async fn apply_ledger_entry(&mut self, entry: &LedgerEntry) -> EstateResult<()>;

    /// Newest first
    async fn transactions_for_user(
        &mut self,
        user_id: UserId,
        page: PageRequest,
    ) -> EstateResult<Page<Transaction>>;

    // Assets

    async fn insert_asset(&mut self, asset: &Asset) -> EstateResult<()>;

    async fn asset(&mut self, id: AssetId) -> EstateResult<Option<Asset>>;

    async fn lock_asset(&mut self, id: AssetId) -> EstateResult<Option<Asset>>;

    async fn list_assets(&mut self) -> EstateResult<Vec<Asset>>;

    /// Persists descriptive fields; counters and the closed flag are ignored
    async fn update_asset_details(&mut self, asset: &Asset) -> EstateResult<()>;

    async fn apply_asset_counters(&mut self, counters: &AssetCounters) -> EstateResult<()>;

    /// Inserts the allocated shares and writes the asset counters
    async fn apply_allocation(&mut self, allocation: &Allocation) -> EstateResult<()>;

    // Shares

    async fn shares_for_asset(&mut self, asset_id: AssetId) -> EstateResult<Vec<Share>>;

    async fn shares_for_user(&mut self, user_id: UserId) -> EstateResult<Vec<Share>>;

    async fn share_ids(&mut self) -> EstateResult<Vec<ShareId>>;

    async fn lock_share(&mut self, id: ShareId) -> EstateResult<Option<Share>>;

    async fn apply_payout_stamp(&mut self, stamp: &PayoutStamp) -> EstateResult<()>;

    // Investment requests

    async fn insert_investment_request(&mut self, request: &InvestmentRequest)
        -> EstateResult<()>;

    async fn investment_request(
        &mut self,
        id: InvestmentRequestId,
    ) -> EstateResult<Option<InvestmentRequest>>;

    async fn lock_investment_request(
        &mut self,
        id: InvestmentRequestId,
    ) -> EstateResult<Option<InvestmentRequest>>;

    async fn update_investment_request(&mut self, request: &InvestmentRequest)
        -> EstateResult<()>;

    /// Newest first
    async fn investment_requests_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<InvestmentRequest>>;

    /// Oldest first; `None` lists every request
    async fn investment_requests_by_status(
        &mut self,
        status: Option<InvestmentStatus>,
    ) -> EstateResult<Vec<InvestmentRequest>>;

    /// Earliest reviewed approved request of `user_id` for `asset_id`
    async fn approved_investment_request(
        &mut self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Option<InvestmentRequest>>;

    // Withdrawal requests

    async fn insert_withdrawal_request(&mut self, request: &WithdrawalRequest)
        -> EstateResult<()>;

    async fn withdrawal_request(
        &mut self,
        id: WithdrawalRequestId,
    ) -> EstateResult<Option<WithdrawalRequest>>;

    async fn lock_withdrawal_request(
        &mut self,
        id: WithdrawalRequestId,
    ) -> EstateResult<Option<WithdrawalRequest>>;

    async fn update_withdrawal_request(&mut self, request: &WithdrawalRequest)
        -> EstateResult<()>;

    async fn pending_withdrawal_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Option<WithdrawalRequest>>;

    /// Newest first
    async fn withdrawal_requests_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<WithdrawalRequest>>;

    /// Oldest first; `None` lists every request
    async fn withdrawal_requests_by_status(
        &mut self,
        status: Option<WithdrawalStatus>,
    ) -> EstateResult<Vec<WithdrawalRequest>>;

    // Referrals

    async fn insert_referral_node(&mut self, node: &ReferralNode) -> EstateResult<()>;

    async fn referral_node(&mut self, id: ReferralNodeId) -> EstateResult<Option<ReferralNode>>;

    async fn referral_node_for(
        &mut self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Option<ReferralNode>>;

    async fn referral_node_by_code(
        &mut self,
        asset_id: AssetId,
        code: &str,
    ) -> EstateResult<Option<ReferralNode>>;

    async fn referral_nodes_for_user(&mut self, user_id: UserId)
        -> EstateResult<Vec<ReferralNode>>;

    async fn referral_code_exists(&mut self, code: &str) -> EstateResult<bool>;

    /// Direct children, oldest first
    async fn referral_children(&mut self, id: ReferralNodeId) -> EstateResult<Vec<ReferralNode>>;

    /// Adds `amount` to the node's accumulated rewards counter
    async fn add_referral_rewards(&mut self, id: ReferralNodeId, amount: Decimal)
        -> EstateResult<()>;

    async fn insert_referral_usage(&mut self, usage: &ReferralUsage) -> EstateResult<()>;

    async fn referral_usages_for_referrer(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<ReferralUsage>>;

    // Lifecycle

    async fn commit(self: Box<Self>) -> EstateResult<()>;

    async fn rollback(self: Box<Self>) -> EstateResult<()>;
}
