//! In-memory [`Store`] used by tests and local runs.
//!
//! Sessions are fully serialised: `begin` waits for the single state lock and
//! works on a staged copy that `commit` writes back in one step. The same
//! uniqueness and range constraints as the relational schema are enforced on
//! every write.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{EstateError, EstateResult};
use crate::ledger::LedgerEntry;
use crate::payout::PayoutStamp;
use crate::registry::{Allocation, AssetCounters};
use crate::store::{Session, Store};
use crate::types::{
    Asset, AssetId, InvestmentRequest, InvestmentRequestId, InvestmentStatus, Page, PageRequest,
    ReferralNode, ReferralNodeId, ReferralUsage, Share, ShareId, Transaction, User, UserId,
    WithdrawalRequest, WithdrawalRequestId, WithdrawalStatus,
};

/// Committed rows, kept in insertion order
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    users: Vec<User>,
    assets: Vec<Asset>,
    shares: Vec<Share>,
    transactions: Vec<Transaction>,
    investment_requests: Vec<InvestmentRequest>,
    withdrawal_requests: Vec<WithdrawalRequest>,
    referral_nodes: Vec<ReferralNode>,
    referral_usages: Vec<ReferralUsage>,
}

impl MemoryState {
    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn user(&self, id: UserId) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    pub fn asset(&self, id: AssetId) -> Option<&Asset> {
        self.assets.iter().find(|a| a.id == id)
    }

    pub fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn investment_requests(&self) -> &[InvestmentRequest] {
        &self.investment_requests
    }

    pub fn withdrawal_requests(&self) -> &[WithdrawalRequest] {
        &self.withdrawal_requests
    }

    pub fn referral_nodes(&self) -> &[ReferralNode] {
        &self.referral_nodes
    }

    pub fn referral_usages(&self) -> &[ReferralUsage] {
        &self.referral_usages
    }

    fn user_mut(&mut self, id: UserId) -> EstateResult<&mut User> {
        self.users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| missing_row("users", id))
    }

    fn asset_mut(&mut self, id: AssetId) -> EstateResult<&mut Asset> {
        self.assets
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| missing_row("assets", id))
    }

    fn set_counters(&mut self, counters: &AssetCounters) -> EstateResult<()> {
        let asset = self.asset_mut(counters.asset_id())?;
        if counters.shares_available() > asset.total_shares {
            return Err(EstateError::storage(format!(
                "check violation: shares_available {} exceeds total_shares {} on asset {}",
                counters.shares_available(),
                asset.total_shares,
                asset.id
            )));
        }
        asset.shares_available = counters.shares_available();
        asset.is_closed = counters.is_closed();
        Ok(())
    }
}

/// Thread-safe in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed state
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> EstateResult<Box<dyn Session>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemorySession { guard, staged }))
    }
}

struct MemorySession {
    guard: OwnedMutexGuard<MemoryState>,
    staged: MemoryState,
}

fn missing_row(table: &str, id: impl std::fmt::Display) -> EstateError {
    EstateError::storage(format!("no row in {} with id {}", table, id))
}

fn unique_violation(constraint: &str) -> EstateError {
    EstateError::storage(format!("unique violation: {}", constraint))
}

fn newest_first<T: Clone>(rows: impl DoubleEndedIterator<Item = T>) -> Vec<T> {
    rows.rev().collect()
}

#[async_trait]
impl Session for MemorySession {
    async fn insert_user(&mut self, user: &User) -> EstateResult<()> {
        let state = &mut self.staged;
        if state.users.iter().any(|u| u.id == user.id) {
            return Err(unique_violation("users_pkey"));
        }
        if state.users.iter().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(unique_violation("users_email_key"));
        }
        if state
            .users
            .iter()
            .any(|u| u.referral_number == user.referral_number)
        {
            return Err(unique_violation("users_referral_number_key"));
        }
        if user.wallet_balance < Decimal::ZERO || user.rewards_balance < Decimal::ZERO {
            return Err(EstateError::storage("check violation: negative balance"));
        }
        state.users.push(user.clone());
        Ok(())
    }

    async fn user(&mut self, id: UserId) -> EstateResult<Option<User>> {
        Ok(self.staged.user(id).cloned())
    }

    async fn user_by_email(&mut self, email: &str) -> EstateResult<Option<User>> {
        Ok(self
            .staged
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn lock_user(&mut self, id: UserId) -> EstateResult<Option<User>> {
        self.user(id).await
    }

    async fn update_user_profile(&mut self, user: &User) -> EstateResult<()> {
        if self
            .staged
            .users
            .iter()
            .any(|u| u.id != user.id && u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(unique_violation("users_email_key"));
        }
        let row = self.staged.user_mut(user.id)?;
        row.name = user.name.clone();
        row.email = user.email.clone();
        row.password_hash = user.password_hash.clone();
        row.is_admin = user.is_admin;
        row.kyc = user.kyc.clone();
        Ok(())
    }

    async fn list_user_ids(&mut self) -> EstateResult<Vec<UserId>> {
        Ok(self.staged.users.iter().map(|u| u.id).collect())
    }

    async fn apply_ledger_entry(&mut self, entry: &LedgerEntry) -> EstateResult<()> {
        if entry.wallet_balance() < Decimal::ZERO || entry.rewards_balance() < Decimal::ZERO {
            return Err(EstateError::storage("check violation: negative balance"));
        }
        if entry.transaction().amount.is_zero() {
            return Err(EstateError::storage("check violation: zero transaction amount"));
        }
        let user = self.staged.user_mut(entry.user_id())?;
        user.wallet_balance = entry.wallet_balance();
        user.rewards_balance = entry.rewards_balance();
        self.staged.transactions.push(entry.transaction().clone());
        Ok(())
    }

    async fn transactions_for_user(
        &mut self,
        user_id: UserId,
        page: PageRequest,
    ) -> EstateResult<Page<Transaction>> {
        let rows = newest_first(
            self.staged
                .transactions
                .iter()
                .filter(|t| t.user_id == user_id),
        );
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset())
            .take(page.per_page as usize)
            .cloned()
            .collect();
        Ok(Page {
            items,
            page: page.page,
            per_page: page.per_page,
            total,
        })
    }

    async fn insert_asset(&mut self, asset: &Asset) -> EstateResult<()> {
        if self.staged.assets.iter().any(|a| a.id == asset.id) {
            return Err(unique_violation("assets_pkey"));
        }
        if asset.total_shares == 0 || asset.shares_available > asset.total_shares {
            return Err(EstateError::storage("check violation: asset share counters"));
        }
        self.staged.assets.push(asset.clone());
        Ok(())
    }

    async fn asset(&mut self, id: AssetId) -> EstateResult<Option<Asset>> {
        Ok(self.staged.asset(id).cloned())
    }

    async fn lock_asset(&mut self, id: AssetId) -> EstateResult<Option<Asset>> {
        self.asset(id).await
    }

    async fn list_assets(&mut self) -> EstateResult<Vec<Asset>> {
        Ok(self.staged.assets.clone())
    }

    async fn update_asset_details(&mut self, asset: &Asset) -> EstateResult<()> {
        let row = self.staged.asset_mut(asset.id)?;
        row.title = asset.title.clone();
        row.description = asset.description.clone();
        row.location = asset.location.clone();
        row.monthly_rent = asset.monthly_rent;
        row.details = asset.details.clone();
        Ok(())
    }

    async fn apply_asset_counters(&mut self, counters: &AssetCounters) -> EstateResult<()> {
        self.staged.set_counters(counters)
    }

    async fn apply_allocation(&mut self, allocation: &Allocation) -> EstateResult<()> {
        self.staged.set_counters(allocation.counters())?;
        self.staged.shares.extend(allocation.shares().iter().cloned());
        Ok(())
    }

    async fn shares_for_asset(&mut self, asset_id: AssetId) -> EstateResult<Vec<Share>> {
        Ok(self
            .staged
            .shares
            .iter()
            .filter(|s| s.asset_id == asset_id)
            .cloned()
            .collect())
    }

    async fn shares_for_user(&mut self, user_id: UserId) -> EstateResult<Vec<Share>> {
        Ok(self
            .staged
            .shares
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn share_ids(&mut self) -> EstateResult<Vec<ShareId>> {
        Ok(self.staged.shares.iter().map(|s| s.id).collect())
    }

    async fn lock_share(&mut self, id: ShareId) -> EstateResult<Option<Share>> {
        Ok(self.staged.shares.iter().find(|s| s.id == id).cloned())
    }

    async fn apply_payout_stamp(&mut self, stamp: &PayoutStamp) -> EstateResult<()> {
        let share = self
            .staged
            .shares
            .iter_mut()
            .find(|s| s.id == stamp.share_id())
            .ok_or_else(|| missing_row("shares", stamp.share_id()))?;
        share.last_payout_at = Some(stamp.paid_at());
        Ok(())
    }

    async fn insert_investment_request(
        &mut self,
        request: &InvestmentRequest,
    ) -> EstateResult<()> {
        if self.staged.investment_requests.iter().any(|r| r.id == request.id) {
            return Err(unique_violation("investment_requests_pkey"));
        }
        self.staged.investment_requests.push(request.clone());
        Ok(())
    }

    async fn investment_request(
        &mut self,
        id: InvestmentRequestId,
    ) -> EstateResult<Option<InvestmentRequest>> {
        Ok(self
            .staged
            .investment_requests
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn lock_investment_request(
        &mut self,
        id: InvestmentRequestId,
    ) -> EstateResult<Option<InvestmentRequest>> {
        self.investment_request(id).await
    }

    async fn update_investment_request(
        &mut self,
        request: &InvestmentRequest,
    ) -> EstateResult<()> {
        let row = self
            .staged
            .investment_requests
            .iter_mut()
            .find(|r| r.id == request.id)
            .ok_or_else(|| missing_row("investment_requests", request.id))?;
        *row = request.clone();
        Ok(())
    }

    async fn investment_requests_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<InvestmentRequest>> {
        Ok(newest_first(
            self.staged
                .investment_requests
                .iter()
                .filter(|r| r.user_id == user_id)
                .cloned(),
        ))
    }

    async fn investment_requests_by_status(
        &mut self,
        status: Option<InvestmentStatus>,
    ) -> EstateResult<Vec<InvestmentRequest>> {
        Ok(self
            .staged
            .investment_requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn approved_investment_request(
        &mut self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Option<InvestmentRequest>> {
        Ok(self
            .staged
            .investment_requests
            .iter()
            .filter(|r| {
                r.user_id == user_id
                    && r.asset_id == asset_id
                    && r.status == InvestmentStatus::Approved
                    && r.reviewed_at.is_some()
            })
            .min_by_key(|r| r.reviewed_at)
            .cloned())
    }

    async fn insert_withdrawal_request(
        &mut self,
        request: &WithdrawalRequest,
    ) -> EstateResult<()> {
        if self.staged.withdrawal_requests.iter().any(|r| r.id == request.id) {
            return Err(unique_violation("withdrawal_requests_pkey"));
        }
        if request.status == WithdrawalStatus::Pending
            && self.staged.withdrawal_requests.iter().any(|r| {
                r.user_id == request.user_id && r.status == WithdrawalStatus::Pending
            })
        {
            return Err(unique_violation("withdrawal_requests_one_pending_per_user"));
        }
        self.staged.withdrawal_requests.push(request.clone());
        Ok(())
    }

    async fn withdrawal_request(
        &mut self,
        id: WithdrawalRequestId,
    ) -> EstateResult<Option<WithdrawalRequest>> {
        Ok(self
            .staged
            .withdrawal_requests
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn lock_withdrawal_request(
        &mut self,
        id: WithdrawalRequestId,
    ) -> EstateResult<Option<WithdrawalRequest>> {
        self.withdrawal_request(id).await
    }

    async fn update_withdrawal_request(
        &mut self,
        request: &WithdrawalRequest,
    ) -> EstateResult<()> {
        let row = self
            .staged
            .withdrawal_requests
            .iter_mut()
            .find(|r| r.id == request.id)
            .ok_or_else(|| missing_row("withdrawal_requests", request.id))?;
        *row = request.clone();
        Ok(())
    }

    async fn pending_withdrawal_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Option<WithdrawalRequest>> {
        Ok(self
            .staged
            .withdrawal_requests
            .iter()
            .find(|r| r.user_id == user_id && r.status == WithdrawalStatus::Pending)
            .cloned())
    }

    async fn withdrawal_requests_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<WithdrawalRequest>> {
        Ok(newest_first(
            self.staged
                .withdrawal_requests
                .iter()
                .filter(|r| r.user_id == user_id)
                .cloned(),
        ))
    }

    async fn withdrawal_requests_by_status(
        &mut self,
        status: Option<WithdrawalStatus>,
    ) -> EstateResult<Vec<WithdrawalRequest>> {
        Ok(self
            .staged
            .withdrawal_requests
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn insert_referral_node(&mut self, node: &ReferralNode) -> EstateResult<()> {
        let nodes = &self.staged.referral_nodes;
        if nodes.iter().any(|n| n.id == node.id) {
            return Err(unique_violation("referral_nodes_pkey"));
        }
        if nodes
            .iter()
            .any(|n| n.user_id == node.user_id && n.asset_id == node.asset_id)
        {
            return Err(unique_violation("referral_nodes_user_id_asset_id_key"));
        }
        if nodes.iter().any(|n| n.code == node.code) {
            return Err(unique_violation("referral_nodes_code_key"));
        }
        self.staged.referral_nodes.push(node.clone());
        Ok(())
    }

    async fn referral_node(&mut self, id: ReferralNodeId) -> EstateResult<Option<ReferralNode>> {
        Ok(self
            .staged
            .referral_nodes
            .iter()
            .find(|n| n.id == id)
            .cloned())
    }

    async fn referral_node_for(
        &mut self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Option<ReferralNode>> {
        Ok(self
            .staged
            .referral_nodes
            .iter()
            .find(|n| n.user_id == user_id && n.asset_id == asset_id)
            .cloned())
    }

    async fn referral_node_by_code(
        &mut self,
        asset_id: AssetId,
        code: &str,
    ) -> EstateResult<Option<ReferralNode>> {
        Ok(self
            .staged
            .referral_nodes
            .iter()
            .find(|n| n.asset_id == asset_id && n.code == code)
            .cloned())
    }

    async fn referral_nodes_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<ReferralNode>> {
        Ok(self
            .staged
            .referral_nodes
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn referral_code_exists(&mut self, code: &str) -> EstateResult<bool> {
        Ok(self.staged.referral_nodes.iter().any(|n| n.code == code))
    }

    async fn referral_children(&mut self, id: ReferralNodeId) -> EstateResult<Vec<ReferralNode>> {
        Ok(self
            .staged
            .referral_nodes
            .iter()
            .filter(|n| n.referrer_node_id == Some(id))
            .cloned()
            .collect())
    }

    async fn add_referral_rewards(
        &mut self,
        id: ReferralNodeId,
        amount: Decimal,
    ) -> EstateResult<()> {
        let node = self
            .staged
            .referral_nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| missing_row("referral_nodes", id))?;
        node.rewards_earned += amount;
        Ok(())
    }

    async fn insert_referral_usage(&mut self, usage: &ReferralUsage) -> EstateResult<()> {
        self.staged.referral_usages.push(usage.clone());
        Ok(())
    }

    async fn referral_usages_for_referrer(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<ReferralUsage>> {
        Ok(self
            .staged
            .referral_usages
            .iter()
            .filter(|u| u.referrer_user_id == user_id)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> EstateResult<()> {
        let MemorySession { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EstateResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(email: &str) -> User {
        User::new("Test".to_string(), email.to_string(), "hash".to_string(), Utc::now())
    }

    #[tokio::test]
    async fn test_commit_publishes_and_drop_discards() {
        let store = MemoryStore::new();

        let mut session = store.begin().await.unwrap();
        session.insert_user(&user("a@example.com")).await.unwrap();
        session.commit().await.unwrap();

        let mut session = store.begin().await.unwrap();
        session.insert_user(&user("b@example.com")).await.unwrap();
        drop(session);

        let mut session = store.begin().await.unwrap();
        session.insert_user(&user("c@example.com")).await.unwrap();
        session.rollback().await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.users().len(), 1);
        assert_eq!(state.users()[0].email, "a@example.com");
    }

    #[tokio::test]
    async fn test_unique_email() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        session.insert_user(&user("dup@example.com")).await.unwrap();

        let err = session
            .insert_user(&user("DUP@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, EstateError::Storage(_)));
    }

    #[tokio::test]
    async fn test_pending_withdrawal_unique() {
        let store = MemoryStore::new();
        let owner = user("w@example.com");
        let mut session = store.begin().await.unwrap();
        session.insert_user(&owner).await.unwrap();

        let request = WithdrawalRequest {
            id: uuid::Uuid::new_v4(),
            user_id: owner.id,
            amount: Decimal::new(100, 0),
            payment_method: crate::types::PaymentMethod::Company,
            account_details: None,
            status: WithdrawalStatus::Pending,
            admin_notes: None,
            processed_by: None,
            submitted_at: Utc::now(),
            processed_at: None,
        };
        session.insert_withdrawal_request(&request).await.unwrap();

        let second = WithdrawalRequest {
            id: uuid::Uuid::new_v4(),
            ..request.clone()
        };
        assert!(session.insert_withdrawal_request(&second).await.is_err());

        let cancelled = WithdrawalRequest {
            id: uuid::Uuid::new_v4(),
            status: WithdrawalStatus::Cancelled,
            ..request
        };
        assert!(session.insert_withdrawal_request(&cancelled).await.is_ok());
    }
}
