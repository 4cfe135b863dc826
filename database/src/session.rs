//! PostgreSQL implementation of the engine [`Session`].
//!
//! A session wraps one database transaction. `lock_*` reads use
//! `SELECT ... FOR UPDATE`, so concurrent sessions touching the same user,
//! asset, share or request serialize on the row lock.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction as PgTransaction};
use tracing::{debug, instrument};

use estate_core::ledger::LedgerEntry;
use estate_core::payout::PayoutStamp;
use estate_core::registry::{Allocation, AssetCounters};
use estate_core::store::Session;
use estate_core::types::{
    Asset, AssetId, InvestmentRequest, InvestmentRequestId, InvestmentStatus, Page, PageRequest,
    ReferralNode, ReferralNodeId, ReferralUsage, Share, ShareId, Transaction, User, UserId,
    WithdrawalRequest, WithdrawalRequestId, WithdrawalStatus,
};
use estate_core::{EstateError, EstateResult};

use crate::error::DatabaseError;
use crate::types::{
    AssetRow, InvestmentRequestRow, ReferralNodeRow, ReferralUsageRow, ShareRow, TransactionRow,
    UserRow, WithdrawalRequestRow,
};

macro_rules! user_columns {
    () => {
        "id, name, email, password_hash, wallet_balance, rewards_balance, is_admin, \
         referral_number, kyc, created_at"
    };
}

macro_rules! asset_columns {
    () => {
        "id, title, description, location, total_price, total_shares, shares_available, \
         monthly_rent, is_closed, kind, details, created_at"
    };
}

macro_rules! share_columns {
    () => {
        "id, user_id, asset_id, asset_kind, share_price, purchased_at, last_payout_at, \
         investment_request_id"
    };
}

macro_rules! transaction_columns {
    () => {
        "id, user_id, amount, kind, account, description, created_at"
    };
}

macro_rules! investment_columns {
    () => {
        "id, user_id, asset_id, asset_kind, shares_requested, kyc, referrer_user_id, status, \
         admin_notes, missing_documents, reviewed_by, submitted_at, reviewed_at, contract_ref"
    };
}

macro_rules! withdrawal_columns {
    () => {
        "id, user_id, amount, payment_method, account_details, status, admin_notes, \
         processed_by, submitted_at, processed_at"
    };
}

macro_rules! node_columns {
    () => {
        "id, user_id, asset_id, asset_kind, code, referrer_node_id, level, rewards_earned, \
         joined_at"
    };
}

macro_rules! usage_columns {
    () => {
        "id, referrer_user_id, referee_user_id, asset_id, asset_kind, investment_amount, \
         shares_purchased, created_at"
    };
}

fn db(err: sqlx::Error) -> EstateError {
    DatabaseError::from(err).into()
}

fn map_all<R, T>(rows: Vec<R>) -> EstateResult<Vec<T>>
where
    T: TryFrom<R, Error = DatabaseError>,
{
    rows.into_iter()
        .map(|row| T::try_from(row).map_err(EstateError::from))
        .collect()
}

fn map_one<R, T>(row: Option<R>) -> EstateResult<Option<T>>
where
    T: TryFrom<R, Error = DatabaseError>,
{
    row.map(|row| T::try_from(row).map_err(EstateError::from))
        .transpose()
}

fn expect_row(rows_affected: u64, table: &str, id: impl std::fmt::Display) -> EstateResult<()> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(EstateError::not_found(format!("{} row {}", table, id)))
    }
}

/// One open database transaction
pub struct PgSession {
    tx: PgTransaction<'static, Postgres>,
}

impl PgSession {
    pub fn new(tx: PgTransaction<'static, Postgres>) -> Self {
        Self { tx }
    }

    async fn insert_share(&mut self, share: &Share) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO shares (",
            share_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(share.id)
        .bind(share.user_id)
        .bind(share.asset_id)
        .bind(share.asset_kind.as_str())
        .bind(share.share_price)
        .bind(share.purchased_at)
        .bind(share.last_payout_at)
        .bind(share.investment_request_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn insert_user(&mut self, user: &User) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO users (",
            user_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.wallet_balance)
        .bind(user.rewards_balance)
        .bind(user.is_admin)
        .bind(&user.referral_number)
        .bind(Json(&user.kyc))
        .bind(user.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn user(&mut self, id: UserId) -> EstateResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(row.map(User::from))
    }

    async fn user_by_email(&mut self, email: &str) -> EstateResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(row.map(User::from))
    }

    #[instrument(level = "debug", skip(self))]
    async fn lock_user(&mut self, id: UserId) -> EstateResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(concat!(
            "SELECT ",
            user_columns!(),
            " FROM users WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(row.map(User::from))
    }

    async fn update_user_profile(&mut self, user: &User) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE users SET name = $2, email = $3, password_hash = $4, is_admin = $5, kyc = $6 \
             WHERE id = $1",
        )
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_admin)
        .bind(Json(&user.kyc))
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "users", user.id)
    }

    async fn list_user_ids(&mut self) -> EstateResult<Vec<UserId>> {
        sqlx::query_scalar("SELECT id FROM users ORDER BY created_at, id")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db)
    }

    async fn apply_ledger_entry(&mut self, entry: &LedgerEntry) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE users SET wallet_balance = $2, rewards_balance = $3 WHERE id = $1",
        )
        .bind(entry.user_id())
        .bind(entry.wallet_balance())
        .bind(entry.rewards_balance())
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "users", entry.user_id())?;

        let tx = entry.transaction();
        sqlx::query(concat!(
            "INSERT INTO transactions (",
            transaction_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(tx.id)
        .bind(tx.user_id)
        .bind(tx.amount)
        .bind(tx.kind.as_str())
        .bind(tx.account.as_str())
        .bind(&tx.description)
        .bind(tx.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;

        debug!(user_id = %tx.user_id, kind = %tx.kind, amount = %tx.amount, "Ledger entry written");
        Ok(())
    }

    async fn transactions_for_user(
        &mut self,
        user_id: UserId,
        page: PageRequest,
    ) -> EstateResult<Page<Transaction>> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db)?;

        let rows = sqlx::query_as::<_, TransactionRow>(concat!(
            "SELECT ",
            transaction_columns!(),
            " FROM transactions WHERE user_id = $1 \
             ORDER BY created_at DESC, seq DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(i64::from(page.per_page))
        .bind(page.offset() as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;

        Ok(Page {
            items: map_all(rows)?,
            page: page.page,
            per_page: page.per_page,
            total: total.max(0) as u64,
        })
    }

    async fn insert_asset(&mut self, asset: &Asset) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO assets (",
            asset_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(asset.id)
        .bind(&asset.title)
        .bind(&asset.description)
        .bind(&asset.location)
        .bind(asset.total_price)
        .bind(i64::from(asset.total_shares))
        .bind(i64::from(asset.shares_available))
        .bind(asset.monthly_rent)
        .bind(asset.is_closed)
        .bind(asset.kind().as_str())
        .bind(Json(&asset.details))
        .bind(asset.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn asset(&mut self, id: AssetId) -> EstateResult<Option<Asset>> {
        let row = sqlx::query_as::<_, AssetRow>(concat!(
            "SELECT ",
            asset_columns!(),
            " FROM assets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    #[instrument(level = "debug", skip(self))]
    async fn lock_asset(&mut self, id: AssetId) -> EstateResult<Option<Asset>> {
        let row = sqlx::query_as::<_, AssetRow>(concat!(
            "SELECT ",
            asset_columns!(),
            " FROM assets WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn list_assets(&mut self) -> EstateResult<Vec<Asset>> {
        let rows = sqlx::query_as::<_, AssetRow>(concat!(
            "SELECT ",
            asset_columns!(),
            " FROM assets ORDER BY created_at, id"
        ))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn update_asset_details(&mut self, asset: &Asset) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE assets SET title = $2, description = $3, location = $4, monthly_rent = $5, \
             details = $6 WHERE id = $1 AND kind = $7",
        )
        .bind(asset.id)
        .bind(&asset.title)
        .bind(&asset.description)
        .bind(&asset.location)
        .bind(asset.monthly_rent)
        .bind(Json(&asset.details))
        .bind(asset.kind().as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "assets", asset.id)
    }

    async fn apply_asset_counters(&mut self, counters: &AssetCounters) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE assets SET shares_available = $2, is_closed = $3 WHERE id = $1",
        )
        .bind(counters.asset_id())
        .bind(i64::from(counters.shares_available()))
        .bind(counters.is_closed())
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "assets", counters.asset_id())
    }

    async fn apply_allocation(&mut self, allocation: &Allocation) -> EstateResult<()> {
        for share in allocation.shares() {
            self.insert_share(share).await?;
        }
        self.apply_asset_counters(allocation.counters()).await
    }

    async fn shares_for_asset(&mut self, asset_id: AssetId) -> EstateResult<Vec<Share>> {
        let rows = sqlx::query_as::<_, ShareRow>(concat!(
            "SELECT ",
            share_columns!(),
            " FROM shares WHERE asset_id = $1 ORDER BY purchased_at, id"
        ))
        .bind(asset_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn shares_for_user(&mut self, user_id: UserId) -> EstateResult<Vec<Share>> {
        let rows = sqlx::query_as::<_, ShareRow>(concat!(
            "SELECT ",
            share_columns!(),
            " FROM shares WHERE user_id = $1 ORDER BY purchased_at, id"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn share_ids(&mut self) -> EstateResult<Vec<ShareId>> {
        sqlx::query_scalar("SELECT id FROM shares ORDER BY purchased_at, id")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db)
    }

    #[instrument(level = "debug", skip(self))]
    async fn lock_share(&mut self, id: ShareId) -> EstateResult<Option<Share>> {
        let row = sqlx::query_as::<_, ShareRow>(concat!(
            "SELECT ",
            share_columns!(),
            " FROM shares WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn apply_payout_stamp(&mut self, stamp: &PayoutStamp) -> EstateResult<()> {
        let result = sqlx::query("UPDATE shares SET last_payout_at = $2 WHERE id = $1")
            .bind(stamp.share_id())
            .bind(stamp.paid_at())
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        expect_row(result.rows_affected(), "shares", stamp.share_id())
    }

    async fn insert_investment_request(&mut self, request: &InvestmentRequest) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO investment_requests (",
            investment_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.asset_id)
        .bind(request.asset_kind.as_str())
        .bind(i64::from(request.shares_requested))
        .bind(Json(&request.kyc))
        .bind(request.referrer_user_id)
        .bind(request.status.as_str())
        .bind(&request.admin_notes)
        .bind(&request.missing_documents)
        .bind(request.reviewed_by)
        .bind(request.submitted_at)
        .bind(request.reviewed_at)
        .bind(&request.contract_ref)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn investment_request(
        &mut self,
        id: InvestmentRequestId,
    ) -> EstateResult<Option<InvestmentRequest>> {
        let row = sqlx::query_as::<_, InvestmentRequestRow>(concat!(
            "SELECT ",
            investment_columns!(),
            " FROM investment_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    #[instrument(level = "debug", skip(self))]
    async fn lock_investment_request(
        &mut self,
        id: InvestmentRequestId,
    ) -> EstateResult<Option<InvestmentRequest>> {
        let row = sqlx::query_as::<_, InvestmentRequestRow>(concat!(
            "SELECT ",
            investment_columns!(),
            " FROM investment_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn update_investment_request(&mut self, request: &InvestmentRequest) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE investment_requests SET kyc = $2, status = $3, admin_notes = $4, \
             missing_documents = $5, reviewed_by = $6, reviewed_at = $7, contract_ref = $8 \
             WHERE id = $1",
        )
        .bind(request.id)
        .bind(Json(&request.kyc))
        .bind(request.status.as_str())
        .bind(&request.admin_notes)
        .bind(&request.missing_documents)
        .bind(request.reviewed_by)
        .bind(request.reviewed_at)
        .bind(&request.contract_ref)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "investment_requests", request.id)
    }

    async fn investment_requests_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<InvestmentRequest>> {
        let rows = sqlx::query_as::<_, InvestmentRequestRow>(concat!(
            "SELECT ",
            investment_columns!(),
            " FROM investment_requests WHERE user_id = $1 ORDER BY submitted_at DESC, id"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn investment_requests_by_status(
        &mut self,
        status: Option<InvestmentStatus>,
    ) -> EstateResult<Vec<InvestmentRequest>> {
        let rows = sqlx::query_as::<_, InvestmentRequestRow>(concat!(
            "SELECT ",
            investment_columns!(),
            " FROM investment_requests WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY submitted_at, id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn approved_investment_request(
        &mut self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Option<InvestmentRequest>> {
        let row = sqlx::query_as::<_, InvestmentRequestRow>(concat!(
            "SELECT ",
            investment_columns!(),
            " FROM investment_requests \
             WHERE user_id = $1 AND asset_id = $2 AND status = 'approved' \
             ORDER BY reviewed_at NULLS LAST, id LIMIT 1"
        ))
        .bind(user_id)
        .bind(asset_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn insert_withdrawal_request(&mut self, request: &WithdrawalRequest) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO withdrawal_requests (",
            withdrawal_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.amount)
        .bind(request.payment_method.as_str())
        .bind(&request.account_details)
        .bind(request.status.as_str())
        .bind(&request.admin_notes)
        .bind(request.processed_by)
        .bind(request.submitted_at)
        .bind(request.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn withdrawal_request(
        &mut self,
        id: WithdrawalRequestId,
    ) -> EstateResult<Option<WithdrawalRequest>> {
        let row = sqlx::query_as::<_, WithdrawalRequestRow>(concat!(
            "SELECT ",
            withdrawal_columns!(),
            " FROM withdrawal_requests WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    #[instrument(level = "debug", skip(self))]
    async fn lock_withdrawal_request(
        &mut self,
        id: WithdrawalRequestId,
    ) -> EstateResult<Option<WithdrawalRequest>> {
        let row = sqlx::query_as::<_, WithdrawalRequestRow>(concat!(
            "SELECT ",
            withdrawal_columns!(),
            " FROM withdrawal_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn update_withdrawal_request(&mut self, request: &WithdrawalRequest) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE withdrawal_requests SET status = $2, admin_notes = $3, processed_by = $4, \
             processed_at = $5 WHERE id = $1",
        )
        .bind(request.id)
        .bind(request.status.as_str())
        .bind(&request.admin_notes)
        .bind(request.processed_by)
        .bind(request.processed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "withdrawal_requests", request.id)
    }

    async fn pending_withdrawal_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Option<WithdrawalRequest>> {
        let row = sqlx::query_as::<_, WithdrawalRequestRow>(concat!(
            "SELECT ",
            withdrawal_columns!(),
            " FROM withdrawal_requests WHERE user_id = $1 AND status = 'pending'"
        ))
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn withdrawal_requests_for_user(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<WithdrawalRequest>> {
        let rows = sqlx::query_as::<_, WithdrawalRequestRow>(concat!(
            "SELECT ",
            withdrawal_columns!(),
            " FROM withdrawal_requests WHERE user_id = $1 ORDER BY submitted_at DESC, id"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn withdrawal_requests_by_status(
        &mut self,
        status: Option<WithdrawalStatus>,
    ) -> EstateResult<Vec<WithdrawalRequest>> {
        let rows = sqlx::query_as::<_, WithdrawalRequestRow>(concat!(
            "SELECT ",
            withdrawal_columns!(),
            " FROM withdrawal_requests WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY submitted_at, id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn insert_referral_node(&mut self, node: &ReferralNode) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO referral_nodes (",
            node_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(node.id)
        .bind(node.user_id)
        .bind(node.asset_id)
        .bind(node.asset_kind.as_str())
        .bind(&node.code)
        .bind(node.referrer_node_id)
        .bind(i64::from(node.level))
        .bind(node.rewards_earned)
        .bind(node.joined_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn referral_node(&mut self, id: ReferralNodeId) -> EstateResult<Option<ReferralNode>> {
        let row = sqlx::query_as::<_, ReferralNodeRow>(concat!(
            "SELECT ",
            node_columns!(),
            " FROM referral_nodes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn referral_node_for(
        &mut self,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Option<ReferralNode>> {
        let row = sqlx::query_as::<_, ReferralNodeRow>(concat!(
            "SELECT ",
            node_columns!(),
            " FROM referral_nodes WHERE user_id = $1 AND asset_id = $2"
        ))
        .bind(user_id)
        .bind(asset_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn referral_node_by_code(
        &mut self,
        asset_id: AssetId,
        code: &str,
    ) -> EstateResult<Option<ReferralNode>> {
        let row = sqlx::query_as::<_, ReferralNodeRow>(concat!(
            "SELECT ",
            node_columns!(),
            " FROM referral_nodes WHERE asset_id = $1 AND code = $2"
        ))
        .bind(asset_id)
        .bind(code)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        map_one(row)
    }

    async fn referral_nodes_for_user(&mut self, user_id: UserId) -> EstateResult<Vec<ReferralNode>> {
        let rows = sqlx::query_as::<_, ReferralNodeRow>(concat!(
            "SELECT ",
            node_columns!(),
            " FROM referral_nodes WHERE user_id = $1 ORDER BY joined_at, id"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn referral_code_exists(&mut self, code: &str) -> EstateResult<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM referral_nodes WHERE code = $1)")
            .bind(code)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db)
    }

    async fn referral_children(&mut self, id: ReferralNodeId) -> EstateResult<Vec<ReferralNode>> {
        let rows = sqlx::query_as::<_, ReferralNodeRow>(concat!(
            "SELECT ",
            node_columns!(),
            " FROM referral_nodes WHERE referrer_node_id = $1 ORDER BY joined_at, id"
        ))
        .bind(id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    async fn add_referral_rewards(&mut self, id: ReferralNodeId, amount: Decimal) -> EstateResult<()> {
        let result = sqlx::query(
            "UPDATE referral_nodes SET rewards_earned = rewards_earned + $2 WHERE id = $1",
        )
        .bind(id)
        .bind(amount)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        expect_row(result.rows_affected(), "referral_nodes", id)
    }

    async fn insert_referral_usage(&mut self, usage: &ReferralUsage) -> EstateResult<()> {
        sqlx::query(concat!(
            "INSERT INTO referral_usages (",
            usage_columns!(),
            ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(usage.id)
        .bind(usage.referrer_user_id)
        .bind(usage.referee_user_id)
        .bind(usage.asset_id)
        .bind(usage.asset_kind.as_str())
        .bind(usage.investment_amount)
        .bind(i64::from(usage.shares_purchased))
        .bind(usage.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn referral_usages_for_referrer(
        &mut self,
        user_id: UserId,
    ) -> EstateResult<Vec<ReferralUsage>> {
        let rows = sqlx::query_as::<_, ReferralUsageRow>(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM referral_usages WHERE referrer_user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        map_all(rows)
    }

    #[instrument(level = "debug", skip_all)]
    async fn commit(self: Box<Self>) -> EstateResult<()> {
        self.tx.commit().await.map_err(db)
    }

    async fn rollback(self: Box<Self>) -> EstateResult<()> {
        self.tx.rollback().await.map_err(db)
    }
}
