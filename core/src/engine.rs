//! `EstateEngine`: the entry point for every user and operator action.
//!
//! Each method opens one session, runs the components against it, commits on
//! success and only then delivers the queued notifications. Any error rolls
//! the whole session back.

use rust_decimal::Decimal;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EstateError, EstateResult};
use crate::investment::{InvestmentWorkflow, ReviewOutcome};
use crate::ledger::{Ledger, RewardsPayout};
use crate::notify::{dispatch, Effects, NotificationKind, NotificationSink, NullNotifier};
use crate::payout::{PayoutEngine, PayoutSummary};
use crate::queries::{self, AssetStats, Portfolio};
use crate::referral::{ReferralEngine, ReferralStats, TreeEntry};
use crate::registry::ShareRegistry;
use crate::store::{Session, Store};
use crate::types::{
    Actor, Asset, AssetId, AssetUpdate, InvestmentRequest, InvestmentRequestId, InvestmentStatus,
    InvestmentSubmission, KycProfile, KycSnapshot, NewAsset, Page, PageRequest, ReferralNode,
    ReviewDecision, Transaction, TransactionKind, User, UserId, WithdrawalRequest,
    WithdrawalRequestId, WithdrawalStatus, WithdrawalSubmission,
};
use crate::withdrawal::WithdrawalWorkflow;

/// Facade over the financial state engine
#[derive(Clone)]
pub struct EstateEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    ledger: Ledger,
    registry: ShareRegistry,
    referrals: ReferralEngine,
    investments: InvestmentWorkflow,
    payouts: PayoutEngine,
    withdrawals: WithdrawalWorkflow,
}

impl fmt::Debug for EstateEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstateEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`EstateEngine`]
pub struct EstateEngineBuilder {
    store: Option<Arc<dyn Store>>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl EstateEngineBuilder {
    /// Persistence backend; required
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates the configuration and wires the components together
    pub fn build(self) -> EstateResult<EstateEngine> {
        let store = self
            .store
            .ok_or_else(|| EstateError::Configuration("a store is required".to_string()))?;
        self.config.validate()?;

        let config = Arc::new(self.config);
        let clock = self.clock;
        let ledger = Ledger::new(clock.clone());
        let registry = ShareRegistry::new(clock.clone());
        let referrals = ReferralEngine::new(clock.clone(), config.clone(), ledger.clone());
        let investments = InvestmentWorkflow::new(
            clock.clone(),
            config.clone(),
            ledger.clone(),
            registry.clone(),
            referrals.clone(),
        );
        let payouts = PayoutEngine::new(clock.clone(), config.clone(), ledger.clone());
        let withdrawals = WithdrawalWorkflow::new(clock.clone(), config.clone(), ledger.clone());

        info!(funding = ?config.funding_policy, timezone = %config.scheduler_timezone, "Estate engine ready");

        Ok(EstateEngine {
            store,
            notifier: self.notifier,
            clock,
            config,
            ledger,
            registry,
            referrals,
            investments,
            payouts,
            withdrawals,
        })
    }
}

impl EstateEngine {
    pub fn builder() -> EstateEngineBuilder {
        EstateEngineBuilder {
            store: None,
            notifier: Arc::new(NullNotifier),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn begin(&self) -> EstateResult<Box<dyn Session>> {
        self.store.begin().await
    }

    /// Commits and dispatches on success, rolls back on failure
    async fn finish<T>(
        &self,
        session: Box<dyn Session>,
        effects: Effects,
        result: EstateResult<T>,
    ) -> EstateResult<T> {
        match result {
            Ok(value) => {
                session.commit().await?;
                if !effects.is_empty() {
                    dispatch(self.notifier.as_ref(), effects).await;
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Ends a read-only session
    async fn read<T>(&self, session: Box<dyn Session>, result: EstateResult<T>) -> EstateResult<T> {
        self.finish(session, Effects::new(), result).await
    }

    // Users

    /// Creates an account with empty balances
    #[instrument(skip(self, password_hash))]
    pub async fn register_user(
        &self,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> EstateResult<User> {
        let name = name.trim();
        let email = email.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(EstateError::invalid("name is required"));
        }
        if !email.contains('@') {
            return Err(EstateError::invalid(format!("invalid e-mail address '{}'", email)));
        }
        if password_hash.is_empty() {
            return Err(EstateError::invalid("credential material is required"));
        }

        let mut session = self.begin().await?;
        let result = async {
            if session.user_by_email(&email).await?.is_some() {
                return Err(EstateError::invalid(format!("e-mail {} is already registered", email)));
            }
            let user = User::new(
                name.to_string(),
                email.clone(),
                password_hash.to_string(),
                self.clock.now(),
            );
            session.insert_user(&user).await?;
            info!(user_id = %user.id, "User registered");
            Ok::<_, EstateError>(user)
        }
        .await;
        self.finish(session, Effects::new(), result).await
    }

    pub async fn user(&self, actor: Actor, user_id: UserId) -> EstateResult<User> {
        actor.require_access(user_id)?;
        let mut session = self.begin().await?;
        let result = session
            .user(user_id)
            .await
            .and_then(|u| u.ok_or_else(|| EstateError::not_found(format!("user {}", user_id))));
        self.read(session, result).await
    }

    /// Replaces the KYC attributes on the profile
    #[instrument(skip(self, kyc))]
    pub async fn update_kyc_profile(
        &self,
        actor: Actor,
        user_id: UserId,
        kyc: KycProfile,
    ) -> EstateResult<User> {
        actor.require_access(user_id)?;
        let mut session = self.begin().await?;
        let result = async {
            let mut user = lock_user(session.as_mut(), user_id).await?;
            user.kyc = kyc;
            session.update_user_profile(&user).await?;
            Ok::<_, EstateError>(user)
        }
        .await;
        self.finish(session, Effects::new(), result).await
    }

    #[instrument(skip(self, password_hash))]
    pub async fn change_password(&self, actor: Actor, password_hash: &str) -> EstateResult<()> {
        if password_hash.is_empty() {
            return Err(EstateError::invalid("credential material is required"));
        }
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = async {
            let mut user = lock_user(session.as_mut(), actor.user_id).await?;
            user.password_hash = password_hash.to_string();
            session.update_user_profile(&user).await?;
            effects.notify(
                user.id,
                NotificationKind::PasswordChanged,
                json!({ "changed_at": self.clock.now() }),
            );
            Ok::<_, EstateError>(())
        }
        .await;
        self.finish(session, effects, result).await
    }

    /// Grants or revokes the operator flag
    #[instrument(skip(self))]
    pub async fn set_admin(&self, actor: Actor, user_id: UserId, is_admin: bool) -> EstateResult<User> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let result = async {
            let mut user = lock_user(session.as_mut(), user_id).await?;
            user.is_admin = is_admin;
            session.update_user_profile(&user).await?;
            Ok::<_, EstateError>(user)
        }
        .await;
        self.finish(session, Effects::new(), result).await
    }

    // Balances

    /// Operator credit to a user's wallet
    #[instrument(skip(self, description))]
    pub async fn deposit(
        &self,
        actor: Actor,
        user_id: UserId,
        amount: Decimal,
        description: &str,
    ) -> EstateResult<Transaction> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let result = self
            .ledger
            .credit_wallet(session.as_mut(), user_id, amount, TransactionKind::Deposit, description)
            .await;
        self.finish(session, Effects::new(), result).await
    }

    /// Moves rewards into the wallet; `None` pays out the whole balance
    #[instrument(skip(self))]
    pub async fn payout_rewards(
        &self,
        actor: Actor,
        user_id: UserId,
        amount: Option<Decimal>,
    ) -> EstateResult<RewardsPayout> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = async {
            let amount = match amount {
                Some(amount) => amount,
                None => {
                    let balance = lock_user(session.as_mut(), user_id).await?.rewards_balance;
                    if balance <= Decimal::ZERO {
                        return Err(EstateError::invalid("no rewards to pay out"));
                    }
                    balance
                }
            };
            let payout = self
                .ledger
                .payout_rewards(session.as_mut(), user_id, amount)
                .await?;
            effects.notify(
                user_id,
                NotificationKind::RewardsPaidOut,
                json!({ "amount": amount.to_string() }),
            );
            Ok::<_, EstateError>(payout)
        }
        .await;
        self.finish(session, effects, result).await
    }

    /// Newest first
    pub async fn transactions(
        &self,
        actor: Actor,
        user_id: UserId,
        page: PageRequest,
    ) -> EstateResult<Page<Transaction>> {
        actor.require_access(user_id)?;
        let mut session = self.begin().await?;
        let result = session.transactions_for_user(user_id, page).await;
        self.read(session, result).await
    }

    // Assets

    /// Creates an asset and announces it to every user
    #[instrument(skip(self, new_asset))]
    pub async fn publish_asset(&self, actor: Actor, new_asset: NewAsset) -> EstateResult<Asset> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = async {
            let asset = self.registry.create_asset(session.as_mut(), new_asset).await?;
            for user_id in session.list_user_ids().await? {
                effects.notify(
                    user_id,
                    NotificationKind::NewAssetPublished,
                    json!({
                        "asset_id": asset.id,
                        "asset_title": asset.title,
                        "asset_kind": asset.kind(),
                        "share_price": asset.share_price().to_string(),
                    }),
                );
            }
            Ok::<_, EstateError>(asset)
        }
        .await;
        self.finish(session, effects, result).await
    }

    /// Edits descriptive fields; share counters are untouched
    #[instrument(skip(self, update))]
    pub async fn update_asset_details(
        &self,
        actor: Actor,
        asset_id: AssetId,
        update: AssetUpdate,
    ) -> EstateResult<Asset> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let result = async {
            let mut asset = session
                .lock_asset(asset_id)
                .await?
                .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))?;

            if let Some(title) = update.title {
                if title.trim().is_empty() {
                    return Err(EstateError::invalid("asset title is required"));
                }
                asset.title = title;
            }
            if let Some(description) = update.description {
                asset.description = description;
            }
            if let Some(location) = update.location {
                asset.location = location;
            }
            if let Some(rent) = update.monthly_rent {
                if rent < Decimal::ZERO {
                    return Err(EstateError::invalid("monthly_rent must not be negative"));
                }
                asset.monthly_rent = rent;
            }
            if let Some(details) = update.details {
                if details.kind() != asset.kind() {
                    return Err(EstateError::invalid(format!(
                        "cannot change a {} into a {}",
                        asset.kind(),
                        details.kind()
                    )));
                }
                asset.details = details;
            }

            session.update_asset_details(&asset).await?;
            Ok::<_, EstateError>(asset)
        }
        .await;
        self.finish(session, Effects::new(), result).await
    }

    /// Stops further sales and tells the asset's investors
    #[instrument(skip(self))]
    pub async fn close_asset(&self, actor: Actor, asset_id: AssetId) -> EstateResult<Asset> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = async {
            let closure = self.registry.close(session.as_mut(), asset_id).await?;
            if closure.changed {
                for investor in self.registry.investors(session.as_mut(), asset_id).await? {
                    effects.notify(
                        investor,
                        NotificationKind::AssetClosed,
                        json!({ "asset_id": asset_id, "asset_title": closure.asset.title }),
                    );
                }
            }
            Ok::<_, EstateError>(closure.asset)
        }
        .await;
        self.finish(session, effects, result).await
    }

    pub async fn assets(&self) -> EstateResult<Vec<Asset>> {
        let mut session = self.begin().await?;
        let result = queries::asset_listing(session.as_mut()).await;
        self.read(session, result).await
    }

    pub async fn asset_stats(&self, asset_id: AssetId) -> EstateResult<AssetStats> {
        let mut session = self.begin().await?;
        let result = queries::asset_stats(session.as_mut(), asset_id).await;
        self.read(session, result).await
    }

    /// Shares `user_id` holds in `asset_id`
    pub async fn holdings(&self, actor: Actor, user_id: UserId, asset_id: AssetId) -> EstateResult<u32> {
        actor.require_access(user_id)?;
        let mut session = self.begin().await?;
        let result = self.registry.holdings(session.as_mut(), user_id, asset_id).await;
        self.read(session, result).await
    }

    /// Holdings grouped by asset with invested and expected income totals
    pub async fn portfolio(&self, actor: Actor, user_id: UserId) -> EstateResult<Portfolio> {
        actor.require_access(user_id)?;
        let mut session = self.begin().await?;
        let result = queries::portfolio(session.as_mut(), user_id).await;
        self.read(session, result).await
    }

    // Investments

    pub async fn submit_investment(
        &self,
        actor: Actor,
        submission: InvestmentSubmission,
    ) -> EstateResult<InvestmentRequest> {
        let mut session = self.begin().await?;
        let result = self
            .investments
            .submit(session.as_mut(), actor.user_id, submission)
            .await;
        self.finish(session, Effects::new(), result).await
    }

    pub async fn review_investment(
        &self,
        actor: Actor,
        request_id: InvestmentRequestId,
        decision: ReviewDecision,
    ) -> EstateResult<ReviewOutcome> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = self
            .investments
            .review(session.as_mut(), &mut effects, actor.user_id, request_id, decision)
            .await;
        self.finish(session, effects, result).await
    }

    pub async fn resubmit_investment(
        &self,
        actor: Actor,
        request_id: InvestmentRequestId,
        kyc: Option<KycSnapshot>,
    ) -> EstateResult<InvestmentRequest> {
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = self
            .investments
            .resubmit(session.as_mut(), &mut effects, actor.user_id, request_id, kyc)
            .await;
        self.finish(session, effects, result).await
    }

    pub async fn attach_contract(
        &self,
        actor: Actor,
        request_id: InvestmentRequestId,
        contract_ref: &str,
    ) -> EstateResult<InvestmentRequest> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let result = self
            .investments
            .attach_contract(session.as_mut(), request_id, contract_ref)
            .await;
        self.finish(session, Effects::new(), result).await
    }

    pub async fn investment_request(
        &self,
        actor: Actor,
        request_id: InvestmentRequestId,
    ) -> EstateResult<InvestmentRequest> {
        let mut session = self.begin().await?;
        let result = async {
            let request = session
                .investment_request(request_id)
                .await?
                .ok_or_else(|| EstateError::not_found(format!("investment request {}", request_id)))?;
            actor.require_access(request.user_id)?;
            Ok::<_, EstateError>(request)
        }
        .await;
        self.read(session, result).await
    }

    /// The caller's own requests, newest first
    pub async fn my_investment_requests(&self, actor: Actor) -> EstateResult<Vec<InvestmentRequest>> {
        let mut session = self.begin().await?;
        let result = session.investment_requests_for_user(actor.user_id).await;
        self.read(session, result).await
    }

    /// Review queue; `None` lists everything
    pub async fn investment_requests_by_status(
        &self,
        actor: Actor,
        status: Option<InvestmentStatus>,
    ) -> EstateResult<Vec<InvestmentRequest>> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let result = session.investment_requests_by_status(status).await;
        self.read(session, result).await
    }

    // Referrals

    pub async fn referral_code(&self, actor: Actor, asset_id: AssetId) -> EstateResult<ReferralNode> {
        let mut session = self.begin().await?;
        let result = self
            .referrals
            .code_for(session.as_mut(), actor.user_id, asset_id)
            .await;
        self.finish(session, Effects::new(), result).await
    }

    /// Ancestors, nearest first; depth defaults to the configured cap
    pub async fn referral_upline(
        &self,
        actor: Actor,
        asset_id: AssetId,
        depth: Option<usize>,
    ) -> EstateResult<Vec<TreeEntry>> {
        let depth = depth.unwrap_or(self.config.referral_depth_cap);
        let mut session = self.begin().await?;
        let result = self
            .referrals
            .upline(session.as_mut(), actor.user_id, asset_id, depth)
            .await;
        self.read(session, result).await
    }

    /// Descendants breadth-first; depth defaults to the configured cap
    pub async fn referral_downline(
        &self,
        actor: Actor,
        asset_id: AssetId,
        depth: Option<usize>,
    ) -> EstateResult<Vec<TreeEntry>> {
        let depth = depth.unwrap_or(self.config.referral_depth_cap);
        let mut session = self.begin().await?;
        let result = self
            .referrals
            .downline(session.as_mut(), actor.user_id, asset_id, depth)
            .await;
        self.read(session, result).await
    }

    pub async fn referral_stats(&self, actor: Actor, user_id: UserId) -> EstateResult<ReferralStats> {
        actor.require_access(user_id)?;
        let mut session = self.begin().await?;
        let result = self.referrals.stats(session.as_mut(), user_id).await;
        self.read(session, result).await
    }

    // Payouts

    /// One payout sweep over every share
    pub async fn run_payouts(&self) -> EstateResult<PayoutSummary> {
        self.payouts
            .sweep(self.store.as_ref(), self.notifier.as_ref())
            .await
    }

    // Withdrawals

    pub async fn submit_withdrawal(
        &self,
        actor: Actor,
        submission: WithdrawalSubmission,
    ) -> EstateResult<WithdrawalRequest> {
        let mut session = self.begin().await?;
        let result = self
            .withdrawals
            .submit(session.as_mut(), actor.user_id, submission)
            .await;
        self.finish(session, Effects::new(), result).await
    }

    pub async fn approve_withdrawal(
        &self,
        actor: Actor,
        request_id: WithdrawalRequestId,
        notes: Option<String>,
    ) -> EstateResult<WithdrawalRequest> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = self
            .withdrawals
            .approve(session.as_mut(), &mut effects, actor.user_id, request_id, notes)
            .await
            .map(|(request, _)| request);
        self.finish(session, effects, result).await
    }

    pub async fn reject_withdrawal(
        &self,
        actor: Actor,
        request_id: WithdrawalRequestId,
        notes: Option<String>,
    ) -> EstateResult<WithdrawalRequest> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let mut effects = Effects::new();
        let result = self
            .withdrawals
            .reject(session.as_mut(), &mut effects, actor.user_id, request_id, notes)
            .await;
        self.finish(session, effects, result).await
    }

    pub async fn cancel_withdrawal(
        &self,
        actor: Actor,
        request_id: WithdrawalRequestId,
    ) -> EstateResult<WithdrawalRequest> {
        let mut session = self.begin().await?;
        let result = self
            .withdrawals
            .cancel(session.as_mut(), actor.user_id, request_id)
            .await;
        self.finish(session, Effects::new(), result).await
    }

    pub async fn my_withdrawal_requests(&self, actor: Actor) -> EstateResult<Vec<WithdrawalRequest>> {
        let mut session = self.begin().await?;
        let result = session.withdrawal_requests_for_user(actor.user_id).await;
        self.read(session, result).await
    }

    pub async fn withdrawal_requests_by_status(
        &self,
        actor: Actor,
        status: Option<WithdrawalStatus>,
    ) -> EstateResult<Vec<WithdrawalRequest>> {
        actor.require_admin()?;
        let mut session = self.begin().await?;
        let result = session.withdrawal_requests_by_status(status).await;
        self.read(session, result).await
    }
}

async fn lock_user(session: &mut dyn Session, user_id: UserId) -> EstateResult<User> {
    session
        .lock_user(user_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("user {}", user_id)))
}
