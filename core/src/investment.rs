//! Investment request workflow.
//!
//! ```text
//! pending -> under_review -> approved | rejected | documents_missing
//! documents_missing -> under_review   (owner resubmits)
//! ```
//!
//! Approval is the only transition with financial effects: shares are issued
//! through the registry, the purchase is recorded through the ledger and the
//! referral engine is invoked when a referrer is attached.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{EngineConfig, FundingPolicy};
use crate::error::{EstateError, EstateResult};
use crate::ledger::Ledger;
use crate::notify::{Effects, NotificationKind};
use crate::referral::{ReferralEngine, ReferralOutcome};
use crate::registry::ShareRegistry;
use crate::store::Session;
use crate::types::{
    round_money, Asset, AssetId, InvestmentRequest, InvestmentRequestId, InvestmentStatus,
    InvestmentSubmission, KycSnapshot, ReviewDecision, Share, Transaction, TransactionKind, UserId,
};

/// Everything a review changed
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOutcome {
    pub request: InvestmentRequest,
    /// Issued shares; empty unless approved
    pub shares: Vec<Share>,
    /// Purchase record; present only on approval
    pub purchase: Option<Transaction>,
    pub referral: Option<ReferralOutcome>,
}

#[derive(Debug, Clone)]
pub struct InvestmentWorkflow {
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    ledger: Ledger,
    registry: ShareRegistry,
    referrals: ReferralEngine,
}

impl InvestmentWorkflow {
    pub fn new(
        clock: Arc<dyn Clock>,
        config: Arc<EngineConfig>,
        ledger: Ledger,
        registry: ShareRegistry,
        referrals: ReferralEngine,
    ) -> Self {
        Self {
            clock,
            config,
            ledger,
            registry,
            referrals,
        }
    }

    /// Creates a `pending` request. Nothing is reserved or debited.
    #[instrument(skip(self, session, submission), fields(asset_id = %submission.asset_id, shares = submission.shares_requested))]
    pub async fn submit(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        submission: InvestmentSubmission,
    ) -> EstateResult<InvestmentRequest> {
        if submission.shares_requested == 0 {
            return Err(EstateError::invalid("shares_requested must be at least 1"));
        }
        submission.kyc.validate()?;

        let mut user = session
            .lock_user(user_id)
            .await?
            .ok_or_else(|| EstateError::not_found(format!("user {}", user_id)))?;
        let asset = require_asset(session, submission.asset_id).await?;

        if !asset.can_allocate(submission.shares_requested) {
            return Err(EstateError::NotAvailable {
                asset_id: asset.id,
                requested: submission.shares_requested,
                available: if asset.is_closed { 0 } else { asset.shares_available },
            });
        }

        let referrer_user_id = match submission.referral_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                let node = self.referrals.resolve_code(session, asset.id, code).await?;
                if node.user_id == user_id {
                    return Err(EstateError::invalid("a user cannot use their own referral code"));
                }
                Some(node.user_id)
            }
            _ => None,
        };

        user.kyc = submission.kyc.to_profile();
        session.update_user_profile(&user).await?;

        let request = InvestmentRequest {
            id: Uuid::new_v4(),
            user_id,
            asset_id: asset.id,
            asset_kind: asset.kind(),
            shares_requested: submission.shares_requested,
            kyc: submission.kyc,
            referrer_user_id,
            status: InvestmentStatus::Pending,
            admin_notes: None,
            missing_documents: Vec::new(),
            reviewed_by: None,
            submitted_at: self.clock.now(),
            reviewed_at: None,
            contract_ref: None,
        };
        session.insert_investment_request(&request).await?;

        info!(request_id = %request.id, referred = referrer_user_id.is_some(), "Investment request submitted");
        Ok(request)
    }

    /// Applies an operator decision
    #[instrument(skip(self, session, effects, decision), fields(target = %decision.target()))]
    pub async fn review(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        reviewer_id: UserId,
        request_id: InvestmentRequestId,
        decision: ReviewDecision,
    ) -> EstateResult<ReviewOutcome> {
        let mut request = lock_request(session, request_id).await?;
        let target = decision.target();
        if request.status.is_terminal() || !request.status.can_transition_to(target) {
            return Err(EstateError::transition(request.status, target));
        }

        let asset = require_asset(session, request.asset_id).await?;
        let mut outcome_shares = Vec::new();
        let mut purchase = None;
        let mut referral = None;

        if matches!(decision, ReviewDecision::Approve { .. }) {
            let (shares, transaction, referred) =
                self.approve(session, effects, &request, &asset).await?;
            outcome_shares = shares;
            purchase = Some(transaction);
            referral = referred;
        }

        if let Some(notes) = decision.notes() {
            request.admin_notes = Some(notes.to_string());
        }
        request.missing_documents = match &decision {
            ReviewDecision::RequestDocuments {
                missing_documents, ..
            } => missing_documents.clone(),
            _ => Vec::new(),
        };
        request.status = target;
        request.reviewed_by = Some(reviewer_id);
        request.reviewed_at = Some(self.clock.now());
        session.update_investment_request(&request).await?;

        let kind = match decision {
            ReviewDecision::StartReview { .. } => NotificationKind::InvestmentUnderReview,
            ReviewDecision::Approve { .. } => NotificationKind::InvestmentApproved,
            ReviewDecision::Reject { .. } => NotificationKind::InvestmentRejected,
            ReviewDecision::RequestDocuments { .. } => NotificationKind::InvestmentDocumentsMissing,
        };
        effects.notify(
            request.user_id,
            kind,
            json!({
                "request_id": request.id,
                "asset_id": asset.id,
                "asset_title": asset.title,
                "shares": request.shares_requested,
                "notes": request.admin_notes,
                "missing_documents": request.missing_documents,
            }),
        );

        info!(request_id = %request.id, status = %request.status, reviewer = %reviewer_id, "Investment request reviewed");
        Ok(ReviewOutcome {
            request,
            shares: outcome_shares,
            purchase,
            referral,
        })
    }

    /// Owner resubmits after documents were requested
    #[instrument(skip(self, session, effects, kyc))]
    pub async fn resubmit(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        user_id: UserId,
        request_id: InvestmentRequestId,
        kyc: Option<KycSnapshot>,
    ) -> EstateResult<InvestmentRequest> {
        let mut request = lock_request(session, request_id).await?;
        if request.user_id != user_id {
            return Err(EstateError::Unauthorized(format!(
                "request {} belongs to another user",
                request_id
            )));
        }
        if request.status != InvestmentStatus::DocumentsMissing {
            return Err(EstateError::transition(
                request.status,
                InvestmentStatus::UnderReview,
            ));
        }

        if let Some(kyc) = kyc {
            kyc.validate()?;
            request.kyc = kyc;
        }
        request.status = InvestmentStatus::UnderReview;
        request.missing_documents.clear();
        session.update_investment_request(&request).await?;

        effects.notify(
            user_id,
            NotificationKind::InvestmentUnderReview,
            json!({ "request_id": request.id, "asset_id": request.asset_id }),
        );
        Ok(request)
    }

    /// Stores a reference to the signed contract
    #[instrument(skip(self, session))]
    pub async fn attach_contract(
        &self,
        session: &mut dyn Session,
        request_id: InvestmentRequestId,
        contract_ref: &str,
    ) -> EstateResult<InvestmentRequest> {
        let contract_ref = contract_ref.trim();
        if contract_ref.is_empty() {
            return Err(EstateError::invalid("contract reference is required"));
        }

        let mut request = lock_request(session, request_id).await?;
        request.contract_ref = Some(contract_ref.to_string());
        session.update_investment_request(&request).await?;
        Ok(request)
    }

    async fn approve(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        request: &InvestmentRequest,
        asset: &Asset,
    ) -> EstateResult<(Vec<Share>, Transaction, Option<ReferralOutcome>)> {
        let recipients = match request.referrer_user_id {
            Some(referrer_id) => {
                self.referrals
                    .reward_recipients(session, referrer_id, asset.id)
                    .await?
            }
            None => Vec::new(),
        };
        for user_id in lock_order(request.user_id, recipients) {
            session
                .lock_user(user_id)
                .await?
                .ok_or_else(|| EstateError::not_found(format!("user {}", user_id)))?;
        }

        let shares = self
            .registry
            .allocate(
                session,
                request.user_id,
                asset.id,
                request.shares_requested,
                Some(request.id),
            )
            .await?;

        let cost = round_money(asset.share_price() * Decimal::from(request.shares_requested));
        let description = format!("Purchase of {} shares of {}", request.shares_requested, asset.title);
        let purchase = match self.config.funding_policy {
            FundingPolicy::External => {
                self.ledger
                    .record_memo(
                        session,
                        request.user_id,
                        -cost,
                        TransactionKind::SharePurchase,
                        &description,
                    )
                    .await?
            }
            FundingPolicy::Wallet => {
                self.ledger
                    .debit_wallet(
                        session,
                        request.user_id,
                        cost,
                        TransactionKind::SharePurchase,
                        &description,
                    )
                    .await?
            }
        };

        let referral = match request.referrer_user_id {
            Some(referrer_id) => Some(
                self.referrals
                    .record_use_and_reward(
                        session,
                        effects,
                        referrer_id,
                        request.user_id,
                        asset,
                        cost,
                        request.shares_requested,
                    )
                    .await?,
            ),
            None => None,
        };

        Ok((shares, purchase, referral))
    }
}

/// Every user row an approval may write, ascending by id
fn lock_order(investor: UserId, recipients: Vec<UserId>) -> Vec<UserId> {
    let mut ids = recipients;
    ids.push(investor);
    ids.sort();
    ids.dedup();
    ids
}

async fn lock_request(
    session: &mut dyn Session,
    request_id: InvestmentRequestId,
) -> EstateResult<InvestmentRequest> {
    session
        .lock_investment_request(request_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("investment request {}", request_id)))
}

async fn require_asset(session: &mut dyn Session, asset_id: AssetId) -> EstateResult<Asset> {
    session
        .asset(asset_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))
}
