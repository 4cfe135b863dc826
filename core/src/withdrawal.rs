//! Withdrawal request workflow: `pending -> approved | rejected | cancelled`.
//!
//! Funds move only on approval, through the ledger, after the balance has
//! been re-checked under the user row lock.

use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EstateError, EstateResult};
use crate::ledger::Ledger;
use crate::notify::{Effects, NotificationKind};
use crate::store::Session;
use crate::types::{
    Transaction, TransactionKind, UserId, WithdrawalRequest, WithdrawalRequestId,
    WithdrawalStatus, WithdrawalSubmission,
};

#[derive(Debug, Clone)]
pub struct WithdrawalWorkflow {
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    ledger: Ledger,
}

impl WithdrawalWorkflow {
    pub fn new(clock: Arc<dyn Clock>, config: Arc<EngineConfig>, ledger: Ledger) -> Self {
        Self {
            clock,
            config,
            ledger,
        }
    }

    /// Opens a `pending` request; the wallet is not touched yet
    #[instrument(skip(self, session, submission), fields(amount = %submission.amount, method = %submission.payment_method))]
    pub async fn submit(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        submission: WithdrawalSubmission,
    ) -> EstateResult<WithdrawalRequest> {
        if submission.amount <= Decimal::ZERO {
            return Err(EstateError::invalid("withdrawal amount must be positive"));
        }
        if submission.amount < self.config.min_withdrawal {
            return Err(EstateError::invalid(format!(
                "minimum withdrawal is {}",
                self.config.min_withdrawal
            )));
        }

        let account_details = submission
            .account_details
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if submission.payment_method.requires_account_details() && account_details.is_none() {
            return Err(EstateError::invalid(format!(
                "account details are required for {}",
                submission.payment_method
            )));
        }

        let user = session
            .lock_user(user_id)
            .await?
            .ok_or_else(|| EstateError::not_found(format!("user {}", user_id)))?;

        if session.pending_withdrawal_for_user(user_id).await?.is_some() {
            return Err(EstateError::ConcurrentRequest { user_id });
        }
        if submission.amount > user.wallet_balance {
            return Err(EstateError::InsufficientFunds {
                required: submission.amount,
                available: user.wallet_balance,
            });
        }

        let request = WithdrawalRequest {
            id: Uuid::new_v4(),
            user_id,
            amount: submission.amount,
            payment_method: submission.payment_method,
            account_details,
            status: WithdrawalStatus::Pending,
            admin_notes: None,
            processed_by: None,
            submitted_at: self.clock.now(),
            processed_at: None,
        };
        session.insert_withdrawal_request(&request).await?;

        info!(request_id = %request.id, "Withdrawal request submitted");
        Ok(request)
    }

    /// Debits the wallet and closes the request
    #[instrument(skip(self, session, effects, notes))]
    pub async fn approve(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        reviewer_id: UserId,
        request_id: WithdrawalRequestId,
        notes: Option<String>,
    ) -> EstateResult<(WithdrawalRequest, Transaction)> {
        let mut request = self
            .lock_pending(session, request_id, WithdrawalStatus::Approved)
            .await?;

        let description = format!("Withdrawal via {}", request.payment_method);
        let transaction = self
            .ledger
            .debit_wallet(
                session,
                request.user_id,
                request.amount,
                TransactionKind::Withdrawal,
                &description,
            )
            .await?;

        self.close(&mut request, WithdrawalStatus::Approved, reviewer_id, notes);
        session.update_withdrawal_request(&request).await?;

        effects.notify(
            request.user_id,
            NotificationKind::WithdrawalApproved,
            json!({
                "request_id": request.id,
                "amount": request.amount.to_string(),
                "payment_method": request.payment_method,
            }),
        );

        info!(request_id = %request.id, amount = %request.amount, "Withdrawal approved");
        Ok((request, transaction))
    }

    /// Closes the request without moving funds
    #[instrument(skip(self, session, effects, notes))]
    pub async fn reject(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        reviewer_id: UserId,
        request_id: WithdrawalRequestId,
        notes: Option<String>,
    ) -> EstateResult<WithdrawalRequest> {
        let mut request = self
            .lock_pending(session, request_id, WithdrawalStatus::Rejected)
            .await?;

        self.close(&mut request, WithdrawalStatus::Rejected, reviewer_id, notes);
        session.update_withdrawal_request(&request).await?;

        effects.notify(
            request.user_id,
            NotificationKind::WithdrawalRejected,
            json!({
                "request_id": request.id,
                "amount": request.amount.to_string(),
                "notes": request.admin_notes,
            }),
        );
        Ok(request)
    }

    /// Owner withdraws their own pending request
    #[instrument(skip(self, session))]
    pub async fn cancel(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        request_id: WithdrawalRequestId,
    ) -> EstateResult<WithdrawalRequest> {
        let mut request = lock_request(session, request_id).await?;
        if request.user_id != user_id {
            return Err(EstateError::Unauthorized(format!(
                "withdrawal request {} belongs to another user",
                request_id
            )));
        }
        if request.status != WithdrawalStatus::Pending {
            return Err(EstateError::transition(request.status, WithdrawalStatus::Cancelled));
        }

        request.status = WithdrawalStatus::Cancelled;
        request.processed_at = Some(self.clock.now());
        session.update_withdrawal_request(&request).await?;
        Ok(request)
    }

    async fn lock_pending(
        &self,
        session: &mut dyn Session,
        request_id: WithdrawalRequestId,
        target: WithdrawalStatus,
    ) -> EstateResult<WithdrawalRequest> {
        let request = lock_request(session, request_id).await?;
        if request.status != WithdrawalStatus::Pending {
            return Err(EstateError::transition(request.status, target));
        }
        Ok(request)
    }

    fn close(
        &self,
        request: &mut WithdrawalRequest,
        status: WithdrawalStatus,
        reviewer_id: UserId,
        notes: Option<String>,
    ) {
        request.status = status;
        request.processed_by = Some(reviewer_id);
        request.processed_at = Some(self.clock.now());
        if notes.is_some() {
            request.admin_notes = notes;
        }
    }
}

async fn lock_request(
    session: &mut dyn Session,
    request_id: WithdrawalRequestId,
) -> EstateResult<WithdrawalRequest> {
    session
        .lock_withdrawal_request(request_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("withdrawal request {}", request_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::testing::{fund, seed_user, Fixture};
    use crate::types::PaymentMethod;
    use rust_decimal_macros::dec;

    fn workflow(fx: &Fixture) -> WithdrawalWorkflow {
        WithdrawalWorkflow::new(
            fx.clock.clone(),
            Arc::new(EngineConfig::default()),
            Ledger::new(fx.clock.clone()),
        )
    }

    fn instapay(amount: Decimal) -> WithdrawalSubmission {
        WithdrawalSubmission {
            amount,
            payment_method: PaymentMethod::Instapay,
            account_details: Some("01001234567".to_string()),
        }
    }

    #[tokio::test]
    async fn test_submission_rules() {
        let fx = Fixture::new();
        let user = seed_user(&fx.store, "w@example.com").await;
        fund(&fx, &user, dec!(500)).await;
        let flow = workflow(&fx);
        let mut session = fx.store.begin().await.unwrap();

        let below_min = flow.submit(session.as_mut(), user.id, instapay(dec!(99.99))).await;
        assert!(matches!(below_min, Err(EstateError::InvalidInput(_))));

        let too_much = flow.submit(session.as_mut(), user.id, instapay(dec!(501))).await;
        assert!(matches!(too_much, Err(EstateError::InsufficientFunds { .. })));

        let no_account = WithdrawalSubmission {
            account_details: Some("   ".to_string()),
            ..instapay(dec!(200))
        };
        let no_account = flow.submit(session.as_mut(), user.id, no_account).await;
        assert!(matches!(no_account, Err(EstateError::InvalidInput(_))));

        let company = WithdrawalSubmission {
            amount: dec!(200),
            payment_method: PaymentMethod::Company,
            account_details: None,
        };
        let request = flow.submit(session.as_mut(), user.id, company).await.unwrap();
        assert_eq!(request.status, WithdrawalStatus::Pending);
        assert!(request.account_details.is_none());
    }

    #[tokio::test]
    async fn test_reject_and_cancel_leave_funds() {
        let fx = Fixture::new();
        let user = seed_user(&fx.store, "w@example.com").await;
        let admin = seed_user(&fx.store, "a@example.com").await;
        fund(&fx, &user, dec!(500)).await;
        let flow = workflow(&fx);
        let mut session = fx.store.begin().await.unwrap();
        let mut effects = Effects::new();

        let first = flow.submit(session.as_mut(), user.id, instapay(dec!(300))).await.unwrap();
        let rejected = flow
            .reject(session.as_mut(), &mut effects, admin.id, first.id, Some("name mismatch".to_string()))
            .await
            .unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert_eq!(rejected.admin_notes.as_deref(), Some("name mismatch"));

        // A stranger learns nothing about the closed request's state
        let err = flow.cancel(session.as_mut(), admin.id, first.id).await.unwrap_err();
        assert!(matches!(err, EstateError::Unauthorized(_)));
        let err = flow.cancel(session.as_mut(), user.id, first.id).await.unwrap_err();
        assert_eq!(err, EstateError::transition("rejected", "cancelled"));

        let second = flow.submit(session.as_mut(), user.id, instapay(dec!(300))).await.unwrap();
        let err = flow.cancel(session.as_mut(), admin.id, second.id).await.unwrap_err();
        assert!(matches!(err, EstateError::Unauthorized(_)));

        let cancelled = flow.cancel(session.as_mut(), user.id, second.id).await.unwrap();
        assert_eq!(cancelled.status, WithdrawalStatus::Cancelled);

        let err = flow
            .approve(session.as_mut(), &mut effects, admin.id, second.id, None)
            .await
            .unwrap_err();
        assert_eq!(err, EstateError::transition("cancelled", "approved"));

        let wallet = session.user(user.id).await.unwrap().unwrap().wallet_balance;
        assert_eq!(wallet, dec!(500));
        assert_eq!(effects.notifications().len(), 1);
    }

    #[tokio::test]
    async fn test_approval_rechecks_balance() {
        let fx = Fixture::new();
        let user = seed_user(&fx.store, "w@example.com").await;
        let admin = seed_user(&fx.store, "a@example.com").await;
        fund(&fx, &user, dec!(300)).await;
        let flow = workflow(&fx);
        let ledger = Ledger::new(fx.clock.clone());
        let mut session = fx.store.begin().await.unwrap();
        let mut effects = Effects::new();

        let request = flow.submit(session.as_mut(), user.id, instapay(dec!(300))).await.unwrap();
        ledger
            .debit_wallet(session.as_mut(), user.id, dec!(50), TransactionKind::SharePurchase, "")
            .await
            .unwrap();

        let err = flow
            .approve(session.as_mut(), &mut effects, admin.id, request.id, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EstateError::InsufficientFunds {
                required: dec!(300),
                available: dec!(250)
            }
        );
    }
}
