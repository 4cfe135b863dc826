mod common;

use async_trait::async_trait;
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use common::{at, Harness};
use estate_core::config::{EngineConfig, FundingPolicy};
use estate_core::memory::MemoryState;
use estate_core::notify::{Notification, NotificationKind, NotificationSink};
use estate_core::types::{
    Actor, AssetStatus, BalanceAccount, InvestmentStatus, PaymentMethod, ReviewDecision,
    TransactionKind, UserId, WithdrawalStatus, WithdrawalSubmission,
};
use estate_core::EstateError;

fn assert_share_conservation(state: &MemoryState) {
    for asset in state.assets() {
        let issued = state.shares().iter().filter(|s| s.asset_id == asset.id).count() as u32;
        assert_eq!(
            asset.shares_available + issued,
            asset.total_shares,
            "share counters drifted for {}",
            asset.title
        );
    }
}

fn transactions_of(state: &MemoryState, user_id: UserId) -> Vec<(TransactionKind, BalanceAccount, Decimal)> {
    state
        .transactions()
        .iter()
        .filter(|t| t.user_id == user_id)
        .map(|t| (t.kind, t.account, t.amount))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_share_race() {
    let h = Harness::new();
    let asset = h.asset(dec!(10000), 10, dec!(100)).await;
    let early = h.user("Early").await;
    h.invest(&early, &asset, 9, None).await;

    let first = h.user("First").await;
    let second = h.user("Second").await;
    let first_request = h.request_under_review(&first, &asset, 1, None).await;
    let second_request = h.request_under_review(&second, &asset, 1, None).await;

    let approvals = [first_request, second_request].map(|request_id| {
        let engine = h.engine.clone();
        let operator = h.operator;
        tokio::spawn(async move {
            engine
                .review_investment(operator, request_id, ReviewDecision::Approve { notes: None })
                .await
        })
    });

    let mut approved = 0;
    let mut refused = 0;
    for handle in approvals {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.shares.len(), 1);
                approved += 1;
            }
            Err(EstateError::NotAvailable { available, .. }) => {
                assert_eq!(available, 0);
                refused += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((approved, refused), (1, 1));

    let state = h.store.snapshot().await;
    let stored = state.asset(asset.id).unwrap();
    assert_eq!(stored.shares_available, 0);
    assert!(stored.is_closed);
    assert_eq!(stored.status(), AssetStatus::Closed);
    assert_eq!(state.shares().len(), 10);
    assert_share_conservation(&state);

    let statuses: Vec<InvestmentStatus> = state
        .investment_requests()
        .iter()
        .filter(|r| r.id == first_request || r.id == second_request)
        .map(|r| r.status)
        .collect();
    assert!(statuses.contains(&InvestmentStatus::Approved));
    assert!(statuses.contains(&InvestmentStatus::UnderReview));
}

#[tokio::test]
async fn test_payout_after_one_month() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.user("Karim").await;
    h.invest(&investor, &asset, 5, None).await;

    h.clock.set(at(2025, 2, 16, 10));
    let summary = h.engine.run_payouts().await.unwrap();
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.credited, 5);
    assert_eq!(summary.distributed, dec!(50));
    assert!(summary.errors.is_empty());

    let state = h.store.snapshot().await;
    assert_eq!(state.user(investor.id).unwrap().wallet_balance, dec!(50));
    assert!(state
        .shares()
        .iter()
        .all(|s| s.last_payout_at == Some(at(2025, 2, 16, 10))));
    assert_eq!(h.notifier.of_kind(NotificationKind::RentalIncome).len(), 1);

    h.clock.advance(Duration::hours(1));
    let again = h.engine.run_payouts().await.unwrap();
    assert_eq!(again.credited, 0);
    assert_eq!(again.distributed, dec!(0));

    let state = h.store.snapshot().await;
    assert_eq!(state.user(investor.id).unwrap().wallet_balance, dec!(50));
}

#[tokio::test]
async fn test_month_end_approval() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.user("Dina").await;
    h.clock.set(at(2025, 1, 31, 10));
    h.invest(&investor, &asset, 1, None).await;

    h.clock.set(at(2025, 2, 28, 10));
    let february = h.engine.run_payouts().await.unwrap();
    assert_eq!(february.distributed, dec!(0));

    h.clock.set(at(2025, 3, 1, 10));
    let march = h.engine.run_payouts().await.unwrap();
    assert_eq!(march.distributed, dec!(10));
}

#[tokio::test]
async fn test_daily_sweeps_match_one_late_sweep() {
    let daily = Harness::new();
    let asset = daily.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = daily.user("Karim").await;
    daily.invest(&investor, &asset, 5, None).await;

    let mut distributed = Decimal::ZERO;
    let mut day = at(2025, 1, 15, 10);
    while day < at(2025, 4, 15, 10) {
        day += Duration::days(1);
        daily.clock.set(day);
        distributed += daily.engine.run_payouts().await.unwrap().distributed;
    }
    assert_eq!(distributed, dec!(150));

    let late = Harness::new();
    let asset = late.asset(dec!(100000), 100, dec!(1000)).await;
    let investor_late = late.user("Karim").await;
    late.invest(&investor_late, &asset, 5, None).await;
    late.clock.set(at(2025, 4, 15, 10));
    assert_eq!(late.engine.run_payouts().await.unwrap().distributed, dec!(150));

    let daily_state = daily.store.snapshot().await;
    let late_state = late.store.snapshot().await;
    assert_eq!(
        daily_state.user(investor.id).unwrap().wallet_balance,
        late_state.user(investor_late.id).unwrap().wallet_balance
    );
    assert_eq!(daily.notifier.of_kind(NotificationKind::RentalIncome).len(), 3);
    assert_eq!(late.notifier.of_kind(NotificationKind::RentalIncome).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_sweeps_pay_once() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.user("Hana").await;
    h.invest(&investor, &asset, 5, None).await;
    h.clock.set(at(2025, 2, 16, 10));

    let sweeps = [0, 1].map(|_| {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.run_payouts().await })
    });

    let mut credited = 0;
    let mut distributed = Decimal::ZERO;
    for handle in sweeps {
        let summary = handle.await.unwrap().unwrap();
        assert!(summary.errors.is_empty());
        credited += summary.credited;
        distributed += summary.distributed;
    }
    assert_eq!(credited, 5);
    assert_eq!(distributed, dec!(50));

    let state = h.store.snapshot().await;
    assert_eq!(state.user(investor.id).unwrap().wallet_balance, dec!(50));
    let income = state
        .transactions()
        .iter()
        .filter(|t| t.user_id == investor.id && t.kind == TransactionKind::RentalIncome)
        .count();
    assert_eq!(income, 5);
}

#[tokio::test]
async fn test_referral_reward() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let referrer = h.user("Rami").await;
    let referee = h.user("Eman").await;

    let node = h
        .engine
        .referral_code(Actor::user(referrer.id), asset.id)
        .await
        .unwrap();
    h.invest(&referee, &asset, 10, Some(node.code.clone())).await;

    let state = h.store.snapshot().await;
    assert_eq!(state.user(referrer.id).unwrap().rewards_balance, dec!(5));
    assert_eq!(state.user(referrer.id).unwrap().wallet_balance, dec!(0));
    assert_eq!(
        transactions_of(&state, referrer.id),
        vec![(TransactionKind::Reward, BalanceAccount::Rewards, dec!(5))]
    );
    assert_eq!(state.referral_usages().len(), 1);
    assert_eq!(state.referral_usages()[0].shares_purchased, 10);
    assert_eq!(state.referral_usages()[0].investment_amount, dec!(10000));
    assert_eq!(h.notifier.of_kind(NotificationKind::ReferralUsed).len(), 1);

    let stats = h
        .engine
        .referral_stats(Actor::user(referrer.id), referrer.id)
        .await
        .unwrap();
    assert_eq!(stats.usage_count, 1);
    assert_eq!(stats.rewards_earned, dec!(5));

    let downline = h
        .engine
        .referral_downline(Actor::user(referrer.id), asset.id, None)
        .await
        .unwrap();
    assert_eq!(downline.len(), 1);
    assert_eq!(downline[0].node.user_id, referee.id);
}

#[tokio::test]
async fn test_upline_reward_decays() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let patron = h.user("Patron").await;
    let middle = h.user("Middle").await;
    let newcomer = h.user("Newcomer").await;

    let patron_code = h
        .engine
        .referral_code(Actor::user(patron.id), asset.id)
        .await
        .unwrap()
        .code;
    h.invest(&middle, &asset, 1, Some(patron_code)).await;

    let middle_code = h
        .engine
        .referral_code(Actor::user(middle.id), asset.id)
        .await
        .unwrap()
        .code;
    h.invest(&newcomer, &asset, 10, Some(middle_code)).await;

    let state = h.store.snapshot().await;
    // 0.50 for the direct referral plus 0.50 decayed from the second level
    assert_eq!(state.user(patron.id).unwrap().rewards_balance, dec!(1));
    assert_eq!(state.user(middle.id).unwrap().rewards_balance, dec!(5));
    assert_eq!(state.referral_usages().len(), 2);

    let upline = h
        .engine
        .referral_upline(Actor::user(newcomer.id), asset.id, None)
        .await
        .unwrap();
    let chain: Vec<UserId> = upline.iter().map(|e| e.node.user_id).collect();
    assert_eq!(chain, vec![middle.id, patron.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cross_referred_approvals_run_concurrently() {
    let h = Harness::new();
    let villa = h.asset(dec!(100000), 100, dec!(1000)).await;
    let chalet = h.asset(dec!(100000), 100, dec!(1000)).await;
    let alice = h.user("Alice").await;
    let bob = h.user("Bob").await;

    let alice_code = h
        .engine
        .referral_code(Actor::user(alice.id), villa.id)
        .await
        .unwrap()
        .code;
    let bob_code = h
        .engine
        .referral_code(Actor::user(bob.id), chalet.id)
        .await
        .unwrap()
        .code;
    let bob_request = h.request_under_review(&bob, &villa, 10, Some(alice_code)).await;
    let alice_request = h.request_under_review(&alice, &chalet, 10, Some(bob_code)).await;

    let approvals = [bob_request, alice_request].map(|request_id| {
        let engine = h.engine.clone();
        let operator = h.operator;
        tokio::spawn(async move {
            engine
                .review_investment(operator, request_id, ReviewDecision::Approve { notes: None })
                .await
        })
    });
    for handle in approvals {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.request.status, InvestmentStatus::Approved);
    }

    let state = h.store.snapshot().await;
    assert_eq!(state.user(alice.id).unwrap().rewards_balance, dec!(5));
    assert_eq!(state.user(bob.id).unwrap().rewards_balance, dec!(5));
    assert_eq!(state.referral_usages().len(), 2);
    assert_share_conservation(&state);
}

#[tokio::test]
async fn test_withdrawal_gating() {
    let h = Harness::new();
    let user = h.funded_user("Omar", dec!(500)).await;
    let actor = Actor::user(user.id);
    let submission = |amount: Decimal| WithdrawalSubmission {
        amount,
        payment_method: PaymentMethod::Instapay,
        account_details: Some("omar@instapay".to_string()),
    };

    let first = h.engine.submit_withdrawal(actor, submission(dec!(300))).await.unwrap();
    assert_eq!(first.status, WithdrawalStatus::Pending);

    let err = h
        .engine
        .submit_withdrawal(actor, submission(dec!(100)))
        .await
        .unwrap_err();
    assert_eq!(err, EstateError::ConcurrentRequest { user_id: user.id });

    let approved = h
        .engine
        .approve_withdrawal(h.operator, first.id, Some("Sent".to_string()))
        .await
        .unwrap();
    assert_eq!(approved.status, WithdrawalStatus::Approved);

    let state = h.store.snapshot().await;
    assert_eq!(state.user(user.id).unwrap().wallet_balance, dec!(200));
    let withdrawals: Vec<_> = transactions_of(&state, user.id)
        .into_iter()
        .filter(|(kind, _, _)| *kind == TransactionKind::Withdrawal)
        .collect();
    assert_eq!(
        withdrawals,
        vec![(TransactionKind::Withdrawal, BalanceAccount::Wallet, dec!(-300))]
    );

    let next = h.engine.submit_withdrawal(actor, submission(dec!(100))).await;
    assert!(next.is_ok());
    assert_eq!(h.notifier.of_kind(NotificationKind::WithdrawalApproved).len(), 1);
}

#[tokio::test]
async fn test_rewards_payout() {
    let h = Harness::new();
    let asset = h.asset(dec!(2400000), 100, dec!(1000)).await;
    let referrer = h.user("Laila").await;
    let referee = h.user("Tarek").await;
    let code = h
        .engine
        .referral_code(Actor::user(referrer.id), asset.id)
        .await
        .unwrap()
        .code;
    h.invest(&referee, &asset, 10, Some(code)).await;

    let err = h
        .engine
        .payout_rewards(h.operator, referrer.id, Some(dec!(120.01)))
        .await
        .unwrap_err();
    assert!(matches!(err, EstateError::InsufficientRewards { .. }));

    let payout = h
        .engine
        .payout_rewards(h.operator, referrer.id, Some(dec!(120)))
        .await
        .unwrap();
    assert_eq!(payout.debit.amount, dec!(-120));
    assert_eq!(payout.debit.kind, TransactionKind::RewardPayout);
    assert_eq!(payout.credit.amount, dec!(120));
    assert_eq!(payout.credit.kind, TransactionKind::Deposit);

    let state = h.store.snapshot().await;
    let stored = state.user(referrer.id).unwrap();
    assert_eq!(stored.rewards_balance, dec!(0));
    assert_eq!(stored.wallet_balance, dec!(120));
    assert_eq!(
        transactions_of(&state, referrer.id),
        vec![
            (TransactionKind::Reward, BalanceAccount::Rewards, dec!(120)),
            (TransactionKind::RewardPayout, BalanceAccount::Rewards, dec!(-120)),
            (TransactionKind::Deposit, BalanceAccount::Wallet, dec!(120)),
        ]
    );

    let empty = h.engine.payout_rewards(h.operator, referrer.id, None).await;
    assert!(matches!(empty, Err(EstateError::InvalidInput(_))));
}

#[tokio::test]
async fn test_external_funding_records_memo() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.user("Youssef").await;
    h.invest(&investor, &asset, 3, None).await;

    let state = h.store.snapshot().await;
    assert_eq!(state.user(investor.id).unwrap().wallet_balance, dec!(0));
    assert_eq!(
        transactions_of(&state, investor.id),
        vec![(TransactionKind::SharePurchase, BalanceAccount::Memo, dec!(-3000))]
    );

    let portfolio = h
        .engine
        .portfolio(Actor::user(investor.id), investor.id)
        .await
        .unwrap();
    assert_eq!(portfolio.total_shares, 3);
    assert_eq!(portfolio.total_invested, dec!(3000));
    assert_eq!(portfolio.expected_monthly_income, dec!(30));
}

#[tokio::test]
async fn test_wallet_funding_rolls_back_short_approval() {
    let h = Harness::with_config(EngineConfig {
        funding_policy: FundingPolicy::Wallet,
        ..EngineConfig::default()
    });
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.funded_user("Nadia", dec!(1500)).await;
    let request_id = h.request_under_review(&investor, &asset, 2, None).await;

    let err = h
        .engine
        .review_investment(h.operator, request_id, ReviewDecision::Approve { notes: None })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EstateError::InsufficientFunds {
            required: dec!(2000),
            available: dec!(1500)
        }
    );

    let state = h.store.snapshot().await;
    assert_eq!(state.asset(asset.id).unwrap().shares_available, 100);
    assert!(state.shares().is_empty());
    assert_eq!(
        state.investment_requests()[0].status,
        InvestmentStatus::UnderReview
    );
    assert!(h.notifier.of_kind(NotificationKind::InvestmentApproved).is_empty());

    h.engine
        .deposit(h.operator, investor.id, dec!(500), "Top up")
        .await
        .unwrap();
    h.engine
        .review_investment(h.operator, request_id, ReviewDecision::Approve { notes: None })
        .await
        .unwrap();

    let state = h.store.snapshot().await;
    assert_eq!(state.user(investor.id).unwrap().wallet_balance, dec!(0));
    assert_eq!(state.asset(asset.id).unwrap().shares_available, 98);
    assert_share_conservation(&state);
}

struct BrokenSink;

#[async_trait]
impl NotificationSink for BrokenSink {
    async fn notify(&self, _notification: &Notification) -> anyhow::Result<()> {
        anyhow::bail!("push gateway unavailable")
    }
}

#[tokio::test]
async fn test_failed_notifications_do_not_roll_back() {
    let h = Harness::with_sink(Arc::new(BrokenSink));
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.user("Sherif").await;
    h.invest(&investor, &asset, 4, None).await;

    let state = h.store.snapshot().await;
    assert_eq!(state.shares().len(), 4);
    assert_eq!(state.asset(asset.id).unwrap().shares_available, 96);
    assert_eq!(
        state.investment_requests()[0].status,
        InvestmentStatus::Approved
    );
}

#[tokio::test]
async fn test_documents_round_trip() {
    let h = Harness::new();
    let asset = h.asset(dec!(100000), 100, dec!(1000)).await;
    let investor = h.user("Mai").await;
    let request_id = h.request_under_review(&investor, &asset, 2, None).await;

    let outcome = h
        .engine
        .review_investment(
            h.operator,
            request_id,
            ReviewDecision::RequestDocuments {
                notes: Some("Blurry ID".to_string()),
                missing_documents: vec!["id_document_front".to_string()],
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.request.status, InvestmentStatus::DocumentsMissing);

    let err = h
        .engine
        .review_investment(h.operator, request_id, ReviewDecision::Approve { notes: None })
        .await
        .unwrap_err();
    assert_eq!(err, EstateError::transition("documents_missing", "approved"));

    let resubmitted = h
        .engine
        .resubmit_investment(Actor::user(investor.id), request_id, Some(common::kyc("Mai")))
        .await
        .unwrap();
    assert_eq!(resubmitted.status, InvestmentStatus::UnderReview);
    assert!(resubmitted.missing_documents.is_empty());

    h.engine
        .review_investment(h.operator, request_id, ReviewDecision::Approve { notes: None })
        .await
        .unwrap();
    let holdings = h
        .engine
        .holdings(Actor::user(investor.id), investor.id, asset.id)
        .await
        .unwrap();
    assert_eq!(holdings, 2);

    let err = h
        .engine
        .review_investment(h.operator, request_id, ReviewDecision::Reject { notes: None })
        .await
        .unwrap_err();
    assert!(matches!(err, EstateError::InvalidTransition { .. }));
}
