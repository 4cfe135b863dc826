//! Ledger: the only writer of wallet and rewards balances.
//!
//! Each operation locks the user row, computes the new balances and hands the
//! session a [`LedgerEntry`] carrying both the balances and the transaction
//! that explains them. Nothing outside this module can build an entry.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EstateError, EstateResult};
use crate::store::Session;
use crate::types::{BalanceAccount, Transaction, TransactionKind, User, UserId};

/// A balance change paired with the transaction recording it
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    transaction: Transaction,
    wallet_balance: Decimal,
    rewards_balance: Decimal,
}

impl LedgerEntry {
    fn new(user: &User, transaction: Transaction) -> Self {
        let (wallet_balance, rewards_balance) = match transaction.account {
            BalanceAccount::Wallet => (user.wallet_balance + transaction.amount, user.rewards_balance),
            BalanceAccount::Rewards => (user.wallet_balance, user.rewards_balance + transaction.amount),
            BalanceAccount::Memo => (user.wallet_balance, user.rewards_balance),
        };
        Self {
            transaction,
            wallet_balance,
            rewards_balance,
        }
    }

    pub fn user_id(&self) -> UserId {
        self.transaction.user_id
    }

    /// Transaction appended by this entry
    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Wallet balance after the entry is applied
    pub fn wallet_balance(&self) -> Decimal {
        self.wallet_balance
    }

    /// Rewards balance after the entry is applied
    pub fn rewards_balance(&self) -> Decimal {
        self.rewards_balance
    }
}

/// Both legs of a rewards-to-wallet transfer
#[derive(Debug, Clone, PartialEq)]
pub struct RewardsPayout {
    pub debit: Transaction,
    pub credit: Transaction,
}

/// Sole authority over balance mutations
#[derive(Debug, Clone)]
pub struct Ledger {
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Adds `amount` to the wallet
    #[instrument(skip(self, session, description))]
    pub async fn credit_wallet(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        description: &str,
    ) -> EstateResult<Transaction> {
        require_positive(amount)?;
        require_wallet_kind(kind)?;
        let user = lock(session, user_id).await?;

        let transaction = self.transaction(user_id, amount, kind, BalanceAccount::Wallet, description);
        self.apply(session, &user, transaction).await
    }

    /// Subtracts `amount` from the wallet, failing if the balance is short
    #[instrument(skip(self, session, description))]
    pub async fn debit_wallet(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        description: &str,
    ) -> EstateResult<Transaction> {
        require_positive(amount)?;
        require_wallet_kind(kind)?;
        let user = lock(session, user_id).await?;

        if user.wallet_balance < amount {
            return Err(EstateError::InsufficientFunds {
                required: amount,
                available: user.wallet_balance,
            });
        }

        let transaction = self.transaction(user_id, -amount, kind, BalanceAccount::Wallet, description);
        self.apply(session, &user, transaction).await
    }

    /// Adds `amount` to the rewards balance with kind `reward`
    #[instrument(skip(self, session, description))]
    pub async fn credit_rewards(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        amount: Decimal,
        description: &str,
    ) -> EstateResult<Transaction> {
        require_positive(amount)?;
        let user = lock(session, user_id).await?;

        let transaction = self.transaction(
            user_id,
            amount,
            TransactionKind::Reward,
            BalanceAccount::Rewards,
            description,
        );
        self.apply(session, &user, transaction).await
    }

    /// Moves `amount` from the rewards balance into the wallet
    #[instrument(skip(self, session))]
    pub async fn payout_rewards(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        amount: Decimal,
    ) -> EstateResult<RewardsPayout> {
        require_positive(amount)?;
        let user = lock(session, user_id).await?;

        if user.rewards_balance < amount {
            return Err(EstateError::InsufficientRewards {
                required: amount,
                available: user.rewards_balance,
            });
        }

        let debit = self.transaction(
            user_id,
            -amount,
            TransactionKind::RewardPayout,
            BalanceAccount::Rewards,
            "Referral rewards paid out to wallet",
        );
        let debit_entry = LedgerEntry::new(&user, debit);
        session.apply_ledger_entry(&debit_entry).await?;

        let mut user = user;
        user.wallet_balance = debit_entry.wallet_balance;
        user.rewards_balance = debit_entry.rewards_balance;

        let credit = self.transaction(
            user_id,
            amount,
            TransactionKind::Deposit,
            BalanceAccount::Wallet,
            "Referral rewards payout",
        );
        let credit = self.apply(session, &user, credit).await?;

        Ok(RewardsPayout {
            debit: debit_entry.transaction,
            credit,
        })
    }

    /// Appends an observational transaction that moves no balance.
    ///
    /// `amount` is signed and must be non-zero.
    #[instrument(skip(self, session, description))]
    pub async fn record_memo(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        description: &str,
    ) -> EstateResult<Transaction> {
        if amount.is_zero() {
            return Err(EstateError::invalid("transaction amount must be non-zero"));
        }
        let user = lock(session, user_id).await?;

        let transaction = self.transaction(user_id, amount, kind, BalanceAccount::Memo, description);
        self.apply(session, &user, transaction).await
    }

    fn transaction(
        &self,
        user_id: UserId,
        amount: Decimal,
        kind: TransactionKind,
        account: BalanceAccount,
        description: &str,
    ) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            user_id,
            amount,
            kind,
            account,
            description: description.to_string(),
            created_at: self.now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn apply(
        &self,
        session: &mut dyn Session,
        user: &User,
        transaction: Transaction,
    ) -> EstateResult<Transaction> {
        let entry = LedgerEntry::new(user, transaction);
        session.apply_ledger_entry(&entry).await?;

        debug!(
            user_id = %entry.user_id(),
            amount = %entry.transaction.amount,
            wallet = %entry.wallet_balance,
            rewards = %entry.rewards_balance,
            "Ledger entry applied"
        );

        Ok(entry.transaction)
    }
}

async fn lock(session: &mut dyn Session, user_id: UserId) -> EstateResult<User> {
    session
        .lock_user(user_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("user {}", user_id)))
}

fn require_positive(amount: Decimal) -> EstateResult<()> {
    if amount <= Decimal::ZERO {
        return Err(EstateError::invalid(format!(
            "amount must be positive, got {}",
            amount
        )));
    }
    Ok(())
}

fn require_wallet_kind(kind: TransactionKind) -> EstateResult<()> {
    match kind {
        TransactionKind::Reward | TransactionKind::RewardPayout => Err(EstateError::invalid(
            format!("{} does not apply to the wallet", kind),
        )),
        _ => Ok(()),
    }
}
