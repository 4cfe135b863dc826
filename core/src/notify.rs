//! Deferred notifications.
//!
//! Components push [`Notification`]s into an [`Effects`] buffer while a
//! session is open. The engine hands the buffer to a [`NotificationSink`] only
//! after the session committed; a failed delivery is logged and dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::types::UserId;

/// Events users are told about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    InvestmentApproved,
    InvestmentRejected,
    InvestmentUnderReview,
    InvestmentDocumentsMissing,
    WithdrawalApproved,
    WithdrawalRejected,
    RentalIncome,
    RewardsPaidOut,
    ReferralUsed,
    ReferralRewardEarned,
    PasswordChanged,
    AssetClosed,
    NewAssetPublished,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::InvestmentApproved => "investment_approved",
            NotificationKind::InvestmentRejected => "investment_rejected",
            NotificationKind::InvestmentUnderReview => "investment_under_review",
            NotificationKind::InvestmentDocumentsMissing => "investment_documents_missing",
            NotificationKind::WithdrawalApproved => "withdrawal_approved",
            NotificationKind::WithdrawalRejected => "withdrawal_rejected",
            NotificationKind::RentalIncome => "rental_income",
            NotificationKind::RewardsPaidOut => "rewards_paid_out",
            NotificationKind::ReferralUsed => "referral_used",
            NotificationKind::ReferralRewardEarned => "referral_reward_earned",
            NotificationKind::PasswordChanged => "password_changed",
            NotificationKind::AssetClosed => "asset_closed",
            NotificationKind::NewAssetPublished => "new_asset_published",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message addressed to one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub payload: Value,
}

/// Side effects collected during a session, run after commit
#[derive(Debug, Default)]
pub struct Effects {
    notifications: Vec<Notification>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a notification
    pub fn notify(&mut self, user_id: UserId, kind: NotificationKind, payload: Value) {
        self.notifications.push(Notification {
            user_id,
            kind,
            payload,
        });
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub fn into_notifications(self) -> Vec<Notification> {
        self.notifications
    }
}

/// Opaque delivery channel (push, e-mail, ...)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl NotificationSink for NullNotifier {
    async fn notify(&self, _notification: &Notification) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink that keeps every delivered notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Delivered notifications of one kind, in delivery order
    pub fn of_kind(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

/// Delivers `effects` in order and returns how many were accepted.
///
/// Failures never propagate.
pub async fn dispatch(sink: &dyn NotificationSink, effects: Effects) -> usize {
    let mut delivered = 0;
    for notification in effects.into_notifications() {
        match sink.notify(&notification).await {
            Ok(()) => delivered += 1,
            Err(e) => warn!(
                user_id = %notification.user_id,
                kind = %notification.kind,
                error = %e,
                "Notification delivery failed"
            ),
        }
    }
    delivered
}
