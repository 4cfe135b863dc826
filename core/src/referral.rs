//! Referral engine: per (user, asset) codes, usage records and multi-level
//! reward credits.
//!
//! The tree is stored as parent links only. Every traversal is breadth-first
//! and bounded by the configured depth cap.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EstateError, EstateResult};
use crate::ledger::Ledger;
use crate::notify::{Effects, NotificationKind};
use crate::store::Session;
use crate::types::{
    round_money, Asset, AssetId, AssetKind, ReferralNode, ReferralUsage, TransactionId, UserId,
};

const CODE_ATTEMPTS: usize = 8;

/// A reward credited to one member of the referrer's upline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralCredit {
    pub user_id: UserId,
    /// 0 for the direct referrer, k for the k-th ancestor above it
    pub distance: u32,
    pub amount: Decimal,
    pub transaction_id: TransactionId,
}

/// What a referred approval produced
#[derive(Debug, Clone, PartialEq)]
pub struct ReferralOutcome {
    pub usage: ReferralUsage,
    pub credits: Vec<ReferralCredit>,
}

impl ReferralOutcome {
    pub fn total_rewarded(&self) -> Decimal {
        self.credits.iter().map(|c| c.amount).sum()
    }
}

/// A node reached by a bounded traversal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Edges between the starting node and this one
    pub depth: u32,
    pub node: ReferralNode,
}

/// Aggregate referral figures for one referrer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub usage_count: usize,
    pub referred_investment: Decimal,
    pub referred_shares: u64,
    /// Sum of the accumulated counters on every node the user owns
    pub rewards_earned: Decimal,
}

#[derive(Debug, Clone)]
pub struct ReferralEngine {
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    ledger: Ledger,
}

impl ReferralEngine {
    pub fn new(clock: Arc<dyn Clock>, config: Arc<EngineConfig>, ledger: Ledger) -> Self {
        Self {
            clock,
            config,
            ledger,
        }
    }

    /// Returns the user's node for the asset, creating a root node if absent
    #[instrument(skip(self, session))]
    pub async fn code_for(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<ReferralNode> {
        if let Some(node) = session.referral_node_for(user_id, asset_id).await? {
            return Ok(node);
        }

        require_user(session, user_id).await?;
        let asset = require_asset(session, asset_id).await?;
        let node = self
            .insert_node(session, user_id, &asset, None, 0)
            .await?;

        info!(user_id = %user_id, asset_id = %asset_id, code = %node.code, "Referral code issued");
        Ok(node)
    }

    /// Looks up the node owning `code` for `asset_id`
    pub async fn resolve_code(
        &self,
        session: &mut dyn Session,
        asset_id: AssetId,
        code: &str,
    ) -> EstateResult<ReferralNode> {
        let code = code.trim();
        session
            .referral_node_by_code(asset_id, code)
            .await?
            .ok_or_else(|| EstateError::UnknownCode {
                code: code.to_string(),
                asset_id,
            })
    }

    /// Creates the referee's node beneath the node owning `referrer_code`
    #[instrument(skip(self, session))]
    pub async fn register_referred_join(
        &self,
        session: &mut dyn Session,
        referee_id: UserId,
        asset_id: AssetId,
        referrer_code: &str,
    ) -> EstateResult<ReferralNode> {
        let parent = self.resolve_code(session, asset_id, referrer_code).await?;
        if parent.user_id == referee_id {
            return Err(EstateError::invalid("a user cannot use their own referral code"));
        }
        if session.referral_node_for(referee_id, asset_id).await?.is_some() {
            return Err(EstateError::invalid(format!(
                "user {} already has a referral node for asset {}",
                referee_id, asset_id
            )));
        }

        let asset = require_asset(session, asset_id).await?;
        let node = self
            .insert_node(session, referee_id, &asset, Some(&parent), parent.level + 1)
            .await?;

        debug!(node_id = %node.id, level = node.level, "Referred join registered");
        Ok(node)
    }

    /// Records a referred investment and credits the referrer and its upline.
    ///
    /// The direct referrer receives `amount × rate`; the ancestor `k` levels
    /// above it receives `amount × rate × decay^k`, for `k` up to the depth
    /// cap. Credits that round to zero are skipped.
    #[instrument(skip(self, session, effects, asset), fields(asset_id = %asset.id))]
    pub async fn record_use_and_reward(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        referrer_id: UserId,
        referee_id: UserId,
        asset: &Asset,
        investment_amount: Decimal,
        shares_purchased: u32,
    ) -> EstateResult<ReferralOutcome> {
        if referrer_id == referee_id {
            return Err(EstateError::invalid("a user cannot refer themselves"));
        }

        let referrer_node = self.code_for(session, referrer_id, asset.id).await?;
        if session.referral_node_for(referee_id, asset.id).await?.is_none() {
            let code = referrer_node.code.clone();
            self.register_referred_join(session, referee_id, asset.id, &code)
                .await?;
        }

        let usage = ReferralUsage {
            id: Uuid::new_v4(),
            referrer_user_id: referrer_id,
            referee_user_id: referee_id,
            asset_id: asset.id,
            asset_kind: asset.kind(),
            investment_amount,
            shares_purchased,
            created_at: self.clock.now(),
        };
        session.insert_referral_usage(&usage).await?;

        effects.notify(
            referrer_id,
            NotificationKind::ReferralUsed,
            json!({
                "asset_id": asset.id,
                "asset_title": asset.title,
                "referee_id": referee_id,
                "shares": shares_purchased,
                "investment_amount": investment_amount.to_string(),
            }),
        );

        let mut credits = Vec::new();
        let mut rate = self.config.referral_reward_rate;
        let chain = self.reward_chain(session, referrer_node).await?;
        for (distance, current) in chain.iter().enumerate() {
            let reward = round_money(investment_amount * rate);
            if reward > Decimal::ZERO && current.user_id != referee_id {
                let credit = self
                    .credit(session, effects, current, asset, reward, distance as u32)
                    .await?;
                credits.push(credit);
            }
            rate *= self.config.referral_upline_decay;
        }

        let outcome = ReferralOutcome { usage, credits };
        info!(
            referrer_id = %referrer_id,
            referee_id = %referee_id,
            credited = outcome.credits.len(),
            total = %outcome.total_rewarded(),
            "Referral rewards recorded"
        );
        Ok(outcome)
    }

    /// Users a referred investment through `referrer_id` would credit,
    /// direct referrer first.
    pub async fn reward_recipients(
        &self,
        session: &mut dyn Session,
        referrer_id: UserId,
        asset_id: AssetId,
    ) -> EstateResult<Vec<UserId>> {
        match session.referral_node_for(referrer_id, asset_id).await? {
            Some(node) => Ok(self
                .reward_chain(session, node)
                .await?
                .into_iter()
                .map(|n| n.user_id)
                .collect()),
            None => Ok(vec![referrer_id]),
        }
    }

    /// The referrer's node followed by at most `referral_depth_cap` ancestors
    async fn reward_chain(
        &self,
        session: &mut dyn Session,
        start: ReferralNode,
    ) -> EstateResult<Vec<ReferralNode>> {
        let cap = self.config.referral_depth_cap;
        let mut visited = HashSet::from([start.id]);
        let mut next = start.referrer_node_id;
        let mut chain = vec![start];

        while let Some(parent_id) = next {
            if chain.len() > cap || !visited.insert(parent_id) {
                break;
            }
            let Some(parent) = session.referral_node(parent_id).await? else {
                break;
            };
            next = parent.referrer_node_id;
            chain.push(parent);
        }
        Ok(chain)
    }

    /// Ancestors of the user's node for the asset, nearest first
    pub async fn upline(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        asset_id: AssetId,
        depth: usize,
    ) -> EstateResult<Vec<TreeEntry>> {
        let depth = self.cap(depth);
        let mut entries = Vec::new();
        let Some(start) = session.referral_node_for(user_id, asset_id).await? else {
            return Ok(entries);
        };

        let mut visited = HashSet::from([start.id]);
        let mut next = start.referrer_node_id;
        while let Some(parent_id) = next {
            if entries.len() >= depth || !visited.insert(parent_id) {
                break;
            }
            let Some(parent) = session.referral_node(parent_id).await? else {
                break;
            };
            next = parent.referrer_node_id;
            entries.push(TreeEntry {
                depth: entries.len() as u32 + 1,
                node: parent,
            });
        }
        Ok(entries)
    }

    /// Descendants of the user's node for the asset in breadth-first order
    pub async fn downline(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        asset_id: AssetId,
        depth: usize,
    ) -> EstateResult<Vec<TreeEntry>> {
        let depth = self.cap(depth) as u32;
        let mut entries = Vec::new();
        let Some(root) = session.referral_node_for(user_id, asset_id).await? else {
            return Ok(entries);
        };

        let mut visited = HashSet::from([root.id]);
        let mut queue = VecDeque::from([(root.id, 0u32)]);
        while let Some((node_id, level)) = queue.pop_front() {
            if level >= depth {
                continue;
            }
            for child in session.referral_children(node_id).await? {
                if visited.insert(child.id) {
                    queue.push_back((child.id, level + 1));
                    entries.push(TreeEntry {
                        depth: level + 1,
                        node: child,
                    });
                }
            }
        }
        Ok(entries)
    }

    /// Totals over every usage where `user_id` was the direct referrer
    pub async fn stats(&self, session: &mut dyn Session, user_id: UserId) -> EstateResult<ReferralStats> {
        let usages = session.referral_usages_for_referrer(user_id).await?;
        let nodes = session.referral_nodes_for_user(user_id).await?;

        Ok(ReferralStats {
            usage_count: usages.len(),
            referred_investment: usages.iter().map(|u| u.investment_amount).sum(),
            referred_shares: usages.iter().map(|u| u64::from(u.shares_purchased)).sum(),
            rewards_earned: nodes.iter().map(|n| n.rewards_earned).sum(),
        })
    }

    fn cap(&self, depth: usize) -> usize {
        depth.clamp(1, self.config.referral_depth_cap)
    }

    async fn credit(
        &self,
        session: &mut dyn Session,
        effects: &mut Effects,
        node: &ReferralNode,
        asset: &Asset,
        amount: Decimal,
        distance: u32,
    ) -> EstateResult<ReferralCredit> {
        let description = if distance == 0 {
            format!("Referral reward for {}", asset.title)
        } else {
            format!("Level {} referral reward for {}", distance + 1, asset.title)
        };

        let transaction = self
            .ledger
            .credit_rewards(session, node.user_id, amount, &description)
            .await?;
        session.add_referral_rewards(node.id, amount).await?;

        effects.notify(
            node.user_id,
            NotificationKind::ReferralRewardEarned,
            json!({
                "asset_id": asset.id,
                "asset_title": asset.title,
                "amount": amount.to_string(),
                "level": distance + 1,
            }),
        );

        Ok(ReferralCredit {
            user_id: node.user_id,
            distance,
            amount,
            transaction_id: transaction.id,
        })
    }

    async fn insert_node(
        &self,
        session: &mut dyn Session,
        user_id: UserId,
        asset: &Asset,
        parent: Option<&ReferralNode>,
        level: u32,
    ) -> EstateResult<ReferralNode> {
        let code = unused_code(session, asset.kind()).await?;
        let node = ReferralNode {
            id: Uuid::new_v4(),
            user_id,
            asset_id: asset.id,
            asset_kind: asset.kind(),
            code,
            referrer_node_id: parent.map(|p| p.id),
            level,
            rewards_earned: Decimal::ZERO,
            joined_at: self.clock.now(),
        };
        session.insert_referral_node(&node).await?;
        Ok(node)
    }
}

async fn unused_code(session: &mut dyn Session, kind: AssetKind) -> EstateResult<String> {
    let prefix = match kind {
        AssetKind::Unit => "U",
        AssetKind::Vehicle => "V",
    };
    for _ in 0..CODE_ATTEMPTS {
        let hex = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
        let code = format!("{}{}", prefix, &hex[..9]);
        if !session.referral_code_exists(&code).await? {
            return Ok(code);
        }
    }
    Err(EstateError::storage("could not generate a unique referral code"))
}

async fn require_user(session: &mut dyn Session, user_id: UserId) -> EstateResult<()> {
    session
        .user(user_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| EstateError::not_found(format!("user {}", user_id)))
}

async fn require_asset(session: &mut dyn Session, asset_id: AssetId) -> EstateResult<Asset> {
    session
        .asset(asset_id)
        .await?
        .ok_or_else(|| EstateError::not_found(format!("asset {}", asset_id)))
}
