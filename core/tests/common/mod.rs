#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use estate_core::clock::ManualClock;
use estate_core::config::EngineConfig;
use estate_core::memory::MemoryStore;
use estate_core::notify::{NotificationSink, RecordingNotifier};
use estate_core::types::{
    Actor, Asset, AssetDetails, InvestmentSubmission, KycDocuments, KycSnapshot, NewAsset,
    ReviewDecision, User,
};
use estate_core::EstateEngine;

pub struct Harness {
    pub engine: EstateEngine,
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub operator: Actor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let notifier = Arc::new(RecordingNotifier::new());
        Self::build(config, notifier.clone(), notifier)
    }

    /// Notifications go to `sink`; `notifier` stays empty
    pub fn with_sink(sink: Arc<dyn NotificationSink>) -> Self {
        Self::build(EngineConfig::default(), sink, Arc::new(RecordingNotifier::new()))
    }

    fn build(
        config: EngineConfig,
        sink: Arc<dyn NotificationSink>,
        notifier: Arc<RecordingNotifier>,
    ) -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(at(2025, 1, 15, 10)));
        let engine = EstateEngine::builder()
            .store(Arc::new(store.clone()))
            .clock(clock.clone())
            .config(config)
            .notifier(sink)
            .build()
            .expect("engine builds");

        Self {
            engine,
            store,
            clock,
            notifier,
            operator: Actor::admin(uuid::Uuid::new_v4()),
        }
    }

    pub async fn user(&self, name: &str) -> User {
        let email = format!("{}@example.com", name.to_lowercase());
        self.engine
            .register_user(name, &email, "argon2$hash")
            .await
            .expect("user registers")
    }

    pub async fn funded_user(&self, name: &str, amount: Decimal) -> User {
        let user = self.user(name).await;
        self.engine
            .deposit(self.operator, user.id, amount, "Bank transfer")
            .await
            .expect("deposit succeeds");
        user
    }

    pub async fn asset(&self, total_price: Decimal, total_shares: u32, monthly_rent: Decimal) -> Asset {
        self.engine
            .publish_asset(
                self.operator,
                NewAsset {
                    title: "Zamalek Apartment".to_string(),
                    description: "Nile-facing two-bedroom unit".to_string(),
                    location: "Zamalek, Cairo".to_string(),
                    total_price,
                    total_shares,
                    monthly_rent,
                    details: AssetDetails::Unit,
                },
            )
            .await
            .expect("asset publishes")
    }

    /// Submits and moves the request to `under_review`
    pub async fn request_under_review(
        &self,
        user: &User,
        asset: &Asset,
        shares: u32,
        referral_code: Option<String>,
    ) -> uuid::Uuid {
        let request = self
            .engine
            .submit_investment(
                Actor::user(user.id),
                InvestmentSubmission {
                    asset_id: asset.id,
                    shares_requested: shares,
                    kyc: kyc(&user.name),
                    referral_code,
                },
            )
            .await
            .expect("submission accepted");
        self.engine
            .review_investment(self.operator, request.id, ReviewDecision::StartReview { notes: None })
            .await
            .expect("review starts");
        request.id
    }

    /// Full submit, review and approve cycle
    pub async fn invest(&self, user: &User, asset: &Asset, shares: u32, referral_code: Option<String>) {
        let request_id = self.request_under_review(user, asset, shares, referral_code).await;
        self.engine
            .review_investment(self.operator, request_id, ReviewDecision::Approve { notes: None })
            .await
            .expect("approval succeeds");
    }
}

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

pub fn kyc(name: &str) -> KycSnapshot {
    KycSnapshot {
        full_name: name.to_string(),
        phone: "+201009876543".to_string(),
        national_id: "28505051234567".to_string(),
        address: "Heliopolis, Cairo".to_string(),
        date_of_birth: "1985-05-05".to_string(),
        nationality: "EG".to_string(),
        occupation: "Accountant".to_string(),
        documents: KycDocuments {
            id_front: "kyc/front.jpg".to_string(),
            id_back: "kyc/back.jpg".to_string(),
            proof_of_address: "kyc/bill.pdf".to_string(),
        },
    }
}
