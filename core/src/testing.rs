//! Fixtures shared by unit tests.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::clock::{Clock, ManualClock};
use crate::ledger::Ledger;
use crate::memory::MemoryStore;
use crate::store::Store;
use crate::types::{AssetDetails, KycDocuments, KycSnapshot, NewAsset, TransactionKind, User};

pub struct Fixture {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            clock: Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap(),
            )),
        }
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }
}

pub async fn seed_user(store: &MemoryStore, email: &str) -> User {
    let user = User::new(
        email.split('@').next().unwrap_or("user").to_string(),
        email.to_string(),
        "argon2$hash".to_string(),
        Utc::now(),
    );
    let mut session = store.begin().await.unwrap();
    session.insert_user(&user).await.unwrap();
    session.commit().await.unwrap();
    user
}

pub async fn fund(fx: &Fixture, user: &User, amount: Decimal) {
    let ledger = Ledger::new(fx.clock.clone());
    let mut session = fx.store.begin().await.unwrap();
    ledger
        .credit_wallet(session.as_mut(), user.id, amount, TransactionKind::Deposit, "seed")
        .await
        .unwrap();
    session.commit().await.unwrap();
}

pub fn new_asset(total_price: Decimal, total_shares: u32, monthly_rent: Decimal) -> NewAsset {
    NewAsset {
        title: "Garden Residence".to_string(),
        description: "Three-bedroom unit".to_string(),
        location: "New Cairo".to_string(),
        total_price,
        total_shares,
        monthly_rent,
        details: AssetDetails::Unit,
    }
}

pub fn kyc() -> KycSnapshot {
    KycSnapshot {
        full_name: "Salma Hassan".to_string(),
        phone: "+201001234567".to_string(),
        national_id: "29001011234567".to_string(),
        address: "Maadi, Cairo".to_string(),
        date_of_birth: "1990-01-01".to_string(),
        nationality: "EG".to_string(),
        occupation: "Architect".to_string(),
        documents: KycDocuments {
            id_front: "uploads/id_front.jpg".to_string(),
            id_back: "uploads/id_back.jpg".to_string(),
            proof_of_address: "uploads/utility.pdf".to_string(),
        },
    }
}
