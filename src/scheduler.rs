//! Daily payout scheduling.
//!
//! The scheduler sleeps until the configured local hour in the scheduler
//! timezone, runs one payout sweep and repeats. Sweeps are idempotent, so a
//! restart or an overlapping manual `payouts` run never double-credits.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::future::Future;
use tracing::{error, info, instrument, warn};

use estate_core::payout::PayoutSummary;
use estate_core::{EstateEngine, EstateResult};

/// First instant strictly after `now` whose local time in `tz` is `hour:00`.
///
/// When `hour:00` falls in a daylight-saving gap the first valid local time
/// after it is used; an ambiguous time resolves to its earlier instant.
pub fn next_fire(now: DateTime<Utc>, tz: Tz, hour: u32) -> DateTime<Utc> {
    let today = now.with_timezone(&tz).date_naive();
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();

    for offset in 0..=2 {
        let candidate = resolve_local(tz, (today + Duration::days(offset)).and_time(at));
        if candidate > now {
            return candidate;
        }
    }
    now + Duration::days(1)
}

fn resolve_local(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = local;
    for _ in 0..24 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => candidate += Duration::minutes(30),
        }
    }
    Utc.from_utc_datetime(&local)
}

/// Runs payout sweeps once a day
#[derive(Debug, Clone)]
pub struct PayoutScheduler {
    engine: EstateEngine,
    timezone: Tz,
    hour: u32,
}

impl PayoutScheduler {
    /// Uses the engine's configured timezone and payout hour
    pub fn new(engine: EstateEngine) -> EstateResult<Self> {
        let timezone = engine.config().timezone()?;
        let hour = engine.config().payout_hour;
        Ok(Self {
            engine,
            timezone,
            hour,
        })
    }

    /// Next sweep time as seen by the engine clock
    pub fn next_fire(&self) -> DateTime<Utc> {
        next_fire(self.engine.clock().now(), self.timezone, self.hour)
    }

    /// Runs one sweep, logging instead of propagating failures
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Option<PayoutSummary> {
        match self.engine.run_payouts().await {
            Ok(summary) => {
                if summary.errors.is_empty() {
                    info!(
                        processed = summary.processed,
                        credited = summary.credited,
                        distributed = %summary.distributed,
                        "Payout sweep complete"
                    );
                } else {
                    warn!(
                        credited = summary.credited,
                        failed = summary.errors.len(),
                        "Payout sweep finished with failures"
                    );
                }
                Some(summary)
            }
            Err(e) => {
                error!(error = %e, "Payout sweep failed");
                None
            }
        }
    }

    /// Loops until `shutdown` resolves
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let now = self.engine.clock().now();
            let fire_at = next_fire(now, self.timezone, self.hour);
            let wait = (fire_at - now).to_std().unwrap_or_default();
            info!(fire_at = %fire_at, timezone = %self.timezone, "Next payout sweep scheduled");

            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Payout scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.sweep().await;
        }
    }
}
