/// Overnight swap scheduler: fires once per broker rollover boundary
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tracing::{error, info};

use super::engine::BBookEngine;
use crate::error::Result;
use crate::types::EngineConfig;
use crate::utils::{parse_wall_clock, parse_weekday};

pub struct SwapSchedule {
    rollover: NaiveTime,
    tz: Tz,
    triple_day: Weekday,
}

impl SwapSchedule {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let rollover = parse_wall_clock(&config.swap_rollover_time).ok_or_else(|| {
            crate::error::EngineError::ConfigError(format!(
                "Invalid swap_rollover_time: {}",
                config.swap_rollover_time
            ))
        })?;
        let tz: Tz = config.swap_rollover_tz.parse().map_err(|_| {
            crate::error::EngineError::ConfigError(format!(
                "Invalid swap_rollover_tz: {}",
                config.swap_rollover_tz
            ))
        })?;
        let triple_day = parse_weekday(&config.triple_swap_weekday).ok_or_else(|| {
            crate::error::EngineError::ConfigError(format!(
                "Invalid triple_swap_weekday: {}",
                config.triple_swap_weekday
            ))
        })?;
        Ok(SwapSchedule { rollover, tz, triple_day })
    }

    /// Next rollover instant and whether it is the triple-swap day
    pub fn next_rollover(&self, now: chrono::DateTime<Utc>) -> (chrono::DateTime<Utc>, bool) {
        let local_now = now.with_timezone(&self.tz);
        let mut date = local_now.date_naive();
        if local_now.time() >= self.rollover {
            date += ChronoDuration::days(1);
        }

        // Skip DST gaps by nudging forward a day at a time
        let target = loop {
            match self.tz.from_local_datetime(&date.and_time(self.rollover)).single() {
                Some(target) => break target,
                None => date += ChronoDuration::days(1),
            }
        };

        (target.with_timezone(&Utc), date.weekday() == self.triple_day)
    }
}

/// Long-running task applying swap at every rollover boundary
pub async fn run_swap_scheduler(engine: Arc<BBookEngine>, schedule: SwapSchedule) {
    loop {
        let now = Utc::now();
        let (next, triple) = schedule.next_rollover(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(rollover = %next, triple, "Next swap rollover scheduled");
        tokio::time::sleep(wait).await;

        match engine.apply_swap(triple).await {
            Ok(count) => {
                if count > 0 {
                    info!(positions = count, "Rollover swap applied");
                }
            }
            Err(e) => error!(error = %e, code = e.error_code(), "Swap application failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> SwapSchedule {
        let config: EngineConfig = toml::from_str(
            "swap_rollover_time = \"17:00\"\nswap_rollover_tz = \"America/New_York\"\ntriple_swap_weekday = \"Wed\"",
        )
        .unwrap();
        SwapSchedule::from_config(&config).unwrap()
    }

    #[test]
    fn test_next_rollover_is_future() {
        let schedule = schedule();
        let now = Utc::now();
        let (next, _) = schedule.next_rollover(now);
        assert!(next > now);
        assert!(next - now <= ChronoDuration::days(1) + ChronoDuration::hours(1));
    }

    #[test]
    fn test_triple_day_detection() {
        let schedule = schedule();
        // 2026-02-10 12:00 ET is a Tuesday before rollover, so the
        // next boundary falls on Tuesday and is not triple
        let tuesday_noon = chrono_tz::America::New_York
            .with_ymd_and_hms(2026, 2, 10, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let (next, triple) = schedule.next_rollover(tuesday_noon);
        assert!(!triple);

        // After Tuesday's rollover the next boundary is Wednesday:
        // triple swap day
        let (_, triple_next) = schedule.next_rollover(next + ChronoDuration::minutes(1));
        assert!(triple_next);
    }
}
