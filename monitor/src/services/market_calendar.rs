use std::collections::HashSet;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use shared::Config;

/// Trading hours and the cutoff at which a day's setups stop being valid.
#[async_trait]
pub trait MarketCalendar: Send + Sync {
    async fn is_market_open(&self, at: DateTime<Utc>) -> Result<bool>;

    async fn is_trading_day(&self, date: NaiveDate) -> Result<bool>;

    /// Close of the current trading session, or of the next one when `from` is past today's close.
    async fn next_validity_cutoff(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>>;

    /// Calendar date of `at` in the exchange's timezone.
    fn market_date(&self, at: DateTime<Utc>) -> NaiveDate;
}

/// Weekday sessions between `open` and `close`, minus configured holidays.
pub struct ExchangeCalendar {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    holidays: HashSet<NaiveDate>,
}

impl ExchangeCalendar {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            tz,
            open,
            close,
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.market_timezone,
            config.market_open,
            config.market_close,
            config.market_holidays.iter().copied(),
        )
    }

    fn trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn session_close(&self, date: NaiveDate) -> Result<DateTime<Utc>> {
        self.tz
            .from_local_datetime(&date.and_time(self.close))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(|| anyhow!("Market close {} does not exist on {} in {}", self.close, date, self.tz))
    }
}

#[async_trait]
impl MarketCalendar for ExchangeCalendar {
    async fn is_market_open(&self, at: DateTime<Utc>) -> Result<bool> {
        let local = at.with_timezone(&self.tz);
        let time = local.time();
        Ok(self.trading_day(local.date_naive()) && time >= self.open && time < self.close)
    }

    async fn is_trading_day(&self, date: NaiveDate) -> Result<bool> {
        Ok(self.trading_day(date))
    }

    async fn next_validity_cutoff(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let local = from.with_timezone(&self.tz);
        let mut date = local.date_naive();
        if !self.trading_day(date) || local.time() >= self.close {
            date += Duration::days(1);
        }
        // a month of consecutive holidays means the calendar is misconfigured
        for _ in 0..31 {
            if self.trading_day(date) {
                return self.session_close(date);
            }
            date += Duration::days(1);
        }
        Err(anyhow!("No trading day within a month of {}", local))
    }

    fn market_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.tz).date_naive()
    }
}
