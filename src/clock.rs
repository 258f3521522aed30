use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::utils::{is_weekday, weekdays_between};

/// Market-session policy used when deciding whether a bar for "today" is final.
pub trait MarketSessionClock: Send + Sync {
    /// Current instant in the exchange's local time.
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }

    /// Whether the session for `date` has closed as of `now()`.
    fn is_session_closed(&self, date: NaiveDate) -> bool;

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        is_weekday(date)
    }

    /// Trading days in `[from, to]` before any holiday allowance.
    fn trading_days_between(&self, from: NaiveDate, to: NaiveDate) -> u32 {
        weekdays_between(from, to)
    }
}

/// Exchange hours in a fixed UTC offset.
#[derive(Debug, Clone)]
pub struct ExchangeClock {
    offset: FixedOffset,
    close: NaiveTime,
}

impl ExchangeClock {
    pub fn new(utc_offset_minutes: i32, close_hour: u32, close_minute: u32) -> Option<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes.checked_mul(60)?)?;
        let close = NaiveTime::from_hms_opt(close_hour, close_minute, 0)?;
        Some(Self { offset, close })
    }

    fn local_now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.offset)
    }
}

impl MarketSessionClock for ExchangeClock {
    fn now(&self) -> NaiveDateTime {
        self.local_now().naive_local()
    }

    fn is_session_closed(&self, date: NaiveDate) -> bool {
        let now = self.now();
        match date.cmp(&now.date()) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => !self.is_trading_day(date) || now.time() >= self.close,
        }
    }
}

/// Clock pinned to a settable instant.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
    close: NaiveTime,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn at(date: NaiveDate, hour: u32, minute: u32) -> Self {
        let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
        Self::new(date.and_time(time))
    }

    pub fn set(&self, now: NaiveDateTime) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = now;
        }
    }
}

impl MarketSessionClock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn is_session_closed(&self, date: NaiveDate) -> bool {
        let now = self.now();
        if date < now.date() {
            return true;
        }
        date == now.date() && (!self.is_trading_day(date) || now.time() >= self.close)
    }
}
