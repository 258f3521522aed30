use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, Weekday};

pub fn current_human_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M").to_string()
}

/// Midnight at the start of `date`.
pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// Last whole second of `date`.
pub fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    let last = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
    date.and_time(last)
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Count Monday-Friday dates in `[from, to]`. Returns zero for an inverted range.
pub fn weekdays_between(from: NaiveDate, to: NaiveDate) -> u32 {
    if from > to {
        return 0;
    }

    let total_days = (to - from).num_days() + 1;
    let full_weeks = total_days / 7;
    let mut count = (full_weeks * 5) as u32;

    let mut cursor = from + chrono::Duration::days(full_weeks * 7);
    while cursor <= to {
        if is_weekday(cursor) {
            count += 1;
        }
        cursor = match cursor.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    count
}

/// Whether the daily bar for `date` belongs to `[start, end]`. An end at
/// midnight excludes its own day, whose session has not closed yet.
pub fn bar_in_window(date: NaiveDate, start: NaiveDateTime, end: NaiveDateTime) -> bool {
    if date < start.date() || date > end.date() {
        return false;
    }
    date < end.date() || end.time() != NaiveTime::MIN
}

/// Compact `YYYYMMDD` form used by several history endpoints.
pub fn compact_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
