//! Post-load checks on cached bar history.

use crate::clock::MarketSessionClock;
use crate::config::ManagerSettings;
use crate::security::Security;

#[derive(Debug, Clone, Copy)]
pub struct ValidationRules {
    pub zero_volume_lookback: usize,
    pub zero_volume_run: usize,
    pub holiday_allowance_per_year: u32,
}

impl From<&ManagerSettings> for ValidationRules {
    fn from(settings: &ManagerSettings) -> Self {
        Self {
            zero_volume_lookback: settings.zero_volume_lookback,
            zero_volume_run: settings.zero_volume_run,
            holiday_allowance_per_year: settings.holiday_allowance_per_year,
        }
    }
}

/// Fewer bars than trading days between the first and last bar, after a
/// per-year holiday allowance.
pub fn has_missing_data(
    security: &Security,
    rules: &ValidationRules,
    clock: &dyn MarketSessionClock,
) -> bool {
    let (Some(first), Some(last)) = (security.first_bar_date(), security.last_bar_date()) else {
        return false;
    };
    let expected = clock.trading_days_between(first, last);
    let span_days = (last - first).num_days().max(0) as f64;
    let years = (span_days / 365.25).ceil().max(1.0) as u32;
    let allowance = rules.holiday_allowance_per_year.saturating_mul(years);
    (security.bars.len() as u32) < expected.saturating_sub(allowance)
}

/// A run of zero-volume bars of at least `zero_volume_run` within the last
/// `zero_volume_lookback` bars.
pub fn has_zero_volume_run(security: &Security, rules: &ValidationRules) -> bool {
    if rules.zero_volume_run == 0 {
        return false;
    }
    let skip = security.bars.len().saturating_sub(rules.zero_volume_lookback);
    let mut run = 0;
    let mut longest = 0;
    for bar in security.bars.iter().skip(skip) {
        if bar.volume == 0.0 {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest >= rules.zero_volume_run
}

/// Recompute the derived flags. Returns whether either flag changed.
pub fn validate_security(
    security: &mut Security,
    rules: &ValidationRules,
    clock: &dyn MarketSessionClock,
) -> bool {
    let missing_data = has_missing_data(security, rules, clock);
    let zero_volume = has_zero_volume_run(security, rules);
    let changed = security.missing_data != missing_data || security.zero_volume != zero_volume;
    security.missing_data = missing_data;
    security.zero_volume = zero_volume;
    changed
}
