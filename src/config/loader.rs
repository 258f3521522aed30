use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::{AppError, Context, Result};

use super::{
    validator, HttpProviderConfig, ManagerSettings, MarketSettings, ProviderSettings, Settings,
    StoreSettings,
};

/// Load settings from a JSON file. Missing keys fall back to the defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings JSON at {}", path.display()))?;
    parse_settings(&json)
        .map_err(|err| AppError::message(format!("{}: {err}", path.display())))
}

/// Load `path` when given, otherwise use the built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => load_settings(path),
        None => {
            let settings = Settings::default();
            validator::validate_settings(&settings)?;
            Ok(settings)
        }
    }
}

pub fn parse_settings(json: &str) -> Result<Settings> {
    let raw: RawSettings =
        serde_json::from_str(json).context("failed to parse settings JSON")?;
    let settings = raw.into_settings()?;
    validator::validate_settings(&settings)?;
    Ok(settings)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    provider: RawProviderSettings,
    manager: RawManagerSettings,
    market: RawMarketSettings,
    store: RawStoreSettings,
}

impl RawSettings {
    fn into_settings(self) -> Result<Settings> {
        Ok(Settings {
            provider: self.provider.into_provider_settings(),
            manager: self.manager.into_manager_settings()?,
            market: self.market.into_market_settings()?,
            store: self.store.into_store_settings(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawProviderSettings {
    poll_interval_ms: Option<u64>,
    max_window_days: Option<i64>,
    partition_buffer_days: Option<i64>,
    batch_max_symbols: Option<usize>,
    http: Option<HttpProviderConfig>,
}

impl RawProviderSettings {
    fn into_provider_settings(self) -> ProviderSettings {
        let defaults = ProviderSettings::default();
        ProviderSettings {
            poll_interval_ms: self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms),
            max_window_days: self.max_window_days.unwrap_or(defaults.max_window_days),
            partition_buffer_days: self
                .partition_buffer_days
                .unwrap_or(defaults.partition_buffer_days),
            batch_max_symbols: self
                .batch_max_symbols
                .unwrap_or(defaults.batch_max_symbols),
            http: self.http.unwrap_or(defaults.http),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawManagerSettings {
    earliest_allowed_date: Option<String>,
    auto_remove_invalid: Option<bool>,
    zero_volume_lookback: Option<usize>,
    zero_volume_run: Option<usize>,
    holiday_allowance_per_year: Option<u32>,
}

impl RawManagerSettings {
    fn into_manager_settings(self) -> Result<ManagerSettings> {
        let defaults = ManagerSettings::default();
        let earliest_allowed_date = match self.earliest_allowed_date {
            Some(text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").with_context(|| {
                format!("manager.earliest_allowed_date `{text}` is not YYYY-MM-DD")
            })?,
            None => defaults.earliest_allowed_date,
        };

        Ok(ManagerSettings {
            earliest_allowed_date,
            auto_remove_invalid: self
                .auto_remove_invalid
                .unwrap_or(defaults.auto_remove_invalid),
            zero_volume_lookback: self
                .zero_volume_lookback
                .unwrap_or(defaults.zero_volume_lookback),
            zero_volume_run: self.zero_volume_run.unwrap_or(defaults.zero_volume_run),
            holiday_allowance_per_year: self
                .holiday_allowance_per_year
                .unwrap_or(defaults.holiday_allowance_per_year),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMarketSettings {
    utc_offset_minutes: Option<i32>,
    /// `HH:MM` in exchange-local time.
    close: Option<String>,
}

impl RawMarketSettings {
    fn into_market_settings(self) -> Result<MarketSettings> {
        let defaults = MarketSettings::default();
        let (close_hour, close_minute) = match self.close {
            Some(text) => parse_close(&text)?,
            None => (defaults.close_hour, defaults.close_minute),
        };
        Ok(MarketSettings {
            utc_offset_minutes: self
                .utc_offset_minutes
                .unwrap_or(defaults.utc_offset_minutes),
            close_hour,
            close_minute,
        })
    }
}

fn parse_close(text: &str) -> Result<(u32, u32)> {
    let invalid = || AppError::message(format!("market.close `{text}` is not HH:MM"));
    let (hour, minute) = text.trim().split_once(':').ok_or_else(invalid)?;
    let hour = hour.parse::<u32>().map_err(|_| invalid())?;
    let minute = minute.parse::<u32>().map_err(|_| invalid())?;
    Ok((hour, minute))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStoreSettings {
    directory: Option<PathBuf>,
}

impl RawStoreSettings {
    fn into_store_settings(self) -> StoreSettings {
        StoreSettings {
            directory: self
                .directory
                .unwrap_or_else(|| StoreSettings::default().directory),
        }
    }
}
