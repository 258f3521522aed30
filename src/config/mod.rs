//! Runtime settings. Files are parsed into raw shapes by [`loader`] and
//! checked by [`validator`] before anything else sees them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::clock::ExchangeClock;
use crate::error::{AppError, Result};
use crate::provider::EngineSettings;
use crate::request::PartitionPolicy;

pub mod loader;
pub mod validator;

pub use loader::load_settings;

const STOOQ_HISTORY_URL: &str =
    "https://stooq.com/q/d/l/?s={symbol_lower}.jp&d1={start_compact}&d2={end_compact}&i=d";
const JPX_LISTING_URL: &str =
    "https://www.jpx.co.jp/english/markets/statistics-equities/misc/tvdivq0000001vg2-att/jyoujyou(updated)_e.xlsx";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub provider: ProviderSettings,
    pub manager: ManagerSettings,
    pub market: MarketSettings,
    pub store: StoreSettings,
}

impl Settings {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            poll_interval: Duration::from_millis(self.provider.poll_interval_ms),
            partition: PartitionPolicy {
                max_window_days: self.provider.max_window_days,
                buffer_days: self.provider.partition_buffer_days,
            },
            batch_max_symbols: self.provider.batch_max_symbols,
        }
    }

    pub fn clock(&self) -> Result<ExchangeClock> {
        ExchangeClock::new(
            self.market.utc_offset_minutes,
            self.market.close_hour,
            self.market.close_minute,
        )
        .ok_or_else(|| {
            AppError::message(format!(
                "invalid market hours: offset {} min, close {:02}:{:02}",
                self.market.utc_offset_minutes, self.market.close_hour, self.market.close_minute
            ))
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub poll_interval_ms: u64,
    pub max_window_days: i64,
    pub partition_buffer_days: i64,
    pub batch_max_symbols: usize,
    pub http: HttpProviderConfig,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_window_days: 365,
            partition_buffer_days: 14,
            batch_max_symbols: 50,
            http: HttpProviderConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Oldest bar date the cache will ever ask for.
    pub earliest_allowed_date: NaiveDate,
    /// Drop securities from the store when a provider reports them invalid.
    pub auto_remove_invalid: bool,
    pub zero_volume_lookback: usize,
    pub zero_volume_run: usize,
    pub holiday_allowance_per_year: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            earliest_allowed_date: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN),
            auto_remove_invalid: false,
            zero_volume_lookback: 20,
            zero_volume_run: 5,
            holiday_allowance_per_year: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketSettings {
    pub utc_offset_minutes: i32,
    pub close_hour: u32,
    pub close_minute: u32,
}

impl Default for MarketSettings {
    /// Tokyo: 15:30 at UTC+9.
    fn default() -> Self {
        Self {
            utc_offset_minutes: 540,
            close_hour: 15,
            close_minute: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub directory: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
        }
    }
}

/// Declarative description of an HTTP data provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProviderConfig {
    pub name: String,
    /// Header values may reference `${ENV_VAR}`.
    pub headers: HashMap<String, String>,
    pub history: HistoryEndpoint,
    pub batch_history: Option<HistoryEndpoint>,
    pub symbols_separator: String,
    pub company: Option<CompanyEndpoint>,
    pub contract: Option<ContractEndpoint>,
    pub listings: Vec<ListingSource>,
    pub sectors: Option<SectorsEndpoint>,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            name: "stooq".to_string(),
            headers: HashMap::from([(
                "User-Agent".to_string(),
                "Mozilla/5.0 (X11; Linux x86_64) refdata-sync".to_string(),
            )]),
            history: HistoryEndpoint {
                url_template: STOOQ_HISTORY_URL.to_string(),
                format: HistoryFormat::Csv(CsvHistoryColumns::default()),
                no_data_marker: Some("No data".to_string()),
            },
            batch_history: None,
            symbols_separator: ",".to_string(),
            company: None,
            contract: None,
            listings: vec![ListingSource {
                url: JPX_LISTING_URL.to_string(),
                exchange: Some("TSE".to_string()),
                format: ListingFormat::Xlsx {
                    sheet: "Sheet1".to_string(),
                    ticker_column: 1,
                    name_column: 2,
                    skip_rows: 1,
                },
            }],
            sectors: None,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEndpoint {
    pub url_template: String,
    pub format: HistoryFormat,
    /// Body text meaning the provider does not know the symbol.
    #[serde(default)]
    pub no_data_marker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryFormat {
    Csv(CsvHistoryColumns),
    Json(JsonHistoryFields),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvHistoryColumns {
    pub has_headers: bool,
    pub delimiter: char,
    pub date_format: String,
    pub date: usize,
    pub open: usize,
    pub high: usize,
    pub low: usize,
    pub close: usize,
    pub volume: Option<usize>,
    /// Needed only when one response carries several symbols.
    pub ticker: Option<usize>,
}

impl Default for CsvHistoryColumns {
    fn default() -> Self {
        Self {
            has_headers: true,
            delimiter: ',',
            date_format: "%Y-%m-%d".to_string(),
            date: 0,
            open: 1,
            high: 2,
            low: 3,
            close: 4,
            volume: Some(5),
            ticker: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonHistoryFields {
    /// Keys leading from the document root to the array of rows.
    pub rows_path: Vec<String>,
    pub date_format: String,
    pub date: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: Option<String>,
    pub ticker: Option<String>,
}

impl Default for JsonHistoryFields {
    fn default() -> Self {
        Self {
            rows_path: Vec::new(),
            date_format: "%Y-%m-%d".to_string(),
            date: "date".to_string(),
            open: "open".to_string(),
            high: "high".to_string(),
            low: "low".to_string(),
            close: "close".to_string(),
            volume: Some("volume".to_string()),
            ticker: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanyEndpoint {
    pub url_template: String,
    pub root_path: Vec<String>,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractEndpoint {
    pub url_template: String,
    pub root_path: Vec<String>,
    pub exchange: Option<String>,
    pub primary_exchange: Option<String>,
    pub currency: Option<String>,
    pub long_name: Option<String>,
    pub contract_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSource {
    pub url: String,
    /// Exchange recorded on every listed symbol.
    #[serde(default)]
    pub exchange: Option<String>,
    pub format: ListingFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListingFormat {
    Csv {
        ticker_column: usize,
        name_column: usize,
        #[serde(default)]
        exchange_column: Option<usize>,
        #[serde(default = "default_true")]
        has_headers: bool,
    },
    Xlsx {
        sheet: String,
        ticker_column: usize,
        name_column: usize,
        #[serde(default)]
        skip_rows: usize,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SectorsEndpoint {
    pub url: String,
    pub rows_path: Vec<String>,
    pub name: String,
    pub industries: Option<String>,
}

fn default_true() -> bool {
    true
}
