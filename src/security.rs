use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One daily OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Set on bars that still have to be written to the store.
    #[serde(default)]
    pub to_update: bool,
}

impl PriceBar {
    pub fn new(date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            date,
            open,
            high,
            low,
            close,
            volume,
            to_update: false,
        }
    }

    fn same_values(&self, other: &PriceBar) -> bool {
        self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyInfo {
    pub name: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractDetails {
    pub exchange: Option<String>,
    pub primary_exchange: Option<String>,
    pub currency: Option<String>,
    pub long_name: Option<String>,
    pub contract_id: Option<i64>,
}

/// A row from a provider's supported-symbol listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolListing {
    pub ticker: String,
    pub name: String,
    pub exchange: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sector {
    pub name: String,
    #[serde(default)]
    pub industries: Vec<String>,
}

/// Cached view of one tradable security.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub ticker: String,
    pub exchange: Option<String>,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub earliest_date: Option<NaiveDate>,
    pub last_update: Option<NaiveDate>,
    #[serde(default)]
    pub bars: Vec<PriceBar>,
    #[serde(default)]
    pub modified: bool,
    #[serde(default)]
    pub missing_data: bool,
    #[serde(default)]
    pub zero_volume: bool,
}

impl Security {
    pub fn new<T: Into<String>>(ticker: T) -> Self {
        Self {
            ticker: ticker.into().trim().to_uppercase(),
            ..Self::default()
        }
    }

    /// Copy of this security without its bar history.
    pub fn header(&self) -> Self {
        Self {
            bars: Vec::new(),
            ..self.clone()
        }
    }

    pub fn first_bar_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|bar| bar.date)
    }

    pub fn last_bar_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|bar| bar.date)
    }

    /// Insert or replace bars by date, flagging every changed bar for update.
    /// Returns the number of bars that changed.
    pub fn upsert_bars<I>(&mut self, incoming: I) -> usize
    where
        I: IntoIterator<Item = PriceBar>,
    {
        let mut changed = 0;
        for mut bar in incoming {
            bar.to_update = true;
            match self.bars.binary_search_by(|existing| existing.date.cmp(&bar.date)) {
                Ok(idx) => {
                    if !self.bars[idx].same_values(&bar) {
                        self.bars[idx] = bar;
                        changed += 1;
                    }
                }
                Err(idx) => {
                    self.bars.insert(idx, bar);
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            self.last_update = self.last_bar_date();
            self.modified = true;
        }
        changed
    }

    pub fn clear_update_flags(&mut self) {
        for bar in &mut self.bars {
            bar.to_update = false;
        }
    }

    pub fn apply_company_info(&mut self, info: &CompanyInfo) {
        set_if_some(&mut self.name, &info.name, &mut self.modified);
        set_if_some(&mut self.sector, &info.sector, &mut self.modified);
        set_if_some(&mut self.industry, &info.industry, &mut self.modified);
        set_if_some(&mut self.exchange, &info.exchange, &mut self.modified);
    }

    pub fn apply_contract_details(&mut self, details: &ContractDetails) {
        let exchange = details
            .primary_exchange
            .clone()
            .or_else(|| details.exchange.clone());
        set_if_some(&mut self.exchange, &exchange, &mut self.modified);
        set_if_some(&mut self.name, &details.long_name, &mut self.modified);
    }

    /// Fold a provider-filled copy of this security into the cached one.
    pub fn merge_from(&mut self, fetched: &Security) -> usize {
        set_if_some(&mut self.exchange, &fetched.exchange, &mut self.modified);
        set_if_some(&mut self.name, &fetched.name, &mut self.modified);
        set_if_some(&mut self.sector, &fetched.sector, &mut self.modified);
        set_if_some(&mut self.industry, &fetched.industry, &mut self.modified);
        if fetched.earliest_date.is_some() && self.earliest_date != fetched.earliest_date {
            self.earliest_date = fetched.earliest_date;
            self.modified = true;
        }
        self.upsert_bars(fetched.bars.iter().cloned())
    }
}

fn set_if_some(target: &mut Option<String>, source: &Option<String>, modified: &mut bool) {
    if let Some(value) = source {
        if value.is_empty() || target.as_deref() == Some(value.as_str()) {
            return;
        }
        *target = Some(value.clone());
        *modified = true;
    }
}
