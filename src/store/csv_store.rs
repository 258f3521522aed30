use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Context, Result};
use crate::security::{PriceBar, Security};

use super::{merge_record, SecurityStore};

const INDEX_FILE: &str = "securities.csv";
const BARS_DIR: &str = "bars";

#[derive(Debug, Serialize, Deserialize)]
struct SecurityRow {
    ticker: String,
    exchange: Option<String>,
    name: Option<String>,
    sector: Option<String>,
    industry: Option<String>,
    earliest_date: Option<NaiveDate>,
    last_update: Option<NaiveDate>,
    missing_data: bool,
    zero_volume: bool,
}

impl SecurityRow {
    fn from_security(security: &Security) -> Self {
        Self {
            ticker: security.ticker.clone(),
            exchange: security.exchange.clone(),
            name: security.name.clone(),
            sector: security.sector.clone(),
            industry: security.industry.clone(),
            earliest_date: security.earliest_date,
            last_update: security.last_update,
            missing_data: security.missing_data,
            zero_volume: security.zero_volume,
        }
    }

    fn into_security(self, bars: Vec<PriceBar>) -> Security {
        Security {
            ticker: self.ticker,
            exchange: self.exchange,
            name: self.name,
            sector: self.sector,
            industry: self.industry,
            earliest_date: self.earliest_date,
            last_update: self.last_update,
            bars,
            modified: false,
            missing_data: self.missing_data,
            zero_volume: self.zero_volume,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BarRow {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Directory-backed store: one index CSV plus one bar CSV per ticker.
pub struct CsvStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl CsvStore {
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BARS_DIR))
            .with_context(|| format!("failed to create store directory {}", root.display()))?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn bars_path(&self, ticker: &str) -> PathBuf {
        let file: String = ticker
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(BARS_DIR).join(format!("{file}.csv"))
    }

    fn load_index(&self) -> Result<BTreeMap<String, SecurityRow>> {
        let path = self.index_path();
        let mut index = BTreeMap::new();
        if !path.exists() {
            return Ok(index);
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        for row in reader.deserialize::<SecurityRow>() {
            let row = row.with_context(|| format!("failed to read {}", path.display()))?;
            index.insert(row.ticker.clone(), row);
        }
        Ok(index)
    }

    fn save_index(&self, index: &BTreeMap<String, SecurityRow>) -> Result<()> {
        let path = self.index_path();
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for row in index.values() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn load_bars(&self, ticker: &str) -> Result<Vec<PriceBar>> {
        let path = self.bars_path(ticker);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut bars = Vec::new();
        for row in reader.deserialize::<BarRow>() {
            let row = row.with_context(|| format!("failed to read {}", path.display()))?;
            bars.push(PriceBar::new(
                row.date, row.open, row.high, row.low, row.close, row.volume,
            ));
        }
        bars.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(bars)
    }

    fn save_bars(&self, ticker: &str, bars: &[PriceBar]) -> Result<()> {
        let path = self.bars_path(ticker);
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        for bar in bars {
            writer.serialize(BarRow {
                date: bar.date,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn load_security(&self, row: SecurityRow) -> Result<Security> {
        let bars = self.load_bars(&row.ticker)?;
        Ok(row.into_security(bars))
    }
}

impl SecurityStore for CsvStore {
    fn get_security(&self, ticker: &str, create: bool) -> Result<Option<Security>> {
        let _guard = self.guard();
        let key = Security::new(ticker).ticker;
        let mut index = self.load_index()?;
        if let Some(row) = index.remove(&key) {
            return self.load_security(row).map(Some);
        }
        if !create {
            return Ok(None);
        }

        let created = Security::new(key.clone());
        index.insert(key, SecurityRow::from_security(&created));
        self.save_index(&index)?;
        Ok(Some(created))
    }

    fn set_security(&self, security: &Security, overwrite: bool) -> Result<bool> {
        let _guard = self.guard();
        let mut index = self.load_index()?;
        let mut stored = match index.remove(&security.ticker) {
            Some(row) => self.load_security(row)?,
            None => Security::new(security.ticker.clone()),
        };
        let changed = merge_record(&mut stored, security, overwrite);
        index.insert(stored.ticker.clone(), SecurityRow::from_security(&stored));
        self.save_index(&index)?;
        if changed {
            self.save_bars(&stored.ticker, &stored.bars)?;
        }
        debug!(
            "stored {} ({} bars, changed: {changed})",
            stored.ticker,
            stored.bars.len()
        );
        Ok(changed)
    }

    fn remove_security(&self, ticker: &str) -> Result<bool> {
        let _guard = self.guard();
        let key = Security::new(ticker).ticker;
        let mut index = self.load_index()?;
        let removed = index.remove(&key).is_some();
        if removed {
            self.save_index(&index)?;
        }
        let bars = self.bars_path(&key);
        if bars.exists() {
            fs::remove_file(&bars)
                .with_context(|| format!("failed to remove {}", bars.display()))?;
        }
        Ok(removed)
    }

    fn all_securities(&self) -> Result<Vec<Security>> {
        let _guard = self.guard();
        self.load_index()?
            .into_values()
            .map(|row| self.load_security(row))
            .collect()
    }

    fn all_tickers(&self) -> Result<Vec<String>> {
        let _guard = self.guard();
        Ok(self.load_index()?.into_keys().collect())
    }
}
