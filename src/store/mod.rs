//! Security and price-bar persistence.

use crate::error::Result;
use crate::security::Security;

pub mod csv_store;
pub mod memory;

pub use csv_store::CsvStore;
pub use memory::MemoryStore;

pub trait SecurityStore: Send + Sync {
    /// Fetch a security with its bars. With `create`, an unknown ticker is
    /// inserted as an empty record and returned.
    fn get_security(&self, ticker: &str, create: bool) -> Result<Option<Security>>;

    /// Persist a security. `overwrite` replaces the stored record outright;
    /// otherwise metadata is merged and only bars flagged `to_update` are
    /// written. Returns whether anything was stored.
    fn set_security(&self, security: &Security, overwrite: bool) -> Result<bool>;

    fn remove_security(&self, ticker: &str) -> Result<bool>;

    fn all_securities(&self) -> Result<Vec<Security>>;

    fn all_tickers(&self) -> Result<Vec<String>>;
}

/// Fold `incoming` into `stored` following the `set_security` rules.
pub(crate) fn merge_record(stored: &mut Security, incoming: &Security, overwrite: bool) -> bool {
    if overwrite {
        let mut replacement = incoming.clone();
        replacement.clear_update_flags();
        replacement.modified = false;
        let changed = *stored != replacement;
        *stored = replacement;
        return changed;
    }

    let before = stored.clone();
    stored.exchange = incoming.exchange.clone().or(stored.exchange.take());
    stored.name = incoming.name.clone().or(stored.name.take());
    stored.sector = incoming.sector.clone().or(stored.sector.take());
    stored.industry = incoming.industry.clone().or(stored.industry.take());
    stored.earliest_date = incoming.earliest_date.or(stored.earliest_date);
    stored.missing_data = incoming.missing_data;
    stored.zero_volume = incoming.zero_volume;

    stored.upsert_bars(incoming.bars.iter().filter(|bar| bar.to_update).cloned());
    stored.clear_update_flags();
    stored.modified = false;
    stored.last_update = stored.last_bar_date().or(incoming.last_update);

    *stored != before
}
