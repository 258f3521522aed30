use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Result;
use crate::security::Security;

use super::{merge_record, SecurityStore};

/// Store kept entirely in memory, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    securities: RwLock<BTreeMap<String, Security>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_securities<I: IntoIterator<Item = Security>>(securities: I) -> Self {
        let store = Self::new();
        {
            let mut map = store.write();
            for security in securities {
                map.insert(security.ticker.clone(), security);
            }
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Security>> {
        match self.securities.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Security>> {
        match self.securities.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SecurityStore for MemoryStore {
    fn get_security(&self, ticker: &str, create: bool) -> Result<Option<Security>> {
        let key = Security::new(ticker).ticker;
        if let Some(found) = self.read().get(&key) {
            return Ok(Some(found.clone()));
        }
        if !create {
            return Ok(None);
        }
        let created = Security::new(key.clone());
        self.write().insert(key, created.clone());
        Ok(Some(created))
    }

    fn set_security(&self, security: &Security, overwrite: bool) -> Result<bool> {
        let mut map = self.write();
        let stored = map
            .entry(security.ticker.clone())
            .or_insert_with(|| Security::new(security.ticker.clone()));
        Ok(merge_record(stored, security, overwrite))
    }

    fn remove_security(&self, ticker: &str) -> Result<bool> {
        let key = Security::new(ticker).ticker;
        Ok(self.write().remove(&key).is_some())
    }

    fn all_securities(&self) -> Result<Vec<Security>> {
        Ok(self.read().values().cloned().collect())
    }

    fn all_tickers(&self) -> Result<Vec<String>> {
        Ok(self.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_with_create_inserts_empty_record() {
        let store = MemoryStore::new();
        assert!(store.get_security("abc", false).unwrap().is_none());

        let created = store.get_security("abc", true).unwrap().unwrap();
        assert_eq!(created.ticker, "ABC");
        assert_eq!(store.all_tickers().unwrap(), vec!["ABC"]);
    }

    #[test]
    fn remove_reports_presence() {
        let store = MemoryStore::with_securities([Security::new("ABC")]);
        assert!(store.remove_security("abc").unwrap());
        assert!(!store.remove_security("abc").unwrap());
        assert!(store.all_securities().unwrap().is_empty());
    }
}
