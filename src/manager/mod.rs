//! Security cache and the orchestration between provider and store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::NaiveDate;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::clock::MarketSessionClock;
use crate::config::ManagerSettings;
use crate::error::Result;
use crate::provider::{
    Provider, ProviderEvent, SectorsResponse, SessionStatus, SymbolsResponse,
};
use crate::request::{ErrorKind, Request, RequestId, RequestStatus};
use crate::security::{Sector, Security, SymbolListing};
use crate::store::SecurityStore;

pub mod status;
pub mod validation;

pub use status::{ErrorSource, LocalState};
pub use validation::ValidationRules;

const EVENT_CAPACITY: usize = 256;

/// Notifications for whoever displays or consumes the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    SecurityDataChanged(String),
    SecurityListLoaded(usize),
    SupportedSymbolsLoaded(usize),
    SectorsLoaded(usize),
    StatusChanged,
}

pub struct Manager {
    provider: Arc<dyn Provider>,
    store: Arc<dyn SecurityStore>,
    clock: Arc<dyn MarketSessionClock>,
    settings: ManagerSettings,
    rules: ValidationRules,
    cache: RwLock<Arc<Vec<Security>>>,
    reload: AtomicBool,
    local: Mutex<LocalState>,
    symbols: Mutex<Vec<SymbolListing>>,
    sectors: Mutex<Vec<Sector>>,
    events: broadcast::Sender<ManagerEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Manager {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn SecurityStore>,
        clock: Arc<dyn MarketSessionClock>,
        settings: ManagerSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let rules = ValidationRules::from(&settings);
        Self {
            provider,
            store,
            clock,
            settings,
            rules,
            cache: RwLock::new(Arc::new(Vec::new())),
            reload: AtomicBool::new(true),
            local: Mutex::new(LocalState::default()),
            symbols: Mutex::new(Vec::new()),
            sectors: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    fn publish(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_busy(&self, busy: bool) {
        lock(&self.local).busy = busy;
        self.publish(ManagerEvent::StatusChanged);
    }

    fn set_error(&self, source: ErrorSource, message: String) {
        error!("{source} error: {message}");
        lock(&self.local).error = Some((source, message));
        self.publish(ManagerEvent::StatusChanged);
    }

    pub fn clear_error(&self) {
        lock(&self.local).error = None;
        self.publish(ManagerEvent::StatusChanged);
    }

    pub fn connect(&self) -> Result<()> {
        self.clear_error();
        self.provider.connect()
    }

    pub fn disconnect(&self) {
        self.provider.disconnect();
    }

    pub fn needs_reload(&self) -> bool {
        self.reload.load(Ordering::SeqCst)
    }

    fn invalidate(&self) {
        self.reload.store(true, Ordering::SeqCst);
    }

    fn snapshot(&self) -> Arc<Vec<Security>> {
        match self.cache.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, securities: Vec<Security>) {
        let next = Arc::new(securities);
        match self.cache.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Current cache, reloaded from the store first if it was invalidated.
    pub fn securities(&self) -> Result<Arc<Vec<Security>>> {
        if self.reload.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.reload_securities() {
                self.invalidate();
                return Err(err);
            }
        }
        Ok(self.snapshot())
    }

    pub fn security(&self, ticker: &str) -> Result<Option<Security>> {
        let ticker = Security::new(ticker).ticker;
        Ok(self
            .securities()?
            .iter()
            .find(|security| security.ticker == ticker)
            .cloned())
    }

    /// Rebuild the cache from the store and run the validation scan. Readers
    /// keep seeing the previous snapshot until the swap.
    pub fn reload_securities(&self) -> Result<usize> {
        self.set_busy(true);
        let result = self.load_and_validate();
        self.set_busy(false);

        match result {
            Ok(securities) => {
                let count = securities.len();
                self.swap(securities);
                info!("loaded {count} securities");
                self.publish(ManagerEvent::SecurityListLoaded(count));
                Ok(count)
            }
            Err(err) => {
                self.set_error(ErrorSource::Database, err.to_string());
                Err(err)
            }
        }
    }

    fn load_and_validate(&self) -> Result<Vec<Security>> {
        let mut securities = self.store.all_securities()?;
        let mut flagged = 0;
        for security in &mut securities {
            if validation::validate_security(security, &self.rules, self.clock.as_ref()) {
                self.store.set_security(&security.header(), false)?;
                flagged += 1;
            }
        }
        if flagged > 0 {
            debug!("validation changed flags on {flagged} securities");
        }
        Ok(securities)
    }

    pub fn add_security(&self, ticker: &str) -> Result<Security> {
        let security = self
            .store
            .get_security(ticker, true)?
            .unwrap_or_else(|| Security::new(ticker));
        self.invalidate();
        Ok(security)
    }

    pub fn remove_security(&self, ticker: &str) -> Result<bool> {
        let removed = self.store.remove_security(ticker)?;
        self.invalidate();
        Ok(removed)
    }

    /// Request for the bars `security` is missing up to `as_of`, or `None`
    /// when there is nothing left to fetch.
    pub fn price_request_for(&self, security: &Security, as_of: NaiveDate) -> Result<Option<Request>> {
        let mut start = security
            .last_bar_date()
            .unwrap_or(self.settings.earliest_allowed_date)
            .max(self.settings.earliest_allowed_date);
        if let Some(earliest) = security.earliest_date {
            start = start.max(earliest);
        }
        if start > as_of {
            return Ok(None);
        }
        Request::price_data(security.header(), start, as_of, self.clock.as_ref()).map(Some)
    }

    pub fn update_security_price_data(
        &self,
        security: &Security,
        as_of: NaiveDate,
    ) -> Result<Option<RequestId>> {
        match self.price_request_for(security, as_of)? {
            Some(request) => {
                debug!("submitting {request}");
                self.provider.submit_request(request).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Batch update. Up-to-date securities are skipped unless `force_all`,
    /// which refetches everything from the earliest allowed date.
    pub fn update_security_price_data_batch(
        &self,
        securities: &[Security],
        as_of: NaiveDate,
        force_all: bool,
    ) -> Result<Vec<RequestId>> {
        let mut requests = Vec::new();
        for security in securities {
            if force_all {
                let mut fresh = security.header();
                fresh.earliest_date = None;
                if let Some(request) = self.price_request_for(&fresh, as_of)? {
                    requests.push(request);
                }
                continue;
            }
            if security.last_bar_date().is_some_and(|last| last >= as_of) {
                debug!("{} is up to date", security.ticker);
                continue;
            }
            if let Some(request) = self.price_request_for(security, as_of)? {
                requests.push(request);
            }
        }

        if requests.is_empty() {
            return Ok(Vec::new());
        }
        info!("submitting {} price requests", requests.len());
        self.provider.submit_batch_request(requests)
    }

    pub fn request_contract_data(&self, security: &Security) -> Result<RequestId> {
        let request = Request::contract_data(security.header(), self.clock.as_ref())?;
        self.provider.submit_request(request)
    }

    pub fn request_company_info(&self, security: &Security) -> Result<RequestId> {
        let request = Request::company_info(security.header(), self.clock.as_ref())?;
        self.provider.submit_request(request)
    }

    pub fn request_provider_supported_symbols(&self) {
        self.provider.request_supported_symbols();
    }

    pub fn request_provider_sectors(&self) {
        self.provider.request_sectors();
    }

    pub fn supported_symbols(&self) -> Vec<SymbolListing> {
        lock(&self.symbols).clone()
    }

    pub fn sectors(&self) -> Vec<Sector> {
        lock(&self.sectors).clone()
    }

    /// Consume provider events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<ProviderEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_provider_event(event);
        }
        debug!("provider event channel closed");
    }

    pub fn handle_provider_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::RequestResponse(request) => self.handle_response(request),
            ProviderEvent::SupportedSymbolsResponse(response) => self.handle_symbols(response),
            ProviderEvent::SectorsResponse(response) => self.handle_sectors(response),
            ProviderEvent::SessionPropertyChanged(name) => {
                debug!("{} session property changed: {name}", self.provider.name());
                self.publish(ManagerEvent::StatusChanged);
            }
        }
    }

    pub fn handle_response(&self, request: Request) {
        if request.has_error() {
            self.apply_error_policy(&request);
            return;
        }
        match request.status() {
            RequestStatus::CompleteResponse => self.persist(&request),
            RequestStatus::Cancelled => {
                info!("{request} cancelled: {}", request.error_message());
            }
            other => {
                error!("invalid state: response for {request} arrived with status {other:?}");
            }
        }
    }

    fn apply_error_policy(&self, request: &Request) {
        let ticker = request.ticker();
        match request.error_kind() {
            ErrorKind::InvalidSecurity if self.settings.auto_remove_invalid => {
                warn!(
                    "{ticker} rejected by {}: {}; removing it",
                    self.provider.name(),
                    request.error_message()
                );
                match self.store.remove_security(ticker) {
                    Ok(_) => self.invalidate(),
                    Err(err) => self.set_error(
                        ErrorSource::Database,
                        format!("failed to remove {ticker}: {err}"),
                    ),
                }
            }
            ErrorKind::InvalidSecurity => {
                warn!("{ticker} rejected by {}: {}", self.provider.name(), request.error_message());
            }
            ErrorKind::ConnectionError => {
                warn!("{request} hit a connection error: {}", request.error_message());
            }
            kind => {
                error!("{request} failed with {kind}: {}", request.error_message());
            }
        }
    }

    fn persist(&self, request: &Request) {
        let fetched = request.security();
        let ticker = fetched.ticker.clone();
        let cached = self.snapshot();
        let position = cached.iter().position(|security| security.ticker == ticker);

        let base = match position {
            Some(idx) => Some(cached[idx].clone()),
            None => match self.store.get_security(&ticker, true) {
                Ok(found) => found,
                Err(err) => {
                    self.set_error(
                        ErrorSource::Database,
                        format!("failed to load {ticker}: {err}"),
                    );
                    return;
                }
            },
        };
        let mut merged = base.unwrap_or_else(|| Security::new(ticker.clone()));
        let changed_bars = merged.merge_from(fetched);

        if let Err(err) = self.store.set_security(&merged, false) {
            self.set_error(
                ErrorSource::Database,
                format!("failed to store {ticker}: {err}"),
            );
            return;
        }
        merged.clear_update_flags();
        merged.modified = false;
        debug!("{ticker}: {changed_bars} bars changed from {request}");

        match position {
            Some(idx) => {
                let mut next = cached.as_ref().clone();
                next[idx] = merged;
                self.swap(next);
            }
            None => self.invalidate(),
        }
        self.publish(ManagerEvent::SecurityDataChanged(ticker));
    }

    fn handle_symbols(&self, response: SymbolsResponse) {
        if let Some(error) = &response.error {
            warn!("{} symbol listing: {error}", response.provider);
        }
        let count = response.symbols.len();
        if count > 0 || response.error.is_none() {
            *lock(&self.symbols) = response.symbols;
            self.publish(ManagerEvent::SupportedSymbolsLoaded(count));
        }
    }

    fn handle_sectors(&self, response: SectorsResponse) {
        if let Some(error) = &response.error {
            warn!("{} sectors: {error}", response.provider);
            return;
        }
        let count = response.sectors.len();
        *lock(&self.sectors) = response.sectors;
        self.publish(ManagerEvent::SectorsLoaded(count));
    }

    pub fn local_state(&self) -> LocalState {
        lock(&self.local).clone()
    }

    pub fn status(&self) -> SessionStatus {
        status::composite_status(&self.local_state(), &self.provider.session())
    }

    pub fn status_message(&self) -> String {
        status::status_message(&self.local_state(), &self.provider.session())
    }

    /// Label/value pairs for a status panel.
    pub fn display_fields(&self) -> Vec<(&'static str, String)> {
        let session = self.provider.session();
        let local = self.local_state();
        vec![
            ("Provider", self.provider.name().to_string()),
            ("Status", status::composite_status(&local, &session).to_string()),
            ("Message", status::status_message(&local, &session)),
            ("Detail", session.secondary_message.clone()),
            ("Pending requests", self.provider.pending_count().to_string()),
            ("Securities", self.snapshot().len().to_string()),
        ]
    }
}
