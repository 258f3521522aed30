//! Session-oriented backend. The wire protocol lives behind [`SessionClient`];
//! this module maps resolution steps onto client calls and client callbacks
//! onto step outcomes.

use std::fmt;

use chrono::{Months, NaiveDate, NaiveDateTime};
use log::{debug, warn};

use crate::error::Result;
use crate::request::{ErrorKind, Request, RequestId, RequestKind, ResolutionStep};
use crate::security::{CompanyInfo, ContractDetails, PriceBar};

use super::{OutcomeSink, StepCall, StepPayload, StepTransport};

/// Identifies a security on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractRef {
    pub symbol: String,
    pub exchange: String,
    pub primary_exchange: Option<String>,
    pub currency: String,
    pub security_type: String,
}

/// Look-back length for a historical bar request ending at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDuration {
    Days(u32),
    Years(u32),
}

impl HistoryDuration {
    /// Smallest duration ending at `end` that reaches back to `start`.
    /// Spans longer than `max_days` are expressed in whole years.
    pub fn covering(start: NaiveDate, end: NaiveDate, max_days: i64) -> Self {
        let span = (end - start).num_days().max(0);
        if span < max_days {
            return HistoryDuration::Days(span as u32 + 1);
        }

        let mut years = 1u32;
        while end
            .checked_sub_months(Months::new(12 * years))
            .is_some_and(|from| from > start)
        {
            years += 1;
        }
        HistoryDuration::Years(years)
    }
}

impl fmt::Display for HistoryDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryDuration::Days(days) => write!(f, "{days} D"),
            HistoryDuration::Years(years) => write!(f, "{years} Y"),
        }
    }
}

/// Map a session error code onto the request error taxonomy.
pub fn map_error_code(code: i32) -> ErrorKind {
    match code {
        200 => ErrorKind::InvalidSecurity,
        162 | 321 | 322 => ErrorKind::InvalidRequest,
        502 | 504 | 1100 | 1300 | 2110 => ErrorKind::ConnectionError,
        _ => ErrorKind::SystemError,
    }
}

/// Callback handle given to the client for one in-flight step.
#[derive(Debug, Clone)]
pub struct SessionCallbacks {
    id: RequestId,
    step: ResolutionStep,
    sink: OutcomeSink,
}

impl SessionCallbacks {
    pub fn new(id: RequestId, step: ResolutionStep, sink: OutcomeSink) -> Self {
        Self { id, step, sink }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn contract_details(&self, details: ContractDetails) {
        match self.step {
            ResolutionStep::ResolveExchange => {
                let exchange = details
                    .primary_exchange
                    .filter(|value| !value.is_empty())
                    .or(details.exchange.filter(|value| !value.is_empty()));
                match exchange {
                    Some(exchange) => self.sink.complete(self.id, StepPayload::Exchange(exchange)),
                    None => self.sink.fail(
                        self.id,
                        ErrorKind::InvalidSecurity,
                        "contract details carry no exchange",
                    ),
                }
            }
            ResolutionStep::FetchContractDetails => self
                .sink
                .complete(self.id, StepPayload::ContractDetails(details)),
            other => self.unexpected("contract details", other),
        }
    }

    pub fn head_timestamp(&self, earliest: NaiveDate) {
        match self.step {
            ResolutionStep::ResolveEarliestDate => self
                .sink
                .complete(self.id, StepPayload::EarliestDate(earliest)),
            other => self.unexpected("head timestamp", other),
        }
    }

    pub fn historical_bar(&self, bar: PriceBar) {
        match self.step {
            ResolutionStep::FetchHistoricalBars => {
                self.sink.partial(self.id, StepPayload::Bars(vec![bar]))
            }
            other => self.unexpected("historical bar", other),
        }
    }

    pub fn historical_end(&self) {
        match self.step {
            ResolutionStep::FetchHistoricalBars => self.sink.complete(self.id, StepPayload::None),
            other => self.unexpected("historical end", other),
        }
    }

    pub fn fundamentals(&self, info: CompanyInfo) {
        match self.step {
            ResolutionStep::FetchCompanyInfo => {
                self.sink.complete(self.id, StepPayload::CompanyInfo(info))
            }
            other => self.unexpected("fundamentals", other),
        }
    }

    pub fn error(&self, code: i32, message: &str) {
        let kind = map_error_code(code);
        debug!("request #{} error {code}: {message}", self.id);
        self.sink
            .fail(self.id, kind, format!("provider error {code}: {message}"));
    }

    fn unexpected(&self, what: &str, step: ResolutionStep) {
        warn!("request #{}: {what} received while running {step:?}", self.id);
        self.sink.fail(
            self.id,
            ErrorKind::SystemError,
            format!("unexpected {what} for step {step:?}"),
        );
    }
}

/// Connection to a session-based data provider.
pub trait SessionClient: Send + Sync + 'static {
    fn connect(&self) -> Result<()>;
    fn disconnect(&self);
    fn request_contract_details(&self, contract: ContractRef, callbacks: SessionCallbacks);
    fn request_head_timestamp(&self, contract: ContractRef, callbacks: SessionCallbacks);
    fn request_historical_bars(
        &self,
        contract: ContractRef,
        end: NaiveDateTime,
        duration: HistoryDuration,
        callbacks: SessionCallbacks,
    );
    fn request_fundamentals(&self, contract: ContractRef, callbacks: SessionCallbacks);
}

#[derive(Debug, Clone)]
pub struct SessionTransportSettings {
    pub name: String,
    /// Routing exchange used until the primary exchange is known.
    pub routing_exchange: String,
    pub currency: String,
    pub max_window_days: i64,
}

impl Default for SessionTransportSettings {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            routing_exchange: "SMART".to_string(),
            currency: "USD".to_string(),
            max_window_days: 365,
        }
    }
}

pub struct SessionTransport<C: SessionClient> {
    client: C,
    settings: SessionTransportSettings,
}

impl<C: SessionClient> SessionTransport<C> {
    pub fn new(client: C, settings: SessionTransportSettings) -> Self {
        Self { client, settings }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn contract_for(&self, call: &StepCall) -> ContractRef {
        ContractRef {
            symbol: call.ticker().to_string(),
            exchange: self.settings.routing_exchange.clone(),
            primary_exchange: call.security.exchange.clone(),
            currency: self.settings.currency.clone(),
            security_type: "STK".to_string(),
        }
    }
}

impl<C: SessionClient> StepTransport for SessionTransport<C> {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn connect(&self) -> Result<()> {
        self.client.connect()
    }

    fn disconnect(&self) {
        self.client.disconnect();
    }

    fn plan(&self, request: &Request) -> Vec<ResolutionStep> {
        let security = request.security();
        let mut steps = Vec::new();
        if request.kind() != RequestKind::ContractData && security.exchange.is_none() {
            steps.push(ResolutionStep::ResolveExchange);
        }
        match request.kind() {
            RequestKind::PriceData | RequestKind::VolumeData => {
                if security.earliest_date.is_none() {
                    steps.push(ResolutionStep::ResolveEarliestDate);
                }
                steps.push(ResolutionStep::FetchHistoricalBars);
            }
            RequestKind::ContractData => steps.push(ResolutionStep::FetchContractDetails),
            RequestKind::CompanyInfo => steps.push(ResolutionStep::FetchCompanyInfo),
        }
        steps
    }

    fn supports(&self, _step: ResolutionStep) -> bool {
        true
    }

    fn execute(&self, call: StepCall, sink: OutcomeSink) {
        let contract = self.contract_for(&call);
        let callbacks = SessionCallbacks::new(call.id, call.step, sink);
        match call.step {
            ResolutionStep::ResolveExchange | ResolutionStep::FetchContractDetails => {
                self.client.request_contract_details(contract, callbacks)
            }
            ResolutionStep::ResolveEarliestDate => {
                self.client.request_head_timestamp(contract, callbacks)
            }
            ResolutionStep::FetchHistoricalBars => {
                let duration = HistoryDuration::covering(
                    call.start.date(),
                    call.end.date(),
                    self.settings.max_window_days,
                );
                self.client
                    .request_historical_bars(contract, call.end, duration, callbacks)
            }
            ResolutionStep::FetchCompanyInfo => {
                self.client.request_fundamentals(contract, callbacks)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::provider::{StepOutcome, StepResult};
    use crate::security::Security;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        ContractDetails(String),
        HeadTimestamp(String),
        Bars(String, HistoryDuration),
        Fundamentals(String),
    }

    #[derive(Default)]
    struct FakeClient {
        calls: Mutex<Vec<Call>>,
        last: Mutex<Option<SessionCallbacks>>,
    }

    impl FakeClient {
        fn record(&self, call: Call, callbacks: SessionCallbacks) {
            self.calls.lock().unwrap().push(call);
            *self.last.lock().unwrap() = Some(callbacks);
        }

        fn last(&self) -> SessionCallbacks {
            self.last.lock().unwrap().clone().unwrap()
        }
    }

    impl SessionClient for FakeClient {
        fn connect(&self) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self) {}

        fn request_contract_details(&self, contract: ContractRef, callbacks: SessionCallbacks) {
            self.record(Call::ContractDetails(contract.symbol), callbacks);
        }

        fn request_head_timestamp(&self, contract: ContractRef, callbacks: SessionCallbacks) {
            self.record(Call::HeadTimestamp(contract.symbol), callbacks);
        }

        fn request_historical_bars(
            &self,
            contract: ContractRef,
            _end: NaiveDateTime,
            duration: HistoryDuration,
            callbacks: SessionCallbacks,
        ) {
            self.record(Call::Bars(contract.symbol, duration), callbacks);
        }

        fn request_fundamentals(&self, contract: ContractRef, callbacks: SessionCallbacks) {
            self.record(Call::Fundamentals(contract.symbol), callbacks);
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn transport() -> SessionTransport<FakeClient> {
        SessionTransport::new(FakeClient::default(), SessionTransportSettings::default())
    }

    fn price(security: Security) -> Request {
        let clock = FixedClock::at(date(2024, 6, 3), 18, 0);
        Request::price_data(security, date(2024, 1, 2), date(2024, 5, 31), &clock).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<StepOutcome>) -> Vec<StepOutcome> {
        let mut out = Vec::new();
        while let Ok(outcome) = rx.try_recv() {
            out.push(outcome);
        }
        out
    }

    #[test]
    fn error_codes_map_to_kinds() {
        assert_eq!(map_error_code(200), ErrorKind::InvalidSecurity);
        assert_eq!(map_error_code(162), ErrorKind::InvalidRequest);
        assert_eq!(map_error_code(321), ErrorKind::InvalidRequest);
        assert_eq!(map_error_code(1100), ErrorKind::ConnectionError);
        assert_eq!(map_error_code(504), ErrorKind::ConnectionError);
        assert_eq!(map_error_code(10197), ErrorKind::SystemError);
    }

    #[test]
    fn plan_skips_known_metadata() {
        let transport = transport();
        assert_eq!(
            transport.plan(&price(Security::new("IBM"))),
            vec![
                ResolutionStep::ResolveExchange,
                ResolutionStep::ResolveEarliestDate,
                ResolutionStep::FetchHistoricalBars
            ]
        );

        let mut known = Security::new("IBM");
        known.exchange = Some("NYSE".to_string());
        known.earliest_date = Some(date(1962, 1, 2));
        assert_eq!(
            transport.plan(&price(known)),
            vec![ResolutionStep::FetchHistoricalBars]
        );
    }

    #[test]
    fn durations_cover_the_range() {
        assert_eq!(
            HistoryDuration::covering(date(2024, 1, 2), date(2024, 5, 31), 365),
            HistoryDuration::Days(151)
        );
        assert_eq!(
            HistoryDuration::covering(date(2015, 6, 15), date(2020, 6, 15), 365),
            HistoryDuration::Years(5)
        );
        assert_eq!(
            HistoryDuration::covering(date(2015, 6, 14), date(2020, 6, 15), 365),
            HistoryDuration::Years(6)
        );
        assert_eq!(HistoryDuration::Years(5).to_string(), "5 Y");
        assert_eq!(HistoryDuration::Days(30).to_string(), "30 D");
    }

    #[test]
    fn bars_stream_as_partials_then_complete() {
        let transport = transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = price(Security::new("IBM"));
        transport.execute(
            StepCall::new(7, ResolutionStep::FetchHistoricalBars, &request),
            OutcomeSink::new(tx),
        );

        assert_eq!(
            transport.client().calls.lock().unwrap()[0],
            Call::Bars("IBM".to_string(), HistoryDuration::Days(151))
        );
        let callbacks = transport.client().last();
        callbacks.historical_bar(PriceBar::new(date(2024, 1, 2), 1.0, 1.0, 1.0, 1.0, 5.0));
        callbacks.historical_bar(PriceBar::new(date(2024, 1, 3), 1.0, 1.0, 1.0, 1.0, 5.0));
        callbacks.historical_end();

        let outcomes = drain(&mut rx);
        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0].result, StepResult::Partial(StepPayload::Bars(_))));
        assert_eq!(outcomes[2].result, StepResult::Complete(StepPayload::None));
        assert!(outcomes.iter().all(|outcome| outcome.id == 7));
    }

    #[test]
    fn exchange_resolution_prefers_primary_exchange() {
        let transport = transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = price(Security::new("IBM"));
        transport.execute(
            StepCall::new(3, ResolutionStep::ResolveExchange, &request),
            OutcomeSink::new(tx),
        );

        transport.client().last().contract_details(ContractDetails {
            exchange: Some("SMART".to_string()),
            primary_exchange: Some("NYSE".to_string()),
            ..ContractDetails::default()
        });
        assert_eq!(
            drain(&mut rx)[0].result,
            StepResult::Complete(StepPayload::Exchange("NYSE".to_string()))
        );
    }

    #[test]
    fn session_errors_become_failures() {
        let transport = transport();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = price(Security::new("XXXX"));
        transport.execute(
            StepCall::new(11, ResolutionStep::ResolveExchange, &request),
            OutcomeSink::new(tx),
        );

        transport
            .client()
            .last()
            .error(200, "No security definition has been found");
        let outcome = drain(&mut rx).remove(0);
        assert!(matches!(
            outcome.result,
            StepResult::Failed {
                kind: ErrorKind::InvalidSecurity,
                ..
            }
        ));
    }
}
