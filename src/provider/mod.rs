//! Provider contract, the step seam shared by all backends, and the queue engine.

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::request::{ErrorKind, Request, RequestId, RequestKind, ResolutionStep};
use crate::security::{CompanyInfo, ContractDetails, PriceBar, Sector, Security, SymbolListing};

pub mod batch;
pub mod engine;
pub mod http;
pub mod queue;
pub mod session;
pub mod socket;

pub use engine::{EngineSettings, QueueEngine, TickOutcome};
pub use session::{ProviderSession, SessionSnapshot, SessionStatus};

/// Everything a provider publishes to its owner.
#[derive(Debug)]
pub enum ProviderEvent {
    RequestResponse(Request),
    SupportedSymbolsResponse(SymbolsResponse),
    SectorsResponse(SectorsResponse),
    SessionPropertyChanged(&'static str),
}

pub type EventSink = UnboundedSender<ProviderEvent>;

#[derive(Debug, Clone, Default)]
pub struct SymbolsResponse {
    pub provider: String,
    pub symbols: Vec<SymbolListing>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SectorsResponse {
    pub provider: String,
    pub sectors: Vec<Sector>,
    pub error: Option<String>,
}

/// Stable surface the manager talks to, one implementation per backend.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn connect(&self) -> Result<()>;
    fn disconnect(&self);
    fn submit_request(&self, request: Request) -> Result<RequestId>;
    fn submit_batch_request(&self, requests: Vec<Request>) -> Result<Vec<RequestId>>;
    fn request_supported_symbols(&self);
    fn request_sectors(&self);
    fn cancel_all_requests(&self, reason: &str);
    fn session(&self) -> SessionSnapshot;
    fn pending_count(&self) -> usize;
}

/// One step handed to a transport, detached from the queued request.
#[derive(Debug, Clone)]
pub struct StepCall {
    pub id: RequestId,
    pub step: ResolutionStep,
    pub kind: RequestKind,
    pub security: Security,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl StepCall {
    pub fn new(id: RequestId, step: ResolutionStep, request: &Request) -> Self {
        Self {
            id,
            step,
            kind: request.kind(),
            security: request.security().header(),
            start: request.start(),
            end: request.end(),
        }
    }

    pub fn ticker(&self) -> &str {
        &self.security.ticker
    }
}

#[derive(Debug, Clone)]
pub struct BatchMember {
    pub id: RequestId,
    pub security: Security,
}

/// Several same-kind, same-range requests served by one provider call.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub kind: RequestKind,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub members: Vec<BatchMember>,
}

impl BatchCall {
    pub fn tickers(&self) -> Vec<&str> {
        self.members
            .iter()
            .map(|member| member.security.ticker.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepPayload {
    None,
    Exchange(String),
    EarliestDate(NaiveDate),
    Bars(Vec<PriceBar>),
    ContractDetails(ContractDetails),
    CompanyInfo(CompanyInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Partial(StepPayload),
    Complete(StepPayload),
    Failed { kind: ErrorKind, message: String },
}

/// A transport callback, keyed by the id the step was dispatched under.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub id: RequestId,
    pub result: StepResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepFailure {
    pub fn new<T: Into<String>>(kind: ErrorKind, message: T) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Handle transports use to report step results back to the dispatcher.
#[derive(Debug, Clone)]
pub struct OutcomeSink {
    tx: UnboundedSender<StepOutcome>,
}

impl OutcomeSink {
    pub fn new(tx: UnboundedSender<StepOutcome>) -> Self {
        Self { tx }
    }

    pub fn send(&self, id: RequestId, result: StepResult) {
        if self.tx.send(StepOutcome { id, result }).is_err() {
            log::debug!("dispatcher gone, dropping outcome for request {id}");
        }
    }

    pub fn partial(&self, id: RequestId, payload: StepPayload) {
        self.send(id, StepResult::Partial(payload));
    }

    pub fn complete(&self, id: RequestId, payload: StepPayload) {
        self.send(id, StepResult::Complete(payload));
    }

    pub fn fail<T: Into<String>>(&self, id: RequestId, kind: ErrorKind, message: T) {
        self.send(
            id,
            StepResult::Failed {
                kind,
                message: message.into(),
            },
        );
    }

    pub fn finish(&self, id: RequestId, result: std::result::Result<StepPayload, StepFailure>) {
        match result {
            Ok(payload) => self.complete(id, payload),
            Err(failure) => self.fail(id, failure.kind, failure.message),
        }
    }
}

/// Backend seam: turns one resolution step into one provider call.
///
/// `execute` must not block; results travel back through the sink, possibly
/// from another thread and in any order relative to other requests.
pub trait StepTransport: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn connect(&self) -> Result<()>;

    fn disconnect(&self);

    /// Steps needed to satisfy `request` with this backend, in order.
    fn plan(&self, request: &Request) -> Vec<ResolutionStep>;

    fn supports(&self, step: ResolutionStep) -> bool;

    fn execute(&self, call: StepCall, sink: OutcomeSink);

    fn supports_batch(&self, _kind: RequestKind) -> bool {
        false
    }

    fn execute_batch(&self, call: BatchCall, sink: OutcomeSink) {
        for member in call.members {
            sink.fail(
                member.id,
                ErrorKind::InvalidRequest,
                format!("{} does not accept batch calls", self.name()),
            );
        }
    }

    fn supported_symbols(&self, events: EventSink) {
        let _ = events.send(ProviderEvent::SupportedSymbolsResponse(SymbolsResponse {
            provider: self.name().to_string(),
            symbols: Vec::new(),
            error: Some(format!("{} has no symbol listing", self.name())),
        }));
    }

    fn sectors(&self, events: EventSink) {
        let _ = events.send(ProviderEvent::SectorsResponse(SectorsResponse {
            provider: self.name().to_string(),
            sectors: Vec::new(),
            error: Some(format!("{} has no sector listing", self.name())),
        }));
    }
}
