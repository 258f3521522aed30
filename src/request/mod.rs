//! Provider requests and their lifecycle.
//!
//! A [`Request`] describes one ask of a data provider. Its status only moves
//! through the named `mark_*` transitions; once cancelled it is frozen.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::clock::MarketSessionClock;
use crate::error::{AppError, Result};
use crate::security::Security;
use crate::utils::{end_of_day, start_of_day};

pub mod partition;

pub use partition::{partition, PartitionPolicy, PartitionResult};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    ContractData,
    PriceData,
    VolumeData,
    CompanyInfo,
}

impl RequestKind {
    pub fn is_historical(self) -> bool {
        matches!(self, RequestKind::PriceData | RequestKind::VolumeData)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestKind::ContractData => "contract data",
            RequestKind::PriceData => "price data",
            RequestKind::VolumeData => "volume data",
            RequestKind::CompanyInfo => "company info",
        };
        f.write_str(label)
    }
}

/// One provider call needed to satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionStep {
    ResolveExchange,
    ResolveEarliestDate,
    FetchHistoricalBars,
    FetchContractDetails,
    FetchCompanyInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    /// Picked up by the dispatcher, not yet handed to the transport.
    Processing,
    Submitted,
    PartialResponse,
    CompleteResponse,
    ErrorResponse,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::CompleteResponse | RequestStatus::ErrorResponse | RequestStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    None,
    ConnectionError,
    InvalidRequest,
    InvalidSecurity,
    SystemError,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::None => "no error",
            ErrorKind::ConnectionError => "connection error",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::InvalidSecurity => "invalid security",
            ErrorKind::SystemError => "system error",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    id: Option<RequestId>,
    security: Security,
    kind: RequestKind,
    start: NaiveDateTime,
    end: NaiveDateTime,
    steps: VecDeque<ResolutionStep>,
    current_step: Option<ResolutionStep>,
    status: RequestStatus,
    error_kind: ErrorKind,
    error_message: String,
    partitioned: bool,
    created_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Build a request over `[start, end]`. The end is pushed to the end of its day
    /// unless it is today and the session is still open, so a partial bar is never cached.
    pub fn new(
        security: Security,
        kind: RequestKind,
        start: NaiveDate,
        end: NaiveDate,
        clock: &dyn MarketSessionClock,
    ) -> Result<Self> {
        if start > end {
            return Err(AppError::InvalidRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }

        let end = if end == clock.today() && !clock.is_session_closed(end) {
            start_of_day(end)
        } else {
            end_of_day(end)
        };

        Ok(Self::from_parts(security, kind, start_of_day(start), end))
    }

    pub fn price_data(
        security: Security,
        start: NaiveDate,
        end: NaiveDate,
        clock: &dyn MarketSessionClock,
    ) -> Result<Self> {
        Self::new(security, RequestKind::PriceData, start, end, clock)
    }

    pub fn volume_data(
        security: Security,
        start: NaiveDate,
        end: NaiveDate,
        clock: &dyn MarketSessionClock,
    ) -> Result<Self> {
        Self::new(security, RequestKind::VolumeData, start, end, clock)
    }

    pub fn contract_data(security: Security, clock: &dyn MarketSessionClock) -> Result<Self> {
        let today = clock.today();
        Self::new(security, RequestKind::ContractData, today, today, clock)
    }

    pub fn company_info(security: Security, clock: &dyn MarketSessionClock) -> Result<Self> {
        let today = clock.today();
        Self::new(security, RequestKind::CompanyInfo, today, today, clock)
    }

    fn from_parts(
        security: Security,
        kind: RequestKind,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Self {
        Self {
            id: None,
            security: security.header(),
            kind,
            start,
            end,
            steps: VecDeque::new(),
            current_step: None,
            status: RequestStatus::Pending,
            error_kind: ErrorKind::None,
            error_message: String::new(),
            partitioned: false,
            created_at: Utc::now(),
            submitted_at: None,
        }
    }

    /// Sub-request over a narrower window carrying the remaining steps.
    pub(crate) fn derive(&self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        let mut sub = Self::from_parts(self.security.header(), self.kind, start, end);
        sub.steps = self.steps.clone();
        sub.partitioned = true;
        sub
    }

    pub fn id(&self) -> Option<RequestId> {
        self.id
    }

    pub fn security(&self) -> &Security {
        &self.security
    }

    pub fn security_mut(&mut self) -> &mut Security {
        &mut self.security
    }

    pub fn ticker(&self) -> &str {
        &self.security.ticker
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    pub fn span_days(&self) -> i64 {
        (self.end.date() - self.start.date()).num_days()
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.error_kind
    }

    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    pub fn has_error(&self) -> bool {
        self.status == RequestStatus::ErrorResponse
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn steps(&self) -> impl Iterator<Item = &ResolutionStep> {
        self.steps.iter()
    }

    pub fn remaining_steps(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn assign_id(&mut self, id: RequestId) {
        self.id = Some(id);
    }

    pub(crate) fn assign_steps<I: IntoIterator<Item = ResolutionStep>>(&mut self, steps: I) {
        self.steps = steps.into_iter().collect();
    }

    pub(crate) fn pop_step(&mut self) -> Option<ResolutionStep> {
        self.current_step = self.steps.pop_front();
        self.current_step
    }

    /// Step most recently handed to the provider.
    pub fn current_step(&self) -> Option<ResolutionStep> {
        self.current_step
    }

    /// Put a consumed step back, used when a call has to be retried.
    pub(crate) fn restore_step(&mut self, step: ResolutionStep) {
        self.steps.push_front(step);
        self.current_step = None;
    }

    /// Undo the last `pop_step`, if any, so the step runs again.
    pub(crate) fn restore_current_step(&mut self) {
        if let Some(step) = self.current_step.take() {
            self.steps.push_front(step);
        }
    }

    /// Narrow the start once the provider reports its earliest available date.
    pub(crate) fn clamp_start(&mut self, earliest: NaiveDate) {
        let earliest = start_of_day(earliest);
        if earliest > self.start {
            self.start = earliest.min(start_of_day(self.end.date()));
        }
    }

    fn ensure_not_cancelled(&self, transition: &str) -> Result<()> {
        if self.status == RequestStatus::Cancelled {
            return Err(AppError::invalid_operation(format!(
                "cannot {transition} request {} for {}: request is cancelled",
                self.describe_id(),
                self.security.ticker
            )));
        }
        Ok(())
    }

    pub fn describe_id(&self) -> String {
        self.id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn mark_pending(&mut self) -> Result<()> {
        self.ensure_not_cancelled("mark pending")?;
        self.status = RequestStatus::Pending;
        Ok(())
    }

    pub fn mark_working(&mut self) -> Result<()> {
        self.ensure_not_cancelled("mark working")?;
        self.status = RequestStatus::Processing;
        Ok(())
    }

    pub fn mark_submitted(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.ensure_not_cancelled("mark submitted")?;
        self.status = RequestStatus::Submitted;
        self.submitted_at = Some(at);
        Ok(())
    }

    pub fn mark_partial_response(&mut self) -> Result<()> {
        self.ensure_not_cancelled("mark partial response")?;
        self.status = RequestStatus::PartialResponse;
        Ok(())
    }

    pub fn mark_complete(&mut self) -> Result<()> {
        self.ensure_not_cancelled("mark complete")?;
        self.status = RequestStatus::CompleteResponse;
        self.error_kind = ErrorKind::None;
        self.error_message.clear();
        Ok(())
    }

    pub fn mark_error<T: Into<String>>(&mut self, kind: ErrorKind, message: T) -> Result<()> {
        self.ensure_not_cancelled("mark error")?;
        if kind == ErrorKind::None {
            return Err(AppError::invalid_operation(
                "an error response needs an error kind",
            ));
        }
        self.status = RequestStatus::ErrorResponse;
        self.error_kind = kind;
        self.error_message = message.into();
        Ok(())
    }

    pub fn mark_cancelled<T: Into<String>>(&mut self, message: T) -> Result<()> {
        self.ensure_not_cancelled("cancel")?;
        self.status = RequestStatus::Cancelled;
        self.error_kind = ErrorKind::Cancelled;
        self.error_message = message.into();
        Ok(())
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} [{} .. {}]",
            self.describe_id(),
            self.kind,
            self.security.ticker,
            self.start.date(),
            self.end.date()
        )
    }
}
