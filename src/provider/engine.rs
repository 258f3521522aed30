//! Rate-limited dispatcher shared by every provider backend.
//!
//! One engine owns one pending collection and one timer. Each tick starts at
//! most one provider call; transport callbacks come back through a single
//! outcome channel that the dispatcher task drains, so request state is only
//! ever advanced in one place.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::batch::group_requests;
use super::queue::PendingQueue;
use super::session::{ProviderSession, SessionSnapshot, SessionStatus};
use super::{
    BatchCall, BatchMember, EventSink, OutcomeSink, Provider, ProviderEvent, StepCall,
    StepOutcome, StepPayload, StepResult, StepTransport,
};
use crate::error::{AppError, Result};
use crate::request::{
    partition, ErrorKind, PartitionPolicy, PartitionResult, Request, RequestId, RequestStatus,
    ResolutionStep,
};
use crate::utils::bar_in_window;

const SUBREQUEST_MESSAGE: &str = "Handled by subrequests";

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub partition: PartitionPolicy,
    pub batch_max_symbols: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            partition: PartitionPolicy::default(),
            batch_max_symbols: 50,
        }
    }
}

/// What a single dispatcher tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No connectivity; the timer is stopped until `connect`.
    Halted,
    /// Nothing waiting to start; the timer is stopped until new work arrives.
    Idle,
    Dispatched(RequestId),
    BatchDispatched(Vec<RequestId>),
    Partitioned {
        original: RequestId,
        recent: RequestId,
        remainder: RequestId,
    },
    Faulted(RequestId),
}

#[derive(Default)]
struct TimerControl {
    running: AtomicBool,
    wake: Notify,
}

impl TimerControl {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn resume(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct QueueEngine<T: StepTransport> {
    transport: T,
    settings: EngineSettings,
    queue: PendingQueue,
    session: ProviderSession,
    events: EventSink,
    outcome_tx: UnboundedSender<StepOutcome>,
    outcome_rx: Mutex<Option<UnboundedReceiver<StepOutcome>>>,
    next_id: AtomicU64,
    timer: TimerControl,
    stop: Notify,
}

impl<T: StepTransport> QueueEngine<T> {
    pub fn new(transport: T, settings: EngineSettings, events: EventSink) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            settings,
            queue: PendingQueue::new(),
            session: ProviderSession::new(events.clone()),
            events,
            outcome_tx,
            outcome_rx: Mutex::new(Some(outcome_rx)),
            next_id: AtomicU64::new(1),
            timer: TimerControl::default(),
            stop: Notify::new(),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn timer_running(&self) -> bool {
        self.timer.is_running()
    }

    /// Spawn the dispatcher task. Only the first call starts a loop.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut outcomes = self.outcome_rx.lock().ok()?.take()?;
        let engine = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "{} dispatcher started ({} ms interval)",
                engine.transport.name(),
                engine.settings.poll_interval.as_millis()
            );

            loop {
                let running = engine.timer.is_running();
                tokio::select! {
                    _ = engine.stop.notified() => break,
                    outcome = outcomes.recv() => match outcome {
                        Some(outcome) => engine.handle_outcome(outcome),
                        None => break,
                    },
                    _ = ticker.tick(), if running => {
                        engine.tick();
                    }
                    _ = engine.timer.wake.notified(), if !running => {
                        ticker.reset();
                    }
                }
            }

            info!("{} dispatcher stopped", engine.transport.name());
        }))
    }

    /// Stop the dispatcher task started by `start`.
    pub fn shutdown(&self) {
        self.timer.halt();
        self.stop.notify_one();
    }

    fn sink(&self) -> OutcomeSink {
        OutcomeSink::new(self.outcome_tx.clone())
    }

    fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn enqueue(&self, mut request: Request, front: bool) -> RequestId {
        let id = self.next_id();
        request.assign_id(id);
        debug!("queued {request}");
        if front {
            self.queue.push_front(request);
        } else {
            self.queue.push_back(request);
        }
        id
    }

    fn emit(&self, request: Request) {
        if self
            .events
            .send(ProviderEvent::RequestResponse(request))
            .is_err()
        {
            warn!("{}: response dropped, no listener", self.transport.name());
        }
    }

    fn fault<M: Into<String>>(&self, mut request: Request, kind: ErrorKind, message: M) -> RequestId {
        let id = request.id().unwrap_or_default();
        let message = message.into();
        warn!("{request} failed: {kind}: {message}");
        if let Err(err) = request.mark_error(kind, message) {
            error!("could not fault {request}: {err}");
        }
        self.emit(request);
        id
    }

    /// Drop back to Ready once nothing is left in the collection.
    fn settle(&self) {
        if self.queue.is_empty() && self.session.is_connected() {
            self.session.set_status(SessionStatus::Ready);
        }
    }

    /// Run one dispatcher step: start at most one queued item.
    pub fn tick(&self) -> TickOutcome {
        if !self.session.is_connected() {
            self.timer.halt();
            self.session.set_status(SessionStatus::Offline);
            return TickOutcome::Halted;
        }

        if let Some(request) = self.queue.pop_pending() {
            self.session.set_status(SessionStatus::Working);
            return self.dispatch(request);
        }

        if let Some(members) = self.queue.pop_batch() {
            self.session.set_status(SessionStatus::Working);
            return self.dispatch_batch(members);
        }

        self.timer.halt();
        self.settle();
        TickOutcome::Idle
    }

    fn dispatch(&self, mut request: Request) -> TickOutcome {
        let id = request.id().unwrap_or_default();
        if let Err(err) = request.mark_working() {
            error!("dropping {request}: {err}");
            return TickOutcome::Faulted(id);
        }

        let step = match request.pop_step() {
            Some(step) if self.transport.supports(step) => step,
            Some(step) => {
                let message = format!(
                    "step {step:?} is not supported by {}",
                    self.transport.name()
                );
                return TickOutcome::Faulted(self.fault(
                    request,
                    ErrorKind::InvalidRequest,
                    message,
                ));
            }
            None => {
                return TickOutcome::Faulted(self.fault(
                    request,
                    ErrorKind::InvalidRequest,
                    "request has no resolution steps left",
                ));
            }
        };

        if step == ResolutionStep::FetchHistoricalBars
            && self.settings.partition.needs_partition(&request)
        {
            request.restore_step(step);
            return self.split(request);
        }

        let call = StepCall::new(id, step, &request);
        if let Err(err) = request.mark_submitted(Utc::now()) {
            error!("dropping {request}: {err}");
            return TickOutcome::Faulted(id);
        }
        debug!("dispatching {step:?} for {request}");
        self.queue.push_back(request);
        self.transport.execute(call, self.sink());
        TickOutcome::Dispatched(id)
    }

    fn split(&self, mut request: Request) -> TickOutcome {
        let original = request.id().unwrap_or_default();
        let Some(PartitionResult { recent, remainder }) =
            partition(&request, &self.settings.partition)
        else {
            return TickOutcome::Faulted(self.fault(
                request,
                ErrorKind::SystemError,
                "partitioning produced no sub-requests",
            ));
        };

        let remainder = self.enqueue(remainder, true);
        let recent = self.enqueue(recent, true);
        info!("{request} split into #{recent} and #{remainder}");

        match request.mark_cancelled(SUBREQUEST_MESSAGE) {
            Ok(()) => self.emit(request),
            Err(err) => error!("could not retire {request}: {err}"),
        }

        TickOutcome::Partitioned {
            original,
            recent,
            remainder,
        }
    }

    fn dispatch_batch(&self, members: Vec<Request>) -> TickOutcome {
        let Some(first) = members.first() else {
            return TickOutcome::Idle;
        };
        let kind = first.kind();
        let (start, end) = (first.start(), first.end());
        let mut ids = Vec::with_capacity(members.len());
        let mut batch_members = Vec::with_capacity(members.len());
        let mut faulted = None;

        for mut member in members {
            let id = member.id().unwrap_or_default();
            match member.pop_step() {
                Some(ResolutionStep::FetchHistoricalBars) => {}
                other => {
                    let message = format!("batch member cannot run step {other:?}");
                    faulted = Some(self.fault(member, ErrorKind::InvalidRequest, message));
                    continue;
                }
            }
            if let Err(err) = member.mark_submitted(Utc::now()) {
                faulted = Some(self.fault(member, ErrorKind::SystemError, err.to_string()));
                continue;
            }
            batch_members.push(BatchMember {
                id,
                security: member.security().header(),
            });
            ids.push(id);
            self.queue.push_back(member);
        }

        if batch_members.is_empty() {
            self.settle();
            return faulted.map_or(TickOutcome::Idle, TickOutcome::Faulted);
        }

        let call = BatchCall {
            kind,
            start,
            end,
            members: batch_members,
        };
        debug!(
            "dispatching batch {kind} call for {} securities",
            call.members.len()
        );
        self.transport.execute_batch(call, self.sink());
        TickOutcome::BatchDispatched(ids)
    }

    /// Apply a transport callback. Outcomes for requests no longer queued are ignored.
    pub fn handle_outcome(&self, outcome: StepOutcome) {
        let StepOutcome { id, result } = outcome;
        match result {
            StepResult::Partial(payload) => {
                let applied = self.queue.with_request(id, |request| {
                    apply_payload(request, payload);
                    request.mark_partial_response()
                });
                match applied {
                    Some(Ok(())) => {}
                    Some(Err(err)) => warn!("partial response for #{id} rejected: {err}"),
                    None => debug!("ignoring partial response for unknown request #{id}"),
                }
            }
            StepResult::Complete(payload) => {
                let Some(mut request) = self.queue.take(id) else {
                    debug!("ignoring response for unknown request #{id}");
                    return;
                };
                apply_payload(&mut request, payload);
                self.advance(request);
            }
            StepResult::Failed {
                kind: ErrorKind::ConnectionError,
                message,
            } => {
                let Some(request) = self.queue.take(id) else {
                    debug!("ignoring connection error for unknown request #{id}");
                    return;
                };
                self.requeue_after_disconnect(request, message);
            }
            StepResult::Failed { kind, message } => {
                let Some(request) = self.queue.take(id) else {
                    debug!("ignoring error for unknown request #{id}: {message}");
                    return;
                };
                let kind = match kind {
                    ErrorKind::None => ErrorKind::SystemError,
                    other => other,
                };
                self.fault(request, kind, message);
                self.settle();
            }
        }
    }

    fn advance(&self, mut request: Request) {
        if request.remaining_steps() > 0 {
            match request.mark_pending() {
                Ok(()) => {
                    let id = self.enqueue(request, true);
                    debug!("continuing as #{id}");
                    self.timer.resume();
                }
                Err(err) => error!("cannot continue {request}: {err}"),
            }
            return;
        }

        match request.mark_complete() {
            Ok(()) => {
                debug!("completed {request}");
                self.emit(request);
            }
            Err(err) => error!("cannot complete {request}: {err}"),
        }
        self.settle();
    }

    fn requeue_after_disconnect(&self, mut request: Request, message: String) {
        warn!("{request} lost its connection: {message}");
        request.restore_current_step();
        match request.mark_pending() {
            Ok(()) => {
                let id = self.enqueue(request, true);
                debug!("parked as #{id} until reconnect");
            }
            Err(err) => error!("cannot requeue {request}: {err}"),
        }

        self.timer.halt();
        self.session.set_connected(false);
        self.session.set_status(SessionStatus::ErrorState);
        self.session.set_message(message);
    }

    fn submit_one(&self, mut request: Request) -> Result<RequestId> {
        if request.status() != RequestStatus::Pending {
            return Err(AppError::invalid_operation(format!(
                "cannot submit {request} in status {:?}",
                request.status()
            )));
        }
        if request.remaining_steps() == 0 {
            request.assign_steps(self.transport.plan(&request));
        }
        Ok(self.enqueue(request, false))
    }
}

fn apply_payload(request: &mut Request, payload: StepPayload) {
    match payload {
        StepPayload::None => {}
        StepPayload::Exchange(exchange) => {
            request.security_mut().exchange = Some(exchange);
        }
        StepPayload::EarliestDate(date) => {
            request.security_mut().earliest_date = Some(date);
            request.clamp_start(date);
        }
        StepPayload::Bars(bars) => {
            let (start, end) = (request.start(), request.end());
            let in_range = bars
                .into_iter()
                .filter(|bar| bar_in_window(bar.date, start, end));
            request.security_mut().upsert_bars(in_range);
        }
        StepPayload::ContractDetails(details) => {
            request.security_mut().apply_contract_details(&details);
        }
        StepPayload::CompanyInfo(info) => {
            request.security_mut().apply_company_info(&info);
        }
    }
}

impl<T: StepTransport> Provider for QueueEngine<T> {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn connect(&self) -> Result<()> {
        if let Err(err) = self.transport.connect() {
            self.session.set_connected(false);
            self.session.set_status(SessionStatus::ErrorState);
            self.session.set_message(format!("Connection failed: {err}"));
            return Err(err);
        }

        self.session.set_connected(true);
        self.session
            .set_message(format!("Connected to {}", self.transport.name()));
        self.session.set_secondary_message(String::new());
        if self.queue.has_startable() {
            self.session.set_status(SessionStatus::Working);
            self.timer.resume();
        } else {
            self.session.set_status(SessionStatus::Ready);
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.timer.halt();
        self.transport.disconnect();
        self.session.set_connected(false);
        self.session.set_status(SessionStatus::Offline);
        self.session
            .set_message(format!("Disconnected from {}", self.transport.name()));
    }

    fn submit_request(&self, request: Request) -> Result<RequestId> {
        let id = self.submit_one(request)?;
        self.timer.resume();
        Ok(id)
    }

    fn submit_batch_request(&self, requests: Vec<Request>) -> Result<Vec<RequestId>> {
        if let Some(bad) = requests
            .iter()
            .find(|req| req.status() != RequestStatus::Pending)
        {
            return Err(AppError::invalid_operation(format!(
                "cannot submit {bad} in status {:?}",
                bad.status()
            )));
        }

        let (batchable, singles): (Vec<Request>, Vec<Request>) =
            requests.into_iter().partition(|req| {
                self.transport.supports_batch(req.kind())
                    && !self.settings.partition.needs_partition(req)
            });

        let mut ids = Vec::new();
        for request in singles {
            ids.push(self.submit_one(request)?);
        }

        for group in group_requests(batchable, self.settings.batch_max_symbols) {
            let mut members = Vec::with_capacity(group.len());
            for mut member in group {
                member.assign_steps([ResolutionStep::FetchHistoricalBars]);
                member.assign_id(self.next_id());
                member.mark_working()?;
                ids.push(member.id().unwrap_or_default());
                members.push(member);
            }
            self.queue.push_batch(members);
        }

        self.timer.resume();
        Ok(ids)
    }

    fn request_supported_symbols(&self) {
        self.transport.supported_symbols(self.events.clone());
    }

    fn request_sectors(&self) {
        self.transport.sectors(self.events.clone());
    }

    fn cancel_all_requests(&self, reason: &str) {
        let drained = self.queue.drain();
        if !drained.is_empty() {
            info!(
                "{}: cancelling {} request(s): {reason}",
                self.transport.name(),
                drained.len()
            );
        }
        for mut request in drained {
            match request.mark_cancelled(reason) {
                Ok(()) => self.emit(request),
                Err(err) => debug!("{request} already cancelled: {err}"),
            }
        }
        self.settle();
    }

    fn session(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    fn pending_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::request::RequestKind;
    use crate::security::{PriceBar, Security};
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTransport {
        calls: StdMutex<Vec<StepCall>>,
        batches: StdMutex<Vec<BatchCall>>,
        plan: Vec<ResolutionStep>,
        batch: bool,
    }

    impl RecordingTransport {
        fn with_plan(plan: Vec<ResolutionStep>) -> Self {
            Self {
                plan,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<StepCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl StepTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        fn connect(&self) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self) {}

        fn plan(&self, _request: &Request) -> Vec<ResolutionStep> {
            self.plan.clone()
        }

        fn supports(&self, step: ResolutionStep) -> bool {
            step != ResolutionStep::FetchContractDetails
        }

        fn execute(&self, call: StepCall, _sink: OutcomeSink) {
            self.calls.lock().unwrap().push(call);
        }

        fn supports_batch(&self, kind: RequestKind) -> bool {
            self.batch && kind.is_historical()
        }

        fn execute_batch(&self, call: BatchCall, _sink: OutcomeSink) {
            self.batches.lock().unwrap().push(call);
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn clock() -> FixedClock {
        FixedClock::at(date(2024, 6, 3), 18, 0)
    }

    fn price(ticker: &str, start: NaiveDate, end: NaiveDate) -> Request {
        Request::price_data(Security::new(ticker), start, end, &clock()).unwrap()
    }

    fn engine(
        transport: RecordingTransport,
    ) -> (
        Arc<QueueEngine<RecordingTransport>>,
        UnboundedReceiver<ProviderEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = QueueEngine::new(transport, EngineSettings::default(), tx);
        engine.connect().unwrap();
        (engine, rx)
    }

    fn responses(rx: &mut UnboundedReceiver<ProviderEvent>) -> Vec<Request> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProviderEvent::RequestResponse(request) = event {
                out.push(request);
            }
        }
        out
    }

    #[test]
    fn ids_increase_and_plan_is_applied() {
        let (engine, _rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let a = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 5, 31)))
            .unwrap();
        let b = engine
            .submit_request(price("BBB", date(2024, 1, 2), date(2024, 5, 31)))
            .unwrap();
        assert!(b > a);
        assert!(engine.timer_running());
        assert_eq!(engine.queue().get(a).unwrap().remaining_steps(), 1);
    }

    #[test]
    fn single_step_request_completes() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let id = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();

        assert_eq!(engine.tick(), TickOutcome::Dispatched(id));
        assert_eq!(
            engine.queue().get(id).unwrap().status(),
            RequestStatus::Submitted
        );
        assert!(engine.session().is_busy());

        let bars = vec![
            PriceBar::new(date(2024, 1, 3), 1.0, 2.0, 0.5, 1.5, 10.0),
            PriceBar::new(date(2023, 12, 29), 1.0, 2.0, 0.5, 1.5, 10.0),
        ];
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Partial(StepPayload::Bars(bars)),
        });
        assert_eq!(
            engine.queue().get(id).unwrap().status(),
            RequestStatus::PartialResponse
        );
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Complete(StepPayload::None),
        });

        let done = responses(&mut rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status(), RequestStatus::CompleteResponse);
        assert_eq!(done[0].error_kind(), ErrorKind::None);
        // The bar outside the requested range is dropped.
        assert_eq!(done[0].security().bars.len(), 1);
        assert!(engine.queue().is_empty());
        assert_eq!(engine.session().status, SessionStatus::Ready);
    }

    #[test]
    fn empty_plan_faults_with_invalid_request() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(Vec::new()));
        let id = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();

        assert_eq!(engine.tick(), TickOutcome::Faulted(id));
        let done = responses(&mut rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status(), RequestStatus::ErrorResponse);
        assert_eq!(done[0].error_kind(), ErrorKind::InvalidRequest);
        assert!(engine.queue().is_empty());
    }

    #[test]
    fn unsupported_step_faults_with_invalid_request() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchContractDetails,
        ]));
        let request = Request::contract_data(Security::new("AAA"), &clock()).unwrap();
        let id = engine.submit_request(request).unwrap();

        assert_eq!(engine.tick(), TickOutcome::Faulted(id));
        assert_eq!(responses(&mut rx)[0].error_kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn oversized_request_is_partitioned_instead_of_dispatched() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let original = engine
            .submit_request(price("ABC", date(2015, 1, 1), date(2020, 6, 15)))
            .unwrap();

        let TickOutcome::Partitioned {
            original: split,
            recent,
            remainder,
        } = engine.tick()
        else {
            panic!("expected a partition");
        };
        assert_eq!(split, original);
        assert!(engine.transport().calls().is_empty());

        let cancelled = responses(&mut rx);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].status(), RequestStatus::Cancelled);
        assert_eq!(cancelled[0].error_message(), SUBREQUEST_MESSAGE);

        assert_eq!(engine.queue().ids(), vec![recent, remainder]);
        assert_eq!(engine.tick(), TickOutcome::Dispatched(recent));
        assert_eq!(engine.tick(), TickOutcome::Dispatched(remainder));
        let calls = engine.transport().calls();
        assert_eq!(calls[0].end.date(), date(2020, 6, 15));
        assert_eq!(calls[1].start.date(), date(2015, 1, 1));
    }

    #[test]
    fn continuation_is_serviced_before_new_work() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::ResolveEarliestDate,
            ResolutionStep::FetchHistoricalBars,
        ]));
        let a = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 5, 31)))
            .unwrap();
        let mut b_request = price("BBB", date(2024, 1, 2), date(2024, 5, 31));
        b_request.assign_steps([ResolutionStep::FetchHistoricalBars]);
        let b = engine.submit_request(b_request).unwrap();

        assert_eq!(engine.tick(), TickOutcome::Dispatched(a));
        engine.handle_outcome(StepOutcome {
            id: a,
            result: StepResult::Complete(StepPayload::EarliestDate(date(2024, 3, 1))),
        });

        let TickOutcome::Dispatched(a_next) = engine.tick() else {
            panic!("expected a dispatch");
        };
        assert_ne!(a_next, b);
        let calls = engine.transport().calls();
        assert_eq!(calls[1].ticker(), "AAA");
        assert_eq!(calls[1].step, ResolutionStep::FetchHistoricalBars);
        assert_eq!(calls[1].start.date(), date(2024, 3, 1));

        assert_eq!(engine.tick(), TickOutcome::Dispatched(b));
        assert!(responses(&mut rx).is_empty());
    }

    #[test]
    fn connection_error_keeps_request_pending_and_halts() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let id = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        engine.tick();
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Failed {
                kind: ErrorKind::ConnectionError,
                message: "socket closed".into(),
            },
        });

        let parked_id = engine.queue().ids()[0];
        assert_ne!(parked_id, id);
        let parked = engine.queue().get(parked_id).unwrap();
        assert_eq!(parked.status(), RequestStatus::Pending);
        assert_eq!(parked.remaining_steps(), 1);
        assert_eq!(engine.session().status, SessionStatus::ErrorState);
        assert!(!engine.timer_running());
        assert!(responses(&mut rx).is_empty());

        assert_eq!(engine.tick(), TickOutcome::Halted);
        assert_eq!(engine.session().status, SessionStatus::Offline);

        engine.connect().unwrap();
        assert!(engine.timer_running());
        assert_eq!(engine.tick(), TickOutcome::Dispatched(parked_id));
    }

    #[test]
    fn late_callback_after_connection_error_does_not_strand_the_request() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let id = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        engine.tick();
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Failed {
                kind: ErrorKind::ConnectionError,
                message: "socket closed".into(),
            },
        });
        // The old call still delivers a chunk after the drop.
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Partial(StepPayload::Bars(vec![PriceBar::new(
                date(2024, 1, 3),
                1.0,
                2.0,
                0.5,
                1.5,
                10.0,
            )])),
        });

        let parked_id = engine.queue().ids()[0];
        let parked = engine.queue().get(parked_id).unwrap();
        assert_eq!(parked.status(), RequestStatus::Pending);
        assert!(parked.security().bars.is_empty());

        engine.connect().unwrap();
        assert_eq!(engine.tick(), TickOutcome::Dispatched(parked_id));
        engine.handle_outcome(StepOutcome {
            id: parked_id,
            result: StepResult::Complete(StepPayload::None),
        });
        let done = responses(&mut rx);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].status(), RequestStatus::CompleteResponse);
    }

    #[test]
    fn bar_of_an_open_session_is_not_cached() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let open = FixedClock::at(date(2024, 6, 3), 11, 0);
        let request =
            Request::price_data(Security::new("AAA"), date(2024, 5, 27), date(2024, 6, 3), &open)
                .unwrap();
        assert_eq!(request.end().time(), NaiveTime::MIN);
        let id = engine.submit_request(request).unwrap();
        engine.tick();
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Complete(StepPayload::Bars(vec![
                PriceBar::new(date(2024, 5, 31), 1.0, 2.0, 0.5, 1.5, 10.0),
                PriceBar::new(date(2024, 6, 3), 1.5, 2.5, 1.0, 2.0, 4.0),
            ])),
        });

        let done = responses(&mut rx);
        assert_eq!(done.len(), 1);
        let dates: Vec<NaiveDate> = done[0].security().bars.iter().map(|bar| bar.date).collect();
        assert_eq!(dates, vec![date(2024, 5, 31)]);
    }

    #[test]
    fn batch_member_without_a_fetch_step_is_faulted() {
        let transport = RecordingTransport {
            plan: vec![ResolutionStep::FetchHistoricalBars],
            batch: true,
            ..RecordingTransport::default()
        };
        let (engine, mut rx) = engine(transport);

        let mut good = price("AAA", date(2024, 1, 2), date(2024, 1, 5));
        good.assign_steps([ResolutionStep::FetchHistoricalBars]);
        good.assign_id(100);
        good.mark_working().unwrap();
        let mut stepless = price("BBB", date(2024, 1, 2), date(2024, 1, 5));
        stepless.assign_id(101);
        stepless.mark_working().unwrap();
        engine.queue().push_batch(vec![good, stepless]);

        assert_eq!(engine.tick(), TickOutcome::BatchDispatched(vec![100]));
        let faulted = responses(&mut rx);
        assert_eq!(faulted.len(), 1);
        assert_eq!(faulted[0].id(), Some(101));
        assert_eq!(faulted[0].error_kind(), ErrorKind::InvalidRequest);
        let batches = engine.transport().batches.lock().unwrap().clone();
        assert_eq!(batches[0].tickers(), vec!["AAA"]);
    }

    #[test]
    fn step_error_is_final() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::ResolveExchange,
            ResolutionStep::FetchHistoricalBars,
        ]));
        let id = engine
            .submit_request(price("ZZZ", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        engine.tick();
        engine.handle_outcome(StepOutcome {
            id,
            result: StepResult::Failed {
                kind: ErrorKind::InvalidSecurity,
                message: "no security definition".into(),
            },
        });

        let done = responses(&mut rx);
        assert_eq!(done[0].error_kind(), ErrorKind::InvalidSecurity);
        assert_eq!(engine.tick(), TickOutcome::Idle);
        assert_eq!(engine.transport().calls().len(), 1);
    }

    #[test]
    fn cancel_all_emits_every_request_and_ignores_late_callbacks() {
        let (engine, mut rx) = engine(RecordingTransport::with_plan(vec![
            ResolutionStep::FetchHistoricalBars,
        ]));
        let first = engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        engine
            .submit_request(price("BBB", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        engine
            .submit_request(price("CCC", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        engine.tick();

        engine.cancel_all_requests("shutdown");
        let cancelled = responses(&mut rx);
        assert_eq!(cancelled.len(), 3);
        assert!(cancelled.iter().all(|req| req.status() == RequestStatus::Cancelled
            && req.error_kind() == ErrorKind::Cancelled));
        assert_eq!(engine.pending_count(), 0);

        engine.handle_outcome(StepOutcome {
            id: first,
            result: StepResult::Complete(StepPayload::None),
        });
        assert!(responses(&mut rx).is_empty());
    }

    #[test]
    fn batch_requests_share_one_call() {
        let transport = RecordingTransport {
            plan: vec![ResolutionStep::FetchHistoricalBars],
            batch: true,
            ..RecordingTransport::default()
        };
        let (engine, _rx) = engine(transport);
        let requests = vec![
            price("AAA", date(2024, 1, 2), date(2024, 1, 5)),
            price("BBB", date(2024, 1, 2), date(2024, 1, 5)),
            price("CCC", date(2010, 1, 2), date(2024, 1, 5)),
        ];
        let ids = engine.submit_batch_request(requests).unwrap();
        assert_eq!(ids.len(), 3);

        // The oversized request goes through the single path and is split first.
        assert!(matches!(engine.tick(), TickOutcome::Partitioned { .. }));
        engine.tick();
        engine.tick();
        let TickOutcome::BatchDispatched(members) = engine.tick() else {
            panic!("expected the batch");
        };
        assert_eq!(members.len(), 2);
        let batches = engine.transport().batches.lock().unwrap().clone();
        assert_eq!(batches[0].tickers(), vec!["AAA", "BBB"]);
    }

    #[test]
    fn offline_engine_halts_without_dispatching() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = QueueEngine::new(
            RecordingTransport::with_plan(vec![ResolutionStep::FetchHistoricalBars]),
            EngineSettings::default(),
            tx,
        );
        engine
            .submit_request(price("AAA", date(2024, 1, 2), date(2024, 1, 5)))
            .unwrap();
        assert_eq!(engine.tick(), TickOutcome::Halted);
        assert!(engine.transport().calls().is_empty());
        assert_eq!(engine.pending_count(), 1);
    }
}
