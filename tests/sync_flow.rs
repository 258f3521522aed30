use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

use refdata_sync::clock::FixedClock;
use refdata_sync::config::ManagerSettings;
use refdata_sync::error::Result;
use refdata_sync::manager::{Manager, ManagerEvent};
use refdata_sync::provider::{
    EngineSettings, OutcomeSink, Provider, QueueEngine, SessionStatus, StepCall, StepPayload,
    StepTransport,
};
use refdata_sync::request::{ErrorKind, Request, ResolutionStep};
use refdata_sync::security::{PriceBar, Security};
use refdata_sync::store::{MemoryStore, SecurityStore};
use refdata_sync::utils::{is_weekday, weekdays_between};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn clock() -> FixedClock {
    FixedClock::at(date(2024, 6, 3), 18, 0)
}

/// Transport that answers every step immediately with synthetic data:
/// one bar per weekday of the requested window.
struct ScriptedTransport {
    plan: Vec<ResolutionStep>,
    earliest: NaiveDate,
    /// Number of leading calls that fail with the given kind.
    failures: usize,
    failure_kind: ErrorKind,
    calls: Mutex<Vec<StepCall>>,
    count: AtomicUsize,
}

impl ScriptedTransport {
    fn new(plan: Vec<ResolutionStep>) -> Self {
        Self {
            plan,
            earliest: date(1990, 1, 1),
            failures: 0,
            failure_kind: ErrorKind::None,
            calls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, failures: usize, kind: ErrorKind) -> Self {
        self.failures = failures;
        self.failure_kind = kind;
        self
    }

    fn calls(&self) -> Vec<StepCall> {
        self.calls.lock().unwrap().clone()
    }
}

fn weekday_bars(from: NaiveDate, to: NaiveDate) -> Vec<PriceBar> {
    from.iter_days()
        .take_while(|day| *day <= to)
        .filter(|day| is_weekday(*day))
        .map(|day| PriceBar::new(day, 10.0, 11.0, 9.0, 10.5, 1000.0))
        .collect()
}

impl StepTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&self) {}

    fn plan(&self, _request: &Request) -> Vec<ResolutionStep> {
        self.plan.clone()
    }

    fn supports(&self, _step: ResolutionStep) -> bool {
        true
    }

    fn execute(&self, call: StepCall, sink: OutcomeSink) {
        self.calls.lock().unwrap().push(call.clone());
        if self.count.fetch_add(1, Ordering::SeqCst) < self.failures {
            sink.fail(call.id, self.failure_kind, "scripted failure");
            return;
        }
        match call.step {
            ResolutionStep::ResolveExchange => {
                sink.complete(call.id, StepPayload::Exchange("TSE".to_string()))
            }
            ResolutionStep::ResolveEarliestDate => {
                sink.complete(call.id, StepPayload::EarliestDate(self.earliest))
            }
            ResolutionStep::FetchHistoricalBars => {
                let bars = weekday_bars(call.start.date(), call.end.date());
                sink.partial(call.id, StepPayload::Bars(bars));
                sink.complete(call.id, StepPayload::None);
            }
            _ => sink.complete(call.id, StepPayload::None),
        }
    }
}

struct Harness {
    engine: Arc<QueueEngine<ScriptedTransport>>,
    manager: Arc<Manager>,
    store: Arc<MemoryStore>,
    events: broadcast::Receiver<ManagerEvent>,
}

fn harness(transport: ScriptedTransport, settings: ManagerSettings) -> Harness {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine_settings = EngineSettings {
        poll_interval: Duration::from_millis(5),
        ..EngineSettings::default()
    };
    let engine = QueueEngine::new(transport, engine_settings, tx);
    engine.start().expect("dispatcher starts once");

    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(Manager::new(
        engine.clone(),
        store.clone(),
        Arc::new(clock()),
        settings,
    ));
    let events = manager.subscribe();
    tokio::spawn(manager.clone().run(rx));
    Harness {
        engine,
        manager,
        store,
        events,
    }
}

async fn wait_for_changes(events: &mut broadcast::Receiver<ManagerEvent>, count: usize) {
    let mut seen = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen < count {
            if let Ok(ManagerEvent::SecurityDataChanged(_)) = events.recv().await {
                seen += 1;
            }
        }
    })
    .await
    .expect("security updates arrive");
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached");
}

#[tokio::test]
async fn long_history_is_split_and_merged_without_gaps() {
    let mut h = harness(
        ScriptedTransport::new(vec![ResolutionStep::FetchHistoricalBars]),
        ManagerSettings::default(),
    );
    h.manager.connect().unwrap();
    let security = h.manager.add_security("7203").unwrap();

    let request =
        Request::price_data(security, date(2015, 1, 1), date(2020, 6, 15), &clock()).unwrap();
    h.engine.submit_request(request).unwrap();
    wait_for_changes(&mut h.events, 2).await;

    let calls = h.engine.transport().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].start.date(), date(2015, 6, 15));
    assert_eq!(calls[0].end.date(), date(2020, 6, 15));
    assert_eq!(calls[1].start.date(), date(2015, 1, 1));
    assert_eq!(calls[1].end.date(), date(2015, 6, 29));

    let stored = h.store.get_security("7203", false).unwrap().unwrap();
    assert_eq!(
        stored.bars.len() as u32,
        weekdays_between(date(2015, 1, 1), date(2020, 6, 15))
    );
    assert!(stored.bars.windows(2).all(|pair| pair[0].date < pair[1].date));
    assert_eq!(h.engine.pending_count(), 0);
}

#[tokio::test]
async fn update_from_empty_cache_fetches_from_earliest_allowed_date() {
    let mut h = harness(
        ScriptedTransport::new(vec![ResolutionStep::FetchHistoricalBars]),
        ManagerSettings {
            earliest_allowed_date: date(2023, 1, 2),
            ..ManagerSettings::default()
        },
    );
    h.manager.connect().unwrap();
    let security = h.manager.add_security("ABC").unwrap();

    h.manager
        .update_security_price_data(&security, date(2024, 1, 5))
        .unwrap()
        .expect("a request is queued");
    wait_for_changes(&mut h.events, 2).await;

    let first = h.engine.transport().calls()[0].clone();
    assert_eq!(first.start.date(), date(2023, 1, 5));
    assert_eq!(first.end.date(), date(2024, 1, 5));

    let cached = h.manager.security("ABC").unwrap().unwrap();
    assert_eq!(cached.first_bar_date(), Some(date(2023, 1, 2)));
    assert_eq!(cached.last_bar_date(), Some(date(2024, 1, 5)));

    // Already current through as_of, so nothing is queued.
    let ids = h
        .manager
        .update_security_price_data_batch(&[cached.clone()], date(2024, 1, 5), false)
        .unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn resolution_steps_run_in_order_and_fill_the_security() {
    let mut transport = ScriptedTransport::new(vec![
        ResolutionStep::ResolveExchange,
        ResolutionStep::ResolveEarliestDate,
        ResolutionStep::FetchHistoricalBars,
    ]);
    transport.earliest = date(2024, 3, 4);
    let mut h = harness(transport, ManagerSettings::default());
    h.manager.connect().unwrap();
    let security = h.manager.add_security("XYZ").unwrap();

    let request =
        Request::price_data(security, date(2024, 1, 2), date(2024, 3, 8), &clock()).unwrap();
    h.engine.submit_request(request).unwrap();
    wait_for_changes(&mut h.events, 1).await;

    let steps: Vec<_> = h.engine.transport().calls().iter().map(|c| c.step).collect();
    assert_eq!(
        steps,
        vec![
            ResolutionStep::ResolveExchange,
            ResolutionStep::ResolveEarliestDate,
            ResolutionStep::FetchHistoricalBars,
        ]
    );
    let last_call = h.engine.transport().calls()[2].clone();
    assert_eq!(last_call.start.date(), date(2024, 3, 4));
    assert_eq!(last_call.security.exchange.as_deref(), Some("TSE"));

    let stored = h.store.get_security("XYZ", false).unwrap().unwrap();
    assert_eq!(stored.exchange.as_deref(), Some("TSE"));
    assert_eq!(stored.earliest_date, Some(date(2024, 3, 4)));
    assert_eq!(stored.bars.len(), 5);
}

#[tokio::test]
async fn connection_loss_pauses_until_reconnect() {
    let mut h = harness(
        ScriptedTransport::new(vec![ResolutionStep::FetchHistoricalBars])
            .failing(1, ErrorKind::ConnectionError),
        ManagerSettings::default(),
    );
    h.manager.connect().unwrap();
    let security = h.manager.add_security("NET").unwrap();
    let request =
        Request::price_data(security, date(2024, 1, 2), date(2024, 1, 5), &clock()).unwrap();
    h.engine.submit_request(request).unwrap();

    let engine = h.engine.clone();
    wait_until(move || !engine.session().connected).await;
    assert_eq!(h.engine.session().status, SessionStatus::ErrorState);
    assert_eq!(h.engine.pending_count(), 1);
    assert!(!h.engine.timer_running());

    h.manager.connect().unwrap();
    wait_for_changes(&mut h.events, 1).await;

    let calls = h.engine.transport().calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].step, ResolutionStep::FetchHistoricalBars);
    let stored = h.store.get_security("NET", false).unwrap().unwrap();
    assert_eq!(stored.bars.len(), 4);
}

#[tokio::test]
async fn invalid_security_is_dropped_when_auto_remove_is_on() {
    let h = harness(
        ScriptedTransport::new(vec![ResolutionStep::FetchHistoricalBars])
            .failing(usize::MAX, ErrorKind::InvalidSecurity),
        ManagerSettings {
            auto_remove_invalid: true,
            ..ManagerSettings::default()
        },
    );
    h.manager.connect().unwrap();
    let security = h.manager.add_security("GONE").unwrap();
    assert_eq!(h.manager.securities().unwrap().len(), 1);

    h.manager
        .update_security_price_data(&security, date(2024, 1, 5))
        .unwrap();

    let store = h.store.clone();
    wait_until(move || store.get_security("GONE", false).unwrap().is_none()).await;
    let manager = h.manager.clone();
    wait_until(move || manager.securities().unwrap().is_empty()).await;
}

#[tokio::test]
async fn batch_update_covers_every_stale_security() {
    let mut h = harness(
        ScriptedTransport::new(vec![ResolutionStep::FetchHistoricalBars]),
        ManagerSettings {
            earliest_allowed_date: date(2024, 1, 1),
            ..ManagerSettings::default()
        },
    );
    h.manager.connect().unwrap();
    for ticker in ["AAA", "BBB", "CCC"] {
        h.manager.add_security(ticker).unwrap();
    }
    let securities = h.manager.securities().unwrap();

    let ids = h
        .manager
        .update_security_price_data_batch(&securities, date(2024, 1, 31), false)
        .unwrap();
    assert_eq!(ids.len(), 3);
    wait_for_changes(&mut h.events, 3).await;

    for security in h.manager.securities().unwrap().iter() {
        assert_eq!(security.last_bar_date(), Some(date(2024, 1, 31)));
        assert!(!security.missing_data);
    }
    let manager = h.manager.clone();
    wait_until(move || manager.status() == SessionStatus::Ready).await;
}

#[test]
fn cached_security_round_trips_through_the_store() {
    let store = MemoryStore::new();
    let mut security = Security::new("rt");
    security.upsert_bars(weekday_bars(date(2024, 1, 1), date(2024, 1, 5)));
    assert!(store.set_security(&security, false).unwrap());
    let stored = store.get_security("RT", false).unwrap().unwrap();
    assert_eq!(stored.bars.len(), 5);
}
