//! Generic HTTP backend driven by [`HttpProviderConfig`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use tokio::time::sleep;

use crate::config::HttpProviderConfig;
use crate::error::{AppError, Result};
use crate::request::{ErrorKind, Request, RequestId, RequestKind, ResolutionStep};

use super::{
    BatchCall, EventSink, OutcomeSink, ProviderEvent, SectorsResponse, StepCall, StepFailure,
    StepPayload, StepTransport, SymbolsResponse,
};

pub mod decode;
pub mod listing;
pub mod request;

use decode::{bars_in_range, decode_company, decode_contract, decode_history, decode_sectors};
use request::{batch_placeholders, build_headers, render_template, step_placeholders};

/// How a response status is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    UnknownSecurity,
    Rejected,
    Retry,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        StatusClass::Success
    } else if status == StatusCode::NOT_FOUND {
        StatusClass::UnknownSecurity
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Retry
    } else {
        StatusClass::Rejected
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^attempt`.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(2_u64.saturating_pow(attempt)))
}

struct Shared {
    config: HttpProviderConfig,
    client: Client,
    headers: HeaderMap,
}

pub struct HttpTransport {
    shared: Arc<Shared>,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(config: HttpProviderConfig) -> Result<Self> {
        let headers = build_headers(&config.headers)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                client,
                headers,
            }),
            connected: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &HttpProviderConfig {
        &self.shared.config
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
                true
            }
            Err(err) => {
                warn!("{}: no async runtime for provider call: {err}", self.name());
                false
            }
        }
    }
}

impl Shared {
    /// GET with retry on transport errors, 429 and 5xx.
    async fn get_text(&self, url: &str) -> std::result::Result<String, StepFailure> {
        let max_retries = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let failure = match self
                .client
                .get(url)
                .headers(self.headers.clone())
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    match classify_status(status) {
                        StatusClass::Success => {
                            return response.text().await.map_err(|err| {
                                StepFailure::new(
                                    ErrorKind::ConnectionError,
                                    format!("failed to read body from {url}: {err}"),
                                )
                            });
                        }
                        StatusClass::UnknownSecurity => {
                            return Err(StepFailure::new(
                                ErrorKind::InvalidSecurity,
                                format!("{url} returned {status}"),
                            ));
                        }
                        StatusClass::Rejected => {
                            return Err(StepFailure::new(
                                ErrorKind::InvalidRequest,
                                format!("{url} returned {status}"),
                            ));
                        }
                        StatusClass::Retry => format!("{url} returned {status}"),
                    }
                }
                Err(err) => format!("request to {url} failed: {err}"),
            };

            if attempt >= max_retries {
                return Err(StepFailure::new(
                    ErrorKind::ConnectionError,
                    format!("{failure} (gave up after {attempt} attempts)"),
                ));
            }
            debug!("{failure}; retry {attempt}/{max_retries}");
            sleep(backoff_delay(self.config.retry_base_delay_ms, attempt)).await;
        }
    }

    async fn run_step(&self, call: &StepCall) -> std::result::Result<StepPayload, StepFailure> {
        let values = step_placeholders(call);
        match call.step {
            ResolutionStep::FetchHistoricalBars => {
                let endpoint = &self.config.history;
                let url = render(&endpoint.url_template, &values)?;
                let body = self.get_text(&url).await?;
                if is_no_data(&body, endpoint.no_data_marker.as_deref()) {
                    return Err(StepFailure::new(
                        ErrorKind::InvalidSecurity,
                        format!("no data for {}", call.ticker()),
                    ));
                }
                let rows = decode_history(&body, &endpoint.format).map_err(system_error)?;
                Ok(StepPayload::Bars(bars_in_range(rows, call.start, call.end)))
            }
            ResolutionStep::FetchCompanyInfo => {
                let endpoint = self.config.company.as_ref().ok_or_else(unsupported)?;
                let url = render(&endpoint.url_template, &values)?;
                let body = self.get_text(&url).await?;
                decode_company(&body, endpoint)
                    .map(StepPayload::CompanyInfo)
                    .map_err(system_error)
            }
            ResolutionStep::FetchContractDetails => {
                let endpoint = self.config.contract.as_ref().ok_or_else(unsupported)?;
                let url = render(&endpoint.url_template, &values)?;
                let body = self.get_text(&url).await?;
                decode_contract(&body, endpoint)
                    .map(StepPayload::ContractDetails)
                    .map_err(system_error)
            }
            ResolutionStep::ResolveExchange | ResolutionStep::ResolveEarliestDate => {
                Err(unsupported())
            }
        }
    }

    async fn run_batch(&self, call: &BatchCall, sink: &OutcomeSink) {
        let outcome: std::result::Result<Vec<decode::HistoryRow>, StepFailure> = async {
            let endpoint = self.config.batch_history.as_ref().ok_or_else(unsupported)?;
            let values = batch_placeholders(call, &self.config.symbols_separator);
            let url = render(&endpoint.url_template, &values)?;
            let body = self.get_text(&url).await?;
            decode_history(&body, &endpoint.format).map_err(system_error)
        }
        .await;

        for (id, result) in demux_batch(call, outcome) {
            sink.finish(id, result);
        }
    }
}

/// Split one multi-symbol history response back into a result per batch
/// member. A failed call fails every member; a member without rows is unknown
/// to the provider.
pub(crate) fn demux_batch(
    call: &BatchCall,
    outcome: std::result::Result<Vec<decode::HistoryRow>, StepFailure>,
) -> Vec<(RequestId, std::result::Result<StepPayload, StepFailure>)> {
    let rows = match outcome {
        Ok(rows) => rows,
        Err(failure) => {
            return call
                .members
                .iter()
                .map(|member| (member.id, Err(failure.clone())))
                .collect();
        }
    };

    let mut by_ticker: HashMap<String, Vec<decode::HistoryRow>> = HashMap::new();
    for row in rows {
        if let Some(ticker) = row.ticker.clone() {
            by_ticker.entry(ticker).or_default().push(row);
        }
    }

    call.members
        .iter()
        .map(|member| {
            let result = match by_ticker.remove(&member.security.ticker) {
                Some(rows) => Ok(StepPayload::Bars(bars_in_range(rows, call.start, call.end))),
                None => Err(StepFailure::new(
                    ErrorKind::InvalidSecurity,
                    format!("batch response had no rows for {}", member.security.ticker),
                )),
            };
            (member.id, result)
        })
        .collect()
}

fn render(
    template: &str,
    values: &HashMap<String, String>,
) -> std::result::Result<String, StepFailure> {
    render_template(template, values)
        .map_err(|err| StepFailure::new(ErrorKind::InvalidRequest, err.to_string()))
}

fn system_error(err: AppError) -> StepFailure {
    StepFailure::new(ErrorKind::SystemError, format!("failed to decode response: {err}"))
}

fn unsupported() -> StepFailure {
    StepFailure::new(
        ErrorKind::InvalidRequest,
        "step is not configured for this provider",
    )
}

fn is_no_data(body: &str, marker: Option<&str>) -> bool {
    marker.is_some_and(|marker| body.trim().eq_ignore_ascii_case(marker))
}

impl StepTransport for HttpTransport {
    fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn plan(&self, request: &Request) -> Vec<ResolutionStep> {
        match request.kind() {
            RequestKind::PriceData | RequestKind::VolumeData => {
                vec![ResolutionStep::FetchHistoricalBars]
            }
            RequestKind::ContractData if self.shared.config.contract.is_some() => {
                vec![ResolutionStep::FetchContractDetails]
            }
            RequestKind::CompanyInfo if self.shared.config.company.is_some() => {
                vec![ResolutionStep::FetchCompanyInfo]
            }
            RequestKind::ContractData | RequestKind::CompanyInfo => Vec::new(),
        }
    }

    fn supports(&self, step: ResolutionStep) -> bool {
        match step {
            ResolutionStep::FetchHistoricalBars => true,
            ResolutionStep::FetchContractDetails => self.shared.config.contract.is_some(),
            ResolutionStep::FetchCompanyInfo => self.shared.config.company.is_some(),
            ResolutionStep::ResolveExchange | ResolutionStep::ResolveEarliestDate => false,
        }
    }

    fn execute(&self, call: StepCall, sink: OutcomeSink) {
        let shared = Arc::clone(&self.shared);
        let id = call.id;
        let fallback = sink.clone();
        let spawned = self.spawn(async move {
            let result = shared.run_step(&call).await;
            sink.finish(call.id, result);
        });
        if !spawned {
            fallback.fail(id, ErrorKind::SystemError, "no async runtime available");
        }
    }

    fn supports_batch(&self, kind: RequestKind) -> bool {
        kind.is_historical() && self.shared.config.batch_history.is_some()
    }

    fn execute_batch(&self, call: BatchCall, sink: OutcomeSink) {
        let shared = Arc::clone(&self.shared);
        let ids: Vec<_> = call.members.iter().map(|member| member.id).collect();
        let fallback = sink.clone();
        let spawned = self.spawn(async move {
            shared.run_batch(&call, &sink).await;
        });
        if !spawned {
            for id in ids {
                fallback.fail(id, ErrorKind::SystemError, "no async runtime available");
            }
        }
    }

    fn supported_symbols(&self, events: EventSink) {
        let shared = Arc::clone(&self.shared);
        let provider = self.name().to_string();
        let fallback = events.clone();
        let spawned = self.spawn(async move {
            let downloads = shared
                .config
                .listings
                .iter()
                .map(|source| listing::fetch_listing(&shared.client, source));
            let mut lists = Vec::new();
            let mut errors = Vec::new();
            for result in join_all(downloads).await {
                match result {
                    Ok(list) => lists.push(list),
                    Err(err) => errors.push(err.to_string()),
                }
            }

            let error = if shared.config.listings.is_empty() {
                Some(format!("{provider} has no symbol listing"))
            } else if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            };
            let response = SymbolsResponse {
                provider,
                symbols: listing::merge_listings(lists),
                error,
            };
            let _ = events.send(ProviderEvent::SupportedSymbolsResponse(response));
        });
        if !spawned {
            let _ = fallback.send(ProviderEvent::SupportedSymbolsResponse(SymbolsResponse {
                provider: self.name().to_string(),
                symbols: Vec::new(),
                error: Some("no async runtime available".to_string()),
            }));
        }
    }

    fn sectors(&self, events: EventSink) {
        let Some(endpoint) = self.shared.config.sectors.clone() else {
            let _ = events.send(ProviderEvent::SectorsResponse(SectorsResponse {
                provider: self.name().to_string(),
                sectors: Vec::new(),
                error: Some(format!("{} has no sector listing", self.name())),
            }));
            return;
        };

        let shared = Arc::clone(&self.shared);
        let provider = self.name().to_string();
        let fallback = events.clone();
        let spawned = self.spawn(async move {
            let result = match shared.get_text(&endpoint.url).await {
                Ok(body) => decode_sectors(&body, &endpoint).map_err(|err| err.to_string()),
                Err(failure) => Err(failure.message),
            };
            let response = match result {
                Ok(sectors) => SectorsResponse {
                    provider,
                    sectors,
                    error: None,
                },
                Err(error) => SectorsResponse {
                    provider,
                    sectors: Vec::new(),
                    error: Some(error),
                },
            };
            let _ = events.send(ProviderEvent::SectorsResponse(response));
        });
        if !spawned {
            let _ = fallback.send(ProviderEvent::SectorsResponse(SectorsResponse {
                provider: self.name().to_string(),
                sectors: Vec::new(),
                error: Some("no async runtime available".to_string()),
            }));
        }
    }
}
