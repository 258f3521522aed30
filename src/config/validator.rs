use crate::error::{AppError, Result};

use super::{HistoryEndpoint, HistoryFormat, HttpProviderConfig, ListingFormat, Settings};

/// Validate settings, reporting every problem at once.
pub fn validate_settings(settings: &Settings) -> Result<()> {
    let mut issues = Vec::new();

    validate_provider(settings, &mut issues);
    validate_manager(settings, &mut issues);
    validate_market(settings, &mut issues);

    if issues.is_empty() {
        Ok(())
    } else {
        Err(AppError::message(format!(
            "settings invalid:\n  - {}",
            issues.join("\n  - ")
        )))
    }
}

fn validate_provider(settings: &Settings, issues: &mut Vec<String>) {
    let provider = &settings.provider;
    if provider.poll_interval_ms == 0 {
        issues.push("provider.poll_interval_ms must be greater than zero".to_string());
    }
    if provider.max_window_days < 1 {
        issues.push("provider.max_window_days must be at least 1".to_string());
    }
    if provider.partition_buffer_days < 0 {
        issues.push("provider.partition_buffer_days must not be negative".to_string());
    }
    if provider.batch_max_symbols == 0 {
        issues.push("provider.batch_max_symbols must be greater than zero".to_string());
    }
    validate_http(&provider.http, issues);
}

fn validate_http(http: &HttpProviderConfig, issues: &mut Vec<String>) {
    if http.name.trim().is_empty() {
        issues.push("provider.http.name must not be empty".to_string());
    }
    validate_history(&http.history, "provider.http.history", issues);

    if let Some(batch) = &http.batch_history {
        validate_history(batch, "provider.http.batch_history", issues);
        if !batch.url_template.contains("{symbols}") {
            issues.push(
                "provider.http.batch_history.url_template must use the {symbols} placeholder"
                    .to_string(),
            );
        }
        let has_ticker = match &batch.format {
            HistoryFormat::Csv(columns) => columns.ticker.is_some(),
            HistoryFormat::Json(fields) => fields.ticker.is_some(),
        };
        if !has_ticker {
            issues.push("provider.http.batch_history.format must name a ticker column".to_string());
        }
    }

    if let Some(company) = &http.company {
        if company.url_template.trim().is_empty() {
            issues.push("provider.http.company.url_template must not be empty".to_string());
        }
    }
    if let Some(contract) = &http.contract {
        if contract.url_template.trim().is_empty() {
            issues.push("provider.http.contract.url_template must not be empty".to_string());
        }
    }
    if let Some(sectors) = &http.sectors {
        if sectors.url.trim().is_empty() || sectors.name.trim().is_empty() {
            issues.push("provider.http.sectors needs a url and a name field".to_string());
        }
    }

    for (idx, listing) in http.listings.iter().enumerate() {
        if listing.url.trim().is_empty() {
            issues.push(format!("provider.http.listings[{idx}].url must not be empty"));
        }
        if let ListingFormat::Xlsx { sheet, .. } = &listing.format {
            if sheet.trim().is_empty() {
                issues.push(format!("provider.http.listings[{idx}].sheet must not be empty"));
            }
        }
    }
}

fn validate_history(endpoint: &HistoryEndpoint, label: &str, issues: &mut Vec<String>) {
    if endpoint.url_template.trim().is_empty() {
        issues.push(format!("{label}.url_template must not be empty"));
    }
    let date_format = match &endpoint.format {
        HistoryFormat::Csv(columns) => &columns.date_format,
        HistoryFormat::Json(fields) => &fields.date_format,
    };
    if date_format.trim().is_empty() {
        issues.push(format!("{label}.format.date_format must not be empty"));
    }
}

fn validate_manager(settings: &Settings, issues: &mut Vec<String>) {
    let manager = &settings.manager;
    if manager.zero_volume_run == 0 {
        issues.push("manager.zero_volume_run must be greater than zero".to_string());
    }
    if manager.zero_volume_run > manager.zero_volume_lookback {
        issues.push(format!(
            "manager.zero_volume_run ({}) cannot exceed manager.zero_volume_lookback ({})",
            manager.zero_volume_run, manager.zero_volume_lookback
        ));
    }
}

fn validate_market(settings: &Settings, issues: &mut Vec<String>) {
    if settings.clock().is_err() {
        issues.push(format!(
            "market hours are invalid (offset {} min, close {:02}:{:02})",
            settings.market.utc_offset_minutes,
            settings.market.close_hour,
            settings.market.close_minute
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_settings(&Settings::default()).is_ok());
    }

    #[test]
    fn aggregates_every_issue() {
        let mut settings = Settings::default();
        settings.provider.poll_interval_ms = 0;
        settings.provider.batch_max_symbols = 0;
        settings.manager.zero_volume_run = 30;
        settings.market.close_hour = 25;

        let message = validate_settings(&settings).unwrap_err().to_string();
        assert!(message.contains("poll_interval_ms"));
        assert!(message.contains("batch_max_symbols"));
        assert!(message.contains("zero_volume_run"));
        assert!(message.contains("market hours"));
        assert_eq!(message.matches("\n  - ").count(), 4);
    }

    #[test]
    fn huge_utc_offset_is_reported() {
        let mut settings = Settings::default();
        settings.market.utc_offset_minutes = i32::MAX;

        let message = validate_settings(&settings).unwrap_err().to_string();
        assert!(message.contains("market hours"));
    }

    #[test]
    fn batch_endpoint_needs_symbols_placeholder_and_ticker() {
        let mut settings = Settings::default();
        settings.provider.http.batch_history = Some(settings.provider.http.history.clone());

        let message = validate_settings(&settings).unwrap_err().to_string();
        assert!(message.contains("{symbols}"));
        assert!(message.contains("ticker column"));
    }
}
