use std::collections::HashMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{AppError, Context, Result};
use crate::provider::{BatchCall, StepCall};
use crate::utils::compact_date;

/// Placeholder values for a single-security call.
pub fn step_placeholders(call: &StepCall) -> HashMap<String, String> {
    let mut values = range_placeholders(call.start.date(), call.end.date());
    let ticker = call.ticker();
    values.insert("symbol".to_string(), ticker.to_string());
    values.insert("symbol_lower".to_string(), ticker.to_lowercase());
    values.insert(
        "exchange".to_string(),
        call.security.exchange.clone().unwrap_or_default(),
    );
    values
}

/// Placeholder values for a batch call; `{symbols}` joins every member ticker.
pub fn batch_placeholders(call: &BatchCall, separator: &str) -> HashMap<String, String> {
    let mut values = range_placeholders(call.start.date(), call.end.date());
    let tickers = call.tickers();
    values.insert("symbols".to_string(), tickers.join(separator));
    values.insert(
        "symbols_lower".to_string(),
        tickers
            .iter()
            .map(|ticker| ticker.to_lowercase())
            .collect::<Vec<_>>()
            .join(separator),
    );
    values
}

fn range_placeholders(start: chrono::NaiveDate, end: chrono::NaiveDate) -> HashMap<String, String> {
    HashMap::from([
        ("start".to_string(), start.format("%Y-%m-%d").to_string()),
        ("end".to_string(), end.format("%Y-%m-%d").to_string()),
        ("start_compact".to_string(), compact_date(start)),
        ("end_compact".to_string(), compact_date(end)),
    ])
}

/// Substitute `{name}` placeholders. Unknown, empty or unterminated placeholders are errors.
pub fn render_template(template: &str, values: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '{' {
            result.push(ch);
            continue;
        }

        let mut key = String::new();
        let mut closed = false;
        for next in chars.by_ref() {
            if next == '}' {
                closed = true;
                break;
            }
            key.push(next);
        }

        if !closed {
            return Err(AppError::message(format!(
                "unterminated placeholder in template: {{{key}"
            )));
        }
        if key.is_empty() {
            return Err(AppError::message("empty placeholder `{}` in template"));
        }

        let value = values.get(&key).ok_or_else(|| {
            AppError::message(format!("no value for placeholder `{key}` in template"))
        })?;
        result.push_str(value);
    }

    Ok(result)
}

/// Expand `${VAR}` references from the process environment.
pub fn expand_env_vars(value: &str) -> Result<String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next();

        let mut name = String::new();
        let mut closed = false;
        for next in chars.by_ref() {
            if next == '}' {
                closed = true;
                break;
            }
            name.push(next);
        }

        if !closed {
            return Err(AppError::message(
                "unterminated environment placeholder in header",
            ));
        }
        if name.is_empty() {
            return Err(AppError::message("empty environment placeholder in header"));
        }

        let value = std::env::var(&name)
            .with_context(|| format!("environment variable {name} used by a header is not set"))?;
        result.push_str(&value);
    }

    Ok(result)
}

pub fn build_headers(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .with_context(|| format!("invalid header name: {key}"))?;
        let expanded = expand_env_vars(value)?;
        let header_value = HeaderValue::from_str(&expanded)
            .with_context(|| format!("invalid header value for {key}"))?;
        map.insert(name, header_value);
    }
    Ok(map)
}
