use std::io::Cursor;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::config::{
    CompanyEndpoint, ContractEndpoint, CsvHistoryColumns, HistoryFormat, JsonHistoryFields,
    SectorsEndpoint,
};
use crate::error::{AppError, Context, Result};
use crate::security::{CompanyInfo, ContractDetails, PriceBar, Sector};
use crate::utils::bar_in_window;

/// One decoded history row. `ticker` is only filled for multi-symbol responses.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
    pub ticker: Option<String>,
    pub bar: PriceBar,
}

pub fn decode_history(body: &str, format: &HistoryFormat) -> Result<Vec<HistoryRow>> {
    let mut rows = match format {
        HistoryFormat::Csv(columns) => decode_csv_history(body, columns)?,
        HistoryFormat::Json(fields) => decode_json_history(body, fields)?,
    };
    rows.sort_by(|a, b| a.bar.date.cmp(&b.bar.date));
    Ok(rows)
}

/// Keep bars inside `[from, to]`, sorted by date.
pub fn bars_in_range(
    rows: Vec<HistoryRow>,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Vec<PriceBar> {
    let mut bars: Vec<PriceBar> = rows
        .into_iter()
        .map(|row| row.bar)
        .filter(|bar| bar_in_window(bar.date, start, end))
        .collect();
    bars.sort_by(|a, b| a.date.cmp(&b.date));
    bars
}

fn decode_csv_history(body: &str, columns: &CsvHistoryColumns) -> Result<Vec<HistoryRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(columns.has_headers)
        .delimiter(columns.delimiter as u8)
        .flexible(true)
        .from_reader(Cursor::new(body.as_bytes()));

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.context("failed to read history record")?;
        let field = |idx: usize| record.get(idx).map(str::trim).filter(|s| !s.is_empty());
        let number = |idx: usize| field(idx).and_then(parse_f64);

        let Some(date) = field(columns.date)
            .and_then(|text| NaiveDate::parse_from_str(text, &columns.date_format).ok())
        else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            number(columns.open),
            number(columns.high),
            number(columns.low),
            number(columns.close),
        ) else {
            continue;
        };
        let volume = columns.volume.and_then(number).unwrap_or(0.0);
        let ticker = columns.ticker.and_then(field).map(normalize_ticker);

        rows.push(HistoryRow {
            ticker,
            bar: PriceBar::new(date, open, high, low, close, volume),
        });
    }
    Ok(rows)
}

fn decode_json_history(body: &str, fields: &JsonHistoryFields) -> Result<Vec<HistoryRow>> {
    let root: Value = serde_json::from_str(body).context("history response is not JSON")?;
    let rows = walk_json_path(&root, &fields.rows_path)?
        .as_array()
        .ok_or_else(|| AppError::message("history rows are not a JSON array"))?;

    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        let number = |key: &str| row.get(key).and_then(json_to_f64);
        let Some(date) = row
            .get(&fields.date)
            .map(value_to_string)
            .and_then(|text| NaiveDate::parse_from_str(text.trim(), &fields.date_format).ok())
        else {
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (
            number(&fields.open),
            number(&fields.high),
            number(&fields.low),
            number(&fields.close),
        ) else {
            continue;
        };
        let volume = fields
            .volume
            .as_deref()
            .and_then(|key| number(key))
            .unwrap_or(0.0);
        let ticker = fields
            .ticker
            .as_deref()
            .and_then(|key| row.get(key))
            .map(value_to_string)
            .filter(|text| !text.is_empty())
            .map(|text| normalize_ticker(&text));

        decoded.push(HistoryRow {
            ticker,
            bar: PriceBar::new(date, open, high, low, close, volume),
        });
    }
    Ok(decoded)
}

pub fn decode_company(body: &str, endpoint: &CompanyEndpoint) -> Result<CompanyInfo> {
    let root: Value = serde_json::from_str(body).context("company response is not JSON")?;
    let node = walk_json_path(&root, &endpoint.root_path)?;
    Ok(CompanyInfo {
        name: string_field(node, endpoint.name.as_deref()),
        sector: string_field(node, endpoint.sector.as_deref()),
        industry: string_field(node, endpoint.industry.as_deref()),
        exchange: string_field(node, endpoint.exchange.as_deref()),
    })
}

pub fn decode_contract(body: &str, endpoint: &ContractEndpoint) -> Result<ContractDetails> {
    let root: Value = serde_json::from_str(body).context("contract response is not JSON")?;
    let node = walk_json_path(&root, &endpoint.root_path)?;
    let contract_id = endpoint
        .contract_id
        .as_deref()
        .and_then(|key| node.get(key))
        .and_then(|value| match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
    Ok(ContractDetails {
        exchange: string_field(node, endpoint.exchange.as_deref()),
        primary_exchange: string_field(node, endpoint.primary_exchange.as_deref()),
        currency: string_field(node, endpoint.currency.as_deref()),
        long_name: string_field(node, endpoint.long_name.as_deref()),
        contract_id,
    })
}

pub fn decode_sectors(body: &str, endpoint: &SectorsEndpoint) -> Result<Vec<Sector>> {
    let root: Value = serde_json::from_str(body).context("sectors response is not JSON")?;
    let rows = walk_json_path(&root, &endpoint.rows_path)?
        .as_array()
        .ok_or_else(|| AppError::message("sector rows are not a JSON array"))?;

    let mut sectors: Vec<Sector> = rows
        .iter()
        .filter_map(|row| {
            let name = string_field(row, Some(endpoint.name.as_str()))?;
            let industries = endpoint
                .industries
                .as_deref()
                .and_then(|key| row.get(key))
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(value_to_string)
                        .filter(|item| !item.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            Some(Sector { name, industries })
        })
        .collect();
    sectors.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sectors)
}

pub fn walk_json_path<'a>(root: &'a Value, path: &[String]) -> Result<&'a Value> {
    let mut cursor = root;
    for key in path {
        cursor = match cursor {
            Value::Array(items) => key.parse::<usize>().ok().and_then(|idx| items.get(idx)),
            other => other.get(key),
        }
        .ok_or_else(|| AppError::message(format!("missing key `{key}` while navigating JSON path")))?;
    }
    Ok(cursor)
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_field(node: &Value, key: Option<&str>) -> Option<String> {
    key.and_then(|key| node.get(key))
        .map(value_to_string)
        .filter(|text| !text.is_empty())
}

fn json_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_f64(s),
        _ => None,
    }
}

pub fn parse_f64(value: &str) -> Option<f64> {
    value.trim().replace(',', "").parse::<f64>().ok()
}

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}
