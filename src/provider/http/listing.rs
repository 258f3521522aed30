use std::collections::HashSet;
use std::io::Cursor;

use calamine::{Data, Reader, Xlsx};
use reqwest::Client;

use crate::config::{ListingFormat, ListingSource};
use crate::error::{AppError, Context, Result};
use crate::security::SymbolListing;

use super::decode::normalize_ticker;

/// Download one listing source and decode it.
pub async fn fetch_listing(client: &Client, source: &ListingSource) -> Result<Vec<SymbolListing>> {
    let response = client
        .get(&source.url)
        .send()
        .await
        .with_context(|| format!("failed to request listing {}", source.url))?;

    if !response.status().is_success() {
        return Err(AppError::message(format!(
            "listing request {} failed with status {}",
            source.url,
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .with_context(|| format!("failed to read listing payload from {}", source.url))?;
    decode_listing(&bytes, source)
}

pub fn decode_listing(bytes: &[u8], source: &ListingSource) -> Result<Vec<SymbolListing>> {
    let mut entries = match &source.format {
        ListingFormat::Csv {
            ticker_column,
            name_column,
            exchange_column,
            has_headers,
        } => decode_csv_listing(
            bytes,
            *ticker_column,
            *name_column,
            *exchange_column,
            *has_headers,
        )?,
        ListingFormat::Xlsx {
            sheet,
            ticker_column,
            name_column,
            skip_rows,
        } => decode_xlsx_listing(bytes, sheet, *ticker_column, *name_column, *skip_rows)?,
    };

    for entry in &mut entries {
        if entry.exchange.is_none() {
            entry.exchange = source.exchange.clone();
        }
    }
    Ok(entries)
}

/// Merge listings from several sources, first occurrence of a ticker wins.
pub fn merge_listings(sources: Vec<Vec<SymbolListing>>) -> Vec<SymbolListing> {
    let mut seen = HashSet::new();
    let mut merged: Vec<SymbolListing> = sources
        .into_iter()
        .flatten()
        .filter(|entry| seen.insert(entry.ticker.clone()))
        .collect();
    merged.sort_by(|a, b| a.ticker.cmp(&b.ticker));
    merged
}

fn decode_csv_listing(
    bytes: &[u8],
    ticker_column: usize,
    name_column: usize,
    exchange_column: Option<usize>,
    has_headers: bool,
) -> Result<Vec<SymbolListing>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_headers)
        .flexible(true)
        .from_reader(Cursor::new(bytes));

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for result in reader.records() {
        let record = result.context("failed to read listing record")?;
        let field = |idx: usize| record.get(idx).map(str::trim).filter(|s| !s.is_empty());
        let (Some(ticker), Some(name)) = (field(ticker_column), field(name_column)) else {
            continue;
        };
        let ticker = normalize_ticker(ticker);
        if seen.insert(ticker.clone()) {
            entries.push(SymbolListing {
                ticker,
                name: name.to_string(),
                exchange: exchange_column.and_then(field).map(str::to_string),
            });
        }
    }
    Ok(entries)
}

fn decode_xlsx_listing(
    bytes: &[u8],
    sheet: &str,
    ticker_column: usize,
    name_column: usize,
    skip_rows: usize,
) -> Result<Vec<SymbolListing>> {
    let mut workbook =
        Xlsx::new(Cursor::new(bytes)).context("failed to parse listing workbook")?;
    let range = workbook
        .worksheet_range(sheet)
        .with_context(|| format!("sheet {sheet} not found in listing workbook"))?;

    let mut seen = HashSet::new();
    let mut entries = Vec::new();
    for row in range.rows().skip(skip_rows) {
        let Some(ticker) = row.get(ticker_column).and_then(format_code) else {
            continue;
        };
        let Some(name) = row.get(name_column).and_then(cell_to_string) else {
            continue;
        };
        if seen.insert(ticker.clone()) {
            entries.push(SymbolListing {
                ticker,
                name,
                exchange: None,
            });
        }
    }
    Ok(entries)
}

fn cell_to_string(cell: &Data) -> Option<String> {
    match cell {
        Data::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Data::Float(f) => Some(format_number(*f)),
        Data::Int(i) => Some(i.to_string()),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(value) => Some(value.to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
        Data::Empty | Data::Error(_) => None,
    }
}

/// Numeric exchange codes lose their leading zeros in spreadsheets.
fn format_code(cell: &Data) -> Option<String> {
    match cell {
        Data::String(s) => Some(normalize_ticker(s)).filter(|s| !s.is_empty()),
        Data::Float(f) if f.is_finite() => Some(pad_code(*f as i64)),
        Data::Int(i) => Some(pad_code(*i)),
        _ => None,
    }
}

fn pad_code(value: i64) -> String {
    if value >= 10000 {
        value.to_string()
    } else {
        format!("{value:04}")
    }
}

fn format_number(value: f64) -> String {
    if value.fract().abs() < f64::EPSILON {
        pad_code(value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_source(exchange: Option<&str>) -> ListingSource {
        ListingSource {
            url: "https://example.test/symbols.csv".to_string(),
            exchange: exchange.map(str::to_string),
            format: ListingFormat::Csv {
                ticker_column: 0,
                name_column: 1,
                exchange_column: Some(2),
                has_headers: true,
            },
        }
    }

    #[test]
    fn decodes_csv_listing_with_default_exchange() {
        let body = b"Symbol,Name,Exchange\naapl,Apple Inc.,NASDAQ\nIBM,International Business Machines,\nAAPL,Duplicate,NYSE\n,Nameless,\n";
        let entries = decode_listing(body, &csv_source(Some("NYSE"))).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ticker, "AAPL");
        assert_eq!(entries[0].exchange.as_deref(), Some("NASDAQ"));
        assert_eq!(entries[1].ticker, "IBM");
        assert_eq!(entries[1].exchange.as_deref(), Some("NYSE"));
    }

    #[test]
    fn merges_sources_keeping_first_ticker() {
        let first = vec![SymbolListing {
            ticker: "BBB".to_string(),
            name: "First".to_string(),
            exchange: None,
        }];
        let second = vec![
            SymbolListing {
                ticker: "BBB".to_string(),
                name: "Second".to_string(),
                exchange: None,
            },
            SymbolListing {
                ticker: "AAA".to_string(),
                name: "Other".to_string(),
                exchange: None,
            },
        ];
        let merged = merge_listings(vec![first, second]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].ticker, "AAA");
        assert_eq!(merged[1].name, "First");
    }

    #[test]
    fn spreadsheet_codes_are_padded() {
        assert_eq!(format_code(&Data::Float(1301.0)).as_deref(), Some("1301"));
        assert_eq!(format_code(&Data::Int(25)).as_deref(), Some("0025"));
        assert_eq!(format_code(&Data::String(" 130a ".into())).as_deref(), Some("130A"));
        assert_eq!(format_code(&Data::Empty), None);
        assert_eq!(cell_to_string(&Data::Float(2.5)).as_deref(), Some("2.5"));
    }

    #[test]
    fn garbage_workbook_is_an_error() {
        let source = ListingSource {
            url: String::new(),
            exchange: None,
            format: ListingFormat::Xlsx {
                sheet: "Sheet1".to_string(),
                ticker_column: 1,
                name_column: 2,
                skip_rows: 1,
            },
        };
        assert!(decode_listing(b"not a zip", &source).is_err());
    }
}
