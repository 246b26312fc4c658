//! Catalog feed file parsing (CSV v1, optional gzip wrapper).
//!
//! Malformed rows are recorded and skipped; the parse only aborts on
//! structural problems, the row-count cap or too many row errors.

use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::io::Read;
use thiserror::Error;

use crate::models::Compression;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("feed exceeds row limit of {limit}")]
    TooManyRows { limit: u64 },
    #[error("too many malformed rows ({count}), aborting parse")]
    TooManyRowErrors { count: u64 },
    #[error("feed file is not valid CSV: {0}")]
    Malformed(String),
    #[error("failed to decompress feed file: {0}")]
    Decompress(String),
}

/// Limits applied while parsing one feed file.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_row_count: u64,
    pub row_error_threshold: u64,
}

/// One usable catalog row.
#[derive(Debug, Clone)]
pub struct ParsedRow {
    pub row_number: u64,
    pub title: String,
    pub brand: Option<String>,
    pub url: Option<String>,
    pub attributes: Option<String>,
    pub price_cents: Option<i64>,
    pub upc: Option<String>,
    pub sku: Option<String>,
    pub asin: Option<String>,
    pub mpn: Option<String>,
}

/// A row that could not be used, kept for the run's error rows.
#[derive(Debug, Clone)]
pub struct RowError {
    pub row_number: u64,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ParseOutput {
    pub rows: Vec<ParsedRow>,
    pub errors: Vec<RowError>,
    pub rows_read: u64,
}

/// Unwrap the configured compression.
pub fn decompress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>, ParseError> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| ParseError::Decompress(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Recognized header names, all compared case-insensitively.
fn column_index(headers: &csv::StringRecord) -> HashMap<&'static str, usize> {
    let mut index = HashMap::new();
    for (i, name) in headers.iter().enumerate() {
        let key: Option<&'static str> = match name.trim().to_ascii_lowercase().as_str() {
            "name" | "productname" | "title" => Some("title"),
            "url" | "producturl" | "link" => Some("url"),
            "manufacturer" | "brand" => Some("brand"),
            "attributes" => Some("attributes"),
            "price" | "saleprice" | "retailprice" => Some("price"),
            "upc" | "upccode" | "gtin" => Some("upc"),
            "sku" | "retailersku" | "merchantsku" => Some("sku"),
            "asin" => Some("asin"),
            "mpn" | "manufacturerpartnumber" => Some("mpn"),
            _ => None,
        };
        if let Some(key) = key {
            index.entry(key).or_insert(i);
        }
    }
    index
}

fn field(record: &csv::StringRecord, index: &HashMap<&'static str, usize>, key: &str) -> Option<String> {
    index
        .get(key)
        .and_then(|&i| record.get(i))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Parse a price like "12.99", "$1,299.00" into cents.
fn parse_price_cents(raw: &str) -> Option<i64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * 100.0).round() as i64)
}

/// Parse a CSV v1 catalog file. The first record is the header.
pub fn parse_catalog_csv(bytes: &[u8], limits: &ParseLimits) -> Result<ParseOutput, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Malformed(e.to_string()))?
        .clone();
    let index = column_index(&headers);

    if !index.contains_key("title") {
        return Err(ParseError::Malformed(
            "no recognized product name column in header".to_string(),
        ));
    }

    let mut output = ParseOutput::default();
    let mut row_number: u64 = 1; // header was row 1

    for record in reader.records() {
        row_number += 1;
        output.rows_read += 1;

        if output.rows_read > limits.max_row_count {
            return Err(ParseError::TooManyRows {
                limit: limits.max_row_count,
            });
        }

        let record = match record {
            Ok(r) => r,
            Err(e) => {
                output.errors.push(RowError {
                    row_number,
                    message: format!("unreadable row: {}", e),
                });
                if output.errors.len() as u64 > limits.row_error_threshold {
                    return Err(ParseError::TooManyRowErrors {
                        count: output.errors.len() as u64,
                    });
                }
                continue;
            }
        };

        let Some(title) = field(&record, &index, "title") else {
            output.errors.push(RowError {
                row_number,
                message: "missing product name".to_string(),
            });
            if output.errors.len() as u64 > limits.row_error_threshold {
                return Err(ParseError::TooManyRowErrors {
                    count: output.errors.len() as u64,
                });
            }
            continue;
        };

        let price_cents = field(&record, &index, "price").and_then(|p| parse_price_cents(&p));

        output.rows.push(ParsedRow {
            row_number,
            title,
            brand: field(&record, &index, "brand"),
            url: field(&record, &index, "url"),
            attributes: field(&record, &index, "attributes"),
            price_cents,
            upc: field(&record, &index, "upc"),
            sku: field(&record, &index, "sku"),
            asin: field(&record, &index, "asin"),
            mpn: field(&record, &index, "mpn"),
        });
    }

    Ok(output)
}
