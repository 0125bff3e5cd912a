//! Source adapter contract + the semicolon CSV adapter for the daily test dataset.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use covid_core::{parse_day, DailyRecord};
use covid_storage::{FetchError, HttpFetcher};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "covid-adapters";

/// Column layout of the published file: department, day, positives, total,
/// age class, population.
pub const EXPECTED_CSV_HEADERS: [&str; 6] = ["dep", "jour", "P", "T", "cl_age90", "pop"];

const COL_DEPARTMENT: usize = 0;
const COL_DAY: usize = 1;
const COL_POSITIVE: usize = 2;
const COL_TOTAL: usize = 3;
const COL_AGE: usize = 4;
const COL_POPULATION: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum SourceLocation {
    Http(String),
    File(PathBuf),
}

impl SourceLocation {
    /// `http(s)://` URLs are downloaded; anything else is read from disk, with an
    /// optional `file://` prefix.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Self::Http(trimmed.to_string());
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        Self::File(PathBuf::from(path))
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => f.write_str(url),
            Self::File(path) => write!(f, "file://{}", path.display()),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("unable to read csv file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Format(String),
}

/// A data row that could not be turned into a [`DailyRecord`]. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unable to parse csv row (line {line}): {message}")]
pub struct RowParseError {
    pub line: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedCsv {
    pub records: Vec<DailyRecord>,
    pub row_errors: Vec<RowParseError>,
    pub rows_read: usize,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn location(&self) -> &SourceLocation;

    async fn fetch_raw(&self) -> Result<Vec<u8>, IngestError>;

    fn parse(&self, raw: &[u8]) -> Result<ParsedCsv, IngestError> {
        parse_csv(raw)
    }
}

/// Daily department test counts published as a semicolon CSV, either over HTTP
/// or from a local copy.
#[derive(Debug, Clone)]
pub struct CsvSource {
    location: SourceLocation,
    http: HttpFetcher,
}

impl CsvSource {
    pub fn new(location: SourceLocation, http: HttpFetcher) -> Self {
        Self { location, http }
    }
}

#[async_trait]
impl RecordSource for CsvSource {
    fn location(&self) -> &SourceLocation {
        &self.location
    }

    async fn fetch_raw(&self) -> Result<Vec<u8>, IngestError> {
        match &self.location {
            SourceLocation::Http(url) => Ok(self.http.fetch_bytes(url).await?.body),
            SourceLocation::File(path) => {
                tokio::fs::read(path)
                    .await
                    .map_err(|source| IngestError::Io {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

pub fn is_csv_header_valid(headers: &StringRecord) -> bool {
    if headers.len() != EXPECTED_CSV_HEADERS.len() {
        return false;
    }
    headers
        .iter()
        .enumerate()
        .all(|(i, header)| {
            let header = if i == 0 {
                header.trim_start_matches('\u{feff}')
            } else {
                header
            };
            header == EXPECTED_CSV_HEADERS[i]
        })
}

/// Parse the whole file. Only a missing or unexpected header is fatal; rows that
/// fail to parse are logged, collected in [`ParsedCsv::row_errors`] and skipped.
pub fn parse_csv(raw: &[u8]) -> Result<ParsedCsv, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(raw);
    let mut rows = reader.records();

    let headers = match rows.next() {
        None => return Err(IngestError::Format("empty csv file".into())),
        Some(Err(err)) => {
            return Err(IngestError::Format(format!(
                "unable to parse csv headers: {err}"
            )))
        }
        Some(Ok(headers)) => headers,
    };
    if !is_csv_header_valid(&headers) {
        return Err(IngestError::Format(
            "invalid csv headers - this csv format is not supported".into(),
        ));
    }

    let mut parsed = ParsedCsv::default();
    for (idx, result) in rows.enumerate() {
        let fallback_line = idx as u64 + 2;
        parsed.rows_read += 1;

        let outcome = match result {
            Ok(row) => {
                let line = row.position().map(|p| p.line()).unwrap_or(fallback_line);
                parse_csv_row(&row).map_err(|message| RowParseError { line, message })
            }
            Err(err) => Err(RowParseError {
                line: err.position().map(|p| p.line()).unwrap_or(fallback_line),
                message: err.to_string(),
            }),
        };

        match outcome {
            Ok(record) => parsed.records.push(record),
            Err(err) => {
                warn!(line = err.line, error = %err.message, "unable to parse csv row");
                parsed.row_errors.push(err);
            }
        }
    }
    Ok(parsed)
}

fn parse_csv_row(row: &StringRecord) -> Result<DailyRecord, String> {
    if row.len() != EXPECTED_CSV_HEADERS.len() {
        return Err(format!(
            "expected {} fields, found {}",
            EXPECTED_CSV_HEADERS.len(),
            row.len()
        ));
    }

    let day_raw = &row[COL_DAY];
    let day = parse_day(day_raw).map_err(|e| format!("invalid day ({day_raw}): {e}"))?;

    let age_raw = &row[COL_AGE];
    let age_category = age_raw
        .parse::<i32>()
        .map_err(|e| format!("invalid age category ({age_raw}): {e}"))?;

    let total_raw = &row[COL_TOTAL];
    let tests_total = total_raw
        .parse::<i64>()
        .map_err(|e| format!("invalid total tests ({total_raw}): {e}"))?;

    let positive_raw = &row[COL_POSITIVE];
    let tests_positive = positive_raw
        .parse::<i64>()
        .map_err(|e| format!("invalid positive tests ({positive_raw}): {e}"))?;

    let population = parse_population(&row[COL_POPULATION])?;

    Ok(DailyRecord {
        department: row[COL_DEPARTMENT].to_string(),
        day,
        age_category,
        tests_total,
        tests_positive,
        population,
    })
}

/// Some departments publish fractional populations; those are rounded to the
/// nearest integer.
fn parse_population(raw: &str) -> Result<i64, String> {
    if let Ok(population) = raw.parse::<i64>() {
        return Ok(population);
    }
    let value = raw
        .parse::<f64>()
        .map_err(|e| format!("invalid population ({raw}): {e}"))?;
    if !value.is_finite() {
        return Err(format!("invalid population ({raw}): not a finite number"));
    }
    Ok(value.round() as i64)
}
