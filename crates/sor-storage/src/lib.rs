//! Record-store adapter: catalog snapshots + Google Sheets REST client.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sor_core::RawRow;
use thiserror::Error;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "sor-storage";

/// Sheet rows are 1-based; row 1 is the header row.
pub const HEADER_ROW: u32 = 1;
pub const FIRST_DATA_ROW: u32 = 2;

/// One read of the catalog: header row plus ordered data rows. Row identity
/// for write-back is the sheet row number at read time, never a synthetic id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl SheetTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 1-based column number for a header, case-insensitive.
    pub fn column_index(&self, name: &str) -> Option<u32> {
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name.trim()))
            .map(|idx| idx as u32 + 1)
    }

    /// Iterate data rows as `(sheet_row, raw_row)` in catalog order.
    pub fn records(&self) -> impl Iterator<Item = (u32, RawRow)> + '_ {
        self.rows.iter().enumerate().map(|(idx, cells)| {
            (
                FIRST_DATA_ROW + idx as u32,
                RawRow::from_cells(&self.headers, cells),
            )
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store responded {status} while {context}")]
    HttpStatus { status: u16, context: String },
    #[error("malformed store response while {context}: {detail}")]
    Malformed { context: String, detail: String },
}

/// A cell write targeted at one row: `(column, value)`, column 1-based.
pub type CellWrite = (u32, String);

/// Consumed store contract. Reads return a positional snapshot; writes
/// address single cells (or one batched set of cells within a row) by the
/// position observed at read time.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_table(&self) -> Result<SheetTable, StoreError>;

    async fn write_cell(&self, row: u32, col: u32, value: &str) -> Result<(), StoreError>;

    /// Commit several cells of one row in a single store call, so paired
    /// fields (`Posted` + `DatePosted`) cannot be half-written.
    async fn write_row_cells(&self, row: u32, writes: &[CellWrite]) -> Result<(), StoreError>;

    /// Header repair used at startup; append-only.
    async fn append_header_cell(&self, col: u32, name: &str) -> Result<(), StoreError> {
        self.write_cell(HEADER_ROW, col, name).await
    }
}

/// `1 -> "A"`, `27 -> "AA"`.
pub fn column_letter(col: u32) -> String {
    debug_assert!(col >= 1);
    let mut col = col;
    let mut letters = Vec::new();
    while col > 0 {
        let rem = ((col - 1) % 26) as u8;
        letters.push(b'A' + rem);
        col = (col - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).expect("ascii uppercase")
}

pub fn a1_cell(row: u32, col: u32) -> String {
    format!("{}{row}", column_letter(col))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub access_token: String,
    /// Worksheet tab addressed by every range expression.
    pub worksheet: String,
    pub api_base: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            access_token: String::new(),
            worksheet: "Sheet1".to_string(),
            api_base: "https://sheets.googleapis.com".to_string(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Google Sheets `values` API client. Auth setup is external: the client
/// consumes an already-minted bearer token from configuration.
#[derive(Debug)]
pub struct SheetsClient {
    config: SheetsConfig,
    client: reqwest::Client,
}

impl SheetsClient {
    pub fn new(config: SheetsConfig) -> anyhow::Result<Self> {
        if config.spreadsheet_id.trim().is_empty() {
            anyhow::bail!("spreadsheet id missing; refusing to initialize store client");
        }
        if config.access_token.trim().is_empty() {
            anyhow::bail!("store access token missing; refusing to initialize store client");
        }
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { config, client })
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.config.api_base, self.config.spreadsheet_id, range
        )
    }

    fn range_for_cell(&self, row: u32, col: u32) -> String {
        format!("{}!{}", self.config.worksheet, a1_cell(row, col))
    }

    async fn send_json<F>(&self, mut make: F, context: &str) -> Result<JsonValue, StoreError>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let span = info_span!("sheet_call", context);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.config.backoff.max_retries {
                let resp_result = make()
                    .bearer_auth(&self.config.access_token)
                    .send()
                    .await;

                match resp_result {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = resp.json::<JsonValue>().await?;
                            return Ok(body);
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.config.backoff.max_retries
                        {
                            tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            context: context.to_string(),
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.config.backoff.max_retries
                        {
                            last_request_error = Some(err);
                            tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::Request(err));
                    }
                }
            }

            Err(StoreError::Request(
                last_request_error.expect("retry loop should capture a request error"),
            ))
        }
        .instrument(span)
        .await
    }
}

/// Split a `values` payload into header + data rows. An entirely empty sheet
/// reads as an empty table rather than an error.
pub fn table_from_values_payload(payload: &JsonValue, context: &str) -> Result<SheetTable, StoreError> {
    let Some(values) = payload.get("values") else {
        return Ok(SheetTable::default());
    };
    let rows = values
        .as_array()
        .ok_or_else(|| StoreError::Malformed {
            context: context.to_string(),
            detail: "values is not an array".to_string(),
        })?
        .iter()
        .map(|row| {
            row.as_array()
                .ok_or_else(|| StoreError::Malformed {
                    context: context.to_string(),
                    detail: "row is not an array".to_string(),
                })
                .map(|cells| {
                    cells
                        .iter()
                        .map(|cell| match cell {
                            JsonValue::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect::<Vec<_>>()
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut iter = rows.into_iter();
    let headers = iter.next().unwrap_or_default();
    Ok(SheetTable::new(headers, iter.collect()))
}

#[async_trait]
impl RecordStore for SheetsClient {
    async fn read_table(&self) -> Result<SheetTable, StoreError> {
        let range = format!("{}!A:Z", self.config.worksheet);
        let url = self.values_url(&range);
        let payload = self
            .send_json(
                || self.client.get(&url).query(&[("majorDimension", "ROWS")]),
                "reading catalog",
            )
            .await?;
        table_from_values_payload(&payload, "reading catalog")
    }

    async fn write_cell(&self, row: u32, col: u32, value: &str) -> Result<(), StoreError> {
        let range = self.range_for_cell(row, col);
        let url = self.values_url(&range);
        let body = serde_json::json!({ "values": [[value]] });
        self.send_json(
            || {
                self.client
                    .put(&url)
                    .query(&[("valueInputOption", "RAW")])
                    .json(&body)
            },
            "writing cell",
        )
        .await?;
        Ok(())
    }

    async fn write_row_cells(&self, row: u32, writes: &[CellWrite]) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let url = format!(
            "{}/v4/spreadsheets/{}/values:batchUpdate",
            self.config.api_base, self.config.spreadsheet_id
        );
        let data = writes
            .iter()
            .map(|(col, value)| {
                serde_json::json!({
                    "range": self.range_for_cell(row, *col),
                    "values": [[value]],
                })
            })
            .collect::<Vec<_>>();
        let body = serde_json::json!({ "valueInputOption": "RAW", "data": data });
        self.send_json(|| self.client.post(&url).json(&body), "writing row cells")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(8), "H");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(52), "AZ");
        assert_eq!(a1_cell(5, 3), "C5");
    }

    #[test]
    fn table_addresses_rows_from_two() {
        let table = SheetTable::new(
            vec!["Category".into(), "Title".into(), "Posted".into()],
            vec![
                vec!["tech".into(), "Grant A".into(), "".into()],
                vec!["nigeria".into(), "Grant B".into(), "TRUE".into()],
            ],
        );
        let records: Vec<_> = table.records().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 2);
        assert_eq!(records[1].0, 3);
        assert_eq!(records[1].1.get("Title"), "Grant B");
    }

    #[test]
    fn column_index_is_case_insensitive_and_one_based() {
        let table = SheetTable::new(
            vec!["Category".into(), "Posted".into()],
            vec![],
        );
        assert_eq!(table.column_index("posted"), Some(2));
        assert_eq!(table.column_index("POSTED "), Some(2));
        assert_eq!(table.column_index("DatePosted"), None);
    }

    #[test]
    fn values_payload_splits_header_and_rows() {
        let payload = serde_json::json!({
            "range": "Sheet1!A1:C3",
            "values": [
                ["Category", "Title", "Posted"],
                ["tech", "Grant A"],
                ["nigeria", "Grant B", "TRUE"],
            ],
        });
        let table = table_from_values_payload(&payload, "test").expect("table");
        assert_eq!(table.headers().len(), 3);
        assert_eq!(table.rows().len(), 2);
        // Trailing cells the API omitted read back as empty.
        let (_, first) = table.records().next().expect("row");
        assert_eq!(first.get("Posted"), "");
    }

    #[test]
    fn empty_sheet_reads_as_empty_table() {
        let payload = serde_json::json!({ "range": "Sheet1!A1:Z1" });
        let table = table_from_values_payload(&payload, "test").expect("table");
        assert!(table.is_empty());
        assert!(table.headers().is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn missing_credentials_refuse_to_initialize() {
        let err = SheetsClient::new(SheetsConfig::default()).unwrap_err();
        assert!(err.to_string().contains("spreadsheet id"));

        let err = SheetsClient::new(SheetsConfig {
            spreadsheet_id: "sheet-123".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("access token"));
    }
}
