//! Core domain model + row normalization for SOR.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sor-core";

/// Substituted for a missing or empty `Title` cell.
pub const TITLE_PLACEHOLDER: &str = "No title";

/// Headers every catalog sheet must carry. Row 1 of the sheet is the header
/// row; startup repairs any that are missing (append-only, never reorders).
pub const REQUIRED_HEADERS: [&str; 8] = [
    "Category",
    "Title",
    "Benefit",
    "Criteria",
    "Requirement",
    "Deadline",
    "Link",
    "Posted",
];

/// Optional column; when present, set together with `Posted`.
pub const DATE_POSTED_HEADER: &str = "DatePosted";

/// Tokens accepted as `true` for the `Posted` column, case-insensitive.
const TRUTHY_TOKENS: [&str; 5] = ["true", "t", "1", "yes", "y"];

/// One catalog row after normalization. Field text is kept verbatim from the
/// sheet (the deadline is additionally parsed into a date when possible).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub category: String,
    pub title: String,
    pub benefit: String,
    pub criteria: String,
    pub requirement: String,
    /// Raw deadline cell text, rendered as-is in messages.
    pub deadline_text: String,
    /// Parsed deadline; `None` means the row never expires.
    pub deadline: Option<NaiveDate>,
    pub link: String,
    pub posted: bool,
    pub date_posted: Option<NaiveDate>,
}

impl Opportunity {
    /// Expired rows are retired by the sweeper before any selection runs.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        matches!(self.deadline, Some(deadline) if deadline < today)
    }
}

/// One raw data row keyed by lower-cased header name. Headers that look like
/// an incidental form timestamp are excluded at construction so they can
/// never collide with a real field.
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    cells: HashMap<String, String>,
}

impl RawRow {
    pub fn from_cells(headers: &[String], cells: &[String]) -> Self {
        let mut map = HashMap::with_capacity(headers.len());
        for (idx, header) in headers.iter().enumerate() {
            if is_timestamp_header(header) {
                continue;
            }
            let value = cells.get(idx).map(String::as_str).unwrap_or_default();
            map.insert(header.trim().to_ascii_lowercase(), value.trim().to_string());
        }
        Self { cells: map }
    }

    /// Case-insensitive lookup; missing and empty cells both read as "".
    pub fn get(&self, header: &str) -> &str {
        self.cells
            .get(&header.trim().to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.values().all(|v| v.is_empty())
    }
}

/// Incidental timestamp-ish columns (Google Forms and friends) are dropped
/// from consideration entirely.
pub fn is_timestamp_header(name: &str) -> bool {
    let lower = name.trim().to_ascii_lowercase();
    ["timestamp", "submitted", "created", "carimbo"]
        .iter()
        .any(|keyword| lower.contains(keyword))
}

pub fn parse_truthy(value: &str) -> bool {
    let token = value.trim().to_ascii_lowercase();
    TRUTHY_TOKENS.contains(&token.as_str())
}

/// Accepted deadline formats, tried in order. Anything unparsable yields
/// `None`: an unreadable deadline disables expiration for that row instead
/// of blocking it.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"];

const LOOSE_DATE_FORMATS: [&str; 6] = [
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%b %d %Y",
];

pub fn parse_sheet_date(value: &str) -> Option<NaiveDate> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return Some(date);
        }
    }
    // Loose pass: datetime strings reduce to their date prefix, month-name
    // forms are tried with and without comma.
    if text.len() >= 10 {
        if let Ok(date) = NaiveDate::parse_from_str(&text[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }
    let squashed = text.replace(',', ", ").split_whitespace().collect::<Vec<_>>().join(" ");
    for format in LOOSE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&squashed, format) {
            return Some(date);
        }
    }
    None
}

/// Turn a raw row into a typed `Opportunity`. Never fails: missing display
/// fields degrade to placeholders and bad dates degrade to "no deadline".
pub fn normalize_row(row: &RawRow) -> Opportunity {
    let title = row.get("Title");
    let title = if title.is_empty() {
        TITLE_PLACEHOLDER.to_string()
    } else {
        title.to_string()
    };
    let deadline_text = row.get("Deadline").to_string();

    Opportunity {
        category: row.get("Category").to_string(),
        title,
        benefit: row.get("Benefit").to_string(),
        criteria: row.get("Criteria").to_string(),
        requirement: row.get("Requirement").to_string(),
        deadline: parse_sheet_date(&deadline_text),
        deadline_text,
        link: row.get("Link").to_string(),
        posted: parse_truthy(row.get("Posted")),
        date_posted: parse_sheet_date(row.get(DATE_POSTED_HEADER)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let row = RawRow::from_cells(
            &headers(&["CATEGORY", "title", "Posted"]),
            &cells(&["tech", "Grant A", "TRUE"]),
        );
        assert_eq!(row.get("Category"), "tech");
        assert_eq!(row.get("Title"), "Grant A");
        assert_eq!(row.get("posted"), "TRUE");
    }

    #[test]
    fn timestamp_columns_never_map() {
        let row = RawRow::from_cells(
            &headers(&["Timestamp", "Submitted At", "Category"]),
            &cells(&["2025-01-01 10:00:00", "yes", "nigeria"]),
        );
        assert_eq!(row.get("Timestamp"), "");
        assert_eq!(row.get("Submitted At"), "");
        assert_eq!(row.get("Category"), "nigeria");
    }

    #[test]
    fn missing_title_degrades_to_placeholder() {
        let row = RawRow::from_cells(&headers(&["Category"]), &cells(&["tech"]));
        let opp = normalize_row(&row);
        assert_eq!(opp.title, TITLE_PLACEHOLDER);
        assert!(!opp.posted);
    }

    #[test]
    fn truthy_tokens_accepted() {
        for token in ["TRUE", "true", "T", "1", "YES", "y"] {
            assert!(parse_truthy(token), "{token} should be truthy");
        }
        for token in ["", "FALSE", "0", "no", "posted"] {
            assert!(!parse_truthy(token), "{token} should be falsy");
        }
    }

    #[test]
    fn fixed_date_formats_parse() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        for text in ["2025-03-09", "09-03-2025", "09/03/2025", "2025/03/09"] {
            assert_eq!(parse_sheet_date(text), Some(expected), "{text}");
        }
    }

    #[test]
    fn loose_formats_and_garbage() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 9).unwrap();
        assert_eq!(parse_sheet_date("March 9, 2025"), Some(expected));
        assert_eq!(parse_sheet_date("9 March 2025"), Some(expected));
        assert_eq!(parse_sheet_date("2025-03-09T08:30:00Z"), Some(expected));
        assert_eq!(parse_sheet_date("whenever"), None);
        assert_eq!(parse_sheet_date(""), None);
    }

    #[test]
    fn unparsable_deadline_means_never_expires() {
        let row = RawRow::from_cells(
            &headers(&["Title", "Deadline"]),
            &cells(&["Grant", "rolling basis"]),
        );
        let opp = normalize_row(&row);
        assert_eq!(opp.deadline, None);
        assert_eq!(opp.deadline_text, "rolling basis");
        assert!(!opp.is_expired(NaiveDate::from_ymd_opt(2100, 1, 1).unwrap()));
    }

    #[test]
    fn expiry_is_strictly_before_today() {
        let row = RawRow::from_cells(
            &headers(&["Title", "Deadline"]),
            &cells(&["Grant", "2025-01-02"]),
        );
        let opp = normalize_row(&row);
        let deadline = NaiveDate::from_ymd_opt(2025, 1, 2).unwrap();
        assert!(!opp.is_expired(deadline));
        assert!(opp.is_expired(deadline.succ_opt().unwrap()));
    }

    #[test]
    fn stray_columns_are_ignored() {
        let row = RawRow::from_cells(
            &headers(&["Category", "Title", "Notes"]),
            &cells(&["tech", "Grant", "internal only", "overflow cell"]),
        );
        let opp = normalize_row(&row);
        assert_eq!(opp.category, "tech");
        assert_eq!(opp.title, "Grant");
    }
}
