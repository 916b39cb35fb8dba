//! Work units and their keys

use chrono::NaiveDate;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Eight consecutive digits, `YYYYMMDD`
#[allow(clippy::expect_used)]
static DATE_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{8}").expect("date pattern compiles"));

/// One source file inside the archive, processed end-to-end on its own.
///
/// Immutable once enumerated. The key is the unit's trading date in ISO form
/// and is what the state file and the remote layout are indexed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub key: String,
    pub date: NaiveDate,
    /// Member name inside the archive
    pub member: String,
    /// Position of the member in the archive's central directory
    pub index: usize,
    pub expected_size: u64,
    /// Lowercase hex SHA-256 from the manifest
    pub expected_sha256: String,
}

impl WorkUnit {
    pub fn new(
        member: impl Into<String>,
        index: usize,
        expected_size: u64,
        expected_sha256: impl Into<String>,
    ) -> Option<Self> {
        let member = member.into();
        let date = date_from_member(&member)?;
        Some(Self {
            key: date.format("%Y-%m-%d").to_string(),
            date,
            member,
            index,
            expected_size,
            expected_sha256: expected_sha256.into().to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.member)
    }
}

/// Parse the date from the first run of eight digits (`YYYYMMDD`) in a file name.
///
/// Only the file name is considered, not directory components.
pub fn date_from_member(member: &str) -> Option<NaiveDate> {
    let name = member.rsplit('/').next().unwrap_or(member);
    let digits = DATE_DIGITS.find(name)?;
    NaiveDate::parse_from_str(digits.as_str(), "%Y%m%d").ok()
}

/// Parse a comma-separated date filter (`2025-01-01,2025-01-03`)
pub fn parse_date_filter(raw: &str) -> Result<Vec<String>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| d.format("%Y-%m-%d").to_string())
                .map_err(|_| format!("'{s}' is not a YYYY-MM-DD date"))
        })
        .collect()
}
