//! Calendar date parsing for cross-document comparison.

use chrono::NaiveDate;

/// Accepted layouts, tried in order. Day-first wins over month-first for
/// ambiguous slash dates.
const FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y", "%d-%m-%Y", "%Y/%m/%d", "%d.%m.%Y"];

/// Parse a date string into a calendar date.
///
/// A trailing time part (`1990-04-12T00:00:00`) is ignored.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    let date_part = trimmed.split(['T', ' ']).next().unwrap_or(trimmed);
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
}

/// Outcome of comparing two raw dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateComparison {
    /// One side is missing or blank.
    Unknown,
    /// Both parsed; `left`/`right` are ISO dates.
    Compared { matched: bool, left: String, right: String },
    /// At least one side did not parse, so the raw strings were compared.
    Unparsed { matched: bool },
}

impl DateComparison {
    pub const fn matched(&self) -> Option<bool> {
        match self {
            Self::Unknown => None,
            Self::Compared { matched, .. } | Self::Unparsed { matched } => Some(*matched),
        }
    }
}

/// Compare two optional raw dates for calendar equality.
pub fn compare_dates(left: Option<&str>, right: Option<&str>) -> DateComparison {
    let (Some(l), Some(r)) = (
        left.map(str::trim).filter(|s| !s.is_empty()),
        right.map(str::trim).filter(|s| !s.is_empty()),
    ) else {
        return DateComparison::Unknown;
    };

    match (parse_date(l), parse_date(r)) {
        (Some(a), Some(b)) => DateComparison::Compared {
            matched: a == b,
            left: a.to_string(),
            right: b.to_string(),
        },
        _ => DateComparison::Unparsed {
            matched: l.eq_ignore_ascii_case(r),
        },
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(1990, 4, 12).unwrap();
        for raw in ["1990-04-12", "12/04/1990", "12-04-1990", "1990/04/12", "12.04.1990", "1990-04-12T00:00:00"] {
            assert_eq!(parse_date(raw), Some(expected), "{raw}");
        }
        assert_eq!(parse_date("04/25/1990"), NaiveDate::from_ymd_opt(1990, 4, 25));
        assert_eq!(parse_date("not a date"), None);
    }

    #[test]
    fn equal_dates_in_different_layouts_match() {
        let cmp = compare_dates(Some("1990-04-12"), Some("12/04/1990"));
        assert_eq!(cmp.matched(), Some(true));
    }

    #[test]
    fn missing_side_is_unknown() {
        assert_eq!(compare_dates(Some("1990-04-12"), None), DateComparison::Unknown);
        assert_eq!(compare_dates(Some(" "), Some("1990-04-12")), DateComparison::Unknown);
    }

    #[test]
    fn unparseable_dates_fall_back_to_text() {
        assert_eq!(
            compare_dates(Some("April 1990"), Some("april 1990")),
            DateComparison::Unparsed { matched: true }
        );
        assert_eq!(compare_dates(Some("April 1990"), Some("1990-04-12")).matched(), Some(false));
    }
}
