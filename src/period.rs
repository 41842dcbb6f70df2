// 📅 Period - (year, quarter) filing cycle
//
// Periods come from two places: the filename marker ("1T2025.csv") and the
// embedded date column of the filing itself. When both are present and
// disagree, the embedded date wins.

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// PERIOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub quarter: u8,
}

impl Period {
    /// Build a period, rejecting quarters outside 1..=4
    pub fn new(year: i32, quarter: u8) -> Option<Self> {
        if (1..=4).contains(&quarter) {
            Some(Period { year, quarter })
        } else {
            None
        }
    }

    /// Quarter containing the given date
    pub fn from_date(date: NaiveDate) -> Self {
        Period {
            year: date.year(),
            quarter: ((date.month() - 1) / 3 + 1) as u8,
        }
    }

    /// Extract the "{quarter}T{year}" marker from a file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        static MARKER: OnceLock<Regex> = OnceLock::new();
        let re = MARKER.get_or_init(|| Regex::new(r"(\d)[tT](\d{4})").expect("valid period regex"));

        let caps = re.captures(name)?;
        let quarter: u8 = caps[1].parse().ok()?;
        let year: i32 = caps[2].parse().ok()?;
        Period::new(year, quarter)
    }

    /// Marker used in file names and reports, e.g. "1T2025"
    pub fn marker(&self) -> String {
        format!("{}T{}", self.quarter, self.year)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}T{}", self.quarter, self.year)
    }
}

// ============================================================================
// EMBEDDED DATES
// ============================================================================

/// Parse an embedded filing date (YYYY-MM-DD or DD/MM/YYYY, time part ignored)
pub fn parse_embedded_date(raw: &str) -> Option<NaiveDate> {
    static ISO: OnceLock<Regex> = OnceLock::new();
    static BR: OnceLock<Regex> = OnceLock::new();
    let iso = ISO.get_or_init(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("valid iso regex"));
    let br = BR.get_or_init(|| Regex::new(r"(\d{2})/(\d{2})/(\d{4})").expect("valid br regex"));

    let text = raw.trim();
    if let Some(c) = iso.captures(text) {
        return NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?);
    }
    if let Some(c) = br.captures(text) {
        return NaiveDate::from_ymd_opt(c[3].parse().ok()?, c[2].parse().ok()?, c[1].parse().ok()?);
    }
    None
}

/// How a file's period was decided
#[derive(Debug, Clone, PartialEq)]
pub enum PeriodSource {
    FileName(Period),
    EmbeddedDate(Period),
    /// Both present and different; the embedded date is used
    Conflict { file_name: Period, embedded: Period },
}

impl PeriodSource {
    pub fn period(&self) -> Period {
        match self {
            PeriodSource::FileName(p) | PeriodSource::EmbeddedDate(p) => *p,
            PeriodSource::Conflict { embedded, .. } => *embedded,
        }
    }
}

/// Combine the filename marker and the first embedded date into one decision
pub fn select_period(file_name: Option<Period>, embedded: Option<Period>) -> Option<PeriodSource> {
    match (file_name, embedded) {
        (Some(f), Some(e)) if f != e => Some(PeriodSource::Conflict {
            file_name: f,
            embedded: e,
        }),
        (Some(f), _) => Some(PeriodSource::FileName(f)),
        (None, Some(e)) => Some(PeriodSource::EmbeddedDate(e)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_from_file_name() {
        assert_eq!(Period::from_file_name("1T2025.csv"), Period::new(2025, 1));
        assert_eq!(Period::from_file_name("dados_3t2023.txt"), Period::new(2023, 3));
        assert_eq!(Period::from_file_name("5T2023.csv"), None);
        assert_eq!(Period::from_file_name("operadoras.csv"), None);
    }

    #[test]
    fn test_period_from_date() {
        let d = NaiveDate::from_ymd_opt(2024, 7, 1).unwrap();
        assert_eq!(Period::from_date(d), Period { year: 2024, quarter: 3 });
        let d = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(Period::from_date(d).quarter, 4);
    }

    #[test]
    fn test_parse_embedded_date_formats() {
        assert_eq!(
            parse_embedded_date("2025-01-01"),
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
        assert_eq!(
            parse_embedded_date("01/04/2025"),
            NaiveDate::from_ymd_opt(2025, 4, 1)
        );
        assert_eq!(parse_embedded_date("not a date"), None);
    }

    #[test]
    fn test_embedded_date_wins_on_conflict() {
        let from_name = Period::new(2025, 1);
        let from_date = Period::new(2024, 4);
        let decision = select_period(from_name, from_date).unwrap();
        assert!(matches!(decision, PeriodSource::Conflict { .. }));
        assert_eq!(decision.period(), Period { year: 2024, quarter: 4 });

        let agree = select_period(from_name, from_name).unwrap();
        assert_eq!(agree, PeriodSource::FileName(Period { year: 2025, quarter: 1 }));
        assert!(select_period(None, None).is_none());
    }

    #[test]
    fn test_periods_order_by_year_then_quarter() {
        let mut periods = vec![
            Period::new(2025, 1).unwrap(),
            Period::new(2024, 4).unwrap(),
            Period::new(2024, 2).unwrap(),
        ];
        periods.sort();
        assert_eq!(periods[0].marker(), "2T2024");
        assert_eq!(periods[2].to_string(), "1T2025");
    }
}
