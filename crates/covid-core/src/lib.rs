//! Core domain model for the COVID test analytics service.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "covid-core";

/// Date format used on the wire, in the CSV source and in query parameters.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Days (or records) at or below this many tests are ignored by the
/// department resume and the daily top-5.
pub const MIN_RELIABLE_TESTS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parsing {input:?} as YYYY-MM-DD: {reason}")]
pub struct DayParseError {
    pub input: String,
    pub reason: String,
}

/// Parse a strict `YYYY-MM-DD` day: zero-padded, nothing before or after.
pub fn parse_day(input: &str) -> Result<NaiveDate, DayParseError> {
    let day = NaiveDate::parse_from_str(input, DATE_FORMAT).map_err(|e| DayParseError {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    if day.format(DATE_FORMAT).to_string() != input {
        return Err(DayParseError {
            input: input.to_string(),
            reason: "not zero-padded".to_string(),
        });
    }
    Ok(day)
}

/// Positivity ratio, `0.0` when no test was performed.
pub fn ratio(tests_positive: i64, tests_total: i64) -> f64 {
    if tests_total == 0 {
        return 0.0;
    }
    tests_positive as f64 / tests_total as f64
}

/// Natural key of a [`DailyRecord`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub day: NaiveDate,
    pub department: String,
    pub age_category: i32,
}

/// One row of the source dataset: tests for a department, a day and an age bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRecord {
    #[serde(rename = "department_number")]
    pub department: String,
    pub day: NaiveDate,
    pub age_category: i32,
    pub tests_total: i64,
    #[serde(rename = "tests_positives")]
    pub tests_positive: i64,
    pub population: i64,
}

impl DailyRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            day: self.day,
            department: self.department.clone(),
            age_category: self.age_category,
        }
    }

    pub fn ratio(&self) -> f64 {
        ratio(self.tests_positive, self.tests_total)
    }

    /// Whether the record has enough tests to take part in rankings.
    pub fn is_reliable(&self) -> bool {
        self.tests_total > MIN_RELIABLE_TESTS
    }
}

/// Tests summed over every department and age category for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NationalDailyReport {
    pub day: NaiveDate,
    pub tests_total: i64,
    #[serde(rename = "tests_positives")]
    pub tests_positive: i64,
    pub ratio: f64,
}

/// Extremal days of a department. `None` when no day had enough tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentResume {
    pub day_with_most_tests: Option<NaiveDate>,
    pub day_with_most_positives: Option<NaiveDate>,
    pub day_with_highest_ratio: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyTop5 {
    pub age_categories: BTreeMap<i32, DailyTop5PerAgeCategory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DailyTop5PerAgeCategory {
    pub top5: Vec<DailyRecord>,
}

/// Inclusive bounds of the stored days, both `None` on an empty store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateBounds {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).expect("day")
    }

    #[test]
    fn ratio_is_zero_without_tests() {
        assert_eq!(ratio(0, 0), 0.0);
        assert_eq!(ratio(5, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }

    #[test]
    fn parse_day_is_strict() {
        assert_eq!(day("2020-05-13"), NaiveDate::from_ymd_opt(2020, 5, 13).unwrap());
        assert!(parse_day("13/05/2020").is_err());
        assert!(parse_day("2020-05-13T00:00:00Z").is_err());
        assert!(parse_day("").is_err());
        assert!(parse_day("2020-5-13").is_err());
        assert!(parse_day("2020-02-30").is_err());
    }

    #[test]
    fn record_serializes_with_wire_field_names() {
        let record = DailyRecord {
            department: "2A".into(),
            day: day("2020-05-13"),
            age_category: 9,
            tests_total: 100,
            tests_positive: 4,
            population: 12000,
        };
        let json = serde_json::to_value(&record).expect("json");
        assert_eq!(json["department_number"], "2A");
        assert_eq!(json["day"], "2020-05-13");
        assert_eq!(json["tests_positives"], 4);
        assert!(json.get("department").is_none());
    }

    #[test]
    fn empty_resume_serializes_unset_dates_as_null() {
        let json = serde_json::to_value(DepartmentResume::default()).expect("json");
        assert!(json["day_with_most_tests"].is_null());
        assert!(json["day_with_most_positives"].is_null());
        assert!(json["day_with_highest_ratio"].is_null());
    }

    #[test]
    fn top5_age_categories_serialize_as_object_keys() {
        let mut top = DailyTop5::default();
        top.age_categories
            .insert(9, DailyTop5PerAgeCategory::default());
        let json = serde_json::to_value(&top).expect("json");
        assert!(json["age_categories"]["9"]["top5"].is_array());
    }

    #[test]
    fn reliability_threshold_is_exclusive() {
        let mut record = DailyRecord {
            department: "01".into(),
            day: day("2020-05-13"),
            age_category: 0,
            tests_total: 10,
            tests_positive: 1,
            population: 0,
        };
        assert!(!record.is_reliable());
        record.tests_total = 11;
        assert!(record.is_reliable());
    }
}
