//! Derived reports over stored daily records: national ratios, department
//! resumes and per-age daily leaderboards.
//!
//! The free functions are pure and take the records they aggregate; the
//! [`AnalyticsEngine`] reads those records through a [`RecordStore`].

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use covid_core::{
    ratio, DailyRecord, DailyTop5, DailyTop5PerAgeCategory, DepartmentResume,
    NationalDailyReport, MIN_RELIABLE_TESTS,
};
use covid_storage::{RecordStore, StorageError};
use tracing::debug;

pub const CRATE_NAME: &str = "covid-analytics";

/// Length of each per-age leaderboard in [`DailyTop5`].
pub const TOP_K: usize = 5;

/// Sum tests per day over `[from, to]`, across departments and age categories.
/// Days come out in ascending order whatever the input order.
pub fn national_daily_reports(
    records: &[DailyRecord],
    from: NaiveDate,
    to: NaiveDate,
) -> Vec<NationalDailyReport> {
    let mut per_day = BTreeMap::<NaiveDate, (i64, i64)>::new();
    for record in records.iter().filter(|r| r.day >= from && r.day <= to) {
        let sums = per_day.entry(record.day).or_default();
        sums.0 += record.tests_total;
        sums.1 += record.tests_positive;
    }

    per_day
        .into_iter()
        .map(|(day, (tests_total, tests_positive))| NationalDailyReport {
            day,
            tests_total,
            tests_positive,
            ratio: ratio(tests_positive, tests_total),
        })
        .collect()
}

/// Days of most tests, most positives and highest ratio for one department.
///
/// Days whose summed tests are at or below [`MIN_RELIABLE_TESTS`] are skipped.
/// Maxima only move on a strictly greater value, so the earliest day keeps a
/// tie. Records of other departments are ignored.
pub fn department_resume(records: &[DailyRecord], department: &str) -> DepartmentResume {
    let mut per_day = BTreeMap::<NaiveDate, (i64, i64)>::new();
    for record in records.iter().filter(|r| r.department == department) {
        let sums = per_day.entry(record.day).or_default();
        sums.0 += record.tests_total;
        sums.1 += record.tests_positive;
    }

    let mut resume = DepartmentResume::default();
    let mut max_tests = 0i64;
    let mut max_positives = 0i64;
    let mut max_ratio = 0.0f64;

    for (day, (tests_total, tests_positive)) in per_day {
        if tests_total <= MIN_RELIABLE_TESTS {
            continue;
        }

        let day_ratio = ratio(tests_positive, tests_total);

        if tests_total > max_tests {
            resume.day_with_most_tests = Some(day);
            max_tests = tests_total;
        }
        if tests_positive > max_positives {
            resume.day_with_most_positives = Some(day);
            max_positives = tests_positive;
        }
        if day_ratio > max_ratio {
            resume.day_with_highest_ratio = Some(day);
            max_ratio = day_ratio;
        }
    }
    resume
}

/// Bounded list kept sorted by descending ratio.
///
/// A new record goes right before the first entry with a strictly lower ratio,
/// so records with equal ratios keep their arrival order.
#[derive(Debug, Clone)]
pub struct TopK {
    capacity: usize,
    entries: Vec<DailyRecord>,
}

impl TopK {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    pub fn offer(&mut self, record: DailyRecord) {
        let new_ratio = record.ratio();
        let position = self
            .entries
            .iter()
            .position(|entry| entry.ratio() < new_ratio)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, record);
        self.entries.truncate(self.capacity);
    }

    pub fn entries(&self) -> &[DailyRecord] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<DailyRecord> {
        self.entries
    }
}

/// Per age category, the [`TOP_K`] records of `day` with the highest ratio,
/// among records with more than [`MIN_RELIABLE_TESTS`] tests.
pub fn daily_top5(records: &[DailyRecord], day: NaiveDate) -> DailyTop5 {
    let mut per_age = BTreeMap::<i32, TopK>::new();
    for record in records.iter().filter(|r| r.day == day && r.is_reliable()) {
        per_age
            .entry(record.age_category)
            .or_insert_with(|| TopK::new(TOP_K))
            .offer(record.clone());
    }

    DailyTop5 {
        age_categories: per_age
            .into_iter()
            .map(|(age, top)| (age, DailyTop5PerAgeCategory { top5: top.into_vec() }))
            .collect(),
    }
}

/// Reads records from a [`RecordStore`] and computes the derived reports. A
/// failed read aborts the computation; nothing is retried.
#[derive(Clone)]
pub struct AnalyticsEngine {
    store: Arc<dyn RecordStore>,
}

impl AnalyticsEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn national_reports(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<NationalDailyReport>, StorageError> {
        let records = self.store.query_records(from, to, &[]).await?;
        let reports = national_daily_reports(&records, from, to);
        debug!(%from, %to, records = records.len(), days = reports.len(), "national reports");
        Ok(reports)
    }

    pub async fn department_resume(
        &self,
        department: &str,
    ) -> Result<DepartmentResume, StorageError> {
        let bounds = self.store.date_range().await?;
        let (Some(from), Some(to)) = (bounds.from, bounds.to) else {
            return Ok(DepartmentResume::default());
        };
        let records = self
            .store
            .query_records(from, to, &[department.to_string()])
            .await?;
        debug!(department, records = records.len(), "department resume");
        Ok(department_resume(&records, department))
    }

    pub async fn daily_top5(&self, day: NaiveDate) -> Result<DailyTop5, StorageError> {
        let records = self.store.query_records(day, day, &[]).await?;
        debug!(%day, records = records.len(), "daily top5");
        Ok(daily_top5(&records, day))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use covid_core::DateBounds;
    use covid_storage::MemoryRecordStore;

    fn day(s: &str) -> NaiveDate {
        covid_core::parse_day(s).expect("day")
    }

    fn record(dep: &str, d: &str, age: i32, total: i64, positive: i64) -> DailyRecord {
        DailyRecord {
            department: dep.into(),
            day: day(d),
            age_category: age,
            tests_total: total,
            tests_positive: positive,
            population: 1000,
        }
    }

    fn deps(list: &[DailyRecord]) -> Vec<&str> {
        list.iter().map(|r| r.department.as_str()).collect()
    }

    #[test]
    fn national_reports_sum_across_departments_and_ages() {
        let records = vec![
            record("01", "2020-05-14", 9, 10, 1),
            record("01", "2020-05-13", 9, 100, 10),
            record("02", "2020-05-13", 19, 300, 30),
            record("02", "2020-05-15", 19, 0, 0),
        ];
        let reports = national_daily_reports(&records, day("2020-05-13"), day("2020-05-15"));
        let days = reports.iter().map(|r| r.day).collect::<Vec<_>>();
        assert_eq!(days, vec![day("2020-05-13"), day("2020-05-14"), day("2020-05-15")]);

        assert_eq!(reports[0].tests_total, 400);
        assert_eq!(reports[0].tests_positive, 40);
        assert_eq!(reports[0].ratio, 0.1);
        assert_eq!(reports[2].tests_total, 0);
        assert_eq!(reports[2].ratio, 0.0);
        assert!(!reports[2].ratio.is_nan());
    }

    #[test]
    fn national_reports_respect_inclusive_range() {
        let records = vec![
            record("01", "2020-05-12", 9, 10, 1),
            record("01", "2020-05-13", 9, 10, 1),
            record("01", "2020-05-14", 9, 10, 1),
        ];
        let reports = national_daily_reports(&records, day("2020-05-13"), day("2020-05-13"));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].day, day("2020-05-13"));
        assert!(national_daily_reports(&records, day("2020-05-14"), day("2020-05-13")).is_empty());
    }

    #[test]
    fn resume_skips_unreliable_days() {
        let records = vec![
            record("01", "2020-05-13", 9, 5, 1),
            record("01", "2020-05-14", 9, 20, 5),
            record("01", "2020-05-15", 9, 50, 40),
        ];
        let resume = department_resume(&records, "01");
        assert_eq!(resume.day_with_most_tests, Some(day("2020-05-15")));
        assert_eq!(resume.day_with_most_positives, Some(day("2020-05-15")));
        assert_eq!(resume.day_with_highest_ratio, Some(day("2020-05-15")));
    }

    #[test]
    fn resume_sums_age_categories_before_thresholding() {
        let records = vec![
            record("01", "2020-05-13", 9, 6, 6),
            record("01", "2020-05-13", 19, 6, 0),
            record("01", "2020-05-14", 9, 11, 1),
        ];
        let resume = department_resume(&records, "01");
        assert_eq!(resume.day_with_most_tests, Some(day("2020-05-13")));
        assert_eq!(resume.day_with_most_positives, Some(day("2020-05-13")));
        assert_eq!(resume.day_with_highest_ratio, Some(day("2020-05-13")));
    }

    #[test]
    fn resume_without_reliable_days_is_unset() {
        let records = vec![
            record("01", "2020-05-13", 9, 10, 9),
            record("01", "2020-05-14", 9, 3, 1),
            record("02", "2020-05-14", 9, 300, 100),
        ];
        assert_eq!(department_resume(&records, "01"), DepartmentResume::default());
        assert_eq!(department_resume(&[], "01"), DepartmentResume::default());
    }

    #[test]
    fn resume_keeps_the_earliest_day_on_ties() {
        let records = vec![
            record("01", "2020-05-15", 9, 40, 4),
            record("01", "2020-05-13", 9, 40, 4),
            record("01", "2020-05-14", 9, 20, 2),
        ];
        let resume = department_resume(&records, "01");
        assert_eq!(resume.day_with_most_tests, Some(day("2020-05-13")));
        assert_eq!(resume.day_with_most_positives, Some(day("2020-05-13")));
        assert_eq!(resume.day_with_highest_ratio, Some(day("2020-05-13")));
    }

    #[test]
    fn resume_maxima_are_independent() {
        let records = vec![
            record("01", "2020-05-13", 9, 1000, 10),
            record("01", "2020-05-14", 9, 500, 200),
            record("01", "2020-05-15", 9, 20, 15),
        ];
        let resume = department_resume(&records, "01");
        assert_eq!(resume.day_with_most_tests, Some(day("2020-05-13")));
        assert_eq!(resume.day_with_most_positives, Some(day("2020-05-14")));
        assert_eq!(resume.day_with_highest_ratio, Some(day("2020-05-15")));
    }

    #[test]
    fn top5_orders_by_ratio() {
        let records = vec![
            record("01", "2020-05-13", 9, 100, 50),
            record("02", "2020-05-13", 9, 50, 40),
        ];
        let top = daily_top5(&records, day("2020-05-13"));
        assert_eq!(top.age_categories.len(), 1);
        assert_eq!(deps(&top.age_categories[&9].top5), vec!["02", "01"]);
    }

    #[test]
    fn top5_is_capped_and_excludes_small_samples() {
        let mut records = (0..8)
            .map(|i| record(&format!("{:02}", i + 1), "2020-05-13", 9, 100, i * 10))
            .collect::<Vec<_>>();
        records.push(record("99", "2020-05-13", 9, 10, 10));
        records.push(record("98", "2020-05-13", 19, 4, 4));
        records.push(record("97", "2020-05-14", 9, 100, 100));

        let top = daily_top5(&records, day("2020-05-13"));
        assert_eq!(top.age_categories.len(), 1);
        let list = &top.age_categories[&9].top5;
        assert_eq!(list.len(), TOP_K);
        assert_eq!(deps(list), vec!["08", "07", "06", "05", "04"]);
        assert!(list.windows(2).all(|w| w[0].ratio() >= w[1].ratio()));
        assert!(list.iter().all(|r| r.tests_total > MIN_RELIABLE_TESTS));
    }

    #[test]
    fn top5_ties_keep_arrival_order() {
        let records = vec![
            record("A", "2020-05-13", 9, 100, 20),
            record("B", "2020-05-13", 9, 50, 10),
            record("C", "2020-05-13", 9, 100, 90),
            record("D", "2020-05-13", 9, 20, 4),
        ];
        let top = daily_top5(&records, day("2020-05-13"));
        assert_eq!(deps(&top.age_categories[&9].top5), vec!["C", "A", "B", "D"]);
    }

    #[test]
    fn top_k_drops_the_tail_once_full() {
        let mut top = TopK::new(2);
        top.offer(record("A", "2020-05-13", 9, 100, 10));
        top.offer(record("B", "2020-05-13", 9, 100, 10));
        top.offer(record("C", "2020-05-13", 9, 100, 10));
        assert_eq!(deps(top.entries()), vec!["A", "B"]);
        top.offer(record("D", "2020-05-13", 9, 100, 11));
        assert_eq!(deps(top.entries()), vec!["D", "A"]);
    }

    struct UnavailableStore;

    #[async_trait]
    impl RecordStore for UnavailableStore {
        async fn upsert(&self, _records: &[DailyRecord]) -> Result<usize, StorageError> {
            Err(StorageError::database("save", sqlx::Error::PoolTimedOut))
        }
        async fn list_departments(&self) -> Result<Vec<String>, StorageError> {
            Err(StorageError::database("retrieve departments", sqlx::Error::PoolTimedOut))
        }
        async fn list_age_categories(&self) -> Result<Vec<i32>, StorageError> {
            Err(StorageError::database("retrieve age categories", sqlx::Error::PoolTimedOut))
        }
        async fn date_range(&self) -> Result<DateBounds, StorageError> {
            Err(StorageError::database("retrieve days limit", sqlx::Error::PoolTimedOut))
        }
        async fn query_records(
            &self,
            _from: NaiveDate,
            _to: NaiveDate,
            _departments: &[String],
        ) -> Result<Vec<DailyRecord>, StorageError> {
            Err(StorageError::database("query reports", sqlx::Error::PoolTimedOut))
        }
    }

    #[tokio::test]
    async fn engine_reads_through_the_store() {
        let store = Arc::new(MemoryRecordStore::new());
        store
            .upsert(&[
                record("01", "2020-05-13", 9, 5, 1),
                record("01", "2020-05-14", 9, 20, 5),
                record("01", "2020-05-15", 9, 50, 40),
                record("02", "2020-05-15", 9, 100, 10),
            ])
            .await
            .expect("upsert");
        let engine = AnalyticsEngine::new(store);

        let national = engine
            .national_reports(day("2020-05-14"), day("2020-05-15"))
            .await
            .expect("national");
        assert_eq!(national.len(), 2);
        assert_eq!(national[1].tests_total, 150);
        assert_eq!(national[1].tests_positive, 50);

        let resume = engine.department_resume("01").await.expect("resume");
        assert_eq!(resume.day_with_highest_ratio, Some(day("2020-05-15")));

        let top = engine.daily_top5(day("2020-05-15")).await.expect("top5");
        assert_eq!(deps(&top.age_categories[&9].top5), vec!["01", "02"]);
    }

    #[tokio::test]
    async fn engine_on_empty_store_returns_empty_reports() {
        let engine = AnalyticsEngine::new(Arc::new(MemoryRecordStore::new()));
        assert_eq!(
            engine.department_resume("01").await.expect("resume"),
            DepartmentResume::default()
        );
        assert!(engine
            .daily_top5(day("2020-05-13"))
            .await
            .expect("top5")
            .age_categories
            .is_empty());
    }

    #[tokio::test]
    async fn engine_propagates_storage_errors() {
        let engine = AnalyticsEngine::new(Arc::new(UnavailableStore));
        assert!(engine
            .national_reports(day("2020-05-13"), day("2020-05-13"))
            .await
            .is_err());
        assert!(engine.department_resume("01").await.is_err());
        assert!(engine.daily_top5(day("2020-05-13")).await.is_err());
    }
}
