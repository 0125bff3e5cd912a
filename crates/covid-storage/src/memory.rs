use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use covid_core::{DailyRecord, DateBounds, RecordKey};
use tokio::sync::RwLock;

use crate::{RecordStore, StorageError};

/// In-process store used by `--in-memory` runs and tests. Rows are kept in
/// natural-key order, matching the ordering of [`crate::PgRecordStore`].
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    rows: RwLock<BTreeMap<RecordKey, DailyRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(&self, records: &[DailyRecord]) -> Result<usize, StorageError> {
        let mut rows = self.rows.write().await;
        for record in records {
            rows.insert(record.key(), record.clone());
        }
        Ok(records.len())
    }

    async fn list_departments(&self) -> Result<Vec<String>, StorageError> {
        let rows = self.rows.read().await;
        let departments = rows
            .values()
            .map(|r| r.department.clone())
            .collect::<BTreeSet<_>>();
        Ok(departments.into_iter().collect())
    }

    async fn list_age_categories(&self) -> Result<Vec<i32>, StorageError> {
        let rows = self.rows.read().await;
        let categories = rows
            .values()
            .map(|r| r.age_category)
            .collect::<BTreeSet<_>>();
        Ok(categories.into_iter().collect())
    }

    async fn date_range(&self) -> Result<DateBounds, StorageError> {
        let rows = self.rows.read().await;
        Ok(DateBounds {
            from: rows.keys().next().map(|k| k.day),
            to: rows.keys().next_back().map(|k| k.day),
        })
    }

    async fn query_records(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        departments: &[String],
    ) -> Result<Vec<DailyRecord>, StorageError> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.day >= from && r.day <= to)
            .filter(|r| departments.is_empty() || departments.contains(&r.department))
            .cloned()
            .collect())
    }
}
