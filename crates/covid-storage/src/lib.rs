//! Record storage + HTTP fetch utilities for the COVID analytics service.

mod fetch;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::NaiveDate;
use covid_core::{DailyRecord, DateBounds};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::MemoryRecordStore;
pub use postgres::{PgRecordStore, TABLE_NAME};

pub const CRATE_NAME: &str = "covid-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot {context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StorageError {
    pub fn database(context: &'static str, source: sqlx::Error) -> Self {
        Self::Database { context, source }
    }
}

/// Durable table of [`DailyRecord`]s keyed by (department, day, age category).
///
/// `query_records` returns rows ordered by day, then department, then age
/// category. Aggregations must still not depend on that order for their sums.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace records by natural key. The first failing row aborts the
    /// rest of the batch; rows written before it stay written.
    async fn upsert(&self, records: &[DailyRecord]) -> Result<usize, StorageError>;

    async fn list_departments(&self) -> Result<Vec<String>, StorageError>;

    async fn list_age_categories(&self) -> Result<Vec<i32>, StorageError>;

    async fn date_range(&self) -> Result<DateBounds, StorageError>;

    /// Records with `from <= day <= to`. An empty `departments` slice means no
    /// department filter.
    async fn query_records(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        departments: &[String],
    ) -> Result<Vec<DailyRecord>, StorageError>;

    async fn migrate(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn storage_error_message_carries_context_and_cause() {
        let err = StorageError::database("query reports", sqlx::Error::PoolTimedOut);
        let message = err.to_string();
        assert!(message.starts_with("cannot query reports: "));
        assert!(message.len() > "cannot query reports: ".len());
    }
}
