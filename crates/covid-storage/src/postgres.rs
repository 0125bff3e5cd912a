use async_trait::async_trait;
use chrono::NaiveDate;
use covid_core::{DailyRecord, DateBounds};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{RecordStore, StorageError};

pub const TABLE_NAME: &str = "department_daily_report";

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS department_daily_report (
    department_number TEXT    NOT NULL,
    day               DATE    NOT NULL,
    age_category      INTEGER NOT NULL,
    tests_total       BIGINT  NOT NULL,
    tests_positives   BIGINT  NOT NULL,
    population        BIGINT  NOT NULL,
    PRIMARY KEY (department_number, day, age_category)
)
"#;

const CREATE_INDEX_DAY: &str = r#"
CREATE INDEX IF NOT EXISTS idx_department_daily_report_day
    ON department_daily_report (day)
"#;

const UPSERT: &str = r#"
INSERT INTO department_daily_report
    (department_number, day, age_category, tests_total, tests_positives, population)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (department_number, day, age_category) DO UPDATE
   SET tests_total = EXCLUDED.tests_total,
       tests_positives = EXCLUDED.tests_positives,
       population = EXCLUDED.population
"#;

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::database("connect to database", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<DailyRecord, sqlx::Error> {
    Ok(DailyRecord {
        department: row.try_get("department_number")?,
        day: row.try_get("day")?,
        age_category: row.try_get("age_category")?,
        tests_total: row.try_get("tests_total")?,
        tests_positive: row.try_get("tests_positives")?,
        population: row.try_get("population")?,
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(&self, records: &[DailyRecord]) -> Result<usize, StorageError> {
        let mut written = 0usize;
        for record in records {
            sqlx::query(UPSERT)
                .bind(&record.department)
                .bind(record.day)
                .bind(record.age_category)
                .bind(record.tests_total)
                .bind(record.tests_positive)
                .bind(record.population)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::database("save daily department report", e))?;
            written += 1;
        }
        debug!(written, "upserted records");
        Ok(written)
    }

    async fn list_departments(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT department_number
              FROM department_daily_report
             ORDER BY department_number
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::database("retrieve departments", e))?;

        rows.iter()
            .map(|row| row.try_get("department_number"))
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| StorageError::database("scan department", e))
    }

    async fn list_age_categories(&self) -> Result<Vec<i32>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT age_category
              FROM department_daily_report
             ORDER BY age_category
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::database("retrieve age categories", e))?;

        rows.iter()
            .map(|row| row.try_get("age_category"))
            .collect::<Result<Vec<i32>, _>>()
            .map_err(|e| StorageError::database("scan age category", e))
    }

    async fn date_range(&self) -> Result<DateBounds, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(day) AS first_day, MAX(day) AS last_day
              FROM department_daily_report
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::database("retrieve days limit", e))?;

        let from: Option<NaiveDate> = row
            .try_get("first_day")
            .map_err(|e| StorageError::database("scan days limit", e))?;
        let to: Option<NaiveDate> = row
            .try_get("last_day")
            .map_err(|e| StorageError::database("scan days limit", e))?;
        Ok(DateBounds { from, to })
    }

    async fn query_records(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        departments: &[String],
    ) -> Result<Vec<DailyRecord>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT department_number, day, age_category, tests_total, tests_positives, population
              FROM department_daily_report
             WHERE day >= $1
               AND day <= $2
               AND (cardinality($3::text[]) = 0 OR department_number = ANY($3::text[]))
             ORDER BY day, department_number, age_category
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(departments.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::database("query reports", e))?;

        rows.iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::database("scan daily department report", e))
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for statement in [CREATE_TABLE, CREATE_INDEX_DAY] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::database("create department_daily_report schema", e))?;
        }
        Ok(())
    }
}
