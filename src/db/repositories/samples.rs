use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, parse_optional_datetime, parse_result, parse_status},
    models::{Sample, SampleResult, SampleStatus},
};

const SAMPLE_COLUMNS: &str = "sample_id, device_id, start_time, end_time, status, result, user_id";

fn row_to_sample(row: &Row) -> Result<Sample> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let status: String = row.get("status")?;
    let result: Option<String> = row.get("result")?;

    Ok(Sample {
        id: row.get("sample_id")?,
        device_id: row.get("device_id")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        status: parse_status(&status)?,
        result: result.as_deref().map(parse_result).transpose()?,
        user_id: row.get("user_id")?,
    })
}

impl Database {
    pub async fn create_sample(&self, device_id: i64, start_time: DateTime<Utc>) -> Result<i64> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO samples (device_id, start_time, status)
                 VALUES (?1, ?2, ?3)",
                params![
                    device_id,
                    start_time.to_rfc3339(),
                    SampleStatus::Open.as_str()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Closes an open sample. End time is written once; closing twice is an error.
    pub async fn close_sample(&self, sample_id: i64, end_time: DateTime<Utc>) -> Result<()> {
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE samples
                 SET status = ?1,
                     end_time = ?2
                 WHERE sample_id = ?3 AND status = ?4",
                params![
                    SampleStatus::Closed.as_str(),
                    end_time.to_rfc3339(),
                    sample_id,
                    SampleStatus::Open.as_str(),
                ],
            )?;

            if rows_affected == 0 {
                return Err(anyhow!("sample {sample_id} is not open"));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_sample_result(&self, sample_id: i64, result: SampleResult) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "UPDATE samples SET result = ?1 WHERE sample_id = ?2",
                params![result.as_str(), sample_id],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn assign_sample_user(&self, sample_id: i64, user_id: i64) -> Result<()> {
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE samples SET user_id = ?1 WHERE sample_id = ?2",
                params![user_id, sample_id],
            )?;

            if rows_affected == 0 {
                return Err(anyhow!("Sample {sample_id} not found"));
            }
            Ok(())
        })
        .await
    }

    pub async fn get_sample(&self, sample_id: i64) -> Result<Option<Sample>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAMPLE_COLUMNS} FROM samples WHERE sample_id = ?1"
            ))?;
            let mut rows = stmt.query(params![sample_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_sample(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn list_open_samples(&self) -> Result<Vec<Sample>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAMPLE_COLUMNS} FROM samples
                 WHERE status = 'open'
                 ORDER BY start_time ASC"
            ))?;

            let mut rows = stmt.query([])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_sample(row)?);
            }
            Ok(samples)
        })
        .await
    }

    /// Samples a user has been associated with, newest first.
    pub async fn list_samples_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<Sample>> {
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAMPLE_COLUMNS} FROM samples
                 WHERE user_id = ?1
                 ORDER BY start_time DESC
                 LIMIT ?2"
            ))?;

            let mut rows = stmt.query(params![user_id, limit])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_sample(row)?);
            }
            Ok(samples)
        })
        .await
    }

    pub async fn latest_sample_id(&self) -> Result<Option<i64>> {
        self.execute(|conn| {
            let id = conn
                .query_row(
                    "SELECT sample_id FROM samples ORDER BY sample_id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
        .await
    }
}
