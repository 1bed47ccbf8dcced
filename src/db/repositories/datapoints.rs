use anyhow::{anyhow, Context, Result};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::parse_datetime,
    models::{Datapoint, Marker},
};

impl Database {
    pub async fn insert_datapoint(&self, datapoint: &Datapoint) -> Result<i64> {
        let record = datapoint.clone();
        self.execute(move |conn| {
            let channels = serde_json::to_string(&record.channels)
                .context("failed to serialize channel readings")?;

            conn.execute(
                "INSERT INTO spectrum_datapoints (sample_id, device_id, flag, channels, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.sample_id,
                    record.device_id,
                    record.marker.flag(),
                    channels,
                    record.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_datapoints_for_sample(&self, sample_id: i64) -> Result<Vec<Datapoint>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT datapoint_id, sample_id, device_id, flag, channels, timestamp
                 FROM spectrum_datapoints
                 WHERE sample_id = ?1
                 ORDER BY datapoint_id ASC",
            )?;

            let mut rows = stmt.query(params![sample_id])?;
            let mut datapoints = Vec::new();
            while let Some(row) = rows.next()? {
                let flag: i64 = row.get(3)?;
                let channels: String = row.get(4)?;
                let timestamp: String = row.get(5)?;

                datapoints.push(Datapoint {
                    id: row.get(0)?,
                    sample_id: row.get(1)?,
                    device_id: row.get(2)?,
                    marker: Marker::from_flag(flag)
                        .ok_or_else(|| anyhow!("unknown datapoint flag {flag}"))?,
                    channels: serde_json::from_str(&channels)
                        .context("failed to parse stored channel readings")?,
                    timestamp: parse_datetime(&timestamp, "timestamp")?,
                });
            }

            Ok(datapoints)
        })
        .await
    }

    /// Datapoints that arrived while no sample was open for their device.
    pub async fn count_orphan_datapoints(&self, device_id: i64) -> Result<i64> {
        self.execute(move |conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM spectrum_datapoints
                 WHERE device_id = ?1 AND sample_id IS NULL",
                params![device_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }
}
