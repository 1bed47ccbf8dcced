use anyhow::Result;
use rusqlite::params;

use crate::db::{connection::Database, models::SystemMetrics};

impl Database {
    pub async fn insert_system_metrics(&self, metrics: &SystemMetrics) -> Result<()> {
        let record = metrics.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO system_monitoring (timestamp, cpu_usage, cpu_temp, ram_usage, disk_usage)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.timestamp.to_rfc3339(),
                    f64::from(record.cpu_usage),
                    record.cpu_temp,
                    record.ram_usage,
                    record.disk_usage,
                ],
            )?;
            Ok(())
        })
        .await
    }
}
