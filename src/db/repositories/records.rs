//! Generic record gateway for topics that map straight onto a table.

use anyhow::{bail, Result};
use rusqlite::{params_from_iter, types::Value as SqlValue};
use serde_json::{Map, Value};

use crate::db::{
    connection::Database,
    helpers::{json_to_sql, row_to_map, validate_identifier},
};

pub type Record = Map<String, Value>;

fn to_sql_params(values: &[Value]) -> Vec<SqlValue> {
    values.iter().map(json_to_sql).collect()
}

impl Database {
    /// Inserts `record` verbatim: every key becomes a column of `table`.
    pub async fn insert_record(&self, table: &str, record: &Record) -> Result<i64> {
        validate_identifier(table)?;
        if record.is_empty() {
            bail!("refusing to insert an empty record into {table}");
        }

        let mut columns = Vec::with_capacity(record.len());
        let mut values = Vec::with_capacity(record.len());
        for (column, value) in record {
            columns.push(validate_identifier(column)?.to_string());
            values.push(json_to_sql(value));
        }

        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );

        self.execute(move |conn| {
            conn.execute(&sql, params_from_iter(values.iter()))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// `UPDATE table SET fields WHERE` every `condition` column equals its value.
    pub async fn update_record(
        &self,
        table: &str,
        fields: &Record,
        condition: &Record,
    ) -> Result<usize> {
        validate_identifier(table)?;
        if fields.is_empty() {
            bail!("no fields to update in {table}");
        }
        if condition.is_empty() {
            bail!("refusing an unconditional update of {table}");
        }

        let mut values = Vec::with_capacity(fields.len() + condition.len());
        let mut assignments = Vec::with_capacity(fields.len());
        for (column, value) in fields {
            values.push(json_to_sql(value));
            assignments.push(format!("{} = ?{}", validate_identifier(column)?, values.len()));
        }

        let mut predicates = Vec::with_capacity(condition.len());
        for (column, value) in condition {
            values.push(json_to_sql(value));
            predicates.push(format!("{} = ?{}", validate_identifier(column)?, values.len()));
        }

        let sql = format!(
            "UPDATE {table} SET {} WHERE {}",
            assignments.join(", "),
            predicates.join(" AND ")
        );

        self.execute(move |conn| Ok(conn.execute(&sql, params_from_iter(values.iter()))?))
            .await
    }

    pub async fn fetch_one(&self, query: &str, params: &[Value]) -> Result<Option<Record>> {
        let query = query.to_string();
        let values = to_sql_params(params);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&query)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(values.iter()))?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_map(row, &columns)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn fetch_all(&self, query: &str, params: &[Value]) -> Result<Vec<Record>> {
        let query = query.to_string();
        let values = to_sql_params(params);
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&query)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query(params_from_iter(values.iter()))?;

            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(row_to_map(row, &columns)?);
            }
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_update_fetch_round() {
        let db = Database::open_in_memory().unwrap();
        let device_id = db.register_device("AA:BB:CC:DD:EE:01", None).await.unwrap();

        db.insert_record(
            "logs",
            &record(json!({
                "device_id": device_id,
                "timestamp": "2025-03-01 10:00:00",
                "level": "WARNING",
                "message": "lamp drift"
            })),
        )
        .await
        .unwrap();

        let updated = db
            .update_record(
                "logs",
                &record(json!({ "error_code": "E42" })),
                &record(json!({ "device_id": device_id })),
            )
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let row = db
            .fetch_one(
                "SELECT level, error_code FROM logs WHERE device_id = ?1",
                &[json!(device_id)],
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["level"], json!("WARNING"));
        assert_eq!(row["error_code"], json!("E42"));

        let rows = db.fetch_all("SELECT * FROM logs", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn unknown_columns_fail_without_writing() {
        let db = Database::open_in_memory().unwrap();
        let result = db
            .insert_record("telemetry", &record(json!({ "no_such_column": 1 })))
            .await;
        assert!(result.is_err());
        assert!(db.fetch_all("SELECT * FROM telemetry", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hostile_identifiers_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let result = db
            .insert_record("logs; DROP TABLE samples", &record(json!({ "level": "x" })))
            .await;
        assert!(result.is_err());
        assert!(db
            .update_record("logs", &record(json!({ "level": "x" })), &Record::new())
            .await
            .is_err());
    }
}
