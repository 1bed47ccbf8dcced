//! Device and user directory: hardware addresses to device ids, tag UIDs to users.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::connection::Database;

impl Database {
    pub async fn resolve_device(&self, address: &str) -> Result<Option<i64>> {
        let address = address.trim().to_ascii_uppercase();
        self.execute(move |conn| {
            let device_id = conn
                .query_row(
                    "SELECT device_id FROM devices WHERE mac_address = ?1",
                    params![address],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(device_id)
        })
        .await
    }

    /// Registers a device, returning the existing id when the address is known.
    pub async fn register_device(&self, address: &str, name: Option<&str>) -> Result<i64> {
        let address = address.trim().to_ascii_uppercase();
        let name = name.map(str::to_string);
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO devices (mac_address, name, created_at)
                 VALUES (?1, ?2, ?3)",
                params![address, name, Utc::now().to_rfc3339()],
            )?;
            let device_id = conn.query_row(
                "SELECT device_id FROM devices WHERE mac_address = ?1",
                params![address],
                |row| row.get(0),
            )?;
            Ok(device_id)
        })
        .await
    }

    pub async fn resolve_or_create_user(&self, tag_uid: &str) -> Result<i64> {
        let tag_uid = tag_uid.trim().to_ascii_uppercase();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT user_id FROM users WHERE tag_uid = ?1",
                    params![tag_uid],
                    |row| row.get(0),
                )
                .optional()?;

            let user_id = match existing {
                Some(user_id) => user_id,
                None => {
                    tx.execute(
                        "INSERT INTO users (tag_uid, created_at) VALUES (?1, ?2)",
                        params![tag_uid, Utc::now().to_rfc3339()],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            tx.commit()?;
            Ok(user_id)
        })
        .await
    }
}
