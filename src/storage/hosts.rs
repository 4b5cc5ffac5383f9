use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::orchestrator::HostStatus;

use super::instances::{parse_timestamp, InstanceStore};

/// Last observed state of a host, kept in the `host_cache` table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub endpoint_id: i64,
    pub name: String,
    pub status: HostStatus,
    pub last_check: DateTime<Utc>,
    pub cpu_total: i64,
    pub memory_total: i64,
    pub memory_used: i64,
    pub instance_count: i64,
}

impl InstanceStore {
    pub fn upsert_host(&self, host: &HostSnapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO host_cache (
                endpoint_id, name, status, last_check,
                cpu_total, memory_total, memory_used, instance_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(endpoint_id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                last_check = excluded.last_check,
                cpu_total = excluded.cpu_total,
                memory_total = excluded.memory_total,
                memory_used = excluded.memory_used,
                instance_count = excluded.instance_count
            "#,
            params![
                host.endpoint_id,
                host.name,
                host.status.as_str(),
                host.last_check.to_rfc3339(),
                host.cpu_total,
                host.memory_total,
                host.memory_used,
                host.instance_count,
            ],
        )
        .map_err(|e| AppError::Storage(format!("Failed to upsert host: {}", e)))?;

        Ok(())
    }

    pub fn list_cached_hosts(&self) -> Result<Vec<HostSnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
            SELECT endpoint_id, name, status, last_check,
                   cpu_total, memory_total, memory_used, instance_count
            FROM host_cache ORDER BY endpoint_id
            "#,
            )
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let hosts = stmt
            .query_map([], |row| {
                let status: String = row.get(2)?;
                let last_check: String = row.get(3)?;
                Ok(HostSnapshot {
                    endpoint_id: row.get(0)?,
                    name: row.get(1)?,
                    status: HostStatus::parse(&status).unwrap_or(HostStatus::Down),
                    last_check: parse_timestamp("last_check", &last_check)?,
                    cpu_total: row.get(4)?,
                    memory_total: row.get(5)?,
                    memory_used: row.get(6)?,
                    instance_count: row.get(7)?,
                })
            })
            .map_err(|e| AppError::Storage(format!("Failed to query hosts: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect hosts: {}", e)))?;

        Ok(hosts)
    }

    /// Delete host rows not refreshed within `max_age`. Returns how many were removed.
    pub fn cleanup_stale_hosts(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| AppError::Internal(format!("Invalid staleness window: {}", e)))?;
        let cutoff = (Utc::now() - max_age).to_rfc3339();

        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM host_cache WHERE last_check < ?1",
            params![cutoff],
        )
        .map_err(|e| AppError::Storage(format!("Failed to clean host cache: {}", e)))
    }
}
