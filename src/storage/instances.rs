use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::error::{AppError, Result};
use crate::instance::model::{
    ContainerBinding, ExternalEndpoint, Instance, InstanceKind, InstanceSource, InstanceStatus,
};
use crate::scheduler::Plan;

const COLUMNS: &str = r#"
    instance_id, user_id, name, owner_email, plan, source, status, url,
    container_id, container_name, endpoint_id, port, gateway_token,
    custom_url, health_check_url, health_check_interval, is_healthy, last_health_check,
    created_at, updated_at
"#;

/// Fields to change on an instance. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct InstanceUpdate {
    pub name: Option<String>,
    pub plan: Option<Plan>,
    pub status: Option<InstanceStatus>,
    pub port: Option<u16>,
    pub is_healthy: Option<bool>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceFilter {
    pub status: Option<InstanceStatus>,
    pub user_id: Option<String>,
    pub source: Option<InstanceSource>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Aggregate counts across all stored instances
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstanceStats {
    pub total: i64,
    pub by_plan: BTreeMap<String, i64>,
    pub by_status: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
}

/// SQLite-backed record of every instance, managed or external
pub struct InstanceStore {
    conn: Arc<Mutex<Connection>>,
}

impl InstanceStore {
    /// Open (or create) the store at `db_path`, initializing the schema if needed
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Storage(format!("Failed to create metadata directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .map_err(|e| AppError::Storage(format!("Failed to open metadata database: {}", e)))?;

        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Storage(format!("Failed to open in-memory database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                owner_email TEXT,
                plan TEXT NOT NULL,
                source TEXT NOT NULL,
                status TEXT NOT NULL,
                url TEXT NOT NULL,
                container_id TEXT,
                container_name TEXT,
                endpoint_id INTEGER,
                port INTEGER,
                gateway_token TEXT,
                custom_url TEXT,
                health_check_url TEXT,
                health_check_interval INTEGER,
                is_healthy INTEGER,
                last_health_check TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_user ON instances(user_id);
            CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(status);
            CREATE INDEX IF NOT EXISTS idx_instances_endpoint ON instances(endpoint_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_container ON instances(container_id);

            CREATE TABLE IF NOT EXISTS host_cache (
                endpoint_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                last_check TEXT NOT NULL,
                cpu_total INTEGER NOT NULL DEFAULT 0,
                memory_total INTEGER NOT NULL DEFAULT 0,
                memory_used INTEGER NOT NULL DEFAULT 0,
                instance_count INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .map_err(|e| AppError::Storage(format!("Failed to initialize schema: {}", e)))?;

        info!("Instance store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(super) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Storage("Metadata connection lock poisoned".to_string()))
    }

    pub fn insert(&self, instance: &Instance) -> Result<()> {
        let container = instance.container();
        let external = instance.external();

        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO instances ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                COLUMNS
            ),
            params![
                instance.instance_id,
                instance.user_id,
                instance.name,
                instance.owner_email,
                instance.plan.as_str(),
                instance.source().as_str(),
                instance.status.as_str(),
                instance.url,
                container.map(|c| c.container_id.as_str()),
                container.map(|c| c.container_name.as_str()),
                container.map(|c| c.endpoint_id),
                container.and_then(|c| c.port),
                container.map(|c| c.gateway_token.as_str()),
                external.map(|e| e.custom_url.as_str()),
                external.and_then(|e| e.health_check_url.as_deref()),
                external.and_then(|e| e.health_check_interval),
                external.and_then(|e| e.is_healthy),
                external.and_then(|e| e.last_health_check).map(|dt| dt.to_rfc3339()),
                instance.created_at.to_rfc3339(),
                instance.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
                AppError::Conflict(format!("Instance {} already exists", instance.instance_id))
            }
            e => AppError::Storage(format!("Failed to insert instance: {}", e)),
        })?;

        Ok(())
    }

    pub fn get(&self, instance_id: &str) -> Result<Option<Instance>> {
        self.query_one(
            &format!("SELECT {} FROM instances WHERE instance_id = ?1", COLUMNS),
            instance_id,
        )
    }

    pub fn get_by_container_id(&self, container_id: &str) -> Result<Option<Instance>> {
        self.query_one(
            &format!("SELECT {} FROM instances WHERE container_id = ?1", COLUMNS),
            container_id,
        )
    }

    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<Instance>> {
        self.list(&InstanceFilter {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        })
    }

    /// Instances matching `filter`, oldest first
    pub fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(user_id) = &filter.user_id {
            clauses.push("user_id = ?");
            values.push(Box::new(user_id.clone()));
        }
        if let Some(source) = filter.source {
            clauses.push("source = ?");
            values.push(Box::new(source.as_str()));
        }

        let mut sql = format!("SELECT {} FROM instances", COLUMNS);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, instance_id ASC");

        if filter.limit.is_some() || filter.offset.is_some() {
            // SQLite needs a LIMIT before OFFSET; -1 means no limit
            sql.push_str(" LIMIT ? OFFSET ?");
            values.push(Box::new(filter.limit.map(i64::from).unwrap_or(-1)));
            values.push(Box::new(filter.offset.unwrap_or(0)));
        }

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| AppError::Storage(format!("Failed to prepare query: {}", e)))?;

        let instances = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_instance)
            .map_err(|e| AppError::Storage(format!("Failed to query instances: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AppError::Storage(format!("Failed to collect instances: {}", e)))?;

        Ok(instances)
    }

    /// Merge the provided fields into the stored row. Returns false if no row matched.
    pub fn update(&self, instance_id: &str, update: &InstanceUpdate) -> Result<bool> {
        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(name) = &update.name {
            sets.push("name = ?");
            values.push(Box::new(name.clone()));
        }
        if let Some(plan) = update.plan {
            sets.push("plan = ?");
            values.push(Box::new(plan.as_str()));
        }
        if let Some(status) = update.status {
            sets.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(port) = update.port {
            sets.push("port = ?");
            values.push(Box::new(port));
        }
        if let Some(healthy) = update.is_healthy {
            sets.push("is_healthy = ?");
            values.push(Box::new(healthy));
        }
        if let Some(checked_at) = update.last_health_check {
            sets.push("last_health_check = ?");
            values.push(Box::new(checked_at.to_rfc3339()));
        }

        sets.push("updated_at = ?");
        values.push(Box::new(Utc::now().to_rfc3339()));
        values.push(Box::new(instance_id.to_string()));

        let sql = format!(
            "UPDATE instances SET {} WHERE instance_id = ?",
            sets.join(", ")
        );

        let conn = self.conn()?;
        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| AppError::Storage(format!("Failed to update instance: {}", e)))?;

        Ok(changed > 0)
    }

    /// Store the outcome of an external health probe taken at `checked_at`
    pub fn record_health_check(
        &self,
        instance_id: &str,
        healthy: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<bool> {
        let status = if healthy {
            InstanceStatus::Running
        } else {
            InstanceStatus::Error
        };
        self.update(
            instance_id,
            &InstanceUpdate {
                status: Some(status),
                is_healthy: Some(healthy),
                last_health_check: Some(checked_at),
                ..Default::default()
            },
        )
    }

    /// Returns whether a row was actually deleted
    pub fn delete(&self, instance_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM instances WHERE instance_id = ?1",
                params![instance_id],
            )
            .map_err(|e| AppError::Storage(format!("Failed to delete instance: {}", e)))?;

        Ok(deleted > 0)
    }

    /// Number of instances bound to a host
    pub fn count_by_endpoint(&self, endpoint_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM instances WHERE endpoint_id = ?1",
            params![endpoint_id],
            |row| row.get(0),
        )
        .map_err(|e| AppError::Storage(format!("Failed to count instances: {}", e)))
    }

    pub fn stats(&self) -> Result<InstanceStats> {
        let conn = self.conn()?;
        let mut stats = InstanceStats::default();

        for (column, target) in [
            ("plan", &mut stats.by_plan),
            ("status", &mut stats.by_status),
            ("source", &mut stats.by_source),
        ] {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {0}, COUNT(*) FROM instances GROUP BY {0}",
                    column
                ))
                .map_err(|e| AppError::Storage(format!("Failed to prepare stats: {}", e)))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| AppError::Storage(format!("Failed to query stats: {}", e)))?;
            for row in rows {
                let (key, count) =
                    row.map_err(|e| AppError::Storage(format!("Failed to read stats: {}", e)))?;
                target.insert(key, count);
            }
        }

        stats.total = stats.by_status.values().sum();
        Ok(stats)
    }

    fn query_one(&self, sql: &str, key: &str) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        conn.query_row(sql, params![key], Self::row_to_instance)
            .optional()
            .map_err(|e| AppError::Storage(format!("Failed to query instance: {}", e)))
    }

    fn row_to_instance(row: &Row) -> rusqlite::Result<Instance> {
        let plan: String = row.get("plan")?;
        let source: String = row.get("source")?;
        let status: String = row.get("status")?;

        let plan = plan
            .parse::<Plan>()
            .map_err(|e| conversion_error("plan", e.to_string()))?;
        let source = InstanceSource::parse(&source)
            .ok_or_else(|| conversion_error("source", format!("unknown source {}", source)))?;
        let status = InstanceStatus::parse(&status)
            .ok_or_else(|| conversion_error("status", format!("unknown status {}", status)))?;

        let kind = match source {
            InstanceSource::Managed => {
                let container_id: Option<String> = row.get("container_id")?;
                let endpoint_id: Option<i64> = row.get("endpoint_id")?;
                let (container_id, endpoint_id) = match (container_id, endpoint_id) {
                    (Some(c), Some(e)) => (c, e),
                    _ => {
                        return Err(conversion_error(
                            "container_id",
                            "managed instance without a container binding".to_string(),
                        ))
                    }
                };
                InstanceKind::Managed(ContainerBinding {
                    container_id,
                    container_name: row
                        .get::<_, Option<String>>("container_name")?
                        .unwrap_or_default(),
                    endpoint_id,
                    port: row.get("port")?,
                    gateway_token: row
                        .get::<_, Option<String>>("gateway_token")?
                        .unwrap_or_default(),
                })
            }
            InstanceSource::Custom | InstanceSource::Hardware => {
                let endpoint = ExternalEndpoint {
                    custom_url: row
                        .get::<_, Option<String>>("custom_url")?
                        .unwrap_or_default(),
                    health_check_url: row.get("health_check_url")?,
                    health_check_interval: row.get("health_check_interval")?,
                    is_healthy: row.get("is_healthy")?,
                    last_health_check: row
                        .get::<_, Option<String>>("last_health_check")?
                        .map(|s| parse_timestamp("last_health_check", &s))
                        .transpose()?,
                };
                if source == InstanceSource::Custom {
                    InstanceKind::Custom(endpoint)
                } else {
                    InstanceKind::Hardware(endpoint)
                }
            }
        };

        Ok(Instance {
            instance_id: row.get("instance_id")?,
            user_id: row.get("user_id")?,
            name: row.get("name")?,
            owner_email: row.get("owner_email")?,
            plan,
            url: row.get("url")?,
            status,
            kind,
            created_at: parse_timestamp("created_at", &row.get::<_, String>("created_at")?)?,
            updated_at: parse_timestamp("updated_at", &row.get::<_, String>("updated_at")?)?,
        })
    }
}

fn conversion_error(column: &str, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("{}: {}", column, message).into(),
    )
}

pub(super) fn parse_timestamp(column: &str, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e.to_string()))
}
