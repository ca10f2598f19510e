//! SQL bridge backed by postgres.
//!
//! Query results cross into the guest as a JSON array of row objects keyed
//! by column name.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::{info, warn};

use modhost_common::{BackendConfig, BridgeError};

const BRIDGE: &str = "sql";

/// Operations the SQL bridge needs from its backend.
#[async_trait]
pub trait SqlBackend: Send + Sync {
    /// Run a statement and return the number of affected rows.
    async fn execute(&self, statement: &str) -> Result<u64, BridgeError>;
    /// Run a query and return its rows as a JSON array.
    async fn query(&self, statement: &str) -> Result<Value, BridgeError>;
}

/// Postgres through a connection pool shared by every guest.
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, BridgeError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    async fn execute(&self, statement: &str) -> Result<u64, BridgeError> {
        let result = sqlx::query(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))?;
        Ok(result.rows_affected())
    }

    async fn query(&self, statement: &str) -> Result<Value, BridgeError> {
        let rows = sqlx::query(statement)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BridgeError::backend(BRIDGE, e))?;

        Ok(Value::Array(rows.iter().map(row_to_json).collect()))
    }
}

/// Convert one row into a JSON object keyed by column name.
pub fn row_to_json(row: &PgRow) -> Value {
    let mut object = Map::with_capacity(row.len());
    for column in row.columns() {
        let idx = column.ordinal();
        object.insert(
            column.name().to_string(),
            column_to_json(row, idx, column.type_info().name()),
        );
    }
    Value::Object(object)
}

/// Decode a single column. NULLs and undecodable values become `null`.
fn column_to_json(row: &PgRow, idx: usize, type_name: &str) -> Value {
    fn get<'r, T>(row: &'r PgRow, idx: usize) -> Option<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        row.try_get::<T, _>(idx).ok()
    }

    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }

    let value = match type_name {
        "BOOL" => get::<bool>(row, idx).map(Value::from),
        "INT2" => get::<i16>(row, idx).map(Value::from),
        "INT4" => get::<i32>(row, idx).map(Value::from),
        "INT8" => get::<i64>(row, idx).map(Value::from),
        "FLOAT4" => get::<f32>(row, idx).map(|v| Value::from(f64::from(v))),
        "FLOAT8" => get::<f64>(row, idx).map(Value::from),
        "UUID" => get::<sqlx::types::Uuid>(row, idx).map(|v| Value::from(v.to_string())),
        "JSON" | "JSONB" => get::<Value>(row, idx),
        "BYTEA" => get::<Vec<u8>>(row, idx).map(|v| Value::from(STANDARD.encode(v))),
        // TEXT, VARCHAR, CHAR, NAME and anything else text-compatible.
        _ => get::<String>(row, idx).map(Value::from),
    };

    value.unwrap_or(Value::Null)
}

/// The SQL bridge. Disabled when no backend is configured.
#[derive(Clone, Default)]
pub struct SqlBridge {
    backend: Option<Arc<dyn SqlBackend>>,
}

impl SqlBridge {
    pub fn new(backend: Arc<dyn SqlBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Connect to postgres if an address is configured.
    pub async fn connect(config: &BackendConfig) -> Self {
        let Some(url) = config.url.as_deref().filter(|_| config.is_enabled()) else {
            info!("SQL bridge disabled: no address configured");
            return Self::disabled();
        };

        match PostgresBackend::connect(url, config.max_connections).await {
            Ok(backend) => {
                info!(max_connections = config.max_connections, "SQL bridge enabled");
                Self::new(Arc::new(backend))
            }
            Err(e) => {
                warn!(error = %e, "SQL bridge disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Result<&Arc<dyn SqlBackend>, BridgeError> {
        self.backend
            .as_ref()
            .ok_or(BridgeError::Disabled { bridge: BRIDGE })
    }
}

impl std::fmt::Debug for SqlBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBridge")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
