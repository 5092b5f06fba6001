// tenantbackup/src/stores/postgres.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use url::Url;

use crate::backup::{Record, RecordStore};

/// Record store over the tenant's PostgreSQL database.
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let display_url = redact_url(database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to connect to database {}", display_url))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .with_context(|| format!("Database {} did not answer a health query", display_url))?;

        tracing::info!(database = %display_url, "connected to record store");
        Ok(PostgresRecordStore { pool })
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn select_all(&self, record_set: &str) -> Result<Vec<Record>> {
        // Names come from the validated catalog; quoting keeps case intact.
        let query = format!(
            "SELECT to_jsonb(t) AS record FROM \"{}\" AS t ORDER BY 1",
            record_set
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to fetch rows from table {}", record_set))?;

        rows.iter()
            .map(|row| {
                let value: Value = row
                    .try_get("record")
                    .with_context(|| format!("Failed to decode row of table {}", record_set))?;
                match value {
                    Value::Object(map) => Ok(map),
                    other => Err(anyhow::anyhow!(
                        "Row of table {} is not a JSON object: {}",
                        record_set,
                        other
                    )),
                }
            })
            .collect()
    }
}

/// Strips the password from a connection URL for logging.
fn redact_url(database_url: &str) -> Result<String> {
    let mut parsed = Url::parse(database_url).context("Invalid PostgreSQL URL")?;
    if parsed.password().is_some() {
        parsed
            .set_password(Some("***"))
            .map_err(|_| anyhow::anyhow!("Cannot redact password in database URL"))?;
    }
    Ok(parsed.to_string())
}
