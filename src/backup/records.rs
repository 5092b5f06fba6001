// tenantbackup/src/backup/records.rs
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::catalog::RecordSetRef;
use crate::errors::{ItemError, chain_message};

/// One row of a record set, keyed by column name.
pub type Record = Map<String, Value>;

/// Read access to the tenant's relational data.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns every record of `record_set`, in the store's natural order.
    async fn select_all(&self, record_set: &str) -> anyhow::Result<Vec<Record>>;
}

/// Pulls one record set and renders it as a pretty-printed JSON array.
///
/// The whole record set is materialized before anything is written to the
/// archive, so a failed query never leaves a half-written entry behind.
pub async fn export_record_set(
    store: &dyn RecordStore,
    record_set: &RecordSetRef,
) -> Result<Vec<u8>, ItemError> {
    let unavailable = |reason: String| ItemError::SourceUnavailable {
        record_set: record_set.name.clone(),
        reason,
    };

    let records = store
        .select_all(&record_set.name)
        .await
        .map_err(|e| unavailable(chain_message(&e)))?;

    tracing::debug!(
        record_set = %record_set.name,
        rows = records.len(),
        "fetched record set"
    );

    serde_json::to_vec_pretty(&records).map_err(|e| unavailable(format!("serialization failed: {}", e)))
}
