// tenantbackup/src/backup/manifest.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::orchestrator::{FailedEntry, JobResult};

pub const MANIFEST_PATH: &str = "manifest.json";

/// Summary written as the last entry of an archive, so a partial backup can
/// be recognised without the server logs.
#[derive(Debug, Serialize)]
pub struct BackupManifest<'a> {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entries_written: &'a [String],
    pub entries_failed: &'a [FailedEntry],
}

impl<'a> BackupManifest<'a> {
    pub fn from_result(result: &'a JobResult) -> Self {
        BackupManifest {
            job_id: result.job_id,
            started_at: result.started_at,
            finished_at: Utc::now(),
            entries_written: &result.written_paths,
            entries_failed: &result.entries_failed,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }
}
