pub(crate) mod archive;
pub(crate) mod manifest;
pub(crate) mod objects;
pub(crate) mod orchestrator;
pub(crate) mod records;

use std::future::Future;
use std::time::Instant;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

pub use objects::{ListedEntry, ObjectBody, ObjectStore};
pub use orchestrator::{BackupOptions, BackupOrchestrator, JobResult};
pub use records::{Record, RecordStore};

/// Public entry point for one backup job: runs the orchestrator inside a
/// `backup_job` span and logs the outcome.
pub async fn run_backup_job<W, F, Fut>(
    orchestrator: &BackupOrchestrator,
    subject: &str,
    is_admin: bool,
    open_transport: F,
    cancel: CancellationToken,
) -> JobResult
where
    W: AsyncWrite + Unpin + Send,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::io::Result<W>>,
{
    let job_id = Uuid::new_v4();
    let span = tracing::info_span!("backup_job", %job_id, subject = %subject);

    async move {
        let started = Instant::now();
        tracing::info!("starting tenant backup");

        let result = orchestrator
            .run(job_id, is_admin, open_transport, &cancel)
            .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result.fatal {
            None => tracing::info!(
                entries_written = result.entries_written,
                entries_failed = result.entries_failed.len(),
                elapsed_ms,
                "backup completed"
            ),
            Some(e) => tracing::error!(
                error = %e,
                entries_written = result.entries_written,
                entries_failed = result.entries_failed.len(),
                elapsed_ms,
                "backup failed"
            ),
        }
        result
    }
    .instrument(span)
    .await
}
