// tenantbackup/src/server/download.rs
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::auth::bearer_token;
use super::{ApiError, AppState};
use crate::backup::{JobResult, run_backup_job};

const FIRST_CHUNK_BYTES: usize = 16 * 1024;

/// `POST /admin/backup`: streams a zip of the tenant's data.
///
/// The job writes into an in-memory pipe. The response is only committed
/// once the first archive byte is available, so a job that fails before
/// producing output still gets a JSON error. After that, failures can only
/// cut the stream short.
pub async fn backup_download(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers).ok_or(ApiError::Unauthenticated)?;
    let principal = state
        .authenticator
        .authenticate(token)
        .await
        .ok_or(ApiError::Unauthenticated)?;
    if !principal.is_admin {
        tracing::warn!(subject = %principal.subject, "backup requested without admin role");
        return Err(ApiError::Forbidden);
    }
    let slot = state
        .jobs
        .try_acquire(&principal.subject)
        .ok_or(ApiError::JobRunning)?;

    let (writer, mut reader) = tokio::io::duplex(state.stream_buffer_bytes);
    let cancel = CancellationToken::new();
    // Dropping the guard cancels the job, including when the client leaves
    // before the first byte and this future is dropped mid-read.
    let cancel_on_drop = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();
    let job = tokio::spawn(async move {
        let _slot = slot;
        run_backup_job(
            &orchestrator,
            &principal.subject,
            principal.is_admin,
            move || async move { Ok::<_, std::io::Error>(writer) },
            cancel,
        )
        .await
    });

    let mut first = vec![0u8; FIRST_CHUNK_BYTES];
    let n = reader
        .read(&mut first)
        .await
        .map_err(|e| ApiError::Internal(format!("backup stream failed: {}", e)))?;
    if n == 0 {
        let result = job
            .await
            .map_err(|e| ApiError::Internal(format!("backup task failed: {}", e)))?;
        return Err(match result.fatal {
            Some(e) => ApiError::Backup(e),
            None => ApiError::Internal("backup produced no output".to_string()),
        });
    }
    first.truncate(n);

    let body = futures::stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(first)) })
        .chain(ReaderStream::new(reader))
        .chain(job_outcome(job));

    let filename = format!("backup-{}.zip", Utc::now().format("%Y-%m-%dT%H-%M-%SZ"));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        Body::from_stream(CancelOnDrop {
            inner: Box::pin(body),
            _guard: cancel_on_drop,
        }),
    )
        .into_response())
}

type ChunkStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Response body that cancels its backup job when dropped.
struct CancelOnDrop {
    inner: ChunkStream,
    _guard: DropGuard,
}

impl Stream for CancelOnDrop {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Yields a single error if the job failed after streaming began, so the
/// connection is aborted rather than ended cleanly.
fn job_outcome(
    job: JoinHandle<JobResult>,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
    futures::stream::once(async move {
        match job.await {
            Ok(result) => match result.fatal {
                None => None,
                Some(e) => {
                    tracing::error!(job_id = %result.job_id, error = %e, "backup stream aborted");
                    Some(Err(std::io::Error::other(e.to_string())))
                }
            },
            Err(e) => Some(Err(std::io::Error::other(format!("backup task failed: {}", e)))),
        }
    })
    .filter_map(|outcome| async move { outcome })
}
