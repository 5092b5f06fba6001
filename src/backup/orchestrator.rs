// tenantbackup/src/backup/orchestrator.rs
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::archive::{ArchiveAssembler, CopyError};
use super::manifest::{BackupManifest, MANIFEST_PATH};
use super::objects::{ObjectBody, ObjectStore, ObjectWalk, WalkEvent, fetch_object};
use super::records::{RecordStore, export_record_set};
use crate::catalog::{ContainerRef, SourceCatalog};
use crate::errors::{BackupError, ItemError, Result};

/// Tuning for a single job.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Object downloads started ahead of the archive writer.
    pub fetch_concurrency: usize,
    /// Leaf keys the enumerator may queue ahead of the fetcher.
    pub enumeration_queue_depth: usize,
    pub include_manifest: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            fetch_concurrency: 4,
            enumeration_queue_depth: 64,
            include_manifest: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntry {
    pub path: String,
    pub reason: String,
}

/// Outcome of one job, owned by the orchestrator while the job runs.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub entries_written: usize,
    pub written_paths: Vec<String>,
    pub entries_failed: Vec<FailedEntry>,
    pub fatal: Option<BackupError>,
}

impl JobResult {
    fn new(job_id: Uuid) -> Self {
        JobResult {
            job_id,
            started_at: Utc::now(),
            entries_written: 0,
            written_paths: Vec::new(),
            entries_failed: Vec::new(),
            fatal: None,
        }
    }

    fn record_written(&mut self, path: String) {
        self.entries_written += 1;
        self.written_paths.push(path);
    }

    fn record_failed(&mut self, path: String, reason: String) {
        tracing::warn!(path = %path, reason = %reason, "backup entry skipped");
        self.entries_failed.push(FailedEntry { path, reason });
    }

    pub fn is_success(&self) -> bool {
        self.fatal.is_none()
    }
}

/// Result of fetching one queued walk event, in traversal order.
enum Fetched {
    Object {
        key: String,
        listed_size: Option<u64>,
        body: std::result::Result<ObjectBody, ItemError>,
    },
    ListingFailed {
        prefix: String,
        error: ItemError,
    },
    Skipped {
        key: String,
        reason: String,
    },
}

/// Aborts the enumeration task if the container export ends early.
struct WalkTask(JoinHandle<()>);

impl Drop for WalkTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs backup jobs against injected collaborators.
#[derive(Clone)]
pub struct BackupOrchestrator {
    catalog: Arc<SourceCatalog>,
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    options: BackupOptions,
}

impl BackupOrchestrator {
    pub fn new(
        catalog: Arc<SourceCatalog>,
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        options: BackupOptions,
    ) -> Self {
        BackupOrchestrator {
            catalog,
            records,
            objects,
            options,
        }
    }

    /// Runs one full export.
    ///
    /// Nothing is opened unless `is_admin` is set. The transport is opened
    /// only after that check and is owned by the archive assembler from then
    /// on. Item failures are collected in the returned [`JobResult`]; job
    /// failures end up in [`JobResult::fatal`].
    pub async fn run<W, F, Fut>(
        &self,
        job_id: Uuid,
        is_admin: bool,
        open_transport: F,
        cancel: &CancellationToken,
    ) -> JobResult
    where
        W: AsyncWrite + Unpin + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::io::Result<W>>,
    {
        let mut result = JobResult::new(job_id);
        if !is_admin {
            result.fatal = Some(BackupError::Unauthorized);
            return result;
        }

        let transport = match open_transport().await {
            Ok(transport) => transport,
            Err(e) => {
                result.fatal = Some(BackupError::TransportUnavailable(e.to_string()));
                return result;
            }
        };

        let mut assembler = ArchiveAssembler::new(transport);
        if let Err(e) = self.drive(&mut assembler, &mut result, cancel).await {
            assembler.abandon();
            result.fatal = Some(e);
        }
        result
    }

    async fn drive<W>(
        &self,
        assembler: &mut ArchiveAssembler<W>,
        result: &mut JobResult,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.export_record_sets(assembler, result, cancel).await?;

        for container in self.catalog.containers() {
            self.export_container(container, assembler, result, cancel).await?;
        }

        if result.entries_written == 0 {
            return Err(BackupError::EmptyBackup);
        }

        if self.options.include_manifest {
            let manifest = BackupManifest::from_result(result)
                .to_json()
                .map_err(|e| BackupError::Archive(format!("manifest serialization failed: {}", e)))?;
            assembler.write_bytes(MANIFEST_PATH, &manifest).await?;
        }

        assembler.close().await?;
        tracing::debug!(bytes_in = assembler.bytes_in(), "archive finalized");
        Ok(())
    }

    /// Record sets are exported one at a time so at most one is held in
    /// memory.
    async fn export_record_sets<W>(
        &self,
        assembler: &mut ArchiveAssembler<W>,
        result: &mut JobResult,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        for record_set in self.catalog.record_sets() {
            let path = record_set.archive_path();
            let exported =
                or_cancelled(cancel, export_record_set(self.records.as_ref(), record_set)).await?;
            match exported {
                Ok(payload) => {
                    let bytes = assembler.write_bytes(&path, &payload).await?;
                    tracing::info!(path = %path, bytes, "record set exported");
                    result.record_written(path);
                }
                Err(e) => result.record_failed(path, e.reason().to_string()),
            }
        }
        Ok(())
    }

    /// Walks one container and writes every leaf in traversal order.
    ///
    /// The walk runs in its own task, queueing events into a bounded channel.
    /// Downloads are started up to `fetch_concurrency` ahead, but results
    /// are consumed in the order the walk produced them.
    async fn export_container<W>(
        &self,
        container: &ContainerRef,
        assembler: &mut ArchiveAssembler<W>,
        result: &mut JobResult,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (tx, rx) = mpsc::channel(self.options.enumeration_queue_depth.max(1));
        let _walker = WalkTask(tokio::spawn(walk_container(
            self.objects.clone(),
            container.name.clone(),
            tx,
        )));

        let store = self.objects.clone();
        let name = container.name.clone();
        let mut fetched = Box::pin(
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .map(move |event| {
                let store = store.clone();
                let name = name.clone();
                async move {
                    match event {
                        WalkEvent::Leaf { key, size } => {
                            let body = fetch_object(store.as_ref(), &name, &key).await;
                            Fetched::Object {
                                key,
                                listed_size: size,
                                body,
                            }
                        }
                        WalkEvent::ListingFailed { prefix, error } => {
                            Fetched::ListingFailed { prefix, error }
                        }
                        WalkEvent::Skipped { key, reason } => Fetched::Skipped { key, reason },
                    }
                }
            })
            .buffered(self.options.fetch_concurrency.max(1)),
        );

        while let Some(item) = or_cancelled(cancel, fetched.next()).await? {
            match item {
                Fetched::ListingFailed { prefix, error } => {
                    result.record_failed(container.archive_path(&prefix), error.reason().to_string());
                }
                Fetched::Skipped { key, reason } => {
                    result.record_failed(container.archive_path(&key), reason);
                }
                Fetched::Object { key, body: Err(e), .. } => {
                    result.record_failed(container.archive_path(&key), e.reason().to_string());
                }
                Fetched::Object {
                    key,
                    listed_size,
                    body: Ok(mut body),
                } => {
                    let path = container.archive_path(&key);
                    let mut sink = assembler.open_entry(&path).await?;
                    match or_cancelled(cancel, sink.copy_from(&mut body.reader)).await? {
                        Ok(bytes) => {
                            sink.finish().await?;
                            tracing::debug!(
                                path = %path,
                                bytes,
                                listed_size = ?listed_size,
                                content_length = ?body.size,
                                "object exported"
                            );
                            result.record_written(path);
                        }
                        Err(CopyError::Source(e)) => {
                            // A truncated entry would pass its CRC check, so
                            // the archive is cut short instead of finished.
                            let reason = format!("download interrupted: {}", e);
                            result.record_failed(path.clone(), reason.clone());
                            return Err(BackupError::ObjectInterrupted { path, reason });
                        }
                        Err(CopyError::Sink(e)) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn walk_container(store: Arc<dyn ObjectStore>, container: String, tx: mpsc::Sender<WalkEvent>) {
    let mut walk = ObjectWalk::new(store.as_ref(), &container);
    while let Some(event) = walk.next().await {
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn or_cancelled<T>(cancel: &CancellationToken, fut: impl Future<Output = T>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        value = fut => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::tests::read_archive;
    use crate::backup::objects::tests::MemoryObjectStore;
    use crate::backup::records::tests::MemoryRecordStore;
    use serde_json::{Value, json};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::io::AsyncReadExt;

    fn orchestrator(
        record_sets: &[&str],
        containers: &[&str],
        records: MemoryRecordStore,
        objects: MemoryObjectStore,
        options: BackupOptions,
    ) -> anyhow::Result<BackupOrchestrator> {
        let catalog = SourceCatalog::new(
            record_sets.iter().map(|s| s.to_string()).collect(),
            containers.iter().map(|s| s.to_string()).collect(),
        )?;
        Ok(BackupOrchestrator::new(
            Arc::new(catalog),
            Arc::new(records),
            Arc::new(objects),
            options,
        ))
    }

    fn no_manifest() -> BackupOptions {
        BackupOptions {
            include_manifest: false,
            ..BackupOptions::default()
        }
    }

    /// Runs a job into an in-memory pipe and returns what the reader saw.
    async fn run_to_bytes(
        orchestrator: &BackupOrchestrator,
        is_admin: bool,
    ) -> anyhow::Result<(JobResult, Vec<u8>)> {
        let (client, mut server) = tokio::io::duplex(4096);
        let reader = tokio::spawn(async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.map(|_| received)
        });
        let cancel = CancellationToken::new();
        let result = orchestrator
            .run(Uuid::new_v4(), is_admin, move || async move { Ok::<_, std::io::Error>(client) }, &cancel)
            .await;
        let bytes = reader.await??;
        Ok((result, bytes))
    }

    fn scenario_records() -> MemoryRecordStore {
        MemoryRecordStore::default().with_table(
            "products",
            vec![
                json!({"id": 1, "name": "Widget"}),
                json!({"id": 2, "name": "Gadget"}),
                json!({"id": 3, "name": "Sprocket"}),
            ],
        )
    }

    fn scenario_objects() -> MemoryObjectStore {
        MemoryObjectStore::default()
            .with_object("avatars", "a.png", b"png-a")
            .with_object("avatars", "thumbs/b.png", b"png-b")
    }

    #[tokio::test]
    async fn test_partial_failure_scenario() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &["products", "customers"],
            &["avatars"],
            scenario_records(),
            scenario_objects(),
            no_manifest(),
        )?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        assert!(result.is_success(), "fatal: {:?}", result.fatal);

        let entries = read_archive(bytes).await?;
        let paths: Vec<&str> = entries.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "database/products.json",
                "storage/avatars/a.png",
                "storage/avatars/thumbs/b.png",
            ]
        );
        assert_eq!(result.entries_written, entries.len());

        let products: Value = serde_json::from_slice(&entries[0].1)?;
        assert_eq!(products.as_array().map(|rows| rows.len()), Some(3));
        assert_eq!(entries[2].1, b"png-b".to_vec());

        assert_eq!(result.entries_failed.len(), 1);
        assert_eq!(result.entries_failed[0].path, "database/customers.json");
        Ok(())
    }

    #[tokio::test]
    async fn test_manifest_lists_failures() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &["products", "customers"],
            &["avatars"],
            scenario_records(),
            scenario_objects(),
            BackupOptions::default(),
        )?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        let entries = read_archive(bytes).await?;

        let (last_path, manifest) = entries.last().ok_or_else(|| anyhow::anyhow!("empty archive"))?;
        assert_eq!(last_path, MANIFEST_PATH);
        assert_eq!(entries.len(), result.entries_written + 1);

        let manifest: Value = serde_json::from_slice(manifest)?;
        assert_eq!(manifest["job_id"], json!(result.job_id.to_string()));
        assert_eq!(manifest["entries_written"].as_array().map(|a| a.len()), Some(3));
        assert_eq!(manifest["entries_failed"][0]["path"], "database/customers.json");
        Ok(())
    }

    #[tokio::test]
    async fn test_unauthorized_does_no_io() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &["products"],
            &[],
            scenario_records(),
            MemoryObjectStore::default(),
            no_manifest(),
        )?;
        let opened = AtomicBool::new(false);
        let cancel = CancellationToken::new();

        let result = orchestrator
            .run(
                Uuid::new_v4(),
                false,
                || async {
                    opened.store(true, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(Vec::<u8>::new())
                },
                &cancel,
            )
            .await;

        assert!(matches!(result.fatal, Some(BackupError::Unauthorized)));
        assert!(!opened.load(Ordering::SeqCst));
        assert_eq!(result.entries_written, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_backup_is_fatal_and_sends_nothing() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &["customers"],
            &["avatars"],
            MemoryRecordStore::default(),
            MemoryObjectStore::default().failing_listing("avatars", ""),
            BackupOptions::default(),
        )?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        assert!(matches!(result.fatal, Some(BackupError::EmptyBackup)));
        assert!(bytes.is_empty());
        assert_eq!(result.entries_failed.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_catalog_is_empty_backup() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &[],
            &[],
            MemoryRecordStore::default(),
            MemoryObjectStore::default(),
            no_manifest(),
        )?;
        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        assert!(matches!(result.fatal, Some(BackupError::EmptyBackup)));
        assert!(bytes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_subtree_failure_keeps_siblings() -> anyhow::Result<()> {
        let objects = MemoryObjectStore::default()
            .with_object("docs", "a/b/lost.txt", b"x")
            .with_object("docs", "a/c/kept.txt", b"y")
            .with_object("docs", "top.txt", b"z")
            .failing_listing("docs", "a/b/");
        let orchestrator = orchestrator(&[], &["docs"], MemoryRecordStore::default(), objects, no_manifest())?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        let paths: Vec<String> = read_archive(bytes).await?.into_iter().map(|(p, _)| p).collect();

        assert_eq!(paths, vec!["storage/docs/a/c/kept.txt", "storage/docs/top.txt"]);
        assert_eq!(
            result.entries_failed,
            vec![FailedEntry {
                path: "storage/docs/a/b/".to_string(),
                reason: "listing a/b/ timed out".to_string(),
            }]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_only_that_object() -> anyhow::Result<()> {
        let objects = scenario_objects()
            .with_object("avatars", "c.png", b"png-c")
            .failing_download("avatars", "a.png");
        let orchestrator = orchestrator(&["products"], &["avatars"], scenario_records(), objects, no_manifest())?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        let paths: Vec<String> = read_archive(bytes).await?.into_iter().map(|(p, _)| p).collect();

        assert_eq!(
            paths,
            vec![
                "database/products.json",
                "storage/avatars/thumbs/b.png",
                "storage/avatars/c.png",
            ]
        );
        assert_eq!(result.entries_written, 3);
        assert_eq!(result.entries_failed[0].path, "storage/avatars/a.png");
        Ok(())
    }

    #[tokio::test]
    async fn test_interrupted_download_cuts_archive_short() -> anyhow::Result<()> {
        let objects = MemoryObjectStore::default()
            .with_object("c", "big.bin", b"HALF")
            .with_object("c", "ok.bin", b"ok")
            .interrupted_download("c", "big.bin");
        let orchestrator = orchestrator(&["products"], &["c"], scenario_records(), objects, BackupOptions::default())?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;

        assert!(matches!(
            &result.fatal,
            Some(BackupError::ObjectInterrupted { path, .. }) if path == "storage/c/big.bin"
        ));
        assert_eq!(result.written_paths, vec!["database/products.json"]);
        assert_eq!(result.entries_failed[0].path, "storage/c/big.bin");
        assert!(result.entries_failed[0].reason.starts_with("download interrupted"));
        // No central directory, so the partial entry cannot be extracted as valid.
        assert!(read_archive(bytes).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_unsafe_keys_are_counted_as_failures() -> anyhow::Result<()> {
        let objects = MemoryObjectStore::default()
            .with_object("docs", "../escape.txt", b"x")
            .with_object("docs", "ok.txt", b"y");
        let orchestrator = orchestrator(&[], &["docs"], MemoryRecordStore::default(), objects, BackupOptions::default())?;

        let (result, bytes) = run_to_bytes(&orchestrator, true).await?;
        assert!(result.is_success(), "fatal: {:?}", result.fatal);
        assert_eq!(result.entries_written + result.entries_failed.len(), 2);
        assert_eq!(
            result.entries_failed,
            vec![FailedEntry {
                path: "storage/docs/../escape.txt".to_string(),
                reason: "unsafe object key".to_string(),
            }]
        );

        let entries = read_archive(bytes).await?;
        assert_eq!(entries.len(), result.entries_written + 1);
        let manifest: Value = serde_json::from_slice(&entries[entries.len() - 1].1)?;
        assert_eq!(manifest["entries_failed"][0]["reason"], "unsafe object key");
        Ok(())
    }

    #[tokio::test]
    async fn test_order_is_stable_with_sequential_fetch() -> anyhow::Result<()> {
        let mut objects = MemoryObjectStore::default();
        for i in 0..40 {
            objects = objects.with_object("bulk", &format!("dir{}/file{}.bin", i % 5, i), &[i as u8; 32]);
        }
        let build = |concurrency: usize, objects| {
            orchestrator(
                &[],
                &["bulk"],
                MemoryRecordStore::default(),
                objects,
                BackupOptions {
                    fetch_concurrency: concurrency,
                    enumeration_queue_depth: 2,
                    include_manifest: false,
                },
            )
        };

        let mut objects_again = MemoryObjectStore::default();
        for i in 0..40 {
            objects_again =
                objects_again.with_object("bulk", &format!("dir{}/file{}.bin", i % 5, i), &[i as u8; 32]);
        }

        let (first, first_bytes) = run_to_bytes(&build(8, objects)?, true).await?;
        let (second, second_bytes) = run_to_bytes(&build(1, objects_again)?, true).await?;

        let first_paths: Vec<String> = read_archive(first_bytes).await?.into_iter().map(|(p, _)| p).collect();
        let second_paths: Vec<String> = read_archive(second_bytes).await?.into_iter().map(|(p, _)| p).collect();

        assert_eq!(first.entries_written, 40);
        assert_eq!(second.entries_written, 40);
        assert_eq!(first_paths, second_paths);
        Ok(())
    }

    #[tokio::test]
    async fn test_repeated_runs_produce_same_paths() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &["products", "customers"],
            &["avatars"],
            scenario_records(),
            scenario_objects(),
            BackupOptions::default(),
        )?;

        let (_, first) = run_to_bytes(&orchestrator, true).await?;
        let (_, second) = run_to_bytes(&orchestrator, true).await?;

        let first: BTreeSet<String> = read_archive(first).await?.into_iter().map(|(p, _)| p).collect();
        let second: BTreeSet<String> = read_archive(second).await?.into_iter().map(|(p, _)| p).collect();
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_transport_is_fatal() -> anyhow::Result<()> {
        let orchestrator = orchestrator(&["products"], &[], scenario_records(), MemoryObjectStore::default(), no_manifest())?;
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let cancel = CancellationToken::new();

        let result = orchestrator
            .run(Uuid::new_v4(), true, move || async move { Ok::<_, std::io::Error>(client) }, &cancel)
            .await;
        assert!(matches!(
            result.fatal,
            Some(BackupError::Transport(_)) | Some(BackupError::Archive(_))
        ));
        assert_eq!(result.entries_written, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_transport_open_failure_is_fatal() -> anyhow::Result<()> {
        let orchestrator = orchestrator(&["products"], &[], scenario_records(), MemoryObjectStore::default(), no_manifest())?;
        let cancel = CancellationToken::new();
        let result = orchestrator
            .run(
                Uuid::new_v4(),
                true,
                || async {
                    Err::<Vec<u8>, _>(std::io::Error::new(std::io::ErrorKind::Other, "no socket"))
                },
                &cancel,
            )
            .await;
        assert!(matches!(result.fatal, Some(BackupError::TransportUnavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_job_stops_without_finalizing() -> anyhow::Result<()> {
        let orchestrator = orchestrator(
            &["products"],
            &["avatars"],
            scenario_records(),
            scenario_objects(),
            no_manifest(),
        )?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator
            .run(Uuid::new_v4(), true, || async { Ok::<_, std::io::Error>(Vec::<u8>::new()) }, &cancel)
            .await;
        assert!(matches!(result.fatal, Some(BackupError::Cancelled)));
        assert_eq!(result.entries_written, 0);
        Ok(())
    }
}
