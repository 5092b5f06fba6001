// tenantbackup/src/backup/archive.rs
use async_zip::base::write::{EntryStreamWriter, ZipFileWriter};
use async_zip::{Compression, DeflateOption, ZipEntryBuilder};
use std::collections::HashSet;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::compat::{Compat, FuturesAsyncWriteCompatExt};

use crate::errors::{BackupError, Result};

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Streams named entries into a single zip archive written straight to the
/// output transport. Writes go to `W` as they are produced, so a slow reader
/// on the other end of `W` slows the producer down.
///
/// `Idle -> EntryOpen -> Idle -> ... -> Finalized`. An open entry mutably
/// borrows the assembler, so a second entry cannot be opened while one is
/// still being written.
pub struct ArchiveAssembler<W: AsyncWrite + Unpin> {
    writer: Option<ZipFileWriter<Compat<W>>>,
    deflate: DeflateOption,
    paths: HashSet<String>,
    entry_open: bool,
    bytes_in: u64,
}

/// Sink for the entry currently being written.
pub struct EntrySink<'a, W: AsyncWrite + Unpin> {
    inner: Compat<EntryStreamWriter<'a, Compat<W>>>,
    entry_open: &'a mut bool,
    bytes_in: &'a mut u64,
    written: u64,
}

/// Error while copying a source into an open entry.
#[derive(Debug)]
pub enum CopyError {
    /// The source stream failed partway. The entry holds a truncated body.
    Source(std::io::Error),
    /// Writing to the archive failed. The archive is unusable.
    Sink(BackupError),
}

impl<W: AsyncWrite + Unpin> ArchiveAssembler<W> {
    /// Attaches an assembler to `transport` using maximum deflate compression.
    pub fn new(transport: W) -> Self {
        ArchiveAssembler {
            writer: Some(ZipFileWriter::with_tokio(transport)),
            deflate: DeflateOption::Maximum,
            paths: HashSet::new(),
            entry_open: false,
            bytes_in: 0,
        }
    }

    /// Opens a new entry at `path`. Fails once the archive is finalized, or
    /// if the previous entry was dropped without being finished.
    pub async fn open_entry(&mut self, path: &str) -> Result<EntrySink<'_, W>> {
        let ArchiveAssembler {
            writer,
            deflate,
            paths,
            entry_open,
            bytes_in,
        } = self;

        let writer = writer.as_mut().ok_or(BackupError::AssemblerClosed)?;
        if *entry_open {
            return Err(BackupError::EntryAlreadyOpen);
        }
        if !paths.insert(path.to_string()) {
            return Err(BackupError::DuplicatePath(path.to_string()));
        }

        let builder = ZipEntryBuilder::new(path.to_string().into(), Compression::Deflate)
            .deflate_option(deflate.clone());
        let stream = writer.write_entry_stream(builder).await?;
        *entry_open = true;

        Ok(EntrySink {
            inner: stream.compat_write(),
            entry_open,
            bytes_in,
            written: 0,
        })
    }

    /// Writes a fully materialized entry.
    pub async fn write_bytes(&mut self, path: &str, payload: &[u8]) -> Result<u64> {
        let mut sink = self.open_entry(path).await?;
        sink.write(payload).await?;
        sink.finish().await
    }

    /// Uncompressed bytes accepted across all entries.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Writes the central directory, flushes and shuts down the transport,
    /// and hands it back.
    pub async fn close(&mut self) -> Result<W> {
        if self.entry_open {
            return Err(BackupError::EntryAlreadyOpen);
        }
        let writer = self.writer.take().ok_or(BackupError::AssemblerClosed)?;
        let mut transport = writer.close().await?.into_inner();
        transport.flush().await?;
        transport.shutdown().await?;
        Ok(transport)
    }

    /// Moves to the finalized state without writing the archive trailer.
    /// Whatever was already streamed stays a truncated archive.
    pub fn abandon(&mut self) {
        self.writer = None;
    }
}

impl<W: AsyncWrite + Unpin> EntrySink<'_, W> {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.inner.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Copies `source` into the entry until EOF. Returns the byte count.
    pub async fn copy_from<R>(&mut self, source: &mut R) -> std::result::Result<u64, CopyError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        let mut copied = 0u64;
        loop {
            let n = source.read(&mut buf).await.map_err(CopyError::Source)?;
            if n == 0 {
                return Ok(copied);
            }
            self.write(&buf[..n]).await.map_err(CopyError::Sink)?;
            copied += n as u64;
        }
    }

    /// Closes the entry, writing its data descriptor. Returns the number of
    /// uncompressed bytes the entry holds.
    pub async fn finish(mut self) -> Result<u64> {
        self.inner.flush().await?;
        self.inner.into_inner().close().await?;
        *self.entry_open = false;
        *self.bytes_in += self.written;
        Ok(self.written)
    }
}
