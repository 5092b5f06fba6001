use thiserror::Error;

/// Errors that end a backup job.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Caller is not authorized to run a backup")]
    Unauthorized,

    #[error("Output transport could not be opened: {0}")]
    TransportUnavailable(String),

    #[error("Backup produced no entries; refusing to deliver an empty archive")]
    EmptyBackup,

    #[error("Archive has already been finalized")]
    AssemblerClosed,

    #[error("Another archive entry is still open")]
    EntryAlreadyOpen,

    #[error("Archive path written twice: {0}")]
    DuplicatePath(String),

    #[error("Output transport write failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Archive encoding failed: {0}")]
    Archive(String),

    #[error("Download of {path} failed after its entry was started: {reason}")]
    ObjectInterrupted { path: String, reason: String },

    #[error("Backup job cancelled")]
    Cancelled,
}

impl From<async_zip::error::ZipError> for BackupError {
    fn from(err: async_zip::error::ZipError) -> Self {
        match err {
            async_zip::error::ZipError::UpstreamReadError(io) => BackupError::Transport(io),
            other => BackupError::Archive(other.to_string()),
        }
    }
}

/// Failures local to one item of the backup. The orchestrator records these
/// against the archive path and keeps going.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error("Record set {record_set} unavailable: {reason}")]
    SourceUnavailable { record_set: String, reason: String },

    #[error("Object {container}/{key} unavailable: {reason}")]
    ObjectUnavailable {
        container: String,
        key: String,
        reason: String,
    },

    #[error("Listing {container}/{prefix} failed: {reason}")]
    ListingFailed {
        container: String,
        prefix: String,
        reason: String,
    },
}

impl ItemError {
    /// Short reason recorded in the job result and manifest.
    pub fn reason(&self) -> &str {
        match self {
            ItemError::SourceUnavailable { reason, .. }
            | ItemError::ObjectUnavailable { reason, .. }
            | ItemError::ListingFailed { reason, .. } => reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Renders an error chain on one line, e.g. `outer: inner: root`.
pub fn chain_message(err: &anyhow::Error) -> String {
    err.chain()
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}
