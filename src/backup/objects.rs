// tenantbackup/src/backup/objects.rs
use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::errors::{ItemError, chain_message};

/// One child returned when listing a path inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Name relative to the listed prefix, without a trailing `/`.
    pub name: String,
    /// Native object identifier. Folders have none.
    pub id: Option<String>,
    pub size: Option<u64>,
}

/// Content of a downloaded object.
pub struct ObjectBody {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub size: Option<u64>,
}

/// Read access to the tenant's object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists the immediate children of `prefix` (`""` or ending in `/`).
    async fn list(&self, container: &str, prefix: &str) -> anyhow::Result<Vec<ListedEntry>>;

    /// Starts downloading the object stored at `key`.
    async fn download(&self, container: &str, key: &str) -> anyhow::Result<ObjectBody>;
}

/// A listing entry, classified once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEntry {
    FolderMarker { prefix: String },
    LeafObject { key: String, size: Option<u64> },
}

impl ObjectEntry {
    /// Entries without a native identifier are folders, never empty files.
    pub fn classify(parent: &str, listed: ListedEntry) -> Self {
        let path = format!("{}{}", parent, listed.name.trim_end_matches('/'));
        match listed.id {
            Some(_) => ObjectEntry::LeafObject {
                key: path,
                size: listed.size,
            },
            None => ObjectEntry::FolderMarker {
                prefix: format!("{}/", path),
            },
        }
    }
}

/// Item produced by [`ObjectWalk`].
#[derive(Debug)]
pub enum WalkEvent {
    Leaf { key: String, size: Option<u64> },
    /// A leaf that cannot be given a safe archive path.
    Skipped { key: String, reason: String },
    /// Listing `prefix` failed; its subtree is skipped.
    ListingFailed { prefix: String, error: ItemError },
}

/// Depth-first walk of a container using an explicit frontier instead of
/// recursion. Each folder is listed only when the walk reaches it, and a
/// failed listing only loses that folder's subtree.
pub struct ObjectWalk<'a> {
    store: &'a dyn ObjectStore,
    container: String,
    frontier: Vec<ObjectEntry>,
}

impl<'a> ObjectWalk<'a> {
    pub fn new(store: &'a dyn ObjectStore, container: &str) -> Self {
        ObjectWalk {
            store,
            container: container.to_string(),
            frontier: vec![ObjectEntry::FolderMarker {
                prefix: String::new(),
            }],
        }
    }

    /// Next walk event, or `None` once the walk is exhausted.
    pub async fn next(&mut self) -> Option<WalkEvent> {
        while let Some(entry) = self.frontier.pop() {
            match entry {
                ObjectEntry::LeafObject { key, size } => {
                    if !is_safe_key(&key) {
                        tracing::warn!(container = %self.container, key = %key, "skipping object with unsafe key");
                        return Some(WalkEvent::Skipped {
                            key,
                            reason: UNSAFE_KEY_REASON.to_string(),
                        });
                    }
                    return Some(WalkEvent::Leaf { key, size });
                }
                ObjectEntry::FolderMarker { prefix } => {
                    match self.store.list(&self.container, &prefix).await {
                        Ok(children) => {
                            let mut classified: Vec<ObjectEntry> = children
                                .into_iter()
                                .map(|child| ObjectEntry::classify(&prefix, child))
                                .collect();
                            // Reversed so the stack pops children in listing order.
                            classified.reverse();
                            self.frontier.extend(classified);
                        }
                        Err(e) => {
                            let error = ItemError::ListingFailed {
                                container: self.container.clone(),
                                prefix: prefix.clone(),
                                reason: chain_message(&e),
                            };
                            return Some(WalkEvent::ListingFailed { prefix, error });
                        }
                    }
                }
            }
        }
        None
    }
}

/// Starts downloading one leaf object.
pub async fn fetch_object(
    store: &dyn ObjectStore,
    container: &str,
    key: &str,
) -> Result<ObjectBody, ItemError> {
    store
        .download(container, key)
        .await
        .map_err(|e| ItemError::ObjectUnavailable {
            container: container.to_string(),
            key: key.to_string(),
            reason: chain_message(&e),
        })
}

const UNSAFE_KEY_REASON: &str = "unsafe object key";

/// Keys must split into plain relative segments. Empty segments (`a//b`,
/// a leading `/`) are rejected along with `.` and `..`.
fn is_safe_key(key: &str) -> bool {
    key.split('/')
        .all(|segment| !segment.is_empty() && segment != ".." && segment != ".")
}
