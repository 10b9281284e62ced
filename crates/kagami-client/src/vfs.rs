//! Virtual filesystem over the worker channel.
//!
//! Presents directory/file semantics on top of [`ChannelClient`] and
//! keeps a local cache keyed by normalized path. Writes and deletes
//! update the cache optimistically — synchronously, before the request
//! goes out — so two rapid local operations on the same path observe a
//! consistent interim state while the confirmations are still in flight.
//! A delayed failure from the worker does **not** roll the cache back;
//! it is routed to the pluggable reconciliation hook instead, so a
//! stricter caller can add rollback without changing this contract.
//!
//! Reads are served from cache when possible (the cache's primary
//! performance contract); a miss sends `fileReadRequest` and awaits the
//! worker's push-style `fileOperation` result, matched by path rather
//! than by correlation id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use kagami_types::{
    EntryKind, FileEntry, FileOp, RequestIdSource, WireMessage, now_millis,
};

use crate::channel::{ChannelClient, ChannelError, ConnectionState, SubscriptionId};
use crate::constants::{EVENT_BUFFER, READ_TIMEOUT, REQUEST_TIMEOUT};

/// Filesystem-level failure.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    /// The channel is not connected. Operations fail fast; nothing is
    /// queued for later.
    #[error("filesystem unavailable: not connected")]
    Unavailable,
    /// No response arrived for this path within the deadline. The cache
    /// is untouched.
    #[error("operation timed out for {0}")]
    Timeout(String),
    /// The worker explicitly reported failure for this operation.
    #[error("remote operation failed on {path}: {detail}")]
    Remote { path: String, detail: String },
    /// Underlying channel failure.
    #[error(transparent)]
    Channel(ChannelError),
}

impl From<ChannelError> for VfsError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Unavailable | ChannelError::ConnectionClosed => Self::Unavailable,
            ChannelError::RequestTimeout { id, .. } => Self::Timeout(id.to_string()),
            other => Self::Channel(other),
        }
    }
}

/// One cached path. `content` is only trusted for `kind = File`;
/// directories cache no content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub kind: EntryKind,
    pub content: Option<Vec<u8>>,
    /// Local time of the last cache mutation (not worker mtime).
    pub modified_at: u64,
}

/// How a cache entry changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VfsChangeKind {
    Created,
    Updated,
    Removed,
}

/// Fired for every cache entry created, updated, or removed — by local
/// calls and by inbound pushes alike — so presentation layers refresh
/// without polling.
#[derive(Clone, Debug)]
pub struct VfsChange {
    pub path: String,
    pub kind: VfsChangeKind,
}

/// A failure the worker pushed for an operation we applied optimistically.
#[derive(Clone, Debug)]
pub struct RemoteFailure {
    pub operation: FileOp,
    pub path: String,
    pub detail: String,
}

type Reconciler = Box<dyn Fn(&RemoteFailure) + Send + Sync>;
type ReadWaiter = (u64, oneshot::Sender<Result<Vec<u8>, VfsError>>);

struct VfsInner {
    channel: ChannelClient,
    ids: Arc<dyn RequestIdSource>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Readers waiting on a push-style read result, keyed by path.
    pending_reads: Mutex<HashMap<String, Vec<ReadWaiter>>>,
    next_waiter: AtomicU64,
    changes: broadcast::Sender<VfsChange>,
    reconciler: Mutex<Option<Reconciler>>,
}

/// Directory/file semantics over the worker channel, with a local cache.
pub struct VirtualFilesystem {
    inner: Arc<VfsInner>,
    subscription: SubscriptionId,
}

impl VirtualFilesystem {
    /// Build a filesystem on a channel. Registers a standing subscriber
    /// for push-style `fileOperation` messages; unsolicited pushes update
    /// the cache too.
    pub fn new(channel: ChannelClient, ids: Arc<dyn RequestIdSource>) -> Self {
        let (changes, _) = broadcast::channel(EVENT_BUFFER);
        let inner = Arc::new(VfsInner {
            channel: channel.clone(),
            ids,
            cache: Mutex::new(HashMap::new()),
            pending_reads: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(1),
            changes,
            reconciler: Mutex::new(None),
        });

        let push_target = Arc::clone(&inner);
        let subscription = channel.subscribe(
            |msg| matches!(msg, WireMessage::FileOperation { .. }),
            move |msg| push_target.handle_push(msg),
        );

        Self { inner, subscription }
    }

    /// Observe cache changes.
    pub fn changes(&self) -> broadcast::Receiver<VfsChange> {
        self.inner.changes.subscribe()
    }

    /// Install the hook invoked when the worker reports a delayed failure
    /// for an optimistically applied operation. Default behavior is a
    /// logged warning; the cache is never rolled back automatically.
    pub fn set_reconciler(&self, hook: impl Fn(&RemoteFailure) + Send + Sync + 'static) {
        *self.inner.reconciler.lock() = Some(Box::new(hook));
    }

    /// Cache-only metadata for a path. No network.
    pub fn metadata(&self, path: &str) -> Option<CacheEntry> {
        self.inner.cache.lock().get(&normalize(path)).cloned()
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// List the children of a directory.
    ///
    /// The worker answers with its full flat listing; direct children of
    /// `path` are derived locally. On success the directory's cache
    /// bookkeeping is refreshed; a timeout leaves the cache untouched.
    pub async fn list(&self, path: &str) -> Result<Vec<FileEntry>, VfsError> {
        let path = normalize(path);
        let request_id = self.inner.ids.next();
        let response = self
            .inner
            .channel
            .request(
                WireMessage::FileListRequest { request_id },
                REQUEST_TIMEOUT,
            )
            .await?;
        let WireMessage::FileListResponse { files, .. } = response else {
            // take_pending only settles list calls with list responses.
            return Err(VfsError::Remote {
                path,
                detail: "unexpected response to list request".into(),
            });
        };

        self.inner.upsert(&path, EntryKind::Directory, None);
        Ok(direct_children(&path, &files))
    }

    /// Read a file.
    ///
    /// A cached `File` entry is returned immediately with no network
    /// call. Otherwise a read request goes out and the result is awaited
    /// as a push matched by path; concurrent readers of one path share
    /// the resolution.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let path = normalize(path);
        if let Some(entry) = self.inner.cache.lock().get(&path) {
            if entry.kind == EntryKind::File {
                if let Some(content) = &entry.content {
                    trace!(%path, "read served from cache");
                    return Ok(content.clone());
                }
            }
        }
        self.ensure_connected()?;

        let (waiter_id, rx, first) = {
            let mut pending = self.inner.pending_reads.lock();
            let waiters = pending.entry(path.clone()).or_default();
            let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            waiters.push((id, tx));
            (id, rx, waiters.len() == 1)
        };

        // Only the first waiter puts the request on the wire.
        if first {
            if let Err(e) = self
                .inner
                .channel
                .send(WireMessage::FileReadRequest { path: path.clone() })
                .await
            {
                self.inner.remove_waiter(&path, waiter_id);
                return Err(e.into());
            }
        }

        match tokio::time::timeout(READ_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(VfsError::Unavailable),
            Err(_elapsed) => {
                self.inner.remove_waiter(&path, waiter_id);
                Err(VfsError::Timeout(path))
            }
        }
    }

    /// Write a file.
    ///
    /// The cache is updated optimistically before the request is sent, so
    /// an immediately following `read` observes this write without a
    /// roundtrip. A delayed worker failure goes to the reconciler; the
    /// cache is not rolled back.
    pub async fn write(&self, path: &str, content: &[u8], overwrite: bool) -> Result<(), VfsError> {
        let path = normalize(path);
        self.ensure_connected()?;

        self.inner.upsert(&path, EntryKind::File, Some(content.to_vec()));

        self.inner
            .channel
            .send(WireMessage::FileWriteRequest {
                path,
                content: String::from_utf8_lossy(content).into_owned(),
                overwrite,
            })
            .await?;
        Ok(())
    }

    /// Delete a path. Cache entry removed optimistically.
    pub async fn delete(&self, path: &str) -> Result<(), VfsError> {
        let path = normalize(path);
        self.ensure_connected()?;

        self.inner.remove(&path);

        self.inner
            .channel
            .send(WireMessage::FileDeleteRequest { path })
            .await?;
        Ok(())
    }

    /// Rename via read → write → delete, in that order.
    ///
    /// A failed read aborts everything; a failed write suppresses the
    /// delete. The only copy of the data is never dropped.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), VfsError> {
        let content = self.read(old_path).await?;
        self.write(new_path, &content, true).await?;
        self.delete(old_path).await
    }

    fn ensure_connected(&self) -> Result<(), VfsError> {
        match self.inner.channel.status() {
            ConnectionState::Connected => Ok(()),
            _ => Err(VfsError::Unavailable),
        }
    }
}

impl Drop for VirtualFilesystem {
    fn drop(&mut self) {
        self.inner.channel.unsubscribe(self.subscription);
    }
}

impl VfsInner {
    /// Apply a push-style operation result from the worker.
    fn handle_push(&self, msg: &WireMessage) {
        let WireMessage::FileOperation { operation, path, content, error } = msg else {
            return;
        };
        let path = normalize(path);

        if let Some(detail) = error {
            let failure = RemoteFailure {
                operation: *operation,
                path: path.clone(),
                detail: detail.clone(),
            };
            // Fail any reader waiting on this path before reconciling.
            if *operation == FileOp::Read {
                for (_, tx) in self.take_waiters(&path) {
                    let _ = tx.send(Err(VfsError::Remote {
                        path: failure.path.clone(),
                        detail: failure.detail.clone(),
                    }));
                }
            }
            match &*self.reconciler.lock() {
                Some(hook) => hook(&failure),
                None => warn!(
                    path = %failure.path,
                    operation = %failure.operation,
                    "worker reported failure (cache not rolled back): {}",
                    failure.detail
                ),
            }
            return;
        }

        match operation {
            FileOp::Read | FileOp::Write | FileOp::Rename => {
                if let Some(text) = content {
                    let bytes = text.clone().into_bytes();
                    self.upsert(&path, EntryKind::File, Some(bytes.clone()));
                    for (_, tx) in self.take_waiters(&path) {
                        let _ = tx.send(Ok(bytes.clone()));
                    }
                } else {
                    // Confirmation without content: bump bookkeeping only.
                    debug!(%path, op = %operation, "operation confirmed without content");
                }
            }
            FileOp::Delete => self.remove(&path),
        }
    }

    /// Insert or update a cache entry and announce the change.
    fn upsert(&self, path: &str, kind: EntryKind, content: Option<Vec<u8>>) {
        let change = {
            let mut cache = self.cache.lock();
            let existed = cache.contains_key(path);
            cache.insert(
                path.to_string(),
                CacheEntry { kind, content, modified_at: now_millis() },
            );
            if existed { VfsChangeKind::Updated } else { VfsChangeKind::Created }
        };
        let _ = self.changes.send(VfsChange { path: path.to_string(), kind: change });
    }

    /// Remove a cache entry and announce it, if it existed.
    fn remove(&self, path: &str) {
        let existed = self.cache.lock().remove(path).is_some();
        if existed {
            let _ = self
                .changes
                .send(VfsChange { path: path.to_string(), kind: VfsChangeKind::Removed });
        }
    }

    fn take_waiters(&self, path: &str) -> Vec<ReadWaiter> {
        self.pending_reads.lock().remove(path).unwrap_or_default()
    }

    fn remove_waiter(&self, path: &str, waiter_id: u64) {
        let mut pending = self.pending_reads.lock();
        if let Some(waiters) = pending.get_mut(path) {
            waiters.retain(|(id, _)| *id != waiter_id);
            if waiters.is_empty() {
                pending.remove(path);
            }
        }
    }
}

// ============================================================================
// Path helpers
// ============================================================================

/// Normalize to an absolute, slash-separated path with no empty, `.`, or
/// `..` segments. `""` and `"/"` both normalize to `"/"`.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Derive the direct children of `base` from a flat listing of file
/// paths. A segment with descendants shows up once, as a directory.
fn direct_children(base: &str, files: &[String]) -> Vec<FileEntry> {
    let prefix = if base == "/" { String::new() } else { base.to_string() };
    let mut out: Vec<FileEntry> = Vec::new();
    for file in files {
        let full = normalize(file);
        let Some(rest) = full.strip_prefix(&format!("{prefix}/")) else {
            continue;
        };
        if rest.is_empty() {
            continue;
        }
        match rest.split_once('/') {
            None => {
                let entry = FileEntry::file(full.clone());
                if !out.iter().any(|e| e.path == entry.path) {
                    out.push(entry);
                }
            }
            Some((first, _)) => {
                let dir = format!("{prefix}/{first}");
                if !out.iter().any(|e| e.path == dir) {
                    out.push(FileEntry::directory(dir));
                }
            }
        }
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
