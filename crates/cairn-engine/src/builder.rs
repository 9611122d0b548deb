//! Tree builder
//!
//! Walks a source directory post-order and turns it into stored chunks and
//! `DirEntry` messages. Every subdirectory and every file is its own task.
//! Listing a directory and reading a file each need a permit from their own
//! worker pool, so the number of open source handles stays bounded however
//! wide the tree is. A directory waits for all of its children before its
//! own bytes are encoded, holding no permit and no handle while it waits.
//!
//! Small subdirectories are embedded in their parent, larger ones are stored
//! standalone and referenced by hash. Either way every chunk occurrence and
//! every standalone directory takes one reference in the object store.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use cairn_chunks::{Chunk, ChunkSizes, ChunkStream, Hasher};
use cairn_core::config::EngineConfig;
use cairn_core::wire::{decode_dir_entry, encode_dir_entry, MAX_INLINE_DEPTH};
use cairn_core::{CairnError, CairnResult, Content, DirEntry, FileEntry, SubDirEntry};
use cairn_storage::{ObjectStore, PutOutcome};

use crate::report::{BuildReport, EntryFailure};
use crate::snapshot::unix_seconds;

/// Chunks buffered between a file's reader thread and the store
const CHUNK_CHANNEL_DEPTH: usize = 4;

/// A tree whose root `DirEntry` is persisted in the store
#[derive(Debug)]
pub struct BuiltTree {
    pub root: DirEntry,
    pub root_hash: String,
    pub report: BuildReport,
}

#[derive(Clone)]
pub struct TreeBuilder {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<ObjectStore>,
    hasher: Hasher,
    sizes: ChunkSizes,
    inline_threshold: usize,
    fail_fast: bool,
    excludes: Vec<glob::Pattern>,
    file_permits: Arc<Semaphore>,
    dir_permits: Arc<Semaphore>,
    cancel: CancellationToken,
    /// Every spawned file and directory task, so a failed build can wait
    /// until none of them can still touch the store
    tasks: TaskTracker,
}

struct DirOutcome {
    entry: DirEntry,
    report: BuildReport,
}

type FileResult = (PathBuf, CairnResult<(FileEntry, BuildReport)>);
type SubDirResult = (PathBuf, CairnResult<(SubDirEntry, u64, BuildReport)>);

impl TreeBuilder {
    pub fn new(store: Arc<ObjectStore>, engine: &EngineConfig) -> CairnResult<Self> {
        Self::with_cancel(store, engine, CancellationToken::new())
    }

    /// A builder that stops with `Cancelled` once `cancel` fires.
    pub fn with_cancel(
        store: Arc<ObjectStore>,
        engine: &EngineConfig,
        cancel: CancellationToken,
    ) -> CairnResult<Self> {
        let sizes = ChunkSizes::try_from(&engine.chunk)?;
        let excludes = engine
            .exclude_patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p)
                    .map_err(|e| CairnError::Config(format!("exclude pattern {p:?}: {e}")))
            })
            .collect::<CairnResult<Vec<_>>>()?;

        Ok(Self {
            inner: Arc::new(Inner {
                hasher: store.hasher(),
                store,
                sizes,
                inline_threshold: engine.inline_threshold,
                fail_fast: engine.fail_fast,
                excludes,
                file_permits: Arc::new(Semaphore::new(engine.worker_count())),
                dir_permits: Arc::new(Semaphore::new(engine.worker_count())),
                cancel,
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Build `source` and persist its root.
    ///
    /// `previous` is the root of an earlier snapshot of the same source;
    /// files whose size and mtime are unchanged are taken from it without
    /// being re-read.
    pub async fn build(
        &self,
        source: &Path,
        previous: Option<DirEntry>,
    ) -> CairnResult<BuiltTree> {
        let meta = tokio::fs::metadata(source)
            .await
            .map_err(|e| CairnError::source_read(source, e))?;
        if !meta.is_dir() {
            return Err(CairnError::source_read(
                source,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let outcome = self.clone().build_dir(source.to_path_buf(), previous).await;
        let DirOutcome { entry, mut report } = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // Dropped join sets abort their tasks; wait until they are gone
                self.inner.tasks.close();
                self.inner.tasks.wait().await;
                self.inner.tasks.reopen();
                return Err(e);
            }
        };
        self.check_cancelled()?;

        let bytes = encode_dir_entry(&entry);
        let root_hash = self.inner.hasher.digest(&bytes);
        if self.store_object(&root_hash, bytes).await? {
            report.objects_written += 1;
        }

        info!(
            source = %source.display(),
            root = %root_hash,
            files = report.files,
            dirs = report.dirs,
            bytes = report.bytes,
            new_objects = report.objects_written,
            failures = report.failures.len(),
            "tree built"
        );
        Ok(BuiltTree {
            root: entry,
            root_hash,
            report,
        })
    }

    fn build_dir(
        self,
        path: PathBuf,
        previous: Option<DirEntry>,
    ) -> BoxFuture<'static, CairnResult<DirOutcome>> {
        async move {
            self.check_cancelled()?;
            let mut report = BuildReport {
                dirs: 1,
                ..Default::default()
            };
            let mut dirs: JoinSet<SubDirResult> = JoinSet::new();
            let mut files: JoinSet<FileResult> = JoinSet::new();

            {
                // Released before waiting on the children spawned below
                let _permit = self.acquire(&self.inner.dir_permits).await?;
                let mut read_dir = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|e| CairnError::source_read(&path, e))?;

                while let Some(dirent) = read_dir
                    .next_entry()
                    .await
                    .map_err(|e| CairnError::source_read(&path, e))?
                {
                    self.check_cancelled()?;
                    let child = dirent.path();
                    let Ok(name) = dirent.file_name().into_string() else {
                        let err =
                            io::Error::new(io::ErrorKind::InvalidData, "name is not valid UTF-8");
                        let err = CairnError::source_read(&child, err);
                        self.entry_failed(&mut report, &child, err)?;
                        continue;
                    };
                    if self.is_excluded(&name) {
                        debug!(path = %child.display(), "excluded");
                        report.skipped += 1;
                        continue;
                    }
                    let file_type = match dirent.file_type().await {
                        Ok(t) => t,
                        Err(e) => {
                            let err = CairnError::source_read(&child, e);
                            self.entry_failed(&mut report, &child, err)?;
                            continue;
                        }
                    };

                    if file_type.is_dir() {
                        let prev = previous.as_ref().and_then(|p| p.find_sub_dir(&name)).cloned();
                        let task = self.clone().build_sub_dir(name, child, prev);
                        dirs.spawn(self.inner.tasks.track_future(task));
                    } else if file_type.is_file() {
                        let prev = previous.as_ref().and_then(|p| p.find_file(&name)).cloned();
                        let task = self.clone().build_file(name, child, prev);
                        files.spawn(self.inner.tasks.track_future(task));
                    } else {
                        debug!(path = %child.display(), "skipping symlink or special file");
                        report.skipped += 1;
                    }
                }
            }

            let mut entry = DirEntry::empty();
            while let Some(joined) = files.join_next().await {
                let (child, result) = joined.map_err(join_err)?;
                match result {
                    Ok((file, file_report)) => {
                        entry.size += file.size;
                        entry.file.push(file);
                        report.merge(file_report);
                    }
                    Err(e) if e.is_entry_local() => self.entry_failed(&mut report, &child, e)?,
                    Err(e) => return Err(e),
                }
            }
            while let Some(joined) = dirs.join_next().await {
                let (child, result) = joined.map_err(join_err)?;
                match result {
                    Ok((sub, size, sub_report)) => {
                        entry.size += size;
                        entry.sub_dir.push(sub);
                        report.merge(sub_report);
                    }
                    Err(e) if e.is_entry_local() => self.entry_failed(&mut report, &child, e)?,
                    Err(e) => return Err(e),
                }
            }
            entry.sort_children();

            Ok(DirOutcome { entry, report })
        }
        .boxed()
    }

    async fn build_sub_dir(
        self,
        name: String,
        path: PathBuf,
        previous: Option<SubDirEntry>,
    ) -> SubDirResult {
        let result = async {
            let previous = match previous {
                Some(sub) => self.resolve_previous(&sub).await,
                None => None,
            };
            let DirOutcome { entry, mut report } =
                self.clone().build_dir(path.clone(), previous).await?;
            let size = entry.size;
            let sub = self.place_sub_dir(name, entry, &mut report).await?;
            Ok((sub, size, report))
        }
        .await;
        (path, result)
    }

    /// Inline `entry` if it encodes below the threshold, otherwise store it.
    async fn place_sub_dir(
        &self,
        name: String,
        entry: DirEntry,
        report: &mut BuildReport,
    ) -> CairnResult<SubDirEntry> {
        let bytes = encode_dir_entry(&entry);
        if bytes.len() < self.inner.inline_threshold && entry.inline_depth() < MAX_INLINE_DEPTH {
            report.dirs_inlined += 1;
            return Ok(SubDirEntry::inlined(name, entry));
        }
        let id = self.inner.hasher.digest(&bytes);
        if self.store_object(&id, bytes).await? {
            report.objects_written += 1;
        }
        report.dirs_stored += 1;
        Ok(SubDirEntry::hashed(name, id))
    }

    async fn build_file(
        self,
        name: String,
        path: PathBuf,
        previous: Option<FileEntry>,
    ) -> FileResult {
        let result = self.store_file(name, &path, previous).await;
        (path, result)
    }

    async fn store_file(
        &self,
        name: String,
        path: &Path,
        previous: Option<FileEntry>,
    ) -> CairnResult<(FileEntry, BuildReport)> {
        let _permit = self.acquire(&self.inner.file_permits).await?;

        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| CairnError::source_read(path, e))?;
        let modified = meta.modified().map(unix_seconds).unwrap_or(0);
        let mut report = BuildReport {
            files: 1,
            ..Default::default()
        };

        if let Some(prev) = previous {
            let unchanged = prev.size == meta.len() && prev.modified == modified;
            if unchanged && self.reuse_chunks(&prev).await {
                debug!(path = %path.display(), "unchanged since previous snapshot");
                report.files_reused = 1;
                report.bytes = prev.size;
                return Ok((FileEntry { name, ..prev }, report));
            }
        }

        let (tx, rx) = mpsc::channel::<Chunk>(CHUNK_CHANNEL_DEPTH);
        let reader = {
            let path = path.to_path_buf();
            let (sizes, hasher) = (self.inner.sizes, self.inner.hasher);
            tokio::task::spawn_blocking(move || read_chunks(path, sizes, hasher, tx))
        };
        let (chunk_hash, size, content_hash) = self.ingest(path, rx, reader, &mut report).await?;

        debug!(path = %path.display(), chunks = chunk_hash.len(), size, "file stored");
        report.bytes = size;
        Ok((
            FileEntry {
                name,
                content_hash,
                chunk_hash,
                size,
                modified,
            },
            report,
        ))
    }

    /// Store the chunks a reader hands over, in order.
    ///
    /// Returns the chunk ids, the byte count and the reader's content hash.
    /// If the file fails part way, the references already taken for it are
    /// released again so its chunks stay reclaimable.
    async fn ingest(
        &self,
        path: &Path,
        mut rx: mpsc::Receiver<Chunk>,
        mut reader: JoinHandle<CairnResult<String>>,
        report: &mut BuildReport,
    ) -> CairnResult<(Vec<String>, u64, String)> {
        let mut chunk_hash = Vec::new();
        let mut size = 0u64;
        let result = async {
            while let Some(chunk) = rx.recv().await {
                self.check_cancelled()?;
                if self.store_object(&chunk.hash, chunk.data).await? {
                    report.chunks_stored += 1;
                    report.objects_written += 1;
                } else {
                    report.chunks_deduplicated += 1;
                }
                size += chunk.length as u64;
                chunk_hash.push(chunk.hash);
            }
            (&mut reader).await.map_err(join_err)?
        }
        .await;

        match result {
            Ok(content_hash) => Ok((chunk_hash, size, content_hash)),
            Err(e) => {
                for id in &chunk_hash {
                    self.inner.store.release(id);
                }
                debug!(path = %path.display(), released = chunk_hash.len(), "file abandoned");
                Err(e)
            }
        }
    }

    /// Take new references to all chunks of `prev` if every one is present.
    async fn reuse_chunks(&self, prev: &FileEntry) -> bool {
        for id in &prev.chunk_hash {
            match self.inner.store.has(id).await {
                Ok(true) => {}
                Ok(false) | Err(_) => return false,
            }
        }
        prev.chunk_hash
            .iter()
            .all(|id| self.inner.store.retain(id).is_ok())
    }

    async fn resolve_previous(&self, sub: &SubDirEntry) -> Option<DirEntry> {
        match sub.content() {
            Ok(Content::Inline(entry)) => Some((**entry).clone()),
            Ok(Content::Hash(id)) => {
                let loaded = match self.inner.store.get(id).await {
                    Ok(bytes) => decode_dir_entry(&bytes),
                    Err(e) => Err(e),
                };
                match loaded {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        debug!(dir = %sub.name, error = %e, "previous directory unavailable");
                        None
                    }
                }
            }
            Err(_) => None,
        }
    }

    /// Returns true if this call wrote the object's bytes.
    async fn store_object(&self, id: &str, bytes: Vec<u8>) -> CairnResult<bool> {
        let store = &self.inner.store;
        if store.has(id).await? {
            store.retain(id)?;
            return Ok(false);
        }
        Ok(store.put(id, bytes).await? == PutOutcome::Stored)
    }

    async fn acquire(&self, permits: &Arc<Semaphore>) -> CairnResult<OwnedSemaphorePermit> {
        tokio::select! {
            permit = permits.clone().acquire_owned() => permit
                .map_err(|e| CairnError::Other(anyhow::anyhow!("worker pool closed: {e}"))),
            _ = self.inner.cancel.cancelled() => Err(CairnError::Cancelled),
        }
    }

    fn entry_failed(
        &self,
        report: &mut BuildReport,
        path: &Path,
        error: CairnError,
    ) -> CairnResult<()> {
        if self.inner.fail_fast {
            return Err(error);
        }
        warn!(path = %path.display(), error = %error, "skipping unreadable entry");
        report.failures.push(EntryFailure {
            path: path.to_path_buf(),
            error,
        });
        Ok(())
    }

    fn is_excluded(&self, name: &str) -> bool {
        self.inner.excludes.iter().any(|p| p.matches(name))
    }

    fn check_cancelled(&self) -> CairnResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(CairnError::Cancelled);
        }
        Ok(())
    }
}

/// Runs on the blocking pool. Returns the file's content hash once every
/// chunk has been handed over.
fn read_chunks(
    path: PathBuf,
    sizes: ChunkSizes,
    hasher: Hasher,
    tx: mpsc::Sender<Chunk>,
) -> CairnResult<String> {
    let file = std::fs::File::open(&path).map_err(|e| CairnError::source_read(&path, e))?;
    let mut content = hasher.streaming();
    for chunk in ChunkStream::new(file, sizes, hasher, path.clone()) {
        let chunk = chunk?;
        content.update(&chunk.data);
        if tx.blocking_send(chunk).is_err() {
            // The receiving side already failed or was cancelled
            return Err(CairnError::Cancelled);
        }
    }
    Ok(content.finalize())
}

fn join_err(e: JoinError) -> CairnError {
    CairnError::Other(anyhow::anyhow!("builder task failed: {e}"))
}
