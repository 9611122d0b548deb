//! Tree reader
//!
//! Opens a snapshot's tree and resolves hash-referenced subdirectories only
//! when a traversal reaches them. A subdirectory that cannot be loaded is
//! reported for that branch alone; its siblings still resolve.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use cairn_core::wire::{decode_dir_entry, validate_dir_entry};
use cairn_core::{CairnError, CairnResult, Content, DirEntry, FileEntry, Snapshot, SubDirEntry};
use cairn_storage::ObjectStore;

use crate::report::{EntryFailure, RestoreReport};

/// Where a tree starts: a stored root or an in-memory directory
#[derive(Debug, Clone)]
pub enum TreeRoot {
    Hash(String),
    Inline(DirEntry),
}

impl From<&Snapshot> for TreeRoot {
    fn from(snapshot: &Snapshot) -> Self {
        TreeRoot::Hash(snapshot.root_hash.clone())
    }
}

#[derive(Clone)]
pub struct TreeReader {
    store: Arc<ObjectStore>,
}

/// One resolved directory
#[derive(Clone)]
pub struct DirView {
    reader: TreeReader,
    id: Option<String>,
    entry: DirEntry,
}

#[derive(Debug)]
pub enum Found {
    Dir(DirView),
    File(FileEntry),
}

#[derive(Debug)]
pub enum WalkItem {
    Dir { path: String, size: u64 },
    File { path: String, entry: FileEntry },
    /// A subdirectory that could not be resolved; the walk skips it
    Error { path: String, error: CairnError },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    /// Replace files that already exist at the target
    pub overwrite: bool,
    /// Record per-entry failures in the report instead of stopping
    pub keep_going: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    pub is_dir: bool,
}

impl TreeReader {
    pub fn new(store: Arc<ObjectStore>) -> Self {
        Self { store }
    }

    pub async fn open(&self, root: TreeRoot) -> CairnResult<DirView> {
        match root {
            TreeRoot::Hash(id) => self.load_dir(&id).await,
            TreeRoot::Inline(entry) => {
                validate_dir_entry(&entry)?;
                Ok(DirView {
                    reader: self.clone(),
                    id: None,
                    entry,
                })
            }
        }
    }

    pub async fn load_dir(&self, id: &str) -> CairnResult<DirView> {
        let bytes = self.store.get(id).await?;
        Ok(DirView {
            reader: self.clone(),
            id: Some(id.to_string()),
            entry: decode_dir_entry(&bytes)?,
        })
    }

    /// Depth-first traversal of everything below `root`.
    pub fn walk(&self, root: DirView) -> TreeWalker {
        TreeWalker::new(root)
    }

    /// Resolve a slash-separated path below `root`. An empty path is the root.
    pub async fn find(&self, root: TreeRoot, path: &str) -> CairnResult<Found> {
        let mut dir = self.open(root).await?;
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            if let Some(sub) = dir.entry.find_sub_dir(part) {
                let next = dir.resolve(sub).await?;
                dir = next;
                continue;
            }
            if i + 1 == parts.len() {
                if let Some(file) = dir.entry.find_file(part) {
                    return Ok(Found::File(file.clone()));
                }
            }
            return Err(CairnError::NotFound(path.to_string()));
        }
        Ok(Found::Dir(dir))
    }

    /// Reassemble a file in memory, checking its size and content hash.
    pub async fn read_file(&self, file: &FileEntry) -> CairnResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut hasher = self.store.hasher().streaming();
        for id in &file.chunk_hash {
            let bytes = self.store.get(id).await?;
            hasher.update(&bytes);
            out.extend_from_slice(&bytes);
        }
        check_content(file, out.len() as u64, hasher.finalize())?;
        Ok(out)
    }

    /// Recreate the tree under `target`.
    ///
    /// Each file is written to a temporary name next to its destination and
    /// renamed into place once its content hash checks out.
    pub async fn restore(
        &self,
        root: TreeRoot,
        target: &Path,
        options: RestoreOptions,
    ) -> CairnResult<RestoreReport> {
        tokio::fs::create_dir_all(target).await?;
        let root = self.open(root).await?;
        let mut report = RestoreReport {
            dirs: 1,
            ..Default::default()
        };

        let mut walker = self.walk(root);
        while let Some(item) = walker.next().await {
            let failed = match item {
                WalkItem::Dir { path, .. } => {
                    match tokio::fs::create_dir_all(target.join(&path)).await {
                        Ok(()) => {
                            report.dirs += 1;
                            None
                        }
                        Err(e) => Some((path, CairnError::Io(e))),
                    }
                }
                WalkItem::File { path, entry } => {
                    let dest = target.join(&path);
                    match self.restore_file(&entry, &dest, options.overwrite).await {
                        Ok(()) => {
                            debug!(path = %dest.display(), size = entry.size, "restored");
                            report.files += 1;
                            report.bytes += entry.size;
                            None
                        }
                        Err(e) => Some((path, e)),
                    }
                }
                WalkItem::Error { path, error } => Some((path, error)),
            };

            if let Some((path, error)) = failed {
                if !options.keep_going {
                    return Err(error);
                }
                let path = target.join(path);
                warn!(path = %path.display(), error = %error, "restore failed for entry");
                report.failures.push(EntryFailure { path, error });
            }
        }
        Ok(report)
    }

    /// Paths that differ between two trees, sorted by path.
    ///
    /// Subdirectories with the same content reference are skipped without
    /// being fetched. A directory present on one side only is reported once,
    /// not per descendant.
    pub async fn diff(&self, old: TreeRoot, new: TreeRoot) -> CairnResult<Vec<Change>> {
        if let (TreeRoot::Hash(a), TreeRoot::Hash(b)) = (&old, &new) {
            if a == b {
                return Ok(Vec::new());
            }
        }
        let old = self.open(old).await?;
        let new = self.open(new).await?;
        let mut changes = Vec::new();
        diff_dirs(String::new(), old, new, &mut changes).await?;
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    async fn restore_file(
        &self,
        file: &FileEntry,
        dest: &Path,
        overwrite: bool,
    ) -> CairnResult<()> {
        if !overwrite && tokio::fs::try_exists(dest).await? {
            return Err(CairnError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            )));
        }
        let tmp = part_path(dest, &file.name);
        match self.write_checked(file, &tmp).await {
            Ok(()) => {
                tokio::fs::rename(&tmp, dest).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn write_checked(&self, file: &FileEntry, tmp: &Path) -> CairnResult<()> {
        let mut out = tokio::fs::File::create(tmp).await?;
        let mut hasher = self.store.hasher().streaming();
        let mut written = 0u64;
        for id in &file.chunk_hash {
            let bytes = self.store.get(id).await?;
            hasher.update(&bytes);
            out.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        out.sync_all().await?;
        check_content(file, written, hasher.finalize())
    }
}

impl DirView {
    /// Content id of this directory, or `None` if it was inline.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn entry(&self) -> &DirEntry {
        &self.entry
    }

    pub fn size(&self) -> u64 {
        self.entry.size
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.entry.file
    }

    pub fn sub_dirs(&self) -> &[SubDirEntry] {
        &self.entry.sub_dir
    }

    /// Load a child, fetching it from the store if it is hash-referenced.
    pub async fn resolve(&self, sub: &SubDirEntry) -> CairnResult<DirView> {
        match sub.content()? {
            Content::Inline(entry) => Ok(DirView {
                reader: self.reader.clone(),
                id: None,
                entry: (**entry).clone(),
            }),
            Content::Hash(id) => self.reader.load_dir(id).await,
        }
    }

    pub async fn resolve_name(&self, name: &str) -> CairnResult<DirView> {
        let sub = self
            .entry
            .find_sub_dir(name)
            .ok_or_else(|| CairnError::NotFound(name.to_string()))?;
        self.resolve(sub).await
    }
}

impl std::fmt::Debug for DirView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirView")
            .field("id", &self.id)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

/// Depth-first, order-preserving walk. Within a directory its files come
/// first, then each subdirectory followed by its contents.
///
/// Walking again from the same `DirView` yields the same sequence.
pub struct TreeWalker {
    stack: Vec<Frame>,
}

struct Frame {
    path: String,
    view: DirView,
    next_file: usize,
    next_sub: usize,
    /// Size the hash-referenced children still have to account for; `None`
    /// once one of them could not be resolved or outgrew its parent
    unaccounted: Option<u64>,
    oversized: bool,
}

impl Frame {
    fn new(path: String, view: DirView) -> Self {
        let entry = &view.entry;
        let known = entry
            .file
            .iter()
            .map(|f| f.size)
            .chain(entry.sub_dir.iter().filter_map(|sub| match &sub.content {
                Some(Content::Inline(child)) => Some(child.size),
                _ => None,
            }))
            .fold(0u64, u64::saturating_add);
        Self {
            unaccounted: Some(entry.size.saturating_sub(known)),
            path,
            view,
            next_file: 0,
            next_sub: 0,
            oversized: false,
        }
    }

    fn account(&mut self, sub: &SubDirEntry, resolved: Option<u64>) {
        if !matches!(sub.content, Some(Content::Hash(_))) {
            return;
        }
        match (self.unaccounted, resolved) {
            (Some(left), Some(size)) => match left.checked_sub(size) {
                Some(rest) => self.unaccounted = Some(rest),
                None => {
                    self.unaccounted = None;
                    self.oversized = true;
                }
            },
            _ => self.unaccounted = None,
        }
    }

    /// Set once every child was resolved and their sizes do not add up to
    /// the size recorded for this directory.
    fn size_mismatch(&self) -> Option<CairnError> {
        let detail = match self.unaccounted {
            Some(0) => return None,
            Some(left) => format!("{left} bytes are unaccounted for"),
            None if self.oversized => "its contents are larger".to_string(),
            None => return None,
        };
        let path = if self.path.is_empty() { "/" } else { &self.path };
        Some(CairnError::corrupt(format!(
            "directory '{path}' records size {} but {detail}",
            self.view.entry.size
        )))
    }
}

impl TreeWalker {
    pub fn new(root: DirView) -> Self {
        Self {
            stack: vec![Frame::new(String::new(), root)],
        }
    }

    pub async fn next(&mut self) -> Option<WalkItem> {
        loop {
            let frame = self.stack.last_mut()?;

            if let Some(file) = frame.view.entry.file.get(frame.next_file) {
                frame.next_file += 1;
                return Some(WalkItem::File {
                    path: join(&frame.path, &file.name),
                    entry: file.clone(),
                });
            }

            if let Some(sub) = frame.view.entry.sub_dir.get(frame.next_sub).cloned() {
                frame.next_sub += 1;
                let path = join(&frame.path, &sub.name);
                let resolved = frame.view.resolve(&sub).await;
                frame.account(&sub, resolved.as_ref().ok().map(DirView::size));
                return Some(match resolved {
                    Ok(view) => {
                        let size = view.size();
                        self.stack.push(Frame::new(path.clone(), view));
                        WalkItem::Dir { path, size }
                    }
                    Err(error) => WalkItem::Error { path, error },
                });
            }

            let done = self.stack.pop()?;
            if let Some(error) = done.size_mismatch() {
                return Some(WalkItem::Error {
                    path: done.path,
                    error,
                });
            }
        }
    }
}

fn diff_dirs<'a>(
    prefix: String,
    old: DirView,
    new: DirView,
    out: &'a mut Vec<Change>,
) -> BoxFuture<'a, CairnResult<()>> {
    async move {
        let new_files: HashMap<&str, &FileEntry> =
            new.entry.file.iter().map(|f| (f.name.as_str(), f)).collect();
        let old_files: HashMap<&str, &FileEntry> =
            old.entry.file.iter().map(|f| (f.name.as_str(), f)).collect();

        for f in &old.entry.file {
            match new_files.get(f.name.as_str()) {
                None => out.push(change(&prefix, &f.name, ChangeKind::Removed, false)),
                Some(g) if g.content_hash != f.content_hash || g.size != f.size => {
                    out.push(change(&prefix, &f.name, ChangeKind::Modified, false))
                }
                Some(_) => {}
            }
        }
        for g in &new.entry.file {
            if !old_files.contains_key(g.name.as_str()) {
                out.push(change(&prefix, &g.name, ChangeKind::Added, false));
            }
        }

        let new_dirs: HashMap<&str, &SubDirEntry> =
            new.entry.sub_dir.iter().map(|d| (d.name.as_str(), d)).collect();
        for s in &old.entry.sub_dir {
            let Some(t) = new_dirs.get(s.name.as_str()) else {
                out.push(change(&prefix, &s.name, ChangeKind::Removed, true));
                continue;
            };
            if s.content == t.content {
                continue;
            }
            let a = old.resolve(s).await?;
            let b = new.resolve(t).await?;
            diff_dirs(join(&prefix, &s.name), a, b, &mut *out).await?;
        }
        for t in &new.entry.sub_dir {
            if old.entry.find_sub_dir(&t.name).is_none() {
                out.push(change(&prefix, &t.name, ChangeKind::Added, true));
            }
        }
        Ok(())
    }
    .boxed()
}

fn change(prefix: &str, name: &str, kind: ChangeKind, is_dir: bool) -> Change {
    Change {
        path: join(prefix, name),
        kind,
        is_dir,
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn part_path(dest: &Path, name: &str) -> PathBuf {
    dest.with_file_name(format!(".{name}.cairn-part"))
}

fn check_content(file: &FileEntry, len: u64, actual: String) -> CairnResult<()> {
    if len != file.size {
        return Err(CairnError::corrupt(format!(
            "file '{}' reassembles to {len} bytes, expected {}",
            file.name, file.size
        )));
    }
    if actual != file.content_hash {
        return Err(CairnError::HashMismatch {
            id: file.content_hash.clone(),
            actual,
        });
    }
    Ok(())
}
