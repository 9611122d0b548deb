//! Snapshot manager
//!
//! Drives one backup pass and owns the write ordering that keeps snapshots
//! consistent: tree objects first, then the reference ledger, then the
//! snapshot record. A run that fails or is cancelled before the record is
//! written leaves only orphaned objects behind, which `gc` reclaims.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cairn_core::config::EngineConfig;
use cairn_core::wire::decode_dir_entry;
use cairn_core::{CairnResult, Content, DirEntry, Snapshot};
use cairn_storage::records::validate_archive_name;
use cairn_storage::{ObjectStore, Repository, SnapshotId, SnapshotLog, SweepStats};

use crate::builder::TreeBuilder;
use crate::report::BuildReport;

/// Seconds since the Unix epoch, negative for earlier times.
pub fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

/// A snapshot that was written, with the report of the build behind it
#[derive(Debug)]
pub struct CreatedSnapshot {
    pub id: SnapshotId,
    pub snapshot: Snapshot,
    pub report: BuildReport,
}

/// Outcome of `recount`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecountStats {
    pub snapshots: usize,
    pub objects: usize,
    /// Directory objects that could not be loaded; their contents are not counted
    pub unresolved: usize,
}

pub struct SnapshotManager {
    store: Arc<ObjectStore>,
    log: SnapshotLog,
    engine: EngineConfig,
    archive: String,
}

impl SnapshotManager {
    pub fn new(
        repo: &Repository,
        engine: EngineConfig,
        archive: impl Into<String>,
    ) -> CairnResult<Self> {
        let archive = archive.into();
        validate_archive_name(&archive)?;
        Ok(Self {
            store: repo.store().clone(),
            log: repo.log().clone(),
            engine,
            archive,
        })
    }

    pub fn archive(&self) -> &str {
        &self.archive
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub async fn create_snapshot(&self, source: &Path) -> CairnResult<CreatedSnapshot> {
        self.create_snapshot_with(source, CancellationToken::new()).await
    }

    /// Back up `source`; cancelling `cancel` aborts without writing a record.
    pub async fn create_snapshot_with(
        &self,
        source: &Path,
        cancel: CancellationToken,
    ) -> CairnResult<CreatedSnapshot> {
        let started = unix_seconds(SystemTime::now());
        let previous = if self.engine.reuse_unchanged {
            self.previous_root().await
        } else {
            None
        };

        let builder = TreeBuilder::with_cancel(self.store.clone(), &self.engine, cancel)?;
        let built = match builder.build(source, previous).await {
            Ok(built) => built,
            Err(e) => {
                warn!(archive = %self.archive, error = %e, "snapshot aborted");
                // Forget the references this run took; its objects become orphans.
                // A failed reload leaves the store refusing ledger writes.
                if let Err(reload) = self.store.reload().await {
                    warn!(error = %reload, "could not reload reference ledger");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.flush().await {
            warn!(archive = %self.archive, error = %e, "reference ledger not written");
            if let Err(reload) = self.store.reload().await {
                warn!(error = %reload, "could not reload reference ledger");
            }
            return Err(e);
        }

        let snapshot = Snapshot {
            root_hash: built.root_hash,
            started,
            finished: started.max(unix_seconds(SystemTime::now())),
        };
        let id = match self.log.append(&self.archive, &snapshot).await {
            Ok(id) => id,
            Err(e) => {
                warn!(archive = %self.archive, error = %e, "snapshot record not written");
                // The flushed ledger holds this run's references with no
                // record owning them
                if let Err(undo) = self.release_tree(&snapshot.root_hash).await {
                    warn!(error = %undo, "could not release references of the unwritten snapshot");
                }
                return Err(e);
            }
        };

        info!(
            snapshot = %id,
            root = %snapshot.root_hash,
            files = built.report.files,
            bytes = built.report.bytes,
            reused = built.report.files_reused,
            new_objects = built.report.objects_written,
            failures = built.report.failures.len(),
            "snapshot created"
        );
        Ok(CreatedSnapshot {
            id,
            snapshot,
            report: built.report,
        })
    }

    pub async fn list(&self) -> CairnResult<Vec<SnapshotId>> {
        self.log.list(&self.archive).await
    }

    pub async fn latest(&self) -> CairnResult<Option<SnapshotId>> {
        self.log.latest(&self.archive).await
    }

    pub async fn load(&self, id: &SnapshotId) -> CairnResult<Snapshot> {
        self.log.load(id).await
    }

    /// Drop a snapshot: delete its record and release every reference its
    /// tree holds. Objects are reclaimed by the next `gc`.
    ///
    /// The record goes first, so a crash in between leaks references
    /// (repaired by `recount`) instead of freeing objects still in use.
    pub async fn forget(&self, id: &SnapshotId) -> CairnResult<()> {
        let snapshot = self.log.load(id).await?;
        self.log.delete(id).await?;
        let objects = self.release_tree(&snapshot.root_hash).await?;
        info!(snapshot = %id, objects, "snapshot forgotten");
        Ok(())
    }

    /// Delete every object no snapshot references.
    pub async fn gc(&self) -> CairnResult<SweepStats> {
        self.store.sweep().await
    }

    /// Rebuild the reference ledger from the snapshots of every archive.
    pub async fn recount(&self) -> CairnResult<RecountStats> {
        let ids = self.log.list_all().await?;
        let mut refs = HashMap::new();
        let mut stats = RecountStats {
            snapshots: ids.len(),
            ..Default::default()
        };
        for id in &ids {
            let snapshot = self.log.load(id).await?;
            stats.unresolved += self.collect_refs(&snapshot.root_hash, &mut refs).await;
        }
        stats.objects = refs.len();

        self.store.replace_refs(refs);
        self.store.flush().await?;
        info!(
            snapshots = stats.snapshots,
            objects = stats.objects,
            unresolved = stats.unresolved,
            "reference ledger rebuilt"
        );
        Ok(stats)
    }

    /// Release every reference the tree under `root` holds and flush.
    /// Returns the number of distinct objects released.
    async fn release_tree(&self, root: &str) -> CairnResult<usize> {
        let mut refs = HashMap::new();
        let unresolved = self.collect_refs(root, &mut refs).await;
        if unresolved > 0 {
            warn!(
                root,
                unresolved, "some directories could not be read; their references stay"
            );
        }
        for (object, count) in &refs {
            for _ in 0..*count {
                self.store.release(object);
            }
        }
        self.store.flush().await?;
        Ok(refs.len())
    }

    async fn previous_root(&self) -> Option<DirEntry> {
        let loaded: CairnResult<Option<(SnapshotId, DirEntry)>> = async {
            let Some(id) = self.log.latest(&self.archive).await? else {
                return Ok(None);
            };
            let snapshot = self.log.load(&id).await?;
            let bytes = self.store.get(&snapshot.root_hash).await?;
            decode_dir_entry(&bytes).map(|root| Some((id, root)))
        }
        .await;

        match loaded {
            Ok(Some((id, root))) => {
                debug!(snapshot = %id, "comparing against previous snapshot");
                Some(root)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(
                    archive = %self.archive,
                    error = %e,
                    "previous snapshot unusable, reading every file"
                );
                None
            }
        }
    }

    /// Count the references the tree under `root` holds: one per stored
    /// directory, including the root, and one per chunk occurrence.
    /// Returns the number of directories that could not be loaded.
    async fn collect_refs(&self, root: &str, refs: &mut HashMap<String, u64>) -> usize {
        *refs.entry(root.to_string()).or_insert(0) += 1;
        match self.load_dir(root).await {
            Ok(entry) => self.collect_entry_refs(entry, refs).await,
            Err(e) => {
                warn!(dir = root, error = %e, "cannot load directory");
                1
            }
        }
    }

    fn collect_entry_refs<'a>(
        &'a self,
        entry: DirEntry,
        refs: &'a mut HashMap<String, u64>,
    ) -> BoxFuture<'a, usize> {
        async move {
            for file in &entry.file {
                for chunk in &file.chunk_hash {
                    *refs.entry(chunk.clone()).or_insert(0) += 1;
                }
            }
            let mut unresolved = 0;
            for sub in entry.sub_dir {
                match sub.content {
                    Some(Content::Inline(child)) => {
                        unresolved += self.collect_entry_refs(*child, refs).await;
                    }
                    Some(Content::Hash(id)) => {
                        *refs.entry(id.clone()).or_insert(0) += 1;
                        match self.load_dir(&id).await {
                            Ok(child) => unresolved += self.collect_entry_refs(child, refs).await,
                            Err(e) => {
                                warn!(dir = %id, error = %e, "cannot load directory");
                                unresolved += 1;
                            }
                        }
                    }
                    None => unresolved += 1,
                }
            }
            unresolved
        }
        .boxed()
    }

    async fn load_dir(&self, id: &str) -> CairnResult<DirEntry> {
        let bytes = self.store.get(id).await?;
        decode_dir_entry(&bytes)
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("archive", &self.archive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::CairnError;

    #[test]
    fn unix_seconds_handles_pre_epoch_times() {
        let before = UNIX_EPOCH - std::time::Duration::from_secs(90);
        assert_eq!(unix_seconds(before), -90);
        let after = UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        assert_eq!(unix_seconds(after), 1_700_000_000);
    }

    #[tokio::test]
    async fn rejects_bad_archive_names() {
        let repo = Repository::open_or_init(
            cairn_storage::memory_operator().unwrap(),
            &EngineConfig::default(),
        )
        .await
        .unwrap();
        assert!(matches!(
            SnapshotManager::new(&repo, EngineConfig::default(), "a/b"),
            Err(CairnError::Config(_))
        ));
        assert!(SnapshotManager::new(&repo, EngineConfig::default(), "laptop").is_ok());
    }
}
