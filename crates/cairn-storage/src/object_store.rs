//! Content-addressed object store with reference counting
//!
//! Objects (chunks and standalone directory entries) live at
//! `objects/<id[0..2]>/<id>`. Writes of the same id are single-flighted in
//! process and, where the backend supports it, guarded by a conditional
//! create-if-absent write. Reference counts are kept in memory and persisted
//! as a JSON ledger at `index/refs.json` by [`ObjectStore::flush`].
//!
//! Nothing is ever deleted implicitly: `release` only decrements, and objects
//! with no references are reclaimed by an explicit [`ObjectStore::sweep`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use cairn_chunks::{is_content_id, Hasher};
use cairn_core::{CairnError, CairnResult};

pub const OBJECTS_PREFIX: &str = "objects/";
pub const LEDGER_KEY: &str = "index/refs.json";

const LEDGER_VERSION: u32 = 1;

/// What a `put` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Bytes were written to the backend
    Stored,
    /// The object already existed; only its reference count changed
    Deduplicated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Objects with at least one reference
    pub objects: usize,
    /// Sum of all reference counts
    pub references: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub kept: usize,
    pub deleted: usize,
    /// Deleted objects that were not in the ledger at all
    pub orphans: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Ledger {
    version: u32,
    refs: BTreeMap<String, u64>,
}

pub struct ObjectStore {
    op: Operator,
    hasher: Hasher,
    paranoid: bool,
    conditional_writes: bool,
    refs: DashMap<String, u64>,
    /// Writes in flight, one per id; removed once the write settles
    slots: DashMap<String, Arc<OnceCell<()>>>,
    dirty: AtomicBool,
    /// Set when the in-memory counts could not be brought back in line with
    /// the ledger; ledger writes are refused until counts are replaced
    poisoned: AtomicBool,
}

/// Storage key for a content id, or `CorruptEntry` if `id` is not one.
pub fn object_key(id: &str) -> CairnResult<String> {
    if !is_content_id(id) {
        return Err(CairnError::corrupt(format!("invalid content id {id:?}")));
    }
    Ok(format!("{OBJECTS_PREFIX}{}/{id}", &id[..2]))
}

impl ObjectStore {
    /// Open the store and load its reference ledger (empty if none yet).
    pub async fn open(op: Operator, hasher: Hasher, paranoid: bool) -> CairnResult<Self> {
        let ledger = load_ledger(&op).await?;
        let conditional_writes = op.info().full_capability().write_with_if_not_exists;
        debug!(
            objects = ledger.refs.len(),
            conditional_writes, paranoid, "object store opened"
        );

        Ok(Self {
            op,
            hasher,
            paranoid,
            conditional_writes,
            refs: ledger.refs.into_iter().collect(),
            slots: DashMap::new(),
            dirty: AtomicBool::new(false),
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn hasher(&self) -> Hasher {
        self.hasher
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Store `bytes` under `id` and take one reference to it.
    ///
    /// Concurrent puts of the same id write at most once; every caller gets
    /// its reference. Existing bytes are trusted unless paranoid mode is on,
    /// in which case the incoming bytes are checked against `id` first.
    pub async fn put(&self, id: &str, bytes: Vec<u8>) -> CairnResult<PutOutcome> {
        let key = object_key(id)?;
        if self.paranoid {
            self.verify(id, &bytes)?;
        }

        let slot = self
            .slots
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let wrote = AtomicBool::new(false);
        let (key_ref, wrote_ref) = (&key, &wrote);
        let written = slot
            .get_or_try_init(|| async move {
                let stored = self.write_if_absent(key_ref, bytes).await?;
                wrote_ref.store(stored, Ordering::Relaxed);
                Ok::<_, CairnError>(())
            })
            .await
            .map(|_| ());
        // Later puts of this id find the object in the backend
        self.slots.remove_if(id, |_, current| Arc::ptr_eq(current, &slot));
        written?;

        self.add_ref(id);
        if wrote.load(Ordering::Relaxed) {
            debug!(id, "object stored");
            Ok(PutOutcome::Stored)
        } else {
            Ok(PutOutcome::Deduplicated)
        }
    }

    /// Take one more reference to an object already in the store.
    pub fn retain(&self, id: &str) -> CairnResult<u64> {
        object_key(id)?;
        Ok(self.add_ref(id))
    }

    pub async fn get(&self, id: &str) -> CairnResult<Vec<u8>> {
        let key = object_key(id)?;
        let bytes = match self.op.read(&key).await {
            Ok(buf) => buf.to_vec(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CairnError::NotFound(id.to_string()))
            }
            Err(e) => return Err(read_err(&key, e)),
        };
        if self.paranoid {
            self.verify(id, &bytes)?;
        }
        Ok(bytes)
    }

    /// Whether the object is present, either known to the ledger or found in
    /// the backend (e.g. left behind by an interrupted run).
    pub async fn has(&self, id: &str) -> CairnResult<bool> {
        let key = object_key(id)?;
        if self.refs.get(id).is_some_and(|count| *count > 0)
            || self.slots.get(id).is_some_and(|slot| slot.initialized())
        {
            return Ok(true);
        }
        self.exists(&key).await
    }

    /// Drop one reference. Returns the remaining count; never deletes.
    pub fn release(&self, id: &str) -> u64 {
        let remaining = match self.refs.get_mut(id) {
            Some(mut count) => {
                if *count == 0 {
                    warn!(id, "release of an object with no references");
                }
                *count = count.saturating_sub(1);
                *count
            }
            None => {
                warn!(id, "release of an object unknown to the ledger");
                0
            }
        };
        self.dirty.store(true, Ordering::Release);
        remaining
    }

    pub fn ref_count(&self, id: &str) -> u64 {
        self.refs.get(id).map(|count| *count).unwrap_or(0)
    }

    pub fn stats(&self) -> StoreStats {
        self.refs
            .iter()
            .filter(|entry| *entry.value() > 0)
            .fold(StoreStats::default(), |mut stats, entry| {
                stats.objects += 1;
                stats.references += *entry.value();
                stats
            })
    }

    /// Replace every reference count, e.g. after recounting from snapshots.
    pub fn replace_refs(&self, counts: HashMap<String, u64>) {
        self.refs.clear();
        for (id, count) in counts {
            self.refs.insert(id, count);
        }
        self.poisoned.store(false, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// Discard reference changes made since the last flush.
    ///
    /// Used after a failed build so that its references do not leak into the
    /// next flush; objects it wrote become orphans for `sweep`. If the ledger
    /// cannot be read, the store refuses to flush or sweep until the counts
    /// are rebuilt with [`ObjectStore::replace_refs`].
    pub async fn reload(&self) -> CairnResult<()> {
        let ledger = match load_ledger(&self.op).await {
            Ok(ledger) => ledger,
            Err(e) => {
                self.poisoned.store(true, Ordering::Release);
                return Err(e);
            }
        };
        self.refs.clear();
        for (id, count) in ledger.refs {
            self.refs.insert(id, count);
        }
        self.poisoned.store(false, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Persist the reference ledger if it changed since the last flush.
    ///
    /// The whole document is rewritten in one backend write; the fs backend
    /// stages it in its atomic write dir and renames it into place.
    pub async fn flush(&self) -> CairnResult<()> {
        self.check_poisoned()?;
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let ledger = Ledger {
            version: LEDGER_VERSION,
            refs: self
                .refs
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&ledger)
            .map_err(|e| CairnError::Other(anyhow::anyhow!("serializing ledger: {e}")))?;

        if let Err(e) = self.op.write(LEDGER_KEY, json).await {
            self.dirty.store(true, Ordering::Release);
            return Err(write_err(LEDGER_KEY, e));
        }
        debug!(objects = ledger.refs.len(), "reference ledger flushed");
        Ok(())
    }

    /// Delete every object with no references, then flush the ledger.
    ///
    /// Objects missing from the ledger are orphans of interrupted runs and
    /// are deleted too. Must not run while a snapshot is being written.
    pub async fn sweep(&self) -> CairnResult<SweepStats> {
        self.check_poisoned()?;
        let entries = match self
            .op
            .list_with(OBJECTS_PREFIX)
            .recursive(true)
            .await
        {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(read_err(OBJECTS_PREFIX, e)),
        };

        let mut stats = SweepStats::default();
        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            let path = entry.path();
            let Some(id) = path.rsplit('/').next().filter(|name| is_content_id(name)) else {
                continue;
            };
            stats.scanned += 1;

            match self.refs.get(id).map(|count| *count) {
                Some(count) if count > 0 => {
                    stats.kept += 1;
                    continue;
                }
                Some(_) => {}
                None => stats.orphans += 1,
            }

            self.op
                .delete(path)
                .await
                .map_err(|e| write_err(path, e))?;
            self.refs.remove(id);
            self.slots.remove(id);
            stats.deleted += 1;
        }

        // Zero counts for objects that are already gone
        self.refs.retain(|_, count| *count > 0);
        self.dirty.store(true, Ordering::Release);
        self.flush().await?;

        info!(
            scanned = stats.scanned,
            deleted = stats.deleted,
            orphans = stats.orphans,
            "sweep complete"
        );
        Ok(stats)
    }

    fn check_poisoned(&self) -> CairnResult<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(CairnError::Other(anyhow::anyhow!(
                "reference counts are out of sync with the ledger; run recount"
            )));
        }
        Ok(())
    }

    fn add_ref(&self, id: &str) -> u64 {
        let mut count = self.refs.entry(id.to_string()).or_insert(0);
        *count += 1;
        let now = *count;
        drop(count);
        self.dirty.store(true, Ordering::Release);
        now
    }

    fn verify(&self, id: &str, bytes: &[u8]) -> CairnResult<()> {
        let actual = self.hasher.digest(bytes);
        if actual != id {
            return Err(CairnError::HashMismatch {
                id: id.to_string(),
                actual,
            });
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> CairnResult<bool> {
        self.op.exists(key).await.map_err(|e| read_err(key, e))
    }

    /// Returns true if this call wrote the bytes.
    async fn write_if_absent(&self, key: &str, bytes: Vec<u8>) -> CairnResult<bool> {
        if self.exists(key).await? {
            return Ok(false);
        }
        let result = if self.conditional_writes {
            self.op.write_with(key, bytes).if_not_exists(true).await
        } else {
            self.op.write(key, bytes).await
        };
        match result {
            Ok(_) => Ok(true),
            // Another writer created it between our check and our write
            Err(e) if e.kind() == ErrorKind::ConditionNotMatch => Ok(false),
            Err(e) => Err(write_err(key, e)),
        }
    }
}

async fn load_ledger(op: &Operator) -> CairnResult<Ledger> {
    let ledger = match op.read(LEDGER_KEY).await {
        Ok(buf) => serde_json::from_slice::<Ledger>(&buf.to_vec())
            .map_err(|e| CairnError::corrupt(format!("reference ledger: {e}")))?,
        Err(e) if e.kind() == ErrorKind::NotFound => Ledger::default(),
        Err(e) => return Err(read_err(LEDGER_KEY, e)),
    };
    if ledger.version > LEDGER_VERSION {
        return Err(CairnError::Config(format!(
            "reference ledger version {} is newer than supported ({LEDGER_VERSION})",
            ledger.version
        )));
    }
    Ok(ledger)
}

fn read_err(key: &str, e: opendal::Error) -> CairnError {
    CairnError::StoreRead {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

fn write_err(key: &str, e: opendal::Error) -> CairnError {
    CairnError::StoreWrite {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{build_operator, memory_operator, BackendConfig};

    async fn memory_store(paranoid: bool) -> ObjectStore {
        ObjectStore::open(memory_operator().unwrap(), Hasher::default(), paranoid)
            .await
            .unwrap()
    }

    fn fs_operator(dir: &std::path::Path) -> Operator {
        build_operator(&BackendConfig::Fs {
            root: dir.to_string_lossy().into_owned(),
        })
        .unwrap()
    }

    fn id_of(data: &[u8]) -> String {
        Hasher::default().digest(data)
    }

    #[tokio::test]
    async fn put_twice_stores_once() {
        let store = memory_store(false).await;
        let id = id_of(b"chunk");

        assert_eq!(store.put(&id, b"chunk".to_vec()).await.unwrap(), PutOutcome::Stored);
        assert_eq!(
            store.put(&id, b"chunk".to_vec()).await.unwrap(),
            PutOutcome::Deduplicated
        );
        assert_eq!(store.ref_count(&id), 2);
        assert_eq!(store.get(&id).await.unwrap(), b"chunk");
        assert_eq!(
            store.stats(),
            StoreStats {
                objects: 1,
                references: 2
            }
        );
    }

    #[tokio::test]
    async fn concurrent_puts_of_one_id_write_once() {
        let store = Arc::new(memory_store(false).await);
        let id = id_of(b"shared");

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = id.clone();
            set.spawn(async move { store.put(&id, b"shared".to_vec()).await.unwrap() });
        }
        let mut stored = 0;
        while let Some(outcome) = set.join_next().await {
            if outcome.unwrap() == PutOutcome::Stored {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert_eq!(store.ref_count(&id), 16);
        assert!(store.slots.is_empty());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = memory_store(false).await;
        let id = id_of(b"never written");
        assert!(!store.has(&id).await.unwrap());
        assert!(matches!(store.get(&id).await, Err(CairnError::NotFound(_))));
    }

    #[tokio::test]
    async fn invalid_ids_are_rejected() {
        let store = memory_store(false).await;
        assert!(store.put("../escape", b"x".to_vec()).await.is_err());
        assert!(store.retain("ABCDEF").is_err());
        assert!(store.get("").await.is_err());
    }

    #[tokio::test]
    async fn paranoid_put_rejects_wrong_bytes() {
        let store = memory_store(true).await;
        let id = id_of(b"expected");
        let err = store.put(&id, b"tampered".to_vec()).await.unwrap_err();
        assert!(matches!(err, CairnError::HashMismatch { .. }));
        assert!(!store.has(&id).await.unwrap());
    }

    #[tokio::test]
    async fn paranoid_get_detects_corruption() {
        let op = memory_operator().unwrap();
        let id = id_of(b"original");
        op.write(&object_key(&id).unwrap(), b"bit rot".to_vec())
            .await
            .unwrap();

        let store = ObjectStore::open(op, Hasher::default(), true).await.unwrap();
        assert!(matches!(
            store.get(&id).await,
            Err(CairnError::HashMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn release_never_deletes() {
        let store = memory_store(false).await;
        let id = id_of(b"keep me");
        store.put(&id, b"keep me".to_vec()).await.unwrap();

        assert_eq!(store.release(&id), 0);
        assert_eq!(store.release(&id), 0, "release saturates at zero");
        assert_eq!(store.get(&id).await.unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn retain_after_has_avoids_rewrite() {
        let store = memory_store(false).await;
        let id = id_of(b"dedup");
        store.put(&id, b"dedup".to_vec()).await.unwrap();

        assert!(store.has(&id).await.unwrap());
        assert_eq!(store.retain(&id).unwrap(), 2);
    }

    #[tokio::test]
    async fn ledger_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let id = id_of(b"persisted");
        {
            let store = ObjectStore::open(fs_operator(tmp.path()), Hasher::default(), false)
                .await
                .unwrap();
            store.put(&id, b"persisted".to_vec()).await.unwrap();
            store.retain(&id).unwrap();
            store.flush().await.unwrap();
        }
        let store = ObjectStore::open(fs_operator(tmp.path()), Hasher::default(), false)
            .await
            .unwrap();
        assert_eq!(store.ref_count(&id), 2);
        assert!(tmp.path().join(LEDGER_KEY).is_file());
    }

    #[tokio::test]
    async fn sweep_reclaims_unreferenced_and_orphaned_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let op = fs_operator(tmp.path());
        let store = ObjectStore::open(op.clone(), Hasher::default(), false)
            .await
            .unwrap();

        let live = id_of(b"live");
        let dead = id_of(b"dead");
        let orphan = id_of(b"orphan");
        store.put(&live, b"live".to_vec()).await.unwrap();
        store.put(&dead, b"dead".to_vec()).await.unwrap();
        store.release(&dead);
        // Written by a run that never flushed its ledger
        op.write(&object_key(&orphan).unwrap(), b"orphan".to_vec())
            .await
            .unwrap();

        let stats = store.sweep().await.unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.kept, 1);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.orphans, 1);

        assert!(store.has(&live).await.unwrap());
        assert!(!store.has(&dead).await.unwrap());
        assert!(!store.has(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn reload_discards_unflushed_refs() {
        let store = memory_store(false).await;
        let kept = id_of(b"kept");
        store.put(&kept, b"kept".to_vec()).await.unwrap();
        store.flush().await.unwrap();

        let dropped = id_of(b"dropped");
        store.put(&dropped, b"dropped".to_vec()).await.unwrap();
        store.retain(&kept).unwrap();
        store.reload().await.unwrap();

        assert_eq!(store.ref_count(&kept), 1);
        assert_eq!(store.ref_count(&dropped), 0);
    }

    #[tokio::test]
    async fn failed_reload_blocks_ledger_writes_until_recount() {
        let op = memory_operator().unwrap();
        let store = ObjectStore::open(op.clone(), Hasher::default(), false)
            .await
            .unwrap();
        let id = id_of(b"leaked");
        store.put(&id, b"leaked".to_vec()).await.unwrap();

        op.write(LEDGER_KEY, b"not json".to_vec()).await.unwrap();
        assert!(matches!(store.reload().await, Err(CairnError::CorruptEntry(_))));
        assert!(store.flush().await.is_err());
        assert!(store.sweep().await.is_err());
        // The unreadable ledger was not overwritten with the leaked count
        assert_eq!(op.read(LEDGER_KEY).await.unwrap().to_vec(), b"not json");

        store.replace_refs(HashMap::new());
        store.flush().await.unwrap();
        assert_eq!(store.stats(), StoreStats::default());
    }

    #[tokio::test]
    async fn has_sees_objects_outside_the_ledger() {
        let op = memory_operator().unwrap();
        let id = id_of(b"left over");
        op.write(&object_key(&id).unwrap(), b"left over".to_vec())
            .await
            .unwrap();
        let store = ObjectStore::open(op, Hasher::default(), false).await.unwrap();

        assert!(store.has(&id).await.unwrap());
        assert_eq!(store.ref_count(&id), 0);
        store.retain(&id).unwrap();
        assert_eq!(store.ref_count(&id), 1);
    }
}
