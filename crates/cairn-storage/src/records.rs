//! Snapshot record log
//!
//! Records are prost-encoded `Snapshot` messages at
//! `snapshots/<archive>/<seq>`, with `seq` zero-padded so that key order is
//! numeric order. A record is only ever created, never rewritten.

use std::fmt;
use std::str::FromStr;

use opendal::{ErrorKind, Operator};
use tracing::{debug, info, warn};

use cairn_core::wire::{decode_snapshot, encode_snapshot, validate_name};
use cairn_core::{CairnError, CairnResult, Snapshot};

pub const SNAPSHOTS_PREFIX: &str = "snapshots/";

/// Attempts at claiming a sequence number before giving up
const MAX_SEQ_ATTEMPTS: u32 = 100;

/// `<archive>/<seq>`; sequence numbers start at 1 per archive
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId {
    pub name: String,
    pub seq: u64,
}

impl SnapshotId {
    pub fn new(name: impl Into<String>, seq: u64) -> Self {
        Self {
            name: name.into(),
            seq,
        }
    }

    pub fn key(&self) -> String {
        format!("{SNAPSHOTS_PREFIX}{}/{:010}", self.name, self.seq)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.seq)
    }
}

impl FromStr for SnapshotId {
    type Err = CairnError;

    fn from_str(s: &str) -> CairnResult<Self> {
        let (name, seq) = s.rsplit_once('/').ok_or_else(|| {
            CairnError::Config(format!("snapshot id '{s}' is not <archive>/<seq>"))
        })?;
        validate_archive_name(name)?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| CairnError::Config(format!("snapshot id '{s}' has no numeric sequence")))?;
        Ok(Self::new(name, seq))
    }
}

pub fn validate_archive_name(name: &str) -> CairnResult<()> {
    validate_name(name).map_err(|_| CairnError::Config(format!("invalid archive name {name:?}")))
}

#[derive(Clone)]
pub struct SnapshotLog {
    op: Operator,
    conditional_writes: bool,
}

impl SnapshotLog {
    pub fn new(op: Operator) -> Self {
        let conditional_writes = op.info().full_capability().write_with_if_not_exists;
        Self {
            op,
            conditional_writes,
        }
    }

    /// Snapshots of one archive, oldest first.
    pub async fn list(&self, name: &str) -> CairnResult<Vec<SnapshotId>> {
        validate_archive_name(name)?;
        let dir = format!("{SNAPSHOTS_PREFIX}{name}/");
        let entries = match self.op.list(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(&dir, e)),
        };

        let mut ids: Vec<SnapshotId> = entries
            .iter()
            .filter(|entry| !entry.metadata().is_dir())
            .filter_map(|entry| match entry.name().parse::<u64>() {
                Ok(seq) => Some(SnapshotId::new(name, seq)),
                Err(_) => {
                    warn!(path = entry.path(), "ignoring unexpected entry in snapshot log");
                    None
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Snapshots of every archive, ordered by archive then sequence.
    pub async fn list_all(&self) -> CairnResult<Vec<SnapshotId>> {
        let entries = match self.op.list_with(SNAPSHOTS_PREFIX).recursive(true).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(SNAPSHOTS_PREFIX, e)),
        };

        let mut ids: Vec<SnapshotId> = entries
            .iter()
            .filter(|entry| !entry.metadata().is_dir())
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(SNAPSHOTS_PREFIX)?;
                match rel.parse::<SnapshotId>() {
                    Ok(id) => Some(id),
                    Err(_) => {
                        warn!(path = entry.path(), "ignoring unexpected entry in snapshot log");
                        None
                    }
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn latest(&self, name: &str) -> CairnResult<Option<SnapshotId>> {
        Ok(self.list(name).await?.pop())
    }

    pub async fn load(&self, id: &SnapshotId) -> CairnResult<Snapshot> {
        let key = id.key();
        match self.op.read(&key).await {
            Ok(buf) => decode_snapshot(&buf.to_vec()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CairnError::NotFound(id.to_string())),
            Err(e) => Err(read_err(&key, e)),
        }
    }

    /// Write a finished snapshot under the next free sequence number.
    ///
    /// Claiming a number is a create-if-absent write; losing the race moves on
    /// to the next number.
    pub async fn append(&self, name: &str, snapshot: &Snapshot) -> CairnResult<SnapshotId> {
        validate_archive_name(name)?;
        let bytes = encode_snapshot(snapshot);
        let mut seq = self.latest(name).await?.map(|id| id.seq + 1).unwrap_or(1);

        for _ in 0..MAX_SEQ_ATTEMPTS {
            let id = SnapshotId::new(name, seq);
            if self.create(&id.key(), bytes.clone()).await? {
                info!(snapshot = %id, root = %snapshot.root_hash, "snapshot record written");
                return Ok(id);
            }
            debug!(snapshot = %id, "sequence number taken, trying the next one");
            seq += 1;
        }

        Err(CairnError::StoreWrite {
            key: format!("{SNAPSHOTS_PREFIX}{name}/"),
            reason: format!("no free sequence number after {MAX_SEQ_ATTEMPTS} attempts"),
        })
    }

    pub async fn delete(&self, id: &SnapshotId) -> CairnResult<()> {
        let key = id.key();
        self.op.delete(&key).await.map_err(|e| CairnError::StoreWrite {
            key,
            reason: e.to_string(),
        })
    }

    /// Returns false if `key` already exists.
    async fn create(&self, key: &str, bytes: Vec<u8>) -> CairnResult<bool> {
        if self.op.exists(key).await.map_err(|e| read_err(key, e))? {
            return Ok(false);
        }
        let result = if self.conditional_writes {
            self.op.write_with(key, bytes).if_not_exists(true).await
        } else {
            self.op.write(key, bytes).await
        };
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::ConditionNotMatch => Ok(false),
            Err(e) => Err(CairnError::StoreWrite {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

fn read_err(key: &str, e: opendal::Error) -> CairnError {
    CairnError::StoreRead {
        key: key.to_string(),
        reason: e.to_string(),
    }
}
