//! Repository descriptor and the handles opened from it

use std::sync::Arc;

use opendal::{ErrorKind, Operator};
use serde::{Deserialize, Serialize};
use tracing::info;

use cairn_chunks::Hasher;
use cairn_core::config::{EngineConfig, HashAlgorithm};
use cairn_core::{CairnError, CairnResult};

use crate::object_store::ObjectStore;
use crate::records::SnapshotLog;

pub const REPO_KEY: &str = "repo.json";
pub const REPO_VERSION: u32 = 1;

/// Contents of `repo.json`. Fixed at init; content ids from different hash
/// algorithms must never mix in one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub version: u32,
    pub hash: HashAlgorithm,
}

/// An opened repository: its object store and snapshot log
pub struct Repository {
    descriptor: RepoDescriptor,
    store: Arc<ObjectStore>,
    log: SnapshotLog,
}

impl Repository {
    /// Open the repository, creating `repo.json` on first use.
    ///
    /// Fails with `Config` if the repository was created with a different
    /// hash algorithm than `engine.hash`.
    pub async fn open_or_init(op: Operator, engine: &EngineConfig) -> CairnResult<Self> {
        let descriptor = match read_descriptor(&op).await? {
            Some(existing) => {
                if existing.hash != engine.hash {
                    return Err(CairnError::Config(format!(
                        "repository uses {} but the engine is configured for {}",
                        existing.hash.name(),
                        engine.hash.name()
                    )));
                }
                existing
            }
            None => {
                let descriptor = RepoDescriptor {
                    version: REPO_VERSION,
                    hash: engine.hash,
                };
                let json = serde_json::to_vec_pretty(&descriptor).map_err(|e| {
                    CairnError::Other(anyhow::anyhow!("serializing {REPO_KEY}: {e}"))
                })?;
                op.write(REPO_KEY, json)
                    .await
                    .map_err(|e| CairnError::StoreWrite {
                        key: REPO_KEY.into(),
                        reason: e.to_string(),
                    })?;
                info!(hash = descriptor.hash.name(), "repository initialized");
                descriptor
            }
        };
        Self::with_descriptor(op, descriptor, engine.paranoid).await
    }

    /// Open an existing repository with whatever algorithm it was created with.
    pub async fn open(op: Operator, paranoid: bool) -> CairnResult<Self> {
        let descriptor = read_descriptor(&op)
            .await?
            .ok_or_else(|| CairnError::NotFound(REPO_KEY.into()))?;
        Self::with_descriptor(op, descriptor, paranoid).await
    }

    async fn with_descriptor(
        op: Operator,
        descriptor: RepoDescriptor,
        paranoid: bool,
    ) -> CairnResult<Self> {
        if descriptor.version > REPO_VERSION {
            return Err(CairnError::Config(format!(
                "repository format {} is newer than supported ({REPO_VERSION})",
                descriptor.version
            )));
        }
        let store = ObjectStore::open(op.clone(), Hasher::new(descriptor.hash), paranoid).await?;
        Ok(Self {
            descriptor,
            store: Arc::new(store),
            log: SnapshotLog::new(op),
        })
    }

    pub fn descriptor(&self) -> &RepoDescriptor {
        &self.descriptor
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn log(&self) -> &SnapshotLog {
        &self.log
    }
}

async fn read_descriptor(op: &Operator) -> CairnResult<Option<RepoDescriptor>> {
    match op.read(REPO_KEY).await {
        Ok(buf) => serde_json::from_slice(&buf.to_vec())
            .map(Some)
            .map_err(|e| CairnError::corrupt(format!("{REPO_KEY}: {e}"))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CairnError::StoreRead {
            key: REPO_KEY.into(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;

    #[tokio::test]
    async fn init_then_reopen() {
        let op = memory_operator().unwrap();
        let engine = EngineConfig {
            hash: HashAlgorithm::Sha256,
            ..Default::default()
        };
        let repo = Repository::open_or_init(op.clone(), &engine).await.unwrap();
        assert_eq!(repo.descriptor().hash, HashAlgorithm::Sha256);

        let reopened = Repository::open(op, false).await.unwrap();
        assert_eq!(reopened.descriptor(), repo.descriptor());
        assert_eq!(reopened.store().hasher().algorithm(), HashAlgorithm::Sha256);
    }

    #[tokio::test]
    async fn algorithm_mismatch_is_a_config_error() {
        let op = memory_operator().unwrap();
        Repository::open_or_init(op.clone(), &EngineConfig::default())
            .await
            .unwrap();

        let engine = EngineConfig {
            hash: HashAlgorithm::Sha256,
            ..Default::default()
        };
        assert!(matches!(
            Repository::open_or_init(op, &engine).await,
            Err(CairnError::Config(_))
        ));
    }

    #[tokio::test]
    async fn open_requires_descriptor() {
        assert!(matches!(
            Repository::open(memory_operator().unwrap(), false).await,
            Err(CairnError::NotFound(_))
        ));
    }
}
