//! Storage health probe

use anyhow::{Context, Result};
use opendal::Operator;

use crate::repo::REPO_KEY;

const PROBE_KEY: &str = "index/.probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    /// A repository descriptor exists at the root
    pub initialized: bool,
    /// A probe object could be written and removed
    pub writable: bool,
}

/// Probe the backend: listing the root must succeed, the rest is reported.
pub async fn check_health(op: &Operator) -> Result<Health> {
    op.list("/").await.context("storage unreachable")?;
    let initialized = op
        .exists(REPO_KEY)
        .await
        .context("checking for repository descriptor")?;

    let writable = match op.write(PROBE_KEY, "ok").await {
        Ok(_) => op.delete(PROBE_KEY).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "storage is not writable");
            false
        }
    };
    Ok(Health {
        initialized,
        writable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::memory_operator;

    #[tokio::test]
    async fn fresh_backend_is_writable_but_uninitialized() {
        let op = memory_operator().unwrap();
        let health = check_health(&op).await.unwrap();
        assert!(health.writable);
        assert!(!health.initialized);
        assert!(!op.exists(PROBE_KEY).await.unwrap());
    }

    #[tokio::test]
    async fn sees_repository_descriptor() {
        let op = memory_operator().unwrap();
        crate::Repository::open_or_init(op.clone(), &cairn_core::config::EngineConfig::default())
            .await
            .unwrap();
        assert!(check_health(&op).await.unwrap().initialized);
    }
}
