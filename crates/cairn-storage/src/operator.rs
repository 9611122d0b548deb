//! OpenDAL Operator factory for cairn storage backends

use anyhow::{Context, Result};
use opendal::Operator;

use cairn_core::config::{BackendKind, StorageConfig};

/// Resolved backend settings, credentials included
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Local directory; object writes go through a temp dir + rename
    Fs { root: String },
    Memory,
    S3 {
        endpoint: String,
        region: String,
        bucket: String,
        root: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

/// Build an OpenDAL Operator for the given backend.
///
/// S3 uses path-style addressing (default in opendal 0.55), which works for
/// MinIO, SeaweedFS, and AWS alike.
pub fn build_operator(cfg: &BackendConfig) -> Result<Operator> {
    let op = match cfg {
        BackendConfig::Fs { root } => {
            let tmp = std::path::Path::new(root).join(".tmp");
            // opendal 0.55: builders use the consuming pattern
            let builder = opendal::services::Fs::default()
                .root(root)
                .atomic_write_dir(&tmp.to_string_lossy());
            Operator::new(builder)
                .with_context(|| format!("creating OpenDAL fs operator at {root}"))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        BackendConfig::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
        BackendConfig::S3 {
            endpoint,
            region,
            bucket,
            root,
            access_key_id,
            secret_access_key,
        } => {
            let builder = opendal::services::S3::default()
                .endpoint(endpoint)
                .region(region)
                .bucket(bucket)
                .root(root)
                .access_key_id(access_key_id)
                .secret_access_key(secret_access_key);

            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(5)
                        .with_jitter(),
                )
                .finish()
        }
    };

    Ok(op)
}

/// In-memory operator, for tests and dry runs
pub fn memory_operator() -> Result<Operator> {
    build_operator(&BackendConfig::Memory)
}

/// Build an operator from cairn-core config + loaded credentials.
///
/// Credentials are only consulted for S3. If `enforce_tls` is true and the
/// endpoint uses HTTP, this returns an error; otherwise a warning is logged.
pub fn build_from_core_config(
    storage: &StorageConfig,
    credentials: Option<(&str, &str)>,
) -> Result<Operator> {
    let backend = match storage.backend {
        BackendKind::Fs => {
            std::fs::create_dir_all(&storage.root)
                .with_context(|| format!("creating repository dir: {}", storage.root))?;
            BackendConfig::Fs {
                root: storage.root.clone(),
            }
        }
        BackendKind::Memory => BackendConfig::Memory,
        BackendKind::S3 => {
            if storage.endpoint.starts_with("http://") {
                if storage.enforce_tls {
                    anyhow::bail!(
                        "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                         Use an HTTPS endpoint or set storage.enforce_tls = false \
                         for local development.",
                        storage.endpoint
                    );
                }
                tracing::warn!(
                    endpoint = %storage.endpoint,
                    "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
                );
            }
            let (access_key_id, secret_access_key) =
                credentials.context("S3 backend requires credentials")?;
            BackendConfig::S3 {
                endpoint: storage.endpoint.clone(),
                region: storage.region.clone(),
                bucket: storage.bucket.clone(),
                root: storage.root.clone(),
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            }
        }
    };

    build_operator(&backend)
}
