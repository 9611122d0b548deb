use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from cairn.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info); RUST_LOG takes precedence
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local directory
    Fs,
    /// Process memory (tests, dry runs)
    Memory,
    /// S3-compatible object storage
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Repository root: a directory for `fs`, a key prefix for `s3`
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (warn/error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

/// Content-defined chunking bounds, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

/// Engine policy. Passed explicitly to the tree builder and snapshot
/// manager so that builders with different policies can run side by side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub hash: HashAlgorithm,
    /// Subdirectories whose encoding is smaller than this many bytes are
    /// embedded in their parent instead of stored standalone
    pub inline_threshold: usize,
    /// Concurrent file workers (0 = cpu_count)
    pub workers: usize,
    /// Abort the snapshot on the first unreadable source entry
    pub fail_fast: bool,
    /// Verify hashes of bytes written to and read from the store
    pub paranoid: bool,
    /// Reuse file entries from the previous snapshot when size and mtime match
    pub reuse_unchanged: bool,
    /// Glob patterns (matched against entry names) to exclude
    pub exclude_patterns: Vec<String>,
    pub chunk: ChunkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Archive name; snapshots are numbered per archive
    pub name: String,
    /// Directory to back up
    pub source: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Fs,
            root: "./cairn-repo".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "cairn".into(),
            enforce_tls: false,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_size: 16 * 1024,
            avg_size: 64 * 1024,
            max_size: 256 * 1024,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash: HashAlgorithm::Blake3,
            inline_threshold: 256,
            workers: 0,
            fail_fast: false,
            paranoid: false,
            reuse_unchanged: true,
            exclude_patterns: Vec::new(),
            chunk: ChunkConfig::default(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            source: None,
        }
    }
}

impl EngineConfig {
    /// Effective worker count
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[log]
level = "debug"
format = "json"

[storage]
backend = "s3"
root = "backups/laptop"
endpoint = "https://s3.example.com"
bucket = "my-bucket"
enforce_tls = true

[engine]
hash = "sha256"
inline_threshold = 1024
workers = 8
fail_fast = true
paranoid = true
reuse_unchanged = false
exclude_patterns = ["*.tmp", "target"]

[engine.chunk]
min_size = 2048
avg_size = 4096
max_size = 16384

[archive]
name = "laptop"
source = "/home/user"
"#;
        let config: CairnConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.storage.backend, BackendKind::S3);
        assert_eq!(config.storage.bucket, "my-bucket");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.engine.hash, HashAlgorithm::Sha256);
        assert_eq!(config.engine.inline_threshold, 1024);
        assert_eq!(config.engine.worker_count(), 8);
        assert!(config.engine.fail_fast);
        assert!(config.engine.paranoid);
        assert!(!config.engine.reuse_unchanged);
        assert_eq!(config.engine.exclude_patterns.len(), 2);
        assert_eq!(config.engine.chunk.avg_size, 4096);
        assert_eq!(config.archive.name, "laptop");
        assert_eq!(config.archive.source, Some(PathBuf::from("/home/user")));
    }

    #[test]
    fn test_parse_defaults() {
        let config: CairnConfig = toml::from_str("").unwrap();

        assert_eq!(config.log.level, "info");
        assert_eq!(config.storage.backend, BackendKind::Fs);
        assert_eq!(config.engine.hash, HashAlgorithm::Blake3);
        assert_eq!(config.engine.inline_threshold, 256);
        assert_eq!(config.engine.chunk, ChunkConfig::default());
        assert!(config.engine.reuse_unchanged);
        assert!(!config.engine.fail_fast);
        assert_eq!(config.archive.name, "default");
        assert!(config.engine.worker_count() >= 1);
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[engine.chunk]
avg_size = 8192
"#;
        let config: CairnConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.engine.chunk.avg_size, 8192);
        // Defaults
        assert_eq!(config.engine.chunk.min_size, 16 * 1024);
        assert_eq!(config.engine.inline_threshold, 256);
        assert_eq!(config.storage.region, "us-east-1");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = CairnConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CairnConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.root, parsed.storage.root);
        assert_eq!(config.engine.chunk, parsed.engine.chunk);
        assert_eq!(config.archive.name, parsed.archive.name);
    }
}
