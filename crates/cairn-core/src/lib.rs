pub mod config;
pub mod error;
pub mod wire;

pub use error::{CairnError, CairnResult};

/// Generated wire-format messages (from backup.proto)
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/cairn.backup.rs"));
}

pub use proto::sub_dir_entry::Content;
pub use proto::{DirEntry, FileEntry, Snapshot, SubDirEntry};
