//! Build and restore reports

use std::path::PathBuf;

use cairn_core::CairnError;

/// An entry that was skipped because of an error
#[derive(Debug)]
pub struct EntryFailure {
    pub path: PathBuf,
    pub error: CairnError,
}

/// Result of building one tree
#[derive(Debug, Default)]
pub struct BuildReport {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    /// Files taken over from the previous snapshot without being re-read
    pub files_reused: u64,
    pub chunks_stored: u64,
    pub chunks_deduplicated: u64,
    pub dirs_inlined: u64,
    pub dirs_stored: u64,
    /// Objects of any kind whose bytes were written by this build
    pub objects_written: u64,
    /// Excluded entries, symlinks and special files
    pub skipped: u64,
    pub failures: Vec<EntryFailure>,
}

impl BuildReport {
    pub fn merge(&mut self, other: BuildReport) {
        self.files += other.files;
        self.dirs += other.dirs;
        self.bytes += other.bytes;
        self.files_reused += other.files_reused;
        self.chunks_stored += other.chunks_stored;
        self.chunks_deduplicated += other.chunks_deduplicated;
        self.dirs_inlined += other.dirs_inlined;
        self.dirs_stored += other.dirs_stored;
        self.objects_written += other.objects_written;
        self.skipped += other.skipped;
        self.failures.extend(other.failures);
    }

    /// True if no entry was skipped because of an error.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Result of a restore
#[derive(Debug, Default)]
pub struct RestoreReport {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    pub failures: Vec<EntryFailure>,
}
