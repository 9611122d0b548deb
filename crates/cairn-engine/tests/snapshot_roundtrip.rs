//! Integration test: source tree → snapshot → restore round-trip
//!
//! Builds snapshots of real directories into an in-memory repository, reads
//! them back through the tree reader and compares byte for byte.

use std::path::Path;

use cairn_core::config::{ChunkConfig, EngineConfig};
use cairn_core::{Content, FileEntry};
use cairn_engine::{
    ChangeKind, DirView, RestoreOptions, SnapshotManager, TreeReader, TreeRoot, WalkItem,
};
use cairn_storage::{memory_operator, Repository};
use proptest::prelude::*;
use tempfile::TempDir;

/// Smallest bounds the chunker accepts
const TINY_CHUNKS: ChunkConfig = ChunkConfig {
    min_size: 64,
    avg_size: 256,
    max_size: 1024,
};

fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn write(root: &Path, rel: &str, content: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

async fn memory_repo(engine: &EngineConfig) -> Repository {
    Repository::open_or_init(memory_operator().unwrap(), engine)
        .await
        .expect("init repository")
}

/// Every file and directory under `a` exists under `b` with the same bytes.
fn assert_same_tree(a: &Path, b: &Path) {
    let mut names: Vec<_> = std::fs::read_dir(a)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    names.sort();
    let mut other: Vec<_> = std::fs::read_dir(b)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    other.sort();
    assert_eq!(names, other, "entries of {} differ", a.display());

    for name in names {
        let (pa, pb) = (a.join(&name), b.join(&name));
        if pa.is_dir() {
            assert!(pb.is_dir(), "{} should be a directory", pb.display());
            assert_same_tree(&pa, &pb);
        } else {
            assert_eq!(
                std::fs::read(&pa).unwrap(),
                std::fs::read(&pb).unwrap(),
                "content of {} differs",
                pa.display()
            );
        }
    }
}

/// Each directory's size is the sum of its files and subdirectories.
async fn assert_sizes_add_up(dir: &DirView) -> u64 {
    let mut total: u64 = dir.files().iter().map(|f| f.size).sum();
    for sub in dir.sub_dirs() {
        let child = dir.resolve(sub).await.unwrap();
        total += Box::pin(assert_sizes_add_up(&child)).await;
    }
    assert_eq!(dir.size(), total);
    total
}

#[tokio::test]
async fn restore_reproduces_the_source_tree() {
    let src = TempDir::new().unwrap();
    write(src.path(), "README.md", b"# project\n");
    write(src.path(), "empty.bin", b"");
    write(src.path(), "data/large.bin", &noise(300_000, 7));
    write(src.path(), "data/nested/deeper/note.txt", b"deep note");
    std::fs::create_dir_all(src.path().join("data/empty_dir")).unwrap();

    let engine = EngineConfig {
        chunk: TINY_CHUNKS,
        inline_threshold: 64,
        ..Default::default()
    };
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "laptop").unwrap();

    let created = manager.create_snapshot(src.path()).await.unwrap();
    assert!(created.report.is_complete());
    assert_eq!(created.report.files, 4);
    assert_eq!(created.report.bytes, 10 + 300_000 + 9);
    assert!(created.snapshot.finished >= created.snapshot.started);
    assert_eq!(created.id.seq, 1);

    let reader = TreeReader::new(repo.store().clone());
    let root = reader.open(TreeRoot::from(&created.snapshot)).await.unwrap();
    assert_eq!(assert_sizes_add_up(&root).await, 300_019);

    let dst = TempDir::new().unwrap();
    let restored = reader
        .restore(
            TreeRoot::from(&created.snapshot),
            dst.path(),
            RestoreOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(restored.files, 4);
    assert_eq!(restored.bytes, 300_019);
    assert!(restored.failures.is_empty());
    assert_same_tree(src.path(), dst.path());
}

#[tokio::test]
async fn unchanged_tree_writes_no_new_objects() {
    let src = TempDir::new().unwrap();
    write(src.path(), "a.txt", &noise(5000, 1));
    write(src.path(), "dir/b.txt", &noise(7000, 2));

    for reuse_unchanged in [true, false] {
        let engine = EngineConfig {
            chunk: TINY_CHUNKS,
            inline_threshold: 0,
            reuse_unchanged,
            ..Default::default()
        };
        let repo = memory_repo(&engine).await;
        let manager = SnapshotManager::new(&repo, engine, "home").unwrap();

        let first = manager.create_snapshot(src.path()).await.unwrap();
        let objects = repo.store().stats().objects;
        let second = manager.create_snapshot(src.path()).await.unwrap();

        assert_eq!(first.snapshot.root_hash, second.snapshot.root_hash);
        assert_eq!(second.report.objects_written, 0);
        assert_eq!(repo.store().stats().objects, objects);
        assert_eq!(second.id.seq, 2);
        if reuse_unchanged {
            assert_eq!(second.report.files_reused, 2);
        } else {
            assert_eq!(second.report.files_reused, 0);
            assert!(second.report.chunks_deduplicated > 0);
        }
    }
}

#[tokio::test]
async fn identical_files_share_one_chunk() {
    let src = TempDir::new().unwrap();
    let content = noise(1000, 42);
    write(src.path(), "x/same.bin", &content);
    write(src.path(), "y/copy.bin", &content);

    let engine = EngineConfig::default();
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "dup").unwrap();
    let created = manager.create_snapshot(src.path()).await.unwrap();

    assert_eq!(created.report.chunks_stored, 1);
    assert_eq!(created.report.chunks_deduplicated, 1);
    // One chunk plus the root; both subdirectories are small enough to inline
    let stats = repo.store().stats();
    assert_eq!(stats.objects, 2);
    assert_eq!(stats.references, 3);

    let reader = TreeReader::new(repo.store().clone());
    let root = reader.open(TreeRoot::from(&created.snapshot)).await.unwrap();
    let x = root.resolve_name("x").await.unwrap();
    let y = root.resolve_name("y").await.unwrap();
    assert_eq!(x.files()[0].chunk_hash, y.files()[0].chunk_hash);
    assert_eq!(x.files()[0].content_hash, y.files()[0].content_hash);
}

#[tokio::test]
async fn empty_source_gives_an_empty_root() {
    let src = TempDir::new().unwrap();
    let engine = EngineConfig::default();
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "empty").unwrap();

    let created = manager.create_snapshot(src.path()).await.unwrap();
    let reader = TreeReader::new(repo.store().clone());
    let root = reader.open(TreeRoot::from(&created.snapshot)).await.unwrap();
    assert!(root.files().is_empty());
    assert!(root.sub_dirs().is_empty());
    assert_eq!(root.size(), 0);

    let dst = TempDir::new().unwrap();
    let target = dst.path().join("out");
    reader
        .restore(TreeRoot::from(&created.snapshot), &target, RestoreOptions::default())
        .await
        .unwrap();
    assert!(target.is_dir());
    assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
}

#[tokio::test]
async fn small_subdirectory_is_inlined() {
    let src = TempDir::new().unwrap();
    write(src.path(), "small/fifty.txt", &[b'z'; 50]);

    let engine = EngineConfig::default();
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "inline").unwrap();
    let created = manager.create_snapshot(src.path()).await.unwrap();

    let reader = TreeReader::new(repo.store().clone());
    let root = reader.open(TreeRoot::from(&created.snapshot)).await.unwrap();
    assert!(matches!(root.sub_dirs()[0].content, Some(Content::Inline(_))));
    assert_eq!(created.report.dirs_inlined, 1);
    assert_eq!(repo.store().stats().objects, 2);

    let small = root.resolve_name("small").await.unwrap();
    assert_eq!(small.id(), None);
    assert_eq!(reader.read_file(&small.files()[0]).await.unwrap(), vec![b'z'; 50]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wide_tree_is_backed_up_without_failures() {
    let src = TempDir::new().unwrap();
    for i in 0..600 {
        write(src.path(), &format!("d{i:04}/inner/f.txt"), format!("{i}").as_bytes());
    }

    let engine = EngineConfig::default();
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "wide").unwrap();
    let created = manager.create_snapshot(src.path()).await.unwrap();

    let first_failure = created.report.failures.first().map(|f| f.error.to_string());
    assert_eq!(first_failure, None);
    assert_eq!(created.report.files, 600);
    assert_eq!(created.report.dirs, 1201);

    let dst = TempDir::new().unwrap();
    TreeReader::new(repo.store().clone())
        .restore(TreeRoot::from(&created.snapshot), dst.path(), RestoreOptions::default())
        .await
        .unwrap();
    assert_same_tree(src.path(), dst.path());
}

#[tokio::test]
async fn content_hash_does_not_depend_on_chunk_bounds() {
    let src = TempDir::new().unwrap();
    write(src.path(), "blob", &noise(200_000, 9));

    let mut files: Vec<FileEntry> = Vec::new();
    for chunk in [TINY_CHUNKS, ChunkConfig::default()] {
        let engine = EngineConfig {
            chunk,
            ..Default::default()
        };
        let repo = memory_repo(&engine).await;
        let manager = SnapshotManager::new(&repo, engine, "blob").unwrap();
        let created = manager.create_snapshot(src.path()).await.unwrap();
        let reader = TreeReader::new(repo.store().clone());
        let root = reader.open(TreeRoot::from(&created.snapshot)).await.unwrap();
        files.push(root.files()[0].clone());
    }

    assert_eq!(files[0].content_hash, files[1].content_hash);
    assert_eq!(files[0].size, files[1].size);
    assert!(files[0].chunk_hash.len() > files[1].chunk_hash.len());
}

#[tokio::test]
async fn diff_between_snapshots() {
    let src = TempDir::new().unwrap();
    write(src.path(), "keep.txt", b"unchanged");
    write(src.path(), "edit.txt", b"first version");
    write(src.path(), "old/gone.txt", b"bye");
    write(src.path(), "big/stable.bin", &noise(4000, 3));

    let engine = EngineConfig {
        inline_threshold: 0,
        ..Default::default()
    };
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "diff").unwrap();
    let before = manager.create_snapshot(src.path()).await.unwrap();

    write(src.path(), "edit.txt", b"second, longer version");
    std::fs::remove_dir_all(src.path().join("old")).unwrap();
    write(src.path(), "new/hello.txt", b"hi");
    let after = manager.create_snapshot(src.path()).await.unwrap();

    let reader = TreeReader::new(repo.store().clone());
    let changes = reader
        .diff(
            TreeRoot::from(&before.snapshot),
            TreeRoot::from(&after.snapshot),
        )
        .await
        .unwrap();
    let summary: Vec<_> = changes
        .iter()
        .map(|c| (c.path.as_str(), c.kind, c.is_dir))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("edit.txt", ChangeKind::Modified, false),
            ("new", ChangeKind::Added, true),
            ("old", ChangeKind::Removed, true),
        ]
    );
}

#[tokio::test]
async fn walk_order_is_stable() {
    let src = TempDir::new().unwrap();
    write(src.path(), "b/2.txt", b"2");
    write(src.path(), "a/1.txt", b"1");
    write(src.path(), "z.txt", b"z");

    let engine = EngineConfig::default();
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "walk").unwrap();
    let created = manager.create_snapshot(src.path()).await.unwrap();

    let reader = TreeReader::new(repo.store().clone());
    let mut runs = Vec::new();
    for _ in 0..2 {
        let root = reader.open(TreeRoot::from(&created.snapshot)).await.unwrap();
        let mut walker = reader.walk(root);
        let mut paths = Vec::new();
        while let Some(item) = walker.next().await {
            match item {
                WalkItem::Dir { path, .. } | WalkItem::File { path, .. } => paths.push(path),
                WalkItem::Error { path, error } => panic!("{path}: {error}"),
            }
        }
        runs.push(paths);
    }
    assert_eq!(runs[0], vec!["z.txt", "a", "a/1.txt", "b", "b/2.txt"]);
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn restore_refuses_to_overwrite_unless_asked() {
    let src = TempDir::new().unwrap();
    write(src.path(), "f.txt", b"from snapshot");

    let engine = EngineConfig::default();
    let repo = memory_repo(&engine).await;
    let manager = SnapshotManager::new(&repo, engine, "ow").unwrap();
    let created = manager.create_snapshot(src.path()).await.unwrap();
    let reader = TreeReader::new(repo.store().clone());

    let dst = TempDir::new().unwrap();
    write(dst.path(), "f.txt", b"local edit");

    let keep_going = RestoreOptions {
        overwrite: false,
        keep_going: true,
    };
    let report = reader
        .restore(TreeRoot::from(&created.snapshot), dst.path(), keep_going)
        .await
        .unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(std::fs::read(dst.path().join("f.txt")).unwrap(), b"local edit");

    let overwrite = RestoreOptions {
        overwrite: true,
        keep_going: false,
    };
    reader
        .restore(TreeRoot::from(&created.snapshot), dst.path(), overwrite)
        .await
        .unwrap();
    assert_eq!(std::fs::read(dst.path().join("f.txt")).unwrap(), b"from snapshot");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn arbitrary_files_survive_a_round_trip(
        files in proptest::collection::btree_map(
            "[a-z]{1,8}",
            proptest::collection::vec(any::<u8>(), 0..4096),
            1..6,
        )
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let src = TempDir::new().unwrap();
            for (name, content) in &files {
                write(src.path(), &format!("d/{name}"), content);
            }

            let engine = EngineConfig { chunk: TINY_CHUNKS, ..Default::default() };
            let repo = memory_repo(&engine).await;
            let manager = SnapshotManager::new(&repo, engine, "prop").unwrap();
            let created = manager.create_snapshot(src.path()).await.unwrap();

            let dst = TempDir::new().unwrap();
            TreeReader::new(repo.store().clone())
                .restore(TreeRoot::from(&created.snapshot), dst.path(), RestoreOptions::default())
                .await
                .unwrap();
            assert_same_tree(src.path(), dst.path());
        });
    }
}
