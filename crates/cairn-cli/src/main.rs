//! cairn: deduplicating backup CLI
//!
//! Commands:
//!   backup [<source>]            - snapshot a directory into the repository
//!   snapshots                    - list snapshots of an archive (or all)
//!   ls <snapshot> [<path>]       - list a directory inside a snapshot
//!   restore <snapshot> <target>  - recreate a snapshot's tree on disk
//!   diff <old> <new>             - paths that changed between two snapshots
//!   forget <snapshot>...         - drop snapshots (space is reclaimed by gc)
//!   gc                           - delete objects no snapshot references
//!   recount                      - rebuild the reference ledger
//!   check                        - storage reachability and repository summary
//!   config show                  - display current configuration
//!
//! A snapshot is named `<archive>/<seq>`, or just `<archive>` for its latest.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use cairn_core::config::CairnConfig;
use cairn_core::Snapshot;
use cairn_engine::{
    ChangeKind, Found, RestoreOptions, SnapshotManager, TreeReader, TreeRoot, WalkItem,
};
use cairn_storage::{build_from_core_config, check_health, Repository, SnapshotId, SnapshotLog};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cairn",
    version,
    about = "Deduplicating, content-addressed backups",
    long_about = "cairn: snapshot directory trees into a deduplicated repository and restore them"
)]
struct Cli {
    /// Path to cairn.toml configuration file
    #[arg(long, short = 'c', env = "CAIRN_CONFIG", default_value = "cairn.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot a directory
    ///
    /// S3 credentials are read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY
    /// (or CAIRN_ACCESS_KEY_ID and CAIRN_SECRET_ACCESS_KEY).
    Backup {
        /// Directory to back up (default: archive.source from config)
        source: Option<PathBuf>,
        /// Archive name (default: archive.name from config)
        #[arg(long, short = 'a')]
        archive: Option<String>,
    },

    /// List snapshots
    Snapshots {
        /// Archive name (default: archive.name from config)
        #[arg(long, short = 'a', conflicts_with = "all")]
        archive: Option<String>,
        /// List snapshots of every archive
        #[arg(long)]
        all: bool,
    },

    /// List a directory inside a snapshot
    Ls {
        /// `<archive>/<seq>` or `<archive>` for the latest snapshot
        snapshot: String,
        /// Path inside the snapshot (default: root)
        #[arg(default_value = "")]
        path: String,
        /// Walk everything below the path
        #[arg(long, short = 'r')]
        recursive: bool,
    },

    /// Restore a snapshot into a directory
    Restore {
        snapshot: String,
        target: PathBuf,
        /// Replace files that already exist in the target
        #[arg(long)]
        overwrite: bool,
        /// Continue past entries that cannot be restored
        #[arg(long)]
        keep_going: bool,
    },

    /// Show paths that changed between two snapshots
    Diff { old: String, new: String },

    /// Drop snapshots and release their references
    Forget {
        #[arg(required = true)]
        snapshots: Vec<String>,
        /// Run gc afterwards
        #[arg(long)]
        gc: bool,
    },

    /// Delete objects that no snapshot references
    Gc,

    /// Rebuild the reference ledger from every snapshot
    Recount,

    /// Check storage reachability and summarize the repository
    Check,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;
    init_logging(&config.log.level, &config.log.format);

    match cli.command {
        Commands::Backup { source, archive } => {
            cmd_backup(&config, source.as_deref(), archive.as_deref()).await
        }
        Commands::Snapshots { archive, all } => {
            cmd_snapshots(&config, archive.as_deref(), all).await
        }
        Commands::Ls {
            snapshot,
            path,
            recursive,
        } => cmd_ls(&config, &snapshot, &path, recursive).await,
        Commands::Restore {
            snapshot,
            target,
            overwrite,
            keep_going,
        } => {
            let options = RestoreOptions {
                overwrite,
                keep_going,
            };
            cmd_restore(&config, &snapshot, &target, options).await
        }
        Commands::Diff { old, new } => cmd_diff(&config, &old, &new).await,
        Commands::Forget { snapshots, gc } => cmd_forget(&config, &snapshots, gc).await,
        Commands::Gc => cmd_gc(&config).await,
        Commands::Recount => cmd_recount(&config).await,
        Commands::Check => cmd_check(&config).await,
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    // RUST_LOG wins over the config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn load_config(path: &Path) -> Result<CairnConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(CairnConfig::default())
    }
}

// ── Repository access ─────────────────────────────────────────────────────────

/// S3 credentials from the environment, standard AWS names first.
fn credentials_from_env() -> Option<(String, String)> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("CAIRN_ACCESS_KEY_ID"))
        .ok()?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("CAIRN_SECRET_ACCESS_KEY"))
        .ok()?;
    Some((access_key, secret_key))
}

fn build_operator_from_env(config: &CairnConfig) -> Result<opendal::Operator> {
    let credentials = credentials_from_env();
    build_from_core_config(
        &config.storage,
        credentials.as_ref().map(|(k, s)| (k.as_str(), s.as_str())),
    )
    .context(
        "building storage operator\n\
         For S3, set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
    )
}

/// `backup` may create the repository; everything else requires one.
async fn open_repo(config: &CairnConfig, create: bool) -> Result<Repository> {
    let op = build_operator_from_env(config)?;
    let repo = if create {
        Repository::open_or_init(op, &config.engine).await
    } else {
        Repository::open(op, config.engine.paranoid).await
    };
    repo.with_context(|| format!("opening repository at {}", describe_storage(config)))
}

fn describe_storage(config: &CairnConfig) -> String {
    use cairn_core::config::BackendKind;
    match config.storage.backend {
        BackendKind::Fs => config.storage.root.clone(),
        BackendKind::Memory => "memory".to_string(),
        BackendKind::S3 => format!(
            "s3://{}/{} ({})",
            config.storage.bucket, config.storage.root, config.storage.endpoint
        ),
    }
}

/// Resolve `<archive>/<seq>`, or `<archive>` to its latest snapshot.
async fn resolve_snapshot(log: &SnapshotLog, selector: &str) -> Result<(SnapshotId, Snapshot)> {
    let id = if selector.contains('/') {
        selector.parse::<SnapshotId>()?
    } else {
        log.latest(selector)
            .await?
            .with_context(|| format!("archive '{selector}' has no snapshots"))?
    };
    let snapshot = log
        .load(&id)
        .await
        .with_context(|| format!("loading snapshot {id}"))?;
    Ok((id, snapshot))
}

// ── `cairn backup` ────────────────────────────────────────────────────────────

async fn cmd_backup(
    config: &CairnConfig,
    source: Option<&Path>,
    archive: Option<&str>,
) -> Result<()> {
    let source = source
        .map(Path::to_path_buf)
        .or_else(|| config.archive.source.clone())
        .context("no source directory; pass one or set archive.source in config")?;
    let archive = archive.unwrap_or(&config.archive.name);

    let repo = open_repo(config, true).await?;
    let manager = SnapshotManager::new(&repo, config.engine.clone(), archive)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling backup");
            on_interrupt.cancel();
        }
    });

    println!("Backing up {} → {} ({})", source.display(), archive, describe_storage(config));
    let pb = make_spinner("backup");
    pb.set_message(source.display().to_string());
    let result = manager.create_snapshot_with(&source, cancel).await;
    pb.finish_and_clear();
    let created = result.with_context(|| format!("backing up {}", source.display()))?;

    let report = &created.report;
    println!("Snapshot {} created:", created.id);
    println!("  root:     {}", short_hash(&created.snapshot.root_hash));
    println!("  files:    {} ({} unchanged)", report.files, report.files_reused);
    println!("  dirs:     {} ({} inlined)", report.dirs, report.dirs_inlined);
    println!("  bytes:    {}", fmt_bytes(report.bytes));
    println!(
        "  chunks:   {} new, {} deduplicated",
        report.chunks_stored, report.chunks_deduplicated
    );
    println!("  objects:  {} written", report.objects_written);
    if report.skipped > 0 {
        println!("  skipped:  {} (excluded, symlinks, special files)", report.skipped);
    }
    if !report.is_complete() {
        println!("  failed:   {} entries", report.failures.len());
        for failure in &report.failures {
            println!("    {}: {}", failure.path.display(), failure.error);
        }
    }
    Ok(())
}

// ── `cairn snapshots` ─────────────────────────────────────────────────────────

async fn cmd_snapshots(config: &CairnConfig, archive: Option<&str>, all: bool) -> Result<()> {
    let repo = open_repo(config, false).await?;
    let log = repo.log();
    let ids = if all {
        log.list_all().await?
    } else {
        log.list(archive.unwrap_or(&config.archive.name)).await?
    };

    if ids.is_empty() {
        println!("no snapshots");
        return Ok(());
    }
    println!("{:<24} {:>12} {:>8}  root", "snapshot", "started", "took");
    for id in ids {
        let snapshot = log.load(&id).await?;
        println!(
            "{:<24} {:>12} {:>7}s  {}",
            id.to_string(),
            snapshot.started,
            snapshot.finished - snapshot.started,
            short_hash(&snapshot.root_hash)
        );
    }
    Ok(())
}

// ── `cairn ls` ────────────────────────────────────────────────────────────────

async fn cmd_ls(config: &CairnConfig, selector: &str, path: &str, recursive: bool) -> Result<()> {
    let repo = open_repo(config, false).await?;
    let (id, snapshot) = resolve_snapshot(repo.log(), selector).await?;
    let reader = TreeReader::new(repo.store().clone());

    let dir = match reader
        .find(TreeRoot::from(&snapshot), path)
        .await
        .with_context(|| format!("looking up '{path}' in {id}"))?
    {
        Found::File(file) => {
            println!("{:>10}  {}", fmt_bytes(file.size), path);
            return Ok(());
        }
        Found::Dir(dir) => dir,
    };

    if !recursive {
        for sub in dir.sub_dirs() {
            println!("{:>10}  {}/", "<dir>", sub.name);
        }
        for file in dir.files() {
            println!("{:>10}  {}", fmt_bytes(file.size), file.name);
        }
        return Ok(());
    }

    let mut walker = reader.walk(dir);
    while let Some(item) = walker.next().await {
        match item {
            WalkItem::Dir { path, size } => println!("{:>10}  {path}/", fmt_bytes(size)),
            WalkItem::File { path, entry } => println!("{:>10}  {path}", fmt_bytes(entry.size)),
            WalkItem::Error { path, error } => eprintln!("error: {path}: {error}"),
        }
    }
    Ok(())
}

// ── `cairn restore` ───────────────────────────────────────────────────────────

async fn cmd_restore(
    config: &CairnConfig,
    selector: &str,
    target: &Path,
    options: RestoreOptions,
) -> Result<()> {
    let repo = open_repo(config, false).await?;
    let (id, snapshot) = resolve_snapshot(repo.log(), selector).await?;
    let reader = TreeReader::new(repo.store().clone());

    println!("Restoring {id} → {}", target.display());
    let pb = make_spinner("restore");
    let result = reader
        .restore(TreeRoot::from(&snapshot), target, options)
        .await;
    pb.finish_and_clear();
    let report = result.with_context(|| format!("restoring {id}"))?;

    println!("Restore complete:");
    println!("  files:  {}", report.files);
    println!("  dirs:   {}", report.dirs);
    println!("  bytes:  {}", fmt_bytes(report.bytes));
    if !report.failures.is_empty() {
        for failure in &report.failures {
            eprintln!("  failed: {}: {}", failure.path.display(), failure.error);
        }
        anyhow::bail!("{} entries could not be restored", report.failures.len());
    }
    Ok(())
}

// ── `cairn diff` ──────────────────────────────────────────────────────────────

async fn cmd_diff(config: &CairnConfig, old: &str, new: &str) -> Result<()> {
    let repo = open_repo(config, false).await?;
    let (_, old) = resolve_snapshot(repo.log(), old).await?;
    let (_, new) = resolve_snapshot(repo.log(), new).await?;

    let changes = TreeReader::new(repo.store().clone())
        .diff(TreeRoot::from(&old), TreeRoot::from(&new))
        .await
        .context("comparing snapshots")?;
    for change in &changes {
        let mark = match change.kind {
            ChangeKind::Added => '+',
            ChangeKind::Removed => '-',
            ChangeKind::Modified => 'M',
        };
        let slash = if change.is_dir { "/" } else { "" };
        println!("{mark} {}{slash}", change.path);
    }
    if changes.is_empty() {
        println!("no changes");
    }
    Ok(())
}

// ── `cairn forget` / `gc` / `recount` ─────────────────────────────────────────

async fn cmd_forget(config: &CairnConfig, selectors: &[String], then_gc: bool) -> Result<()> {
    let repo = open_repo(config, false).await?;
    for selector in selectors {
        let (id, _) = resolve_snapshot(repo.log(), selector).await?;
        SnapshotManager::new(&repo, config.engine.clone(), id.name.clone())?
            .forget(&id)
            .await
            .with_context(|| format!("forgetting {id}"))?;
        println!("forgot {id}");
    }

    if then_gc {
        return run_gc(&repo, config).await;
    }
    println!("run `cairn gc` to reclaim space");
    Ok(())
}

async fn cmd_gc(config: &CairnConfig) -> Result<()> {
    let repo = open_repo(config, false).await?;
    run_gc(&repo, config).await
}

async fn run_gc(repo: &Repository, config: &CairnConfig) -> Result<()> {
    let manager = SnapshotManager::new(repo, config.engine.clone(), config.archive.name.clone())?;
    let pb = make_spinner("gc");
    let result = manager.gc().await;
    pb.finish_and_clear();
    let stats = result.context("sweeping unreferenced objects")?;
    println!("Sweep complete:");
    println!("  scanned: {}", stats.scanned);
    println!("  kept:    {}", stats.kept);
    println!("  deleted: {} ({} orphaned)", stats.deleted, stats.orphans);
    Ok(())
}

async fn cmd_recount(config: &CairnConfig) -> Result<()> {
    let repo = open_repo(config, false).await?;
    let manager = SnapshotManager::new(&repo, config.engine.clone(), config.archive.name.clone())?;
    let stats = manager.recount().await.context("rebuilding reference ledger")?;
    println!(
        "Reference ledger rebuilt from {} snapshots: {} objects",
        stats.snapshots, stats.objects
    );
    if stats.unresolved > 0 {
        println!("  warning: {} directories could not be read", stats.unresolved);
    }
    Ok(())
}

// ── `cairn check` ─────────────────────────────────────────────────────────────

async fn cmd_check(config: &CairnConfig) -> Result<()> {
    let op = build_operator_from_env(config)?;
    let health = check_health(&op).await?;
    println!("storage:    {} (reachable)", describe_storage(config));
    println!("writable:   {}", if health.writable { "yes" } else { "no" });
    if !health.initialized {
        println!("repository: not initialized (run `cairn backup` to create one)");
        return Ok(());
    }

    let repo = Repository::open(op, config.engine.paranoid)
        .await
        .context("opening repository")?;
    let stats = repo.store().stats();
    let snapshots = repo.log().list_all().await?;
    println!("hash:       {}", repo.descriptor().hash.name());
    println!("snapshots:  {}", snapshots.len());
    println!("objects:    {} ({} references)", stats.objects, stats.references);
    Ok(())
}

// ── `cairn config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &CairnConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── Output helpers ────────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn short_hash(hash: &str) -> &str {
    &hash[..16.min(hash.len())]
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
