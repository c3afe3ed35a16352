use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Args;
use pgferry_backends::Storage;
use pgferry_core::{codec, namespace, Error};
use tracing::{debug, error, info};

use crate::pool::WorkerPool;

// empty directories are not backed up, but these must exist for the
// server to start
const DIRECTORIES_THAT_MUST_EXIST: &[&str] =
    &["pg_tblspc", "pg_replslot", "pg_stat", "pg_snapshots", "pg_xlog"];

#[derive(Args)]
pub struct RestoreBackupCommand {
    #[command(flatten)]
    pub common: crate::CommonOpts,

    #[arg(
        long,
        value_parser = super::parse_backup_name_or_latest,
        help = "Name of the backup, or LATEST for the most recent successful one"
    )]
    backup_name: String,

    #[arg(
        long,
        value_parser = super::parse_data_directory,
        help = "Full path to the data directory to restore the backup into"
    )]
    data_directory: PathBuf,

    #[arg(
        long,
        help = "Use the last modified timestamp to transfer only files that have changed"
    )]
    modified_only: bool,
}

impl RestoreBackupCommand {
    pub async fn run(&self, storage: Arc<dyn Storage>) -> Result<()> {
        let name = resolve_backup_name(storage.as_ref(), &self.backup_name).await?;
        let data_dir = std::fs::canonicalize(&self.data_directory)
            .context("failed to resolve the data directory path")?;

        info!(name = %name, "starting to restore backup");
        let begin = Instant::now();

        let failures = restore_files(
            storage.clone(),
            &name,
            &data_dir,
            self.common.workers,
            self.modified_only,
        )
        .await?;

        debug!("creating missing required directories");
        create_required_dirs(&data_dir);

        if failures > 0 {
            bail!("{} files failed to restore", failures);
        }

        info!(elapsed = ?begin.elapsed(), "backup successfully restored");

        Ok(())
    }
}

/// Dereference the LATEST alias, if that's what the user asked for.
pub(crate) async fn resolve_backup_name(storage: &dyn Storage, name: &str) -> Result<String> {
    if name != namespace::LATEST_KEY {
        return Ok(name.to_string());
    }

    storage
        .get_string(namespace::LATEST_KEY)
        .await
        .context("failed to resolve the name of the latest backup")
}

/// Walk the backup's namespace and feed every object through the worker
/// pool. Returns the number of objects that failed to restore.
pub(crate) async fn restore_files(
    storage: Arc<dyn Storage>,
    backup_name: &str,
    data_dir: &Path,
    workers: usize,
    modified_only: bool,
) -> Result<u64> {
    info!(number = workers, "spawning workers");
    let job = Arc::new(RestoreJob {
        storage: storage.clone(),
        data_dir: data_dir.to_path_buf(),
        backup_prefix: namespace::backup_prefix(backup_name),
        modified_only,
    });
    let pool = WorkerPool::spawn(workers, {
        let job = job.clone();
        move |key: String| {
            let job = job.clone();
            async move { restore_one(&job, &key).await }
        }
    });

    let walked = storage
        .walk_folder(&job.backup_prefix, pool.sender())
        .await;

    info!("waiting for all workers to finish");
    let failures = pool.join().await;
    walked.context("failed to traverse the backup folder")?;

    Ok(failures)
}

struct RestoreJob {
    storage: Arc<dyn Storage>,
    data_dir: PathBuf,
    backup_prefix: String,
    modified_only: bool,
}

/// Download a single object into its place under the data directory,
/// decompressing when the key says so and restoring the recorded mtime.
async fn restore_one(job: &RestoreJob, key: &str) -> pgferry_core::Result<()> {
    debug!(remote = %key, "processing file");

    // the path relative to the data directory is the key minus the backup name
    let rel_path = key.strip_prefix(&job.backup_prefix).unwrap_or(key);
    let dst = job.data_dir.join(rel_path);

    let mtime = match job.storage.get_last_modified_time(key).await {
        Ok(mtime) => mtime,
        Err(err) => {
            error!(remote = %key, error = %err, "failed to read object metadata");
            0
        }
    };

    // skip the download entirely when the local copy already matches
    if job.modified_only && mtime != 0 {
        // the key may carry a compression extension the local file doesn't
        let local = strip_lz4(&dst);
        if file_has_not_changed(&local, mtime) {
            debug!(remote = %key, "skipping unmodified file");
            return Ok(());
        }
    }

    debug!(remote = %key, local = %dst.display(), "restoring file");
    if let Some(dir) = dst.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut out = tokio::fs::File::create(&dst).await?;
    job.storage.get(key, &mut out).await?;
    drop(out);

    let final_path = if codec::is_compressed(key) {
        let decompressed = strip_lz4(&dst);
        debug!(
            compressed = %dst.display(),
            decompressed = %decompressed.display(),
            "decompressing file"
        );
        let compressed = dst.clone();
        let target = decompressed.clone();
        tokio::task::spawn_blocking(move || codec::decompress(&compressed, &target))
            .await
            .map_err(|e| Error::Other(format!("decompression task failed: {}", e)))??;

        if let Err(err) = tokio::fs::remove_file(&dst).await {
            error!(path = %dst.display(), error = %err, "failed to remove compressed file");
        }
        decompressed
    } else {
        dst
    };

    // make the local file look exactly like the one that was backed up
    if mtime != 0 {
        debug!(file = %final_path.display(), mtime, "updating mtime");
        set_modified_time(&final_path, mtime)?;
    }

    Ok(())
}

fn strip_lz4(path: &Path) -> PathBuf {
    match path.to_str().and_then(|p| p.strip_suffix(codec::LZ4_EXTENSION)) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

fn file_has_not_changed(local: &Path, mtime: i64) -> bool {
    let meta = match std::fs::metadata(local) {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return false,
        Err(err) => {
            error!(path = %local.display(), error = %err, "failed to stat file");
            return false;
        }
    };

    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        == Some(mtime)
}

fn set_modified_time(path: &Path, mtime: i64) -> std::io::Result<()> {
    let times = std::fs::FileTimes::new()
        .set_accessed(SystemTime::now())
        .set_modified(UNIX_EPOCH + Duration::from_secs(mtime as u64));
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_times(times)
}

/// PostgreSQL refuses to start without these directories, 0700 and all.
pub(crate) fn create_required_dirs(data_dir: &Path) {
    for name in DIRECTORIES_THAT_MUST_EXIST {
        let path = data_dir.join(name);
        if path.exists() {
            continue;
        }
        if let Err(err) = create_dir_0700(&path) {
            error!(path = %path.display(), error = %err, "failed to create directory");
        }
    }
}

#[cfg(unix)]
fn create_dir_0700(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_dir_0700(path: &Path) -> std::io::Result<()> {
    std::fs::DirBuilder::new().create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgferry_backends::MemoryStorage;

    async fn seed_file(storage: &MemoryStorage, dir: &Path, key: &str, body: &[u8], mtime: i64) {
        let staging = dir.join("staging");
        std::fs::write(&staging, body).unwrap();
        storage.put(key, &staging, mtime).await.unwrap();
        std::fs::remove_file(&staging).unwrap();
    }

    async fn seed_compressed(storage: &MemoryStorage, dir: &Path, key: &str, body: &[u8], mtime: i64) {
        let staging = dir.join("staging");
        std::fs::write(&staging, body).unwrap();
        let compressed = codec::compress(&staging, dir).unwrap();
        storage.put(key, &compressed, mtime).await.unwrap();
        std::fs::remove_file(&staging).unwrap();
        std::fs::remove_file(&compressed).unwrap();
    }

    fn local_mtime(path: &Path) -> i64 {
        std::fs::metadata(path)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn test_restore_files_round_trip() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();

        storage.put_string("b1/", "").await.unwrap();
        seed_file(&storage, work.path(), "b1/PG_VERSION", b"9.6\n", 1554600000).await;
        seed_file(&storage, work.path(), "b1/base/16384/2619", b"catalog page", 1554600100).await;
        seed_compressed(
            &storage,
            work.path(),
            "b1/base/16384/2620.lz4",
            b"a page large enough to have been compressed",
            1554600200,
        )
        .await;

        let failures = restore_files(Arc::new(storage), "b1", target.path(), 2, false)
            .await
            .unwrap();
        assert_eq!(failures, 0);

        assert_eq!(
            std::fs::read(target.path().join("PG_VERSION")).unwrap(),
            b"9.6\n"
        );
        assert_eq!(
            std::fs::read(target.path().join("base/16384/2619")).unwrap(),
            b"catalog page"
        );
        // compressed objects come back decompressed, without the extension
        assert_eq!(
            std::fs::read(target.path().join("base/16384/2620")).unwrap(),
            b"a page large enough to have been compressed"
        );
        assert!(!target.path().join("base/16384/2620.lz4").exists());

        // recorded mtimes survive the round trip
        assert_eq!(local_mtime(&target.path().join("PG_VERSION")), 1554600000);
        assert_eq!(local_mtime(&target.path().join("base/16384/2619")), 1554600100);
        assert_eq!(local_mtime(&target.path().join("base/16384/2620")), 1554600200);
    }

    #[tokio::test]
    async fn test_modified_only_skips_unchanged_files() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();

        seed_file(&storage, work.path(), "b1/base/1", b"remote contents", 1554600000).await;
        seed_file(&storage, work.path(), "b1/base/2", b"changed upstream", 1554600500).await;

        // local copy of base/1 matches the recorded mtime; base/2 does not
        std::fs::create_dir_all(target.path().join("base")).unwrap();
        std::fs::write(target.path().join("base/1"), b"local contents").unwrap();
        set_modified_time(&target.path().join("base/1"), 1554600000).unwrap();
        std::fs::write(target.path().join("base/2"), b"stale").unwrap();
        set_modified_time(&target.path().join("base/2"), 1000).unwrap();

        let failures = restore_files(Arc::new(storage), "b1", target.path(), 1, true)
            .await
            .unwrap();
        assert_eq!(failures, 0);

        // unchanged file was never downloaded, its local body is untouched
        assert_eq!(
            std::fs::read(target.path().join("base/1")).unwrap(),
            b"local contents"
        );
        assert_eq!(
            std::fs::read(target.path().join("base/2")).unwrap(),
            b"changed upstream"
        );
    }

    #[tokio::test]
    async fn test_upload_then_restore_reproduces_the_tree() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();

        std::fs::create_dir_all(source.path().join("base/16384")).unwrap();
        std::fs::create_dir_all(source.path().join("pg_xlog")).unwrap();
        std::fs::write(source.path().join("PG_VERSION"), b"9.6\n").unwrap();
        std::fs::write(source.path().join("base/16384/2619"), b"a small catalog page").unwrap();
        let big: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(source.path().join("base/16384/2620"), &big).unwrap();
        std::fs::write(source.path().join("pg_xlog/000000010000000000000001"), b"wal").unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let (_, failures) = super::super::create_backup::upload_data_directory(
            Arc::new(storage.clone()),
            source.path(),
            "b1",
            2,
            1024,
            source.path(),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(failures, 0);

        let failures = restore_files(Arc::new(storage), "b1", target.path(), 2, false)
            .await
            .unwrap();
        assert_eq!(failures, 0);

        for rel in ["PG_VERSION", "base/16384/2619", "base/16384/2620"] {
            assert_eq!(
                std::fs::read(target.path().join(rel)).unwrap(),
                std::fs::read(source.path().join(rel)).unwrap(),
                "{} should round-trip",
                rel
            );
            assert_eq!(
                local_mtime(&target.path().join(rel)),
                local_mtime(&source.path().join(rel)),
                "{} should keep its mtime",
                rel
            );
        }

        // the filtered tree never made it into the backup
        assert!(!target.path().join("pg_xlog/000000010000000000000001").exists());
    }

    #[tokio::test]
    async fn test_resolve_backup_name() {
        let storage = MemoryStorage::new();
        assert_eq!(
            resolve_backup_name(&storage, "b1").await.unwrap(),
            "b1"
        );

        // no LATEST pointer yet
        assert!(resolve_backup_name(&storage, "LATEST").await.is_err());

        storage.put_string("LATEST", "b2").await.unwrap();
        assert_eq!(
            resolve_backup_name(&storage, "LATEST").await.unwrap(),
            "b2"
        );
    }

    #[tokio::test]
    async fn test_create_required_dirs() {
        let target = tempfile::tempdir().unwrap();
        std::fs::create_dir(target.path().join("pg_xlog")).unwrap();

        create_required_dirs(target.path());

        for name in DIRECTORIES_THAT_MUST_EXIST {
            let path = target.path().join(name);
            assert!(path.is_dir(), "{} should exist", name);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(target.path().join("pg_stat"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
