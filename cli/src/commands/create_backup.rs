use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Args;
use pgferry_backends::Storage;
use pgferry_core::{codec, namespace, Error};
use pgferry_postgres::{BackupSession, ConnectSettings, StopBackup};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::pool::WorkerPool;

// there's no point in taking backups of directories like pg_xlog
const PREFIXES_NOT_TO_BACKUP: &[&str] = &["pg_xlog", "postmaster.pid", "pg_replslot"];

#[derive(Args)]
pub struct CreateBackupCommand {
    #[command(flatten)]
    pub common: crate::CommonOpts,

    #[arg(long, value_parser = super::parse_new_backup_name, help = "Name of the backup")]
    backup_name: String,

    #[arg(
        long,
        value_parser = super::parse_data_directory,
        help = "Full path to the data directory of the PostgreSQL cluster to backup"
    )]
    data_directory: PathBuf,

    #[arg(long, default_value = "postgres", help = "PostgreSQL user")]
    user: String,

    #[arg(long, default_value = "", help = "PostgreSQL password")]
    password: String,

    #[arg(long, help = "Start the backup as soon as possible by issuing a checkpoint")]
    checkpoint: bool,

    #[arg(
        long,
        help = "Disallow other concurrent backups (the backup can only be taken on a primary)"
    )]
    exclusive: bool,

    #[arg(
        long,
        default_value_t = 60,
        help = "Cancel a start/stop backup statement if it takes more than the specified number of seconds"
    )]
    statement_timeout: u64,

    #[arg(long, default_value_t = 512 * 1024, help = "Compress files larger than this many bytes")]
    compress_threshold: u64,
}

impl CreateBackupCommand {
    pub async fn run(&self, storage: Arc<dyn Storage>, cancel: CancellationToken) -> Result<()> {
        let name = &self.backup_name;
        let data_dir = std::fs::canonicalize(&self.data_directory)
            .context("failed to resolve the data directory path")?;

        info!(name = %name, "starting backup");
        let begin = Instant::now();

        // don't allow existing backups to be overwritten
        let backup_key = namespace::backup_prefix(name);
        match storage.get_string(&backup_key).await {
            Ok(_) => return Err(Error::BackupExists { name: name.clone() }.into()),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err).context("failed to check for an existing backup"),
        }

        // create the top-level "folder" so the object actually exists and
        // carries creation-time metadata
        storage
            .put_string(&backup_key, "")
            .await
            .context("failed to create the top-level backup folder")?;

        let settings = ConnectSettings {
            user: self.user.clone(),
            password: self.password.clone(),
            statement_timeout: self.statement_timeout,
        };
        let session = BackupSession::start(&settings, name, self.checkpoint, self.exclusive)
            .await
            .context("failed to start backup")?;

        let (items, failures) = upload_data_directory(
            storage.clone(),
            &data_dir,
            name,
            self.common.workers,
            self.compress_threshold,
            &self.common.tmp,
            &cancel,
        )
        .await?;

        if cancel.is_cancelled() {
            // the successful marker is what certifies a backup; skipping
            // finalize leaves this one visibly incomplete
            bail!("backup cancelled, leaving '{}' incomplete", name);
        }
        if failures > 0 {
            bail!("{} files failed to upload, leaving '{}' incomplete", failures, name);
        }

        let payload = session.stop().await.context("failed to stop backup")?;
        finalize_backup(storage.as_ref(), name, payload).await?;

        info!(
            name = %name,
            files = items,
            elapsed = ?begin.elapsed(),
            "backup successfully completed"
        );

        Ok(())
    }
}

/// Walk the data directory and feed every entry through the worker pool.
/// Returns the number of items dispatched and the number that failed.
pub(crate) async fn upload_data_directory(
    storage: Arc<dyn Storage>,
    data_dir: &Path,
    backup_name: &str,
    workers: usize,
    compress_threshold: u64,
    tmp_dir: &Path,
    cancel: &CancellationToken,
) -> Result<(usize, u64)> {
    info!(number = workers, "spawning workers");
    let job = Arc::new(UploadJob {
        storage,
        data_dir: data_dir.to_path_buf(),
        backup_name: backup_name.to_string(),
        compress_threshold,
        tmp_dir: tmp_dir.to_path_buf(),
    });
    let pool = WorkerPool::spawn(workers, {
        let job = job.clone();
        move |rel_path: String| {
            let job = job.clone();
            async move { upload_one(&job, &rel_path).await }
        }
    });

    debug!(path = %data_dir.display(), "walking data directory");
    let mut items = 0usize;
    for entry in WalkDir::new(data_dir) {
        if cancel.is_cancelled() {
            warn!("cancellation requested, closing the work channel");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                // files come and go while PostgreSQL keeps running; that's
                // what an online backup is
                if err.io_error().map(|e| e.kind() == std::io::ErrorKind::NotFound) == Some(true) {
                    debug!(error = %err, "source file vanished");
                    continue;
                }
                let failures = pool.join().await;
                return Err(err)
                    .context(format!("failed to walk the data directory ({} upload failures)", failures));
            }
        };

        let rel_path = entry
            .path()
            .strip_prefix(data_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        if rel_path.is_empty() {
            continue;
        }
        if ignore_file(&rel_path) {
            debug!(path = %rel_path, "ignoring file");
            continue;
        }

        debug!(path = %rel_path, "adding file");
        pool.dispatch(rel_path).await?;
        items += 1;
    }

    info!("waiting for all workers to finish");
    let failures = pool.join().await;

    Ok((items, failures))
}

// true iff the path lives in one of the directories we do not back up
fn ignore_file(rel_path: &str) -> bool {
    PREFIXES_NOT_TO_BACKUP.iter().any(|p| rel_path.starts_with(p))
}

struct UploadJob {
    storage: Arc<dyn Storage>,
    data_dir: PathBuf,
    backup_name: String,
    compress_threshold: u64,
    tmp_dir: PathBuf,
}

/// Compress (when worthwhile) and upload a single file, named after its
/// path relative to the data directory.
async fn upload_one(job: &UploadJob, rel_path: &str) -> pgferry_core::Result<()> {
    let path = job.data_dir.join(rel_path);
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %rel_path, "failed to stat file, might have been removed");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    if meta.is_dir() {
        debug!(path = %rel_path, "ignoring directory");
        return Ok(());
    }

    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as i64);

    let mut key = format!("{}/{}", job.backup_name, rel_path);
    if meta.len() > job.compress_threshold {
        debug!(path = %rel_path, size = meta.len(), "compressing file");
        let src = path.clone();
        let tmp_dir = job.tmp_dir.clone();
        let compressed = tokio::task::spawn_blocking(move || codec::compress(&src, &tmp_dir))
            .await
            .map_err(|e| Error::Other(format!("compression task failed: {}", e)))??;

        key.push_str(codec::LZ4_EXTENSION);
        let result = job.storage.put(&key, &compressed, mtime).await;
        // the scratch file goes away no matter how the upload went
        if let Err(err) = tokio::fs::remove_file(&compressed).await {
            error!(path = %compressed.display(), error = %err, "failed to remove temporary file");
        }
        result
    } else {
        job.storage.put(&key, &path, mtime).await
    }
}

/// Steps that certify the backup: backup_label and tablespace_map (for
/// non-exclusive backups), the successful marker, the LATEST pointer.
pub(crate) async fn finalize_backup(
    storage: &dyn Storage,
    backup_name: &str,
    payload: Option<StopBackup>,
) -> Result<()> {
    if let Some(stop) = payload {
        let key = format!("{}backup_label", namespace::backup_prefix(backup_name));
        storage
            .put_string(&key, &stop.backup_label)
            .await
            .context("failed to store backup_label")?;

        if !stop.tablespace_map.is_empty() {
            let key = format!("{}tablespace_map", namespace::backup_prefix(backup_name));
            storage
                .put_string(&key, &stop.tablespace_map)
                .await
                .context("failed to store tablespace_map")?;
        }
    }

    storage
        .put_string(&namespace::successful_marker(backup_name), "")
        .await
        .context("failed to mark the backup as successfully completed")?;

    storage
        .put_string(namespace::LATEST_KEY, backup_name)
        .await
        .context("failed to update the LATEST pointer")?;

    Ok(())
}
