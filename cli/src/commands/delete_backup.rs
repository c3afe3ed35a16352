use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use pgferry_backends::Storage;
use pgferry_core::{namespace, Error};
use tracing::{debug, error, info};

use crate::pool::WorkerPool;

#[derive(Args)]
pub struct DeleteBackupCommand {
    #[command(flatten)]
    pub common: crate::CommonOpts,

    #[arg(long, value_parser = super::parse_new_backup_name, help = "Name of the backup")]
    backup_name: String,
}

impl DeleteBackupCommand {
    pub async fn run(&self, storage: Arc<dyn Storage>) -> Result<()> {
        info!(name = %self.backup_name, "starting to delete backup");
        let begin = Instant::now();

        delete_backup(storage, &self.backup_name, self.common.workers).await?;

        info!(elapsed = ?begin.elapsed(), "backup successfully deleted");

        Ok(())
    }
}

pub(crate) async fn delete_backup(
    storage: Arc<dyn Storage>,
    backup_name: &str,
    workers: usize,
) -> Result<()> {
    let backup_key = namespace::backup_prefix(backup_name);

    // make sure the backup exists
    if let Err(err) = storage.get_string(&backup_key).await {
        if err.is_not_found() {
            return Err(Error::BackupNotFound { name: backup_name.to_string() }.into());
        }
        return Err(err).context("failed to check that the backup exists");
    }

    info!(number = workers, "spawning workers");
    let pool = WorkerPool::spawn(workers, {
        let storage = storage.clone();
        move |key: String| {
            let storage = storage.clone();
            async move {
                debug!(key = %key, "deleting object");
                storage.delete(&key).await
            }
        }
    });

    let walked = storage.walk_folder(&backup_key, pool.sender()).await;

    info!("waiting for all workers to finish");
    // per-object failures were already logged; the folder and marker
    // deletions below are the authoritative signal
    let _ = pool.join().await;
    walked.context("failed to traverse the backup folder")?;

    // remove the top level folder
    storage
        .delete(&backup_key)
        .await
        .context("failed to delete the top-level folder")?;

    // and the marker that certified the backup, if there is one
    let marker = namespace::successful_marker(backup_name);
    if storage.get_string(&marker).await.is_ok() {
        if let Err(err) = storage.delete(&marker).await {
            error!(key = %marker, error = %err, "failed to delete the successful marker");
        }
    }

    // the LATEST pointer must not keep naming a backup that is gone
    match storage.get_string(namespace::LATEST_KEY).await {
        Ok(latest) if latest == backup_name => repair_latest(storage.as_ref()).await?,
        Ok(_) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err).context("failed to read the LATEST pointer"),
    }

    Ok(())
}

/// Point LATEST at the most recently created remaining successful backup,
/// or remove it when no backup qualifies.
async fn repair_latest(storage: &dyn Storage) -> Result<()> {
    let children = storage
        .list_folder("")
        .await
        .context("failed to list backups while repairing the LATEST pointer")?;

    let mut best: Option<(String, i64)> = None;
    for child in children {
        let candidate = child.trim_end_matches('/');
        if namespace::is_reserved(candidate) {
            continue;
        }

        let mtime = match storage.get_last_modified_time(&child).await {
            Ok(mtime) => mtime,
            Err(err) => {
                debug!(name = %candidate, error = %err, "skipping candidate without a timestamp");
                continue;
            }
        };

        if storage
            .get_string(&namespace::successful_marker(candidate))
            .await
            .is_err()
        {
            debug!(name = %candidate, "skipping incomplete candidate");
            continue;
        }

        if best.as_ref().map_or(true, |(_, m)| mtime > *m) {
            best = Some((candidate.to_string(), mtime));
        }
    }

    match best {
        Some((name, _)) => {
            info!(name = %name, "updating the LATEST pointer");
            storage
                .put_string(namespace::LATEST_KEY, &name)
                .await
                .context("failed to update the LATEST pointer")?;
        }
        None => {
            info!("no successful backup remains, removing the LATEST pointer");
            storage
                .delete(namespace::LATEST_KEY)
                .await
                .context("failed to remove the LATEST pointer")?;
        }
    }

    Ok(())
}
