use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use pgferry_backends::Storage;
use pgferry_core::{codec, namespace, Error};
use tracing::{debug, error, info};

use super::archive_wal::absolutize;

#[derive(Args)]
pub struct RestoreWalCommand {
    #[command(flatten)]
    pub common: crate::CommonOpts,

    #[arg(long, help = "Name of the WAL segment to fetch, as passed by restore_command")]
    wal_filename: String,

    #[arg(long, help = "Path to restore the WAL segment to, as passed by restore_command")]
    wal_path: PathBuf,
}

impl RestoreWalCommand {
    pub async fn run(&self, storage: Arc<dyn Storage>) -> Result<()> {
        let wal_path = absolutize(&self.wal_path)?;
        restore_wal(
            storage.as_ref(),
            &self.wal_filename,
            &wal_path,
            &self.common.tmp,
        )
        .await
    }
}

/// Fetch a segment from the WAL folder and decompress it into place.
pub(crate) async fn restore_wal(
    storage: &dyn Storage,
    wal_filename: &str,
    wal_path: &Path,
    tmp_dir: &Path,
) -> Result<()> {
    // PostgreSQL asks for timeline history files it never archived; telling
    // it they don't exist is the expected answer
    if namespace::is_history_file(wal_filename) {
        debug!(wal = %wal_filename, "history file, nothing to fetch");
        return Ok(());
    }

    let key = namespace::wal_key(wal_filename);
    debug!(key = %key, "fetching WAL segment");

    let tmp = scratch_path(tmp_dir)?;
    let fetched = fetch_segment(storage, &key, &tmp).await;

    let result = match fetched {
        Ok(()) => {
            let compressed = tmp.clone();
            let target = wal_path.to_path_buf();
            tokio::task::spawn_blocking(move || codec::decompress(&compressed, &target))
                .await
                .map_err(|e| Error::Other(format!("decompression task failed: {}", e)))?
                .context("failed to decompress WAL segment")
        }
        Err(err) => {
            // recovery probes for segments that were never archived; this
            // is routine, not an incident
            info!(wal = %wal_filename, error = %err, "WAL segment not available");
            Err(anyhow!(err))
        }
    };

    if let Err(err) = tokio::fs::remove_file(&tmp).await {
        error!(path = %tmp.display(), error = %err, "failed to remove temporary file");
    }

    result
}

fn scratch_path(tmp_dir: &Path) -> Result<PathBuf> {
    let (_, path) = tempfile::Builder::new()
        .prefix("pgferry.")
        .tempfile_in(tmp_dir)
        .context("failed to create a temporary file")?
        .keep()
        .map_err(|e| anyhow!("failed to keep a temporary file: {}", e))?;
    Ok(path)
}

async fn fetch_segment(storage: &dyn Storage, key: &str, tmp: &Path) -> pgferry_core::Result<()> {
    let mut out = tokio::fs::File::create(tmp).await?;
    storage.get(key, &mut out).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgferry_backends::MemoryStorage;

    #[tokio::test]
    async fn test_round_trip_with_archive() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("000000010000000000000003");
        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 29) as u8).collect();
        std::fs::write(&segment, &payload).unwrap();

        let storage = MemoryStorage::new();
        super::super::archive_wal::archive_wal(&storage, &segment, dir.path())
            .await
            .unwrap();

        let restored = dir.path().join("restored");
        restore_wal(&storage, "000000010000000000000003", &restored, dir.path())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&restored).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_history_files_succeed_without_storage() {
        let dir = tempfile::tempdir().unwrap();
        // an empty store: any fetch would fail loudly
        let storage = MemoryStorage::new();

        let target = dir.path().join("00000002.history");
        restore_wal(&storage, "00000002.history", &target, dir.path())
            .await
            .unwrap();

        // nothing was fetched, nothing was written
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_missing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();

        let target = dir.path().join("restored");
        let result = restore_wal(&storage, "000000010000000000000009", &target, dir.path()).await;
        assert!(result.is_err());

        // no scratch files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("pgferry."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
