use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use pgferry_backends::Storage;
use pgferry_core::{codec, namespace, Error};
use tracing::{debug, error};

#[derive(Args)]
pub struct ArchiveWalCommand {
    #[command(flatten)]
    pub common: crate::CommonOpts,

    #[arg(long, help = "Path to the WAL segment to archive, as passed by archive_command")]
    wal_path: PathBuf,
}

impl ArchiveWalCommand {
    pub async fn run(&self, storage: Arc<dyn Storage>) -> Result<()> {
        debug!(wal = %self.wal_path.display(), "starting upload of WAL segment");
        let begin = Instant::now();

        // the path PostgreSQL passes along is relative to its own working
        // directory
        let wal_path = absolutize(&self.wal_path)?;
        archive_wal(storage.as_ref(), &wal_path, &self.common.tmp).await?;

        debug!(
            wal = %self.wal_path.display(),
            elapsed = ?begin.elapsed(),
            "finished uploading WAL segment"
        );

        Ok(())
    }
}

pub(crate) fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir().context("failed to get the current working directory")?;
        Ok(cwd.join(path))
    }
}

/// Compress the segment and store it under the WAL folder. Segments carry
/// no mtime metadata; they are immutable once written.
pub(crate) async fn archive_wal(
    storage: &dyn Storage,
    wal_path: &Path,
    tmp_dir: &Path,
) -> Result<()> {
    let basename = wal_path
        .file_name()
        .ok_or_else(|| anyhow!("invalid WAL path: {}", wal_path.display()))?
        .to_string_lossy();
    let key = namespace::wal_key(&basename);

    // a 16 MiB segment typically compresses to around a quarter of its size
    let src = wal_path.to_path_buf();
    let tmp = tmp_dir.to_path_buf();
    let compressed = tokio::task::spawn_blocking(move || codec::compress(&src, &tmp))
        .await
        .map_err(|e| Error::Other(format!("compression task failed: {}", e)))?
        .context("failed to compress WAL segment")?;

    let result = storage.put(&key, &compressed, 0).await;
    if let Err(err) = tokio::fs::remove_file(&compressed).await {
        error!(path = %compressed.display(), error = %err, "failed to remove temporary file");
    }
    result.context("failed to upload WAL segment")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgferry_backends::MemoryStorage;

    #[tokio::test]
    async fn test_archive_wal_stores_compressed_segment() {
        let dir = tempfile::tempdir().unwrap();
        let segment = dir.path().join("000000010000000000000003");
        let payload: Vec<u8> = (0..32 * 1024u32).map(|i| (i % 13) as u8).collect();
        std::fs::write(&segment, &payload).unwrap();

        let storage = MemoryStorage::new();
        archive_wal(&storage, &segment, dir.path()).await.unwrap();

        // the body decompresses back to the original segment
        let mut body = Vec::new();
        storage
            .get("WAL/000000010000000000000003.lz4", &mut body)
            .await
            .unwrap();
        let fetched = dir.path().join("fetched.lz4");
        std::fs::write(&fetched, &body).unwrap();
        let restored = dir.path().join("restored");
        codec::decompress(&fetched, &restored).unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), payload);

        // WAL segments carry no mtime metadata
        assert_eq!(
            storage
                .get_last_modified_time("WAL/000000010000000000000003.lz4")
                .await
                .unwrap(),
            0
        );

        // the scratch file is gone
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("pgferry."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_archive_wal_missing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();
        let missing = dir.path().join("000000010000000000000004");
        assert!(archive_wal(&storage, &missing, dir.path()).await.is_err());
    }

    #[test]
    fn test_absolutize() {
        assert_eq!(
            absolutize(Path::new("/var/lib/pg/pg_xlog/seg")).unwrap(),
            PathBuf::from("/var/lib/pg/pg_xlog/seg")
        );

        let relative = absolutize(Path::new("pg_xlog/seg")).unwrap();
        assert!(relative.is_absolute());
        assert!(relative.ends_with("pg_xlog/seg"));
    }
}
