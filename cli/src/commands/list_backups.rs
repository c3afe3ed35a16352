use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use pgferry_backends::Storage;
use pgferry_core::namespace;
use tracing::debug;

#[derive(Args)]
pub struct ListBackupsCommand {
    #[command(flatten)]
    pub common: crate::CommonOpts,
}

pub(crate) struct BackupEntry {
    pub name: String,
    pub timestamp: i64,
    pub successful: bool,
}

impl ListBackupsCommand {
    pub async fn run(&self, storage: Arc<dyn Storage>) -> Result<()> {
        let backups = collect_backups(storage.as_ref()).await?;

        // the pointer may be missing entirely; nothing gets tagged then
        let latest = storage
            .get_string(namespace::LATEST_KEY)
            .await
            .unwrap_or_default();

        println!("{:<34}{:<28}{}", "Name", "Created", "Status");
        for entry in &backups {
            println!("{}", format_entry(entry, &latest));
        }

        Ok(())
    }
}

/// Every root-level prefix that is not reserved, with its creation time and
/// completion status, sorted by creation time ascending. Per-entry probe
/// failures degrade that entry instead of failing the listing.
pub(crate) async fn collect_backups(storage: &dyn Storage) -> Result<Vec<BackupEntry>> {
    let keys = storage
        .list_folder("")
        .await
        .context("failed to list backups")?;

    let mut backups = Vec::new();
    for key in keys {
        // remove the trailing slash from the backup's name
        let name = key.trim_end_matches('/');
        if namespace::is_reserved(name) {
            continue;
        }

        let timestamp = match storage.get_last_modified_time(&key).await {
            Ok(timestamp) => timestamp,
            Err(err) => {
                debug!(name, error = %err, "failed to read the creation timestamp");
                0
            }
        };
        let successful = storage
            .get_string(&namespace::successful_marker(name))
            .await
            .is_ok();

        backups.push(BackupEntry {
            name: name.to_string(),
            timestamp,
            successful,
        });
    }

    backups.sort_by_key(|b| b.timestamp);

    Ok(backups)
}

pub(crate) fn format_entry(entry: &BackupEntry, latest: &str) -> String {
    let status = if entry.successful { "" } else { "(incomplete!) " };
    let tag = if entry.name == latest { "(LATEST)" } else { "" };

    format!(
        "{:<34}{:<28}{}{}",
        entry.name,
        format_time(entry.timestamp),
        status,
        tag
    )
}

fn format_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgferry_backends::MemoryStorage;
    use std::path::Path;

    async fn seed_marker(storage: &MemoryStorage, dir: &Path, key: &str, mtime: i64) {
        let staging = dir.join("staging");
        std::fs::write(&staging, b"").unwrap();
        storage.put(key, &staging, mtime).await.unwrap();
        std::fs::remove_file(&staging).unwrap();
    }

    #[tokio::test]
    async fn test_collect_backups_sorts_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::new();

        seed_marker(&storage, dir.path(), "b2/", 200).await;
        seed_marker(&storage, dir.path(), "b1/", 100).await;
        storage.put_string("successful/b1", "").await.unwrap();
        storage.put_string("LATEST", "b1").await.unwrap();
        storage.put_string("WAL/seg.lz4", "segment").await.unwrap();

        let backups = collect_backups(&storage).await.unwrap();

        // reserved folders are filtered, order is by creation time
        assert_eq!(backups.len(), 2);
        assert_eq!(backups[0].name, "b1");
        assert!(backups[0].successful);
        assert_eq!(backups[1].name, "b2");
        assert!(!backups[1].successful);
    }

    #[tokio::test]
    async fn test_format_entry_tags() {
        let complete = BackupEntry {
            name: "b1".to_string(),
            timestamp: 100,
            successful: true,
        };
        let incomplete = BackupEntry {
            name: "b2".to_string(),
            timestamp: 200,
            successful: false,
        };

        let line = format_entry(&complete, "b1");
        assert!(line.starts_with("b1"));
        assert!(line.contains("1970-01-01T00:01:40"));
        assert!(line.ends_with("(LATEST)"));
        assert!(!line.contains("(incomplete!)"));

        let line = format_entry(&incomplete, "b1");
        assert!(line.contains("(incomplete!)"));
        assert!(!line.contains("(LATEST)"));
    }
}
