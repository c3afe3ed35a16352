pub mod archive_wal;
pub mod create_backup;
pub mod delete_backup;
pub mod list_backups;
pub mod restore_backup;
pub mod restore_wal;

pub use archive_wal::ArchiveWalCommand;
pub use create_backup::CreateBackupCommand;
pub use delete_backup::DeleteBackupCommand;
pub use list_backups::ListBackupsCommand;
pub use restore_backup::RestoreBackupCommand;
pub use restore_wal::RestoreWalCommand;

use pgferry_core::{namespace, Error};
use std::path::PathBuf;

/// Backup names are object-key components; anything outside
/// `[A-Za-z0-9_-]` is rejected before any I/O happens.
pub(crate) fn parse_new_backup_name(value: &str) -> Result<String, String> {
    if namespace::is_valid_backup_name(value) && !namespace::is_reserved(value) {
        Ok(value.to_string())
    } else {
        Err(Error::InvalidBackupName { name: value.to_string() }.to_string())
    }
}

/// Like `parse_new_backup_name`, but the literal `LATEST` is accepted as an
/// alias meaning "whatever the LATEST pointer names".
pub(crate) fn parse_backup_name_or_latest(value: &str) -> Result<String, String> {
    if value == namespace::LATEST_KEY {
        return Ok(value.to_string());
    }
    parse_new_backup_name(value)
}

pub(crate) fn parse_data_directory(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => Ok(path),
        Ok(_) => Err(format!("path to data directory is not a directory: {}", value)),
        Err(_) => Err(format!("data directory not found: {}", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_backup_name_rejects_invalid_and_reserved() {
        assert!(parse_new_backup_name("nightly-2019_04").is_ok());
        assert!(parse_new_backup_name("night ly").is_err());
        assert!(parse_new_backup_name("b1/../b2").is_err());
        assert!(parse_new_backup_name("LATEST").is_err());
        assert!(parse_new_backup_name("successful").is_err());
        assert!(parse_new_backup_name("WAL").is_err());
    }

    #[test]
    fn test_latest_alias_is_read_time_only() {
        assert_eq!(parse_backup_name_or_latest("LATEST").unwrap(), "LATEST");
        assert!(parse_backup_name_or_latest("b1").is_ok());
        assert!(parse_backup_name_or_latest("successful").is_err());
    }
}
