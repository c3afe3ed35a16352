//! Reserved key names and the rules for composing object keys.
//!
//! Every key the rest of the tool reads or writes is built here, so the
//! filter logic in list/delete cannot drift from the create path.

use crate::codec;

/// Object whose body names the most recent successfully-completed backup.
pub const LATEST_KEY: &str = "LATEST";
/// Folder holding one zero-byte marker per successfully-completed backup.
pub const SUCCESSFUL_FOLDER: &str = "successful";
/// Folder holding compressed WAL segments.
pub const WAL_FOLDER: &str = "WAL";

pub fn backup_prefix(name: &str) -> String {
    format!("{}/", name)
}

pub fn successful_marker(name: &str) -> String {
    format!("{}/{}", SUCCESSFUL_FOLDER, name)
}

pub fn wal_key(filename: &str) -> String {
    format!("{}/{}{}", WAL_FOLDER, filename, codec::LZ4_EXTENSION)
}

/// Names that can never be user-supplied backup names and must be filtered
/// out of root-level enumerations.
pub fn is_reserved(name: &str) -> bool {
    matches!(name, LATEST_KEY | SUCCESSFUL_FOLDER | WAL_FOLDER)
}

/// Backup names must match `^[a-zA-Z0-9_-]+$`.
pub fn is_valid_backup_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Timeline history files (`<digits>.history`) are requested by PostgreSQL
/// during recovery even when they were never archived.
pub fn is_history_file(filename: &str) -> bool {
    filename
        .strip_suffix(".history")
        .is_some_and(|tli| !tli.is_empty() && tli.bytes().all(|b| b.is_ascii_digit()))
}
