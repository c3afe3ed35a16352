use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use pgferry_core::Result;
use tokio::io::AsyncWrite;

// Title-case initial letter is part of the on-disk contract; existing
// archives were written with these exact keys.
pub const METADATA_UPLOAD_TIME: &str = "Upload_time";
pub const METADATA_MODIFIED_TIME: &str = "Modified_time";

#[async_trait]
pub trait Storage: Send + Sync {
    /// Store the contents of the local file `local_path` in the object
    /// identified by `key`, recording `mtime` (epoch seconds, 0 = omit) in
    /// the object's metadata.
    async fn put(&self, key: &str, local_path: &Path, mtime: i64) -> Result<()>;

    /// Store `body` as the content of the object identified by `key`.
    async fn put_string(&self, key: &str, body: &str) -> Result<()>;

    /// Stream the contents of the object identified by `key` into `out`.
    async fn get(&self, key: &str, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;

    /// Return the full contents of the object as a string.
    async fn get_string(&self, key: &str) -> Result<String>;

    /// Return the modified time stored in the object's metadata, or 0 if
    /// the metadata does not carry one.
    async fn get_last_modified_time(&self, key: &str) -> Result<i64>;

    /// Return the immediate child sub-prefixes of `prefix`, each with a
    /// trailing slash. Non-recursive.
    async fn list_folder(&self, prefix: &str) -> Result<Vec<String>>;

    /// Traverse the namespace rooted at `prefix`, pushing every descendant
    /// object key into `keys`. Folder markers are not emitted. Keys already
    /// pushed stay pushed if the traversal fails partway through.
    async fn walk_folder(&self, prefix: &str, keys: async_channel::Sender<String>) -> Result<()>;

    /// Remove the object identified by `key`. Removing an absent object is
    /// not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Metadata dictionary attached to every stored object.
pub(crate) fn object_metadata(mtime: i64) -> HashMap<String, String> {
    let now = chrono::Utc::now().timestamp();

    let mut metadata = HashMap::new();
    metadata.insert(METADATA_UPLOAD_TIME.to_string(), now.to_string());

    // add the source file's modified timestamp, if provided
    if mtime != 0 {
        metadata.insert(METADATA_MODIFIED_TIME.to_string(), mtime.to_string());
    }

    metadata
}
