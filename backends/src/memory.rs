use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use pgferry_core::{Error, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::backend::{object_metadata, Storage, METADATA_MODIFIED_TIME};

struct StoredObject {
    body: Bytes,
    metadata: HashMap<String, String>,
}

/// Object store over an in-memory map, with the same key and metadata
/// semantics as the S3 backend. Backs the engine tests and keeps the
/// `Storage` seam honest for alternate backends.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<BTreeMap<String, StoredObject>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: &str, body: Bytes, mtime: i64) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body,
                metadata: object_metadata(mtime),
            },
        );
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, local_path: &Path, mtime: i64) -> Result<()> {
        let body = tokio::fs::read(local_path).await?;
        self.insert(key, Bytes::from(body), mtime);
        Ok(())
    }

    async fn put_string(&self, key: &str, body: &str) -> Result<()> {
        self.insert(key, Bytes::copy_from_slice(body.as_bytes()), chrono::Utc::now().timestamp());
        Ok(())
    }

    async fn get(&self, key: &str, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let body = {
            let objects = self.objects.lock().unwrap();
            let object = objects.get(key).ok_or_else(|| Error::NotFound { key: key.to_string() })?;
            object.body.clone()
        };
        out.write_all(&body).await?;
        out.flush().await?;
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<String> {
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or_else(|| Error::NotFound { key: key.to_string() })?;
        String::from_utf8(object.body.to_vec())
            .map_err(|e| Error::Storage(format!("object {} is not valid UTF-8: {}", key, e)))
    }

    async fn get_last_modified_time(&self, key: &str) -> Result<i64> {
        let objects = self.objects.lock().unwrap();
        let object = objects.get(key).ok_or_else(|| Error::NotFound { key: key.to_string() })?;
        match object.metadata.get(METADATA_MODIFIED_TIME) {
            Some(value) => value.parse::<i64>().map_err(|_| Error::Metadata {
                key: key.to_string(),
                value: value.clone(),
            }),
            None => Ok(0),
        }
    }

    async fn list_folder(&self, prefix: &str) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let mut children: Vec<String> = Vec::new();

        for key in objects.keys() {
            let Some(rest) = key.strip_prefix(prefix) else { continue };
            if let Some(idx) = rest.find('/') {
                let child = format!("{}{}/", prefix, &rest[..idx]);
                // the map is ordered, duplicates are adjacent
                if children.last() != Some(&child) {
                    children.push(child);
                }
            }
        }

        Ok(children)
    }

    async fn walk_folder(&self, prefix: &str, keys: async_channel::Sender<String>) -> Result<()> {
        let descendants: Vec<String> = {
            let objects = self.objects.lock().unwrap();
            objects
                .keys()
                .filter(|k| k.starts_with(prefix) && !k.ends_with('/'))
                .cloned()
                .collect()
        };

        for key in descendants {
            keys.send(key)
                .await
                .map_err(|_| Error::Other("walk channel closed".to_string()))?;
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}
