use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Durable home of the action queue: a single blob under one key.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// `Ok(None)` when nothing was ever written under `key`.
    async fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace the blob. Readers see either the old or the new value.
    async fn write(&self, key: &str, value: &[u8]) -> io::Result<()>;

    async fn delete(&self, key: &str) -> io::Result<()>;
}

/// One `{key}.json` file per key inside `dir`.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl BlobStorage for FileStorage {
    async fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, key: &str, value: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // Readers see the old file or the new one, never a partial write.
        let target = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(value).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &target).await
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &[u8]) -> io::Result<()> {
        self.blobs.lock().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> io::Result<()> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}
