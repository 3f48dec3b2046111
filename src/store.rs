//! Object store construction.
//!
//! Durable state (metadata snapshots, pending requests, Raft journals) is kept
//! in an `object_store`. A configured data directory selects the local
//! filesystem backend; otherwise state lives in memory for the process lifetime.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Open the object store rooted at `data_dir`, or an in-memory one.
pub fn create_object_store(data_dir: Option<&Path>) -> Result<Arc<dyn ObjectStore>> {
    match data_dir {
        Some(path) => {
            std::fs::create_dir_all(path).map_err(|e| {
                Error::Config(format!("Failed to create data directory: {}", e))
            })?;
            let store = LocalFileSystem::new_with_prefix(path)
                .map_err(|e| Error::Config(format!("Failed to open data directory: {}", e)))?;
            info!(path = %path.display(), "Using local filesystem object store");
            Ok(Arc::new(store))
        }
        None => {
            info!("No data directory configured, state will not survive restarts");
            Ok(Arc::new(InMemory::new()))
        }
    }
}

/// Write `data` to `path` so readers see either the old or the new object.
///
/// The bytes land on a unique temp path first and are then renamed into
/// place. Backends without rename get copy + delete instead.
pub async fn put_atomic(store: &dyn ObjectStore, path: &ObjectPath, data: Vec<u8>) -> Result<()> {
    let temp_path = ObjectPath::from(format!("{}.temp-{}", path, uuid::Uuid::new_v4()));

    store.put(&temp_path, Bytes::from(data).into()).await.map_err(|e| {
        error!(error = %e, path = %temp_path, "Failed to write temp object");
        Error::from(e)
    })?;

    if let Err(e) = store.rename(&temp_path, path).await {
        if let Err(copy_err) = store.copy(&temp_path, path).await {
            error!(error = %copy_err, path = %path, "Failed to copy temp object into place");
            let _ = store.delete(&temp_path).await;
            return Err(Error::from(copy_err));
        }
        let _ = store.delete(&temp_path).await;
        debug!(error = %e, path = %path, "Used copy+delete fallback (rename not supported)");
    }
    Ok(())
}

/// Read the object at `path`, `None` when it does not exist.
pub async fn get_optional(store: &dyn ObjectStore, path: &ObjectPath) -> Result<Option<Bytes>> {
    match store.get(path).await {
        Ok(result) => Ok(Some(result.bytes().await?)),
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_local_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_object_store(Some(dir.path())).unwrap();
        let path = ObjectPath::from("check/key");
        store
            .put(&path, Bytes::from_static(b"value").into())
            .await
            .unwrap();
        let bytes = store.get(&path).await.unwrap().bytes().await.unwrap();
        assert_eq!(&bytes[..], b"value");
    }

    #[tokio::test]
    async fn test_memory_store_when_no_dir() {
        let store = create_object_store(None).unwrap();
        let path = ObjectPath::from("missing");
        assert!(matches!(
            store.get(&path).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_put_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = create_object_store(Some(dir.path())).unwrap();
        let path = ObjectPath::from("meta/current");

        put_atomic(store.as_ref(), &path, b"one".to_vec()).await.unwrap();
        put_atomic(store.as_ref(), &path, b"two".to_vec()).await.unwrap();

        let bytes = get_optional(store.as_ref(), &path).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"two");

        let listed: Vec<_> = store
            .list(Some(&ObjectPath::from("meta")))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_get_optional_missing() {
        let store = create_object_store(None).unwrap();
        let missing = get_optional(store.as_ref(), &ObjectPath::from("nope"))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
