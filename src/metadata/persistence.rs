use std::sync::Arc;

use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{InMemoryMetadataStore, MetadataSnapshot};
use crate::error::{Error, Result};
use crate::store::{get_optional, put_atomic};

/// Periodic snapshots of the primary's metadata store.
///
/// A single `current.snapshot` object is replaced atomically on every save.
/// Startup restores it when present; a missing object is a clean start, an
/// unreadable one fails startup.
pub struct MetadataPersistence {
    object_store: Arc<dyn ObjectStore>,
    path: ObjectPath,
}

impl MetadataPersistence {
    pub fn new(object_store: Arc<dyn ObjectStore>) -> Self {
        Self::with_prefix(object_store, "metadata")
    }

    pub fn with_prefix(object_store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            object_store,
            path: ObjectPath::from(format!("{}/current.snapshot", prefix)),
        }
    }

    pub async fn save(&self, store: &InMemoryMetadataStore) -> Result<()> {
        let snapshot = store.snapshot();
        let bytes = bincode::serialize(&snapshot)?;
        let size = bytes.len();
        put_atomic(self.object_store.as_ref(), &self.path, bytes).await?;
        info!(
            topics = snapshot.topics.len(),
            brokers = snapshot.brokers.len(),
            size_bytes = size,
            "Persisted metadata snapshot"
        );
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<MetadataSnapshot>> {
        let Some(bytes) = get_optional(self.object_store.as_ref(), &self.path).await? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes).map(Some).map_err(|e| {
            error!(error = %e, path = %self.path, "CORRUPTION: metadata snapshot failed to decode");
            Error::Storage(format!("metadata snapshot is corrupted: {}", e))
        })
    }

    /// Restore `store` from the latest snapshot; returns whether one existed.
    pub async fn restore_into(&self, store: &InMemoryMetadataStore) -> Result<bool> {
        match self.load().await? {
            Some(snapshot) => {
                store.restore(snapshot);
                Ok(true)
            }
            None => {
                info!("No metadata snapshot found (clean start)");
                Ok(false)
            }
        }
    }
}

/// Serialized saves of one live store.
///
/// The primary saves through this after every placement and registry change,
/// as well as on its periodic timer, so a restart never reissues a control
/// port or forgets a topic that brokers already host. Saves never overlap, so
/// an older image cannot replace a newer one.
pub struct MetadataCheckpoint {
    store: Arc<InMemoryMetadataStore>,
    persistence: MetadataPersistence,
    saving: Mutex<()>,
}

impl MetadataCheckpoint {
    pub fn new(store: Arc<InMemoryMetadataStore>, persistence: MetadataPersistence) -> Self {
        Self {
            store,
            persistence,
            saving: Mutex::new(()),
        }
    }

    pub async fn save(&self) -> Result<()> {
        let _saving = self.saving.lock().await;
        self.persistence.save(&self.store).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataStore;
    use bytes::Bytes;
    use object_store::memory::InMemory;

    #[tokio::test]
    async fn test_save_and_restore() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let persistence = MetadataPersistence::new(object_store.clone());

        let store = InMemoryMetadataStore::new();
        store.register_broker("b1").await.unwrap();
        store.create_topic("orders", 2).await.unwrap();
        persistence.save(&store).await.unwrap();

        let fresh = InMemoryMetadataStore::new();
        assert!(persistence.restore_into(&fresh).await.unwrap());
        assert_eq!(fresh.list_topics().await.unwrap(), vec!["orders"]);
        assert_eq!(fresh.partition_count("orders").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_saves_latest_state() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = Arc::new(InMemoryMetadataStore::new());
        let checkpoint = Arc::new(MetadataCheckpoint::new(
            store.clone(),
            MetadataPersistence::new(object_store.clone()),
        ));

        store.register_broker("b1").await.unwrap();
        let port = store.next_replica_port().await.unwrap();
        let saves = (0..4).map(|_| {
            let checkpoint = checkpoint.clone();
            tokio::spawn(async move { checkpoint.save().await })
        });
        for save in futures::future::join_all(saves).await {
            save.unwrap().unwrap();
        }

        let fresh = InMemoryMetadataStore::new();
        MetadataPersistence::new(object_store)
            .restore_into(&fresh)
            .await
            .unwrap();
        assert_eq!(fresh.next_replica_port().await.unwrap(), port + 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_clean_start() {
        let persistence = MetadataPersistence::new(Arc::new(InMemory::new()));
        let store = InMemoryMetadataStore::new();
        assert!(!persistence.restore_into(&store).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_fails() {
        let object_store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        object_store
            .put(
                &ObjectPath::from("metadata/current.snapshot"),
                Bytes::from_static(b"\xff\xff\xff").into(),
            )
            .await
            .unwrap();
        let persistence = MetadataPersistence::new(object_store);
        assert!(matches!(persistence.load().await, Err(Error::Storage(_))));
    }
}
