use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Film,
    Episode,
}

/// One media row as seen by the pre-transcoding engine. The catalog holds
/// far more; this is the slice the engine reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: Uuid,
    pub kind: MediaKind,
    pub source_path: PathBuf,
    pub is_transcoded: bool,
}

/// Contract with the media metadata catalog. The engine only marks rows as
/// transcoded and looks rows up by source path; everything else about the
/// catalog is out of scope.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn find_film_by_source_path(&self, path: &Path) -> Result<Option<MediaRecord>>;
    async fn find_episode_by_source_path(&self, path: &Path) -> Result<Option<MediaRecord>>;
    async fn set_is_transcoded(&self, id: Uuid, kind: MediaKind, value: bool) -> Result<()>;
    async fn list_unmarked(&self, kind: MediaKind) -> Result<Vec<MediaRecord>>;
}

/// In-memory metadata store. Used by tests and by standalone operation
/// where no catalog service is wired in.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    rows: RwLock<HashMap<Uuid, MediaRecord>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, kind: MediaKind, source_path: PathBuf) -> MediaRecord {
        let record = MediaRecord {
            id: Uuid::new_v4(),
            kind,
            source_path,
            is_transcoded: false,
        };
        self.rows.write().await.insert(record.id, record.clone());
        record
    }

    pub async fn get(&self, id: Uuid) -> Option<MediaRecord> {
        self.rows.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find_film_by_source_path(&self, path: &Path) -> Result<Option<MediaRecord>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|r| r.kind == MediaKind::Film && r.source_path == path)
            .cloned())
    }

    async fn find_episode_by_source_path(&self, path: &Path) -> Result<Option<MediaRecord>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|r| r.kind == MediaKind::Episode && r.source_path == path)
            .cloned())
    }

    async fn set_is_transcoded(&self, id: Uuid, _kind: MediaKind, value: bool) -> Result<()> {
        if let Some(row) = self.rows.write().await.get_mut(&id) {
            row.is_transcoded = value;
        }
        Ok(())
    }

    async fn list_unmarked(&self, kind: MediaKind) -> Result<Vec<MediaRecord>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|r| r.kind == kind && !r.is_transcoded)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryMetadataStore::new();
        let film = store
            .insert(MediaKind::Film, PathBuf::from("/films/a.mkv"))
            .await;
        store
            .insert(MediaKind::Episode, PathBuf::from("/series/b.mkv"))
            .await;

        let found = store
            .find_film_by_source_path(Path::new("/films/a.mkv"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, film.id);

        assert_eq!(store.list_unmarked(MediaKind::Film).await.unwrap().len(), 1);
        store
            .set_is_transcoded(film.id, MediaKind::Film, true)
            .await
            .unwrap();
        assert!(store.list_unmarked(MediaKind::Film).await.unwrap().is_empty());
        assert!(store.get(film.id).await.unwrap().is_transcoded);
    }

    #[tokio::test]
    async fn kind_is_respected_on_lookup() {
        let store = MemoryMetadataStore::new();
        store
            .insert(MediaKind::Episode, PathBuf::from("/series/b.mkv"))
            .await;
        assert!(store
            .find_film_by_source_path(Path::new("/series/b.mkv"))
            .await
            .unwrap()
            .is_none());
    }
}
