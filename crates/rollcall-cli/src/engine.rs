use crate::config::Config;
use anyhow::{bail, Context, Result};
use rollcall_core::recognizer::ARCFACE_EMBEDDING_DIM;
use rollcall_core::runtime::ModelInfo;
use rollcall_core::store::load_gallery;
use rollcall_core::{
    AttendanceMatchPipeline, EmbeddingId, EmbeddingStore, EnrollmentPipeline, FaceExtractor, GalleryIndex,
    MatchResolver, ModelRuntime, OwnerId,
};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;

/// Everything one CLI invocation needs, wired together.
pub struct Engine {
    runtime: Arc<ModelRuntime>,
    pub gallery: Arc<GalleryIndex>,
    pub enrollment: EnrollmentPipeline,
    pub attendance: AttendanceMatchPipeline,
}

impl Engine {
    /// Load both models and fill the gallery from the database.
    ///
    /// Fails fast if a model file is missing or unusable.
    pub fn start(config: &Config) -> Result<Self> {
        let runtime = Arc::new(ModelRuntime::new(config.runtime_config()));
        runtime.load().context("loading face models")?;

        let store = Arc::new(open_store(config)?);
        let gallery = Arc::new(GalleryIndex::new(runtime.config().embedding_dim));
        let loaded = load_gallery(store.as_ref(), &gallery).context("loading enrolled embeddings")?;
        tracing::info!(embeddings = loaded, owners = gallery.all().owner_count(), "gallery ready");

        let extractor = FaceExtractor::new(runtime.clone(), config.extractor_config());
        let enrollment = EnrollmentPipeline::new(extractor.clone(), gallery.clone())
            .with_store(store as Arc<dyn EmbeddingStore>);
        let resolver = MatchResolver::new(config.resolver_config()).context("invalid match thresholds")?;
        let attendance = AttendanceMatchPipeline::new(extractor, gallery.clone(), resolver);

        Ok(Self {
            runtime,
            gallery,
            enrollment,
            attendance,
        })
    }

    pub fn model_info(&self) -> ModelInfo {
        self.runtime.info()
    }
}

/// Open the database without loading models.
pub fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open(&config.db_path, ARCFACE_EMBEDDING_DIM)
        .with_context(|| format!("opening database {}", config.db_path.display()))
}

/// What `rollcall remove` deletes.
#[derive(Debug, Clone)]
pub enum RemoveTarget {
    Embedding(EmbeddingId),
    Owner(OwnerId),
}

/// Delete rows from the database, returning how many went.
///
/// Only the database changes. Each process builds its gallery from the
/// database at start, so the next run no longer sees the removed rows.
pub fn remove_from_store(store: &SqliteStore, target: &RemoveTarget) -> Result<usize> {
    match target {
        RemoveTarget::Embedding(id) => {
            if !store.remove(id)? {
                bail!("no embedding with id {id}");
            }
            Ok(1)
        }
        RemoveTarget::Owner(owner) => {
            let n = store.remove_owner(owner)?;
            if n == 0 {
                bail!("no embeddings enrolled for {owner}");
            }
            Ok(n)
        }
    }
}

/// Run blocking pipeline work off the async runtime, bounded by `timeout`.
///
/// The worker is not cancelled on timeout; its result is discarded.
pub async fn run_blocking<T, F>(timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, task).await {
        Ok(joined) => joined.context("pipeline worker panicked"),
        Err(_) => bail!("operation timed out after {}s", timeout.as_secs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Embedding, EnrolledEmbedding};

    fn seeded_store() -> (SqliteStore, EnrolledEmbedding) {
        let store = SqliteStore::open_in_memory(3).unwrap();
        let first = EnrolledEmbedding::new(OwnerId::new("alice"), Embedding::from_raw(vec![1.0, 0.0, 0.0]), "a1.jpg");
        store.insert(&first).unwrap();
        for (owner, v) in [("alice", [0.9, 0.1, 0.0]), ("bob", [0.0, 1.0, 0.0])] {
            let r = EnrolledEmbedding::new(OwnerId::new(owner), Embedding::from_raw(v.to_vec()), "x.jpg");
            store.insert(&r).unwrap();
        }
        (store, first)
    }

    #[test]
    fn test_remove_single_embedding() {
        let (store, first) = seeded_store();
        let target = RemoveTarget::Embedding(first.embedding_id.clone());
        assert_eq!(remove_from_store(&store, &target).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 2);

        let err = remove_from_store(&store, &target).unwrap_err();
        assert!(err.to_string().contains("no embedding with id"));
    }

    #[test]
    fn test_remove_owner_deletes_all_their_rows() {
        let (store, _) = seeded_store();
        let target = RemoveTarget::Owner(OwnerId::new("alice"));
        assert_eq!(remove_from_store(&store, &target).unwrap(), 2);
        assert!(store.for_owner(&OwnerId::new("alice")).unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 1);
        assert!(remove_from_store(&store, &target).is_err());
    }

    #[tokio::test]
    async fn test_run_blocking_returns_value() {
        let v = run_blocking(Duration::from_secs(5), || 21 * 2).await.unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_run_blocking_times_out() {
        let err = run_blocking(Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(500));
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
