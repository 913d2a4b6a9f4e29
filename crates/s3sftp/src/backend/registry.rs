use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    BackendConfig, LocalFactory, MemoryFactory, S3Factory, StorageClient, BACKEND_LOCAL,
    BACKEND_MEMORY, BACKEND_S3,
};
use crate::{Error, Result};

/// Builds a storage client for one storage profile
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>>;
}

/// Maps backend-type identifiers to client constructors.
///
/// The registry does not cache the clients it builds. Unknown identifiers
/// are an error; there is no fallback backend.
pub struct BackendRegistry {
    factories: DashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// Registry with the `s3`, `local` and `memory` backends installed
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(BACKEND_S3, S3Factory);
        registry.register(BACKEND_LOCAL, LocalFactory);
        registry.register(BACKEND_MEMORY, MemoryFactory::new());
        registry
    }

    /// Install a constructor, replacing any previous one for `backend_type`.
    pub fn register(
        &self,
        backend_type: impl Into<String>,
        factory: impl BackendFactory + 'static,
    ) {
        let backend_type = backend_type.into();
        let replaced = self
            .factories
            .insert(backend_type.clone(), Arc::new(factory))
            .is_some();
        info!(event = "backend_registered", backend_type, replaced, "Backend factory registered");
    }

    pub fn is_registered(&self, backend_type: &str) -> bool {
        self.factories.contains_key(backend_type)
    }

    pub fn backend_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }

    pub async fn create(
        &self,
        backend_type: &str,
        config: &BackendConfig,
    ) -> Result<Arc<dyn StorageClient>> {
        // Clone the factory out so no map guard is held across the await.
        let factory = self
            .factories
            .get(backend_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownBackendType(backend_type.to_string()))?;

        debug!(event = "backend_create", backend_type, "Constructing storage client");

        factory
            .create(config)
            .await
            .map_err(|source| Error::Construction {
                backend_type: backend_type.to_string(),
                source,
            })
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStorage;

    struct FailingFactory;

    #[async_trait]
    impl BackendFactory for FailingFactory {
        async fn create(&self, _config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
            anyhow::bail!("endpoint unreachable")
        }
    }

    struct FixedFactory(Arc<MemoryStorage>);

    #[async_trait]
    impl BackendFactory for FixedFactory {
        async fn create(&self, _config: &BackendConfig) -> anyhow::Result<Arc<dyn StorageClient>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_unknown_backend_type() {
        let registry = BackendRegistry::with_builtin();
        let err = registry
            .create("ftp", &BackendConfig::new("ftp"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnknownBackendType(ref t) if t == "ftp"));
    }

    #[tokio::test]
    async fn test_construction_error_wraps_cause() {
        let registry = BackendRegistry::new();
        registry.register("broken", FailingFactory);
        let err = registry
            .create("broken", &BackendConfig::new("broken"))
            .await
            .err()
            .unwrap();
        match err {
            Error::Construction { backend_type, source } => {
                assert_eq!(backend_type, "broken");
                assert!(source.to_string().contains("unreachable"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_reregister_replaces() {
        let registry = BackendRegistry::new();
        registry.register("custom", FailingFactory);
        registry.register("custom", FixedFactory(Arc::new(MemoryStorage::new())));

        let client = registry
            .create("custom", &BackendConfig::new("custom"))
            .await
            .unwrap();
        assert_eq!(client.backend_type(), "memory");
        assert_eq!(registry.backend_types(), vec!["custom".to_string()]);
    }

    #[tokio::test]
    async fn test_builtin_memory_is_usable() {
        let registry = BackendRegistry::with_builtin();
        assert!(registry.is_registered("s3"));
        assert!(registry.is_registered("local"));

        let client = registry
            .create("memory", &BackendConfig::memory("bucket"))
            .await
            .unwrap();
        client.put_object("a.txt", bytes::Bytes::from_static(b"hi")).await.unwrap();
        assert!(client.head_object("a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_register_and_create() {
        let registry = Arc::new(BackendRegistry::with_builtin());
        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    registry.register(format!("extra-{i}"), MemoryFactory::new());
                }
                registry
                    .create("memory", &BackendConfig::memory(format!("b{i}")))
                    .await
                    .is_ok()
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
    }
}
