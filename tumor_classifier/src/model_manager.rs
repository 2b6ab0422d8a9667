use crate::{
    cache::CacheStore,
    error::ModelLoadError,
    executor::{Backend, ExecutorSession, ModelRuntime},
    model_source::ModelSource,
};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type SharedSession<R> = Arc<ExecutorSession<<R as ModelRuntime>::Session>>;
type PendingLoad<R> = Shared<BoxFuture<'static, Result<SharedSession<R>, ModelLoadError>>>;

enum LoadState<R: ModelRuntime> {
    Empty,
    Loading { generation: u64, load: PendingLoad<R> },
    Ready(SharedSession<R>),
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub ready: bool,
    pub backend: Option<Backend>,
    pub source: String,
    pub load_count: usize,
}

pub struct ModelCacheManager<R: ModelRuntime> {
    inner: Arc<Inner<R>>,
}

impl<R: ModelRuntime> Clone for ModelCacheManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<R: ModelRuntime> {
    runtime: Arc<R>,
    source: Arc<dyn ModelSource>,
    cache: Arc<dyn CacheStore>,
    cache_key: String,
    cache_ttl: Duration,
    fetch_timeout: Duration,
    backends: Vec<Backend>,
    state: Mutex<LoadState<R>>,
    generation: AtomicU64,
    loads: AtomicUsize,
}

pub struct ModelCacheManagerBuilder<R: ModelRuntime> {
    runtime: R,
    source: Arc<dyn ModelSource>,
    cache: Arc<dyn CacheStore>,
    cache_key: Option<String>,
    cache_ttl: Duration,
    fetch_timeout: Duration,
    backends: Vec<Backend>,
}

impl<R: ModelRuntime> ModelCacheManagerBuilder<R> {
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn backends(mut self, backends: Vec<Backend>) -> Self {
        self.backends = backends;
        self
    }

    pub fn build(self) -> ModelCacheManager<R> {
        let cache_key = self
            .cache_key
            .unwrap_or_else(|| format!("model:{}", self.source.locator()));

        ModelCacheManager {
            inner: Arc::new(Inner {
                runtime: Arc::new(self.runtime),
                source: self.source,
                cache: self.cache,
                cache_key,
                cache_ttl: self.cache_ttl,
                fetch_timeout: self.fetch_timeout,
                backends: self.backends,
                state: Mutex::new(LoadState::Empty),
                generation: AtomicU64::new(0),
                loads: AtomicUsize::new(0),
            }),
        }
    }
}

impl<R: ModelRuntime> ModelCacheManager<R> {
    pub fn builder(
        runtime: R,
        source: Arc<dyn ModelSource>,
        cache: Arc<dyn CacheStore>,
    ) -> ModelCacheManagerBuilder<R> {
        ModelCacheManagerBuilder {
            runtime,
            source,
            cache,
            cache_key: None,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            fetch_timeout: Duration::from_secs(30),
            backends: vec![Backend::Cpu],
        }
    }

    pub async fn get_session(&self) -> Result<SharedSession<R>, ModelLoadError> {
        let load = {
            let mut state = self.inner.state.lock();
            match &*state {
                LoadState::Ready(session) => return Ok(session.clone()),
                LoadState::Loading { load, .. } => load.clone(),
                LoadState::Empty => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
                    // Spawned so a cancelled caller cannot stall the load.
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move {
                        let result = inner.load().await;
                        inner.finish(generation, &result);
                        result
                    });
                    let inner = self.inner.clone();
                    let load = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => {
                                let result = Err(ModelLoadError::Worker(e.to_string()));
                                inner.finish(generation, &result);
                                result
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    *state = LoadState::Loading {
                        generation,
                        load: load.clone(),
                    };
                    load
                }
            }
        };

        load.await
    }

    /// Drops the current session (if any) and loads a fresh one.
    pub async fn reload(&self) -> Result<SharedSession<R>, ModelLoadError> {
        {
            let mut state = self.inner.state.lock();
            if let LoadState::Ready(_) = &*state {
                tracing::info!("dropping current inference session for reload");
                *state = LoadState::Empty;
            }
        }
        self.get_session().await
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.inner.state.lock(), LoadState::Ready(_))
    }

    /// Number of loads (cache check plus fetch-or-hit) started so far.
    pub fn load_count(&self) -> usize {
        self.inner.loads.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ModelStats {
        let backend = match &*self.inner.state.lock() {
            LoadState::Ready(session) => Some(session.backend()),
            _ => None,
        };
        ModelStats {
            ready: backend.is_some(),
            backend,
            source: self.inner.source.locator().to_string(),
            load_count: self.load_count(),
        }
    }
}

impl<R: ModelRuntime> Inner<R> {
    fn finish(&self, generation: u64, result: &Result<SharedSession<R>, ModelLoadError>) {
        let mut state = self.state.lock();
        let current = matches!(
            &*state,
            LoadState::Loading { generation: g, .. } if *g == generation
        );
        if !current {
            return;
        }
        *state = match result {
            Ok(session) => LoadState::Ready(session.clone()),
            Err(_) => LoadState::Empty,
        };
    }

    async fn load(self: &Arc<Self>) -> Result<SharedSession<R>, ModelLoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tracing::info!(source = %self.source.locator(), "loading model");

        match self.cache.get(&self.cache_key).await {
            Ok(Some(cached)) => match self.build_session(cached).await {
                Ok(session) => {
                    tracing::info!("model loaded from cache");
                    return Ok(session);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cached model unusable, loading from source");
                    if let Err(e) = self.cache.remove(&self.cache_key).await {
                        tracing::warn!(error = %e, "failed to evict cached model");
                    }
                }
            },
            Ok(None) => tracing::debug!("model cache miss"),
            Err(e) => tracing::warn!(error = %e, "model cache read failed, loading from source"),
        }

        let bytes: Arc<[u8]> = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .map_err(|_| ModelLoadError::Timeout {
                source_locator: self.source.locator().to_string(),
                after: self.fetch_timeout,
            })
            .and_then(|fetched| fetched)
            .inspect_err(|e| tracing::error!(error = %e, "model fetch failed"))?
            .into();

        let session = self
            .build_session(bytes.clone())
            .await
            .inspect_err(|e| tracing::error!(error = %e, "model session construction failed"))?;

        if let Err(e) = self.cache.put(&self.cache_key, bytes, self.cache_ttl).await {
            tracing::warn!(error = %e, "failed to cache model");
        }

        Ok(session)
    }

    async fn build_session(&self, model: Arc<[u8]>) -> Result<SharedSession<R>, ModelLoadError> {
        let runtime = self.runtime.clone();
        let backends = self.backends.clone();

        tokio::task::spawn_blocking(move || ExecutorSession::build(&*runtime, &model, &backends))
            .await
            .map_err(|e| ModelLoadError::Worker(e.to_string()))?
            .map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::executor::mock::MockRuntime;
    use tonic::async_trait;

    /// Source whose responses are scripted per call.
    #[derive(Default)]
    struct ScriptedSource {
        fetches: AtomicUsize,
        failures_left: AtomicUsize,
        delay: Duration,
        payload: Vec<u8>,
    }

    impl ScriptedSource {
        fn new(payload: &[u8]) -> Self {
            Self {
                payload: payload.to_vec(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ModelSource for ScriptedSource {
        async fn fetch(&self) -> Result<Vec<u8>, ModelLoadError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ModelLoadError::Fetch {
                    source_locator: "scripted".to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(self.payload.clone())
        }

        fn locator(&self) -> &str {
            "scripted"
        }
    }

    fn manager(
        runtime: MockRuntime,
        source: Arc<ScriptedSource>,
        cache: Arc<MemoryCacheStore>,
    ) -> ModelCacheManager<MockRuntime> {
        ModelCacheManager::builder(runtime, source, cache)
            .backends(vec![Backend::Cpu, Backend::Cuda])
            .fetch_timeout(Duration::from_secs(5))
            .build()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_load() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(100),
            ..ScriptedSource::new(b"model-v1")
        });
        let cache = Arc::new(MemoryCacheStore::new());
        let manager = manager(MockRuntime::default(), source.clone(), cache);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_session().await })
            })
            .collect();

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(manager.load_count(), 1);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert!(manager.is_ready());
    }

    #[tokio::test]
    async fn test_load_survives_cancelled_caller() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(300),
            ..ScriptedSource::new(b"model-v1")
        });
        let manager = manager(
            MockRuntime::default(),
            source.clone(),
            Arc::new(MemoryCacheStore::new()),
        );

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), manager.get_session()).await;
        assert!(cancelled.is_err());
        assert!(!manager.is_ready());

        tokio::time::sleep(Duration::from_millis(700)).await;

        assert!(manager.is_ready());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(manager.get_session().await.is_ok());
        assert_eq!(manager.load_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_session_is_reused() {
        let source = Arc::new(ScriptedSource::new(b"model-v1"));
        let manager = manager(
            MockRuntime::default(),
            source.clone(),
            Arc::new(MemoryCacheStore::new()),
        );

        let first = manager.get_session().await.unwrap();
        let second = manager.get_session().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetched_model_is_cached_with_ttl() {
        let source = Arc::new(ScriptedSource::new(b"model-v1"));
        let cache = Arc::new(MemoryCacheStore::new());
        let manager = ModelCacheManager::builder(MockRuntime::default(), source.clone(), cache.clone())
            .cache_key("tumor-model")
            .cache_ttl(Duration::from_secs(60))
            .build();

        manager.get_session().await.unwrap();

        assert_eq!(
            cache.get("tumor-model").await.unwrap().as_deref(),
            Some(&b"model-v1"[..])
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let source = Arc::new(ScriptedSource::new(b"network"));
        let cache = Arc::new(MemoryCacheStore::new());
        cache
            .put("model:scripted", Arc::from(&b"cached"[..]), Duration::from_secs(60))
            .await
            .unwrap();
        let runtime = MockRuntime::default();
        let manager = manager(runtime.clone(), source.clone(), cache);

        manager.get_session().await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(runtime.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupt_cache_falls_back_to_network() {
        let source = Arc::new(ScriptedSource::new(b"network"));
        let cache = Arc::new(MemoryCacheStore::new());
        cache
            .put("model:scripted", Arc::from(&b"garbage"[..]), Duration::from_secs(60))
            .await
            .unwrap();
        let runtime = MockRuntime::default();
        runtime.corrupt_models.lock().push(b"garbage".to_vec());
        let manager = manager(runtime, source.clone(), cache.clone());

        manager.get_session().await.unwrap();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.get("model:scripted").await.unwrap().as_deref(),
            Some(&b"network"[..])
        );
    }

    #[tokio::test]
    async fn test_failed_load_is_reported_then_retried_by_next_call() {
        let source = Arc::new(ScriptedSource::new(b"model-v1"));
        source.failures_left.store(2, Ordering::SeqCst);
        let manager = manager(
            MockRuntime::default(),
            source.clone(),
            Arc::new(MemoryCacheStore::new()),
        );

        assert!(matches!(
            manager.get_session().await,
            Err(ModelLoadError::Fetch { .. })
        ));
        assert!(!manager.is_ready());
        assert!(manager.get_session().await.is_err());

        assert!(manager.get_session().await.is_ok());
        assert_eq!(manager.load_count(), 3);
        assert!(manager.is_ready());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_failure() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_millis(50),
            ..ScriptedSource::new(b"model-v1")
        });
        source.failures_left.store(1, Ordering::SeqCst);
        let manager = manager(
            MockRuntime::default(),
            source.clone(),
            Arc::new(MemoryCacheStore::new()),
        );

        let (a, b, c) = tokio::join!(
            manager.get_session(),
            manager.get_session(),
            manager.get_session()
        );

        assert!(a.is_err() && b.is_err() && c.is_err());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(manager.get_session().await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let source = Arc::new(ScriptedSource {
            delay: Duration::from_secs(10),
            ..ScriptedSource::new(b"model-v1")
        });
        let manager = ModelCacheManager::builder(
            MockRuntime::default(),
            source,
            Arc::new(MemoryCacheStore::new()),
        )
        .fetch_timeout(Duration::from_millis(50))
        .build();

        assert!(matches!(
            manager.get_session().await,
            Err(ModelLoadError::Timeout { .. })
        ));
        assert!(!manager.is_ready());
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_a_load_error() {
        let runtime = MockRuntime::default();
        runtime.failing_backends.lock().insert(Backend::Cpu);
        runtime.failing_backends.lock().insert(Backend::Cuda);
        let cache = Arc::new(MemoryCacheStore::new());
        let manager = manager(runtime, Arc::new(ScriptedSource::new(b"m")), cache.clone());

        assert!(matches!(
            manager.get_session().await,
            Err(ModelLoadError::Session(_))
        ));
        assert!(cache.get("model:scripted").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reload_replaces_session() {
        let source = Arc::new(ScriptedSource::new(b"model-v1"));
        let manager = manager(
            MockRuntime::default(),
            source,
            Arc::new(MemoryCacheStore::new()),
        );

        let first = manager.get_session().await.unwrap();
        let reloaded = manager.reload().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert!(Arc::ptr_eq(&reloaded, &manager.get_session().await.unwrap()));

        let stats = manager.stats();
        assert!(stats.ready);
        assert_eq!(stats.backend, Some(Backend::Cpu));
        assert_eq!(stats.source, "scripted");
        assert_eq!(stats.load_count, 2);
    }
}
