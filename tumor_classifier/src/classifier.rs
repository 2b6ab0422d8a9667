use crate::{
    aggregate::{InferenceResult, ResultAggregator},
    cache::{CacheStore, DiskCacheStore, MemoryCacheStore},
    config::{CacheKind, Settings},
    error::{ClassifyError, InferenceError},
    executor::ModelRuntime,
    history::{HistoryRecord, HistorySync},
    model_manager::{ModelCacheManager, ModelStats},
    model_source::source_for,
    preprocess::ImagePreprocessor,
};
use std::sync::Arc;
use tracing::instrument;

/// `classify(imageBytes)`: validate, preprocess, run, aggregate, and
/// optionally hand the result to history.
pub struct Classifier<R: ModelRuntime> {
    models: ModelCacheManager<R>,
    preprocessor: ImagePreprocessor,
    aggregator: ResultAggregator,
    history: Option<HistorySync>,
    model_path: String,
}

impl<R: ModelRuntime> Clone for Classifier<R> {
    fn clone(&self) -> Self {
        Self {
            models: self.models.clone(),
            preprocessor: self.preprocessor.clone(),
            aggregator: self.aggregator.clone(),
            history: self.history.clone(),
            model_path: self.model_path.clone(),
        }
    }
}

impl<R: ModelRuntime> Classifier<R> {
    pub fn from_settings(runtime: R, settings: &Settings) -> Result<Self, String> {
        let model = &settings.model;
        let source = source_for(&model.source, model.fetch_timeout()).map_err(|e| e.to_string())?;
        let cache: Arc<dyn CacheStore> = match settings.cache.kind {
            CacheKind::Memory => Arc::new(MemoryCacheStore::new()),
            CacheKind::Disk => Arc::new(DiskCacheStore::new(&settings.cache.dir)),
        };

        let models = ModelCacheManager::builder(runtime, source, cache)
            .cache_key(model.cache_key())
            .cache_ttl(settings.cache.ttl())
            .fetch_timeout(model.fetch_timeout())
            .backends(model.backends.clone())
            .build();

        let history = if settings.history.enabled {
            Some(HistorySync::new(&settings.history).map_err(|e| e.to_string())?)
        } else {
            None
        };

        let preprocessor = ImagePreprocessor::new(
            model,
            settings.limits.max_image_bytes,
            settings.limits.image_formats()?,
        );
        let aggregator = ResultAggregator::new(model.classes.clone(), model.output_activation);

        Ok(Self::new(models, preprocessor, aggregator, history, &model.source))
    }

    pub fn new(
        models: ModelCacheManager<R>,
        preprocessor: ImagePreprocessor,
        aggregator: ResultAggregator,
        history: Option<HistorySync>,
        model_path: &str,
    ) -> Self {
        Self {
            models,
            preprocessor,
            aggregator,
            history,
            model_path: model_path.to_string(),
        }
    }

    pub fn models(&self) -> &ModelCacheManager<R> {
        &self.models
    }

    pub fn class_labels(&self) -> &[String] {
        self.aggregator.classes()
    }

    pub fn model_stats(&self) -> ModelStats {
        self.models.stats()
    }

    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub async fn classify(
        &self,
        image_data: Vec<u8>,
        save_history: bool,
    ) -> Result<InferenceResult, ClassifyError> {
        let format = self.preprocessor.validate(&image_data)?;
        let image_data: Arc<[u8]> = image_data.into();

        let preprocessed = self
            .preprocessor
            .preprocess_async(image_data.clone(), format)
            .await?;
        let session = self.models.get_session().await?;

        let tensor = preprocessed.tensor;
        let output = tokio::task::spawn_blocking(move || session.run(&tensor))
            .await
            .map_err(|e| InferenceError::Worker(e.to_string()))??;

        let result = self
            .aggregator
            .aggregate(&output.values, output.elapsed, preprocessed.elapsed)?;

        tracing::info!(
            top_class = %result.top_class,
            confidence = result.confidence,
            inference_ms = result.inference_time_ms,
            "scan classified"
        );

        if save_history {
            match &self.history {
                Some(history) => {
                    history.submit(HistoryRecord {
                        image_data,
                        result: result.clone(),
                        classes: self.aggregator.classes().to_vec(),
                        model_path: self.model_path.clone(),
                        image_size: self.preprocessor.image_size(),
                    });
                }
                None => tracing::debug!("history requested but not enabled"),
            }
        }

        Ok(result)
    }
}
