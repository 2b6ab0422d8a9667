use crate::{aggregate::InferenceResult, classifier::Classifier, executor::ModelRuntime};
use tonic::{async_trait, Status};
use tumor_proto::{ClassScore, Classification, ModelStatus, ScanImage};

#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn classify(&self, scan: ScanImage) -> Result<Classification, Status>;
    fn class_labels(&self) -> Vec<String>;
    fn status(&self) -> ModelStatus;
    async fn reload(&self) -> Result<ModelStatus, Status>;
}

fn to_classification(result: InferenceResult, timestamp: i64) -> Classification {
    Classification {
        top_class: result.top_class,
        confidence: result.confidence,
        scores: result
            .scores
            .into_iter()
            .map(|score| ClassScore {
                label: score.label,
                probability: score.probability,
                percentage: score.percentage,
                is_top: score.is_top,
            })
            .collect(),
        inference_time_ms: result.inference_time_ms,
        preprocess_time_ms: result.preprocess_time_ms,
        timestamp,
    }
}

#[async_trait]
impl<R: ModelRuntime> ModelService for Classifier<R> {
    async fn classify(&self, scan: ScanImage) -> Result<Classification, Status> {
        let result = Classifier::classify(self, scan.image_data, scan.save_history).await?;
        Ok(to_classification(result, scan.timestamp))
    }

    fn class_labels(&self) -> Vec<String> {
        Classifier::class_labels(self).to_vec()
    }

    fn status(&self) -> ModelStatus {
        let stats = self.model_stats();
        ModelStatus {
            ready: stats.ready,
            backend: stats.backend.map(|b| b.to_string()).unwrap_or_default(),
            source: stats.source,
            load_count: stats.load_count as u64,
        }
    }

    async fn reload(&self) -> Result<ModelStatus, Status> {
        self.models().reload().await?;
        Ok(ModelService::status(self))
    }
}
