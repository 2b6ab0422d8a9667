use crate::model_service::ModelService;
use async_stream::stream;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tonic::{async_trait, Request, Response, Status};
use tumor_proto::{
    tumor_classifier_server::TumorClassifier, ClassLabels, Classification, Empty, ModelStatus,
    ScanImage,
};

#[derive(Debug, Clone)]
pub struct InferenceService<M: ModelService> {
    model_service: Arc<M>,
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(model_service: M) -> Self {
        Self {
            model_service: Arc::new(model_service),
        }
    }
}

#[async_trait]
impl<M: ModelService> TumorClassifier for InferenceService<M> {
    type ClassifyStreamStream = Pin<Box<dyn Stream<Item = Result<Classification, Status>> + Send>>;

    async fn classify(
        &self,
        request: Request<ScanImage>,
    ) -> Result<Response<Classification>, Status> {
        let scan = request.into_inner();
        let model_service = self.model_service.clone();
        let classification = model_service.classify(scan).await?;

        tracing::debug!(
            "Returning {} with confidence {:.2}",
            classification.top_class,
            classification.confidence
        );
        for score in &classification.scores {
            tracing::debug!(
                "Class {}: {:.2}%{}",
                score.label,
                score.percentage,
                if score.is_top { " (top)" } else { "" }
            );
        }

        Ok(Response::new(classification))
    }

    async fn classify_stream(
        &self,
        request: Request<tonic::Streaming<ScanImage>>,
    ) -> Result<Response<Self::ClassifyStreamStream>, Status> {
        let mut stream = request.into_inner();
        let model_service = self.model_service.clone();

        let output_stream = stream! {
            while let Some(scan) = stream.message().await.transpose() {
                match scan {
                    Ok(scan) => yield model_service.classify(scan).await,
                    Err(status) => {
                        yield Err(status);
                        break
                    }
                }
            }
        };

        Ok(Response::new(Box::pin(output_stream)))
    }

    async fn get_class_labels(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ClassLabels>, Status> {
        let response = ClassLabels {
            class_labels: self.model_service.class_labels(),
        };

        Ok(Response::new(response))
    }

    async fn get_model_status(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ModelStatus>, Status> {
        Ok(Response::new(self.model_service.status()))
    }

    async fn reload_model(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<ModelStatus>, Status> {
        tracing::info!("Model reload requested");
        let status = self.model_service.reload().await?;
        Ok(Response::new(status))
    }
}
