use crate::{aggregate::InferenceResult, config::HistorySettings, error::HistoryPersistError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPayload {
    pub image_data: String,
    pub result: HistoryResult,
    pub processing_time: f64,
    pub model_info: ModelInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResult {
    pub primary_detection: String,
    pub confidence: f64,
    pub all_probabilities: BTreeMap<String, f32>,
    pub inference_time: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub model_path: String,
    pub image_size: u32,
}

/// What is handed over once a classification is final.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub image_data: Arc<[u8]>,
    pub result: InferenceResult,
    pub classes: Vec<String>,
    pub model_path: String,
    pub image_size: u32,
}

fn encode_data_url(image_data: &[u8]) -> Result<String, HistoryPersistError> {
    let image =
        image::load_from_memory(image_data).map_err(|e| HistoryPersistError::Encode(e.to_string()))?;

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&image.to_rgb8())
        .map_err(|e| HistoryPersistError::Encode(e.to_string()))?;

    Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
}

impl HistoryRecord {
    fn into_payload(self, image_data: String) -> HistoryPayload {
        let all_probabilities = self
            .classes
            .iter()
            .cloned()
            .zip(self.result.probabilities.iter().copied())
            .collect();

        HistoryPayload {
            image_data,
            result: HistoryResult {
                primary_detection: self.result.top_class,
                confidence: self.result.confidence,
                all_probabilities,
                inference_time: self.result.inference_time_ms,
            },
            processing_time: self.result.preprocess_time_ms,
            model_info: ModelInfo {
                model_path: self.model_path,
                image_size: self.image_size,
            },
        }
    }
}

/// Client side of the history persistence API. Every submission runs in its
/// own detached task; nothing it does can fail the classification.
#[derive(Clone)]
pub struct HistorySync {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    timeout: Duration,
}

impl HistorySync {
    pub fn new(settings: &HistorySettings) -> Result<Self, HistoryPersistError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            auth_token: settings.auth_token.clone(),
            timeout: settings.timeout(),
        })
    }

    pub fn submit(&self, record: HistoryRecord) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            match sync.persist(record).await {
                Ok(()) => tracing::debug!("classification history saved"),
                Err(e) => tracing::warn!(error = %e, "failed to save classification history"),
            }
        })
    }

    pub async fn persist(&self, record: HistoryRecord) -> Result<(), HistoryPersistError> {
        let image_data = record.image_data.clone();
        let data_url = tokio::task::spawn_blocking(move || encode_data_url(&image_data))
            .await
            .map_err(|e| HistoryPersistError::Encode(e.to_string()))??;
        let payload = record.into_payload(data_url);

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.auth_token {
            request = request.header(reqwest::header::COOKIE, format!("auth-token={}", token));
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| HistoryPersistError::Timeout(self.timeout))??;

        if !response.status().is_success() {
            return Err(HistoryPersistError::Rejected(response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::ClassScore;
    use axum::{
        extract::State, http::HeaderMap, http::StatusCode, routing::post, Json, Router,
    };
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn png() -> Arc<[u8]> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(6, 4, Rgb([40, 80, 120]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes.into()
    }

    fn record() -> HistoryRecord {
        HistoryRecord {
            image_data: png(),
            result: InferenceResult {
                top_class: "glioma".to_string(),
                confidence: 70.0,
                scores: vec![ClassScore {
                    label: "glioma".to_string(),
                    probability: 0.7,
                    percentage: 70.0,
                    is_top: true,
                }],
                probabilities: vec![0.7, 0.1, 0.1, 0.1],
                inference_time_ms: 12.5,
                preprocess_time_ms: 4.0,
            },
            classes: ["glioma", "meningioma", "notumor", "pituitary"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            model_path: "/onnxmodel.onnx".to_string(),
            image_size: 224,
        }
    }

    type Captured = mpsc::UnboundedSender<(Option<String>, serde_json::Value)>;

    async fn capture(
        State(tx): State<Captured>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let cookie = headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = tx.send((cookie, body));
        StatusCode::OK
    }

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/api/history", addr)
    }

    fn settings(endpoint: String) -> HistorySettings {
        HistorySettings {
            enabled: true,
            endpoint,
            timeout_secs: 2,
            auth_token: Some("token-123".to_string()),
        }
    }

    #[tokio::test]
    async fn test_payload_shape() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let endpoint = serve(Router::new().route("/api/history", post(capture)).with_state(tx)).await;
        let sync = HistorySync::new(&settings(endpoint)).unwrap();

        sync.submit(record()).await.unwrap();

        let (cookie, body) = rx.recv().await.unwrap();
        assert_eq!(cookie.as_deref(), Some("auth-token=token-123"));
        assert!(body["imageData"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        assert_eq!(body["result"]["primaryDetection"], "glioma");
        assert_eq!(body["result"]["confidence"], 70.0);
        assert_eq!(body["result"]["inferenceTime"], 12.5);
        assert!((body["result"]["allProbabilities"]["meningioma"].as_f64().unwrap() - 0.1).abs() < 1e-6);
        assert_eq!(body["processingTime"], 4.0);
        assert_eq!(body["modelInfo"]["modelPath"], "/onnxmodel.onnx");
        assert_eq!(body["modelInfo"]["imageSize"], 224);
    }

    #[tokio::test]
    async fn test_rejection_is_reported_by_persist() {
        let endpoint = serve(Router::new().route(
            "/api/history",
            post(|| async { StatusCode::UNAUTHORIZED }),
        ))
        .await;
        let sync = HistorySync::new(&settings(endpoint)).unwrap();

        assert!(matches!(
            sync.persist(record()).await,
            Err(HistoryPersistError::Rejected(status)) if status == reqwest::StatusCode::UNAUTHORIZED
        ));
        // The detached variant swallows the same failure.
        sync.submit(record()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_swallowed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sync = HistorySync::new(&settings(format!("http://{}/api/history", addr))).unwrap();

        assert!(sync.persist(record()).await.is_err());
        assert!(sync.submit(record()).await.is_ok());
    }

    #[test]
    fn test_undecodable_image_fails_encoding() {
        assert!(matches!(
            encode_data_url(b"not an image"),
            Err(HistoryPersistError::Encode(_))
        ));
    }
}
