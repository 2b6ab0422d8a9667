use crate::error::ModelLoadError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::async_trait;

/// Where the model bytes come from when the cache has nothing usable.
#[async_trait]
pub trait ModelSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Vec<u8>, ModelLoadError>;
    fn locator(&self) -> &str;
}

pub struct HttpModelSource {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpModelSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ModelLoadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelLoadError::Fetch {
                source_locator: url.to_string(),
                reason: format!("failed to build http client: {}", e),
            })?;

        Ok(Self {
            url: url.to_string(),
            client,
            timeout,
        })
    }

    fn fetch_error(&self, err: reqwest::Error) -> ModelLoadError {
        if err.is_timeout() {
            ModelLoadError::Timeout {
                source_locator: self.url.clone(),
                after: self.timeout,
            }
        } else {
            ModelLoadError::Fetch {
                source_locator: self.url.clone(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl ModelSource for HttpModelSource {
    async fn fetch(&self) -> Result<Vec<u8>, ModelLoadError> {
        tracing::info!(url = %self.url, "downloading model");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| self.fetch_error(e))?;

        if !response.status().is_success() {
            return Err(ModelLoadError::Fetch {
                source_locator: self.url.clone(),
                reason: format!("HTTP error: {}", response.status()),
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.fetch_error(e))?;
        tracing::info!(bytes = bytes.len(), "model downloaded");
        Ok(bytes.to_vec())
    }

    fn locator(&self) -> &str {
        &self.url
    }
}

pub struct FileModelSource {
    path: PathBuf,
    locator: String,
}

impl FileModelSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let locator = path.display().to_string();
        Self { path, locator }
    }
}

#[async_trait]
impl ModelSource for FileModelSource {
    async fn fetch(&self) -> Result<Vec<u8>, ModelLoadError> {
        tracing::info!(path = %self.locator, "reading model file");
        tokio::fs::read(&self.path)
            .await
            .map_err(|e| ModelLoadError::Fetch {
                source_locator: self.locator.clone(),
                reason: e.to_string(),
            })
    }

    fn locator(&self) -> &str {
        &self.locator
    }
}

/// Picks the HTTP source for `http(s)://` locators and the file source
/// otherwise.
pub fn source_for(locator: &str, timeout: Duration) -> Result<Arc<dyn ModelSource>, ModelLoadError> {
    if locator.starts_with("http://") || locator.starts_with("https://") {
        Ok(Arc::new(HttpModelSource::new(locator, timeout)?))
    } else {
        Ok(Arc::new(FileModelSource::new(locator)))
    }
}
