use crate::error::{InferenceError, ModelLoadError};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Execution provider a session can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Cuda,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Cuda => "cuda",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something able to turn model bytes into a runnable session.
pub trait ModelRuntime: Send + Sync + 'static {
    type Session: RuntimeSession;

    fn load(&self, model: &[u8], backend: Backend) -> Result<Self::Session, String>;
}

pub trait RuntimeSession: Send + Sync + 'static {
    /// Returns the flattened output tensor.
    fn run(&self, input: &Array4<f32>) -> Result<Vec<f32>, String>;
}

#[derive(Debug, Clone)]
pub struct RawOutput {
    pub values: Vec<f32>,
    pub elapsed: Duration,
}

/// A session bound to the first backend that accepted the model.
pub struct ExecutorSession<S: RuntimeSession> {
    session: S,
    backend: Backend,
}

impl<S: RuntimeSession> ExecutorSession<S> {
    pub fn build<R>(runtime: &R, model: &[u8], backends: &[Backend]) -> Result<Self, ModelLoadError>
    where
        R: ModelRuntime<Session = S>,
    {
        let mut last_error = String::from("no execution backend configured");

        for backend in backends {
            match runtime.load(model, *backend) {
                Ok(session) => {
                    tracing::info!(%backend, "inference session ready");
                    return Ok(Self {
                        session,
                        backend: *backend,
                    });
                }
                Err(e) => {
                    tracing::warn!(%backend, error = %e, "backend failed, trying next");
                    last_error = format!("{} backend: {}", backend, e);
                }
            }
        }

        Err(ModelLoadError::Session(last_error))
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Runs once on the bound backend. Failures leave the session usable.
    pub fn run(&self, input: &Array4<f32>) -> Result<RawOutput, InferenceError> {
        let start = Instant::now();
        let values = self.session.run(input).map_err(InferenceError::Run)?;
        let elapsed = start.elapsed();

        tracing::debug!(
            backend = %self.backend,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "inference finished"
        );

        Ok(RawOutput { values, elapsed })
    }
}
