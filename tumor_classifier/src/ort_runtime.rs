use crate::{
    config::ModelConfig,
    executor::{Backend, ModelRuntime, RuntimeSession},
};
use ndarray::Array4;
use ort::{
    execution_providers::{
        CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

fn execution_provider(backend: Backend) -> ExecutionProviderDispatch {
    // A provider that cannot register must fail the build so the next backend is tried.
    match backend {
        Backend::Cpu => CPUExecutionProvider::default().build().error_on_failure(),
        Backend::Cuda => CUDAExecutionProvider::default().build().error_on_failure(),
    }
}

/// ONNX Runtime sessions built from in-memory model bytes.
#[derive(Debug, Clone)]
pub struct OrtRuntime {
    input_name: String,
    output_name: String,
    num_instances: usize,
}

impl OrtRuntime {
    pub fn new(model_config: &ModelConfig) -> Self {
        Self {
            input_name: model_config.input_name.clone(),
            output_name: model_config.output_name.clone(),
            num_instances: model_config.num_instances.max(1),
        }
    }

    fn build_session(&self, model: &[u8], backend: Backend) -> ort::Result<Session> {
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers([execution_provider(backend)])?
            .commit_from_memory(model)
    }
}

impl ModelRuntime for OrtRuntime {
    type Session = OrtSessionPool;

    fn load(&self, model: &[u8], backend: Backend) -> Result<OrtSessionPool, String> {
        let sessions = (0..self.num_instances)
            .map(|_| Ok(Arc::new(Mutex::new(self.build_session(model, backend)?))))
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| e.to_string())?;

        tracing::info!("Created {} ONNX sessions on {}", self.num_instances, backend);

        Ok(OrtSessionPool {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
        })
    }
}

/// Sessions served round-robin; each one is locked for the duration of a run.
#[derive(Clone)]
pub struct OrtSessionPool {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_name: String,
    output_name: String,
}

impl RuntimeSession for OrtSessionPool {
    fn run(&self, input: &Array4<f32>) -> Result<Vec<f32>, String> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| format!("session mutex poisoned: {}", e))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().to_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| format!("failed to build tensor: {}", e))?;

        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor_ref])
            .map_err(|e| format!("inference failed: {}", e))?;

        let output = outputs
            .get(self.output_name.as_str())
            .ok_or_else(|| format!("model has no output named {}", self.output_name))?;

        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| format!("failed to extract tensor: {}", e))?;

        Ok(data.to_vec())
    }
}
