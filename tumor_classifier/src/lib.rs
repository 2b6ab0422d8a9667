mod inference_service;
mod server;

pub mod aggregate;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod model_manager;
pub mod model_service;
pub mod model_source;
pub mod ort_runtime;
pub mod preprocess;

pub use classifier::Classifier;
pub use server::{start_server, GrpcServer};
