use crate::{
    classifier::Classifier, config::Settings, inference_service::InferenceService,
    model_service::ModelService, ort_runtime::OrtRuntime,
};
use std::future::Future;
use tokio::signal;
use tonic::transport::server::Router;
use tonic::transport::Server;
use tumor_proto::tumor_classifier_server::TumorClassifierServer;

/// Room for the protobuf fields around the image bytes.
const ENVELOPE_MARGIN: usize = 64 * 1024;

pub struct GrpcServer {
    router: Router,
    addr: String,
}

impl GrpcServer {
    pub async fn new<M: ModelService>(
        model_service: M,
        addr: &str,
        max_image_bytes: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let inference_service = InferenceService::new(model_service);
        let reflection_service = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(tumor_proto::FILE_DESCRIPTOR_SET)
            .build_v1alpha()?;

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<TumorClassifierServer<InferenceService<M>>>()
            .await;

        let router = Server::builder()
            .add_service(health_service)
            .add_service(
                TumorClassifierServer::new(inference_service)
                    .max_decoding_message_size(max_image_bytes.saturating_add(ENVELOPE_MARGIN)),
            )
            .add_service(reflection_service);

        Ok(Self {
            router,
            addr: addr.to_string(),
        })
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };
        self.run_until(shutdown).await
    }

    pub async fn run_until(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let addr = self.addr.parse()?;

        tracing::info!("Inference service listening on {}", self.addr);

        self.router.serve_with_shutdown(addr, shutdown).await?;
        Ok(())
    }
}

pub async fn start_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = OrtRuntime::new(&settings.model);
    let classifier = Classifier::from_settings(runtime, &settings)?;

    // Warm the model so the first request does not pay for the download.
    let models = classifier.models().clone();
    tokio::spawn(async move {
        if let Err(e) = models.get_session().await {
            tracing::error!("Model warmup failed, requests will retry: {}", e);
        }
    });

    let addr = settings.server.get_address();
    let grpc_server =
        GrpcServer::new(classifier, &addr, settings.limits.max_image_bytes).await?;

    grpc_server.run().await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
