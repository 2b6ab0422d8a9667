use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tumor_classifier::{config, start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = config::get_configuration()?;
    let log_level = &format!("{},ort=info", settings.log_level.as_str());

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_level(true))
        .init();

    tracing::info!(
        source = %settings.model.source,
        backends = ?settings.model.backends,
        "starting tumor classifier"
    );

    start_server(settings).await
}
