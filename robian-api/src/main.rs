use anyhow::Context;
use robian_api::config::AppConfig;
use robian_api::extraction::ArtifactKind;
use robian_api::jobs::JobEvent;
use robian_api::logging;
use robian_api::services::ServiceContainer;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("loading configuration")?;
    let _log_guard = logging::init_logging(&config.logging)?;

    let container = ServiceContainer::from_config(config).await?;

    // Stand-in for the notification layer.
    let mut events = container.subscribe_job_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Job event stream lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut kind = ArtifactKind::Streaming;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--audio" => kind = ArtifactKind::Audio,
            "--streaming" => kind = ArtifactKind::Streaming,
            resource_id => {
                let coordinator = container.coordinator.clone();
                let resource_id = resource_id.to_string();
                tokio::spawn(async move {
                    match coordinator.resolve(&resource_id, kind).await {
                        Ok(artifact) => {
                            info!(resource_id = %resource_id, location = %artifact.location, "Resolved")
                        }
                        Err(e) => error!(resource_id = %resource_id, error = %e, "Resolve failed"),
                    }
                });
            }
        }
    }

    info!("robian-api running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!(stats = ?container.stats(), "Shutdown requested");
    container.shutdown().await?;
    Ok(())
}

fn log_event(event: &JobEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "robian_api::events", "{json}"),
        Err(e) => warn!(error = %e, "Could not serialize job event"),
    }
}
