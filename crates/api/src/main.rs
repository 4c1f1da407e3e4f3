use std::sync::Arc;

use anyhow::Context;

use hybridcap_infra::{Orchestrator, OrchestratorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hybridcap_observability::init();

    let config = OrchestratorConfig::from_env().context("invalid configuration")?;
    let orchestrator = Arc::new(
        Orchestrator::from_config(&config)
            .await
            .context("failed to wire orchestrator")?,
    );

    let ticker = config
        .tick_interval
        .map(|every| orchestrator.clone().spawn_ticker(every));
    if ticker.is_none() {
        tracing::info!("no CAPTURE_TICK_INTERVAL_SECS; batch work advances on POST /v1/batch/tick");
    }

    let app = hybridcap_api::app::build_app(orchestrator);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
