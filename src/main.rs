use duke_energy_gateway::config::GatewayConfig;
use duke_energy_gateway::home_assistant::HomeAssistantAPI;
use duke_energy_gateway::integration::Integration;
use duke_energy_gateway::sensor::SensorState;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const SETUP_RETRY_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Duke Energy gateway bridge");
    let config = GatewayConfig::from_env()?;
    let home_assistant = HomeAssistantAPI::new(&config.ha_url, &config.ha_token);
    if !home_assistant.is_configured() {
        warn!("HA_URL not set, sensor states will only be logged");
    }

    let Some(integration) = setup_until_ready(&config).await? else {
        return Ok(());
    };

    // Register every sensor with Home Assistant before the first update arrives
    for state in integration.sensor_states() {
        publish(&home_assistant, &state).await;
    }

    let (state_tx, mut state_rx) = mpsc::channel::<SensorState>(32);
    integration.start(state_tx)?;

    loop {
        tokio::select! {
            Some(state) = state_rx.recv() => publish(&home_assistant, &state).await,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                integration.unload();
                break;
            }
        }
    }

    Ok(())
}

/// Retries setup while the API is not ready. Returns `None` if interrupted.
async fn setup_until_ready(config: &GatewayConfig) -> anyhow::Result<Option<Integration>> {
    loop {
        match Integration::setup(config).await {
            Ok(integration) => return Ok(Some(integration)),
            Err(e) if e.is_retryable() => {
                warn!("{e}. Retrying setup in {:?}", SETUP_RETRY_DELAY);
                tokio::select! {
                    _ = sleep(SETUP_RETRY_DELAY) => {}
                    _ = tokio::signal::ctrl_c() => return Ok(None),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn publish(home_assistant: &HomeAssistantAPI, state: &SensorState) {
    info!("{} = {}", state.entity_id, state.state);
    if !home_assistant.is_configured() {
        return;
    }
    match home_assistant.publish_state(state).await {
        Ok(stored) => debug!("Home Assistant stored {} = {}", stored.entity_id, stored.state),
        Err(e) => error!("Failed to publish {} to Home Assistant: {e}", state.entity_id),
    }
}
