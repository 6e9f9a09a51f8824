use crate::sensor::SensorState;
use serde_derive::{Deserialize, Serialize};

/// Pushes sensor states into Home Assistant through its REST API.
pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(endpoint_url: &str, auth_token: &str) -> Self {
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint_url.is_empty()
    }

    pub async fn publish_state(&self, sensor: &SensorState) -> Result<HAState, anyhow::Error> {
        if !self.is_configured() {
            anyhow::bail!("No HA connection");
        }
        let result = self
            .client
            .post(format!(
                "{}/api/states/{}",
                self.endpoint_url, sensor.entity_id
            ))
            .bearer_auth(&self.auth_token)
            .json(sensor)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

/// The state Home Assistant stored, as echoed back by the API.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HAState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub last_changed: String,
    #[serde(default)]
    pub last_updated: String,
}
