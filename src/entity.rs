use crate::types::{GatewayStatus, MeterInfo};
use serde_json::{json, Map, Value};

pub const NAME: &str = "Duke Energy Gateway";
pub const DOMAIN: &str = "duke_energy_gateway";
pub const ATTRIBUTION: &str = "Data provided by Duke Energy Unofficial API";
pub const ISSUE_URL: &str = "https://github.com/mjmeli/ha-duke-energy-gateway/issues";

/// Identity shared by every entity of one meter/gateway pair.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayEntity {
    key: String,
    meter: MeterInfo,
    gateway: GatewayStatus,
}

impl GatewayEntity {
    pub fn new(key: &str, meter: &MeterInfo, gateway: &GatewayStatus) -> Self {
        Self {
            key: key.to_string(),
            meter: meter.clone(),
            gateway: gateway.clone(),
        }
    }

    pub fn unique_id(&self) -> String {
        format!("duke_energy_{}", self.key)
    }

    /// Home Assistant entity id in the `sensor.` domain.
    pub fn entity_id(&self) -> String {
        format!("sensor.{}", self.unique_id())
    }

    pub fn extra_state_attributes(&self) -> Map<String, Value> {
        let mut attributes = Map::new();
        attributes.insert("attribution".to_string(), json!(ATTRIBUTION));
        attributes.insert("integration".to_string(), json!(DOMAIN));
        attributes.insert("meter".to_string(), json!(self.meter.serial_num));
        attributes.insert("gateway".to_string(), json!(self.gateway.id));
        attributes
    }
}
