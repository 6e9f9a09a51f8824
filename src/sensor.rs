use crate::coordinator::{CoordinatorState, UsageCoordinator};
use crate::dispatcher::MeasurementCallback;
use crate::entity::GatewayEntity;
use crate::error::SubscriptionError;
use crate::types::{GatewayStatus, MeterInfo, RealtimeUsageMeasurement, UsageMeasurement};
use chrono::{DateTime, Local, TimeZone};
use serde_derive::Serialize;
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub const STATE_UNAVAILABLE: &str = "unavailable";
pub const STATE_UNKNOWN: &str = "unknown";

/// A sensor state in the shape accepted by `POST /api/states/<entity_id>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    #[serde(skip)]
    pub entity_id: String,
    pub state: String,
    pub attributes: Map<String, Value>,
}

/// Total usage in kWh, rounded to three decimals.
pub fn total_kwh(usage: &[UsageMeasurement]) -> f64 {
    let kwh = usage.iter().fold(0.0, |total, m| total + m.usage) / 1000.0;
    // Adding 0.0 turns a rounded -0.0 into 0.0 so it never renders as "-0"
    (kwh * 1000.0).round() / 1000.0 + 0.0
}

fn base_attributes(
    entity: &GatewayEntity,
    friendly_name: &str,
    icon: &str,
    unit: &str,
    device_class: &str,
    state_class: &str,
) -> Map<String, Value> {
    let mut attributes = entity.extra_state_attributes();
    attributes.insert("friendly_name".to_string(), json!(friendly_name));
    attributes.insert("icon".to_string(), json!(icon));
    attributes.insert("unit_of_measurement".to_string(), json!(unit));
    attributes.insert("device_class".to_string(), json!(device_class));
    attributes.insert("state_class".to_string(), json!(state_class));
    attributes
}

/// Today's cumulative usage, read from the latest poll.
pub struct UsageSensor {
    entity: GatewayEntity,
}

impl UsageSensor {
    pub const KEY: &'static str = "usage_today_kwh";

    pub fn new(meter: &MeterInfo, gateway: &GatewayStatus) -> Self {
        Self {
            entity: GatewayEntity::new(Self::KEY, meter, gateway),
        }
    }

    pub fn available(state: &CoordinatorState) -> bool {
        state.last_update_success && state.data.is_some()
    }

    pub fn native_value(state: &CoordinatorState) -> Option<f64> {
        state.data.as_deref().map(total_kwh)
    }

    /// Time of the newest sample, or the start of the polled day when there is none yet.
    pub fn last_measurement(state: &CoordinatorState) -> Option<DateTime<Local>> {
        match state.data.as_deref().and_then(|data| data.last()) {
            Some(last) => Local.timestamp_opt(last.timestamp, 0).single(),
            None => state.window_start,
        }
    }

    pub fn state(&self, state: &CoordinatorState) -> SensorState {
        let mut attributes = base_attributes(
            &self.entity,
            "Duke Energy Usage Today",
            "mdi:flash",
            "kWh",
            "energy",
            "total_increasing",
        );
        if let Some(last) = Self::last_measurement(state) {
            attributes.insert("last_measurement".to_string(), json!(last.to_rfc3339()));
        }

        let value = match Self::native_value(state) {
            Some(kwh) if Self::available(state) => kwh.to_string(),
            _ => STATE_UNAVAILABLE.to_string(),
        };

        SensorState {
            entity_id: self.entity.entity_id(),
            state: value,
            attributes,
        }
    }
}

/// Instantaneous demand pushed by the gateway. Never polled.
pub struct RealtimeUsageSensor {
    entity: GatewayEntity,
    latest: Arc<Mutex<Option<RealtimeUsageMeasurement>>>,
}

impl RealtimeUsageSensor {
    pub const KEY: &'static str = "usage_now_w";

    pub fn new(meter: &MeterInfo, gateway: &GatewayStatus) -> Self {
        Self {
            entity: GatewayEntity::new(Self::KEY, meter, gateway),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn latest(&self) -> Option<RealtimeUsageMeasurement> {
        self.latest.lock().map(|latest| *latest).unwrap_or_default()
    }

    pub fn state(&self) -> SensorState {
        render_realtime(&self.entity, self.latest())
    }

    /// Subscribes to forwarded measurements and starts the realtime stream.
    pub fn attach<F>(
        &self,
        coordinator: &UsageCoordinator,
        on_update: F,
    ) -> Result<(), SubscriptionError>
    where
        F: Fn(SensorState) + Send + Sync + 'static,
    {
        let entity = self.entity.clone();
        let latest = self.latest.clone();
        let callback: MeasurementCallback =
            Arc::new(move |measurement: &RealtimeUsageMeasurement| {
                if let Ok(mut latest) = latest.lock() {
                    *latest = Some(*measurement);
                }
                on_update(render_realtime(&entity, Some(*measurement)));
            });

        let inserted = coordinator.realtime_subscribe(&self.entity.unique_id(), callback);
        if let Err(e) = coordinator.realtime_initialize() {
            // Leave a registration made by someone else in place
            if inserted {
                coordinator.realtime_unsubscribe(&self.entity.unique_id());
            }
            return Err(e);
        }
        debug!("Attached {}", self.entity.entity_id());
        Ok(())
    }

    pub fn detach(&self, coordinator: &UsageCoordinator) {
        coordinator.realtime_unsubscribe(&self.entity.unique_id());
        coordinator.realtime_cancel();
        debug!("Detached {}", self.entity.entity_id());
    }
}

fn render_realtime(
    entity: &GatewayEntity,
    measurement: Option<RealtimeUsageMeasurement>,
) -> SensorState {
    let mut attributes = base_attributes(
        entity,
        "Duke Energy Usage Now",
        "mdi:flash",
        "W",
        "power",
        "measurement",
    );
    let state = match measurement {
        Some(measurement) => {
            attributes.insert(
                "last_measurement".to_string(),
                json!(measurement.timestamp.with_timezone(&Local).to_rfc3339()),
            );
            measurement.usage.to_string()
        }
        None => STATE_UNKNOWN.to_string(),
    };
    SensorState {
        entity_id: entity.entity_id(),
        state,
        attributes,
    }
}
