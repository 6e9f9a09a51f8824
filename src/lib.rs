//! Duke Energy Gateway Library
//!
//! Exposes Duke Energy smart meter usage as two sensors: today's cumulative usage, polled
//! from the Duke Energy API every minute, and instantaneous demand pushed by the meter's
//! gateway over MQTT. Sensor states are published into Home Assistant over its REST API.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod duke_energy;
pub mod entity;
pub mod error;
pub mod home_assistant;
pub mod integration;
pub mod realtime;
pub mod sensor;
pub mod types;

// Re-export commonly used types for easier access
pub use config::{GatewayConfig, GatewayOptions};
pub use coordinator::{RealtimeStatus, UsageCoordinator};
pub use duke_energy::{DukeEnergyClient, UsageApi};
pub use error::{SetupError, UpdateFailed};
pub use integration::{discover_gateway, Integration};
pub use realtime::{DukeEnergyRealtime, RealtimeStream};
pub use sensor::{RealtimeUsageSensor, SensorState, UsageSensor};
