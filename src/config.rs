use crate::error::ConfigError;
use std::env;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://cust-api.duke-energy.com/gep/v2";
pub const REALTIME_INTERVAL_DEFAULT_SEC: u64 = 0;

/// Account credentials, the equivalent of a config entry's data.
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// User tunable options for a configured account.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOptions {
    /// Minimum spacing between forwarded realtime measurements. Zero forwards every message.
    pub realtime_interval: Duration,
    pub realtime_enabled: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            realtime_interval: Duration::from_secs(REALTIME_INTERVAL_DEFAULT_SEC),
            realtime_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub credentials: Credentials,
    pub api_url: String,
    pub options: GatewayOptions,
    pub ha_url: String,
    pub ha_token: String,
}

impl GatewayConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let email = required("DUKE_EMAIL")?;
        let password = required("DUKE_PASSWORD")?;
        let api_url = env::var("DUKE_API_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let realtime_interval = parse_realtime_interval(env::var("DUKE_REALTIME_INTERVAL").ok())?;
        let realtime_enabled = env::var("DUKE_REALTIME_ENABLED")
            .ok()
            .map(|v| parse_bool_safe(Some(v)))
            .unwrap_or(true);

        Ok(Self {
            credentials: Credentials { email, password },
            api_url: api_url.trim_end_matches('/').to_string(),
            options: GatewayOptions {
                realtime_interval,
                realtime_enabled,
            },
            ha_url: env::var("HA_URL").unwrap_or_default(),
            ha_token: env::var("HA_TOKEN").unwrap_or_default(),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// Parses the realtime throttle interval in whole seconds. Unset or blank means the default.
pub fn parse_realtime_interval(val: Option<String>) -> Result<Duration, ConfigError> {
    let raw = match val {
        Some(v) if !v.trim().is_empty() => v,
        _ => return Ok(Duration::from_secs(REALTIME_INTERVAL_DEFAULT_SEC)),
    };
    let secs: i64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
        name: "DUKE_REALTIME_INTERVAL",
        value: raw.clone(),
        reason: format!("{e}"),
    })?;
    if secs < 0 {
        return Err(ConfigError::Invalid {
            name: "DUKE_REALTIME_INTERVAL",
            value: raw,
            reason: "interval must not be negative".to_string(),
        });
    }
    Ok(Duration::from_secs(secs as u64))
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
