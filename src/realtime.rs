use crate::duke_energy::UsageApi;
use crate::error::DecodeError;
use crate::types::{MqttAuth, RealtimeMessage, RealtimeUsageMeasurement};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use serde_derive::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub type MessageCallback = Arc<dyn Fn(RealtimeMessage) + Send + Sync>;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// A push stream of realtime usage messages for one gateway.
#[async_trait]
pub trait RealtimeStream: Send + Sync {
    /// Installs the handler invoked for every inbound message.
    fn set_on_message(&self, callback: MessageCallback);

    /// Connects and stays subscribed until the task running it is cancelled.
    async fn connect_and_subscribe(&self) -> anyhow::Result<()>;

    fn decode(&self, msg: &RealtimeMessage) -> Result<RealtimeUsageMeasurement, DecodeError> {
        decode_usage_message(&msg.payload)
    }
}

#[derive(Deserialize)]
struct RawUsageMessage {
    timestamp: i64,
    usage: f64,
}

/// Decodes a `{"timestamp": <unix seconds>, "usage": <watts>}` payload.
pub fn decode_usage_message(payload: &[u8]) -> Result<RealtimeUsageMeasurement, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    let raw: RawUsageMessage = serde_json::from_str(text)?;
    let timestamp = Utc
        .timestamp_opt(raw.timestamp, 0)
        .single()
        .ok_or(DecodeError::Timestamp(raw.timestamp))?;
    Ok(RealtimeUsageMeasurement {
        timestamp,
        usage: raw.usage,
    })
}

pub fn live_topic(gateway_id: &str) -> String {
    format!("DESH/{gateway_id}/out/sm/1/live")
}

/// MQTT client for the gateway's live usage topic.
pub struct DukeEnergyRealtime {
    api: Arc<dyn UsageApi>,
    gateway_id: String,
    on_message: RwLock<Option<MessageCallback>>,
}

impl DukeEnergyRealtime {
    pub fn new(api: Arc<dyn UsageApi>, gateway_id: &str) -> Self {
        Self {
            api,
            gateway_id: gateway_id.to_string(),
            on_message: RwLock::new(None),
        }
    }

    fn mqtt_options(&self, auth: &MqttAuth) -> MqttOptions {
        let mut opts = MqttOptions::new(&auth.client_id, &auth.host, auth.port);
        opts.set_keep_alive(Duration::from_secs(60));
        opts.set_credentials(&auth.username, &auth.password);
        opts.set_transport(Transport::tls_with_default_config());
        opts
    }

    fn deliver(&self, msg: RealtimeMessage) {
        let callback = self
            .on_message
            .read()
            .ok()
            .and_then(|callback| callback.clone());
        match callback {
            Some(callback) => callback(msg),
            None => debug!("Dropping realtime message, no handler installed"),
        }
    }

    /// Runs one broker session until it fails.
    async fn run_session(&self, auth: &MqttAuth, attempt: &mut u32) -> anyhow::Result<()> {
        let topic = live_topic(&self.gateway_id);
        let (client, mut eventloop): (AsyncClient, EventLoop) =
            AsyncClient::new(self.mqtt_options(auth), 10);
        client.subscribe(&topic, QoS::AtMostOnce).await?;

        loop {
            match eventloop.poll().await? {
                Event::Incoming(Incoming::ConnAck(_)) => {
                    *attempt = 0;
                    info!("Connected to realtime usage broker {}:{}", auth.host, auth.port)
                }
                Event::Incoming(Incoming::SubAck(_)) => debug!("Subscribed to {topic}"),
                Event::Incoming(Incoming::Publish(publish)) => {
                    self.deliver(RealtimeMessage::new(publish.topic, publish.payload.to_vec()));
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl RealtimeStream for DukeEnergyRealtime {
    fn set_on_message(&self, callback: MessageCallback) {
        if let Ok(mut on_message) = self.on_message.write() {
            *on_message = Some(callback);
        }
    }

    async fn connect_and_subscribe(&self) -> anyhow::Result<()> {
        let mut attempt: u32 = 0;
        loop {
            let result = match self.api.get_mqtt_auth().await {
                Ok(auth) => self.run_session(&auth, &mut attempt).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                attempt = attempt.saturating_add(1);
                let backoff = backoff_for(attempt);
                warn!(
                    "Realtime connection lost (attempt {}): {}. Reconnecting in {:?}",
                    attempt, e, backoff
                );
                sleep(backoff).await;
            }
        }
    }
}

/// Exponential backoff, capped
fn backoff_for(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exp).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_valid_message() {
        let measurement =
            decode_usage_message(br#"{"timestamp": 1700000000, "usage": 1234.5}"#).unwrap();
        assert_eq!(measurement.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(measurement.usage, 1234.5);
    }

    #[test]
    fn test_decode_ignores_extra_fields() {
        let measurement =
            decode_usage_message(br#"{"timestamp": 10, "usage": 0, "gateway": "GW-1"}"#).unwrap();
        assert_eq!(measurement.usage, 0.0);
    }

    #[test]
    fn test_decode_malformed_payloads() {
        assert!(matches!(
            decode_usage_message(&[0xff, 0xfe]),
            Err(DecodeError::Utf8(_))
        ));
        assert!(matches!(
            decode_usage_message(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_usage_message(br#"{"timestamp": 10}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_usage_message(br#"{"timestamp": 9223372036854775807, "usage": 1}"#),
            Err(DecodeError::Timestamp(_))
        ));
    }

    #[test]
    fn test_live_topic() {
        assert_eq!(live_topic("GW-1"), "DESH/GW-1/out/sm/1/live");
    }

    #[test]
    fn test_backoff_for() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(2));
        assert_eq!(backoff_for(4), Duration::from_secs(8));
        assert_eq!(backoff_for(30), MAX_BACKOFF);
        assert_eq!(backoff_for(u32::MAX), MAX_BACKOFF);
    }

    struct FailingAuthApi {
        calls: std::sync::Mutex<Vec<tokio::time::Instant>>,
    }

    #[async_trait]
    impl UsageApi for FailingAuthApi {
        async fn get_account_list(&self) -> anyhow::Result<Vec<crate::types::Account>> {
            Ok(vec![])
        }

        async fn get_account_details(
            &self,
            _account: &crate::types::Account,
        ) -> anyhow::Result<crate::types::AccountDetails> {
            anyhow::bail!("not used")
        }

        fn select_meter(&self, _meter: &crate::types::MeterInfo) {}

        async fn get_gateway_status(
            &self,
        ) -> anyhow::Result<Option<crate::types::GatewayStatus>> {
            Ok(None)
        }

        async fn get_gateway_usage(
            &self,
            _start: i64,
            _end: i64,
        ) -> anyhow::Result<Vec<crate::types::UsageMeasurement>> {
            Ok(vec![])
        }

        async fn get_mqtt_auth(&self) -> anyhow::Result<MqttAuth> {
            self.calls
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            anyhow::bail!("broker credentials unavailable")
        }
    }

    #[test]
    fn test_mqtt_options_use_tls() {
        let api = Arc::new(FailingAuthApi {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let realtime = DukeEnergyRealtime::new(api, "GW-1");
        let opts = realtime.mqtt_options(&MqttAuth {
            host: "broker.example.com".to_string(),
            port: 8883,
            client_id: "client".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
        });

        assert!(matches!(opts.transport(), Transport::Tls(_)));
        assert_eq!(opts.broker_address(), ("broker.example.com".to_string(), 8883));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_growing_backoff() {
        let api = Arc::new(FailingAuthApi {
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let realtime = DukeEnergyRealtime::new(api.clone(), "GW-1");
        let started = tokio::time::Instant::now();
        let task = tokio::spawn(async move { realtime.connect_and_subscribe().await });

        // Attempts at 0s, 1s, 3s, 7s and 15s; the next one is due at 31s
        tokio::time::sleep(Duration::from_secs(20)).await;

        let offsets: Vec<u64> = api
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|at| (*at - started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7, 15]);
        assert!(!task.is_finished());
        task.abort();
    }
}
