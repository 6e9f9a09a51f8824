use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

/// An account as returned by the account list endpoint.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub src_acct_id: String,
    pub src_sys_cd: String,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetails {
    #[serde(rename = "meterInfo", default)]
    pub meter_infos: Vec<MeterInfo>,
}

/// A physical meter attached to an account.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterInfo {
    #[serde(default)]
    pub serial_num: String,
    #[serde(default)]
    pub meter_type: String,
    #[serde(default)]
    pub is_certified_smart_meter: bool,
    #[serde(default)]
    pub agreement_active_date: String,
}

impl MeterInfo {
    /// True for certified smart electric meters with a usable serial number.
    pub fn is_gateway_candidate(&self) -> bool {
        self.meter_type.eq_ignore_ascii_case("ELECTRIC")
            && self.is_certified_smart_meter
            && !self.serial_num.trim().is_empty()
    }
}

/// The realtime capable gateway paired with the selected meter.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub id: String,
    #[serde(default)]
    pub service_state: Option<String>,
    #[serde(default)]
    pub signal_strength: Option<i32>,
}

/// One historical usage sample. `usage` is in Wh.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageMeasurement {
    pub timestamp: i64,
    pub usage: f64,
}

/// A decoded push sample. `usage` is instantaneous demand in W.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RealtimeUsageMeasurement {
    pub timestamp: DateTime<Utc>,
    pub usage: f64,
}

/// Broker credentials for the realtime stream.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttAuth {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(rename = "user")]
    pub username: String,
    #[serde(rename = "pass")]
    pub password: String,
}

/// A raw message as received from the push stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RealtimeMessage {
    pub fn new<T: Into<String>, P: Into<Vec<u8>>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(meter_type: &str, certified: bool, serial: &str) -> MeterInfo {
        MeterInfo {
            serial_num: serial.to_string(),
            meter_type: meter_type.to_string(),
            is_certified_smart_meter: certified,
            agreement_active_date: "2020-01-01".to_string(),
        }
    }

    #[test]
    fn test_gateway_candidate_filter() {
        assert!(meter("ELECTRIC", true, "123").is_gateway_candidate());
        assert!(meter("Electric", true, "123").is_gateway_candidate());
        assert!(meter("electric", true, "123").is_gateway_candidate());

        assert!(!meter("GAS", true, "123").is_gateway_candidate());
        assert!(!meter("ELECTRIC", false, "123").is_gateway_candidate());
        assert!(!meter("ELECTRIC", true, "").is_gateway_candidate());
        assert!(!meter("ELECTRIC", true, "   ").is_gateway_candidate());
    }

    #[test]
    fn test_account_details_deserialize() {
        let details: AccountDetails = serde_json::from_str(
            r#"
            {
                "meterInfo": [
                    {
                        "serialNum": "111",
                        "meterType": "ELECTRIC",
                        "isCertifiedSmartMeter": true,
                        "agreementActiveDate": "2021-06-01"
                    },
                    { "meterType": "GAS" }
                ]
            }
        "#,
        )
        .unwrap();

        assert_eq!(details.meter_infos.len(), 2);
        assert_eq!(details.meter_infos[0].serial_num, "111");
        assert!(details.meter_infos[0].is_gateway_candidate());
        assert_eq!(details.meter_infos[1].serial_num, "");
        assert!(!details.meter_infos[1].is_certified_smart_meter);
    }

    #[test]
    fn test_mqtt_auth_field_names() {
        let auth: MqttAuth = serde_json::from_str(
            r#"{"host": "mqtt.example", "port": 8883, "clientId": "c1", "user": "u", "pass": "p"}"#,
        )
        .unwrap();
        assert_eq!(auth.username, "u");
        assert_eq!(auth.password, "p");
        assert_eq!(auth.client_id, "c1");
    }

    #[test]
    fn test_payload_lossy() {
        let msg = RealtimeMessage::new("t", vec![b'o', b'k', 0xff]);
        assert_eq!(msg.payload_lossy(), "ok\u{fffd}");
    }
}
