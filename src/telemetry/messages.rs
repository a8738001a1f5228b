//! テレメトリのワイヤ形式
//!
//! フィールド名と丸め桁数が受信側との互換性契約です。
//!
//! - 位置: `{"lat", "lon", "timestamp"}`（緯度経度は小数点以下6桁）
//! - 速度: `{"speed", "limit", "overspeed", "timestamp"}`（小数点以下2桁）
//! - 状態: `{"state", "timestamp", "color"?}`（color は 0〜255 の整数）
//! - 接続状態: `{"status": "online" | "offline", "timestamp"}`

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::models::{math_utils::round_to, Rgb, SpeedState};
use crate::scenario::TelemetryTopics;
use crate::telemetry::TelemetryError;

/// 現在の UNIX 時刻（秒、小数部付き）
pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationMessage {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: f64,
}

impl LocationMessage {
    pub fn new(lat: f64, lon: f64, timestamp: f64) -> Self {
        Self {
            lat: round_to(lat, 6),
            lon: round_to(lon, 6),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedMessage {
    pub speed: f64,
    pub limit: f64,
    pub overspeed: f64,
    pub timestamp: f64,
}

impl SpeedMessage {
    pub fn new(speed: f64, limit: f64, timestamp: f64) -> Self {
        Self {
            speed: round_to(speed, 2),
            limit: round_to(limit, 2),
            overspeed: round_to((speed - limit).max(0.0), 2),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorMessage {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl From<Rgb> for ColorMessage {
    fn from(color: Rgb) -> Self {
        let (r, g, b) = color.to_bytes();
        Self { r, g, b }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: SpeedState,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorMessage>,
}

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: LinkState,
    pub timestamp: f64,
}

/// メッセージの種類（トピックごとに1種類）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Location,
    Speed,
    State,
    Status,
}

impl MessageKind {
    pub fn topic<'a>(&self, topics: &'a TelemetryTopics) -> &'a str {
        match self {
            MessageKind::Location => &topics.location,
            MessageKind::Speed => &topics.speed,
            MessageKind::State => &topics.state,
            MessageKind::Status => &topics.status,
        }
    }

    /// 遅れて購読した受信者にも最後の値を見せるのは状態メッセージのみ
    pub fn retained(&self) -> bool {
        matches!(self, MessageKind::State)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMessage {
    Location(LocationMessage),
    Speed(SpeedMessage),
    State(StateMessage),
    Status(StatusMessage),
}

impl TelemetryMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            TelemetryMessage::Location(_) => MessageKind::Location,
            TelemetryMessage::Speed(_) => MessageKind::Speed,
            TelemetryMessage::State(_) => MessageKind::State,
            TelemetryMessage::Status(_) => MessageKind::Status,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            TelemetryMessage::Location(m) => serde_json::to_vec(m),
            TelemetryMessage::Speed(m) => serde_json::to_vec(m),
            TelemetryMessage::State(m) => serde_json::to_vec(m),
            TelemetryMessage::Status(m) => serde_json::to_vec(m),
        }
    }

    pub fn status(status: LinkState) -> Self {
        TelemetryMessage::Status(StatusMessage { status, timestamp: unix_timestamp() })
    }
}

/// トランスポートに渡す送信単位
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn encode(
        message: &TelemetryMessage,
        topics: &TelemetryTopics,
        qos: u8,
    ) -> Result<Self, TelemetryError> {
        let kind = message.kind();
        Ok(Self {
            topic: kind.topic(topics).to_string(),
            payload: message.to_payload()?,
            qos,
            retain: kind.retained(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn as_json(message: &TelemetryMessage) -> Value {
        serde_json::from_slice(&message.to_payload().unwrap()).unwrap()
    }

    #[test]
    fn test_location_wire_shape() {
        let msg = TelemetryMessage::Location(LocationMessage::new(0.123456789, -0.05, 1700000000.5));
        assert_eq!(as_json(&msg), json!({"lat": 0.123457, "lon": -0.05, "timestamp": 1700000000.5}));
    }

    #[test]
    fn test_speed_wire_shape() {
        let msg = TelemetryMessage::Speed(SpeedMessage::new(63.456, 60.0, 10.0));
        assert_eq!(
            as_json(&msg),
            json!({"speed": 63.46, "limit": 60.0, "overspeed": 3.46, "timestamp": 10.0})
        );

        let under = SpeedMessage::new(40.0, 60.0, 10.0);
        assert_eq!(under.overspeed, 0.0);
    }

    #[test]
    fn test_state_wire_shape() {
        let msg = TelemetryMessage::State(StateMessage {
            state: SpeedState::Warning,
            timestamp: 5.0,
            color: Some(Rgb::YELLOW.into()),
        });
        assert_eq!(
            as_json(&msg),
            json!({"state": "WARNING", "timestamp": 5.0, "color": {"r": 255, "g": 255, "b": 0}})
        );

        let bare = TelemetryMessage::State(StateMessage {
            state: SpeedState::Normal,
            timestamp: 5.0,
            color: None,
        });
        assert_eq!(as_json(&bare), json!({"state": "NORMAL", "timestamp": 5.0}));
    }

    #[test]
    fn test_status_wire_shape() {
        let msg = TelemetryMessage::Status(StatusMessage { status: LinkState::Offline, timestamp: 1.0 });
        assert_eq!(as_json(&msg), json!({"status": "offline", "timestamp": 1.0}));
    }

    #[test]
    fn test_only_state_is_retained() {
        let topics = TelemetryTopics::default();
        let state = TelemetryMessage::State(StateMessage { state: SpeedState::Normal, timestamp: 0.0, color: None });
        let speed = TelemetryMessage::Speed(SpeedMessage::new(1.0, 2.0, 0.0));

        let out = OutboundMessage::encode(&state, &topics, 1).unwrap();
        assert!(out.retain);
        assert_eq!(out.topic, "vehicle/smart_speed/state");
        assert_eq!(out.qos, 1);

        let out = OutboundMessage::encode(&speed, &topics, 1).unwrap();
        assert!(!out.retain);
        assert_eq!(out.topic, "vehicle/smart_speed/speed");
    }
}
