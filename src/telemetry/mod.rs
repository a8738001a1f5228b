//! # Telemetry モジュール
//!
//! 車両の位置・速度・制御状態をブローカーへ送信する境界部分です。
//!
//! シミュレーションのティックはネットワーク I/O で待たされてはならないため、
//! 接続・再接続・送信はすべて専用のワーカースレッドで行います。ティック側との
//! 境界はチャネル（送信要求）とアトミックな接続フラグ（状態参照）の2つだけです。
//!
//! 送信間隔の制御は呼び出し側（シミュレーションドライバー）の責務で、
//! パブリッシャー自身はレート制限を持ちません。

pub mod messages;
pub mod publisher;
pub mod transport;

pub use messages::{
    ColorMessage, LinkState, LocationMessage, MessageKind, OutboundMessage, SpeedMessage,
    StateMessage, StatusMessage, TelemetryMessage,
};
pub use publisher::{PublisherStatus, TelemetryPublisher};
pub use transport::{ConnectOptions, Delivery, ITransport, LoopbackBroker, LoopbackTransport};

/// テレメトリ送信のエラー
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("not connected")]
    NotConnected,
    #[error("telemetry link closed")]
    LinkClosed,
    #[error("failed to start telemetry worker: {0}")]
    Worker(#[from] std::io::Error),
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}
