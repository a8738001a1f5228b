//! テレメトリのトランスポート層
//!
//! 具体的なブローカー接続は `ITransport` の実装として差し替えます。
//! 同梱の `LoopbackBroker` はプロセス内で完結する pub/sub ブローカーで、
//! 保持メッセージ、ウィルメッセージ、接続拒否を再現できます。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::telemetry::{messages::OutboundMessage, TelemetryError};

/// 接続時のオプション
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive: Duration,
    /// 異常切断時にブローカーが配信するメッセージ
    pub will: Option<OutboundMessage>,
}

/// pub/sub トランスポートのインターフェース
///
/// 実装はテレメトリのワーカースレッド上でのみ呼び出されます。
#[async_trait]
pub trait ITransport: Send {
    /// ブローカーへ接続
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TelemetryError>;

    /// 1メッセージを送信（QoS 1 以上なら到達確認まで待つ）
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TelemetryError>;

    /// 接続の生存確認
    async fn ping(&mut self) -> Result<(), TelemetryError>;

    /// 正常切断（ウィルメッセージは配信されない）
    async fn disconnect(&mut self) -> Result<(), TelemetryError>;
}

/// 購読者に届いたメッセージ
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

impl Delivery {
    fn from_outbound(message: &OutboundMessage, retained: bool) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            qos: message.qos,
            retained,
        }
    }
}

/// `#` で終わるフィルタは前方一致、それ以外は完全一致
fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter == "#" {
        return true;
    }
    match filter.strip_suffix("/#") {
        Some(prefix) => topic == prefix || topic.starts_with(&format!("{}/", prefix)),
        None => filter == topic,
    }
}

struct Session {
    generation: u64,
    will: Option<OutboundMessage>,
}

struct BrokerState {
    accepting: bool,
    next_generation: u64,
    sessions: HashMap<String, Session>,
    retained: HashMap<String, OutboundMessage>,
    subscribers: Vec<(String, Sender<Delivery>)>,
}

impl BrokerState {
    fn route(&mut self, message: &OutboundMessage) {
        if message.retain {
            self.retained.insert(message.topic.clone(), message.clone());
        }
        let delivery = Delivery::from_outbound(message, false);
        // 受信側が破棄された購読はここで掃除する
        self.subscribers.retain(|(filter, tx)| {
            !topic_matches(filter, &message.topic) || tx.send(delivery.clone()).is_ok()
        });
    }
}

/// プロセス内 pub/sub ブローカー
///
/// クローンは同じブローカーを共有します。
#[derive(Clone)]
pub struct LoopbackBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BrokerState {
                accepting: true,
                next_generation: 1,
                sessions: HashMap::new(),
                retained: HashMap::new(),
                subscribers: Vec::new(),
            })),
        }
    }

    /// トピックを購読する
    ///
    /// 一致する保持メッセージがあれば、購読直後に `retained = true` で届きます。
    pub fn subscribe(&self, filter: &str) -> Receiver<Delivery> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut state = self.inner.lock();
        for message in state.retained.values() {
            if topic_matches(filter, &message.topic) {
                let _ = tx.send(Delivery::from_outbound(message, true));
            }
        }
        state.subscribers.push((filter.to_string(), tx));
        rx
    }

    /// 新規接続を受け付けるかどうか（false で接続拒否を再現）
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.lock().accepting = accepting;
    }

    /// クライアントのセッションを異常切断する
    ///
    /// ウィルメッセージが登録されていれば配信します。セッションが存在しなければ false。
    pub fn sever(&self, client_id: &str) -> bool {
        let mut state = self.inner.lock();
        match state.sessions.remove(client_id) {
            Some(session) => {
                info!("ループバックブローカー: {} のセッションを切断", client_id);
                if let Some(will) = session.will {
                    state.route(&will);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_session_open(&self, client_id: &str) -> bool {
        self.inner.lock().sessions.contains_key(client_id)
    }

    /// トピックの保持メッセージ
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner.lock().retained.get(topic).map(|m| m.payload.clone())
    }

    /// このブローカーに接続するトランスポートを作成
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            broker: self.clone(),
            session: None,
        }
    }

    fn open_session(&self, options: &ConnectOptions) -> Result<u64, TelemetryError> {
        let mut state = self.inner.lock();
        if !state.accepting {
            return Err(TelemetryError::ConnectionRefused("broker is not accepting connections".to_string()));
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        // 同じ client_id の既存セッションは引き継ぎで置き換える
        state.sessions.insert(
            options.client_id.clone(),
            Session {
                generation,
                will: options.will.clone(),
            },
        );
        debug!("ループバックブローカー: {} が接続 (世代 {})", options.client_id, generation);
        Ok(generation)
    }

    fn check_session(&self, state: &BrokerState, client_id: &str, generation: u64) -> Result<(), TelemetryError> {
        match state.sessions.get(client_id) {
            Some(session) if session.generation == generation => Ok(()),
            _ => Err(TelemetryError::NotConnected),
        }
    }

    fn publish(&self, client_id: &str, generation: u64, message: &OutboundMessage) -> Result<(), TelemetryError> {
        let mut state = self.inner.lock();
        self.check_session(&state, client_id, generation)?;
        state.route(message);
        Ok(())
    }

    fn ping(&self, client_id: &str, generation: u64) -> Result<(), TelemetryError> {
        let state = self.inner.lock();
        self.check_session(&state, client_id, generation)
    }

    fn close_session(&self, client_id: &str, generation: u64) {
        let mut state = self.inner.lock();
        if self.check_session(&state, client_id, generation).is_ok() {
            state.sessions.remove(client_id);
        }
    }
}

/// `LoopbackBroker` に対する `ITransport` 実装
pub struct LoopbackTransport {
    broker: LoopbackBroker,
    session: Option<(String, u64)>,
}

impl LoopbackTransport {
    fn session(&self) -> Result<(&str, u64), TelemetryError> {
        self.session
            .as_ref()
            .map(|(id, generation)| (id.as_str(), *generation))
            .ok_or(TelemetryError::NotConnected)
    }
}

#[async_trait]
impl ITransport for LoopbackTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TelemetryError> {
        let generation = self.broker.open_session(options)?;
        self.session = Some((options.client_id.clone(), generation));
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TelemetryError> {
        let (client_id, generation) = self.session()?;
        self.broker.publish(client_id, generation, message)
    }

    async fn ping(&mut self) -> Result<(), TelemetryError> {
        let (client_id, generation) = self.session()?;
        self.broker.ping(client_id, generation)
    }

    async fn disconnect(&mut self) -> Result<(), TelemetryError> {
        if let Some((client_id, generation)) = self.session.take() {
            self.broker.close_session(&client_id, generation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(will: Option<OutboundMessage>) -> ConnectOptions {
        ConnectOptions {
            client_id: "car-1".to_string(),
            keep_alive: Duration::from_secs(60),
            will,
        }
    }

    fn message(topic: &str, payload: &str, retain: bool) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            qos: 1,
            retain,
        }
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_topic_filters() {
        assert!(topic_matches("vehicle/#", "vehicle/smart_speed/state"));
        assert!(topic_matches("#", "anything"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/bc"));
        assert!(!topic_matches("vehicle/#", "vehicles/x"));
    }

    #[test]
    fn test_publish_routes_to_subscribers() {
        let broker = LoopbackBroker::new();
        let rx = broker.subscribe("vehicle/#");
        let other = broker.subscribe("other");
        let mut transport = broker.transport();

        block_on(async {
            transport.connect(&options(None)).await.unwrap();
            transport.publish(&message("vehicle/speed", "{}", false)).await.unwrap();
        });

        let delivery = rx.try_recv().unwrap();
        assert_eq!(delivery.topic, "vehicle/speed");
        assert!(!delivery.retained);
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn test_retained_message_for_late_subscriber() {
        let broker = LoopbackBroker::new();
        let mut transport = broker.transport();
        block_on(async {
            transport.connect(&options(None)).await.unwrap();
            transport.publish(&message("state", "old", true)).await.unwrap();
            transport.publish(&message("state", "new", true)).await.unwrap();
            transport.publish(&message("speed", "x", false)).await.unwrap();
        });

        let late = broker.subscribe("#");
        let delivery = late.try_recv().unwrap();
        assert_eq!(delivery.payload, b"new".to_vec());
        assert!(delivery.retained);
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn test_will_on_sever_not_on_clean_disconnect() {
        let broker = LoopbackBroker::new();
        let rx = broker.subscribe("status");
        let will = message("status", "offline", false);

        let mut transport = broker.transport();
        block_on(transport.connect(&options(Some(will.clone())))).unwrap();
        assert!(broker.sever("car-1"));
        assert_eq!(rx.try_recv().unwrap().payload, b"offline".to_vec());
        assert!(block_on(transport.ping()).is_err());

        block_on(transport.connect(&options(Some(will)))).unwrap();
        block_on(transport.disconnect()).unwrap();
        assert!(!broker.is_session_open("car-1"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_refused_connection() {
        let broker = LoopbackBroker::new();
        broker.set_accepting(false);
        let mut transport = broker.transport();
        let err = block_on(transport.connect(&options(None))).unwrap_err();
        assert!(matches!(err, TelemetryError::ConnectionRefused(_)));
        assert!(matches!(block_on(transport.publish(&message("a", "b", false))), Err(TelemetryError::NotConnected)));
    }

    #[test]
    fn test_session_takeover_invalidates_old_transport() {
        let broker = LoopbackBroker::new();
        let mut first = broker.transport();
        let mut second = broker.transport();
        block_on(first.connect(&options(None))).unwrap();
        block_on(second.connect(&options(None))).unwrap();
        assert!(block_on(first.ping()).is_err());
        assert!(block_on(second.ping()).is_ok());
    }
}
