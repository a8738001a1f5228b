use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::models::{Rgb, SpeedState};
use crate::scenario::TelemetryConfig;
use crate::telemetry::{
    messages::{
        unix_timestamp, LinkState, LocationMessage, OutboundMessage, SpeedMessage, StateMessage,
        TelemetryMessage,
    },
    transport::{ConnectOptions, ITransport},
    TelemetryError,
};

/// ティック側とワーカー側で共有する状態
///
/// 書き込みは Release、読み出しは Acquire で行います。
#[derive(Default)]
struct LinkShared {
    connected: AtomicBool,
    delivered: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
    /// 最後に送信を受け付けた UNIX 時刻の f64 ビット列（0 は未送信）
    last_publish_bits: AtomicU64,
}

impl LinkShared {
    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn last_publish(&self) -> Option<f64> {
        match self.last_publish_bits.load(Ordering::Acquire) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

enum LinkCommand {
    Publish(OutboundMessage),
    Shutdown,
}

struct LinkHandle {
    tx: UnboundedSender<LinkCommand>,
    worker: thread::JoinHandle<()>,
}

/// パブリッシャーの状態（HUD・ログ表示用）
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherStatus {
    pub connected: bool,
    pub broker: String,
    pub client_id: String,
    /// ブローカーに届いたメッセージ数
    pub delivered: u64,
    /// 送信に失敗した、または未接続で破棄されたメッセージ数
    pub failed: u64,
    pub reconnects: u64,
    pub last_publish: Option<f64>,
}

/// テレメトリパブリッシャー
///
/// `connect` でワーカースレッドを起動し、以降の送信はチャネル経由で
/// ワーカーへ渡します。`publish_*` はネットワーク I/O を待たず、
/// 未接続なら即座に false を返します。
pub struct TelemetryPublisher {
    config: TelemetryConfig,
    shared: Arc<LinkShared>,
    link: Option<LinkHandle>,
}

impl TelemetryPublisher {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            config: config.clone(),
            shared: Arc::new(LinkShared::default()),
            link: None,
        }
    }

    /// ワーカースレッドを起動して接続を開始する
    ///
    /// 接続の確立はバックグラウンドで行われ、この呼び出しは待ちません。
    /// 既に起動済みの場合は何もしません。
    pub fn connect<T>(&mut self, transport: T) -> Result<(), TelemetryError>
    where
        T: ITransport + 'static,
    {
        if self.link.is_some() {
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let worker = thread::Builder::new()
            .name("telemetry-link".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("テレメトリ用ランタイムの起動に失敗: {}", e);
                        return;
                    }
                };
                runtime.block_on(run_link(transport, config, rx, shared));
            })?;

        info!("ブローカー {} へ接続中...", self.config.broker_label());
        self.link = Some(LinkHandle { tx, worker });
        Ok(())
    }

    /// ワーカーを停止して切断する
    ///
    /// 戻った時点でワーカーは終了しており、`is_connected` は false です。
    /// 未送信のメッセージは破棄されることがあります。
    pub fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            self.shared.set_connected(false);
            return;
        };

        self.shared.set_connected(false);
        let _ = link.tx.send(LinkCommand::Shutdown);
        if link.worker.join().is_err() {
            error!("テレメトリワーカーが異常終了しました");
        }
        self.shared.set_connected(false);
        info!("ブローカー {} から切断しました", self.config.broker_label());
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// 接続が確立するまで最大 `timeout` 待つ
    pub fn wait_until_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if self.link.is_none() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// 擬似GPS座標を送信
    pub fn publish_location(&self, lat: f64, lon: f64) -> bool {
        self.submit(TelemetryMessage::Location(LocationMessage::new(lat, lon, unix_timestamp())))
    }

    /// 速度と制限速度を送信
    pub fn publish_speed(&self, speed: f64, limit: f64) -> bool {
        self.submit(TelemetryMessage::Speed(SpeedMessage::new(speed, limit, unix_timestamp())))
    }

    /// 制御状態を送信（保持メッセージ）
    pub fn publish_state(&self, state: SpeedState, color: Option<Rgb>) -> bool {
        self.submit(TelemetryMessage::State(StateMessage {
            state,
            timestamp: unix_timestamp(),
            color: color.map(Into::into),
        }))
    }

    fn submit(&self, message: TelemetryMessage) -> bool {
        let kind = message.kind();
        if !self.shared.is_connected() {
            debug!("未接続のため {:?} を送信しません", kind);
            return false;
        }
        let Some(link) = &self.link else {
            return false;
        };

        let outbound = match OutboundMessage::encode(&message, &self.config.topics, self.config.qos) {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("{:?} のシリアライズに失敗: {}", kind, e);
                return false;
            }
        };

        match link.tx.send(LinkCommand::Publish(outbound)) {
            Ok(()) => {
                self.shared
                    .last_publish_bits
                    .store(unix_timestamp().to_bits(), Ordering::Release);
                true
            }
            Err(_) => {
                warn!("テレメトリワーカーが停止しているため {:?} を送信できません", kind);
                false
            }
        }
    }

    pub fn status(&self) -> PublisherStatus {
        PublisherStatus {
            connected: self.shared.is_connected(),
            broker: self.config.broker_label(),
            client_id: self.config.client_id.clone(),
            delivered: self.shared.delivered.load(Ordering::Acquire),
            failed: self.shared.failed.load(Ordering::Acquire),
            reconnects: self.shared.reconnects.load(Ordering::Acquire),
            last_publish: self.shared.last_publish(),
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        if self.link.is_some() {
            self.disconnect();
        }
    }
}

/// 接続してオンライン状態を通知する
async fn establish<T: ITransport>(transport: &mut T, config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let will = OutboundMessage::encode(
        &TelemetryMessage::status(LinkState::Offline),
        &config.topics,
        config.qos,
    )?;
    let options = ConnectOptions {
        client_id: config.client_id.clone(),
        keep_alive: config.keep_alive(),
        will: Some(will),
    };
    transport.connect(&options).await?;

    let online = OutboundMessage::encode(
        &TelemetryMessage::status(LinkState::Online),
        &config.topics,
        config.qos,
    )?;
    transport.publish(&online).await
}

/// 再接続まで待機する。停止要求を受けた場合は false
async fn wait_before_retry(
    rx: &mut UnboundedReceiver<LinkCommand>,
    shared: &LinkShared,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            command = rx.recv() => match command {
                Some(LinkCommand::Publish(message)) => {
                    shared.failed.fetch_add(1, Ordering::AcqRel);
                    debug!("未接続のため {} 宛のメッセージを破棄", message.topic);
                }
                Some(LinkCommand::Shutdown) | None => return false,
            },
        }
    }
}

/// ワーカースレッドの本体
async fn run_link<T: ITransport>(
    mut transport: T,
    config: TelemetryConfig,
    mut rx: UnboundedReceiver<LinkCommand>,
    shared: Arc<LinkShared>,
) {
    let keep_alive = config.keep_alive().max(Duration::from_secs(1));
    let mut attempt: u64 = 0;

    'link: loop {
        if attempt > 0 {
            shared.reconnects.fetch_add(1, Ordering::AcqRel);
        }
        attempt += 1;

        if let Err(e) = establish(&mut transport, &config).await {
            shared.set_connected(false);
            warn!("ブローカー {} への接続に失敗: {}", config.broker_label(), e);
            if !wait_before_retry(&mut rx, &shared, config.reconnect_delay()).await {
                break 'link;
            }
            continue;
        }
        shared.set_connected(true);
        info!("ブローカー {} に接続しました", config.broker_label());

        let start = tokio::time::Instant::now() + keep_alive;
        let mut ping = tokio::time::interval_at(start, keep_alive);
        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(LinkCommand::Publish(message)) => {
                        if let Err(e) = transport.publish(&message).await {
                            shared.failed.fetch_add(1, Ordering::AcqRel);
                            shared.set_connected(false);
                            warn!("{} への送信に失敗、再接続します: {}", message.topic, e);
                            break;
                        }
                        shared.delivered.fetch_add(1, Ordering::AcqRel);
                    }
                    Some(LinkCommand::Shutdown) | None => {
                        if let Err(e) = transport.disconnect().await {
                            warn!("切断処理に失敗: {}", e);
                        }
                        break 'link;
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = transport.ping().await {
                        shared.set_connected(false);
                        warn!("接続の生存確認に失敗、再接続します: {}", e);
                        break;
                    }
                }
            }
        }

        if !wait_before_retry(&mut rx, &shared, config.reconnect_delay()).await {
            break 'link;
        }
    }

    shared.set_connected(false);
    debug!("テレメトリワーカーを終了");
}
