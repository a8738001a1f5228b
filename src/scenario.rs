use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::models::{Position3D, Rgb};

/// シナリオメタデータ
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenarioMeta {
    pub version: String,
    pub name: String,
    pub description: String,
}

impl Default for ScenarioMeta {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            name: "default".to_string(),
            description: "School Zone → City Road → Highway の標準走行".to_string(),
        }
    }
}

/// 物理演算に渡すソフト速度上限の取り方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedCeilingMode {
    /// 現在ゾーンの制限速度を上限とする
    ZoneLimit,
    /// 車両の絶対最高速度を上限とする
    VehicleMax,
    /// 上限を渡さない
    #[serde(rename = "none")]
    Disabled,
}

/// シミュレーション設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub dt_s: f64,
    pub t_max_s: f64,
    /// true の場合、各ティックを実時間に合わせて待機する
    pub realtime: bool,
    pub speed_ceiling: SpeedCeilingMode,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            dt_s: 0.016,
            t_max_s: 60.0,
            realtime: false,
            speed_ceiling: SpeedCeilingMode::ZoneLimit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PositionConfig {
    pub x_m: f64,
    pub y_m: f64,
    pub z_m: f64,
}

impl From<PositionConfig> for Position3D {
    fn from(p: PositionConfig) -> Self {
        Position3D::new(p.x_m, p.y_m, p.z_m)
    }
}

/// 車両の運動パラメータ（速度は km/h、変化率は km/h/秒）
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub max_speed_kmh: f64,
    pub acceleration_kmh_s: f64,
    pub deceleration_normal_kmh_s: f64,
    pub deceleration_brake_kmh_s: f64,
    pub friction_kmh_s: f64,
    pub steering_rate_deg_s: f64,
    pub steering_deadband: f64,
    /// 呼び出し1回あたりの角速度減衰係数（dt に依存しない）
    pub heading_damping: f64,
    /// 上限超過時の減速率 = friction_kmh_s × この係数
    pub overspeed_decel_factor: f64,
    /// 減速スケールが 1 に達する超過量 (km/h)
    pub overspeed_scale_kmh: f64,
    /// 1回の更新で下回らない上限比率
    pub ceiling_floor_ratio: f64,
    pub initial_position: PositionConfig,
}

impl VehicleConfig {
    /// 上限超過時の基準減速率 (km/h/秒)
    pub fn overspeed_decel_rate(&self) -> f64 {
        self.friction_kmh_s * self.overspeed_decel_factor
    }
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: 120.0,
            acceleration_kmh_s: 30.0,
            deceleration_normal_kmh_s: 15.0,
            deceleration_brake_kmh_s: 40.0,
            friction_kmh_s: 5.0,
            steering_rate_deg_s: 90.0,
            steering_deadband: 0.01,
            heading_damping: 0.8,
            overspeed_decel_factor: 2.5,
            overspeed_scale_kmh: 10.0,
            ceiling_floor_ratio: 0.95,
            initial_position: PositionConfig::default(),
        }
    }
}

/// 速度制御の閾値設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// WARNING から REGULATING に移る超過量 (km/h)
    pub tolerance_kmh: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self { tolerance_kmh: 5.0 }
    }
}

/// 速度制限ゾーン設定
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoneConfig {
    pub id: String,
    pub name: String,
    pub speed_limit_kmh: f64,
    #[serde(default = "default_zone_color")]
    pub color: Rgb,
    pub x_range_m: [f64; 2],
    pub y_range_m: [f64; 2],
}

fn default_zone_color() -> Rgb {
    Rgb::WHITE
}

/// 参照構成の3ゾーン
pub fn default_zones() -> Vec<ZoneConfig> {
    vec![
        ZoneConfig {
            id: "school".to_string(),
            name: "School Zone".to_string(),
            speed_limit_kmh: 50.0,
            color: Rgb(1.0, 0.8, 0.0),
            x_range_m: [-100.0, 0.0],
            y_range_m: [-50.0, 50.0],
        },
        ZoneConfig {
            id: "city".to_string(),
            name: "City Road".to_string(),
            speed_limit_kmh: 60.0,
            color: Rgb(0.8, 0.8, 0.8),
            x_range_m: [0.0, 100.0],
            y_range_m: [-50.0, 50.0],
        },
        ZoneConfig {
            id: "highway".to_string(),
            name: "Highway".to_string(),
            speed_limit_kmh: 80.0,
            color: Rgb(0.4, 0.4, 0.4),
            x_range_m: [100.0, 300.0],
            y_range_m: [-50.0, 50.0],
        },
    ]
}

/// テレメトリのトピック設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryTopics {
    pub location: String,
    pub speed: String,
    pub state: String,
    pub status: String,
}

impl Default for TelemetryTopics {
    fn default() -> Self {
        Self {
            location: "vehicle/smart_speed/location".to_string(),
            speed: "vehicle/smart_speed/speed".to_string(),
            state: "vehicle/smart_speed/state".to_string(),
            status: "vehicle/smart_speed/status".to_string(),
        }
    }
}

/// テレメトリ送信設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub publish_interval_ms: u64,
    pub qos: u8,
    pub keep_alive_s: u64,
    pub reconnect_delay_ms: u64,
    pub topics: TelemetryTopics,
}

impl TelemetryConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_s)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// 表示用のブローカー名 (host:port)
    pub fn broker_label(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker_host: "broker.hivemq.com".to_string(),
            broker_port: 1883,
            client_id: "smart_speed_controller_01".to_string(),
            publish_interval_ms: 500,
            qos: 1,
            keep_alive_s: 60,
            reconnect_delay_ms: 1000,
            topics: TelemetryTopics::default(),
        }
    }
}

/// 運転スクリプトの1区間
///
/// 入力レイヤーの代わりに、一定時間同じ操作を続ける区間を並べて走行を記述します。
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DriveSegment {
    pub duration_s: f64,
    pub acceleration: f64,
    pub steering: f64,
    pub braking: bool,
    /// 区間開始時に車両と制御エンジンをリセットする
    pub reset: bool,
}

/// 参照構成で REGULATING まで到達する標準の運転スクリプト
pub fn default_drive() -> Vec<DriveSegment> {
    vec![
        DriveSegment { duration_s: 6.0, acceleration: 1.0, ..Default::default() },
        DriveSegment { duration_s: 2.0, ..Default::default() },
        DriveSegment { duration_s: 8.0, acceleration: 1.0, ..Default::default() },
        DriveSegment { duration_s: 1.5, braking: true, ..Default::default() },
        DriveSegment { duration_s: 1.0, acceleration: 0.5, steering: 0.3, ..Default::default() },
        DriveSegment { duration_s: 10.0, acceleration: 1.0, ..Default::default() },
    ]
}

/// 完全なシナリオ設定
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub meta: ScenarioMeta,
    pub sim: SimulationConfig,
    pub vehicle: VehicleConfig,
    pub control: ControlConfig,
    pub zones: Vec<ZoneConfig>,
    pub telemetry: TelemetryConfig,
    pub drive: Vec<DriveSegment>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            meta: ScenarioMeta::default(),
            sim: SimulationConfig::default(),
            vehicle: VehicleConfig::default(),
            control: ControlConfig::default(),
            zones: default_zones(),
            telemetry: TelemetryConfig::default(),
            drive: default_drive(),
        }
    }
}

impl ScenarioConfig {
    /// YAMLファイルからシナリオ設定を読み込み
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScenarioError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ScenarioError::FileNotFound(path.to_path_buf()));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| ScenarioError::IoError(path.to_path_buf(), e))?;

        let config: ScenarioConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ScenarioError::ParseError(path.to_path_buf(), e))?;

        config.validate()?;

        Ok(config)
    }

    /// YAML文字列からシナリオ設定を読み込み
    pub fn from_yaml_str(contents: &str) -> Result<Self, ScenarioError> {
        let config: ScenarioConfig = serde_yaml::from_str(contents)
            .map_err(|e| ScenarioError::ParseError(Path::new("<inline>").to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定の基本的な検証
    ///
    /// ループ開始前に弾けるものはここで弾きます。ゾーンが1つもない構成は
    /// 車両の最高速度を制限速度として扱う縮退動作になるため、警告のみとします。
    pub fn validate(&self) -> Result<(), ScenarioError> {
        require_positive("dt_s", self.sim.dt_s)?;
        require_positive("t_max_s", self.sim.t_max_s)?;

        let v = &self.vehicle;
        require_positive("max_speed_kmh", v.max_speed_kmh)?;
        for (name, value) in [
            ("acceleration_kmh_s", v.acceleration_kmh_s),
            ("deceleration_normal_kmh_s", v.deceleration_normal_kmh_s),
            ("deceleration_brake_kmh_s", v.deceleration_brake_kmh_s),
            ("friction_kmh_s", v.friction_kmh_s),
            ("steering_rate_deg_s", v.steering_rate_deg_s),
            ("steering_deadband", v.steering_deadband),
            ("overspeed_decel_factor", v.overspeed_decel_factor),
            ("ceiling_floor_ratio", v.ceiling_floor_ratio),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ScenarioError::ValidationError(format!("{} must be a non-negative number", name)));
            }
        }
        if !(0.0..=1.0).contains(&v.heading_damping) {
            return Err(ScenarioError::ValidationError("heading_damping must be within [0, 1]".to_string()));
        }
        require_positive("overspeed_scale_kmh", v.overspeed_scale_kmh)?;
        let p = &v.initial_position;
        if !(p.x_m.is_finite() && p.y_m.is_finite() && p.z_m.is_finite()) {
            return Err(ScenarioError::ValidationError("initial_position must be finite".to_string()));
        }

        require_positive("tolerance_kmh", self.control.tolerance_kmh)?;

        if self.zones.is_empty() {
            warn!("ゾーンが設定されていません。制限速度は車両の最高速度 {} km/h になります", v.max_speed_kmh);
        }
        let mut seen = HashSet::new();
        for zone in &self.zones {
            if !seen.insert(zone.id.as_str()) {
                return Err(ScenarioError::ValidationError(format!("Duplicate zone id {}", zone.id)));
            }
            require_positive(&format!("Zone {} speed_limit_kmh", zone.id), zone.speed_limit_kmh)?;
            if zone.x_range_m.iter().chain(zone.y_range_m.iter()).any(|b| b.is_nan()) {
                return Err(ScenarioError::ValidationError(format!("Zone {} bounds must be numbers", zone.id)));
            }
            if zone.x_range_m[0] > zone.x_range_m[1] || zone.y_range_m[0] > zone.y_range_m[1] {
                return Err(ScenarioError::ValidationError(format!("Invalid bounds for zone {}", zone.id)));
            }
        }

        let t = &self.telemetry;
        if t.publish_interval_ms == 0 {
            return Err(ScenarioError::ValidationError("publish_interval_ms must be positive".to_string()));
        }
        if t.qos > 2 {
            return Err(ScenarioError::ValidationError(format!("Invalid QoS {}", t.qos)));
        }

        for (index, segment) in self.drive.iter().enumerate() {
            if !segment.duration_s.is_finite() || segment.duration_s < 0.0 {
                return Err(ScenarioError::ValidationError(
                    format!("Drive segment {} must have a finite non-negative duration", index)
                ));
            }
            if !(segment.acceleration.is_finite() && segment.steering.is_finite()) {
                return Err(ScenarioError::ValidationError(
                    format!("Drive segment {} inputs must be finite", index)
                ));
            }
        }

        Ok(())
    }

    /// シナリオの概要を表示
    pub fn print_summary(&self) {
        println!("=== シナリオ情報 ===");
        println!("名前: {}", self.meta.name);
        println!("説明: {}", self.meta.description);
        println!("バージョン: {}", self.meta.version);
        println!();

        println!("=== シミュレーション設定 ===");
        println!("時間刻み: {:.3}秒", self.sim.dt_s);
        println!("最大時間: {:.1}秒", self.sim.t_max_s);
        println!("実時間同期: {}", if self.sim.realtime { "有効" } else { "無効" });
        println!("速度上限モード: {:?}", self.sim.speed_ceiling);
        println!();

        println!("=== 車両 ===");
        println!("最高速度: {:.0} km/h", self.vehicle.max_speed_kmh);
        println!("加速度: {:.0} km/h/秒", self.vehicle.acceleration_kmh_s);
        println!("許容超過量: {:.1} km/h", self.control.tolerance_kmh);
        println!();

        println!("=== ゾーン ===");
        println!("ゾーン数: {}", self.zones.len());
        for zone in &self.zones {
            println!(
                "  {} ({}): {:.0} km/h  X[{:.0}, {:.0}] Y[{:.0}, {:.0}]",
                zone.name,
                zone.id,
                zone.speed_limit_kmh,
                zone.x_range_m[0],
                zone.x_range_m[1],
                zone.y_range_m[0],
                zone.y_range_m[1]
            );
        }
        println!();

        println!("=== テレメトリ ===");
        if self.telemetry.enabled {
            println!("ブローカー: {}", self.telemetry.broker_label());
            println!("クライアントID: {}", self.telemetry.client_id);
            println!("送信間隔: {}ms (QoS {})", self.telemetry.publish_interval_ms, self.telemetry.qos);
        } else {
            println!("無効");
        }
        println!();

        let total: f64 = self.drive.iter().map(|s| s.duration_s).sum();
        println!("=== 運転スクリプト ===");
        println!("区間数: {} (合計 {:.1}秒)", self.drive.len(), total);
    }
}

/// 有限の正の値であることを確認（NaN と無限大は不可）
fn require_positive(name: &str, value: f64) -> Result<(), ScenarioError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ScenarioError::ValidationError(format!("{} must be a positive finite number, got {}", name, value)))
    }
}

/// シナリオ読み込みエラー
#[derive(Debug)]
pub enum ScenarioError {
    FileNotFound(std::path::PathBuf),
    IoError(std::path::PathBuf, std::io::Error),
    ParseError(std::path::PathBuf, serde_yaml::Error),
    ValidationError(String),
}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScenarioError::FileNotFound(path) => {
                write!(f, "シナリオファイルが見つかりません: {}", path.display())
            }
            ScenarioError::IoError(path, err) => {
                write!(f, "ファイル読み込みエラー {}: {}", path.display(), err)
            }
            ScenarioError::ParseError(path, err) => {
                write!(f, "YAML解析エラー {}: {}", path.display(), err)
            }
            ScenarioError::ValidationError(msg) => {
                write!(f, "設定検証エラー: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScenarioError {}
