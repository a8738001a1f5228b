//! # Simulation モジュール
//!
//! 速度制御シミュレーションのドライバーを提供します。
//!
//! 描画・HUD・音声・キー入力は扱わず、運転スクリプトの入力で車両を走らせ、
//! 各ティックの結果を `TickReport` として返します。
//!
//! ## ティック内の処理順序
//!
//! 1. **ゾーン判定**: 現在位置から制限速度を決定
//! 2. **物理更新**: 前ティックの規制係数を加速入力に掛けて運動を進める
//! 3. **制御評価**: 新しい速度と制限速度から状態と規制係数を再計算
//! 4. **テレメトリ**: 送信間隔が経過していれば位置・速度・状態を送信
//!
//! ティックは単一スレッドで同期的に実行され、途中で中断されることはありません。
//!
//! ## 使用例
//!
//! ```ignore
//! use speedsim::scenario::ScenarioConfig;
//! use speedsim::simulation::SimulationEngine;
//!
//! let config = ScenarioConfig::from_file("scenarios/city_drive.yaml")?;
//! let mut engine = SimulationEngine::new(config, 1);
//! engine.initialize()?;
//! let summary = engine.run()?;
//! summary.print();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::models::*;
use crate::scenario::*;
use crate::telemetry::{PublisherStatus, TelemetryPublisher};

/// ドライバーのセットアップエラー
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("simulation already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}

/// 1ティックの結果（描画・HUD・音声レイヤー向けの読み取り専用スナップショット）
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub time: f64,
    pub position: Position3D,
    pub velocity: f64,
    pub heading: f64,
    pub zone_id: Option<String>,
    pub zone_name: String,
    pub zone_color: Rgb,
    pub zone_limit: f64,
    /// 現在ゾーンの最も近い境界までの距離 (m)
    pub boundary_distance: f64,
    pub control: ControlStateSnapshot,
    pub state_color: Rgb,
    pub telemetry_connected: bool,
}

/// テレメトリ送信間隔の制御
///
/// 前回の送信サイクルからの経過時間で判定します。時刻の更新はサイクル内の
/// 送信をすべて試みた後に行うため、失敗が続いても間隔は縮まりません。
#[derive(Debug, Clone)]
pub struct PublishThrottle {
    interval: Duration,
    last: Option<Duration>,
}

impl PublishThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn ready(&self, now: Duration) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.interval,
        }
    }

    pub fn mark(&mut self, now: Duration) {
        self.last = Some(now);
    }
}

/// 送信間隔の判定に使う時計
#[derive(Debug, Clone, Copy)]
enum TelemetryClock {
    /// 実時間（realtime 実行時）
    Wall(Instant),
    /// シミュレーション時刻
    Simulated,
}

/// 運転スクリプトの再生位置
struct DriveCursor {
    segments: Vec<DriveSegment>,
    index: usize,
    segment_start: f64,
    entered: bool,
}

impl DriveCursor {
    fn new(segments: Vec<DriveSegment>) -> Self {
        Self {
            segments,
            index: 0,
            segment_start: 0.0,
            entered: false,
        }
    }

    /// 時刻 `t` の入力と、区間開始時のリセット要求を返す
    ///
    /// 1ティックの間に通り過ぎた区間（長さ 0 の区間を含む）のリセット要求も
    /// 取りこぼさずに返します。スクリプトを使い切った後は無入力（惰性走行）になります。
    fn input_at(&mut self, t: f64) -> (ControlInput, bool) {
        let mut reset = false;
        while let Some(segment) = self.segments.get(self.index) {
            if t < self.segment_start + segment.duration_s {
                break;
            }
            reset |= segment.reset && !self.entered;
            self.segment_start += segment.duration_s;
            self.index += 1;
            self.entered = false;
        }

        match self.segments.get(self.index) {
            Some(segment) => {
                reset |= segment.reset && !self.entered;
                self.entered = true;
                (ControlInput::new(segment.acceleration, segment.steering, segment.braking), reset)
            }
            None => (ControlInput::default(), reset),
        }
    }
}

/// 状態遷移の記録
#[derive(Debug, Default)]
pub struct TransitionLog {
    pub transitions: Vec<(f64, StateTransition)>,
}

/// 実行結果の集計
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub steps: u64,
    pub sim_time: f64,
    pub time_in_state: HashMap<SpeedState, f64>,
    pub max_overspeed: f64,
    pub max_velocity: f64,
    pub transitions: usize,
    pub resets: u64,
    pub publish_cycles: u64,
    pub skipped_cycles: u64,
    pub publish_ok: u64,
    pub publish_failed: u64,
    pub final_zone: String,
    pub final_position: Position3D,
    pub telemetry: Option<PublisherStatus>,
}

impl RunSummary {
    pub fn print(&self) {
        println!("=== 実行結果 ===");
        println!("シミュレーション時間: {:.1}秒 ({} ステップ)", self.sim_time, self.steps);
        println!("最高速度: {:.1} km/h", self.max_velocity);
        println!("最大超過量: {:.1} km/h", self.max_overspeed);
        println!("状態遷移: {} 回 (リセット {} 回)", self.transitions, self.resets);
        for state in [SpeedState::Normal, SpeedState::Warning, SpeedState::Regulating] {
            let t = self.time_in_state.get(&state).copied().unwrap_or(0.0);
            println!("  {:<10} {:.1}秒", state.as_str(), t);
        }
        println!(
            "最終位置: ({:.1}, {:.1}) {}",
            self.final_position.x, self.final_position.y, self.final_zone
        );
        println!();

        println!("=== テレメトリ ===");
        match &self.telemetry {
            Some(status) => {
                println!("ブローカー: {} ({})", status.broker, if status.connected { "接続中" } else { "未接続" });
                println!(
                    "送信サイクル: {} 回 (未接続でスキップ {} 回)",
                    self.publish_cycles, self.skipped_cycles
                );
                println!("送信受付: {} 件 / 失敗 {} 件", self.publish_ok, self.publish_failed);
                println!("到達: {} 件 / 再接続 {} 回", status.delivered, status.reconnects);
            }
            None => println!("無効"),
        }
    }
}

pub struct SimulationEngine {
    pub current_time: f64,
    pub dt: f64,
    pub max_time: f64,
    pub step_count: u64,

    pub physics: VehiclePhysics,
    pub zones: ZoneResolver,
    pub control: ControlEngine,
    pub publisher: Option<TelemetryPublisher>,

    throttle: PublishThrottle,
    clock: TelemetryClock,
    transitions: Rc<RefCell<TransitionLog>>,
    /// 遷移記録用のシミュレーション時刻
    sim_clock: Rc<Cell<f64>>,
    summary: RunSummary,
    initialized: bool,

    pub scenario_config: ScenarioConfig,
    pub verbose_level: u8,
}

impl SimulationEngine {
    pub fn new(scenario: ScenarioConfig, verbose_level: u8) -> Self {
        let max_speed = scenario.vehicle.max_speed_kmh;
        let clock = if scenario.sim.realtime {
            TelemetryClock::Wall(Instant::now())
        } else {
            TelemetryClock::Simulated
        };

        Self {
            current_time: 0.0,
            dt: scenario.sim.dt_s,
            max_time: scenario.sim.t_max_s,
            step_count: 0,
            physics: VehiclePhysics::new(&scenario.vehicle),
            zones: ZoneResolver::from_config(&scenario.zones, max_speed),
            control: ControlEngine::new(scenario.control.tolerance_kmh, max_speed),
            publisher: None,
            throttle: PublishThrottle::new(scenario.telemetry.publish_interval()),
            clock,
            transitions: Rc::new(RefCell::new(TransitionLog::default())),
            sim_clock: Rc::new(Cell::new(0.0)),
            summary: RunSummary::default(),
            initialized: false,
            scenario_config: scenario,
            verbose_level,
        }
    }

    /// テレメトリパブリッシャーを接続する（接続済みのものを渡す）
    pub fn attach_publisher(&mut self, publisher: TelemetryPublisher) {
        self.publisher = Some(publisher);
    }

    /// 状態遷移リスナーを登録する
    pub fn initialize(&mut self) -> Result<(), SimulationError> {
        if self.initialized {
            return Err(SimulationError::AlreadyInitialized);
        }
        self.scenario_config.validate()?;

        self.control.add_listener(log_transition);

        let log = Rc::clone(&self.transitions);
        let clock = Rc::clone(&self.sim_clock);
        self.control.add_listener(move |t: &StateTransition| -> Result<(), ListenerError> {
            let mut log = log.try_borrow_mut().map_err(|e| ListenerError(e.to_string()))?;
            log.transitions.push((clock.get(), *t));
            Ok(())
        });

        self.initialized = true;
        if self.verbose_level > 0 {
            info!("シミュレーションエンジンを初期化しました");
            info!("  ゾーン: {}", self.zones.zones().len());
            info!("  リスナー: {}", self.control.listener_count());
            info!("  テレメトリ: {}", if self.publisher.is_some() { "有効" } else { "無効" });
        }
        Ok(())
    }

    /// 1ティック進める
    pub fn tick(&mut self, input: ControlInput, dt: f64) -> TickReport {
        let position = self.physics.position();
        let limit = self.zones.speed_limit_at(position.x, position.y);
        // 未一致の間はゾーンなし（制限速度は車両の最高速度）
        let (zone_id, zone_name, zone_color) = match self.zones.last_resolved() {
            Some(zone) => (Some(zone.id.clone()), zone.name.clone(), zone.color),
            None => (None, "Unknown Zone".to_string(), Rgb::WHITE),
        };
        let boundary_distance = self.zones.boundary_distance(position.x, position.y);

        let multiplier = self.control.get_acceleration_multiplier();
        let ceiling = match self.scenario_config.sim.speed_ceiling {
            SpeedCeilingMode::ZoneLimit => Some(limit),
            SpeedCeilingMode::VehicleMax => Some(self.physics.max_speed()),
            SpeedCeilingMode::Disabled => None,
        };

        self.physics.set_control_input(input);
        let (velocity, position) = self.physics.update(dt, ceiling, multiplier);
        if dt > 0.0 {
            self.current_time += dt;
        }
        self.step_count += 1;
        self.sim_clock.set(self.current_time);

        let control = self.control.evaluate(velocity, limit);

        TickReport {
            time: self.current_time,
            position,
            velocity,
            heading: self.physics.heading(),
            zone_id,
            zone_name,
            zone_color,
            zone_limit: limit,
            boundary_distance,
            control,
            state_color: control.color(),
            telemetry_connected: self.publisher.as_ref().is_some_and(|p| p.is_connected()),
        }
    }

    /// 送信間隔が経過していればテレメトリを送信する
    ///
    /// 送信したサイクルなら true。
    pub fn maybe_publish(&mut self, report: &TickReport) -> bool {
        let Some(publisher) = &self.publisher else {
            return false;
        };
        let now = match self.clock {
            TelemetryClock::Wall(origin) => origin.elapsed(),
            TelemetryClock::Simulated => Duration::from_secs_f64(self.current_time.max(0.0)),
        };
        if !self.throttle.ready(now) {
            return false;
        }

        if publisher.is_connected() {
            let (lat, lon) = report.position.to_simulated_gps();
            let results = [
                publisher.publish_location(lat, lon),
                publisher.publish_speed(report.velocity, report.zone_limit),
                publisher.publish_state(report.control.state, Some(report.state_color)),
            ];
            let ok = results.iter().filter(|r| **r).count() as u64;
            self.summary.publish_ok += ok;
            self.summary.publish_failed += results.len() as u64 - ok;
            self.summary.publish_cycles += 1;
            if ok as usize == results.len() {
                debug!(
                    "テレメトリ送信: lat {:.4} lon {:.4} / {:.1} km/h (制限 {:.0}) / {}",
                    lat, lon, report.velocity, report.zone_limit, report.control.state
                );
            } else {
                warn!("テレメトリの一部の送信に失敗しました ({}/{})", ok, results.len());
            }
        } else {
            self.summary.skipped_cycles += 1;
            debug!("未接続のためテレメトリ送信をスキップ");
        }

        self.throttle.mark(now);
        true
    }

    /// 車両と制御エンジンを初期状態へ戻す（リスナーとゾーン履歴は保持）
    pub fn reset(&mut self) {
        self.physics.reset();
        self.control.reset();
        self.summary.resets += 1;
        info!("車両をリセットしました");
    }

    /// 運転スクリプトを最大時間まで実行する
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        if !self.initialized {
            self.initialize()?;
        }
        // 初期化後に書き換えられた値も確認する
        if !(self.dt.is_finite() && self.dt > 0.0 && self.max_time.is_finite()) {
            return Err(SimulationError::Scenario(ScenarioError::ValidationError(format!(
                "invalid time step {} / max time {}",
                self.dt, self.max_time
            ))));
        }
        info!("=== シミュレーション実行開始 ===");

        let mut cursor = DriveCursor::new(self.scenario_config.drive.clone());
        let realtime = self.scenario_config.sim.realtime;
        let mut last_report = None;

        while self.current_time < self.max_time {
            let tick_started = Instant::now();
            let (input, reset) = cursor.input_at(self.current_time);
            if reset {
                self.reset();
            }

            let report = self.tick(input, self.dt);
            *self.summary.time_in_state.entry(report.control.state).or_insert(0.0) += self.dt;
            self.summary.max_overspeed = self.summary.max_overspeed.max(report.control.overspeed);
            self.summary.max_velocity = self.summary.max_velocity.max(report.velocity);
            self.maybe_publish(&report);

            if self.verbose_level > 2 {
                trace!(
                    "t={:.3} v={:.2} h={:.1} {} {}",
                    report.time, report.velocity, report.heading, report.zone_name, report.control.state
                );
            }
            if self.verbose_level > 1 && self.step_count % 100 == 0 {
                debug!(
                    "時刻 {:.1}秒: {:.1} km/h / 制限 {:.0} km/h [{}] {} 係数 {:.2}",
                    report.time,
                    report.velocity,
                    report.zone_limit,
                    report.zone_name,
                    report.control.state,
                    report.control.regulation_factor
                );
            }

            if realtime {
                let target = Duration::from_secs_f64(self.dt);
                if let Some(remaining) = target.checked_sub(tick_started.elapsed()) {
                    thread::sleep(remaining);
                }
            }
            last_report = Some(report);
        }

        self.summary.steps = self.step_count;
        self.summary.sim_time = self.current_time;
        self.summary.transitions = self.transitions.borrow().transitions.len();
        if let Some(report) = last_report {
            self.summary.final_zone = report.zone_name;
            self.summary.final_position = report.position;
        }
        self.summary.telemetry = self.publisher.as_ref().map(|p| p.status());

        info!("=== シミュレーション完了 ===");
        info!("実行時間: {:.1}秒", self.current_time);
        info!("総ステップ数: {}", self.step_count);

        Ok(self.summary.clone())
    }

    /// これまでの状態遷移
    pub fn transitions(&self) -> Vec<(f64, StateTransition)> {
        self.transitions.borrow().transitions.clone()
    }
}

/// 状態遷移をログに出すリスナー（音声通知の代わり）
fn log_transition(t: &StateTransition) -> Result<(), ListenerError> {
    match t.new_state {
        SpeedState::Warning => {
            warn!("WARNING: 速度 {:.1} km/h が制限 {:.0} km/h を超えています", t.speed, t.limit)
        }
        SpeedState::Regulating => {
            warn!("REGULATING: 速度 {:.1} km/h が制限 {:.0} km/h を大きく超えています", t.speed, t.limit)
        }
        SpeedState::Normal => info!("NORMAL: 速度 {:.1} km/h は制限内です", t.speed),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_scenario() -> ScenarioConfig {
        let mut config = ScenarioConfig::default();
        config.telemetry.enabled = false;
        config
    }

    #[test]
    fn test_throttle() {
        let mut throttle = PublishThrottle::new(Duration::from_millis(500));
        assert!(throttle.ready(Duration::ZERO));
        throttle.mark(Duration::from_millis(100));
        assert!(!throttle.ready(Duration::from_millis(599)));
        assert!(throttle.ready(Duration::from_millis(600)));
    }

    #[test]
    fn test_drive_cursor() {
        let mut cursor = DriveCursor::new(vec![
            DriveSegment { duration_s: 1.0, acceleration: 1.0, ..Default::default() },
            DriveSegment { duration_s: 1.0, braking: true, reset: true, ..Default::default() },
        ]);
        let (input, reset) = cursor.input_at(0.5);
        assert_eq!(input.acceleration, 1.0);
        assert!(!reset);

        let (input, reset) = cursor.input_at(1.0);
        assert!(input.braking);
        assert!(reset);
        let (_, reset) = cursor.input_at(1.5);
        assert!(!reset);

        let (input, _) = cursor.input_at(5.0);
        assert_eq!(input, ControlInput::default());
    }

    #[test]
    fn test_zero_length_reset_segment() {
        let mut cursor = DriveCursor::new(vec![
            DriveSegment { duration_s: 2.0, acceleration: 1.0, ..Default::default() },
            DriveSegment { duration_s: 0.0, reset: true, ..Default::default() },
            DriveSegment { duration_s: 2.0, acceleration: 1.0, ..Default::default() },
        ]);
        assert!(!cursor.input_at(1.9).1);
        let (input, reset) = cursor.input_at(2.0);
        assert!(reset);
        assert_eq!(input.acceleration, 1.0);
        assert!(!cursor.input_at(2.1).1);

        // 末尾の長さ 0 の区間
        let mut cursor = DriveCursor::new(vec![
            DriveSegment { duration_s: 1.0, ..Default::default() },
            DriveSegment { duration_s: 0.0, reset: true, ..Default::default() },
        ]);
        assert!(!cursor.input_at(0.5).1);
        assert!(cursor.input_at(1.0).1);
        assert!(!cursor.input_at(1.5).1);
    }

    #[test]
    fn test_run_applies_zero_length_reset() {
        let mut config = quiet_scenario();
        config.sim.dt_s = 0.0625;
        config.sim.t_max_s = 4.0;
        config.drive = vec![
            DriveSegment { duration_s: 2.0, acceleration: 1.0, ..Default::default() },
            DriveSegment { duration_s: 0.0, reset: true, ..Default::default() },
            DriveSegment { duration_s: 2.0, acceleration: 1.0, ..Default::default() },
        ];
        let mut engine = SimulationEngine::new(config, 0);
        let summary = engine.run().unwrap();
        assert_eq!(summary.resets, 1);
        // リセット後 2 秒の全開加速のみ
        assert!(engine.physics.velocity() <= 60.0 + 1e-9);
    }

    #[test]
    fn test_tick_feeds_regulation_back() {
        let mut engine = SimulationEngine::new(quiet_scenario(), 0);
        engine.initialize().unwrap();

        let full = ControlInput::new(1.0, 0.0, false);
        let mut saw_regulating = false;
        for _ in 0..600 {
            let report = engine.tick(full, 0.016);
            assert!((0.0..=1.0).contains(&report.control.regulation_factor));
            assert!(report.velocity >= 0.0 && report.velocity <= 120.0);
            if report.control.state == SpeedState::Regulating {
                saw_regulating = true;
            }
        }
        assert!(saw_regulating);
        // 規制係数のフィードバックで最高速度には届かない
        assert!(engine.physics.velocity() < 120.0);
        assert!(!engine.transitions().is_empty());
    }

    #[test]
    fn test_report_before_any_zone_match() {
        let mut config = quiet_scenario();
        config.vehicle.initial_position.x_m = -500.0;
        let mut engine = SimulationEngine::new(config, 0);
        engine.initialize().unwrap();

        let report = engine.tick(ControlInput::default(), 0.016);
        assert_eq!(report.zone_id, None);
        assert_eq!(report.zone_name, "Unknown Zone");
        assert_eq!(report.zone_color, Rgb::WHITE);
        assert_eq!(report.zone_limit, 120.0);
        assert_eq!(report.boundary_distance, f64::INFINITY);
    }

    #[test]
    fn test_report_zone_matches_limit() {
        let mut engine = SimulationEngine::new(quiet_scenario(), 0);
        engine.initialize().unwrap();
        let report = engine.tick(ControlInput::default(), 0.016);
        assert_eq!(report.zone_id.as_deref(), Some("school"));
        assert_eq!(report.zone_limit, 50.0);
        assert_eq!(report.boundary_distance, 0.0);
    }

    #[test]
    fn test_time_in_state_uses_tick_result() {
        let mut config = quiet_scenario();
        config.sim.dt_s = 0.5;
        config.sim.t_max_s = 1.0;
        config.sim.speed_ceiling = SpeedCeilingMode::Disabled;
        config.vehicle.acceleration_kmh_s = 110.0;
        config.drive = vec![DriveSegment { duration_s: 1.0, acceleration: 1.0, ..Default::default() }];
        let mut engine = SimulationEngine::new(config, 0);
        let summary = engine.run().unwrap();

        // 1ティック目で 55 km/h (WARNING)、2ティック目は係数 0.5 で 82.5 km/h (REGULATING)
        assert_eq!(summary.time_in_state.get(&SpeedState::Warning), Some(&0.5));
        assert_eq!(summary.time_in_state.get(&SpeedState::Regulating), Some(&0.5));
        assert_eq!(summary.time_in_state.get(&SpeedState::Normal), None);
    }

    #[test]
    fn test_run_rejects_non_advancing_step() {
        let mut engine = SimulationEngine::new(quiet_scenario(), 0);
        engine.initialize().unwrap();
        engine.dt = f64::NAN;
        assert!(matches!(engine.run(), Err(SimulationError::Scenario(_))));
    }

    #[test]
    fn test_reset_restores_vehicle_and_control() {
        let mut engine = SimulationEngine::new(quiet_scenario(), 0);
        engine.initialize().unwrap();
        for _ in 0..300 {
            engine.tick(ControlInput::new(1.0, 0.2, false), 0.016);
        }
        engine.reset();
        assert_eq!(engine.physics.velocity(), 0.0);
        assert_eq!(engine.control.current_state(), SpeedState::Normal);
        assert_eq!(engine.control.get_acceleration_multiplier(), 1.0);
        assert_eq!(engine.control.listener_count(), 2);
    }

    #[test]
    fn test_double_initialize_rejected() {
        let mut engine = SimulationEngine::new(quiet_scenario(), 0);
        engine.initialize().unwrap();
        assert!(matches!(engine.initialize(), Err(SimulationError::AlreadyInitialized)));
    }

    #[test]
    fn test_run_without_telemetry() {
        let mut config = quiet_scenario();
        config.sim.t_max_s = 5.0;
        config.sim.dt_s = 0.0625;
        let mut engine = SimulationEngine::new(config, 0);
        let summary = engine.run().unwrap();

        assert_eq!(summary.steps, 80);
        assert!(summary.telemetry.is_none());
        assert_eq!(summary.publish_cycles, 0);
        let total: f64 = summary.time_in_state.values().sum();
        assert!((total - 5.0).abs() < 1e-6);
    }
}
