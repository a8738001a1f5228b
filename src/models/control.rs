use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::models::{
    common::Rgb,
    traits::{IResettable, IStateListener},
};

/// 速度制御の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpeedState {
    /// 制限速度以内
    Normal,
    /// 許容超過量以内の超過
    Warning,
    /// 許容超過量を超えた超過（加速を規制）
    Regulating,
}

impl SpeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedState::Normal => "NORMAL",
            SpeedState::Warning => "WARNING",
            SpeedState::Regulating => "REGULATING",
        }
    }

    /// HUD・LED 表示用の色
    pub fn display_color(&self) -> Rgb {
        match self {
            SpeedState::Normal => Rgb::GREEN,
            SpeedState::Warning => Rgb::YELLOW,
            SpeedState::Regulating => Rgb::RED,
        }
    }
}

impl fmt::Display for SpeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 超過量から状態を分類する（前回状態に依存しない純関数）
pub fn classify(speed: f64, limit: f64, tolerance: f64) -> SpeedState {
    let overspeed = speed - limit;
    if overspeed > tolerance {
        SpeedState::Regulating
    } else if overspeed > 0.0 {
        SpeedState::Warning
    } else {
        SpeedState::Normal
    }
}

/// 分類済みの状態から規制係数を求める
///
/// REGULATING では超過量が許容量の2倍に近づくにつれて 1 から 0 へ線形に下がります。
pub fn regulation_factor(state: SpeedState, overspeed: f64, tolerance: f64) -> f64 {
    match state {
        SpeedState::Regulating => (1.0 - overspeed / (2.0 * tolerance)).clamp(0.0, 1.0),
        SpeedState::Warning => 0.5,
        SpeedState::Normal => 1.0,
    }
}

/// ある時点の制御状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlStateSnapshot {
    pub state: SpeedState,
    /// 0〜1
    pub regulation_factor: f64,
    /// max(0, speed - limit)
    pub overspeed: f64,
    pub speed: f64,
    pub limit: f64,
}

impl ControlStateSnapshot {
    /// 速度と制限速度から毎回ゼロから計算する
    pub fn evaluate(speed: f64, limit: f64, tolerance: f64) -> Self {
        let state = classify(speed, limit, tolerance);
        let raw_overspeed = speed - limit;
        Self {
            state,
            regulation_factor: regulation_factor(state, raw_overspeed, tolerance),
            overspeed: raw_overspeed.max(0.0),
            speed,
            limit,
        }
    }

    fn initial(limit: f64) -> Self {
        Self {
            state: SpeedState::Normal,
            regulation_factor: 1.0,
            overspeed: 0.0,
            speed: 0.0,
            limit,
        }
    }

    pub fn color(&self) -> Rgb {
        self.state.display_color()
    }
}

/// 状態遷移の通知内容
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateTransition {
    pub old_state: SpeedState,
    pub new_state: SpeedState,
    pub speed: f64,
    pub limit: f64,
}

/// 速度制御エンジン
///
/// 分類は毎回 `ControlStateSnapshot::evaluate` で行い、ヒステリシスは持ちません。
/// エンジン自身が保持するのは遷移検出用の前回状態だけで、状態が変わったときに
/// 登録順にリスナーへ1回ずつ通知します。
///
/// リスナーの登録はセットアップ時に行う想定で、評価と並行した登録はサポートしません。
pub struct ControlEngine {
    tolerance: f64,
    /// リセット時の制限速度（車両の最高速度）
    default_limit: f64,
    snapshot: ControlStateSnapshot,
    previous_state: SpeedState,
    listeners: Vec<Box<dyn IStateListener>>,
    listener_failures: u64,
}

impl ControlEngine {
    /// 前回状態は NORMAL から始まるため、最初の評価が NORMAL のときは通知しません。
    /// 最初の評価が WARNING / REGULATING なら NORMAL からの遷移として通知します。
    pub fn new(tolerance: f64, default_limit: f64) -> Self {
        Self {
            tolerance,
            default_limit,
            snapshot: ControlStateSnapshot::initial(default_limit),
            previous_state: SpeedState::Normal,
            listeners: Vec::new(),
            listener_failures: 0,
        }
    }

    /// 状態遷移リスナーを登録
    pub fn add_listener<L>(&mut self, listener: L)
    where
        L: IStateListener + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// 速度と制限速度から状態を再評価する
    pub fn evaluate(&mut self, speed: f64, limit: f64) -> ControlStateSnapshot {
        let snapshot = ControlStateSnapshot::evaluate(speed, limit, self.tolerance);
        self.snapshot = snapshot;

        if snapshot.state != self.previous_state {
            let transition = StateTransition {
                old_state: self.previous_state,
                new_state: snapshot.state,
                speed,
                limit,
            };
            self.previous_state = snapshot.state;
            debug!("制御状態遷移: {} -> {}", transition.old_state, transition.new_state);
            self.notify(&transition);
        }

        snapshot
    }

    fn notify(&mut self, transition: &StateTransition) {
        let mut failures = 0;
        for (index, listener) in self.listeners.iter().enumerate() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_state_change(transition)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("状態遷移リスナー #{} の処理に失敗: {}", index, e);
                }
                Err(_) => {
                    failures += 1;
                    error!("状態遷移リスナー #{} が panic しました", index);
                }
            }
        }
        self.listener_failures += failures;
    }

    /// 次回の物理更新に渡す加速係数
    pub fn get_acceleration_multiplier(&self) -> f64 {
        self.snapshot.regulation_factor
    }

    pub fn snapshot(&self) -> ControlStateSnapshot {
        self.snapshot
    }

    pub fn current_state(&self) -> SpeedState {
        self.snapshot.state
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn listener_failures(&self) -> u64 {
        self.listener_failures
    }
}

impl IResettable for ControlEngine {
    /// 状態を NORMAL / 係数 1.0 に戻す（リスナーは保持）
    ///
    /// 前回状態も NORMAL に戻るため、リセット直後の評価が NORMAL なら通知は発生しません。
    fn reset(&mut self) {
        self.snapshot = ControlStateSnapshot::initial(self.default_limit);
        self.previous_state = SpeedState::Normal;
    }
}
