use crate::models::{
    common::{math_utils, Position3D},
    traits::IResettable,
};
use crate::scenario::VehicleConfig;

/// 1ティック分の運転入力
///
/// 範囲外の値はエラーにせず [-1, 1] に丸めます。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlInput {
    /// -1（減速）〜 1（加速）
    pub acceleration: f64,
    /// -1（左）〜 1（右）
    pub steering: f64,
    pub braking: bool,
}

impl ControlInput {
    pub fn new(acceleration: f64, steering: f64, braking: bool) -> Self {
        Self {
            acceleration: clamp_unit(acceleration),
            steering: clamp_unit(steering),
            braking,
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(-1.0, 1.0) }
}

/// 車両の運動状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleKinematics {
    pub position: Position3D,
    /// km/h、常に [0, max_speed]
    pub velocity: f64,
    /// 度、常に [0, 360)
    pub heading: f64,
    /// 度/秒（操舵がないときは呼び出しごとに減衰）
    pub heading_rate: f64,
}

impl VehicleKinematics {
    fn at_rest(position: Position3D) -> Self {
        Self {
            position,
            velocity: 0.0,
            heading: 0.0,
            heading_rate: 0.0,
        }
    }
}

/// 車両の縦方向・方位の簡易運動モデル
///
/// 運動状態は `update` でのみ変更されます。各呼び出しで次の優先順に
/// 縦方向速度を決めます：
///
/// 1. ブレーキ中: ブレーキ減速
/// 2. 加速入力 > 0: 加速（規制係数を乗算、最高速度で頭打ち）
/// 3. 加速入力 < 0: 通常減速
/// 4. 入力なし: 転がり抵抗による減速
///
/// その後、ソフト速度上限の超過分に応じた追加減速、操舵による方位更新、
/// 方位ベクトル方向への位置更新を行います。
#[derive(Debug, Clone)]
pub struct VehiclePhysics {
    params: VehicleConfig,
    initial_position: Position3D,
    state: VehicleKinematics,
    input: ControlInput,
}

impl VehiclePhysics {
    pub fn new(params: &VehicleConfig) -> Self {
        let initial_position: Position3D = params.initial_position.into();
        Self {
            params: params.clone(),
            initial_position,
            state: VehicleKinematics::at_rest(initial_position),
            input: ControlInput::default(),
        }
    }

    /// 運転入力を設定（加速・操舵は [-1, 1] に丸める）
    pub fn set_inputs(&mut self, acceleration: f64, steering: f64, braking: bool) {
        self.input = ControlInput::new(acceleration, steering, braking);
    }

    pub fn set_control_input(&mut self, input: ControlInput) {
        self.set_inputs(input.acceleration, input.steering, input.braking);
    }

    /// `dt` 秒だけ状態を進める
    ///
    /// # 引数
    ///
    /// * `dt` - 経過時間（秒）。0以下の場合は何もせず現在値を返す
    /// * `speed_ceiling` - ソフト速度上限 (km/h)
    /// * `acceleration_multiplier` - 加速入力に掛ける規制係数（0〜1）
    ///
    /// # 戻り値
    ///
    /// 更新後の (速度 km/h, 位置)
    pub fn update(
        &mut self,
        dt: f64,
        speed_ceiling: Option<f64>,
        acceleration_multiplier: f64,
    ) -> (f64, Position3D) {
        if !(dt > 0.0) {
            return (self.state.velocity, self.state.position);
        }

        let p = &self.params;
        let input = self.input;
        let mut velocity = self.state.velocity;

        if input.braking {
            velocity = (velocity - p.deceleration_brake_kmh_s * dt).max(0.0);
        } else if input.acceleration > 0.0 {
            let multiplier = acceleration_multiplier.clamp(0.0, 1.0);
            let accel = p.acceleration_kmh_s * input.acceleration * multiplier * dt;
            velocity = (velocity + accel).min(p.max_speed_kmh);
        } else if input.acceleration < 0.0 {
            let decel = p.deceleration_normal_kmh_s * input.acceleration.abs() * dt;
            velocity = (velocity - decel).max(0.0);
        } else {
            velocity = (velocity - p.friction_kmh_s * dt).max(0.0);
        }

        // 上限付近で振動しながら超過が続く挙動は REGULATING の維持に必要なので、
        // 上限値ちょうどへのクランプはしない
        if let Some(ceiling) = speed_ceiling {
            if velocity > ceiling {
                let overspeed = velocity - ceiling;
                let scale = (overspeed / p.overspeed_scale_kmh).min(1.0);
                let decel = p.overspeed_decel_rate() * scale * dt;
                velocity = (velocity - decel).max(ceiling * p.ceiling_floor_ratio);
            }
        }

        self.state.velocity = velocity.clamp(0.0, p.max_speed_kmh);

        if input.steering.abs() > p.steering_deadband {
            self.state.heading_rate = p.steering_rate_deg_s * input.steering;
        } else {
            self.state.heading_rate *= p.heading_damping;
        }
        self.state.heading =
            math_utils::wrap_heading(self.state.heading + self.state.heading_rate * dt);

        let distance = math_utils::kmh_to_mps(self.state.velocity) * dt;
        let heading_rad = self.state.heading.to_radians();
        self.state.position.x += distance * heading_rad.cos();
        self.state.position.y += distance * heading_rad.sin();

        (self.state.velocity, self.state.position)
    }

    pub fn kinematics(&self) -> VehicleKinematics {
        self.state
    }

    pub fn velocity(&self) -> f64 {
        self.state.velocity
    }

    pub fn position(&self) -> Position3D {
        self.state.position
    }

    pub fn heading(&self) -> f64 {
        self.state.heading
    }

    pub fn inputs(&self) -> ControlInput {
        self.input
    }

    pub fn max_speed(&self) -> f64 {
        self.params.max_speed_kmh
    }
}

impl IResettable for VehiclePhysics {
    fn reset(&mut self) {
        self.state = VehicleKinematics::at_rest(self.initial_position);
        self.input = ControlInput::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn physics() -> VehiclePhysics {
        VehiclePhysics::new(&VehicleConfig::default())
    }

    #[test]
    fn test_full_throttle_one_second() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        let (v, pos) = p.update(1.0, None, 1.0);
        assert!((v - 30.0).abs() < EPS);
        assert!((pos.x - 30.0 / 3.6).abs() < EPS);
        assert!(pos.y.abs() < EPS);
    }

    #[test]
    fn test_acceleration_capped_at_max_speed() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        for _ in 0..10 {
            p.update(1.0, None, 1.0);
        }
        assert_eq!(p.velocity(), 120.0);
    }

    #[test]
    fn test_multiplier_scales_acceleration() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        let (v, _) = p.update(1.0, None, 0.5);
        assert!((v - 15.0).abs() < EPS);

        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        let (v, _) = p.update(1.0, None, 0.0);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_braking_has_priority_and_floors_at_zero() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        p.update(1.0, None, 1.0);
        p.set_inputs(1.0, 0.0, true);
        let (v, _) = p.update(0.5, None, 1.0);
        assert!((v - 10.0).abs() < EPS);
        let (v, _) = p.update(1.0, None, 1.0);
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_reverse_input_and_friction() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        p.update(1.0, None, 1.0);

        p.set_inputs(-0.5, 0.0, false);
        let (v, _) = p.update(1.0, None, 1.0);
        assert!((v - 22.5).abs() < EPS);

        p.set_inputs(0.0, 0.0, false);
        let (v, _) = p.update(1.0, None, 1.0);
        assert!((v - 17.5).abs() < EPS);
    }

    #[test]
    fn test_soft_ceiling_decel() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        p.update(2.0, None, 1.0); // 60 km/h
        p.set_inputs(0.0, 0.0, false);
        // 60 - 5*0.1 = 59.5, 上限 50 を 9.5 超過
        let (v, _) = p.update(0.1, Some(50.0), 1.0);
        let expected = 59.5 - 12.5 * 0.95 * 0.1;
        assert!((v - expected).abs() < EPS);
        assert!(v > 50.0);
    }

    #[test]
    fn test_soft_ceiling_floor() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        p.update(2.0, None, 1.0); // 60 km/h
        // 大きな dt でも上限の 95% を下回らない
        let (v, _) = p.update(10.0, Some(20.0), 1.0);
        assert!((v - 19.0).abs() < EPS);
    }

    #[test]
    fn test_sustained_throttle_stays_above_ceiling() {
        let mut p = physics();
        p.set_inputs(1.0, 0.0, false);
        p.update(3.0, None, 1.0); // 90 km/h
        for _ in 0..1000 {
            p.update(0.016, Some(60.0), 1.0);
        }
        assert!(p.velocity() > 60.0);
    }

    #[test]
    fn test_steering_and_damping() {
        let mut p = physics();
        p.set_inputs(0.0, 1.0, false);
        p.update(0.5, None, 1.0);
        assert!((p.heading() - 45.0).abs() < EPS);

        p.set_inputs(0.0, 0.0, false);
        p.update(0.5, None, 1.0);
        assert!((p.kinematics().heading_rate - 72.0).abs() < EPS);
        assert!((p.heading() - 81.0).abs() < EPS);
    }

    #[test]
    fn test_heading_wraps() {
        let mut p = physics();
        p.set_inputs(0.0, -1.0, false);
        for _ in 0..37 {
            p.update(0.13, None, 1.0);
            let h = p.heading();
            assert!((0.0..360.0).contains(&h), "heading {h}");
        }
        p.set_inputs(0.0, 1.0, false);
        for _ in 0..100 {
            p.update(0.7, None, 1.0);
            let h = p.heading();
            assert!((0.0..360.0).contains(&h), "heading {h}");
        }
    }

    #[test]
    fn test_non_positive_dt_is_noop() {
        let mut p = physics();
        p.set_inputs(0.0, 1.0, false);
        p.update(0.1, None, 1.0);
        let before = p.kinematics();
        p.set_inputs(1.0, 1.0, false);
        p.update(0.0, None, 1.0);
        p.update(-1.0, None, 1.0);
        p.update(f64::NAN, None, 1.0);
        assert_eq!(p.kinematics(), before);
    }

    #[test]
    fn test_inputs_are_clamped() {
        let mut p = physics();
        p.set_inputs(3.0, -7.5, true);
        assert_eq!(p.inputs(), ControlInput { acceleration: 1.0, steering: -1.0, braking: true });
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut p = physics();
        p.set_inputs(1.0, 0.4, false);
        for _ in 0..20 {
            p.update(0.1, None, 1.0);
        }
        p.reset();
        let once = p.kinematics();
        p.reset();
        assert_eq!(p.kinematics(), once);
        assert_eq!(once.velocity, 0.0);
        assert_eq!(once.heading, 0.0);
        assert_eq!(once.position, Position3D::new(0.0, 0.0, 0.0));
        assert_eq!(p.inputs(), ControlInput::default());
    }
}
