use serde::{Deserialize, Serialize};

/// 3次元位置を表す構造体
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64, // m
    pub y: f64, // m
    pub z: f64, // m（運動モデルでは変化しない）
}

impl Position3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// 擬似GPS座標 (緯度, 経度) に変換
    ///
    /// 測地投影ではなく、x と y をそれぞれ 1000 で割るだけの固定線形スケールです。
    pub fn to_simulated_gps(&self) -> (f64, f64) {
        (self.x / 1000.0, self.y / 1000.0)
    }
}

/// 表示用の色（各成分 0.0〜1.0）
///
/// YAML では `[r, g, b]` の配列として記述します。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgb(pub f64, pub f64, pub f64);

impl Rgb {
    pub const WHITE: Rgb = Rgb(1.0, 1.0, 1.0);
    pub const GREEN: Rgb = Rgb(0.0, 1.0, 0.0);
    pub const YELLOW: Rgb = Rgb(1.0, 1.0, 0.0);
    pub const RED: Rgb = Rgb(1.0, 0.0, 0.0);

    /// 0〜255 の整数成分に変換（切り捨て）
    pub fn to_bytes(&self) -> (u8, u8, u8) {
        fn channel(value: f64) -> u8 {
            (value.clamp(0.0, 1.0) * 255.0) as u8
        }
        (channel(self.0), channel(self.1), channel(self.2))
    }
}

/// 数学ユーティリティ関数
pub mod math_utils {
    /// km/h を m/s に変換
    pub fn kmh_to_mps(kmh: f64) -> f64 {
        kmh / 3.6
    }

    /// 方位角を 0度以上 360度未満に正規化
    pub fn wrap_heading(angle_deg: f64) -> f64 {
        let wrapped = angle_deg.rem_euclid(360.0);
        // rem_euclid は -1e-14 のような値で 360.0 を返すことがある
        if wrapped >= 360.0 { 0.0 } else { wrapped }
    }

    /// 小数点以下 `places` 桁に丸める
    pub fn round_to(value: f64, places: i32) -> f64 {
        let factor = 10f64.powi(places);
        (value * factor).round() / factor
    }
}
