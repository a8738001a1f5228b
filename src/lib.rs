//! # speedsim
//!
//! ジオフェンスで区切られた速度制限ゾーンを走る車両のシミュレーターです。
//! 制限速度を超えると加速を規制し、位置・速度・制御状態をブローカーへ送信します。
//!
//! - [`models`]: 物理演算、ゾーン判定、速度制御の状態機械
//! - [`telemetry`]: テレメトリのワイヤ形式、トランスポート、パブリッシャー
//! - [`simulation`]: ティックを駆動するシミュレーションドライバー
//! - [`scenario`]: YAML シナリオ設定
//! - [`logging`]: ログ出力の初期化

pub mod logging;
pub mod models;
pub mod scenario;
pub mod simulation;
pub mod telemetry;
