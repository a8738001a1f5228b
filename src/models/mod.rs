// 基本的なデータ型と数学ユーティリティ
pub mod common;

// コンポーネントの基本インターフェース（trait）定義
pub mod traits;

// 制御ループの各コンポーネント
pub mod physics;
pub mod zone;
pub mod control;

// 便利な re-export
pub use common::*;
pub use traits::*;
pub use physics::{ControlInput, VehicleKinematics, VehiclePhysics};
pub use zone::{Zone, ZoneResolver};
pub use control::{
    classify, regulation_factor, ControlEngine, ControlStateSnapshot, SpeedState, StateTransition,
};
