use crate::models::control::StateTransition;

/// 初期状態に戻せるコンポーネントのインターフェース
pub trait IResettable {
    /// 構築時の初期状態へ戻す
    fn reset(&mut self);
}

/// 制御状態の遷移通知を受け取るリスナーのインターフェース
///
/// 失敗は `Err` で返すか panic で表現できます。どちらの場合も
/// 制御エンジンは記録だけして残りのリスナーの呼び出しを続けます。
pub trait IStateListener {
    /// 状態遷移時に1回だけ呼び出される
    fn on_state_change(&self, transition: &StateTransition) -> Result<(), ListenerError>;
}

impl<F> IStateListener for F
where
    F: Fn(&StateTransition) -> Result<(), ListenerError>,
{
    fn on_state_change(&self, transition: &StateTransition) -> Result<(), ListenerError> {
        self(transition)
    }
}

/// リスナー処理の失敗
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);
