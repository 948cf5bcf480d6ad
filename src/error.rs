use thiserror::Error;

/// ライブラリ全体で使うエラー型。
#[derive(Debug, Error)]
pub enum PinnError {
    /// 設定の矛盾（名前の重複、範囲外のハイパーパラメータなど）
    #[error("設定エラー: {0}")]
    Config(String),

    /// 入力・出力・データ列のいずれにも存在しないフィールド
    #[error("未定義のフィールド '{0}'")]
    UnknownField(String),

    #[error("形状の不一致: {0}")]
    Shape(String),

    #[error("未対応の微分: {0}")]
    UnsupportedDerivative(String),

    #[error("ジオメトリエラー: {0}")]
    Geometry(String),

    #[error("データエラー: {0}")]
    Data(String),

    #[error("チェックポイントエラー: {0}")]
    Checkpoint(String),

    #[error("描画エラー: {0}")]
    Plot(String),

    /// 動作確認の学習で異常な値が出た
    #[error("動作確認に失敗しました: {0}")]
    Check(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PinnError>;
