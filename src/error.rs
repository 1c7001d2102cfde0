//! Error types for the telemetry engine.

use thiserror::Error;

/// Result type alias for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// テレメトリエンジンのエラー型
///
/// 設定は `configure_*` 呼び出し時に即座に検証される。クエリ系 API は
/// 未設定・データ不足をエラーにせず `None` / 空で返す。
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// 不正な設定
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// 不正なメトリクス
    #[error("Invalid metric: {0}")]
    InvalidMetric(String),
}
