//! テレメトリイベント
//!
//! 異常検知・閾値違反をブロードキャストバスに発行するための型。
//! エンジンはイベントを発行するだけで、特定のシンクへは配送しない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::threshold::ThresholdViolation;

/// イベントチャンネル容量
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// テレメトリイベント
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// 異常検知
    AnomalyDetected {
        /// イベントID
        id: String,
        /// メトリクス名
        metric_name: String,
        /// 観測値
        value: f64,
        /// Z-score
        z_score: f64,
        /// タイムスタンプ
        timestamp: DateTime<Utc>,
    },
    /// 閾値違反
    ThresholdViolation {
        /// 違反レコード
        violation: ThresholdViolation,
    },
}

impl TelemetryEvent {
    /// イベントが属するメトリクス名
    pub fn metric_name(&self) -> &str {
        match self {
            Self::AnomalyDetected { metric_name, .. } => metric_name,
            Self::ThresholdViolation { violation } => &violation.metric_name,
        }
    }
}
