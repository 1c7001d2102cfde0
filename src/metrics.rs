//! メトリクス型定義
//!
//! テレメトリエンジンが扱う不変の値オブジェクト群

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, TelemetryError};

/// メトリクスの種類
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// カウンター（累積回数）
    Counter,
    /// ゲージ（瞬時値）
    Gauge,
    /// タイマー（ms）
    Timer,
    /// メモリ使用量（MB）
    Memory,
    /// カスタムメトリクス
    Custom(String),
}

impl MetricKind {
    /// 種類名を取得
    pub fn name(&self) -> &str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Timer => "timer",
            Self::Memory => "memory",
            Self::Custom(name) => name,
        }
    }

    /// 既定の単位を取得
    pub fn default_unit(&self) -> &str {
        match self {
            Self::Counter => "count",
            Self::Gauge => "",
            Self::Timer => "ms",
            Self::Memory => "MB",
            Self::Custom(_) => "",
        }
    }
}

/// 単一のサンプル（タイムスタンプ付きスカラー観測値）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// 値
    pub value: f64,
    /// タイムスタンプ
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// 現在時刻のサンプルを作成
    pub fn new(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    /// タイムスタンプを指定してサンプルを作成
    pub fn at(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// メトリクス値
///
/// 計測対象コードが `MetricsEngine::record` に渡す読み取り専用の値。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// メトリクス名（一意キー）
    pub name: String,
    /// 値
    pub value: f64,
    /// タイムスタンプ
    pub timestamp: DateTime<Utc>,
    /// 種類
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<MetricKind>,
    /// 単位
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// タグ（ラベル）
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl Metric {
    /// 新しいメトリクスを作成
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: Utc::now(),
            kind: None,
            unit: None,
            tags: HashMap::new(),
        }
    }

    /// 処理時間メトリクス（ms）を作成
    pub fn timing(name: impl Into<String>, millis: f64) -> Self {
        Self::new(name, millis).with_kind(MetricKind::Timer)
    }

    /// カウンターメトリクスを作成
    pub fn counter(name: impl Into<String>, count: f64) -> Self {
        Self::new(name, count).with_kind(MetricKind::Counter)
    }

    /// ゲージメトリクスを作成
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value).with_kind(MetricKind::Gauge)
    }

    /// メモリ使用量メトリクス（MB）を作成
    pub fn memory(name: impl Into<String>, megabytes: f64) -> Self {
        Self::new(name, megabytes).with_kind(MetricKind::Memory)
    }

    /// カスタムタイムスタンプを設定
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 種類を設定（単位が未設定なら既定単位も補完）
    pub fn with_kind(mut self, kind: MetricKind) -> Self {
        if self.unit.is_none() && !kind.default_unit().is_empty() {
            self.unit = Some(kind.default_unit().to_string());
        }
        self.kind = Some(kind);
        self
    }

    /// 単位を設定
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// タグを追加
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// メトリクスを検証
    ///
    /// `record` は検証に失敗したサンプルを警告ログとともに破棄する。
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TelemetryError::InvalidMetric(
                "metric name must not be empty".to_string(),
            ));
        }
        if !self.value.is_finite() {
            return Err(TelemetryError::InvalidMetric(format!(
                "metric value must be finite, got {}",
                self.value
            )));
        }
        Ok(())
    }
}

/// メトリクス統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricStatistics {
    /// サンプル数
    pub count: usize,
    /// 合計
    pub sum: f64,
    /// 平均値
    pub average: f64,
    /// 最小値
    pub min: f64,
    /// 最大値
    pub max: f64,
    /// 中央値
    pub median: f64,
    /// 標準偏差（母集団）
    pub std_dev: f64,
    /// パーセンタイル（P50, P90, P95, P99）
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl MetricStatistics {
    /// 値のリストから統計を計算
    pub fn from_values(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let count = values.len();
        let sum = values.iter().sum::<f64>();
        let average = sum / count as f64;
        let min = values[0];
        let max = values[count - 1];
        let median = median_of_sorted(&values);

        let variance = values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / count as f64;
        let std_dev = variance.sqrt();

        Some(Self {
            count,
            sum,
            average,
            min,
            max,
            median,
            std_dev,
            p50: percentile(&values, 0.5),
            p90: percentile(&values, 0.9),
            p95: percentile(&values, 0.95),
            p99: percentile(&values, 0.99),
        })
    }
}

/// ソート済み値列の中央値（偶数長は中央2値の平均）
pub(crate) fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// パーセンタイルを計算
///
/// インデックスは `floor(n * p)` を `n - 1` でクランプする。
pub(crate) fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_kind_name_and_unit() {
        assert_eq!(MetricKind::Timer.name(), "timer");
        assert_eq!(MetricKind::Timer.default_unit(), "ms");
        assert_eq!(MetricKind::Custom("fps".to_string()).name(), "fps");
    }

    #[test]
    fn test_metric_builders() {
        let metric = Metric::timing("request_duration", 42.0).with_tag("handler", "tools/call");

        assert_eq!(metric.kind, Some(MetricKind::Timer));
        assert_eq!(metric.unit.as_deref(), Some("ms"));
        assert_eq!(metric.tags.get("handler"), Some(&"tools/call".to_string()));
    }

    #[test]
    fn test_metric_validation() {
        assert!(Metric::new("latency", 1.0).validate().is_ok());
        assert!(Metric::new("", 1.0).validate().is_err());
        assert!(Metric::new("latency", f64::NAN).validate().is_err());
        assert!(Metric::new("latency", f64::INFINITY).validate().is_err());
    }

    #[test]
    fn test_median() {
        // 偶数長は中央2値の平均
        let stats = MetricStatistics::from_values(vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(stats.median, 2.5);

        let stats = MetricStatistics::from_values(vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(stats.median, 2.0);
    }

    #[test]
    fn test_statistics() {
        let stats = MetricStatistics::from_values(vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();

        assert_eq!(stats.count, 5);
        assert_eq!(stats.sum, 15.0);
        assert_eq!(stats.average, 3.0);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert!((stats.std_dev - 2.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_clamped_index() {
        let sorted = vec![10.0, 20.0, 30.0, 40.0, 50.0];
        // floor(5 * 0.5) = 2
        assert_eq!(percentile(&sorted, 0.5), 30.0);
        // floor(5 * 0.99) = 4 はクランプ境界と一致
        assert_eq!(percentile(&sorted, 0.99), 50.0);
        assert_eq!(percentile(&sorted, 1.0), 50.0);
    }

    #[test]
    fn test_statistics_empty() {
        assert!(MetricStatistics::from_values(vec![]).is_none());
    }
}
