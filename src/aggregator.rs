//! スライディングウィンドウ集計
//!
//! メトリクス名ごとに直近サンプルを時間窓（および任意の件数上限）で
//! 保持し、設定された集計値と統計サマリをオンデマンドで計算する。

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Result, TelemetryError};
use crate::metrics::{median_of_sorted, percentile, MetricStatistics, Sample};

/// 集計の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    /// 平均値
    Average,
    /// 合計
    Sum,
    /// 最小値
    Min,
    /// 最大値
    Max,
    /// 中央値
    Median,
    /// 95パーセンタイル
    P95,
}

/// 集計設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// ウィンドウ幅
    pub window: Duration,
    /// 集計の種類
    pub kind: AggregationKind,
    /// サンプル件数上限（時間窓と併用、厳しい方が勝つ）
    pub max_samples: Option<usize>,
    /// 周期フラッシュを有効化
    pub auto_flush: bool,
    /// フラッシュ間隔
    pub flush_interval: Option<Duration>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            kind: AggregationKind::Average,
            max_samples: None,
            auto_flush: false,
            flush_interval: None,
        }
    }
}

impl AggregationConfig {
    /// 設定を検証
    ///
    /// 長さゼロのウィンドウは何も保持できず誤った統計を生むため、
    /// 登録時点で拒否する。
    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "aggregation window must be positive".to_string(),
            ));
        }
        if self.max_samples == Some(0) {
            return Err(TelemetryError::InvalidConfiguration(
                "max_samples must be positive when set".to_string(),
            ));
        }
        if let Some(interval) = self.flush_interval {
            if interval.is_zero() {
                return Err(TelemetryError::InvalidConfiguration(
                    "flush_interval must be positive when set".to_string(),
                ));
            }
        }
        if self.auto_flush && self.flush_interval.is_none() {
            return Err(TelemetryError::InvalidConfiguration(
                "auto_flush requires flush_interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// スライディングウィンドウ集計器
///
/// 単体ではスレッドセーフではない。並行に `record` されるエンジン内では
/// メトリクス別マップの書き込みロック配下で操作される。
pub struct SlidingWindowAggregator {
    config: AggregationConfig,
    window: TimeDelta,
    samples: VecDeque<Sample>,
}

impl SlidingWindowAggregator {
    /// 新しい集計器を作成
    pub fn new(config: AggregationConfig) -> Result<Self> {
        config.validate()?;
        let window = TimeDelta::from_std(config.window).map_err(|_| {
            TelemetryError::InvalidConfiguration("aggregation window is too large".to_string())
        })?;
        Ok(Self {
            config,
            window,
            samples: VecDeque::new(),
        })
    }

    /// 設定を取得
    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    /// 現在時刻のサンプルを追加
    pub fn add_sample(&mut self, value: f64) {
        self.add_sample_at(value, Utc::now());
    }

    /// タイムスタンプを指定してサンプルを追加
    ///
    /// 挿入のたびに `now - window` より古いサンプルを先頭から追い出し、
    /// 件数上限があればさらに上限まで追い出す。
    pub fn add_sample_at(&mut self, value: f64, timestamp: DateTime<Utc>) {
        self.samples.push_back(Sample::at(value, timestamp));

        let cutoff = Utc::now() - self.window;
        while self
            .samples
            .front()
            .map_or(false, |s| s.timestamp < cutoff)
        {
            self.samples.pop_front();
        }

        if let Some(cap) = self.config.max_samples {
            while self.samples.len() > cap {
                self.samples.pop_front();
            }
        }
    }

    /// 設定された集計値を計算
    ///
    /// ウィンドウが空なら `None`。読み取りはウィンドウを変更しないため
    /// 連続呼び出しは同じ値を返す。
    pub fn aggregated_value(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }

        let values: Vec<f64> = self.samples.iter().map(|s| s.value).collect();
        let n = values.len() as f64;

        let result = match self.config.kind {
            AggregationKind::Average => values.iter().sum::<f64>() / n,
            AggregationKind::Sum => values.iter().sum::<f64>(),
            AggregationKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            AggregationKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            AggregationKind::Median => {
                let mut sorted = values;
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
                median_of_sorted(&sorted)
            }
            AggregationKind::P95 => {
                let mut sorted = values;
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
                percentile(&sorted, 0.95)
            }
        };

        Some(result)
    }

    /// ウィンドウ全体の統計サマリを計算
    pub fn statistics(&self) -> Option<MetricStatistics> {
        MetricStatistics::from_values(self.samples.iter().map(|s| s.value).collect())
    }

    /// ウィンドウをクリア
    pub fn flush(&mut self) {
        self.samples.clear();
    }

    /// 保持サンプル数
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// ウィンドウが空か
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 最古サンプルのタイムスタンプ
    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.front().map(|s| s.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(kind: AggregationKind) -> SlidingWindowAggregator {
        SlidingWindowAggregator::new(AggregationConfig {
            kind,
            ..AggregationConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let zero_window = AggregationConfig {
            window: Duration::ZERO,
            ..AggregationConfig::default()
        };
        assert!(zero_window.validate().is_err());

        let zero_cap = AggregationConfig {
            max_samples: Some(0),
            ..AggregationConfig::default()
        };
        assert!(zero_cap.validate().is_err());

        let flush_without_interval = AggregationConfig {
            auto_flush: true,
            ..AggregationConfig::default()
        };
        assert!(flush_without_interval.validate().is_err());

        assert!(AggregationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_time_window_eviction() {
        let mut agg = aggregator(AggregationKind::Average);
        let now = Utc::now();

        // ウィンドウ(60s)外の古いサンプルは挿入時に追い出される
        agg.add_sample_at(100.0, now - TimeDelta::seconds(120));
        agg.add_sample_at(10.0, now - TimeDelta::seconds(5));
        agg.add_sample_at(20.0, now);

        assert_eq!(agg.len(), 2);
        assert_eq!(agg.aggregated_value(), Some(15.0));
    }

    #[test]
    fn test_max_samples_cap() {
        let mut agg = SlidingWindowAggregator::new(AggregationConfig {
            max_samples: Some(3),
            kind: AggregationKind::Sum,
            ..AggregationConfig::default()
        })
        .unwrap();

        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            agg.add_sample(value);
        }

        assert_eq!(agg.len(), 3);
        assert_eq!(agg.aggregated_value(), Some(12.0)); // 3 + 4 + 5
    }

    #[test]
    fn test_aggregated_value_idempotent() {
        let mut agg = aggregator(AggregationKind::Average);
        agg.add_sample(10.0);
        agg.add_sample(30.0);

        let first = agg.aggregated_value();
        let second = agg.aggregated_value();
        assert_eq!(first, second);
        assert_eq!(first, Some(20.0));
    }

    #[test]
    fn test_median_aggregation() {
        let mut agg = aggregator(AggregationKind::Median);
        for value in [4.0, 1.0, 3.0, 2.0] {
            agg.add_sample(value);
        }
        assert_eq!(agg.aggregated_value(), Some(2.5));

        agg.flush();
        for value in [3.0, 1.0, 2.0] {
            agg.add_sample(value);
        }
        assert_eq!(agg.aggregated_value(), Some(2.0));
    }

    #[test]
    fn test_min_max_p95() {
        let mut agg = aggregator(AggregationKind::Min);
        for value in [5.0, 2.0, 8.0] {
            agg.add_sample(value);
        }
        assert_eq!(agg.aggregated_value(), Some(2.0));

        let mut agg = aggregator(AggregationKind::Max);
        for value in [5.0, 2.0, 8.0] {
            agg.add_sample(value);
        }
        assert_eq!(agg.aggregated_value(), Some(8.0));

        let mut agg = aggregator(AggregationKind::P95);
        for value in [10.0, 20.0, 30.0, 40.0] {
            agg.add_sample(value);
        }
        // floor(4 * 0.95) = 3
        assert_eq!(agg.aggregated_value(), Some(40.0));
    }

    #[test]
    fn test_empty_window() {
        let agg = aggregator(AggregationKind::Average);
        assert!(agg.aggregated_value().is_none());
        assert!(agg.statistics().is_none());
        assert!(agg.is_empty());
    }

    #[test]
    fn test_flush() {
        let mut agg = aggregator(AggregationKind::Sum);
        agg.add_sample(1.0);
        agg.add_sample(2.0);
        agg.flush();

        assert!(agg.is_empty());
        assert!(agg.aggregated_value().is_none());
    }

    #[test]
    fn test_statistics_summary() {
        let mut agg = aggregator(AggregationKind::Average);
        for value in [1.0, 2.0, 3.0, 4.0] {
            agg.add_sample(value);
        }

        let stats = agg.statistics().unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
    }
}
