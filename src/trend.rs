//! トレンド推定
//!
//! 最小二乗法による短期的な方向・変化率の推定

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// トレンドウィンドウ（直近5分）
pub const TREND_WINDOW_SECS: i64 = 300;
/// トレンドサンプル上限
pub const TREND_MAX_SAMPLES: usize = 1000;
/// 安定判定の傾き閾値（per ms）
const STABILITY_THRESHOLD: f64 = 1e-4;

/// トレンドの方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    /// 増加
    Increasing,
    /// 減少
    Decreasing,
    /// 安定
    Stable,
}

/// トレンド情報
///
/// オンデマンドで計算され、永続化されない。適合度は算出しないため
/// アラートの唯一の根拠にしてはならない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendInfo {
    /// メトリクス名
    pub metric_name: String,
    /// 方向
    pub direction: TrendDirection,
    /// 変化率（毎分）
    pub change_rate: f64,
    /// 最新値
    pub current_value: f64,
    /// サンプル数
    pub sample_count: usize,
}

/// トレンド計算器
pub struct TrendCalculator {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

impl Default for TrendCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl TrendCalculator {
    /// 新しい計算器を作成
    pub fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    /// 現在時刻のサンプルを追加
    pub fn add_sample(&mut self, value: f64) {
        self.add_sample_at(value, Utc::now());
    }

    /// タイムスタンプを指定してサンプルを追加
    ///
    /// 挿入のたびに5分窓と件数上限の両方を適用する（厳しい方が勝つ）。
    pub fn add_sample_at(&mut self, value: f64, timestamp: DateTime<Utc>) {
        self.samples.push_back((timestamp, value));

        let cutoff = Utc::now() - TimeDelta::seconds(TREND_WINDOW_SECS);
        while self.samples.front().map_or(false, |(ts, _)| *ts < cutoff) {
            self.samples.pop_front();
        }
        while self.samples.len() > TREND_MAX_SAMPLES {
            self.samples.pop_front();
        }
    }

    /// トレンドを計算
    ///
    /// `slope = (n*Σxy - Σx*Σy) / (n*Σx² - (Σx)²)`、x はミリ秒単位の
    /// タイムスタンプ。2サンプル未満なら `None`。
    pub fn trend(&self, metric_name: &str) -> Option<TrendInfo> {
        let n = self.samples.len();
        if n < 2 {
            return None;
        }

        // 先頭タイムスタンプを原点にして桁落ちを避ける（傾きは平行移動で不変）
        let origin = self.samples.front().map(|(ts, _)| ts.timestamp_millis())?;

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xy = 0.0;
        let mut sum_x2 = 0.0;
        for (ts, value) in &self.samples {
            let x = (ts.timestamp_millis() - origin) as f64;
            sum_x += x;
            sum_y += value;
            sum_xy += x * value;
            sum_x2 += x * x;
        }

        let nf = n as f64;
        let denominator = nf * sum_x2 - sum_x * sum_x;
        let slope = if denominator.abs() < f64::EPSILON {
            // 全サンプルが同一ミリ秒に集中。傾きは定義上フラット
            0.0
        } else {
            (nf * sum_xy - sum_x * sum_y) / denominator
        };

        let direction = if slope.abs() < STABILITY_THRESHOLD {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Increasing
        } else {
            TrendDirection::Decreasing
        };

        let current_value = self.samples.back().map(|(_, v)| *v)?;

        Some(TrendInfo {
            metric_name: metric_name.to_string(),
            direction,
            // per-ms の傾きを per-minute に換算
            change_rate: slope * 60_000.0,
            current_value,
            sample_count: n,
        })
    }

    /// 保持サンプル数
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// 保持中の値列（統計フォールバック用）
    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|(_, v)| *v).collect()
    }

    /// サンプルをクリア
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
