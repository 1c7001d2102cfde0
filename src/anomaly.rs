//! 異常検知
//!
//! ローリング Z-score による外れ値判定

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{Result, TelemetryError};

/// 既定のウィンドウサイズ
pub const DEFAULT_WINDOW_SIZE: usize = 100;
/// 既定の Z-score 閾値（3シグマルール）
pub const DEFAULT_ZSCORE_THRESHOLD: f64 = 3.0;

/// 異常検知結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyOutcome {
    /// 異常フラグ
    pub is_anomaly: bool,
    /// 正規化スコア（0.0-1.0）
    pub score: f64,
    /// Z-score
    pub z_score: f64,
    /// 理由
    pub reason: String,
}

impl AnomalyOutcome {
    fn negative(reason: &str) -> Self {
        Self {
            is_anomaly: false,
            score: 0.0,
            z_score: 0.0,
            reason: reason.to_string(),
        }
    }
}

/// 異常検知器
///
/// 直近 `window_size` 件の生値を保持し、評価のたびに平均と標準偏差を
/// 再計算する。ウィンドウの半分に満たない間は判定しない（コールド
/// スタートガード）。
pub struct AnomalyDetector {
    history: VecDeque<f64>,
    window_size: usize,
    threshold: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self {
            history: VecDeque::with_capacity(DEFAULT_WINDOW_SIZE),
            window_size: DEFAULT_WINDOW_SIZE,
            threshold: DEFAULT_ZSCORE_THRESHOLD,
        }
    }
}

impl AnomalyDetector {
    /// 新しい検知器を作成
    pub fn new(window_size: usize, threshold: f64) -> Result<Self> {
        if window_size == 0 {
            return Err(TelemetryError::InvalidConfiguration(
                "anomaly window size must be positive".to_string(),
            ));
        }
        if threshold <= 0.0 {
            return Err(TelemetryError::InvalidConfiguration(
                "z-score threshold must be positive".to_string(),
            ));
        }
        Ok(Self {
            history: VecDeque::with_capacity(window_size),
            window_size,
            threshold,
        })
    }

    /// 値を取り込み、異常かどうかを判定
    pub fn observe(&mut self, value: f64) -> AnomalyOutcome {
        if self.history.len() >= self.window_size {
            self.history.pop_front();
        }
        self.history.push_back(value);

        if self.history.len() < self.window_size / 2 {
            return AnomalyOutcome::negative("Insufficient data");
        }

        let n = self.history.len() as f64;
        let mean = self.history.iter().sum::<f64>() / n;
        let variance = self.history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        // 定常信号で割り算を踏まない（アラートストーム防止）
        if std_dev < f64::EPSILON {
            return AnomalyOutcome::negative("Zero variance");
        }

        let z_score = ((value - mean) / std_dev).abs();
        let is_anomaly = z_score > self.threshold;

        AnomalyOutcome {
            is_anomaly,
            score: (z_score / self.threshold).min(1.0),
            z_score,
            reason: format!("Z-score: {:.2}", z_score),
        }
    }

    /// ウィンドウをクリア
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// 保持サンプル数
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// ウィンドウが空か
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configuration() {
        assert!(AnomalyDetector::new(0, 3.0).is_err());
        assert!(AnomalyDetector::new(100, 0.0).is_err());
        assert!(AnomalyDetector::new(100, -1.0).is_err());
    }

    #[test]
    fn test_cold_start_never_flags() {
        let mut detector = AnomalyDetector::default();

        // windowSize=100 のとき最初の49件は大きさによらず判定しない
        for i in 0..49 {
            let outcome = detector.observe(if i % 2 == 0 { 1.0 } else { 1_000_000.0 });
            assert!(!outcome.is_anomaly);
            assert_eq!(outcome.reason, "Insufficient data");
        }
    }

    #[test]
    fn test_zero_variance_never_flags() {
        let mut detector = AnomalyDetector::default();

        // 60件の同一値は stddev=0 ガードで判定されない
        for _ in 0..60 {
            let outcome = detector.observe(5.0);
            assert!(!outcome.is_anomaly);
        }
    }

    #[test]
    fn test_outlier_detection() {
        let mut detector = AnomalyDetector::new(20, 3.0).unwrap();

        // 分散を持つベースラインを取り込む
        for i in 0..20 {
            detector.observe(50.0 + (i % 5) as f64);
        }

        let outcome = detector.observe(500.0);
        assert!(outcome.is_anomaly);
        assert!(outcome.z_score > 3.0);
        assert_eq!(outcome.score, 1.0);
    }

    #[test]
    fn test_window_eviction() {
        let mut detector = AnomalyDetector::new(3, 3.0).unwrap();
        for value in [1.0, 2.0, 3.0, 4.0] {
            detector.observe(value);
        }
        assert_eq!(detector.len(), 3);
    }

    #[test]
    fn test_reset() {
        let mut detector = AnomalyDetector::default();
        for i in 0..60 {
            detector.observe(i as f64);
        }
        detector.reset();
        assert!(detector.is_empty());

        // リセット後はコールドスタートに戻る
        let outcome = detector.observe(1_000_000.0);
        assert!(!outcome.is_anomaly);
    }
}
