//! 閾値監視
//!
//! 各値を warning / critical レベルに分類し、連続違反（sustained
//! violation）を検出する。違反履歴は連続していなければならない。
//! 閾値を下回るサンプルが1件でも入れば履歴全体をクリアする。

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};

/// 違反履歴の上限（リングバッファ）
pub const VIOLATION_HISTORY_CAP: usize = 100;

/// 違反コールバック
pub type ViolationCallback = Arc<dyn Fn(&ThresholdViolation) + Send + Sync>;

/// 違反レベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationLevel {
    /// 警告
    Warning,
    /// 致命的
    Critical,
}

/// 閾値違反
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdViolation {
    /// 違反ID
    pub id: String,
    /// メトリクス名
    pub metric_name: String,
    /// 観測値
    pub value: f64,
    /// 超過した閾値
    pub threshold: f64,
    /// レベル
    pub level: ViolationLevel,
    /// タイムスタンプ
    pub timestamp: DateTime<Utc>,
    /// 継続時間（連続違反の合成時のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

/// 閾値設定
#[derive(Clone, Default)]
pub struct ThresholdConfig {
    /// 警告レベル
    pub warning_level: Option<f64>,
    /// 致命レベル
    pub critical_level: Option<f64>,
    /// 連続違反の必要継続時間
    pub sustained_duration: Option<Duration>,
    /// 違反コールバック
    pub on_violation: Option<ViolationCallback>,
}

impl fmt::Debug for ThresholdConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdConfig")
            .field("warning_level", &self.warning_level)
            .field("critical_level", &self.critical_level)
            .field("sustained_duration", &self.sustained_duration)
            .field("on_violation", &self.on_violation.as_ref().map(|_| "..."))
            .finish()
    }
}

impl ThresholdConfig {
    /// 設定を検証
    pub fn validate(&self) -> Result<()> {
        if self.warning_level.is_none() && self.critical_level.is_none() {
            return Err(TelemetryError::InvalidConfiguration(
                "threshold config requires warning_level or critical_level".to_string(),
            ));
        }
        if let (Some(warning), Some(critical)) = (self.warning_level, self.critical_level) {
            if warning > critical {
                return Err(TelemetryError::InvalidConfiguration(format!(
                    "warning_level {} must not exceed critical_level {}",
                    warning, critical
                )));
            }
        }
        if self.sustained_duration == Some(Duration::ZERO) {
            return Err(TelemetryError::InvalidConfiguration(
                "sustained_duration must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// 閾値トラッカー
pub struct ThresholdTracker {
    metric_name: String,
    config: ThresholdConfig,
    history: VecDeque<ThresholdViolation>,
}

impl ThresholdTracker {
    /// 新しいトラッカーを作成
    pub fn new(metric_name: impl Into<String>, config: ThresholdConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            metric_name: metric_name.into(),
            config,
            history: VecDeque::new(),
        })
    }

    /// 設定を取得
    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// 値をレベルに分類（サンプルごとに状態を持たない）
    pub fn classify(&self, value: f64) -> Option<ViolationLevel> {
        self.matched_level(value).map(|(level, _)| level)
    }

    fn matched_level(&self, value: f64) -> Option<(ViolationLevel, f64)> {
        if let Some(critical) = self.config.critical_level {
            if value >= critical {
                return Some((ViolationLevel::Critical, critical));
            }
        }
        if let Some(warning) = self.config.warning_level {
            if value >= warning {
                return Some((ViolationLevel::Warning, warning));
            }
        }
        None
    }

    /// 現在時刻の値を取り込む
    pub fn observe(&mut self, value: f64) -> Option<ThresholdViolation> {
        self.observe_at(value, Utc::now())
    }

    /// タイムスタンプを指定して値を取り込む
    ///
    /// 違反なら履歴に追加して返す。違反でなければ履歴全体をクリアし、
    /// 連続違反の計測をやり直す。
    pub fn observe_at(&mut self, value: f64, timestamp: DateTime<Utc>) -> Option<ThresholdViolation> {
        match self.matched_level(value) {
            Some((level, threshold)) => {
                let violation = ThresholdViolation {
                    id: Uuid::new_v4().to_string(),
                    metric_name: self.metric_name.clone(),
                    value,
                    threshold,
                    level,
                    timestamp,
                    duration: None,
                };
                if self.history.len() >= VIOLATION_HISTORY_CAP {
                    self.history.pop_front();
                }
                self.history.push_back(violation.clone());
                Some(violation)
            }
            None => {
                self.history.clear();
                None
            }
        }
    }

    /// 連続違反を検出
    ///
    /// 記録された全違反が `now - required_duration` 以降に収まる場合
    /// （= 追跡中の履歴全体が途切れず違反であった場合）のみ、直近
    /// エントリの値・閾値・レベルと履歴スパンを持つ違反を合成して返す。
    pub fn sustained_violation(&self, required_duration: Duration) -> Option<ThresholdViolation> {
        let first = self.history.front()?;
        let last = self.history.back()?;

        let required = TimeDelta::from_std(required_duration).ok()?;
        let cutoff = Utc::now() - required;
        let recent = self
            .history
            .iter()
            .filter(|v| v.timestamp >= cutoff)
            .count();
        if recent != self.history.len() {
            return None;
        }

        let span = (last.timestamp - first.timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);

        Some(ThresholdViolation {
            id: Uuid::new_v4().to_string(),
            metric_name: self.metric_name.clone(),
            value: last.value,
            threshold: last.threshold,
            level: last.level,
            timestamp: last.timestamp,
            duration: Some(span),
        })
    }

    /// 違反履歴があるか
    pub fn has_violations(&self) -> bool {
        !self.history.is_empty()
    }

    /// 違反履歴を取得
    pub fn violations(&self) -> Vec<ThresholdViolation> {
        self.history.iter().cloned().collect()
    }

    /// 履歴をクリア
    pub fn clear(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(warning: Option<f64>, critical: Option<f64>) -> ThresholdTracker {
        ThresholdTracker::new(
            "latency_ms",
            ThresholdConfig {
                warning_level: warning,
                critical_level: critical,
                ..ThresholdConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(ThresholdConfig::default().validate().is_err());

        let inverted = ThresholdConfig {
            warning_level: Some(500.0),
            critical_level: Some(200.0),
            ..ThresholdConfig::default()
        };
        assert!(inverted.validate().is_err());

        let zero_sustain = ThresholdConfig {
            critical_level: Some(100.0),
            sustained_duration: Some(Duration::ZERO),
            ..ThresholdConfig::default()
        };
        assert!(zero_sustain.validate().is_err());
    }

    #[test]
    fn test_classification_boundaries() {
        let tracker = tracker(Some(200.0), Some(500.0));

        assert_eq!(tracker.classify(100.0), None);
        // 境界値は違反（>= 比較）
        assert_eq!(tracker.classify(200.0), Some(ViolationLevel::Warning));
        assert_eq!(tracker.classify(499.0), Some(ViolationLevel::Warning));
        assert_eq!(tracker.classify(500.0), Some(ViolationLevel::Critical));
    }

    #[test]
    fn test_history_reset_on_clean_sample() {
        let mut tracker = tracker(None, Some(100.0));

        // 50 は違反なし、途中の 50 が先行履歴をクリアする
        for value in [50.0, 150.0, 150.0, 150.0, 50.0, 150.0] {
            tracker.observe(value);
        }

        assert_eq!(tracker.violations().len(), 1);
        assert!(tracker.has_violations());
    }

    #[test]
    fn test_history_cap() {
        let mut tracker = tracker(None, Some(1.0));
        for i in 0..150 {
            tracker.observe(10.0 + i as f64);
        }

        let violations = tracker.violations();
        assert_eq!(violations.len(), VIOLATION_HISTORY_CAP);
        // 最古エントリが追い出されている
        assert_eq!(violations[0].value, 60.0);
    }

    #[test]
    fn test_sustained_violation() {
        let mut tracker = tracker(None, Some(100.0));
        let now = Utc::now();

        tracker.observe_at(150.0, now - TimeDelta::seconds(9));
        tracker.observe_at(150.0, now - TimeDelta::seconds(5));
        tracker.observe_at(150.0, now);

        let sustained = tracker.sustained_violation(Duration::from_secs(10)).unwrap();
        let span = sustained.duration.unwrap();
        assert!(span >= Duration::from_secs(8) && span <= Duration::from_secs(10));
        assert_eq!(sustained.level, ViolationLevel::Critical);
        assert_eq!(sustained.value, 150.0);
    }

    #[test]
    fn test_sustained_violation_interrupted() {
        let mut tracker = tracker(None, Some(100.0));
        let now = Utc::now();

        tracker.observe_at(150.0, now - TimeDelta::seconds(9));
        tracker.observe_at(50.0, now - TimeDelta::seconds(5)); // 違反が途切れる
        tracker.observe_at(150.0, now);

        let sustained = tracker.sustained_violation(Duration::from_secs(10)).unwrap();
        // 途切れ後の1件だけが履歴に残るためスパンはゼロ
        assert_eq!(sustained.duration, Some(Duration::ZERO));
    }

    #[test]
    fn test_sustained_violation_outside_window() {
        let mut tracker = tracker(None, Some(100.0));
        let now = Utc::now();

        tracker.observe_at(150.0, now - TimeDelta::seconds(120));
        tracker.observe_at(150.0, now);

        // 古い違反が窓の外に出ているため連続違反にならない
        assert!(tracker
            .sustained_violation(Duration::from_secs(10))
            .is_none());
    }

    #[test]
    fn test_empty_history() {
        let tracker = tracker(None, Some(100.0));
        assert!(!tracker.has_violations());
        assert!(tracker
            .sustained_violation(Duration::from_secs(10))
            .is_none());
    }
}
