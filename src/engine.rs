//! メトリクスエンジン
//!
//! 全メトリクス別状態を所有するオーケストレーター。記録された各サンプルを
//! 集計器・異常検知器・閾値トラッカー・トレンド計算器へファンアウトし、
//! 設定 API とクエリ API、バックグラウンドタイマーのライフサイクルを
//! 提供する。
//!
//! 並行性の契約: メトリクス別オブジェクト自体はスレッドセーフではなく、
//! コンポーネント別マップの書き込みロック配下で操作される。ウィンドウの
//! 追い出しと再計算はロック内で完結するため原子的であり、フラッシュ
//! タイマーと検知サイクルも同じロック規律を通る。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregationConfig, SlidingWindowAggregator};
use crate::anomaly::AnomalyDetector;
use crate::error::{Result, TelemetryError};
use crate::events::{TelemetryEvent, EVENT_CHANNEL_CAPACITY};
use crate::metrics::{Metric, MetricStatistics};
use crate::threshold::{ThresholdConfig, ThresholdTracker, ThresholdViolation, ViolationCallback};
use crate::trend::{TrendCalculator, TrendInfo};

/// 自動検知の既定実行間隔
pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(5);

/// 集計器エントリ（フラッシュタスクのハンドル付き）
struct AggregatorEntry {
    aggregator: SlidingWindowAggregator,
    flush_handle: Option<JoinHandle<()>>,
}

/// 自動検知の有効化状態
#[derive(Debug, Clone, Copy, Default)]
struct DetectionState {
    anomalies: bool,
    thresholds: bool,
}

/// 常時更新される基礎カウンター
///
/// 集計器もトレンドサンプルも残っていない場合の統計フォールバック。
#[derive(Debug, Clone)]
struct BaseCounters {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Default for BaseCounters {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl BaseCounters {
    fn update(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// 粗い統計サマリを合成
    ///
    /// ウィンドウを保持していないため中央値とパーセンタイルは走行中の
    /// 平均値・最大値に縮退する。
    fn to_statistics(&self) -> Option<MetricStatistics> {
        if self.count == 0 {
            return None;
        }
        let average = self.sum / self.count as f64;
        Some(MetricStatistics {
            count: self.count as usize,
            sum: self.sum,
            average,
            min: self.min,
            max: self.max,
            median: average,
            std_dev: 0.0,
            p50: average,
            p90: self.max,
            p95: self.max,
            p99: self.max,
        })
    }
}

/// メトリクス別レポート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricReport {
    /// 設定された集計値
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated_value: Option<f64>,
    /// 統計サマリ
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<MetricStatistics>,
    /// トレンド
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendInfo>,
    /// 未解消の違反履歴
    pub violations: Vec<ThresholdViolation>,
}

/// 全メトリクスのスナップショットレポート
///
/// 外部の診断サーフェスがそのままシリアライズできる形で返す。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// 生成時刻
    pub generated_at: chrono::DateTime<Utc>,
    /// メトリクス別レポート
    pub metrics: BTreeMap<String, MetricReport>,
}

/// メトリクスエンジン
///
/// 明示的に構築してハンドルで引き回す。テストでは独立インスタンスを
/// 並べられる（プロセス全体のシングルトンは持たない）。
pub struct MetricsEngine {
    aggregators: Arc<RwLock<HashMap<String, AggregatorEntry>>>,
    detectors: Arc<RwLock<HashMap<String, AnomalyDetector>>>,
    trackers: Arc<RwLock<HashMap<String, ThresholdTracker>>>,
    trends: Arc<RwLock<HashMap<String, TrendCalculator>>>,
    counters: Arc<RwLock<HashMap<String, BaseCounters>>>,
    detection: Arc<RwLock<DetectionState>>,
    detection_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    event_sender: broadcast::Sender<TelemetryEvent>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsEngine {
    /// 新しいエンジンを作成
    pub fn new() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            aggregators: Arc::new(RwLock::new(HashMap::new())),
            detectors: Arc::new(RwLock::new(HashMap::new())),
            trackers: Arc::new(RwLock::new(HashMap::new())),
            trends: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(RwLock::new(HashMap::new())),
            detection: Arc::new(RwLock::new(DetectionState::default())),
            detection_handle: Arc::new(Mutex::new(None)),
            event_sender,
        }
    }

    /// イベントバスを購読
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.event_sender.subscribe()
    }

    /// 集計設定を登録（後勝ち）
    ///
    /// 置き換え時は旧エントリのフラッシュタイマーを中断してから
    /// 新しいエントリを登録する。
    pub async fn configure_aggregation(
        &self,
        name: impl Into<String>,
        config: AggregationConfig,
    ) -> Result<()> {
        let name = name.into();
        let aggregator = SlidingWindowAggregator::new(config.clone())?;

        let mut aggregators = self.aggregators.write().await;
        if let Some(prev) = aggregators.remove(&name) {
            if let Some(handle) = prev.flush_handle {
                handle.abort();
            }
        }

        let flush_handle = match (config.auto_flush, config.flush_interval) {
            (true, Some(flush_interval)) => {
                Some(self.spawn_flush_task(name.clone(), flush_interval))
            }
            _ => None,
        };

        aggregators.insert(
            name.clone(),
            AggregatorEntry {
                aggregator,
                flush_handle,
            },
        );
        info!(metric = %name, kind = ?config.kind, "aggregation configured");
        Ok(())
    }

    fn spawn_flush_task(&self, name: String, flush_interval: Duration) -> JoinHandle<()> {
        let aggregators = self.aggregators.clone();
        tokio::spawn(async move {
            let mut ticker = interval(flush_interval);
            loop {
                ticker.tick().await;
                let mut aggregators = aggregators.write().await;
                match aggregators.get_mut(&name) {
                    Some(entry) => {
                        if !entry.aggregator.is_empty() {
                            entry.aggregator.flush();
                            debug!(metric = %name, "window flushed");
                        }
                    }
                    // エントリが置き換え・削除されたらタスクも終了
                    None => break,
                }
            }
        })
    }

    /// 閾値設定を登録（後勝ち、旧トラッカーの履歴は破棄）
    pub async fn configure_threshold(
        &self,
        name: impl Into<String>,
        config: ThresholdConfig,
    ) -> Result<()> {
        let name = name.into();
        let tracker = ThresholdTracker::new(name.clone(), config)?;

        let mut trackers = self.trackers.write().await;
        trackers.insert(name.clone(), tracker);
        info!(metric = %name, "threshold configured");
        Ok(())
    }

    /// メトリクスを記録
    ///
    /// 常にトレンド計算器と基礎カウンターを更新し、設定があれば集計器と
    /// 閾値トラッカーを、自動検知が有効なら異常検知器を更新する。
    /// 不正なサンプルは警告ログとともに吸収され、他メトリクスの処理を
    /// 妨げない。
    pub async fn record(&self, metric: Metric) {
        if let Err(err) = metric.validate() {
            warn!(metric = %metric.name, %err, "discarding malformed sample");
            return;
        }

        let name = metric.name.clone();
        let value = metric.value;
        let timestamp = metric.timestamp;

        {
            let mut counters = self.counters.write().await;
            counters.entry(name.clone()).or_default().update(value);
        }

        {
            let mut trends = self.trends.write().await;
            trends
                .entry(name.clone())
                .or_default()
                .add_sample_at(value, timestamp);
        }

        {
            let mut aggregators = self.aggregators.write().await;
            if let Some(entry) = aggregators.get_mut(&name) {
                entry.aggregator.add_sample_at(value, timestamp);
            }
        }

        let anomalies_enabled = self.detection.read().await.anomalies;
        if anomalies_enabled {
            let outcome = {
                let mut detectors = self.detectors.write().await;
                detectors.entry(name.clone()).or_default().observe(value)
            };
            if outcome.is_anomaly {
                warn!(metric = %name, value, z_score = outcome.z_score, "anomaly detected");
                let _ = self.event_sender.send(TelemetryEvent::AnomalyDetected {
                    id: Uuid::new_v4().to_string(),
                    metric_name: name.clone(),
                    value,
                    z_score: outcome.z_score,
                    timestamp,
                });
            }
        }

        // コールバックはロック解放後に呼ぶ（再入や長時間実行に備える）
        let mut pending_callback: Option<(ViolationCallback, ThresholdViolation)> = None;
        let mut emitted: Option<ThresholdViolation> = None;
        {
            let mut trackers = self.trackers.write().await;
            if let Some(tracker) = trackers.get_mut(&name) {
                if let Some(violation) = tracker.observe_at(value, timestamp) {
                    emitted = Some(violation.clone());
                    match tracker.config().sustained_duration {
                        None => {
                            if let Some(callback) = tracker.config().on_violation.clone() {
                                pending_callback = Some((callback, violation));
                            }
                        }
                        Some(required) => {
                            if let Some(sustained) = tracker.sustained_violation(required) {
                                if let Some(callback) = tracker.config().on_violation.clone() {
                                    pending_callback = Some((callback, sustained));
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(violation) = emitted {
            let _ = self
                .event_sender
                .send(TelemetryEvent::ThresholdViolation { violation });
        }
        if let Some((callback, violation)) = pending_callback {
            callback(&violation);
        }
    }

    /// 自動検知を有効化
    ///
    /// `anomalies` はサンプルごとの異常判定ゲート、`thresholds` は検知
    /// サイクル内の連続違反スイープを制御する。サイクルタスクは後勝ちで
    /// 置き換えられる（既存タスクは中断される）。
    pub async fn enable_auto_detection(
        &self,
        anomalies: bool,
        thresholds: bool,
        detection_interval: Duration,
    ) -> Result<()> {
        if detection_interval.is_zero() {
            return Err(TelemetryError::InvalidConfiguration(
                "detection interval must be positive".to_string(),
            ));
        }

        {
            let mut detection = self.detection.write().await;
            detection.anomalies = anomalies;
            detection.thresholds = thresholds;
        }

        let mut handle = self.detection_handle.lock().await;
        if let Some(prev) = handle.take() {
            prev.abort();
        }
        *handle = Some(self.spawn_detection_cycle(detection_interval));

        info!(anomalies, thresholds, ?detection_interval, "auto detection enabled");
        Ok(())
    }

    fn spawn_detection_cycle(&self, detection_interval: Duration) -> JoinHandle<()> {
        let detection = self.detection.clone();
        let trackers = self.trackers.clone();
        let counters = self.counters.clone();
        let event_sender = self.event_sender.clone();

        tokio::spawn(async move {
            let mut ticker = interval(detection_interval);
            loop {
                ticker.tick().await;

                let thresholds_enabled = detection.read().await.thresholds;
                let mut sustained_breaches = 0usize;
                let mut active_violations = 0usize;
                {
                    let trackers = trackers.read().await;
                    for tracker in trackers.values() {
                        active_violations += tracker.violations().len();
                        if !thresholds_enabled {
                            continue;
                        }
                        if let Some(required) = tracker.config().sustained_duration {
                            if let Some(violation) = tracker.sustained_violation(required) {
                                sustained_breaches += 1;
                                let _ = event_sender
                                    .send(TelemetryEvent::ThresholdViolation { violation });
                            }
                        }
                    }
                }

                let tracked_metrics = counters.read().await.len();
                debug!(
                    tracked_metrics,
                    active_violations, sustained_breaches, "detection cycle"
                );
            }
        })
    }

    /// 自動検知を無効化（サイクルタスクを中断）
    pub async fn disable_auto_detection(&self) {
        {
            let mut detection = self.detection.write().await;
            detection.anomalies = false;
            detection.thresholds = false;
        }
        if let Some(handle) = self.detection_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// 設定された集計値を取得
    pub async fn aggregated_value(&self, name: &str) -> Option<f64> {
        let aggregators = self.aggregators.read().await;
        aggregators.get(name)?.aggregator.aggregated_value()
    }

    /// 統計サマリを取得
    ///
    /// 集計器の統計 → トレンド由来の統計 → 基礎カウンターの順で
    /// フォールバックする。
    pub async fn metric_statistics(&self, name: &str) -> Option<MetricStatistics> {
        {
            let aggregators = self.aggregators.read().await;
            if let Some(entry) = aggregators.get(name) {
                if let Some(stats) = entry.aggregator.statistics() {
                    return Some(stats);
                }
            }
        }
        {
            let trends = self.trends.read().await;
            if let Some(calculator) = trends.get(name) {
                if let Some(stats) = MetricStatistics::from_values(calculator.values()) {
                    return Some(stats);
                }
            }
        }
        let counters = self.counters.read().await;
        counters.get(name).and_then(BaseCounters::to_statistics)
    }

    /// 単一メトリクスのトレンドを取得
    pub async fn trend(&self, name: &str) -> Option<TrendInfo> {
        let trends = self.trends.read().await;
        trends.get(name)?.trend(name)
    }

    /// 2サンプル以上を持つ全メトリクスのトレンドを取得
    pub async fn performance_trends(&self) -> Vec<TrendInfo> {
        let trends = self.trends.read().await;
        trends
            .iter()
            .filter_map(|(name, calculator)| calculator.trend(name))
            .collect()
    }

    /// 違反履歴があるか
    pub async fn has_threshold_violations(&self, name: &str) -> bool {
        let trackers = self.trackers.read().await;
        trackers
            .get(name)
            .map(ThresholdTracker::has_violations)
            .unwrap_or(false)
    }

    /// 連続違反を問い合わせ
    pub async fn sustained_violation(
        &self,
        name: &str,
        required_duration: Duration,
    ) -> Option<ThresholdViolation> {
        let trackers = self.trackers.read().await;
        trackers.get(name)?.sustained_violation(required_duration)
    }

    /// 違反履歴を取得
    pub async fn threshold_violations(&self, name: &str) -> Vec<ThresholdViolation> {
        let trackers = self.trackers.read().await;
        trackers
            .get(name)
            .map(ThresholdTracker::violations)
            .unwrap_or_default()
    }

    /// 全トラッキング対象メトリクスのスナップショットレポートを生成
    pub async fn detailed_report(&self) -> TelemetryReport {
        let mut names: Vec<String> = {
            let counters = self.counters.read().await;
            counters.keys().cloned().collect()
        };
        {
            let aggregators = self.aggregators.read().await;
            names.extend(aggregators.keys().cloned());
        }
        {
            let trackers = self.trackers.read().await;
            names.extend(trackers.keys().cloned());
        }
        names.sort();
        names.dedup();

        let mut metrics = BTreeMap::new();
        for name in names {
            let report = MetricReport {
                aggregated_value: self.aggregated_value(&name).await,
                statistics: self.metric_statistics(&name).await,
                trend: self.trend(&name).await,
                violations: self.threshold_violations(&name).await,
            };
            metrics.insert(name, report);
        }

        TelemetryReport {
            generated_at: Utc::now(),
            metrics,
        }
    }

    /// 全メトリクス別状態をクリア
    ///
    /// 集計器のフラッシュタイマーを中断してから破棄する。自動検知の
    /// サイクルは `dispose` が停止する。
    pub async fn reset(&self) {
        {
            let mut aggregators = self.aggregators.write().await;
            for (_, entry) in aggregators.drain() {
                if let Some(handle) = entry.flush_handle {
                    handle.abort();
                }
            }
        }
        self.detectors.write().await.clear();
        self.trackers.write().await.clear();
        self.trends.write().await.clear();
        self.counters.write().await.clear();
        info!("metrics engine reset");
    }

    /// エンジンを破棄
    ///
    /// 検知サイクルを停止してから `reset` する。タイマー実行中でも安全で、
    /// 二重呼び出しも安全（停止済みタスクの中断は no-op）。
    pub async fn dispose(&self) {
        self.disable_auto_detection().await;
        self.reset().await;
    }
}
