use loquat_core::config::model::MetricsSettings;
use loquat_core::types::BackendKey;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::classify::DispatchFailureKind;

/// 每个后端最多保留的窗口事件数
const MAX_WINDOW_EVENTS: usize = 512;

/// 后端指标缓存
///
/// 键是(provider, model)组合键，条目只增不删。尾延迟用EWMA近似
/// （历史权重latency_smoothing，新样本权重1-latency_smoothing），
/// 它是趋势信号，不是真实的P95分位数。
pub struct MetricsCache {
    settings: MetricsSettings,
    backends: RwLock<HashMap<BackendKey, Arc<BackendRecord>>>,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
}

struct BackendRecord {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    /// EWMA尾延迟，微秒存储，0表示还没有样本
    ewma_latency_us: AtomicU64,
    window: Mutex<VecDeque<WindowEvent>>,
}

struct WindowEvent {
    at: Instant,
    failed: bool,
}

/// 单个后端的只读指标视图
#[derive(Debug, Clone, Serialize)]
pub struct BackendMetrics {
    pub provider: String,
    pub model: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tail_latency_ms: Option<f64>,
    pub recent_error_rate: f64,
    /// 滑动窗口内的失败次数（failed_requests是累计值）
    pub recent_failures: u64,
    pub unhealthy: bool,
}

impl BackendRecord {
    fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            ewma_latency_us: AtomicU64::new(0),
            window: Mutex::new(VecDeque::new()),
        }
    }

    fn update_ewma(&self, sample: Duration, smoothing: f64) {
        // load+store非原子，并发下偶尔丢一个样本，对趋势信号可接受
        let sample_us = (sample.as_micros() as u64).max(1);
        let old = self.ewma_latency_us.load(Ordering::Relaxed);
        let new = if old == 0 {
            sample_us
        } else {
            (smoothing * old as f64 + (1.0 - smoothing) * sample_us as f64).round() as u64
        };
        self.ewma_latency_us.store(new.max(1), Ordering::Relaxed);
    }

    fn push_window_event(&self, failed: bool, horizon: Duration) {
        let now = Instant::now();
        let mut window = self.window.lock();
        window.push_back(WindowEvent { at: now, failed });

        // 写入时顺手修剪：超出时间窗或超出容量的旧事件丢弃
        while let Some(front) = window.front() {
            let expired = now.duration_since(front.at) > horizon;
            if expired || window.len() > MAX_WINDOW_EVENTS {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_counts(&self, window: Duration) -> (u64, u64) {
        let now = Instant::now();
        let events = self.window.lock();
        let mut total = 0u64;
        let mut failed = 0u64;
        for event in events.iter() {
            if now.duration_since(event.at) <= window {
                total += 1;
                if event.failed {
                    failed += 1;
                }
            }
        }
        (total, failed)
    }
}

impl MetricsCache {
    pub fn new(settings: MetricsSettings) -> Self {
        Self {
            settings,
            backends: RwLock::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
        }
    }

    fn record_for(&self, key: &BackendKey) -> Arc<BackendRecord> {
        if let Some(record) = self.backends.read().get(key) {
            return record.clone();
        }
        let mut backends = self.backends.write();
        backends
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BackendRecord::new()))
            .clone()
    }

    /// 事件保留的时间上限，错误率查询窗口超过它会被截到这个值
    fn window_horizon(&self) -> Duration {
        Duration::from_secs(self.settings.failure_window_seconds * 2)
    }

    /// 记录成功请求
    pub fn record_success(&self, key: &BackendKey, latency: Duration) {
        tracing::debug!("Recording success for backend {} ({:?})", key, latency);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);

        let record = self.record_for(key);
        record.total_requests.fetch_add(1, Ordering::Relaxed);
        record.successful_requests.fetch_add(1, Ordering::Relaxed);
        record.update_ewma(latency, self.settings.latency_smoothing);
        record.push_window_event(false, self.window_horizon());
    }

    /// 记录失败请求
    pub fn record_failure(&self, key: &BackendKey, kind: DispatchFailureKind) {
        tracing::debug!("Recording failure for backend {} ({})", key, kind);

        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let record = self.record_for(key);
        record.total_requests.fetch_add(1, Ordering::Relaxed);
        record.failed_requests.fetch_add(1, Ordering::Relaxed);
        record.push_window_event(true, self.window_horizon());
    }

    /// EWMA尾延迟近似，首个样本之前返回None
    pub fn tail_latency(&self, key: &BackendKey) -> Option<Duration> {
        let backends = self.backends.read();
        let record = backends.get(key)?;
        let us = record.ewma_latency_us.load(Ordering::Relaxed);
        if us == 0 {
            None
        } else {
            Some(Duration::from_micros(us))
        }
    }

    /// 窗口内错误率，[0,1]，无数据时为0
    pub fn error_rate(&self, key: &BackendKey, window: Duration) -> f64 {
        let record = match self.backends.read().get(key) {
            Some(record) => record.clone(),
            None => return 0.0,
        };

        let clamped = window.min(self.window_horizon());
        let (total, failed) = record.window_counts(clamped);
        if total == 0 {
            return 0.0;
        }
        failed as f64 / total as f64
    }

    /// 准入侧的派生健康信号
    ///
    /// 窗口样本不足min_window_samples时不判不健康，避免单次失败
    /// 把后端打入冷宫。独立于熔断器，两者互补。
    pub fn is_unhealthy(&self, key: &BackendKey) -> bool {
        let record = match self.backends.read().get(key) {
            Some(record) => record.clone(),
            None => return false,
        };

        let window = Duration::from_secs(self.settings.failure_window_seconds);
        let (total, failed) = record.window_counts(window);
        if total < self.settings.min_window_samples {
            return false;
        }
        let rate = failed as f64 / total as f64;
        rate > self.settings.unhealthy_error_rate
    }

    /// 全局总请求数
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// 全局成功请求数
    pub fn successful_requests(&self) -> u64 {
        self.successful_requests.load(Ordering::Relaxed)
    }

    /// 所有后端的只读指标快照
    pub fn snapshot(&self) -> Vec<BackendMetrics> {
        let window = Duration::from_secs(self.settings.failure_window_seconds);
        let backends = self.backends.read();
        let mut entries: Vec<BackendMetrics> = backends
            .iter()
            .map(|(key, record)| {
                let (total, failed) = record.window_counts(window);
                let rate = if total == 0 {
                    0.0
                } else {
                    failed as f64 / total as f64
                };
                let us = record.ewma_latency_us.load(Ordering::Relaxed);
                BackendMetrics {
                    provider: key.provider.clone(),
                    model: key.model.clone(),
                    total_requests: record.total_requests.load(Ordering::Relaxed),
                    successful_requests: record.successful_requests.load(Ordering::Relaxed),
                    failed_requests: record.failed_requests.load(Ordering::Relaxed),
                    tail_latency_ms: if us == 0 { None } else { Some(us as f64 / 1000.0) },
                    recent_error_rate: rate,
                    recent_failures: failed,
                    unhealthy: total >= self.settings.min_window_samples
                        && rate > self.settings.unhealthy_error_rate,
                }
            })
            .collect();

        entries.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        entries
    }
}
