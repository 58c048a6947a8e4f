use loquat_core::config::model::BreakerSettings;
use loquat_core::types::BackendKey;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::error::DispatchError;

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// 许可类型：普通调用或HALF_OPEN探测
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermitKind {
    Normal,
    Probe,
}

/// 单个后端的熔断器
///
/// 熔断策略是连续失败计数：CLOSED下连续失败达到failure_threshold
/// 进入OPEN，期间一次成功清零计数。OPEN在recovery_timeout之后把
/// 下一次调用放行为探测并转入HALF_OPEN；探测成功回到CLOSED并清零
/// 计数，失败回到OPEN并重新计时。状态迁移走互斥锁，同一时刻最多
/// half_open_max_probes个探测在途，并发调用不会重复放行。
pub struct CircuitBreaker {
    key: BackendKey,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    total_requests: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_requests: AtomicU64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// 熔断器只读视图
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub provider: String,
    pub model: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub failure_rate: f64,
    /// OPEN状态下距离下一次探测的剩余时间
    pub recovery_in: Option<Duration>,
}

/// 在途许可守卫：op没有产生结果就被丢弃时归还探测名额
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    kind: PermitKind,
    armed: bool,
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release(self.kind);
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: BackendKey, settings: BreakerSettings) -> Self {
        Self {
            key,
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
            total_requests: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.recovery_timeout_seconds)
    }

    /// 申请一次调用许可
    ///
    /// OPEN且恢复时间已到时，单个调用被放行为探测并先转入HALF_OPEN；
    /// 其余OPEN调用直接拒绝，不触碰被包裹的操作。
    pub fn try_acquire(&self) -> Result<PermitKind, DispatchError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.total_requests.fetch_add(1, Ordering::Relaxed);
                Ok(PermitKind::Normal)
            }
            CircuitState::Open => {
                let due = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.recovery_timeout())
                    .unwrap_or(true);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.probes_in_flight = 1;
                    self.total_requests.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        "Circuit breaker for {} entering HALF_OPEN, admitting probe",
                        self.key
                    );
                    Ok(PermitKind::Probe)
                } else {
                    self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    let retry_in = inner
                        .opened_at
                        .map(|at| self.recovery_timeout().saturating_sub(at.elapsed()));
                    Err(DispatchError::CircuitOpen {
                        key: self.key.clone(),
                        retry_in,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.settings.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    self.total_requests.fetch_add(1, Ordering::Relaxed);
                    Ok(PermitKind::Probe)
                } else {
                    self.rejected_requests.fetch_add(1, Ordering::Relaxed);
                    Err(DispatchError::CircuitOpen {
                        key: self.key.clone(),
                        retry_in: None,
                    })
                }
            }
        }
    }

    /// 记录成功结果
    pub fn record_success(&self, kind: PermitKind) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match (inner.state, kind) {
            (CircuitState::HalfOpen, PermitKind::Probe) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probes_in_flight = 0;
                inner.opened_at = None;
                tracing::info!(
                    "Circuit breaker for {} closed after successful probe",
                    self.key
                );
            }
            (CircuitState::Closed, _) => {
                inner.consecutive_failures = 0;
            }
            _ => {
                if kind == PermitKind::Probe && inner.probes_in_flight > 0 {
                    inner.probes_in_flight -= 1;
                }
            }
        }
    }

    /// 记录失败结果
    pub fn record_failure(&self, kind: PermitKind) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        match (inner.state, kind) {
            (CircuitState::HalfOpen, PermitKind::Probe) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                tracing::warn!(
                    "Circuit breaker for {} reopened after failed probe",
                    self.key
                );
            }
            (CircuitState::Closed, _) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        "Circuit breaker for {} opened after {} consecutive failures",
                        self.key,
                        inner.consecutive_failures
                    );
                }
            }
            _ => {
                if kind == PermitKind::Probe && inner.probes_in_flight > 0 {
                    inner.probes_in_flight -= 1;
                }
            }
        }
    }

    /// 归还一个没有结果的许可（调用被取消时）
    fn release(&self, kind: PermitKind) {
        if kind != PermitKind::Probe {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.probes_in_flight > 0 {
            inner.probes_in_flight -= 1;
            tracing::debug!(
                "Circuit breaker for {} released abandoned probe slot",
                self.key
            );
        }
    }

    /// 包裹一次调用：申请许可、执行、按结果驱动状态机
    ///
    /// 调用方超时要放在op内部，这样超时会被当作普通失败记账；
    /// 整个call被丢弃（外部取消）时只归还探测名额，不记失败。
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DispatchError>>,
    {
        let kind = self.try_acquire()?;
        let mut guard = PermitGuard {
            breaker: self,
            kind,
            armed: true,
        };

        let result = op().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(kind),
            Err(_) => self.record_failure(kind),
        }
        result
    }

    /// 准入视角：OPEN且还没到恢复时间才算拦路
    pub fn is_blocking(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => inner
                .opened_at
                .map(|at| at.elapsed() < self.recovery_timeout())
                .unwrap_or(false),
            _ => false,
        }
    }

    /// 运维强制熔断
    pub fn trip_open(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_in_flight = 0;
        tracing::warn!("Circuit breaker for {} manually tripped open", self.key);
    }

    /// 运维强制复位
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probes_in_flight = 0;
        inner.opened_at = None;
        tracing::info!("Circuit breaker for {} manually reset to CLOSED", self.key);
    }

    /// 当前状态
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// 只读统计视图
    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let total = self.total_requests.load(Ordering::Relaxed);
        let failures = self.total_failures.load(Ordering::Relaxed);
        BreakerStats {
            provider: self.key.provider.clone(),
            model: self.key.model.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            success_count: self.total_successes.load(Ordering::Relaxed),
            failure_count: failures,
            total_requests: total,
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            failure_rate: if total == 0 {
                0.0
            } else {
                failures as f64 / total as f64
            },
            recovery_in: match inner.state {
                CircuitState::Open => inner
                    .opened_at
                    .map(|at| self.recovery_timeout().saturating_sub(at.elapsed())),
                _ => None,
            },
        }
    }
}

/// 按后端键管理熔断器的银行，首次使用时惰性创建
pub struct BreakerBank {
    settings: BreakerSettings,
    breakers: RwLock<HashMap<BackendKey, Arc<CircuitBreaker>>>,
}

impl BreakerBank {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// 获取后端对应的熔断器，不存在则创建
    pub fn breaker(&self, key: &BackendKey) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(key) {
            return breaker.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(key.clone(), self.settings.clone()))
            })
            .clone()
    }

    pub fn get(&self, key: &BackendKey) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(key).cloned()
    }

    /// 准入检查：没有熔断器等价于CLOSED
    pub fn is_blocking(&self, key: &BackendKey) -> bool {
        self.get(key).map(|b| b.is_blocking()).unwrap_or(false)
    }

    /// 运维强制熔断（不存在则先创建，保证摘除指令生效）
    pub fn trip_open(&self, key: &BackendKey) {
        self.breaker(key).trip_open();
    }

    /// 运维强制复位
    pub fn reset(&self, key: &BackendKey) -> bool {
        match self.get(key) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// 所有熔断器的只读快照
    pub fn snapshot(&self) -> Vec<BreakerStats> {
        let breakers = self.breakers.read();
        let mut entries: Vec<BreakerStats> = breakers.values().map(|b| b.stats()).collect();
        entries.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        entries
    }
}
