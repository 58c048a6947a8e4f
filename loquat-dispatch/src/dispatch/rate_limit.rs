use loquat_core::config::model::{RateLimitSettings, RoutingConfig};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;

/// 令牌桶限流器
///
/// try_acquire非阻塞且并发安全；available_permits只是咨询值，
/// 读完的瞬间就可能过期。capacity为0表示不限流。
pub struct RateLimiter {
    capacity: u64,
    refill_per_second: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    /// 浮点存量保留补充的小数部分
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            capacity: settings.capacity,
            refill_per_second: settings.refill_per_second,
            state: Mutex::new(BucketState {
                available: settings.capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        if self.refill_per_second == 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill);
        state.available = (state.available
            + elapsed.as_secs_f64() * self.refill_per_second as f64)
            .min(self.capacity as f64);
        state.last_refill = now;
    }

    /// 尝试获取permits个许可
    pub fn try_acquire(&self, permits: u64) -> bool {
        if self.capacity == 0 {
            return true;
        }

        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.available >= permits as f64 {
            state.available -= permits as f64;
            true
        } else {
            false
        }
    }

    /// 获取单个许可
    pub fn try_acquire_one(&self) -> bool {
        self.try_acquire(1)
    }

    /// 咨询性的可用许可数
    pub fn available_permits(&self) -> u64 {
        if self.capacity == 0 {
            return u64::MAX;
        }
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.available as u64
    }

    /// 恢复满桶
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.available = self.capacity as f64;
        state.last_refill = Instant::now();
    }
}

/// 按provider维护限流器的银行
///
/// provider第一次出现时按配置惰性创建，之后复用同一个桶。
pub struct RateLimiterBank {
    config: Arc<RoutingConfig>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimiterBank {
    pub fn from_config(config: Arc<RoutingConfig>) -> Self {
        Self {
            config,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    /// 获取provider对应的限流器，不存在则按配置创建
    pub fn limiter(&self, provider: &str) -> Arc<RateLimiter> {
        if let Some(limiter) = self.limiters.read().get(provider) {
            return limiter.clone();
        }

        let settings = self.config.provider_rate_limit(provider);
        let mut limiters = self.limiters.write();
        limiters
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(&settings)))
            .clone()
    }

    /// 准入用的非消耗性检查
    pub fn has_capacity(&self, provider: &str) -> bool {
        self.limiter(provider).available_permits() > 0
    }

    /// 为即将发起的尝试消费一个许可
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.limiter(provider).try_acquire_one()
    }

    /// 恢复某个provider的满桶
    pub fn reset(&self, provider: &str) {
        if let Some(limiter) = self.limiters.read().get(provider) {
            limiter.reset();
        }
    }

    /// 恢复所有桶
    pub fn reset_all(&self) {
        for limiter in self.limiters.read().values() {
            limiter.reset();
        }
    }
}
