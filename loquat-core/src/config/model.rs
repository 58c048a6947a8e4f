use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 路由配置根节点
///
/// 纯数据结构：启动时加载，运行中可整体热替换，选择过程只读。
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RoutingConfig {
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub selection: SelectionSettings,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub models: Vec<String>,
    /// 加权随机选择使用的权重。无符号类型，负值在解析阶段直接报错
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_request_timeout")]
    pub timeout_seconds: u64,
    /// 针对该provider的限流覆盖，缺省使用全局rate_limit
    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,
    /// 针对该provider的配额预算，缺省不做配额约束
    #[serde(default)]
    pub quota: Option<ProviderQuota>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SelectionSettings {
    /// 备选链长度上限
    #[serde(default = "default_max_fallbacks")]
    pub max_fallbacks: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakerSettings {
    /// 连续失败多少次后熔断
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// OPEN状态持续多久后允许探测
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
    /// HALF_OPEN状态下同时在途的探测请求上限
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MetricsSettings {
    /// 尾延迟EWMA的历史权重（新样本权重 = 1 - latency_smoothing）
    #[serde(default = "default_latency_smoothing")]
    pub latency_smoothing: f64,
    /// 错误率统计的滑动窗口
    #[serde(default = "default_failure_window")]
    pub failure_window_seconds: u64,
    /// 窗口错误率超过该值视为不健康
    #[serde(default = "default_unhealthy_error_rate")]
    pub unhealthy_error_rate: f64,
    /// 不健康判定所需的最小窗口样本数
    #[serde(default = "default_min_window_samples")]
    pub min_window_samples: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitSettings {
    /// 令牌桶容量，0表示不限流
    #[serde(default)]
    pub capacity: u64,
    /// 每秒补充的令牌数，0表示只出不补（仅靠reset恢复）
    #[serde(default)]
    pub refill_per_second: u64,
}

/// 全局配额默认值（per-provider配额见ProviderQuota）
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QuotaSettings {
    /// 上游报告耗尽但未给出retry-after时使用的冷却时间
    #[serde(default = "default_exhaustion_cooldown")]
    pub default_cooldown_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderQuota {
    pub max_units_per_interval: u64,
    pub interval_seconds: u64,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_fallbacks() -> usize {
    2
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_latency_smoothing() -> f64 {
    0.9
}

fn default_failure_window() -> u64 {
    60
}

fn default_unhealthy_error_rate() -> f64 {
    0.5
}

fn default_min_window_samples() -> u64 {
    5
}

fn default_exhaustion_cooldown() -> u64 {
    60
}

impl Default for SelectionSettings {
    fn default() -> Self {
        Self {
            max_fallbacks: default_max_fallbacks(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            latency_smoothing: default_latency_smoothing(),
            failure_window_seconds: default_failure_window(),
            unhealthy_error_rate: default_unhealthy_error_rate(),
            min_window_samples: default_min_window_samples(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 0,
            refill_per_second: 0,
        }
    }
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            default_cooldown_seconds: default_exhaustion_cooldown(),
        }
    }
}

impl RoutingConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        // 验证providers
        for (provider_id, provider) in &self.providers {
            self.validate_provider_config(provider_id, provider)?;
        }

        self.validate_breaker_config()?;
        self.validate_metrics_config()?;

        Ok(())
    }

    /// 验证单个Provider配置的有效性
    fn validate_provider_config(&self, provider_id: &str, provider: &ProviderSettings) -> Result<()> {
        if provider.name.is_empty() {
            anyhow::bail!("Provider '{}' has empty name", provider_id);
        }

        if provider.enabled && provider.models.is_empty() {
            anyhow::bail!(
                "Provider '{}' is enabled but has no models defined",
                provider_id
            );
        }

        if provider.timeout_seconds == 0 {
            anyhow::bail!(
                "Provider '{}' has invalid timeout_seconds: cannot be 0",
                provider_id
            );
        }

        if let Some(quota) = &provider.quota {
            if quota.interval_seconds == 0 {
                anyhow::bail!(
                    "Provider '{}' has invalid quota interval_seconds: cannot be 0",
                    provider_id
                );
            }
            if quota.max_units_per_interval == 0 {
                anyhow::bail!(
                    "Provider '{}' has invalid quota max_units_per_interval: cannot be 0",
                    provider_id
                );
            }
        }

        Ok(())
    }

    /// 验证熔断配置的有效性
    fn validate_breaker_config(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be at least 1");
        }

        if self.breaker.recovery_timeout_seconds == 0 {
            anyhow::bail!("breaker.recovery_timeout_seconds must be at least 1");
        }

        if self.breaker.half_open_max_probes == 0 {
            anyhow::bail!("breaker.half_open_max_probes must be at least 1");
        }

        Ok(())
    }

    /// 验证指标配置的有效性
    fn validate_metrics_config(&self) -> Result<()> {
        let smoothing = self.metrics.latency_smoothing;
        if !(smoothing > 0.0 && smoothing < 1.0) {
            anyhow::bail!(
                "metrics.latency_smoothing must be within (0, 1), got {}",
                smoothing
            );
        }

        let rate = self.metrics.unhealthy_error_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            anyhow::bail!(
                "metrics.unhealthy_error_rate must be within (0, 1], got {}",
                rate
            );
        }

        if self.metrics.failure_window_seconds == 0 {
            anyhow::bail!("metrics.failure_window_seconds must be at least 1");
        }

        Ok(())
    }

    /// 获取指定Provider的配置
    pub fn get_provider(&self, provider_id: &str) -> Option<&ProviderSettings> {
        self.providers.get(provider_id)
    }

    /// 获取指定Provider的请求超时
    pub fn provider_timeout(&self, provider_id: &str) -> Duration {
        let seconds = self
            .providers
            .get(provider_id)
            .map(|p| p.timeout_seconds)
            .unwrap_or_else(default_request_timeout);
        Duration::from_secs(seconds)
    }

    /// 获取指定Provider的限流参数（provider覆盖优先于全局）
    pub fn provider_rate_limit(&self, provider_id: &str) -> RateLimitSettings {
        self.providers
            .get(provider_id)
            .and_then(|p| p.rate_limit.clone())
            .unwrap_or_else(|| self.rate_limit.clone())
    }

    /// 熔断恢复超时
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker.recovery_timeout_seconds)
    }

    /// 错误率统计窗口
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.metrics.failure_window_seconds)
    }
}
