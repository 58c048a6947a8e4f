use loquat_core::config::model::{ProviderQuota, RoutingConfig};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// 配额闸门
///
/// 两类信号共用一个闸门：本地预算（每interval最多max_units）和
/// 上游报告的耗尽（retry-after冷却）。时间取tokio时钟，测试里用
/// 暂停时钟推进。
pub struct QuotaGate {
    default_cooldown: Duration,
    providers: RwLock<HashMap<String, QuotaState>>,
}

struct QuotaState {
    budget: Option<ProviderQuota>,
    used_units: u64,
    interval_started: Instant,
    exhausted_until: Option<Instant>,
}

impl QuotaState {
    fn new(budget: Option<ProviderQuota>) -> Self {
        Self {
            budget,
            used_units: 0,
            interval_started: Instant::now(),
            exhausted_until: None,
        }
    }

    /// 惰性翻转预算周期
    fn roll_interval(&mut self, now: Instant) {
        if let Some(budget) = &self.budget {
            let interval = Duration::from_secs(budget.interval_seconds);
            if now.duration_since(self.interval_started) >= interval {
                self.used_units = 0;
                self.interval_started = now;
            }
        }
    }

    fn has_quota(&mut self, now: Instant) -> bool {
        if let Some(until) = self.exhausted_until {
            if now < until {
                return false;
            }
            // 冷却结束，闸门自动放行
            self.exhausted_until = None;
        }

        self.roll_interval(now);
        match &self.budget {
            Some(budget) => self.used_units < budget.max_units_per_interval,
            None => true,
        }
    }
}

/// 单个provider的配额快照
#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub provider: String,
    pub used_units: u64,
    pub max_units_per_interval: Option<u64>,
    /// 距离耗尽冷却结束还剩多少秒，未耗尽时为None
    pub exhausted_for_seconds: Option<u64>,
}

impl QuotaGate {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            default_cooldown,
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// 按配置装配：有quota段的provider带本地预算
    pub fn from_config(config: &RoutingConfig) -> Self {
        let gate = Self::new(Duration::from_secs(config.quota.default_cooldown_seconds));
        {
            let mut providers = gate.providers.write();
            for (provider_id, settings) in &config.providers {
                if let Some(quota) = &settings.quota {
                    providers.insert(provider_id.clone(), QuotaState::new(Some(quota.clone())));
                }
            }
        }
        gate
    }

    /// 非消耗性的准入信号
    pub fn has_quota(&self, provider: &str) -> bool {
        let now = Instant::now();
        let mut providers = self.providers.write();
        match providers.get_mut(provider) {
            Some(state) => state.has_quota(now),
            // 没登记过的provider不受配额约束
            None => true,
        }
    }

    /// 成功调用后的用量记账
    pub fn record_usage(&self, provider: &str, units: u64) {
        let now = Instant::now();
        let mut providers = self.providers.write();
        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| QuotaState::new(None));

        state.roll_interval(now);
        state.used_units = state.used_units.saturating_add(units);

        if let Some(budget) = &state.budget {
            if state.used_units >= budget.max_units_per_interval {
                tracing::info!(
                    "Provider '{}' local quota budget exhausted ({}/{} units)",
                    provider,
                    state.used_units,
                    budget.max_units_per_interval
                );
            }
        }
    }

    /// 上游报告配额耗尽
    ///
    /// retry_after缺省时使用配置的默认冷却，冷却结束后has_quota
    /// 自动恢复为true，不需要外部干预。
    pub fn report_exhaustion(&self, provider: &str, retry_after: Option<Duration>) {
        let cooldown = retry_after.unwrap_or(self.default_cooldown);
        let until = Instant::now() + cooldown;

        let mut providers = self.providers.write();
        let state = providers
            .entry(provider.to_string())
            .or_insert_with(|| QuotaState::new(None));
        state.exhausted_until = Some(until);

        tracing::warn!(
            "Provider '{}' reported quota exhaustion, gated for {:?}",
            provider,
            cooldown
        );
    }

    /// 距离配额恢复的预估等待时间
    ///
    /// 冷却中返回剩余冷却时长，本地预算用满返回距周期翻转的时长，
    /// 未受限时返回None。只读不推进状态，恢复仍由has_quota惰性完成。
    pub fn retry_after(&self, provider: &str) -> Option<Duration> {
        let now = Instant::now();
        let providers = self.providers.read();
        let state = providers.get(provider)?;

        if let Some(until) = state.exhausted_until {
            if until > now {
                return Some(until.duration_since(now));
            }
        }

        if let Some(budget) = &state.budget {
            if state.used_units >= budget.max_units_per_interval {
                let interval = Duration::from_secs(budget.interval_seconds);
                let elapsed = now.duration_since(state.interval_started);
                return Some(interval.saturating_sub(elapsed));
            }
        }

        None
    }

    /// 只读快照
    pub fn snapshot(&self) -> Vec<QuotaSnapshot> {
        let now = Instant::now();
        let providers = self.providers.read();
        let mut entries: Vec<QuotaSnapshot> = providers
            .iter()
            .map(|(provider, state)| QuotaSnapshot {
                provider: provider.clone(),
                used_units: state.used_units,
                max_units_per_interval: state.budget.as_ref().map(|b| b.max_units_per_interval),
                exhausted_for_seconds: state.exhausted_until.and_then(|until| {
                    if until > now {
                        Some(until.duration_since(now).as_secs())
                    } else {
                        None
                    }
                }),
            })
            .collect();

        entries.sort_by(|a, b| a.provider.cmp(&b.provider));
        entries
    }
}
