use loquat_core::config::model::RoutingConfig;
use loquat_core::provider::{Capability, ProviderCandidate};
use loquat_core::types::BackendKey;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

use super::breaker::BreakerBank;
use super::error::{DispatchError, RejectReason, RejectedCandidate};
use super::metrics::MetricsCache;
use super::quota::QuotaGate;
use super::rate_limit::RateLimiterBank;

/// 一次路由请求的上下文
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// 请求的模型名
    pub model: String,
    /// 租户/用户标识，只用于日志关联
    pub tenant: Option<String>,
    /// 候选必须具备的能力
    pub required_capabilities: Vec<Capability>,
    /// 显式指定的provider，可准入时直接选中
    pub preferred_provider: Option<String>,
    /// 固定随机种子，测试用；生产路径留空走线程RNG
    pub seed: Option<u64>,
    /// 单次尝试的超时覆盖，缺省使用候选或provider配置
    pub timeout: Option<Duration>,
}

impl RoutingContext {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.required_capabilities.push(capability);
        self
    }

    pub fn with_preferred_provider(mut self, provider: impl Into<String>) -> Self {
        self.preferred_provider = Some(provider.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 选择结果：选中的候选、按权重排好的备选链、诊断分数
#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub selected: ProviderCandidate,
    pub fallbacks: Vec<ProviderCandidate>,
    /// 选中候选的weight * 10，只进日志和outcome，不参与任何决策
    pub score: u64,
}

/// 加权随机选择器
///
/// 对每次请求：先做准入过滤（可用性、能力、熔断、配额、限流），
/// 再在健康子集上按权重做一次逆CDF抽样，剩余候选按权重降序截断
/// 成备选链。权重以当前配置为准（热更新即时生效），配置里没有的
/// provider退回注册时声明的权重。整个过程只读缓存信号，不做I/O
/// 也不改共享状态，限流许可由引擎在真正尝试时才消费。
pub struct ProviderSelector {
    metrics: Arc<MetricsCache>,
    breakers: Arc<BreakerBank>,
    quota: Arc<QuotaGate>,
    rate_limits: Arc<RateLimiterBank>,
}

impl ProviderSelector {
    pub fn new(
        metrics: Arc<MetricsCache>,
        breakers: Arc<BreakerBank>,
        quota: Arc<QuotaGate>,
        rate_limits: Arc<RateLimiterBank>,
    ) -> Self {
        Self {
            metrics,
            breakers,
            quota,
            rate_limits,
        }
    }

    /// 从候选列表中选出本次请求的后端
    pub fn select(
        &self,
        candidates: &[ProviderCandidate],
        context: &RoutingContext,
        config: &RoutingConfig,
    ) -> Result<ProviderSelection, DispatchError> {
        let mut admitted: Vec<&ProviderCandidate> = Vec::new();
        let mut rejected: Vec<RejectedCandidate> = Vec::new();

        for candidate in candidates {
            match self.admission_reject(candidate, context) {
                Some(reason) => {
                    tracing::debug!(
                        "Candidate {} rejected at admission: {:?}",
                        candidate.key,
                        reason
                    );
                    rejected.push(RejectedCandidate {
                        key: candidate.key.clone(),
                        reason,
                    });
                }
                None => admitted.push(candidate),
            }
        }

        if admitted.is_empty() {
            tracing::warn!(
                "No admissible candidates for model '{}' ({} rejected)",
                context.model,
                rejected.len()
            );
            return Err(DispatchError::NoCandidates {
                model: context.model.clone(),
                reasons: rejected,
            });
        }

        // 显式偏好优先于加权抽样，但必须通过准入
        if let Some(preferred) = &context.preferred_provider {
            if let Some(candidate) = admitted.iter().find(|c| &c.key.provider == preferred) {
                let selected = (*candidate).clone();
                tracing::debug!(
                    "Preferred provider '{}' admitted for model '{}', picking directly",
                    preferred,
                    context.model
                );
                return Ok(self.build_selection(selected, &admitted, config));
            }
            tracing::debug!(
                "Preferred provider '{}' not admissible for model '{}', falling back to weighted draw",
                preferred,
                context.model
            );
        }

        // 软健康偏好：有健康候选就只在健康子集里抽，
        // 全部不健康时保留整个准入集，降级运行
        let healthy: Vec<&ProviderCandidate> = admitted
            .iter()
            .copied()
            .filter(|c| !self.metrics.is_unhealthy(&c.key))
            .collect();
        let pool: &[&ProviderCandidate] = if healthy.is_empty() {
            tracing::warn!(
                "All {} admitted candidates for model '{}' look unhealthy, keeping full set",
                admitted.len(),
                context.model
            );
            &admitted
        } else {
            if healthy.len() < admitted.len() {
                tracing::debug!(
                    "Restricting draw to {}/{} healthy candidates for model '{}'",
                    healthy.len(),
                    admitted.len(),
                    context.model
                );
            }
            &healthy
        };

        // 全零权重退化为均匀分布
        let mut weights: Vec<u64> = pool
            .iter()
            .map(|c| u64::from(effective_weight(c, config)))
            .collect();
        if weights.iter().sum::<u64>() == 0 {
            weights = vec![1; pool.len()];
        }
        let total: u64 = weights.iter().sum();

        let draw = match context.seed {
            Some(seed) => {
                let mut rng = StdRng::seed_from_u64(seed);
                rng.random_range(0..total)
            }
            None => rand::rng().random_range(0..total),
        };
        let index = weighted_pick_index(&weights, draw);
        let selected = pool[index].clone();

        Ok(self.build_selection(selected, &admitted, config))
    }

    /// 准入检查，返回Some(原因)表示该候选被拦下
    fn admission_reject(
        &self,
        candidate: &ProviderCandidate,
        context: &RoutingContext,
    ) -> Option<RejectReason> {
        if !candidate.available {
            return Some(RejectReason::Unavailable);
        }
        // 模型不匹配按能力缺失处理
        if candidate.key.model != context.model {
            return Some(RejectReason::MissingCapability);
        }
        if context
            .required_capabilities
            .iter()
            .any(|c| !candidate.supports(*c))
        {
            return Some(RejectReason::MissingCapability);
        }
        if self.breakers.is_blocking(&candidate.key) {
            return Some(RejectReason::CircuitOpen);
        }
        if !self.quota.has_quota(&candidate.key.provider) {
            return Some(RejectReason::QuotaExhausted);
        }
        // 只看有没有许可，真正的消费发生在引擎尝试该候选时
        if !self.rate_limits.has_capacity(&candidate.key.provider) {
            return Some(RejectReason::RateLimited);
        }
        None
    }

    fn build_selection(
        &self,
        selected: ProviderCandidate,
        admitted: &[&ProviderCandidate],
        config: &RoutingConfig,
    ) -> ProviderSelection {
        let fallbacks = build_fallbacks(admitted, &selected.key, config);
        let score = u64::from(effective_weight(&selected, config)) * 10;
        tracing::debug!(
            "Selected backend {} (score {}, {} fallbacks)",
            selected.key,
            score,
            fallbacks.len()
        );
        ProviderSelection {
            selected,
            fallbacks,
            score,
        }
    }
}

/// 候选的生效权重：配置里有对应provider就用配置值，热更新无需重新
/// 注册；配置里没有的（纯代码注册）用注册时声明的权重
fn effective_weight(candidate: &ProviderCandidate, config: &RoutingConfig) -> u32 {
    config
        .get_provider(&candidate.key.provider)
        .map(|settings| settings.weight)
        .unwrap_or(candidate.weight)
}

/// 逆CDF游走：draw落进哪个候选的累计权重区间就选谁
///
/// 调用方保证weights非空且draw < 总权重。
fn weighted_pick_index(weights: &[u64], draw: u64) -> usize {
    debug_assert!(!weights.is_empty());
    let mut cumulative = 0u64;
    for (index, weight) in weights.iter().enumerate() {
        cumulative += weight;
        if draw < cumulative {
            return index;
        }
    }
    weights.len() - 1
}

/// 备选链：未选中的准入候选按生效权重降序，稳定排序后截断
fn build_fallbacks(
    admitted: &[&ProviderCandidate],
    selected: &BackendKey,
    config: &RoutingConfig,
) -> Vec<ProviderCandidate> {
    let mut fallbacks: Vec<(u32, ProviderCandidate)> = admitted
        .iter()
        .filter(|c| &c.key != selected)
        .map(|c| (effective_weight(c, config), (*c).clone()))
        .collect();
    fallbacks.sort_by(|a, b| b.0.cmp(&a.0));
    fallbacks.truncate(config.selection.max_fallbacks);
    fallbacks.into_iter().map(|(_, candidate)| candidate).collect()
}
