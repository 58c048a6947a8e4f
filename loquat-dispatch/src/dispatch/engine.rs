use chrono::{DateTime, Utc};
use loquat_core::config::loader::SharedRoutingConfig;
use loquat_core::config::model::RoutingConfig;
use loquat_core::provider::{
    InvocationError, InvocationRequest, InvocationResponse, OperationKind, ProviderCandidate,
    ProviderRegistry,
};
use loquat_core::types::BackendKey;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::breaker::{BreakerBank, BreakerStats};
use super::classify::{classify_invocation_error, DispatchFailureKind};
use super::error::{
    AggregateDispatchError, AttemptFailure, DispatchError, RejectReason,
};
use super::fallback::{FallbackRegistry, FallbackStrategy};
use super::metrics::{BackendMetrics, MetricsCache};
use super::quota::{QuotaGate, QuotaSnapshot};
use super::rate_limit::RateLimiterBank;
use super::selector::{ProviderSelector, RoutingContext};

/// 单次尝试的结局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// 调用成功
    Success,
    /// 调用失败，带失败分类
    Failure(DispatchFailureKind),
    /// 没有真正调用就被拦下（熔断拒绝、限流无许可）
    Rejected(RejectReason),
}

/// 审计轨迹中的一条尝试记录
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub key: BackendKey,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// 一次调度的最终结果
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: InvocationResponse,
    /// 实际出结果的后端；降级结果时为触发降级的那个后端
    pub served_by: BackendKey,
    /// 选择器给出的诊断分数
    pub score: u64,
    /// 结果出自降级策略时记录策略名
    pub used_fallback_strategy: Option<String>,
    /// 按时间顺序的完整尝试轨迹
    pub attempts: Vec<AttemptRecord>,
}

impl DispatchOutcome {
    /// 是否为降级结果
    pub fn is_degraded(&self) -> bool {
        self.used_fallback_strategy.is_some()
    }
}

/// 引擎级计数器快照
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub total_dispatches: u64,
    pub successful_dispatches: u64,
    pub failed_dispatches: u64,
    pub cancelled_dispatches: u64,
    /// 降级策略救回来的次数
    pub strategy_saves: u64,
    pub generated_at: DateTime<Utc>,
}

/// 全量遥测快照：引擎计数器加各组件视图
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub dispatch: DispatchStats,
    pub backends: Vec<BackendMetrics>,
    pub breakers: Vec<BreakerStats>,
    pub quota: Vec<QuotaSnapshot>,
}

/// 调度引擎
///
/// 把选择器、熔断器、配额闸门、限流桶、指标缓存和降级注册表
/// 串成一条调度流水线：选出候选链，逐个尝试，成功即返回，全部
/// 失败时按尝试顺序聚合错误。所有组件显式构造注入，不依赖全局
/// 状态，同一个引擎可被任意多协程并发使用。
pub struct DispatchEngine {
    config: SharedRoutingConfig,
    registry: Arc<dyn ProviderRegistry>,
    selector: ProviderSelector,
    metrics: Arc<MetricsCache>,
    breakers: Arc<BreakerBank>,
    quota: Arc<QuotaGate>,
    rate_limits: Arc<RateLimiterBank>,
    fallbacks: Arc<FallbackRegistry>,
    total_dispatches: AtomicU64,
    successful_dispatches: AtomicU64,
    failed_dispatches: AtomicU64,
    cancelled_dispatches: AtomicU64,
    strategy_saves: AtomicU64,
}

impl DispatchEngine {
    /// 从配置句柄和provider注册表装配引擎，各组件按配置新建
    pub fn new(config: SharedRoutingConfig, registry: Arc<dyn ProviderRegistry>) -> Self {
        let snapshot = config.load();
        let metrics = Arc::new(MetricsCache::new(snapshot.metrics.clone()));
        let breakers = Arc::new(BreakerBank::new(snapshot.breaker.clone()));
        let quota = Arc::new(QuotaGate::from_config(&snapshot));
        let rate_limits = Arc::new(RateLimiterBank::from_config(snapshot.clone()));
        Self::with_components(
            config,
            registry,
            metrics,
            breakers,
            quota,
            rate_limits,
            Arc::new(FallbackRegistry::new()),
        )
    }

    /// 用外部构造的组件装配引擎
    ///
    /// 组件按引用共享：嵌入方可以把同一组熔断器/指标/闸门同时交给
    /// 引擎和自己的运维面，两边看到的是同一份状态。
    pub fn with_components(
        config: SharedRoutingConfig,
        registry: Arc<dyn ProviderRegistry>,
        metrics: Arc<MetricsCache>,
        breakers: Arc<BreakerBank>,
        quota: Arc<QuotaGate>,
        rate_limits: Arc<RateLimiterBank>,
        fallbacks: Arc<FallbackRegistry>,
    ) -> Self {
        let selector = ProviderSelector::new(
            metrics.clone(),
            breakers.clone(),
            quota.clone(),
            rate_limits.clone(),
        );

        Self {
            config,
            registry,
            selector,
            metrics,
            breakers,
            quota,
            rate_limits,
            fallbacks,
            total_dispatches: AtomicU64::new(0),
            successful_dispatches: AtomicU64::new(0),
            failed_dispatches: AtomicU64::new(0),
            cancelled_dispatches: AtomicU64::new(0),
            strategy_saves: AtomicU64::new(0),
        }
    }

    /// 调度一次请求，不带外部取消
    pub async fn dispatch(
        &self,
        request: InvocationRequest,
        context: RoutingContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_with_cancel(request, context, CancellationToken::new())
            .await
    }

    /// 调度一次请求，调用方可随时通过token取消
    ///
    /// 取消立即停止后续重试：在途尝试被丢弃且不记为provider失败，
    /// 没轮到的候选不会留下任何记录。
    pub async fn dispatch_with_cancel(
        &self,
        request: InvocationRequest,
        context: RoutingContext,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.total_dispatches.fetch_add(1, Ordering::Relaxed);

        // 路由上下文与请求不一致时以请求为准
        let mut context = context;
        if context.model != request.model {
            if !context.model.is_empty() {
                tracing::warn!(
                    "Routing context model '{}' does not match request model '{}', using request model",
                    context.model,
                    request.model
                );
            }
            context.model = request.model.clone();
        }

        let config = self.config.load();
        let candidates = self.registry.candidates_for_model(&context.model);
        let selection = match self.selector.select(&candidates, &context, &config) {
            Ok(selection) => selection,
            Err(e) => {
                self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let score = selection.score;

        let mut chain = Vec::with_capacity(1 + selection.fallbacks.len());
        chain.push(selection.selected);
        chain.extend(selection.fallbacks);

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut failures: Vec<AttemptFailure> = Vec::new();

        for candidate in chain {
            if cancel.is_cancelled() {
                tracing::info!("Dispatch cancelled before trying backend {}", candidate.key);
                self.cancelled_dispatches.fetch_add(1, Ordering::Relaxed);
                return Err(DispatchError::Cancelled);
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // 在途调用被丢弃，熔断器守卫归还探测名额，不记失败
                    tracing::info!("Dispatch cancelled while backend {} in flight", candidate.key);
                    self.cancelled_dispatches.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::Cancelled);
                }
                result = self.attempt_candidate(&candidate, &request, &context, &config) => result,
            };
            let elapsed = started.elapsed();

            match result {
                Ok(response) => {
                    self.metrics.record_success(&candidate.key, elapsed);
                    self.quota
                        .record_usage(&candidate.key.provider, response.usage_units);
                    attempts.push(AttemptRecord {
                        key: candidate.key.clone(),
                        outcome: AttemptOutcome::Success,
                        elapsed,
                    });
                    self.successful_dispatches.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        "Dispatch served by backend {} in {:?} (score {})",
                        candidate.key,
                        elapsed,
                        score
                    );
                    return Ok(DispatchOutcome {
                        response,
                        served_by: candidate.key,
                        score,
                        used_fallback_strategy: None,
                        attempts,
                    });
                }
                Err(DispatchError::CircuitOpen { key, retry_in }) => {
                    // 熔断拒绝不是provider失败：不记指标，直接换下一个候选
                    tracing::debug!(
                        "Backend {} rejected by circuit breaker, retry in {:?}",
                        key,
                        retry_in
                    );
                    attempts.push(AttemptRecord {
                        key: candidate.key.clone(),
                        outcome: AttemptOutcome::Rejected(RejectReason::CircuitOpen),
                        elapsed,
                    });
                    failures.push(AttemptFailure {
                        key: candidate.key.clone(),
                        kind: DispatchFailureKind::CircuitRejected,
                        message: format!("circuit open, retry in {retry_in:?}"),
                    });
                }
                Err(DispatchError::QuotaExhausted {
                    provider,
                    retry_after,
                }) => {
                    tracing::debug!(
                        "Provider '{}' out of quota at attempt time, retry after {:?}",
                        provider,
                        retry_after
                    );
                    attempts.push(AttemptRecord {
                        key: candidate.key.clone(),
                        outcome: AttemptOutcome::Rejected(RejectReason::QuotaExhausted),
                        elapsed,
                    });
                    failures.push(AttemptFailure {
                        key: candidate.key.clone(),
                        kind: DispatchFailureKind::QuotaExhausted,
                        message: match retry_after {
                            Some(wait) => format!("quota exhausted, retry after {wait:?}"),
                            None => "quota exhausted".to_string(),
                        },
                    });
                }
                Err(DispatchError::RateLimited { key }) => {
                    tracing::debug!("Rate limit permit denied for backend {}", key);
                    attempts.push(AttemptRecord {
                        key: key.clone(),
                        outcome: AttemptOutcome::Rejected(RejectReason::RateLimited),
                        elapsed,
                    });
                    failures.push(AttemptFailure {
                        key,
                        kind: DispatchFailureKind::RateLimit,
                        message: "rate limit permit denied".to_string(),
                    });
                }
                Err(DispatchError::Invocation { key, kind, source }) => {
                    self.metrics.record_failure(&candidate.key, kind);
                    if let InvocationError::QuotaExhausted {
                        retry_after_seconds,
                    } = &source
                    {
                        // 上游报配额耗尽，同步关掉这个provider的准入
                        self.quota.report_exhaustion(
                            &candidate.key.provider,
                            retry_after_seconds.map(Duration::from_secs),
                        );
                    }
                    tracing::warn!("Backend {} failed ({}): {}", key, kind, source);
                    attempts.push(AttemptRecord {
                        key: candidate.key.clone(),
                        outcome: AttemptOutcome::Failure(kind),
                        elapsed,
                    });
                    let failure = AttemptFailure {
                        key,
                        kind,
                        message: source.to_string(),
                    };

                    // 真正的调用失败才询问降级策略，拒绝不问
                    if let Some((response, strategy)) =
                        self.fallbacks.try_resolve(&request, &failure).await
                    {
                        self.strategy_saves.fetch_add(1, Ordering::Relaxed);
                        self.successful_dispatches.fetch_add(1, Ordering::Relaxed);
                        return Ok(DispatchOutcome {
                            response,
                            served_by: candidate.key,
                            score,
                            used_fallback_strategy: Some(strategy),
                            attempts,
                        });
                    }
                    failures.push(failure);
                }
                Err(other) => {
                    // attempt_candidate只产生上面几类错误，兜底按Other记一笔
                    attempts.push(AttemptRecord {
                        key: candidate.key.clone(),
                        outcome: AttemptOutcome::Failure(DispatchFailureKind::Other),
                        elapsed,
                    });
                    failures.push(AttemptFailure {
                        key: candidate.key.clone(),
                        kind: DispatchFailureKind::Other,
                        message: other.to_string(),
                    });
                }
            }
        }

        self.failed_dispatches.fetch_add(1, Ordering::Relaxed);
        let aggregate = AggregateDispatchError {
            model: context.model.clone(),
            failures,
        };
        tracing::error!("{}", aggregate);
        Err(DispatchError::Exhausted(aggregate))
    }

    /// 对单个候选做一次尝试：先过配额和限流闸门，再做带熔断与
    /// 超时的调用
    async fn attempt_candidate(
        &self,
        candidate: &ProviderCandidate,
        request: &InvocationRequest,
        context: &RoutingContext,
        config: &RoutingConfig,
    ) -> Result<InvocationResponse, DispatchError> {
        let key = &candidate.key;

        // 准入检查是咨询性的，预算可能在选完之后被并发请求占掉，
        // 尝试前以闸门此刻的答案为准
        if !self.quota.has_quota(&key.provider) {
            return Err(DispatchError::QuotaExhausted {
                provider: key.provider.clone(),
                retry_after: self.quota.retry_after(&key.provider),
            });
        }

        // 许可在真正尝试时才消费，被抽中不等于放行
        if !self.rate_limits.try_acquire(&key.provider) {
            return Err(DispatchError::RateLimited { key: key.clone() });
        }

        let client = self.registry.client(&key.provider).ok_or_else(|| {
            DispatchError::Invocation {
                key: key.clone(),
                kind: DispatchFailureKind::Other,
                source: InvocationError::Other(format!(
                    "no client registered for provider '{}'",
                    key.provider
                )),
            }
        })?;

        let timeout = context
            .timeout
            .or(candidate.timeout)
            .unwrap_or_else(|| config.provider_timeout(&key.provider));

        let breaker = self.breakers.breaker(key);
        breaker
            .call(|| async {
                // 超时放在熔断call内部执行，超时按普通失败计入状态机
                match tokio::time::timeout(timeout, client.invoke(request)).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => {
                        let kind = classify_invocation_error(&e);
                        Err(DispatchError::Invocation {
                            key: key.clone(),
                            kind,
                            source: e,
                        })
                    }
                    Err(_) => Err(DispatchError::Invocation {
                        key: key.clone(),
                        kind: DispatchFailureKind::Timeout,
                        source: InvocationError::Other(format!(
                            "request timed out after {timeout:?}"
                        )),
                    }),
                }
            })
            .await
    }

    /// 引擎计数器快照
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            total_dispatches: self.total_dispatches.load(Ordering::Relaxed),
            successful_dispatches: self.successful_dispatches.load(Ordering::Relaxed),
            failed_dispatches: self.failed_dispatches.load(Ordering::Relaxed),
            cancelled_dispatches: self.cancelled_dispatches.load(Ordering::Relaxed),
            strategy_saves: self.strategy_saves.load(Ordering::Relaxed),
            generated_at: Utc::now(),
        }
    }

    /// 引擎加所有组件的全量遥测
    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            dispatch: self.stats(),
            backends: self.metrics.snapshot(),
            breakers: self.breakers.snapshot(),
            quota: self.quota.snapshot(),
        }
    }

    // 运维操作

    /// 强制熔断某个后端
    pub fn trip_open(&self, key: &BackendKey) {
        self.breakers.trip_open(key);
    }

    /// 强制复位某个后端的熔断器
    pub fn reset_breaker(&self, key: &BackendKey) -> bool {
        self.breakers.reset(key)
    }

    /// 登记降级策略
    pub fn register_strategy(&self, operation: OperationKind, strategy: Arc<dyn FallbackStrategy>) {
        self.fallbacks.register(operation, strategy);
    }

    /// 注销降级策略
    pub fn unregister_strategy(&self, operation: OperationKind, name: &str) -> bool {
        self.fallbacks.unregister(operation, name)
    }

    /// 人工上报某个provider配额耗尽
    pub fn report_exhaustion(&self, provider: &str, retry_after: Option<Duration>) {
        self.quota.report_exhaustion(provider, retry_after);
    }

    // 组件访问器，嵌入方基于它们做只读观测或精细运维

    pub fn config(&self) -> &SharedRoutingConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCache> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerBank> {
        &self.breakers
    }

    pub fn quota(&self) -> &Arc<QuotaGate> {
        &self.quota
    }

    pub fn rate_limits(&self) -> &Arc<RateLimiterBank> {
        &self.rate_limits
    }

    pub fn fallback_registry(&self) -> &Arc<FallbackRegistry> {
        &self.fallbacks
    }
}
