#[cfg(test)]
mod tests {
    use crate::dispatch::*;
    use async_trait::async_trait;
    use loquat_core::config::loader::SharedRoutingConfig;
    use loquat_core::config::model::{
        BreakerSettings, MetricsSettings, ProviderQuota, ProviderSettings, QuotaSettings,
        RateLimitSettings, RoutingConfig, SelectionSettings,
    };
    use loquat_core::provider::{
        InvocationError, InvocationRequest, InvocationResponse, OperationKind, ProviderClient,
        StaticProviderRegistry,
    };
    use loquat_core::types::{BackendKey, ModelId};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// 脚本化的假provider，行为可在测试中途切换
    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Succeed,
        FailUpstream(u16),
        FailQuota(Option<u64>),
        Hang,
    }

    struct ScriptedClient {
        id: String,
        behavior: Mutex<Behavior>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(id: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                behavior: Mutex::new(behavior),
                calls: AtomicU32::new(0),
            })
        }

        fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock() = behavior;
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        fn provider_id(&self) -> &str {
            &self.id
        }

        fn supported_models(&self) -> Vec<ModelId> {
            vec!["m".to_string()]
        }

        async fn invoke(
            &self,
            request: &InvocationRequest,
        ) -> Result<InvocationResponse, InvocationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.behavior.lock();
            match behavior {
                Behavior::Succeed => Ok(InvocationResponse::new(
                    self.id.clone(),
                    request.model.clone(),
                    json!({ "from": self.id }),
                )
                .with_usage_units(2)),
                Behavior::FailUpstream(status) => Err(InvocationError::Upstream {
                    status,
                    message: "scripted upstream failure".to_string(),
                }),
                Behavior::FailQuota(retry_after_seconds) => Err(InvocationError::QuotaExhausted {
                    retry_after_seconds,
                }),
                Behavior::Hang => std::future::pending().await,
            }
        }
    }

    /// 测试用降级策略：固定回答或固定失败
    struct CannedAnswer {
        name: String,
        fail: bool,
        calls: AtomicU32,
    }

    impl CannedAnswer {
        fn new(name: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FallbackStrategy for CannedAnswer {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> i32 {
            10
        }

        fn can_handle(&self, _failure: &AttemptFailure) -> bool {
            true
        }

        async fn execute(
            &self,
            request: &InvocationRequest,
            _failure: &AttemptFailure,
        ) -> anyhow::Result<InvocationResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("canned strategy declined");
            }
            Ok(InvocationResponse::new(
                "canned",
                request.model.clone(),
                json!({ "canned": true }),
            ))
        }
    }

    fn provider_settings(id: &str, weight: u32, timeout_seconds: u64) -> ProviderSettings {
        ProviderSettings {
            name: id.to_string(),
            models: vec!["m".to_string()],
            weight,
            enabled: true,
            timeout_seconds,
            rate_limit: None,
            quota: None,
        }
    }

    fn base_config(entries: &[(&str, u32, u64)]) -> RoutingConfig {
        let mut providers = HashMap::new();
        for (id, weight, timeout) in entries {
            providers.insert(id.to_string(), provider_settings(id, *weight, *timeout));
        }
        RoutingConfig {
            providers,
            selection: SelectionSettings::default(),
            breaker: BreakerSettings::default(),
            metrics: MetricsSettings::default(),
            rate_limit: RateLimitSettings::default(),
            quota: QuotaSettings::default(),
        }
    }

    fn build_engine(
        config: RoutingConfig,
        clients: &[(Arc<ScriptedClient>, u32)],
    ) -> Arc<DispatchEngine> {
        let registry = Arc::new(StaticProviderRegistry::new());
        for (client, weight) in clients {
            registry.register(client.clone(), *weight);
        }
        Arc::new(DispatchEngine::new(
            SharedRoutingConfig::new(config),
            registry,
        ))
    }

    fn chat_request() -> InvocationRequest {
        InvocationRequest::new(OperationKind::ChatCompletion, "m", json!({ "messages": [] }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_records_metrics_and_counters() {
        let alpha = ScriptedClient::new("alpha", Behavior::Succeed);
        let engine = build_engine(base_config(&[("alpha", 3, 30)]), &[(alpha.clone(), 3)]);

        let outcome = engine
            .dispatch(chat_request(), RoutingContext::new("m"))
            .await
            .unwrap();
        assert_eq!(outcome.served_by, BackendKey::new("alpha", "m"));
        assert_eq!(outcome.score, 30);
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::Success);

        let stats = engine.stats();
        assert_eq!(stats.total_dispatches, 1);
        assert_eq!(stats.successful_dispatches, 1);
        assert_eq!(stats.failed_dispatches, 0);

        let backends = engine.metrics().snapshot();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].provider, "alpha");
        assert_eq!(backends[0].successful_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_fallback_succeeds_with_audit_trail() {
        let slow = ScriptedClient::new("slow", Behavior::Hang);
        let steady = ScriptedClient::new("steady", Behavior::Succeed);
        let config = base_config(&[("slow", 5, 1), ("steady", 1, 30)]);
        let engine = build_engine(config, &[(slow.clone(), 5), (steady.clone(), 1)]);

        let context = RoutingContext::new("m").with_preferred_provider("slow");
        let outcome = engine.dispatch(chat_request(), context).await.unwrap();

        assert_eq!(outcome.served_by, BackendKey::new("steady", "m"));
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].key, BackendKey::new("slow", "m"));
        assert_eq!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failure(DispatchFailureKind::Timeout)
        );
        // 暂停时钟下超时耗时就是配置的1秒
        assert_eq!(outcome.attempts[0].elapsed, Duration::from_secs(1));
        assert_eq!(outcome.attempts[1].outcome, AttemptOutcome::Success);

        // 超时按普通失败计入熔断器和指标
        let breaker = engine
            .breakers()
            .get(&BackendKey::new("slow", "m"))
            .unwrap();
        assert_eq!(breaker.stats().failure_count, 1);
        let backends = engine.metrics().snapshot();
        let slow_row = backends.iter().find(|b| b.provider == "slow").unwrap();
        assert_eq!(slow_row.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_candidates_fail_aggregate_preserves_order() {
        let a = ScriptedClient::new("a", Behavior::FailUpstream(500));
        let b = ScriptedClient::new("b", Behavior::FailUpstream(502));
        let c = ScriptedClient::new("c", Behavior::FailUpstream(503));
        let config = base_config(&[("a", 3, 30), ("b", 2, 30), ("c", 1, 30)]);
        let engine = build_engine(config, &[(a.clone(), 3), (b.clone(), 2), (c.clone(), 1)]);

        let context = RoutingContext::new("m").with_preferred_provider("a");
        let err = engine.dispatch(chat_request(), context).await.unwrap_err();
        match err {
            DispatchError::Exhausted(aggregate) => {
                assert_eq!(aggregate.model, "m");
                assert_eq!(aggregate.attempt_count(), 3);
                let order: Vec<&str> = aggregate
                    .failures
                    .iter()
                    .map(|f| f.key.provider.as_str())
                    .collect();
                assert_eq!(order, vec!["a", "b", "c"]);
                assert!(aggregate
                    .failures
                    .iter()
                    .all(|f| f.kind == DispatchFailureKind::Server));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(c.calls(), 1);
        assert_eq!(engine.stats().failed_dispatches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_keeps_candidate_out_until_recovery() {
        let flaky = ScriptedClient::new("flaky", Behavior::FailUpstream(500));
        let healthy = ScriptedClient::new("healthy", Behavior::Succeed);
        let mut config = base_config(&[("flaky", 1, 30), ("healthy", 1, 30)]);
        config.breaker.failure_threshold = 1;
        let engine = build_engine(config, &[(flaky.clone(), 1), (healthy.clone(), 1)]);
        let context = RoutingContext::new("m").with_preferred_provider("flaky");

        // 第一跳失败即熔断，由healthy兜住
        let outcome = engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, BackendKey::new("healthy", "m"));
        assert_eq!(flaky.calls(), 1);

        // OPEN期间flaky连准入都过不了，不会再被调用
        for _ in 0..3 {
            let outcome = engine
                .dispatch(chat_request(), context.clone())
                .await
                .unwrap();
            assert_eq!(outcome.served_by, BackendKey::new("healthy", "m"));
            assert!(outcome.attempts.iter().all(|a| a.key.provider == "healthy"));
        }
        assert_eq!(flaky.calls(), 1);

        // 恢复期过后探测放行，修好的flaky回到轮换
        flaky.set_behavior(Behavior::Succeed);
        tokio::time::advance(Duration::from_secs(60)).await;
        let outcome = engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, BackendKey::new("flaky", "m"));
        assert_eq!(flaky.calls(), 2);
        assert_eq!(
            engine
                .breakers()
                .get(&BackendKey::new("flaky", "m"))
                .unwrap()
                .state(),
            CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_contention_rejected_in_audit_trail() {
        let flaky = ScriptedClient::new("flaky", Behavior::FailUpstream(500));
        let healthy = ScriptedClient::new("healthy", Behavior::Succeed);
        let mut config = base_config(&[("flaky", 1, 5), ("healthy", 1, 30)]);
        config.breaker.failure_threshold = 1;
        let engine = build_engine(config, &[(flaky.clone(), 1), (healthy.clone(), 1)]);
        let context = RoutingContext::new("m").with_preferred_provider("flaky");

        // 先把flaky打进OPEN，再推进到恢复期
        engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        // 第一路占住探测名额，挂起到5秒超时
        flaky.set_behavior(Behavior::Hang);
        let first = tokio::spawn({
            let engine = engine.clone();
            let context = context.clone();
            async move { engine.dispatch(chat_request(), context).await }
        });
        tokio::task::yield_now().await;

        // 第二路赶上HALF_OPEN名额已满：审计记一笔拒绝并换下一个候选
        let second = engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        assert_eq!(second.served_by, BackendKey::new("healthy", "m"));
        assert_eq!(second.attempts.len(), 2);
        assert_eq!(
            second.attempts[0].outcome,
            AttemptOutcome::Rejected(RejectReason::CircuitOpen)
        );

        // 第一路的探测超时失败，重开熔断，仍由healthy兜底
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.served_by, BackendKey::new("healthy", "m"));
        assert_eq!(
            first.attempts[0].outcome,
            AttemptOutcome::Failure(DispatchFailureKind::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_strategy_saves_dispatch() {
        let only = ScriptedClient::new("only", Behavior::FailUpstream(503));
        let engine = build_engine(base_config(&[("only", 2, 30)]), &[(only.clone(), 2)]);
        let canned = CannedAnswer::new("canned", false);
        engine.register_strategy(OperationKind::ChatCompletion, canned.clone());

        let outcome = engine
            .dispatch(chat_request(), RoutingContext::new("m"))
            .await
            .unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.used_fallback_strategy.as_deref(), Some("canned"));
        assert_eq!(outcome.response.payload["canned"], true);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failure(DispatchFailureKind::Server)
        );

        let stats = engine.stats();
        assert_eq!(stats.strategy_saves, 1);
        assert_eq!(stats.successful_dispatches, 1);
        assert_eq!(stats.failed_dispatches, 0);

        // 策略救回不抹掉provider的失败记录
        let backends = engine.metrics().snapshot();
        assert_eq!(backends[0].failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_strategy_falls_to_next_candidate() {
        let first = ScriptedClient::new("first", Behavior::FailUpstream(500));
        let second = ScriptedClient::new("second", Behavior::Succeed);
        let config = base_config(&[("first", 1, 30), ("second", 1, 30)]);
        let engine = build_engine(config, &[(first.clone(), 1), (second.clone(), 1)]);
        let broken = CannedAnswer::new("broken", true);
        engine.register_strategy(OperationKind::ChatCompletion, broken.clone());

        let context = RoutingContext::new("m").with_preferred_provider("first");
        let outcome = engine.dispatch(chat_request(), context).await.unwrap();

        assert_eq!(outcome.served_by, BackendKey::new("second", "m"));
        assert!(outcome.used_fallback_strategy.is_none());
        // 只有first真正失败过，策略只被问了一次
        assert_eq!(broken.calls(), 1);
        assert_eq!(engine.stats().strategy_saves, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retries_without_false_failures() {
        let hung = ScriptedClient::new("hung", Behavior::Hang);
        let spare = ScriptedClient::new("spare", Behavior::Succeed);
        let config = base_config(&[("hung", 1, 300), ("spare", 1, 30)]);
        let engine = build_engine(config, &[(hung.clone(), 1), (spare.clone(), 1)]);

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            let context = RoutingContext::new("m").with_preferred_provider("hung");
            async move {
                engine
                    .dispatch_with_cancel(chat_request(), context, cancel)
                    .await
            }
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Cancelled)));

        // 在途尝试不记失败，没轮到的候选没有任何记录
        assert_eq!(hung.calls(), 1);
        assert_eq!(spare.calls(), 0);
        assert!(engine.metrics().snapshot().is_empty());
        let breaker = engine
            .breakers()
            .get(&BackendKey::new("hung", "m"))
            .unwrap();
        assert_eq!(breaker.stats().failure_count, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(engine.stats().cancelled_dispatches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_quota_exhaustion_gates_provider() {
        let metered = ScriptedClient::new("metered", Behavior::FailQuota(Some(30)));
        let other = ScriptedClient::new("other", Behavior::Succeed);
        let config = base_config(&[("metered", 1, 30), ("other", 1, 30)]);
        let engine = build_engine(config, &[(metered.clone(), 1), (other.clone(), 1)]);
        let context = RoutingContext::new("m").with_preferred_provider("metered");

        // 上游报配额耗尽，这一次由other兜住
        let outcome = engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, BackendKey::new("other", "m"));
        assert_eq!(
            outcome.attempts[0].outcome,
            AttemptOutcome::Failure(DispatchFailureKind::QuotaExhausted)
        );
        assert!(!engine.quota().has_quota("metered"));

        // 冷却期内metered直接被准入过滤，不再挨打
        engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        assert_eq!(metered.calls(), 1);

        // retry-after到点后自动恢复准入
        metered.set_behavior(Behavior::Succeed);
        tokio::time::advance(Duration::from_secs(30)).await;
        let outcome = engine
            .dispatch(chat_request(), context.clone())
            .await
            .unwrap();
        assert_eq!(outcome.served_by, BackendKey::new("metered", "m"));
        assert_eq!(metered.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_units_count_against_budget() {
        let alpha = ScriptedClient::new("alpha", Behavior::Succeed);
        let mut config = base_config(&[("alpha", 1, 30)]);
        if let Some(settings) = config.providers.get_mut("alpha") {
            settings.quota = Some(ProviderQuota {
                max_units_per_interval: 5,
                interval_seconds: 60,
            });
        }
        let engine = build_engine(config, &[(alpha.clone(), 1)]);

        // 每次成功记2个单位，三次后预算（5）耗尽
        for _ in 0..2 {
            engine
                .dispatch(chat_request(), RoutingContext::new("m"))
                .await
                .unwrap();
        }
        assert!(engine.quota().has_quota("alpha"));
        engine
            .dispatch(chat_request(), RoutingContext::new("m"))
            .await
            .unwrap();
        assert!(!engine.quota().has_quota("alpha"));

        let err = engine
            .dispatch(chat_request(), RoutingContext::new("m"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoCandidates { .. }));

        // 预算随区间滚动自动恢复
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(engine.quota().has_quota("alpha"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_time_rate_denial_recorded_as_rejection() {
        let slow = ScriptedClient::new("slow", Behavior::Hang);
        let capped = ScriptedClient::new("capped", Behavior::Succeed);
        let mut config = base_config(&[("slow", 1, 5), ("capped", 1, 30)]);
        if let Some(settings) = config.providers.get_mut("capped") {
            settings.rate_limit = Some(RateLimitSettings {
                capacity: 1,
                refill_per_second: 0,
            });
        }
        let engine = build_engine(config, &[(slow.clone(), 1), (capped.clone(), 1)]);
        let context = RoutingContext::new("m").with_preferred_provider("slow");

        let task = tokio::spawn({
            let engine = engine.clone();
            let context = context.clone();
            async move { engine.dispatch(chat_request(), context).await }
        });
        tokio::task::yield_now().await;

        // 第一跳在途期间许可被别处耗光，轮到备选时按拒绝记账
        assert!(engine.rate_limits().try_acquire("capped"));

        let err = task.await.unwrap().unwrap_err();
        match err {
            DispatchError::Exhausted(aggregate) => {
                assert_eq!(aggregate.attempt_count(), 2);
                assert_eq!(aggregate.failures[0].kind, DispatchFailureKind::Timeout);
                assert_eq!(aggregate.failures[1].kind, DispatchFailureKind::RateLimit);
            }
            other => panic!("unexpected error: {other}"),
        }

        // capped从未被真正调用，也没有失败指标
        assert_eq!(capped.calls(), 0);
        assert!(engine
            .metrics()
            .snapshot()
            .iter()
            .all(|b| b.provider != "capped"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_candidates_for_unknown_model() {
        let alpha = ScriptedClient::new("alpha", Behavior::Succeed);
        let engine = build_engine(base_config(&[("alpha", 1, 30)]), &[(alpha.clone(), 1)]);

        let request = InvocationRequest::new(OperationKind::ChatCompletion, "unknown", json!({}));
        let err = engine
            .dispatch(request, RoutingContext::new("unknown"))
            .await
            .unwrap_err();
        match err {
            DispatchError::NoCandidates { model, reasons } => {
                assert_eq!(model, "unknown");
                assert!(reasons.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.stats().failed_dispatches, 1);
        assert_eq!(alpha.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_telemetry_snapshot_serializes() {
        let alpha = ScriptedClient::new("alpha", Behavior::Succeed);
        let engine = build_engine(base_config(&[("alpha", 1, 30)]), &[(alpha.clone(), 1)]);
        engine
            .dispatch(chat_request(), RoutingContext::new("m"))
            .await
            .unwrap();

        let telemetry = engine.telemetry();
        assert_eq!(telemetry.dispatch.total_dispatches, 1);
        assert_eq!(telemetry.backends.len(), 1);
        assert_eq!(telemetry.breakers.len(), 1);

        let rendered = serde_json::to_string(&telemetry).unwrap();
        assert!(rendered.contains("\"alpha\""));
        assert!(rendered.contains("closed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_through_trait_object() {
        let alpha = ScriptedClient::new("alpha", Behavior::Succeed);
        let engine = build_engine(base_config(&[("alpha", 1, 30)]), &[(alpha.clone(), 1)]);
        let dispatcher: Arc<dyn Dispatcher> = engine;

        let outcome = dispatcher
            .dispatch(chat_request(), RoutingContext::new("m"))
            .await
            .unwrap();
        assert_eq!(outcome.served_by, BackendKey::new("alpha", "m"));
        assert_eq!(dispatcher.stats().successful_dispatches, 1);
    }
}
