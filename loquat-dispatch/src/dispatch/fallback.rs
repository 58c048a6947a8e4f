use async_trait::async_trait;
use loquat_core::provider::{InvocationRequest, InvocationResponse, OperationKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::AttemptFailure;

/// 降级策略接口
///
/// 所有候选后端都失败后，按优先级依次询问登记在对应操作类型下的
/// 策略。典型实现：返回缓存回答、改写为更便宜的模型重试、返回
/// 预设的兜底文案。
#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    /// 策略名，登记与注销都以它为准
    fn name(&self) -> &str;

    /// 优先级，数字小的先被询问
    fn priority(&self) -> i32;

    /// 是否愿意处理这次失败
    fn can_handle(&self, failure: &AttemptFailure) -> bool;

    /// 尝试给出降级响应
    async fn execute(
        &self,
        request: &InvocationRequest,
        failure: &AttemptFailure,
    ) -> anyhow::Result<InvocationResponse>;
}

/// 按操作类型登记降级策略的注册表
///
/// 同一操作类型下的策略按priority()升序排列，相同优先级保持登记
/// 顺序。策略执行失败只记日志并继续问下一个，注册表本身不产生
/// 新的错误，最终都失败时由调用方把原始失败原样抛出。
pub struct FallbackRegistry {
    strategies: RwLock<HashMap<OperationKind, Vec<Arc<dyn FallbackStrategy>>>>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
        }
    }

    /// 登记一个策略
    pub fn register(&self, operation: OperationKind, strategy: Arc<dyn FallbackStrategy>) {
        let mut strategies = self.strategies.write();
        let entry = strategies.entry(operation).or_default();
        tracing::info!(
            "Registered fallback strategy '{}' (priority {}) for operation {}",
            strategy.name(),
            strategy.priority(),
            operation
        );
        entry.push(strategy);
        // sort_by_key是稳定排序，相同优先级保持登记顺序
        entry.sort_by_key(|s| s.priority());
    }

    /// 按名字注销策略，返回是否确实删掉了
    pub fn unregister(&self, operation: OperationKind, name: &str) -> bool {
        let mut strategies = self.strategies.write();
        if let Some(entry) = strategies.get_mut(&operation) {
            let before = entry.len();
            entry.retain(|s| s.name() != name);
            if entry.len() < before {
                tracing::info!(
                    "Unregistered fallback strategy '{}' for operation {}",
                    name,
                    operation
                );
                return true;
            }
        }
        false
    }

    /// 某操作类型下登记的策略，按优先级排列
    pub fn handlers_for(&self, operation: OperationKind) -> Vec<Arc<dyn FallbackStrategy>> {
        self.strategies
            .read()
            .get(&operation)
            .cloned()
            .unwrap_or_default()
    }

    /// 依次询问策略，返回第一个成功的降级响应和策略名
    pub async fn try_resolve(
        &self,
        request: &InvocationRequest,
        failure: &AttemptFailure,
    ) -> Option<(InvocationResponse, String)> {
        let candidates = self.handlers_for(request.operation);
        for strategy in candidates {
            if !strategy.can_handle(failure) {
                continue;
            }
            tracing::debug!(
                "Trying fallback strategy '{}' for operation {} after {} failure",
                strategy.name(),
                request.operation,
                failure.kind
            );
            match strategy.execute(request, failure).await {
                Ok(response) => {
                    tracing::info!(
                        "Fallback strategy '{}' produced a degraded response for model {}",
                        strategy.name(),
                        request.model
                    );
                    return Some((response, strategy.name().to_string()));
                }
                Err(e) => {
                    tracing::warn!(
                        "Fallback strategy '{}' failed: {}, trying next",
                        strategy.name(),
                        e
                    );
                }
            }
        }
        None
    }
}

impl Default for FallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}
