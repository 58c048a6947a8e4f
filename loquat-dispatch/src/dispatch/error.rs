use loquat_core::provider::InvocationError;
use loquat_core::types::BackendKey;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use super::classify::DispatchFailureKind;

/// 准入阶段拒绝某个候选的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// 注册侧标记不可用
    Unavailable,
    /// 缺少请求要求的能力
    MissingCapability,
    /// 熔断器处于OPEN且未到恢复时间
    CircuitOpen,
    /// 配额闸门报告耗尽
    QuotaExhausted,
    /// 限流桶无可用许可
    RateLimited,
}

/// 被准入过滤拦下的候选及原因，用于NoCandidates诊断
#[derive(Debug, Clone)]
pub struct RejectedCandidate {
    pub key: BackendKey,
    pub reason: RejectReason,
}

/// 一次失败尝试的摘要
///
/// 聚合错误按尝试顺序收集它，降级策略的can_handle也以它为输入。
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub key: BackendKey,
    pub kind: DispatchFailureKind,
    pub message: String,
}

/// 调度错误
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No admissible candidates for model '{model}' ({} rejected)", .reasons.len())]
    NoCandidates {
        model: String,
        reasons: Vec<RejectedCandidate>,
    },

    #[error("Circuit open for backend {key}, retry in {retry_in:?}")]
    CircuitOpen {
        key: BackendKey,
        retry_in: Option<Duration>,
    },

    #[error("Invocation failed for backend {key} ({kind}): {source}")]
    Invocation {
        key: BackendKey,
        kind: DispatchFailureKind,
        #[source]
        source: InvocationError,
    },

    #[error("Quota exhausted for provider '{provider}', retry after {retry_after:?}")]
    QuotaExhausted {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Rate limit permit denied for backend {key}")]
    RateLimited { key: BackendKey },

    #[error(transparent)]
    Exhausted(#[from] AggregateDispatchError),

    #[error("Dispatch cancelled by caller")]
    Cancelled,
}

impl DispatchError {
    /// 是否为候选耗尽的聚合错误
    pub fn is_exhausted(&self) -> bool {
        matches!(self, DispatchError::Exhausted(_))
    }
}

/// 所有候选都失败后的聚合错误
///
/// failures按尝试顺序排列，每个候选一条。
#[derive(Debug, Error)]
#[error("All {} candidates failed for model '{model}'", .failures.len())]
pub struct AggregateDispatchError {
    pub model: String,
    pub failures: Vec<AttemptFailure>,
}

impl AggregateDispatchError {
    pub fn attempt_count(&self) -> usize {
        self.failures.len()
    }
}
