use loquat_core::provider::InvocationError;
use serde::Serialize;
use std::fmt;

/// 调度失败分类
///
/// 指标窗口、聚合错误和降级策略的canHandle都基于这个分类，
/// 分类只在引擎入口做一次。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailureKind {
    /// 连接失败、DNS失败等网络层错误
    Network,
    /// 401/403、API密钥无效
    Authentication,
    /// 上游429或本地限流拒绝
    RateLimit,
    /// 上游配额耗尽
    QuotaExhausted,
    /// 上游5xx
    Server,
    /// 模型不存在、参数错误
    Model,
    /// 调用超时
    Timeout,
    /// 熔断器拒绝，未发起调用
    CircuitRejected,
    /// 未归类错误
    Other,
}

impl fmt::Display for DispatchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DispatchFailureKind::Network => "network",
            DispatchFailureKind::Authentication => "authentication",
            DispatchFailureKind::RateLimit => "rate_limit",
            DispatchFailureKind::QuotaExhausted => "quota_exhausted",
            DispatchFailureKind::Server => "server",
            DispatchFailureKind::Model => "model",
            DispatchFailureKind::Timeout => "timeout",
            DispatchFailureKind::CircuitRejected => "circuit_rejected",
            DispatchFailureKind::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// 将provider调用错误归类
pub fn classify_invocation_error(error: &InvocationError) -> DispatchFailureKind {
    match error {
        InvocationError::Network(_) => DispatchFailureKind::Network,
        InvocationError::Auth(_) => DispatchFailureKind::Authentication,
        InvocationError::RateLimited { .. } => DispatchFailureKind::RateLimit,
        InvocationError::QuotaExhausted { .. } => DispatchFailureKind::QuotaExhausted,
        InvocationError::Upstream { status, .. } if *status >= 500 => DispatchFailureKind::Server,
        InvocationError::Upstream { status, .. } if *status == 404 => DispatchFailureKind::Model,
        InvocationError::Upstream { .. } => DispatchFailureKind::Other,
        InvocationError::ModelNotFound(_) => DispatchFailureKind::Model,
        InvocationError::Other(_) => DispatchFailureKind::Other,
    }
}
