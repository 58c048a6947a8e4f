use async_trait::async_trait;
use loquat_core::provider::InvocationRequest;
use tokio_util::sync::CancellationToken;

use super::engine::{DispatchEngine, DispatchOutcome, DispatchStats};
use super::error::DispatchError;
use super::selector::RoutingContext;

/// 调度入口的抽象
///
/// 嵌入方依赖这个trait而不是具体引擎，方便在测试里替换成
/// 录制好的假实现，或者在引擎外再包一层（鉴权、审计等）。
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// 调度一次请求
    async fn dispatch(
        &self,
        request: InvocationRequest,
        context: RoutingContext,
    ) -> Result<DispatchOutcome, DispatchError>;

    /// 带取消令牌的调度
    async fn dispatch_with_cancel(
        &self,
        request: InvocationRequest,
        context: RoutingContext,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError>;

    /// 引擎级计数器
    fn stats(&self) -> DispatchStats;
}

#[async_trait]
impl Dispatcher for DispatchEngine {
    async fn dispatch(
        &self,
        request: InvocationRequest,
        context: RoutingContext,
    ) -> Result<DispatchOutcome, DispatchError> {
        DispatchEngine::dispatch(self, request, context).await
    }

    async fn dispatch_with_cancel(
        &self,
        request: InvocationRequest,
        context: RoutingContext,
        cancel: CancellationToken,
    ) -> Result<DispatchOutcome, DispatchError> {
        DispatchEngine::dispatch_with_cancel(self, request, context, cancel).await
    }

    fn stats(&self) -> DispatchStats {
        DispatchEngine::stats(self)
    }
}
