use crate::types::{BackendKey, ModelId, ProviderId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 调度的操作类型
///
/// 降级策略按操作类型注册，不同操作的降级语义互不影响。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    ChatCompletion,
    Completion,
    Embedding,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::ChatCompletion => write!(f, "chat_completion"),
            OperationKind::Completion => write!(f, "completion"),
            OperationKind::Embedding => write!(f, "embedding"),
        }
    }
}

/// Provider能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Chat,
    Completion,
    Embedding,
    Streaming,
    ToolUse,
}

/// 调用请求
///
/// 载荷按原样透传给provider实现，这一层不做DTO编组。
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub operation: OperationKind,
    pub model: ModelId,
    pub payload: Value,
    pub tenant: Option<String>,
}

impl InvocationRequest {
    pub fn new(operation: OperationKind, model: impl Into<ModelId>, payload: Value) -> Self {
        Self {
            operation,
            model: model.into(),
            payload,
            tenant: None,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// 调用响应
#[derive(Debug, Clone)]
pub struct InvocationResponse {
    pub provider: ProviderId,
    pub model: ModelId,
    pub payload: Value,
    /// 本次调用消耗的配额单位（token数或请求数，由provider实现决定）
    pub usage_units: u64,
}

impl InvocationResponse {
    pub fn new(provider: impl Into<ProviderId>, model: impl Into<ModelId>, payload: Value) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            payload,
            usage_units: 1,
        }
    }

    pub fn with_usage_units(mut self, units: u64) -> Self {
        self.usage_units = units;
        self
    }
}

// 定义provider调用错误类型
#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("网络请求失败: {0}")]
    Network(String),
    #[error("认证失败: {0}")]
    Auth(String),
    #[error("上游限流: retry_after={retry_after_seconds:?}")]
    RateLimited { retry_after_seconds: Option<u64> },
    #[error("上游配额耗尽: retry_after={retry_after_seconds:?}")]
    QuotaExhausted { retry_after_seconds: Option<u64> },
    #[error("上游API返回错误: 状态码 {status}")]
    Upstream { status: u16, message: String },
    #[error("模型不可用: {0}")]
    ModelNotFound(String),
    #[error("其他错误: {0}")]
    Other(String),
}

/// 参与选择的候选后端
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub key: BackendKey,
    /// 配置权重，选择器按权重比例分配流量
    pub weight: u32,
    pub capabilities: Vec<Capability>,
    /// 可用性开关（注册侧维护，选择器只读）
    pub available: bool,
    /// 单次调用超时，缺省使用配置中的provider超时
    pub timeout: Option<Duration>,
}

impl ProviderCandidate {
    pub fn new(key: BackendKey, weight: u32) -> Self {
        Self {
            key,
            weight,
            capabilities: vec![Capability::Chat],
            available: true,
            timeout: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
