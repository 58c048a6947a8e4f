use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider标识符
pub type ProviderId = String;

/// 模型标识符
pub type ModelId = String;

/// 后端组合键（provider + model）
///
/// 调度核心中所有按后端维度的状态（熔断器、指标、配额）都以这个
/// 结构体为键，而不是拼接字符串。Display 输出 "provider:model"
/// 仅用于日志展示。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    pub provider: ProviderId,
    pub model: ModelId,
}

impl BackendKey {
    pub fn new(provider: impl Into<ProviderId>, model: impl Into<ModelId>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}
