use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::types::{
    Capability, InvocationError, InvocationRequest, InvocationResponse, ProviderCandidate,
};
use crate::config::model::RoutingConfig;
use crate::types::{BackendKey, ModelId, ProviderId};

/// Provider调用能力接口
///
/// 具体的HTTP/SDK客户端在这条边界之外实现，调度核心只依赖
/// invoke能力和能力元数据。
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider标识
    fn provider_id(&self) -> &str;

    /// 支持的模型列表
    fn supported_models(&self) -> Vec<ModelId>;

    /// 能力标签
    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::Chat]
    }

    /// 执行一次调用
    async fn invoke(
        &self,
        request: &InvocationRequest,
    ) -> Result<InvocationResponse, InvocationError>;
}

/// Provider注册表的只读视图
///
/// 调度引擎通过它枚举候选并解析客户端，允许不同的实现策略
/// 并支持依赖注入和单元测试
pub trait ProviderRegistry: Send + Sync {
    /// 枚举能服务指定模型的候选后端
    fn candidates_for_model(&self, model: &str) -> Vec<ProviderCandidate>;

    /// 解析provider对应的客户端
    fn client(&self, provider: &str) -> Option<Arc<dyn ProviderClient>>;
}

struct RegisteredProvider {
    client: Arc<dyn ProviderClient>,
    weight: u32,
    available: bool,
    timeout: Option<Duration>,
}

/// 进程内Provider注册表
///
/// 支持运行时注册与摘除，测试和嵌入方都用它装配调度引擎。
pub struct StaticProviderRegistry {
    providers: RwLock<HashMap<ProviderId, RegisteredProvider>>,
}

impl StaticProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
        }
    }

    /// 注册一个provider客户端
    pub fn register(&self, client: Arc<dyn ProviderClient>, weight: u32) {
        let provider_id = client.provider_id().to_string();
        tracing::info!("Registered provider '{}' with weight {}", provider_id, weight);
        self.providers.write().insert(
            provider_id,
            RegisteredProvider {
                client,
                weight,
                available: true,
                timeout: None,
            },
        );
    }

    /// 按配置注册，权重/超时/开关取自provider对应的配置段
    pub fn register_with_config(&self, client: Arc<dyn ProviderClient>, config: &RoutingConfig) {
        let provider_id = client.provider_id().to_string();
        let (weight, available, timeout) = match config.get_provider(&provider_id) {
            Some(settings) => (
                settings.weight,
                settings.enabled,
                Some(Duration::from_secs(settings.timeout_seconds)),
            ),
            None => {
                tracing::warn!(
                    "Provider '{}' not present in routing config, using defaults",
                    provider_id
                );
                (1, true, None)
            }
        };

        self.providers.write().insert(
            provider_id,
            RegisteredProvider {
                client,
                weight,
                available,
                timeout,
            },
        );
    }

    /// 摘除一个provider
    pub fn unregister(&self, provider: &str) -> bool {
        let removed = self.providers.write().remove(provider).is_some();
        if removed {
            tracing::info!("Unregistered provider '{}'", provider);
        }
        removed
    }

    /// 设置可用性开关（运维摘流用）
    pub fn set_available(&self, provider: &str, available: bool) {
        if let Some(entry) = self.providers.write().get_mut(provider) {
            entry.available = available;
            tracing::info!("Provider '{}' availability set to {}", provider, available);
        }
    }

    /// 已注册的provider数量
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

impl Default for StaticProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry for StaticProviderRegistry {
    fn candidates_for_model(&self, model: &str) -> Vec<ProviderCandidate> {
        let providers = self.providers.read();
        let mut candidates = Vec::new();

        for (provider_id, entry) in providers.iter() {
            if !entry.client.supported_models().iter().any(|m| m == model) {
                continue;
            }

            let mut candidate = ProviderCandidate::new(
                BackendKey::new(provider_id.clone(), model.to_string()),
                entry.weight,
            )
            .with_capabilities(entry.client.capabilities());
            candidate.available = entry.available;
            candidate.timeout = entry.timeout;
            candidates.push(candidate);
        }

        // 稳定的遍历顺序，选择器的累计权重走查依赖它
        candidates.sort_by(|a, b| a.key.provider.cmp(&b.key.provider));
        candidates
    }

    fn client(&self, provider: &str) -> Option<Arc<dyn ProviderClient>> {
        self.providers.read().get(provider).map(|e| e.client.clone())
    }
}
