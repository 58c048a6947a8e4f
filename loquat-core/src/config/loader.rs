use crate::config::model::RoutingConfig;
use anyhow::Context;
use parking_lot::RwLock;
use std::sync::Arc;

/// 从文件加载并验证路由配置
pub fn load_config_from_path(config_path: &str) -> Result<RoutingConfig, anyhow::Error> {
    let config_str = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file '{}'", config_path))?;
    load_config_from_str(&config_str)
}

/// 从TOML文本加载并验证路由配置
///
/// 解析错误与验证错误都在这里立刻失败，不会延迟到选择阶段。
pub fn load_config_from_str(config_str: &str) -> Result<RoutingConfig, anyhow::Error> {
    let config: RoutingConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// 可热替换的配置句柄
///
/// 读路径拿到的是当次加载的Arc快照，一次选择过程中配置视图不变；
/// 替换只在新配置通过验证后发生。
#[derive(Clone)]
pub struct SharedRoutingConfig {
    inner: Arc<RwLock<Arc<RoutingConfig>>>,
}

impl SharedRoutingConfig {
    pub fn new(config: RoutingConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// 获取当前配置快照
    pub fn load(&self) -> Arc<RoutingConfig> {
        self.inner.read().clone()
    }

    /// 整体替换配置，替换前重新验证，验证不过则保留旧配置
    pub fn store(&self, config: RoutingConfig) -> Result<(), anyhow::Error> {
        config.validate()?;
        let mut guard = self.inner.write();
        *guard = Arc::new(config);
        tracing::info!("Routing config replaced");
        Ok(())
    }

    /// 重新加载文件并替换，解析或验证失败时保留旧配置
    pub fn reload_from_path(&self, config_path: &str) -> Result<(), anyhow::Error> {
        let config = load_config_from_path(config_path)?;
        self.store(config)
    }
}
