//! Loquat Core Library
//!
//! This library provides core functionality for the Loquat dispatch system including:
//! - Routing configuration management
//! - Provider boundary traits and invocation types
//! - Shared identifier types

pub mod config;
pub mod provider;
pub mod types;

// Re-export commonly used types
pub use config::loader::{load_config_from_path, load_config_from_str, SharedRoutingConfig};
pub use config::model::{
    BreakerSettings, MetricsSettings, ProviderSettings, QuotaSettings, RateLimitSettings,
    RoutingConfig, SelectionSettings,
};
pub use provider::{
    Capability, InvocationError, InvocationRequest, InvocationResponse, OperationKind,
    ProviderCandidate, ProviderClient, ProviderRegistry, StaticProviderRegistry,
};
pub use types::{BackendKey, ModelId, ProviderId};
