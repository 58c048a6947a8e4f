pub mod registry;
pub mod types;

pub use registry::{ProviderClient, ProviderRegistry, StaticProviderRegistry};
pub use types::*;
