pub mod loader;
pub mod model;


pub use loader::{load_config_from_path, load_config_from_str, SharedRoutingConfig};
pub use model::RoutingConfig;
