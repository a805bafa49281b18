pub mod factory;
pub mod registry;
pub mod resource_cache; // Lazy single-flight cache with release-on-evict
pub mod usage_registry;

pub use factory::*;
pub use registry::*;
pub use resource_cache::*;
pub use usage_registry::*;
