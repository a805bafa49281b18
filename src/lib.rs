pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;

pub use error::RegistryError;
pub use models::*;
pub use services::*;
