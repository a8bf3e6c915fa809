pub mod backend;
pub mod backoff;
pub mod fallback;
pub mod http_backend;
pub mod model;

pub use fallback::FallbackExecutor;
pub use http_backend::registry_from_config;
