pub mod catalog;
pub mod origin;
pub mod resolver;

pub use catalog::Layer2Mode;
pub use origin::{HttpGeoProbe, OriginVerifier};
pub use resolver::ProxyResolver;
