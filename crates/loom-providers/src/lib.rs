//! LLM provider registry, wire protocol, and health probing.

pub mod health;
pub mod protocol;
pub mod registry;

pub use health::HealthProber;
pub use protocol::{ChatProtocol, ChatRequest, ChatResponse, MockTransport, ProtocolError};
pub use registry::{ChatMetrics, MetricsCallback, ProviderRegistry, RegistryError};
