//! Long-running and request-scoped services behind the HTTP surface.

/// Source to bus ingest bridge.
pub mod bridge;
/// Bridge duplicate suppression.
pub mod dedupe;
/// Client for the generation origin.
pub mod forwarder;
/// Prompt submission with a stream back.
pub mod orchestrator;
/// Inference streaming proxy.
pub mod origin_proxy;

pub use bridge::{BridgeError, BridgeStats, IngestBridge};
pub use dedupe::DedupeWindow;
pub use forwarder::{ForwardError, GenerationOrigin, HttpOrigin};
pub use orchestrator::{ChatError, ChatOrchestrator, PreparedChat};
pub use origin_proxy::OriginProxy;
