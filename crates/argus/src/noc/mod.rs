//! NOC forwarding pipeline: payloads, transport, circuit breaker, the
//! snapshot that decides, and the queue worker that executes.

pub mod client;
pub mod health;
pub mod payload;
pub mod queue;
pub mod snapshot;

pub use client::{HttpNocTransport, NocTransport};
pub use health::{NocHealth, NocHealthStatus};
pub use payload::{NocPayload, NocVerifyFilter};
pub use queue::{NocDecision, NocDispatcher, NocQueue, QueuedDecision};
pub use snapshot::NocSnapshotJob;
