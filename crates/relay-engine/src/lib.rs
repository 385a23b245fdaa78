//! Conversation pipeline: debounce and session lifecycle, channel
//! hibernation, bounded worker pools, and the processor that turns a settled
//! burst into a reply.

pub mod error;
pub mod orchestrator;
pub mod presence;
pub mod processor;
pub mod worker;

pub use error::EngineError;
pub use orchestrator::{OrchestratorConfig, ProcessOutcome, SessionHooks, SessionOrchestrator};
pub use presence::{ActivityProbe, PresenceConfig, PresenceManager, SessionCounter};
pub use processor::{MessageProcessor, ProcessorConfig, ProcessorPools};
pub use worker::{WorkerPool, WorkerPoolConfig};
