//! Journey orchestration — durable per-user state machines advancing
//! through delay, messaging, branching, and waiting nodes, triggered by
//! segment transitions and tracked events.

pub mod dispatch;
pub mod engine;
pub mod graph;
pub mod scheduler;
pub mod stores;
pub mod types;

pub use dispatch::{CaptureDispatcher, DispatchError, MessageDispatcher, MessageRequest};
pub use engine::JourneyEngine;
pub use graph::JourneyGraph;
pub use scheduler::Scheduler;
pub use stores::{InstanceStore, MemoryInstanceStore};
