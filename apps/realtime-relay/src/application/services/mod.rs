//! Application Services
//!
//! Services that compose the local cache, circuit breaker and connection
//! manager into failure-safe operations.
//!
//! - `UpstreamGate`: Breaker + connection gating for one upstream call
//! - `ResilientCache`: Read-through cache that degrades to local data
//! - `EventPublisher`: Publishes domain events on backend channels
//! - `TaskQueue`: Shared-store background job queue

mod gate;
mod publisher;
mod resilient_cache;
mod task_queue;

pub use gate::{DEFAULT_OPERATION_TIMEOUT, GateError, UpstreamGate};
pub use publisher::EventPublisher;
pub use resilient_cache::{DEFAULT_VALUE_TTL, ResilientCache};
#[cfg(test)]
pub use task_queue::MockTaskHandler;
pub use task_queue::{
    HandlerError, TaskHandler, TaskQueue, TaskQueueConfig, TaskQueueError, TaskQueueStats,
};
