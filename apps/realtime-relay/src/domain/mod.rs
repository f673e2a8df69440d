//! Domain Layer - Core relay types and state machines.
//!
//! This layer contains the event, state, task and key types shared by
//! every other layer. Nothing here performs I/O.

/// Injectable time source.
pub mod clock;

/// Logical event channels and the event shape delivered to subscribers.
pub mod events;

/// Cache key namespacing and TTL classes.
pub mod keys;

/// Connection, breaker and bridge state machines.
pub mod state;

/// Subscriber tracking and teardown signalling.
pub mod subscription;

/// Background task types.
pub mod task;
