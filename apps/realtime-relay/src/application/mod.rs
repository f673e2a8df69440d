//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (upstream store, event transports).
pub mod ports;

/// Application services: resilient cache, event publishing, task queue.
pub mod services;
