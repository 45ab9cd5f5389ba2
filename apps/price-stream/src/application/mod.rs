//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (catalog, provider, cache, connections).
pub mod ports;

/// Application services for fetching, storing, scheduling and publishing prices.
pub mod services;
