//! Domain Layer - Core price types and business logic.
//!
//! This layer contains the core domain types for price ingestion and
//! distribution. Nothing here performs I/O.

/// Price samples, records, fetch results and broadcast messages.
pub mod pricing;

/// Connection registry and symbol filters.
pub mod subscription;
