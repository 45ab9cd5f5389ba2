//! Application Ports (Driven)
//!
//! Interfaces the pipeline uses to reach external systems. Infrastructure
//! adapters implement them; tests substitute fakes and mocks.
//!
//! - `CatalogPort`: which symbols to track
//! - `PriceProviderPort`: where prices come from
//! - `PriceCachePort`: write-through cache for last known prices
//! - `ConnectionSink` / `PricePublisher`: delivery to live connections

mod catalog_port;
mod connection_port;
mod price_cache_port;
mod price_provider_port;

pub use catalog_port::{CatalogError, CatalogPort};
pub use connection_port::{ConnectionClosed, ConnectionSink, PricePublisher, PublishReport};
pub use price_cache_port::{CacheError, PriceCachePort};
pub use price_provider_port::{PriceProviderPort, ProviderBatch, ProviderError};

#[cfg(test)]
pub use catalog_port::MockCatalogPort;
#[cfg(test)]
pub use price_cache_port::MockPriceCachePort;
#[cfg(test)]
pub use price_provider_port::MockPriceProviderPort;
