//! Catalog Port (Driven Port)
//!
//! Source of the symbol universe the scheduler keeps priced.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::domain::pricing::Symbol;

/// Catalog error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    /// The catalog could not be read.
    #[error("Catalog unavailable: {message}")]
    Unavailable {
        /// Error details.
        message: String,
    },
}

/// Port for listing tracked symbols.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogPort: Send + Sync {
    /// Current set of symbols to price.
    async fn list_tracked_symbols(&self) -> Result<HashSet<Symbol>, CatalogError>;
}
