//! Static Catalog
//!
//! Symbol universe held in memory, seeded from configuration and
//! replaceable at runtime.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::{CatalogError, CatalogPort};
use crate::domain::pricing::Symbol;

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    symbols: RwLock<HashSet<Symbol>>,
}

impl StaticCatalog {
    /// Create a catalog tracking `symbols`.
    #[must_use]
    pub fn new(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            symbols: RwLock::new(normalize(symbols)),
        }
    }

    /// Replace the tracked universe.
    pub fn replace(&self, symbols: impl IntoIterator<Item = Symbol>) {
        let symbols = normalize(symbols);
        tracing::info!(count = symbols.len(), "Tracked universe replaced");
        *self.symbols.write() = symbols;
    }

    /// Start tracking one more symbol. Returns `false` if already tracked.
    pub fn add(&self, symbol: Symbol) -> bool {
        !symbol.is_empty() && self.symbols.write().insert(symbol)
    }

    /// Stop tracking a symbol. Returns `false` if it was not tracked.
    pub fn remove(&self, symbol: &Symbol) -> bool {
        self.symbols.write().remove(symbol)
    }

    /// Tracked symbols, sorted.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.symbols.read().iter().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Number of tracked symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.read().len()
    }

    /// Whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.read().is_empty()
    }
}

#[async_trait]
impl CatalogPort for StaticCatalog {
    async fn list_tracked_symbols(&self) -> Result<HashSet<Symbol>, CatalogError> {
        Ok(self.symbols.read().clone())
    }
}

fn normalize(symbols: impl IntoIterator<Item = Symbol>) -> HashSet<Symbol> {
    symbols.into_iter().filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_configured_symbols() {
        let catalog = StaticCatalog::new([Symbol::new("aapl"), Symbol::new("MSFT"), Symbol::new("")]);

        let symbols = catalog.list_tracked_symbols().await.unwrap();

        assert_eq!(symbols.len(), 2);
        assert!(symbols.contains(&Symbol::new("AAPL")));
    }

    #[tokio::test]
    async fn universe_can_change_at_runtime() {
        let catalog = StaticCatalog::new([Symbol::new("AAPL")]);

        assert!(catalog.add(Symbol::new("GOOG")));
        assert!(!catalog.add(Symbol::new("GOOG")));
        assert!(catalog.remove(&Symbol::new("AAPL")));
        assert_eq!(catalog.len(), 1);

        catalog.replace([Symbol::new("TSLA"), Symbol::new("NVDA")]);
        let symbols = catalog.list_tracked_symbols().await.unwrap();
        assert_eq!(symbols, HashSet::from([Symbol::new("TSLA"), Symbol::new("NVDA")]));
    }
}
