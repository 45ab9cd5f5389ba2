//! Connection Registry
//!
//! Domain types for tracking which live dashboard connections want which
//! symbols. A connection either names an explicit symbol set or asks for
//! every symbol.
//!
//! # Design
//!
//! The registry keeps:
//! - The filter and delivery handle of each connection
//! - A symbol → connections index for explicit filters
//! - The set of connections subscribed to everything
//!
//! Lookups for a symbol return cloned handles so delivery can happen after
//! the lock is released.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::pricing::Symbol;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a live connection.
pub type ConnectionId = u64;

/// Which symbols a connection wants to receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolFilter {
    /// Every symbol.
    All,
    /// Only the listed symbols.
    Symbols(HashSet<Symbol>),
}

impl SymbolFilter {
    /// Build an explicit filter.
    #[must_use]
    pub fn symbols(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self::Symbols(symbols.into_iter().filter(|s| !s.is_empty()).collect())
    }

    /// Whether a message for `symbol` should be delivered.
    #[must_use]
    pub fn matches(&self, symbol: &Symbol) -> bool {
        match self {
            Self::All => true,
            Self::Symbols(set) => set.contains(symbol),
        }
    }

    /// Whether this is the "all symbols" filter.
    #[must_use]
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// A registered connection and its filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    /// Connection identity.
    pub id: ConnectionId,
    /// Current filter.
    pub filter: SymbolFilter,
}

/// Registry operation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The connection ceiling has been reached.
    #[error("connection limit reached ({max})")]
    CapacityReached {
        /// Configured ceiling.
        max: usize,
    },
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug)]
struct Entry<S> {
    filter: SymbolFilter,
    sink: S,
}

#[derive(Debug)]
struct RegistryState<S> {
    /// Map from connection ID to its filter and sink.
    entries: HashMap<ConnectionId, Entry<S>>,
    /// Map from symbol to connections with an explicit interest in it.
    symbol_index: HashMap<Symbol, HashSet<ConnectionId>>,
    /// Connections subscribed to every symbol.
    all: HashSet<ConnectionId>,
}

impl<S> Default for RegistryState<S> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            symbol_index: HashMap::new(),
            all: HashSet::new(),
        }
    }
}

impl<S> RegistryState<S> {
    fn index(&mut self, id: ConnectionId, filter: &SymbolFilter) {
        match filter {
            SymbolFilter::All => {
                self.all.insert(id);
            }
            SymbolFilter::Symbols(symbols) => {
                for symbol in symbols {
                    self.symbol_index.entry(symbol.clone()).or_default().insert(id);
                }
            }
        }
    }

    fn unindex(&mut self, id: ConnectionId, filter: &SymbolFilter) {
        match filter {
            SymbolFilter::All => {
                self.all.remove(&id);
            }
            SymbolFilter::Symbols(symbols) => {
                for symbol in symbols {
                    if let Some(ids) = self.symbol_index.get_mut(symbol) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            self.symbol_index.remove(symbol);
                        }
                    }
                }
            }
        }
    }

    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(entry) = self.entries.remove(&id) else {
            return false;
        };
        self.unindex(id, &entry.filter);
        true
    }

    fn set_filter(&mut self, id: ConnectionId, filter: SymbolFilter) -> Option<Subscription> {
        let previous = self.entries.get(&id).map(|entry| entry.filter.clone())?;
        self.unindex(id, &previous);
        self.index(id, &filter);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.filter = filter.clone();
        }
        Some(Subscription { id, filter })
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Thread-safe registry of live connections and their symbol filters.
///
/// `S` is the delivery handle stored per connection. It is cloned out of
/// the registry by [`matching`](Self::matching).
///
/// # Example
///
/// ```rust
/// use price_stream::domain::pricing::Symbol;
/// use price_stream::domain::subscription::{SubscriptionRegistry, SymbolFilter};
///
/// let registry: SubscriptionRegistry<&str> = SubscriptionRegistry::new(10);
///
/// registry.register(1, SymbolFilter::All, "everything").unwrap();
/// registry
///     .register(2, SymbolFilter::symbols([Symbol::new("AAPL")]), "apple")
///     .unwrap();
///
/// assert_eq!(registry.matching(&Symbol::new("AAPL")).len(), 2);
/// assert_eq!(registry.matching(&Symbol::new("MSFT")).len(), 1);
/// ```
#[derive(Debug)]
pub struct SubscriptionRegistry<S> {
    state: RwLock<RegistryState<S>>,
    max_connections: usize,
}

impl<S: Clone> SubscriptionRegistry<S> {
    /// Create a registry holding at most `max_connections` connections.
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_connections,
        }
    }

    /// Register a connection.
    ///
    /// Registering an existing ID replaces its filter and sink.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapacityReached`] when a new connection
    /// would exceed the ceiling.
    pub fn register(
        &self,
        id: ConnectionId,
        filter: SymbolFilter,
        sink: S,
    ) -> Result<Subscription, RegistryError> {
        let mut state = self.state.write();

        if state.entries.contains_key(&id) {
            state.remove(id);
        } else if state.entries.len() >= self.max_connections {
            return Err(RegistryError::CapacityReached {
                max: self.max_connections,
            });
        }

        state.index(id, &filter);
        state.entries.insert(
            id,
            Entry {
                filter: filter.clone(),
                sink,
            },
        );

        Ok(Subscription { id, filter })
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.state.write().remove(id)
    }

    /// Remove several connections under one lock. Returns how many were present.
    pub fn remove_many(&self, ids: &[ConnectionId]) -> usize {
        let mut state = self.state.write();
        ids.iter().filter(|id| state.remove(**id)).count()
    }

    /// Replace the filter of a registered connection.
    pub fn update_filter(&self, id: ConnectionId, filter: SymbolFilter) -> Option<Subscription> {
        self.state.write().set_filter(id, filter)
    }

    /// Add symbols to an explicit filter.
    ///
    /// A connection subscribed to everything is left unchanged.
    pub fn subscribe_symbols(&self, id: ConnectionId, symbols: &[Symbol]) -> Option<Subscription> {
        let mut state = self.state.write();
        let filter = match &state.entries.get(&id)?.filter {
            SymbolFilter::All => SymbolFilter::All,
            SymbolFilter::Symbols(current) => {
                let mut next = current.clone();
                next.extend(symbols.iter().filter(|s| !s.is_empty()).cloned());
                SymbolFilter::Symbols(next)
            }
        };
        state.set_filter(id, filter)
    }

    /// Remove symbols from an explicit filter.
    ///
    /// A connection subscribed to everything is left unchanged.
    pub fn unsubscribe_symbols(
        &self,
        id: ConnectionId,
        symbols: &[Symbol],
    ) -> Option<Subscription> {
        let mut state = self.state.write();
        let filter = match &state.entries.get(&id)?.filter {
            SymbolFilter::All => SymbolFilter::All,
            SymbolFilter::Symbols(current) => {
                let mut next = current.clone();
                for symbol in symbols {
                    next.remove(symbol);
                }
                SymbolFilter::Symbols(next)
            }
        };
        state.set_filter(id, filter)
    }

    /// Snapshot of the sinks interested in `symbol`.
    #[must_use]
    pub fn matching(&self, symbol: &Symbol) -> Vec<(ConnectionId, S)> {
        let state = self.state.read();
        let explicit = state.symbol_index.get(symbol).into_iter().flatten();

        state
            .all
            .iter()
            .chain(explicit)
            .filter_map(|id| state.entries.get(id).map(|entry| (*id, entry.sink.clone())))
            .collect()
    }

    /// Current filter of a connection.
    #[must_use]
    pub fn filter(&self, id: ConnectionId) -> Option<SymbolFilter> {
        self.state.read().entries.get(&id).map(|entry| entry.filter.clone())
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.state.read().entries.contains_key(&id)
    }

    /// All registered connections.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let state = self.state.read();
        let mut subscriptions: Vec<_> = state
            .entries
            .iter()
            .map(|(id, entry)| Subscription {
                id: *id,
                filter: entry.filter.clone(),
            })
            .collect();
        subscriptions.sort_by_key(|s| s.id);
        subscriptions
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            connection_count: state.entries.len(),
            all_symbols_count: state.all.len(),
            symbol_count: state.symbol_index.len(),
            max_connections: self.max_connections,
        }
    }

    /// Configured connection ceiling.
    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    /// Number of live connections.
    pub connection_count: usize,
    /// Connections subscribed to every symbol.
    pub all_symbols_count: usize,
    /// Distinct symbols named by explicit filters.
    pub symbol_count: usize,
    /// Configured ceiling.
    pub max_connections: usize,
}

// =============================================================================
// Tests
// =============================================================================
