//! Bidirectional map between internal trading pairs and exchange symbols.
//!
//! The map is built from the instrument catalog and swapped in as a whole:
//! readers clone an `Arc` of the current table and never observe a partial
//! refresh. A failed refresh leaves the previous table in place.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dexfin_domain::{SymbolEntry, TradingPair};
use tracing::{info, warn};

use crate::endpoints::MARKET_STATE_ENABLED;
use crate::error::{ConnectorError, ConnectorResult};
use crate::rest::{MarketInfo, RestClient};

/// Source of the instrument catalog.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// Fetch every listed market.
    async fn fetch_markets(&self) -> ConnectorResult<Vec<MarketInfo>>;
}

#[async_trait]
impl MarketCatalog for RestClient {
    async fn fetch_markets(&self) -> ConnectorResult<Vec<MarketInfo>> {
        self.markets().await
    }
}

/// One consistent generation of the map.
#[derive(Debug, Default)]
struct SymbolTable {
    by_pair: HashMap<TradingPair, SymbolEntry>,
    by_symbol: HashMap<String, TradingPair>,
}

impl SymbolTable {
    fn from_markets(markets: Vec<MarketInfo>) -> Self {
        let mut table = SymbolTable::default();

        for market in markets {
            if market.state.as_deref() != Some(MARKET_STATE_ENABLED) {
                continue;
            }

            let pair = match TradingPair::new(&market.base_unit, &market.quote_unit) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(symbol = %market.id, error = %e, "Skipping market with invalid assets");
                    continue;
                }
            };
            let symbol = market.id.to_lowercase();

            if table.by_pair.contains_key(&pair) || table.by_symbol.contains_key(&symbol) {
                warn!(pair = %pair, symbol = %symbol, "Duplicate market in catalog, keeping first");
                continue;
            }

            table.by_symbol.insert(symbol.clone(), pair.clone());
            table.by_pair.insert(
                pair.clone(),
                SymbolEntry {
                    internal_pair: pair,
                    exchange_symbol: symbol,
                    min_price: market.min_price,
                    min_amount: market.min_amount,
                    price_precision: market.price_precision,
                    amount_precision: market.amount_precision,
                    enabled: true,
                },
            );
        }

        table
    }

    fn pairs(&self) -> BTreeSet<TradingPair> {
        self.by_pair.keys().cloned().collect()
    }
}

/// Pair ↔ symbol resolution, owned by one connector session.
pub struct SymbolMap {
    catalog: Arc<dyn MarketCatalog>,
    table: RwLock<Option<Arc<SymbolTable>>>,
    invalidated: AtomicBool,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl SymbolMap {
    /// Create an empty map over a catalog source.
    pub fn new(catalog: Arc<dyn MarketCatalog>) -> Self {
        Self {
            catalog,
            table: RwLock::new(None),
            invalidated: AtomicBool::new(false),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> Option<Arc<SymbolTable>> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn populated(&self) -> ConnectorResult<Arc<SymbolTable>> {
        self.current()
            .ok_or_else(|| ConnectorError::UnknownSymbol("symbol map not loaded".to_string()))
    }

    /// Fetch the catalog and swap in a new table.
    ///
    /// Returns the set of tradable pairs. On error the previous table is kept.
    pub async fn refresh(&self) -> ConnectorResult<BTreeSet<TradingPair>> {
        let _gate = self.refresh_gate.lock().await;

        let markets = self.catalog.fetch_markets().await.map_err(|e| {
            warn!(error = %e, "Symbol map refresh failed, keeping previous table");
            e
        })?;
        let listed = markets.len();
        let table = Arc::new(SymbolTable::from_markets(markets));
        let pairs = table.pairs();

        *self
            .table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(table);
        self.invalidated.store(false, Ordering::Release);

        info!(listed, enabled = pairs.len(), "Symbol map refreshed");
        Ok(pairs)
    }

    /// Exchange symbol for an internal pair.
    pub fn resolve(&self, pair: &TradingPair) -> ConnectorResult<String> {
        self.populated()?
            .by_pair
            .get(pair)
            .map(|e| e.exchange_symbol.clone())
            .ok_or_else(|| ConnectorError::UnknownSymbol(pair.to_string()))
    }

    /// Internal pair for an exchange symbol (case-insensitive).
    pub fn reverse_resolve(&self, symbol: &str) -> ConnectorResult<TradingPair> {
        self.populated()?
            .by_symbol
            .get(&symbol.to_lowercase())
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownSymbol(symbol.to_string()))
    }

    /// Catalog entry with trading rules.
    pub fn entry(&self, pair: &TradingPair) -> ConnectorResult<SymbolEntry> {
        self.populated()?
            .by_pair
            .get(pair)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownSymbol(pair.to_string()))
    }

    /// Every tradable pair (empty if never loaded).
    pub fn pairs(&self) -> BTreeSet<TradingPair> {
        self.current().map(|t| t.pairs()).unwrap_or_default()
    }

    /// Whether a table has been loaded.
    pub fn is_populated(&self) -> bool {
        self.current().is_some()
    }

    /// Mark the map out of date; lookups keep working until the next refresh.
    pub fn invalidate(&self) {
        if !self.invalidated.swap(true, Ordering::AcqRel) {
            info!("Symbol map invalidated");
        }
    }

    /// Whether the next [`ensure_fresh`](Self::ensure_fresh) will refresh.
    pub fn needs_refresh(&self) -> bool {
        !self.is_populated() || self.invalidated.load(Ordering::Acquire)
    }

    /// Refresh if never loaded or invalidated.
    pub async fn ensure_fresh(&self) -> ConnectorResult<()> {
        if self.needs_refresh() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Resolve, refreshing once on a miss.
    pub async fn resolve_or_refresh(&self, pair: &TradingPair) -> ConnectorResult<String> {
        match self.resolve(pair) {
            Ok(symbol) => Ok(symbol),
            Err(ConnectorError::UnknownSymbol(_)) => {
                self.refresh().await?;
                self.resolve(pair)
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for SymbolMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolMap")
            .field("pairs", &self.pairs().len())
            .field("invalidated", &self.invalidated.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
