use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::models::Position;
use crate::{BotError, Result};

/// Authoritative in-process record of open positions.
///
/// Writes are serialized per symbol: every symbol owns its own slot lock,
/// and the outer map lock is only taken to create or enumerate slots, so
/// runners for different symbols never contend. Shared between strategy
/// runners and the reconciliation loop.
pub struct PositionStore {
    slots: RwLock<HashMap<String, Arc<Mutex<Option<Position>>>>>,
}

impl PositionStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, symbol: &str) -> Arc<Mutex<Option<Position>>> {
        if let Some(slot) = self
            .slots
            .read()
            .expect("position store lock poisoned")
            .get(symbol)
        {
            return slot.clone();
        }

        let mut slots = self.slots.write().expect("position store lock poisoned");
        slots
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.slot(symbol)
            .lock()
            .expect("position slot poisoned")
            .clone()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.get(symbol).is_some()
    }

    /// Track a newly opened position. Rejects a second open for the same
    /// symbol (the at-most-one-position invariant).
    pub fn insert(&self, position: Position) -> Result<()> {
        let slot = self.slot(&position.symbol);
        let mut guard = slot.lock().expect("position slot poisoned");

        if guard.is_some() {
            return Err(BotError::ExchangeRejected(format!(
                "position already open for {}",
                position.symbol
            )));
        }

        *guard = Some(position);
        Ok(())
    }

    /// Overwrite regardless of current state. Reserved for the reconciler,
    /// which treats exchange state as authoritative.
    pub fn upsert(&self, position: Position) {
        let slot = self.slot(&position.symbol);
        *slot.lock().expect("position slot poisoned") = Some(position);
    }

    pub fn remove(&self, symbol: &str) -> Option<Position> {
        let slot = self.slot(symbol);
        let taken = slot.lock().expect("position slot poisoned").take();
        taken
    }

    /// Mutate the tracked position in place under its slot lock.
    pub fn update<F>(&self, symbol: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Position),
    {
        let slot = self.slot(symbol);
        let mut guard = slot.lock().expect("position slot poisoned");

        match guard.as_mut() {
            Some(position) => {
                mutate(position);
                Ok(())
            }
            None => Err(BotError::NotFound(format!("no position for {symbol}"))),
        }
    }

    /// Refresh unrealized PnL at the given mark price.
    pub fn mark_price(&self, symbol: &str, price: f64) -> Result<f64> {
        let mut pnl = 0.0;
        self.update(symbol, |position| {
            position.unrealized_pnl = position.unrealized_at(price);
            pnl = position.unrealized_pnl;
        })?;
        Ok(pnl)
    }

    /// All open positions, any symbol order.
    pub fn snapshot(&self) -> Vec<Position> {
        let slots = self.slots.read().expect("position store lock poisoned");
        slots
            .values()
            .filter_map(|slot| slot.lock().expect("position slot poisoned").clone())
            .collect()
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|p| p.symbol).collect()
    }

    pub fn open_count(&self) -> usize {
        self.snapshot().len()
    }
}

impl Default for PositionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;

    fn sample_position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            entry_price: 100.0,
            size: 2.0,
            stop_loss: 95.0,
            take_profit: 110.0,
            opened_at: Utc::now(),
            unrealized_pnl: 0.0,
            stop_order_id: Some("1".to_string()),
            take_profit_order_id: Some("2".to_string()),
            adopted_from_exchange: false,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = PositionStore::new();
        store.insert(sample_position("BTCUSDT")).unwrap();

        let position = store.get("BTCUSDT").unwrap();
        assert_eq!(position.entry_price, 100.0);
        assert!(store.contains("BTCUSDT"));
        assert!(!store.contains("ETHUSDT"));
    }

    #[test]
    fn test_insert_rejects_duplicate_symbol() {
        let store = PositionStore::new();
        store.insert(sample_position("BTCUSDT")).unwrap();

        let result = store.insert(sample_position("BTCUSDT"));
        assert!(result.is_err());

        // The original entry price survives untouched
        assert_eq!(store.get("BTCUSDT").unwrap().entry_price, 100.0);
    }

    #[test]
    fn test_upsert_overwrites() {
        let store = PositionStore::new();
        store.insert(sample_position("BTCUSDT")).unwrap();

        let mut adopted = sample_position("BTCUSDT");
        adopted.entry_price = 105.0;
        adopted.adopted_from_exchange = true;
        store.upsert(adopted);

        let position = store.get("BTCUSDT").unwrap();
        assert_eq!(position.entry_price, 105.0);
        assert!(position.adopted_from_exchange);
    }

    #[test]
    fn test_remove() {
        let store = PositionStore::new();
        store.insert(sample_position("BTCUSDT")).unwrap();

        let removed = store.remove("BTCUSDT").unwrap();
        assert_eq!(removed.symbol, "BTCUSDT");
        assert!(store.get("BTCUSDT").is_none());
        assert!(store.remove("BTCUSDT").is_none());
    }

    #[test]
    fn test_mark_price_refreshes_unrealized_pnl() {
        let store = PositionStore::new();
        store.insert(sample_position("BTCUSDT")).unwrap();

        let pnl = store.mark_price("BTCUSDT", 110.0).unwrap();
        assert_eq!(pnl, 20.0);
        assert_eq!(store.get("BTCUSDT").unwrap().unrealized_pnl, 20.0);
    }

    #[test]
    fn test_update_missing_symbol_is_not_found() {
        let store = PositionStore::new();
        let err = store.update("NOPEUSDT", |_| {}).unwrap_err();
        assert!(matches!(err, BotError::NotFound(_)));
    }

    #[test]
    fn test_snapshot_spans_symbols() {
        let store = PositionStore::new();
        store.insert(sample_position("BTCUSDT")).unwrap();
        store.insert(sample_position("ETHUSDT")).unwrap();
        store.remove("BTCUSDT");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].symbol, "ETHUSDT");
        assert_eq!(store.open_count(), 1);
    }
}
