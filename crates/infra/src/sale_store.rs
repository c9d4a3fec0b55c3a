//! Read-only access to finalized sales.
//!
//! Sales are owned by the surrounding system; emission only needs an existence
//! check and the monetary total, so the port is a single lookup.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use numera_core::{PersistenceError, SaleId};
use numera_sales::Sale;

/// Read-only lookup of a finalized sale. No side effects.
#[async_trait]
pub trait SaleStore: Send + Sync {
    async fn get(&self, sale_id: SaleId) -> Result<Option<Sale>, PersistenceError>;
}

/// Postgres-backed sale lookup.
#[derive(Debug, Clone)]
pub struct PgSaleStore {
    pool: Arc<PgPool>,
}

impl PgSaleStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl SaleStore for PgSaleStore {
    async fn get(&self, sale_id: SaleId) -> Result<Option<Sale>, PersistenceError> {
        let row = sqlx::query("SELECT id, total_cents FROM sales WHERE id = $1")
            .bind(sale_id.as_i64())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| PersistenceError::Storage(format!("sale lookup failed: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| PersistenceError::Storage(format!("sale row: {}", e)))?;
        let total_cents: i64 = row
            .try_get("total_cents")
            .map_err(|e| PersistenceError::Storage(format!("sale row: {}", e)))?;

        let sale = Sale::new(SaleId::new(id), total_cents)
            .map_err(|e| PersistenceError::Storage(format!("corrupt sale row {}: {}", id, e)))?;
        Ok(Some(sale))
    }
}

/// In-memory sale lookup.
///
/// Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySaleStore {
    sales: RwLock<HashMap<SaleId, Sale>>,
}

impl InMemorySaleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sale: Sale) {
        if let Ok(mut sales) = self.sales.write() {
            sales.insert(sale.id, sale);
        }
    }
}

#[async_trait]
impl SaleStore for InMemorySaleStore {
    async fn get(&self, sale_id: SaleId) -> Result<Option<Sale>, PersistenceError> {
        let sales = self
            .sales
            .read()
            .map_err(|_| PersistenceError::Storage("sale store lock poisoned".to_string()))?;
        Ok(sales.get(&sale_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_returns_inserted_sales() {
        let store = InMemorySaleStore::new();
        store.insert(Sale::new(SaleId::new(55), 100_000).unwrap());

        let found = store.get(SaleId::new(55)).await.unwrap();
        assert_eq!(found.unwrap().total_cents, 100_000);

        let missing = store.get(SaleId::new(56)).await.unwrap();
        assert!(missing.is_none());
    }
}
