//! Record store capability boundary and its in-memory implementation.

use async_trait::async_trait;
use calcbus_wire::{Calculation, Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Key-value record store for calculations.
///
/// The pipeline treats the store as the single source of truth: records are
/// never cached client-side, and concurrent updates to the same id are
/// serialized by the store itself. Any conforming implementation (the
/// in-memory [`MemoryStorage`] for tests, a relational client in
/// production) is substitutable.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Persists a new Pending record and assigns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn create(&self, owner: &str, expression: &str) -> Result<Calculation>;

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    async fn get(&self, id: u64) -> Result<Calculation>;

    /// All records, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    async fn list(&self) -> Result<Vec<Calculation>>;

    /// Applies the result leg: sets `result` and `completed_at` atomically.
    ///
    /// Must be idempotent. Applying a result to an already-Completed record
    /// is a successful no-op, never a double side effect; redelivery of the
    /// result leg relies on this.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    async fn update_result(&self, id: u64, result: f64) -> Result<()>;
}

/// In-memory store, substitutable for a relational client.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<u64, Calculation>>,
    next_id: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create(&self, owner: &str, expression: &str) -> Result<Calculation> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let record = Calculation {
            id,
            owner: owner.to_owned(),
            expression: expression.to_owned(),
            result: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.records.write().insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: u64) -> Result<Calculation> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound { id })
    }

    async fn list(&self) -> Result<Vec<Calculation>> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    async fn update_result(&self, id: u64, result: f64) -> Result<()> {
        let mut records = self.records.write();
        let record = records.get_mut(&id).ok_or(Error::NotFound { id })?;

        // First write wins: a Completed record is immutable, so a repeat
        // application (redelivery) is a no-op success.
        if record.completed_at.is_none() {
            let now = Utc::now();
            record.result = Some(result);
            record.completed_at = Some(now);
            record.updated_at = now;
        }
        Ok(())
    }
}
