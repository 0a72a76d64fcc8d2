//! The persisted calculation record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted calculation and its lifecycle bookkeeping.
///
/// Records are created Pending (no result) and transition exactly once to
/// Completed when the result leg is applied: `result` and `completed_at` are
/// set atomically, and a Completed record is immutable from then on.
///
/// The store owns the record; pipeline components never cache it. Every
/// read and write is a round trip, so concurrent handlers across process
/// boundaries observe a single source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    /// Store-assigned identifier, immutable after creation.
    pub id: u64,
    /// Free-text requester identity.
    pub owner: String,
    /// The input expression, immutable after creation.
    pub expression: String,
    /// Absent until the result leg completes.
    pub result: Option<f64>,
    /// Set exactly once, atomically with `result`.
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Calculation {
    /// Whether the result leg has been applied.
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}
