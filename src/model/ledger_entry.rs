use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// a row recording that `job_id` holds a reference on `target_id` on
/// `node_id`. Identity is the composite `(job_id, target_id, node_id)`
/// (spec's normalized identity, see DESIGN.md); `id` is a surrogate key kept
/// only for convenient row addressing.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub job_id: i64,
    pub target_id: String,
    pub node_id: String,
    pub mounted: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
