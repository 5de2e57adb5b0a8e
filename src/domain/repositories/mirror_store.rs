//! Mirror Store Trait
//!
//! Interface to the remote mirror database used for cross-instance
//! durability. The mirror is a whole-set key-value store: a manifest with a
//! content hash, and the full record set below it. Concrete transport lives
//! in `infrastructure::http_mirror`.

use crate::domain::entities::trade::TradeRecord;
use crate::domain::errors::SyncError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata describing the mirror's current contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorManifest {
    pub environment: String,
    pub content_hash: String,
    pub record_count: usize,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Remote mirror of the trade ledger.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Fetch the mirror manifest; `None` when the mirror has never been
    /// written.
    async fn fetch_manifest(&self) -> Result<Option<MirrorManifest>, SyncError>;

    /// Pull the full remote record set.
    async fn pull_records(&self) -> Result<Vec<TradeRecord>, SyncError>;

    /// Replace the remote record set and manifest in one write.
    async fn push_records(
        &self,
        records: &[TradeRecord],
        manifest: &MirrorManifest,
    ) -> Result<(), SyncError>;
}
