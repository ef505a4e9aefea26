pub mod codec;
pub mod index_store;
pub mod store;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::Result;
use crate::index::codebook::Codebook;
use crate::index::coarse::CoarseQuantizer;
use crate::index::counts::OccupancyCounts;
use crate::types::{CellId, QuantizedEntry, VectorId, WordVector};

pub use index_store::ObjectIndexStore;
pub use store::BlobStore;

/// Persistence seam between the index and wherever its artifacts live.
///
/// Entries and raw vectors are append-only batches; upserting an id again
/// shadows the earlier record. An entry upserted into a different cell
/// disappears from the cell it left. Quantizers and counts are replaced whole.
#[async_trait]
pub trait IndexStorage: Send + Sync {
    async fn upsert_coarse_centroids(&self, quantizer: &CoarseQuantizer) -> Result<()>;

    async fn upsert_fine_codebook(&self, codebook: &Codebook) -> Result<()>;

    async fn upsert_quantized_entries(&self, batch: &[QuantizedEntry]) -> Result<()>;

    /// All entries assigned to `cell`, ordered by id.
    async fn scan_entries_by_coarse_cell(&self, cell: CellId) -> Result<Vec<QuantizedEntry>>;

    /// The fine codebook.
    async fn load_codebook(&self) -> Result<Codebook>;

    /// The coarse quantizer, or `None` for a plain PQ index.
    async fn load_coarse_quantizer(&self) -> Result<Option<CoarseQuantizer>>;

    async fn upsert_vectors(&self, batch: &[WordVector]) -> Result<()>;

    /// Raw vectors ordered by id, restricted to `ids` when given.
    async fn load_vectors(&self, ids: Option<&HashSet<VectorId>>) -> Result<Vec<WordVector>>;

    async fn upsert_counts(&self, counts: &OccupancyCounts) -> Result<()>;

    async fn load_counts(&self) -> Result<OccupancyCounts>;

    /// Remove every artifact of the index.
    async fn clear(&self) -> Result<()>;
}
