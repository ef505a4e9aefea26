//! [`IndexStorage`] over an object store.
//!
//! Key layout under the configured prefix:
//! ```text
//! {prefix}/coarse.bin               coarse codebook (absent for plain PQ)
//! {prefix}/fine.bin                 fine codebook
//! {prefix}/counts.json              occupancy statistics
//! {prefix}/cells/{cell}/{ulid}.bin  entry batches, one blob per cell per upsert
//! {prefix}/cells/{cell}/{ulid}.del  ids that moved out of the cell in that upsert
//! {prefix}/ids/{ulid}.bin           id to cell manifest of each entry upsert
//! {prefix}/vectors/{ulid}.bin       raw vector batches
//! ```
//! Cell directories are zero-padded so listing order matches numeric order.
//! Within a cell, keys sort by batch id, so replaying them in order leaves
//! only the latest entry of every id that still lives there.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use ulid::{Generator, Ulid};

use super::codec::{
    decode_assignments, decode_entries, decode_ids, decode_vectors, encode_assignments,
    encode_entries, encode_ids, encode_vectors,
};
use super::store::BlobStore;
use super::IndexStorage;
use crate::error::{Result, WordPqError};
use crate::index::codebook::{Codebook, CodebookKind};
use crate::index::coarse::CoarseQuantizer;
use crate::index::counts::OccupancyCounts;
use crate::types::{CellId, QuantizedEntry, VectorId, WordVector};

#[derive(Clone)]
pub struct ObjectIndexStore {
    store: BlobStore,
    prefix: String,
    /// Monotonic within this process, so batch keys sort in write order.
    batch_ids: Arc<Mutex<Generator>>,
    /// Current cell of every stored id, replayed from the manifests on first
    /// use. The lock also serializes entry upserts.
    assignments: Arc<tokio::sync::Mutex<Option<HashMap<VectorId, CellId>>>>,
}

impl ObjectIndexStore {
    pub fn new(store: BlobStore, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self {
            store,
            prefix,
            batch_ids: Arc::new(Mutex::new(Generator::new())),
            assignments: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    fn next_batch_id(&self) -> Result<Ulid> {
        let mut generator = self
            .batch_ids
            .lock()
            .map_err(|_| WordPqError::Index("batch id generator poisoned".into()))?;
        generator
            .generate()
            .map_err(|e| WordPqError::Index(format!("batch id overflow: {e}")))
    }

    fn key(&self, rest: &str) -> String {
        format!("{}/{rest}", self.prefix)
    }

    fn cell_prefix(&self, cell: CellId) -> String {
        self.key(&format!("cells/{cell:010}"))
    }

    /// Every blob under `prefix` in key order, so later batches come last.
    async fn fetch_all(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let keys = self.store.list_prefix(prefix).await?;
        futures::future::try_join_all(keys.into_iter().map(|key| async move {
            let data = self.store.get(&key).await?;
            Ok::<_, WordPqError>((key, data))
        }))
        .await
    }

    async fn replay_assignments(&self) -> Result<HashMap<VectorId, CellId>> {
        let mut current = HashMap::new();
        for (_, blob) in self.fetch_all(&self.key("ids")).await? {
            current.extend(decode_assignments(&blob)?);
        }
        debug!(ids = current.len(), "replayed id assignments");
        Ok(current)
    }
}

#[async_trait]
impl IndexStorage for ObjectIndexStore {
    async fn upsert_coarse_centroids(&self, quantizer: &CoarseQuantizer) -> Result<()> {
        self.store
            .put(&self.key("coarse.bin"), quantizer.codebook().to_bytes())
            .await?;
        info!(
            cells = quantizer.num_cells(),
            m_coarse = quantizer.m_coarse(),
            "stored coarse quantizer"
        );
        Ok(())
    }

    async fn upsert_fine_codebook(&self, codebook: &Codebook) -> Result<()> {
        if codebook.kind == CodebookKind::Coarse {
            return Err(WordPqError::Index(
                "refusing to store a coarse codebook as the fine codebook".into(),
            ));
        }
        self.store.put(&self.key("fine.bin"), codebook.to_bytes()).await?;
        info!(kind = %codebook.kind, m = codebook.m, k = codebook.k, "stored fine codebook");
        Ok(())
    }

    async fn upsert_quantized_entries(&self, batch: &[QuantizedEntry]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        // the last occurrence of an id within the batch wins
        let mut latest: BTreeMap<VectorId, &QuantizedEntry> = BTreeMap::new();
        for entry in batch {
            latest.insert(entry.id, entry);
        }

        let mut guard = self.assignments.lock().await;
        if guard.is_none() {
            *guard = Some(self.replay_assignments().await?);
        }
        let current = guard.get_or_insert_with(HashMap::new);

        let mut by_cell: BTreeMap<CellId, Vec<QuantizedEntry>> = BTreeMap::new();
        let mut moved_out: BTreeMap<CellId, Vec<VectorId>> = BTreeMap::new();
        let mut manifest = Vec::with_capacity(latest.len());
        for (&id, entry) in &latest {
            if let Some(&old) = current.get(&id) {
                if old != entry.cell {
                    moved_out.entry(old).or_default().push(id);
                }
            }
            by_cell.entry(entry.cell).or_default().push((*entry).clone());
            manifest.push((id, entry.cell));
        }

        let batch_id = self.next_batch_id()?;
        let mut writes = Vec::with_capacity(by_cell.len() + moved_out.len() + 1);
        for (cell, entries) in &by_cell {
            let key = format!("{}/{batch_id}.bin", self.cell_prefix(*cell));
            writes.push((key, encode_entries(entries)?));
        }
        for (cell, ids) in &moved_out {
            let key = format!("{}/{batch_id}.del", self.cell_prefix(*cell));
            writes.push((key, encode_ids(ids)));
        }
        writes.push((
            self.key(&format!("ids/{batch_id}.bin")),
            encode_assignments(&manifest),
        ));
        futures::future::try_join_all(
            writes
                .into_iter()
                .map(|(key, data)| async move { self.store.put(&key, data).await }),
        )
        .await?;

        current.extend(manifest);
        debug!(
            entries = latest.len(),
            cells = by_cell.len(),
            moved = moved_out.values().map(Vec::len).sum::<usize>(),
            "upserted entry batch"
        );
        Ok(())
    }

    async fn scan_entries_by_coarse_cell(&self, cell: CellId) -> Result<Vec<QuantizedEntry>> {
        let mut latest: BTreeMap<VectorId, QuantizedEntry> = BTreeMap::new();
        for (key, blob) in self.fetch_all(&self.cell_prefix(cell)).await? {
            if key.ends_with(".del") {
                for id in decode_ids(&blob)? {
                    latest.remove(&id);
                }
            } else {
                for entry in decode_entries(&blob)? {
                    latest.insert(entry.id, entry);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn load_codebook(&self) -> Result<Codebook> {
        let data = self.store.get(&self.key("fine.bin")).await?;
        Codebook::from_bytes(&data)
    }

    async fn load_coarse_quantizer(&self) -> Result<Option<CoarseQuantizer>> {
        let key = self.key("coarse.bin");
        if !self.store.exists(&key).await? {
            return Ok(None);
        }
        let data = self.store.get(&key).await?;
        Ok(Some(CoarseQuantizer::new(Codebook::from_bytes(&data)?)?))
    }

    async fn upsert_vectors(&self, batch: &[WordVector]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let key = self.key(&format!("vectors/{}.bin", self.next_batch_id()?));
        self.store.put(&key, encode_vectors(batch)?).await?;
        debug!(vectors = batch.len(), "upserted vector batch");
        Ok(())
    }

    async fn load_vectors(&self, ids: Option<&HashSet<VectorId>>) -> Result<Vec<WordVector>> {
        let mut latest: BTreeMap<VectorId, WordVector> = BTreeMap::new();
        for (_, blob) in self.fetch_all(&self.key("vectors")).await? {
            for v in decode_vectors(&blob)? {
                if ids.map_or(true, |set| set.contains(&v.id)) {
                    latest.insert(v.id, v);
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn upsert_counts(&self, counts: &OccupancyCounts) -> Result<()> {
        let json = serde_json::to_vec(counts)?;
        self.store.put(&self.key("counts.json"), Bytes::from(json)).await
    }

    async fn load_counts(&self) -> Result<OccupancyCounts> {
        let data = self.store.get(&self.key("counts.json")).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn clear(&self) -> Result<()> {
        let mut assignments = self.assignments.lock().await;
        let removed = self.store.delete_prefix(&self.prefix).await?;
        *assignments = None;
        info!(removed, prefix = %self.prefix, "cleared index");
        Ok(())
    }
}
