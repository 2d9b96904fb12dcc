use rt_index_core::collab::{DiskChunkOps, DiskChunkStatus};
use rt_index_core::query::RtWordReader;
use rt_index_core::DiskChunkFactory;
use rt_index_core::segment::RamSegment;
use rt_index_core::snapshot::Snapshot;
use rt_index_core::value::{DocId, Keyword};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A disk chunk test double: records what it was asked to do instead of
/// writing any real on-disk format, since the chunk's own inverted-index
/// layout is entirely opaque to this core.
#[derive(Default)]
pub struct FakeChunk {
    id: u64,
    killed: Mutex<Vec<DocId>>,
    total_rows: AtomicU64,
    alive_doc_ids: Mutex<Vec<DocId>>,
}

impl FakeChunk {
    /// Doc ids reported alive in this chunk as of the last
    /// [`DiskChunkOps::build_from_segments`] call, minus anything killed
    /// since via [`DiskChunkOps::kill_multi`].
    pub fn alive_doc_ids(&self) -> Vec<DocId> {
        let killed = self.killed.lock().unwrap();
        self.alive_doc_ids.lock().unwrap().iter().copied().filter(|id| !killed.contains(id)).collect()
    }

    /// Total rows (alive or dead) carried into this chunk by the flush that
    /// built it.
    pub fn total_rows(&self) -> u64 {
        self.total_rows.load(Ordering::Relaxed)
    }
}

impl DiskChunkOps for FakeChunk {
    fn id(&self) -> u64 {
        self.id
    }
    fn preallocate(&self, _schema_fingerprint: u64) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn build_from_segments(&self, segments: &[Arc<RamSegment>], _schema_fingerprint: u64) -> rt_index_core::Result<()> {
        let mut rows = 0u64;
        let mut alive = Vec::new();
        for segment in segments {
            rows += u64::from(segment.u_rows());
            for (&doc_id, &row_id) in segment.doc_id_index() {
                if segment.find_alive_row(doc_id) == Some(row_id) {
                    alive.push(doc_id);
                }
            }
        }
        self.total_rows.store(rows, Ordering::Relaxed);
        *self.alive_doc_ids.lock().unwrap() = alive;
        Ok(())
    }
    fn rename_into_place(&self) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn unlink(&self) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn kill_multi(&self, doc_ids: &[DocId]) -> rt_index_core::Result<u64> {
        self.killed.lock().unwrap().extend_from_slice(doc_ids);
        Ok(doc_ids.len() as u64)
    }
    fn update_attributes(&self, _doc_id: DocId, _changes: &[u8]) -> rt_index_core::Result<bool> {
        Ok(false)
    }
    fn save_attributes(&self) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn get_status(&self) -> DiskChunkStatus {
        DiskChunkStatus { alive_rows: self.alive_doc_ids().len() as u64, total_rows: self.total_rows.load(Ordering::Relaxed), disk_bytes: 0 }
    }
    fn get_stats(&self) -> Vec<(String, u64)> {
        Vec::new()
    }
    fn add_remove_attribute(&self, _name: &str, _add: bool) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn add_remove_field(&self, _name: &str, _add: bool) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn get_field_lens(&self) -> Vec<(u8, u64)> {
        Vec::new()
    }
    fn compress_into(&self, _target: &dyn DiskChunkOps) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn merge_older_into(&self, _older: &dyn DiskChunkOps, _target: &dyn DiskChunkOps) -> rt_index_core::Result<()> {
        Ok(())
    }
    fn split_by(&self, _left: &dyn DiskChunkOps, _right: &dyn DiskChunkOps, _filter: &dyn Fn(DocId) -> bool) -> rt_index_core::Result<Vec<DocId>> {
        Ok(Vec::new())
    }
}

/// Hands out a fresh [`FakeChunk`] per requested id, keeping a handle to
/// each one so tests can inspect what actually landed on "disk".
#[derive(Default)]
pub struct FakeChunkFactory {
    created: Mutex<Vec<Arc<FakeChunk>>>,
}

impl FakeChunkFactory {
    /// Every chunk this factory has handed out so far, oldest first.
    pub fn chunks(&self) -> Vec<Arc<FakeChunk>> {
        self.created.lock().unwrap().clone()
    }
}

impl DiskChunkFactory for FakeChunkFactory {
    fn create(&self, chunk_id: u64) -> Arc<dyn DiskChunkOps> {
        let chunk = Arc::new(FakeChunk { id: chunk_id, ..Default::default() });
        self.created.lock().unwrap().push(Arc::clone(&chunk));
        chunk
    }
}

/// Walks every RAM segment in `snapshot`, looking for `keyword`, and returns
/// the alive doc ids posted against it. Disk chunks are opaque to this core
/// (their own query path is an external collaborator's concern), so this
/// helper only covers the RAM tier -- sufficient for the write-path
/// scenarios these integration tests exercise.
pub fn query_keyword(snapshot: &Snapshot, keyword: &str) -> Vec<DocId> {
    let target = Keyword::Bytes(keyword.as_bytes().to_vec());
    let mut found = Vec::new();

    for segment in snapshot.ram_segments.iter() {
        let mut reader = RtWordReader::new(&segment.postings);
        while let Some(item) = reader.next() {
            let (kw, docs) = item.expect("postings must decode");
            if kw != target {
                continue;
            }
            for doc in &docs {
                if let Some(doc_id) = segment
                    .doc_id_index()
                    .iter()
                    .find(|(_, &row_id)| row_id == doc.row_id)
                    .map(|(&doc_id, _)| doc_id)
                {
                    if segment.find_alive_row(doc_id) == Some(doc.row_id) {
                        found.push(doc_id);
                    }
                }
            }
        }
    }

    found
}
