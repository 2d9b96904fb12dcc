mod common;

use common::{query_keyword, FakeChunkFactory};
use rt_index_core::accumulator::{Accumulator, DedupMode};
use rt_index_core::config::Config;
use rt_index_core::index::IndexManager;
use rt_index_core::value::{pack_field_position, Hit, Keyword};
use std::sync::Arc;
use std::time::Duration;

fn hit(keyword: &str) -> Hit {
    Hit { row_id: 0, keyword: Keyword::Bytes(keyword.as_bytes().to_vec()), field_position: pack_field_position(0, 0) }
}

fn commit_one(manager: &IndexManager, doc_id: i64, keyword: &str) {
    let mut acc = Accumulator::new(1, DedupMode::Replace, vec![], None);
    acc.add_document(doc_id, &[0], b"", None, vec![hit(keyword)]).unwrap();
    manager.commit(&mut acc).unwrap();
}

#[test]
fn flush_makes_progress_alongside_a_thousand_concurrent_commits() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeChunkFactory::default());
    // A one-byte soft limit trips the flush decision on the very first
    // commit, so every commit after it races a background flush.
    let config = Config::new(dir.path()).ram_soft_limit(1);
    let manager = IndexManager::new("idx", config, 1, 0, false, 1, Arc::clone(&factory));

    commit_one(&manager, 0, "seed");

    for doc_id in 1..=1000i64 {
        commit_one(&manager, doc_id, &format!("w{doc_id}"));
    }

    let mut last = (usize::MAX, usize::MAX);
    let mut stable_rounds = 0;
    for _ in 0..400 {
        let snapshot = manager.snapshot();
        let state = (snapshot.disk_chunks.len(), snapshot.ram_segments.len());
        if state == last {
            stable_rounds += 1;
            if stable_rounds >= 5 {
                break;
            }
        } else {
            stable_rounds = 0;
        }
        last = state;
        std::thread::sleep(Duration::from_millis(5));
    }

    let snapshot = manager.snapshot();
    assert!(!snapshot.disk_chunks.is_empty(), "the forced flush must have published at least one disk chunk");

    let flushed_alive: u64 = factory.chunks().iter().map(|c| c.alive_doc_ids().len() as u64).sum();
    assert_eq!(snapshot.ram_alive_rows() + flushed_alive, 1001, "no document committed during the flush may be lost");

    for doc_id in 1..=1000i64 {
        let in_ram = query_keyword(&snapshot, &format!("w{doc_id}")).contains(&doc_id);
        let on_disk = factory.chunks().iter().any(|c| c.alive_doc_ids().contains(&doc_id));
        assert!(in_ram || on_disk, "doc {doc_id} committed during the flush must still be queryable");
    }
}
