mod common;

use common::{query_keyword, FakeChunkFactory};
use rt_index_core::accumulator::{Accumulator, DedupMode};
use rt_index_core::config::Config;
use rt_index_core::index::IndexManager;
use rt_index_core::value::{pack_field_position, Hit, Keyword};
use std::sync::Arc;

fn hit(keyword: &str) -> Hit {
    Hit { row_id: 0, keyword: Keyword::Bytes(keyword.as_bytes().to_vec()), field_position: pack_field_position(0, 0) }
}

#[test]
fn delete_then_insert_in_one_transaction_leaves_the_new_doc_alive() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path());
    let manager = IndexManager::new("idx", config, 1, 0, false, 1, Arc::new(FakeChunkFactory::default()));

    let mut acc = Accumulator::new(1, DedupMode::Replace, vec![], None);
    acc.delete_document(&[10]);
    acc.add_document(10, &[0], b"", None, vec![hit("x")]).unwrap();

    let report = manager.commit(&mut acc).unwrap();
    assert!(report.segment_published);
    assert_eq!(report.ram_killed, 0, "doc 10 never existed before this transaction");

    let snapshot = manager.snapshot();
    assert_eq!(query_keyword(&snapshot, "x"), vec![10]);
    assert_eq!(snapshot.ram_alive_rows(), 1);
}
