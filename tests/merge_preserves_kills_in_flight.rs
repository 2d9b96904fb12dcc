mod common;

use common::FakeChunkFactory;
use rt_index_core::accumulator::{Accumulator, DedupMode};
use rt_index_core::config::Config;
use rt_index_core::index::IndexManager;
use rt_index_core::value::{pack_field_position, Hit, Keyword};
use std::sync::Arc;
use std::time::Duration;

fn hit(keyword: &str) -> Hit {
    Hit { row_id: 0, keyword: Keyword::Bytes(keyword.as_bytes().to_vec()), field_position: pack_field_position(0, 0) }
}

/// Commits one document per id/keyword pair in a single transaction.
fn commit_docs(manager: &IndexManager, docs: &[(i64, &str)]) {
    let mut acc = Accumulator::new(1, DedupMode::Replace, vec![], None);
    for &(doc_id, keyword) in docs {
        acc.add_document(doc_id, &[0], b"", None, vec![hit(keyword)]).unwrap();
    }
    manager.commit(&mut acc).unwrap();
}

#[test]
fn kills_landing_around_a_background_merge_are_never_lost() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::new(dir.path());
    let manager = IndexManager::new("idx", config, 1, 0, false, 1, Arc::new(FakeChunkFactory::default()));

    commit_docs(&manager, &[(1, "k")]);
    // Three rows against one forces an immediate merge decision (the
    // progression check only holds segments back while they're close in
    // size), which the merger worker then runs in the background.
    commit_docs(&manager, &[(2, "m"), (3, "n"), (4, "o")]);
    commit_docs(&manager, &[(5, "p")]);

    let mut last_len = usize::MAX;
    let mut stable_rounds = 0;
    for _ in 0..200 {
        manager.kill(&[1]).unwrap();
        manager.kill(&[2]).unwrap();

        let len = manager.snapshot().ram_segments.len();
        if len == last_len {
            stable_rounds += 1;
            if stable_rounds >= 5 {
                break;
            }
        } else {
            stable_rounds = 0;
        }
        last_len = len;
        std::thread::sleep(Duration::from_millis(5));
    }

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.ram_segments.len(), 2, "the merged segment and the untouched third commit");
    assert!(snapshot.find_alive_row_in_ram(1).is_none(), "doc 1 was killed before the merge could have read it");
    assert!(snapshot.find_alive_row_in_ram(2).is_none(), "doc 2 was killed while the merge was in flight or just after");
    assert!(snapshot.find_alive_row_in_ram(3).is_some());
    assert!(snapshot.find_alive_row_in_ram(4).is_some());
    assert!(snapshot.find_alive_row_in_ram(5).is_some());
}
