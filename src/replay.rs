// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! WAL replay: decodes the core's own wire format for a committed
//! transaction or a reconfiguration event, and drives them through the
//! same paths live writes use (spec §4.9 "Recovery via WAL").
//!
//! The [`crate::collab::WriteAheadLog`] trait treats a committed
//! transaction's bytes as opaque; the format decoded here is this core's
//! own convention, not the WAL's framing.

use crate::accumulator::{Accumulator, DedupMode};
use crate::coding::{decode_vlb, encode_vlb};
use crate::config::Config;
use crate::segment::{RamSegment, SegmentId};
use crate::value::{DocId, Hit, Keyword};
use std::io::{Read, Write};

fn zigzag_encode(value: DocId) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(encoded: u64) -> DocId {
    ((encoded >> 1) as DocId) ^ -((encoded & 1) as DocId)
}

/// One document staged by a replayed transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayedDoc {
    /// Doc id.
    pub doc_id: DocId,
    /// Fixed-attribute row words.
    pub words: Vec<u32>,
    /// Combined variable-length blob payload.
    pub blob: Vec<u8>,
    /// Pre-tokenized hits, including any end-of-field markers.
    pub hits: Vec<Hit>,
}

/// A fully decoded transaction, as written to the WAL at commit time.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayedTransaction {
    /// Transaction id assigned by the WAL.
    pub tid: u64,
    /// Doc ids deleted by this transaction.
    pub kills: Vec<DocId>,
    /// Documents inserted or replaced by this transaction.
    pub docs: Vec<ReplayedDoc>,
}

/// Serializes a transaction for the WAL to append (spec §4.9: the
/// commit-replay payload format). Keywords are always written as raw bytes;
/// dictionary-id keywords are re-resolved at replay time via the normal
/// commit path, same as a live write would.
pub fn encode_transaction(tx: &ReplayedTransaction) -> crate::Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_vlb(&mut buf, tx.tid)?;

    encode_vlb(&mut buf, tx.kills.len() as u64)?;
    for &doc_id in &tx.kills {
        encode_vlb(&mut buf, zigzag_encode(doc_id))?;
    }

    encode_vlb(&mut buf, tx.docs.len() as u64)?;
    for doc in &tx.docs {
        encode_vlb(&mut buf, zigzag_encode(doc.doc_id))?;

        encode_vlb(&mut buf, doc.words.len() as u64)?;
        for &word in &doc.words {
            encode_vlb(&mut buf, u64::from(word))?;
        }

        encode_vlb(&mut buf, doc.blob.len() as u64)?;
        buf.write_all(&doc.blob)?;

        encode_vlb(&mut buf, doc.hits.len() as u64)?;
        for hit in &doc.hits {
            let keyword_bytes = hit.keyword.as_bytes();
            encode_vlb(&mut buf, keyword_bytes.len() as u64)?;
            buf.write_all(keyword_bytes)?;
            encode_vlb(&mut buf, u64::from(hit.field_position))?;
        }
    }

    Ok(buf)
}

/// Deserializes a transaction written by [`encode_transaction`].
pub fn decode_transaction(bytes: &[u8]) -> crate::Result<ReplayedTransaction> {
    let mut reader = std::io::Cursor::new(bytes);

    let tid = decode_vlb(&mut reader)?;

    let kill_count = decode_vlb(&mut reader)? as usize;
    let mut kills = Vec::with_capacity(kill_count);
    for _ in 0..kill_count {
        kills.push(zigzag_decode(decode_vlb(&mut reader)?));
    }

    let doc_count = decode_vlb(&mut reader)? as usize;
    let mut docs = Vec::with_capacity(doc_count);
    for _ in 0..doc_count {
        let doc_id = zigzag_decode(decode_vlb(&mut reader)?);

        let word_count = decode_vlb(&mut reader)? as usize;
        let mut words = Vec::with_capacity(word_count);
        for _ in 0..word_count {
            words.push(decode_vlb(&mut reader)? as u32);
        }

        let blob_len = decode_vlb(&mut reader)? as usize;
        let mut blob = vec![0u8; blob_len];
        reader.read_exact(&mut blob)?;

        let hit_count = decode_vlb(&mut reader)? as usize;
        let mut hits = Vec::with_capacity(hit_count);
        for _ in 0..hit_count {
            let keyword_len = decode_vlb(&mut reader)? as usize;
            let mut keyword_bytes = vec![0u8; keyword_len];
            reader.read_exact(&mut keyword_bytes)?;
            let field_position = decode_vlb(&mut reader)? as u32;
            hits.push(Hit { row_id: 0, keyword: Keyword::Bytes(keyword_bytes), field_position });
        }

        docs.push(ReplayedDoc { doc_id, words, blob, hits });
    }

    Ok(ReplayedTransaction { tid, kills, docs })
}

/// Outcome of replaying one transaction.
pub struct ReplayedCommit {
    /// The transaction id that was replayed.
    pub tid: u64,
    /// Doc ids this transaction deletes; the caller applies these to the
    /// live snapshot before publishing `segment`, same ordering guarantee
    /// as a live commit (spec §4.4, §5).
    pub kills: Vec<DocId>,
    /// The segment rebuilt from this transaction's staged documents, or
    /// `None` if it only carried kills.
    pub segment: Option<RamSegment>,
    /// `true` if `tid` was already durable as of `last_saved_tid` and the
    /// WAL should not replay it again once this callback returns.
    pub already_durable: bool,
}

/// Rebuilds a RAM segment from one committed transaction's bytes, driving
/// it through the same [`Accumulator`] commit path a live write uses (spec
/// §4.9 "Recovery via WAL"). `last_saved_tid` is the gate from the `.meta`
/// file: transactions at or below it were already durably flushed and are
/// reported back to the WAL as such so it can advance past them.
pub fn replay_commit(
    bytes: &[u8],
    last_saved_tid: u64,
    segment_id: SegmentId,
    stride: usize,
    config: &Config,
    dictionary_in_use: bool,
) -> crate::Result<ReplayedCommit> {
    let tx = decode_transaction(bytes)?;
    let already_durable = tx.tid <= last_saved_tid;

    let mut accumulator = Accumulator::new(stride, DedupMode::Replace, Vec::new(), config.blob_word_offset);

    for doc in &tx.docs {
        accumulator.add_document(doc.doc_id, &doc.words, &doc.blob, None, doc.hits.clone())?;
    }

    let segment = accumulator.commit(segment_id, config, dictionary_in_use)?;

    log::debug!(
        "replay: transaction {} ({} docs, {} kills), already_durable={already_durable}",
        tx.tid,
        tx.docs.len(),
        tx.kills.len()
    );

    Ok(ReplayedCommit { tid: tx.tid, kills: tx.kills, segment, already_durable })
}

/// A schema/settings change replayed at startup, distinct from document
/// commits (spec §4.9 "`replay_reconfigure`").
#[derive(Clone, Debug, PartialEq)]
pub enum ReconfigureEvent {
    /// A scalar attribute was added or removed from the schema.
    Attribute {
        /// Attribute name.
        name: String,
        /// `true` if added, `false` if removed.
        add: bool,
    },
    /// A stored field was added or removed from the schema.
    Field {
        /// Field name.
        name: String,
        /// `true` if added, `false` if removed.
        add: bool,
    },
    /// The word-checkpoint stride changed.
    CheckpointStride(u32),
}

/// Serializes a reconfiguration event for the WAL.
pub fn encode_reconfigure(event: &ReconfigureEvent) -> crate::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match event {
        ReconfigureEvent::Attribute { name, add } => {
            encode_vlb(&mut buf, 0)?;
            encode_vlb(&mut buf, u64::from(*add))?;
            encode_vlb(&mut buf, name.len() as u64)?;
            buf.write_all(name.as_bytes())?;
        }
        ReconfigureEvent::Field { name, add } => {
            encode_vlb(&mut buf, 1)?;
            encode_vlb(&mut buf, u64::from(*add))?;
            encode_vlb(&mut buf, name.len() as u64)?;
            buf.write_all(name.as_bytes())?;
        }
        ReconfigureEvent::CheckpointStride(stride) => {
            encode_vlb(&mut buf, 2)?;
            encode_vlb(&mut buf, u64::from(*stride))?;
        }
    }
    Ok(buf)
}

/// Deserializes a reconfiguration event written by [`encode_reconfigure`].
pub fn decode_reconfigure(bytes: &[u8]) -> crate::Result<ReconfigureEvent> {
    let mut reader = std::io::Cursor::new(bytes);
    let tag = decode_vlb(&mut reader)?;
    match tag {
        0 | 1 => {
            let add = decode_vlb(&mut reader)? != 0;
            let len = decode_vlb(&mut reader)? as usize;
            let mut name_bytes = vec![0u8; len];
            reader.read_exact(&mut name_bytes)?;
            let name = String::from_utf8(name_bytes).map_err(|_| crate::Error::Decode(crate::coding::DecodeError::InvalidHeader("reconfigure event name is not UTF-8")))?;
            Ok(if tag == 0 { ReconfigureEvent::Attribute { name, add } } else { ReconfigureEvent::Field { name, add } })
        }
        2 => Ok(ReconfigureEvent::CheckpointStride(decode_vlb(&mut reader)? as u32)),
        _ => Err(crate::Error::Decode(crate::coding::DecodeError::InvalidHeader("unknown reconfigure event tag"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::pack_field_position;
    use test_log::test;

    fn sample_tx() -> ReplayedTransaction {
        ReplayedTransaction {
            tid: 12,
            kills: vec![-3, 5],
            docs: vec![ReplayedDoc {
                doc_id: 9,
                words: vec![1, 2],
                blob: b"payload".to_vec(),
                hits: vec![Hit { row_id: 0, keyword: Keyword::Bytes(b"hello".to_vec()), field_position: pack_field_position(0, 3) }],
            }],
        }
    }

    #[test]
    fn transaction_round_trips() {
        let tx = sample_tx();
        let bytes = encode_transaction(&tx).unwrap();
        let decoded = decode_transaction(&bytes).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn zigzag_round_trips_negative_and_positive() {
        for value in [0i64, 1, -1, i64::MAX, i64::MIN, 12345, -98765] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn replay_commit_reports_already_durable_below_gate() {
        let tx = sample_tx();
        let bytes = encode_transaction(&tx).unwrap();
        let config = Config::new("/tmp/unused");

        let below_gate = replay_commit(&bytes, 100, 1, 2, &config, false).unwrap();
        assert!(below_gate.already_durable);

        let above_gate = replay_commit(&bytes, 1, 2, 2, &config, false).unwrap();
        assert!(!above_gate.already_durable);
        assert!(above_gate.segment.is_some());
        assert_eq!(above_gate.kills, vec![-3, 5]);
    }

    #[test]
    fn reconfigure_event_round_trips() {
        for event in [
            ReconfigureEvent::Attribute { name: "color".to_string(), add: true },
            ReconfigureEvent::Field { name: "body".to_string(), add: false },
            ReconfigureEvent::CheckpointStride(64),
        ] {
            let bytes = encode_reconfigure(&event).unwrap();
            assert_eq!(decode_reconfigure(&bytes).unwrap(), event);
        }
    }
}
