// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-checkpoint infix bloom filters: two bloom filters (2-gram, 4-gram)
//! over the n-grams of the keywords in a checkpoint's range, used to skip
//! checkpoints during wildcard/infix search (spec §3, §4.3 step 4).
//!
//! Conservative: may have false positives, must never have false
//! negatives (spec §8, invariant/property 5).

use super::bit_array::BitArray;
use std::io::{Read, Write};

/// Two hashes used for double hashing, same trick the teacher's bloom
/// filter uses: `h1 + i * h2` stands in for `k` independent hash functions.
type CompositeHash = (u64, u64);

fn hash_bytes(bytes: &[u8]) -> CompositeHash {
    let h1 = xxhash_rust::xxh3::xxh3_64(bytes);
    let h2 = xxhash_rust::xxh3::xxh3_64_with_seed(bytes, h1);
    (h1, h2)
}

/// A single bloom filter over byte n-grams.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NgramBloom {
    inner: BitArray,
    m: usize,
    k: usize,
}

impl NgramBloom {
    /// Sizes a filter for `expected_items` entries at `fp_rate`.
    #[must_use]
    pub fn with_fp_rate(expected_items: usize, fp_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let m = Self::optimal_m(expected_items, fp_rate);
        let k = Self::optimal_k(expected_items, m);
        Self { inner: BitArray::with_capacity(m.div_ceil(8)), m, k: k.max(1) }
    }

    fn optimal_m(n: usize, fp_rate: f64) -> usize {
        let n = n as f64;
        let ln2_sq = std::f64::consts::LN_2 * std::f64::consts::LN_2;
        (((-n * fp_rate.ln()) / ln2_sq).ceil() as usize).max(64)
    }

    fn optimal_k(n: usize, m: usize) -> usize {
        (((m as f64 / n as f64) * std::f64::consts::LN_2).round() as usize).clamp(1, 12)
    }

    /// Inserts one n-gram.
    pub fn insert(&mut self, ngram: &[u8]) {
        let (h1, h2) = hash_bytes(ngram);
        for i in 0..self.k {
            let idx = (h1.wrapping_add((i as u64).wrapping_mul(h2)) as usize) % (self.m.max(1));
            self.inner.set(idx, true);
        }
    }

    /// Returns `true` if the n-gram *may* be present. Never returns `false`
    /// for an n-gram that was actually inserted.
    #[must_use]
    pub fn may_contain(&self, ngram: &[u8]) -> bool {
        let (h1, h2) = hash_bytes(ngram);
        (0..self.k).all(|i| {
            let idx = (h1.wrapping_add((i as u64).wrapping_mul(h2)) as usize) % (self.m.max(1));
            self.inner.get(idx)
        })
    }

    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        use byteorder::{BigEndian, WriteBytesExt};
        writer.write_u64::<BigEndian>(self.m as u64)?;
        writer.write_u64::<BigEndian>(self.k as u64)?;
        writer.write_all(self.inner.bytes())
    }

    fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        use byteorder::{BigEndian, ReadBytesExt};
        let m = reader.read_u64::<BigEndian>()? as usize;
        let k = reader.read_u64::<BigEndian>()? as usize;
        let mut bytes = vec![0; m.div_ceil(8)];
        reader.read_exact(&mut bytes)?;
        Ok(Self { inner: BitArray::from_bytes(bytes.into_boxed_slice()), m, k })
    }
}

/// The two n-gram blooms (2-gram, 4-gram) covering one word checkpoint's
/// keyword range.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InfixBlock {
    two_gram: NgramBloom,
    four_gram: NgramBloom,
}

/// Extracts every contiguous n-gram of `keyword`, for `n` in `2..=4` (the
/// two block sizes the format mandates).
fn ngrams(keyword: &[u8], n: usize) -> impl Iterator<Item = &[u8]> {
    if keyword.len() < n {
        None.into_iter().flatten()
    } else {
        Some(keyword.windows(n)).into_iter().flatten()
    }
}

impl InfixBlock {
    /// Builds a block from every keyword belonging to one checkpoint.
    pub fn build<'a>(keywords: impl Iterator<Item = &'a [u8]> + Clone, fp_rate: f64) -> Self {
        let two_count: usize = keywords.clone().map(|k| ngrams(k, 2).count()).sum();
        let four_count: usize = keywords.clone().map(|k| ngrams(k, 4).count()).sum();

        let mut two_gram = NgramBloom::with_fp_rate(two_count, fp_rate);
        let mut four_gram = NgramBloom::with_fp_rate(four_count, fp_rate);

        for keyword in keywords {
            for g in ngrams(keyword, 2) {
                two_gram.insert(g);
            }
            for g in ngrams(keyword, 4) {
                four_gram.insert(g);
            }
        }

        Self { two_gram, four_gram }
    }

    /// Whether the given n-gram (length 2 or 4) may appear in this block's
    /// checkpoint range. Any other length is conservatively reported as
    /// "may contain" (no filter covers it, so it cannot be ruled out).
    #[must_use]
    pub fn may_contain(&self, ngram: &[u8]) -> bool {
        match ngram.len() {
            2 => self.two_gram.may_contain(ngram),
            4 => self.four_gram.may_contain(ngram),
            _ => true,
        }
    }

    /// Serializes this block.
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        self.two_gram.encode_into(writer)?;
        self.four_gram.encode_into(writer)
    }

    /// Deserializes a block.
    pub fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        Ok(Self {
            two_gram: NgramBloom::decode_from(reader)?,
            four_gram: NgramBloom::decode_from(reader)?,
        })
    }
}

/// Per-checkpoint infix bloom table, index-aligned with the segment's word
/// checkpoints vector.
#[derive(Clone, Debug, Default)]
pub struct InfixBloomTable {
    blocks: Vec<InfixBlock>,
}

impl InfixBloomTable {
    /// Builds the table, one block per `word_groups` entry (a checkpoint's
    /// worth of keywords at a time).
    pub fn build<'a>(word_groups: impl Iterator<Item = Vec<&'a [u8]>>, fp_rate: f64) -> Self {
        let blocks = word_groups
            .map(|group| InfixBlock::build(group.into_iter(), fp_rate))
            .collect();
        Self { blocks }
    }

    /// Returns whether `ngram` may appear in the checkpoint at `checkpoint_index`.
    #[must_use]
    pub fn may_contain(&self, checkpoint_index: usize, ngram: &[u8]) -> bool {
        self.blocks
            .get(checkpoint_index)
            .is_none_or(|block| block.may_contain(ngram))
    }

    /// Number of checkpoint blocks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns `true` if there are no blocks at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Serializes the table for `.ram` persistence (spec §4.9).
    pub fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        use byteorder::{BigEndian, WriteBytesExt};
        writer.write_u64::<BigEndian>(self.blocks.len() as u64)?;
        for block in &self.blocks {
            block.encode_into(writer)?;
        }
        Ok(())
    }

    /// Deserializes a table written by [`InfixBloomTable::encode_into`].
    pub fn decode_from<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        use byteorder::{BigEndian, ReadBytesExt};
        let count = reader.read_u64::<BigEndian>()? as usize;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(InfixBlock::decode_from(reader)?);
        }
        Ok(Self { blocks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn no_false_negatives_for_ngrams_of_inserted_keyword() {
        let keyword = b"searching";
        let block = InfixBlock::build(std::iter::once(keyword.as_slice()), 0.01);

        for g in ngrams(keyword, 2) {
            assert!(block.may_contain(g), "2-gram {:?} must be reported present", String::from_utf8_lossy(g));
        }
        for g in ngrams(keyword, 4) {
            assert!(block.may_contain(g), "4-gram {:?} must be reported present", String::from_utf8_lossy(g));
        }
    }

    #[test]
    fn table_default_checkpoint_is_conservatively_present() {
        let table = InfixBloomTable::default();
        // No blocks built yet: out-of-range lookups must not produce false
        // negatives, so they default to "may contain".
        assert!(table.may_contain(0, b"ab"));
    }
}
