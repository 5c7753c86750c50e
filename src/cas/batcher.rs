//! Knapsack-style batching: pack missing digests into batches bounded by
//! total byte-size and element count, deterministically and in O(n log n).

use crate::merkle::Digest;

/// A non-empty ordered group of digests destined for one `BatchUpdateBlobs`
/// RPC — or, if it's a singleton whose size exceeds `max_batch_bytes`, for
/// the stream uploader instead.
pub type Batch = Vec<Digest>;

/// Pack `digests` into batches honoring `max_batch_bytes`/`max_batch_count`.
///
/// Sorts ascending by size, then repeatedly seeds a batch from the largest
/// remaining digest and fills it from the small end while capacity allows.
/// This avoids the pathological behavior of a pure small-to-large sweep
/// (many small blobs packed first, leaving big blobs stranded as
/// singletons) while remaining fully deterministic. A digest individually
/// larger than `max_batch_bytes` becomes an oversize singleton batch; the
/// caller is responsible for routing those to the stream uploader instead
/// of `BatchUpdateBlobs`.
pub fn make_batches(mut digests: Vec<Digest>, max_batch_bytes: u64, max_batch_count: usize) -> Vec<Batch> {
    // Break size ties on `hash` so the sort is a total order: two equal-size
    // digests must land in the same relative position no matter what order
    // they arrived in, or determinism (§8 property 2) only holds by luck.
    digests.sort_by(|a, b| a.size_bytes.cmp(&b.size_bytes).then_with(|| a.hash.cmp(&b.hash)));

    let mut batches = Vec::new();
    let mut low = 0usize;
    let mut high = digests.len();

    while low < high {
        high -= 1;
        let mut size = digests[high].size_bytes as u64;
        let mut batch = vec![digests[high].clone()];

        while low < high {
            let candidate_size = digests[low].size_bytes as u64;
            let fits = candidate_size <= max_batch_bytes.saturating_sub(size);
            if fits && batch.len() < max_batch_count {
                size += candidate_size;
                batch.push(digests[low].clone());
                low += 1;
            } else {
                break;
            }
        }

        batches.push(batch);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const MAX_BYTES: u64 = 4 * 1024 * 1024 - 1024;
    const MAX_COUNT: usize = 4000;

    fn digest_of_size(tag: u8, size: i64) -> Digest {
        let hash = format!("{:02x}", tag).repeat(32);
        Digest::new(hash, size).unwrap()
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(make_batches(vec![], MAX_BYTES, MAX_COUNT).is_empty());
    }

    #[test]
    fn single_small_digest_is_one_batch() {
        let d = digest_of_size(1, 100);
        let batches = make_batches(vec![d.clone()], MAX_BYTES, MAX_COUNT);
        assert_eq!(batches, vec![vec![d]]);
    }

    #[test]
    fn oversize_digest_becomes_singleton_exceeding_max_bytes() {
        let d = digest_of_size(1, MAX_BYTES as i64 + 1);
        let batches = make_batches(vec![d.clone()], MAX_BYTES, MAX_COUNT);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn nine_small_plus_one_near_max_only_admits_what_fits_the_seed_slack() {
        // The seed (MAX_BYTES - 200) leaves only 200 bytes of slack, which
        // admits exactly two of the nine 100-byte blobs before the third
        // no longer fits. The remaining seven pack into a second batch.
        let mut digests: Vec<Digest> = (0..9).map(|i| digest_of_size(i, 100)).collect();
        digests.push(digest_of_size(9, MAX_BYTES as i64 - 200));

        let batches = make_batches(digests, MAX_BYTES, MAX_COUNT);
        assert_eq!(batches.len(), 2);

        let total_elements: usize = batches.iter().map(Vec::len).sum();
        assert_eq!(total_elements, 10);

        for batch in &batches {
            let total: i64 = batch.iter().map(|d| d.size_bytes).sum();
            assert!((total as u64) <= MAX_BYTES);
        }

        let seeded_batch = batches
            .iter()
            .find(|b| b.len() == 3)
            .expect("the seed batch should admit exactly 2 of the small blobs");
        let seeded_total: i64 = seeded_batch.iter().map(|d| d.size_bytes).sum();
        assert_eq!(seeded_total as u64, MAX_BYTES);

        let overflow_batch = batches
            .iter()
            .find(|b| b.len() == 7)
            .expect("the remaining 7 small blobs should land in their own batch");
        let overflow_total: i64 = overflow_batch.iter().map(|d| d.size_bytes).sum();
        assert_eq!(overflow_total, 700);
    }

    #[test]
    fn count_ceiling_splits_batches() {
        let digests: Vec<Digest> = (0..10u8).map(|i| digest_of_size(i, 10)).collect();
        let batches = make_batches(digests, MAX_BYTES, 4);
        for batch in &batches {
            assert!(batch.len() <= 4);
        }
    }

    #[test]
    fn same_size_digests_break_ties_by_hash_regardless_of_input_order() {
        let a = digest_of_size(1, 100);
        let b = digest_of_size(2, 100);

        let forward = make_batches(vec![a.clone(), b.clone()], MAX_BYTES, MAX_COUNT);
        let reversed = make_batches(vec![b, a], MAX_BYTES, MAX_COUNT);

        assert_eq!(forward, reversed);
    }

    fn arb_digest() -> impl Strategy<Value = Digest> {
        (any::<[u8; 32]>(), 0i64..10_000_000).prop_map(|(bytes, size)| {
            let hash: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            Digest::new(hash, size).unwrap()
        })
    }

    proptest! {
        #[test]
        fn partition_preserves_multiset(digests in proptest::collection::vec(arb_digest(), 0..50)) {
            let batches = make_batches(digests.clone(), MAX_BYTES, MAX_COUNT);

            let mut expected: HashMap<Digest, usize> = HashMap::new();
            for d in &digests {
                *expected.entry(d.clone()).or_insert(0) += 1;
            }

            let mut actual: HashMap<Digest, usize> = HashMap::new();
            for batch in &batches {
                for d in batch {
                    *actual.entry(d.clone()).or_insert(0) += 1;
                }
            }

            prop_assert_eq!(expected, actual);
        }

        #[test]
        fn determinism_regardless_of_input_order(digests in proptest::collection::vec(arb_digest(), 0..50)) {
            let mut shuffled = digests.clone();
            shuffled.reverse();

            let a = make_batches(digests, MAX_BYTES, MAX_COUNT);
            let b = make_batches(shuffled, MAX_BYTES, MAX_COUNT);

            prop_assert_eq!(a, b);
        }

        #[test]
        fn multi_entry_batches_respect_capacity(digests in proptest::collection::vec(arb_digest(), 0..50)) {
            let batches = make_batches(digests, MAX_BYTES, MAX_COUNT);

            for batch in &batches {
                if batch.len() > 1 {
                    let total: i64 = batch.iter().map(|d| d.size_bytes).sum();
                    prop_assert!((total as u64) <= MAX_BYTES);
                    prop_assert!(batch.len() <= MAX_COUNT);
                }
            }
        }
    }
}
