//! Block decomposition of the global array across ranks.

/// The contiguous block of the global array owned by one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub rank: u32,
    pub offset: u64,
    pub count: u64,
}

impl Partition {
    /// One past the last global index owned by this rank.
    pub fn end(&self) -> u64 {
        self.offset + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Split `[0, global_len)` into `rank_count` contiguous blocks and return
/// the block owned by `rank`.
///
/// Every rank gets `global_len / rank_count` elements except the last one,
/// which also absorbs the remainder. When `global_len < rank_count` the
/// leading ranks get empty blocks.
pub fn partition(global_len: u64, rank_count: u32, rank: u32) -> Partition {
    assert!(rank_count >= 1, "rank_count must be at least 1");
    assert!(rank < rank_count, "rank {rank} out of range for {rank_count} ranks");

    let block = global_len / u64::from(rank_count);
    let offset = u64::from(rank) * block;
    let count = if rank == rank_count - 1 {
        global_len - block * u64::from(rank_count - 1)
    } else {
        block
    };

    Partition { rank, offset, count }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all(global_len: u64, ranks: u32) -> Vec<Partition> {
        (0..ranks).map(|r| partition(global_len, ranks, r)).collect()
    }

    #[test]
    fn even_split() {
        let parts = all(40, 4);
        let got: Vec<(u64, u64)> = parts.iter().map(|p| (p.offset, p.count)).collect();
        assert_eq!(got, vec![(0, 10), (10, 10), (20, 10), (30, 10)]);
    }

    #[test]
    fn last_rank_takes_remainder() {
        let parts = all(42, 4);
        assert_eq!(parts[0].count, 10);
        assert_eq!(parts[1].count, 10);
        assert_eq!(parts[2].count, 10);
        assert_eq!(parts[3].offset, 30);
        assert_eq!(parts[3].count, 12);
    }

    #[test]
    fn fewer_elements_than_ranks() {
        let parts = all(3, 5);
        assert!(parts[..4].iter().all(|p| p.is_empty()));
        assert_eq!(parts[4].offset, 0);
        assert_eq!(parts[4].count, 3);
    }

    #[test]
    fn coverage_has_no_gaps_or_overlaps() {
        for global_len in [0u64, 1, 7, 64, 1000, 1023] {
            for ranks in 1..=17u32 {
                let parts = all(global_len, ranks);
                let mut next = 0;
                for p in &parts {
                    if p.is_empty() {
                        continue;
                    }
                    assert_eq!(p.offset, next, "gap or overlap at len={global_len} ranks={ranks}");
                    next = p.end();
                }
                assert_eq!(next, global_len);
                let total: u64 = parts.iter().map(|p| p.count).sum();
                assert_eq!(total, global_len);
                for p in &parts[..parts.len() - 1] {
                    assert_eq!(p.count, global_len / u64::from(ranks));
                }
            }
        }
    }

    #[test]
    #[should_panic]
    fn rank_out_of_range_panics() {
        partition(10, 2, 2);
    }
}
