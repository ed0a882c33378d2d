use crate::cache::block::Block;
use crate::{address, config::Config};

/// Set-associative storage array: `num_rows` rows of `num_ways` blocks,
/// stored flat. Row and tag bits are carved out of the address, so both
/// dimensions must be powers of two.
#[derive(Debug)]
pub struct TagArray {
    blocks: Vec<Block>,
    num_ways: usize,
    num_rows: usize,
    row_shift: u32,
    row_mask: u64,
    tag_shift: u32,
    blocksize: usize,
}

impl TagArray {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let blocks = (0..config.num_rows * config.num_ways)
            .map(|_| Block::new(config.blocksize))
            .collect();
        let row_shift = config.blocksize.trailing_zeros();
        let tag_shift = row_shift + config.num_rows.trailing_zeros();
        Self {
            blocks,
            num_ways: config.num_ways,
            num_rows: config.num_rows,
            row_shift,
            row_mask: config.num_rows as u64 - 1,
            tag_shift,
            blocksize: config.blocksize,
        }
    }

    #[must_use]
    pub fn tag(&self, addr: address) -> address {
        addr >> self.tag_shift
    }

    #[must_use]
    pub fn block_addr(&self, addr: address) -> address {
        addr & !(self.blocksize as u64 - 1)
    }

    #[must_use]
    pub fn row_index(&self, addr: address) -> usize {
        ((addr >> self.row_shift) & self.row_mask) as usize
    }

    #[must_use]
    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> &Block {
        &self.blocks[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Block {
        &mut self.blocks[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Look up a valid block holding `addr`. With `empty_ok`, fall back to
    /// any invalid block in the row.
    #[must_use]
    pub fn find_block(&self, addr: address, empty_ok: bool) -> Option<usize> {
        let row = self.row_index(addr);
        let tag = self.tag(addr);
        let base = row * self.num_ways;
        for way in 0..self.num_ways {
            let block = &self.blocks[base + way];
            if block.is_valid() && block.tag == tag {
                return Some(base + way);
            }
        }
        if empty_ok {
            for way in 0..self.num_ways {
                if self.blocks[base + way].is_invalid() {
                    return Some(base + way);
                }
            }
        }
        None
    }

    /// Pick the eviction victim in `addr`'s row: the first invalid block, or
    /// the least-recently-touched one. Blocks that are assigned to an
    /// in-flight fill or locked by an in-flight operation are not candidates.
    ///
    /// Panics when every way is assigned or locked. The model does not stall
    /// on eviction; upstream traffic is expected to be paced so this cannot
    /// happen in steady state.
    #[must_use]
    pub fn lru_victim(&self, addr: address) -> usize {
        let row = self.row_index(addr);
        let base = row * self.num_ways;
        let mut lru: Option<usize> = None;
        let mut oldest = u64::MAX;
        for way in 0..self.num_ways {
            let block = &self.blocks[base + way];
            if block.is_assigned() || block.lock_count > 0 {
                continue;
            }
            if block.is_invalid() {
                return base + way;
            }
            if block.last_touched <= oldest {
                oldest = block.last_touched;
                lru = Some(base + way);
            }
        }
        match lru {
            Some(idx) => idx,
            None => panic!("row {row}: no evictable block (all ways assigned or locked)"),
        }
    }

    /// Render the array the way the shutdown report does: one line per row,
    /// `status base tag` per way.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for row in 0..self.num_rows {
            out.push_str("| ");
            for way in 0..self.num_ways {
                let block = &self.blocks[row * self.num_ways + way];
                let _ = write!(
                    out,
                    "{} 0x{:04x} {:x} | ",
                    block.status.short(),
                    block.base_addr,
                    block.tag
                );
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::TagArray;
    use crate::cache::block::Status;
    use crate::config::Config;

    fn array(ways: usize, rows: usize, blocksize: usize) -> TagArray {
        TagArray::new(&Config {
            num_ways: ways,
            num_rows: rows,
            blocksize,
            num_upstream: 0,
            next_level_name: crate::config::NO_NEXT_LEVEL.to_string(),
            access_time: "1 ns".to_string(),
            prefetch_peer_misses: true,
        })
    }

    #[test]
    fn address_geometry() {
        let tags = array(2, 4, 16);
        assert_eq!(tags.block_addr(0x7b), 0x70);
        assert_eq!(tags.row_index(0x7b), 3);
        assert_eq!(tags.tag(0x7b), 0x1);
        // same row, different tag
        assert_eq!(tags.row_index(0xfb), 3);
        assert_eq!(tags.tag(0xfb), 0x3);
    }

    #[test]
    fn find_block_matches_valid_tags_only() {
        let mut tags = array(2, 4, 16);
        let idx = tags.find_block(0x70, true).expect("empty way");
        let tag = tags.tag(0x70);
        tags.get_mut(idx).activate(tag, 0x70);
        // assigned blocks are not yet findable
        assert_eq!(tags.find_block(0x70, false), None);
        tags.get_mut(idx).status = Status::SHARED;
        assert_eq!(tags.find_block(0x70, false), Some(idx));
        assert_eq!(tags.find_block(0x74, false), Some(idx));
        assert_eq!(tags.find_block(0xf0, false), None);
    }

    #[test]
    fn lru_prefers_invalid_then_oldest() {
        let mut tags = array(2, 1, 16);
        let victim = tags.lru_victim(0x00);
        tags.get_mut(victim).activate(0, 0x00);
        tags.get_mut(victim).status = Status::SHARED;
        tags.get_mut(victim).last_touched = 100;
        // remaining invalid way wins over the valid one
        let second = tags.lru_victim(0x10);
        assert_ne!(second, victim);
        tags.get_mut(second).activate(1, 0x10);
        tags.get_mut(second).status = Status::SHARED;
        tags.get_mut(second).last_touched = 50;
        // both valid now: least recently touched wins
        assert_eq!(tags.lru_victim(0x20), second);
    }

    #[test]
    fn lru_skips_assigned_and_locked() {
        let mut tags = array(2, 1, 16);
        let a = tags.lru_victim(0x00);
        tags.get_mut(a).activate(0, 0x00);
        let b = tags.lru_victim(0x10);
        assert_ne!(a, b);
        tags.get_mut(b).activate(1, 0x10);
        tags.get_mut(b).status = Status::SHARED;
        tags.get_mut(b).lock_count = 1;
        let result = std::panic::catch_unwind(|| tags.lru_victim(0x20));
        assert!(result.is_err(), "no evictable block should panic");
    }
}
