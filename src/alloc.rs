//! Space allocator: first-fit over existing chunk extents.

use crate::chunk::Chunk;
use crate::BLOCK_SIZE;

/// Find where a new chunk of `length` bytes should start, given the
/// currently-live chunks. Deliberately first-fit with a one-block gap
/// between chunks so a chunk's trailing header block stays discoverable
/// during recovery scans.
pub fn allocate_chunk(live_chunks: &[&Chunk], length: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    let required_blocks = length.div_ceil(block) + 1;

    let mut occupied: Vec<bool> = vec![true, true]; // blocks 0 and 1 are never allocated to chunks

    let highest_block = live_chunks
        .iter()
        .map(|c| (c.start + c.length) / block + 1)
        .max()
        .unwrap_or(2);
    if (occupied.len() as u64) < highest_block {
        occupied.resize(highest_block as usize, false);
    }

    for chunk in live_chunks {
        let start_block = (chunk.start / block) as usize;
        // Inclusive of one block past the chunk's own end, to preserve the gap.
        let end_block = ((chunk.start + chunk.length) / block + 1) as usize;
        for b in start_block..end_block.min(occupied.len()) {
            occupied[b] = true;
        }
    }

    let mut run_start = None;
    for (i, used) in occupied.iter().enumerate() {
        if *used {
            run_start = None;
            continue;
        }
        let start = *run_start.get_or_insert(i);
        if (i - start + 1) as u64 >= required_blocks {
            return start as u64 * block;
        }
    }

    occupied.len() as u64 * block
}

/// `true` if truncating to `used_len` would reclaim at least `min_percent`
/// of `file_len` and leaves at least one block of gap.
pub fn should_shrink(file_len: u64, used_len: u64, min_percent: u8) -> bool {
    if file_len <= used_len {
        return false;
    }
    let dead = file_len - used_len;
    if dead < BLOCK_SIZE as u64 {
        return false;
    }
    dead * 100 >= file_len * min_percent as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(start: u64, length: u64) -> Chunk {
        Chunk { id: 0, start, length, meta_root_pos: 0, version: 0, time: 0, page_count: 0, max_length: 0, max_length_live: 0 }
    }

    #[test]
    fn first_chunk_lands_after_header_blocks() {
        let block = BLOCK_SIZE as u64;
        let pos = allocate_chunk(&[], block);
        assert_eq!(pos, 2 * block);
    }

    #[test]
    fn fills_a_gap_between_chunks() {
        let block = BLOCK_SIZE as u64;
        let c1 = chunk(2 * block, block);
        // leave blocks [3] free (gap), c2 far out, so a 1-block hole exists at block 3 only if
        // it's big enough including the required trailing gap block.
        let c2 = chunk(10 * block, block);
        let chunks = [&c1, &c2];
        let pos = allocate_chunk(&chunks, block);
        assert!(pos < c2.start);
        assert!(pos >= c1.start + c1.length);
    }

    #[test]
    fn appends_when_no_gap_fits() {
        let block = BLOCK_SIZE as u64;
        let c1 = chunk(2 * block, block);
        let pos = allocate_chunk(&[&c1], 5 * block);
        assert_eq!(pos, allocate_chunk(&[&c1], 5 * block));
        assert!(pos >= c1.start + c1.length);
    }

    #[test]
    fn shrink_requires_minimum_percent_and_one_block_gap() {
        let block = BLOCK_SIZE as u64;
        assert!(!should_shrink(10 * block, 9 * block, 50));
        assert!(should_shrink(10 * block, 4 * block, 50));
        assert!(!should_shrink(10 * block, 10 * block, 10));
    }
}
