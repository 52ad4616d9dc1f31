//! First-fit allocator for a segment's value region.
//!
//! The region is tiled by blocks, each an 8-byte header (`u32` payload
//! capacity, `u32` tag) followed by its payload. Free blocks thread an
//! address-ordered singly linked list through the first 8 bytes of their
//! payload; the list head lives in the segment table. Offsets handed out are
//! payload offsets relative to the start of the region.

use crate::meta::read_u64;

/// End-of-list marker.
pub(crate) const NIL: u64 = u64::MAX;

const HEADER: usize = 8;
const MIN_PAYLOAD: usize = 8;
const TAG_FREE: u32 = u32::from_le_bytes(*b"FREE");
const TAG_USED: u32 = u32::from_le_bytes(*b"USED");

pub(crate) fn round_up(len: usize) -> usize {
    len.max(MIN_PAYLOAD).div_ceil(8) * 8
}

/// Capacity of the used block at `offset`, if it exists and can hold `needed`
/// bytes without leaving the region.
pub(crate) fn used_capacity(region: &[u8], offset: u64, needed: usize) -> Option<usize> {
    let offset = usize::try_from(offset).ok()?;
    if offset % 8 != 0 || offset < HEADER || offset > region.len() {
        return None;
    }
    let (cap, tag) = block_header(region, offset);
    if tag != TAG_USED || cap % 8 != 0 || cap < needed || offset + cap > region.len() {
        return None;
    }
    Some(cap)
}

fn block_header(region: &[u8], offset: usize) -> (usize, u32) {
    let word = read_u64(region, offset - HEADER);
    ((word & 0xffff_ffff) as usize, (word >> 32) as u32)
}

pub(crate) struct Arena<'a> {
    region: &'a mut [u8],
    head: &'a mut u64,
}

impl<'a> Arena<'a> {
    pub fn new(region: &'a mut [u8], head: &'a mut u64) -> Self {
        Arena { region, head }
    }

    /// Turns the whole region into a single free block.
    pub fn format(&mut self) {
        let len = self.region.len() - self.region.len() % 8;
        if len < HEADER + MIN_PAYLOAD {
            *self.head = NIL;
            return;
        }
        self.set_header(HEADER as u64, len - HEADER, TAG_FREE);
        self.set_next(HEADER as u64, NIL);
        *self.head = HEADER as u64;
    }

    /// Reserves a block able to hold `len` bytes and returns its offset.
    pub fn allocate(&mut self, len: usize) -> Option<u64> {
        let need = round_up(len);
        let mut prev = NIL;
        let mut cur = *self.head;
        let mut budget = max_blocks(self.region);
        while budget > 0 && self.is_free_block(cur) {
            budget -= 1;
            let cap = self.capacity(cur);
            let next = self.next(cur);
            if cap >= need {
                if cap - need >= HEADER + MIN_PAYLOAD {
                    let split = cur + (need + HEADER) as u64;
                    self.set_header(split, cap - need - HEADER, TAG_FREE);
                    self.set_next(split, next);
                    self.link(prev, split);
                    self.set_header(cur, need, TAG_USED);
                } else {
                    self.link(prev, next);
                    self.set_header(cur, cap, TAG_USED);
                }
                return Some(cur);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Returns the block at `offset` to the free list, merging it with free
    /// neighbours. Offsets that do not name a used block are ignored.
    pub fn release(&mut self, offset: u64) {
        let Some(mut cap) = used_capacity(self.region, offset, 1) else {
            return;
        };

        let mut prev = NIL;
        let mut next = *self.head;
        let mut budget = max_blocks(self.region);
        while budget > 0 && self.is_free_block(next) && next < offset {
            budget -= 1;
            prev = next;
            next = self.next(next);
        }
        if !self.is_free_block(next) {
            next = NIL;
        }

        self.set_header(offset, cap, TAG_FREE);
        self.set_next(offset, next);
        self.link(prev, offset);

        if next != NIL && offset + (cap + HEADER) as u64 == next {
            cap += HEADER + self.capacity(next);
            let after = self.next(next);
            self.set_header(offset, cap, TAG_FREE);
            self.set_next(offset, after);
        }
        if prev != NIL && prev + (self.capacity(prev) + HEADER) as u64 == offset {
            let merged = self.capacity(prev) + HEADER + cap;
            let after = self.next(offset);
            self.set_header(prev, merged, TAG_FREE);
            self.set_next(prev, after);
        }
    }

    /// Rewrites the headers of `used` blocks and rebuilds the free list from
    /// the gaps between them.
    ///
    /// `used` must be sorted by offset and non-overlapping. Gaps too small to
    /// hold a free block are absorbed by the preceding used block. Blocks
    /// handed out by [`allocate`](Self::allocate) tile the region from offset
    /// zero and each spans at least 16 bytes, so the gap before the first
    /// used block is either empty or large enough to become a free block.
    pub fn rebuild(&mut self, used: &[(u64, usize)]) {
        let len = self.region.len() - self.region.len() % 8;
        let mut cursor = 0usize;
        let mut last_used: Option<u64> = None;
        let mut tail = NIL;
        *self.head = NIL;

        let bounds = used
            .iter()
            .map(|&(offset, cap)| (offset as usize - HEADER, Some((offset, cap))))
            .chain(std::iter::once((len, None)));
        for (start, block) in bounds {
            let gap = start - cursor;
            if gap >= HEADER + MIN_PAYLOAD {
                let free = (cursor + HEADER) as u64;
                self.set_header(free, gap - HEADER, TAG_FREE);
                self.set_next(free, NIL);
                self.link(tail, free);
                tail = free;
            } else if gap > 0 {
                if let Some(prev) = last_used {
                    let cap = self.capacity(prev);
                    self.set_header(prev, cap + gap, TAG_USED);
                }
            }
            if let Some((offset, cap)) = block {
                self.set_header(offset, cap, TAG_USED);
                cursor = offset as usize + cap;
                last_used = Some(offset);
            }
        }
    }

    /// Total payload bytes on the free list.
    pub fn free_bytes(&self) -> u64 {
        free_bytes(self.region, *self.head)
    }

    fn is_free_block(&self, offset: u64) -> bool {
        is_free_block(self.region, offset)
    }

    fn capacity(&self, offset: u64) -> usize {
        block_header(self.region, offset as usize).0
    }

    fn next(&self, offset: u64) -> u64 {
        read_u64(self.region, offset as usize)
    }

    fn link(&mut self, prev: u64, to: u64) {
        if prev == NIL {
            *self.head = to;
        } else {
            self.set_next(prev, to);
        }
    }

    fn set_header(&mut self, offset: u64, cap: usize, tag: u32) {
        let word = ((tag as u64) << 32) | cap as u64;
        let at = offset as usize - HEADER;
        self.region[at..at + HEADER].copy_from_slice(&word.to_le_bytes());
    }

    fn set_next(&mut self, offset: u64, next: u64) {
        let at = offset as usize;
        self.region[at..at + 8].copy_from_slice(&next.to_le_bytes());
    }
}

fn is_free_block(region: &[u8], offset: u64) -> bool {
    let Ok(offset) = usize::try_from(offset) else {
        return false;
    };
    if offset % 8 != 0 || offset < HEADER || offset + MIN_PAYLOAD > region.len() {
        return false;
    }
    let (cap, tag) = block_header(region, offset);
    tag == TAG_FREE && offset + cap <= region.len()
}

/// Upper bound on the blocks a well-formed region can hold, used to stop
/// walks over a cyclic free list.
fn max_blocks(region: &[u8]) -> usize {
    region.len() / (HEADER + MIN_PAYLOAD) + 1
}

/// Walks the free list starting at `head` without mutating it.
pub(crate) fn free_bytes(region: &[u8], head: u64) -> u64 {
    let mut total = 0u64;
    let mut cur = head;
    let mut budget = max_blocks(region);
    while budget > 0 && is_free_block(region, cur) {
        let (cap, _) = block_header(region, cur as usize);
        total += cap as u64;
        cur = read_u64(region, cur as usize);
        budget -= 1;
    }
    total
}
