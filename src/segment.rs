//! Open-addressed slot table of a single segment.
//!
//! Slot layout (little-endian, `slot_size` bytes):
//!
//! ```text
//! [0..8)    header word: state in the top 2 bits, stored hash in the low 62
//! [8..12)   CRC32 of key || value
//! [12..14)  key length
//! [14..16)  placement flags
//! [16..20)  value length
//! [20..24)  reserved
//! [24..32)  value-region block offset, NIL when nothing is out of line
//! [32..)    inline key area, then inline value area
//! ```
//!
//! A key longer than the inline key area moves to the value region together
//! with its value, so an entry owns at most one block.

use tracing::warn;

use crate::arena::{self, Arena, NIL};
use crate::meta::{SegmentEntry, SlotLayout, read_u64};
use crate::{Error, KeyHasher, Result};

const STATE_SHIFT: u32 = 62;
const HASH_MASK: u64 = (1 << STATE_SHIFT) - 1;
const EMPTY: u64 = 0;
const OCCUPIED: u64 = 1;
const TOMBSTONE: u64 = 2;

const FLAG_KEY_INLINE: u16 = 1;
const FLAG_VALUE_INLINE: u16 = 2;

const CRC: usize = 8;
const KEY_LEN: usize = 12;
const FLAGS: usize = 14;
const VALUE_LEN: usize = 16;
const BLOCK: usize = 24;

/// Portion of a 64-bit hash kept in the slot header word.
pub(crate) fn stored_hash(hash: u64) -> u64 {
    hash & HASH_MASK
}

/// Where the key and value of an entry live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    key_inline: bool,
    value_inline: bool,
    /// Bytes needed in the value region.
    block_len: usize,
}

impl Placement {
    fn new(layout: &SlotLayout, key_len: usize, value_len: usize) -> Self {
        let key_inline = key_len <= layout.key_inline;
        let value_inline = key_inline && value_len <= layout.value_inline;
        let block_len =
            (if key_inline { 0 } else { key_len }) + (if value_inline { 0 } else { value_len });
        Placement {
            key_inline,
            value_inline,
            block_len,
        }
    }

    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.key_inline {
            flags |= FLAG_KEY_INLINE;
        }
        if self.value_inline {
            flags |= FLAG_VALUE_INLINE;
        }
        flags
    }
}

fn checksum(key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

/// Decoded view of one slot.
#[derive(Clone, Copy)]
struct Slot<'a> {
    bytes: &'a [u8],
}

impl<'a> Slot<'a> {
    fn word(&self) -> u64 {
        read_u64(self.bytes, 0)
    }

    fn state(&self) -> u64 {
        self.word() >> STATE_SHIFT
    }

    fn hash(&self) -> u64 {
        self.word() & HASH_MASK
    }

    fn crc(&self) -> u32 {
        u32::from_le_bytes([
            self.bytes[CRC],
            self.bytes[CRC + 1],
            self.bytes[CRC + 2],
            self.bytes[CRC + 3],
        ])
    }

    fn key_len(&self) -> usize {
        u16::from_le_bytes([self.bytes[KEY_LEN], self.bytes[KEY_LEN + 1]]) as usize
    }

    fn flags(&self) -> u16 {
        u16::from_le_bytes([self.bytes[FLAGS], self.bytes[FLAGS + 1]])
    }

    fn value_len(&self) -> usize {
        u32::from_le_bytes([
            self.bytes[VALUE_LEN],
            self.bytes[VALUE_LEN + 1],
            self.bytes[VALUE_LEN + 2],
            self.bytes[VALUE_LEN + 3],
        ]) as usize
    }

    fn block(&self) -> u64 {
        read_u64(self.bytes, BLOCK)
    }

    /// Bytes the flags say this slot keeps in the value region.
    fn extent(&self) -> usize {
        let flags = self.flags();
        let key = if flags & FLAG_KEY_INLINE == 0 { self.key_len() } else { 0 };
        let value = if flags & FLAG_VALUE_INLINE == 0 { self.value_len() } else { 0 };
        key + value
    }

    /// The value-region block this slot owns, if it points at a used block
    /// large enough for its out-of-line bytes.
    fn owned_block(&self, region: &[u8]) -> Option<u64> {
        let extent = self.extent();
        if extent == 0 {
            return None;
        }
        arena::used_capacity(region, self.block(), extent).map(|_| self.block())
    }

    fn key(&self, layout: &SlotLayout, region: &'a [u8]) -> Option<&'a [u8]> {
        let len = self.key_len();
        if self.flags() & FLAG_KEY_INLINE != 0 {
            if len > layout.key_inline {
                return None;
            }
            let start = SlotLayout::FIXED_BYTES;
            self.bytes.get(start..start + len)
        } else {
            let start = self.owned_block(region)? as usize;
            region.get(start..start + len)
        }
    }

    fn value(&self, layout: &SlotLayout, region: &'a [u8]) -> Option<&'a [u8]> {
        let len = self.value_len();
        if self.flags() & FLAG_VALUE_INLINE != 0 {
            if len > layout.value_inline {
                return None;
            }
            let start = SlotLayout::FIXED_BYTES + layout.key_inline;
            self.bytes.get(start..start + len)
        } else {
            let key_skip = if self.flags() & FLAG_KEY_INLINE != 0 {
                0
            } else {
                self.key_len()
            };
            let start = self.owned_block(region)? as usize + key_skip;
            region.get(start..start + len)
        }
    }
}

/// Read-only view of a segment, valid while its lock is held.
pub(crate) struct Segment<'a> {
    layout: &'a SlotLayout,
    slots: &'a [u8],
    region: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn new(layout: &'a SlotLayout, slots: &'a [u8], region: &'a [u8]) -> Self {
        Segment {
            layout,
            slots,
            region,
        }
    }

    fn slot(&self, index: usize) -> Slot<'a> {
        let start = index * self.layout.slot_size;
        Slot {
            bytes: &self.slots[start..start + self.layout.slot_size],
        }
    }

    fn home(&self, hash: u64) -> usize {
        (stored_hash(hash) as usize) & (self.layout.capacity - 1)
    }

    /// Index of the OCCUPIED slot holding `key`.
    ///
    /// Probing stops at the first EMPTY slot; tombstones are skipped.
    pub fn find(&self, key: &[u8], hash: u64) -> Option<usize> {
        let mask = self.layout.capacity - 1;
        let wanted = stored_hash(hash);
        let mut index = self.home(hash);
        for _ in 0..self.layout.capacity {
            let slot = self.slot(index);
            match slot.state() {
                EMPTY => return None,
                OCCUPIED if slot.hash() == wanted => {
                    if slot.key(self.layout, self.region) == Some(key) {
                        return Some(index);
                    }
                }
                _ => {}
            }
            index = (index + 1) & mask;
        }
        None
    }

    /// Borrowed value bytes for `key`.
    pub fn get(&self, key: &[u8], hash: u64) -> Option<&'a [u8]> {
        let index = self.find(key, hash)?;
        self.slot(index).value(self.layout, self.region)
    }

    /// Visits every OCCUPIED slot in physical order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&'a [u8], &'a [u8]),
    {
        for index in 0..self.layout.capacity {
            let slot = self.slot(index);
            if slot.state() != OCCUPIED {
                continue;
            }
            if let (Some(key), Some(value)) = (
                slot.key(self.layout, self.region),
                slot.value(self.layout, self.region),
            ) {
                f(key, value);
            }
        }
    }

    pub fn free_bytes(&self, head: u64) -> u64 {
        arena::free_bytes(self.region, head)
    }
}

/// Counters produced by [`SegmentMut::recover`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Recovery {
    pub count: u64,
    pub tombstones: u64,
    pub demoted: u64,
}

/// Mutable view of a segment, valid while its write lock is held.
pub(crate) struct SegmentMut<'a> {
    index: usize,
    layout: &'a SlotLayout,
    slots: &'a mut [u8],
    region: &'a mut [u8],
    entry: &'a mut SegmentEntry,
}

impl<'a> SegmentMut<'a> {
    pub fn new(
        index: usize,
        layout: &'a SlotLayout,
        slots: &'a mut [u8],
        region: &'a mut [u8],
        entry: &'a mut SegmentEntry,
    ) -> Self {
        SegmentMut {
            index,
            layout,
            slots,
            region,
            entry,
        }
    }

    pub fn as_ref(&self) -> Segment<'_> {
        Segment::new(self.layout, &*self.slots, &*self.region)
    }

    /// Resets counters and turns the value region into a single free block.
    ///
    /// The slot array must already be zeroed, as it is in a freshly sized file.
    pub fn format(&mut self) {
        Arena::new(&mut *self.region, &mut self.entry.free_list_head).format();
        self.entry.count = 0;
        self.entry.tombstones = 0;
    }

    /// Inserts `key` or overwrites its value.
    ///
    /// Returns the previous value when the key existed and `want_previous` is
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] when a new key would push the
    /// segment past its load limit or the value region has no block large
    /// enough.
    pub fn insert_or_update(
        &mut self,
        key: &[u8],
        hash: u64,
        value: &[u8],
        want_previous: bool,
    ) -> Result<Option<Vec<u8>>> {
        let mask = self.layout.capacity - 1;
        let wanted = stored_hash(hash);
        let mut index = self.as_ref().home(hash);
        let mut reusable = None;
        let mut empty = None;
        for _ in 0..self.layout.capacity {
            let segment = self.as_ref();
            let slot = segment.slot(index);
            match slot.state() {
                EMPTY => {
                    empty = Some(index);
                    break;
                }
                OCCUPIED if slot.hash() == wanted => {
                    if slot.key(self.layout, self.region) == Some(key) {
                        let previous = if want_previous {
                            slot.value(self.layout, self.region).map(<[u8]>::to_vec)
                        } else {
                            None
                        };
                        self.update(index, value)?;
                        return Ok(previous);
                    }
                }
                TOMBSTONE => {
                    reusable.get_or_insert(index);
                }
                // Occupied by another key, or a state this version never
                // writes.
                _ => {}
            }
            index = (index + 1) & mask;
        }

        let target = match (reusable, empty) {
            (Some(index), _) => index,
            (None, Some(index))
                if self.entry.count.saturating_add(self.entry.tombstones)
                    < self.layout.limit as u64 =>
            {
                index
            }
            _ => return Err(Error::CapacityExceeded { segment: self.index }),
        };
        self.write_new(target, key, wanted, value)?;
        if reusable.is_some() {
            self.entry.tombstones = self.entry.tombstones.saturating_sub(1);
        }
        self.entry.count += 1;
        Ok(None)
    }

    /// Marks the slot holding `key` as a tombstone and returns its value.
    pub fn remove(&mut self, key: &[u8], hash: u64) -> Option<Vec<u8>> {
        let index = self.as_ref().find(key, hash)?;
        let slot = self.as_ref().slot(index);
        let previous = slot.value(self.layout, self.region).map(<[u8]>::to_vec);
        let block = slot.owned_block(self.region);
        if block.is_none() && slot.extent() > 0 {
            warn!(segment = self.index, slot = index, "removing entry with a bad block pointer");
        }

        if let Some(block) = block {
            self.release(block);
        }
        self.set_word(index, TOMBSTONE << STATE_SHIFT);
        self.entry.count = self.entry.count.saturating_sub(1);
        self.entry.tombstones += 1;

        // A tombstone followed by EMPTY ends every probe chain through it.
        let mask = self.layout.capacity - 1;
        if self.as_ref().slot((index + 1) & mask).state() == EMPTY {
            let mut cursor = index;
            for _ in 0..self.layout.capacity {
                if self.as_ref().slot(cursor).state() != TOMBSTONE {
                    break;
                }
                self.set_word(cursor, EMPTY);
                self.entry.tombstones = self.entry.tombstones.saturating_sub(1);
                cursor = (cursor + mask) & mask;
            }
        }
        previous
    }

    /// Validates every OCCUPIED slot after an unclean shutdown.
    ///
    /// Slots with bad lengths, placements, block pointers, checksums, hashes,
    /// or overlapping blocks become tombstones. Counters and the free list
    /// are rebuilt from what survives.
    pub fn recover(&mut self, hasher: &KeyHasher) -> Recovery {
        let mut stats = Recovery::default();
        let mut blocks: Vec<(u64, usize, usize)> = Vec::new();
        for index in 0..self.layout.capacity {
            let slot = self.as_ref().slot(index);
            match slot.state() {
                EMPTY => continue,
                TOMBSTONE => stats.tombstones += 1,
                OCCUPIED => match self.validate(index, hasher) {
                    Ok(block) => {
                        stats.count += 1;
                        if let Some((offset, cap)) = block {
                            blocks.push((offset, cap, index));
                        }
                    }
                    Err(reason) => {
                        warn!(segment = self.index, slot = index, reason, "demoting slot");
                        self.demote(index, &mut stats);
                    }
                },
                _ => {
                    warn!(segment = self.index, slot = index, "unknown slot state");
                    self.demote(index, &mut stats);
                }
            }
        }

        blocks.sort_unstable();
        let mut used = Vec::with_capacity(blocks.len());
        let mut end = 0u64;
        for (offset, cap, index) in blocks {
            if offset - 8 < end {
                warn!(segment = self.index, slot = index, "value block overlaps");
                self.demote(index, &mut stats);
                stats.count -= 1;
                continue;
            }
            end = offset + cap as u64;
            used.push((offset, cap));
        }
        Arena::new(&mut *self.region, &mut self.entry.free_list_head).rebuild(&used);

        self.entry.count = stats.count;
        self.entry.tombstones = stats.tombstones;
        stats
    }

    fn demote(&mut self, index: usize, stats: &mut Recovery) {
        self.set_word(index, TOMBSTONE << STATE_SHIFT);
        stats.tombstones += 1;
        stats.demoted += 1;
    }

    /// Returns the block owned by a valid slot, or why the slot is invalid.
    fn validate(
        &self,
        index: usize,
        hasher: &KeyHasher,
    ) -> std::result::Result<Option<(u64, usize)>, &'static str> {
        let layout = self.layout;
        let segment = self.as_ref();
        let slot = segment.slot(index);
        let (key_len, value_len) = (slot.key_len(), slot.value_len());
        if key_len > layout.max_key_bytes || value_len > layout.max_value_bytes {
            return Err("length exceeds configured maximum");
        }
        let placement = Placement::new(layout, key_len, value_len);
        if slot.flags() != placement.flags() {
            return Err("placement flags disagree with lengths");
        }
        // Capacities are trimmed to what the entry needs, so a damaged block
        // header cannot claim its neighbours.
        let block = if placement.block_len > 0 {
            arena::used_capacity(segment.region, slot.block(), placement.block_len)
                .ok_or("block pointer outside the value region")?;
            Some((slot.block(), arena::round_up(placement.block_len)))
        } else {
            None
        };
        let key = slot.key(layout, segment.region).ok_or("key out of bounds")?;
        let value = slot.value(layout, segment.region).ok_or("value out of bounds")?;
        if checksum(key, value) != slot.crc() {
            return Err("checksum mismatch");
        }
        let hash = hasher.hash(key);
        if stored_hash(hash) != slot.hash() {
            return Err("stored hash mismatch");
        }
        // The slot must be reachable from its home position.
        let mask = layout.capacity - 1;
        let mut cursor = segment.home(hash);
        while cursor != index {
            if segment.slot(cursor).state() == EMPTY {
                return Err("unreachable from home slot");
            }
            cursor = (cursor + 1) & mask;
        }
        Ok(block)
    }

    fn write_new(&mut self, index: usize, key: &[u8], hash: u64, value: &[u8]) -> Result<()> {
        let placement = Placement::new(self.layout, key.len(), value.len());
        let block = self.place_block(&placement, None)?;
        self.write_payload(index, &placement, block, key, value);
        self.set_word(index, (OCCUPIED << STATE_SHIFT) | hash);
        Ok(())
    }

    fn update(&mut self, index: usize, value: &[u8]) -> Result<()> {
        let slot = self.as_ref().slot(index);
        let key = slot
            .key(self.layout, self.region)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let old_block = slot.owned_block(self.region);

        let placement = Placement::new(self.layout, key.len(), value.len());
        let block = match self.place_block(&placement, old_block) {
            Ok(block) => block,
            Err(err) => {
                let Some(old) = old_block else {
                    return Err(err);
                };
                return self.relocate(index, old, &key, &placement, value, err);
            }
        };
        self.write_payload(index, &placement, block, &key, value);
        if let Some(old) = old_block {
            if old != block {
                self.release(old);
            }
        }
        Ok(())
    }

    /// Frees `old` before allocating the grown block, for regions that only
    /// fit the new value once the old one is gone.
    ///
    /// On failure the previous value is written back. The slot keeps its old
    /// checksum until the payload is rewritten, so a crash in between is
    /// caught by recovery.
    fn relocate(
        &mut self,
        index: usize,
        old: u64,
        key: &[u8],
        placement: &Placement,
        value: &[u8],
        err: Error,
    ) -> Result<()> {
        let previous = self
            .as_ref()
            .slot(index)
            .value(self.layout, self.region)
            .map(<[u8]>::to_vec);
        self.release(old);
        if let Some(block) = self.allocate(placement.block_len) {
            self.write_payload(index, placement, block, key, value);
            return Ok(());
        }

        // The released block coalesced into free space at least as large, so
        // the old payload fits again.
        let restored = previous.and_then(|previous| {
            let placement = Placement::new(self.layout, key.len(), previous.len());
            let block = if placement.block_len == 0 {
                NIL
            } else {
                self.allocate(placement.block_len)?
            };
            self.write_payload(index, &placement, block, key, &previous);
            Some(())
        });
        if restored.is_none() {
            warn!(segment = self.index, slot = index, "dropping entry after failed relocation");
            self.set_word(index, TOMBSTONE << STATE_SHIFT);
            self.entry.count = self.entry.count.saturating_sub(1);
            self.entry.tombstones += 1;
        }
        Err(err)
    }

    /// Picks the block for `placement`, reusing `current` when it is large
    /// enough.
    fn place_block(&mut self, placement: &Placement, current: Option<u64>) -> Result<u64> {
        if placement.block_len == 0 {
            return Ok(NIL);
        }
        if let Some(current) = current {
            if arena::used_capacity(self.region, current, placement.block_len).is_some() {
                return Ok(current);
            }
        }
        self.allocate(placement.block_len)
            .ok_or(Error::CapacityExceeded { segment: self.index })
    }

    fn allocate(&mut self, len: usize) -> Option<u64> {
        Arena::new(&mut *self.region, &mut self.entry.free_list_head).allocate(len)
    }

    fn release(&mut self, block: u64) {
        Arena::new(&mut *self.region, &mut self.entry.free_list_head).release(block);
    }

    fn write_payload(
        &mut self,
        index: usize,
        placement: &Placement,
        block: u64,
        key: &[u8],
        value: &[u8],
    ) {
        if placement.block_len > 0 {
            let mut at = block as usize;
            if !placement.key_inline {
                self.region[at..at + key.len()].copy_from_slice(key);
                at += key.len();
            }
            if !placement.value_inline {
                self.region[at..at + value.len()].copy_from_slice(value);
            }
        }

        let layout = self.layout;
        let start = index * layout.slot_size;
        let slot = &mut self.slots[start..start + layout.slot_size];
        slot[CRC..CRC + 4].copy_from_slice(&checksum(key, value).to_le_bytes());
        slot[KEY_LEN..KEY_LEN + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        slot[FLAGS..FLAGS + 2].copy_from_slice(&placement.flags().to_le_bytes());
        slot[VALUE_LEN..VALUE_LEN + 4].copy_from_slice(&(value.len() as u32).to_le_bytes());
        slot[BLOCK..BLOCK + 8].copy_from_slice(&block.to_le_bytes());
        let key_area = SlotLayout::FIXED_BYTES;
        if placement.key_inline {
            slot[key_area..key_area + key.len()].copy_from_slice(key);
        }
        let value_area = key_area + layout.key_inline;
        if placement.value_inline {
            slot[value_area..value_area + value.len()].copy_from_slice(value);
        }
    }

    fn set_word(&mut self, index: usize, word: u64) {
        let start = index * self.layout.slot_size;
        self.slots[start..start + 8].copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        layout: SlotLayout,
        slots: Vec<u8>,
        region: Vec<u8>,
        entry: SegmentEntry,
    }

    impl Fixture {
        fn new(capacity: usize, region: usize) -> Self {
            let layout = SlotLayout {
                slot_size: SlotLayout::slot_size_for(16, 16) as usize,
                key_inline: 16,
                value_inline: 16,
                capacity,
                limit: SlotLayout::limit_for(capacity as u64, 0.75),
                max_key_bytes: 64,
                max_value_bytes: 256,
            };
            let mut fixture = Fixture {
                slots: vec![0u8; capacity * layout.slot_size],
                region: vec![0u8; region],
                entry: SegmentEntry::default(),
                layout,
            };
            fixture.segment().format();
            fixture
        }

        fn segment(&mut self) -> SegmentMut<'_> {
            SegmentMut::new(
                0,
                &self.layout,
                &mut self.slots,
                &mut self.region,
                &mut self.entry,
            )
        }

        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            Segment::new(&self.layout, &self.slots, &self.region)
                .get(key, KeyHasher::default().hash(key))
                .map(<[u8]>::to_vec)
        }

        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
            let hash = KeyHasher::default().hash(key);
            self.segment().insert_or_update(key, hash, value, true)
        }

        fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
            let hash = KeyHasher::default().hash(key);
            self.segment().remove(key, hash)
        }
    }

    #[test]
    fn test_insert_update_remove() {
        let mut fx = Fixture::new(16, 4096);
        assert_eq!(fx.put(b"apple", b"1").unwrap(), None);
        assert_eq!(fx.put(b"banana", b"2").unwrap(), None);
        assert_eq!(fx.get(b"apple"), Some(b"1".to_vec()));
        assert_eq!(fx.put(b"apple", b"10").unwrap(), Some(b"1".to_vec()));
        assert_eq!(fx.get(b"apple"), Some(b"10".to_vec()));
        assert_eq!(fx.entry.count, 2);

        assert_eq!(fx.remove(b"apple"), Some(b"10".to_vec()));
        assert_eq!(fx.remove(b"apple"), None);
        assert_eq!(fx.get(b"apple"), None);
        assert_eq!(fx.get(b"banana"), Some(b"2".to_vec()));
        assert_eq!(fx.entry.count, 1);
    }

    #[test]
    fn test_out_of_line_placement() {
        let mut fx = Fixture::new(16, 4096);
        let free = fx.as_free_bytes();
        let long_key = [7u8; 40];
        let long_value = [9u8; 100];

        fx.put(b"short", &long_value).unwrap();
        fx.put(&long_key, b"tiny").unwrap();
        fx.put(&long_key[..17], &long_value[..17]).unwrap();
        assert_eq!(fx.get(b"short"), Some(long_value.to_vec()));
        assert_eq!(fx.get(&long_key), Some(b"tiny".to_vec()));
        assert_eq!(fx.get(&long_key[..17]), Some(long_value[..17].to_vec()));
        assert!(fx.as_free_bytes() < free);

        // Shrinking a value back under the inline budget frees its block.
        fx.put(b"short", b"x").unwrap();
        fx.remove(&long_key);
        fx.remove(&long_key[..17]);
        assert_eq!(fx.as_free_bytes(), free);
        assert_eq!(fx.get(b"short"), Some(b"x".to_vec()));
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut fx = Fixture::new(8, 4096);
        for i in 0..6u8 {
            fx.put(&[i], &[i]).unwrap();
        }
        match fx.put(&[6], &[6]) {
            Err(Error::CapacityExceeded { segment: 0 }) => {}
            other => panic!("unexpected {other:?}"),
        }
        // Updates of existing keys are still accepted.
        fx.put(&[3], b"updated").unwrap();
        // A removed key can come back: its tombstone sits on its own probe
        // chain, or was cleared.
        fx.remove(&[0]);
        fx.put(&[0], b"again").unwrap();
        assert_eq!(fx.get(&[0]), Some(b"again".to_vec()));
        assert_eq!(fx.entry.count, 6);
        assert!(fx.entry.count + fx.entry.tombstones <= fx.layout.limit as u64);
    }

    #[test]
    fn test_update_grows_into_released_block() {
        let mut fx = Fixture::new(16, 256);
        fx.put(b"a", &[1; 150]).unwrap();
        // Only 88 bytes are free, but 248 are once the old block is released.
        assert_eq!(fx.put(b"a", &[2; 200]).unwrap(), Some(vec![1; 150]));
        assert_eq!(fx.get(b"a"), Some(vec![2; 200]));
        assert_eq!(fx.entry.count, 1);

        // Too large even for the whole region: the old value survives.
        match fx.put(b"a", &[3; 256]) {
            Err(Error::CapacityExceeded { segment: 0 }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.get(b"a"), Some(vec![2; 200]));
        assert_eq!(fx.entry.count, 1);
        assert_eq!(fx.as_free_bytes(), 40);
    }

    #[test]
    fn test_bad_block_pointer_is_not_trusted() {
        let mut fx = Fixture::new(16, 4096);
        fx.put(b"k", &[7; 100]).unwrap();
        fx.put(b"other", &[8; 100]).unwrap();
        let free = fx.as_free_bytes();
        // Inside the first block's header.
        fx.set_block(b"k", 4);

        assert_eq!(fx.get(b"k"), None);
        assert_eq!(fx.remove(b"k"), None);
        assert_eq!(fx.as_free_bytes(), free);
        assert_eq!(fx.entry.count, 1);
        assert_eq!(fx.get(b"other"), Some(vec![8; 100]));

        // Pointing at a block too small for the value is rejected as well.
        fx.put(b"k", &[7; 100]).unwrap();
        fx.put(b"small", &[9; 24]).unwrap();
        let small = fx.slot_field(b"small", BLOCK);
        fx.set_block(b"k", small);
        assert_eq!(fx.get(b"k"), None);
        assert!(matches!(fx.put(b"k", &[1; 200]), Ok(None)));
        assert_eq!(fx.get(b"k"), Some(vec![1; 200]));
        assert_eq!(fx.get(b"small"), Some(vec![9; 24]));
    }

    #[test]
    fn test_unknown_state_is_not_reused() {
        let mut fx = Fixture::new(16, 4096);
        fx.put(b"a", b"1").unwrap();
        let index = fx.as_ref_find(b"a");
        let word = fx.slot_field(b"a", 0) | (3 << STATE_SHIFT);
        fx.segment().set_word(index, word);

        assert_eq!(fx.get(b"a"), None);
        assert_eq!(fx.put(b"a", b"2").unwrap(), None);
        assert_eq!(fx.get(b"a"), Some(b"2".to_vec()));
        assert_eq!(fx.entry.tombstones, 0);
        assert_ne!(fx.as_ref_find(b"a"), index);
    }

    #[test]
    fn test_region_exhausted() {
        let mut fx = Fixture::new(16, 256);
        let value = [1u8; 100];
        fx.put(b"a", &value).unwrap();
        fx.put(b"b", &value).unwrap();
        match fx.put(b"c", &value) {
            Err(Error::CapacityExceeded { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fx.get(b"c"), None);
        assert_eq!(fx.entry.count, 2);
    }

    #[test]
    fn test_tombstones_cleared() {
        let mut fx = Fixture::new(64, 4096);
        for i in 0..40u8 {
            fx.put(&[i], &[i]).unwrap();
        }
        for i in 0..40u8 {
            assert_eq!(fx.remove(&[i]), Some(vec![i]));
        }
        assert_eq!(fx.entry.count, 0);
        assert_eq!(fx.entry.tombstones, 0);
        for i in 0..40u8 {
            fx.put(&[i], &[i]).unwrap();
        }
        assert_eq!(fx.entry.count, 40);
    }

    #[test]
    fn test_for_each() {
        let mut fx = Fixture::new(32, 4096);
        for i in 0..10u8 {
            fx.put(&[b'k', i], &[i; 20]).unwrap();
        }
        let mut seen = Vec::new();
        Segment::new(&fx.layout, &fx.slots, &fx.region).for_each(|k, v| {
            assert_eq!(v, &[k[1]; 20]);
            seen.push(k[1]);
        });
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_recover_demotes_bad_slots() {
        let mut fx = Fixture::new(32, 4096);
        for i in 0..10u8 {
            fx.put(&[b'k', i], &[i; 30]).unwrap();
        }
        fx.put(b"inline", b"v").unwrap();

        let bad_value = fx.as_ref_find(&[b'k', 3]);
        let bad_block = fx.as_ref_find(&[b'k', 4]);
        let bad_crc = fx.as_ref_find(b"inline");
        let size = fx.layout.slot_size;
        // Torn value bytes, a wild block pointer and a flipped inline byte.
        let block = read_u64(&fx.slots[bad_value * size..], BLOCK) as usize;
        fx.region[block] ^= 0xff;
        fx.slots[bad_block * size + BLOCK..bad_block * size + BLOCK + 8]
            .copy_from_slice(&(1u64 << 40).to_le_bytes());
        fx.slots[bad_crc * size + SlotLayout::FIXED_BYTES] ^= 0xff;

        let stats = fx.segment().recover(&KeyHasher::default());
        assert_eq!(stats.demoted, 3);
        assert_eq!(stats.count, 8);
        assert_eq!(fx.entry.count, 8);
        assert_eq!(fx.get(&[b'k', 3]), None);
        assert_eq!(fx.get(&[b'k', 4]), None);
        assert_eq!(fx.get(b"inline"), None);
        for i in (0..10u8).filter(|i| *i != 3 && *i != 4) {
            assert_eq!(fx.get(&[b'k', i]), Some(vec![i; 30]));
        }

        // Freed space from the demoted blocks is reusable.
        for i in 10..20u8 {
            fx.put(&[b'k', i], &[i; 30]).unwrap();
        }
        assert_eq!(fx.entry.count, 18);
    }

    #[test]
    fn test_recover_clean_segment_is_noop() {
        let mut fx = Fixture::new(32, 4096);
        for i in 0..12u8 {
            fx.put(&[i], &[i; 24]).unwrap();
        }
        fx.remove(&[5]);
        let entry = fx.entry;
        let free = fx.as_free_bytes();
        let stats = fx.segment().recover(&KeyHasher::default());
        assert_eq!(stats.demoted, 0);
        assert_eq!(fx.entry.count, entry.count);
        assert_eq!(fx.entry.tombstones, entry.tombstones);
        assert_eq!(fx.as_free_bytes(), free);
    }

    impl Fixture {
        fn as_free_bytes(&self) -> u64 {
            Segment::new(&self.layout, &self.slots, &self.region).free_bytes(self.entry.free_list_head)
        }

        fn as_ref_find(&self, key: &[u8]) -> usize {
            Segment::new(&self.layout, &self.slots, &self.region)
                .find(key, KeyHasher::default().hash(key))
                .unwrap()
        }

        fn slot_field(&self, key: &[u8], field: usize) -> u64 {
            let start = self.as_ref_find(key) * self.layout.slot_size;
            read_u64(&self.slots[start..], field)
        }

        fn set_block(&mut self, key: &[u8], block: u64) {
            let start = self.as_ref_find(key) * self.layout.slot_size + BLOCK;
            self.slots[start..start + 8].copy_from_slice(&block.to_le_bytes());
        }
    }
}
