use serde::Serialize;

use crate::{Error, HashConfig, MAGIC, Result, VERSION};

pub(crate) const MAX_SEGMENTS: u32 = 1 << 16;
pub(crate) const MAX_TOTAL_SLOTS: u64 = 1 << 40;
pub(crate) const MAX_INLINE: u32 = 1 << 16;
const MAX_TABLE_OFFSET: u64 = 1 << 20;
/// Block capacities are stored as `u32`.
pub(crate) const MAX_VALUE_REGION: u64 = 1 << 31;

/// Fixed-size prefix stored at offset 0 of every store file.
///
/// All fields are little-endian. The trailing CRC32 covers every byte before
/// it, so a torn header write is detected on open.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Set only by an orderly close; cleared again as soon as a handle opens.
    pub clean: bool,
    /// Number of entries the store was sized for.
    pub entries: u64,
    pub avg_key_bytes: u32,
    pub avg_value_bytes: u32,
    pub max_key_bytes: u32,
    pub max_value_bytes: u32,
    pub segment_count: u32,
    pub put_returns_null: bool,
    pub max_load: f64,
    /// Slot array length of each segment; always a power of two.
    pub slots_per_segment: u64,
    pub slot_size: u32,
    /// Bytes reserved inside each slot for a key stored inline.
    pub key_inline: u32,
    /// Bytes reserved inside each slot for a value stored inline.
    pub value_inline: u32,
    pub hash_seed: u64,
    pub segment_table_offset: u64,
    /// Size of each segment's value arena.
    pub value_region_size: u64,
    pub file_length: u64,
}

impl Header {
    pub const SIZE: usize = 128;
    const CRC_OFFSET: usize = Self::SIZE - 4;
    const FLAG_PUT_RETURNS_NULL: u32 = 1;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[12] = self.clean as u8;
        buf[16..24].copy_from_slice(&self.entries.to_le_bytes());
        buf[24..28].copy_from_slice(&self.avg_key_bytes.to_le_bytes());
        buf[28..32].copy_from_slice(&self.avg_value_bytes.to_le_bytes());
        buf[32..36].copy_from_slice(&self.max_key_bytes.to_le_bytes());
        buf[36..40].copy_from_slice(&self.max_value_bytes.to_le_bytes());
        buf[40..44].copy_from_slice(&self.segment_count.to_le_bytes());
        let flags = if self.put_returns_null {
            Self::FLAG_PUT_RETURNS_NULL
        } else {
            0
        };
        buf[44..48].copy_from_slice(&flags.to_le_bytes());
        buf[48..56].copy_from_slice(&self.max_load.to_bits().to_le_bytes());
        buf[56..64].copy_from_slice(&self.slots_per_segment.to_le_bytes());
        buf[64..68].copy_from_slice(&self.slot_size.to_le_bytes());
        buf[68..72].copy_from_slice(&self.key_inline.to_le_bytes());
        buf[72..76].copy_from_slice(&self.value_inline.to_le_bytes());
        buf[80..88].copy_from_slice(&self.hash_seed.to_le_bytes());
        buf[88..96].copy_from_slice(&self.segment_table_offset.to_le_bytes());
        buf[96..104].copy_from_slice(&self.value_region_size.to_le_bytes());
        buf[104..112].copy_from_slice(&self.file_length.to_le_bytes());
        let crc = crc32fast::hash(&buf[..Self::CRC_OFFSET]);
        buf[Self::CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parses and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] on a short buffer, a foreign magic, an
    /// unsupported version, a checksum mismatch, or inconsistent sizing.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::Corrupt(format!(
                "header needs {} bytes, file has {}",
                Self::SIZE,
                buf.len()
            )));
        }
        if buf[0..8] != MAGIC {
            return Err(Error::Corrupt(format!(
                "invalid magic number: {:?}",
                String::from_utf8_lossy(&buf[0..8])
            )));
        }
        let version = read_u32(buf, 8);
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported version {version}, expected {VERSION}"
            )));
        }
        let stored_crc = read_u32(buf, Self::CRC_OFFSET);
        let crc = crc32fast::hash(&buf[..Self::CRC_OFFSET]);
        if stored_crc != crc {
            return Err(Error::Corrupt(format!(
                "header checksum mismatch: stored {stored_crc:#010x}, computed {crc:#010x}"
            )));
        }

        let header = Header {
            clean: buf[12] == 1,
            entries: read_u64(buf, 16),
            avg_key_bytes: read_u32(buf, 24),
            avg_value_bytes: read_u32(buf, 28),
            max_key_bytes: read_u32(buf, 32),
            max_value_bytes: read_u32(buf, 36),
            segment_count: read_u32(buf, 40),
            put_returns_null: read_u32(buf, 44) & Self::FLAG_PUT_RETURNS_NULL != 0,
            max_load: f64::from_bits(read_u64(buf, 48)),
            slots_per_segment: read_u64(buf, 56),
            slot_size: read_u32(buf, 64),
            key_inline: read_u32(buf, 68),
            value_inline: read_u32(buf, 72),
            hash_seed: read_u64(buf, 80),
            segment_table_offset: read_u64(buf, 88),
            value_region_size: read_u64(buf, 96),
            file_length: read_u64(buf, 104),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        let corrupt = |what: &str| Err(Error::Corrupt(format!("header {what}")));
        if self.segment_count == 0 || !self.segment_count.is_power_of_two() {
            return corrupt("segment count is not a power of two");
        }
        if self.slots_per_segment == 0 || !self.slots_per_segment.is_power_of_two() {
            return corrupt("slot count is not a power of two");
        }
        if !(self.max_load > 0.0 && self.max_load < 1.0) {
            return corrupt("max load is outside (0, 1)");
        }
        if self.segment_count > MAX_SEGMENTS
            || self
                .slots_per_segment
                .saturating_mul(self.segment_count as u64)
                > MAX_TOTAL_SLOTS
            || self.key_inline > MAX_INLINE
            || self.value_inline > MAX_INLINE
        {
            return corrupt("sizing exceeds supported bounds");
        }
        if !(Self::SIZE as u64..=MAX_TABLE_OFFSET).contains(&self.segment_table_offset) {
            return corrupt("segment table offset is out of range");
        }
        let expected = SlotLayout::slot_size_for(self.key_inline, self.value_inline);
        if self.slot_size != expected || self.key_inline % 8 != 0 || self.value_inline % 8 != 0 {
            return corrupt("slot geometry is inconsistent");
        }
        if self.max_key_bytes > u16::MAX as u32 {
            return corrupt("max key bytes exceeds the slot key length field");
        }
        if self.value_region_size % 8 != 0 || self.value_region_size > MAX_VALUE_REGION {
            return corrupt("value region size is invalid");
        }
        Ok(())
    }

    /// Geometry shared by every segment's slot array.
    pub fn slot_layout(&self) -> SlotLayout {
        SlotLayout {
            slot_size: self.slot_size as usize,
            key_inline: self.key_inline as usize,
            value_inline: self.value_inline as usize,
            capacity: self.slots_per_segment as usize,
            limit: SlotLayout::limit_for(self.slots_per_segment, self.max_load),
            max_key_bytes: self.max_key_bytes as usize,
            max_value_bytes: self.max_value_bytes as usize,
        }
    }

    /// Offset of the segment table entry for `index`.
    pub fn segment_entry_offset(&self, index: usize) -> u64 {
        self.segment_table_offset + (index * SegmentEntry::SIZE) as u64
    }

    fn slot_arrays_offset(&self) -> u64 {
        align_up(self.segment_entry_offset(self.segment_count as usize), 64)
    }

    fn value_regions_offset(&self) -> u64 {
        let slot_arrays = self.slot_layout().slot_array_bytes() * self.segment_count as u64;
        align_up(self.slot_arrays_offset() + slot_arrays, 64)
    }

    /// Segment table row implied by the sizing fields, with an empty
    /// allocator state.
    pub fn planned_entry(&self, index: usize) -> SegmentEntry {
        SegmentEntry {
            slot_array_offset: self.slot_arrays_offset()
                + self.slot_layout().slot_array_bytes() * index as u64,
            value_region_offset: self.value_regions_offset()
                + self.value_region_size * index as u64,
            value_region_size: self.value_region_size,
            ..SegmentEntry::default()
        }
    }

    /// File length implied by the sizing fields.
    pub fn planned_length(&self) -> u64 {
        self.value_regions_offset() + self.value_region_size * self.segment_count as u64
    }
}

/// One row of the segment table that follows the header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    pub slot_array_offset: u64,
    pub value_region_offset: u64,
    pub value_region_size: u64,
    /// Offset of the first free block inside the value region.
    pub free_list_head: u64,
    /// Number of OCCUPIED slots.
    pub count: u64,
    /// Number of TOMBSTONE slots.
    pub tombstones: u64,
}

impl SegmentEntry {
    pub const SIZE: usize = 48;

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.slot_array_offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.value_region_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.value_region_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.free_list_head.to_le_bytes());
        buf[32..40].copy_from_slice(&self.count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.tombstones.to_le_bytes());
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Self {
        SegmentEntry {
            slot_array_offset: read_u64(buf, 0),
            value_region_offset: read_u64(buf, 8),
            value_region_size: read_u64(buf, 16),
            free_list_head: read_u64(buf, 24),
            count: read_u64(buf, 32),
            tombstones: read_u64(buf, 40),
        }
    }
}

/// Slot geometry derived from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub slot_size: usize,
    pub key_inline: usize,
    pub value_inline: usize,
    /// Number of slots in a segment.
    pub capacity: usize,
    /// Maximum OCCUPIED + TOMBSTONE slots allowed by the max load.
    pub limit: usize,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
}

impl SlotLayout {
    /// Fixed bytes in front of the inline key and value areas.
    pub const FIXED_BYTES: usize = 32;

    pub fn slot_size_for(key_inline: u32, value_inline: u32) -> u32 {
        Self::FIXED_BYTES as u32 + key_inline + value_inline
    }

    pub fn limit_for(capacity: u64, max_load: f64) -> usize {
        ((capacity as f64 * max_load).floor() as usize).min(capacity as usize - 1)
    }

    /// Bytes a segment's slot array occupies in the file.
    pub fn slot_array_bytes(&self) -> u64 {
        (self.capacity * self.slot_size) as u64
    }
}

/// Per-segment statistics reported by [`OptMapInfo`].
#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub count: u64,
    pub tombstones: u64,
    /// Bytes available on the segment's free list.
    pub free_bytes: u64,
}

/// Summary returned by [`OptMap::info`](crate::OptMap::info).
#[derive(Debug, Serialize, Default, Clone)]
pub struct OptMapInfo {
    /// Final size of the store file in bytes.
    pub file_length: u64,
    /// Number of live entries.
    pub entry_count: u64,
    /// Number of entries the store was sized for.
    pub capacity: u64,
    pub segment_count: usize,
    pub slots_per_segment: u64,
    pub slot_size: u32,
    pub max_key_bytes: u32,
    pub max_value_bytes: u32,
    pub value_region_size: u64,
    pub max_load: f64,
    pub put_returns_null: bool,
    /// Whether the last open had to run crash recovery.
    pub recovered: bool,
    pub hash: HashConfig,
    pub segments: Vec<SegmentInfo>,
}

fn align_up(offset: u64, align: u64) -> u64 {
    offset.div_ceil(align) * align
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
