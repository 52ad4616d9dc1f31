use std::path::Path;

use crate::arena::round_up;
use crate::meta::{Header, MAX_INLINE, MAX_SEGMENTS, MAX_TOTAL_SLOTS, MAX_VALUE_REGION, SlotLayout};
use crate::store::Store;
use crate::{Codec, Error, OptMap, OptionSymbol, Result, TypedMap};

/// Bytes reserved in every slot for a value stored inline.
const INLINE_VALUE_BYTES: u32 = 16;
const MIN_REGION_BYTES: u64 = 4096;
const MIN_SLOTS: u64 = 8;

/// Creation-time configuration for an [`OptMap`] file.
///
/// Every parameter is frozen into the file header, so [`OptMap::open`] needs
/// no configuration. The only required setting is
/// [`with_entries`](Self::with_entries); keys default to the 17-byte fixed
/// form of an [`OptionSymbol`] and values to an 8-byte price.
///
/// # Examples
///
/// ```
/// use optmap::OptMapBuilder;
///
/// # fn main() -> optmap::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let map = OptMapBuilder::default()
///     .with_entries(10_000)
///     .with_average_key_bytes(8)
///     .with_average_value_bytes(8)
///     .create(dir.path().join("prices.osym"))?;
/// map.put(b"SYM1", &1.5f64.to_le_bytes())?;
/// assert_eq!(map.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct OptMapBuilder {
    entries: u64,
    avg_key_bytes: u32,
    avg_value_bytes: u32,
    max_key_bytes: Option<u32>,
    max_value_bytes: Option<u32>,
    segments: Option<u32>,
    max_load: f64,
    put_returns_null: bool,
    hash_seed: u64,
}

impl Default for OptMapBuilder {
    fn default() -> Self {
        Self {
            entries: 0,
            avg_key_bytes: OptionSymbol::FIXED_SIZE as u32,
            avg_value_bytes: 8,
            max_key_bytes: None,
            max_value_bytes: None,
            segments: None,
            max_load: 0.75,
            put_returns_null: false,
            hash_seed: 0,
        }
    }
}

impl OptMapBuilder {
    /// Sets the number of entries the store must hold.
    ///
    /// There is no rehashing: slot arrays are sized once from this value and
    /// inserting far beyond it fails with [`Error::CapacityExceeded`].
    ///
    /// Each segment is sized for `n + 3·sqrt(n)` keys, where `n` is
    /// `entries / segments`, before dividing by the max load and rounding up
    /// to a power of two. The headroom absorbs uneven hashing, so the file can
    /// be larger than `entries / max_load` slots would suggest.
    pub fn with_entries(mut self, entries: u64) -> Self {
        self.entries = entries;
        self
    }

    /// Sets the expected encoded key size, which also sizes the inline key
    /// area of every slot.
    pub fn with_average_key_bytes(mut self, bytes: u32) -> Self {
        self.avg_key_bytes = bytes;
        self
    }

    /// Uses the encoded size of a representative key.
    pub fn with_average_key<K: Codec>(self, key: &K) -> Result<Self> {
        let bytes = encoded_len(key)?;
        Ok(self.with_average_key_bytes(bytes))
    }

    pub fn with_average_value_bytes(mut self, bytes: u32) -> Self {
        self.avg_value_bytes = bytes;
        self
    }

    /// Uses the encoded size of a representative value.
    pub fn with_average_value<V: Codec>(self, value: &V) -> Result<Self> {
        let bytes = encoded_len(value)?;
        Ok(self.with_average_value_bytes(bytes))
    }

    /// Caps key length. Defaults to four times the average, at least 64.
    pub fn with_max_key_bytes(mut self, bytes: u32) -> Self {
        self.max_key_bytes = Some(bytes);
        self
    }

    /// Caps value length. Defaults to four times the average, at least 4096.
    pub fn with_max_value_bytes(mut self, bytes: u32) -> Self {
        self.max_value_bytes = Some(bytes);
        self
    }

    /// Sets the number of segments, rounded up to a power of two.
    ///
    /// Defaults to `min(entries / 256, cores * 4)`.
    pub fn with_segments(mut self, segments: u32) -> Self {
        self.segments = Some(segments);
        self
    }

    /// Sets the fraction of slots that may be occupied or tombstoned.
    pub fn with_max_load(mut self, max_load: f64) -> Self {
        self.max_load = max_load;
        self
    }

    /// When set, `put` never copies out the value it replaces.
    pub fn with_put_returns_null(mut self, value: bool) -> Self {
        self.put_returns_null = value;
        self
    }

    pub fn with_hash_seed(mut self, seed: u64) -> Self {
        self.hash_seed = seed;
        self
    }

    /// Creates the store file at `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for inconsistent sizing,
    /// [`Error::AlreadyOpen`] when another handle holds the file, and
    /// [`Error::Io`] when the file cannot be sized or mapped.
    pub fn create(self, path: impl AsRef<Path>) -> Result<OptMap> {
        let header = self.header()?;
        Ok(OptMap::from_store(Store::create(path.as_ref(), header)?))
    }

    /// Like [`create`](Self::create), wrapped in a typed view.
    pub fn create_typed<K: Codec, V: Codec>(self, path: impl AsRef<Path>) -> Result<TypedMap<K, V>> {
        Ok(TypedMap::new(self.create(path)?))
    }

    /// Resolves defaults and derives the file geometry.
    pub(crate) fn header(&self) -> Result<Header> {
        let invalid = |message: String| Err(Error::InvalidArgument(message));
        if self.entries == 0 {
            return invalid("entries must be positive".to_string());
        }
        if !(self.max_load > 0.0 && self.max_load < 1.0) {
            return invalid(format!("max load {} is outside (0, 1)", self.max_load));
        }
        if self.avg_key_bytes == 0 {
            return invalid("average key size must be positive".to_string());
        }

        let max_key_bytes = self
            .max_key_bytes
            .unwrap_or_else(|| (self.avg_key_bytes.saturating_mul(4)).clamp(64, u16::MAX as u32));
        if max_key_bytes > u16::MAX as u32 || max_key_bytes < self.avg_key_bytes {
            return invalid(format!(
                "max key bytes {max_key_bytes} must lie in [{}, {}]",
                self.avg_key_bytes,
                u16::MAX
            ));
        }
        let max_value_bytes = self
            .max_value_bytes
            .unwrap_or_else(|| self.avg_value_bytes.saturating_mul(4).max(4096));
        if max_value_bytes < self.avg_value_bytes {
            return invalid(format!(
                "max value bytes {max_value_bytes} is below the average {}",
                self.avg_value_bytes
            ));
        }
        let largest_block = block_bytes(max_key_bytes as u64 + max_value_bytes as u64);
        if largest_block > MAX_VALUE_REGION {
            return invalid(format!(
                "an entry of {max_key_bytes} + {max_value_bytes} bytes exceeds the value region limit"
            ));
        }

        let segment_count = match self.segments {
            Some(0) => return invalid("segments must be positive".to_string()),
            Some(segments) => segments.next_power_of_two(),
            None => default_segments(self.entries),
        };
        if segment_count > MAX_SEGMENTS {
            return invalid(format!("at most {MAX_SEGMENTS} segments are supported"));
        }

        // Allow three standard deviations of hash skew per segment.
        let mean = self.entries.div_ceil(segment_count as u64);
        let needed = mean.saturating_add((3.0 * (mean as f64).sqrt()).ceil() as u64);
        let too_many = || Error::InvalidArgument(format!("{} entries is too many", self.entries));
        let slots_per_segment = ((needed as f64 / self.max_load).ceil() as u64)
            .max(MIN_SLOTS)
            .checked_next_power_of_two()
            .ok_or_else(too_many)?;
        if slots_per_segment.saturating_mul(segment_count as u64) > MAX_TOTAL_SLOTS {
            return Err(too_many());
        }

        let key_inline = (round_up(self.avg_key_bytes as usize) as u32).min(MAX_INLINE);
        let value_inline = INLINE_VALUE_BYTES;

        let limit = SlotLayout::limit_for(slots_per_segment, self.max_load) as u64;
        let per_entry = if self.avg_value_bytes > value_inline {
            block_bytes(self.avg_value_bytes as u64)
        } else {
            0
        };
        let expected = limit.saturating_mul(per_entry).saturating_mul(5) / 4;
        let value_region_size = MIN_REGION_BYTES
            .max(largest_block)
            .max(expected)
            .min(MAX_VALUE_REGION)
            .div_ceil(8)
            * 8;

        let mut header = Header {
            clean: false,
            entries: self.entries,
            avg_key_bytes: self.avg_key_bytes,
            avg_value_bytes: self.avg_value_bytes,
            max_key_bytes,
            max_value_bytes,
            segment_count,
            put_returns_null: self.put_returns_null,
            max_load: self.max_load,
            slots_per_segment,
            slot_size: SlotLayout::slot_size_for(key_inline, value_inline),
            key_inline,
            value_inline,
            hash_seed: self.hash_seed,
            segment_table_offset: Header::SIZE as u64,
            value_region_size,
            file_length: 0,
        };
        header.file_length = header.planned_length();
        Ok(header)
    }
}

fn encoded_len<T: Codec>(value: &T) -> Result<u32> {
    let mut buf = Vec::new();
    value.encode(&mut buf)?;
    u32::try_from(buf.len())
        .map_err(|_| Error::InvalidArgument(format!("sample of {} bytes is too large", buf.len())))
}

/// Value-region bytes consumed by a block holding `payload` bytes.
fn block_bytes(payload: u64) -> u64 {
    payload.max(8).div_ceil(8) * 8 + 8
}

fn default_segments(entries: u64) -> u32 {
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get()) as u64;
    let segments = (entries / 256).min(cores * 4).clamp(1, MAX_SEGMENTS as u64);
    (segments as u32).next_power_of_two()
}
