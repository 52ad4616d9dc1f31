use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::meta::{Header, SegmentEntry, SegmentInfo, SlotLayout};
use crate::segment::{Segment, SegmentMut};
use crate::{Error, KeyHasher, OptMapInfo, Result};

/// Lock and counter of one segment.
///
/// The guarded [`SegmentEntry`] is the authoritative copy of the segment's
/// table row; it is written back to the mapping before the write lock drops.
struct SegmentState {
    entry: RwLock<SegmentEntry>,
    len: AtomicU64,
}

/// Exclusive owner of a store file and its mapping.
///
/// Each segment's slot array and value region are disjoint byte ranges of the
/// mapping. Slices over a range are only created while that segment's lock is
/// held, shared for [`Segment`] views and exclusive for [`SegmentMut`].
pub(crate) struct Store {
    path: PathBuf,
    file: File,
    mmap: MmapRaw,
    header: Header,
    layout: SlotLayout,
    hasher: KeyHasher,
    segments: Vec<SegmentState>,
    recovered: bool,
    closed: bool,
}

impl Store {
    /// Creates (or truncates) the file at `path` and formats every segment.
    pub fn create(path: &Path, mut header: Header) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock(&file, path)?;

        header.clean = false;
        header.file_length = header.planned_length();
        file.set_len(0)?;
        file.set_len(header.file_length)?;
        let mmap = MmapOptions::new().map_raw(&file)?;

        let entries = (0..header.segment_count as usize)
            .map(|index| header.planned_entry(index))
            .collect();
        let mut store = Store::assemble(path, file, mmap, header, entries);
        store.write_header();
        for index in 0..store.segments.len() {
            store.with_write(index, |segment| segment.format());
        }
        store.mmap.flush()?;

        debug!(
            path = %path.display(),
            segments = store.header.segment_count,
            slots_per_segment = store.header.slots_per_segment,
            file_length = store.header.file_length,
            "created store"
        );
        Ok(store)
    }

    /// Attaches to an existing file, running recovery if it was not closed
    /// cleanly.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        lock(&file, path)?;

        let actual = file.metadata()?.len();
        if actual < Header::SIZE as u64 {
            return Err(Error::Corrupt(format!(
                "file is {actual} bytes, shorter than the header"
            )));
        }
        let mmap = MmapOptions::new().map_raw(&file)?;
        // SAFETY: the mapping is at least `Header::SIZE` bytes long and the
        // file lock keeps other handles from writing it.
        let prefix = unsafe { std::slice::from_raw_parts(mmap.as_ptr(), Header::SIZE) };
        let header = Header::deserialize(prefix)?;
        if header.file_length != actual || header.planned_length() != actual {
            return Err(Error::Corrupt(format!(
                "file is {actual} bytes, header expects {}",
                header.planned_length()
            )));
        }

        let mut entries = Vec::with_capacity(header.segment_count as usize);
        for index in 0..header.segment_count as usize {
            let offset = header.segment_entry_offset(index) as usize;
            // SAFETY: the table lies inside the planned length checked above.
            let row = unsafe {
                std::slice::from_raw_parts(mmap.as_ptr().add(offset), SegmentEntry::SIZE)
            };
            let entry = SegmentEntry::deserialize(row);
            let planned = header.planned_entry(index);
            if entry.slot_array_offset != planned.slot_array_offset
                || entry.value_region_offset != planned.value_region_offset
                || entry.value_region_size != planned.value_region_size
            {
                return Err(Error::Corrupt(format!(
                    "segment {index} table entry disagrees with the header"
                )));
            }
            if header.clean
                && entry.count.saturating_add(entry.tombstones) > header.slots_per_segment
            {
                return Err(Error::Corrupt(format!(
                    "segment {index} counts exceed its capacity"
                )));
            }
            entries.push(entry);
        }

        let mut store = Store::assemble(path, file, mmap, header, entries);
        if !store.header.clean {
            warn!(path = %path.display(), "store was not closed cleanly, recovering");
            let hasher = store.hasher;
            let mut demoted = 0;
            for index in 0..store.segments.len() {
                let stats = store.with_write(index, |segment| segment.recover(&hasher));
                debug!(
                    segment = index,
                    count = stats.count,
                    tombstones = stats.tombstones,
                    demoted = stats.demoted,
                    "recovered segment"
                );
                demoted += stats.demoted;
            }
            warn!(path = %path.display(), demoted, "recovery finished");
            store.recovered = true;
        }

        store.header.clean = false;
        store.write_header();
        store.mmap.flush()?;
        debug!(path = %path.display(), entries = store.len(), "opened store");
        Ok(store)
    }

    fn assemble(
        path: &Path,
        file: File,
        mmap: MmapRaw,
        header: Header,
        entries: Vec<SegmentEntry>,
    ) -> Self {
        let segments = entries
            .into_iter()
            .map(|entry| SegmentState {
                len: AtomicU64::new(entry.count),
                entry: RwLock::new(entry),
            })
            .collect();
        Store {
            path: path.to_path_buf(),
            file,
            mmap,
            layout: header.slot_layout(),
            hasher: KeyHasher::with_seed(header.hash_seed),
            header,
            segments,
            recovered: false,
            closed: false,
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn hasher(&self) -> &KeyHasher {
        &self.hasher
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segment owning keys with this hash, taken from the upper half so it
    /// is independent of the home slot.
    pub fn segment_for(&self, hash: u64) -> usize {
        ((hash >> 32) as usize) & (self.segments.len() - 1)
    }

    /// Sum of per-segment counters, sampled without a global lock.
    pub fn len(&self) -> u64 {
        self.segments
            .iter()
            .map(|state| state.len.load(Ordering::Relaxed))
            .sum()
    }

    /// Runs `f` over a read view of segment `index` under its shared lock.
    pub fn with_read<R>(&self, index: usize, f: impl FnOnce(Segment<'_>, &SegmentEntry) -> R) -> R {
        let entry = self.segments[index].entry.read();
        // SAFETY: the shared lock excludes writers of this segment's ranges.
        let (slots, region) = unsafe { self.segment_bytes(&*entry) };
        f(Segment::new(&self.layout, slots, region), &*entry)
    }

    /// Runs `f` over a mutable view of segment `index` under its exclusive
    /// lock, then publishes the updated table row and counter.
    pub fn with_write<R>(&self, index: usize, f: impl FnOnce(&mut SegmentMut<'_>) -> R) -> R {
        let state = &self.segments[index];
        let mut entry = state.entry.write();
        let planned = *entry;
        // SAFETY: the exclusive lock makes these the only live slices over
        // this segment's ranges.
        let (slots, region) = unsafe { self.segment_bytes_mut(&planned) };
        let result = {
            let mut segment = SegmentMut::new(index, &self.layout, slots, region, &mut *entry);
            f(&mut segment)
        };
        let row = self.header.segment_entry_offset(index);
        // SAFETY: table rows are disjoint and this one belongs to the locked
        // segment.
        unsafe { self.bytes_mut(row, SegmentEntry::SIZE) }.copy_from_slice(&entry.serialize());
        state.len.store(entry.count, Ordering::Relaxed);
        result
    }

    /// Writes dirty pages back to the file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    pub fn info(&self) -> OptMapInfo {
        let segments: Vec<SegmentInfo> = (0..self.segments.len())
            .map(|index| {
                self.with_read(index, |segment, entry| SegmentInfo {
                    count: entry.count,
                    tombstones: entry.tombstones,
                    free_bytes: segment.free_bytes(entry.free_list_head),
                })
            })
            .collect();
        let header = &self.header;
        OptMapInfo {
            file_length: header.file_length,
            entry_count: segments.iter().map(|segment| segment.count).sum(),
            capacity: header.entries,
            segment_count: self.segments.len(),
            slots_per_segment: header.slots_per_segment,
            slot_size: header.slot_size,
            max_key_bytes: header.max_key_bytes,
            max_value_bytes: header.max_value_bytes,
            value_region_size: header.value_region_size,
            max_load: header.max_load,
            put_returns_null: header.put_returns_null,
            recovered: self.recovered,
            hash: self.hasher.config(),
            segments,
        }
    }

    /// Flushes, marks the file clean and releases the lock.
    ///
    /// Later calls are no-ops.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.mmap.flush()?;
        self.header.clean = true;
        self.write_header();
        self.mmap.flush_range(0, Header::SIZE)?;
        fs2::FileExt::unlock(&self.file)?;
        debug!(path = %self.path.display(), entries = self.len(), "closed store");
        Ok(())
    }

    fn write_header(&mut self) {
        let bytes = self.header.serialize();
        // SAFETY: `&mut self` rules out every other view of the mapping.
        unsafe { self.bytes_mut(0, Header::SIZE) }.copy_from_slice(&bytes);
    }

    /// # Safety
    ///
    /// The caller must hold a lock on the segment owning `entry`.
    unsafe fn segment_bytes(&self, entry: &SegmentEntry) -> (&[u8], &[u8]) {
        let slots = self.layout.slot_array_bytes() as usize;
        let region = entry.value_region_size as usize;
        // SAFETY: forwarded to the caller; the offsets were validated against
        // the mapping length on create/open.
        unsafe {
            (
                self.bytes(entry.slot_array_offset, slots),
                self.bytes(entry.value_region_offset, region),
            )
        }
    }

    /// # Safety
    ///
    /// The caller must hold the exclusive lock on the segment owning `entry`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn segment_bytes_mut(&self, entry: &SegmentEntry) -> (&mut [u8], &mut [u8]) {
        let slots = self.layout.slot_array_bytes() as usize;
        let region = entry.value_region_size as usize;
        // SAFETY: forwarded to the caller; the two ranges never overlap.
        unsafe {
            (
                self.bytes_mut(entry.slot_array_offset, slots),
                self.bytes_mut(entry.value_region_offset, region),
            )
        }
    }

    /// # Safety
    ///
    /// `offset..offset + len` must lie inside the mapping with no concurrent
    /// writer.
    unsafe fn bytes(&self, offset: u64, len: usize) -> &[u8] {
        debug_assert!(offset as usize + len <= self.mmap.len());
        unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(offset as usize), len) }
    }

    /// # Safety
    ///
    /// `offset..offset + len` must lie inside the mapping with no other live
    /// slice over it.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        debug_assert!(offset as usize + len <= self.mmap.len());
        unsafe { std::slice::from_raw_parts_mut(self.mmap.as_mut_ptr().add(offset as usize), len) }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(path = %self.path.display(), %err, "failed to close store cleanly");
        }
    }
}

fn lock(file: &File, path: &Path) -> Result<()> {
    match fs2::FileExt::try_lock_exclusive(file) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(Error::AlreadyOpen(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}
