use std::path::Path;

use crate::store::Store;
use crate::{Error, OptMapInfo, Result};

/// Persistent hash map of byte keys to byte values backed by a memory-mapped
/// file.
///
/// Keys are sharded over segments by hash; each segment has its own
/// read-write lock, so operations on different segments never block each
/// other. All methods take `&self` and the map is `Sync`, so it can be shared
/// across threads by reference or through an `Arc`.
///
/// Capacity is fixed when the file is created with
/// [`OptMapBuilder`](crate::OptMapBuilder); there is no rehashing.
pub struct OptMap {
    store: Store,
}

impl OptMap {
    /// Attaches to a store file created by [`OptMapBuilder::create`].
    ///
    /// A file that was not closed cleanly is repaired first: entries whose
    /// slot or value bytes fail validation are dropped.
    ///
    /// [`OptMapBuilder::create`]: crate::OptMapBuilder::create
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupt`] when the header or segment table is
    /// unreadable and [`Error::AlreadyOpen`] when another handle holds the
    /// file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_store(Store::open(path.as_ref())?))
    }

    pub(crate) fn from_store(store: Store) -> Self {
        OptMap { store }
    }

    /// Returns a copy of the value stored for `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_with(key, <[u8]>::to_vec)
    }

    /// Runs `f` over the stored value bytes without copying them.
    ///
    /// The segment's read lock is held while `f` runs, so `f` must not call
    /// back into a writing operation of this map.
    pub fn get_with<R>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let (index, hash) = self.locate(key);
        self.store
            .with_read(index, |segment, _| segment.get(key, hash).map(f))
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let (index, hash) = self.locate(key);
        self.store
            .with_read(index, |segment, _| segment.find(key, hash).is_some())
    }

    /// Inserts or overwrites `key`.
    ///
    /// Returns the replaced value, or `None` for a new key or when the store
    /// was created with `put_returns_null`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] when the key or value is longer
    /// than the store's maximum and [`Error::CapacityExceeded`] when the
    /// key is new and its segment is full.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check(key, value)?;
        let (index, hash) = self.locate(key);
        let want_previous = !self.store.header().put_returns_null;
        self.store.with_write(index, |segment| {
            segment.insert_or_update(key, hash, value, want_previous)
        })
    }

    /// Removes `key` and returns its value.
    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        let (index, hash) = self.locate(key);
        self.store
            .with_write(index, |segment| segment.remove(key, hash))
    }

    /// Replaces the value of `key` with `f(current)` while holding the
    /// segment's write lock.
    ///
    /// Returning `Ok(None)` removes the key. The new value is returned.
    /// An error from `f` leaves the entry untouched.
    pub fn compute<F>(&self, key: &[u8], f: F) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>>,
    {
        self.check(key, &[])?;
        let (index, hash) = self.locate(key);
        let max_value = self.store.layout().max_value_bytes;
        self.store.with_write(index, |segment| {
            let next = f(segment.as_ref().get(key, hash))?;
            match next {
                Some(value) => {
                    if value.len() > max_value {
                        return Err(value_too_long(value.len(), max_value));
                    }
                    segment.insert_or_update(key, hash, &value, false)?;
                    Ok(Some(value))
                }
                None => {
                    segment.remove(key, hash);
                    Ok(None)
                }
            }
        })
    }

    /// Number of entries, summed over segments without a global lock.
    pub fn len(&self) -> u64 {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over all entries segment by segment.
    ///
    /// Each segment is copied under its read lock when the iterator reaches
    /// it; writes to segments not yet visited may or may not be observed.
    pub fn iter(&self) -> OptMapIter<'_> {
        OptMapIter {
            map: self,
            segment: 0,
            current: Vec::new().into_iter(),
        }
    }

    /// Iterates over all keys, with the same consistency as [`iter`](Self::iter).
    pub fn keys(&self) -> OptMapKeys<'_> {
        OptMapKeys { inner: self.iter() }
    }

    pub fn info(&self) -> OptMapInfo {
        self.store.info()
    }

    /// Writes modified pages back to the file without closing it.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Flushes, marks the file as cleanly closed, and releases its lock.
    ///
    /// Dropping the map does the same but can only log a failure.
    pub fn close(mut self) -> Result<()> {
        self.store.shutdown()
    }

    fn locate(&self, key: &[u8]) -> (usize, u64) {
        let hash = self.store.hasher().hash(key);
        (self.store.segment_for(hash), hash)
    }

    fn check(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let layout = self.store.layout();
        if key.len() > layout.max_key_bytes {
            return Err(Error::InvalidArgument(format!(
                "key of {} bytes exceeds the maximum of {}",
                key.len(),
                layout.max_key_bytes
            )));
        }
        if value.len() > layout.max_value_bytes {
            return Err(value_too_long(value.len(), layout.max_value_bytes));
        }
        Ok(())
    }
}

fn value_too_long(len: usize, max: usize) -> Error {
    Error::InvalidArgument(format!("value of {len} bytes exceeds the maximum of {max}"))
}

impl std::fmt::Debug for OptMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptMap")
            .field("len", &self.len())
            .field("segments", &self.store.segment_count())
            .finish()
    }
}

/// Iterator over the entries of an [`OptMap`].
pub struct OptMapIter<'a> {
    map: &'a OptMap,
    segment: usize,
    current: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for OptMapIter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.current.next() {
                return Some(entry);
            }
            let store = &self.map.store;
            if self.segment >= store.segment_count() {
                return None;
            }
            let index = self.segment;
            self.segment += 1;
            let entries = store.with_read(index, |segment, entry| {
                let mut entries = Vec::with_capacity(entry.count as usize);
                segment.for_each(|key, value| entries.push((key.to_vec(), value.to_vec())));
                entries
            });
            self.current = entries.into_iter();
        }
    }
}

/// Iterator over the keys of an [`OptMap`].
pub struct OptMapKeys<'a> {
    inner: OptMapIter<'a>,
}

impl Iterator for OptMapKeys<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::NaiveDate;
    use rand::Rng;

    use super::*;
    use crate::meta::Header;
    use crate::{OptMapBuilder, OptionSymbol, OptionType};

    fn create(path: &Path, entries: u64) -> OptMap {
        create_sized(path, entries, 8)
    }

    fn create_sized(path: &Path, entries: u64, avg_value_bytes: u32) -> OptMap {
        OptMapBuilder::default()
            .with_entries(entries)
            .with_average_key_bytes(8)
            .with_average_value_bytes(avg_value_bytes)
            .create(path)
            .unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let map = create(&dir.path().join("map.osym"), 1000);
        assert!(map.is_empty());
        for i in 0..1000 {
            let previous = map
                .put(format!("SYM{i}").as_bytes(), format!("VAL{i}").as_bytes())
                .unwrap();
            assert_eq!(previous, None);
        }
        assert_eq!(map.len(), 1000);
        assert_eq!(map.get(b"SYM500"), Some(b"VAL500".to_vec()));
        assert_eq!(map.get(b"SYM1000"), None);
        assert!(map.contains_key(b"SYM999"));
        assert!(!map.contains_key(b"SYM-1"));
        assert_eq!(map.get_with(b"SYM7", |value| value.len()), Some(4));
    }

    #[test]
    fn test_update_symbol_price() {
        let dir = tempfile::tempdir().unwrap();
        let map = create(&dir.path().join("map.osym"), 100);
        let symbol = OptionSymbol::with_strike(
            "AAPL",
            OptionType::Call,
            NaiveDate::from_ymd_opt(2025, 1, 17).unwrap(),
            100.0,
        )
        .unwrap();
        let key = symbol.encode_fixed();

        assert_eq!(map.put(&key, &1.5f64.to_le_bytes()).unwrap(), None);
        let previous = map.put(&key, &2.5f64.to_le_bytes()).unwrap();
        assert_eq!(previous, Some(1.5f64.to_le_bytes().to_vec()));
        assert_eq!(map.get(&key), Some(2.5f64.to_le_bytes().to_vec()));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_and_reinsert() {
        let dir = tempfile::tempdir().unwrap();
        let map = create(&dir.path().join("map.osym"), 100);
        for i in 0..50 {
            map.put(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        assert_eq!(map.remove(b"k10"), Some(b"v".to_vec()));
        assert_eq!(map.get(b"k10"), None);
        assert_eq!(map.remove(b"k10"), None);
        assert_eq!(map.len(), 49);
        map.put(b"k10", b"again").unwrap();
        assert_eq!(map.len(), 50);
        assert_eq!(map.get(b"k10"), Some(b"again".to_vec()));
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.osym");
        let map = create_sized(&path, 1000, 32);
        for i in 0..300 {
            map.put(format!("SYM{i}").as_bytes(), format!("VAL{i}").repeat(i % 7 + 1).as_bytes())
                .unwrap();
        }
        map.close().unwrap();

        let map = OptMap::open(&path).unwrap();
        assert_eq!(map.len(), 300);
        for i in 0..300 {
            assert_eq!(
                map.get(format!("SYM{i}").as_bytes()),
                Some(format!("VAL{i}").repeat(i % 7 + 1).into_bytes())
            );
        }
        assert!(!map.info().recovered);
        map.put(b"SYM300", b"VAL300").unwrap();
        drop(map);

        let map = OptMap::open(&path).unwrap();
        assert_eq!(map.len(), 301);
    }

    #[test]
    fn test_put_returns_null() {
        let dir = tempfile::tempdir().unwrap();
        let map = OptMapBuilder::default()
            .with_entries(10)
            .with_put_returns_null(true)
            .create(dir.path().join("map.osym"))
            .unwrap();
        map.put(b"a", b"1").unwrap();
        assert_eq!(map.put(b"a", b"2").unwrap(), None);
        assert_eq!(map.get(b"a"), Some(b"2".to_vec()));
        assert!(map.info().put_returns_null);
    }

    #[test]
    fn test_oversized_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let map = OptMapBuilder::default()
            .with_entries(10)
            .with_max_key_bytes(32)
            .with_max_value_bytes(64)
            .create(dir.path().join("map.osym"))
            .unwrap();
        map.put(&[1u8; 32], &[2u8; 64]).unwrap();
        assert!(matches!(map.put(&[1u8; 33], b"v"), Err(Error::InvalidArgument(_))));
        assert!(matches!(map.put(b"k", &[2u8; 65]), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            map.compute(b"k", |_| Ok(Some(vec![0u8; 65]))),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(map.get(&[1u8; 33]), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_capacity_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let map = OptMapBuilder::default()
            .with_entries(8)
            .with_segments(1)
            .create(dir.path().join("map.osym"))
            .unwrap();
        let limit = map.info().slots_per_segment as f64 * 0.75;
        let mut inserted = 0u64;
        let err = loop {
            match map.put(&inserted.to_le_bytes(), b"v") {
                Ok(_) => inserted += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, Error::CapacityExceeded { segment: 0 }));
        assert_eq!(inserted, limit as u64);
        assert_eq!(map.len(), inserted);
        // Existing keys still update.
        map.put(&0u64.to_le_bytes(), b"w").unwrap();
    }

    #[test]
    fn test_grow_value_in_full_region() {
        let dir = tempfile::tempdir().unwrap();
        let map = OptMapBuilder::default()
            .with_entries(10)
            .with_segments(1)
            .create(dir.path().join("map.osym"))
            .unwrap();
        let info = map.info();
        assert_eq!(info.max_value_bytes, 4096);
        assert_eq!(info.value_region_size, 4176);

        map.put(b"k", &[1; 3000]).unwrap();
        map.put(b"k", &[2; 3500]).unwrap();
        assert_eq!(map.get(b"k"), Some(vec![2; 3500]));
        map.put(b"k", &[3; 4096]).unwrap();
        assert_eq!(map.get(b"k"), Some(vec![3; 4096]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_compute() {
        let dir = tempfile::tempdir().unwrap();
        let map = create(&dir.path().join("map.osym"), 100);
        let increment = |current: Option<&[u8]>| {
            let n = current.map_or(0, |bytes| u64::from_le_bytes(bytes.try_into().unwrap()));
            Ok(Some((n + 1).to_le_bytes().to_vec()))
        };
        map.compute(b"n", increment).unwrap();
        let value = map.compute(b"n", increment).unwrap();
        assert_eq!(value, Some(2u64.to_le_bytes().to_vec()));

        let err = map.compute(b"n", |_| Err(Error::InvalidArgument("nope".into())));
        assert!(err.is_err());
        assert_eq!(map.get(b"n"), Some(2u64.to_le_bytes().to_vec()));

        assert_eq!(map.compute(b"n", |_| Ok(None)).unwrap(), None);
        assert!(!map.contains_key(b"n"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_iter_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let map = create_sized(&dir.path().join("map.osym"), 2000, 24);
        let mut expected = HashMap::new();
        for i in 0..1500u32 {
            let key = format!("key{i}").into_bytes();
            let value = vec![i as u8; (i % 40) as usize];
            map.put(&key, &value).unwrap();
            expected.insert(key, value);
        }
        for i in (0..1500u32).step_by(3) {
            expected.remove(format!("key{i}").as_bytes());
            map.remove(format!("key{i}").as_bytes());
        }
        let actual: HashMap<_, _> = map.iter().collect();
        assert_eq!(actual, expected);
        assert_eq!(map.keys().count() as u64, map.len());
    }

    #[test]
    fn test_concurrent_get_put() {
        let dir = tempfile::tempdir().unwrap();
        let map = create(&dir.path().join("map.osym"), 20_000);
        let keys = 10_000;
        for i in 0..keys {
            map.put(format!("SYM{i}").as_bytes(), format!("VALUE{i}").as_bytes())
                .unwrap();
        }

        std::thread::scope(|scope| {
            for worker in 0..10 {
                let map = &map;
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..10_000 {
                        let i = rng.gen_range(0..keys);
                        let key = format!("SYM{i}");
                        if rng.r#gen::<bool>() {
                            let value = map.get(key.as_bytes()).unwrap();
                            let text = String::from_utf8(value).unwrap();
                            assert!(text.starts_with(&format!("VALUE{i}")), "{text}");
                        } else {
                            let value = format!("VALUE{i}-{worker}");
                            map.put(key.as_bytes(), value.as_bytes()).unwrap();
                        }
                    }
                });
            }
        });
        assert_eq!(map.len(), keys);
    }

    #[test]
    fn test_concurrent_compute() {
        let dir = tempfile::tempdir().unwrap();
        let map = create(&dir.path().join("map.osym"), 100);
        let calls = AtomicU64::new(0);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        map.compute(b"counter", |current| {
                            calls.fetch_add(1, Ordering::Relaxed);
                            let n = current
                                .map_or(0, |bytes| u64::from_le_bytes(bytes.try_into().unwrap()));
                            Ok(Some((n + 1).to_le_bytes().to_vec()))
                        })
                        .unwrap();
                    }
                });
            }
        });
        assert_eq!(calls.load(Ordering::Relaxed), 4000);
        assert_eq!(map.get(b"counter"), Some(4000u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn test_recovery_never_returns_torn_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.osym");
        let map = OptMapBuilder::default()
            .with_entries(500)
            .with_average_key_bytes(8)
            .with_average_value_bytes(48)
            .with_segments(2)
            .create(&path)
            .unwrap();
        let value = |i: u32| format!("value-{i}-").repeat(4).into_bytes();
        for i in 0..400u32 {
            map.put(format!("k{i}").as_bytes(), &value(i)).unwrap();
        }
        map.close().unwrap();

        // Simulate a crash: clear the clean flag and scribble over the
        // value regions.
        let mut bytes = std::fs::read(&path).unwrap();
        let header = Header::deserialize(&bytes).unwrap();
        let mut rng = rand::thread_rng();
        for index in 0..header.segment_count as usize {
            let entry = header.planned_entry(index);
            let start = entry.value_region_offset as usize;
            for _ in 0..20 {
                let at = start + rng.gen_range(0..entry.value_region_size as usize);
                bytes[at] = rng.r#gen();
            }
        }
        bytes[12] = 0;
        let crc = crc32fast::hash(&bytes[..Header::SIZE - 4]);
        bytes[Header::SIZE - 4..Header::SIZE].copy_from_slice(&crc.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let map = OptMap::open(&path).unwrap();
        assert!(map.info().recovered);
        let mut visible = 0;
        for i in 0..400u32 {
            if let Some(got) = map.get(format!("k{i}").as_bytes()) {
                assert_eq!(got, value(i));
                visible += 1;
            }
        }
        assert_eq!(visible, map.len());
        assert!(visible >= 400 - 40);

        // Freed space is usable again.
        for i in 0..400u32 {
            map.put(format!("k{i}").as_bytes(), &value(i)).unwrap();
        }
        assert_eq!(map.len(), 400);
    }
}
