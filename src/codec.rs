//! Typed views over the byte-level [`OptMap`].

use std::marker::PhantomData;
use std::path::Path;

use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, OptMap, OptMapInfo, OptionSymbol, Result};

/// Conversion between a Rust value and the bytes stored in a map.
pub trait Codec: Sized {
    /// Appends the encoded form of `self` to `buf`.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Decodes a value previously produced by [`encode`](Self::encode).
    fn decode(bytes: &[u8]) -> Result<Self>;

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

fn wrong_length(what: &str, expected: usize, actual: usize) -> Error {
    Error::Corrupt(format!("{what} needs {expected} bytes, found {actual}"))
}

macro_rules! impl_le_codec {
    ($($ty:ty),*) => {
        $(
            impl Codec for $ty {
                fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
                    buf.extend_from_slice(&self.to_le_bytes());
                    Ok(())
                }

                fn decode(bytes: &[u8]) -> Result<Self> {
                    let array: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                        wrong_length(stringify!($ty), std::mem::size_of::<$ty>(), bytes.len())
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }
            }
        )*
    };
}

// Floats are stored as little-endian IEEE-754.
impl_le_codec!(f64, u64, i64);

impl Codec for String {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Corrupt(format!("stored string is not UTF-8: {e}")))
    }
}

impl Codec for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bytes.to_vec())
    }
}

impl Codec for OptionSymbol {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.encode_fixed());
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::FIXED_SIZE {
            return Err(wrong_length("option symbol", Self::FIXED_SIZE, bytes.len()));
        }
        OptionSymbol::decode_fixed(bytes)
    }
}

/// Stores any serde type as MessagePack.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsgPack<T>(pub T);

impl<T: Serialize + DeserializeOwned> Codec for MsgPack<T> {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        rmp_serde::encode::write(buf, &self.0)
            .map_err(|e| Error::InvalidArgument(format!("failed to serialize value: {e}")))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map(MsgPack)
            .map_err(|e| Error::Corrupt(format!("failed to deserialize value: {e}")))
    }
}

/// [`OptMap`] with keys and values converted through [`Codec`].
///
/// # Examples
///
/// ```
/// use chrono::NaiveDate;
/// use optmap::{OptMapBuilder, OptionSymbol, OptionType, TypedMap};
///
/// # fn main() -> optmap::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let prices: TypedMap<OptionSymbol, f64> = OptMapBuilder::default()
///     .with_entries(1000)
///     .create_typed(dir.path().join("prices.osym"))?;
///
/// let expiry = NaiveDate::from_ymd_opt(2025, 1, 17).unwrap();
/// let call = OptionSymbol::with_strike("AAPL", OptionType::Call, expiry, 100.0)?;
/// prices.put(&call, &1.5)?;
/// prices.put(&call, &2.5)?;
/// assert_eq!(prices.get(&call)?, Some(2.5));
/// # Ok(())
/// # }
/// ```
pub struct TypedMap<K, V> {
    map: OptMap,
    phantom: PhantomData<fn() -> (K, V)>,
}

impl<K: Codec, V: Codec> TypedMap<K, V> {
    pub fn new(map: OptMap) -> Self {
        TypedMap {
            map,
            phantom: PhantomData,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(OptMap::open(path)?))
    }

    /// Decodes the stored value while the segment's read lock is held.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key = key.to_bytes()?;
        self.map.get_with(&key, V::decode).transpose()
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.map.contains_key(&key.to_bytes()?))
    }

    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let previous = self.map.put(&key.to_bytes()?, &value.to_bytes()?)?;
        previous.as_deref().map(V::decode).transpose()
    }

    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let previous = self.map.remove(&key.to_bytes()?);
        previous.as_deref().map(V::decode).transpose()
    }

    /// Typed form of [`OptMap::compute`]; `None` from `f` removes the key.
    pub fn compute<F>(&self, key: &K, f: F) -> Result<Option<V>>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let mut next = None;
        self.map.compute(&key.to_bytes()?, |current| {
            let current = current.map(V::decode).transpose()?;
            next = f(current);
            next.as_ref().map(V::to_bytes).transpose()
        })?;
        Ok(next)
    }

    pub fn len(&self) -> u64 {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Decoded entries, with the consistency of [`OptMap::iter`].
    pub fn iter(&self) -> impl Iterator<Item = Result<(K, V)>> + '_ {
        self.map
            .iter()
            .map(|(key, value)| -> Result<(K, V)> { Ok((K::decode(&key)?, V::decode(&value)?)) })
    }

    pub fn keys(&self) -> impl Iterator<Item = Result<K>> + '_ {
        self.map.keys().map(|key| K::decode(&key))
    }

    pub fn info(&self) -> OptMapInfo {
        self.map.info()
    }

    pub fn flush(&self) -> Result<()> {
        self.map.flush()
    }

    pub fn close(self) -> Result<()> {
        self.map.close()
    }

    /// Byte-level map underneath this view.
    pub fn as_raw(&self) -> &OptMap {
        &self.map
    }

    pub fn into_inner(self) -> OptMap {
        self.map
    }
}

impl<K, V> std::fmt::Debug for TypedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TypedMap").field(&self.map).finish()
    }
}
