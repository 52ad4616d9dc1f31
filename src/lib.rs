//! Persistent, memory-mapped hash maps keyed by option-contract symbols.
//!
//! The `optmap` crate stores a fixed-capacity open-addressed hash table in a
//! single file that is mapped into memory. The table is split into segments,
//! each guarded by its own read-write lock, so readers and writers on
//! different segments proceed in parallel. Values shorter than a slot's
//! inline budget live in the slot itself; longer ones go to a per-segment
//! arena with a first-fit free list.
//!
//! A file that was not closed cleanly is checked on the next open: entries
//! whose bytes fail validation are dropped and every segment's free list is
//! rebuilt, so lookups never return torn values.
//!
//! [`OptionSymbol`] provides the OCC text form and a 17-byte binary key, and
//! [`TypedMap`] layers [`Codec`] conversions over the byte-level [`OptMap`].
//!
//! ```
//! use optmap::{OptMap, OptMapBuilder};
//!
//! # fn main() -> optmap::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("symbols.osym");
//!
//! let map = OptMapBuilder::default()
//!     .with_entries(1000)
//!     .with_average_key_bytes(8)
//!     .create(&path)?;
//! map.put(b"SYM500", b"VAL500")?;
//! map.close()?;
//!
//! let map = OptMap::open(&path)?;
//! assert_eq!(map.get(b"SYM500"), Some(b"VAL500".to_vec()));
//! assert_eq!(map.len(), 1);
//! # Ok(())
//! # }
//! ```
const MAGIC: [u8; 8] = *b"OSYMv001";
const VERSION: u32 = 1;

mod error;
pub use error::{Error, Result};

mod hasher;
pub use hasher::{HashConfig, KeyHasher};

mod symbol;
pub use symbol::{OptionSymbol, OptionType};

mod meta;
pub use meta::{Header, OptMapInfo, SegmentInfo};

mod arena;
mod segment;
mod store;

mod map;
pub use map::{OptMap, OptMapIter, OptMapKeys};

mod codec;
pub use codec::{Codec, MsgPack, TypedMap};

mod builder;
pub use builder::OptMapBuilder;
