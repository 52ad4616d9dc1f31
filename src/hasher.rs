use std::hash::BuildHasher;

use foldhash::fast::FixedState;
use serde::{Deserialize, Serialize};

/// Description of the hash function recorded for a store file.
///
/// The algorithm is pinned by the file format version; only the seed varies
/// between files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HashConfig {
    /// Name of hash function used.
    pub name: String,
    /// Seed mixed into every key hash.
    pub seed: u64,
}

impl Default for HashConfig {
    fn default() -> Self {
        HashConfig {
            name: KeyHasher::NAME.to_string(),
            seed: 0,
        }
    }
}

/// Seeded 64-bit hasher applied to encoded key bytes.
#[derive(Debug, Clone, Copy)]
pub struct KeyHasher {
    seed: u64,
    state: FixedState,
}

impl KeyHasher {
    pub const NAME: &'static str = "foldhash";

    pub fn with_seed(seed: u64) -> Self {
        KeyHasher {
            seed,
            state: FixedState::with_seed(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn config(&self) -> HashConfig {
        HashConfig {
            name: Self::NAME.to_string(),
            seed: self.seed,
        }
    }

    /// Hashes raw key bytes.
    pub fn hash(&self, key: &[u8]) -> u64 {
        self.state.hash_one(key)
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::with_seed(0)
    }
}
