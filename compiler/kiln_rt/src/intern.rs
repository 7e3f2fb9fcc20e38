//! Sharded string interner for attribute, global, and local names.
//!
//! Names are compared by index everywhere in the runtime and the JIT. The
//! interner is process-global so that `Name`s can cross compile-worker
//! threads and be rendered without threading an interner handle through
//! every pass.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

const NUM_SHARDS: usize = 16;
const SHARD_BITS: u32 = 4;

/// An interned string.
///
/// Packs the shard index into the low bits and the shard-local index into
/// the rest.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Name(u32);

impl Name {
    /// The empty string, pre-interned in shard 0.
    pub const EMPTY: Name = Name(0);

    /// Intern `s`.
    pub fn new(s: &str) -> Name {
        interner().intern(s)
    }

    #[inline]
    fn from_parts(shard: u32, local: u32) -> Name {
        Name((local << SHARD_BITS) | shard)
    }

    #[inline]
    fn shard(self) -> usize {
        (self.0 & ((1 << SHARD_BITS) - 1)) as usize
    }

    #[inline]
    fn local(self) -> usize {
        (self.0 >> SHARD_BITS) as usize
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The interned text.
    pub fn as_str(self) -> &'static str {
        interner().lookup(self)
    }
}

impl Default for Name {
    fn default() -> Self {
        Name::EMPTY
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Name::new(s)
    }
}

/// Per-shard storage for interned strings.
struct InternShard {
    map: FxHashMap<&'static str, u32>,
    strings: Vec<&'static str>,
}

impl InternShard {
    fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            strings: Vec::with_capacity(64),
        }
    }

    fn with_empty() -> Self {
        let mut shard = Self::new();
        shard.map.insert("", 0);
        shard.strings.push("");
        shard
    }
}

/// Sharded string interner for concurrent access.
///
/// # Thread Safety
/// Uses `RwLock` per shard; compile workers intern concurrently with the
/// runtime thread.
pub struct StringInterner {
    shards: [RwLock<InternShard>; NUM_SHARDS],
    total_count: AtomicUsize,
}

impl StringInterner {
    fn new() -> Self {
        let shards = std::array::from_fn(|i| {
            if i == 0 {
                RwLock::new(InternShard::with_empty())
            } else {
                RwLock::new(InternShard::new())
            }
        });
        Self {
            shards,
            total_count: AtomicUsize::new(1),
        }
    }

    #[inline]
    fn shard_for(s: &str) -> usize {
        let mut hash = 0u32;
        for byte in s.bytes().take(8) {
            hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
        }
        (hash as usize) % NUM_SHARDS
    }

    fn intern(&self, s: &str) -> Name {
        let shard_idx = Self::shard_for(s);
        let shard = &self.shards[shard_idx];
        let shard_u32 = shard_idx as u32;

        {
            let guard = shard.read();
            if let Some(&local) = guard.map.get(s) {
                return Name::from_parts(shard_u32, local);
            }
        }

        let mut guard = shard.write();
        if let Some(&local) = guard.map.get(s) {
            return Name::from_parts(shard_u32, local);
        }

        // Interned names live for the whole process.
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        let local = u32::try_from(guard.strings.len())
            .ok()
            .filter(|&n| n < (u32::MAX >> SHARD_BITS))
            .unwrap_or_else(|| panic!("interner shard {shard_idx} exceeded capacity"));
        guard.strings.push(leaked);
        guard.map.insert(leaked, local);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        Name::from_parts(shard_u32, local)
    }

    fn lookup(&self, name: Name) -> &'static str {
        let guard = self.shards[name.shard()].read();
        guard.strings.get(name.local()).copied().unwrap_or("")
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.total_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide interner.
pub fn interner() -> &'static StringInterner {
    static INTERNER: OnceLock<StringInterner> = OnceLock::new();
    INTERNER.get_or_init(StringInterner::new)
}

#[cfg(test)]
mod tests;
