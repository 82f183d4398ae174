//! Persistent cache of discovered characteristic value handles.
//!
//! A cache entry is an opaque blob stored per bonded device and cache slot:
//!
//! | Offset | Size  | Field                                    |
//! |--------|-------|------------------------------------------|
//! | 0      | 4     | Request hash (LE)                        |
//! | 4      | 1     | Characteristic count `N`                 |
//! | 5      | 3     | Reserved (0)                             |
//! | 8      | 2 * N | Value handles (LE), 0 if not supported   |
//!
//! The request hash covers the server's database hash and the connection
//! parameters, so an entry is only used when the server layout and the
//! requested service instance are unchanged.

use std::collections::BTreeMap;
use std::fmt::Debug;

use parking_lot::Mutex;
use structbuf::{Pack, StructBuf, Unpacker};

use crate::att::{self, Handle, HandleRange};
use crate::gap::{Uuid, UuidPacker};

use super::MAX_CHARS;

/// Size of the blob header.
const HDR_LEN: usize = 8;

/// Error type returned by the cache blob codec.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("too many characteristics: {0}")]
    TooMany(usize),
    #[error("truncated blob ({0} bytes)")]
    Truncated(usize),
    #[error("blob length does not match characteristic count {0}")]
    Length(u8),
}

/// Common cache result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage location of a cache entry.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CacheKey {
    /// Index of the bonded device, as assigned by the security database.
    pub device: u16,
    /// Application-defined slot, usually one per service client.
    pub slot: u16,
}

/// Cache parameters supplied with a connection request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheTag {
    pub device: u16,
    pub slot: u16,
    /// Database Hash characteristic value read from the server
    /// ([Vol 3] Part G, Section 7.3).
    pub db_hash: u128,
}

impl CacheTag {
    /// Creates a new cache tag.
    #[inline]
    #[must_use]
    pub const fn new(device: u16, slot: u16, db_hash: u128) -> Self {
        Self {
            device,
            slot,
            db_hash,
        }
    }

    /// Returns the storage location of the entry.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> CacheKey {
        CacheKey {
            device: self.device,
            slot: self.slot,
        }
    }
}

/// Persistent storage of cache blobs for bonded devices.
pub trait CacheStore: Debug {
    /// Saves a cache entry, replacing any existing one. Returns `false` if the
    /// entry could not be saved.
    fn save(&self, key: CacheKey, blob: &[u8]) -> bool;
    /// Loads a cache entry.
    fn load(&self, key: CacheKey) -> Option<Vec<u8>>;
    /// Removes all entries of a device. This must be called when the bond is
    /// deleted.
    fn remove_device(&self, device: u16);
    /// Removes all entries.
    fn clear(&self);
}

/// In-memory cache store.
#[derive(Debug, Default)]
pub struct MemStore(Mutex<BTreeMap<CacheKey, Vec<u8>>>);

impl MemStore {
    /// Creates an empty store.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Returns whether the store is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl CacheStore for MemStore {
    fn save(&self, key: CacheKey, blob: &[u8]) -> bool {
        self.0.lock().insert(key, blob.to_vec());
        true
    }

    fn load(&self, key: CacheKey) -> Option<Vec<u8>> {
        self.0.lock().get(&key).cloned()
    }

    fn remove_device(&self, device: u16) {
        self.0.lock().retain(|k, _| k.device != device);
    }

    fn clear(&self) {
        self.0.lock().clear();
    }
}

impl<S: CacheStore> CacheStore for std::sync::Arc<S> {
    #[inline(always)]
    fn save(&self, key: CacheKey, blob: &[u8]) -> bool {
        S::save(self, key, blob)
    }

    #[inline(always)]
    fn load(&self, key: CacheKey) -> Option<Vec<u8>> {
        S::load(self, key)
    }

    #[inline(always)]
    fn remove_device(&self, device: u16) {
        S::remove_device(self, device);
    }

    #[inline(always)]
    fn clear(&self) {
        S::clear(self);
    }
}

/// Computes the request hash identifying a handle layout. `range` is the
/// handle range searched for the service, which is the full range for primary
/// services.
#[must_use]
pub fn request_hash(db_hash: u128, n: usize, service: Uuid, index: u8, range: HandleRange) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let n = n.min(MAX_CHARS) as u8;
    let mut b = StructBuf::new(16 + 1 + 16 + 1 + 2 + 2);
    b.append()
        .u128(db_hash)
        .u8(n)
        .uuid(service)
        .u8(index)
        .u16(range.start())
        .u16(range.end());
    let h = blake3::hash(b.as_ref());
    Unpacker::new(&h.as_bytes()[..4]).u32()
}

/// Encodes a cache blob.
pub fn encode(hash: u32, handles: &[Option<Handle>]) -> Result<StructBuf> {
    let n = u8::try_from(handles.len()).map_err(|_| Error::TooMany(handles.len()))?;
    let mut b = StructBuf::new(HDR_LEN + 2 * handles.len());
    let mut p = b.append();
    p.u32(hash).u8(n).put([0_u8; 3]);
    for &h in handles {
        p.u16(att::raw_handle(h));
    }
    Ok(b)
}

/// Decodes a cache blob into its request hash and value handles.
pub fn decode(blob: &[u8]) -> Result<(u32, Vec<Option<Handle>>)> {
    if blob.len() < HDR_LEN {
        return Err(Error::Truncated(blob.len()));
    }
    let (hdr, tail) = blob.split_at(HDR_LEN);
    let mut p = Unpacker::new(hdr);
    let (hash, n) = (p.u32(), p.u8());
    if tail.len() != 2 * usize::from(n) {
        return Err(Error::Length(n));
    }
    let mut p = Unpacker::new(tail);
    let handles = (0..n).map(|_| Handle::new(p.u16())).collect();
    Ok((hash, handles))
}
