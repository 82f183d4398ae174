//! File system storage backend for the GATT service client cache.

#![warn(missing_debug_implementations)]
#![warn(unused_crate_dependencies)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]

use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::{fs, io};

use tracing::{debug, error};

use gattsc::gatt::client::cache::{CacheKey, CacheStore};

/// Cache entries of one device, keyed by slot.
type Slots = BTreeMap<u16, Vec<u8>>;

/// Service client cache stored in a file system directory. Each bonded device
/// has one file containing the entries of all of its slots.
#[derive(Clone, Debug)]
pub struct FileStore(Dir);

impl FileStore {
    const NAME: &'static str = "gattc";

    /// Creates or opens a cache store in the specified root directory.
    #[inline(always)]
    #[must_use]
    pub fn open(root: impl AsRef<Path>) -> Self {
        Self(Dir(root.as_ref().join(Self::NAME)))
    }

    /// Creates or opens a cache store in the current user's local data
    /// directory.
    ///
    /// # Panics
    ///
    /// Panics if it cannot determine the user directory.
    #[must_use]
    pub fn per_user(app: impl AsRef<Path>) -> Self {
        let dir = dirs::data_local_dir()
            .expect("user directory not available")
            .join(app.as_ref());
        Self::open(dir)
    }
}

impl CacheStore for FileStore {
    fn save(&self, key: CacheKey, blob: &[u8]) -> bool {
        let mut slots = self.0.load(key.device).unwrap_or_default();
        slots.insert(key.slot, blob.to_vec());
        self.0.save(key.device, &slots)
    }

    fn load(&self, key: CacheKey) -> Option<Vec<u8>> {
        self.0.load(key.device)?.remove(&key.slot)
    }

    #[inline(always)]
    fn remove_device(&self, device: u16) {
        self.0.remove(device);
    }

    #[inline(always)]
    fn clear(&self) {
        self.0.clear();
    }
}

/// Database in a file system directory.
#[derive(Clone, Debug)]
#[repr(transparent)]
struct Dir(PathBuf);

impl Dir {
    const FILE_NAME_FMT: &'static str = "D-0000";

    /// Saves device entries to the file system.
    fn save(&self, device: u16, v: &Slots) -> bool {
        let s = serde_json::to_string_pretty(v).expect("failed to serialize cache entries");
        if let Err(e) = fs::create_dir_all(&self.0) {
            error!("Failed to create cache directory: {} ({e})", self.0.display());
            return false;
        }
        let path = self.path(device);
        match fs::File::create(&path)
            .and_then(|mut f| f.write_all(s.as_bytes()).and_then(|_| f.sync_data()))
        {
            Ok(_) => {
                debug!("Wrote: {}", path.display());
                true
            }
            Err(e) => {
                error!("Failed to write: {} ({e})", path.display());
                false
            }
        }
    }

    /// Loads device entries from the file system.
    fn load(&self, device: u16) -> Option<Slots> {
        let path = self.path(device);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => return None,
            Err(e) => {
                error!("Failed to read: {} ({e})", path.display());
                return None;
            }
        };
        serde_json::from_str(&s)
            .map_err(|e| error!("Invalid file contents: {} ({e})", path.display()))
            .ok()
    }

    /// Removes device entries from the file system.
    fn remove(&self, device: u16) {
        let path = self.path(device);
        match fs::remove_file(&path) {
            Ok(_) => debug!("Removed: {}", path.display()),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", path.display()),
        }
    }

    /// Removes all entries from the file system.
    fn clear(&self) {
        match fs::remove_dir_all(&self.0) {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => {}
            Err(e) => error!("Failed to remove: {} ({e})", self.0.display()),
        }
    }

    /// Returns the file path for the specified device index.
    fn path(&self, device: u16) -> PathBuf {
        let mut buf = Cursor::new([0_u8; Self::FILE_NAME_FMT.len()]);
        write!(buf, "D-{device:04X}").expect("cache file name overflow");
        // SAFETY: `buf` contains a valid UTF-8 string
        (self.0).join(unsafe { std::str::from_utf8_unchecked(buf.get_ref()) })
    }
}
