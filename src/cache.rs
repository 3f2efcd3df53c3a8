//! Single-slot image cache
//!
//! Holds the last downloaded compressed image. The key is a SHA-256 of the
//! image *filename*, not of its content: filenames carry board, distro,
//! type, variant and release, so one name maps to one image.
//!
//! The slot payload lives at `<cache_dir>/lastdfudownload.cache`; the key and
//! the enabled flag are persisted as JSON next to it.

use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SLOT_FILE: &str = "lastdfudownload.cache";
const SETTINGS_FILE: &str = "dfu-caching.json";

/// SHA-256 of an image filename
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(filename: &str) -> Self {
        Self(Sha256::digest(filename.as_bytes()).into())
    }

    fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// A cache hit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub payload_path: PathBuf,
    pub enabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSettings {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    last_download_sha256: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: enabled_by_default(),
            last_download_sha256: None,
        }
    }
}

struct CacheWriter {
    file: File,
    written: u64,
}

pub struct ImageCache {
    slot: PathBuf,
    settings_path: PathBuf,
    settings: CacheSettings,
    /// Caching for this run; drops to false when the slot misbehaves
    active: bool,
    writer: Option<CacheWriter>,
    /// Appends start failing once this many bytes are in the slot
    #[cfg(test)]
    fail_appends_after: Option<u64>,
}

impl ImageCache {
    /// Open the cache in `dir`, dropping a stored key whose payload is gone
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let settings_path = dir.join(SETTINGS_FILE);
        let settings = load_settings(&settings_path);

        let mut cache = Self {
            slot: dir.join(SLOT_FILE),
            settings_path,
            active: settings.enabled,
            settings,
            writer: None,
            #[cfg(test)]
            fail_appends_after: None,
        };
        if cache.settings.last_download_sha256.is_some()
            && !payload_usable(&cache.slot)
        {
            debug!("Cache payload missing, dropping stored fingerprint");
            cache.invalidate();
        }
        debug!("DFU cache file: {}", cache.slot.display());
        debug!("DFU caching enabled: {}", cache.active);
        Ok(cache)
    }

    pub fn is_enabled(&self) -> bool {
        self.active
    }

    /// Turn caching off for this run only
    pub fn disable_for_run(&mut self) {
        self.abort();
        self.active = false;
    }

    /// Persist the enabled flag
    pub fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        self.settings.enabled = enabled;
        self.active = enabled;
        self.save()
    }

    pub fn payload_path(&self) -> &Path {
        &self.slot
    }

    pub fn stored_fingerprint(&self) -> Option<Fingerprint> {
        self.settings
            .last_download_sha256
            .as_deref()
            .and_then(Fingerprint::from_hex)
    }

    /// Size of the cached payload, if there is a usable one
    pub fn payload_size(&self) -> Option<u64> {
        fs::metadata(&self.slot)
            .ok()
            .map(|m| m.len())
            .filter(|&len| len > 0)
    }

    /// Hit only if the stored key matches `filename` and the payload is
    /// usable. Any other outcome forgets the stored key and deletes the
    /// stale payload.
    pub fn lookup(&mut self, filename: &str) -> Option<CacheEntry> {
        if !self.active {
            return None;
        }
        let fingerprint = Fingerprint::of(filename);
        if self.stored_fingerprint() == Some(fingerprint)
            && payload_usable(&self.slot)
        {
            info!("Using cached DFU image for {filename}");
            return Some(CacheEntry {
                fingerprint,
                payload_path: self.slot.clone(),
                enabled: self.active,
            });
        }
        if self.settings.last_download_sha256.is_some() {
            debug!("Cache miss for {filename}, forgetting stored fingerprint");
            self.invalidate();
        }
        self.discard_payload();
        None
    }

    /// Truncate the slot and get ready to append `expected_size` bytes.
    ///
    /// Returns false, with caching turned off for the rest of the run, when
    /// the slot cannot be opened or pre-allocated.
    pub fn begin_write(
        &mut self,
        filename: &str,
        expected_size: Option<u64>,
    ) -> bool {
        if !self.active {
            return false;
        }
        self.invalidate();
        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.slot)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Error opening DFU cache file for writing: {e}. Disabling caching.");
                self.active = false;
                return false;
            }
        };
        if let Some(size) = expected_size.filter(|&size| size > 0) {
            if let Err(e) = file.set_len(size) {
                warn!("Cannot reserve {size} bytes for DFU cache: {e}. Disabling caching.");
                drop(file);
                self.discard_payload();
                self.active = false;
                return false;
            }
        }
        debug!("Caching {filename} to {}", self.slot.display());
        self.writer = Some(CacheWriter { file, written: 0 });
        true
    }

    /// Append a chunk. A failed write disables caching and deletes the
    /// partial payload; the caller's own download carries on.
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        let Some(writer) = self.writer.as_mut() else {
            return false;
        };
        let result = writer.file.write_all(bytes);
        #[cfg(test)]
        let result = match self.fail_appends_after {
            Some(limit) if writer.written + bytes.len() as u64 > limit => {
                Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"))
            }
            _ => result,
        };
        match result {
            Ok(()) => {
                writer.written += bytes.len() as u64;
                true
            }
            Err(e) => {
                warn!("Error writing to DFU cache file: {e}. Disabling caching.");
                self.writer = None;
                self.discard_payload();
                self.active = false;
                false
            }
        }
    }

    /// Record `filename` as the slot's content after a complete download.
    ///
    /// Returns false when nothing was being written.
    pub fn commit(&mut self, filename: &str) -> io::Result<bool> {
        let Some(writer) = self.writer.take() else {
            return Ok(false);
        };
        // drop any pre-allocated tail beyond what actually arrived
        writer.file.set_len(writer.written)?;
        writer.file.sync_all()?;
        drop(writer.file);

        let fingerprint = Fingerprint::of(filename);
        self.settings.last_download_sha256 = Some(fingerprint.to_string());
        self.save()?;
        debug!("DFU cache hash updated: {fingerprint}");
        Ok(true)
    }

    /// Drop an in-progress write and its partial payload
    pub fn abort(&mut self) {
        if self.writer.take().is_some() {
            self.discard_payload();
        }
    }

    /// Drop a committed entry whose payload turned out to be unusable
    pub fn invalidate_entry(&mut self) {
        self.writer = None;
        self.discard_payload();
        self.invalidate();
    }

    /// Forget the cached image entirely
    pub fn clear(&mut self) -> io::Result<()> {
        self.writer = None;
        self.discard_payload();
        self.settings.last_download_sha256 = None;
        self.save()
    }

    fn invalidate(&mut self) {
        self.settings.last_download_sha256 = None;
        if let Err(e) = self.save() {
            warn!("Cannot persist DFU cache settings: {e}");
        }
    }

    fn discard_payload(&self) {
        match fs::remove_file(&self.slot) {
            Ok(()) => debug!("Removed DFU cache payload"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Cannot remove {}: {e}", self.slot.display()),
        }
    }

    /// Write-then-rename so a crash never leaves half a settings file
    fn save(&self) -> io::Result<()> {
        let json =
            serde_json::to_vec_pretty(&self.settings).map_err(io::Error::other)?;
        let tmp = self.settings_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.settings_path)
    }
}

#[cfg(test)]
impl ImageCache {
    pub(crate) fn fail_appends_after(&mut self, limit: u64) {
        self.fail_appends_after = Some(limit);
    }
}

fn load_settings(path: &Path) -> CacheSettings {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
            warn!("Ignoring unreadable {}: {e}", path.display());
            CacheSettings::default()
        }),
        Err(_) => CacheSettings::default(),
    }
}

/// Exists, is a readable file, and is not empty
fn payload_usable(path: &Path) -> bool {
    File::open(path)
        .and_then(|f| f.metadata())
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}
