//! Named pool segment.
//!
//! A pool named `N` in directory `D` lives in two files:
//! - `D/N.pool` - the segment image (header + payload)
//! - `D/N.lock` - the cross-process lock file
//!
//! # Image Layout
//!
//! ```text
//! offset  size  field
//!      0     4  magic "MVPL"
//!      4     1  format version
//!      5     1  flags (ENCRYPTED)
//!      6     2  reserved
//!      8    32  key check value (zero when not encrypted)
//!     40     8  payload length
//!     48     8  payload xxHash64
//!     56     8  reserved
//!     64     *  payload: codec map key -> {value, ttl, created_at}
//! ```
//!
//! Mutations write a complete new image to a temporary file and rename it over
//! the segment, so a reader sees either the previous image or the next one.

use crate::codec::{self, Value};
use crate::core::error::{PoolError, PoolResult};
use crate::pool::entry::Entry;
use crate::storage::lock::{LockMode, SegmentLock};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use twox_hash::XxHash64;

/// Segment magic bytes.
pub const SEGMENT_MAGIC: [u8; 4] = *b"MVPL";

/// Current image format version.
pub const FORMAT_VERSION: u8 = 1;

/// Fixed header length.
pub const HEADER_LEN: usize = 64;

/// Longest accepted pool name.
pub const MAX_NAME_LEN: usize = 200;

const CHECKSUM_SEED: u64 = 0;

bitflags::bitflags! {
    /// Segment header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SegmentFlags: u8 {
        /// Values are sealed with the pool secret.
        const ENCRYPTED = 0b0000_0001;
    }
}

/// Encryption identity recorded in the header.
///
/// Every handle compares its own identity against the header before touching
/// entries; any mismatch is a decryption fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentIdentity {
    /// Header flags.
    pub flags: SegmentFlags,
    /// Key check value; all zero for plain pools.
    pub key_check: [u8; 32],
}

impl SegmentIdentity {
    /// Identity of an unencrypted pool.
    pub fn plain() -> Self {
        Self {
            flags: SegmentFlags::empty(),
            key_check: [0; 32],
        }
    }

    /// Identity of an encrypted pool.
    pub fn encrypted(key_check: [u8; 32]) -> Self {
        Self {
            flags: SegmentFlags::ENCRYPTED,
            key_check,
        }
    }

    /// Check if values are sealed.
    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(SegmentFlags::ENCRYPTED)
    }

    /// Verify that a handle with identity `self` may read a segment stamped `found`.
    pub fn verify(&self, found: &SegmentIdentity) -> PoolResult<()> {
        match (self.is_encrypted(), found.is_encrypted()) {
            (false, false) => Ok(()),
            (false, true) => Err(PoolError::decryption(
                "pool is encrypted but this handle has no secret",
            )),
            (true, false) => Err(PoolError::decryption(
                "handle has a secret but the pool is not encrypted",
            )),
            (true, true) if self.key_check == found.key_check => Ok(()),
            (true, true) => Err(PoolError::decryption(
                "secret does not match the pool secret",
            )),
        }
    }
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u8,
    /// Encryption identity.
    pub identity: SegmentIdentity,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// xxHash64 of the payload.
    pub checksum: u64,
}

impl SegmentHeader {
    /// Serialize the header.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_slice(&SEGMENT_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.identity.flags.bits());
        buf.put_u16(0);
        buf.put_slice(&self.identity.key_check);
        buf.put_u64(self.payload_len);
        buf.put_u64(self.checksum);
        buf.put_u64(0);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse a header from the start of an image.
    pub fn decode(data: &[u8]) -> PoolResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(PoolError::storage(format!(
                "segment truncated: {} bytes, header needs {}",
                data.len(),
                HEADER_LEN
            )));
        }
        let mut buf = &data[..HEADER_LEN];

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != SEGMENT_MAGIC {
            return Err(PoolError::storage("segment magic mismatch"));
        }

        let version = buf.get_u8();
        if version != FORMAT_VERSION {
            return Err(PoolError::storage(format!(
                "unsupported segment version {}",
                version
            )));
        }

        let flags = SegmentFlags::from_bits(buf.get_u8())
            .ok_or_else(|| PoolError::storage("unknown segment flags"))?;
        buf.advance(2);

        let mut key_check = [0u8; 32];
        buf.copy_to_slice(&mut key_check);
        let payload_len = buf.get_u64();
        let checksum = buf.get_u64();

        Ok(Self {
            version,
            identity: SegmentIdentity { flags, key_check },
            payload_len,
            checksum,
        })
    }
}

/// In-memory copy of a segment image.
///
/// Mutating methods mark the image dirty; only dirty images are written back.
#[derive(Debug, Clone)]
pub struct SegmentImage {
    entries: BTreeMap<String, Entry>,
    byte_len: u64,
    dirty: bool,
}

impl SegmentImage {
    fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
            byte_len: HEADER_LEN as u64,
            dirty: false,
        }
    }

    /// Look up an entry, expired or not.
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Insert or overwrite an entry.
    pub fn insert(&mut self, key: String, entry: Entry) {
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    /// Remove an entry.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Keep only entries for which `keep` returns true. Returns the removed keys.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str, &Entry) -> bool,
    {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(k, e)| !keep(k, e))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        if !doomed.is_empty() {
            self.dirty = true;
        }
        doomed
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Entry)> {
        self.entries.iter()
    }

    /// Iterate entries whose key starts with `prefix`.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        self.entries
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Number of physically present entries (expired ones included).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if no entries are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the image this copy was loaded from.
    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    /// Check if this copy has unsaved changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Handle on a named segment.
///
/// Dropping the handle never removes the files; use [`Segment::destroy`].
#[derive(Debug)]
pub struct Segment {
    name: String,
    dir: PathBuf,
    data_path: PathBuf,
    lock_path: PathBuf,
    identity: SegmentIdentity,
    tmp_seq: AtomicU64,
}

impl Segment {
    /// Default segment directory: RAM-backed `/dev/shm` when present.
    pub fn default_dir() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.join("mvent")
        } else {
            std::env::temp_dir().join("mvent")
        }
    }

    /// Validate a pool name for use as a file stem.
    pub fn validate_name(name: &str) -> PoolResult<()> {
        if name.is_empty() {
            return Err(PoolError::invalid("pool name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(PoolError::invalid(format!(
                "pool name longer than {} bytes",
                MAX_NAME_LEN
            )));
        }
        if name.starts_with('.') {
            return Err(PoolError::invalid("pool name must not start with '.'"));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(PoolError::invalid(format!(
                "pool name contains invalid character {:?}",
                c
            )));
        }
        Ok(())
    }

    /// Attach to the segment, creating it stamped with `identity` if absent.
    pub fn attach(dir: &Path, name: &str, identity: SegmentIdentity) -> PoolResult<Self> {
        Self::validate_name(name)?;
        std::fs::create_dir_all(dir)
            .map_err(|e| PoolError::io(format!("cannot create {}", dir.display()), e))?;

        let segment = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            data_path: dir.join(format!("{}.pool", name)),
            lock_path: dir.join(format!("{}.lock", name)),
            identity,
            tmp_seq: AtomicU64::new(0),
        };

        let _lock = SegmentLock::acquire(&segment.lock_path, LockMode::Exclusive)?;
        if segment.data_path.exists() {
            // Parse fully so corruption and identity mismatches surface at attach.
            segment.load_unlocked()?;
            tracing::debug!(pool = %name, dir = %dir.display(), "attached to segment");
        } else {
            segment.store_unlocked(&SegmentImage::empty())?;
            tracing::info!(
                pool = %name,
                dir = %dir.display(),
                encrypted = identity.is_encrypted(),
                "created segment"
            );
        }

        Ok(segment)
    }

    /// Remove a segment image. Returns whether the segment existed.
    ///
    /// This is the owner's explicit teardown. Other handles still attached
    /// fail with a storage fault on their next call. The lock file stays:
    /// a waiter already blocked on its inode must contend with later
    /// attachers on the same file, so it is never unlinked.
    pub fn destroy(dir: &Path, name: &str) -> PoolResult<bool> {
        Self::validate_name(name)?;
        let data_path = dir.join(format!("{}.pool", name));
        let lock_path = dir.join(format!("{}.lock", name));

        let existed = {
            let _lock = SegmentLock::acquire(&lock_path, LockMode::Exclusive)?;
            match std::fs::remove_file(&data_path) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    return Err(PoolError::io(
                        format!("cannot remove {}", data_path.display()),
                        e,
                    ))
                }
            }
        };

        tracing::info!(pool = %name, dir = %dir.display(), existed, "destroyed segment");
        Ok(existed)
    }

    /// Check if a segment file exists.
    pub fn exists(dir: &Path, name: &str) -> bool {
        dir.join(format!("{}.pool", name)).exists()
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the segment.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the segment image.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Identity this handle expects.
    pub fn identity(&self) -> &SegmentIdentity {
        &self.identity
    }

    /// Load a consistent snapshot under a shared lock.
    pub fn read(&self) -> PoolResult<SegmentImage> {
        let _lock = SegmentLock::acquire(&self.lock_path, LockMode::Shared)?;
        self.load_unlocked()
    }

    /// Run a read-modify-write under the exclusive lock.
    ///
    /// The image is written back only if `f` succeeds and changed it.
    pub fn mutate<R, F>(&self, f: F) -> PoolResult<R>
    where
        F: FnOnce(&mut SegmentImage) -> PoolResult<R>,
    {
        let _lock = SegmentLock::acquire(&self.lock_path, LockMode::Exclusive)?;
        let mut image = self.load_unlocked()?;
        let result = f(&mut image)?;
        if image.is_dirty() {
            self.store_unlocked(&image)?;
        }
        Ok(result)
    }

    fn load_unlocked(&self) -> PoolResult<SegmentImage> {
        let data = match std::fs::read(&self.data_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PoolError::storage(format!(
                    "segment {} is missing (destroyed?)",
                    self.data_path.display()
                )))
            }
            Err(e) => {
                return Err(PoolError::io(
                    format!("cannot read {}", self.data_path.display()),
                    e,
                ))
            }
        };

        let header = SegmentHeader::decode(&data)?;
        self.identity.verify(&header.identity)?;

        let payload = &data[HEADER_LEN..];
        if payload.len() as u64 != header.payload_len {
            return Err(PoolError::storage(format!(
                "segment payload length {} does not match header {}",
                payload.len(),
                header.payload_len
            )));
        }
        if checksum(payload) != header.checksum {
            return Err(PoolError::storage("segment checksum mismatch"));
        }

        let decoded = codec::decode(payload)
            .map_err(|e| PoolError::storage(format!("segment payload undecodable: {}", e)))?;
        let Value::Map(raw_entries) = decoded else {
            return Err(PoolError::storage("segment payload is not a map"));
        };

        let mut entries = BTreeMap::new();
        for (key, raw) in raw_entries {
            let entry = Entry::from_value(raw)
                .map_err(|e| PoolError::storage(format!("entry {:?}: {}", key, e)))?;
            entries.insert(key, entry);
        }

        Ok(SegmentImage {
            entries,
            byte_len: data.len() as u64,
            dirty: false,
        })
    }

    fn store_unlocked(&self, image: &SegmentImage) -> PoolResult<()> {
        let payload_value = Value::Map(
            image
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.to_value()))
                .collect(),
        );
        let payload = codec::encode(&payload_value)
            .map_err(|e| PoolError::invalid(format!("segment too large to encode: {}", e)))?;

        let header = SegmentHeader {
            version: FORMAT_VERSION,
            identity: self.identity,
            payload_len: payload.len() as u64,
            checksum: checksum(&payload),
        };

        let tmp_path = self.dir.join(format!(
            "{}.pool.{}.{}.tmp",
            self.name,
            std::process::id(),
            self.tmp_seq.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&header.encode())?;
            file.write_all(&payload)?;
            std::fs::rename(&tmp_path, &self.data_path)
        })();

        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(PoolError::io(
                format!("cannot write {}", self.data_path.display()),
                e,
            ));
        }
        Ok(())
    }
}

fn checksum(payload: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(CHECKSUM_SEED);
    hasher.write(payload);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::Timestamp;

    fn entry(v: i64) -> Entry {
        Entry::new(Value::Int(v), Timestamp::new(1_000), None)
    }

    #[test]
    fn header_layout_is_fixed() {
        let header = SegmentHeader {
            version: FORMAT_VERSION,
            identity: SegmentIdentity::encrypted([7; 32]),
            payload_len: 5,
            checksum: 9,
        };
        let bytes = header.encode();
        assert_eq!(&bytes[0..4], b"MVPL");
        assert_eq!(bytes[5], SegmentFlags::ENCRYPTED.bits());
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn names_are_validated() {
        assert!(Segment::validate_name("http_pool-1.a").is_ok());
        assert!(Segment::validate_name("").is_err());
        assert!(Segment::validate_name(".hidden").is_err());
        assert!(Segment::validate_name("a/b").is_err());
        assert!(Segment::validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn mutate_persists_only_dirty_images() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::attach(dir.path(), "p", SegmentIdentity::plain()).unwrap();

        seg.mutate(|img| {
            img.insert("a".into(), entry(1));
            Ok(())
        })
        .unwrap();
        let before = std::fs::metadata(seg.data_path()).unwrap().modified().unwrap();

        seg.mutate(|img| {
            assert!(img.get("a").is_some());
            Ok(())
        })
        .unwrap();
        let after = std::fs::metadata(seg.data_path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(seg.read().unwrap().len(), 1);
    }

    #[test]
    fn failed_mutation_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::attach(dir.path(), "p", SegmentIdentity::plain()).unwrap();

        let result: PoolResult<()> = seg.mutate(|img| {
            img.insert("a".into(), entry(1));
            Err(PoolError::invalid("abort"))
        });
        assert!(result.is_err());
        assert!(seg.read().unwrap().is_empty());
    }

    #[test]
    fn corrupted_payload_is_storage_fault() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::attach(dir.path(), "p", SegmentIdentity::plain()).unwrap();
        seg.mutate(|img| {
            img.insert("a".into(), entry(1));
            Ok(())
        })
        .unwrap();

        let mut bytes = std::fs::read(seg.data_path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(seg.data_path(), bytes).unwrap();

        assert!(matches!(seg.read(), Err(PoolError::StorageFault { .. })));
    }

    #[test]
    fn identity_mismatch_is_decryption_fault() {
        let dir = tempfile::tempdir().unwrap();
        Segment::attach(dir.path(), "p", SegmentIdentity::encrypted([1; 32])).unwrap();

        for identity in [
            SegmentIdentity::plain(),
            SegmentIdentity::encrypted([2; 32]),
        ] {
            let err = Segment::attach(dir.path(), "p", identity).unwrap_err();
            assert!(matches!(err, PoolError::DecryptionFault { .. }));
        }
    }

    #[test]
    fn destroyed_segment_faults_attached_handles() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::attach(dir.path(), "p", SegmentIdentity::plain()).unwrap();

        assert!(Segment::destroy(dir.path(), "p").unwrap());
        assert!(!Segment::exists(dir.path(), "p"));
        assert!(matches!(seg.read(), Err(PoolError::StorageFault { .. })));
        assert!(!Segment::destroy(dir.path(), "p").unwrap());
    }

    #[test]
    fn destroy_keeps_lock_file_for_reattach() {
        let dir = tempfile::tempdir().unwrap();
        let seg = Segment::attach(dir.path(), "p", SegmentIdentity::plain()).unwrap();
        seg.mutate(|img| {
            img.insert("k".to_string(), entry(0));
            Ok(())
        })
        .unwrap();

        assert!(Segment::destroy(dir.path(), "p").unwrap());
        assert!(dir.path().join("p.lock").exists());
        assert!(!dir.path().join("p.pool").exists());

        let fresh = Segment::attach(dir.path(), "p", SegmentIdentity::plain()).unwrap();
        assert!(fresh.read().unwrap().is_empty());
        assert!(Segment::exists(dir.path(), "p"));
    }

    #[test]
    fn prefix_iteration_stops_at_prefix_end() {
        let mut img = SegmentImage::empty();
        for key in ["a:1", "a:2", "ab", "b:1"] {
            img.insert(key.to_string(), entry(0));
        }
        let keys: Vec<&String> = img.iter_prefix("a:").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a:1", "a:2"]);
    }
}
