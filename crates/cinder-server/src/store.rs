//! On-disk persistence for the cluster config.
//!
//! One file per node (`nodes.conf` by default). Writes go to a `.tmp`
//! file first and are atomically renamed on completion, so a crash
//! mid-write never corrupts the existing file.
//!
//! File layout:
//! ```text
//! [CNCF magic: 4B][version: 1B][payload_len: 4B]
//! [payload: encoded ClusterConfig]
//! [footer_crc32: 4B]
//! ```
//! The checksum covers the payload only. All integers are little-endian.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cinder_cluster::{ClusterConfig, CodecError};
use thiserror::Error;
use tracing::debug;

/// Magic bytes for the config file header.
pub const STORE_MAGIC: &[u8; 4] = b"CNCF";

/// Current file envelope version.
pub const STORE_VERSION: u8 = 1;

const HEADER_LEN: usize = 4 + 1 + 4;
const FOOTER_LEN: usize = 4;

/// Errors that can occur when reading or writing the config file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported file version: {0}")]
    UnsupportedVersion(u8),

    #[error("crc32 mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("payload length {declared} doesn't match file ({actual} bytes)")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("corrupt cluster config: {0}")]
    Codec(#[from] CodecError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Computes a CRC32 checksum over a byte slice.
fn crc32(data: &[u8]) -> u32 {
    let mut h = crc32fast::Hasher::new();
    h.update(data);
    h.finalize()
}

/// Reads and writes the persisted cluster config at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `config` durably, replacing any previous file.
    pub fn save(&self, config: &ClusterConfig) -> Result<(), StoreError> {
        let payload = config.to_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + FOOTER_LEN);
        buf.extend_from_slice(STORE_MAGIC);
        buf.push(STORE_VERSION);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32(&payload).to_le_bytes());

        let tmp = TempFile::new(self.path.with_extension("conf.tmp"));
        let mut file = File::create(tmp.path())?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);
        tmp.persist(&self.path)?;

        debug!(
            path = %self.path.display(),
            bytes = buf.len(),
            epoch = config.epoch(),
            "saved cluster config"
        );
        Ok(())
    }

    /// Loads the persisted config. Returns `Ok(None)` if no file exists.
    pub fn load(&self) -> Result<Option<ClusterConfig>, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode_file(&data).map(Some)
    }
}

fn decode_file(data: &[u8]) -> Result<ClusterConfig, StoreError> {
    if data.len() < HEADER_LEN + FOOTER_LEN {
        return Err(StoreError::UnexpectedEof);
    }
    if &data[..4] != STORE_MAGIC {
        return Err(StoreError::InvalidMagic);
    }
    let version = data[4];
    if version != STORE_VERSION {
        return Err(StoreError::UnsupportedVersion(version));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&data[5..HEADER_LEN]);
    let declared = u32::from_le_bytes(len_bytes) as usize;
    let actual = data.len() - HEADER_LEN - FOOTER_LEN;
    if declared != actual {
        return Err(StoreError::LengthMismatch { declared, actual });
    }

    let (payload, footer) = data[HEADER_LEN..].split_at(declared);
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(footer);
    let stored = u32::from_le_bytes(crc_bytes);
    let computed = crc32(payload);
    if computed != stored {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    Ok(ClusterConfig::from_bytes(payload)?)
}

/// Temp file that removes itself unless persisted.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically renames the temp file over `target`.
    fn persist(mut self, target: &Path) -> io::Result<()> {
        fs::rename(&self.path, target)?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.persisted {
            // best-effort cleanup of the incomplete temp file
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use cinder_cluster::{NodeId, NodeRole, Worker};

    use super::*;

    fn temp_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("create temp dir")
    }

    fn sample() -> ClusterConfig {
        let mut config = ClusterConfig::initialize_local_worker(
            NodeId::new(),
            "127.0.0.1",
            7000,
            0,
            NodeRole::Primary,
            None,
            "node-a",
        )
        .unwrap();
        config
            .add_worker(Worker::primary(NodeId::new(), "127.0.0.1", 7001))
            .unwrap();
        for slot in 0..100 {
            config.assign_slot(slot, config.my_id()).unwrap();
        }
        config
    }

    #[test]
    fn missing_file_is_none() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path().join("nodes.conf"));
        assert!(!store.path().exists());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_and_load() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path().join("nodes.conf"));
        let config = sample();

        store.save(&config).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.my_id(), config.my_id());
        assert!(!dir.path().join("nodes.conf.tmp").exists());
    }

    #[test]
    fn save_replaces_previous() {
        let dir = temp_dir();
        let store = ConfigStore::new(dir.path().join("nodes.conf"));
        let mut config = sample();
        store.save(&config).unwrap();

        let other = config.workers()[1].id;
        config.forget(other).unwrap();
        store.save(&config).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.worker_count(), 1);
        assert_eq!(loaded.epoch(), config.epoch());
    }

    #[test]
    fn corrupt_payload_detected() {
        let dir = temp_dir();
        let path = dir.path().join("nodes.conf");
        let store = ConfigStore::new(&path);
        store.save(&sample()).unwrap();

        let mut data = fs::read(&path).unwrap();
        data[HEADER_LEN + 3] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));
    }

    #[test]
    fn truncated_file_detected() {
        let dir = temp_dir();
        let path = dir.path().join("nodes.conf");
        let store = ConfigStore::new(&path);
        store.save(&sample()).unwrap();

        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 10]).unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            StoreError::LengthMismatch { .. }
        ));

        fs::write(&path, &data[..3]).unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            StoreError::UnexpectedEof
        ));
    }

    #[test]
    fn bad_magic_and_version() {
        let dir = temp_dir();
        let path = dir.path().join("nodes.conf");
        let store = ConfigStore::new(&path);
        store.save(&sample()).unwrap();
        let data = fs::read(&path).unwrap();

        let mut bad = data.clone();
        bad[0] = b'X';
        fs::write(&path, &bad).unwrap();
        assert!(matches!(store.load().unwrap_err(), StoreError::InvalidMagic));

        let mut bad = data;
        bad[4] = 9;
        fs::write(&path, &bad).unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            StoreError::UnsupportedVersion(9)
        ));
    }

    #[test]
    fn unfinished_write_leaves_old_file() {
        let dir = temp_dir();
        let path = dir.path().join("nodes.conf");
        let store = ConfigStore::new(&path);
        let config = sample();
        store.save(&config).unwrap();

        // a temp file that is dropped without persisting disappears
        {
            let tmp = TempFile::new(path.with_extension("conf.tmp"));
            fs::write(tmp.path(), b"partial").unwrap();
        }
        assert!(!path.with_extension("conf.tmp").exists());
        assert_eq!(store.load().unwrap().unwrap(), config);
    }
}
