//! [`SuperblockStore`] implementation with Fjall (disk) and in-memory backends.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use tracing::debug;

use crate::MetaError;

type Result<T> = std::result::Result<T, MetaError>;

/// Inner backend: either Fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall {
        #[allow(dead_code)]
        db: Database,
        /// `family ++ '/' ++ key` → blob.
        blobs: Keyspace,
    },
    Memory(RwLock<BTreeMap<Vec<u8>, Vec<u8>>>),
}

/// Named-blob key/value store with atomic writes.
///
/// Blobs are grouped into families. A write replaces the whole blob for its
/// key in one operation; readers never observe a partial record. The store
/// supports startup enumeration of a family, which the shard manager uses to
/// recover superblocks written before a crash.
pub struct SuperblockStore {
    backend: Backend,
}

impl SuperblockStore {
    /// Open a persistent store at the given path (Fjall backend).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        let blobs = db.keyspace("superblocks", KeyspaceCreateOptions::default)?;
        Ok(Self {
            backend: Backend::Fjall { db, blobs },
        })
    }

    /// Open a temporary store backed by Fjall (cleaned up on drop).
    ///
    /// Still uses disk I/O (tempdir). For zero disk I/O, use
    /// [`in_memory`](Self::in_memory).
    pub fn open_temporary() -> Result<Self> {
        let tmp = tempfile::tempdir().map_err(std::io::Error::other)?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        let blobs = db.keyspace("superblocks", KeyspaceCreateOptions::default)?;
        Ok(Self {
            backend: Backend::Fjall { db, blobs },
        })
    }

    /// Create a pure in-memory store. Zero disk I/O.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(BTreeMap::new())),
        }
    }

    /// Atomically write (create or replace) a blob.
    pub fn write(&self, family: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let storage_key = blob_storage_key(family, key);
        match &self.backend {
            Backend::Fjall { blobs, .. } => {
                blobs.insert(storage_key.as_slice(), value)?;
            }
            Backend::Memory(m) => {
                m.write()
                    .expect("lock poisoned")
                    .insert(storage_key, value.to_vec());
            }
        }
        debug!(family, key_len = key.len(), value_len = value.len(), "wrote superblock");
        Ok(())
    }

    /// Read a single blob. Returns `None` if absent.
    pub fn get(&self, family: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let storage_key = blob_storage_key(family, key);
        match &self.backend {
            Backend::Fjall { blobs, .. } => match blobs.get(storage_key.as_slice())? {
                Some(bytes) => Ok(Some(bytes.to_vec())),
                None => Ok(None),
            },
            Backend::Memory(m) => Ok(m
                .read()
                .expect("lock poisoned")
                .get(&storage_key)
                .cloned()),
        }
    }

    /// Remove a blob. Removing an absent blob is not an error.
    pub fn remove(&self, family: &str, key: &[u8]) -> Result<()> {
        let storage_key = blob_storage_key(family, key);
        match &self.backend {
            Backend::Fjall { blobs, .. } => {
                blobs.remove(storage_key.as_slice())?;
            }
            Backend::Memory(m) => {
                m.write().expect("lock poisoned").remove(&storage_key);
            }
        }
        debug!(family, "removed superblock");
        Ok(())
    }

    /// Enumerate every blob of a family, returning owned `(key, value)` pairs
    /// ordered by key bytes.
    pub fn load_family(&self, family: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = family_prefix(family);
        match &self.backend {
            Backend::Fjall { blobs, .. } => {
                let mut out = Vec::new();
                for guard in blobs.prefix(prefix.as_slice()) {
                    let (k, v) = guard.into_inner()?;
                    out.push((k[prefix.len()..].to_vec(), v.to_vec()));
                }
                Ok(out)
            }
            Backend::Memory(m) => {
                let map = m.read().expect("lock poisoned");
                let mut out = Vec::new();
                for (k, v) in map.range(prefix.clone()..) {
                    if !k.starts_with(&prefix) {
                        break;
                    }
                    out.push((k[prefix.len()..].to_vec(), v.clone()));
                }
                Ok(out)
            }
        }
    }
}

/// Build the storage key: `family ++ '/' ++ key`.
fn blob_storage_key(family: &str, key: &[u8]) -> Vec<u8> {
    let mut storage_key = family_prefix(family);
    storage_key.extend_from_slice(key);
    storage_key
}

/// The family prefix: `family ++ '/'`.
fn family_prefix(family: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(family.len() + 1);
    prefix.extend_from_slice(family.as_bytes());
    prefix.push(b'/');
    prefix
}
