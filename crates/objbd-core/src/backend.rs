//! Object-store backend drivers
//!
//! The translation layer and read cache talk to the object store through
//! [`ObjectBackend`]: synchronous whole-object put, ranged get and delete by
//! name, plus numbered-object helpers. Object names are deterministic:
//! the volume prefix for the superblock, `prefix.XXXXXXXX` (eight hex
//! digits of the sequence number) for everything else. Implementations must
//! be internally thread-safe; one instance is shared by every thread of a
//! volume.

use objbd_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use tracing::debug;

/// Synchronous object-store driver
pub trait ObjectBackend: Send + Sync {
    /// Store a whole object from the given buffers (concatenated in order),
    /// replacing any existing object of that name.
    fn write_object(&self, name: &str, bufs: &[&[u8]]) -> Result<()>;

    /// Read up to `buf.len()` bytes of `name` starting at `offset`.
    /// Returns the byte count, which is short only at end-of-object.
    fn read_object(&self, name: &str, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Remove an object
    fn delete_object(&self, name: &str) -> Result<()>;

    /// Deterministic name of numbered object `seq`
    fn object_name(&self, seq: u32) -> String;

    /// Store numbered object `seq`
    fn write_numbered(&self, seq: u32, bufs: &[&[u8]]) -> Result<()> {
        self.write_object(&self.object_name(seq), bufs)
    }

    /// Read from numbered object `seq`
    fn read_numbered(&self, seq: u32, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_object(&self.object_name(seq), buf, offset)
    }
}

/// One file per object under a directory. Debugging/test driver, and the
/// `backend = file` production option for shared filesystems.
pub struct FileBackend {
    dir: PathBuf,
    prefix: String,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl ObjectBackend for FileBackend {
    fn write_object(&self, name: &str, bufs: &[&[u8]]) -> Result<()> {
        let path = self.path_for(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::backend(format!("create {}: {}", path.display(), e)))?;
        for buf in bufs {
            file.write_all(buf)
                .map_err(|e| Error::backend(format!("write {}: {}", path.display(), e)))?;
        }
        file.sync_data()
            .map_err(|e| Error::backend(format!("sync {}: {}", path.display(), e)))?;
        debug!(object = name, bytes = bufs.iter().map(|b| b.len()).sum::<usize>(), "put object");
        Ok(())
    }

    fn read_object(&self, name: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let path = self.path_for(name);
        let file = std::fs::File::open(&path)
            .map_err(|e| Error::backend(format!("open {}: {}", path.display(), e)))?;
        let mut done = 0;
        while done < buf.len() {
            let n = file
                .read_at(&mut buf[done..], offset + done as u64)
                .map_err(|e| Error::backend(format!("read {}: {}", path.display(), e)))?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn delete_object(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        std::fs::remove_file(&path)
            .map_err(|e| Error::backend(format!("delete {}: {}", path.display(), e)))
    }

    fn object_name(&self, seq: u32) -> String {
        format!("{}.{:08x}", self.prefix, seq)
    }
}

/// In-memory backend for unit tests
#[derive(Default)]
pub struct MemBackend {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    prefix: String,
}

impl MemBackend {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            prefix: prefix.into(),
        }
    }

    /// Number of stored objects
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Names of all stored objects, sorted
    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.objects.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl ObjectBackend for MemBackend {
    fn write_object(&self, name: &str, bufs: &[&[u8]]) -> Result<()> {
        let mut data = Vec::with_capacity(bufs.iter().map(|b| b.len()).sum());
        for buf in bufs {
            data.extend_from_slice(buf);
        }
        self.objects.lock().insert(name.to_string(), data);
        Ok(())
    }

    fn read_object(&self, name: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        let objects = self.objects.lock();
        let data = objects
            .get(name)
            .ok_or_else(|| Error::backend(format!("no such object: {}", name)))?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn delete_object(&self, name: &str) -> Result<()> {
        self.objects
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::backend(format!("no such object: {}", name)))
    }

    fn object_name(&self, seq: u32) -> String {
        format!("{}.{:08x}", self.prefix, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_object_name_is_hex8() {
        let be = MemBackend::new("vol");
        assert_eq!(be.object_name(0), "vol.00000000");
        assert_eq!(be.object_name(255), "vol.000000ff");
        assert_eq!(be.object_name(0xDEADBEEF), "vol.deadbeef");
    }

    #[test]
    fn test_file_backend_round_trip() {
        let dir = tempdir().unwrap();
        let be = FileBackend::new(dir.path(), "vol");

        be.write_numbered(1, &[b"hello ", b"world"]).unwrap();

        let mut buf = vec![0u8; 16];
        let n = be.read_numbered(1, &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        // Ranged read.
        let mut buf = vec![0u8; 5];
        let n = be.read_numbered(1, &mut buf, 6).unwrap();
        assert_eq!(&buf[..n], b"world");

        be.delete_object(&be.object_name(1)).unwrap();
        assert!(be.read_numbered(1, &mut buf, 0).is_err());
    }

    #[test]
    fn test_file_backend_overwrite_truncates() {
        let dir = tempdir().unwrap();
        let be = FileBackend::new(dir.path(), "vol");
        be.write_numbered(2, &[&[7u8; 100]]).unwrap();
        be.write_numbered(2, &[&[9u8; 10]]).unwrap();

        let mut buf = vec![0u8; 100];
        let n = be.read_numbered(2, &mut buf, 0).unwrap();
        assert_eq!(n, 10);
        assert!(buf[..10].iter().all(|&b| b == 9));
    }

    #[test]
    fn test_mem_backend_missing_object() {
        let be = MemBackend::new("vol");
        let mut buf = [0u8; 4];
        assert!(be.read_object("vol.00000001", &mut buf, 0).is_err());
    }
}
