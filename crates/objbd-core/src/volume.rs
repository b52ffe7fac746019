//! Volume façade: the block interface over the three core components
//!
//! A [`Volume`] owns the backend driver, the shared virtual-LBA map, the
//! translation layer, the local cache device and both caches, handing each
//! component a reference to its peers. The write path acknowledges once the
//! journal is durable; the read path serves journal hits first and fills
//! the remainder through the read cache.

use crate::backend::{FileBackend, ObjectBackend};
use crate::layout::{format_cache, read_outer_super};
use crate::nvme::NvmeDevice;
use crate::read_cache::ReadCache;
use crate::translate::{ObjMap, Translate};
use crate::write_cache::WriteCache;
use bytes::{Bytes, BytesMut};
use objbd_common::{BackendKind, Config, Error, Result, SECTOR_SIZE};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Completion callback for asynchronous writes; fires exactly once
pub type AioWriteDone = Box<dyn FnOnce(Result<usize>) + Send>;
/// Completion callback for asynchronous reads; fires exactly once
pub type AioReadDone = Box<dyn FnOnce(Result<Bytes>) + Send>;

/// An open virtual block device
pub struct Volume {
    name: String,
    size: u64,
    backend: Arc<dyn ObjectBackend>,
    omap: Arc<ObjMap>,
    xlate: Arc<Translate>,
    dev: Arc<NvmeDevice>,
    wcache: Arc<WriteCache>,
    rcache: Arc<ReadCache>,
}

fn backend_for(cfg: &Config, name: &str) -> Result<Arc<dyn ObjectBackend>> {
    match cfg.backend {
        BackendKind::File => Ok(Arc::new(FileBackend::new(cfg.cache_dir.clone(), name))),
        BackendKind::Rados => Err(Error::Configuration(
            "the rados driver is provided by the embedding application".into(),
        )),
    }
}

fn backend_tag(kind: BackendKind) -> u32 {
    match kind {
        BackendKind::File => 0,
        BackendKind::Rados => 1,
    }
}

impl Volume {
    /// Create a volume: write its backend superblock object and format its
    /// local cache device.
    pub fn create(name: &str, size_bytes: u64, cfg: &Config) -> Result<()> {
        cfg.validate()?;
        let backend = backend_for(cfg, name)?;
        let uuid = Uuid::new_v4();
        Translate::create_volume(backend.as_ref(), name, &uuid, size_bytes)?;

        let dev = NvmeDevice::create(cfg.cache_path(name), cfg.cache_size)?;
        format_cache(&dev, &uuid, backend_tag(cfg.backend))?;
        info!(volume = name, size_bytes, "volume created");
        Ok(())
    }

    /// Open a volume: recover the translation layer from the backend, then
    /// both caches from the local device. Returns the ready block device.
    pub fn open(name: &str, cfg: &Config) -> Result<Self> {
        cfg.validate()?;
        let backend = backend_for(cfg, name)?;
        let omap = Arc::new(ObjMap::new());
        let xlate = Translate::open(backend.clone(), omap.clone(), name, cfg, false, true)?;

        let caches = (|| {
            let dev = Arc::new(NvmeDevice::open(cfg.cache_path(name))?);
            let outer = read_outer_super(&dev)?;
            if outer.vol_uuid != xlate.uuid() {
                return Err(Error::corrupt(
                    "cache device does not belong to this volume",
                ));
            }
            let wcache = WriteCache::open(dev.clone(), xlate.clone(), cfg.wcache_batch)?;
            let rcache =
                match ReadCache::open(dev.clone(), backend.clone(), omap.clone(), &xlate.uuid()) {
                    Ok(rc) => rc,
                    Err(e) => {
                        wcache.shutdown();
                        return Err(e);
                    }
                };
            Ok((dev, wcache, rcache))
        })();
        let (dev, wcache, rcache) = match caches {
            Ok(parts) => parts,
            Err(e) => {
                xlate.shutdown();
                return Err(e);
            }
        };

        let size = xlate.volume_size();
        info!(volume = name, size, "volume open");
        Ok(Self {
            name: name.to_string(),
            size,
            backend,
            omap,
            xlate,
            dev,
            wcache,
            rcache,
        })
    }

    /// Volume size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Volume name (backend object prefix)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Volume UUID
    pub fn uuid(&self) -> Uuid {
        self.xlate.uuid()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset % SECTOR_SIZE != 0 || len as u64 % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument(format!(
                "I/O is not sector-aligned: offset {} len {}",
                offset, len
            )));
        }
        if offset + len as u64 > self.size {
            return Err(Error::invalid_argument(format!(
                "I/O past end of volume: offset {} len {} size {}",
                offset, len, self.size
            )));
        }
        Ok(())
    }

    /// Write `data` at byte `offset`, returning once it is durable in the
    /// journal.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(0);
        }
        let (tx, rx) = mpsc::channel();
        self.wcache.write(
            offset / SECTOR_SIZE,
            Bytes::copy_from_slice(data),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )?;
        rx.recv()
            .map_err(|_| Error::internal("write completion lost"))??;
        Ok(data.len())
    }

    /// Gathered write: `bufs` are consecutive at `offset`
    pub fn writev(&self, offset: u64, bufs: &[&[u8]]) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        self.check_range(offset, total)?;
        if total == 0 {
            return Ok(0);
        }
        let mut data = BytesMut::with_capacity(total);
        for b in bufs {
            data.extend_from_slice(b);
        }
        let (tx, rx) = mpsc::channel();
        self.wcache.write(
            offset / SECTOR_SIZE,
            data.freeze(),
            Box::new(move |res| {
                let _ = tx.send(res);
            }),
        )?;
        rx.recv()
            .map_err(|_| Error::internal("write completion lost"))??;
        Ok(total)
    }

    /// Read into `buf` at byte `offset`: journal hits first, the remainder
    /// through the read cache (which zero-fills unmapped ranges).
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }
        let misses = self.wcache.read(offset, buf)?;
        for m in misses {
            self.rcache
                .read(m.offset, &mut buf[m.buf_offset..m.buf_offset + m.len])?;
        }
        Ok(buf.len())
    }

    /// Scattered read: fills `bufs` consecutively from `offset`
    pub fn readv(&self, offset: u64, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut pos = offset;
        let mut total = 0;
        for buf in bufs {
            total += self.read(pos, buf)?;
            pos += buf.len() as u64;
        }
        Ok(total)
    }

    /// Asynchronous write; `done` fires exactly once, after journal
    /// durability or on the first error.
    pub fn aio_write(&self, offset: u64, data: Bytes, done: AioWriteDone) {
        if let Err(e) = self.check_range(offset, data.len()) {
            done(Err(e));
            return;
        }
        let len = data.len();
        let slot = Arc::new(Mutex::new(Some(done)));
        let inner = slot.clone();
        let res = self.wcache.write(
            offset / SECTOR_SIZE,
            data,
            Box::new(move |r| {
                if let Some(done) = inner.lock().take() {
                    done(r.map(|()| len));
                }
            }),
        );
        if let Err(e) = res {
            if let Some(done) = slot.lock().take() {
                done(Err(e));
            }
        }
    }

    /// Asynchronous read of `len` bytes; `done` fires exactly once
    pub fn aio_read(&self, offset: u64, len: usize, done: AioReadDone) {
        let mut buf = vec![0u8; len];
        match self.read(offset, &mut buf) {
            Ok(_) => done(Ok(Bytes::from(buf))),
            Err(e) => done(Err(e)),
        }
    }

    /// Drain the journal and seal the current translation batch. Returns
    /// the sealed batch's sequence number (0 if it was empty).
    pub fn flush(&self) -> Result<u32> {
        self.wcache.flush()?;
        Ok(self.xlate.flush())
    }

    /// Flush, checkpoint both layers and stop all background threads
    pub fn close(self) -> Result<()> {
        self.wcache.flush()?;
        self.wcache.write_checkpoint()?;
        self.wcache.shutdown();
        if let Err(e) = self.xlate.checkpoint() {
            warn!(error = %e, "final translation checkpoint failed");
        }
        self.xlate.shutdown();
        self.rcache.shutdown();
        info!(volume = %self.name, "volume closed");
        Ok(())
    }

    /// The translation layer (tests and tooling)
    pub fn translate(&self) -> &Arc<Translate> {
        &self.xlate
    }

    /// The write cache (tests and tooling)
    pub fn write_cache(&self) -> &Arc<WriteCache> {
        &self.wcache
    }

    /// The read cache (tests and tooling)
    pub fn read_cache(&self) -> &Arc<ReadCache> {
        &self.rcache
    }

    /// The backend driver
    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    /// The shared virtual-LBA map
    pub fn object_map(&self) -> &Arc<ObjMap> {
        &self.omap
    }

    /// The local cache device handle
    pub fn cache_device(&self) -> &Arc<NvmeDevice> {
        &self.dev
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        // close() already ran these when used; all are idempotent.
        self.wcache.shutdown();
        self.xlate.shutdown();
        self.rcache.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            cache_dir: dir.path().to_path_buf(),
            cache_size: 8 * 1024 * 1024,
            ..Config::default()
        }
    }

    #[test]
    fn test_create_open_write_read() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        Volume::create("vol0", 1 << 30, &cfg).unwrap();

        let vol = Volume::open("vol0", &cfg).unwrap();
        assert_eq!(vol.size(), 1 << 30);

        let data = vec![0x42u8; 8192];
        assert_eq!(vol.write(0, &data).unwrap(), 8192);
        let mut buf = vec![0u8; 8192];
        vol.read(0, &mut buf).unwrap();
        assert_eq!(buf, data);
        vol.close().unwrap();
    }

    #[test]
    fn test_rejects_unaligned_and_out_of_range() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        Volume::create("vol0", 1 << 20, &cfg).unwrap();
        let vol = Volume::open("vol0", &cfg).unwrap();

        let data = vec![0u8; 100];
        assert!(matches!(
            vol.write(0, &data),
            Err(Error::InvalidArgument(_))
        ));
        let data = vec![0u8; 4096];
        assert!(matches!(
            vol.write(1 << 20, &data),
            Err(Error::InvalidArgument(_))
        ));
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            vol.read(513, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
        vol.close().unwrap();
    }

    #[test]
    fn test_open_missing_volume() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        assert!(matches!(
            Volume::open("nothing", &cfg),
            Err(Error::VolumeNotFound(_))
        ));
    }

    #[test]
    fn test_writev_readv() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        Volume::create("vol0", 1 << 20, &cfg).unwrap();
        let vol = Volume::open("vol0", &cfg).unwrap();

        let a = vec![1u8; 4096];
        let b = vec![2u8; 4096];
        assert_eq!(vol.writev(0, &[&a, &b]).unwrap(), 8192);

        let mut x = vec![0u8; 4096];
        let mut y = vec![0u8; 4096];
        vol.readv(0, &mut [&mut x, &mut y]).unwrap();
        assert_eq!(x, a);
        assert_eq!(y, b);
        vol.close().unwrap();
    }

    #[test]
    fn test_aio_completions_fire_once() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        Volume::create("vol0", 1 << 20, &cfg).unwrap();
        let vol = Volume::open("vol0", &cfg).unwrap();

        let (tx, rx) = mpsc::channel();
        vol.aio_write(
            0,
            Bytes::from(vec![0x99u8; 4096]),
            Box::new(move |res| {
                tx.send(res).unwrap();
            }),
        );
        assert_eq!(rx.recv().unwrap().unwrap(), 4096);

        let (tx, rx) = mpsc::channel();
        vol.aio_read(
            0,
            4096,
            Box::new(move |res| {
                tx.send(res).unwrap();
            }),
        );
        let data = rx.recv().unwrap().unwrap();
        assert!(data.iter().all(|&b| b == 0x99));

        // Invalid request still completes exactly once, with the error.
        let (tx, rx) = mpsc::channel();
        vol.aio_write(
            1,
            Bytes::from(vec![0u8; 4096]),
            Box::new(move |res| {
                tx.send(res).unwrap();
            }),
        );
        assert!(rx.recv().unwrap().is_err());
        vol.close().unwrap();
    }

    #[test]
    fn test_rados_backend_is_external() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            backend: BackendKind::Rados,
            ..test_config(&dir)
        };
        assert!(matches!(
            Volume::create("vol0", 1 << 20, &cfg),
            Err(Error::Configuration(_))
        ));
    }
}
