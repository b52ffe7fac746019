//! Translation layer: host writes to numbered backend objects
//!
//! Incoming writes accumulate in an append-only batch; a sealed batch
//! becomes one immutable DATA object at the backend, and only once that
//! object is durable do its extents become visible in the virtual-LBA map.
//! Checkpoint objects snapshot the full map plus the live-object table so
//! reopening a volume replays a bounded tail of the log.

use crate::backend::ObjectBackend;
use crate::objects::{
    self, build_ckpt, build_data_hdr, build_super, parse_ckpt, parse_data_hdr, parse_header,
    parse_super, CkptMapEntry, CkptObjEntry, DataMapEntry, OBJ_CKPT, OBJ_DATA, OBJ_HEADER_SIZE,
};
use objbd_common::{Config, Error, Result, PAGE_SIZE, SECTOR_SIZE};
use objbd_extent::{ExtentMap, ObjExtent};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Checkpoint when this many sequences have been assigned since the last one
const CKPT_INTERVAL: u32 = 100;
/// Checkpoint thread period
const CKPT_PERIOD: Duration = Duration::from_secs(1);
/// Timed-flush thread period
const FLUSH_PERIOD: Duration = Duration::from_millis(500);
/// Seal an idle non-empty batch after this long
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// The authoritative virtual-LBA map, shared between the translation layer
/// (writer) and the read cache (reader).
pub struct ObjMap {
    map: RwLock<ExtentMap<ObjExtent>>,
}

impl ObjMap {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(ExtentMap::new()),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ExtentMap<ObjExtent>> {
        self.map.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ExtentMap<ObjExtent>> {
        self.map.write()
    }
}

impl Default for ObjMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-object bookkeeping, all sizes in sectors
#[derive(Debug, Clone, Copy)]
pub struct ObjInfo {
    pub hdr_sectors: u32,
    pub data_sectors: u32,
    /// Sectors still reachable through the virtual-LBA map; input for a
    /// future garbage collector.
    pub live_sectors: u64,
    pub obj_type: u32,
}

struct Batch {
    buf: Vec<u8>,
    entries: Vec<DataMapEntry>,
    seq: u32,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            entries: Vec::new(),
            seq: 0,
        }
    }

    fn reset(&mut self, seq: u32) {
        self.buf.clear();
        self.entries.clear();
        self.seq = seq;
    }

    fn sectors(&self) -> u64 {
        self.buf.len() as u64 / SECTOR_SIZE
    }
}

struct XlState {
    current: Option<Batch>,
    pool: Vec<Batch>,
    queue: VecDeque<Arc<Batch>>,
    /// Sealed batches still readable in memory, until their object commits
    in_mem: HashMap<u32, Arc<Batch>>,
    object_info: BTreeMap<u32, ObjInfo>,
    next_seq: u32,
    last_ckpt: u32,
    active_workers: usize,
    failed: Option<String>,
    shutdown: bool,
}

/// The translation layer for one volume
pub struct Translate {
    backend: Arc<dyn ObjectBackend>,
    omap: Arc<ObjMap>,
    name: String,
    uuid: Uuid,
    vol_size: u64,
    batch_size: usize,
    window: usize,
    nocache: bool,
    state: Mutex<XlState>,
    work_cv: Condvar,
    window_cv: Condvar,
    idle_cv: Condvar,
    tick_cv: Condvar,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Read an object's full header region (first page, then the rest if the
/// header says it is longer).
fn read_obj_hdr(backend: &dyn ObjectBackend, name: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; PAGE_SIZE as usize];
    let n = backend.read_object(name, &mut buf, 0)?;
    if n < OBJ_HEADER_SIZE {
        return Err(Error::corrupt(format!("object {} too short", name)));
    }
    let hdr = parse_header(&buf)?;
    let hdr_bytes = hdr.hdr_bytes();
    if hdr_bytes > buf.len() {
        buf = vec![0u8; hdr_bytes];
        let n = backend.read_object(name, &mut buf, 0)?;
        if n < hdr_bytes {
            return Err(Error::corrupt(format!("object {} header truncated", name)));
        }
    }
    Ok(buf)
}

impl Translate {
    /// Create the volume: write its superblock object
    pub fn create_volume(
        backend: &dyn ObjectBackend,
        name: &str,
        vol_uuid: &Uuid,
        size_bytes: u64,
    ) -> Result<()> {
        if size_bytes == 0 || size_bytes % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument(format!(
                "volume size {} is not sector-aligned",
                size_bytes
            )));
        }
        let sb = build_super(vol_uuid, size_bytes / SECTOR_SIZE, 1, &[], &[], &[]);
        backend.write_object(name, &[&sb])?;
        info!(volume = name, size_bytes, "created volume superblock");
        Ok(())
    }

    /// Open the volume: read the superblock, replay the latest checkpoint
    /// and the trailing data-object headers, then start worker threads.
    pub fn open(
        backend: Arc<dyn ObjectBackend>,
        omap: Arc<ObjMap>,
        name: &str,
        cfg: &Config,
        nocache: bool,
        timed_flush: bool,
    ) -> Result<Arc<Self>> {
        let sb_buf = match read_obj_hdr(backend.as_ref(), name) {
            Ok(buf) => buf,
            Err(Error::Backend(_)) => return Err(Error::VolumeNotFound(name.to_string())),
            Err(e) => return Err(e),
        };
        let sb = parse_super(&sb_buf)?;

        let xl = Arc::new(Self {
            backend,
            omap,
            name: name.to_string(),
            uuid: sb.hdr.vol_uuid,
            vol_size: sb.vol_size * SECTOR_SIZE,
            batch_size: cfg.batch_size,
            window: cfg.xlate_window,
            nocache,
            state: Mutex::new(XlState {
                current: None,
                pool: Vec::new(),
                queue: VecDeque::new(),
                in_mem: HashMap::new(),
                object_info: BTreeMap::new(),
                next_seq: sb.next_obj.max(1),
                last_ckpt: 0,
                active_workers: 0,
                failed: None,
                shutdown: false,
            }),
            work_cv: Condvar::new(),
            window_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            tick_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        let mut scan_from = 1;
        if let Some(&ck) = sb.ckpts.last() {
            xl.apply_checkpoint(ck)?;
            scan_from = ck + 1;
        }
        let recovered = xl.roll_forward(scan_from);
        info!(
            volume = name,
            ckpt = scan_from - 1,
            recovered,
            "translation layer open"
        );

        let mut threads = xl.threads.lock();
        for _ in 0..cfg.xlate_threads {
            let me = xl.clone();
            threads.push(thread::spawn(move || me.worker_thread()));
        }
        {
            let me = xl.clone();
            threads.push(thread::spawn(move || me.ckpt_thread()));
        }
        if timed_flush {
            let me = xl.clone();
            threads.push(thread::spawn(move || me.flush_thread()));
        }
        drop(threads);

        Ok(xl)
    }

    fn apply_checkpoint(&self, ck: u32) -> Result<()> {
        let buf = read_obj_hdr(self.backend.as_ref(), &self.backend.object_name(ck))?;
        let info = parse_ckpt(&buf)?;
        if info.hdr.vol_uuid != self.uuid {
            return Err(Error::corrupt("checkpoint from a different volume"));
        }

        let mut st = self.state.lock();
        for o in &info.objs {
            st.object_info.insert(
                o.seq,
                ObjInfo {
                    hdr_sectors: o.hdr_sectors,
                    data_sectors: o.data_sectors,
                    live_sectors: u64::from(o.live_sectors),
                    obj_type: OBJ_DATA,
                },
            );
        }
        st.last_ckpt = ck;
        st.next_seq = st.next_seq.max(ck + 1);
        drop(st);

        let mut map = self.omap.write();
        for m in &info.map {
            map.update(
                m.lba,
                m.lba + m.len,
                ObjExtent {
                    obj: m.obj,
                    offset: u64::from(m.offset),
                },
            );
        }
        debug!(ck, objs = info.objs.len(), extents = info.map.len(), "applied checkpoint");
        Ok(())
    }

    /// Scan forward from `start` applying data-object headers until the log
    /// ends (read failure or unrecognizable object). Returns objects applied.
    fn roll_forward(&self, start: u32) -> u32 {
        let mut applied = 0;
        let mut seq = start;
        loop {
            let name = self.backend.object_name(seq);
            let buf = match read_obj_hdr(self.backend.as_ref(), &name) {
                Ok(buf) => buf,
                Err(_) => break, // end of log
            };
            let hdr = match parse_header(&buf) {
                Ok(h) if h.vol_uuid == self.uuid => h,
                _ => break,
            };
            match hdr.obj_type {
                // A checkpoint whose superblock rewrite never landed; its
                // contents are covered by the objects already scanned.
                OBJ_CKPT => {
                    seq += 1;
                    continue;
                }
                OBJ_DATA => {}
                _ => break,
            }
            let info = match parse_data_hdr(&buf) {
                Ok(i) => i,
                Err(_) => break,
            };

            let mut st = self.state.lock();
            st.object_info.insert(
                seq,
                ObjInfo {
                    hdr_sectors: info.hdr.hdr_sectors,
                    data_sectors: info.hdr.data_sectors,
                    live_sectors: u64::from(info.hdr.data_sectors),
                    obj_type: OBJ_DATA,
                },
            );
            let mut map = self.omap.write();
            let mut off = u64::from(info.hdr.hdr_sectors);
            for e in &info.map {
                let mut displaced = Vec::new();
                map.update_displaced(
                    e.lba,
                    e.lba + e.len,
                    ObjExtent { obj: seq, offset: off },
                    &mut displaced,
                );
                off += e.len;
                for d in displaced {
                    if d.value.obj != seq {
                        if let Some(oi) = st.object_info.get_mut(&d.value.obj) {
                            oi.live_sectors = oi.live_sectors.saturating_sub(d.len());
                        }
                    }
                }
            }
            drop(map);
            st.next_seq = st.next_seq.max(seq + 1);
            drop(st);

            applied += 1;
            seq += 1;
        }
        applied
    }

    /// Volume size in bytes
    pub fn volume_size(&self) -> u64 {
        self.vol_size
    }

    /// Volume UUID (from the superblock object)
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// True once a backend write has failed; the volume no longer accepts
    /// writes.
    pub fn failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }

    /// Sectors accumulated in the current batch
    pub fn frontier(&self) -> u64 {
        self.state
            .lock()
            .current
            .as_ref()
            .map_or(0, Batch::sectors)
    }

    /// Live-sector count of a backend object, if known
    pub fn live_sectors(&self, obj: u32) -> Option<u64> {
        self.state
            .lock()
            .object_info
            .get(&obj)
            .map(|oi| oi.live_sectors)
    }

    /// Append `bufs` at byte `offset`, one map entry per buffer.
    ///
    /// Bytes become durable (and generally visible to `read`) once the
    /// owning object is written by a worker; in `nocache` mode the map is
    /// updated immediately so reads see the write from memory.
    pub fn writev(&self, offset: u64, bufs: &[&[u8]]) -> Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        if total == 0 {
            return Ok(0);
        }
        if offset % SECTOR_SIZE != 0 || bufs.iter().any(|b| b.len() as u64 % SECTOR_SIZE != 0) {
            return Err(Error::invalid_argument("write is not sector-aligned"));
        }
        if total > self.batch_size {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes exceeds batch size {}",
                total, self.batch_size
            )));
        }

        let mut st = self.state.lock();
        if let Some(msg) = &st.failed {
            return Err(Error::backend(msg.clone()));
        }

        if st
            .current
            .as_ref()
            .is_some_and(|b| b.buf.len() + total > self.batch_size)
        {
            self.seal_locked(&mut st);
        }
        if st.current.is_none() {
            // Admission: bound in-flight objects to the translation window.
            while st.queue.len() >= self.window && st.failed.is_none() && !st.shutdown {
                self.window_cv.wait(&mut st);
            }
            if let Some(msg) = &st.failed {
                return Err(Error::backend(msg.clone()));
            }
            if st.shutdown {
                return Err(Error::internal("volume is shutting down"));
            }
            let seq = st.next_seq;
            st.next_seq += 1;
            let mut b = st.pool.pop().unwrap_or_else(|| Batch::new(self.batch_size));
            b.reset(seq);
            st.current = Some(b);
        }

        let lba = offset / SECTOR_SIZE;
        let cur = st.current.as_mut().expect("current batch");
        let seq = cur.seq;
        let sector_off = cur.sectors();
        let mut entry_lba = lba;
        for buf in bufs {
            cur.buf.extend_from_slice(buf);
            let len = buf.len() as u64 / SECTOR_SIZE;
            cur.entries.push(DataMapEntry { lba: entry_lba, len });
            entry_lba += len;
        }

        if self.nocache {
            let limit = lba + total as u64 / SECTOR_SIZE;
            let mut displaced = Vec::new();
            let mut map = self.omap.write();
            map.update_displaced(
                lba,
                limit,
                ObjExtent {
                    obj: seq,
                    offset: sector_off,
                },
                &mut displaced,
            );
            drop(map);
            for d in displaced {
                if d.value.obj != seq {
                    if let Some(oi) = st.object_info.get_mut(&d.value.obj) {
                        oi.live_sectors = oi.live_sectors.saturating_sub(d.len());
                    }
                }
            }
        }

        Ok(total)
    }

    /// Single-buffer convenience wrapper over [`Self::writev`]
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.writev(offset, &[buf])
    }

    /// Read `buf.len()` bytes at `offset`. Unmapped ranges read as zeros.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset % SECTOR_SIZE != 0 || buf.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument("read is not sector-aligned"));
        }
        let base = offset / SECTOR_SIZE;
        let limit = base + buf.len() as u64 / SECTOR_SIZE;

        // object, byte offset within object, destination range
        struct BackendRead {
            obj: u32,
            offset: u64,
            buf_start: usize,
            len: usize,
        }
        let mut backend_reads = Vec::new();

        {
            let st = self.state.lock();
            let map = self.omap.read();
            let mut prev = base;
            let mut pos = 0usize;
            for e in map.overlapping(base, limit) {
                if e.base > prev {
                    let gap = ((e.base - prev) * SECTOR_SIZE) as usize;
                    buf[pos..pos + gap].fill(0);
                    pos += gap;
                }
                let len = (e.len() * SECTOR_SIZE) as usize;
                let byte_off = (e.value.offset * SECTOR_SIZE) as usize;
                let obj = e.value.obj;
                let resident = if st.current.as_ref().is_some_and(|b| b.seq == obj) {
                    st.current.as_ref().map(|b| &b.buf)
                } else {
                    st.in_mem.get(&obj).map(|b| &b.buf)
                };
                if let Some(src) = resident {
                    buf[pos..pos + len].copy_from_slice(&src[byte_off..byte_off + len]);
                } else {
                    backend_reads.push(BackendRead {
                        obj,
                        offset: byte_off as u64,
                        buf_start: pos,
                        len,
                    });
                }
                pos += len;
                prev = e.limit;
            }
            if prev < limit {
                buf[pos..].fill(0);
            }
        }

        for r in backend_reads {
            let dst = &mut buf[r.buf_start..r.buf_start + r.len];
            let n = self.backend.read_numbered(r.obj, dst, r.offset)?;
            if n < r.len {
                return Err(Error::backend(format!(
                    "short read from object {}: {} of {} bytes",
                    r.obj, n, r.len
                )));
            }
        }
        Ok(buf.len())
    }

    /// Seal and enqueue the current batch, if non-empty. Returns its
    /// sequence number, or 0 if there was nothing to flush.
    pub fn flush(&self) -> u32 {
        let mut st = self.state.lock();
        let seq = match &st.current {
            Some(b) if !b.buf.is_empty() => b.seq,
            _ => return 0,
        };
        self.seal_locked(&mut st);
        seq
    }

    /// Serialize a checkpoint object (full map + live-object table) and
    /// re-point the superblock at it. Returns the checkpoint's sequence.
    pub fn checkpoint(&self) -> Result<u32> {
        let mut st = self.state.lock();
        if st.current.as_ref().is_some_and(|b| !b.buf.is_empty()) {
            self.seal_locked(&mut st);
        }
        // Claim the sequence before draining: every batch sealed from here
        // on sorts after this checkpoint, so the recovery scan from seq+1
        // cannot miss an object the checkpoint's map does not cover.
        let seq = st.next_seq;
        st.next_seq += 1;
        while (!st.queue.is_empty() || st.active_workers > 0)
            && st.failed.is_none()
            && !st.shutdown
        {
            self.idle_cv.wait(&mut st);
        }
        if let Some(msg) = &st.failed {
            return Err(Error::backend(msg.clone()));
        }
        if st.shutdown {
            return Err(Error::internal("volume is shutting down"));
        }

        let objs: Vec<CkptObjEntry> = st
            .object_info
            .iter()
            .filter(|(_, oi)| oi.obj_type == OBJ_DATA)
            .map(|(&obj, oi)| CkptObjEntry {
                seq: obj,
                hdr_sectors: oi.hdr_sectors,
                data_sectors: oi.data_sectors,
                live_sectors: oi.live_sectors as u32,
            })
            .collect();
        drop(st);

        let entries: Vec<CkptMapEntry> = self
            .omap
            .read()
            .iter()
            .map(|e| CkptMapEntry {
                lba: e.base,
                len: e.len(),
                obj: e.value.obj,
                offset: e.value.offset as u32,
            })
            .collect();

        let buf = build_ckpt(&self.uuid, seq, &[seq], &objs, &[], &entries);
        self.backend.write_numbered(seq, &[&buf])?;
        let sb = build_super(
            &self.uuid,
            self.vol_size / SECTOR_SIZE,
            seq + 1,
            &[seq],
            &[],
            &[],
        );
        self.backend.write_object(&self.name, &[&sb])?;

        let mut st = self.state.lock();
        st.last_ckpt = seq;
        st.object_info.insert(
            seq,
            ObjInfo {
                hdr_sectors: (buf.len() as u64 / SECTOR_SIZE) as u32,
                data_sectors: 0,
                live_sectors: 0,
                obj_type: OBJ_CKPT,
            },
        );
        info!(seq, objs = objs.len(), extents = entries.len(), "translation checkpoint");
        Ok(seq)
    }

    /// Stop worker and background threads. Sealed-but-unwritten batches are
    /// abandoned; callers flush and checkpoint first.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
        }
        self.work_cv.notify_all();
        self.window_cv.notify_all();
        self.idle_cv.notify_all();
        self.tick_cv.notify_all();
        let mut threads = self.threads.lock();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    fn seal_locked(&self, st: &mut XlState) {
        if let Some(b) = st.current.take() {
            if b.buf.is_empty() {
                st.pool.push(b);
                return;
            }
            let b = Arc::new(b);
            st.in_mem.insert(b.seq, b.clone());
            st.queue.push_back(b);
            self.work_cv.notify_one();
        }
    }

    /// Worker: serialize a sealed batch as a DATA object, write it, then
    /// publish its extents. The map references the object only after the
    /// backend write succeeded, so a mapped extent is always readable.
    fn worker_thread(self: Arc<Self>) {
        loop {
            let b = {
                let mut st = self.state.lock();
                loop {
                    if st.shutdown {
                        return;
                    }
                    if st.failed.is_none() && !st.queue.is_empty() {
                        break;
                    }
                    self.work_cv.wait(&mut st);
                }
                let b = st.queue.pop_front().expect("non-empty queue");
                st.active_workers += 1;
                let hdr_sectors = objects::data_hdr_sectors(b.entries.len());
                st.object_info.insert(
                    b.seq,
                    ObjInfo {
                        hdr_sectors,
                        data_sectors: b.sectors() as u32,
                        live_sectors: b.sectors(),
                        obj_type: OBJ_DATA,
                    },
                );
                b
            };

            let last_ckpt = self.state.lock().last_ckpt;
            let hdr = build_data_hdr(&self.uuid, b.seq, last_ckpt, b.sectors() as u32, &b.entries);
            let hdr_sectors = hdr.len() as u64 / SECTOR_SIZE;
            let res = self.backend.write_numbered(b.seq, &[&hdr, &b.buf]);

            let mut st = self.state.lock();
            st.active_workers -= 1;
            match res {
                Err(e) => {
                    error!(seq = b.seq, error = %e, "backend object write failed; volume stops accepting writes");
                    st.object_info.remove(&b.seq);
                    st.failed = Some(e.to_string());
                    st.queue.push_front(b);
                    self.window_cv.notify_all();
                    self.idle_cv.notify_all();
                }
                Ok(()) => {
                    let mut map = self.omap.write();
                    let mut off = hdr_sectors;
                    for e in &b.entries {
                        let mut displaced = Vec::new();
                        map.update_displaced(
                            e.lba,
                            e.lba + e.len,
                            ObjExtent { obj: b.seq, offset: off },
                            &mut displaced,
                        );
                        off += e.len;
                        for d in displaced {
                            if d.value.obj != b.seq {
                                if let Some(oi) = st.object_info.get_mut(&d.value.obj) {
                                    oi.live_sectors = oi.live_sectors.saturating_sub(d.len());
                                }
                            }
                        }
                    }
                    drop(map);
                    st.in_mem.remove(&b.seq);
                    debug!(seq = b.seq, sectors = b.sectors(), "data object committed");
                    if let Ok(mut batch) = Arc::try_unwrap(b) {
                        batch.reset(0);
                        st.pool.push(batch);
                    }
                    self.window_cv.notify_all();
                    if st.queue.is_empty() && st.active_workers == 0 {
                        self.idle_cv.notify_all();
                    }
                }
            }
        }
    }

    /// Periodic checkpoint when enough new sequences have been assigned
    fn ckpt_thread(self: Arc<Self>) {
        let mut seq0 = self.state.lock().next_seq;
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            self.tick_cv.wait_for(&mut st, CKPT_PERIOD);
            if st.shutdown {
                return;
            }
            let cur = st.next_seq;
            drop(st);
            if cur.wrapping_sub(seq0) >= CKPT_INTERVAL {
                seq0 = cur;
                if let Err(e) = self.checkpoint() {
                    // Previous checkpoint stays authoritative; retry next tick.
                    warn!(error = %e, "checkpoint failed");
                }
            }
        }
    }

    /// Seal a batch that has sat non-empty and un-grown too long
    fn flush_thread(self: Arc<Self>) {
        let mut seq0 = 0u32;
        let mut t0 = Instant::now();
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            self.tick_cv.wait_for(&mut st, FLUSH_PERIOD);
            if st.shutdown {
                return;
            }
            let stable = st
                .current
                .as_ref()
                .is_some_and(|b| !b.buf.is_empty() && b.seq == seq0);
            if stable {
                if t0.elapsed() > FLUSH_TIMEOUT {
                    self.seal_locked(&mut st);
                }
            } else {
                seq0 = st.current.as_ref().map_or(0, |b| b.seq);
                t0 = Instant::now();
            }
        }
    }
}

impl Drop for Translate {
    fn drop(&mut self) {
        // Threads hold Arc<Self>, so by the time Drop runs they are joined;
        // this is a backstop for the error paths of open().
        let mut st = self.state.lock();
        st.shutdown = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    fn setup(nocache: bool) -> (Arc<MemBackend>, Arc<ObjMap>, Arc<Translate>) {
        let backend = Arc::new(MemBackend::new("vol"));
        let uuid = Uuid::new_v4();
        Translate::create_volume(backend.as_ref(), "vol", &uuid, 1 << 30).unwrap();
        let omap = Arc::new(ObjMap::new());
        let cfg = Config::default();
        let xl = Translate::open(backend.clone(), omap.clone(), "vol", &cfg, nocache, false)
            .unwrap();
        (backend, omap, xl)
    }

    fn wait_settled(xl: &Translate) {
        for _ in 0..500 {
            {
                let st = xl.state.lock();
                if st.queue.is_empty() && st.active_workers == 0 {
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("translation queue never drained");
    }

    #[test]
    fn test_open_reports_volume_size() {
        let (_be, _omap, xl) = setup(false);
        assert_eq!(xl.volume_size(), 1 << 30);
        xl.shutdown();
    }

    #[test]
    fn test_write_flush_read_round_trip() {
        let (_be, _omap, xl) = setup(false);

        let data = vec![0xA7u8; 4096];
        assert_eq!(xl.write(0, &data).unwrap(), 4096);
        // Not yet flushed: map is empty, read returns zeros.
        let mut buf = vec![0xFFu8; 4096];
        xl.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let seq = xl.flush();
        assert_eq!(seq, 1);
        wait_settled(&xl);

        xl.read(0, &mut buf).unwrap();
        assert_eq!(buf, data);
        xl.shutdown();
    }

    #[test]
    fn test_nocache_read_sees_unflushed_write() {
        let (_be, _omap, xl) = setup(true);

        let data = vec![0x3Cu8; 8192];
        xl.write(512 * 16, &data).unwrap();

        let mut buf = vec![0u8; 8192];
        xl.read(512 * 16, &mut buf).unwrap();
        assert_eq!(buf, data);
        xl.shutdown();
    }

    #[test]
    fn test_read_zero_fills_gaps() {
        let (_be, _omap, xl) = setup(false);
        xl.write(4096, &vec![1u8; 4096]).unwrap();
        xl.flush();
        wait_settled(&xl);

        // Read [0, 12288): hole, data, hole.
        let mut buf = vec![0xEEu8; 12288];
        xl.read(0, &mut buf).unwrap();
        assert!(buf[..4096].iter().all(|&b| b == 0));
        assert!(buf[4096..8192].iter().all(|&b| b == 1));
        assert!(buf[8192..].iter().all(|&b| b == 0));
        xl.shutdown();
    }

    #[test]
    fn test_batch_seals_when_full() {
        let backend = Arc::new(MemBackend::new("vol"));
        let uuid = Uuid::new_v4();
        Translate::create_volume(backend.as_ref(), "vol", &uuid, 1 << 30).unwrap();
        let omap = Arc::new(ObjMap::new());
        let cfg = Config {
            batch_size: 16 * 1024,
            ..Config::default()
        };
        let xl = Translate::open(backend.clone(), omap, "vol", &cfg, false, false).unwrap();

        // Three 8 KiB writes: the third overflows a 16 KiB batch.
        for i in 0..3u64 {
            xl.write(i * 8192, &vec![i as u8 + 1; 8192]).unwrap();
        }
        xl.flush();
        wait_settled(&xl);

        // Two data objects plus the superblock.
        assert_eq!(backend.object_count(), 3);
        let mut buf = vec![0u8; 8192];
        for i in 0..3u64 {
            xl.read(i * 8192, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == i as u8 + 1));
        }
        xl.shutdown();
    }

    #[test]
    fn test_live_sectors_decrement_on_overwrite() {
        let (_be, _omap, xl) = setup(false);

        xl.write(0, &vec![1u8; 8192]).unwrap(); // obj 1: 16 sectors
        xl.flush();
        wait_settled(&xl);
        assert_eq!(xl.live_sectors(1), Some(16));

        // Overwrite the first 4 KiB from a later object.
        xl.write(0, &vec![2u8; 4096]).unwrap(); // obj 2
        xl.flush();
        wait_settled(&xl);
        assert_eq!(xl.live_sectors(1), Some(8));
        assert_eq!(xl.live_sectors(2), Some(8));
        xl.shutdown();
    }

    #[test]
    fn test_self_overwrite_does_not_decrement() {
        let (_be, _omap, xl) = setup(true);

        // Two writes to the same LBA land in the same batch; in nocache
        // mode the second displaces the first inside one object.
        xl.write(0, &vec![1u8; 4096]).unwrap();
        xl.write(0, &vec![2u8; 4096]).unwrap();
        xl.flush();
        wait_settled(&xl);

        // 16 sectors written, all still accounted to obj 1.
        assert_eq!(xl.live_sectors(1), Some(16));
        let mut buf = vec![0u8; 4096];
        xl.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 2));
        xl.shutdown();
    }

    #[test]
    fn test_checkpoint_and_reopen() {
        let (backend, _omap, xl) = setup(false);

        for i in 0..4u64 {
            xl.write(i * 4096, &vec![i as u8 + 10; 4096]).unwrap();
            xl.flush();
        }
        wait_settled(&xl);
        let ck = xl.checkpoint().unwrap();
        assert_eq!(ck, 5);

        // One more write after the checkpoint; recovery must scan it.
        xl.write(4 * 4096, &vec![14u8; 4096]).unwrap();
        xl.flush();
        wait_settled(&xl);
        xl.shutdown();

        let omap2 = Arc::new(ObjMap::new());
        let xl2 = Translate::open(
            backend.clone(),
            omap2,
            "vol",
            &Config::default(),
            false,
            false,
        )
        .unwrap();
        let mut buf = vec![0u8; 4096];
        for i in 0..5u64 {
            xl2.read(i * 4096, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == i as u8 + 10), "lba block {}", i);
        }
        xl2.shutdown();
    }

    #[test]
    fn test_reopen_without_checkpoint_scans_log() {
        let (backend, _omap, xl) = setup(false);
        xl.write(0, &vec![0x42u8; 4096]).unwrap();
        xl.flush();
        wait_settled(&xl);
        xl.shutdown();

        let omap2 = Arc::new(ObjMap::new());
        let xl2 = Translate::open(
            backend.clone(),
            omap2,
            "vol",
            &Config::default(),
            false,
            false,
        )
        .unwrap();
        let mut buf = vec![0u8; 4096];
        xl2.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x42));
        xl2.shutdown();
    }

    #[test]
    fn test_backend_failure_is_fatal_for_writes() {
        struct FailingBackend {
            inner: MemBackend,
        }
        impl ObjectBackend for FailingBackend {
            fn write_object(&self, name: &str, bufs: &[&[u8]]) -> Result<()> {
                if name.contains('.') {
                    return Err(Error::backend("injected failure"));
                }
                self.inner.write_object(name, bufs)
            }
            fn read_object(&self, name: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
                self.inner.read_object(name, buf, offset)
            }
            fn delete_object(&self, name: &str) -> Result<()> {
                self.inner.delete_object(name)
            }
            fn object_name(&self, seq: u32) -> String {
                self.inner.object_name(seq)
            }
        }

        let backend = Arc::new(FailingBackend {
            inner: MemBackend::new("vol"),
        });
        let uuid = Uuid::new_v4();
        Translate::create_volume(backend.as_ref(), "vol", &uuid, 1 << 30).unwrap();
        let omap = Arc::new(ObjMap::new());
        let xl = Translate::open(
            backend.clone(),
            omap,
            "vol",
            &Config::default(),
            false,
            false,
        )
        .unwrap();

        xl.write(0, &vec![1u8; 4096]).unwrap();
        xl.flush();
        for _ in 0..500 {
            if xl.failed() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(xl.failed());
        assert!(xl.write(4096, &vec![2u8; 4096]).is_err());
        xl.shutdown();
    }

    #[test]
    fn test_frontier_tracks_current_batch() {
        let (_be, _omap, xl) = setup(false);
        assert_eq!(xl.frontier(), 0);
        xl.write(0, &vec![0u8; 4096]).unwrap();
        assert_eq!(xl.frontier(), 8);
        xl.flush();
        wait_settled(&xl);
        assert_eq!(xl.frontier(), 0);
        xl.shutdown();
    }
}
