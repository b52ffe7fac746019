//! Read cache: 64 KiB lines of backend objects on the local device
//!
//! Indexed by (object, 64 KiB block) rather than by LBA, so a cached line
//! stays valid no matter how the virtual map above it changes. A 16-bit
//! bitmap per line records which 4 KiB pages are present, letting partial
//! fills satisfy reads without over-fetching. Eviction picks victims
//! uniformly at random; metadata is persisted lazily.

use crate::backend::ObjectBackend;
use crate::layout::{ReadSuper, CACHE_UNIT_SECTORS, READ_SUPER_PAGE};
use crate::nvme::NvmeDevice;
use crate::translate::ObjMap;
use objbd_common::{page_offset, Error, Result, PAGE_SIZE, SECTOR_SIZE};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Eviction thread period
const EVICT_PERIOD: Duration = Duration::from_secs(2);
/// Persist dirty metadata at least this often
const PERSIST_TIMEOUT: Duration = Duration::from_secs(15);

/// A 64 KiB-aligned block of one backend object
type Unit = (u32, u64);

const UNIT_BYTES: u64 = CACHE_UNIT_SECTORS as u64 * SECTOR_SIZE;
const UNIT_SECTORS: u64 = CACHE_UNIT_SECTORS as u64;
const PAGES_PER_UNIT: u64 = UNIT_SECTORS / 8; // 16

struct RcState {
    /// (obj, block) -> cache line
    map: BTreeMap<Unit, u32>,
    /// cache line -> (obj, block); `None` = free
    flat: Vec<Option<Unit>>,
    /// Valid-page mask per line
    bitmap: Vec<u16>,
    free: Vec<u32>,
    /// A busy line is the target of exactly one in-flight fill; its mapping
    /// must not change until the fill commits.
    busy: Vec<bool>,
    map_dirty: bool,
    shutdown: bool,
}

/// The read cache of one volume
pub struct ReadCache {
    dev: Arc<NvmeDevice>,
    backend: Arc<dyn ObjectBackend>,
    omap: Arc<ObjMap>,
    sb: ReadSuper,
    state: Mutex<RcState>,
    busy_cv: Condvar,
    tick_cv: Condvar,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Bitmap of the 4 KiB pages a sector range touches within its 64 KiB unit.
/// `base` and `limit` are sector offsets within the object; only the unit
/// containing `base` is considered.
fn page_mask(base: u64, limit: u64) -> u16 {
    let top = (base + 1).div_ceil(UNIT_SECTORS) * UNIT_SECTORS;
    let limit = limit.min(top);
    let mut base_page = base / 8;
    let limit_page = limit.div_ceil(8);
    let mut val = 0u16;
    let mut i = (base_page % PAGES_PER_UNIT) as u16;
    while base_page < limit_page {
        val |= 1 << i;
        base_page += 1;
        i += 1;
    }
    val
}

impl ReadCache {
    /// Open the read cache: load the superblock, flat map and bitmaps, then
    /// start the eviction thread.
    pub fn open(
        dev: Arc<NvmeDevice>,
        backend: Arc<dyn ObjectBackend>,
        omap: Arc<ObjMap>,
        vol_uuid: &Uuid,
    ) -> Result<Arc<Self>> {
        let mut page = vec![0u8; PAGE_SIZE as usize];
        dev.read_at(page_offset(READ_SUPER_PAGE), &mut page)?;
        let sb = ReadSuper::from_page(&page)?;
        if sb.vol_uuid != *vol_uuid {
            return Err(Error::corrupt("cache device belongs to a different volume"));
        }

        let units = sb.units as usize;
        let mut flat_buf = vec![0u8; sb.map_blocks as usize * PAGE_SIZE as usize];
        dev.read_at(page_offset(sb.map_start), &mut flat_buf)?;
        let mut bitmap_buf = vec![0u8; sb.bitmap_blocks as usize * PAGE_SIZE as usize];
        dev.read_at(page_offset(sb.bitmap_start), &mut bitmap_buf)?;

        let mut map = BTreeMap::new();
        let mut flat = vec![None; units];
        let mut bitmap = vec![0u16; units];
        let mut free = Vec::new();
        for i in 0..units {
            let obj = u32::from_le_bytes(flat_buf[i * 8..i * 8 + 4].try_into().unwrap());
            let blk = u32::from_le_bytes(flat_buf[i * 8 + 4..i * 8 + 8].try_into().unwrap());
            if obj != 0 {
                let unit = (obj, u64::from(blk));
                flat[i] = Some(unit);
                bitmap[i] = u16::from_le_bytes(bitmap_buf[i * 2..i * 2 + 2].try_into().unwrap());
                map.insert(unit, i as u32);
            } else {
                free.push(i as u32);
            }
        }
        info!(units, cached = map.len(), "read cache open");

        let rc = Arc::new(Self {
            dev,
            backend,
            omap,
            sb,
            state: Mutex::new(RcState {
                map,
                flat,
                bitmap,
                free,
                busy: vec![false; units],
                map_dirty: false,
                shutdown: false,
            }),
            busy_cv: Condvar::new(),
            tick_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        let me = rc.clone();
        rc.threads.lock().push(thread::spawn(move || me.evict_thread()));
        Ok(rc)
    }

    /// Device byte offset of a cache line
    fn line_offset(&self, line: u32) -> u64 {
        page_offset(self.sb.base) + u64::from(line) * UNIT_BYTES
    }

    /// Read `[offset, offset+buf.len())`, resolving through the translation
    /// map: cache hits come off the local device, misses fetch a whole
    /// 64 KiB line from the backend and are inserted after the read is
    /// served. Unmapped ranges read as zeros without any backend I/O.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset % SECTOR_SIZE != 0 || buf.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument("read is not sector-aligned"));
        }
        let lba = offset / SECTOR_SIZE;
        let sectors = buf.len() as u64 / SECTOR_SIZE;
        let extents = self.omap.read().overlapping(lba, lba + sectors);

        // (obj, unit-start sector offset, fetched line)
        let mut to_add: Vec<(u32, u64, Vec<u8>)> = Vec::new();
        let mut pos = 0usize;
        let mut cur = lba;
        for e in extents {
            if e.base > cur {
                let gap = ((e.base - cur) * SECTOR_SIZE) as usize;
                buf[pos..pos + gap].fill(0);
                pos += gap;
            }
            let mut base = e.base;
            let mut ptr = e.value;
            while base < e.limit {
                let unit_idx = ptr.offset / UNIT_SECTORS;
                let blk_base = unit_idx * UNIT_SECTORS;
                let blk_offset = ptr.offset % UNIT_SECTORS;
                let blk_top = (blk_offset + (e.limit - base))
                    .min((blk_offset + 1).div_ceil(UNIT_SECTORS) * UNIT_SECTORS);
                let take = blk_top - blk_offset;
                let bytes = (take * SECTOR_SIZE) as usize;
                let mask = page_mask(blk_offset, blk_top);

                let hit = {
                    let st = self.state.lock();
                    match st.map.get(&(ptr.obj, unit_idx)) {
                        Some(&n) if st.bitmap[n as usize] & mask == mask => Some(n),
                        _ => None,
                    }
                };

                if let Some(line) = hit {
                    let dev_off = self.line_offset(line) + blk_offset * SECTOR_SIZE;
                    self.dev.read_at(dev_off, &mut buf[pos..pos + bytes])?;
                } else {
                    let mut line = vec![0u8; UNIT_BYTES as usize];
                    let got = self
                        .backend
                        .read_numbered(ptr.obj, &mut line, blk_base * SECTOR_SIZE)?;
                    let start = (blk_offset * SECTOR_SIZE) as usize;
                    let finish = (blk_top * SECTOR_SIZE) as usize;
                    if finish > got {
                        return Err(Error::backend(format!(
                            "object {} shorter than its mapping",
                            ptr.obj
                        )));
                    }
                    buf[pos..pos + bytes].copy_from_slice(&line[start..finish]);
                    line.truncate(got - got % SECTOR_SIZE as usize);
                    to_add.push((ptr.obj, blk_base, line));
                }

                pos += bytes;
                base += take;
                ptr.offset += take;
            }
            cur = e.limit;
        }
        if pos < buf.len() {
            buf[pos..].fill(0);
        }

        // The read is served; cache fills happen after the fact.
        for (obj, offset, line) in to_add {
            self.add(obj, offset, &line);
        }
        Ok(())
    }

    /// Insert `buf` (sectors of object `obj` starting at 4 KiB-aligned
    /// sector `offset`) into the cache. Reuses the unit's existing line or
    /// takes a free one; with no free line the data is dropped rather than
    /// evicting synchronously. Only whole 4 KiB pages are cached.
    pub fn add(&self, obj: u32, mut offset: u64, buf: &[u8]) {
        debug_assert_eq!(offset % 8, 0);
        let mut pages = buf.len() as u64 / PAGE_SIZE;
        let mut buf_pos = 0usize;

        while pages > 0 {
            let unit_idx = offset / UNIT_SECTORS;
            let first_page = (offset % UNIT_SECTORS) / 8;
            let n_pages = pages.min(PAGES_PER_UNIT - first_page);
            let mut mask = 0u16;
            for i in first_page..first_page + n_pages {
                mask |= 1 << i;
            }

            // Claim a line, waiting out any in-flight fill of the same line.
            let line = {
                let mut st = self.state.lock();
                loop {
                    if st.shutdown {
                        return;
                    }
                    match st.map.get(&(obj, unit_idx)).copied() {
                        Some(n) => {
                            if st.busy[n as usize] {
                                self.busy_cv.wait(&mut st);
                                continue; // mapping may have changed
                            }
                            st.busy[n as usize] = true;
                            break n;
                        }
                        None => match st.free.pop() {
                            Some(n) => {
                                st.busy[n as usize] = true;
                                break n;
                            }
                            None => return,
                        },
                    }
                }
            };

            let dev_off = self.line_offset(line) + first_page * PAGE_SIZE;
            let bytes = (n_pages * PAGE_SIZE) as usize;
            let res = self.dev.write_at(dev_off, &buf[buf_pos..buf_pos + bytes]);

            let mut st = self.state.lock();
            st.busy[line as usize] = false;
            match res {
                Err(e) => {
                    // Insertion is best-effort; give the line back untouched.
                    warn!(error = %e, "cache line fill failed");
                    if st.flat[line as usize].is_none() {
                        st.free.push(line);
                    }
                    self.busy_cv.notify_all();
                    return;
                }
                Ok(()) => {
                    st.map.insert((obj, unit_idx), line);
                    st.flat[line as usize] = Some((obj, unit_idx));
                    st.bitmap[line as usize] |= mask;
                    st.map_dirty = true;
                    self.busy_cv.notify_all();
                }
            }
            drop(st);

            pages -= n_pages;
            offset += n_pages * 8;
            buf_pos += bytes;
        }
    }

    /// Evict up to `n` randomly chosen lines (busy and free picks are
    /// skipped, so progress is probabilistic, as intended).
    fn evict_locked(&self, st: &mut RcState, n: usize, rng: &mut impl Rng) -> usize {
        let mut evicted = 0;
        for _ in 0..n {
            let j = rng.gen_range(0..self.sb.units) as usize;
            if st.busy[j] {
                continue;
            }
            if let Some(unit) = st.flat[j].take() {
                st.map.remove(&unit);
                st.bitmap[j] = 0;
                st.free.push(j as u32);
                evicted += 1;
            }
        }
        evicted
    }

    /// Evict `n` random lines now (tests and tooling)
    pub fn do_evict(&self, n: usize) {
        let mut rng = rand::thread_rng();
        let mut st = self.state.lock();
        self.evict_locked(&mut st, n, &mut rng);
        st.map_dirty = true;
    }

    /// Persist the flat map and bitmaps to their metadata blocks
    pub fn flush_metadata(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.persist_locked(&mut st)
    }

    fn persist_locked(&self, st: &mut MutexGuard<'_, RcState>) -> Result<()> {
        let mut flat_buf = vec![0u8; self.sb.map_blocks as usize * PAGE_SIZE as usize];
        for (i, entry) in st.flat.iter().enumerate() {
            if let Some((obj, blk)) = entry {
                flat_buf[i * 8..i * 8 + 4].copy_from_slice(&obj.to_le_bytes());
                flat_buf[i * 8 + 4..i * 8 + 8].copy_from_slice(&(*blk as u32).to_le_bytes());
            }
        }
        let mut bitmap_buf = vec![0u8; self.sb.bitmap_blocks as usize * PAGE_SIZE as usize];
        for (i, m) in st.bitmap.iter().enumerate() {
            bitmap_buf[i * 2..i * 2 + 2].copy_from_slice(&m.to_le_bytes());
        }
        st.map_dirty = false;

        let map_start = self.sb.map_start;
        let bitmap_start = self.sb.bitmap_start;
        let res = MutexGuard::unlocked(st, || -> Result<()> {
            self.dev.write_at(page_offset(map_start), &flat_buf)?;
            self.dev.write_at(page_offset(bitmap_start), &bitmap_buf)?;
            self.dev.sync()
        });
        if res.is_err() {
            st.map_dirty = true;
        }
        res
    }

    /// Stop the eviction thread, persisting dirty metadata first
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            if st.map_dirty {
                if let Err(e) = self.persist_locked(&mut st) {
                    warn!(error = %e, "final metadata flush failed");
                }
            }
            st.shutdown = true;
        }
        self.tick_cv.notify_all();
        self.busy_cv.notify_all();
        let mut threads = self.threads.lock();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    /// Number of free cache lines (tests)
    pub fn free_lines(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Cache line holding `(obj, block)`, if any (tests)
    pub fn line_for(&self, obj: u32, block: u64) -> Option<u32> {
        self.state.lock().map.get(&(obj, block)).copied()
    }

    /// Valid-page mask of a line (tests)
    pub fn line_mask(&self, line: u32) -> u16 {
        self.state.lock().bitmap[line as usize]
    }

    /// Cache-line count
    pub fn units(&self) -> u32 {
        self.sb.units
    }

    /// Wake every 2 s; replenish the free list by random eviction when it
    /// runs low, and persist metadata on evicting passes or at least every
    /// 15 s while dirty.
    fn evict_thread(self: Arc<Self>) {
        let mut rng = rand::thread_rng();
        let units = self.sb.units as usize;
        let mut last_persist = Instant::now();
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            self.tick_cv.wait_for(&mut st, EVICT_PERIOD);
            if st.shutdown {
                return;
            }
            if !st.map_dirty {
                continue;
            }
            let free = st.free.len();
            let n = if free < units / 16 {
                units / 4 - free
            } else {
                0
            };
            if n > 0 {
                let evicted = self.evict_locked(&mut st, n, &mut rng);
                debug!(evicted, free = st.free.len(), "read cache eviction pass");
            }
            if n > 0 || last_persist.elapsed() > PERSIST_TIMEOUT {
                if let Err(e) = self.persist_locked(&mut st) {
                    warn!(error = %e, "read cache metadata persist failed");
                }
                last_persist = Instant::now();
            }
        }
    }
}
