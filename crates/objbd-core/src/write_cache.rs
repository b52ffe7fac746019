//! Write cache: a durable circular journal on the local device
//!
//! Every host write lands in the journal ring (header page + payload pages,
//! one vectored device write) before it is acknowledged, then the payload is
//! forwarded to the translation layer. The forward map serves reads of data
//! that has not reached the backend yet; the reverse map lets eviction
//! invalidate forward entries in O(range) when ring space is reclaimed. A
//! per-page tag array mirrors the ring's record structure and is rebuilt
//! from checkpoints, never by reading headers at eviction time.

use crate::layout::{
    build_length_entries, build_map_extents, build_record_header, parse_length_entries,
    parse_map_extents, parse_record_header, LengthEntry, MapExtent, RecordExtent, WriteSuper,
    J_CKPT, J_DATA, J_PAD, WRITE_SUPER_PAGE,
};
use crate::nvme::NvmeDevice;
use crate::translate::Translate;
use bytes::Bytes;
use objbd_common::{
    div_round_up, page_offset, Error, PageIdx, Result, Sector, PAGE_SECTORS, PAGE_SIZE,
    SECTOR_SIZE,
};
use objbd_extent::ExtentMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Flush thread period: drain batched work that nothing else kicked
const FLUSH_PERIOD: Duration = Duration::from_millis(50);
/// Checkpoint thread period
const CKPT_PERIOD: Duration = Duration::from_millis(100);
/// Checkpoint when the map has been dirty this long
const CKPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked exactly once when a journaled write is durable (or failed)
pub type WriteCompletion = Box<dyn FnOnce(Result<()>) + Send>;

/// A journal read miss: `[offset, offset+len)` must be served by the
/// translation-layer path into `buf_offset` of the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalMiss {
    pub offset: u64,
    pub len: usize,
    pub buf_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageTag {
    None,
    /// First page of a DATA record; total record pages
    Hdr(u32),
    /// PAD header reserving the ring tail; pages to the ring limit
    Pad(u32),
    Data,
}

struct WcWork {
    lba: Sector,
    data: Bytes,
    done: WriteCompletion,
}

struct WcState {
    sb: WriteSuper,
    /// Journal sequence: loaded from the superblock at open, persisted at
    /// checkpoint, never re-read from disk.
    seq: u64,
    /// vLBA -> device sector
    map: ExtentMap<u64>,
    /// device sector -> vLBA
    rmap: ExtentMap<u64>,
    /// One tag per ring page, index = page - sb.base
    tags: Vec<PageTag>,
    map_dirty: bool,
    work: Vec<WcWork>,
    outstanding_writes: usize,
    total_write_pages: u64,
    /// Records written but not yet known durable, in issue order:
    /// (start page, pages, journal sequence)
    outstanding: Vec<(PageIdx, u32, u64)>,
    next_acked: PageIdx,
    ckpt_in_progress: bool,
    failed: Option<String>,
    shutdown: bool,
}

impl WcState {
    fn tag(&self, page: PageIdx) -> PageTag {
        self.tags[(page - self.sb.base) as usize]
    }

    fn set_tag(&mut self, page: PageIdx, tag: PageTag) {
        self.tags[(page - self.sb.base) as usize] = tag;
    }

    /// Free ring pages: `((oldest + N) - next - 1) mod N`
    fn free_pages(&self) -> u32 {
        let n = self.sb.ring_pages();
        (self.sb.oldest + n - self.sb.next - 1) % n
    }

    /// Reserve `n` pages, wrapping with a PAD reservation when the tail is
    /// short. Any live records in the claimed ranges are evicted first.
    fn allocate(&mut self, n: u32) -> (PageIdx, PageIdx, u32) {
        let mut pad = 0;
        let mut n_pad = 0;
        if self.sb.limit - self.sb.next < n {
            pad = self.sb.next;
            n_pad = self.sb.limit - pad;
            self.evict(pad, self.sb.limit);
            self.sb.next = self.sb.base;
        }
        let page = self.sb.next;
        self.evict(page, page + n);
        self.sb.next += n;
        if self.sb.next == self.sb.limit {
            self.sb.next = self.sb.base;
        }
        (page, pad, n_pad)
    }

    /// Purge all records overlapping `[page, limit)`: trim their extents out
    /// of both maps via the reverse map and clear their tags, advancing
    /// `oldest` whole records at a time.
    fn evict(&mut self, page: PageIdx, limit: PageIdx) {
        let mut page = page;
        while page < limit && self.tag(page) == PageTag::None {
            page += 1;
        }
        if page == limit {
            return;
        }
        debug_assert_eq!(page, self.sb.oldest, "eviction must start at the oldest record");

        let mut oldest = self.sb.oldest;
        while oldest < limit {
            match self.tag(oldest) {
                PageTag::Hdr(len) => {
                    let s_base = u64::from(oldest) * PAGE_SECTORS;
                    let s_limit = u64::from(oldest + len) * PAGE_SECTORS;
                    for h in self.rmap.overlapping(s_base, s_limit) {
                        self.map.trim(h.value, h.value + h.len());
                    }
                    self.rmap.trim(s_base, s_limit);
                    for p in oldest..oldest + len {
                        self.set_tag(p, PageTag::None);
                    }
                    oldest += len;
                }
                PageTag::Pad(_) => {
                    self.set_tag(oldest, PageTag::None);
                    oldest = self.sb.limit;
                }
                PageTag::None => break,
                PageTag::Data => unreachable!("record interior at record boundary"),
            }
        }
        if oldest >= self.sb.limit {
            oldest = self.sb.base;
        }
        self.sb.oldest = oldest;
    }

    fn record_outstanding(&mut self, start: PageIdx, len: u32, seq: u64) {
        self.outstanding.push((start, len, seq));
    }

    /// Mark a record durable; `next_acked` follows the oldest record still
    /// in flight, so it only ever advances.
    fn notify_complete(&mut self, start: PageIdx, len: u32) {
        if let Some(i) = self
            .outstanding
            .iter()
            .position(|&(s, l, _)| s == start && l == len)
        {
            self.outstanding.remove(i);
        }
        self.next_acked = self
            .outstanding
            .first()
            .map_or(self.sb.next, |&(s, _, _)| s);
    }

    /// The sequence recovery must expect at `next_acked`: the oldest
    /// in-flight record's, or the counter itself when nothing is in flight.
    fn acked_seq(&self) -> u64 {
        self.outstanding.first().map_or(self.seq, |&(_, _, s)| s)
    }
}

/// The write cache of one volume
pub struct WriteCache {
    dev: Arc<NvmeDevice>,
    xlate: Arc<Translate>,
    uuid: Uuid,
    write_batch: usize,
    max_write_pages: u64,
    state: Mutex<WcState>,
    window_cv: Condvar,
    tick_cv: Condvar,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WriteCache {
    /// Open the write cache: read the superblock, load the last checkpoint,
    /// roll the log forward, then start the flush and checkpoint threads.
    pub fn open(
        dev: Arc<NvmeDevice>,
        xlate: Arc<Translate>,
        write_batch: usize,
    ) -> Result<Arc<Self>> {
        let mut page = vec![0u8; PAGE_SIZE as usize];
        dev.read_at(page_offset(WRITE_SUPER_PAGE), &mut page)?;
        let sb = WriteSuper::from_page(&page)?;
        if sb.vol_uuid != xlate.uuid() {
            return Err(Error::corrupt("cache device belongs to a different volume"));
        }

        let ring = sb.ring_pages() as usize;
        let wc = Arc::new(Self {
            dev,
            xlate,
            uuid: sb.vol_uuid,
            write_batch,
            max_write_pages: sb.ring_pages() as u64 / 2,
            state: Mutex::new(WcState {
                seq: sb.seq,
                map: ExtentMap::new(),
                rmap: ExtentMap::new(),
                tags: vec![PageTag::None; ring],
                map_dirty: false,
                work: Vec::new(),
                outstanding_writes: 0,
                total_write_pages: 0,
                outstanding: Vec::new(),
                next_acked: sb.next,
                ckpt_in_progress: false,
                failed: None,
                shutdown: false,
                sb,
            }),
            window_cv: Condvar::new(),
            tick_cv: Condvar::new(),
            threads: Mutex::new(Vec::new()),
        });

        wc.read_checkpoint()?;
        let replayed = wc.roll_log_forward()?;
        if replayed > 0 {
            wc.write_checkpoint()?;
        }
        {
            let st = wc.state.lock();
            info!(
                next = st.sb.next,
                oldest = st.sb.oldest,
                seq = st.seq,
                replayed,
                "write cache open"
            );
        }

        let mut threads = wc.threads.lock();
        {
            let me = wc.clone();
            threads.push(thread::spawn(move || me.flush_thread()));
        }
        {
            let me = wc.clone();
            threads.push(thread::spawn(move || me.ckpt_thread()));
        }
        drop(threads);
        Ok(wc)
    }

    /// Load the forward map, reverse map and page tags from the checkpoint
    /// slot the superblock names.
    fn read_checkpoint(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.sb.map_entries > 0 {
            let mut buf = vec![0u8; st.sb.map_blocks as usize * PAGE_SIZE as usize];
            self.dev.read_at(page_offset(st.sb.map_start), &mut buf)?;
            let extents = parse_map_extents(&buf, st.sb.map_entries as usize)?;
            for e in extents {
                st.map.update(e.lba, e.lba + e.len, e.plba);
                st.rmap.update(e.plba, e.plba + e.len, e.lba);
            }
        }
        if st.sb.len_entries > 0 {
            let mut buf = vec![0u8; st.sb.len_blocks as usize * PAGE_SIZE as usize];
            self.dev.read_at(page_offset(st.sb.len_start), &mut buf)?;
            let lengths = parse_length_entries(&buf, st.sb.len_entries as usize)?;
            for l in lengths {
                if l.rec_type == J_PAD {
                    st.set_tag(l.page, PageTag::Pad(l.len));
                } else {
                    st.set_tag(l.page, PageTag::Hdr(l.len));
                    for p in l.page + 1..l.page + l.len {
                        st.set_tag(p, PageTag::Data);
                    }
                }
            }
        }
        Ok(())
    }

    /// Replay journal records written after the last checkpoint. A header
    /// that fails validation or breaks the sequence chain is the end of the
    /// log, not corruption: stale pages legitimately follow the tail.
    fn roll_log_forward(&self) -> Result<u32> {
        let mut st = self.state.lock();
        let mut replayed = 0;
        loop {
            let mut page = vec![0u8; PAGE_SIZE as usize];
            self.dev.read_at(page_offset(st.sb.next), &mut page)?;
            let rec = match parse_record_header(&page, &self.uuid) {
                Ok(rec) => rec,
                Err(_) => break,
            };
            if rec.seq != st.seq || rec.rec_type == J_CKPT {
                break;
            }
            st.seq += 1;

            if rec.rec_type == J_PAD {
                let next = st.sb.next;
                st.set_tag(next, PageTag::Pad(rec.pages));
                st.sb.next = st.sb.base;
                continue;
            }

            let start = st.sb.next;
            st.set_tag(start, PageTag::Hdr(rec.pages));
            for p in start + 1..start + rec.pages {
                st.set_tag(p, PageTag::Data);
            }

            let mut data = vec![0u8; (rec.pages - 1) as usize * PAGE_SIZE as usize];
            self.dev.read_at(page_offset(start + 1), &mut data)?;

            let mut plba = u64::from(start + 1) * PAGE_SECTORS;
            let mut off = 0usize;
            for e in &rec.extents {
                let mut displaced = Vec::new();
                st.map.update_displaced(e.lba, e.lba + e.len, plba, &mut displaced);
                for d in displaced {
                    st.rmap.trim(d.value, d.value + d.len());
                }
                st.rmap.update(plba, plba + e.len, e.lba);

                let bytes = (e.len * SECTOR_SIZE) as usize;
                self.xlate.writev(e.lba * SECTOR_SIZE, &[&data[off..off + bytes]])?;
                plba += e.len;
                off += bytes;
            }
            st.map_dirty = true;
            st.sb.next += rec.pages;
            if st.sb.next >= st.sb.limit {
                st.sb.next = st.sb.base;
            }
            replayed += 1;
        }
        st.next_acked = st.sb.next;
        if replayed > 0 {
            debug!(records = replayed, "journal rolled forward");
        }
        Ok(replayed)
    }

    /// Journal a write at sector `lba`. `done` fires exactly once, after the
    /// record is durable on the local device and the payload has been handed
    /// to the translation layer.
    pub fn write(&self, lba: Sector, data: Bytes, done: WriteCompletion) -> Result<()> {
        if data.is_empty() || data.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument("write is not sector-aligned"));
        }
        let pages = div_round_up(data.len() as u64 / SECTOR_SIZE, PAGE_SECTORS);
        if pages + 1 > self.max_write_pages {
            return Err(Error::invalid_argument(format!(
                "write of {} pages exceeds the journal window",
                pages
            )));
        }

        let mut st = self.state.lock();
        // Back-pressure: cap outstanding journal pages at half the ring.
        while st.total_write_pages + pages > self.max_write_pages
            && st.failed.is_none()
            && !st.shutdown
        {
            self.window_cv.wait(&mut st);
        }
        if let Some(msg) = &st.failed {
            return Err(device_failed(msg));
        }
        if st.shutdown {
            return Err(Error::internal("write cache is shutting down"));
        }
        st.total_write_pages += pages;
        st.work.push(WcWork { lba, data, done });

        if st.outstanding_writes == 0 || st.work.len() >= self.write_batch {
            self.send_writes(&mut st);
        }
        Ok(())
    }

    /// Drain queued work into one journal record: allocate ring pages (plus
    /// an optional PAD), write header + payloads + zero fill in a single
    /// vectored I/O, then publish the maps, forward the payloads and fire
    /// completions.
    fn send_writes(&self, st: &mut MutexGuard<'_, WcState>) {
        let work: Vec<WcWork> = st.work.drain(..).collect();
        if work.is_empty() {
            return;
        }
        let sectors: u64 = work.iter().map(|w| w.data.len() as u64 / SECTOR_SIZE).sum();
        let pages = div_round_up(sectors, PAGE_SECTORS) as u32;

        let (page, pad, n_pad) = st.allocate(pages + 1);
        if pad != 0 {
            st.set_tag(pad, PageTag::Pad(n_pad));
        }
        st.set_tag(page, PageTag::Hdr(pages + 1));
        for p in page + 1..page + 1 + pages {
            st.set_tag(p, PageTag::Data);
        }

        let mut pad_seq = 0;
        let pad_hdr = (pad != 0).then(|| {
            pad_seq = st.seq;
            st.seq += 1;
            build_record_header(&self.uuid, J_PAD, pad_seq, n_pad, &[])
        });
        let extents: Vec<RecordExtent> = work
            .iter()
            .map(|w| RecordExtent {
                lba: w.lba,
                len: w.data.len() as u64 / SECTOR_SIZE,
            })
            .collect();
        let data_seq = st.seq;
        st.seq += 1;
        let hdr = build_record_header(&self.uuid, J_DATA, data_seq, pages + 1, &extents);

        if pad != 0 {
            st.record_outstanding(pad, n_pad, pad_seq);
        }
        st.record_outstanding(page, pages + 1, data_seq);
        st.outstanding_writes += 1;

        let fill = (u64::from(pages) * PAGE_SIZE - sectors * SECTOR_SIZE) as usize;
        let zeros = vec![0u8; fill];

        let res = MutexGuard::unlocked(st, || -> Result<()> {
            if let Some(ph) = &pad_hdr {
                self.dev.write_at(page_offset(pad), ph)?;
            }
            let mut iov: Vec<&[u8]> = Vec::with_capacity(work.len() + 2);
            iov.push(&hdr);
            for w in &work {
                iov.push(&w.data);
            }
            if !zeros.is_empty() {
                iov.push(&zeros);
            }
            self.dev.writev_at(page_offset(page), &iov)?;
            self.dev.sync()
        });

        st.outstanding_writes -= 1;
        match res {
            Err(e) => {
                let msg = e.to_string();
                warn!(error = %msg, "journal write failed; volume stops accepting writes");
                st.failed = Some(msg.clone());
                self.window_cv.notify_all();
                MutexGuard::unlocked(st, || {
                    for w in work {
                        (w.done)(Err(device_failed(&msg)));
                    }
                });
            }
            Ok(()) => {
                let mut plba = u64::from(page + 1) * PAGE_SECTORS;
                let mut released = 0u64;
                for w in &work {
                    let len = w.data.len() as u64 / SECTOR_SIZE;
                    let mut displaced = Vec::new();
                    st.map.update_displaced(w.lba, w.lba + len, plba, &mut displaced);
                    for d in displaced {
                        st.rmap.trim(d.value, d.value + d.len());
                    }
                    st.rmap.update(plba, plba + len, w.lba);
                    plba += len;
                    released += div_round_up(len, PAGE_SECTORS);
                }
                st.map_dirty = true;
                if pad != 0 {
                    st.notify_complete(pad, n_pad);
                }
                st.notify_complete(page, pages + 1);

                MutexGuard::unlocked(st, || {
                    for w in work {
                        if let Err(e) = self.xlate.writev(w.lba * SECTOR_SIZE, &[&w.data]) {
                            warn!(error = %e, "translation layer rejected journaled write");
                        }
                        (w.done)(Ok(()));
                    }
                });

                st.total_write_pages -= released;
                self.window_cv.notify_all();
                if !st.work.is_empty()
                    && (st.outstanding_writes == 0 || st.work.len() >= self.write_batch)
                {
                    self.send_writes(st);
                }
            }
        }
    }

    /// First overlapping journal extent for `[offset, offset+bytes)`:
    /// returns (bytes below the hit, bytes of the hit, device byte offset of
    /// the hit). A miss returns `(bytes, 0, None)`; callers iterate until
    /// the range is consumed.
    pub fn read_lookup(&self, offset: u64, bytes: usize) -> (usize, usize, Option<u64>) {
        let base = offset / SECTOR_SIZE;
        let limit = base + bytes as u64 / SECTOR_SIZE;
        let st = self.state.lock();
        match st.map.lookup(base) {
            Some(e) if e.base < limit => {
                let skip = (e.base.saturating_sub(base) * SECTOR_SIZE) as usize;
                let hit_base = e.base.max(base);
                let hit_limit = e.limit.min(limit);
                let plba = e.value + (hit_base - e.base);
                let read_len = ((hit_limit - hit_base) * SECTOR_SIZE) as usize;
                (skip, read_len, Some(plba * SECTOR_SIZE))
            }
            _ => (bytes, 0, None),
        }
    }

    /// Serve `[offset, offset+buf.len())` from the journal where possible.
    /// Hits are read into `buf`; the returned misses are the holes the
    /// caller fills from the read cache.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<Vec<JournalMiss>> {
        if offset % SECTOR_SIZE != 0 || buf.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::invalid_argument("read is not sector-aligned"));
        }
        let mut misses = Vec::new();
        let mut pos = 0usize;
        while pos < buf.len() {
            let (skip, read_len, dev_off) = self.read_lookup(offset + pos as u64, buf.len() - pos);
            if skip > 0 {
                misses.push(JournalMiss {
                    offset: offset + pos as u64,
                    len: skip,
                    buf_offset: pos,
                });
                pos += skip;
            }
            if let Some(off) = dev_off {
                self.dev.read_at(off, &mut buf[pos..pos + read_len])?;
                pos += read_len;
            }
        }
        Ok(misses)
    }

    /// Block until every admitted write has been journaled and completed
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.work.is_empty() {
            self.send_writes(&mut st);
        }
        while st.total_write_pages > 0 && st.failed.is_none() && !st.shutdown {
            self.window_cv.wait(&mut st);
        }
        match &st.failed {
            Some(msg) => Err(device_failed(msg)),
            None => Ok(()),
        }
    }

    /// Persist the forward map and record-length list into the inactive
    /// checkpoint slot, then rewrite the superblock in place. A crash at any
    /// point leaves the previous checkpoint intact.
    pub fn write_checkpoint(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.ckpt_in_progress {
            return Ok(());
        }
        st.ckpt_in_progress = true;

        let mut lengths = Vec::new();
        for i in 0..st.sb.ring_pages() {
            let page = st.sb.base + i;
            let entry = match st.tags[i as usize] {
                PageTag::Hdr(len) => Some(LengthEntry {
                    page,
                    len,
                    rec_type: J_DATA,
                }),
                PageTag::Pad(len) => Some(LengthEntry {
                    page,
                    len,
                    rec_type: J_PAD,
                }),
                _ => None,
            };
            if let Some(entry) = entry {
                if page < st.next_acked || page >= st.sb.oldest {
                    lengths.push(entry);
                }
            }
        }
        let extents: Vec<MapExtent> = st
            .map
            .iter()
            .map(|e| MapExtent {
                lba: e.base,
                len: e.len(),
                plba: e.value,
            })
            .collect();

        let map_buf = build_map_extents(&extents);
        let len_buf = build_length_entries(&lengths);
        let map_pages = (map_buf.len() as u64 / PAGE_SIZE) as u32;
        let len_pages = (len_buf.len() as u64 / PAGE_SIZE) as u32;

        // Alternate between the two halves of the metadata region.
        let slot_pages = (st.sb.meta_limit - st.sb.meta_base) / 2;
        let mut slot = st.sb.meta_base;
        if st.sb.map_start == slot {
            slot = st.sb.meta_base + slot_pages;
        }
        if map_pages + len_pages > slot_pages {
            st.ckpt_in_progress = false;
            warn!(
                extents = extents.len(),
                "journal map does not fit a checkpoint slot; deferring"
            );
            return Ok(());
        }

        let mut new_sb = st.sb;
        new_sb.seq = st.acked_seq();
        new_sb.next = st.next_acked;
        new_sb.map_start = slot;
        new_sb.map_blocks = map_pages;
        new_sb.map_entries = extents.len() as u32;
        new_sb.len_start = slot + map_pages;
        new_sb.len_blocks = len_pages;
        new_sb.len_entries = lengths.len() as u32;
        let sb_page = new_sb.to_page();

        let res = MutexGuard::unlocked(&mut st, || -> Result<()> {
            self.dev.write_at(page_offset(slot), &map_buf)?;
            self.dev
                .write_at(page_offset(slot + map_pages), &len_buf)?;
            self.dev
                .write_at(page_offset(WRITE_SUPER_PAGE), &sb_page)?;
            self.dev.sync()
        });

        st.ckpt_in_progress = false;
        match res {
            Err(e) => {
                // The previous checkpoint stays authoritative; retried on
                // the next tick.
                warn!(error = %e, "journal checkpoint failed");
                Err(e)
            }
            Ok(()) => {
                st.sb.map_start = slot;
                st.sb.map_blocks = map_pages;
                st.sb.map_entries = extents.len() as u32;
                st.sb.len_start = slot + map_pages;
                st.sb.len_blocks = len_pages;
                st.sb.len_entries = lengths.len() as u32;
                st.map_dirty = false;
                debug!(extents = extents.len(), records = lengths.len(), slot, "journal checkpoint");
                Ok(())
            }
        }
    }

    /// Stop background threads. Callers flush and checkpoint first.
    pub fn shutdown(&self) {
        {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            st.shutdown = true;
        }
        self.window_cv.notify_all();
        self.tick_cv.notify_all();
        let mut threads = self.threads.lock();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }

    /// Snapshot of the in-memory superblock (tests and tooling)
    pub fn super_snapshot(&self) -> WriteSuper {
        let st = self.state.lock();
        let mut sb = st.sb;
        sb.seq = st.seq;
        sb
    }

    /// Durability frontier: every record below this ring page is on disk
    pub fn next_acked_page(&self) -> PageIdx {
        self.state.lock().next_acked
    }

    /// Current free-page count by the ring-arithmetic definition
    pub fn free_pages(&self) -> u32 {
        self.state.lock().free_pages()
    }

    /// Number of forward-map extents (tests)
    pub fn map_extent_count(&self) -> usize {
        self.state.lock().map.len()
    }

    #[cfg(test)]
    fn fail_for_testing(&self, msg: &str) {
        self.state.lock().failed = Some(msg.to_string());
    }

    fn flush_thread(self: Arc<Self>) {
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            self.tick_cv.wait_for(&mut st, FLUSH_PERIOD);
            if st.shutdown {
                return;
            }
            if st.outstanding_writes == 0 && !st.work.is_empty() {
                self.send_writes(&mut st);
            }
        }
    }

    /// Checkpoint when a quarter of the ring has been written since the last
    /// one, or when the map has stayed dirty for too long.
    fn ckpt_thread(self: Arc<Self>) {
        let (mut next0, n) = {
            let st = self.state.lock();
            (st.sb.next, st.sb.ring_pages())
        };
        let mut t0 = Instant::now();
        loop {
            let mut st = self.state.lock();
            if st.shutdown {
                return;
            }
            self.tick_cv.wait_for(&mut st, CKPT_PERIOD);
            if st.shutdown {
                return;
            }
            let written = (st.sb.next + n - next0) % n;
            let do_ckpt = written > n / 4 || (t0.elapsed() > CKPT_TIMEOUT && st.map_dirty);
            if do_ckpt {
                next0 = st.sb.next;
                t0 = Instant::now();
                drop(st);
                let _ = self.write_checkpoint();
            }
        }
    }
}

fn device_failed(msg: &str) -> Error {
    Error::Device(std::io::Error::other(msg.to_string()))
}
