//! Local cache-device layout
//!
//! Page 0 of the device holds the outer superblock, which names the pages of
//! the write-cache and read-cache superblocks. The write cache owns a
//! metadata region (two alternating checkpoint slots) and the journal ring;
//! the read cache owns its flat-map and bitmap blocks and the cache-line
//! area. All regions are disjoint page ranges of one device.
//!
//! ```text
//! page 0        outer super
//! page 1        write-cache super
//! page 2        read-cache super
//! [3, ml)       write-cache metadata (checkpoint slots)
//! [ml, wl)      journal ring
//! [wl, ...)     read-cache flat map, bitmap, then 16-page cache lines
//! ```

use crate::nvme::NvmeDevice;
use crate::wire::{put_u32, put_u64, put_uuid, Cursor};
use objbd_common::{
    page_offset, Error, PageIdx, Result, Sector, OBJBD_MAGIC, OBJBD_VERSION, PAGE_SIZE,
};
use tracing::info;
use uuid::Uuid;

/// Journal DATA record: header page + payload pages
pub const J_DATA: u32 = 10;
/// Journal CKPT record (reserved for in-ring checkpoints)
pub const J_CKPT: u32 = 11;
/// Journal PAD record: reserves the unusable ring tail
pub const J_PAD: u32 = 12;
/// Outer superblock (device page 0)
pub const J_SUPER: u32 = 13;
/// Write-cache superblock
pub const J_WRITE_SUPER: u32 = 14;
/// Read-cache superblock
pub const J_READ_SUPER: u32 = 15;

/// Read-cache line size in sectors (64 KiB)
pub const CACHE_UNIT_SECTORS: u32 = 128;
/// Pages per read-cache line
pub const CACHE_UNIT_PAGES: u32 = 16;

/// Bytes of one serialized flat-map entry (obj, block index)
pub const FLAT_ENTRY_SIZE: usize = 8;
/// Bytes of one serialized journal map extent (lba, len, plba)
pub const MAP_EXTENT_SIZE: usize = 24;
/// Bytes of one serialized record-length entry (page, len, type)
pub const LENGTH_ENTRY_SIZE: usize = 12;

/// Fixed part of a journal record header, before the extent array
pub const RECORD_HEADER_SIZE: usize = 52;
/// Journal record extent size on disk (lba, len)
pub const RECORD_EXTENT_SIZE: usize = 16;
/// Extent capacity of one record header page
pub const RECORD_MAX_EXTENTS: usize =
    (PAGE_SIZE as usize - RECORD_HEADER_SIZE) / RECORD_EXTENT_SIZE;

/// Device page 0: where to find the two cache superblocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterSuper {
    pub vol_uuid: Uuid,
    pub write_super: PageIdx,
    pub read_super: PageIdx,
    pub backend: u32,
}

impl OuterSuper {
    pub fn to_page(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE as usize);
        put_u32(&mut buf, OBJBD_MAGIC);
        put_u32(&mut buf, J_SUPER);
        put_u32(&mut buf, OBJBD_VERSION);
        put_uuid(&mut buf, &self.vol_uuid);
        put_u32(&mut buf, self.write_super);
        put_u32(&mut buf, self.read_super);
        put_u32(&mut buf, self.backend);
        buf.resize(PAGE_SIZE as usize, 0);
        buf
    }

    pub fn from_page(page: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(page);
        check_super_prefix(&mut c, J_SUPER, "outer superblock")?;
        Ok(Self {
            vol_uuid: c.uuid()?,
            write_super: c.u32()?,
            read_super: c.u32()?,
            backend: c.u32()?,
        })
    }
}

/// Write-cache superblock: ring bounds, cursors, and the location of the
/// last checkpoint's map and record-length arrays. All fields in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSuper {
    pub vol_uuid: Uuid,
    /// Journal sequence to expect next (persisted at checkpoint only)
    pub seq: u64,
    pub meta_base: PageIdx,
    pub meta_limit: PageIdx,
    pub base: PageIdx,
    pub limit: PageIdx,
    pub next: PageIdx,
    pub oldest: PageIdx,
    pub map_start: PageIdx,
    pub map_blocks: u32,
    pub map_entries: u32,
    pub len_start: PageIdx,
    pub len_blocks: u32,
    pub len_entries: u32,
}

impl WriteSuper {
    /// Ring size in pages
    pub fn ring_pages(&self) -> u32 {
        self.limit - self.base
    }

    pub fn to_page(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE as usize);
        put_u32(&mut buf, OBJBD_MAGIC);
        put_u32(&mut buf, J_WRITE_SUPER);
        put_u32(&mut buf, OBJBD_VERSION);
        put_uuid(&mut buf, &self.vol_uuid);
        put_u64(&mut buf, self.seq);
        for v in [
            self.meta_base,
            self.meta_limit,
            self.base,
            self.limit,
            self.next,
            self.oldest,
            self.map_start,
            self.map_blocks,
            self.map_entries,
            self.len_start,
            self.len_blocks,
            self.len_entries,
        ] {
            put_u32(&mut buf, v);
        }
        buf.resize(PAGE_SIZE as usize, 0);
        buf
    }

    pub fn from_page(page: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(page);
        check_super_prefix(&mut c, J_WRITE_SUPER, "write-cache superblock")?;
        let vol_uuid = c.uuid()?;
        let seq = c.u64()?;
        let mut f = [0u32; 12];
        for v in &mut f {
            *v = c.u32()?;
        }
        Ok(Self {
            vol_uuid,
            seq,
            meta_base: f[0],
            meta_limit: f[1],
            base: f[2],
            limit: f[3],
            next: f[4],
            oldest: f[5],
            map_start: f[6],
            map_blocks: f[7],
            map_entries: f[8],
            len_start: f[9],
            len_blocks: f[10],
            len_entries: f[11],
        })
    }
}

/// Read-cache superblock: cache-line geometry and metadata block locations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSuper {
    pub vol_uuid: Uuid,
    /// Cache-line size in sectors (always 128: 64 KiB)
    pub unit_size: u32,
    /// First page of the cache-line area
    pub base: PageIdx,
    /// Number of cache lines
    pub units: u32,
    pub map_start: PageIdx,
    pub map_blocks: u32,
    pub bitmap_start: PageIdx,
    pub bitmap_blocks: u32,
}

impl ReadSuper {
    pub fn to_page(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE as usize);
        put_u32(&mut buf, OBJBD_MAGIC);
        put_u32(&mut buf, J_READ_SUPER);
        put_u32(&mut buf, OBJBD_VERSION);
        put_uuid(&mut buf, &self.vol_uuid);
        for v in [
            self.unit_size,
            self.base,
            self.units,
            self.map_start,
            self.map_blocks,
            self.bitmap_start,
            self.bitmap_blocks,
        ] {
            put_u32(&mut buf, v);
        }
        buf.resize(PAGE_SIZE as usize, 0);
        buf
    }

    pub fn from_page(page: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(page);
        check_super_prefix(&mut c, J_READ_SUPER, "read-cache superblock")?;
        let vol_uuid = c.uuid()?;
        let s = Self {
            vol_uuid,
            unit_size: c.u32()?,
            base: c.u32()?,
            units: c.u32()?,
            map_start: c.u32()?,
            map_blocks: c.u32()?,
            bitmap_start: c.u32()?,
            bitmap_blocks: c.u32()?,
        };
        if s.unit_size != CACHE_UNIT_SECTORS {
            return Err(Error::corrupt(format!(
                "unsupported cache unit size {}",
                s.unit_size
            )));
        }
        Ok(s)
    }
}

fn check_super_prefix(c: &mut Cursor<'_>, expect_type: u32, what: &str) -> Result<()> {
    let magic = c.u32()?;
    if magic != OBJBD_MAGIC {
        return Err(Error::corrupt(format!("{}: bad magic {:#x}", what, magic)));
    }
    let block_type = c.u32()?;
    if block_type != expect_type {
        return Err(Error::corrupt(format!(
            "{}: wrong block type {}",
            what, block_type
        )));
    }
    let version = c.u32()?;
    if version != OBJBD_VERSION {
        return Err(Error::corrupt(format!("{}: version {}", what, version)));
    }
    Ok(())
}

/// One extent named by a journal DATA record: `len` sectors of its payload
/// belong to `lba`, in payload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordExtent {
    pub lba: Sector,
    pub len: Sector,
}

/// Parsed journal record header
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub rec_type: u32,
    pub seq: u64,
    /// Total record length in pages, header included
    pub pages: u32,
    pub extents: Vec<RecordExtent>,
}

/// Build a journal record header page. The crc32c of the page (with the crc
/// field zeroed) is stamped in, so recovery can tell a live record from the
/// stale bytes that legitimately follow the log tail.
pub fn build_record_header(
    vol_uuid: &Uuid,
    rec_type: u32,
    seq: u64,
    pages: u32,
    extents: &[RecordExtent],
) -> Vec<u8> {
    assert!(extents.len() <= RECORD_MAX_EXTENTS);
    let mut buf = Vec::with_capacity(PAGE_SIZE as usize);
    put_u32(&mut buf, OBJBD_MAGIC);
    put_u32(&mut buf, rec_type);
    put_u32(&mut buf, OBJBD_VERSION);
    put_uuid(&mut buf, vol_uuid);
    put_u64(&mut buf, seq);
    put_u32(&mut buf, pages);
    put_u32(&mut buf, 0); // crc, stamped below
    put_u32(&mut buf, RECORD_HEADER_SIZE as u32);
    put_u32(&mut buf, (extents.len() * RECORD_EXTENT_SIZE) as u32);
    for e in extents {
        put_u64(&mut buf, e.lba);
        put_u64(&mut buf, e.len);
    }
    buf.resize(PAGE_SIZE as usize, 0);

    let crc = crc32c::crc32c(&buf);
    buf[40..44].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Parse and verify a journal record header page.
///
/// Any failure (magic, version, UUID, type, crc) means the page is not a
/// live record; recovery treats that as end-of-log.
pub fn parse_record_header(page: &[u8], vol_uuid: &Uuid) -> Result<RecordHeader> {
    let mut c = Cursor::new(page);
    let magic = c.u32()?;
    if magic != OBJBD_MAGIC {
        return Err(Error::corrupt("record: bad magic"));
    }
    let rec_type = c.u32()?;
    if rec_type != J_DATA && rec_type != J_PAD && rec_type != J_CKPT {
        return Err(Error::corrupt("record: unknown type"));
    }
    let version = c.u32()?;
    if version != OBJBD_VERSION {
        return Err(Error::corrupt("record: bad version"));
    }
    let uuid = c.uuid()?;
    if uuid != *vol_uuid {
        return Err(Error::corrupt("record: foreign volume"));
    }
    let seq = c.u64()?;
    let pages = c.u32()?;
    let crc = c.u32()?;
    let extent_offset = c.u32()? as usize;
    let extent_len = c.u32()? as usize;

    let mut copy = page.to_vec();
    copy[40..44].fill(0);
    if crc32c::crc32c(&copy) != crc {
        return Err(Error::corrupt("record: checksum mismatch"));
    }

    if extent_len % RECORD_EXTENT_SIZE != 0 {
        return Err(Error::corrupt("record: extent array length"));
    }
    let mut ec = Cursor::new(page);
    ec.seek(extent_offset)?;
    let mut extents = Vec::with_capacity(extent_len / RECORD_EXTENT_SIZE);
    for _ in 0..extent_len / RECORD_EXTENT_SIZE {
        extents.push(RecordExtent {
            lba: ec.u64()?,
            len: ec.u64()?,
        });
    }

    Ok(RecordHeader {
        rec_type,
        seq,
        pages,
        extents,
    })
}

/// One forward-map extent in a write-cache checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapExtent {
    pub lba: Sector,
    pub len: Sector,
    /// Journal device address, in sectors
    pub plba: Sector,
}

/// One journal-record length in a write-cache checkpoint. Carries the
/// record type so recovery can rebuild the per-page tag array without
/// re-reading headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthEntry {
    pub page: PageIdx,
    pub len: u32,
    pub rec_type: u32,
}

/// Serialize checkpoint map extents, page-padded
pub fn build_map_extents(extents: &[MapExtent]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(extents.len() * MAP_EXTENT_SIZE);
    for e in extents {
        put_u64(&mut buf, e.lba);
        put_u64(&mut buf, e.len);
        put_u64(&mut buf, e.plba);
    }
    crate::wire::pad_to(&mut buf, PAGE_SIZE as usize);
    buf
}

/// Parse `count` checkpoint map extents
pub fn parse_map_extents(buf: &[u8], count: usize) -> Result<Vec<MapExtent>> {
    let mut c = Cursor::new(buf);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(MapExtent {
            lba: c.u64()?,
            len: c.u64()?,
            plba: c.u64()?,
        });
    }
    Ok(out)
}

/// Serialize checkpoint record lengths, page-padded
pub fn build_length_entries(lengths: &[LengthEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(lengths.len() * LENGTH_ENTRY_SIZE);
    for l in lengths {
        put_u32(&mut buf, l.page);
        put_u32(&mut buf, l.len);
        put_u32(&mut buf, l.rec_type);
    }
    crate::wire::pad_to(&mut buf, PAGE_SIZE as usize);
    buf
}

/// Parse `count` checkpoint record lengths
pub fn parse_length_entries(buf: &[u8], count: usize) -> Result<Vec<LengthEntry>> {
    let mut c = Cursor::new(buf);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(LengthEntry {
            page: c.u32()?,
            len: c.u32()?,
            rec_type: c.u32()?,
        });
    }
    Ok(out)
}

/// The computed device layout, as written by [`format_cache`]
#[derive(Debug, Clone, Copy)]
pub struct CacheLayout {
    pub outer: OuterSuper,
    pub write: WriteSuper,
    pub read: ReadSuper,
}

/// Page of the write-cache superblock
pub const WRITE_SUPER_PAGE: PageIdx = 1;
/// Page of the read-cache superblock
pub const READ_SUPER_PAGE: PageIdx = 2;

/// Compute and persist a fresh cache-device layout.
///
/// The write cache takes half of the usable pages (an eighth of its share
/// reserved for checkpoint slots); the read cache takes the rest as 16-page
/// cache lines behind its flat-map and bitmap blocks.
pub fn format_cache(dev: &NvmeDevice, vol_uuid: &Uuid, backend: u32) -> Result<CacheLayout> {
    let total_pages = (dev.size() / PAGE_SIZE) as u32;
    if total_pages < 256 {
        return Err(Error::invalid_argument(format!(
            "cache device too small: {} pages",
            total_pages
        )));
    }

    let usable = total_pages - 3;
    let write_share = usable / 2;
    let meta_pages = (write_share / 8).max(8);
    let meta_base = 3;
    let meta_limit = meta_base + meta_pages;
    let base = meta_limit;
    let limit = 3 + write_share;

    let read_start = limit;
    let read_total = total_pages - read_start;
    let mut units = read_total / CACHE_UNIT_PAGES;
    loop {
        let map_blocks = (units * FLAT_ENTRY_SIZE as u32).div_ceil(PAGE_SIZE as u32);
        let bitmap_blocks = (units * 2).div_ceil(PAGE_SIZE as u32);
        if units * CACHE_UNIT_PAGES + map_blocks + bitmap_blocks <= read_total {
            break;
        }
        units -= 1;
    }
    if units < 4 {
        return Err(Error::invalid_argument(
            "cache device too small for any read-cache lines",
        ));
    }
    let map_blocks = (units * FLAT_ENTRY_SIZE as u32).div_ceil(PAGE_SIZE as u32);
    let bitmap_blocks = (units * 2).div_ceil(PAGE_SIZE as u32);

    let layout = CacheLayout {
        outer: OuterSuper {
            vol_uuid: *vol_uuid,
            write_super: WRITE_SUPER_PAGE,
            read_super: READ_SUPER_PAGE,
            backend,
        },
        write: WriteSuper {
            vol_uuid: *vol_uuid,
            seq: 1,
            meta_base,
            meta_limit,
            base,
            limit,
            next: base,
            oldest: base,
            map_start: 0,
            map_blocks: 0,
            map_entries: 0,
            len_start: 0,
            len_blocks: 0,
            len_entries: 0,
        },
        read: ReadSuper {
            vol_uuid: *vol_uuid,
            unit_size: CACHE_UNIT_SECTORS,
            base: read_start + map_blocks + bitmap_blocks,
            units,
            map_start: read_start,
            map_blocks,
            bitmap_start: read_start + map_blocks,
            bitmap_blocks,
        },
    };

    // Metadata regions must read back as "empty" on first open.
    let zero_page = vec![0u8; PAGE_SIZE as usize];
    for page in read_start..read_start + map_blocks + bitmap_blocks {
        dev.write_at(page_offset(page), &zero_page)?;
    }

    dev.write_at(page_offset(WRITE_SUPER_PAGE), &layout.write.to_page())?;
    dev.write_at(page_offset(READ_SUPER_PAGE), &layout.read.to_page())?;
    dev.write_at(0, &layout.outer.to_page())?;
    dev.sync()?;

    info!(
        ring_pages = layout.write.ring_pages(),
        meta_pages,
        units,
        "formatted cache device"
    );
    Ok(layout)
}

/// Read and validate the outer superblock of an existing cache device
pub fn read_outer_super(dev: &NvmeDevice) -> Result<OuterSuper> {
    let mut page = vec![0u8; PAGE_SIZE as usize];
    dev.read_at(0, &mut page)?;
    OuterSuper::from_page(&page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_super_pages_round_trip() {
        let uuid = Uuid::new_v4();
        let outer = OuterSuper {
            vol_uuid: uuid,
            write_super: 1,
            read_super: 2,
            backend: 0,
        };
        assert_eq!(OuterSuper::from_page(&outer.to_page()).unwrap(), outer);

        let ws = WriteSuper {
            vol_uuid: uuid,
            seq: 99,
            meta_base: 3,
            meta_limit: 19,
            base: 19,
            limit: 119,
            next: 42,
            oldest: 20,
            map_start: 3,
            map_blocks: 2,
            map_entries: 31,
            len_start: 5,
            len_blocks: 1,
            len_entries: 7,
        };
        assert_eq!(WriteSuper::from_page(&ws.to_page()).unwrap(), ws);

        let rs = ReadSuper {
            vol_uuid: uuid,
            unit_size: CACHE_UNIT_SECTORS,
            base: 130,
            units: 64,
            map_start: 119,
            map_blocks: 1,
            bitmap_start: 120,
            bitmap_blocks: 1,
        };
        assert_eq!(ReadSuper::from_page(&rs.to_page()).unwrap(), rs);
    }

    #[test]
    fn test_super_page_rejects_cross_type() {
        let uuid = Uuid::new_v4();
        let outer = OuterSuper {
            vol_uuid: uuid,
            write_super: 1,
            read_super: 2,
            backend: 0,
        };
        assert!(WriteSuper::from_page(&outer.to_page()).is_err());
        assert!(ReadSuper::from_page(&outer.to_page()).is_err());
    }

    #[test]
    fn test_record_header_round_trip() {
        let uuid = Uuid::new_v4();
        let extents = vec![
            RecordExtent { lba: 0, len: 8 },
            RecordExtent { lba: 4096, len: 24 },
        ];
        let page = build_record_header(&uuid, J_DATA, 7, 5, &extents);
        assert_eq!(page.len(), PAGE_SIZE as usize);

        let rec = parse_record_header(&page, &uuid).unwrap();
        assert_eq!(rec.rec_type, J_DATA);
        assert_eq!(rec.seq, 7);
        assert_eq!(rec.pages, 5);
        assert_eq!(rec.extents, extents);
    }

    #[test]
    fn test_record_header_rejects_corruption() {
        let uuid = Uuid::new_v4();
        let page = build_record_header(&uuid, J_PAD, 3, 10, &[]);

        // Flipped payload byte breaks the checksum.
        let mut bad = page.clone();
        bad[100] ^= 1;
        assert!(parse_record_header(&bad, &uuid).is_err());

        // Foreign volume UUID.
        assert!(parse_record_header(&page, &Uuid::new_v4()).is_err());

        // A zeroed (never-written) page is not a record.
        let stale = vec![0u8; PAGE_SIZE as usize];
        assert!(parse_record_header(&stale, &uuid).is_err());
    }

    #[test]
    fn test_map_and_length_arrays_round_trip() {
        let exts = vec![
            MapExtent { lba: 0, len: 8, plba: 160 },
            MapExtent { lba: 100, len: 28, plba: 168 },
        ];
        let buf = build_map_extents(&exts);
        assert_eq!(buf.len(), PAGE_SIZE as usize);
        assert_eq!(parse_map_extents(&buf, 2).unwrap(), exts);

        let lens = vec![
            LengthEntry { page: 20, len: 3, rec_type: J_DATA },
            LengthEntry { page: 23, len: 1, rec_type: J_PAD },
        ];
        let buf = build_length_entries(&lens);
        assert_eq!(parse_length_entries(&buf, 2).unwrap(), lens);
    }

    #[test]
    fn test_format_cache_regions_are_disjoint() {
        let dir = tempdir().unwrap();
        let dev = NvmeDevice::create(dir.path().join("dev"), 8 * 1024 * 1024).unwrap();
        let uuid = Uuid::new_v4();
        let layout = format_cache(&dev, &uuid, 0).unwrap();

        let w = &layout.write;
        let r = &layout.read;
        assert!(w.meta_base >= 3);
        assert!(w.meta_limit <= w.base);
        assert!(w.base < w.limit);
        assert!(r.map_start >= w.limit);
        assert_eq!(r.bitmap_start, r.map_start + r.map_blocks);
        assert_eq!(r.base, r.bitmap_start + r.bitmap_blocks);
        let end = r.base + r.units * CACHE_UNIT_PAGES;
        assert!(u64::from(end) * PAGE_SIZE <= dev.size());

        // Re-read from disk.
        assert_eq!(read_outer_super(&dev).unwrap(), layout.outer);
        let mut page = vec![0u8; PAGE_SIZE as usize];
        dev.read_at(page_offset(WRITE_SUPER_PAGE), &mut page).unwrap();
        assert_eq!(WriteSuper::from_page(&page).unwrap(), *w);
        dev.read_at(page_offset(READ_SUPER_PAGE), &mut page).unwrap();
        assert_eq!(ReadSuper::from_page(&page).unwrap(), *r);
    }

    #[test]
    fn test_format_cache_rejects_tiny_device() {
        let dir = tempdir().unwrap();
        let dev = NvmeDevice::create(dir.path().join("dev"), 64 * 1024).unwrap();
        assert!(format_cache(&dev, &Uuid::new_v4(), 0).is_err());
    }
}
