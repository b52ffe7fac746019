//! On-the-wire backend object formats
//!
//! Every backend object starts with a fixed [`ObjHeader`] followed by a
//! type-specific sub-header whose variable-length arrays are addressed by
//! absolute `(offset, len)` pairs within the header region. Header regions
//! are zero-padded to a 4 KiB multiple; a DATA object's payload sectors
//! follow its header. Objects are immutable once written.

use crate::wire::{pad_to, put_u32, put_u64, put_uuid, Cursor};
use objbd_common::{Error, Result, Sector, OBJBD_MAGIC, OBJBD_VERSION, PAGE_SIZE, SECTOR_SIZE};
use uuid::Uuid;

/// Volume superblock object
pub const OBJ_SUPER: u32 = 1;
/// Numbered data object (one sealed batch)
pub const OBJ_DATA: u32 = 2;
/// Numbered checkpoint object (map + live-object table snapshot)
pub const OBJ_CKPT: u32 = 3;

/// Serialized size of [`ObjHeader`]
pub const OBJ_HEADER_SIZE: usize = 40;

/// Fixed header shared by every backend object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjHeader {
    pub vol_uuid: Uuid,
    pub obj_type: u32,
    pub seq: u32,
    pub hdr_sectors: u32,
    pub data_sectors: u32,
}

impl ObjHeader {
    fn put(&self, buf: &mut Vec<u8>) {
        put_u32(buf, OBJBD_MAGIC);
        put_u32(buf, OBJBD_VERSION);
        put_uuid(buf, &self.vol_uuid);
        put_u32(buf, self.obj_type);
        put_u32(buf, self.seq);
        put_u32(buf, self.hdr_sectors);
        put_u32(buf, self.data_sectors);
    }

    fn parse(c: &mut Cursor<'_>) -> Result<Self> {
        let magic = c.u32()?;
        if magic != OBJBD_MAGIC {
            return Err(Error::corrupt(format!("bad object magic {:#x}", magic)));
        }
        let version = c.u32()?;
        if version != OBJBD_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported object version {}",
                version
            )));
        }
        Ok(Self {
            vol_uuid: c.uuid()?,
            obj_type: c.u32()?,
            seq: c.u32()?,
            hdr_sectors: c.u32()?,
            data_sectors: c.u32()?,
        })
    }

    /// Header region size in bytes
    pub fn hdr_bytes(&self) -> usize {
        self.hdr_sectors as usize * SECTOR_SIZE as usize
    }
}

/// One entry of a DATA object's map: `len` sectors of payload for `lba`,
/// in payload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataMapEntry {
    pub lba: Sector,
    pub len: Sector,
}

const DATA_MAP_ENTRY_SIZE: usize = 16;

/// Record of an object rewritten by a cleaner (carried, unused here)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjCleaned {
    pub seq: u32,
    pub was_deleted: u32,
}

const OBJ_CLEANED_SIZE: usize = 8;

/// Live-object table entry inside a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkptObjEntry {
    pub seq: u32,
    pub hdr_sectors: u32,
    pub data_sectors: u32,
    pub live_sectors: u32,
}

const CKPT_OBJ_ENTRY_SIZE: usize = 16;

/// Full-map entry inside a checkpoint: `[lba, lba+len)` lives at
/// `(obj, offset)`, offset in sectors from the object start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CkptMapEntry {
    pub lba: Sector,
    pub len: Sector,
    pub obj: u32,
    pub offset: u32,
}

const CKPT_MAP_ENTRY_SIZE: usize = 24;

/// Deletion deferred until the next checkpoint commits (carried, unused here)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredDelete {
    pub seq: u32,
    pub time: u32,
}

const DEFERRED_DELETE_SIZE: usize = 8;

/// Snapshot record in the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapInfo {
    pub snap_uuid: Uuid,
    pub seq: u32,
}

const SNAP_INFO_SIZE: usize = 20;

/// Clone-ancestry record in the superblock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneInfo {
    pub vol_uuid: Uuid,
    pub seq: u32,
    pub name: String,
}

/// Parsed superblock object
#[derive(Debug, Clone)]
pub struct SuperInfo {
    pub hdr: ObjHeader,
    pub vol_size: Sector,
    pub next_obj: u32,
    pub ckpts: Vec<u32>,
    pub clones: Vec<CloneInfo>,
    pub snaps: Vec<SnapInfo>,
}

/// Parsed DATA object header region
#[derive(Debug, Clone)]
pub struct DataInfo {
    pub hdr: ObjHeader,
    pub last_data_obj: u32,
    pub ckpts: Vec<u32>,
    pub cleaned: Vec<ObjCleaned>,
    pub map: Vec<DataMapEntry>,
}

/// Parsed checkpoint object
#[derive(Debug, Clone)]
pub struct CkptInfo {
    pub hdr: ObjHeader,
    pub ckpts: Vec<u32>,
    pub objs: Vec<CkptObjEntry>,
    pub deletes: Vec<DeferredDelete>,
    pub map: Vec<CkptMapEntry>,
}

fn hdr_sectors_for(bytes: usize) -> u32 {
    (objbd_common::round_up(bytes as u64, PAGE_SIZE) / SECTOR_SIZE) as u32
}

/// Header sectors of a DATA object carrying `n_entries` map entries.
/// Matches what [`build_data_hdr`] will produce.
pub fn data_hdr_sectors(n_entries: usize) -> u32 {
    hdr_sectors_for(OBJ_HEADER_SIZE + 28 + 4 + n_entries * DATA_MAP_ENTRY_SIZE)
}

/// Parse just the fixed header of any backend object
pub fn parse_header(buf: &[u8]) -> Result<ObjHeader> {
    ObjHeader::parse(&mut Cursor::new(buf))
}

/// Serialize a superblock object (page-padded)
pub fn build_super(
    vol_uuid: &Uuid,
    vol_size: Sector,
    next_obj: u32,
    ckpts: &[u32],
    clones: &[CloneInfo],
    snaps: &[SnapInfo],
) -> Vec<u8> {
    let clones_bytes: usize = clones.iter().map(|c| 21 + c.name.len()).sum();
    let fixed = OBJ_HEADER_SIZE + 36;
    let ckpts_off = fixed;
    let clones_off = ckpts_off + ckpts.len() * 4;
    let snaps_off = clones_off + clones_bytes;
    let total = snaps_off + snaps.len() * SNAP_INFO_SIZE;

    let mut buf = Vec::with_capacity(total);
    ObjHeader {
        vol_uuid: *vol_uuid,
        obj_type: OBJ_SUPER,
        seq: 0,
        hdr_sectors: hdr_sectors_for(total),
        data_sectors: 0,
    }
    .put(&mut buf);

    put_u64(&mut buf, vol_size);
    put_u32(&mut buf, next_obj);
    put_u32(&mut buf, ckpts_off as u32);
    put_u32(&mut buf, (ckpts.len() * 4) as u32);
    put_u32(&mut buf, clones_off as u32);
    put_u32(&mut buf, clones_bytes as u32);
    put_u32(&mut buf, snaps_off as u32);
    put_u32(&mut buf, (snaps.len() * SNAP_INFO_SIZE) as u32);

    for ck in ckpts {
        put_u32(&mut buf, *ck);
    }
    for cl in clones {
        put_uuid(&mut buf, &cl.vol_uuid);
        put_u32(&mut buf, cl.seq);
        buf.push(cl.name.len() as u8);
        buf.extend_from_slice(cl.name.as_bytes());
    }
    for sn in snaps {
        put_uuid(&mut buf, &sn.snap_uuid);
        put_u32(&mut buf, sn.seq);
    }
    pad_to(&mut buf, PAGE_SIZE as usize);
    buf
}

/// Parse a superblock object header region
pub fn parse_super(buf: &[u8]) -> Result<SuperInfo> {
    let mut c = Cursor::new(buf);
    let hdr = ObjHeader::parse(&mut c)?;
    if hdr.obj_type != OBJ_SUPER {
        return Err(Error::corrupt(format!(
            "expected superblock object, found type {}",
            hdr.obj_type
        )));
    }
    let vol_size = c.u64()?;
    let next_obj = c.u32()?;
    let (ckpts_off, ckpts_len) = (c.u32()? as usize, c.u32()? as usize);
    let (clones_off, clones_len) = (c.u32()? as usize, c.u32()? as usize);
    let (snaps_off, snaps_len) = (c.u32()? as usize, c.u32()? as usize);

    let ckpts = parse_u32_array(buf, ckpts_off, ckpts_len)?;

    let mut clones = Vec::new();
    let mut cc = Cursor::new(buf);
    cc.seek(clones_off)?;
    let clones_end = clones_off + clones_len;
    while cc.position() < clones_end {
        let vol_uuid = cc.uuid()?;
        let seq = cc.u32()?;
        let name_len = cc.u8()? as usize;
        let name = std::str::from_utf8(cc.take(name_len)?)
            .map_err(|_| Error::corrupt("clone name is not UTF-8"))?
            .to_string();
        clones.push(CloneInfo {
            vol_uuid,
            seq,
            name,
        });
    }

    let mut snaps = Vec::new();
    let mut sc = Cursor::new(buf);
    sc.seek(snaps_off)?;
    if snaps_len % SNAP_INFO_SIZE != 0 {
        return Err(Error::corrupt("snapshot array length"));
    }
    for _ in 0..snaps_len / SNAP_INFO_SIZE {
        snaps.push(SnapInfo {
            snap_uuid: sc.uuid()?,
            seq: sc.u32()?,
        });
    }

    Ok(SuperInfo {
        hdr,
        vol_size,
        next_obj,
        ckpts,
        clones,
        snaps,
    })
}

/// Serialize a DATA object header region (page-padded). The payload sectors
/// named by `map` follow this region on the wire, in `map` order.
pub fn build_data_hdr(
    vol_uuid: &Uuid,
    seq: u32,
    last_ckpt: u32,
    data_sectors: u32,
    map: &[DataMapEntry],
) -> Vec<u8> {
    let fixed = OBJ_HEADER_SIZE + 28;
    let ckpts_off = fixed;
    let map_off = ckpts_off + 4;
    let total = map_off + map.len() * DATA_MAP_ENTRY_SIZE;

    let mut buf = Vec::with_capacity(total);
    ObjHeader {
        vol_uuid: *vol_uuid,
        obj_type: OBJ_DATA,
        seq,
        hdr_sectors: hdr_sectors_for(total),
        data_sectors,
    }
    .put(&mut buf);

    put_u32(&mut buf, seq); // last_data_obj
    put_u32(&mut buf, ckpts_off as u32);
    put_u32(&mut buf, 4);
    put_u32(&mut buf, 0); // objs_cleaned_offset
    put_u32(&mut buf, 0); // objs_cleaned_len
    put_u32(&mut buf, map_off as u32);
    put_u32(&mut buf, (map.len() * DATA_MAP_ENTRY_SIZE) as u32);

    put_u32(&mut buf, last_ckpt);
    for e in map {
        put_u64(&mut buf, e.lba);
        put_u64(&mut buf, e.len);
    }
    pad_to(&mut buf, PAGE_SIZE as usize);
    buf
}

/// Parse a DATA object header region
pub fn parse_data_hdr(buf: &[u8]) -> Result<DataInfo> {
    let mut c = Cursor::new(buf);
    let hdr = ObjHeader::parse(&mut c)?;
    if hdr.obj_type != OBJ_DATA {
        return Err(Error::corrupt(format!(
            "expected data object, found type {}",
            hdr.obj_type
        )));
    }
    let last_data_obj = c.u32()?;
    let (ckpts_off, ckpts_len) = (c.u32()? as usize, c.u32()? as usize);
    let (cleaned_off, cleaned_len) = (c.u32()? as usize, c.u32()? as usize);
    let (map_off, map_len) = (c.u32()? as usize, c.u32()? as usize);

    let ckpts = parse_u32_array(buf, ckpts_off, ckpts_len)?;

    if cleaned_len % OBJ_CLEANED_SIZE != 0 {
        return Err(Error::corrupt("cleaned array length"));
    }
    let mut cc = Cursor::new(buf);
    cc.seek(cleaned_off)?;
    let mut cleaned = Vec::with_capacity(cleaned_len / OBJ_CLEANED_SIZE);
    for _ in 0..cleaned_len / OBJ_CLEANED_SIZE {
        cleaned.push(ObjCleaned {
            seq: cc.u32()?,
            was_deleted: cc.u32()?,
        });
    }

    if map_len % DATA_MAP_ENTRY_SIZE != 0 {
        return Err(Error::corrupt("data map array length"));
    }
    let mut mc = Cursor::new(buf);
    mc.seek(map_off)?;
    let mut map = Vec::with_capacity(map_len / DATA_MAP_ENTRY_SIZE);
    for _ in 0..map_len / DATA_MAP_ENTRY_SIZE {
        map.push(DataMapEntry {
            lba: mc.u64()?,
            len: mc.u64()?,
        });
    }

    Ok(DataInfo {
        hdr,
        last_data_obj,
        ckpts,
        cleaned,
        map,
    })
}

/// Serialize a checkpoint object (page-padded)
pub fn build_ckpt(
    vol_uuid: &Uuid,
    seq: u32,
    ckpts: &[u32],
    objs: &[CkptObjEntry],
    deletes: &[DeferredDelete],
    map: &[CkptMapEntry],
) -> Vec<u8> {
    let fixed = OBJ_HEADER_SIZE + 32;
    let ckpts_off = fixed;
    let objs_off = ckpts_off + ckpts.len() * 4;
    let deletes_off = objs_off + objs.len() * CKPT_OBJ_ENTRY_SIZE;
    let map_off = deletes_off + deletes.len() * DEFERRED_DELETE_SIZE;
    let total = map_off + map.len() * CKPT_MAP_ENTRY_SIZE;

    let mut buf = Vec::with_capacity(total);
    ObjHeader {
        vol_uuid: *vol_uuid,
        obj_type: OBJ_CKPT,
        seq,
        hdr_sectors: hdr_sectors_for(total),
        data_sectors: 0,
    }
    .put(&mut buf);

    put_u32(&mut buf, ckpts_off as u32);
    put_u32(&mut buf, (ckpts.len() * 4) as u32);
    put_u32(&mut buf, objs_off as u32);
    put_u32(&mut buf, (objs.len() * CKPT_OBJ_ENTRY_SIZE) as u32);
    put_u32(&mut buf, deletes_off as u32);
    put_u32(&mut buf, (deletes.len() * DEFERRED_DELETE_SIZE) as u32);
    put_u32(&mut buf, map_off as u32);
    put_u32(&mut buf, (map.len() * CKPT_MAP_ENTRY_SIZE) as u32);

    for ck in ckpts {
        put_u32(&mut buf, *ck);
    }
    for o in objs {
        put_u32(&mut buf, o.seq);
        put_u32(&mut buf, o.hdr_sectors);
        put_u32(&mut buf, o.data_sectors);
        put_u32(&mut buf, o.live_sectors);
    }
    for d in deletes {
        put_u32(&mut buf, d.seq);
        put_u32(&mut buf, d.time);
    }
    for m in map {
        put_u64(&mut buf, m.lba);
        put_u64(&mut buf, m.len);
        put_u32(&mut buf, m.obj);
        put_u32(&mut buf, m.offset);
    }
    pad_to(&mut buf, PAGE_SIZE as usize);
    buf
}

/// Parse a checkpoint object header region
pub fn parse_ckpt(buf: &[u8]) -> Result<CkptInfo> {
    let mut c = Cursor::new(buf);
    let hdr = ObjHeader::parse(&mut c)?;
    if hdr.obj_type != OBJ_CKPT {
        return Err(Error::corrupt(format!(
            "expected checkpoint object, found type {}",
            hdr.obj_type
        )));
    }
    let (ckpts_off, ckpts_len) = (c.u32()? as usize, c.u32()? as usize);
    let (objs_off, objs_len) = (c.u32()? as usize, c.u32()? as usize);
    let (deletes_off, deletes_len) = (c.u32()? as usize, c.u32()? as usize);
    let (map_off, map_len) = (c.u32()? as usize, c.u32()? as usize);

    let ckpts = parse_u32_array(buf, ckpts_off, ckpts_len)?;

    if objs_len % CKPT_OBJ_ENTRY_SIZE != 0 {
        return Err(Error::corrupt("checkpoint object-table length"));
    }
    let mut oc = Cursor::new(buf);
    oc.seek(objs_off)?;
    let mut objs = Vec::with_capacity(objs_len / CKPT_OBJ_ENTRY_SIZE);
    for _ in 0..objs_len / CKPT_OBJ_ENTRY_SIZE {
        objs.push(CkptObjEntry {
            seq: oc.u32()?,
            hdr_sectors: oc.u32()?,
            data_sectors: oc.u32()?,
            live_sectors: oc.u32()?,
        });
    }

    if deletes_len % DEFERRED_DELETE_SIZE != 0 {
        return Err(Error::corrupt("deferred-delete array length"));
    }
    let mut dc = Cursor::new(buf);
    dc.seek(deletes_off)?;
    let mut deletes = Vec::with_capacity(deletes_len / DEFERRED_DELETE_SIZE);
    for _ in 0..deletes_len / DEFERRED_DELETE_SIZE {
        deletes.push(DeferredDelete {
            seq: dc.u32()?,
            time: dc.u32()?,
        });
    }

    if map_len % CKPT_MAP_ENTRY_SIZE != 0 {
        return Err(Error::corrupt("checkpoint map length"));
    }
    let mut mc = Cursor::new(buf);
    mc.seek(map_off)?;
    let mut map = Vec::with_capacity(map_len / CKPT_MAP_ENTRY_SIZE);
    for _ in 0..map_len / CKPT_MAP_ENTRY_SIZE {
        map.push(CkptMapEntry {
            lba: mc.u64()?,
            len: mc.u64()?,
            obj: mc.u32()?,
            offset: mc.u32()?,
        });
    }

    Ok(CkptInfo {
        hdr,
        ckpts,
        objs,
        deletes,
        map,
    })
}

fn parse_u32_array(buf: &[u8], off: usize, len: usize) -> Result<Vec<u32>> {
    if len % 4 != 0 {
        return Err(Error::corrupt("u32 array length"));
    }
    let mut c = Cursor::new(buf);
    c.seek(off)?;
    let mut out = Vec::with_capacity(len / 4);
    for _ in 0..len / 4 {
        out.push(c.u32()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_super_round_trip() {
        let uuid = Uuid::new_v4();
        let buf = build_super(&uuid, 2 * 1024 * 1024, 17, &[5, 12], &[], &[]);
        assert_eq!(buf.len() % PAGE_SIZE as usize, 0);

        let info = parse_super(&buf).unwrap();
        assert_eq!(info.hdr.vol_uuid, uuid);
        assert_eq!(info.hdr.obj_type, OBJ_SUPER);
        assert_eq!(info.vol_size, 2 * 1024 * 1024);
        assert_eq!(info.next_obj, 17);
        assert_eq!(info.ckpts, vec![5, 12]);
        assert!(info.clones.is_empty());
        assert!(info.snaps.is_empty());
    }

    #[test]
    fn test_super_with_clones_and_snaps() {
        let uuid = Uuid::new_v4();
        let clones = vec![CloneInfo {
            vol_uuid: Uuid::new_v4(),
            seq: 3,
            name: "parent".to_string(),
        }];
        let snaps = vec![SnapInfo {
            snap_uuid: Uuid::new_v4(),
            seq: 9,
        }];
        let buf = build_super(&uuid, 4096, 1, &[], &clones, &snaps);
        let info = parse_super(&buf).unwrap();
        assert_eq!(info.clones, clones);
        assert_eq!(info.snaps, snaps);
    }

    #[test]
    fn test_data_hdr_round_trip() {
        let uuid = Uuid::new_v4();
        let map = vec![
            DataMapEntry { lba: 0, len: 8 },
            DataMapEntry { lba: 1024, len: 136 },
        ];
        let buf = build_data_hdr(&uuid, 42, 7, 144, &map);
        assert_eq!(buf.len() % PAGE_SIZE as usize, 0);

        let info = parse_data_hdr(&buf).unwrap();
        assert_eq!(info.hdr.seq, 42);
        assert_eq!(info.hdr.data_sectors, 144);
        assert_eq!(info.hdr.hdr_bytes(), buf.len());
        assert_eq!(info.last_data_obj, 42);
        assert_eq!(info.ckpts, vec![7]);
        assert_eq!(info.map, map);
    }

    #[test]
    fn test_ckpt_round_trip() {
        let uuid = Uuid::new_v4();
        let objs = vec![CkptObjEntry {
            seq: 1,
            hdr_sectors: 8,
            data_sectors: 128,
            live_sectors: 100,
        }];
        let map = vec![CkptMapEntry {
            lba: 8,
            len: 16,
            obj: 1,
            offset: 8,
        }];
        let buf = build_ckpt(&uuid, 2, &[2], &objs, &[], &map);

        let info = parse_ckpt(&buf).unwrap();
        assert_eq!(info.hdr.obj_type, OBJ_CKPT);
        assert_eq!(info.hdr.seq, 2);
        assert_eq!(info.ckpts, vec![2]);
        assert_eq!(info.objs, objs);
        assert_eq!(info.map, map);
        assert!(info.deletes.is_empty());
    }

    #[test]
    fn test_parse_rejects_wrong_magic() {
        let uuid = Uuid::new_v4();
        let mut buf = build_super(&uuid, 4096, 1, &[], &[], &[]);
        buf[0] ^= 0xFF;
        assert!(parse_super(&buf).is_err());
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let uuid = Uuid::new_v4();
        let buf = build_super(&uuid, 4096, 1, &[], &[], &[]);
        assert!(parse_data_hdr(&buf).is_err());
        assert!(parse_ckpt(&buf).is_err());
    }
}
