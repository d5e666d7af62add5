//!
//! Pool images built in memory for the integration tests.
//!
//! Everything is written uncompressed with fletcher4 checksums onto a single
//! disk vdev with 512 byte sectors.
//!
#![allow(dead_code)]

use std::sync::Arc;

use zfs_reader::checksum;
use zfs_reader::dmu::{ObjectType, DNODE_SIZE};
use zfs_reader::spa::{ChecksumType, BLKPTR_SIZE, UBERBLOCK_MAGIC, VDEV_DATA_OFFSET};
use zfs_reader::vdev::{LABEL_PAD, LABEL_SIZE, NV_AREA_SIZE, UBERBLOCK_SLOT_SIZE};
use zfs_reader::zap::{
    zap_hash, zap_leaf_hash_numentries, zap_leaf_numchunks, MZAP_ENT_LEN, MZAP_NAME_LEN,
    ZAP_LEAF_ARRAY, ZAP_LEAF_CHUNK_SIZE, ZAP_LEAF_ENTRY, ZAP_LEAF_FREE, ZAP_LEAF_HEADER_SIZE,
    ZAP_MAGIC, ZBT_HEADER, ZBT_LEAF, ZBT_MICRO,
};
use zfs_reader::zpl::SA_MAGIC;
use zfs_reader::{Diagnostics, DiskVdev, MemDisk, MemorySink, Pool, PoolOptions, Vdev};

pub const SECTOR: usize = 512;
pub const FILE_BLOCK: usize = 4096;
pub const POOL_VERSION: u64 = 5000;

const META_BLOCK: usize = 16384;
const FAT_ZAP_BLOCK: usize = 4096;
const INDIRECT_FANOUT: usize = 128;
const CHECKSUM_OFF: u8 = 2;
const CHECKSUM_FLETCHER4: u8 = 7;
const COMPRESS_OFF: u8 = 2;
const DNODE_HEADER_SIZE: usize = 64;
const ZNODE_SIZE: usize = 264;
const LEAF_ARRAY_BYTES: usize = ZAP_LEAF_CHUNK_SIZE - 3;
const CHAIN_END: u16 = 0xffff;
const OS_TYPE_META: u64 = 1;
const OS_TYPE_ZFS: u64 = 2;
const DIR_MODE: u64 = 0o040755;
const FILE_MODE: u64 = 0o100644;
const DT_DIR: u64 = 4;
const DT_REG: u64 = 8;
const SA_LAYOUT: u16 = 2;
pub const FILE_UID: u64 = 1000;
pub const FILE_GID: u64 = 100;
pub const MTIME: u64 = 1_600_000_000;

/// (name, number, byteswap class, length) of the registered system attributes.
const SA_REGISTRY: &[(&str, u16, u8, u16)] = &[
    ("ZPL_ATIME", 0, 0, 16),
    ("ZPL_MTIME", 1, 0, 16),
    ("ZPL_CTIME", 2, 0, 16),
    ("ZPL_CRTIME", 3, 0, 16),
    ("ZPL_GEN", 4, 0, 8),
    ("ZPL_MODE", 5, 0, 8),
    ("ZPL_SIZE", 6, 0, 8),
    ("ZPL_PARENT", 7, 0, 8),
    ("ZPL_LINKS", 8, 0, 8),
    ("ZPL_UID", 12, 0, 8),
    ("ZPL_GID", 13, 0, 8),
    ("ZPL_SYMLINK", 17, 3, 0),
];

/// Attribute order of the one layout files and directories use.
const SA_LAYOUT_ATTRS: &[u64] = &[5, 6, 4, 12, 13, 7, 8, 0, 1, 2, 3];

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

fn padded(bytes: &[u8], to: usize) -> Vec<u8> {
    let mut out = bytes.to_vec();
    out.resize(round_up(bytes.len().max(1), to), 0);
    out
}

fn fletcher4(data: &[u8]) -> [u64; 4] {
    checksum::compute(ChecksumType::Fletcher4, data)
        .unwrap()
        .unwrap()
        .checksum
}

fn put_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn dva(offset: u64, len: usize) -> [u8; 16] {
    let mut out = [0u8; 16];
    let asize = (len / SECTOR) as u32;
    out[0..3].copy_from_slice(&asize.to_le_bytes()[..3]);
    out[8..16].copy_from_slice(&offset.to_le_bytes());
    out
}

fn blkptr(
    dvas: &[[u8; 16]],
    size: usize,
    checksum_type: u8,
    level: u8,
    object_type: u8,
    checksum: [u64; 4],
) -> [u8; BLKPTR_SIZE] {
    let mut out = [0u8; BLKPTR_SIZE];
    for (i, d) in dvas.iter().enumerate() {
        out[i * 16..i * 16 + 16].copy_from_slice(d);
    }
    let sectors = (size / SECTOR) as u64 - 1;
    let props = sectors
        | (sectors << 16)
        | (u64::from(COMPRESS_OFF) << 32)
        | (u64::from(checksum_type) << 40)
        | (u64::from(object_type) << 48)
        | (u64::from(level) << 56);
    put_u64(&mut out, 48, props);
    put_u64(&mut out, 72, 1);
    put_u64(&mut out, 80, 1);
    put_u64(&mut out, 88, 1);
    for (i, word) in checksum.iter().enumerate() {
        put_u64(&mut out, 96 + i * 8, *word);
    }
    out
}

fn dnode(
    object_type: u8,
    nlevels: u8,
    block_size: usize,
    maxblkid: u64,
    blkptrs: &[[u8; BLKPTR_SIZE]],
    bonus_type: u8,
    bonus: &[u8],
) -> [u8; DNODE_SIZE] {
    assert!(blkptrs.len() <= 3);
    assert!(DNODE_HEADER_SIZE + blkptrs.len() * BLKPTR_SIZE + bonus.len() <= DNODE_SIZE);
    let mut out = [0u8; DNODE_SIZE];
    out[0] = object_type;
    out[1] = 14;
    out[2] = nlevels;
    out[3] = blkptrs.len() as u8;
    out[4] = bonus_type;
    out[8..10].copy_from_slice(&((block_size / SECTOR) as u16).to_le_bytes());
    out[10..12].copy_from_slice(&(bonus.len() as u16).to_le_bytes());
    put_u64(&mut out, 16, maxblkid);
    let mut at = DNODE_HEADER_SIZE;
    for bp in blkptrs {
        out[at..at + BLKPTR_SIZE].copy_from_slice(bp);
        at += BLKPTR_SIZE;
    }
    out[at..at + bonus.len()].copy_from_slice(bonus);
    out
}

/// The allocatable area of the vdev, filled front to back.
#[derive(Debug, Default)]
pub struct Area {
    data: Vec<u8>,
}

impl Area {
    /// Appends `bytes` at the next free sector and returns its sector offset.
    pub fn write(&mut self, bytes: &[u8]) -> u64 {
        let offset = (self.data.len() / SECTOR) as u64;
        self.data.extend_from_slice(&padded(bytes, SECTOR));
        offset
    }

    pub fn block(&mut self, bytes: &[u8], level: u8, object_type: u8) -> [u8; BLKPTR_SIZE] {
        let data = padded(bytes, SECTOR);
        let offset = self.write(&data);
        blkptr(
            &[dva(offset, data.len())],
            data.len(),
            CHECKSUM_FLETCHER4,
            level,
            object_type,
            fletcher4(&data),
        )
    }

    /// One block stored as several copies, checksummed over the first one.
    pub fn copies(&mut self, copies: &[&[u8]], checksum_type: u8, object_type: u8) -> [u8; BLKPTR_SIZE] {
        let first = padded(copies[0], SECTOR);
        let dvas: Vec<[u8; 16]> = copies
            .iter()
            .map(|copy| {
                let mut data = copy.to_vec();
                data.resize(first.len(), 0);
                dva(self.write(&data), first.len())
            })
            .collect();
        blkptr(&dvas, first.len(), checksum_type, 0, object_type, fletcher4(&first))
    }

    /// Writes `data` in `block_size` blocks and returns the dnode describing
    /// it. With `sparse`, blocks of zeros are left as holes.
    pub fn object(
        &mut self,
        object_type: u8,
        data: &[u8],
        block_size: usize,
        sparse: bool,
        bonus_type: u8,
        bonus: &[u8],
    ) -> [u8; DNODE_SIZE] {
        let blocks: Vec<[u8; BLKPTR_SIZE]> = data
            .chunks(block_size)
            .map(|chunk| {
                if sparse && chunk.iter().all(|b| *b == 0) {
                    [0u8; BLKPTR_SIZE]
                } else {
                    self.block(&padded(chunk, block_size), 0, object_type)
                }
            })
            .collect();
        let maxblkid = blocks.len().saturating_sub(1) as u64;
        let (nlevels, mut top) = if blocks.len() <= 3 {
            (1, blocks)
        } else {
            let top: Vec<[u8; BLKPTR_SIZE]> = blocks
                .chunks(INDIRECT_FANOUT)
                .map(|group| self.block(&group.concat(), 1, object_type))
                .collect();
            assert!(top.len() <= 3, "object too large");
            (2, top)
        };
        if top.is_empty() {
            top.push([0u8; BLKPTR_SIZE]);
        }
        dnode(object_type, nlevels, block_size, maxblkid, &top, bonus_type, bonus)
    }

    /// A single-block object holding `zap`, sized to fit.
    pub fn zap_object(&mut self, object_type: u8, zap: &Zap) -> [u8; DNODE_SIZE] {
        let (data, block_size) = zap.build();
        self.object(object_type, &data, block_size, false, 0, &[])
    }
}

/// ZAP contents with integer values, micro or fat.
#[derive(Debug, Clone, Default)]
pub struct Zap {
    entries: Vec<(String, u8, Vec<u64>)>,
    fat: bool,
}

impl Zap {
    pub fn new(fat: bool) -> Self {
        Self {
            entries: Vec::new(),
            fat,
        }
    }
    pub fn int(mut self, name: &str, value: u64) -> Self {
        self.entries.push((name.to_owned(), 8, vec![value]));
        self
    }
    pub fn array(mut self, name: &str, int_size: u8, values: &[u64]) -> Self {
        self.fat = true;
        self.entries.push((name.to_owned(), int_size, values.to_vec()));
        self
    }

    fn build(&self) -> (Vec<u8>, usize) {
        let fits_micro = self
            .entries
            .iter()
            .all(|(name, size, values)| name.len() < MZAP_NAME_LEN && *size == 8 && values.len() == 1);
        if self.fat || !fits_micro {
            (self.build_fat(0x5a17_0123_4567_89ab), FAT_ZAP_BLOCK)
        } else {
            let data = self.build_micro();
            let len = data.len();
            (data, len)
        }
    }

    fn build_micro(&self) -> Vec<u8> {
        let size = round_up((self.entries.len() + 1) * MZAP_ENT_LEN, SECTOR);
        let mut out = vec![0u8; size];
        put_u64(&mut out, 0, ZBT_MICRO);
        put_u64(&mut out, 8, 0x1234);
        for (i, (name, _, values)) in self.entries.iter().enumerate() {
            let at = MZAP_ENT_LEN * (i + 1);
            put_u64(&mut out, at, values[0]);
            out[at + 14..at + 14 + name.len()].copy_from_slice(name.as_bytes());
        }
        out
    }

    /// A header block with an embedded pointer table, every slot pointing at
    /// the single leaf in block 1.
    fn build_fat(&self, salt: u64) -> Vec<u8> {
        let bs = FAT_ZAP_BLOCK;
        let mut leaf = LeafBuilder::new(bs, salt);
        for (name, int_size, values) in &self.entries {
            leaf.entry(name, *int_size, values);
        }
        let mut out = vec![0u8; bs * 2];
        put_u64(&mut out, 0, ZBT_HEADER);
        put_u64(&mut out, 8, ZAP_MAGIC);
        let table_entries = (bs / 2) / 8;
        put_u64(&mut out, 32, u64::from(table_entries.trailing_zeros()));
        put_u64(&mut out, 64, 1);
        put_u64(&mut out, 72, self.entries.len() as u64);
        put_u64(&mut out, 80, salt);
        for i in 0..table_entries {
            put_u64(&mut out, bs / 2 + i * 8, 1);
        }
        leaf.write(&mut out[bs..]);
        out
    }
}

struct LeafBuilder {
    block_size: usize,
    salt: u64,
    chunks: Vec<[u8; ZAP_LEAF_CHUNK_SIZE]>,
    hash: Vec<u16>,
}

impl LeafBuilder {
    fn new(block_size: usize, salt: u64) -> Self {
        Self {
            block_size,
            salt,
            chunks: Vec::new(),
            hash: vec![CHAIN_END; zap_leaf_hash_numentries(block_size)],
        }
    }

    fn array(&mut self, bytes: &[u8]) -> u16 {
        let first = self.chunks.len() as u16;
        let pieces: Vec<&[u8]> = bytes.chunks(LEAF_ARRAY_BYTES).collect();
        for (i, piece) in pieces.iter().enumerate() {
            let mut chunk = [0u8; ZAP_LEAF_CHUNK_SIZE];
            chunk[0] = ZAP_LEAF_ARRAY;
            chunk[1..1 + piece.len()].copy_from_slice(piece);
            let next = if i + 1 == pieces.len() {
                CHAIN_END
            } else {
                first + i as u16 + 1
            };
            chunk[22..24].copy_from_slice(&next.to_le_bytes());
            self.chunks.push(chunk);
        }
        first
    }

    fn entry(&mut self, name: &str, int_size: u8, values: &[u64]) {
        let hash = zap_hash(self.salt, name.as_bytes(), 28);
        let shift = self.block_size.trailing_zeros() - 5;
        let slot = ((hash >> (64 - shift)) & ((1 << shift) - 1)) as usize;
        let entry_idx = self.chunks.len() as u16;
        self.chunks.push([0u8; ZAP_LEAF_CHUNK_SIZE]);
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        let name_chunk = self.array(&name_bytes);
        let value_bytes: Vec<u8> = values
            .iter()
            .flat_map(|v| v.to_be_bytes()[8 - int_size as usize..].to_vec())
            .collect();
        let value_chunk = self.array(&value_bytes);
        assert!(self.chunks.len() <= zap_leaf_numchunks(self.block_size));
        let mut chunk = [0u8; ZAP_LEAF_CHUNK_SIZE];
        chunk[0] = ZAP_LEAF_ENTRY;
        chunk[1] = int_size;
        chunk[2..4].copy_from_slice(&self.hash[slot].to_le_bytes());
        chunk[4..6].copy_from_slice(&name_chunk.to_le_bytes());
        chunk[6..8].copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        chunk[8..10].copy_from_slice(&value_chunk.to_le_bytes());
        chunk[10..12].copy_from_slice(&(values.len() as u16).to_le_bytes());
        chunk[16..24].copy_from_slice(&hash.to_le_bytes());
        self.chunks[entry_idx as usize] = chunk;
        self.hash[slot] = entry_idx;
    }

    fn write(&self, leaf: &mut [u8]) {
        put_u64(leaf, 0, ZBT_LEAF);
        for (i, h) in self.hash.iter().enumerate() {
            let at = ZAP_LEAF_HEADER_SIZE + i * 2;
            leaf[at..at + 2].copy_from_slice(&h.to_le_bytes());
        }
        let chunk_base = ZAP_LEAF_HEADER_SIZE + self.hash.len() * 2;
        for i in 0..zap_leaf_numchunks(self.block_size) {
            let at = chunk_base + i * ZAP_LEAF_CHUNK_SIZE;
            match self.chunks.get(i) {
                Some(c) => leaf[at..at + ZAP_LEAF_CHUNK_SIZE].copy_from_slice(c),
                None => {
                    leaf[at] = ZAP_LEAF_FREE;
                    leaf[at + 22..at + 24].copy_from_slice(&CHAIN_END.to_le_bytes());
                }
            }
        }
    }
}

/// XDR nvlist encoder.
#[derive(Debug, Default)]
pub struct Xdr {
    pub buf: Vec<u8>,
}

impl Xdr {
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.resize(round_up(self.buf.len(), 4), 0);
    }
    fn pair(&mut self, name: &str, kind: u32, nelem: u32) {
        self.u32(1);
        self.u32(1);
        self.string(name);
        self.u32(kind);
        self.u32(nelem);
    }
    pub fn begin(&mut self) -> &mut Self {
        self.u32(0);
        self.u32(1);
        self
    }
    pub fn u64(&mut self, name: &str, v: u64) -> &mut Self {
        self.pair(name, 8, 1);
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }
    pub fn str(&mut self, name: &str, v: &str) -> &mut Self {
        self.pair(name, 9, 1);
        self.string(v);
        self
    }
    pub fn nested(&mut self, name: &str) -> &mut Self {
        self.pair(name, 19, 1);
        self.begin()
    }
    /// Follow with `n` lists, each from `begin` to `end`.
    pub fn array(&mut self, name: &str, n: u32) -> &mut Self {
        self.pair(name, 20, n);
        self
    }
    pub fn end(&mut self) -> &mut Self {
        self.u32(0);
        self.u32(0);
        self
    }
    /// As stored in a packed nvlist object: encoding and endian bytes first.
    pub fn packed(&self) -> Vec<u8> {
        let mut out = vec![1, 1, 0, 0];
        out.extend_from_slice(&self.buf);
        out
    }
}

/// A filesystem tree entry.
#[derive(Debug, Clone)]
pub enum Node {
    File(Vec<u8>),
    /// Blocks of zeros are holes.
    Sparse(Vec<u8>),
    /// One block whose two copies differ, checksums off.
    Divergent(Vec<u8>, Vec<u8>),
    /// One block whose checksum does not match.
    Corrupt(Vec<u8>),
    /// A file object without a bonus buffer.
    Broken,
    /// One block of data under a size attribute that claims more.
    Oversized(Vec<u8>, u64),
    Dir(Vec<(String, Node)>),
}

pub fn file(name: &str, data: &[u8]) -> (String, Node) {
    (name.to_owned(), Node::File(data.to_vec()))
}

pub fn dir(name: &str, entries: Vec<(String, Node)>) -> (String, Node) {
    (name.to_owned(), Node::Dir(entries))
}

#[derive(Debug, Clone, Default)]
pub struct DatasetLayout {
    pub tree: Vec<(String, Node)>,
    pub snapshots: Vec<(String, Vec<(String, Node)>)>,
    pub children: Vec<(String, DatasetLayout)>,
}

impl DatasetLayout {
    pub fn new(tree: Vec<(String, Node)>) -> Self {
        Self {
            tree,
            ..Self::default()
        }
    }
    pub fn snapshot(mut self, name: &str, tree: Vec<(String, Node)>) -> Self {
        self.snapshots.push((name.to_owned(), tree));
        self
    }
    pub fn child(mut self, name: &str, child: DatasetLayout) -> Self {
        self.children.push((name.to_owned(), child));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attrs {
    Znode,
    Sa,
}

#[derive(Debug, Clone)]
pub struct PoolLayout {
    pub name: String,
    pub root: DatasetLayout,
    pub attrs: Attrs,
    pub fat_zaps: bool,
    /// Adds MOS objects that refer back to themselves.
    pub cycles: bool,
}

impl PoolLayout {
    pub fn new(root: DatasetLayout) -> Self {
        Self {
            name: "tank".to_owned(),
            root,
            attrs: Attrs::Sa,
            fat_zaps: false,
            cycles: false,
        }
    }
    pub fn attrs(mut self, attrs: Attrs) -> Self {
        self.attrs = attrs;
        self
    }
    pub fn fat_zaps(mut self) -> Self {
        self.fat_zaps = true;
        self
    }
    pub fn cycles(mut self) -> Self {
        self.cycles = true;
        self
    }
}

/// Dnode array of one object set under construction. Slot 0 stays free.
struct Objset {
    dnodes: Vec<[u8; DNODE_SIZE]>,
}

impl Objset {
    fn new() -> Self {
        Self {
            dnodes: vec![[0u8; DNODE_SIZE]],
        }
    }
    fn reserve(&mut self) -> u64 {
        self.dnodes.push([0u8; DNODE_SIZE]);
        self.dnodes.len() as u64 - 1
    }
    fn set(&mut self, index: u64, dnode: [u8; DNODE_SIZE]) {
        self.dnodes[index as usize] = dnode;
    }
    fn add(&mut self, dnode: [u8; DNODE_SIZE]) -> u64 {
        let index = self.reserve();
        self.set(index, dnode);
        index
    }
    fn finish(&self, area: &mut Area, os_type: u64) -> [u8; BLKPTR_SIZE] {
        let meta = area.object(
            ObjectType::DNode as u8,
            &self.dnodes.concat(),
            META_BLOCK,
            false,
            0,
            &[],
        );
        let mut phys = vec![0u8; 1024];
        phys[..DNODE_SIZE].copy_from_slice(&meta);
        put_u64(&mut phys, DNODE_SIZE + 192, os_type);
        area.block(&phys, 0, ObjectType::Objset as u8)
    }
}

struct Attributes {
    mode: u64,
    size: u64,
    parent: u64,
    links: u64,
}

/// Bonus type and buffer holding `attrs`.
fn bonus(kind: Attrs, attrs: &Attributes) -> (u8, Vec<u8>) {
    match kind {
        Attrs::Znode => {
            let mut out = vec![0u8; ZNODE_SIZE];
            put_u64(&mut out, 16, MTIME);
            put_u64(&mut out, 64, 1);
            put_u64(&mut out, 72, attrs.mode);
            put_u64(&mut out, 80, attrs.size);
            put_u64(&mut out, 88, attrs.parent);
            put_u64(&mut out, 96, attrs.links);
            put_u64(&mut out, 128, FILE_UID);
            put_u64(&mut out, 136, FILE_GID);
            (ObjectType::ZNode as u8, out)
        }
        Attrs::Sa => {
            let mut out = SA_MAGIC.to_le_bytes().to_vec();
            out.extend_from_slice(&(SA_LAYOUT | (1 << 10)).to_le_bytes());
            out.extend_from_slice(&[0, 0]);
            let words = [
                attrs.mode,
                attrs.size,
                1,
                FILE_UID,
                FILE_GID,
                attrs.parent,
                attrs.links,
                0,
                0,
                MTIME,
                0,
                0,
                0,
                0,
                0,
            ];
            for w in &words {
                out.extend_from_slice(&w.to_le_bytes());
            }
            (ObjectType::Sa as u8, out)
        }
    }
}

struct FsBuilder<'a> {
    area: &'a mut Area,
    os: Objset,
    layout: &'a PoolLayout,
}

impl<'a> FsBuilder<'a> {
    fn file(&mut self, index: u64, parent: u64, node: &Node) {
        let plain = ObjectType::PlainFileContents as u8;
        let attrs = |size: usize| Attributes {
            mode: FILE_MODE,
            size: size as u64,
            parent,
            links: 1,
        };
        let dnode = match node {
            Node::File(data) | Node::Sparse(data) => {
                let (bonus_type, bonus) = bonus(self.layout.attrs, &attrs(data.len()));
                let block_size = if data.len() <= FILE_BLOCK {
                    round_up(data.len().max(1), SECTOR)
                } else {
                    FILE_BLOCK
                };
                let sparse = matches!(node, Node::Sparse(_));
                self.area
                    .object(plain, data, block_size, sparse, bonus_type, &bonus)
            }
            Node::Divergent(a, b) => {
                let (bonus_type, bonus) = bonus(self.layout.attrs, &attrs(a.len()));
                let bp = self.area.copies(&[a, b], CHECKSUM_OFF, plain);
                dnode(plain, 1, round_up(a.len(), SECTOR), 0, &[bp], bonus_type, &bonus)
            }
            Node::Corrupt(data) => {
                let (bonus_type, bonus) = bonus(self.layout.attrs, &attrs(data.len()));
                let garbage = vec![0xa5u8; data.len()];
                let mut bp = self.area.copies(&[&garbage], CHECKSUM_FLETCHER4, plain);
                for (i, word) in fletcher4(&padded(data, SECTOR)).iter().enumerate() {
                    put_u64(&mut bp, 96 + i * 8, *word);
                }
                dnode(plain, 1, round_up(data.len(), SECTOR), 0, &[bp], bonus_type, &bonus)
            }
            Node::Broken => dnode(plain, 1, SECTOR, 0, &[[0u8; BLKPTR_SIZE]], 0, &[]),
            Node::Oversized(data, size) => {
                let attrs = Attributes {
                    size: *size,
                    ..attrs(data.len())
                };
                let (bonus_type, bonus) = bonus(self.layout.attrs, &attrs);
                let block_size = round_up(data.len().max(1), SECTOR);
                self.area
                    .object(plain, data, block_size, false, bonus_type, &bonus)
            }
            Node::Dir(_) => unreachable!(),
        };
        self.os.set(index, dnode);
    }

    fn dir(&mut self, index: u64, parent: u64, entries: &[(String, Node)]) {
        let mut zap = Zap::new(self.layout.fat_zaps);
        for (name, node) in entries {
            let child = self.os.reserve();
            let kind = match node {
                Node::Dir(sub) => {
                    self.dir(child, index, sub);
                    DT_DIR
                }
                other => {
                    self.file(child, index, other);
                    DT_REG
                }
            };
            zap = zap.int(name, (kind << 60) | child);
        }
        let (bonus_type, bonus) = bonus(
            self.layout.attrs,
            &Attributes {
                mode: DIR_MODE,
                size: entries.len() as u64 + 2,
                parent,
                links: 2,
            },
        );
        let (data, block_size) = zap.build();
        let dnode = self.area.object(
            ObjectType::DirectoryContents as u8,
            &data,
            block_size,
            false,
            bonus_type,
            &bonus,
        );
        self.os.set(index, dnode);
    }

    /// System attribute registry and layout objects, returning the index of
    /// the object the master node points at.
    fn sa_objects(&mut self) -> u64 {
        let mut registry = Zap::new(self.layout.fat_zaps);
        for (name, num, bswap, len) in SA_REGISTRY {
            let raw = u64::from(*num) | (u64::from(*bswap) << 16) | (u64::from(*len) << 24);
            registry = registry.int(name, raw);
        }
        let registry = self
            .area
            .zap_object(ObjectType::SaAttrRegistration as u8, &registry);
        let registry = self.os.add(registry);
        let layouts = Zap::new(true).array(&SA_LAYOUT.to_string(), 2, SA_LAYOUT_ATTRS);
        let layouts = self.area.zap_object(ObjectType::SaAttrLayouts as u8, &layouts);
        let layouts = self.os.add(layouts);
        let sa = Zap::new(false)
            .int("REGISTRY", registry)
            .int("LAYOUTS", layouts);
        let sa = self.area.zap_object(ObjectType::SaMasterNode as u8, &sa);
        self.os.add(sa)
    }

    fn build(mut self, tree: &[(String, Node)]) -> [u8; BLKPTR_SIZE] {
        let master = self.os.reserve();
        let mut master_zap = Zap::new(self.layout.fat_zaps).int("VERSION", 5);
        if self.layout.attrs == Attrs::Sa {
            let sa = self.sa_objects();
            master_zap = master_zap.int("SA_ATTRS", sa);
        }
        let root = self.os.reserve();
        self.dir(root, root, tree);
        master_zap = master_zap.int("ROOT", root);
        let dnode = self
            .area
            .zap_object(ObjectType::MasterNode as u8, &master_zap);
        self.os.set(master, dnode);
        self.os.finish(self.area, OS_TYPE_ZFS)
    }
}

fn filesystem(area: &mut Area, layout: &PoolLayout, tree: &[(String, Node)]) -> [u8; BLKPTR_SIZE] {
    FsBuilder {
        area,
        os: Objset::new(),
        layout,
    }
    .build(tree)
}

fn dsl_dir(head: u64, parent: u64, child_map: u64, props: u64) -> [u8; DNODE_SIZE] {
    let mut bonus = vec![0u8; 256];
    put_u64(&mut bonus, 8, head);
    put_u64(&mut bonus, 16, parent);
    put_u64(&mut bonus, 32, child_map);
    put_u64(&mut bonus, 80, props);
    let dsl_dir = ObjectType::DslDir as u8;
    dnode(dsl_dir, 1, SECTOR, 0, &[[0u8; BLKPTR_SIZE]], dsl_dir, &bonus)
}

fn dsl_dataset(dir: u64, prev_snap: u64, snapnames: u64, bp: &[u8; BLKPTR_SIZE]) -> [u8; DNODE_SIZE] {
    let mut bonus = vec![0u8; 320];
    put_u64(&mut bonus, 0, dir);
    put_u64(&mut bonus, 8, prev_snap);
    put_u64(&mut bonus, 32, snapnames);
    bonus[128..256].copy_from_slice(bp);
    let dataset = ObjectType::DslDataset as u8;
    dnode(dataset, 1, SECTOR, 0, &[], dataset, &bonus)
}

fn dataset(
    area: &mut Area,
    mos: &mut Objset,
    layout: &PoolLayout,
    ds: &DatasetLayout,
    parent: u64,
) -> u64 {
    let dir = mos.reserve();
    let head = mos.reserve();
    let mut children = Zap::new(layout.fat_zaps);
    if parent == 0 {
        let internal = mos.add(dsl_dir(0, dir, 0, 0));
        children = children.int("$MOS", internal);
    }
    for (name, child) in &ds.children {
        let index = dataset(area, mos, layout, child, dir);
        children = children.int(name, index);
    }
    let children = area.zap_object(ObjectType::DslDirChildMap as u8, &children);
    let child_map = mos.add(children);
    let props = Zap::new(false).int("compression", 2).int("atime", 0);
    let props = area.zap_object(ObjectType::DslProps as u8, &props);
    let props = mos.add(props);

    let mut snapnames = Zap::new(layout.fat_zaps);
    let mut prev = 0;
    for (name, tree) in &ds.snapshots {
        let bp = filesystem(area, layout, tree);
        prev = mos.add(dsl_dataset(dir, prev, 0, &bp));
        snapnames = snapnames.int(name, prev);
    }
    let snapnames = if ds.snapshots.is_empty() {
        0
    } else {
        let map = area.zap_object(ObjectType::DslDsSnapMap as u8, &snapnames);
        mos.add(map)
    };
    let bp = filesystem(area, layout, &ds.tree);
    mos.set(head, dsl_dataset(dir, prev, snapnames, &bp));
    mos.set(dir, dsl_dir(head, parent, child_map, props));
    dir
}

pub const HISTORY_COMMAND: &str = "zpool create tank";
/// Object directory entries naming the objects `PoolLayout::cycles` adds.
pub const OWN_HEAD: &str = "own_head";
pub const OWN_PARENT: &str = "own_parent";

/// Writes the meta object set for `layout` and returns its root block pointer.
pub fn mos(area: &mut Area, layout: &PoolLayout) -> [u8; BLKPTR_SIZE] {
    let mut mos = Objset::new();
    let directory = mos.reserve();
    let root = dataset(area, &mut mos, layout, &layout.root, 0);

    let mut config = Xdr::default();
    config
        .begin()
        .str("name", &layout.name)
        .u64("version", POOL_VERSION)
        .end();
    let packed = config.packed();
    let config = area.object(
        ObjectType::PackedNvlist as u8,
        &packed,
        round_up(packed.len(), SECTOR),
        false,
        ObjectType::PackedNvlistSize as u8,
        &(packed.len() as u64).to_le_bytes(),
    );
    let config = mos.add(config);

    let mut record = Xdr::default();
    record
        .begin()
        .u64("history time", MTIME)
        .str("history command", HISTORY_COMMAND)
        .end();
    let record = record.packed();
    let mut log = (record.len() as u64).to_le_bytes().to_vec();
    log.extend_from_slice(&record);
    let mut offsets = vec![0u8; 32];
    put_u64(&mut offsets, 8, SECTOR as u64 * 8);
    put_u64(&mut offsets, 24, log.len() as u64);
    let history = area.object(
        ObjectType::SpaHistory as u8,
        &log,
        round_up(log.len(), SECTOR),
        false,
        ObjectType::SpaHistoryOffsets as u8,
        &offsets,
    );
    let history = mos.add(history);

    let mut directory_zap = Zap::new(layout.fat_zaps)
        .int("root_dataset", root)
        .int("config", config)
        .int("history", history);
    if layout.cycles {
        let own_head = mos.reserve();
        mos.set(own_head, dsl_dir(own_head, 0, 0, 0));
        let own_parent = mos.reserve();
        let map = Zap::new(false).int("again", own_parent);
        let map = area.zap_object(ObjectType::DslDirChildMap as u8, &map);
        let map = mos.add(map);
        mos.set(own_parent, dsl_dir(0, own_parent, map, 0));
        directory_zap = directory_zap
            .int(OWN_HEAD, own_head)
            .int(OWN_PARENT, own_parent);
    }
    let dnode = area.zap_object(ObjectType::ObjectDirectory as u8, &directory_zap);
    mos.set(directory, dnode);
    mos.finish(area, OS_TYPE_META)
}

/// A whole device: labels, uberblocks and the data area.
#[derive(Debug, Default)]
pub struct Image {
    pub area: Area,
    uberblocks: Vec<(u64, [u8; BLKPTR_SIZE])>,
    name: String,
}

impl Image {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Self::default()
        }
    }

    /// Writes `layout` and commits it as `txg`.
    pub fn commit(&mut self, txg: u64, layout: &PoolLayout) -> &mut Self {
        let rootbp = mos(&mut self.area, layout);
        self.uberblocks.push((txg, rootbp));
        self
    }

    fn label(&self) -> Vec<u8> {
        let txg = self.uberblocks.iter().map(|(t, _)| *t).max().unwrap_or(0);
        let mut config = Xdr::default();
        config.buf.extend_from_slice(&0x0101_0000u32.to_be_bytes());
        config
            .begin()
            .u64("version", POOL_VERSION)
            .str("name", &self.name)
            .u64("txg", txg)
            .u64("pool_guid", 0x1111)
            .u64("guid", 0x2222)
            .nested("vdev_tree")
            .str("type", "disk")
            .u64("id", 0)
            .u64("guid", 0x2222)
            .u64("ashift", 9)
            .end()
            .end();
        let mut out = vec![0u8; LABEL_SIZE as usize];
        out[LABEL_PAD..LABEL_PAD + config.buf.len()].copy_from_slice(&config.buf);
        for (slot, (txg, rootbp)) in self.uberblocks.iter().enumerate() {
            let at = LABEL_PAD + NV_AREA_SIZE + slot * UBERBLOCK_SLOT_SIZE;
            put_u64(&mut out, at, UBERBLOCK_MAGIC);
            put_u64(&mut out, at + 8, POOL_VERSION);
            put_u64(&mut out, at + 16, *txg);
            out[at + 40..at + 40 + BLKPTR_SIZE].copy_from_slice(rootbp);
        }
        out
    }

    pub fn bytes(&self) -> Vec<u8> {
        let label = self.label();
        let mut out = Vec::new();
        out.extend_from_slice(&label);
        out.extend_from_slice(&label);
        out.resize(VDEV_DATA_OFFSET as usize, 0);
        out.extend_from_slice(&self.area.data);
        out.resize(round_up(out.len() + (64 << 10), SECTOR), 0);
        out.extend_from_slice(&label);
        out.extend_from_slice(&label);
        out
    }

    pub fn disk(&self) -> MemDisk {
        MemDisk::new(self.bytes())
    }
}

/// One child of a RAID-Z vdev whose label lists the children by `guids`.
/// `data` fills the start of its allocatable area.
pub fn raidz_child(guid: u64, guids: &[u64], data: &[u8]) -> Vec<u8> {
    let mut config = Xdr::default();
    config.buf.extend_from_slice(&0x0101_0000u32.to_be_bytes());
    config
        .begin()
        .u64("version", POOL_VERSION)
        .str("name", "striped")
        .u64("txg", 1)
        .u64("guid", guid)
        .nested("vdev_tree")
        .str("type", "raidz")
        .u64("id", 0)
        .u64("nparity", 1)
        .u64("ashift", 9)
        .array("children", guids.len() as u32);
    for child in guids {
        config.begin().str("type", "file").u64("guid", *child).end();
    }
    config.end().end();
    let mut label = vec![0u8; LABEL_SIZE as usize];
    label[LABEL_PAD..LABEL_PAD + config.buf.len()].copy_from_slice(&config.buf);
    let at = LABEL_PAD + NV_AREA_SIZE;
    put_u64(&mut label, at, UBERBLOCK_MAGIC);
    put_u64(&mut label, at + 8, POOL_VERSION);
    put_u64(&mut label, at + 16, 1);

    let mut out = Vec::new();
    out.extend_from_slice(&label);
    out.extend_from_slice(&label);
    out.resize(VDEV_DATA_OFFSET as usize, 0);
    out.extend_from_slice(data);
    out.resize(round_up(out.len() + (64 << 10), SECTOR), 0);
    out.extend_from_slice(&label);
    out.extend_from_slice(&label);
    out
}

/// The single-txg image of `layout`.
pub fn image(layout: &PoolLayout) -> Image {
    let mut image = Image::new(&layout.name);
    image.commit(5, layout);
    image
}

pub fn open_with(image: &Image, options: PoolOptions) -> Pool {
    let vdev: Box<dyn Vdev + Send> = Box::new(DiskVdev::open(image.disk(), &options).unwrap());
    Pool::new(vec![vdev], options).unwrap()
}

pub fn open(layout: &PoolLayout) -> Pool {
    open_with(&image(layout), PoolOptions::default())
}

/// Options reporting into a fresh in-memory sink.
pub fn recording(thorough: bool) -> (PoolOptions, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let options = PoolOptions::default()
        .thorough(thorough)
        .diagnostics(Diagnostics::new(sink.clone()));
    (options, sink)
}
