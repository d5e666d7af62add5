//!
//! ZFS Attribute Processor: the name/value maps behind directories,
//! dataset children, properties and most pool metadata.
//!
use std::collections::BTreeSet;
use std::fmt;

use crc::{Algorithm, Crc};
use nom::{number::complete as number, IResult};
use tracing::warn;

use crate::{Result, ZfsError};

pub const ZBT_MICRO: u64 = (1 << 63) + 3;
pub const ZBT_HEADER: u64 = (1 << 63) + 1;
pub const ZBT_LEAF: u64 = 1 << 63;
pub const ZAP_MAGIC: u64 = 0x2_F52A_B2AB;
pub const MZAP_ENT_LEN: usize = 64;
pub const MZAP_NAME_LEN: usize = 50;
pub const ZAP_LEAF_CHUNK_SIZE: usize = 24;
pub const ZAP_LEAF_HEADER_SIZE: usize = 48;
const ZAP_LEAF_ARRAY_BYTES: usize = ZAP_LEAF_CHUNK_SIZE - 3;
const ZAP_FLAG_HASH64: u64 = 1;
const ZAP_CHAIN_END: u16 = 0xffff;

/// ZFS's CRC-64: reflected ECMA-182, register seeded with the salt.
const ZFS_CRC64: Algorithm<u64> = Algorithm {
    width: 64,
    poly: 0x42f0_e1eb_a9ea_3693,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0,
    check: 0,
    residue: 0,
};
const ZAP_CRC: Crc<u64> = Crc::<u64>::new(&ZFS_CRC64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZapValue {
    /// A single integer of any width.
    Int(u64),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
}

impl ZapValue {
    /// Big-endian integers of `int_size` bytes; a lone element collapses to
    /// [`ZapValue::Int`].
    pub fn parse(input: &[u8], int_size: u8) -> Option<ZapValue> {
        let width = usize::from(int_size);
        if !matches!(width, 1 | 2 | 4 | 8) || input.len() % width != 0 {
            return None;
        }
        let words = input.chunks_exact(width);
        let value = match int_size {
            1 => ZapValue::U8(input.to_owned()),
            2 => ZapValue::U16(words.map(|w| u16::from_be_bytes([w[0], w[1]])).collect()),
            4 => ZapValue::U32(
                words
                    .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
                    .collect(),
            ),
            _ => ZapValue::U64(
                words
                    .map(|w| {
                        let mut b = [0u8; 8];
                        b.copy_from_slice(w);
                        u64::from_be_bytes(b)
                    })
                    .collect(),
            ),
        };
        let single = match &value {
            ZapValue::U8(v) if v.len() == 1 => Some(u64::from(v[0])),
            ZapValue::U16(v) if v.len() == 1 => Some(u64::from(v[0])),
            ZapValue::U32(v) if v.len() == 1 => Some(u64::from(v[0])),
            ZapValue::U64(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        };
        Some(single.map(ZapValue::Int).unwrap_or(value))
    }
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ZapValue::Int(v) => Some(*v),
            _ => None,
        }
    }
    /// Every element widened to `u64`.
    pub fn to_u64s(&self) -> Vec<u64> {
        match self {
            ZapValue::Int(v) => vec![*v],
            ZapValue::U8(v) => v.iter().map(|x| u64::from(*x)).collect(),
            ZapValue::U16(v) => v.iter().map(|x| u64::from(*x)).collect(),
            ZapValue::U32(v) => v.iter().map(|x| u64::from(*x)).collect(),
            ZapValue::U64(v) => v.clone(),
        }
    }
    /// Byte arrays read as a NUL-terminated string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ZapValue::U8(v) => {
                let end = v.iter().position(|c| *c == 0).unwrap_or(v.len());
                std::str::from_utf8(&v[..end]).ok()
            }
            _ => None,
        }
    }
}

impl fmt::Display for ZapValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZapValue::Int(v) => write!(f, "{}", v),
            ZapValue::U8(_) if self.as_str().is_some() => {
                write!(f, "{:?}", self.as_str().unwrap_or_default())
            }
            ZapValue::U8(v) => write!(f, "{:?}", v),
            ZapValue::U16(v) => write!(f, "{:?}", v),
            ZapValue::U32(v) => write!(f, "{:?}", v),
            ZapValue::U64(v) => write!(f, "{:?}", v),
        }
    }
}

/// Decoded ZAP contents in on-disk order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZapEntries {
    entries: Vec<(String, ZapValue)>,
}

impl ZapEntries {
    pub fn new() -> Self {
        Self::default()
    }
    /// A name seen again replaces the earlier value in place.
    pub fn insert(&mut self, name: String, value: ZapValue) {
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }
    pub fn get(&self, name: &str) -> Option<&ZapValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(ZapValue::as_u64)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ZapValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::iter::FromIterator<(String, ZapValue)> for ZapEntries {
    fn from_iter<I: IntoIterator<Item = (String, ZapValue)>>(iter: I) -> Self {
        let mut entries = Self::new();
        for (k, v) in iter {
            entries.insert(k, v);
        }
        entries
    }
}

fn word(input: &[u8]) -> IResult<&[u8], u64> {
    number::le_u64(input)
}

/// Decodes a whole ZAP object. `block_size` is the object's data block size.
pub fn decode(data: &[u8], block_size: usize) -> Result<ZapEntries> {
    let (_, block_type) = word(data)?;
    match block_type {
        ZBT_MICRO => {
            let (_, mzap) = MZapPhys::parse(data)?;
            Ok(mzap.entries())
        }
        ZBT_HEADER => {
            let fat = FatZap::new(data, block_size)?;
            let mut entries = ZapEntries::new();
            for blk in fat.leaf_blocks()? {
                for (name, value) in fat.leaf(blk)?.entries()? {
                    entries.insert(name, value);
                }
            }
            Ok(entries)
        }
        ZBT_LEAF => Err(ZfsError::Invalid("zap leaf without header".to_owned())),
        other => Err(ZfsError::Invalid(format!("zap block type {:#x}", other))),
    }
}

/// Looks a single name up without decoding the whole map.
pub fn lookup(data: &[u8], block_size: usize, name: &str) -> Result<Option<ZapValue>> {
    let (_, block_type) = word(data)?;
    match block_type {
        ZBT_MICRO => {
            let (_, mzap) = MZapPhys::parse(data)?;
            Ok(mzap.lookup(name.as_bytes()).map(ZapValue::Int))
        }
        ZBT_HEADER => {
            let fat = FatZap::new(data, block_size)?;
            let hash = zap_hash(fat.header.salt, name.as_bytes(), fat.header.hash_bits());
            let blk = fat.table_entry(zap_hash_idx(hash, fat.header.ptrtbl.shift as u8))?;
            let leaf = fat.leaf(blk)?;
            leaf.lookup(name.as_bytes(), hash, leaf_hash_shift(block_size))
        }
        other => Err(ZfsError::Invalid(format!("zap block type {:#x}", other))),
    }
}

#[derive(Debug, Clone)]
pub struct MZapPhys {
    pub block_type: u64,
    pub salt: u64,
    pub normflags: u64,
    pub entries: Vec<MZapEntryPhys>,
}

impl MZapPhys {
    /// The whole object is one block; entries fill everything after the header.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let n = input.len().saturating_sub(MZAP_ENT_LEN) / MZAP_ENT_LEN;
        let (input, (block_type, salt, normflags, _pad, entries)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_MICRO),
            number::le_u64,
            number::le_u64,
            nom::bytes::complete::take(5 * 8usize),
            nom::multi::count(MZapEntryPhys::parse, n),
        ))(input)?;
        Ok((
            input,
            Self {
                block_type,
                salt,
                normflags,
                entries,
            },
        ))
    }
    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        if key.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| entry.name() == key)
            .map(|entry| entry.value)
    }
    /// Entries with an empty name are unused slots and skipped.
    pub fn entries(&self) -> ZapEntries {
        self.entries
            .iter()
            .filter(|e| !e.name().is_empty())
            .map(|e| {
                (
                    String::from_utf8_lossy(e.name()).into_owned(),
                    ZapValue::Int(e.value),
                )
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct MZapEntryPhys {
    pub value: u64,
    pub cd: u32,
    pub name: Vec<u8>,
}

impl MZapEntryPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (value, cd, _pad, name)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u32,
            nom::bytes::complete::take(2usize),
            nom::bytes::complete::take(MZAP_NAME_LEN),
        ))(input)?;
        Ok((
            input,
            Self {
                value,
                cd,
                name: name.to_vec(),
            },
        ))
    }
    /// Name bytes up to the terminating NUL.
    pub fn name(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|c| *c == 0)
            .unwrap_or(self.name.len());
        &self.name[..end]
    }
}

impl fmt::Debug for MZapEntryPhys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MZapEntryPhys")
            .field("value", &self.value)
            .field("cd", &self.cd)
            .field("name", &String::from_utf8_lossy(self.name()))
            .finish()
    }
}

#[derive(Clone)]
pub struct ZapPhys {
    pub block_type: u64,
    pub magic: u64,
    pub ptrtbl: ZapTablePhys,
    pub freeblk: u64,
    pub num_leafs: u64,
    pub num_entries: u64,
    pub salt: u64,
    pub normflags: u64,
    pub flags: u64,
    /// Embedded pointer table, the second half of the header block.
    pub leafs: Vec<u64>,
}

impl fmt::Debug for ZapPhys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZapPhys")
            .field("block_type", &self.block_type)
            .field("magic", &self.magic)
            .field("ptrtbl", &self.ptrtbl)
            .field("freeblk", &self.freeblk)
            .field("num_leafs", &self.num_leafs)
            .field("num_entries", &self.num_entries)
            .field("salt", &self.salt)
            .field("flags", &self.flags)
            .finish()
    }
}

impl ZapPhys {
    const FIXED_SIZE: usize = 104;

    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let (
            input,
            (
                block_type,
                magic,
                ptrtbl,
                freeblk,
                num_leafs,
                num_entries,
                salt,
                normflags,
                flags,
                _pad,
                leafs,
            ),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_HEADER),
            nom::combinator::verify(number::le_u64, |magic| *magic == ZAP_MAGIC),
            ZapTablePhys::parse,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            nom::bytes::complete::take((block_size / 2).saturating_sub(Self::FIXED_SIZE)),
            nom::multi::count(number::le_u64, (block_size / 2) / 8),
        ))(input)?;
        Ok((
            input,
            Self {
                block_type,
                magic,
                ptrtbl,
                freeblk,
                num_leafs,
                num_entries,
                salt,
                normflags,
                flags,
                leafs,
            },
        ))
    }
    pub fn hash_bits(&self) -> u32 {
        if self.flags & ZAP_FLAG_HASH64 != 0 {
            48
        } else {
            28
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZapTablePhys {
    /// First block of an external pointer table, 0 when embedded.
    pub blk: u64,
    pub numblks: u64,
    pub shift: u64,
    pub nextblk: u64,
    pub blk_copied: u64,
}

impl ZapTablePhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (blk, numblks, shift, nextblk, blk_copied)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                blk,
                numblks,
                shift,
                nextblk,
                blk_copied,
            },
        ))
    }
}

/// A fat ZAP over its raw object contents.
struct FatZap<'a> {
    data: &'a [u8],
    block_size: usize,
    header: ZapPhys,
}

impl<'a> FatZap<'a> {
    fn new(data: &'a [u8], block_size: usize) -> Result<Self> {
        if block_size < 1024 || !block_size.is_power_of_two() {
            return Err(ZfsError::Invalid(format!(
                "fat zap block size {}",
                block_size
            )));
        }
        let (_, header) = ZapPhys::parse(data, block_size)?;
        Ok(Self {
            data,
            block_size,
            header,
        })
    }

    fn block(&self, blk: u64) -> Result<&'a [u8]> {
        let range = usize::try_from(blk)
            .ok()
            .and_then(|blk| blk.checked_mul(self.block_size))
            .and_then(|start| Some(start..start.checked_add(self.block_size)?));
        range
            .and_then(|range| self.data.get(range))
            .ok_or_else(|| ZfsError::Invalid(format!("zap block {} out of range", blk)))
    }

    fn table_len(&self) -> usize {
        1usize.checked_shl(self.header.ptrtbl.shift as u32).unwrap_or(0)
    }

    fn table_entry(&self, idx: u64) -> Result<u64> {
        let ptrtbl = &self.header.ptrtbl;
        if ptrtbl.blk == 0 {
            return usize::try_from(idx)
                .ok()
                .and_then(|idx| self.header.leafs.get(idx))
                .copied()
                .ok_or_else(|| ZfsError::Invalid(format!("zap pointer {} out of range", idx)));
        }
        let per_block = (self.block_size / 8) as u64;
        let block = ptrtbl
            .blk
            .checked_add(idx / per_block)
            .ok_or_else(|| ZfsError::Invalid(format!("zap pointer {} out of range", idx)))?;
        let block = self.block(block)?;
        let at = (idx % per_block) as usize * 8;
        let (_, entry) = word(&block[at..])?;
        Ok(entry)
    }

    /// Number of pointer table entries that are actually stored.
    fn stored_entries(&self) -> Result<usize> {
        let ptrtbl = &self.header.ptrtbl;
        if ptrtbl.blk == 0 {
            return Ok(self.table_len().min(self.header.leafs.len()));
        }
        let blocks = self.data.len() / self.block_size;
        let fits = ptrtbl
            .blk
            .checked_add(ptrtbl.numblks)
            .and_then(|end| usize::try_from(end).ok())
            .map_or(false, |end| end <= blocks);
        if !fits {
            return Err(ZfsError::Invalid(format!(
                "zap pointer table at block {} with {} blocks exceeds {} blocks",
                ptrtbl.blk, ptrtbl.numblks, blocks
            )));
        }
        // Bounded by data.len() / 8 once the table fits.
        Ok(self
            .table_len()
            .min(ptrtbl.numblks as usize * (self.block_size / 8)))
    }

    /// Distinct leaf block numbers referenced by the pointer table, ascending.
    fn leaf_blocks(&self) -> Result<BTreeSet<u64>> {
        let len = self.stored_entries()?;
        Ok((0..len as u64)
            .filter_map(|idx| match self.table_entry(idx) {
                Ok(blk) => Some(blk),
                Err(e) => {
                    warn!(idx, error = %e, "unreadable zap pointer");
                    None
                }
            })
            .filter(|blk| *blk != 0)
            .collect())
    }

    fn leaf(&self, blk: u64) -> Result<ZapLeafPhys> {
        let (_, leaf) = ZapLeafPhys::parse(self.block(blk)?, self.block_size)?;
        Ok(leaf)
    }
}

pub const fn zap_leaf_hash_numentries(block_size: usize) -> usize {
    block_size / 32
}

pub const fn zap_leaf_numchunks(block_size: usize) -> usize {
    ((block_size - (2 * zap_leaf_hash_numentries(block_size))) / ZAP_LEAF_CHUNK_SIZE) - 2
}

fn leaf_hash_shift(block_size: usize) -> u32 {
    block_size.trailing_zeros() - 5
}

// take the entry_shift number bits following prefix_len number of bits
// 0 0 0 0 0 0 0 1 1 1 1 1 0 0 ....
// | prefix_len | entry_shift |
//                ^ take these
fn leaf_idx(hash: u64, entry_shift: u32, prefix_len: u16) -> u64 {
    let shift = 64u32
        .checked_sub(entry_shift + u32::from(prefix_len))
        .unwrap_or(0);
    let shifted = hash.checked_shr(shift).unwrap_or(0);
    shifted & ((1 << entry_shift) - 1)
}

#[derive(Debug, Clone)]
pub struct ZapLeafPhys {
    pub hdr: ZapLeafHeader,
    pub hash: Vec<u16>,
    pub chunks: Vec<ZapLeafChunk>,
}

impl ZapLeafPhys {
    /// block_size in bytes
    pub fn parse(input: &[u8], block_size: usize) -> IResult<&[u8], Self> {
        let (input, hdr) = ZapLeafHeader::parse(input)?;
        let (input, hash) =
            nom::multi::count(number::le_u16, zap_leaf_hash_numentries(block_size))(input)?;
        let (input, chunks) =
            nom::multi::count(ZapLeafChunk::parse, zap_leaf_numchunks(block_size))(input)?;
        Ok((input, Self { hdr, hash, chunks }))
    }

    pub fn lookup(&self, key: &[u8], hash: u64, leaf_shift: u32) -> Result<Option<ZapValue>> {
        let slot = leaf_idx(hash, leaf_shift, self.hdr.prefix_len) as usize;
        let mut chunk_idx = match self.hash.get(slot) {
            Some(i) => *i,
            None => return Ok(None),
        };
        for _ in 0..self.chunks.len() {
            let entry = match self.chunks.get(chunk_idx as usize) {
                Some(ZapLeafChunk::Entry(e)) => e,
                Some(_) => {
                    return Err(ZfsError::Invalid(format!(
                        "zap hash chain reaches non-entry chunk {}",
                        chunk_idx
                    )))
                }
                None => return Ok(None),
            };
            if self.name(entry)? == key {
                return Ok(self.value(entry)?);
            }
            chunk_idx = entry.next;
        }
        Ok(None)
    }

    /// Concatenated array chunks starting at `array_idx`, cut to `length`.
    fn get_array(&self, mut array_idx: u16, length: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length);
        for _ in 0..self.chunks.len() {
            if out.len() >= length {
                break;
            }
            let a = match self.chunks.get(array_idx as usize) {
                Some(ZapLeafChunk::Array(a)) => a,
                Some(_) => {
                    return Err(ZfsError::Invalid(format!(
                        "zap array chain reaches non-array chunk {}",
                        array_idx
                    )))
                }
                None => break,
            };
            out.extend(&a.array);
            array_idx = a.next;
        }
        if out.len() < length {
            return Err(ZfsError::Invalid(format!(
                "zap array holds {} of {} bytes",
                out.len(),
                length
            )));
        }
        out.truncate(length);
        Ok(out)
    }

    fn name(&self, entry: &ZapLeafEntry) -> Result<Vec<u8>> {
        // the stored length counts the terminating NUL
        self.get_array(
            entry.name_chunk,
            (entry.name_length as usize).saturating_sub(1),
        )
    }

    fn value(&self, entry: &ZapLeafEntry) -> Result<Option<ZapValue>> {
        let raw = self.get_array(
            entry.value_chunk,
            entry.int_size as usize * entry.value_length as usize,
        )?;
        Ok(ZapValue::parse(&raw, entry.int_size))
    }

    /// Entries in chunk order.
    pub fn entries(&self) -> Result<Vec<(String, ZapValue)>> {
        let mut out = Vec::new();
        for entry in self.chunks.iter().filter_map(ZapLeafChunk::entry_ref) {
            let name = String::from_utf8_lossy(&self.name(entry)?).into_owned();
            match self.value(entry)? {
                Some(value) => out.push((name, value)),
                None => warn!(%name, int_size = entry.int_size, "skipping zap entry"),
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafHeader {
    pub block_type: u64,
    pub next: u64,
    pub prefix: u64,
    pub magic: u32,
    pub nfree: u16,
    pub nentries: u16,
    pub prefix_len: u16,
    pub freelist: u16,
    pub flags: u8,
}

impl ZapLeafHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (block_type, next, prefix, magic, nfree, nentries, prefix_len, freelist, flags, _pad),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u64, |btype| *btype == ZBT_LEAF),
            number::le_u64,
            number::le_u64,
            number::le_u32,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u8,
            nom::bytes::complete::take(11usize),
        ))(input)?;
        Ok((
            input,
            Self {
                block_type,
                next,
                prefix,
                magic,
                nfree,
                nentries,
                prefix_len,
                freelist,
                flags,
            },
        ))
    }
}

pub const ZAP_LEAF_ENTRY: u8 = 252;
pub const ZAP_LEAF_ARRAY: u8 = 251;
pub const ZAP_LEAF_FREE: u8 = 253;

#[derive(Debug, Clone)]
pub enum ZapLeafChunk {
    Entry(ZapLeafEntry),
    Array(ZapLeafArray),
    Free(ZapLeafFree),
}

impl ZapLeafChunk {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::branch::alt((ZapLeafEntry::parse, ZapLeafArray::parse, ZapLeafFree::parse))(input)
    }
    pub fn entry_ref(&self) -> Option<&ZapLeafEntry> {
        match self {
            ZapLeafChunk::Entry(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafEntry {
    pub int_size: u8,
    pub next: u16,
    pub name_chunk: u16,
    pub name_length: u16,
    pub value_chunk: u16,
    pub value_length: u16,
    pub cd: u16,
    pub hash: u64,
}

impl ZapLeafEntry {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (
            input,
            (
                _kind,
                int_size,
                next,
                name_chunk,
                name_length,
                value_chunk,
                value_length,
                cd,
                _pad,
                hash,
            ),
        ) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_ENTRY),
            number::le_u8,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            number::le_u16,
            nom::bytes::complete::take(2usize),
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            ZapLeafChunk::Entry(Self {
                int_size,
                next,
                name_chunk,
                name_length,
                value_chunk,
                value_length,
                cd,
                hash,
            }),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafArray {
    pub array: [u8; ZAP_LEAF_ARRAY_BYTES],
    pub next: u16,
}

impl ZapLeafArray {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (input, (_kind, array, next)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_ARRAY),
            nom::combinator::map_res(
                nom::bytes::complete::take(ZAP_LEAF_ARRAY_BYTES),
                <[u8; ZAP_LEAF_ARRAY_BYTES]>::try_from,
            ),
            number::le_u16,
        ))(input)?;
        Ok((input, ZapLeafChunk::Array(Self { array, next })))
    }
}

#[derive(Debug, Clone)]
pub struct ZapLeafFree {
    pub next: u16,
}

impl ZapLeafFree {
    pub fn parse(input: &[u8]) -> IResult<&[u8], ZapLeafChunk> {
        let (input, (_kind, _pad, next)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u8, |kind| *kind == ZAP_LEAF_FREE),
            nom::bytes::complete::take(ZAP_LEAF_ARRAY_BYTES),
            number::le_u16,
        ))(input)?;
        Ok((input, ZapLeafChunk::Free(Self { next })))
    }
}

pub fn zap_hash_idx(hash: u64, shift: u8) -> u64 {
    if shift > 0 {
        hash >> (64 - u32::from(shift.min(64)))
    } else {
        0
    }
}

/// Salted hash of a name, keeping only the top `hash_bits` bits.
pub fn zap_hash(salt: u64, key: &[u8], hash_bits: u32) -> u64 {
    let mut digest = ZAP_CRC.digest_with_initial(salt.reverse_bits());
    digest.update(key);
    let crc = digest.finalize();
    crc & !((1u64 << (64 - hash_bits)) - 1)
}
