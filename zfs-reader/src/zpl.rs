//!
//! Datastructures used by the ZFS Posix Layer
//!
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

use nom::{number::complete as number, IResult};
use tracing::trace;

use enum_repr_derive::TryFrom;

use crate::zap::ZapEntries;
use crate::ZfsError;

pub const SA_MAGIC: u32 = 0x2F505A;
pub const ZNODE_PHYS_SIZE: usize = 264;

const S_IFMT_SHIFT: u64 = 12;
const PERMISSION_MASK: u64 = 0o7777;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u64,
}

impl Timestamp {
    fn from_words(words: &[u64]) -> Option<Self> {
        match words {
            [secs, nanos, ..] => Some(Self {
                secs: *secs,
                nanos: *nanos,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Turns out this structure isn't used anymore since ZPL version 5
// -_-
#[derive(Debug, Clone)]
pub struct ZNodePhys {
    pub atime: [u64; 2],
    pub mtime: [u64; 2],
    pub ctime: [u64; 2],
    pub crtime: [u64; 2],
    pub gen: u64,
    pub mode: u64,
    pub size: u64,
    pub parent: u64,
    pub links: u64,
    pub xattr: u64,
    pub rdev: u64,
    pub flags: u64,
    pub uid: u64,
    pub gid: u64,
}

impl ZNodePhys {
    /// Only the fixed attribute words; the trailing ACL is not decoded.
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (at0, at1, mt0, mt1, ct0, ct1, crt0, crt1)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        let (input, (gen, mode, size, parent, links, xattr, rdev, flags, uid, gid, _zap_pad)) =
            nom::sequence::tuple((
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                nom::bytes::complete::take(8 * 4usize),
            ))(input)?;
        Ok((
            input,
            Self {
                atime: [at0, at1],
                mtime: [mt0, mt1],
                ctime: [ct0, ct1],
                crtime: [crt0, crt1],
                gen,
                mode,
                size,
                parent,
                links,
                xattr,
                rdev,
                flags,
                uid,
                gid,
            },
        ))
    }
}

/// Attributes of a file or directory, whichever bonus layout they came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZplAttributes {
    pub mode: u64,
    pub size: u64,
    pub uid: u64,
    pub gid: u64,
    pub parent: u64,
    pub links: u64,
    pub gen: u64,
    pub flags: u64,
    pub rdev: u64,
    pub xattr: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub crtime: Timestamp,
    pub symlink: Option<Vec<u8>>,
}

impl ZplAttributes {
    pub fn from_znode(z: &ZNodePhys) -> Self {
        Self {
            mode: z.mode,
            size: z.size,
            uid: z.uid,
            gid: z.gid,
            parent: z.parent,
            links: z.links,
            gen: z.gen,
            flags: z.flags,
            rdev: z.rdev,
            xattr: z.xattr,
            atime: Timestamp::from_words(&z.atime).unwrap_or_default(),
            mtime: Timestamp::from_words(&z.mtime).unwrap_or_default(),
            ctime: Timestamp::from_words(&z.ctime).unwrap_or_default(),
            crtime: Timestamp::from_words(&z.crtime).unwrap_or_default(),
            symlink: None,
        }
    }

    /// Legacy fixed-layout bonus buffer.
    pub fn parse_znode(bonus: &[u8]) -> crate::Result<Self> {
        let (_, znode) = ZNodePhys::parse(bonus)?;
        Ok(Self::from_znode(&znode))
    }

    /// System-attribute bonus buffer, decoded through the dataset's SA table.
    pub fn parse_sa(bonus: &[u8], table: &SaTable) -> crate::Result<Self> {
        let (_, buf) = SABuf::parse(bonus)?;
        let mut attrs = Self::default();
        for (attr, value) in buf.parse_attrs(table)? {
            let words = value.to_u64s();
            let first = words.first().copied().unwrap_or(0);
            match attr.name.as_str() {
                "ZPL_MODE" => attrs.mode = first,
                "ZPL_SIZE" => attrs.size = first,
                "ZPL_UID" => attrs.uid = first,
                "ZPL_GID" => attrs.gid = first,
                "ZPL_PARENT" => attrs.parent = first,
                "ZPL_LINKS" => attrs.links = first,
                "ZPL_GEN" => attrs.gen = first,
                "ZPL_FLAGS" => attrs.flags = first,
                "ZPL_RDEV" => attrs.rdev = first,
                "ZPL_XATTR" => attrs.xattr = first,
                "ZPL_ATIME" => attrs.atime = Timestamp::from_words(&words).unwrap_or_default(),
                "ZPL_MTIME" => attrs.mtime = Timestamp::from_words(&words).unwrap_or_default(),
                "ZPL_CTIME" => attrs.ctime = Timestamp::from_words(&words).unwrap_or_default(),
                "ZPL_CRTIME" => attrs.crtime = Timestamp::from_words(&words).unwrap_or_default(),
                "ZPL_SYMLINK" => {
                    if let SAValue::U8(bytes) = value {
                        attrs.symlink = Some(bytes);
                    }
                }
                other => trace!(attr = other, "ignoring system attribute"),
            }
        }
        Ok(attrs)
    }

    pub fn permissions(&self) -> u64 {
        self.mode & PERMISSION_MASK
    }
    pub fn file_type(&self) -> DirEntryType {
        DirEntry::type_from_bits(((self.mode >> S_IFMT_SHIFT) & 0xf) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry(pub u64);

impl DirEntry {
    fn type_from_bits(ty: u8) -> DirEntryType {
        DirEntryTypeInternal::try_from(ty)
            .map(|ty| ty.into())
            .unwrap_or_else(|_| DirEntryType::Invalid(ty))
    }
    pub fn get_type(&self) -> DirEntryType {
        Self::type_from_bits((self.0 >> 60) as u8)
    }
    pub fn get_objnum(&self) -> u64 {
        self.0 & ((1 << 48) - 1)
    }
    pub fn new(kind: DirEntryType, obj_num: u64) -> Self {
        let ty: u8 = kind.into();
        Self((u64::from(ty) << 60) | (obj_num & ((1 << 48) - 1)))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DirEntryType {
    NotSpecified,
    FIFO,
    CharacterDevice,
    Directory,
    BlockDevice,
    RegularFile,
    SymLink,
    Socket,
    Door,
    EventPort,
    Invalid(u8),
}

impl DirEntryType {
    /// One-letter tag in the style of `ls -l`.
    pub fn tag(&self) -> char {
        match self {
            DirEntryType::Directory => 'd',
            DirEntryType::RegularFile => '-',
            DirEntryType::SymLink => 'l',
            DirEntryType::FIFO => 'p',
            DirEntryType::CharacterDevice => 'c',
            DirEntryType::BlockDevice => 'b',
            DirEntryType::Socket => 's',
            DirEntryType::Door => 'D',
            DirEntryType::EventPort => 'P',
            DirEntryType::NotSpecified | DirEntryType::Invalid(_) => '?',
        }
    }
}

impl From<DirEntryTypeInternal> for DirEntryType {
    fn from(i: DirEntryTypeInternal) -> Self {
        use DirEntryType::*;
        use DirEntryTypeInternal as DI;
        match i {
            DI::NotSpecified => NotSpecified,
            DI::FIFO => FIFO,
            DI::CharacterDevice => CharacterDevice,
            DI::Directory => Directory,
            DI::BlockDevice => BlockDevice,
            DI::RegularFile => RegularFile,
            DI::SymLink => SymLink,
            DI::Socket => Socket,
            DI::Door => Door,
            DI::EventPort => EventPort,
        }
    }
}

impl From<DirEntryType> for u8 {
    fn from(kind: DirEntryType) -> u8 {
        use DirEntryType::*;
        match kind {
            NotSpecified => 0,
            FIFO => 1,
            CharacterDevice => 2,
            Directory => 4,
            BlockDevice => 6,
            RegularFile => 8,
            SymLink => 10,
            Socket => 12,
            Door => 13,
            EventPort => 14,
            Invalid(i) => i,
        }
    }
}

#[derive(TryFrom)]
#[repr(u8)]
enum DirEntryTypeInternal {
    NotSpecified = 0,
    FIFO = 1,
    CharacterDevice = 2,
    Directory = 4,
    BlockDevice = 6,
    RegularFile = 8,
    SymLink = 10,
    Socket = 12,
    Door = 13,
    EventPort = 14,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SAAttr {
    pub name: String,
    pub attr_num: u16,
    /// Length of 0 means this attribute is of variable size (!!!)
    pub length: u16,
    pub byteswap: SAByteswapType,
}

impl SAAttr {
    pub fn new(name: String, phys: SAAttrPhys) -> Option<Self> {
        Some(SAAttr {
            name,
            attr_num: phys.get_attr_num(),
            length: phys.get_len(),
            byteswap: phys.get_byteswap()?,
        })
    }
}

/// Registry value: attribute number, byteswap class and fixed length.
#[derive(Debug, Clone, Copy)]
pub struct SAAttrPhys(pub u64);

impl SAAttrPhys {
    pub fn get_len(&self) -> u16 {
        ((self.0 >> 24) & ((1 << 16) - 1)) as u16
    }
    pub fn get_byteswap(&self) -> Option<SAByteswapType> {
        SAByteswapType::try_from(((self.0 >> 16) & ((1 << 8) - 1)) as u8).ok()
    }
    pub fn get_attr_num(&self) -> u16 {
        (self.0 & ((1 << 16) - 1)) as u16
    }
}

#[derive(Debug, Clone, Copy, TryFrom, PartialEq, Eq)]
#[repr(u8)]
pub enum SAByteswapType {
    U64Array = 0,
    U32Array = 1,
    U16Array = 2,
    U8Array = 3,
    ACL = 4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SAValue {
    U64(Vec<u64>),
    U32(Vec<u32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
    /// ACL entries are kept raw.
    Acl(Vec<u8>),
}

impl SAValue {
    pub fn parse<'a>(attr: &SAAttr, len: u16, input: &'a [u8]) -> IResult<&'a [u8], Self> {
        use SAByteswapType::*;
        use SAValue::*;
        let parser = |data| match attr.byteswap {
            U64Array => nom::combinator::map(nom::multi::many0(number::le_u64), U64)(data),
            U32Array => nom::combinator::map(nom::multi::many0(number::le_u32), U32)(data),
            U16Array => nom::combinator::map(nom::multi::many0(number::le_u16), U16)(data),
            U8Array => nom::combinator::map(nom::combinator::rest, |b: &[u8]| U8(b.to_vec()))(data),
            ACL => nom::combinator::map(nom::combinator::rest, |b: &[u8]| Acl(b.to_vec()))(data),
        };
        nom::combinator::map_parser(nom::bytes::complete::take(len), parser)(input)
    }

    pub fn to_u64s(&self) -> Vec<u64> {
        match self {
            SAValue::U64(v) => v.clone(),
            SAValue::U32(v) => v.iter().map(|x| u64::from(*x)).collect(),
            SAValue::U16(v) => v.iter().map(|x| u64::from(*x)).collect(),
            SAValue::U8(v) | SAValue::Acl(v) => v.iter().map(|x| u64::from(*x)).collect(),
        }
    }
}

/// Attribute registry and layouts of one dataset, from the `SA_ATTRS` master
/// node entry.
#[derive(Debug, Clone, Default)]
pub struct SaTable {
    attrs: HashMap<u16, SAAttr>,
    layouts: HashMap<u16, Vec<u16>>,
}

/// Decodes the `REGISTRY` ZAP: attribute name to packed attribute word.
pub fn parse_registry(entries: &ZapEntries) -> crate::Result<Vec<SAAttr>> {
    entries
        .iter()
        .map(|(name, value)| {
            let raw = value
                .as_u64()
                .ok_or_else(|| ZfsError::Invalid(format!("sa registry entry {}", name)))?;
            SAAttr::new(name.to_owned(), SAAttrPhys(raw))
                .ok_or_else(|| ZfsError::Invalid(format!("sa attribute {} byteswap", name)))
        })
        .collect()
}

impl SaTable {
    pub fn new(registry: &[SAAttr], layouts: &ZapEntries) -> crate::Result<Self> {
        let attrs = registry
            .iter()
            .map(|attr| (attr.attr_num, attr.clone()))
            .collect();
        let mut table = HashMap::new();
        for (name, value) in layouts.iter() {
            let num: u16 = name
                .parse()
                .map_err(|_| ZfsError::Invalid(format!("sa layout name {:?}", name)))?;
            table.insert(num, value.to_u64s().into_iter().map(|a| a as u16).collect());
        }
        Ok(Self {
            attrs,
            layouts: table,
        })
    }

    pub fn layout(&self, num: u16) -> crate::Result<Vec<SAAttr>> {
        let layout = self
            .layouts
            .get(&num)
            .ok_or_else(|| ZfsError::Invalid(format!("unknown sa layout {}", num)))?;
        layout
            .iter()
            .map(|a| {
                self.attrs
                    .get(a)
                    .cloned()
                    .ok_or_else(|| ZfsError::Invalid(format!("unregistered sa attribute {}", a)))
            })
            .collect()
    }
}

/// SA data from a bonus or spill buffer
#[derive(Debug)]
pub struct SABuf {
    pub layout: u16,
    pub lengths: Vec<u16>,
    pub data: Vec<u8>,
}

impl SABuf {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (_magic, size_layout)) = nom::sequence::tuple((
            nom::combinator::verify(number::le_u32, |magic| *magic == SA_MAGIC),
            number::le_u16,
        ))(input)?; // read 4 + 2 bytes
        let header_size = ((size_layout >> 10) & ((1 << 6) - 1)) as usize * 8;
        let layout = (size_layout) & ((1 << 10) - 1);
        let length_size = header_size.saturating_sub(4 + 2); // subtract the bytes we have already read
        let (input, lengths) = nom::combinator::map_parser(
            nom::bytes::complete::take(length_size),
            nom::multi::many0(number::le_u16),
        )(input)?;
        let (input, data) = nom::combinator::rest(input)?;
        Ok((
            input,
            Self {
                layout,
                lengths,
                data: data.to_owned(),
            },
        ))
    }

    pub fn parse_attrs(&self, table: &SaTable) -> crate::Result<Vec<(SAAttr, SAValue)>> {
        let layout = table.layout(self.layout)?;
        let mut var_length_idx = 0;
        let mut input = &self.data[..];
        let mut out = Vec::with_capacity(layout.len());
        for attr in layout {
            // variable sized attributes take their lengths from the header in order
            let len = if attr.length == 0 {
                let len = self.lengths.get(var_length_idx).copied().ok_or_else(|| {
                    ZfsError::Invalid(format!("missing length for sa attribute {}", attr.name))
                })?;
                var_length_idx += 1;
                len
            } else {
                attr.length
            };
            let (rest, value) = SAValue::parse(&attr, len, input)?;
            input = rest;
            if attr.length == 0 {
                // variable sized attributes are padded to 8 bytes
                let pad = (8 - (len as usize % 8)) % 8;
                input = &input[pad.min(input.len())..];
            }
            out.push((attr, value));
        }
        Ok(out)
    }
}
