use std::convert::TryFrom;
use std::fmt;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::checksum::{Fletcher2, Fletcher4};
use crate::ZfsError;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;
/// Two front labels plus the boot block precede the allocatable space.
pub const VDEV_DATA_OFFSET: u64 = 0x40_0000;
pub const BLKPTR_SIZE: usize = 128;
pub const EMBEDDED_PAYLOAD_SIZE: usize = 112;
pub const GANG_HEADER_SIZE: usize = 512;
pub const GANG_MAGIC: u64 = 0x210d_a7ab_10c7_a11;
pub const UBERBLOCK_MAGIC: u64 = 0x00ba_b10c;
pub const SPA_VERSION_MAX: u64 = 5000;

const PROP_LSIZE_MASK: u64 = 0xffff;
const PROP_PSIZE_SHIFT: u32 = 16;
const PROP_COMPRESS_SHIFT: u32 = 32;
const PROP_COMPRESS_MASK: u64 = 0x7f;
const PROP_EMBEDDED_BIT: u64 = 1 << 39;
const PROP_CHECKSUM_SHIFT: u32 = 40;
const PROP_TYPE_SHIFT: u32 = 48;
const PROP_LEVEL_SHIFT: u32 = 56;
const PROP_LEVEL_MASK: u64 = 0x1f;
const PROP_ENCRYPT_BIT: u64 = 1 << 61;
const PROP_DEDUP_BIT: u64 = 1 << 62;
const PROP_BYTEORDER_BIT: u64 = 1 << 63;
const EMBEDDED_LSIZE_MASK: u64 = (1 << 25) - 1;
const EMBEDDED_PSIZE_SHIFT: u32 = 25;
const EMBEDDED_PSIZE_MASK: u64 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uberblock {
    pub magic: u64,
    pub version: u64,
    pub txg: u64,
    pub guid_sum: u64,
    pub timestamp: u64,
    pub rootbp: BlockPtr,
    pub software_version: u64,
    pub mmp_magic: u64,
    pub mmp_delay: u64,
    pub mmp_config: u64,
    pub checkpoint_txg: u64,
}

impl Uberblock {
    pub fn parse(input: &[u8], size: usize) -> IResult<&[u8], Self> {
        let (input, block) = nom::bytes::complete::take(size)(input)?;
        let (
            _block,
            (
                magic,
                version,
                txg,
                guid_sum,
                timestamp,
                rootbp,
                software_version,
                mmp_magic,
                mmp_delay,
                mmp_config,
                checkpoint_txg,
            ),
        ) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            BlockPtr::parse,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(block)?;
        Ok((
            input,
            Self {
                magic,
                version,
                txg,
                guid_sum,
                timestamp,
                rootbp,
                software_version,
                mmp_magic,
                mmp_delay,
                mmp_config,
                checkpoint_txg,
            },
        ))
    }
    pub fn is_valid(&self) -> bool {
        self.magic == UBERBLOCK_MAGIC && self.version <= SPA_VERSION_MAX
    }
}

#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Dva {
    pub vdev: u32,
    pub grid: u8,
    /// Allocated size in sectors.
    pub asize: u32,
    /// Sector offset past the front labels.
    pub offset: u64,
    pub gang: bool,
}

impl fmt::Debug for Dva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dva")
            .field("vdev", &self.vdev)
            .field("grid", &self.grid)
            .field("asize", &self.asize)
            .field("offset", &format!("{:x}", self.offset << SECTOR_SHIFT))
            .field("gang", &self.gang)
            .finish()
    }
}

impl fmt::Display for Dva {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{:x}:{:x}{}",
            self.vdev,
            self.offset << SECTOR_SHIFT,
            self.asize_bytes(),
            if self.gang { "G" } else { "" }
        )
    }
}

impl Dva {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (asize, grid, vdev)) =
            nom::sequence::tuple((number::le_u24, number::le_u8, number::le_u32))(input)?;
        let (input, offset_gang) = number::le_u64(input)?;
        let gang = offset_gang & (1 << 63) != 0;
        let offset = offset_gang & ((1 << 63) - 1);
        Ok((
            input,
            Self {
                vdev,
                grid,
                asize,
                offset,
                gang,
            },
        ))
    }
    pub fn is_allocated(&self) -> bool {
        self.asize != 0
    }
    pub fn asize_bytes(&self) -> u64 {
        u64::from(self.asize) << SECTOR_SHIFT
    }
    /// Absolute byte offset on a leaf device.
    pub fn device_offset(&self) -> crate::Result<u64> {
        self.offset
            .checked_mul(1 << SECTOR_SHIFT)
            .and_then(|bytes| bytes.checked_add(VDEV_DATA_OFFSET))
            .ok_or_else(|| ZfsError::Invalid(format!("dva offset {:#x} out of range", self.offset)))
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Default)]
pub struct Checksum {
    pub checksum: [u64; 4],
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.checksum;
        write!(f, "{:x}:{:x}:{:x}:{:x}", a, b, c, d)
    }
}

impl From<Fletcher4> for Checksum {
    fn from(f: Fletcher4) -> Self {
        Self {
            checksum: [f.a, f.b, f.c, f.d],
        }
    }
}

impl From<Fletcher2> for Checksum {
    fn from(f: Fletcher2) -> Self {
        Self {
            checksum: [f.a0, f.a1, f.b0, f.b1],
        }
    }
}

impl Checksum {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (c1, c2, c3, c4)) = nom::sequence::tuple((
            number::le_u64,
            number::le_u64,
            number::le_u64,
            number::le_u64,
        ))(input)?;
        Ok((
            input,
            Self {
                checksum: [c1, c2, c3, c4],
            },
        ))
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, TryFrom, Eq, PartialEq)]
pub enum CompressionType {
    Inherit = 0,
    On = 1,
    Off = 2,
    LZJB = 3,
    Empty = 4,
    GZIP1 = 5,
    GZIP2 = 6,
    GZIP3 = 7,
    GZIP4 = 8,
    GZIP5 = 9,
    GZIP6 = 10,
    GZIP7 = 11,
    GZIP8 = 12,
    GZIP9 = 13,
    ZLE = 14,
    LZ4 = 15,
    Zstd = 16,
}

impl CompressionType {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_opt(number::le_u8, |x| Self::try_from(x).ok())(input)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, TryFrom, Eq, PartialEq)]
pub enum ChecksumType {
    Inherit = 0,
    On = 1,
    Off = 2,
    Label = 3,
    GangHeader = 4,
    ZILog = 5,
    Fletcher2 = 6,
    Fletcher4 = 7,
    SHA256 = 8,
    ZILog2 = 9,
    NoParity = 10,
    SHA512 = 11,
    Skein = 12,
}

impl ChecksumType {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_opt(number::le_u8, |x| Self::try_from(x).ok())(input)
    }
}

/// A decoded block pointer.
///
/// Compression, checksum and object type are kept as raw tags so that one odd
/// pointer inside an indirect block does not poison its siblings; they are
/// checked when the pointer is actually resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPtr {
    pub kind: BlockPtrKind,
    pub byteorder: bool,
    pub dedup: bool,
    pub encryption: bool,
    pub object_type: u8,
    pub compression: u8,
    pub level: u8,
    /// Bytes.
    pub physical_size: u64,
    /// Bytes.
    pub logical_size: u64,
    pub logical_birth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPtrPtr {
    pub addresses: [Dva; 3],
    pub physical_birth: u64,
    pub checksum_type: u8,
    pub fill_count: u64,
    pub checksum: Checksum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockPtrKind {
    Ptr(BlockPtrPtr),
    Embedded { embedded_type: u8, data: Vec<u8> },
}

impl BlockPtr {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (_, (_dvas, props)) = nom::combinator::peek(nom::sequence::tuple((
            nom::bytes::complete::take(6 * 8usize),
            number::le_u64,
        )))(input)?;
        let compression = ((props >> PROP_COMPRESS_SHIFT) & PROP_COMPRESS_MASK) as u8;
        let object_type = (props >> PROP_TYPE_SHIFT) as u8;
        let level = ((props >> PROP_LEVEL_SHIFT) & PROP_LEVEL_MASK) as u8;
        let encryption = props & PROP_ENCRYPT_BIT != 0;
        let dedup = props & PROP_DEDUP_BIT != 0;
        let byteorder = props & PROP_BYTEORDER_BIT != 0;
        if props & PROP_EMBEDDED_BIT != 0 {
            // payload lives in every word except the property word and the
            // logical birth txg
            let (input, (data0, _props, data1, logical_birth, data2)) = nom::sequence::tuple((
                nom::bytes::complete::take(6 * 8usize),
                number::le_u64,
                nom::bytes::complete::take(3 * 8usize),
                number::le_u64,
                nom::bytes::complete::take(5 * 8usize),
            ))(input)?;
            let mut data = Vec::with_capacity(EMBEDDED_PAYLOAD_SIZE);
            data.extend(data0);
            data.extend(data1);
            data.extend(data2);
            let kind = BlockPtrKind::Embedded {
                embedded_type: (props >> PROP_CHECKSUM_SHIFT) as u8,
                data,
            };
            Ok((
                input,
                Self {
                    kind,
                    byteorder,
                    dedup,
                    encryption,
                    object_type,
                    compression,
                    level,
                    physical_size: ((props >> EMBEDDED_PSIZE_SHIFT) & EMBEDDED_PSIZE_MASK) + 1,
                    logical_size: (props & EMBEDDED_LSIZE_MASK) + 1,
                    logical_birth,
                },
            ))
        } else {
            let (input, (a1, a2, a3)) =
                nom::sequence::tuple((Dva::parse, Dva::parse, Dva::parse))(input)?;
            let (input, (_props, _pad, physical_birth, logical_birth, fill_count, checksum)) =
                nom::sequence::tuple((
                    number::le_u64,
                    nom::bytes::complete::take(16usize),
                    number::le_u64,
                    number::le_u64,
                    number::le_u64,
                    Checksum::parse,
                ))(input)?;
            let kind = BlockPtrKind::Ptr(BlockPtrPtr {
                addresses: [a1, a2, a3],
                physical_birth,
                checksum_type: (props >> PROP_CHECKSUM_SHIFT) as u8,
                fill_count,
                checksum,
            });
            Ok((
                input,
                Self {
                    kind,
                    byteorder,
                    dedup,
                    encryption,
                    object_type,
                    compression,
                    level,
                    physical_size: (((props >> PROP_PSIZE_SHIFT) & PROP_LSIZE_MASK) + 1)
                        << SECTOR_SHIFT,
                    logical_size: ((props & PROP_LSIZE_MASK) + 1) << SECTOR_SHIFT,
                    logical_birth,
                },
            ))
        }
    }
    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, BlockPtrKind::Embedded { .. })
    }
    /// A non-embedded pointer with no allocated copy.
    pub fn is_hole(&self) -> bool {
        match &self.kind {
            BlockPtrKind::Ptr(ptr) => ptr.addresses.iter().all(|dva| !dva.is_allocated()),
            BlockPtrKind::Embedded { .. } => false,
        }
    }
    pub fn compression_type(&self) -> Option<CompressionType> {
        CompressionType::try_from(self.compression).ok()
    }
}

/// Header of a gang block: the children, concatenated, form the block.
#[derive(Debug, Clone)]
pub struct GangHeader {
    pub blkptr: [BlockPtr; 3],
    pub tail: BlockTail,
}

impl GangHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (b0, b1, b2, _pad, tail)) = nom::sequence::tuple((
            BlockPtr::parse,
            BlockPtr::parse,
            BlockPtr::parse,
            nom::bytes::complete::take(GANG_HEADER_SIZE - (BLKPTR_SIZE * 3) - (5 * 8)),
            BlockTail::parse,
        ))(input)?;
        Ok((
            input,
            Self {
                blkptr: [b0, b1, b2],
                tail,
            },
        ))
    }
}

#[derive(Debug, Clone)]
pub struct BlockTail {
    pub magic: u64,
    pub checksum: Checksum,
}

impl BlockTail {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (magic, checksum)) =
            nom::sequence::tuple((number::le_u64, Checksum::parse))(input)?;
        Ok((input, Self { magic, checksum }))
    }
}
