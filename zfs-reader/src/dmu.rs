//!
//! Datastructures used by the Data Management Unit
//!
use std::convert::TryFrom;

use nom::{number::complete as number, IResult};

use enum_repr_derive::TryFrom;

use crate::spa::BlockPtr;

pub const DNODE_SIZE: usize = 512;
pub const DNODE_HEADER_SIZE: usize = 64;
pub const DNODE_MAX_BLKPTR: u8 = 3;
/// Bonus size assumed for free dnode slots.
pub const DNODE_NONE_BONUS: usize = 320;
pub const OBJSET_OLD_PHYS_SIZE: usize = 1024;
pub const ZIL_HEADER_SIZE: usize = 192;

const DMU_OT_NEWTYPE: u8 = 0x80;
const DMU_OT_BYTESWAP_MASK: u8 = 0x1f;
const DMU_BSWAP_ZAP: u8 = 4;

#[repr(u8)]
#[derive(Debug, Clone, Copy, TryFrom, Eq, PartialEq, Hash)]
pub enum ObjectType {
    None = 0,
    ObjectDirectory = 1,
    ObjectArray = 2,
    PackedNvlist = 3,
    PackedNvlistSize = 4,
    Bpobj = 5,
    BpobjHdr = 6,
    SpaceMapHeader = 7,
    SpaceMap = 8,
    IntentLog = 9,
    DNode = 10,
    Objset = 11,
    DslDir = 12,
    DslDirChildMap = 13,
    DslDsSnapMap = 14,
    DslProps = 15,
    DslDataset = 16,
    ZNode = 17,
    OldAcl = 18,
    PlainFileContents = 19,
    DirectoryContents = 20,
    MasterNode = 21,
    UnlinkedSet = 22,
    Zvol = 23,
    ZvolProp = 24,
    PlainOther = 25,
    Uint64Other = 26,
    ZapOther = 27,
    ErrorLog = 28,
    SpaHistory = 29,
    SpaHistoryOffsets = 30,
    PoolProps = 31,
    DslPerms = 32,
    Acl = 33,
    SysAcl = 34,
    Fuid = 35,
    FuidSize = 36,
    NextClones = 37,
    ScanQueue = 38,
    UserGroupUsed = 39,
    UserGroupQuota = 40,
    UserRefs = 41,
    DdtZap = 42,
    DdtStats = 43,
    Sa = 44,
    SaMasterNode = 45,
    SaAttrRegistration = 46,
    SaAttrLayouts = 47,
    ScanXlate = 48,
    Dedup = 49,
    Deadlist = 50,
    DeadlistHdr = 51,
    DslClones = 52,
    BpobjSubobj = 53,
}

impl ObjectType {
    /// Types whose contents are a ZAP, including new-style tags with the ZAP
    /// byteswap class.
    pub fn is_zap(raw: u8) -> bool {
        if raw & DMU_OT_NEWTYPE != 0 {
            return raw & DMU_OT_BYTESWAP_MASK == DMU_BSWAP_ZAP;
        }
        matches!(
            ObjectType::try_from(raw).ok(),
            Some(ObjectType::ObjectDirectory)
                | Some(ObjectType::DslDirChildMap)
                | Some(ObjectType::DslDsSnapMap)
                | Some(ObjectType::DslProps)
                | Some(ObjectType::MasterNode)
                | Some(ObjectType::UnlinkedSet)
                | Some(ObjectType::ZvolProp)
                | Some(ObjectType::ZapOther)
                | Some(ObjectType::ErrorLog)
                | Some(ObjectType::PoolProps)
                | Some(ObjectType::DslPerms)
                | Some(ObjectType::NextClones)
                | Some(ObjectType::ScanQueue)
                | Some(ObjectType::UserGroupUsed)
                | Some(ObjectType::UserGroupQuota)
                | Some(ObjectType::UserRefs)
                | Some(ObjectType::DdtZap)
                | Some(ObjectType::DdtStats)
                | Some(ObjectType::SaMasterNode)
                | Some(ObjectType::SaAttrLayouts)
                | Some(ObjectType::ScanXlate)
                | Some(ObjectType::Deadlist)
                | Some(ObjectType::DslClones)
        )
    }

    /// Printable name for a raw tag.
    pub fn name(raw: u8) -> String {
        match ObjectType::try_from(raw) {
            Ok(t) => format!("{:?}", t),
            Err(_) => format!("type{}", raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DNode {
    pub object_type: u8,
    pub indblkshift: u8,
    pub nlevels: u8,
    pub nblkptr: u8,
    pub bonus_type: u8,
    pub checksum: u8,
    pub compress: u8,
    pub flags: u8,
    pub datablkszsec: u16,
    pub bonuslen: u16,
    pub maxblkid: u64,
    pub used: u64,
    pub blkptr: Vec<BlockPtr>,
    pub bonus: Vec<u8>,
}

impl DNode {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_parser(nom::bytes::complete::take(DNODE_SIZE), Self::parse_slot)(
            input,
        )
    }

    fn parse_slot(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (object_type, indblkshift, nlevels, nblkptr, bonus_type, checksum, compress, flags),
        ) = nom::sequence::tuple((
            number::le_u8,
            number::le_u8,
            number::le_u8,
            nom::combinator::verify(number::le_u8, |n: &u8| *n <= DNODE_MAX_BLKPTR),
            number::le_u8,
            number::le_u8,
            number::le_u8,
            number::le_u8,
        ))(input)?;
        let (input, (datablkszsec, bonuslen, _pad, maxblkid, used, _pad2)) =
            nom::sequence::tuple((
                number::le_u16,
                number::le_u16,
                nom::bytes::complete::take(4usize),
                number::le_u64,
                number::le_u64,
                nom::bytes::complete::take(4 * 8usize),
            ))(input)?;
        let (input, blkptr) = nom::multi::count(BlockPtr::parse, nblkptr as usize)(input)?;
        let bonus_size = if object_type == ObjectType::None as u8 {
            DNODE_NONE_BONUS.min(input.len())
        } else {
            bonuslen as usize
        };
        let (input, bonus) = nom::bytes::complete::take(bonus_size)(input)?;
        Ok((
            input,
            Self {
                object_type,
                indblkshift,
                nlevels,
                nblkptr,
                bonus_type,
                checksum,
                compress,
                flags,
                datablkszsec,
                bonuslen,
                maxblkid,
                used,
                blkptr,
                bonus: bonus.to_vec(),
            },
        ))
    }

    pub fn kind(&self) -> Option<ObjectType> {
        ObjectType::try_from(self.object_type).ok()
    }
    pub fn bonus_kind(&self) -> Option<ObjectType> {
        ObjectType::try_from(self.bonus_type).ok()
    }
    pub fn data_block_size(&self) -> u64 {
        u64::from(self.datablkszsec) << 9
    }
    /// Zero when the shift does not fit a `u64`.
    pub fn indirect_block_size(&self) -> u64 {
        1u64.checked_shl(u32::from(self.indblkshift)).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct ZilHeader {
    pub claim_txg: u64,
    pub replay_seq: u64,
    pub log: BlockPtr,
    pub claim_block_seq: u64,
    pub flags: u64,
    pub claim_lr_seq: u64,
}

impl ZilHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (claim_txg, replay_seq, log, claim_block_seq, flags, claim_lr_seq, _pad)) =
            nom::sequence::tuple((
                number::le_u64,
                number::le_u64,
                BlockPtr::parse,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                nom::bytes::complete::take(3 * 8usize),
            ))(input)?;
        Ok((
            input,
            Self {
                claim_txg,
                replay_seq,
                log,
                claim_block_seq,
                flags,
                claim_lr_seq,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, TryFrom, PartialEq, Eq)]
#[repr(u64)]
pub enum OsType {
    NONE = 0,
    META = 1,
    ZFS = 2,
    ZVOL = 3,
}

impl OsType {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        nom::combinator::map_opt(number::le_u64, |x| OsType::try_from(x).ok())(input)
    }
}

/// Root record of an object set. Pools from version 15 on carry the user
/// and group accounting dnodes after the original 1 KiB.
#[derive(Debug, Clone)]
pub struct ObjsetPhys {
    pub metadnode: DNode,
    pub os_zil_header: ZilHeader,
    pub os_type: OsType,
    pub os_flags: Option<u64>,
    pub userused: Option<DNode>,
    pub groupused: Option<DNode>,
}

impl ObjsetPhys {
    pub fn parse(input: &[u8], version: u64) -> IResult<&[u8], Self> {
        let (rest, (metadnode, os_zil_header, os_type)) =
            nom::sequence::tuple((DNode::parse, ZilHeader::parse, OsType::parse))(input)?;
        if version < 15 {
            return Ok((
                rest,
                Self {
                    metadnode,
                    os_zil_header,
                    os_type,
                    os_flags: None,
                    userused: None,
                    groupused: None,
                },
            ));
        }
        let (rest, os_flags) = number::le_u64(rest)?;
        let consumed = DNODE_SIZE + ZIL_HEADER_SIZE + 16;
        let (rest, _pad) = nom::bytes::complete::take(OBJSET_OLD_PHYS_SIZE - consumed)(rest)?;
        let (rest, accounting) =
            nom::combinator::opt(nom::sequence::pair(DNode::parse, DNode::parse))(rest)?;
        let (userused, groupused) = match accounting {
            Some((u, g)) => (Some(u), Some(g)),
            None => (None, None),
        };
        Ok((
            rest,
            Self {
                metadnode,
                os_zil_header,
                os_type,
                os_flags: Some(os_flags),
                userused,
                groupused,
            },
        ))
    }
}
