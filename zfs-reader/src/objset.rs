//!
//! Object sets: arrays of dnodes, decoded on demand into typed objects.
//!
use std::cell::{Cell, OnceCell};
use std::collections::BTreeMap;
use std::fmt;

use nom::{number::complete as number, IResult};
use tracing::{debug, trace, warn};

use crate::dmu::{DNode, ObjectType, ObjsetPhys, DNODE_SIZE};
use crate::dsl::{BpObjHeader, Dataset, DatasetPhys, DirPhys, Filesystem};
use crate::nvlist::NvList;
use crate::pool::Pool;
use crate::spa::{BlockPtr, BLKPTR_SIZE};
use crate::zap::{self, ZapEntries, ZapValue};
use crate::zpl::{self, DirEntry, SAAttr, SaTable, ZplAttributes};
use crate::{Result, ZfsError};

/// First pool version whose filesystems store file attributes as system
/// attributes.
pub const SPA_VERSION_SA: u64 = 24;

/// A decoded object.
#[derive(Debug)]
pub enum Object {
    None,
    Zap(ZapEntries),
    Directory(Directory),
    File(File),
    NvList(NvList),
    /// Nonzero entries keyed by their 1-based position.
    ObjectArray(BTreeMap<u64, u64>),
    DslDataset(DatasetPhys),
    Dataset(Dataset),
    BlockPointers(Vec<BlockPtr>),
    History(Vec<NvList>),
    SaRegistry(Vec<SAAttr>),
    Raw(DNode),
}

impl Object {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::None => "none",
            Object::Zap(_) => "zap",
            Object::Directory(_) => "directory",
            Object::File(_) => "file",
            Object::NvList(_) => "nvlist",
            Object::ObjectArray(_) => "object array",
            Object::DslDataset(_) => "dsl dataset",
            Object::Dataset(_) => "dsl dir",
            Object::BlockPointers(_) => "bpobj",
            Object::History(_) => "history",
            Object::SaRegistry(_) => "sa registry",
            Object::Raw(_) => "raw",
        }
    }
    /// The name/value map of ZAP backed objects.
    pub fn entries(&self) -> Option<&ZapEntries> {
        match self {
            Object::Zap(entries) => Some(entries),
            Object::Directory(dir) => Some(&dir.entries),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Directory {
    pub index: u64,
    pub entries: ZapEntries,
    /// Missing when the bonus buffer could not be decoded.
    pub attributes: Option<ZplAttributes>,
}

impl Directory {
    pub fn entry(&self, name: &str) -> Option<DirEntry> {
        self.entries.get_u64(name).map(DirEntry)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, DirEntry)> {
        self.entries
            .iter()
            .filter_map(|(name, value)| value.as_u64().map(|v| (name, DirEntry(v))))
    }
}

#[derive(Debug)]
pub struct File {
    pub index: u64,
    pub dnode: DNode,
    pub attributes: ZplAttributes,
}

impl File {
    pub fn size(&self) -> u64 {
        self.attributes.size
    }
    /// Contents up to `size` bytes. A sparse tail reads as zeros as far as
    /// the object's blocks reach; a size beyond that is cut short.
    pub fn read(&self, pool: &Pool) -> Result<Vec<u8>> {
        let mut data = pool.read_dnode(&self.dnode)?;
        let extent = pool.dnode_extent(&self.dnode)?.max(data.len() as u64);
        if self.size() > extent {
            warn!(
                index = self.index,
                size = self.size(),
                extent,
                "file size beyond its blocks"
            );
        }
        data.resize(self.size().min(extent) as usize, 0);
        Ok(data)
    }
}

fn bonus_word(input: &[u8]) -> IResult<&[u8], u64> {
    number::le_u64(input)
}

fn history_bounds(input: &[u8]) -> IResult<&[u8], (u64, u64, u64, u64)> {
    nom::sequence::tuple((
        number::le_u64,
        number::le_u64,
        number::le_u64,
        number::le_u64,
    ))(input)
}

pub struct ObjectSet {
    name: String,
    phys: ObjsetPhys,
    data: Vec<u8>,
    dnodes: Vec<OnceCell<DNode>>,
    objects: Vec<OnceCell<Object>>,
    /// Set while the object at that index is being decoded.
    decoding: Vec<Cell<bool>>,
    sa: OnceCell<SaTable>,
}

impl fmt::Debug for ObjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSet")
            .field("name", &self.name)
            .field("os_type", &self.phys.os_type)
            .field("len", &self.len())
            .finish()
    }
}

impl ObjectSet {
    /// Opens the object set whose root record is `block`.
    pub fn from_block(pool: &Pool, block: &[u8], name: &str) -> Result<Self> {
        let (_, phys) = ObjsetPhys::parse(block, pool.version())?;
        let data = pool.read_dnode(&phys.metadnode)?;
        let len = data.len() / DNODE_SIZE;
        debug!(name, len, os_type = ?phys.os_type, "object set");
        Ok(Self {
            name: name.to_owned(),
            phys,
            data,
            dnodes: std::iter::repeat_with(OnceCell::new).take(len).collect(),
            objects: std::iter::repeat_with(OnceCell::new).take(len).collect(),
            decoding: std::iter::repeat_with(Cell::default).take(len).collect(),
            sa: OnceCell::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn phys(&self) -> &ObjsetPhys {
        &self.phys
    }
    /// Number of dnode slots.
    pub fn len(&self) -> usize {
        self.dnodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.dnodes.is_empty()
    }

    fn slot(&self, index: u64) -> Result<usize> {
        let i = index as usize;
        if i < self.len() {
            Ok(i)
        } else {
            Err(ZfsError::NotFound(format!(
                "object {} of {} ({} objects)",
                index,
                self.name,
                self.len()
            )))
        }
    }

    /// Raw dnode at `index`, decoded once.
    pub fn get(&self, index: u64) -> Result<&DNode> {
        let i = self.slot(index)?;
        if let Some(dnode) = self.dnodes[i].get() {
            return Ok(dnode);
        }
        let (_, dnode) = DNode::parse(&self.data[i * DNODE_SIZE..])?;
        Ok(self.dnodes[i].get_or_init(|| dnode))
    }

    /// Typed object at `index`, decoded once. Failures are not cached. An
    /// object that needs itself to decode is a reference cycle.
    pub fn parse(&self, pool: &Pool, index: u64) -> Result<&Object> {
        let i = self.slot(index)?;
        if let Some(object) = self.objects[i].get() {
            return Ok(object);
        }
        if self.decoding[i].replace(true) {
            return Err(ZfsError::Invalid(format!(
                "reference cycle at object {} of {}",
                index, self.name
            )));
        }
        let decoded = self
            .get(index)
            .map(|dnode| (dnode, self.decode(pool, index, dnode)));
        self.decoding[i].set(false);
        let (dnode, decoded) = decoded?;
        match decoded {
            Ok(object) => Ok(self.objects[i].get_or_init(|| object)),
            Err(e) => {
                let kind = ObjectType::name(dnode.object_type);
                let diag = &pool.options().diagnostics;
                if diag.wants_dumps() {
                    let name = format!("{}_{}_{}", self.name.replace('/', "-"), kind, index);
                    match pool.read_dnode(dnode) {
                        Ok(raw) => diag.dump(&name, &raw),
                        Err(read) => warn!(%name, error = %read, "cannot dump object"),
                    }
                }
                Err(ZfsError::Object {
                    index,
                    kind,
                    source: Box::new(e),
                })
            }
        }
    }

    fn decode(&self, pool: &Pool, index: u64, dnode: &DNode) -> Result<Object> {
        trace!(index, kind = %ObjectType::name(dnode.object_type), "decoding object");
        if ObjectType::is_zap(dnode.object_type) {
            return Ok(Object::Zap(self.read_zap(pool, dnode)?));
        }
        let kind = match dnode.kind() {
            Some(kind) => kind,
            None => return Ok(Object::Raw(dnode.clone())),
        };
        let object = match kind {
            ObjectType::None => Object::None,
            ObjectType::DirectoryContents => Object::Directory(Directory {
                index,
                entries: self.read_zap(pool, dnode)?,
                attributes: match self.attributes(pool, dnode) {
                    Ok(attrs) => Some(attrs),
                    Err(e) => {
                        warn!(index, error = %e, "directory attributes unreadable");
                        None
                    }
                },
            }),
            ObjectType::PlainFileContents => Object::File(File {
                index,
                dnode: dnode.clone(),
                attributes: self.attributes(pool, dnode)?,
            }),
            ObjectType::PackedNvlist => {
                let (_, size) = bonus_word(&dnode.bonus)?;
                let data = pool.read_dnode(dnode)?;
                let end = (size as usize).min(data.len());
                Object::NvList(NvList::unpack(&data[..end])?)
            }
            ObjectType::ObjectArray => {
                let data = pool.read_dnode(dnode)?;
                Object::ObjectArray(
                    data.chunks_exact(8)
                        .enumerate()
                        .filter_map(|(i, word)| {
                            let mut b = [0u8; 8];
                            b.copy_from_slice(word);
                            match u64::from_le_bytes(b) {
                                0 => None,
                                v => Some((i as u64 + 1, v)),
                            }
                        })
                        .collect(),
                )
            }
            ObjectType::DslDataset => {
                let (_, phys) = DatasetPhys::parse(&dnode.bonus)?;
                Object::DslDataset(phys)
            }
            ObjectType::DslDir => {
                let (_, dir) = DirPhys::parse(&dnode.bonus)?;
                let head = match dir.head_dataset_obj {
                    0 => None,
                    head => match self.parse(pool, head)? {
                        Object::DslDataset(phys) => Some(Filesystem::new(head, phys.clone())),
                        other => {
                            return Err(ZfsError::Invalid(format!(
                                "head dataset {} is {}",
                                head,
                                other.kind_name()
                            )))
                        }
                    },
                };
                Object::Dataset(Dataset::new(index, dir, head))
            }
            ObjectType::Bpobj => {
                let (_, header) = BpObjHeader::parse(&dnode.bonus)?;
                let data = pool.read_dnode(dnode)?;
                let n = (header.num_blkptrs as usize).min(data.len() / BLKPTR_SIZE);
                let (_, bps) = nom::multi::count(BlockPtr::parse, n)(&data[..])?;
                Object::BlockPointers(bps)
            }
            ObjectType::SpaHistory => Object::History(self.read_history(pool, dnode)?),
            ObjectType::SaAttrRegistration => {
                Object::SaRegistry(zpl::parse_registry(&self.read_zap(pool, dnode)?)?)
            }
            _ => Object::Raw(dnode.clone()),
        };
        Ok(object)
    }

    fn read_zap(&self, pool: &Pool, dnode: &DNode) -> Result<ZapEntries> {
        let data = pool.read_dnode(dnode)?;
        zap::decode(&data, dnode.data_block_size() as usize)
    }

    /// History records: a length word, then a packed nvlist, up to the end
    /// offset kept in the bonus buffer.
    fn read_history(&self, pool: &Pool, dnode: &DNode) -> Result<Vec<NvList>> {
        let (_, (_create_len, _max_off, _bof, eof)) = history_bounds(&dnode.bonus)?;
        let data = pool.read_dnode(dnode)?;
        let mut input = &data[..(eof as usize).min(data.len())];
        let mut records = Vec::new();
        while input.len() >= 8 {
            let (rest, reclen) = bonus_word(input)?;
            let reclen = reclen as usize;
            if reclen == 0 || reclen > rest.len() {
                warn!(reclen, remaining = rest.len(), "truncated history record");
                break;
            }
            records.push(NvList::unpack(&rest[..reclen])?);
            input = &rest[reclen..];
        }
        Ok(records)
    }

    /// The ZAP behind `index`.
    pub fn zap(&self, pool: &Pool, index: u64) -> Result<&ZapEntries> {
        let object = self.parse(pool, index)?;
        object.entries().ok_or_else(|| {
            ZfsError::Invalid(format!(
                "object {} of {} is {}, not a zap",
                index,
                self.name,
                object.kind_name()
            ))
        })
    }

    /// Single name lookup. Uses the decoded map when there is one, otherwise
    /// hashes into the ZAP without decoding it.
    pub fn lookup(&self, pool: &Pool, index: u64, name: &str) -> Result<Option<ZapValue>> {
        let i = self.slot(index)?;
        if let Some(entries) = self.objects[i].get().and_then(Object::entries) {
            return Ok(entries.get(name).cloned());
        }
        let dnode = self.get(index)?;
        let zap_backed = ObjectType::is_zap(dnode.object_type)
            || dnode.kind() == Some(ObjectType::DirectoryContents);
        if !zap_backed {
            return Err(ZfsError::Invalid(format!(
                "object {} of {} is {}, not a zap",
                index,
                self.name,
                ObjectType::name(dnode.object_type)
            )));
        }
        let data = pool.read_dnode(dnode)?;
        zap::lookup(&data, dnode.data_block_size() as usize, name)
    }

    /// Object 1: the master node of a filesystem, the object directory of the
    /// MOS.
    pub fn master_node(&self, pool: &Pool) -> Result<&ZapEntries> {
        self.zap(pool, 1)
    }

    /// System attribute schema, through the master node's `SA_ATTRS` entry.
    pub fn sa_table(&self, pool: &Pool) -> Result<&SaTable> {
        if let Some(table) = self.sa.get() {
            return Ok(table);
        }
        let missing = |what: &str| ZfsError::Invalid(format!("{} has no {}", self.name, what));
        let sa_attrs = self
            .master_node(pool)?
            .get_u64("SA_ATTRS")
            .ok_or_else(|| missing("SA_ATTRS"))?;
        let sa = self.zap(pool, sa_attrs)?;
        let registry_index = sa.get_u64("REGISTRY").ok_or_else(|| missing("REGISTRY"))?;
        let layouts_index = sa.get_u64("LAYOUTS").ok_or_else(|| missing("LAYOUTS"))?;
        let registry = match self.parse(pool, registry_index)? {
            Object::SaRegistry(attrs) => attrs,
            other => {
                return Err(ZfsError::Invalid(format!(
                    "sa registry {} is {}",
                    registry_index,
                    other.kind_name()
                )))
            }
        };
        let table = SaTable::new(registry, self.zap(pool, layouts_index)?)?;
        Ok(self.sa.get_or_init(|| table))
    }

    /// File attributes from the bonus buffer: system attributes when the bonus
    /// says so or the pool is new enough, the fixed znode otherwise.
    pub fn attributes(&self, pool: &Pool, dnode: &DNode) -> Result<ZplAttributes> {
        match dnode.bonus_kind() {
            Some(ObjectType::ZNode) => ZplAttributes::parse_znode(&dnode.bonus),
            Some(ObjectType::Sa) => ZplAttributes::parse_sa(&dnode.bonus, self.sa_table(pool)?),
            _ if pool.version() >= SPA_VERSION_SA => {
                ZplAttributes::parse_sa(&dnode.bonus, self.sa_table(pool)?)
            }
            _ => ZplAttributes::parse_znode(&dnode.bonus),
        }
    }
}
