//!
//! Datastructures used by the Dataset and Snapshot Layer
//!
//! A DSL directory names a dataset and links its children; its head DSL
//! dataset record points at the object set holding the filesystem. Snapshots
//! are further DSL dataset records reached through the snapshot-name ZAP.
//!
use std::cell::OnceCell;
use std::collections::BTreeSet;

use nom::{number::complete as number, IResult};
use tracing::{debug, warn};

use crate::objset::{Directory, Object, ObjectSet};
use crate::pool::Pool;
use crate::spa::BlockPtr;
use crate::zap::ZapEntries;
use crate::{Result, ZfsError};

pub const DSL_DATASET_PHYS_SIZE: usize = 320;
pub const DSL_DIR_PHYS_SIZE: usize = 256;

/// A DSL dataset contains a `BlockPtr` referencing an Object Set
#[derive(Debug, Clone)]
pub struct DatasetPhys {
    pub dir_obj: u64,
    pub prev_snap_obj: u64,
    pub prev_snap_obj_transaction: u64,
    pub next_snap_obj: u64,
    pub snapnames_zapobj: u64,
    pub num_children: u64,
    pub creation_time: u64,
    pub creation_txg: u64,
    pub deadlist_obj: u64,
    pub referenced_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub unique_bytes: u64,
    pub fsid_guid: u64,
    pub guid: u64,
    pub flags: u64,
    /// `BlockPtr` to the object set
    pub bp: BlockPtr,
    pub next_clones_obj: u64,
    /// ZAP object containing properties
    pub props_obj: u64,
    pub userrefs_obj: u64,
}

impl DatasetPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (
                dir_obj,
                prev_snap_obj,
                prev_snap_obj_transaction,
                next_snap_obj,
                snapnames_zapobj,
                num_children,
                creation_time,
                creation_txg,
                deadlist_obj,
                referenced_bytes,
                compressed_bytes,
                uncompressed_bytes,
                unique_bytes,
                fsid_guid,
                guid,
                flags,
                bp,
                next_clones_obj,
                props_obj,
                userrefs_obj,
            ),
        ) = nom::combinator::map_parser(
            nom::bytes::complete::take(DSL_DATASET_PHYS_SIZE),
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
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                BlockPtr::parse,
                number::le_u64,
                number::le_u64,
                number::le_u64,
            )),
        )(input)?;
        Ok((
            input,
            Self {
                dir_obj,
                prev_snap_obj,
                prev_snap_obj_transaction,
                next_snap_obj,
                snapnames_zapobj,
                num_children,
                creation_time,
                creation_txg,
                deadlist_obj,
                referenced_bytes,
                compressed_bytes,
                uncompressed_bytes,
                unique_bytes,
                fsid_guid,
                guid,
                flags,
                bp,
                next_clones_obj,
                props_obj,
                userrefs_obj,
            },
        ))
    }
}

/// A DSL Dir points to a dataset and child DSL Dirs
#[derive(Debug, Clone)]
pub struct DirPhys {
    pub creation_time: u64,
    /// The dataset for this directory
    pub head_dataset_obj: u64,
    pub parent_obj: u64,
    pub clone_parent_obj: u64,
    /// A ZAP object containing children of this directory
    pub child_dir_zapobj: u64,
    pub used_bytes: u64,
    pub compressed_bytes: u64,
    pub uncompressed_bytes: u64,
    pub quota: u64,
    pub reserved: u64,
    /// ZAP object containing properties
    pub props_zapobj: u64,
    pub deleg_zapobj: u64,
    pub flags: u64,
    pub used_breakdown: [u64; 5],
    pub clones: u64,
}

impl DirPhys {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (
            input,
            (
                creation_time,
                head_dataset_obj,
                parent_obj,
                clone_parent_obj,
                child_dir_zapobj,
                used_bytes,
                compressed_bytes,
                uncompressed_bytes,
                quota,
                reserved,
                props_zapobj,
                deleg_zapobj,
                flags,
                b1,
                b2,
                b3,
                b4,
                b5,
                clones,
            ),
        ) = nom::combinator::map_parser(
            nom::bytes::complete::take(DSL_DIR_PHYS_SIZE),
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
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
                number::le_u64,
            )),
        )(input)?;
        Ok((
            input,
            Self {
                creation_time,
                head_dataset_obj,
                parent_obj,
                clone_parent_obj,
                child_dir_zapobj,
                used_bytes,
                compressed_bytes,
                uncompressed_bytes,
                quota,
                reserved,
                props_zapobj,
                deleg_zapobj,
                flags,
                used_breakdown: [b1, b2, b3, b4, b5],
                clones,
            },
        ))
    }
}

/// Bonus of a block pointer object: how many pointers its data holds.
#[derive(Debug, Clone)]
pub struct BpObjHeader {
    pub num_blkptrs: u64,
    pub bytes: u64,
}

impl BpObjHeader {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (num_blkptrs, bytes)) =
            nom::sequence::tuple((number::le_u64, number::le_u64))(input)?;
        Ok((input, Self { num_blkptrs, bytes }))
    }
}

/// One DSL dataset record and its lazily opened object set: either the head
/// of a dataset or one of its snapshots.
#[derive(Debug)]
pub struct Filesystem {
    pub index: u64,
    pub phys: DatasetPhys,
    objset: OnceCell<ObjectSet>,
}

impl Filesystem {
    pub fn new(index: u64, phys: DatasetPhys) -> Self {
        Self {
            index,
            phys,
            objset: OnceCell::new(),
        }
    }

    /// `name` labels postmortem dumps of objects in this object set.
    pub fn objset(&self, pool: &Pool, name: &str) -> Result<&ObjectSet> {
        if let Some(objset) = self.objset.get() {
            return Ok(objset);
        }
        debug!(index = self.index, name, "opening object set");
        let block = pool.read_block(&self.phys.bp)?;
        let objset = ObjectSet::from_block(pool, &block, name)?;
        Ok(self.objset.get_or_init(|| objset))
    }

    pub fn root_directory<'p>(
        &'p self,
        pool: &'p Pool,
        name: &str,
    ) -> Result<(&'p Directory, &'p ObjectSet)> {
        let objset = self.objset(pool, name)?;
        let root = objset
            .master_node(pool)?
            .get_u64("ROOT")
            .ok_or_else(|| ZfsError::Invalid(format!("{} has no ROOT entry", name)))?;
        match objset.parse(pool, root)? {
            Object::Directory(dir) => Ok((dir, objset)),
            other => Err(ZfsError::Invalid(format!(
                "{} root object {} is {}",
                name,
                root,
                other.kind_name()
            ))),
        }
    }
}

/// A DSL directory with its head dataset.
#[derive(Debug)]
pub struct Dataset {
    pub index: u64,
    pub dir: DirPhys,
    /// `None` for internal directories without a dataset (`$MOS`, `$FREE`).
    pub head: Option<Filesystem>,
    snapshots: OnceCell<Vec<(String, Filesystem)>>,
}

impl Dataset {
    pub fn new(index: u64, dir: DirPhys, head: Option<Filesystem>) -> Self {
        Self {
            index,
            dir,
            head,
            snapshots: OnceCell::new(),
        }
    }

    fn head(&self) -> Result<&Filesystem> {
        self.head
            .as_ref()
            .ok_or_else(|| ZfsError::NotFound(format!("dsl dir {} has no head dataset", self.index)))
    }

    /// Full name, from the pool name down through the parents' child maps.
    pub fn name(&self, pool: &Pool) -> Result<String> {
        let mut parts = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = self;
        while current.dir.parent_obj != 0 {
            if !seen.insert(current.index) {
                return Err(ZfsError::Invalid(format!(
                    "dsl dir {} has a parent cycle",
                    self.index
                )));
            }
            let mos = pool.mos()?;
            let parent = match mos.parse(pool, current.dir.parent_obj)? {
                Object::Dataset(parent) => parent,
                other => {
                    return Err(ZfsError::Invalid(format!(
                        "dsl dir {} parent is {}",
                        current.index,
                        other.kind_name()
                    )))
                }
            };
            let siblings = mos.zap(pool, parent.dir.child_dir_zapobj)?;
            let own = siblings
                .iter()
                .find(|(_, v)| v.as_u64() == Some(current.index))
                .map(|(k, _)| k.to_owned())
                .ok_or_else(|| {
                    ZfsError::Invalid(format!("dsl dir {} missing from its parent", current.index))
                })?;
            parts.push(own);
            current = parent;
        }
        parts.push(pool.name().unwrap_or("$pool").to_owned());
        parts.reverse();
        Ok(parts.join("/"))
    }

    fn label(&self, pool: &Pool) -> String {
        self.name(pool)
            .unwrap_or_else(|_| format!("dsl_dir{}", self.index))
    }

    pub fn objset<'p>(&'p self, pool: &'p Pool) -> Result<&'p ObjectSet> {
        self.head()?.objset(pool, &self.label(pool))
    }

    pub fn properties<'p>(&self, pool: &'p Pool) -> Result<&'p ZapEntries> {
        pool.mos()?.zap(pool, self.dir.props_zapobj)
    }

    /// Child datasets, without the internal `$`-prefixed directories.
    pub fn children<'p>(&self, pool: &'p Pool) -> Result<Vec<(String, &'p Dataset)>> {
        let mos = pool.mos()?;
        let mut out = Vec::new();
        for (name, value) in mos.zap(pool, self.dir.child_dir_zapobj)?.iter() {
            if name.starts_with('$') {
                continue;
            }
            let index = value
                .as_u64()
                .ok_or_else(|| ZfsError::Invalid(format!("child dataset {} value", name)))?;
            match mos.parse(pool, index)? {
                Object::Dataset(child) => out.push((name.to_owned(), child)),
                other => warn!(name, kind = other.kind_name(), "child map entry is not a dsl dir"),
            }
        }
        Ok(out)
    }

    /// Hashed lookup in the child map.
    pub fn child<'p>(&self, pool: &'p Pool, name: &str) -> Result<Option<&'p Dataset>> {
        if name.starts_with('$') {
            return Ok(None);
        }
        let mos = pool.mos()?;
        let index = match mos.lookup(pool, self.dir.child_dir_zapobj, name)? {
            Some(value) => value
                .as_u64()
                .ok_or_else(|| ZfsError::Invalid(format!("child dataset {} value", name)))?,
            None => return Ok(None),
        };
        match mos.parse(pool, index)? {
            Object::Dataset(child) => Ok(Some(child)),
            other => Err(ZfsError::Invalid(format!(
                "child dataset {} is {}",
                name,
                other.kind_name()
            ))),
        }
    }

    pub fn root_directory<'p>(
        &'p self,
        pool: &'p Pool,
    ) -> Result<(&'p Directory, &'p ObjectSet)> {
        self.head()?.root_directory(pool, &self.label(pool))
    }

    /// Snapshots by name, in snapshot-map order.
    pub fn snapshots<'p>(&'p self, pool: &'p Pool) -> Result<&'p [(String, Filesystem)]> {
        if let Some(snapshots) = self.snapshots.get() {
            return Ok(snapshots);
        }
        let head = self.head()?;
        let mos = pool.mos()?;
        let mut snapshots = Vec::new();
        if head.phys.snapnames_zapobj != 0 {
            for (name, value) in mos.zap(pool, head.phys.snapnames_zapobj)?.iter() {
                let index = value
                    .as_u64()
                    .ok_or_else(|| ZfsError::Invalid(format!("snapshot {} value", name)))?;
                match mos.parse(pool, index)? {
                    Object::DslDataset(phys) => {
                        snapshots.push((name.to_owned(), Filesystem::new(index, phys.clone())))
                    }
                    other => {
                        return Err(ZfsError::Invalid(format!(
                            "snapshot {} is {}",
                            name,
                            other.kind_name()
                        )))
                    }
                }
            }
        }
        Ok(self.snapshots.get_or_init(|| snapshots))
    }

    pub fn snapshot<'p>(&'p self, pool: &'p Pool, name: &str) -> Result<&'p Filesystem> {
        self.snapshots(pool)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, fs)| fs)
            .ok_or_else(|| ZfsError::NotFound(format!("{}@{}", self.label(pool), name)))
    }

    /// Head filesystem, or the named snapshot.
    pub fn filesystem<'p>(&'p self, pool: &'p Pool, snapshot: Option<&str>) -> Result<&'p Filesystem> {
        match snapshot {
            Some(name) => self.snapshot(pool, name),
            None => self.head(),
        }
    }

    /// Object set name for `filesystem`, with the snapshot suffix when it is
    /// not the head.
    pub fn filesystem_label(&self, pool: &Pool, filesystem: &Filesystem) -> String {
        let base = self.label(pool);
        match self.snapshots.get().and_then(|snaps| {
            snaps
                .iter()
                .find(|(_, fs)| fs.index == filesystem.index)
                .map(|(n, _)| n)
        }) {
            Some(snap) => format!("{}@{}", base, snap),
            None => base,
        }
    }
}
