//!
//! Pools: a set of top-level vdevs, their meta object sets and the dataset
//! tree rooted in them.
//!
use std::cell::OnceCell;
use std::path::Path;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::device::Disk;
use crate::diag::Diagnostics;
use crate::dmu::DNode;
use crate::dsl::{Dataset, Filesystem};
use crate::objset::{Directory, File, Object, ObjectSet};
use crate::raidz::RaidzVdev;
use crate::read::ReadContext;
use crate::spa::{BlockPtr, ChecksumType, CompressionType};
use crate::vdev::{DiskVdev, Vdev};
use crate::zpl::{DirEntry, DirEntryType};
use crate::{Result, ZfsError};

pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 4 << 30;

/// How a pool is opened and read.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Read and compare every copy of a block instead of the first.
    pub thorough: bool,
    /// Use this label position instead of the one with the highest txg.
    pub label: Option<usize>,
    /// Open the pool as of this transaction group.
    pub txg: Option<u64>,
    pub default_compression: CompressionType,
    pub default_checksum: ChecksumType,
    pub diagnostics: Diagnostics,
    /// Largest object, in bytes, that is materialized in memory.
    pub max_object_size: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            thorough: false,
            label: None,
            txg: None,
            default_compression: CompressionType::LZJB,
            default_checksum: ChecksumType::Fletcher4,
            diagnostics: Diagnostics::default(),
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
        }
    }
}

impl PoolOptions {
    pub fn thorough(mut self, thorough: bool) -> Self {
        self.thorough = thorough;
        self
    }
    pub fn label(mut self, label: Option<usize>) -> Self {
        self.label = label;
        self
    }
    pub fn txg(mut self, txg: Option<u64>) -> Self {
        self.txg = txg;
        self
    }
    pub fn default_compression(mut self, compression: CompressionType) -> Self {
        self.default_compression = compression;
        self
    }
    pub fn default_checksum(mut self, checksum: ChecksumType) -> Self {
        self.default_checksum = checksum;
        self
    }
    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }
    pub fn max_object_size(mut self, bytes: u64) -> Self {
        self.max_object_size = bytes;
        self
    }
}

/// Something `open` can land on.
#[derive(Debug, Clone, Copy)]
pub enum Node<'p> {
    /// A dataset, at its head or at one of its snapshots.
    Dataset(&'p Dataset, &'p Filesystem),
    Directory(&'p Directory, &'p ObjectSet),
    File(&'p File),
    Other(&'p Object),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    Dataset,
    Entry(DirEntryType),
}

/// One line of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub name: String,
    pub kind: ListingKind,
    /// Object number: in the MOS for datasets, in the object set otherwise.
    pub object: u64,
}

impl<'p> Node<'p> {
    /// Child datasets first (head only), then the directory entries.
    pub fn list(&self, pool: &'p Pool) -> Result<Vec<Listing>> {
        let mut out = Vec::new();
        let dir = match *self {
            Node::Dataset(dataset, fs) => {
                if dataset.head.as_ref().map(|h| h.index) == Some(fs.index) {
                    for (name, child) in dataset.children(pool)? {
                        out.push(Listing {
                            name,
                            kind: ListingKind::Dataset,
                            object: child.index,
                        });
                    }
                }
                fs.root_directory(pool, &dataset.filesystem_label(pool, fs))?.0
            }
            Node::Directory(dir, _) => dir,
            Node::File(_) | Node::Other(_) => {
                return Err(ZfsError::NotADirectory(self.describe()))
            }
        };
        out.extend(dir.iter().map(|(name, entry)| Listing {
            name: name.to_owned(),
            kind: ListingKind::Entry(entry.get_type()),
            object: entry.get_objnum(),
        }));
        Ok(out)
    }

    fn describe(&self) -> String {
        match self {
            Node::Dataset(d, _) => format!("dsl dir {}", d.index),
            Node::Directory(d, _) => format!("directory {}", d.index),
            Node::File(f) => format!("file {}", f.index),
            Node::Other(o) => o.kind_name().to_owned(),
        }
    }
}

pub struct Pool {
    vdevs: Vec<(u64, Box<dyn Vdev + Send>)>,
    options: PoolOptions,
    /// Meta object set per vdev id.
    mos: Vec<(u64, OnceCell<ObjectSet>)>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("vdevs", &self.vdevs)
            .field("options", &self.options)
            .finish()
    }
}

impl Pool {
    /// Pool over `vdevs`. A vdev reporting an id already seen replaces the
    /// earlier one.
    pub fn new(vdevs: Vec<Box<dyn Vdev + Send>>, options: PoolOptions) -> Result<Self> {
        let mut by_id: Vec<(u64, Box<dyn Vdev + Send>)> = Vec::new();
        for vdev in vdevs {
            let id = vdev.id();
            match by_id.iter_mut().find(|(vid, _)| *vid == id) {
                Some(slot) => {
                    warn!(id, "duplicate vdev id, replacing");
                    slot.1 = vdev;
                }
                None => by_id.push((id, vdev)),
            }
        }
        if by_id.is_empty() {
            return Err(ZfsError::Invalid("pool without vdevs".to_owned()));
        }
        let mos = by_id.iter().map(|(id, _)| (*id, OnceCell::new())).collect();
        let pool = Self {
            vdevs: by_id,
            options,
            mos,
        };
        info!(
            name = pool.name().unwrap_or("?"),
            version = pool.version(),
            vdevs = pool.vdevs.len(),
            "opened pool"
        );
        Ok(pool)
    }

    /// Every file is its own top-level vdev.
    pub fn open_files<P: AsRef<Path>>(paths: &[P], options: PoolOptions) -> Result<Self> {
        let vdevs = paths
            .iter()
            .map(|p| {
                let vdev = DiskVdev::open(Disk::open(p)?, &options)?;
                Ok(Box::new(vdev) as Box<dyn Vdev + Send>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(vdevs, options)
    }

    /// All files together form one RAID-Z vdev. Children are put in the order
    /// the label's `vdev_tree` lists them when every guid is found.
    pub fn open_raidz<P: AsRef<Path>>(paths: &[P], parity: u64, options: PoolOptions) -> Result<Self> {
        let mut children = paths
            .iter()
            .map(|p| DiskVdev::open(Disk::open(p)?, &options))
            .collect::<Result<Vec<_>>>()?;
        let order: Option<Vec<u64>> = children.first().and_then(|first| {
            first
                .labels()
                .best_label()
                .vdev_tree()
                .and_then(|tree| tree.get_list_array("children"))
                .map(|kids| kids.iter().filter_map(|k| k.get_u64("guid")).collect())
        });
        let guid = |c: &DiskVdev<Disk>| c.labels().best_label().config.get_u64("guid");
        if let Some(order) = order {
            if children.iter().all(|c| guid(c).map_or(false, |g| order.contains(&g))) {
                children.sort_by_key(|c| guid(c).and_then(|g| order.iter().position(|o| *o == g)));
            } else {
                debug!("raidz children not matched by guid, keeping given order");
            }
        }
        let children = children
            .into_iter()
            .map(|c| Box::new(c) as Box<dyn Vdev + Send>)
            .collect();
        let raidz = RaidzVdev::new(parity, children, options.diagnostics.clone())?;
        Self::new(vec![Box::new(raidz)], options)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
    pub fn vdevs(&self) -> impl Iterator<Item = &dyn Vdev> {
        self.vdevs.iter().map(|(_, v)| v.as_ref() as &dyn Vdev)
    }
    pub fn first_vdev(&self) -> &dyn Vdev {
        self.vdevs[0].1.as_ref()
    }
    pub fn version(&self) -> u64 {
        self.first_vdev().labels().version().unwrap_or(0)
    }
    pub fn ashift(&self) -> Option<u64> {
        self.first_vdev().labels().ashift()
    }
    pub fn name(&self) -> Option<&str> {
        self.first_vdev().labels().best_label().config.get_str("name")
    }

    pub fn context(&self) -> ReadContext<'_> {
        ReadContext::new(&self.vdevs, &self.options)
    }
    pub fn read_block(&self, bp: &BlockPtr) -> Result<Vec<u8>> {
        self.context().resolve(bp)
    }
    pub fn read_indirect(&self, bp: &BlockPtr) -> Result<Vec<u8>> {
        self.context().read_indirect(bp)
    }
    pub fn read_dnode(&self, dnode: &DNode) -> Result<Vec<u8>> {
        self.context().read_dnode(dnode)
    }
    pub fn dnode_extent(&self, dnode: &DNode) -> Result<u64> {
        self.context().dnode_extent(dnode)
    }

    /// Meta object set rooted in the active uberblock of vdev `id`.
    pub fn objset_for_vdev(&self, id: u64) -> Result<&ObjectSet> {
        let (vdev, cell) = self
            .vdevs
            .iter()
            .zip(&self.mos)
            .find(|((vid, _), _)| *vid == id)
            .map(|((_, v), (_, cell))| (v, cell))
            .ok_or_else(|| ZfsError::NotFound(format!("vdev {}", id)))?;
        if let Some(mos) = cell.get() {
            return Ok(mos);
        }
        let uberblock = vdev.active_uberblock();
        debug!(id, txg = uberblock.txg, "opening meta object set");
        let block = self.read_indirect(&uberblock.rootbp)?;
        let mos = ObjectSet::from_block(self, &block, "$MOS")?;
        Ok(cell.get_or_init(|| mos))
    }

    pub fn mos(&self) -> Result<&ObjectSet> {
        self.objset_for_vdev(self.vdevs[0].0)
    }

    pub fn root_dataset(&self) -> Result<&Dataset> {
        let mos = self.mos()?;
        let index = mos
            .master_node(self)?
            .get_u64("root_dataset")
            .ok_or_else(|| ZfsError::Invalid("object directory has no root_dataset".to_owned()))?;
        match mos.parse(self, index)? {
            Object::Dataset(dataset) => Ok(dataset),
            other => Err(ZfsError::Invalid(format!(
                "root dataset {} is {}",
                index,
                other.kind_name()
            ))),
        }
    }

    /// Space map objects of the first vdev, from its label's `metaslab_array`.
    pub fn metaslab_array(&self) -> Result<&Object> {
        let index = self
            .first_vdev()
            .labels()
            .best_label()
            .vdev_tree()
            .and_then(|tree| tree.get_u64("metaslab_array"))
            .ok_or_else(|| ZfsError::NotFound("metaslab_array".to_owned()))?;
        self.mos()?.parse(self, index)
    }

    /// Walks `path` from the root dataset. Child datasets shadow directory
    /// entries of the same name; `name@snap` selects a snapshot of a child
    /// dataset and a bare `@snap` one of the current dataset.
    pub fn open(&self, path: &str) -> Result<Node<'_>> {
        let root = self.root_dataset()?;
        let mut node = Node::Dataset(root, root_head(root)?);
        let mut walked = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            walked.push('/');
            walked.push_str(segment);
            node = self.step(node, segment, &walked)?;
        }
        Ok(node)
    }

    fn step<'p>(&'p self, node: Node<'p>, segment: &str, walked: &str) -> Result<Node<'p>> {
        let not_found = || ZfsError::NotFound(walked.to_owned());
        let (dir, objset) = match node {
            Node::Dataset(dataset, fs) => {
                let (name, snapshot) = match segment.split_once('@') {
                    Some((name, snap)) => (name, Some(snap)),
                    None => (segment, None),
                };
                let is_head = dataset.head.as_ref().map(|h| h.index) == Some(fs.index);
                if is_head {
                    if name.is_empty() {
                        if let Some(snap) = snapshot {
                            let fs = dataset.snapshot(self, snap).map_err(|_| not_found())?;
                            return Ok(Node::Dataset(dataset, fs));
                        }
                    }
                    if let Some(child) = dataset.child(self, name)? {
                        let fs = child.filesystem(self, snapshot).map_err(|e| {
                            if e.is_not_found() {
                                not_found()
                            } else {
                                e
                            }
                        })?;
                        return Ok(Node::Dataset(child, fs));
                    }
                }
                fs.root_directory(self, &dataset.filesystem_label(self, fs))?
            }
            Node::Directory(dir, objset) => (dir, objset),
            Node::File(_) | Node::Other(_) => {
                return Err(ZfsError::NotADirectory(walked.to_owned()))
            }
        };
        let value = objset
            .lookup(self, dir.index, segment)?
            .ok_or_else(not_found)?;
        let entry = value
            .as_u64()
            .map(DirEntry)
            .ok_or_else(|| ZfsError::Invalid(format!("{} has a non-integer entry", walked)))?;
        Ok(match objset.parse(self, entry.get_objnum())? {
            Object::Directory(child) => Node::Directory(child, objset),
            Object::File(file) => Node::File(file),
            other => Node::Other(other),
        })
    }

    /// Contents of the file at `path`, exactly as long as its size attribute.
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        match self.open(path)? {
            Node::File(file) => file.read(self),
            _ => Err(ZfsError::NotAFile(path.to_owned())),
        }
    }

    /// `a/b@snap` (or `pool/a/b@snap`) to that snapshot; without `@` the head.
    pub fn dataset_for(&self, expr: &str) -> Result<Node<'_>> {
        let (name, snapshot) = match expr.split_once('@') {
            Some((name, snap)) => (name, Some(snap)),
            None => (expr, None),
        };
        let mut segments: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
        if segments.first().copied() == self.name() {
            segments.remove(0);
        }
        let root = self.root_dataset()?;
        let mut dataset = root;
        for segment in &segments {
            dataset = dataset
                .child(self, segment)?
                .ok_or_else(|| ZfsError::NotFound(expr.to_owned()))?;
        }
        let fs = dataset.filesystem(self, snapshot)?;
        Ok(Node::Dataset(dataset, fs))
    }
}

fn root_head(root: &Dataset) -> Result<&Filesystem> {
    root.head
        .as_ref()
        .ok_or_else(|| ZfsError::Invalid("root dataset has no head".to_owned()))
}

/// A pool behind a mutex, for callers that share it between threads.
#[derive(Debug)]
pub struct LockedPool {
    inner: Mutex<Pool>,
}

impl LockedPool {
    pub fn new(pool: Pool) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }
    pub fn lock(&self) -> MutexGuard<'_, Pool> {
        self.inner.lock()
    }
    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.lock().read_file(path)
    }
    pub fn list(&self, path: &str) -> Result<Vec<Listing>> {
        let pool = self.inner.lock();
        let node = pool.open(path)?;
        node.list(&pool)
    }
    pub fn into_inner(self) -> Pool {
        self.inner.into_inner()
    }
}
