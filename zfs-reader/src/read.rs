//!
//! Block pointer resolution.
//!
//! Turns block pointers into logical bytes: embedded payloads, DVA reads with
//! checksum verification, decompression, gang blocks and indirect trees.
//!

use nom::multi::count;
use tracing::{debug, trace, warn};

use crate::checksum;
use crate::compression::decompress;
use crate::diag::Fault;
use crate::dmu::DNode;
use crate::pool::PoolOptions;
use crate::spa::{
    BlockPtr, BlockPtrKind, BlockPtrPtr, ChecksumType, CompressionType, Dva, GangHeader,
    BLKPTR_SIZE, GANG_HEADER_SIZE, GANG_MAGIC, SECTOR_SHIFT,
};
use crate::vdev::Vdev;
use crate::{Result, ZfsError};

const EMBEDDED_TYPE_DATA: u8 = 0;
const MIN_INDBLKSHIFT: u8 = 9;
const MAX_INDBLKSHIFT: u8 = 17;
const MAX_LEVELS: u8 = 6;

/// Geometry of a dnode's block tree, used to expand holes in place.
#[derive(Debug, Clone, Copy)]
struct Span {
    data_block: u64,
    fanout: u64,
    /// Bytes the object can hold: `(maxblkid + 1) * datablksz`, capped by
    /// what its pointer tree addresses.
    extent: u64,
    limit: u64,
}

impl Span {
    /// `None` for dnodes without a data block size. Geometry that cannot
    /// come from a real pool, or an extent above `max`, is an error.
    fn for_dnode(dnode: &DNode, max: u64) -> Result<Option<Self>> {
        let data_block = dnode.data_block_size();
        if data_block == 0 {
            return Ok(None);
        }
        if !(MIN_INDBLKSHIFT..=MAX_INDBLKSHIFT).contains(&dnode.indblkshift) {
            return Err(ZfsError::Invalid(format!(
                "indirect block shift {}",
                dnode.indblkshift
            )));
        }
        if dnode.nlevels > MAX_LEVELS {
            return Err(ZfsError::Invalid(format!("{} indirect levels", dnode.nlevels)));
        }
        let mut span = Self {
            data_block,
            fanout: 1 << (dnode.indblkshift - 7),
            extent: 0,
            limit: 0,
        };
        let capacity = span
            .covered(dnode.nlevels.saturating_sub(1))
            .saturating_mul(dnode.blkptr.len() as u64);
        let blocks = dnode
            .maxblkid
            .checked_add(1)
            .and_then(|n| n.checked_mul(data_block))
            .ok_or_else(|| ZfsError::Invalid(format!("max block id {}", dnode.maxblkid)))?;
        span.extent = blocks.min(capacity);
        if span.extent > max {
            return Err(ZfsError::Invalid(format!(
                "object of {} bytes exceeds the {} byte read limit",
                span.extent, max
            )));
        }
        if !dnode.blkptr.iter().all(BlockPtr::is_hole) {
            span.limit = span.extent;
        }
        Ok(Some(span))
    }
    /// Logical bytes below a pointer at `level`.
    fn covered(&self, level: u8) -> u64 {
        (0..level).fold(self.data_block, |acc, _| acc.saturating_mul(self.fanout))
    }
}

/// Everything needed to resolve block pointers of one pool.
#[derive(Debug, Clone, Copy)]
pub struct ReadContext<'a> {
    vdevs: &'a [(u64, Box<dyn Vdev + Send>)],
    options: &'a PoolOptions,
}

impl<'a> ReadContext<'a> {
    pub fn new(vdevs: &'a [(u64, Box<dyn Vdev + Send>)], options: &'a PoolOptions) -> Self {
        Self { vdevs, options }
    }

    fn vdev(&self, id: u32) -> Result<&'a dyn Vdev> {
        self.vdevs
            .iter()
            .find(|(vid, _)| *vid == u64::from(id))
            .map(|(_, v)| v.as_ref() as &dyn Vdev)
            .ok_or_else(|| ZfsError::NotFound(format!("vdev {}", id)))
    }

    fn compression(&self, bp: &BlockPtr) -> Result<CompressionType> {
        match bp.compression_type() {
            Some(CompressionType::Inherit) => Ok(self.options.default_compression),
            Some(kind) => Ok(kind),
            None => Err(ZfsError::UnsupportedFeature(format!(
                "compression tag {}",
                bp.compression
            ))),
        }
    }

    fn checksum(&self, ptr: &BlockPtrPtr) -> Result<ChecksumType> {
        match ChecksumType::try_from(ptr.checksum_type).ok() {
            Some(ChecksumType::Inherit) => Ok(self.options.default_checksum),
            Some(kind) => Ok(kind),
            None => Err(ZfsError::UnsupportedFeature(format!(
                "checksum tag {}",
                ptr.checksum_type
            ))),
        }
    }

    /// Logical content of a single block. Holes resolve to nothing.
    pub fn resolve(&self, bp: &BlockPtr) -> Result<Vec<u8>> {
        if bp.encryption {
            return Err(ZfsError::UnsupportedFeature("encrypted block".to_owned()));
        }
        let ptr = match &bp.kind {
            BlockPtrKind::Embedded {
                embedded_type,
                data,
            } => return self.resolve_embedded(bp, *embedded_type, data),
            BlockPtrKind::Ptr(ptr) => ptr,
        };
        if bp.is_hole() {
            if bp.dedup {
                return Err(ZfsError::UnsupportedFeature(
                    "dedup block without DVAs".to_owned(),
                ));
            }
            return Ok(Vec::new());
        }
        let compression = self.compression(bp)?;
        let kind = self.checksum(ptr)?;
        if self.options.thorough {
            self.resolve_thorough(bp, ptr, compression, kind)
        } else {
            self.resolve_first(bp, ptr, compression, kind)
        }
    }

    fn resolve_embedded(&self, bp: &BlockPtr, embedded_type: u8, data: &[u8]) -> Result<Vec<u8>> {
        if embedded_type != EMBEDDED_TYPE_DATA {
            return Err(ZfsError::UnsupportedFeature(format!(
                "embedded block type {}",
                embedded_type
            )));
        }
        let psize = (bp.physical_size as usize).min(data.len());
        decompress(self.compression(bp)?, &data[..psize], bp.logical_size as usize)
    }

    fn resolve_first(
        &self,
        bp: &BlockPtr,
        ptr: &BlockPtrPtr,
        compression: CompressionType,
        kind: ChecksumType,
    ) -> Result<Vec<u8>> {
        let dva = ptr
            .addresses
            .iter()
            .find(|dva| dva.is_allocated())
            .ok_or_else(|| ZfsError::Invalid("no allocated dva".to_owned()))?;
        let physical = self.read_physical(dva, bp.physical_size)?;
        match checksum::verify(kind, &physical, &ptr.checksum)? {
            Ok(()) => decompress(compression, &physical, bp.logical_size as usize),
            Err(actual) => {
                self.options.diagnostics.report(Fault::ChecksumMismatch {
                    dva: dva.to_string(),
                    expected: ptr.checksum,
                    actual,
                });
                match decompress(compression, &physical, bp.logical_size as usize) {
                    Ok(data) => Ok(data),
                    Err(e) => {
                        debug!(%dva, error = %e, "corrupt block does not decompress, returning raw bytes");
                        Ok(physical)
                    }
                }
            }
        }
    }

    fn resolve_thorough(
        &self,
        bp: &BlockPtr,
        ptr: &BlockPtrPtr,
        compression: CompressionType,
        kind: ChecksumType,
    ) -> Result<Vec<u8>> {
        let allocated: Vec<&Dva> = ptr.addresses.iter().filter(|d| d.is_allocated()).collect();
        let mut valid: Vec<Vec<u8>> = Vec::new();
        for dva in &allocated {
            let physical = match self.read_physical(dva, bp.physical_size) {
                Ok(p) => p,
                Err(e) => {
                    self.options.diagnostics.report(Fault::UnreadableCopy {
                        dva: dva.to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            match checksum::verify(kind, &physical, &ptr.checksum)? {
                Ok(()) => match decompress(compression, &physical, bp.logical_size as usize) {
                    Ok(data) => valid.push(data),
                    Err(e) => warn!(%dva, error = %e, "copy does not decompress"),
                },
                Err(actual) => self.options.diagnostics.report(Fault::ChecksumMismatch {
                    dva: dva.to_string(),
                    expected: ptr.checksum,
                    actual,
                }),
            }
        }
        if valid.is_empty() {
            self.options.diagnostics.report(Fault::NoValidCopy {
                allocated: allocated.len(),
            });
            return Ok(Vec::new());
        }
        if valid[1..].iter().any(|copy| copy != &valid[0]) {
            self.options.diagnostics.report(Fault::DivergentCopies {
                copies: valid.len(),
                lengths: valid.iter().map(Vec::len).collect(),
            });
        }
        Ok(valid.swap_remove(0))
    }

    /// Physical bytes of one copy, `psize` long at most.
    fn read_physical(&self, dva: &Dva, psize: u64) -> Result<Vec<u8>> {
        let mut data = if dva.gang {
            self.read_gang(dva)?
        } else {
            self.vdev(dva.vdev)?.read_dva(dva)?
        };
        data.truncate(psize as usize);
        Ok(data)
    }

    fn read_gang(&self, dva: &Dva) -> Result<Vec<u8>> {
        let header_dva = Dva {
            asize: (GANG_HEADER_SIZE >> SECTOR_SHIFT) as u32,
            gang: false,
            ..*dva
        };
        let raw = self.vdev(dva.vdev)?.read_dva(&header_dva)?;
        let (_, header) = GangHeader::parse(&raw)?;
        if header.tail.magic != GANG_MAGIC {
            return Err(ZfsError::Invalid(format!(
                "gang header at {} has magic {:#x}",
                dva, header.tail.magic
            )));
        }
        trace!(%dva, "reading gang block");
        let mut out = Vec::new();
        for child in header.blkptr.iter().filter(|b| !b.is_hole()) {
            out.extend(self.resolve(child)?);
        }
        Ok(out)
    }

    /// Logical content below `bp`, walking indirect levels. Holes contribute
    /// nothing.
    pub fn read_indirect(&self, bp: &BlockPtr) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.collect(bp, bp.level, None, &mut out)?;
        Ok(out)
    }

    /// Logical content of an object. Holes are zero filled so offsets hold,
    /// and the result never exceeds `(maxblkid + 1) * datablksz`.
    pub fn read_dnode(&self, dnode: &DNode) -> Result<Vec<u8>> {
        let span = Span::for_dnode(dnode, self.options.max_object_size)?;
        let top = dnode.nlevels.saturating_sub(1);
        let mut out = Vec::new();
        for bp in &dnode.blkptr {
            self.collect(bp, top, span.as_ref(), &mut out)?;
        }
        if let Some(span) = span {
            out.truncate(span.limit as usize);
        }
        Ok(out)
    }

    /// Bytes an object can hold, zero when it has no data block size.
    pub fn dnode_extent(&self, dnode: &DNode) -> Result<u64> {
        Ok(Span::for_dnode(dnode, self.options.max_object_size)?.map_or(0, |s| s.extent))
    }

    fn collect(
        &self,
        bp: &BlockPtr,
        level: u8,
        span: Option<&Span>,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        if let Some(span) = span {
            if out.len() as u64 >= span.limit {
                return Ok(());
            }
        }
        if bp.is_hole() {
            if let Some(span) = span {
                let fill = span.covered(level).min(span.limit - out.len() as u64);
                out.resize(out.len() + fill as usize, 0);
            }
            return Ok(());
        }
        let block = self.resolve(bp)?;
        if bp.level == 0 {
            out.extend(block);
            return Ok(());
        }
        let n = (bp.logical_size as usize / BLKPTR_SIZE).min(block.len() / BLKPTR_SIZE);
        let (_, children) = count(BlockPtr::parse, n)(&block)?;
        for child in &children {
            if !child.is_hole() && child.level >= bp.level {
                return Err(ZfsError::Invalid(format!(
                    "level {} block points at level {}",
                    bp.level, child.level
                )));
            }
            self.collect(child, bp.level - 1, span, out)?;
        }
        Ok(())
    }
}
