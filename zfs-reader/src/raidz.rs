//!
//! RAID-Z column mapping.
//!
//! A block on a RAID-Z vdev is striped sector by sector over the children,
//! parity columns first. Only the mapping and a single-parity cross-check are
//! implemented; reconstruction from parity is not.
//!
use tracing::trace;

use crate::diag::{Diagnostics, Fault};
use crate::spa::{Dva, SECTOR_SHIFT};
use crate::vdev::{Vdev, VdevLabels};
use crate::{Result, ZfsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub device: u64,
    /// Sector offset on `device`.
    pub offset: u64,
    /// Sectors.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub disks: u64,
    /// Index of the first data column; the ones before it hold parity.
    pub first_data: usize,
    pub columns: Vec<Column>,
}

/// Maps `size` sectors at sector `offset` onto `disks` children.
pub fn locate_data(disks: u64, parity: u64, offset: u64, size: u64) -> ColumnMap {
    let mut order: Vec<u64> = (0..disks).collect();
    if disks > 1 && (offset >> 11) & 1 == 1 {
        order.swap(0, 1);
    }
    let mut size = size;
    if disks == 5 && should_resize(offset, size, disks, parity) {
        size -= 1;
    }
    let mut columns: Vec<Column> = order
        .iter()
        .map(|i| Column {
            device: (offset + i) % disks,
            offset: (offset + i) / disks,
            size: 0,
        })
        .collect();
    if !columns.is_empty() {
        let n = columns.len() as u64;
        for (i, column) in columns.iter_mut().enumerate() {
            let i = i as u64;
            column.size = size / n + if i < size % n { 1 } else { 0 };
        }
    }
    ColumnMap {
        disks,
        first_data: parity as usize,
        columns,
    }
}

/// Whether a five-wide layout drops the last sector of this allocation.
pub fn should_resize(offset: u64, size: u64, disks: u64, parity: u64) -> bool {
    let base = size % 10;
    if size < 8 || (base != 4 && base != 8) || disks == 0 {
        return false;
    }
    resize_residue(size, base, disks, parity) == Some(offset % disks)
}

/// `((size - base) + (disks + parity + 2) / base - 3·[size - base >= 230]) mod disks`
/// evaluated exactly; `None` when the value is not a whole number.
fn resize_residue(size: u64, base: u64, disks: u64, parity: u64) -> Option<u64> {
    let k = (size - base) as i128;
    let base = base as i128;
    let mut scaled = k * base + (disks + parity + 2) as i128;
    if k >= 230 {
        scaled -= 3 * base;
    }
    let modulus = disks as i128 * base;
    let residue = scaled.rem_euclid(modulus);
    if residue % base == 0 {
        Some((residue / base) as u64)
    } else {
        None
    }
}

/// XOR of the non-empty blocks, as long as the shortest of them.
pub fn xor_blocks<B: AsRef<[u8]>>(blocks: &[B]) -> Vec<u8> {
    let blocks: Vec<&[u8]> = blocks
        .iter()
        .map(AsRef::as_ref)
        .filter(|b| !b.is_empty())
        .collect();
    let len = match blocks.iter().map(|b| b.len()).min() {
        Some(len) => len,
        None => return Vec::new(),
    };
    let mut out = vec![0u8; len];
    for block in blocks {
        for (o, b) in out.iter_mut().zip(block) {
            *o ^= b;
        }
    }
    out
}

/// Columns of one RAID-Z read.
#[derive(Debug, Clone)]
pub struct RaidzRead {
    pub map: ColumnMap,
    pub blocks: Vec<Vec<u8>>,
}

impl RaidzRead {
    pub fn data(&self) -> Vec<u8> {
        self.blocks[self.map.first_data.min(self.blocks.len())..].concat()
    }
    /// `None` unless single parity, otherwise whether the parity column agrees.
    pub fn parity_ok(&self) -> Option<bool> {
        if self.map.first_data != 1 || self.blocks.is_empty() {
            return None;
        }
        let computed = xor_blocks(&self.blocks[1..]);
        let parity = &self.blocks[0];
        let len = computed.len().min(parity.len());
        Some(computed[..len] == parity[..len])
    }
}

#[derive(Debug)]
pub struct RaidzVdev {
    parity: u64,
    children: Vec<Box<dyn Vdev + Send>>,
    diag: Diagnostics,
}

impl RaidzVdev {
    pub fn new(
        parity: u64,
        children: Vec<Box<dyn Vdev + Send>>,
        diag: Diagnostics,
    ) -> Result<Self> {
        if children.is_empty() {
            return Err(ZfsError::Invalid("raidz vdev without children".to_owned()));
        }
        if parity as usize >= children.len() {
            return Err(ZfsError::Invalid(format!(
                "raidz parity {} with only {} children",
                parity,
                children.len()
            )));
        }
        Ok(Self {
            parity,
            children,
            diag,
        })
    }
    pub fn parity(&self) -> u64 {
        self.parity
    }

    pub fn read_columns(&self, dva: &Dva) -> Result<RaidzRead> {
        let disks = self.children.len() as u64;
        let map = locate_data(disks, self.parity, dva.offset, u64::from(dva.asize));
        if map.columns.len() as u64 != disks {
            return Err(ZfsError::Invalid(format!(
                "raidz map has {} columns for {} disks",
                map.columns.len(),
                disks
            )));
        }
        let blocks = map
            .columns
            .iter()
            .map(|c| {
                trace!(device = c.device, offset = c.offset, size = c.size, "raidz column");
                let child = Dva {
                    vdev: c.device as u32,
                    grid: 0,
                    asize: c.size as u32,
                    offset: c.offset,
                    gang: false,
                };
                self.children[c.device as usize].read_dva(&child)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RaidzRead { map, blocks })
    }
}

impl Vdev for RaidzVdev {
    fn id(&self) -> u64 {
        self.children[0].id()
    }
    fn labels(&self) -> &VdevLabels {
        self.children[0].labels()
    }
    fn read_dva(&self, dva: &Dva) -> Result<Vec<u8>> {
        let read = self.read_columns(dva)?;
        if read.parity_ok() == Some(false) {
            self.diag.report(Fault::ParityMismatch {
                offset: dva.offset.saturating_mul(1 << SECTOR_SHIFT),
                columns: read.blocks.len(),
            });
        }
        Ok(read.data())
    }
}
