use std::fmt;
use std::io::SeekFrom;

use nom::bytes::complete::take;
use nom::multi::count;
use nom::sequence::tuple;
use nom::IResult;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::diag::{Diagnostics, Fault};
use crate::nvlist::NvList;
use crate::pool::PoolOptions;
use crate::spa::{Dva, Uberblock};
use crate::{Result, ZfsError};

pub const LABEL_SIZE: u64 = 256 << 10;
pub const LABEL_PAD: usize = 16 << 10;
pub const NV_AREA_SIZE: usize = 112 << 10;
pub const UBERBLOCK_AREA_SIZE: usize = 128 << 10;
pub const UBERBLOCK_SLOT_SIZE: usize = 1 << 10;
pub const UBERBLOCK_COUNT: usize = UBERBLOCK_AREA_SIZE / UBERBLOCK_SLOT_SIZE;

/// Where the four labels live, front two then back two.
pub const LABEL_LOCATIONS: [SeekFrom; 4] = [
    SeekFrom::Start(0),
    SeekFrom::Start(LABEL_SIZE),
    SeekFrom::End(-(LABEL_SIZE as i64)),
    SeekFrom::End(-2 * LABEL_SIZE as i64),
];

#[derive(Debug, Clone)]
pub struct Label {
    /// Position in [`LABEL_LOCATIONS`].
    pub index: usize,
    pub config: NvList,
    /// Valid uberblocks only, in slot order.
    pub uberblocks: Vec<Uberblock>,
}

impl Label {
    pub fn parse(index: usize, input: &[u8]) -> Result<Self> {
        let (_, (nv_pairs, uberblocks)) = Self::areas(input)?;
        let config = NvList::decode_xdr(nv_pairs)?;
        let (_, uberblocks) = count(
            |i| Uberblock::parse(i, UBERBLOCK_SLOT_SIZE),
            UBERBLOCK_COUNT,
        )(uberblocks)?;
        let uberblocks = uberblocks.into_iter().filter(Uberblock::is_valid).collect();
        Ok(Self {
            index,
            config,
            uberblocks,
        })
    }
    /// The nvlist and uberblock ring, after the blank and boot header pad.
    fn areas(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
        let (rest, (_pad, nv_pairs, uberblocks)) = tuple((
            take(LABEL_PAD),
            take(NV_AREA_SIZE),
            take(UBERBLOCK_AREA_SIZE),
        ))(input)?;
        Ok((rest, (nv_pairs, uberblocks)))
    }
    pub fn txg(&self) -> u64 {
        self.config.get_u64("txg").unwrap_or(0)
    }
    pub fn vdev_tree(&self) -> Option<&NvList> {
        self.config.get_list("vdev_tree")
    }
}

/// Decoded labels of one device plus the uberblock chosen from them.
#[derive(Debug, Clone)]
pub struct VdevLabels {
    labels: Vec<Label>,
    best: usize,
    uberblocks: Vec<Uberblock>,
    active: usize,
}

impl VdevLabels {
    /// Reads all four labels. A label that fails to decode is skipped.
    pub fn read<D: Device + ?Sized>(
        device: &D,
        label: Option<usize>,
        txg: Option<u64>,
        diag: &Diagnostics,
    ) -> Result<Self> {
        let mut labels = Vec::new();
        for (index, pos) in LABEL_LOCATIONS.iter().enumerate() {
            let decoded = device
                .read(*pos, LABEL_SIZE as usize)
                .map_err(ZfsError::from)
                .and_then(|raw| Label::parse(index, &raw));
            match decoded {
                Ok(l) => labels.push(l),
                Err(e) => warn!(label = index, error = %e, "skipping unreadable label"),
            }
        }
        if labels.is_empty() {
            return Err(ZfsError::Invalid("no readable vdev label".to_owned()));
        }
        let best = Self::best_label_position(&labels, label)?;

        let mut uberblocks: Vec<Uberblock> = labels
            .iter()
            .flat_map(|l| l.uberblocks.iter().cloned())
            .collect();
        uberblocks.sort_by(|a, b| b.txg.cmp(&a.txg));
        let active = select_uberblock(&uberblocks, txg, diag)
            .ok_or_else(|| ZfsError::Invalid("no valid uberblock".to_owned()))?;
        info!(
            label = labels[best].index,
            txg = uberblocks[active].txg,
            "selected uberblock"
        );
        Ok(Self {
            labels,
            best,
            uberblocks,
            active,
        })
    }

    fn best_label_position(labels: &[Label], wanted: Option<usize>) -> Result<usize> {
        match wanted {
            Some(index) => labels
                .iter()
                .position(|l| l.index == index)
                .ok_or_else(|| ZfsError::NotFound(format!("label {}", index))),
            None => Ok(labels
                .iter()
                .enumerate()
                .max_by_key(|(pos, l)| (l.txg(), std::cmp::Reverse(*pos)))
                .map(|(pos, _)| pos)
                .unwrap_or(0)),
        }
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }
    pub fn best_label(&self) -> &Label {
        &self.labels[self.best]
    }
    /// Every valid uberblock, highest txg first.
    pub fn uberblocks(&self) -> &[Uberblock] {
        &self.uberblocks
    }
    pub fn active_uberblock(&self) -> &Uberblock {
        &self.uberblocks[self.active]
    }
    pub fn id(&self) -> Result<u64> {
        self.best_label()
            .vdev_tree()
            .and_then(|t| t.get_u64("id"))
            .ok_or_else(|| ZfsError::Invalid("label has no vdev_tree.id".to_owned()))
    }
    pub fn version(&self) -> Option<u64> {
        self.best_label().config.get_u64("version")
    }
    pub fn ashift(&self) -> Option<u64> {
        self.best_label().vdev_tree().and_then(|t| t.get_u64("ashift"))
    }
}

/// Picks from `uberblocks` (sorted by descending txg): the exact `txg` if
/// asked for and present, else the newest. A miss is reported as a fault.
pub fn select_uberblock(
    uberblocks: &[Uberblock],
    txg: Option<u64>,
    diag: &Diagnostics,
) -> Option<usize> {
    if uberblocks.is_empty() {
        return None;
    }
    if let Some(wanted) = txg {
        if let Some(pos) = uberblocks.iter().position(|u| u.txg == wanted) {
            return Some(pos);
        }
        let mut available: Vec<u64> = uberblocks.iter().map(|u| u.txg).collect();
        available.dedup();
        diag.report(Fault::TxgNotFound {
            requested: wanted,
            available,
        });
    }
    Some(0)
}

pub trait Vdev: fmt::Debug {
    fn id(&self) -> u64;
    fn labels(&self) -> &VdevLabels;
    /// Reads the allocated extent of `dva` from this vdev.
    fn read_dva(&self, dva: &Dva) -> Result<Vec<u8>>;

    fn active_uberblock(&self) -> &Uberblock {
        self.labels().active_uberblock()
    }
}

/// A single leaf device.
#[derive(Debug)]
pub struct DiskVdev<D> {
    device: D,
    labels: VdevLabels,
    id: u64,
}

impl<D: Device> DiskVdev<D> {
    pub fn open(device: D, options: &PoolOptions) -> Result<Self> {
        let labels = VdevLabels::read(&device, options.label, options.txg, &options.diagnostics)?;
        let id = labels.id()?;
        debug!(id, ?device, "opened vdev");
        Ok(Self { device, labels, id })
    }
    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> Vdev for DiskVdev<D> {
    fn id(&self) -> u64 {
        self.id
    }
    fn labels(&self) -> &VdevLabels {
        &self.labels
    }
    fn read_dva(&self, dva: &Dva) -> Result<Vec<u8>> {
        Ok(self.device.read(
            SeekFrom::Start(dva.device_offset()?),
            dva.asize_bytes() as usize,
        )?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::diag::MemorySink;
    use crate::nvlist::tests::XdrWriter;
    use crate::spa::{UBERBLOCK_MAGIC, VDEV_DATA_OFFSET};
    use std::sync::Arc;

    pub(crate) fn label_bytes(txg: u64, id: u64, uber_txgs: &[u64]) -> Vec<u8> {
        let mut w = XdrWriter::default();
        w.buf.extend_from_slice(&0x0101_0000u32.to_be_bytes());
        w.begin();
        w.u64("version", 5000);
        w.u64("txg", txg);
        w.nested("vdev_tree");
        w.u64("id", id);
        w.u64("ashift", 9);
        w.end();
        w.end();
        let mut out = vec![0u8; LABEL_SIZE as usize];
        out[LABEL_PAD..LABEL_PAD + w.buf.len()].copy_from_slice(&w.buf);
        for (slot, t) in uber_txgs.iter().enumerate() {
            let at = LABEL_PAD + NV_AREA_SIZE + slot * UBERBLOCK_SLOT_SIZE;
            out[at..at + 8].copy_from_slice(&UBERBLOCK_MAGIC.to_le_bytes());
            out[at + 8..at + 16].copy_from_slice(&5000u64.to_le_bytes());
            out[at + 16..at + 24].copy_from_slice(&t.to_le_bytes());
        }
        out
    }

    fn image(labels: [Vec<u8>; 4]) -> MemDisk {
        let [l0, l1, l2, l3] = labels;
        let mut data = Vec::new();
        data.extend(l0);
        data.extend(l1);
        data.extend(vec![0u8; 1 << 20]);
        data.extend(l2);
        data.extend(l3);
        MemDisk::new(data)
    }

    /// A labelled device of vdev `id` whose allocatable area starts with `data`.
    pub(crate) fn data_disk(id: u64, data: &[u8]) -> MemDisk {
        let label = label_bytes(1, id, &[1]);
        let mut image = Vec::new();
        image.extend(&label);
        image.extend(&label);
        image.resize(VDEV_DATA_OFFSET as usize, 0);
        image.extend(data);
        let end = (image.len() + (64 << 10) + 511) & !511;
        image.resize(end, 0);
        image.extend(&label);
        image.extend(&label);
        MemDisk::new(image)
    }

    #[test]
    fn best_label_has_highest_txg() {
        let dev = image([
            label_bytes(5, 0, &[3, 5]),
            label_bytes(9, 0, &[9]),
            label_bytes(7, 0, &[7]),
            label_bytes(8, 0, &[]),
        ]);
        let labels = VdevLabels::read(&dev, None, None, &Diagnostics::default()).unwrap();
        assert_eq!(labels.labels().len(), 4);
        assert_eq!(labels.best_label().txg(), 9);
        assert_eq!(labels.active_uberblock().txg, 9);
        let txgs: Vec<u64> = labels.uberblocks().iter().map(|u| u.txg).collect();
        assert_eq!(txgs, vec![9, 7, 5, 3]);
        assert_eq!(labels.id().unwrap(), 0);
        assert_eq!(labels.ashift(), Some(9));
    }

    #[test]
    fn explicit_label_index() {
        let dev = image([
            label_bytes(5, 0, &[5]),
            label_bytes(9, 0, &[9]),
            label_bytes(7, 0, &[7]),
            label_bytes(8, 0, &[8]),
        ]);
        let labels = VdevLabels::read(&dev, Some(0), None, &Diagnostics::default()).unwrap();
        assert_eq!(labels.best_label().index, 0);
        assert_eq!(labels.best_label().txg(), 5);
    }

    #[test]
    fn corrupt_labels_are_skipped() {
        let dev = image([
            vec![0xffu8; LABEL_SIZE as usize],
            label_bytes(4, 2, &[4]),
            vec![0xffu8; LABEL_SIZE as usize],
            vec![0xffu8; LABEL_SIZE as usize],
        ]);
        let labels = VdevLabels::read(&dev, None, None, &Diagnostics::default()).unwrap();
        assert_eq!(labels.labels().len(), 1);
        assert_eq!(labels.id().unwrap(), 2);
        assert!(VdevLabels::read(&dev, Some(0), None, &Diagnostics::default()).is_err());
    }

    #[test]
    fn requested_txg_falls_back_with_fault() {
        let dev = image([
            label_bytes(9, 0, &[7, 9]),
            label_bytes(9, 0, &[]),
            label_bytes(9, 0, &[]),
            label_bytes(9, 0, &[]),
        ]);
        let sink = Arc::new(MemorySink::new());
        let diag = Diagnostics::new(sink.clone());
        let labels = VdevLabels::read(&dev, None, Some(7), &diag).unwrap();
        assert_eq!(labels.active_uberblock().txg, 7);
        assert!(sink.faults().is_empty());

        let labels = VdevLabels::read(&dev, None, Some(8), &diag).unwrap();
        assert_eq!(labels.active_uberblock().txg, 9);
        assert_eq!(
            sink.faults(),
            vec![Fault::TxgNotFound {
                requested: 8,
                available: vec![9, 7],
            }]
        );
    }

    #[test]
    fn no_uberblock_is_an_error() {
        let dev = image([
            label_bytes(1, 0, &[]),
            label_bytes(1, 0, &[]),
            label_bytes(1, 0, &[]),
            label_bytes(1, 0, &[]),
        ]);
        assert!(VdevLabels::read(&dev, None, None, &Diagnostics::default()).is_err());
    }
}
