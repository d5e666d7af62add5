//!
//! Integrity fault reporting.
//!
//! Checksum mismatches, diverging copies and similar problems never abort a
//! read. They are logged and handed to an optional [`FaultSink`] so a caller
//! can collect them, and failing records can be dumped for postmortem work.
//!
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::spa::Checksum;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A copy read fine but its checksum does not match the block pointer.
    ChecksumMismatch {
        dva: String,
        expected: Checksum,
        actual: Checksum,
    },
    /// Several copies validated but their contents differ.
    DivergentCopies { copies: usize, lengths: Vec<usize> },
    /// A copy could not be read at all.
    UnreadableCopy { dva: String, error: String },
    /// No copy of a block could be read and validated.
    NoValidCopy { allocated: usize },
    /// The requested txg has no valid uberblock.
    TxgNotFound { requested: u64, available: Vec<u64> },
    /// RAID-Z parity column disagrees with the XOR of the data columns.
    ParityMismatch { offset: u64, columns: usize },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::ChecksumMismatch {
                dva,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch at {}: expected {} got {}",
                dva, expected, actual
            ),
            Fault::DivergentCopies { copies, lengths } => write!(
                f,
                "{} valid copies with different data (lengths {:?})",
                copies, lengths
            ),
            Fault::UnreadableCopy { dva, error } => {
                write!(f, "copy at {} unreadable: {}", dva, error)
            }
            Fault::NoValidCopy { allocated } => {
                write!(f, "none of {} allocated copies could be read", allocated)
            }
            Fault::TxgNotFound {
                requested,
                available,
            } => write!(
                f,
                "txg {} not found, available txgs {:?}",
                requested, available
            ),
            Fault::ParityMismatch { offset, columns } => write!(
                f,
                "parity mismatch at offset {:#x} across {} columns",
                offset, columns
            ),
        }
    }
}

pub trait FaultSink: Send + Sync {
    fn fault(&self, fault: &Fault);
    /// Receives the raw content of a record that failed to decode.
    fn dump(&self, _name: &str, _data: &[u8]) {}
    fn wants_dumps(&self) -> bool {
        false
    }
}

/// Cloneable handle passed to every component that can observe a fault.
#[derive(Clone, Default)]
pub struct Diagnostics {
    sink: Option<Arc<dyn FaultSink>>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn FaultSink>) -> Self {
        Self { sink: Some(sink) }
    }
    pub fn report(&self, fault: Fault) {
        error!(fault = %fault, "integrity fault");
        if let Some(sink) = &self.sink {
            sink.fault(&fault);
        }
    }
    pub fn wants_dumps(&self) -> bool {
        self.sink.as_ref().map_or(false, |s| s.wants_dumps())
    }
    pub fn dump(&self, name: &str, data: &[u8]) {
        if let Some(sink) = &self.sink {
            sink.dump(name, data);
        }
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    faults: Mutex<Vec<Fault>>,
    dumps: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }
    pub fn dumps(&self) -> Vec<(String, Vec<u8>)> {
        self.dumps.lock().clone()
    }
}

impl FaultSink for MemorySink {
    fn fault(&self, fault: &Fault) {
        self.faults.lock().push(fault.clone());
    }
    fn dump(&self, name: &str, data: &[u8]) {
        self.dumps.lock().push((name.to_owned(), data.to_vec()));
    }
    fn wants_dumps(&self) -> bool {
        true
    }
}

/// Writes dumps of failing records as files into a directory.
#[derive(Debug)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}

impl FaultSink for DirectorySink {
    fn fault(&self, _fault: &Fault) {}
    fn dump(&self, name: &str, data: &[u8]) {
        let path = self.dir.join(name);
        if let Err(e) = fs::create_dir_all(&self.dir).and_then(|_| fs::write(&path, data)) {
            warn!(path = %path.display(), error = %e, "could not write record dump");
        }
    }
    fn wants_dumps(&self) -> bool {
        true
    }
}
