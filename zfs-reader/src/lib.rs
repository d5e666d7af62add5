//!
//! Read-only access to ZFS pools.
//!
//! The read path goes device → label/uberblock → (RAID-Z) → block pointer
//! resolution → object set → dataset tree. Nothing in this crate writes to a
//! device.
//!
use std::io::Error as IoError;

use thiserror::Error;

pub mod checksum;
pub mod compression;
pub mod device;
pub mod diag;
pub mod dmu;
pub mod dsl;
pub mod nvlist;
pub mod objset;
pub mod pool;
pub mod raidz;
pub mod read;
pub mod spa;
pub mod vdev;
pub mod zap;
pub mod zpl;

pub use crate::device::{Device, Disk, MemDisk};
pub use crate::diag::{Diagnostics, DirectorySink, Fault, FaultSink, MemorySink};
pub use crate::dsl::{Dataset, Filesystem};
pub use crate::objset::{Directory, File, Object, ObjectSet};
pub use crate::pool::{Listing, ListingKind, LockedPool, Node, Pool, PoolOptions};
pub use crate::raidz::RaidzVdev;
pub use crate::read::ReadContext;
pub use crate::spa::{BlockPtr, ChecksumType, CompressionType, Dva, Uberblock};
pub use crate::vdev::{DiskVdev, Label, Vdev, VdevLabels};
pub use crate::zap::{ZapEntries, ZapValue};

#[derive(Debug, Error)]
pub enum ZfsError {
    #[error("Data parse error {0:?}")]
    Parse(nom::error::ErrorKind),
    #[error("Invalid data error: {0}")]
    Invalid(String),
    #[error("Unsupported feature present: {0}")]
    UnsupportedFeature(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    #[error("Not a file: {0}")]
    NotAFile(String),
    #[error("Object {index} ({kind}) failed to decode: {source}")]
    Object {
        index: u64,
        kind: String,
        #[source]
        source: Box<ZfsError>,
    },
    #[error("IO Error {0}")]
    Io(#[from] IoError),
}

impl ZfsError {
    /// True for the lookup failures a caller can recover from by trying another path.
    pub fn is_not_found(&self) -> bool {
        match self {
            ZfsError::NotFound(_) | ZfsError::NotADirectory(_) | ZfsError::NotAFile(_) => true,
            ZfsError::Object { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl<T> From<nom::Err<(T, nom::error::ErrorKind)>> for ZfsError {
    fn from(e: nom::Err<(T, nom::error::ErrorKind)>) -> Self {
        Self::Parse(match e {
            nom::Err::Incomplete(_) => nom::error::ErrorKind::Complete,
            nom::Err::Error(e) => e.1,
            nom::Err::Failure(f) => f.1,
        })
    }
}

pub type Result<T> = std::result::Result<T, ZfsError>;
