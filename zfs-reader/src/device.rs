use std::fmt;
use std::fs::File;
use std::io::{Error as IoError, ErrorKind, Result as IoResult, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Byte addressed storage.
///
/// Reads take `&self` so a vdev can be shared while it is read.
pub trait Device: fmt::Debug {
    /// Read exactly `len` bytes at `pos`. `SeekFrom::Current` has no meaning
    /// for a positionless device and is rejected.
    fn read(&self, pos: SeekFrom, len: usize) -> IoResult<Vec<u8>>;
    fn write(&mut self, pos: SeekFrom, data: &[u8]) -> IoResult<()>;
    fn flush(&mut self) -> IoResult<()>;
    fn size(&self) -> IoResult<u64>;

    fn absolute(&self, pos: SeekFrom) -> IoResult<u64> {
        match pos {
            SeekFrom::Start(offset) => Ok(offset),
            SeekFrom::End(delta) => {
                let size = self.size()?;
                if delta.unsigned_abs() > size && delta < 0 {
                    Err(IoError::new(
                        ErrorKind::InvalidInput,
                        format!("offset {} before start of {} byte device", delta, size),
                    ))
                } else {
                    Ok((size as i64 + delta) as u64)
                }
            }
            SeekFrom::Current(_) => Err(IoError::new(
                ErrorKind::InvalidInput,
                "relative seek on a positionless device",
            )),
        }
    }
}

impl<D: Device + ?Sized> Device for Box<D> {
    fn read(&self, pos: SeekFrom, len: usize) -> IoResult<Vec<u8>> {
        (**self).read(pos, len)
    }
    fn write(&mut self, pos: SeekFrom, data: &[u8]) -> IoResult<()> {
        (**self).write(pos, data)
    }
    fn flush(&mut self) -> IoResult<()> {
        (**self).flush()
    }
    fn size(&self) -> IoResult<u64> {
        (**self).size()
    }
}

/// A disk image or block device.
pub struct Disk {
    file: File,
    path: PathBuf,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk").field("path", &self.path).finish()
    }
}

impl Disk {
    pub fn open<P: AsRef<Path>>(path: P) -> IoResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self { file, path })
    }
    pub fn from_file(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for Disk {
    fn read(&self, pos: SeekFrom, len: usize) -> IoResult<Vec<u8>> {
        let address = self.absolute(pos)?;
        let mut buf = vec![0; len];
        self.file.read_exact_at(&mut buf, address)?;
        Ok(buf)
    }
    fn write(&mut self, pos: SeekFrom, data: &[u8]) -> IoResult<()> {
        let address = self.absolute(pos)?;
        self.file.write_all_at(data, address)
    }
    fn flush(&mut self) -> IoResult<()> {
        self.file.sync_data()
    }
    fn size(&self) -> IoResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// An in-memory image.
#[derive(Clone, Default)]
pub struct MemDisk {
    data: Vec<u8>,
}

impl fmt::Debug for MemDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDisk")
            .field("len", &self.data.len())
            .finish()
    }
}

impl MemDisk {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Device for MemDisk {
    fn read(&self, pos: SeekFrom, len: usize) -> IoResult<Vec<u8>> {
        let start = self.absolute(pos)? as usize;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                IoError::new(
                    ErrorKind::UnexpectedEof,
                    format!("read of {} bytes at {} past end of image", len, start),
                )
            })
    }
    fn write(&mut self, pos: SeekFrom, data: &[u8]) -> IoResult<()> {
        let start = self.absolute(pos)? as usize;
        let end = start + data.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }
    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
    fn size(&self) -> IoResult<u64> {
        Ok(self.data.len() as u64)
    }
}
