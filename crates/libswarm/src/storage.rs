// The storage seam the engine writes pieces through. One unit per
// file; units allow short reads/writes, the engine loops through the
// *_fully wrappers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::{Mutex, RwLock};

use crate::metainfo::TorrentFile;

/// Random-access reader/writer over one file's flat byte address
/// space. `read_block`/`write_block` may return short counts; an error
/// return is an I/O fault. Reading back a byte that was previously
/// written must succeed, otherwise the descriptor is unusable.
pub trait StorageUnit: Send + Sync {
    fn read_block(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
    fn write_block(&self, offset: u64, buf: &[u8]) -> std::io::Result<usize>;
    /// Total addressable length of the unit (the file length).
    fn capacity(&self) -> u64;
    /// Bytes actually present.
    fn size(&self) -> std::io::Result<u64>;
    fn close(&self) -> std::io::Result<()>;
}

pub fn read_block_fully(
    unit: &dyn StorageUnit,
    mut offset: u64,
    mut buf: &mut [u8],
) -> std::io::Result<()> {
    while !buf.is_empty() {
        let read = unit.read_block(offset, buf)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("unexpected eof at offset {offset}"),
            ));
        }
        offset += read as u64;
        buf = &mut buf[read..];
    }
    Ok(())
}

pub fn write_block_fully(
    unit: &dyn StorageUnit,
    mut offset: u64,
    mut buf: &[u8],
) -> std::io::Result<()> {
    while !buf.is_empty() {
        let written = unit.write_block(offset, buf)?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("write returned 0 at offset {offset}"),
            ));
        }
        offset += written as u64;
        buf = &buf[written..];
    }
    Ok(())
}

/// Creates storage units for a torrent's files.
pub trait Storage: Send + Sync {
    fn open_unit(&self, file: &TorrentFile) -> anyhow::Result<Box<dyn StorageUnit>>;
}

pub struct FileStorage {
    output_folder: PathBuf,
}

impl FileStorage {
    pub fn new(output_folder: impl Into<PathBuf>) -> Self {
        Self {
            output_folder: output_folder.into(),
        }
    }
}

impl Storage for FileStorage {
    fn open_unit(&self, file: &TorrentFile) -> anyhow::Result<Box<dyn StorageUnit>> {
        let path = self.output_folder.join(&file.relative_path);
        Ok(Box::new(FileStorageUnit::open(&path, file.length)?))
    }
}

pub struct FileStorageUnit {
    file: Mutex<File>,
    capacity: u64,
}

impl FileStorageUnit {
    pub fn open(path: &Path, capacity: u64) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("error creating {parent:?}"))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("error opening {path:?}"))?;
        Ok(Self {
            file: Mutex::new(file),
            capacity,
        })
    }
}

impl StorageUnit for FileStorageUnit {
    fn read_block(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut g = self.file.lock();
        g.seek(SeekFrom::Start(offset))?;
        g.read(buf)
    }

    fn write_block(&self, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
        let mut g = self.file.lock();
        g.seek(SeekFrom::Start(offset))?;
        g.write(buf)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn size(&self) -> std::io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn close(&self) -> std::io::Result<()> {
        self.file.lock().sync_all()
    }
}

/// Memory-backed unit. The storage back-end used by the tests, also
/// handy for throwaway downloads.
pub struct InMemoryStorage;

impl Storage for InMemoryStorage {
    fn open_unit(&self, file: &TorrentFile) -> anyhow::Result<Box<dyn StorageUnit>> {
        Ok(Box::new(InMemoryStorageUnit::new(file.length)))
    }
}

pub struct InMemoryStorageUnit {
    // present length <= capacity; reads past it are short
    data: RwLock<Vec<u8>>,
    capacity: u64,
}

impl InMemoryStorageUnit {
    pub fn new(capacity: u64) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            capacity,
        }
    }
}

impl StorageUnit for InMemoryStorageUnit {
    fn read_block(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let g = self.data.read();
        let offset = offset as usize;
        if offset >= g.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), g.len() - offset);
        buf[..n].copy_from_slice(&g[offset..offset + n]);
        Ok(n)
    }

    fn write_block(&self, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
        if offset + buf.len() as u64 > self.capacity {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "write past capacity",
            ));
        }
        let mut g = self.data.write();
        let end = offset as usize + buf.len();
        if g.len() < end {
            g.resize(end, 0);
        }
        g[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn size(&self) -> std::io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}
