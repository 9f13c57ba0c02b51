use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::entry::DATA_START;
use crate::error::Result;

/// Where the data image goes. The engine owns the image in memory and hands
/// dirty byte ranges down here; whether those land via a memory map or
/// blocking writes is invisible to it.
pub enum Backend {
    /// One or two memory-mapped images. Two maps give the dual-file scheme:
    /// every range is copied into both, so a crash can corrupt at most the
    /// image being written.
    Mmap(MmapBackend),
    /// A single image written with blocking IO and fsync per commit.
    Blocking(BlockingBackend),
    /// No persistence; used by the encryption rewrite scratch engine.
    Memory,
}

impl Backend {
    /// Grows the backing file(s) to the new buffer capacity.
    pub fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        match self {
            Backend::Mmap(b) => b.ensure_capacity(capacity),
            Backend::Blocking(b) => b.ensure_capacity(capacity),
            Backend::Memory => Ok(()),
        }
    }

    /// Writes the dirty range `[start, end)` and the 12-byte header.
    pub fn commit(&mut self, buf: &[u8], start: usize, end: usize) -> Result<()> {
        match self {
            Backend::Mmap(b) => b.commit(buf, start, end),
            Backend::Blocking(b) => b.commit(buf, start, end),
            Backend::Memory => Ok(()),
        }
    }

    /// Replaces the whole on-disk image, shrinking or growing the file(s) to
    /// the buffer's capacity. Used on open (to repair a stale sibling), after
    /// truncation, and when adopting a rewrite.
    pub fn replace_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Backend::Mmap(b) => b.replace_all(buf),
            Backend::Blocking(b) => b.replace_all(buf),
            Backend::Memory => Ok(()),
        }
    }

    /// Forces buffered state to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        match self {
            Backend::Mmap(b) => b.sync(),
            Backend::Blocking(b) => b.sync(),
            Backend::Memory => Ok(()),
        }
    }
}

struct MapFile {
    file: File,
    map: MmapMut,
    path: PathBuf,
}

impl MapFile {
    fn open(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(capacity as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(MapFile {
            file,
            map,
            path: path.to_path_buf(),
        })
    }

    fn remap(&mut self, capacity: usize) -> Result<()> {
        if self.map.len() == capacity {
            return Ok(());
        }
        self.file.set_len(capacity as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }
}

pub struct MmapBackend {
    files: Vec<MapFile>,
}

impl MmapBackend {
    pub fn open(paths: &[PathBuf], capacity: usize) -> Result<Self> {
        let files = paths
            .iter()
            .map(|path| MapFile::open(path, capacity))
            .collect::<Result<Vec<_>>>()?;
        Ok(MmapBackend { files })
    }

    fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        for file in &mut self.files {
            file.remap(capacity)?;
        }
        Ok(())
    }

    fn commit(&mut self, buf: &[u8], start: usize, end: usize) -> Result<()> {
        for file in &mut self.files {
            file.map[start..end].copy_from_slice(&buf[start..end]);
            file.map[..DATA_START].copy_from_slice(&buf[..DATA_START]);
        }
        Ok(())
    }

    fn replace_all(&mut self, buf: &[u8]) -> Result<()> {
        for file in &mut self.files {
            file.remap(buf.len())?;
            file.map.copy_from_slice(buf);
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for file in &mut self.files {
            file.map.flush()?;
        }
        Ok(())
    }
}

pub struct BlockingBackend {
    file: File,
    path: PathBuf,
    tmp_path: PathBuf,
}

impl BlockingBackend {
    pub fn open(path: &Path, tmp_path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(BlockingBackend {
            file,
            path: path.to_path_buf(),
            tmp_path: tmp_path.to_path_buf(),
        })
    }

    fn ensure_capacity(&mut self, capacity: usize) -> Result<()> {
        if self.file.metadata()?.len() < capacity as u64 {
            self.file.set_len(capacity as u64)?;
        }
        Ok(())
    }

    fn commit(&mut self, buf: &[u8], start: usize, end: usize) -> Result<()> {
        self.file.seek(SeekFrom::Start(start as u64))?;
        self.file.write_all(&buf[start..end])?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf[..DATA_START])?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Full image replacement goes through the `.tmp` sibling and an atomic
    /// rename, so a crash leaves either the old or the new image intact.
    fn replace_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut tmp = File::create(&self.tmp_path)?;
        tmp.write_all(buf)?;
        tmp.sync_all()?;
        std::fs::rename(&self.tmp_path, &self.path)?;
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(len: usize, fill: u8) -> Vec<u8> {
        let mut buf = vec![fill; len];
        buf[..DATA_START].copy_from_slice(&[0xAA; DATA_START]);
        buf
    }

    #[test]
    fn test_mmap_dual_commit_hits_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("x.kva"), dir.path().join("x.kvb")];
        let mut backend = MmapBackend::open(&paths, 64).unwrap();

        let buf = image(64, 7);
        backend.commit(&buf, 12, 64).unwrap();
        backend.sync().unwrap();

        for path in &paths {
            let bytes = std::fs::read(path).unwrap();
            assert_eq!(bytes, buf);
        }
    }

    #[test]
    fn test_mmap_replace_all_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("x.kva")];
        let mut backend = MmapBackend::open(&paths, 64).unwrap();

        let buf = image(32, 3);
        backend.replace_all(&buf).unwrap();
        backend.sync().unwrap();

        let bytes = std::fs::read(&paths[0]).unwrap();
        assert_eq!(bytes, buf);
    }

    #[test]
    fn test_blocking_commit_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.kvc");
        let tmp = dir.path().join("x.tmp");
        let mut backend = BlockingBackend::open(&path, &tmp).unwrap();

        let buf = image(48, 9);
        backend.ensure_capacity(48).unwrap();
        backend.commit(&buf, 12, 48).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), buf);

        let smaller = image(24, 5);
        backend.replace_all(&smaller).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), smaller);
        assert!(!tmp.exists());
    }
}
