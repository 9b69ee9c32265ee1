//! [`StorageDriver`] implementation backed by a FAT32 volume image, using
//! the `fatfs` crate for on-disk structure and `fscommon` to adapt a
//! plain file into the buffered `ReadWriteSeek` it expects.
//!
//! `fatfs`'s `Dir`/`File` types borrow from the `FileSystem` they came
//! from, which makes them awkward to park inside a handle table across
//! calls. Rather than fight that lifetime (or reach for `unsafe`), this
//! driver keeps handles logical: a handle records a path plus a cursor
//! (byte offset for a file, entry index for a directory), and every
//! operation re-opens the path from `root_dir()`, does its work, and
//! lets the borrowed `Dir`/`File` drop before returning. FAT volumes
//! exported here are small enough that the repeated directory walk this
//! implies is not a meaningful cost (spec §6's storage driver contract
//! does not require handles to be cheap to keep open, only functional).

use fatfs::{FileSystem, FsOptions};
use fscommon::BufStream;
use ninep::error::DriverErrno;
use ninep::storage::{Attributes, DateTime, DirEntry, StorageDriver};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

type Volume = BufStream<std::fs::File>;

enum HandleKind {
    File { pos: u64 },
    Dir { index: usize },
}

struct OpenHandle {
    path: String,
    kind: HandleKind,
}

pub struct FatDriver {
    fs: FileSystem<Volume>,
    handles: HashMap<u64, OpenHandle>,
    next_handle: u64,
}

impl FatDriver {
    pub fn open_image(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let volume = BufStream::new(file);
        let fs = FileSystem::new(volume, FsOptions::new())
            .map_err(|e| std::io::Error::other(format!("{:?}", e)))?;
        Ok(FatDriver {
            fs,
            handles: HashMap::new(),
            next_handle: 1,
        })
    }

    fn alloc_handle(&mut self, entry: OpenHandle) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(h, entry);
        h
    }

    /// Determine whether `path` names a directory or a file, without
    /// keeping anything borrowed past the call.
    fn classify(&self, path: &str) -> Result<bool, DriverErrno> {
        if is_root(path) {
            return Ok(true);
        }
        let root = self.fs.root_dir();
        let rel = strip_root(path);
        if root.open_dir(rel).is_ok() {
            return Ok(true);
        }
        if root.open_file(rel).is_ok() {
            return Ok(false);
        }
        Err(DriverErrno::NotFound)
    }

    fn lookup_entry_meta(&self, path: &str) -> Result<Attributes, DriverErrno> {
        if is_root(path) {
            return Ok(Attributes {
                is_dir: true,
                size: 0,
                modified: DateTime {
                    year: 1980,
                    month: 1,
                    day: 1,
                    hour: 0,
                    minute: 0,
                    second: 0,
                },
                read_only: false,
            });
        }
        let (parent, name) = split_path(path);
        let root = self.fs.root_dir();
        let dir = if is_root(&parent) {
            root
        } else {
            root.open_dir(strip_root(&parent))
                .map_err(map_fat_err)?
        };
        for entry in dir.iter() {
            let entry = entry.map_err(map_fat_err)?;
            if entry.file_name() == name {
                let modified = entry.modified();
                return Ok(Attributes {
                    is_dir: entry.is_dir(),
                    size: entry.len(),
                    modified: DateTime {
                        year: modified.date.year,
                        month: modified.date.month as u8,
                        day: modified.date.day as u8,
                        hour: modified.time.hour as u8,
                        minute: modified.time.min as u8,
                        second: modified.time.sec as u8,
                    },
                    read_only: entry.attributes().contains(fatfs::FileAttributes::READ_ONLY),
                });
            }
        }
        Err(DriverErrno::NotFound)
    }
}

fn is_root(path: &str) -> bool {
    path.is_empty() || path == "/"
}

fn strip_root(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_owned(), trimmed[1..].to_owned()),
        Some(idx) => (trimmed[..idx].to_owned(), trimmed[idx + 1..].to_owned()),
        None => ("/".to_owned(), trimmed.to_owned()),
    }
}

fn map_fat_err(e: fatfs::Error<std::io::Error>) -> DriverErrno {
    use fatfs::Error::*;
    match e {
        NotFound => DriverErrno::NotFound,
        AlreadyExists => DriverErrno::Exists,
        DirectoryNotEmpty => DriverErrno::NotADirectory,
        NotEnoughSpace => DriverErrno::DiskFull,
        CorruptedFileSystem => DriverErrno::NotMounted,
        InvalidInput | InvalidFileNameLength | UnsupportedFileNameCharacter => {
            DriverErrno::InvalidPath
        }
        Io(_) | UnexpectedEof => DriverErrno::ReadFailed,
        _ => DriverErrno::InvalidPath,
    }
}

impl StorageDriver for FatDriver {
    fn is_mounted(&self) -> bool {
        true
    }

    fn open(&mut self, path: &str) -> Result<u64, DriverErrno> {
        let is_dir = self.classify(path)?;
        let kind = if is_dir {
            HandleKind::Dir { index: 0 }
        } else {
            HandleKind::File { pos: 0 }
        };
        Ok(self.alloc_handle(OpenHandle {
            path: path.to_owned(),
            kind,
        }))
    }

    fn create(&mut self, path: &str) -> Result<u64, DriverErrno> {
        let root = self.fs.root_dir();
        root.create_file(strip_root(path)).map_err(map_fat_err)?;
        Ok(self.alloc_handle(OpenHandle {
            path: path.to_owned(),
            kind: HandleKind::File { pos: 0 },
        }))
    }

    fn directory_create(&mut self, path: &str) -> Result<(), DriverErrno> {
        let root = self.fs.root_dir();
        root.create_dir(strip_root(path)).map_err(map_fat_err)?;
        Ok(())
    }

    fn close(&mut self, handle: u64) -> Result<(), DriverErrno> {
        self.handles.remove(&handle);
        Ok(())
    }

    fn read(&mut self, handle: u64, buf: &mut [u8]) -> Result<u32, DriverErrno> {
        let entry = self.handles.get(&handle).ok_or(DriverErrno::NotFound)?;
        let pos = match entry.kind {
            HandleKind::File { pos } => pos,
            HandleKind::Dir { .. } => return Err(DriverErrno::NotAFile),
        };
        let path = entry.path.clone();
        let root = self.fs.root_dir();
        let mut file = root.open_file(strip_root(&path)).map_err(map_fat_err)?;
        file.seek(SeekFrom::Start(pos)).map_err(map_fat_err)?;
        let n = file.read(buf).map_err(map_fat_err)?;
        if let Some(h) = self.handles.get_mut(&handle) {
            h.kind = HandleKind::File {
                pos: pos + n as u64,
            };
        }
        Ok(n as u32)
    }

    fn write(&mut self, handle: u64, buf: &[u8]) -> Result<u32, DriverErrno> {
        let entry = self.handles.get(&handle).ok_or(DriverErrno::NotFound)?;
        let pos = match entry.kind {
            HandleKind::File { pos } => pos,
            HandleKind::Dir { .. } => return Err(DriverErrno::NotAFile),
        };
        let path = entry.path.clone();
        let root = self.fs.root_dir();
        let mut file = root.open_file(strip_root(&path)).map_err(map_fat_err)?;
        file.seek(SeekFrom::Start(pos)).map_err(map_fat_err)?;
        let n = file.write(buf).map_err(map_fat_err)?;
        if let Some(h) = self.handles.get_mut(&handle) {
            h.kind = HandleKind::File {
                pos: pos + n as u64,
            };
        }
        Ok(n as u32)
    }

    fn seek(&mut self, handle: u64, offset: u64) -> Result<(), DriverErrno> {
        let entry = self.handles.get_mut(&handle).ok_or(DriverErrno::NotFound)?;
        match &mut entry.kind {
            HandleKind::File { pos } => *pos = offset,
            HandleKind::Dir { .. } => return Err(DriverErrno::NotAFile),
        }
        Ok(())
    }

    fn directory_read(&mut self, handle: u64) -> Result<Option<DirEntry>, DriverErrno> {
        let entry = self.handles.get(&handle).ok_or(DriverErrno::NotFound)?;
        let index = match entry.kind {
            HandleKind::Dir { index } => index,
            HandleKind::File { .. } => return Err(DriverErrno::NotADirectory),
        };
        let path = entry.path.clone();
        let root = self.fs.root_dir();
        let dir = if is_root(&path) {
            root
        } else {
            root.open_dir(strip_root(&path)).map_err(map_fat_err)?
        };

        let mut iter = dir.iter().skip(index);
        let next = match iter.next() {
            Some(r) => Some(r.map_err(map_fat_err)?),
            None => None,
        };

        if let Some(h) = self.handles.get_mut(&handle) {
            if let HandleKind::Dir { index } = &mut h.kind {
                *index += 1;
            }
        }

        Ok(next.map(|e| DirEntry {
            name: e.file_name(),
            is_dir: e.is_dir(),
        }))
    }

    fn delete(&mut self, path: &str) -> Result<(), DriverErrno> {
        let root = self.fs.root_dir();
        root.remove(strip_root(path)).map_err(map_fat_err)
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<(), DriverErrno> {
        let root = self.fs.root_dir();
        root.rename(strip_root(old), &root, strip_root(new))
            .map_err(map_fat_err)
    }

    fn size(&mut self, handle: u64) -> Result<u64, DriverErrno> {
        let path = self
            .handles
            .get(&handle)
            .ok_or(DriverErrno::NotFound)?
            .path
            .clone();
        Ok(self.lookup_entry_meta(&path)?.size)
    }

    fn attributes(&mut self, handle: u64) -> Result<Attributes, DriverErrno> {
        let path = self
            .handles
            .get(&handle)
            .ok_or(DriverErrno::NotFound)?
            .path
            .clone();
        self.lookup_entry_meta(&path)
    }

    fn free_space(&self) -> u64 {
        self.fs
            .stats()
            .map(|s| s.free_clusters() as u64 * s.cluster_size() as u64)
            .unwrap_or(0)
    }

    fn total_space(&self) -> u64 {
        self.fs
            .stats()
            .map(|s| s.total_clusters() as u64 * s.cluster_size() as u64)
            .unwrap_or(0)
    }
}
