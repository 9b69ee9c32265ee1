//! Storage Gateway: a mutex-guarded facade over a single, non-reentrant
//! filesystem driver.
//!
//! Every session shares one [`StorageGateway`]. The gateway never exposes
//! the driver directly; every call acquires the lock, performs one driver
//! operation (or a caller-supplied batch, via [`StorageGateway::batch`]),
//! and releases it. Lock acquisition is bounded by a timeout so a stuck
//! driver call degrades to a transient error instead of wedging every
//! session (spec §4.2, §5).

use crate::error::{string, DriverErrno, Error};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

/// Directory entry as reported by the driver's enumeration cursor. An
/// empty `name` is the end-of-directory sentinel (spec §6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Filesystem metadata in driver terms, before the gateway maps it onto
/// 9P `Stat` fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub is_dir: bool,
    pub size: u64,
    /// Storage date/time, at two-second resolution (spec §9 Open
    /// Questions: "exposed, not hidden").
    pub modified: DateTime,
    pub read_only: bool,
}

/// A FAT-style timestamp: the fields a driver like `fatfs` exposes
/// directly, before conversion to a Unix epoch value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// The interface a storage backend must provide to be exported.
///
/// Object-safe so the gateway can hold `Box<dyn StorageDriver>` without
/// generic parameters leaking into the session/handler layer. All methods
/// are synchronous: the driver itself is assumed not to block noticeably
/// longer than a local disk I/O (spec §5, "handlers MUST NOT sleep inside
/// storage calls" — the gateway, not the driver, owns the only suspension
/// point, the lock acquisition).
pub trait StorageDriver: Send {
    fn is_mounted(&self) -> bool;

    fn open(&mut self, path: &str) -> Result<u64, DriverErrno>;
    fn create(&mut self, path: &str) -> Result<u64, DriverErrno>;
    fn directory_create(&mut self, path: &str) -> Result<(), DriverErrno>;
    fn close(&mut self, handle: u64) -> Result<(), DriverErrno>;

    fn read(&mut self, handle: u64, buf: &mut [u8]) -> Result<u32, DriverErrno>;
    fn write(&mut self, handle: u64, buf: &[u8]) -> Result<u32, DriverErrno>;
    fn seek(&mut self, handle: u64, offset: u64) -> Result<(), DriverErrno>;

    /// Advance the directory cursor held by `handle` one entry.
    fn directory_read(&mut self, handle: u64) -> Result<Option<DirEntry>, DriverErrno>;

    fn delete(&mut self, path: &str) -> Result<(), DriverErrno>;
    fn rename(&mut self, old: &str, new: &str) -> Result<(), DriverErrno>;

    fn size(&mut self, handle: u64) -> Result<u64, DriverErrno>;
    fn attributes(&mut self, handle: u64) -> Result<Attributes, DriverErrno>;

    fn free_space(&self) -> u64;
    fn total_space(&self) -> u64;
}

/// Mapped 9P metadata for a filesystem object, ready to drop into a
/// `Stat` record by the caller (spec §4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappedMeta {
    pub mode: u32,
    pub length: u64,
    pub mtime: u32,
    pub atime: u32,
    pub is_dir: bool,
}

pub const DIR_MODE: u32 = 0o040755;
pub const FILE_MODE_RW: u32 = 0o100644;
pub const FILE_MODE_RO: u32 = 0o100444;

/// Converts a FAT-resolution `DateTime` to seconds since the Unix epoch
/// using the proleptic Gregorian calendar and the standard leap-year
/// rule (divisible by 4, not by 100 unless also by 400). Hand-rolled
/// because nothing else in this crate's dependency stack needs a general
/// calendar library for one conversion (spec §4.2).
pub fn datetime_to_unix(dt: DateTime) -> u32 {
    const DAYS_IN_MONTH: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    fn is_leap(year: u32) -> bool {
        (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
    }

    fn days_since_epoch(year: u32, month: u32, day: u32) -> i64 {
        let mut days: i64 = 0;
        if year >= 1970 {
            for y in 1970..year {
                days += if is_leap(y) { 366 } else { 365 };
            }
        } else {
            for y in year..1970 {
                days -= if is_leap(y) { 366 } else { 365 };
            }
        }
        for m in 0..(month - 1) as usize {
            days += DAYS_IN_MONTH[m] as i64;
            if m == 1 && is_leap(year) {
                days += 1;
            }
        }
        days + (day as i64 - 1)
    }

    let days = days_since_epoch(dt.year as u32, dt.month as u32, dt.day as u32);
    let secs = days * 86_400
        + dt.hour as i64 * 3600
        + dt.minute as i64 * 60
        + dt.second as i64;
    secs.max(0) as u32
}

pub fn map_attributes(attrs: Attributes) -> MappedMeta {
    let mtime = datetime_to_unix(attrs.modified);
    MappedMeta {
        mode: if attrs.is_dir {
            DIR_MODE
        } else if attrs.read_only {
            FILE_MODE_RO
        } else {
            FILE_MODE_RW
        },
        length: attrs.size,
        mtime,
        // storage granularity does not distinguish atime from mtime (spec §4.2)
        atime: mtime,
        is_dir: attrs.is_dir,
    }
}

fn translate(err: DriverErrno) -> Error {
    Error::from(err)
}

/// Stat a path against an already-locked driver, without leaving a handle
/// open. Shared by [`StorageGateway::stat_path`] and by callers (e.g. a
/// multi-component walk) that need several such lookups to observe one
/// consistent driver state via [`StorageGateway::batch`] (spec §4.2).
pub(crate) fn stat_locked(driver: &mut dyn StorageDriver, path: &str) -> Result<MappedMeta, DriverErrno> {
    let handle = driver.open(path)?;
    let attrs = driver.attributes(handle);
    let _ = driver.close(handle);
    Ok(map_attributes(attrs?))
}

/// The mutex-guarded facade itself. Cloning is cheap (an `Arc` inside),
/// so every session holds its own handle to the same underlying driver.
#[derive(Clone)]
pub struct StorageGateway {
    inner: std::sync::Arc<Mutex<Box<dyn StorageDriver>>>,
    lock_timeout: Duration,
}

impl StorageGateway {
    pub fn new(driver: Box<dyn StorageDriver>, lock_timeout: Duration) -> Self {
        StorageGateway {
            inner: std::sync::Arc::new(Mutex::new(driver)),
            lock_timeout,
        }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Box<dyn StorageDriver>>, Error> {
        tokio::time::timeout(self.lock_timeout, self.inner.lock())
            .await
            .map_err(|_| Error::proto(string::STORAGE_BUSY))
    }

    /// Run a batch of operations under a single lock acquisition, for
    /// composite operations (e.g. a multi-component walk) that need a
    /// consistent view across several driver calls (spec §4.2).
    pub async fn batch<F, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut dyn StorageDriver) -> Result<T, DriverErrno>,
    {
        let mut guard = self.lock().await?;
        f(&mut **guard).map_err(translate)
    }

    pub async fn is_mounted(&self) -> Result<bool, Error> {
        let guard = self.lock().await?;
        Ok(guard.is_mounted())
    }

    pub async fn open(&self, path: &str) -> Result<u64, Error> {
        self.batch(|d| d.open(path)).await
    }

    pub async fn create(&self, path: &str) -> Result<u64, Error> {
        self.batch(|d| d.create(path)).await
    }

    pub async fn directory_create(&self, path: &str) -> Result<(), Error> {
        self.batch(|d| d.directory_create(path)).await
    }

    pub async fn close(&self, handle: u64) -> Result<(), Error> {
        self.batch(|d| d.close(handle)).await
    }

    pub async fn read(&self, handle: u64, buf: &mut [u8]) -> Result<u32, Error> {
        let mut guard = self.lock().await?;
        guard.read(handle, buf).map_err(translate)
    }

    pub async fn write(&self, handle: u64, buf: &[u8]) -> Result<u32, Error> {
        let mut guard = self.lock().await?;
        guard.write(handle, buf).map_err(translate)
    }

    pub async fn seek(&self, handle: u64, offset: u64) -> Result<(), Error> {
        self.batch(move |d| d.seek(handle, offset)).await
    }

    pub async fn directory_read(&self, handle: u64) -> Result<Option<DirEntry>, Error> {
        self.batch(move |d| d.directory_read(handle)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        self.batch(|d| d.delete(path)).await
    }

    pub async fn rename(&self, old: &str, new: &str) -> Result<(), Error> {
        self.batch(|d| d.rename(old, new)).await
    }

    pub async fn metadata(&self, handle: u64) -> Result<MappedMeta, Error> {
        let mut guard = self.lock().await?;
        let attrs = guard.attributes(handle).map_err(translate)?;
        Ok(map_attributes(attrs))
    }

    /// Stat a path without leaving a handle open, for Tstat lookups that
    /// need metadata but not a persistent open (spec §4.2).
    pub async fn stat_path(&self, path: &str) -> Result<MappedMeta, Error> {
        self.batch(|d| stat_locked(d, path)).await
    }

    pub async fn space(&self) -> Result<(u64, u64), Error> {
        let guard = self.lock().await?;
        Ok((guard.free_space(), guard.total_space()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn epoch_start_maps_to_zero() {
        let dt = DateTime {
            year: 1970,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert_eq!(datetime_to_unix(dt), 0);
    }

    #[test]
    fn leap_year_day_is_counted() {
        // 2020-03-01 00:00:00 must include the Feb 29 of 2020.
        let before_leap_day = DateTime {
            year: 2020,
            month: 2,
            day: 29,
            hour: 0,
            minute: 0,
            second: 0,
        };
        let after_leap_day = DateTime {
            year: 2020,
            month: 3,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert_eq!(
            datetime_to_unix(after_leap_day) - datetime_to_unix(before_leap_day),
            86_400
        );
    }

    #[test]
    fn century_non_leap_rule_applies() {
        // 1900 is not a leap year (divisible by 100, not by 400).
        let feb28_1900 = DateTime {
            year: 1900,
            month: 2,
            day: 28,
            hour: 0,
            minute: 0,
            second: 0,
        };
        let mar1_1900 = DateTime {
            year: 1900,
            month: 3,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        };
        assert_eq!(datetime_to_unix(mar1_1900) - datetime_to_unix(feb28_1900), 86_400);
    }

    #[test]
    fn directory_maps_to_dir_mode() {
        let attrs = Attributes {
            is_dir: true,
            size: 0,
            modified: DateTime {
                year: 2024,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            },
            read_only: false,
        };
        let mapped = map_attributes(attrs);
        assert_eq!(mapped.mode, DIR_MODE);
        assert_eq!(mapped.atime, mapped.mtime);
    }

    #[test]
    fn read_only_file_maps_to_ro_mode() {
        let attrs = Attributes {
            is_dir: false,
            size: 5,
            modified: DateTime {
                year: 2024,
                month: 1,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            },
            read_only: true,
        };
        assert_eq!(map_attributes(attrs).mode, FILE_MODE_RO);
    }

    struct FakeDriver {
        files: HashMap<u64, Vec<u8>>,
        next_handle: u64,
    }

    impl StorageDriver for FakeDriver {
        fn is_mounted(&self) -> bool {
            true
        }
        fn open(&mut self, _path: &str) -> Result<u64, DriverErrno> {
            Err(DriverErrno::NotFound)
        }
        fn create(&mut self, _path: &str) -> Result<u64, DriverErrno> {
            let h = self.next_handle;
            self.next_handle += 1;
            self.files.insert(h, Vec::new());
            Ok(h)
        }
        fn directory_create(&mut self, _path: &str) -> Result<(), DriverErrno> {
            Ok(())
        }
        fn close(&mut self, _handle: u64) -> Result<(), DriverErrno> {
            Ok(())
        }
        fn read(&mut self, _handle: u64, _buf: &mut [u8]) -> Result<u32, DriverErrno> {
            Ok(0)
        }
        fn write(&mut self, handle: u64, buf: &[u8]) -> Result<u32, DriverErrno> {
            let f = self.files.get_mut(&handle).ok_or(DriverErrno::NotFound)?;
            f.extend_from_slice(buf);
            Ok(buf.len() as u32)
        }
        fn seek(&mut self, _handle: u64, _offset: u64) -> Result<(), DriverErrno> {
            Ok(())
        }
        fn directory_read(&mut self, _handle: u64) -> Result<Option<DirEntry>, DriverErrno> {
            Ok(None)
        }
        fn delete(&mut self, _path: &str) -> Result<(), DriverErrno> {
            Ok(())
        }
        fn rename(&mut self, _old: &str, _new: &str) -> Result<(), DriverErrno> {
            Ok(())
        }
        fn size(&mut self, handle: u64) -> Result<u64, DriverErrno> {
            Ok(self.files.get(&handle).map_or(0, |f| f.len() as u64))
        }
        fn attributes(&mut self, _handle: u64) -> Result<Attributes, DriverErrno> {
            Err(DriverErrno::NotFound)
        }
        fn free_space(&self) -> u64 {
            1024
        }
        fn total_space(&self) -> u64 {
            2048
        }
    }

    #[tokio::test]
    async fn not_found_translates_to_wire_string() {
        let gw = StorageGateway::new(
            Box::new(FakeDriver {
                files: HashMap::new(),
                next_handle: 1,
            }),
            Duration::from_secs(5),
        );
        let err = gw.open("/missing").await.unwrap_err();
        assert_eq!(err.as_reply_string(), string::FILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn create_then_write_round_trips_through_the_lock() {
        let gw = StorageGateway::new(
            Box::new(FakeDriver {
                files: HashMap::new(),
                next_handle: 1,
            }),
            Duration::from_secs(5),
        );
        let handle = gw.create("/new.txt").await.unwrap();
        let n = gw.write(handle, b"hello").await.unwrap();
        assert_eq!(n, 5);
    }
}
