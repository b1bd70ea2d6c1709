use std::{
    fs::{File, OpenOptions},
    os::unix::{
        fs::FileExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
};

use log::{debug, warn};
use os8_ds::DataStorage;
use os8_err::{Error, IoError, Result};

/// A [`DataStorage`] backed by a host file, opened under a non-blocking
/// advisory exclusive lock for the lifetime of the value.
///
/// The lock is taken at [`DataStorageServer::open`] and released when the
/// value is dropped, including on panic unwind, so the image is never left
/// locked by a process that exited abnormally.
pub struct DataStorageServer {
    file: File,
}

impl DataStorageServer {
    /// Opens `path` for read/write and takes a non-blocking advisory
    /// exclusive lock. Fails with [`IoError::LockContention`] if another
    /// process already holds the lock, rather than blocking.
    pub fn open(path: &Path, create: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;
        lock_exclusive(file.as_raw_fd())?;
        debug!("opened and locked {}", path.display());
        Ok(Self { file })
    }
}

impl Drop for DataStorageServer {
    fn drop(&mut self) {
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } != 0 {
            warn!("failed to release advisory lock on drop");
        }
    }
}

fn lock_exclusive(fd: RawFd) -> Result<()> {
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Error::Io(IoError::LockContention)
        } else {
            Error::from(err)
        });
    }
    Ok(())
}

impl DataStorage for DataStorageServer {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buffer, offset).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Io(IoError::ShortRead {
                    block_no: (offset / buffer.len().max(1) as u64) as u32,
                    wanted: buffer.len(),
                    got: 0,
                })
            } else {
                Error::from(err)
            }
        })
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file.write_all_at(buffer, offset).map_err(Error::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(Error::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.dsk");
        let ds = DataStorageServer::open(&path, true).unwrap();
        ds.set_len(4096).unwrap();
        ds.write(512, b"hello os8").unwrap();

        let mut buf = [0u8; 9];
        ds.read(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello os8");
    }

    #[test]
    fn second_open_is_rejected_while_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.dsk");
        let _held = DataStorageServer::open(&path, true).unwrap();

        let err = DataStorageServer::open(&path, false).unwrap_err();
        assert!(matches!(err, Error::Io(IoError::LockContention)));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.dsk");
        {
            let _held = DataStorageServer::open(&path, true).unwrap();
        }
        DataStorageServer::open(&path, false).unwrap();
    }

    #[test]
    fn short_read_past_end_of_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.dsk");
        let ds = DataStorageServer::open(&path, true).unwrap();
        ds.set_len(4).unwrap();

        let mut buf = [0u8; 16];
        assert!(matches!(
            ds.read(0, &mut buf),
            Err(Error::Io(IoError::ShortRead { .. }))
        ));
    }
}
