//! Data storage interface for OS/8 disk images.
//!
//! A [`DataStorage`] is a flat, byte-addressable backing store. The OS/8
//! directory engine and block codecs never touch a host file directly;
//! they read and write through this trait, so the engine can be exercised
//! against an in-memory buffer in tests without a filesystem round trip.

pub use os8_err::{Error, IoError, Result};

pub trait DataStorage {
    /// Reads `buffer.len()` bytes starting at `offset`.
    ///
    /// A short read (fewer bytes available than `buffer.len()`) is an
    /// `IoError::ShortRead`, not a partial fill.
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer` at `offset`. Not buffered: each call is a direct
    /// positional write, matching the spec's "writes are not buffered"
    /// resource policy.
    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()>;

    /// Total addressable length of the backing store, in bytes.
    fn len(&self) -> Result<u64>;

    /// Extends (or truncates) the backing store to exactly `len` bytes.
    fn set_len(&self, len: u64) -> Result<()>;
}

impl<T: DataStorage + ?Sized> DataStorage for std::rc::Rc<T> {
    fn read(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        (**self).read(offset, buffer)
    }

    fn write(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        (**self).write(offset, buffer)
    }

    fn len(&self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }
}
